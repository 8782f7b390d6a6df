//! CharCount command-line host and player
//!
//! Library half of the `charcount` binary, split out so the argument parser
//! and configuration loader can be tested.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
