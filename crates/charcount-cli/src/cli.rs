//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand};

use charcount_core::player::DEFAULT_ARMOR_CLASS;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Print games and players as JSON lines
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Host a game and list players as they join
    Host {
        /// Name of the game to advertise
        #[arg(short, long)]
        name: String,
    },
    /// List games advertised nearby
    Browse {
        /// Seconds to scan before exiting
        #[arg(short, long, default_value_t = 10)]
        duration: u64,
    },
    /// Join a nearby game by name
    Join {
        /// Name of the game to join
        #[arg(short, long)]
        game: String,
        /// Your character's name
        #[arg(short, long)]
        name: String,
        #[arg(long, default_value_t = DEFAULT_ARMOR_CLASS)]
        armor_class: u16,
        #[arg(long, default_value_t = 0)]
        spell_save_dc: u16,
        #[arg(long, default_value_t = 0)]
        passive_perception: u16,
        /// Seconds to wait for the game to appear
        #[arg(short, long, default_value_t = 30)]
        timeout: u64,
    },
}
