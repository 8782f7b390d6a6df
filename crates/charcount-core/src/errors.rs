//! Error types for CharCount sessions
//!
//! [`CodecError`] covers everything that can go wrong turning bytes into
//! value objects and back. [`CharcountError`] is the umbrella type the other
//! crates convert their own errors into.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures while encoding or decoding a wire payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Payload truncated: {len} bytes is shorter than the {min} byte header")]
    Truncated { len: usize, min: usize },

    #[error("Unsupported wire version {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },

    #[error("Unexpected payload kind 0x{found:02x} (expected 0x{expected:02x})")]
    UnexpectedKind { found: u8, expected: u8 },

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::SizeLimit => CodecError::Malformed("size limit exceeded".into()),
            other => CodecError::Malformed(other.to_string()),
        }
    }
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Unified error type for CharCount
#[derive(Debug, Error)]
pub enum CharcountError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

/// Result alias used throughout CharCount
pub type Result<T> = core::result::Result<T, CharcountError>;
