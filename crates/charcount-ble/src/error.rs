//! Error types for the BLE session protocol

use charcount_core::{CharcountError, CodecError};
use thiserror::Error;
use uuid::Uuid;

use crate::events::Role;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors raised by the advertiser, the scanner, and their drivers
#[derive(Error, Debug)]
pub enum BleSessionError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("BLE driver error: {0}")]
    Driver(String),

    #[error("Role has not been initialized")]
    NotInitialized,

    #[error("Unknown game: {game_id}")]
    UnknownGame { game_id: Uuid },

    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("Event bus already has a subscriber")]
    AlreadySubscribed,

    #[error("Event bus closed")]
    EventBusClosed,

    #[error("{0} role is not attached")]
    RoleNotAttached(Role),

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl From<BleSessionError> for CharcountError {
    fn from(err: BleSessionError) -> Self {
        match err {
            BleSessionError::Codec(codec) => CharcountError::Codec(codec),
            other => CharcountError::Transport {
                reason: other.to_string(),
            },
        }
    }
}

/// Result alias for BLE session operations
pub type BleResult<T> = Result<T, BleSessionError>;
