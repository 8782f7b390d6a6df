//! Core value objects for CharCount game sessions
//!
//! This crate holds the data exchanged between a hosting device and the
//! players joining it:
//!
//! - [`GameInfo`] - the game a host publishes for discovery
//! - [`PlayerInfo`] - the character summary a player pushes when joining
//! - [`WireCodec`] - the compact byte encoding used on GATT characteristics
//! - [`IdGenerator`] - explicit source of identifiers for new games and players
//!
//! ## Usage
//!
//! ```rust
//! use charcount_core::{GameInfo, RandomIds, WireCodec};
//!
//! # fn example() -> charcount_core::Result<()> {
//! let codec = WireCodec::default();
//! let game = GameInfo::new("Greywall", &RandomIds);
//!
//! let bytes = codec.encode_game(&game)?;
//! let decoded = codec.decode_game(&bytes)?;
//! assert_eq!(decoded, game);
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod game;
pub mod ids;
pub mod player;
pub mod wire;

pub use errors::{CharcountError, CodecError, Result};
pub use game::GameInfo;
pub use ids::{IdGenerator, RandomIds, SequentialIds};
pub use player::PlayerInfo;
pub use wire::{PayloadKind, WireCodec, DEFAULT_MAX_PAYLOAD_LEN, WIRE_VERSION};
