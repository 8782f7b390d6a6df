//! Bluetooth Low Energy game discovery and join protocol for CharCount
//!
//! A host advertises one GATT service carrying its encoded game info; nearby
//! players scan for that service, read the game info, and join by writing
//! their encoded player info back.
//!
//! ## Architecture
//!
//! - [`events`] - typed event buses between platform drivers and state machines
//! - [`driver`] - downward calls the state machines make into a BLE stack
//! - [`advertiser`] - host role: publish a game, accept player writes
//! - [`scanner`] - player role: discover games, connect, read, join
//! - [`coordinator`] - application facade over both roles
//! - [`platform`] - btleplug central and BlueZ peripheral drivers
//! - [`protocol`] - service and characteristic identifiers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use charcount_ble::{
//!     BleSessionConfig, BtleplugCentral, EventBus, SessionCoordinator, SessionEvent,
//! };
//! use charcount_core::{PlayerInfo, RandomIds};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut coordinator = SessionCoordinator::new(BleSessionConfig::new(), Arc::new(RandomIds));
//!
//! let mut central_bus = EventBus::new();
//! let mut gatt_bus = EventBus::new();
//! let driver = BtleplugCentral::new(central_bus.sender(), gatt_bus.sender()).await?;
//! coordinator.attach_scanner(driver, central_bus.subscribe()?, gatt_bus.subscribe()?);
//! coordinator.request_permission()?;
//!
//! while let Some(event) = coordinator.next_event().await {
//!     if let SessionEvent::DiscoveredGame { game, .. } = event {
//!         coordinator.join(game.id, PlayerInfo::new("Bekri", &RandomIds))?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: scanning via btleplug, hosting via `bluer` with BlueZ
//! - **Other platforms**: scanning only

pub mod advertiser;
pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod events;
pub mod platform;
pub mod protocol;
pub mod scanner;

#[cfg(any(test, feature = "testing"))]
pub mod harness;

pub use advertiser::{AdvertiseState, Advertiser, AdvertiserCommand};
pub use config::{BleSessionConfig, DedupPolicy};
pub use coordinator::SessionCoordinator;
pub use driver::{CentralDriver, PeripheralManagerDriver};
pub use error::{BleResult, BleSessionError};
pub use events::{
    event_channel, CentralEvent, ConnectionEventKind, EventBus, EventSender, PeripheralEvent,
    PeripheralHandle, PeripheralManagerEvent, RadioState, Role, SessionEvent, SessionStatus,
    Subscription, WriteRequest,
};
pub use platform::{BtleplugCentral, PlatformPeripheralManager};
pub use protocol::{
    Advertisement, ServiceDescriptor, WriteType, GAME_INFO_CHARACTERISTIC_UUID,
    GAME_SERVICE_UUID, PLAYER_INFO_CHARACTERISTIC_UUID,
};
pub use scanner::{ScannerCommand, Scanner, SessionState};
