//! Platform drivers and platform detection
//!
//! The central role runs on btleplug everywhere it is supported. Hosting a
//! game needs a local GATT server, which only the BlueZ backend offers; other
//! platforms get a fallback that reports the radio as unsupported.

mod central;
pub mod fallback;
#[cfg(target_os = "linux")]
pub mod linux;

pub use central::BtleplugCentral;

use async_trait::async_trait;
#[cfg(target_os = "linux")]
use tracing::warn;

use crate::driver::PeripheralManagerDriver;
use crate::error::BleResult;
use crate::events::{EventSender, PeripheralManagerEvent};
use crate::protocol::{Advertisement, ServiceDescriptor};

// ----------------------------------------------------------------------------
// Platform Detection and Factory
// ----------------------------------------------------------------------------

/// Peripheral manager for the current platform
///
/// On Linux the fallback is used when BlueZ cannot be reached.
pub enum PlatformPeripheralManager {
    #[cfg(target_os = "linux")]
    Linux(linux::BluerPeripheralManager),
    Fallback(fallback::FallbackPeripheralManager),
}

impl PlatformPeripheralManager {
    /// Open the platform's local GATT server, reporting on `events`
    pub async fn new(events: EventSender<PeripheralManagerEvent>) -> BleResult<Self> {
        #[cfg(target_os = "linux")]
        {
            match linux::BluerPeripheralManager::new(events.clone()).await {
                Ok(manager) => Ok(Self::Linux(manager)),
                Err(e) => {
                    warn!("BlueZ GATT server unavailable: {}", e);
                    Ok(Self::Fallback(fallback::FallbackPeripheralManager::new(
                        events,
                    )))
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            Ok(Self::Fallback(fallback::FallbackPeripheralManager::new(
                events,
            )))
        }
    }
}

#[async_trait]
impl PeripheralManagerDriver for PlatformPeripheralManager {
    async fn add_service(&mut self, service: &ServiceDescriptor) -> BleResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref mut manager) => manager.add_service(service).await,
            Self::Fallback(ref mut manager) => manager.add_service(service).await,
        }
    }

    async fn remove_all_services(&mut self) -> BleResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref mut manager) => manager.remove_all_services().await,
            Self::Fallback(ref mut manager) => manager.remove_all_services().await,
        }
    }

    async fn start_advertising(&mut self, advertisement: &Advertisement) -> BleResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref mut manager) => manager.start_advertising(advertisement).await,
            Self::Fallback(ref mut manager) => manager.start_advertising(advertisement).await,
        }
    }

    async fn stop_advertising(&mut self) -> BleResult<()> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref mut manager) => manager.stop_advertising().await,
            Self::Fallback(ref mut manager) => manager.stop_advertising().await,
        }
    }

    fn is_advertising(&self) -> bool {
        match self {
            #[cfg(target_os = "linux")]
            Self::Linux(ref manager) => manager.is_advertising(),
            Self::Fallback(ref manager) => manager.is_advertising(),
        }
    }
}
