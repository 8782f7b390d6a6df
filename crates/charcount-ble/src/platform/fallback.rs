//! Fallback peripheral manager for platforms without a GATT server backend

use async_trait::async_trait;
use tracing::warn;

use crate::driver::PeripheralManagerDriver;
use crate::error::{BleResult, BleSessionError};
use crate::events::{EventSender, PeripheralManagerEvent, RadioState};
use crate::protocol::{Advertisement, ServiceDescriptor};

// ----------------------------------------------------------------------------
// Fallback Implementation
// ----------------------------------------------------------------------------

/// Reports the radio as unsupported and refuses to host
pub struct FallbackPeripheralManager {
    events: EventSender<PeripheralManagerEvent>,
}

impl FallbackPeripheralManager {
    pub fn new(events: EventSender<PeripheralManagerEvent>) -> Self {
        warn!(
            "Hosting games is not supported on this platform. \
            Use Linux with BlueZ to advertise a game."
        );
        events.emit(PeripheralManagerEvent::StateChanged(RadioState::Unsupported));
        Self { events }
    }
}

#[async_trait]
impl PeripheralManagerDriver for FallbackPeripheralManager {
    async fn add_service(&mut self, service: &ServiceDescriptor) -> BleResult<()> {
        self.events.emit(PeripheralManagerEvent::AddedService {
            service: service.uuid,
            error: Some("GATT server unsupported".to_string()),
        });
        Err(BleSessionError::AdapterNotAvailable)
    }

    async fn remove_all_services(&mut self) -> BleResult<()> {
        Ok(())
    }

    async fn start_advertising(&mut self, _advertisement: &Advertisement) -> BleResult<()> {
        Err(BleSessionError::AdapterNotAvailable)
    }

    async fn stop_advertising(&mut self) -> BleResult<()> {
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        false
    }
}
