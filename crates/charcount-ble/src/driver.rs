//! Downward calls the state machines make into a platform BLE stack
//!
//! Every call is a request: its outcome arrives later as an event on the
//! role's bus (see [`crate::events`]). Implementations must not block on
//! the radio; they start the operation and return.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BleResult;
use crate::events::PeripheralHandle;
use crate::protocol::{Advertisement, ServiceDescriptor, WriteType};

// ----------------------------------------------------------------------------
// Central Role
// ----------------------------------------------------------------------------

/// Central manager and GATT client operations
#[async_trait]
pub trait CentralDriver: Send {
    /// Scan for peripherals advertising `service`
    async fn scan(&mut self, service: Uuid) -> BleResult<()>;

    async fn stop_scan(&mut self) -> BleResult<()>;

    async fn connect(&mut self, peripheral: PeripheralHandle) -> BleResult<()>;

    async fn disconnect(&mut self, peripheral: PeripheralHandle) -> BleResult<()>;

    async fn discover_services(
        &mut self,
        peripheral: PeripheralHandle,
        services: &[Uuid],
    ) -> BleResult<()>;

    async fn discover_characteristics(
        &mut self,
        peripheral: PeripheralHandle,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> BleResult<()>;

    async fn read_value(&mut self, peripheral: PeripheralHandle, characteristic: Uuid)
        -> BleResult<()>;

    async fn write_value(
        &mut self,
        peripheral: PeripheralHandle,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> BleResult<()>;

    /// Whether the link can take a write without response right now
    fn can_send_write_without_response(&self, peripheral: PeripheralHandle) -> bool;

    /// Largest value a single write of `write_type` may carry
    fn maximum_write_length(&self, peripheral: PeripheralHandle, write_type: WriteType) -> usize;
}

// ----------------------------------------------------------------------------
// Peripheral Role
// ----------------------------------------------------------------------------

/// Local GATT server and advertiser operations
#[async_trait]
pub trait PeripheralManagerDriver: Send {
    async fn add_service(&mut self, service: &ServiceDescriptor) -> BleResult<()>;

    async fn remove_all_services(&mut self) -> BleResult<()>;

    async fn start_advertising(&mut self, advertisement: &Advertisement) -> BleResult<()>;

    async fn stop_advertising(&mut self) -> BleResult<()>;

    fn is_advertising(&self) -> bool;
}
