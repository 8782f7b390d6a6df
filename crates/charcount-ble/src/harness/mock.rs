//! Call-recording drivers for unit tests
//!
//! Both mocks answer every call at once and emit no events; tests feed the
//! state machines the platform events they want to exercise.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use charcount_core::DEFAULT_MAX_PAYLOAD_LEN;
use uuid::Uuid;

use crate::driver::{CentralDriver, PeripheralManagerDriver};
use crate::error::{BleResult, BleSessionError};
use crate::events::PeripheralHandle;
use crate::protocol::{Advertisement, ServiceDescriptor, WriteType};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Mock Central
// ----------------------------------------------------------------------------

/// A downward call a scanner made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralCall {
    Scan(Uuid),
    StopScan,
    Connect(PeripheralHandle),
    Disconnect(PeripheralHandle),
    DiscoverServices(PeripheralHandle, Vec<Uuid>),
    DiscoverCharacteristics(PeripheralHandle, Uuid, Vec<Uuid>),
    ReadValue(PeripheralHandle, Uuid),
    WriteValue(PeripheralHandle, Uuid, Vec<u8>, WriteType),
}

#[derive(Debug)]
struct MockCentralState {
    calls: Vec<CentralCall>,
    write_ready: bool,
    max_write_len: usize,
    fail_connects: bool,
}

/// Call-recording central; clones share the same record
#[derive(Debug, Clone)]
pub struct MockCentral {
    state: Arc<Mutex<MockCentralState>>,
}

impl MockCentral {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockCentralState {
                calls: Vec::new(),
                write_ready: true,
                max_write_len: DEFAULT_MAX_PAYLOAD_LEN,
                fail_connects: false,
            })),
        }
    }

    pub fn calls(&self) -> Vec<CentralCall> {
        lock(&self.state).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn connects(&self) -> Vec<PeripheralHandle> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CentralCall::Connect(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn writes(&self) -> Vec<(PeripheralHandle, Uuid, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CentralCall::WriteValue(p, c, value, _) => Some((p, c, value)),
                _ => None,
            })
            .collect()
    }

    /// Simulate the link's write-without-response flow control
    pub fn set_write_ready(&self, ready: bool) {
        lock(&self.state).write_ready = ready;
    }

    pub fn set_maximum_write_length(&self, len: usize) {
        lock(&self.state).max_write_len = len;
    }

    /// Make every `connect` call fail synchronously
    pub fn fail_connects(&self, fail: bool) {
        lock(&self.state).fail_connects = fail;
    }

    fn record(&self, call: CentralCall) {
        lock(&self.state).calls.push(call);
    }
}

impl Default for MockCentral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CentralDriver for MockCentral {
    async fn scan(&mut self, service: Uuid) -> BleResult<()> {
        self.record(CentralCall::Scan(service));
        Ok(())
    }

    async fn stop_scan(&mut self) -> BleResult<()> {
        self.record(CentralCall::StopScan);
        Ok(())
    }

    async fn connect(&mut self, peripheral: PeripheralHandle) -> BleResult<()> {
        self.record(CentralCall::Connect(peripheral));
        if lock(&self.state).fail_connects {
            return Err(BleSessionError::Driver(format!(
                "connect to {} refused",
                peripheral
            )));
        }
        Ok(())
    }

    async fn disconnect(&mut self, peripheral: PeripheralHandle) -> BleResult<()> {
        self.record(CentralCall::Disconnect(peripheral));
        Ok(())
    }

    async fn discover_services(
        &mut self,
        peripheral: PeripheralHandle,
        services: &[Uuid],
    ) -> BleResult<()> {
        self.record(CentralCall::DiscoverServices(peripheral, services.to_vec()));
        Ok(())
    }

    async fn discover_characteristics(
        &mut self,
        peripheral: PeripheralHandle,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> BleResult<()> {
        self.record(CentralCall::DiscoverCharacteristics(
            peripheral,
            service,
            characteristics.to_vec(),
        ));
        Ok(())
    }

    async fn read_value(
        &mut self,
        peripheral: PeripheralHandle,
        characteristic: Uuid,
    ) -> BleResult<()> {
        self.record(CentralCall::ReadValue(peripheral, characteristic));
        Ok(())
    }

    async fn write_value(
        &mut self,
        peripheral: PeripheralHandle,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> BleResult<()> {
        self.record(CentralCall::WriteValue(
            peripheral,
            characteristic,
            value.to_vec(),
            write_type,
        ));
        Ok(())
    }

    fn can_send_write_without_response(&self, _peripheral: PeripheralHandle) -> bool {
        lock(&self.state).write_ready
    }

    fn maximum_write_length(&self, _peripheral: PeripheralHandle, _write_type: WriteType) -> usize {
        lock(&self.state).max_write_len
    }
}

// ----------------------------------------------------------------------------
// Mock Peripheral Manager
// ----------------------------------------------------------------------------

/// A downward call an advertiser made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCall {
    AddService(ServiceDescriptor),
    RemoveAllServices,
    StartAdvertising(Advertisement),
    StopAdvertising,
}

#[derive(Debug, Default)]
struct MockPeripheralState {
    calls: Vec<PeripheralCall>,
    services: Vec<ServiceDescriptor>,
    advertising: Option<Advertisement>,
    fail_add_service: bool,
}

/// Call-recording peripheral manager that tracks the resulting GATT table
#[derive(Debug, Clone, Default)]
pub struct MockPeripheralManager {
    state: Arc<Mutex<MockPeripheralState>>,
}

impl MockPeripheralManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<PeripheralCall> {
        lock(&self.state).calls.clone()
    }

    /// Services currently registered
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        lock(&self.state).services.clone()
    }

    /// Number of advertisements on air; the platform keeps at most one
    pub fn active_advertisements(&self) -> usize {
        usize::from(lock(&self.state).advertising.is_some())
    }

    /// Make `add_service` fail until reset
    pub fn fail_add_service(&self, fail: bool) {
        lock(&self.state).fail_add_service = fail;
    }
}

#[async_trait]
impl PeripheralManagerDriver for MockPeripheralManager {
    async fn add_service(&mut self, service: &ServiceDescriptor) -> BleResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(PeripheralCall::AddService(service.clone()));
        if state.fail_add_service {
            return Err(BleSessionError::Driver("add service refused".to_string()));
        }
        state.services.push(service.clone());
        Ok(())
    }

    async fn remove_all_services(&mut self) -> BleResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(PeripheralCall::RemoveAllServices);
        state.services.clear();
        Ok(())
    }

    async fn start_advertising(&mut self, advertisement: &Advertisement) -> BleResult<()> {
        let mut state = lock(&self.state);
        state
            .calls
            .push(PeripheralCall::StartAdvertising(advertisement.clone()));
        state.advertising = Some(advertisement.clone());
        Ok(())
    }

    async fn stop_advertising(&mut self) -> BleResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(PeripheralCall::StopAdvertising);
        state.advertising = None;
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        lock(&self.state).advertising.is_some()
    }
}
