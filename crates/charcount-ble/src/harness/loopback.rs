//! In-memory radio for end-to-end tests
//!
//! Hosts and a central attached to the same [`LoopbackRadio`] see each other
//! the way devices in range would: advertising hosts are announced to a
//! scanning central, and GATT calls reach the host's service table.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use charcount_core::DEFAULT_MAX_PAYLOAD_LEN;
use tracing::trace;
use uuid::Uuid;

use crate::driver::{CentralDriver, PeripheralManagerDriver};
use crate::error::{BleResult, BleSessionError};
use crate::events::{
    CentralEvent, EventSender, PeripheralEvent, PeripheralHandle, PeripheralManagerEvent,
    RadioState, WriteRequest,
};
use crate::protocol::{Advertisement, ServiceDescriptor, WriteType};

// ----------------------------------------------------------------------------
// Shared Air
// ----------------------------------------------------------------------------

struct Host {
    events: EventSender<PeripheralManagerEvent>,
    services: Vec<ServiceDescriptor>,
    advertising: Option<Advertisement>,
    connected: bool,
}

struct Central {
    events: EventSender<CentralEvent>,
    gatt_events: EventSender<PeripheralEvent>,
    scan_filter: Option<Uuid>,
}

#[derive(Default)]
struct Air {
    hosts: Vec<Host>,
    central: Option<Central>,
    radio: Option<RadioState>,
}

impl Air {
    fn host_mut(&mut self, peripheral: PeripheralHandle) -> BleResult<&mut Host> {
        usize::try_from(peripheral.raw())
            .ok()
            .and_then(|index| self.hosts.get_mut(index))
            .ok_or_else(|| BleSessionError::UnknownPeripheral(peripheral.to_string()))
    }

    fn announce(&self, index: usize) {
        let (Some(central), Some(host)) = (&self.central, self.hosts.get(index)) else {
            return;
        };
        let (Some(filter), Some(ad)) = (central.scan_filter, &host.advertising) else {
            return;
        };
        if ad.advertises(filter) {
            central.events.emit(CentralEvent::DiscoveredPeripheral {
                peripheral: PeripheralHandle::new(index as u64),
            });
        }
    }
}

/// In-memory radio shared by one central and any number of hosts
#[derive(Clone, Default)]
pub struct LoopbackRadio {
    air: Arc<Mutex<Air>>,
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::default()
    }

    fn air(&self) -> MutexGuard<'_, Air> {
        self.air.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach the central; it sees every host on this radio
    pub fn central(
        &self,
        events: EventSender<CentralEvent>,
        gatt_events: EventSender<PeripheralEvent>,
    ) -> LoopbackCentral {
        let mut air = self.air();
        if let Some(state) = air.radio {
            events.emit(CentralEvent::StateChanged(state));
        }
        air.central = Some(Central {
            events,
            gatt_events,
            scan_filter: None,
        });
        LoopbackCentral { radio: self.clone() }
    }

    /// Attach a hosting device; its handle on the central side is its index
    pub fn host(&self, events: EventSender<PeripheralManagerEvent>) -> LoopbackPeripheralManager {
        let mut air = self.air();
        if let Some(state) = air.radio {
            events.emit(PeripheralManagerEvent::StateChanged(state));
        }
        air.hosts.push(Host {
            events,
            services: Vec::new(),
            advertising: None,
            connected: false,
        });
        LoopbackPeripheralManager {
            radio: self.clone(),
            index: air.hosts.len() - 1,
        }
    }

    /// Announce every advertising host to a scanning central again
    pub fn rebroadcast(&self) {
        let air = self.air();
        for index in 0..air.hosts.len() {
            air.announce(index);
        }
    }

    pub fn power_on(&self) {
        self.set_state(RadioState::PoweredOn);
    }

    pub fn power_off(&self) {
        self.set_state(RadioState::PoweredOff);
    }

    /// Report `state` to every attached device
    pub fn set_state(&self, state: RadioState) {
        let mut air = self.air();
        air.radio = Some(state);
        if !state.is_powered_on() {
            for host in air.hosts.iter_mut() {
                host.services.clear();
                host.advertising = None;
                host.connected = false;
            }
        }
        if let Some(central) = &air.central {
            central.events.emit(CentralEvent::StateChanged(state));
        }
        for host in &air.hosts {
            host.events.emit(PeripheralManagerEvent::StateChanged(state));
        }
    }
}

// ----------------------------------------------------------------------------
// Loopback Central
// ----------------------------------------------------------------------------

/// Central driver backed by a [`LoopbackRadio`]
pub struct LoopbackCentral {
    radio: LoopbackRadio,
}

impl LoopbackCentral {
    fn with_central<T>(
        &self,
        f: impl FnOnce(&mut Air, &Central) -> BleResult<T>,
    ) -> BleResult<T> {
        let mut air = self.radio.air();
        let central = air.central.take().ok_or(BleSessionError::AdapterNotAvailable)?;
        let result = f(&mut air, &central);
        air.central = Some(central);
        result
    }
}

#[async_trait]
impl CentralDriver for LoopbackCentral {
    async fn scan(&mut self, service: Uuid) -> BleResult<()> {
        let mut air = self.radio.air();
        if let Some(central) = air.central.as_mut() {
            central.scan_filter = Some(service);
        }
        for index in 0..air.hosts.len() {
            air.announce(index);
        }
        Ok(())
    }

    async fn stop_scan(&mut self) -> BleResult<()> {
        if let Some(central) = self.radio.air().central.as_mut() {
            central.scan_filter = None;
        }
        Ok(())
    }

    async fn connect(&mut self, peripheral: PeripheralHandle) -> BleResult<()> {
        self.with_central(|air, central| {
            let host = air.host_mut(peripheral)?;
            if host.advertising.is_some() || !host.services.is_empty() {
                host.connected = true;
                central.events.emit(CentralEvent::Connected { peripheral });
            } else {
                central.events.emit(CentralEvent::FailedToConnect {
                    peripheral,
                    error: Some("peripheral not reachable".to_string()),
                });
            }
            Ok(())
        })
    }

    async fn disconnect(&mut self, peripheral: PeripheralHandle) -> BleResult<()> {
        self.with_central(|air, central| {
            let host = air.host_mut(peripheral)?;
            if host.connected {
                host.connected = false;
                central.events.emit(CentralEvent::Disconnected {
                    peripheral,
                    error: None,
                });
            }
            Ok(())
        })
    }

    async fn discover_services(
        &mut self,
        peripheral: PeripheralHandle,
        services: &[Uuid],
    ) -> BleResult<()> {
        self.with_central(|air, central| {
            let host = air.host_mut(peripheral)?;
            let found = host
                .services
                .iter()
                .map(|s| s.uuid)
                .filter(|uuid| services.is_empty() || services.contains(uuid))
                .collect();
            central.gatt_events.emit(PeripheralEvent::DiscoveredServices {
                peripheral,
                services: found,
                error: None,
            });
            Ok(())
        })
    }

    async fn discover_characteristics(
        &mut self,
        peripheral: PeripheralHandle,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> BleResult<()> {
        self.with_central(|air, central| {
            let host = air.host_mut(peripheral)?;
            let found = host
                .services
                .iter()
                .filter(|s| s.uuid == service)
                .flat_map(|s| s.characteristics.iter().map(|c| c.uuid))
                .filter(|uuid| characteristics.is_empty() || characteristics.contains(uuid))
                .collect();
            central
                .gatt_events
                .emit(PeripheralEvent::DiscoveredCharacteristics {
                    peripheral,
                    service,
                    characteristics: found,
                    error: None,
                });
            Ok(())
        })
    }

    async fn read_value(
        &mut self,
        peripheral: PeripheralHandle,
        characteristic: Uuid,
    ) -> BleResult<()> {
        self.with_central(|air, central| {
            let host = air.host_mut(peripheral)?;
            let value = host
                .services
                .iter()
                .find_map(|s| s.characteristic(characteristic))
                .and_then(|c| c.value.clone());
            host.events
                .emit(PeripheralManagerEvent::ReceivedRead { characteristic });
            central.gatt_events.emit(PeripheralEvent::ValueUpdated {
                peripheral,
                characteristic,
                error: value
                    .is_none()
                    .then(|| "characteristic has no value".to_string()),
                value,
            });
            Ok(())
        })
    }

    async fn write_value(
        &mut self,
        peripheral: PeripheralHandle,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> BleResult<()> {
        self.with_central(|air, central| {
            let host = air.host_mut(peripheral)?;
            if !host.connected {
                return Err(BleSessionError::Driver(format!(
                    "{} is not connected",
                    peripheral
                )));
            }
            trace!("Loopback write of {} bytes to {}", value.len(), characteristic);
            host.events.emit(PeripheralManagerEvent::ReceivedWrite {
                requests: vec![WriteRequest {
                    characteristic,
                    value: value.to_vec(),
                }],
            });
            if write_type == WriteType::WithResponse {
                central.gatt_events.emit(PeripheralEvent::WroteValue {
                    peripheral,
                    characteristic,
                    error: None,
                });
            }
            Ok(())
        })
    }

    fn can_send_write_without_response(&self, _peripheral: PeripheralHandle) -> bool {
        true
    }

    fn maximum_write_length(&self, _peripheral: PeripheralHandle, _write_type: WriteType) -> usize {
        DEFAULT_MAX_PAYLOAD_LEN
    }
}

// ----------------------------------------------------------------------------
// Loopback Peripheral Manager
// ----------------------------------------------------------------------------

/// Peripheral manager driver backed by a [`LoopbackRadio`]
pub struct LoopbackPeripheralManager {
    radio: LoopbackRadio,
    index: usize,
}

impl LoopbackPeripheralManager {
    /// Handle the central side sees for this host
    pub fn handle(&self) -> PeripheralHandle {
        PeripheralHandle::new(self.index as u64)
    }

    fn with_host<T>(&self, f: impl FnOnce(&mut Host) -> T) -> BleResult<T> {
        let mut air = self.radio.air();
        air.hosts
            .get_mut(self.index)
            .map(f)
            .ok_or(BleSessionError::AdapterNotAvailable)
    }
}

#[async_trait]
impl PeripheralManagerDriver for LoopbackPeripheralManager {
    async fn add_service(&mut self, service: &ServiceDescriptor) -> BleResult<()> {
        self.with_host(|host| {
            host.services.push(service.clone());
            host.events.emit(PeripheralManagerEvent::AddedService {
                service: service.uuid,
                error: None,
            });
        })
    }

    async fn remove_all_services(&mut self) -> BleResult<()> {
        self.with_host(|host| host.services.clear())
    }

    async fn start_advertising(&mut self, advertisement: &Advertisement) -> BleResult<()> {
        self.with_host(|host| {
            host.advertising = Some(advertisement.clone());
            host.events
                .emit(PeripheralManagerEvent::StartedAdvertising { error: None });
        })?;
        self.radio.air().announce(self.index);
        Ok(())
    }

    async fn stop_advertising(&mut self) -> BleResult<()> {
        self.with_host(|host| host.advertising = None)
    }

    fn is_advertising(&self) -> bool {
        self.with_host(|host| host.advertising.is_some())
            .unwrap_or(false)
    }
}
