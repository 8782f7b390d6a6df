//! Central driver on btleplug
//!
//! btleplug operations complete asynchronously, so each request runs on its
//! own task and reports its outcome as an event, the way the platform
//! callbacks would. Peripheral ids are mapped to stable [`PeripheralHandle`]s
//! on first sight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent as BtleEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::driver::CentralDriver;
use crate::error::{BleResult, BleSessionError};
use crate::events::{CentralEvent, EventSender, PeripheralEvent, PeripheralHandle, RadioState};
use crate::protocol::WriteType;

/// Largest write-without-response value assumed to fit one ATT packet.
/// btleplug does not expose the negotiated MTU; 247 is what BlueZ and
/// CoreBluetooth settle on with data length extension.
const WRITE_WITHOUT_RESPONSE_LEN: usize = 244;

/// Longest attribute value a write with response may carry
const WRITE_WITH_RESPONSE_LEN: usize = 512;

fn driver_error(context: &str, err: btleplug::Error) -> BleSessionError {
    BleSessionError::Driver(format!("{}: {}", context, err))
}

// ----------------------------------------------------------------------------
// Handle Registry
// ----------------------------------------------------------------------------

#[derive(Default)]
struct HandleRegistry {
    handles: HashMap<PeripheralId, PeripheralHandle>,
    ids: HashMap<PeripheralHandle, PeripheralId>,
    next: u64,
}

impl HandleRegistry {
    fn handle_for(&mut self, id: PeripheralId) -> PeripheralHandle {
        if let Some(handle) = self.handles.get(&id) {
            return *handle;
        }
        self.next += 1;
        let handle = PeripheralHandle::new(self.next);
        self.handles.insert(id.clone(), handle);
        self.ids.insert(handle, id);
        handle
    }
}

fn lock(registry: &Mutex<HandleRegistry>) -> MutexGuard<'_, HandleRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Central Driver
// ----------------------------------------------------------------------------

/// btleplug-backed central manager and GATT client
pub struct BtleplugCentral {
    adapter: Adapter,
    gatt_events: EventSender<PeripheralEvent>,
    central_events: EventSender<CentralEvent>,
    registry: Arc<Mutex<HandleRegistry>>,
    event_pump: JoinHandle<()>,
}

impl BtleplugCentral {
    /// Open the first BLE adapter and start forwarding its events
    pub async fn new(
        central_events: EventSender<CentralEvent>,
        gatt_events: EventSender<PeripheralEvent>,
    ) -> BleResult<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| driver_error("Failed to create BLE manager", e))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| driver_error("Failed to get BLE adapters", e))?
            .into_iter()
            .next()
            .ok_or(BleSessionError::AdapterNotAvailable)?;

        let mut stream = adapter
            .events()
            .await
            .map_err(|e| driver_error("Failed to subscribe to adapter events", e))?;

        let registry = Arc::new(Mutex::new(HandleRegistry::default()));
        let pump_registry = Arc::clone(&registry);
        let pump_events = central_events.clone();
        let event_pump = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let forwarded = match event {
                    // btleplug raises DeviceDiscovered once per device; the
                    // updates stand in for the repeated advertisements.
                    BtleEvent::DeviceDiscovered(id) | BtleEvent::DeviceUpdated(id) => {
                        CentralEvent::DiscoveredPeripheral {
                            peripheral: lock(&pump_registry).handle_for(id),
                        }
                    }
                    BtleEvent::DeviceDisconnected(id) => CentralEvent::Disconnected {
                        peripheral: lock(&pump_registry).handle_for(id),
                        error: None,
                    },
                    // Connected is raised by the connect task itself.
                    _ => continue,
                };
                pump_events.emit(forwarded);
            }
            debug!("Adapter event stream ended");
        });

        // btleplug 0.11 does not report adapter power. Assume the radio is
        // usable; a powered-off adapter surfaces as a failed scan instead.
        central_events.emit(CentralEvent::StateChanged(RadioState::PoweredOn));
        info!("BLE central adapter initialized");

        Ok(Self {
            adapter,
            gatt_events,
            central_events,
            registry,
            event_pump,
        })
    }

    async fn peripheral(&self, handle: PeripheralHandle) -> BleResult<Peripheral> {
        let id = lock(&self.registry)
            .ids
            .get(&handle)
            .cloned()
            .ok_or_else(|| BleSessionError::UnknownPeripheral(handle.to_string()))?;
        self.adapter
            .peripheral(&id)
            .await
            .map_err(|e| driver_error("Failed to look up peripheral", e))
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        self.event_pump.abort();
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

#[async_trait]
impl CentralDriver for BtleplugCentral {
    async fn scan(&mut self, service: Uuid) -> BleResult<()> {
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(|e| driver_error("Failed to start BLE scan", e))?;
        info!("Started BLE scan for service {}", service);
        Ok(())
    }

    async fn stop_scan(&mut self) -> BleResult<()> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| driver_error("Failed to stop BLE scan", e))
    }

    async fn connect(&mut self, handle: PeripheralHandle) -> BleResult<()> {
        let peripheral = self.peripheral(handle).await?;
        let events = self.central_events.clone();
        tokio::spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => CentralEvent::Connected { peripheral: handle },
                Err(e) => CentralEvent::FailedToConnect {
                    peripheral: handle,
                    error: Some(e.to_string()),
                },
            };
            events.emit(event);
        });
        Ok(())
    }

    async fn disconnect(&mut self, handle: PeripheralHandle) -> BleResult<()> {
        let peripheral = self.peripheral(handle).await?;
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect from {} failed: {}", handle, e);
            }
        });
        Ok(())
    }

    async fn discover_services(
        &mut self,
        handle: PeripheralHandle,
        services: &[Uuid],
    ) -> BleResult<()> {
        let peripheral = self.peripheral(handle).await?;
        let wanted = services.to_vec();
        let events = self.gatt_events.clone();
        tokio::spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => PeripheralEvent::DiscoveredServices {
                    peripheral: handle,
                    services: peripheral
                        .services()
                        .into_iter()
                        .map(|s| s.uuid)
                        .filter(|uuid| wanted.is_empty() || wanted.contains(uuid))
                        .collect(),
                    error: None,
                },
                Err(e) => PeripheralEvent::DiscoveredServices {
                    peripheral: handle,
                    services: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            events.emit(event);
        });
        Ok(())
    }

    async fn discover_characteristics(
        &mut self,
        handle: PeripheralHandle,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> BleResult<()> {
        // btleplug resolves characteristics together with services.
        let peripheral = self.peripheral(handle).await?;
        let found = peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.into_iter().map(|c| c.uuid))
            .filter(|uuid| characteristics.is_empty() || characteristics.contains(uuid))
            .collect();
        self.gatt_events
            .emit(PeripheralEvent::DiscoveredCharacteristics {
                peripheral: handle,
                service,
                characteristics: found,
                error: None,
            });
        Ok(())
    }

    async fn read_value(
        &mut self,
        handle: PeripheralHandle,
        characteristic: Uuid,
    ) -> BleResult<()> {
        let peripheral = self.peripheral(handle).await?;
        let target = find_characteristic(&peripheral, characteristic)
            .ok_or_else(|| BleSessionError::Driver(format!("{} not discovered", characteristic)))?;
        let events = self.gatt_events.clone();
        tokio::spawn(async move {
            let event = match peripheral.read(&target).await {
                Ok(value) => PeripheralEvent::ValueUpdated {
                    peripheral: handle,
                    characteristic,
                    value: Some(value),
                    error: None,
                },
                Err(e) => PeripheralEvent::ValueUpdated {
                    peripheral: handle,
                    characteristic,
                    value: None,
                    error: Some(e.to_string()),
                },
            };
            events.emit(event);
        });
        Ok(())
    }

    async fn write_value(
        &mut self,
        handle: PeripheralHandle,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> BleResult<()> {
        let peripheral = self.peripheral(handle).await?;
        let target = find_characteristic(&peripheral, characteristic)
            .ok_or_else(|| BleSessionError::Driver(format!("{} not discovered", characteristic)))?;
        let value = value.to_vec();
        let events = self.gatt_events.clone();
        tokio::spawn(async move {
            let btle_type = match write_type {
                WriteType::WithResponse => BtleWriteType::WithResponse,
                WriteType::WithoutResponse => BtleWriteType::WithoutResponse,
            };
            let result = peripheral.write(&target, &value, btle_type).await;
            trace!("Wrote {} bytes to {} on {}", value.len(), characteristic, handle);
            if write_type == WriteType::WithResponse || result.is_err() {
                events.emit(PeripheralEvent::WroteValue {
                    peripheral: handle,
                    characteristic,
                    error: result.err().map(|e| e.to_string()),
                });
            }
        });
        Ok(())
    }

    fn can_send_write_without_response(&self, _handle: PeripheralHandle) -> bool {
        // btleplug queues writes internally and offers no flow-control signal.
        true
    }

    fn maximum_write_length(&self, _handle: PeripheralHandle, write_type: WriteType) -> usize {
        match write_type {
            WriteType::WithResponse => WRITE_WITH_RESPONSE_LEN,
            WriteType::WithoutResponse => WRITE_WITHOUT_RESPONSE_LEN,
        }
    }
}
