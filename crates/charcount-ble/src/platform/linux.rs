//! Linux peripheral manager using bluer (BlueZ)
//!
//! BlueZ registers a whole GATT application at once, so every
//! `add_service` re-serves the full service list. Dropping the application
//! or advertisement handle unregisters it.

use async_trait::async_trait;
use bluer::adv::{Advertisement as LeAdvertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, Service,
};
use bluer::{AdapterEvent, AdapterProperty};
use futures::{FutureExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::driver::PeripheralManagerDriver;
use crate::error::{BleResult, BleSessionError};
use crate::events::{EventSender, PeripheralManagerEvent, RadioState, WriteRequest};
use crate::protocol::{
    Advertisement, CharacteristicDescriptor, CharacteristicProperty, ServiceDescriptor,
};

fn driver_error(context: &str, err: bluer::Error) -> BleSessionError {
    BleSessionError::Driver(format!("{}: {}", context, err))
}

// ----------------------------------------------------------------------------
// Linux Implementation
// ----------------------------------------------------------------------------

pub struct BluerPeripheralManager {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    events: EventSender<PeripheralManagerEvent>,
    services: Vec<ServiceDescriptor>,
    application: Option<ApplicationHandle>,
    advertisement: Option<AdvertisementHandle>,
    power_monitor: JoinHandle<()>,
}

impl BluerPeripheralManager {
    pub async fn new(events: EventSender<PeripheralManagerEvent>) -> BleResult<Self> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| driver_error("BlueZ session", e))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| BleSessionError::AdapterNotAvailable)?;

        if !adapter.is_powered().await.unwrap_or(false) {
            adapter
                .set_powered(true)
                .await
                .map_err(|e| driver_error("Failed to power on adapter", e))?;
        }

        let mut adapter_events = adapter
            .events()
            .await
            .map_err(|e| driver_error("Failed to watch adapter", e))?;
        let monitor_events = events.clone();
        let power_monitor = tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    let state = if powered {
                        RadioState::PoweredOn
                    } else {
                        RadioState::PoweredOff
                    };
                    monitor_events.emit(PeripheralManagerEvent::StateChanged(state));
                }
            }
        });

        let state = match adapter.is_powered().await {
            Ok(true) => RadioState::PoweredOn,
            Ok(false) => RadioState::PoweredOff,
            Err(_) => RadioState::Unknown,
        };
        events.emit(PeripheralManagerEvent::StateChanged(state));
        info!("Linux BLE adapter {} ready for hosting", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
            events,
            services: Vec::new(),
            application: None,
            advertisement: None,
            power_monitor,
        })
    }

    fn gatt_characteristic(&self, descriptor: &CharacteristicDescriptor) -> Characteristic {
        let uuid = descriptor.uuid;
        let mut characteristic = Characteristic {
            uuid,
            ..Default::default()
        };

        if descriptor.supports(CharacteristicProperty::Read) {
            let value = descriptor.value.clone().unwrap_or_default();
            let events = self.events.clone();
            characteristic.read = Some(CharacteristicRead {
                read: true,
                fun: Box::new(move |_request| {
                    let value = value.clone();
                    let events = events.clone();
                    async move {
                        events.emit(PeripheralManagerEvent::ReceivedRead {
                            characteristic: uuid,
                        });
                        Ok(value)
                    }
                    .boxed()
                }),
                ..Default::default()
            });
        }

        if descriptor.supports(CharacteristicProperty::WriteWithoutResponse) {
            let events = self.events.clone();
            characteristic.write = Some(CharacteristicWrite {
                write_without_response: true,
                method: CharacteristicWriteMethod::Fun(Box::new(move |value, _request| {
                    let events = events.clone();
                    async move {
                        events.emit(PeripheralManagerEvent::ReceivedWrite {
                            requests: vec![WriteRequest {
                                characteristic: uuid,
                                value,
                            }],
                        });
                        Ok(())
                    }
                    .boxed()
                })),
                ..Default::default()
            });
        }

        characteristic
    }

    fn application(&self) -> Application {
        Application {
            services: self
                .services
                .iter()
                .map(|service| Service {
                    uuid: service.uuid,
                    primary: service.primary,
                    characteristics: service
                        .characteristics
                        .iter()
                        .map(|c| self.gatt_characteristic(c))
                        .collect(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

impl Drop for BluerPeripheralManager {
    fn drop(&mut self) {
        self.power_monitor.abort();
    }
}

#[async_trait]
impl PeripheralManagerDriver for BluerPeripheralManager {
    async fn add_service(&mut self, service: &ServiceDescriptor) -> BleResult<()> {
        self.services.push(service.clone());
        self.application = None;

        match self.adapter.serve_gatt_application(self.application()).await {
            Ok(handle) => {
                self.application = Some(handle);
                debug!("GATT service {} registered", service.uuid);
                self.events.emit(PeripheralManagerEvent::AddedService {
                    service: service.uuid,
                    error: None,
                });
                Ok(())
            }
            Err(e) => {
                self.services.retain(|s| s.uuid != service.uuid);
                self.events.emit(PeripheralManagerEvent::AddedService {
                    service: service.uuid,
                    error: Some(e.to_string()),
                });
                Err(driver_error("Failed to register GATT service", e))
            }
        }
    }

    async fn remove_all_services(&mut self) -> BleResult<()> {
        self.services.clear();
        self.application = None;
        Ok(())
    }

    async fn start_advertising(&mut self, advertisement: &Advertisement) -> BleResult<()> {
        self.advertisement = None;

        let le_advertisement = LeAdvertisement {
            advertisement_type: Type::Peripheral,
            service_uuids: advertisement.service_uuids.iter().copied().collect(),
            discoverable: Some(true),
            ..Default::default()
        };

        match self.adapter.advertise(le_advertisement).await {
            Ok(handle) => {
                self.advertisement = Some(handle);
                self.events
                    .emit(PeripheralManagerEvent::StartedAdvertising { error: None });
                Ok(())
            }
            Err(e) => {
                self.events.emit(PeripheralManagerEvent::StartedAdvertising {
                    error: Some(e.to_string()),
                });
                Err(driver_error("Failed to start advertising", e))
            }
        }
    }

    async fn stop_advertising(&mut self) -> BleResult<()> {
        if self.advertisement.take().is_some() {
            debug!("Advertisement unregistered");
        }
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.advertisement.is_some()
    }
}
