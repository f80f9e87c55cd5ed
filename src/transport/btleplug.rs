//! Central transport backed by the `btleplug` crate.
//!
//! Translates the [`Transport`] contract onto btleplug's cross-platform
//! central API. btleplug discovers the whole GATT tree in a single call, so
//! per-service characteristic discovery is answered from the tree cached on
//! the connected peripheral; at the event level the fan-out contract is
//! preserved.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Capabilities, CharacteristicInfo, DiscoveredPeripheral, EventReceiver, EventSender,
    FailureReason, RadioState, ServiceInfo, Transport, TransportError, TransportEvent,
};

pub struct BtleplugTransport {
    adapter: Adapter,
    events: EventSender,
    radio: Arc<Mutex<RadioState>>,
    /// Peripheral of the active connection, set on connect.
    connected: Arc<Mutex<Option<Peripheral>>>,
    /// Characteristic handles cached after service discovery.
    characteristics: Arc<Mutex<std::collections::HashMap<Uuid, Characteristic>>>,
}

impl BtleplugTransport {
    /// Acquire the first available adapter and start the event pump.
    pub async fn new() -> Result<(Self, EventReceiver), TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let Some(adapter) = adapters.into_iter().next() else {
            return Err(TransportError::AdapterNotAvailable);
        };
        let info = adapter
            .adapter_info()
            .await
            .unwrap_or_else(|_| "unknown adapter".to_string());
        info!(adapter = %info, "BLE adapter acquired");

        let (events, receiver) = tokio::sync::mpsc::unbounded_channel();
        // An acquired adapter is usable; platforms that report power changes
        // do so through StateUpdate events handled by the pump.
        let radio = Arc::new(Mutex::new(RadioState::PoweredOn));
        let transport = Self {
            adapter: adapter.clone(),
            events: events.clone(),
            radio: Arc::clone(&radio),
            connected: Arc::new(Mutex::new(None)),
            characteristics: Arc::new(Mutex::new(std::collections::HashMap::new())),
        };
        tokio::spawn(event_pump(adapter, events, radio));
        Ok((transport, receiver))
    }

    async fn find_peripheral(&self, id: &str) -> Result<Peripheral, TransportError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::Platform(e.to_string()))?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or(TransportError::PeripheralNotFound)
    }

    fn connected_peripheral(&self) -> Result<Peripheral, TransportError> {
        self.connected
            .lock()
            .expect("connected peripheral lock poisoned")
            .clone()
            .ok_or(TransportError::PeripheralNotFound)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.characteristics
            .lock()
            .expect("characteristic cache lock poisoned")
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound)
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    fn radio_state(&self) -> RadioState {
        *self.radio.lock().expect("radio state lock poisoned")
    }

    async fn start_scan(&self, service_filters: &[Uuid]) -> Result<(), TransportError> {
        let filter = ScanFilter {
            services: service_filters.to_vec(),
        };
        self.adapter.start_scan(filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, peripheral: &str) -> Result<(), TransportError> {
        let target = self.find_peripheral(peripheral).await?;
        let events = self.events.clone();
        let connected = Arc::clone(&self.connected);
        let id = peripheral.to_string();
        tokio::spawn(async move {
            match target.connect().await {
                Ok(()) => {
                    *connected
                        .lock()
                        .expect("connected peripheral lock poisoned") = Some(target.clone());
                    spawn_notification_pump(&target, events.clone(), id.clone()).await;
                    let _ = events.send(TransportEvent::Connected { peripheral: id });
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::ConnectFailed {
                        peripheral: id,
                        reason: failure_reason(e),
                    });
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self, peripheral: &str) -> Result<(), TransportError> {
        let target = match self.connected_peripheral() {
            Ok(found) => found,
            Err(_) => self.find_peripheral(peripheral).await?,
        };
        self.connected
            .lock()
            .expect("connected peripheral lock poisoned")
            .take();
        tokio::spawn(async move {
            if let Err(e) = target.disconnect().await {
                debug!(error = %e, "disconnect request failed");
            }
            // DeviceDisconnected arrives through the central event pump.
        });
        Ok(())
    }

    async fn discover_services(
        &self,
        peripheral: &str,
        filters: &[Uuid],
    ) -> Result<(), TransportError> {
        let target = self.connected_peripheral()?;
        let events = self.events.clone();
        let cache = Arc::clone(&self.characteristics);
        let filters = filters.to_vec();
        let id = peripheral.to_string();
        tokio::spawn(async move {
            match target.discover_services().await {
                Ok(()) => {
                    let mut services = Vec::new();
                    let mut characteristics = std::collections::HashMap::new();
                    for service in target.services() {
                        if !filters.is_empty() && !filters.contains(&service.uuid) {
                            continue;
                        }
                        services.push(ServiceInfo { uuid: service.uuid });
                        for chr in &service.characteristics {
                            characteristics.insert(chr.uuid, chr.clone());
                        }
                    }
                    *cache.lock().expect("characteristic cache lock poisoned") = characteristics;
                    let _ = events.send(TransportEvent::ServicesDiscovered {
                        peripheral: id,
                        services,
                    });
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::ServiceDiscoveryFailed {
                        peripheral: id,
                        reason: failure_reason(e),
                    });
                }
            }
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &str,
        service: Uuid,
    ) -> Result<(), TransportError> {
        let target = self.connected_peripheral()?;
        let found = target.services().into_iter().find(|s| s.uuid == service);
        let event = match found {
            Some(svc) => TransportEvent::CharacteristicsDiscovered {
                peripheral: peripheral.to_string(),
                service,
                characteristics: svc
                    .characteristics
                    .iter()
                    .map(|chr| CharacteristicInfo {
                        uuid: chr.uuid,
                        capabilities: capabilities(chr.properties),
                    })
                    .collect(),
            },
            None => TransportEvent::CharacteristicDiscoveryFailed {
                peripheral: peripheral.to_string(),
                service,
                reason: FailureReason::Backend("service not in discovered tree".to_string()),
            },
        };
        let _ = self.events.send(event);
        Ok(())
    }

    async fn set_notify(
        &self,
        peripheral: &str,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let target = self.connected_peripheral()?;
        let chr = self.characteristic(characteristic)?;
        let events = self.events.clone();
        let id = peripheral.to_string();
        tokio::spawn(async move {
            let result = if enabled {
                target.subscribe(&chr).await
            } else {
                target.unsubscribe(&chr).await
            };
            let event = match result {
                Ok(()) => TransportEvent::NotifyStateChanged {
                    peripheral: id,
                    characteristic,
                    enabled,
                },
                Err(e) => TransportEvent::NotifySetupFailed {
                    peripheral: id,
                    characteristic,
                    reason: failure_reason(e),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn read_value(
        &self,
        peripheral: &str,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let target = self.connected_peripheral()?;
        let chr = self.characteristic(characteristic)?;
        let events = self.events.clone();
        let id = peripheral.to_string();
        tokio::spawn(async move {
            let event = match target.read(&chr).await {
                Ok(value) => TransportEvent::ValueUpdated {
                    peripheral: id,
                    characteristic,
                    value,
                },
                Err(e) => TransportEvent::ReadFailed {
                    peripheral: id,
                    characteristic,
                    reason: failure_reason(e),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn write_value(
        &self,
        peripheral: &str,
        characteristic: Uuid,
        bytes: &[u8],
        require_ack: bool,
        seq: u64,
    ) -> Result<(), TransportError> {
        let target = self.connected_peripheral()?;
        let chr = self.characteristic(characteristic)?;
        let write_type = if !require_ack
            && chr
                .properties
                .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        let events = self.events.clone();
        let id = peripheral.to_string();
        let payload = bytes.to_vec();
        tokio::spawn(async move {
            let result = target
                .write(&chr, &payload, write_type)
                .await
                .map_err(failure_reason);
            let _ = events.send(TransportEvent::WriteResult {
                peripheral: id,
                characteristic,
                seq,
                result,
            });
        });
        Ok(())
    }
}

/// Forward adapter-level events into the transport event stream.
async fn event_pump(adapter: Adapter, events: EventSender, radio: Arc<Mutex<RadioState>>) {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "adapter event stream unavailable");
            return;
        }
    };
    while let Some(event) = stream.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if let Ok(peripheral) = adapter.peripheral(&id).await {
                    let properties = peripheral.properties().await.ok().flatten();
                    let _ = events.send(TransportEvent::PeripheralDiscovered(
                        DiscoveredPeripheral {
                            id: id.to_string(),
                            name: properties.as_ref().and_then(|p| p.local_name.clone()),
                            rssi: properties.as_ref().and_then(|p| p.rssi),
                        },
                    ));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let _ = events.send(TransportEvent::Disconnected {
                    peripheral: id.to_string(),
                });
            }
            CentralEvent::StateUpdate(state) => {
                let mapped = match state {
                    CentralState::PoweredOn => RadioState::PoweredOn,
                    CentralState::PoweredOff => RadioState::PoweredOff,
                    CentralState::Unknown => RadioState::Unknown,
                };
                *radio.lock().expect("radio state lock poisoned") = mapped;
                let _ = events.send(TransportEvent::RadioStateChanged(mapped));
            }
            _ => {}
        }
    }
    debug!("adapter event stream ended");
}

/// Start forwarding the peripheral's notification stream as value updates.
async fn spawn_notification_pump(peripheral: &Peripheral, events: EventSender, id: String) {
    match peripheral.notifications().await {
        Ok(mut notifications) => {
            tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    let _ = events.send(TransportEvent::ValueUpdated {
                        peripheral: id.clone(),
                        characteristic: notification.uuid,
                        value: notification.value,
                    });
                }
                debug!("notification stream ended");
            });
        }
        Err(e) => warn!(error = %e, "notification stream unavailable"),
    }
}

fn capabilities(properties: CharPropFlags) -> Capabilities {
    Capabilities {
        read: properties.contains(CharPropFlags::READ),
        write: properties.contains(CharPropFlags::WRITE)
            || properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: properties.contains(CharPropFlags::NOTIFY)
            || properties.contains(CharPropFlags::INDICATE),
    }
}

fn failure_reason(error: btleplug::Error) -> FailureReason {
    match error {
        btleplug::Error::TimedOut(_) => FailureReason::Timeout,
        btleplug::Error::DeviceNotFound | btleplug::Error::NotConnected => {
            FailureReason::PeripheralGone
        }
        btleplug::Error::NotSupported(_) => FailureReason::Unsupported,
        btleplug::Error::PermissionDenied => FailureReason::Unauthorized,
        other => FailureReason::Backend(other.to_string()),
    }
}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        TransportError::Platform(err.to_string())
    }
}
