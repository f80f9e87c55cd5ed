//! Data model owned by the connection state machine.

use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

use crate::transport::{CharacteristicInfo, DiscoveredPeripheral, FailureReason};

/// Lifecycle of the single logical connection.
///
/// `Disconnected` is terminal until the next connect or scan intent; every
/// other state implies an in-flight session. Radio loss forces
/// `Disconnected(RadioUnavailable)` from any state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Ready,
    Disconnecting,
    Disconnected(DisconnectReason),
}

impl LinkState {
    /// True while a `Connection` object exists.
    pub fn has_connection(&self) -> bool {
        matches!(
            self,
            LinkState::Connecting
                | LinkState::Connected
                | LinkState::DiscoveringServices
                | LinkState::DiscoveringCharacteristics
                | LinkState::Ready
                | LinkState::Disconnecting
        )
    }

    /// States in which a write may be submitted. Writes before discovery
    /// completes are allowed only once the target characteristic is known.
    pub fn allows_write(&self) -> bool {
        matches!(
            self,
            LinkState::Connected
                | LinkState::DiscoveringServices
                | LinkState::DiscoveringCharacteristics
                | LinkState::Ready
        )
    }

    /// States from which a fresh scan or connect intent is accepted.
    pub fn accepts_session_start(&self) -> bool {
        matches!(
            self,
            LinkState::Idle | LinkState::Scanning | LinkState::Disconnected(_)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Idle => write!(f, "Idle"),
            LinkState::Scanning => write!(f, "Scanning"),
            LinkState::Connecting => write!(f, "Connecting"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::DiscoveringServices => write!(f, "Discovering services"),
            LinkState::DiscoveringCharacteristics => write!(f, "Discovering characteristics"),
            LinkState::Ready => write!(f, "Ready"),
            LinkState::Disconnecting => write!(f, "Disconnecting"),
            LinkState::Disconnected(reason) => write!(f, "Disconnected ({reason})"),
        }
    }
}

/// Why the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    UserRequested,
    PeripheralDropped,
    ConnectFailed(FailureReason),
    DiscoveryFailed,
    RadioUnavailable,
    Timeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::UserRequested => write!(f, "user requested"),
            DisconnectReason::PeripheralDropped => write!(f, "peripheral dropped the connection"),
            DisconnectReason::ConnectFailed(reason) => write!(f, "connect failed: {reason}"),
            DisconnectReason::DiscoveryFailed => write!(f, "service discovery failed"),
            DisconnectReason::RadioUnavailable => write!(f, "radio unavailable"),
            DisconnectReason::Timeout => write!(f, "timed out"),
        }
    }
}

/// Ordered, duplicate-free scan results. Insertion order is preserved for
/// display; repeated sightings of the same peripheral refresh its entry.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    entries: Vec<DiscoveredPeripheral>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peripheral; returns true when it is new.
    pub fn upsert(&mut self, peripheral: DiscoveredPeripheral) -> bool {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.id == peripheral.id) {
            if peripheral.name.is_some() {
                existing.name = peripheral.name;
            }
            if peripheral.rssi.is_some() {
                existing.rssi = peripheral.rssi;
            }
            false
        } else {
            self.entries.push(peripheral);
            true
        }
    }

    pub fn get(&self, id: &str) -> Option<&DiscoveredPeripheral> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn as_slice(&self) -> &[DiscoveredPeripheral] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Characteristic state tracked on the active connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicState {
    pub uuid: Uuid,
    pub capabilities: crate::transport::Capabilities,
    /// True only after a subscribe request completed successfully on a
    /// notify-capable characteristic.
    pub subscribed: bool,
    /// Cleared when notify setup or the initial read fails; the
    /// characteristic is skipped from then on.
    pub usable: bool,
    /// Latest value received. Overwritten, never queued.
    pub last_value: Option<Vec<u8>>,
}

impl CharacteristicState {
    pub fn new(info: CharacteristicInfo) -> Self {
        Self {
            uuid: info.uuid,
            capabilities: info.capabilities,
            subscribed: false,
            usable: true,
            last_value: None,
        }
    }
}

/// A discovered service and its characteristics.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub uuid: Uuid,
    /// False when characteristic discovery failed for this service.
    pub usable: bool,
    pub characteristics: HashMap<Uuid, CharacteristicState>,
}

impl ServiceState {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            usable: true,
            characteristics: HashMap::new(),
        }
    }
}

/// The at-most-one active connection. Exists exactly while the link state
/// reports a session in flight; destroyed on disconnect completion or an
/// unrecoverable connect failure.
#[derive(Debug, Clone)]
pub struct Connection {
    pub peripheral: DiscoveredPeripheral,
    pub services: HashMap<Uuid, ServiceState>,
}

impl Connection {
    pub fn new(peripheral: DiscoveredPeripheral) -> Self {
        Self {
            peripheral,
            services: HashMap::new(),
        }
    }

    /// Look up a characteristic, skipping unusable services and
    /// characteristics already taken out of rotation.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicState> {
        self.services
            .values()
            .filter(|s| s.usable)
            .find_map(|s| s.characteristics.get(&uuid).filter(|c| c.usable))
    }

    pub fn characteristic_mut(&mut self, uuid: Uuid) -> Option<&mut CharacteristicState> {
        self.services
            .values_mut()
            .filter(|s| s.usable)
            .find_map(|s| s.characteristics.get_mut(&uuid).filter(|c| c.usable))
    }
}

/// Immutable view of the session handed to the presentation layer.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: LinkState,
    /// Human-readable status string, always reflecting the current state and,
    /// on failure, the reason.
    pub status: String,
    /// Scan results in arrival order.
    pub devices: Vec<DiscoveredPeripheral>,
    /// Usable characteristics of the active connection's usable services,
    /// sorted by UUID for stable display.
    pub characteristics: Vec<CharacteristicState>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: LinkState::Idle,
            status: LinkState::Idle.to_string(),
            devices: Vec::new(),
            characteristics: Vec::new(),
        }
    }
}

impl Snapshot {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicState> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}
