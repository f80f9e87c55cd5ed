//! Platform-agnostic BLE central transport contract
//!
//! This module defines the single seam between the connection state machine
//! and whatever platform BLE stack sits underneath. Every operation is a
//! non-blocking submission; the actual result arrives later as a
//! [`TransportEvent`] on the event channel handed out when the backend is
//! constructed. Porting to a different stack means implementing [`Transport`]
//! and nothing else.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[cfg(feature = "ble")]
pub mod btleplug;
pub mod mock;

/// Sending half of a backend's event stream.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
/// Receiving half of a backend's event stream, consumed by the state machine.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Power state of the local radio as reported by the platform stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    PoweredOff,
    PoweredOn,
    Unsupported,
    Unauthorized,
}

impl RadioState {
    pub fn is_powered_on(&self) -> bool {
        matches!(self, RadioState::PoweredOn)
    }
}

/// Reason code attached to every asynchronous transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    PeripheralGone,
    Unsupported,
    Unauthorized,
    Busy,
    /// Backend-specific error rendered as text.
    Backend(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::PeripheralGone => write!(f, "peripheral gone"),
            FailureReason::Unsupported => write!(f, "unsupported"),
            FailureReason::Unauthorized => write!(f, "unauthorized"),
            FailureReason::Busy => write!(f, "busy"),
            FailureReason::Backend(msg) => write!(f, "{msg}"),
        }
    }
}

/// What a characteristic can do, derived from its GATT property flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

/// A peripheral seen during an active scan session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    /// Stable opaque identifier assigned by the platform stack.
    pub id: String,
    /// Advertised local name, when present.
    pub name: Option<String>,
    /// Signal strength at the last advertisement.
    pub rssi: Option<i16>,
}

impl DiscoveredPeripheral {
    /// Display label: the advertised name, falling back to the identifier.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A service discovered on the connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
}

/// A characteristic discovered within a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub capabilities: Capabilities,
}

/// Asynchronous results and unsolicited events emitted by a transport backend.
///
/// Write completions carry back the `seq` the state machine passed to
/// [`Transport::write_value`], since BLE stacks confirm writes without any
/// request identity of their own and confirmations may arrive out of request
/// order when several writes are in flight.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    RadioStateChanged(RadioState),
    PeripheralDiscovered(DiscoveredPeripheral),
    Connected {
        peripheral: String,
    },
    ConnectFailed {
        peripheral: String,
        reason: FailureReason,
    },
    Disconnected {
        peripheral: String,
    },
    ServicesDiscovered {
        peripheral: String,
        services: Vec<ServiceInfo>,
    },
    ServiceDiscoveryFailed {
        peripheral: String,
        reason: FailureReason,
    },
    CharacteristicsDiscovered {
        peripheral: String,
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    },
    CharacteristicDiscoveryFailed {
        peripheral: String,
        service: Uuid,
        reason: FailureReason,
    },
    NotifyStateChanged {
        peripheral: String,
        characteristic: Uuid,
        enabled: bool,
    },
    NotifySetupFailed {
        peripheral: String,
        characteristic: Uuid,
        reason: FailureReason,
    },
    /// Inbound value, from an explicit read or a notification.
    ValueUpdated {
        peripheral: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    ReadFailed {
        peripheral: String,
        characteristic: Uuid,
        reason: FailureReason,
    },
    WriteResult {
        peripheral: String,
        characteristic: Uuid,
        seq: u64,
        result: Result<(), FailureReason>,
    },
}

/// Errors returned when a transport rejects an operation at submission time.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("BLE adapter not powered")]
    AdapterNotPowered,

    #[error("BLE peripheral not found")]
    PeripheralNotFound,

    #[error("BLE service not found")]
    ServiceNotFound,

    #[error("BLE characteristic not found")]
    CharacteristicNotFound,

    #[error("BLE operation not supported: {0}")]
    OperationNotSupported(String),

    #[error("platform error: {0}")]
    Platform(String),
}

/// Contract every platform BLE backend implements.
///
/// Methods return as soon as the operation has been handed to the platform
/// stack; an `Err` means the submission itself was rejected. Completion,
/// success or failure, is always reported through the event channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Current radio power state. Changes are also pushed as
    /// [`TransportEvent::RadioStateChanged`].
    fn radio_state(&self) -> RadioState;

    /// Start scanning for peripherals advertising any of the given services.
    /// Emits [`TransportEvent::PeripheralDiscovered`] until the scan stops.
    async fn start_scan(&self, service_filters: &[Uuid]) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Initiate a connection. Emits `Connected` or `ConnectFailed`.
    async fn connect(&self, peripheral: &str) -> Result<(), TransportError>;

    /// Tear down a connection. Emits `Disconnected`.
    async fn disconnect(&self, peripheral: &str) -> Result<(), TransportError>;

    /// Discover services, optionally filtered. Emits `ServicesDiscovered`
    /// or `ServiceDiscoveryFailed`.
    async fn discover_services(
        &self,
        peripheral: &str,
        filters: &[Uuid],
    ) -> Result<(), TransportError>;

    /// Discover the characteristics of one service. Emits
    /// `CharacteristicsDiscovered` or `CharacteristicDiscoveryFailed`.
    async fn discover_characteristics(
        &self,
        peripheral: &str,
        service: Uuid,
    ) -> Result<(), TransportError>;

    /// Enable or disable notifications. Emits `NotifyStateChanged` or
    /// `NotifySetupFailed`.
    async fn set_notify(
        &self,
        peripheral: &str,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError>;

    /// Request a one-shot read. Emits `ValueUpdated` or `ReadFailed`.
    async fn read_value(&self, peripheral: &str, characteristic: Uuid)
        -> Result<(), TransportError>;

    /// Submit a write. `seq` is echoed back in the `WriteResult` event so the
    /// caller can correlate completions.
    async fn write_value(
        &self,
        peripheral: &str,
        characteristic: Uuid,
        bytes: &[u8],
        require_ack: bool,
        seq: u64,
    ) -> Result<(), TransportError>;
}
