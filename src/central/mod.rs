//! Connection state machine and its public handle.
//!
//! The machine runs as a single spawned task owning all session state; the
//! transport's event stream and the command channel are the only sources of
//! mutation, merged into one serialized loop. [`Central`] is the cheap,
//! cloneable handle the presentation layer talks to.

mod machine;
mod state;

pub use state::{
    CharacteristicState, Connection, DeviceList, DisconnectReason, LinkState, ServiceState,
    Snapshot,
};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

use crate::channel::{DataChannel, Update};
use crate::config::CentralConfig;
use crate::transport::{EventReceiver, FailureReason, Transport, TransportError};
use machine::Machine;

/// Errors returned to the caller of a presentation intent.
#[derive(Error, Debug)]
pub enum CentralError {
    #[error("radio unavailable")]
    RadioUnavailable,

    #[error("scan failed: {0}")]
    ScanFailed(String),

    #[error("connect failed: {0}")]
    ConnectFailed(FailureReason),

    #[error("unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("not connected")]
    NotConnected,

    #[error("characteristic {0} is not writable")]
    NotWritable(Uuid),

    #[error("write to {characteristic} failed: {reason}")]
    WriteFailed {
        characteristic: Uuid,
        reason: FailureReason,
    },

    #[error("operation not valid while {0}")]
    InvalidState(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("central task is shut down")]
    Shutdown,
}

/// Presentation-layer intents delivered to the machine task.
pub(crate) enum Command {
    StartScan(oneshot::Sender<Result<(), CentralError>>),
    StopScan(oneshot::Sender<Result<(), CentralError>>),
    Connect {
        peripheral: String,
        reply: oneshot::Sender<Result<(), CentralError>>,
    },
    Disconnect(oneshot::Sender<Result<(), CentralError>>),
    Write {
        characteristic: Uuid,
        bytes: Vec<u8>,
        require_ack: bool,
        reply: oneshot::Sender<Result<u64, CentralError>>,
    },
}

/// Handle to the single-peripheral central session.
#[derive(Clone)]
pub struct Central {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Snapshot>,
    updates: DataChannel,
}

impl Central {
    /// Spawn the state machine onto the current tokio runtime.
    ///
    /// `events` must be the receiver handed out by the same `transport`.
    pub fn spawn<T>(transport: T, events: EventReceiver, config: CentralConfig) -> Self
    where
        T: Transport + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
        let updates = DataChannel::new(config.update_capacity);
        let machine = Machine::new(
            transport,
            events,
            command_rx,
            updates.clone(),
            snapshot_tx,
            config,
        );
        tokio::spawn(machine.run());
        debug!("central session spawned");
        Self {
            commands: command_tx,
            snapshot: snapshot_rx,
            updates,
        }
    }

    /// Begin a fresh scan session. Clears the device list. Fails with
    /// `RadioUnavailable` unless the radio is powered on.
    pub async fn start_scan(&self) -> Result<(), CentralError> {
        self.request(Command::StartScan).await
    }

    /// Cancel the active scan, if any.
    pub async fn stop_scan(&self) -> Result<(), CentralError> {
        self.request(Command::StopScan).await
    }

    /// Connect to a previously discovered peripheral. Any active scan is
    /// stopped first; progress is reported through the status stream.
    pub async fn connect(&self, peripheral: impl Into<String>) -> Result<(), CentralError> {
        let peripheral = peripheral.into();
        self.request(move |reply| Command::Connect { peripheral, reply })
            .await
    }

    /// Tear down the active connection.
    pub async fn disconnect(&self) -> Result<(), CentralError> {
        self.request(Command::Disconnect).await
    }

    /// Fire-and-forget write. Resolves with the assigned sequence number as
    /// soon as the transport accepts the submission.
    pub async fn write(&self, characteristic: Uuid, bytes: Vec<u8>) -> Result<u64, CentralError> {
        self.write_inner(characteristic, bytes, false).await
    }

    /// Acknowledged write. Resolves with the sequence number once the
    /// matching write confirmation arrives from the peripheral.
    pub async fn write_with_ack(
        &self,
        characteristic: Uuid,
        bytes: Vec<u8>,
    ) -> Result<u64, CentralError> {
        self.write_inner(characteristic, bytes, true).await
    }

    /// Latest immutable state snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Change-notification stream of snapshots.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to the data channel of value updates and status changes.
    pub fn updates(&self) -> broadcast::Receiver<Update> {
        self.updates.subscribe()
    }

    async fn request<F>(&self, make: F) -> Result<(), CentralError>
    where
        F: FnOnce(oneshot::Sender<Result<(), CentralError>>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CentralError::Shutdown)?;
        rx.await.map_err(|_| CentralError::Shutdown)?
    }

    async fn write_inner(
        &self,
        characteristic: Uuid,
        bytes: Vec<u8>,
        require_ack: bool,
    ) -> Result<u64, CentralError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Write {
                characteristic,
                bytes,
                require_ack,
                reply: tx,
            })
            .await
            .map_err(|_| CentralError::Shutdown)?;
        rx.await.map_err(|_| CentralError::Shutdown)?
    }
}
