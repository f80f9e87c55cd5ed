//! Single-task connection state machine.
//!
//! All mutation happens on this task: commands from the handle and events
//! from the transport are merged into one loop, so a disconnect racing an
//! in-flight discovery completion is impossible by construction. Completions
//! that arrive after the session has ended are accepted and dropped; they
//! never resurrect a higher state.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{DataChannel, Update};
use crate::config::CentralConfig;
use crate::transport::{
    CharacteristicInfo, EventReceiver, FailureReason, RadioState, ServiceInfo, Transport,
    TransportEvent,
};

use super::state::{
    CharacteristicState, Connection, DeviceList, DisconnectReason, LinkState, ServiceState,
    Snapshot,
};
use super::{CentralError, Command};

/// An acked write waiting for its confirmation.
struct PendingWrite {
    characteristic: Uuid,
    reply: oneshot::Sender<Result<u64, CentralError>>,
}

pub(crate) struct Machine<T: Transport> {
    transport: T,
    events: EventReceiver,
    commands: mpsc::Receiver<Command>,
    updates: DataChannel,
    snapshot_tx: watch::Sender<Snapshot>,
    config: CentralConfig,

    radio: RadioState,
    state: LinkState,
    devices: DeviceList,
    connection: Option<Connection>,
    /// Outstanding per-service characteristic discoveries during fan-out.
    outstanding_discoveries: usize,
    /// Services whose characteristic discovery succeeded in this fan-out.
    discovery_successes: usize,
    /// Deadline for the connecting or discovery phase currently in flight.
    deadline: Option<Instant>,
    next_seq: u64,
    pending_writes: HashMap<u64, PendingWrite>,
}

enum Input {
    Command(Option<Command>),
    Event(Option<TransportEvent>),
    PhaseTimeout,
}

async fn phase_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl<T: Transport> Machine<T> {
    pub(crate) fn new(
        transport: T,
        events: EventReceiver,
        commands: mpsc::Receiver<Command>,
        updates: DataChannel,
        snapshot_tx: watch::Sender<Snapshot>,
        config: CentralConfig,
    ) -> Self {
        let radio = transport.radio_state();
        Self {
            transport,
            events,
            commands,
            updates,
            snapshot_tx,
            config,
            radio,
            state: LinkState::Idle,
            devices: DeviceList::new(),
            connection: None,
            outstanding_discoveries: 0,
            discovery_successes: 0,
            deadline: None,
            next_seq: 0,
            pending_writes: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("state machine running");
        loop {
            let input = tokio::select! {
                cmd = self.commands.recv() => Input::Command(cmd),
                event = self.events.recv() => Input::Event(event),
                _ = phase_timer(self.deadline) => Input::PhaseTimeout,
            };
            match input {
                Input::Command(Some(cmd)) => self.handle_command(cmd).await,
                Input::Command(None) => break, // every handle dropped
                Input::Event(Some(event)) => self.handle_event(event).await,
                Input::Event(None) => {
                    warn!("transport event stream closed");
                    if !matches!(self.state, LinkState::Idle | LinkState::Disconnected(_)) {
                        self.enter_disconnected(DisconnectReason::RadioUnavailable);
                    }
                    break;
                }
                Input::PhaseTimeout => self.on_phase_timeout().await,
            }
        }
        debug!("state machine stopped");
    }

    // ---- commands -------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::StartScan(reply) => {
                let _ = reply.send(self.start_scan().await);
            }
            Command::StopScan(reply) => {
                let _ = reply.send(self.stop_scan().await);
            }
            Command::Connect { peripheral, reply } => {
                let _ = reply.send(self.connect(peripheral).await);
            }
            Command::Disconnect(reply) => {
                let _ = reply.send(self.disconnect().await);
            }
            Command::Write {
                characteristic,
                bytes,
                require_ack,
                reply,
            } => self.submit_write(characteristic, bytes, require_ack, reply).await,
        }
    }

    async fn start_scan(&mut self) -> Result<(), CentralError> {
        if !self.state.accepts_session_start() {
            return Err(CentralError::InvalidState(self.state.to_string()));
        }
        if !self.radio.is_powered_on() {
            return Err(CentralError::RadioUnavailable);
        }
        self.transport
            .start_scan(&self.config.scan_services)
            .await
            .map_err(|e| CentralError::ScanFailed(e.to_string()))?;
        // The device list is cleared only here, on a fresh scan start. Pushed
        // explicitly because a rescan does not change the link state.
        self.devices.clear();
        self.push_snapshot();
        info!(filters = ?self.config.scan_services, "scan started");
        self.set_state(LinkState::Scanning);
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), CentralError> {
        if !matches!(self.state, LinkState::Scanning) {
            return Ok(());
        }
        self.transport
            .stop_scan()
            .await
            .map_err(|e| CentralError::ScanFailed(e.to_string()))?;
        info!("scan stopped");
        self.set_state(LinkState::Idle);
        Ok(())
    }

    async fn connect(&mut self, peripheral: String) -> Result<(), CentralError> {
        if !self.state.accepts_session_start() {
            return Err(CentralError::InvalidState(self.state.to_string()));
        }
        if !self.radio.is_powered_on() {
            return Err(CentralError::RadioUnavailable);
        }
        let Some(entry) = self.devices.get(&peripheral).cloned() else {
            return Err(CentralError::UnknownPeripheral(peripheral));
        };
        // Scanning and connecting contend for the radio; cancel the scan first.
        if matches!(self.state, LinkState::Scanning) {
            if let Err(e) = self.transport.stop_scan().await {
                debug!(error = %e, "scan stop before connect failed");
            }
        }
        self.transport
            .connect(&entry.id)
            .await
            .map_err(|e| CentralError::ConnectFailed(FailureReason::Backend(e.to_string())))?;
        info!(peripheral = %entry.label(), "connecting");
        self.connection = Some(Connection::new(entry));
        self.deadline = Some(Instant::now() + self.config.connect_timeout());
        self.set_state(LinkState::Connecting);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), CentralError> {
        let Some(conn) = self.connection.as_ref() else {
            return Err(CentralError::NotConnected);
        };
        let id = conn.peripheral.id.clone();
        self.deadline = None;
        self.transport.disconnect(&id).await?;
        info!(peripheral = %id, "disconnecting");
        self.set_state(LinkState::Disconnecting);
        Ok(())
    }

    async fn submit_write(
        &mut self,
        characteristic: Uuid,
        bytes: Vec<u8>,
        require_ack: bool,
        reply: oneshot::Sender<Result<u64, CentralError>>,
    ) {
        let peripheral = match self.validate_write(characteristic) {
            Ok(id) => id,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Err(e) = self
            .transport
            .write_value(&peripheral, characteristic, &bytes, require_ack, seq)
            .await
        {
            let _ = reply.send(Err(CentralError::WriteFailed {
                characteristic,
                reason: FailureReason::Backend(e.to_string()),
            }));
            return;
        }
        debug!(%characteristic, seq, require_ack, len = bytes.len(), "write submitted");
        if require_ack {
            self.pending_writes.insert(
                seq,
                PendingWrite {
                    characteristic,
                    reply,
                },
            );
        } else {
            let _ = reply.send(Ok(seq));
        }
    }

    /// Writes never reach the transport unless the session is in a writable
    /// state and the target characteristic is known to be writable.
    fn validate_write(&self, characteristic: Uuid) -> Result<String, CentralError> {
        if !self.state.allows_write() {
            return Err(CentralError::NotConnected);
        }
        let conn = self.connection.as_ref().ok_or(CentralError::NotConnected)?;
        match conn.characteristic(characteristic) {
            Some(chr) if chr.capabilities.write => Ok(conn.peripheral.id.clone()),
            _ => Err(CentralError::NotWritable(characteristic)),
        }
    }

    // ---- transport events -----------------------------------------------

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::RadioStateChanged(radio) => self.on_radio_state(radio),
            TransportEvent::PeripheralDiscovered(peripheral) => self.on_discovered(peripheral),
            TransportEvent::Connected { peripheral } => self.on_connected(&peripheral).await,
            TransportEvent::ConnectFailed { peripheral, reason } => {
                self.on_connect_failed(&peripheral, reason)
            }
            TransportEvent::Disconnected { peripheral } => {
                self.on_peripheral_disconnected(&peripheral)
            }
            TransportEvent::ServicesDiscovered {
                peripheral,
                services,
            } => self.on_services_discovered(&peripheral, services).await,
            TransportEvent::ServiceDiscoveryFailed { peripheral, reason } => {
                self.on_service_discovery_failed(&peripheral, reason).await
            }
            TransportEvent::CharacteristicsDiscovered {
                peripheral,
                service,
                characteristics,
            } => {
                self.on_characteristics_discovered(&peripheral, service, characteristics)
                    .await
            }
            TransportEvent::CharacteristicDiscoveryFailed {
                peripheral,
                service,
                reason,
            } => {
                self.on_characteristic_discovery_failed(&peripheral, service, reason)
                    .await
            }
            TransportEvent::NotifyStateChanged {
                peripheral,
                characteristic,
                enabled,
            } => self.on_notify_state(&peripheral, characteristic, enabled),
            TransportEvent::NotifySetupFailed {
                peripheral,
                characteristic,
                reason,
            } => self.on_characteristic_unusable(&peripheral, characteristic, "notify setup", reason),
            TransportEvent::ValueUpdated {
                peripheral,
                characteristic,
                value,
            } => self.on_value_updated(&peripheral, characteristic, value),
            TransportEvent::ReadFailed {
                peripheral,
                characteristic,
                reason,
            } => self.on_characteristic_unusable(&peripheral, characteristic, "read", reason),
            TransportEvent::WriteResult {
                peripheral: _,
                characteristic,
                seq,
                result,
            } => self.on_write_result(characteristic, seq, result),
        }
    }

    fn on_radio_state(&mut self, radio: RadioState) {
        if radio == self.radio {
            return;
        }
        info!(?radio, "radio state changed");
        self.radio = radio;
        if !radio.is_powered_on()
            && !matches!(self.state, LinkState::Idle | LinkState::Disconnected(_))
        {
            // Radio loss overrides every in-flight operation.
            self.enter_disconnected(DisconnectReason::RadioUnavailable);
        }
    }

    fn on_discovered(&mut self, peripheral: crate::transport::DiscoveredPeripheral) {
        if !matches!(self.state, LinkState::Scanning) {
            debug!(id = %peripheral.id, "discovery event outside scan session dropped");
            return;
        }
        if self.devices.upsert(peripheral.clone()) {
            info!(id = %peripheral.id, name = ?peripheral.name, rssi = ?peripheral.rssi, "peripheral discovered");
            self.updates.publish(Update::DeviceDiscovered(peripheral));
        }
        self.push_snapshot();
    }

    async fn on_connected(&mut self, peripheral: &str) {
        if !self.is_active(peripheral) || !matches!(self.state, LinkState::Connecting) {
            return;
        }
        info!(peripheral, "connected");
        self.set_state(LinkState::Connected);
        // Discovery is automatic on connect, not a separate user intent.
        self.deadline = Some(Instant::now() + self.config.discovery_timeout());
        self.set_state(LinkState::DiscoveringServices);
        if let Err(e) = self
            .transport
            .discover_services(peripheral, &self.config.scan_services)
            .await
        {
            warn!(error = %e, "service discovery could not be started");
            self.best_effort_disconnect(peripheral).await;
            self.enter_disconnected(DisconnectReason::DiscoveryFailed);
        }
    }

    fn on_connect_failed(&mut self, peripheral: &str, reason: FailureReason) {
        if !self.is_active(peripheral) || !matches!(self.state, LinkState::Connecting) {
            return;
        }
        warn!(peripheral, %reason, "connect failed");
        let reason = match reason {
            FailureReason::Timeout => DisconnectReason::Timeout,
            other => DisconnectReason::ConnectFailed(other),
        };
        self.enter_disconnected(reason);
    }

    fn on_peripheral_disconnected(&mut self, peripheral: &str) {
        if !self.is_active(peripheral) {
            return;
        }
        let reason = if matches!(self.state, LinkState::Disconnecting) {
            DisconnectReason::UserRequested
        } else {
            DisconnectReason::PeripheralDropped
        };
        self.enter_disconnected(reason);
    }

    async fn on_services_discovered(&mut self, peripheral: &str, services: Vec<ServiceInfo>) {
        if !self.is_active(peripheral) || !matches!(self.state, LinkState::DiscoveringServices) {
            return;
        }
        if services.is_empty() {
            warn!(peripheral, "peripheral exposes none of the requested services");
            self.best_effort_disconnect(peripheral).await;
            self.enter_disconnected(DisconnectReason::DiscoveryFailed);
            return;
        }
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        for service in &services {
            conn.services
                .insert(service.uuid, ServiceState::new(service.uuid));
        }
        info!(peripheral, count = services.len(), "services discovered");
        // Fan out one characteristic discovery per service; the state only
        // advances once all of them have completed.
        self.outstanding_discoveries = services.len();
        self.discovery_successes = 0;
        self.deadline = Some(Instant::now() + self.config.discovery_timeout());
        self.set_state(LinkState::DiscoveringCharacteristics);
        let mut rejected = Vec::new();
        for service in services {
            if let Err(e) = self
                .transport
                .discover_characteristics(peripheral, service.uuid)
                .await
            {
                rejected.push((service.uuid, e.to_string()));
            }
        }
        for (service, error) in rejected {
            self.on_characteristic_discovery_failed(
                peripheral,
                service,
                FailureReason::Backend(error),
            )
            .await;
        }
    }

    async fn on_service_discovery_failed(&mut self, peripheral: &str, reason: FailureReason) {
        if !self.is_active(peripheral) || !matches!(self.state, LinkState::DiscoveringServices) {
            return;
        }
        warn!(peripheral, %reason, "service discovery failed");
        self.best_effort_disconnect(peripheral).await;
        self.enter_disconnected(DisconnectReason::DiscoveryFailed);
    }

    async fn on_characteristics_discovered(
        &mut self,
        peripheral: &str,
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    ) {
        if !self.is_active(peripheral)
            || !matches!(self.state, LinkState::DiscoveringCharacteristics)
        {
            return;
        }
        let Some(svc) = self
            .connection
            .as_mut()
            .and_then(|c| c.services.get_mut(&service))
        else {
            debug!(%service, "characteristics for unknown service dropped");
            return;
        };
        debug!(%service, count = characteristics.len(), "characteristics discovered");
        for info in characteristics {
            svc.characteristics
                .insert(info.uuid, CharacteristicState::new(info));
        }
        self.discovery_successes += 1;
        self.complete_discovery_step(peripheral).await;
    }

    async fn on_characteristic_discovery_failed(
        &mut self,
        peripheral: &str,
        service: Uuid,
        reason: FailureReason,
    ) {
        if !self.is_active(peripheral)
            || !matches!(self.state, LinkState::DiscoveringCharacteristics)
        {
            return;
        }
        // Non-fatal: the failing service is marked unusable, the rest proceed.
        warn!(%service, %reason, "characteristic discovery failed, marking service unusable");
        if let Some(svc) = self
            .connection
            .as_mut()
            .and_then(|c| c.services.get_mut(&service))
        {
            svc.usable = false;
        }
        self.complete_discovery_step(peripheral).await;
    }

    async fn complete_discovery_step(&mut self, peripheral: &str) {
        self.outstanding_discoveries = self.outstanding_discoveries.saturating_sub(1);
        if self.outstanding_discoveries > 0 {
            self.push_snapshot();
            return;
        }
        self.deadline = None;
        if self.discovery_successes == 0 {
            warn!(peripheral, "characteristic discovery failed for every service");
            self.best_effort_disconnect(peripheral).await;
            self.enter_disconnected(DisconnectReason::DiscoveryFailed);
        } else {
            self.enter_ready(peripheral).await;
        }
    }

    /// On entering Ready, subscribe every notify-capable characteristic and
    /// fire one read for read-only ones. Individual failures are logged and
    /// never block readiness.
    async fn enter_ready(&mut self, peripheral: &str) {
        self.set_state(LinkState::Ready);
        let mut to_notify = Vec::new();
        let mut to_read = Vec::new();
        if let Some(conn) = self.connection.as_ref() {
            for svc in conn.services.values().filter(|s| s.usable) {
                for chr in svc.characteristics.values() {
                    if chr.capabilities.notify {
                        to_notify.push(chr.uuid);
                    } else if chr.capabilities.read {
                        to_read.push(chr.uuid);
                    }
                }
            }
        }
        for characteristic in to_notify {
            if let Err(e) = self
                .transport
                .set_notify(peripheral, characteristic, true)
                .await
            {
                warn!(%characteristic, error = %e, "notify setup rejected");
                self.mark_unusable(characteristic);
            }
        }
        for characteristic in to_read {
            if let Err(e) = self.transport.read_value(peripheral, characteristic).await {
                warn!(%characteristic, error = %e, "initial read rejected");
            }
        }
        self.push_snapshot();
    }

    fn on_notify_state(&mut self, peripheral: &str, characteristic: Uuid, enabled: bool) {
        if !self.is_active(peripheral) {
            return;
        }
        if let Some(chr) = self
            .connection
            .as_mut()
            .and_then(|c| c.characteristic_mut(characteristic))
        {
            chr.subscribed = enabled && chr.capabilities.notify;
            debug!(%characteristic, enabled, "notify state changed");
        }
        self.push_snapshot();
    }

    fn on_characteristic_unusable(
        &mut self,
        peripheral: &str,
        characteristic: Uuid,
        what: &str,
        reason: FailureReason,
    ) {
        if !self.is_active(peripheral) {
            return;
        }
        warn!(%characteristic, %reason, "{what} failed, marking characteristic unusable");
        self.mark_unusable(characteristic);
        self.push_snapshot();
    }

    fn on_value_updated(&mut self, peripheral: &str, characteristic: Uuid, value: Vec<u8>) {
        if !self.is_active(peripheral) {
            debug!(%characteristic, "stale value update dropped");
            return;
        }
        let Some(chr) = self
            .connection
            .as_mut()
            .and_then(|c| c.characteristic_mut(characteristic))
        else {
            debug!(%characteristic, "value update for untracked characteristic dropped");
            return;
        };
        chr.last_value = Some(value.clone());
        self.updates.publish(Update::Value {
            characteristic,
            value,
        });
        self.push_snapshot();
    }

    fn on_write_result(
        &mut self,
        characteristic: Uuid,
        seq: u64,
        result: Result<(), FailureReason>,
    ) {
        // Correlated purely by sequence number; confirmations arriving during
        // teardown still resolve their callers instead of leaving them hung.
        if let Some(pending) = self.pending_writes.remove(&seq) {
            let reply = match &result {
                Ok(()) => Ok(seq),
                Err(reason) => Err(CentralError::WriteFailed {
                    characteristic,
                    reason: reason.clone(),
                }),
            };
            let _ = pending.reply.send(reply);
        }
        // Completions for a session that has already ended are not published;
        // their callers were resolved when the connection went away.
        if self.connection.is_none() {
            debug!(%characteristic, seq, "stale write completion dropped");
            return;
        }
        self.updates.publish(Update::WriteCompleted {
            characteristic,
            seq,
            result,
        });
    }

    async fn on_phase_timeout(&mut self) {
        self.deadline = None;
        warn!(state = %self.state, "phase deadline expired");
        if let Some(id) = self.connection.as_ref().map(|c| c.peripheral.id.clone()) {
            self.best_effort_disconnect(&id).await;
        }
        self.enter_disconnected(DisconnectReason::Timeout);
    }

    // ---- shared transitions ----------------------------------------------

    /// Take a failed characteristic out of rotation. It stops accepting
    /// writes, drops out of snapshots, and further events for it are ignored;
    /// the rest of the session is unaffected.
    fn mark_unusable(&mut self, characteristic: Uuid) {
        if let Some(conn) = self.connection.as_mut() {
            for svc in conn.services.values_mut() {
                if let Some(chr) = svc.characteristics.get_mut(&characteristic) {
                    chr.usable = false;
                    chr.subscribed = false;
                }
            }
        }
    }

    /// Events for a peripheral other than the active connection, or arriving
    /// after the session ended, are dropped.
    fn is_active(&self, peripheral: &str) -> bool {
        if matches!(self.state, LinkState::Disconnected(_)) {
            debug!(peripheral, "event after disconnect dropped");
            return false;
        }
        match self.connection.as_ref() {
            Some(conn) if conn.peripheral.id == peripheral => true,
            _ => {
                debug!(peripheral, "event for inactive peripheral dropped");
                false
            }
        }
    }

    fn enter_disconnected(&mut self, reason: DisconnectReason) {
        self.deadline = None;
        self.outstanding_discoveries = 0;
        self.discovery_successes = 0;
        self.connection = None;
        self.fail_pending_writes();
        self.set_state(LinkState::Disconnected(reason));
    }

    fn fail_pending_writes(&mut self) {
        for (_, pending) in self.pending_writes.drain() {
            let _ = pending.reply.send(Err(CentralError::WriteFailed {
                characteristic: pending.characteristic,
                reason: FailureReason::PeripheralGone,
            }));
        }
    }

    async fn best_effort_disconnect(&self, peripheral: &str) {
        if let Err(e) = self.transport.disconnect(peripheral).await {
            debug!(peripheral, error = %e, "cleanup disconnect failed");
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state == state {
            return;
        }
        info!(from = %self.state, to = %state, "state transition");
        self.state = state;
        let snapshot = self.make_snapshot();
        self.updates.publish(Update::Status {
            state: self.state.clone(),
            message: snapshot.status.clone(),
        });
        let _ = self.snapshot_tx.send(snapshot);
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(self.make_snapshot());
    }

    fn make_snapshot(&self) -> Snapshot {
        let mut characteristics: Vec<CharacteristicState> = self
            .connection
            .as_ref()
            .map(|conn| {
                conn.services
                    .values()
                    .filter(|s| s.usable)
                    .flat_map(|s| s.characteristics.values().filter(|c| c.usable).cloned())
                    .collect()
            })
            .unwrap_or_default();
        characteristics.sort_by_key(|c| c.uuid);
        let status = match (&self.state, self.connection.as_ref()) {
            (state, Some(conn)) if state.has_connection() => {
                format!("{} ({})", state, conn.peripheral.label())
            }
            (state, _) => state.to_string(),
        };
        Snapshot {
            state: self.state.clone(),
            status,
            devices: self.devices.as_slice().to_vec(),
            characteristics,
        }
    }
}
