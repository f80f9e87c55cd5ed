//! Scripted transport for tests and demos.
//!
//! Stands in for a platform BLE stack: every submitted operation is recorded,
//! and the driving side injects whatever [`TransportEvent`]s the scenario
//! calls for through the [`MockHandle`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{EventReceiver, RadioState, Transport, TransportError, TransportEvent};

/// One operation submitted to the mock, in submission order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    StartScan {
        filters: Vec<Uuid>,
    },
    StopScan,
    Connect {
        peripheral: String,
    },
    Disconnect {
        peripheral: String,
    },
    DiscoverServices {
        peripheral: String,
        filters: Vec<Uuid>,
    },
    DiscoverCharacteristics {
        peripheral: String,
        service: Uuid,
    },
    SetNotify {
        peripheral: String,
        characteristic: Uuid,
        enabled: bool,
    },
    ReadValue {
        peripheral: String,
        characteristic: Uuid,
    },
    WriteValue {
        peripheral: String,
        characteristic: Uuid,
        bytes: Vec<u8>,
        require_ack: bool,
        seq: u64,
    },
}

pub struct MockTransport {
    calls: Arc<Mutex<Vec<MockCall>>>,
    radio: Arc<Mutex<RadioState>>,
}

/// Driver-side handle: inject events and inspect recorded calls.
#[derive(Clone)]
pub struct MockHandle {
    events: mpsc::UnboundedSender<TransportEvent>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    radio: Arc<Mutex<RadioState>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let radio = Arc::new(Mutex::new(RadioState::Unknown));
        (
            Self {
                calls: Arc::clone(&calls),
                radio: Arc::clone(&radio),
            },
            MockHandle {
                events,
                calls,
                radio,
            },
            receiver,
        )
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().expect("mock call log poisoned").push(call);
    }
}

impl MockHandle {
    /// Inject an event, as the platform stack would.
    pub fn emit(&self, event: TransportEvent) {
        if let TransportEvent::RadioStateChanged(state) = &event {
            *self.radio.lock().expect("mock radio state poisoned") = *state;
        }
        let _ = self.events.send(event);
    }

    pub fn power_on(&self) {
        self.emit(TransportEvent::RadioStateChanged(RadioState::PoweredOn));
    }

    /// Recorded operations in submission order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().expect("mock call log poisoned").clone()
    }

    /// Drain the recorded operations.
    pub fn take_calls(&self) -> Vec<MockCall> {
        std::mem::take(&mut *self.calls.lock().expect("mock call log poisoned"))
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn radio_state(&self) -> RadioState {
        *self.radio.lock().expect("mock radio state poisoned")
    }

    async fn start_scan(&self, service_filters: &[Uuid]) -> Result<(), TransportError> {
        self.record(MockCall::StartScan {
            filters: service_filters.to_vec(),
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(MockCall::StopScan);
        Ok(())
    }

    async fn connect(&self, peripheral: &str) -> Result<(), TransportError> {
        self.record(MockCall::Connect {
            peripheral: peripheral.to_string(),
        });
        Ok(())
    }

    async fn disconnect(&self, peripheral: &str) -> Result<(), TransportError> {
        self.record(MockCall::Disconnect {
            peripheral: peripheral.to_string(),
        });
        Ok(())
    }

    async fn discover_services(
        &self,
        peripheral: &str,
        filters: &[Uuid],
    ) -> Result<(), TransportError> {
        self.record(MockCall::DiscoverServices {
            peripheral: peripheral.to_string(),
            filters: filters.to_vec(),
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &str,
        service: Uuid,
    ) -> Result<(), TransportError> {
        self.record(MockCall::DiscoverCharacteristics {
            peripheral: peripheral.to_string(),
            service,
        });
        Ok(())
    }

    async fn set_notify(
        &self,
        peripheral: &str,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.record(MockCall::SetNotify {
            peripheral: peripheral.to_string(),
            characteristic,
            enabled,
        });
        Ok(())
    }

    async fn read_value(
        &self,
        peripheral: &str,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.record(MockCall::ReadValue {
            peripheral: peripheral.to_string(),
            characteristic,
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
        self.record(MockCall::WriteValue {
            peripheral: peripheral.to_string(),
            characteristic,
            bytes: bytes.to_vec(),
            require_ack,
            seq,
        });
        Ok(())
    }
}
