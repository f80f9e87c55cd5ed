//! BleLink - BLE central session management for a single GATT peripheral
//!
//! This crate drives the central side of a BLE link as an event-sourced state
//! machine: scan for peripherals advertising known services, connect, walk
//! service and characteristic discovery, subscribe to notifications, and
//! exchange values. All session state lives in one task; callers interact
//! through the cloneable [`Central`] handle and observe progress via state
//! snapshots and a broadcast data channel.

pub mod central;
pub mod channel;
pub mod config;
pub mod transport;

pub use central::{
    Central, CentralError, DeviceList, DisconnectReason, LinkState, Snapshot,
};
pub use channel::{DataChannel, Update};
pub use config::CentralConfig;
pub use transport::{
    Capabilities, DiscoveredPeripheral, FailureReason, RadioState, Transport, TransportError,
    TransportEvent,
};

#[cfg(feature = "ble")]
pub use transport::btleplug::BtleplugTransport;

use thiserror::Error;
use uuid::Uuid;

/// Error types for BleLink operations
#[derive(Error, Debug)]
pub enum BlelinkError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("session error: {0}")]
    Central(#[from] CentralError),

    #[cfg(feature = "config-file")]
    #[error("configuration error: {0}")]
    Configuration(#[from] config::ConfigFileError),
}

/// Primary service advertised by the target firmware (16-bit ID 0x00FF).
pub const SERVICE_UUID_A: Uuid = Uuid::from_u128(0x0000_00FF_0000_1000_8000_00805F9B34FB);

/// Secondary service advertised by the target firmware (16-bit ID 0x00EE).
pub const SERVICE_UUID_B: Uuid = Uuid::from_u128(0x0000_00EE_0000_1000_8000_00805F9B34FB);

/// Characteristic under [`SERVICE_UUID_A`] (16-bit ID 0xFF01).
pub const CHARACTERISTIC_UUID_A: Uuid = Uuid::from_u128(0x0000_FF01_0000_1000_8000_00805F9B34FB);

/// Characteristic under [`SERVICE_UUID_B`] (16-bit ID 0xEE01).
pub const CHARACTERISTIC_UUID_B: Uuid = Uuid::from_u128(0x0000_EE01_0000_1000_8000_00805F9B34FB);
