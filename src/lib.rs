//! BLE connectivity workbench library.
//!
//! Scans for peripherals and ranks them by smoothed signal strength,
//! connects to them as a central with a per-device session state machine,
//! acts as a peripheral exposing a configurable GATT server, and measures
//! application-level throughput over a GATT write channel with the
//! speed-check protocol. The platform radio stack is consumed through the
//! traits in [`core::bluetooth::radio`]; a `bluest`-backed central radio is
//! available behind the `bluest-backend` feature and an in-memory mock
//! radio backs the tests.

// Module declarations
pub mod config;
pub mod core;
pub mod error;
pub mod logging;

// Re-export the main entry points
pub use crate::config::{ScanFilter, ServerConfig};
pub use crate::core::bluetooth::{
    ConnectionEvent, ConnectionRegistry, GattServerEvent, GattServerSession, ScanEvent, ScanRanker,
    SpeedCheckRunner, WriteType,
};
pub use crate::error::{
    ConfigError, ConnectError, DisconnectReason, ServerError, SpeedCheckError, WriteError,
};
