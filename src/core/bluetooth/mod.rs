//! Bluetooth functionality for the BLE workbench.
//! This module holds the whole connectivity core: discovery ranking,
//! central-role connection sessions, the peripheral-role GATT server and
//! the speed-check benchmark protocol.

#[cfg(feature = "bluest-backend")]
pub mod backend;
pub mod connection;
pub mod constants;
pub mod mock;
pub mod radio;
pub mod scanner;
pub mod server;
pub mod smoothing;
pub mod speedcheck;
pub mod types;

// Re-export types that should be publicly accessible
#[cfg(feature = "bluest-backend")]
pub use backend::BluestCentralRadio;
pub use connection::{
    ConnectionEvent, ConnectionRegistry, ConnectionSession, ConnectionSnapshot, ConnectionState,
};
pub use constants::*; // Re-export all constants
pub use mock::MockRadio;
pub use radio::{CentralRadio, LinkEvent, PeripheralRadio, ScanUpdate, ServerEvent};
pub use scanner::{ScanEvent, ScanRanker};
pub use server::{ClientSession, GattServerEvent, GattServerSession};
pub use smoothing::RssiSmoother;
pub use speedcheck::{
    ServerSpeedCheckState, SpeedCheckAccumulator, SpeedCheckRunner, SpeedCheckState,
};
pub use types::{ConnectedClient, ScannedDevice, WriteType};
