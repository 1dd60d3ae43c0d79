//! Core functionality for the BLE workbench
//! This module contains the core connectivity and benchmarking logic.

pub mod bluetooth;

// Re-export commonly used types
pub use bluetooth::{ConnectionRegistry, GattServerSession, ScanRanker, SpeedCheckRunner};
