//! Radio stack interface for the bluetooth core.
//!
//! The platform BLE stack is an external collaborator: these traits are the
//! whole surface the core consumes. Backends deliver per-link and per-server
//! events through mpsc channels, one logical event stream per device, which
//! is what lets each session serialize its own state transitions without
//! sharing locks across devices.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ScanFilter;
use crate::core::bluetooth::types::{
    Advertisement, GattServiceDescriptor, PhyConfig, ScanSample, ServiceDefinition, WriteType,
};
use crate::error::{RadioError, ServerError};

/// Events delivered on one central-role link, in order.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The link is established; service discovery is still pending.
    Connected,
    /// Service discovery finished and the link is usable. Carries the
    /// discovered service table for the session to snapshot.
    Ready { services: Vec<GattServiceDescriptor> },
    /// Link setup failed before the connection was established.
    FailedToConnect { reason: i32 },
    /// The link ended; `reason` is a platform disconnect code.
    Disconnected { reason: i32 },
}

/// Items delivered on a scan stream.
#[derive(Debug, Clone)]
pub enum ScanUpdate {
    Sample(ScanSample),
    Failed { code: i32 },
}

/// Events delivered by an open GATT server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The server finished registering its service table and is advertising.
    Ready,
    ClientConnected {
        address: String,
        name: Option<String>,
    },
    ClientDisconnected {
        address: String,
    },
    /// An incoming characteristic write, tagged with its origin.
    Write {
        address: String,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// Advertising failed with a platform failure code.
    AdvertiseFailed {
        code: i32,
    },
}

/// Central-role primitives: scan, connect, discover, write.
#[async_trait]
pub trait CentralRadio: Send + Sync {
    /// Whether the runtime permissions required for BLE are granted.
    fn has_all_permissions(&self) -> bool;

    /// Start scanning. The stream ends when the backend stops delivering
    /// results; callers cancel by dropping the receiver.
    async fn scan(&self, filter: &ScanFilter) -> Result<mpsc::Receiver<ScanUpdate>, RadioError>;

    /// Issue a single connection attempt (no background auto-connect).
    /// Retry policy is the caller's responsibility.
    async fn connect(&self, address: &str) -> Result<mpsc::Receiver<LinkEvent>, RadioError>;

    /// Request disconnection; confirmation arrives as a `LinkEvent`.
    async fn disconnect(&self, address: &str) -> Result<(), RadioError>;

    /// Resolve the display name of a device, if accessible.
    async fn device_name(&self, address: &str) -> Option<String>;

    /// Read the negotiated PHY for an established link.
    async fn read_phy(&self, address: &str) -> Result<PhyConfig, RadioError>;

    /// Write a characteristic value. Resolves only once the underlying
    /// write operation has completed or failed; callers rely on this for
    /// strict packet ordering.
    async fn write_characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError>;
}

/// Peripheral-role primitives: host a GATT server and advertise.
#[async_trait]
pub trait PeripheralRadio: Send + Sync {
    /// Whether the runtime permissions required for BLE are granted.
    fn has_all_permissions(&self) -> bool;

    /// Register the service table, open the server and start advertising.
    /// Fails fast with a distinct `ServerError` per cause.
    async fn open_server(
        &self,
        services: &[ServiceDefinition],
        advertisement: &Advertisement,
    ) -> Result<mpsc::Receiver<ServerEvent>, ServerError>;

    /// Stop advertising and close the server. Idempotent.
    async fn close_server(&self);
}
