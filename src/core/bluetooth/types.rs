//! Defines shared data structures for the bluetooth core.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Characteristic property bits (Bluetooth Core specification values)
pub const PROPERTY_BROADCAST: u32 = 0x01;
pub const PROPERTY_READ: u32 = 0x02;
pub const PROPERTY_WRITE_NO_RESPONSE: u32 = 0x04;
pub const PROPERTY_WRITE: u32 = 0x08;
pub const PROPERTY_NOTIFY: u32 = 0x10;
pub const PROPERTY_INDICATE: u32 = 0x20;
pub const PROPERTY_SIGNED_WRITE: u32 = 0x40;
pub const PROPERTY_EXTENDED_PROPS: u32 = 0x80;

/// Attribute permission bits
pub const PERMISSION_READ: u32 = 0x01;
pub const PERMISSION_WRITE: u32 = 0x10;

/// How a characteristic write is acknowledged by the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteType {
    /// The stack's default write type, acknowledged by the peer
    #[default]
    WithResponse,
    /// Unacknowledged write, faster but lossy under pressure
    WithoutResponse,
}

/// Physical-layer radio mode negotiated for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhyMode {
    Le1M,
    Le2M,
    LeCoded,
}

impl fmt::Display for PhyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Le1M => write!(f, "LE 1M"),
            Self::Le2M => write!(f, "LE 2M"),
            Self::LeCoded => write!(f, "LE Coded"),
        }
    }
}

/// Transmit/receive PHY pair reported by the radio for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhyConfig {
    pub tx: PhyMode,
    pub rx: PhyMode,
}

impl fmt::Display for PhyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tx == self.rx {
            write!(f, "{}", self.tx)
        } else {
            write!(f, "{} / {}", self.tx, self.rx)
        }
    }
}

/// A single advertisement observation delivered by the scanning radio
#[derive(Debug, Clone)]
pub struct ScanSample {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub is_connectable: bool,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_uuids: Vec<Uuid>,
}

/// Represents a discovered bluetooth device
#[derive(Debug, Clone, Serialize)]
pub struct ScannedDevice {
    /// The address of the device (stable identity key)
    pub address: String,
    /// The name of the device, if advertised or previously resolved
    pub name: String,
    /// The latest raw signal strength in dBm
    pub rssi: i16,
    /// Exponentially smoothed signal strength used for ranking
    pub smoothed_rssi: f64,
    /// Whether the advertisement was connectable
    pub is_connectable: bool,
    /// When the device was last observed
    pub last_seen: DateTime<Utc>,
    /// Manufacturer-specific data keyed by manufacturer id
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service UUIDs carried in the advertisement
    pub service_uuids: Vec<Uuid>,
}

/// GATT service type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceType {
    Primary,
    Secondary,
}

/// Read-only snapshot of one characteristic in a remote service table
#[derive(Debug, Clone, Serialize)]
pub struct GattCharacteristicDescriptor {
    pub uuid: Uuid,
    pub properties: u32,
    pub permissions: u32,
}

impl GattCharacteristicDescriptor {
    /// Names of the property bits set on this characteristic
    pub fn property_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.properties & PROPERTY_READ != 0 {
            names.push("READ");
        }
        if self.properties & PROPERTY_WRITE != 0 {
            names.push("WRITE");
        }
        if self.properties & PROPERTY_WRITE_NO_RESPONSE != 0 {
            names.push("WRITE_NO_RESPONSE");
        }
        if self.properties & PROPERTY_NOTIFY != 0 {
            names.push("NOTIFY");
        }
        if self.properties & PROPERTY_INDICATE != 0 {
            names.push("INDICATE");
        }
        if self.properties & PROPERTY_SIGNED_WRITE != 0 {
            names.push("SIGNED_WRITE");
        }
        names
    }
}

/// Read-only snapshot of one remote service, captured when a session
/// becomes ready and immutable for the rest of that session's lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct GattServiceDescriptor {
    pub uuid: Uuid,
    pub service_type: ServiceType,
    pub characteristics: Vec<GattCharacteristicDescriptor>,
}

impl GattServiceDescriptor {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// A remote central currently connected to the local GATT server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectedClient {
    pub address: String,
    pub name: String,
}

/// One characteristic in the local server's declared table
#[derive(Debug, Clone)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: u32,
    pub permissions: u32,
    pub descriptors: Vec<Uuid>,
}

/// One service in the local server's declared table
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub service_type: ServiceType,
    pub characteristics: Vec<CharacteristicDefinition>,
}

/// Advertisement payload and settings handed to the peripheral radio
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub connectable: bool,
    pub include_device_name: bool,
    pub low_latency: bool,
    pub high_tx_power: bool,
    pub service_uuid: Uuid,
    pub manufacturer_id: Option<u16>,
    pub manufacturer_data: Option<Vec<u8>>,
}
