//! Error and disconnect-reason taxonomy for the bluetooth core.
//!
//! Everything here is recoverable and travels through explicit result or
//! event channels; nothing in this crate terminates the hosting process.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Disconnect reason codes in the connection-observer code space.
pub const REASON_SUCCESS: i32 = 0;
pub const REASON_TERMINATE_LOCAL_HOST: i32 = 1;
pub const REASON_TERMINATE_PEER_USER: i32 = 2;
pub const REASON_LINK_LOSS: i32 = 3;
pub const REASON_NOT_SUPPORTED: i32 = 4;
pub const REASON_CANCELLED: i32 = 5;
pub const REASON_TIMEOUT: i32 = 10;
pub const REASON_UNKNOWN: i32 = -1;

/// Advertising failure codes, passed through from the platform unchanged.
pub const ADVERTISE_FAILED_DATA_TOO_LARGE: i32 = 1;
pub const ADVERTISE_FAILED_TOO_MANY_ADVERTISERS: i32 = 2;
pub const ADVERTISE_FAILED_ALREADY_STARTED: i32 = 3;
pub const ADVERTISE_FAILED_INTERNAL_ERROR: i32 = 4;
pub const ADVERTISE_FAILED_FEATURE_UNSUPPORTED: i32 = 5;

/// Why a connection ended.
///
/// `from_code` accepts both the observer constants above and the raw HCI
/// status codes some stacks leak through (0x08, 0x13, 0x16). Anything else
/// is carried verbatim in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DisconnectReason {
    Success,
    Timeout,
    LocalHostTerminated,
    PeerUserTerminated,
    NotSupported,
    LinkLoss,
    Cancelled,
    Unknown,
    Other(i32),
}

impl DisconnectReason {
    pub fn from_code(code: i32) -> Self {
        match code {
            REASON_SUCCESS => Self::Success,
            REASON_TERMINATE_LOCAL_HOST | 22 => Self::LocalHostTerminated,
            REASON_TERMINATE_PEER_USER | 19 => Self::PeerUserTerminated,
            REASON_LINK_LOSS | 8 => Self::LinkLoss,
            REASON_NOT_SUPPORTED => Self::NotSupported,
            REASON_CANCELLED => Self::Cancelled,
            REASON_TIMEOUT => Self::Timeout,
            REASON_UNKNOWN => Self::Unknown,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Success => REASON_SUCCESS,
            Self::Timeout => REASON_TIMEOUT,
            Self::LocalHostTerminated => REASON_TERMINATE_LOCAL_HOST,
            Self::PeerUserTerminated => REASON_TERMINATE_PEER_USER,
            Self::NotSupported => REASON_NOT_SUPPORTED,
            Self::LinkLoss => REASON_LINK_LOSS,
            Self::Cancelled => REASON_CANCELLED,
            Self::Unknown => REASON_UNKNOWN,
            Self::Other(code) => *code,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "disconnected"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::LocalHostTerminated => write!(f, "disconnected by local host"),
            Self::PeerUserTerminated => write!(f, "disconnected by remote user"),
            Self::NotSupported => write!(f, "required services not supported"),
            Self::LinkLoss => write!(f, "connection link lost"),
            Self::Cancelled => write!(f, "connection cancelled"),
            Self::Unknown => write!(f, "disconnected for an unknown reason"),
            Self::Other(code) => write!(f, "disconnected (reason {code})"),
        }
    }
}

/// Errors surfaced by a radio backend.
#[derive(Debug, Error)]
pub enum RadioError {
    #[error("no bluetooth adapter available")]
    AdapterUnavailable,
    #[error("bluetooth is disabled")]
    AdapterDisabled,
    #[error("missing runtime permissions")]
    PermissionDenied,
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("no connection found for {0}")]
    NotConnected(String),
    #[error("operation not supported by this backend")]
    NotSupported,
    #[error("{0}")]
    Backend(String),
}

/// Errors returned by connection-registry operations.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("missing runtime permissions")]
    PermissionDenied,
    #[error("invalid device address: {0}")]
    InvalidAddress(String),
    #[error("already connecting or connected to {address}")]
    SessionExists { address: String },
    #[error("no connection found for {address}")]
    NotConnected { address: String },
    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// Errors returned by characteristic writes in the central role.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("no ready connection for {address}")]
    NotReady { address: String },
    #[error("characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },
    #[error(transparent)]
    Radio(#[from] RadioError),
}

/// GATT server errors. `code()` exposes the numeric space reported to
/// observers; advertising failures keep the platform's own code space.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    #[error("unknown error occurred")]
    Unknown,
    #[error("bluetooth not enabled")]
    BluetoothDisabled,
    #[error("BLE advertising not supported on this device")]
    AdvertisingUnsupported,
    #[error("failed to open GATT server")]
    OpenFailed,
    #[error("failed to add GATT service")]
    ServiceAddFailed,
    #[error("permission denied - check bluetooth permissions")]
    PermissionDenied,
    #[error("cannot change settings while server is running")]
    Busy,
    #[error("{}", advertise_failure_message(*code))]
    Advertise { code: i32 },
}

impl ServerError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Unknown => -1,
            Self::BluetoothDisabled => -2,
            Self::AdvertisingUnsupported => -3,
            Self::OpenFailed => -4,
            Self::ServiceAddFailed => -5,
            Self::PermissionDenied => -6,
            Self::Busy => -7,
            Self::Advertise { code } => *code,
        }
    }
}

/// One-line message for a platform advertising failure code, with a
/// numeric fallback for codes we do not recognize.
pub fn advertise_failure_message(code: i32) -> String {
    match code {
        ADVERTISE_FAILED_DATA_TOO_LARGE => "advertisement data too large".to_string(),
        ADVERTISE_FAILED_TOO_MANY_ADVERTISERS => "too many advertisers".to_string(),
        ADVERTISE_FAILED_ALREADY_STARTED => "advertising already started".to_string(),
        ADVERTISE_FAILED_INTERNAL_ERROR => "internal advertising error".to_string(),
        ADVERTISE_FAILED_FEATURE_UNSUPPORTED => "advertising feature not supported".to_string(),
        other => format!("server error (code {other})"),
    }
}

/// Configuration errors, rejected at the boundary before any running
/// state is touched. Each variant names the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid service UUID: {0}")]
    InvalidServiceUuid(String),
    #[error("invalid characteristic UUID at entry {index}: {text}")]
    InvalidCharacteristicUuid { index: usize, text: String },
    #[error("at least one characteristic is required")]
    NoCharacteristics,
    #[error("invalid manufacturer ID: {0}")]
    InvalidManufacturerId(String),
    #[error("invalid manufacturer data: {0}")]
    InvalidManufacturerData(String),
}

/// Errors aborting a speed-check run on the initiator side.
#[derive(Debug, Error)]
pub enum SpeedCheckError {
    #[error("total transfer size must be greater than zero")]
    InvalidSize,
    #[error("failed to send speed check control message")]
    ControlWriteFailed(#[source] WriteError),
    #[error("write failed at packet {index}")]
    WriteFailed {
        index: usize,
        #[source]
        source: WriteError,
    },
}
