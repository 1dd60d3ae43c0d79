//! Constants used throughout the bluetooth core
//! This module contains all the constant values used by the scanner,
//! the connection registry, the GATT server and the speed-check protocol.

use uuid::Uuid;

/// Exponential smoothing factor applied to raw RSSI samples (0.0-1.0)
pub const RSSI_SMOOTHING_ALPHA: f64 = 0.3;

/// Quiet window after the last scan sample before the device list is re-sorted
pub const SORT_DEBOUNCE_MS: u64 = 1_500;

/// Maximum number of connection attempts per connect request
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// Delay between connection attempts in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 100;

/// Fixed speed-check data packet size in bytes
pub const SPEED_CHECK_PACKET_SIZE: usize = 512;

/// First byte of a speed-check control frame
pub const SPEED_CHECK_CONTROL_MAGIC: u8 = 0xFF;

/// Exact length of a speed-check control frame
pub const SPEED_CHECK_CONTROL_LEN: usize = 5;

/// Standard Client Characteristic Configuration descriptor
pub const UUID_CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// The UUID of the fixed speed-check service
pub const UUID_SPEED_CHECK_SERVICE: Uuid =
    Uuid::from_u128(0x0000c0de_8e22_4541_9d4c_21edae82ed19);

/// The UUID of the speed-check data characteristic
pub const UUID_SPEED_CHECK_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x0000da7a_8e22_4541_9d4c_21edae82ed19);

/// Default user-declared service UUID (Battery Service)
pub const UUID_DEFAULT_SERVER_SERVICE: Uuid =
    Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Default user-declared characteristic UUID (Battery Level)
pub const UUID_DEFAULT_SERVER_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
