pub mod scan_filter;
pub mod server_config;

pub use scan_filter::{parse_hex_bytes, parse_manufacturer_id, ScanFilter};
pub use server_config::ServerConfig;
