//! Scan filter parsing and matching.
//!
//! User-typed filter fields are validated here, at the boundary, before
//! they reach any running state. Manufacturer ids are hex text with an
//! optional `0x` prefix; manufacturer data is hex byte pairs, either
//! space-separated or concatenated.

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::types::ScanSample;
use crate::error::ConfigError;

/// Optional constraints applied to scan results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFilter {
    pub service_uuid: Option<Uuid>,
    pub manufacturer_id: Option<u16>,
    #[serde(default)]
    pub manufacturer_data: Vec<u8>,
}

impl ScanFilter {
    /// Build a filter from user-typed text fields. Empty fields are
    /// unconstrained; manufacturer data requires a manufacturer id.
    pub fn parse(
        service_uuid: &str,
        manufacturer_id: &str,
        manufacturer_data: &str,
    ) -> Result<Self, ConfigError> {
        let mut filter = Self::default();

        let service_uuid = service_uuid.trim();
        if !service_uuid.is_empty() {
            filter.service_uuid = Some(
                Uuid::parse_str(service_uuid)
                    .map_err(|_| ConfigError::InvalidServiceUuid(service_uuid.to_string()))?,
            );
        }

        let id_text = manufacturer_id.trim();
        let data_text = manufacturer_data.trim();
        if !id_text.is_empty() || !data_text.is_empty() {
            if id_text.is_empty() {
                return Err(ConfigError::InvalidManufacturerId(
                    "required when manufacturer data is set".to_string(),
                ));
            }
            filter.manufacturer_id = Some(parse_manufacturer_id(id_text)?);
            if !data_text.is_empty() {
                filter.manufacturer_data = parse_hex_bytes(data_text)?;
            }
        }

        debug!("scan filter: {filter:?}");
        Ok(filter)
    }

    /// Whether a scan sample passes this filter. Manufacturer data is a
    /// prefix match against the payload advertised under the id.
    pub fn matches(&self, sample: &ScanSample) -> bool {
        if let Some(uuid) = self.service_uuid {
            if !sample.service_uuids.contains(&uuid) {
                return false;
            }
        }
        if let Some(id) = self.manufacturer_id {
            match sample.manufacturer_data.get(&id) {
                Some(data) if data.starts_with(&self.manufacturer_data) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Parse a 16-bit manufacturer id from hex text ("0x004C" or "004C").
pub fn parse_manufacturer_id(input: &str) -> Result<u16, ConfigError> {
    let trimmed = input.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex.is_empty() {
        return Err(ConfigError::InvalidManufacturerId("empty".to_string()));
    }
    let value = u32::from_str_radix(hex, 16)
        .map_err(|_| ConfigError::InvalidManufacturerId(trimmed.to_string()))?;
    if value > 0xFFFF {
        return Err(ConfigError::InvalidManufacturerId(
            "must be 0x0000-0xFFFF".to_string(),
        ));
    }
    Ok(value as u16)
}

/// Parse hex bytes from "01 02 03" or "010203".
pub fn parse_hex_bytes(input: &str) -> Result<Vec<u8>, ConfigError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let pieces: Vec<String> = if trimmed.contains(char::is_whitespace) {
        Regex::new(r"\s+")
            .unwrap()
            .split(trimmed)
            .filter(|piece| !piece.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        trimmed
            .as_bytes()
            .chunks(2)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect()
    };

    let mut data = Vec::with_capacity(pieces.len());
    for piece in pieces {
        if piece.len() != 2 {
            return Err(ConfigError::InvalidManufacturerData(format!(
                "invalid hex byte length: {piece}"
            )));
        }
        let byte = u8::from_str_radix(&piece, 16).map_err(|_| {
            ConfigError::InvalidManufacturerData(format!("invalid hex byte: {piece}"))
        })?;
        data.push(byte);
    }
    Ok(data)
}
