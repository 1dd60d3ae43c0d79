//! GATT server declaration.
//!
//! The server table is validated from user-typed text before it touches a
//! running server: one primary service with at least one characteristic,
//! plus the always-on speed-check service unless explicitly disabled.
//! Every declared characteristic is created with read, write and notify
//! properties and a standard notification-configuration descriptor.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::scan_filter::{parse_hex_bytes, parse_manufacturer_id};
use crate::core::bluetooth::constants::{
    UUID_CLIENT_CHARACTERISTIC_CONFIG, UUID_DEFAULT_SERVER_CHARACTERISTIC,
    UUID_DEFAULT_SERVER_SERVICE, UUID_SPEED_CHECK_CHARACTERISTIC, UUID_SPEED_CHECK_SERVICE,
};
use crate::core::bluetooth::types::{
    Advertisement, CharacteristicDefinition, ServiceDefinition, ServiceType, PERMISSION_READ,
    PERMISSION_WRITE, PROPERTY_NOTIFY, PROPERTY_READ, PROPERTY_WRITE,
};
use crate::error::ConfigError;

/// Peripheral-role server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuids: Vec<Uuid>,
    pub manufacturer_id: Option<u16>,
    pub manufacturer_data: Option<Vec<u8>>,
    pub speed_check_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service_uuid: UUID_DEFAULT_SERVER_SERVICE,
            characteristic_uuids: vec![UUID_DEFAULT_SERVER_CHARACTERISTIC],
            manufacturer_id: None,
            manufacturer_data: None,
            speed_check_enabled: true,
        }
    }
}

impl ServerConfig {
    /// Validate user-typed declaration fields. Errors name the offending
    /// field; characteristic entries are reported by position (1-based).
    pub fn parse(
        service_uuid: &str,
        characteristic_uuids: &[String],
        manufacturer_id: &str,
        manufacturer_data: &str,
        speed_check_enabled: bool,
    ) -> Result<Self, ConfigError> {
        let service_uuid = service_uuid.trim();
        let service_uuid = Uuid::parse_str(service_uuid)
            .map_err(|_| ConfigError::InvalidServiceUuid(service_uuid.to_string()))?;

        if characteristic_uuids.is_empty() {
            return Err(ConfigError::NoCharacteristics);
        }
        let mut parsed = Vec::with_capacity(characteristic_uuids.len());
        for (index, text) in characteristic_uuids.iter().enumerate() {
            let text = text.trim();
            let uuid = Uuid::parse_str(text).map_err(|_| ConfigError::InvalidCharacteristicUuid {
                index: index + 1,
                text: text.to_string(),
            })?;
            parsed.push(uuid);
        }

        let id_text = manufacturer_id.trim();
        let data_text = manufacturer_data.trim();
        let (manufacturer_id, manufacturer_data) = match (id_text.is_empty(), data_text.is_empty())
        {
            (true, true) => (None, None),
            (true, false) => {
                return Err(ConfigError::InvalidManufacturerId(
                    "required when manufacturer data is set".to_string(),
                ));
            }
            (false, true) => {
                return Err(ConfigError::InvalidManufacturerData(
                    "required when manufacturer ID is set".to_string(),
                ));
            }
            (false, false) => (
                Some(parse_manufacturer_id(id_text)?),
                Some(parse_hex_bytes(data_text)?),
            ),
        };

        Ok(Self {
            service_uuid,
            characteristic_uuids: parsed,
            manufacturer_id,
            manufacturer_data,
            speed_check_enabled,
        })
    }

    /// The full service table the server registers: the user-declared
    /// service plus the fixed speed-check service unless disabled.
    pub fn build_service_table(&self) -> Vec<ServiceDefinition> {
        let mut services = vec![Self::service(self.service_uuid, &self.characteristic_uuids)];
        if self.speed_check_enabled {
            services.push(Self::service(
                UUID_SPEED_CHECK_SERVICE,
                &[UUID_SPEED_CHECK_CHARACTERISTIC],
            ));
        }
        services
    }

    fn service(uuid: Uuid, characteristic_uuids: &[Uuid]) -> ServiceDefinition {
        ServiceDefinition {
            uuid,
            service_type: ServiceType::Primary,
            characteristics: characteristic_uuids
                .iter()
                .map(|&uuid| CharacteristicDefinition {
                    uuid,
                    properties: PROPERTY_READ | PROPERTY_WRITE | PROPERTY_NOTIFY,
                    permissions: PERMISSION_READ | PERMISSION_WRITE,
                    descriptors: vec![UUID_CLIENT_CHARACTERISTIC_CONFIG],
                })
                .collect(),
        }
    }

    /// The advertisement announced while the server runs: connectable,
    /// low-latency, high power, carrying the device name, the primary
    /// service UUID and manufacturer data when configured.
    pub fn advertisement(&self) -> Advertisement {
        Advertisement {
            connectable: true,
            include_device_name: true,
            low_latency: true,
            high_tx_power: true,
            service_uuid: self.service_uuid,
            manufacturer_id: self.manufacturer_id,
            manufacturer_data: self.manufacturer_data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_standard_battery_profile() {
        let config = ServerConfig::default();
        assert_eq!(config.service_uuid, UUID_DEFAULT_SERVER_SERVICE);
        assert_eq!(
            config.characteristic_uuids,
            vec![UUID_DEFAULT_SERVER_CHARACTERISTIC]
        );
        assert!(config.speed_check_enabled);
    }

    #[test]
    fn parse_rejects_each_field_with_its_own_error() {
        assert!(matches!(
            ServerConfig::parse("garbage", &["00002A19-0000-1000-8000-00805F9B34FB".into()], "", "", true),
            Err(ConfigError::InvalidServiceUuid(_))
        ));
        assert!(matches!(
            ServerConfig::parse("0000180F-0000-1000-8000-00805F9B34FB", &[], "", "", true),
            Err(ConfigError::NoCharacteristics)
        ));
        assert!(matches!(
            ServerConfig::parse(
                "0000180F-0000-1000-8000-00805F9B34FB",
                &["00002A19-0000-1000-8000-00805F9B34FB".into(), "oops".into()],
                "",
                "",
                true
            ),
            Err(ConfigError::InvalidCharacteristicUuid { index: 2, .. })
        ));
        assert!(matches!(
            ServerConfig::parse(
                "0000180F-0000-1000-8000-00805F9B34FB",
                &["00002A19-0000-1000-8000-00805F9B34FB".into()],
                "",
                "01 02",
                true
            ),
            Err(ConfigError::InvalidManufacturerId(_))
        ));
        assert!(matches!(
            ServerConfig::parse(
                "0000180F-0000-1000-8000-00805F9B34FB",
                &["00002A19-0000-1000-8000-00805F9B34FB".into()],
                "0x004C",
                "",
                true
            ),
            Err(ConfigError::InvalidManufacturerData(_))
        ));
    }

    #[test]
    fn parse_accepts_a_complete_declaration() {
        let config = ServerConfig::parse(
            "0000180F-0000-1000-8000-00805F9B34FB",
            &[
                "00002A19-0000-1000-8000-00805F9B34FB".into(),
                "00002A1A-0000-1000-8000-00805F9B34FB".into(),
            ],
            "0x004C",
            "01 02 03",
            false,
        )
        .unwrap();
        assert_eq!(config.characteristic_uuids.len(), 2);
        assert_eq!(config.manufacturer_id, Some(0x004C));
        assert_eq!(config.manufacturer_data, Some(vec![0x01, 0x02, 0x03]));
        assert!(!config.speed_check_enabled);
    }

    #[test]
    fn every_declared_characteristic_gets_notify_and_a_ccc_descriptor() {
        let table = ServerConfig::default().build_service_table();
        assert_eq!(table.len(), 2);
        for service in &table {
            assert_eq!(service.service_type, ServiceType::Primary);
            for characteristic in &service.characteristics {
                assert_eq!(
                    characteristic.properties,
                    PROPERTY_READ | PROPERTY_WRITE | PROPERTY_NOTIFY
                );
                assert_eq!(
                    characteristic.descriptors,
                    vec![UUID_CLIENT_CHARACTERISTIC_CONFIG]
                );
            }
        }
    }

    #[test]
    fn disabling_the_speed_check_drops_its_service_from_the_table() {
        let config = ServerConfig {
            speed_check_enabled: false,
            ..ServerConfig::default()
        };
        let table = config.build_service_table();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].uuid, config.service_uuid);
    }

    #[test]
    fn advertisement_reflects_the_declaration() {
        let config = ServerConfig {
            manufacturer_id: Some(0x004C),
            manufacturer_data: Some(vec![0x01]),
            ..ServerConfig::default()
        };
        let advertisement = config.advertisement();
        assert!(advertisement.connectable);
        assert!(advertisement.low_latency);
        assert!(advertisement.high_tx_power);
        assert_eq!(advertisement.service_uuid, config.service_uuid);
        assert_eq!(advertisement.manufacturer_id, Some(0x004C));
    }
}
