//! `bluest`-backed central radio.
//!
//! Desktop backend for the central role. Peripheral hosting is not
//! available through `bluest`; the peripheral trait is left to
//! platform-specific implementations. Two degradations are deliberate:
//! PHY reads report `NotSupported` (the session treats that as best-effort
//! and moves on) and disconnect confirmations carry the success reason,
//! since the backend surfaces no platform reason codes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ScanFilter;
use crate::core::bluetooth::radio::{CentralRadio, LinkEvent, ScanUpdate};
use crate::core::bluetooth::types::{
    GattCharacteristicDescriptor, GattServiceDescriptor, PhyConfig, ScanSample, ServiceType,
    WriteType, PERMISSION_READ, PERMISSION_WRITE, PROPERTY_BROADCAST, PROPERTY_EXTENDED_PROPS,
    PROPERTY_INDICATE, PROPERTY_NOTIFY, PROPERTY_READ, PROPERTY_SIGNED_WRITE, PROPERTY_WRITE,
    PROPERTY_WRITE_NO_RESPONSE,
};
use crate::error::{RadioError, REASON_SUCCESS};

struct Link {
    device: Device,
    characteristics: HashMap<(Uuid, Uuid), Characteristic>,
    events: mpsc::Sender<LinkEvent>,
}

/// Central-role radio over the system bluetooth stack.
pub struct BluestCentralRadio {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    links: Arc<Mutex<HashMap<String, Link>>>,
}

impl BluestCentralRadio {
    pub async fn new() -> Result<Self, RadioError> {
        let adapter = Adapter::default()
            .await
            .ok_or(RadioError::AdapterUnavailable)?;
        adapter
            .wait_available()
            .await
            .map_err(|e| RadioError::Backend(e.to_string()))?;
        info!("Bluetooth adapter is available.");
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            links: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn device(&self, address: &str) -> Result<Device, RadioError> {
        self.devices
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| RadioError::DeviceNotFound(address.to_string()))
    }
}

fn backend_error(e: bluest::Error) -> RadioError {
    RadioError::Backend(e.to_string())
}

fn map_properties(properties: &bluest::CharacteristicProperties) -> u32 {
    let mut mask = 0;
    if properties.broadcast {
        mask |= PROPERTY_BROADCAST;
    }
    if properties.read {
        mask |= PROPERTY_READ;
    }
    if properties.write_without_response {
        mask |= PROPERTY_WRITE_NO_RESPONSE;
    }
    if properties.write {
        mask |= PROPERTY_WRITE;
    }
    if properties.notify {
        mask |= PROPERTY_NOTIFY;
    }
    if properties.indicate {
        mask |= PROPERTY_INDICATE;
    }
    if properties.authenticated_signed_writes {
        mask |= PROPERTY_SIGNED_WRITE;
    }
    if properties.extended_properties {
        mask |= PROPERTY_EXTENDED_PROPS;
    }
    mask
}

#[async_trait]
impl CentralRadio for BluestCentralRadio {
    fn has_all_permissions(&self) -> bool {
        // Desktop stacks gate access at the OS level, not per-app runtime
        // permissions.
        true
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<mpsc::Receiver<ScanUpdate>, RadioError> {
        info!("Starting bluetooth scan");
        let mut scan_stream = self.adapter.scan(&[]).await.map_err(backend_error)?;

        let (tx, rx) = mpsc::channel(64);
        let devices = self.devices.clone();
        let filter = filter.clone();
        tokio::spawn(async move {
            while let Some(discovered) = scan_stream.next().await {
                let device = discovered.device;
                let Some(rssi) = discovered.rssi else {
                    debug!("scan: dropping advertisement without RSSI");
                    continue;
                };

                let address = device.id().to_string();
                let adv_data = discovered.adv_data;
                let name = adv_data
                    .local_name
                    .clone()
                    .or_else(|| device.name().ok());
                let mut manufacturer_data = HashMap::new();
                if let Some(data) = &adv_data.manufacturer_data {
                    manufacturer_data.insert(data.company_id, data.data.to_vec());
                }
                let sample = ScanSample {
                    address: address.clone(),
                    name,
                    rssi,
                    is_connectable: adv_data.is_connectable,
                    manufacturer_data,
                    service_uuids: adv_data.services.iter().copied().collect(),
                };
                if !filter.matches(&sample) {
                    continue;
                }

                devices.lock().unwrap().insert(address, device);
                if tx.send(ScanUpdate::Sample(sample)).await.is_err() {
                    // Receiver dropped: the caller stopped scanning.
                    break;
                }
            }
            info!("Bluetooth scan stream has ended.");
        });
        Ok(rx)
    }

    async fn connect(&self, address: &str) -> Result<mpsc::Receiver<LinkEvent>, RadioError> {
        let device = self.device(address)?;

        if !device.is_connected().await {
            info!("Initiating connection to {address}...");
            self.adapter
                .connect_device(&device)
                .await
                .map_err(backend_error)?;
        }

        info!("Connection successful, discovering services...");
        let mut services = Vec::new();
        let mut characteristics = HashMap::new();
        for service in device.services().await.map_err(backend_error)? {
            let mut descriptors = Vec::new();
            for characteristic in service.characteristics().await.map_err(backend_error)? {
                let properties = match characteristic.properties().await {
                    Ok(properties) => map_properties(&properties),
                    Err(e) => {
                        warn!(
                            "Failed to read properties of {}: {e}",
                            characteristic.uuid()
                        );
                        PROPERTY_READ | PROPERTY_WRITE
                    }
                };
                descriptors.push(GattCharacteristicDescriptor {
                    uuid: characteristic.uuid(),
                    properties,
                    permissions: PERMISSION_READ | PERMISSION_WRITE,
                });
                characteristics.insert(
                    (service.uuid(), characteristic.uuid()),
                    characteristic.clone(),
                );
            }
            services.push(GattServiceDescriptor {
                uuid: service.uuid(),
                service_type: ServiceType::Primary,
                characteristics: descriptors,
            });
        }

        let (tx, rx) = mpsc::channel(8);
        let _ = tx.send(LinkEvent::Connected).await;
        let _ = tx.send(LinkEvent::Ready { services }).await;
        self.links.lock().unwrap().insert(
            address.to_string(),
            Link {
                device,
                characteristics,
                events: tx,
            },
        );
        Ok(rx)
    }

    async fn disconnect(&self, address: &str) -> Result<(), RadioError> {
        let link = self
            .links
            .lock()
            .unwrap()
            .remove(address)
            .ok_or_else(|| RadioError::NotConnected(address.to_string()))?;
        info!("Disconnecting from device {address}");
        self.adapter
            .disconnect_device(&link.device)
            .await
            .map_err(backend_error)?;
        let _ = link
            .events
            .send(LinkEvent::Disconnected {
                reason: REASON_SUCCESS,
            })
            .await;
        Ok(())
    }

    async fn device_name(&self, address: &str) -> Option<String> {
        let device = self.devices.lock().unwrap().get(address).cloned()?;
        device.name().ok()
    }

    async fn read_phy(&self, _address: &str) -> Result<PhyConfig, RadioError> {
        // The system API exposes no PHY information.
        Err(RadioError::NotSupported)
    }

    async fn write_characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError> {
        let handle = {
            let links = self.links.lock().unwrap();
            let link = links
                .get(address)
                .ok_or_else(|| RadioError::NotConnected(address.to_string()))?;
            link.characteristics
                .get(&(service, characteristic))
                .cloned()
                .ok_or_else(|| {
                    RadioError::Backend(format!(
                        "characteristic {characteristic} not found in service {service}"
                    ))
                })?
        };
        match write_type {
            WriteType::WithResponse => handle.write(value).await.map_err(backend_error),
            WriteType::WithoutResponse => handle
                .write_without_response(value)
                .await
                .map_err(backend_error),
        }
    }
}
