//! In-memory radio used by the tests and demos.
//!
//! Implements both radio roles over plain channels: the central side is
//! scripted per device (connect failures, held readiness, write failure
//! injection) and the peripheral side replays injected server events.
//! Central-role writes can be forwarded into an open server's event stream,
//! which is how the speed-check initiator and responder are wired end to
//! end without hardware.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ScanFilter;
use crate::core::bluetooth::constants::{
    UUID_DEFAULT_SERVER_CHARACTERISTIC, UUID_DEFAULT_SERVER_SERVICE,
};
use crate::core::bluetooth::radio::{
    CentralRadio, LinkEvent, PeripheralRadio, ScanUpdate, ServerEvent,
};
use crate::core::bluetooth::types::{
    Advertisement, GattCharacteristicDescriptor, GattServiceDescriptor, PhyConfig, ScanSample,
    ServiceDefinition, ServiceType, WriteType, PERMISSION_READ, PERMISSION_WRITE, PROPERTY_NOTIFY,
    PROPERTY_READ, PROPERTY_WRITE,
};
use crate::error::{RadioError, ServerError};

/// One characteristic write recorded by the mock.
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub address: String,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub write_type: WriteType,
}

struct MockDevice {
    name: Option<String>,
    services: Vec<GattServiceDescriptor>,
    phy: Option<PhyConfig>,
    connect_failures_remaining: u32,
    failed_to_connect_reason: Option<i32>,
    hold_ready: bool,
    connect_attempts: u32,
}

#[derive(Default)]
struct MockState {
    permissions_granted: bool,
    devices: HashMap<String, MockDevice>,
    links: HashMap<String, mpsc::Sender<LinkEvent>>,
    scan_tx: Option<mpsc::Sender<ScanUpdate>>,
    scan_filter: ScanFilter,
    writes: Vec<RecordedWrite>,
    write_counts: HashMap<String, usize>,
    fail_write_at: HashMap<String, usize>,
    forward: Option<(mpsc::Sender<ServerEvent>, String)>,
    server_tx: Option<mpsc::Sender<ServerEvent>>,
    open_error: Option<ServerError>,
    opened_services: Option<Vec<ServiceDefinition>>,
    advertisement: Option<Advertisement>,
}

/// Scriptable in-memory radio, cloneable and shared across roles.
#[derive(Clone)]
pub struct MockRadio {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRadio {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                permissions_granted: true,
                ..MockState::default()
            })),
        }
    }

    pub fn set_permissions(&self, granted: bool) {
        self.state.lock().unwrap().permissions_granted = granted;
    }

    /// Register a device exposing a single default service/characteristic.
    pub fn add_device(&self, address: &str, name: Option<&str>) {
        let services = vec![GattServiceDescriptor {
            uuid: UUID_DEFAULT_SERVER_SERVICE,
            service_type: ServiceType::Primary,
            characteristics: vec![GattCharacteristicDescriptor {
                uuid: UUID_DEFAULT_SERVER_CHARACTERISTIC,
                properties: PROPERTY_READ | PROPERTY_WRITE | PROPERTY_NOTIFY,
                permissions: PERMISSION_READ | PERMISSION_WRITE,
            }],
        }];
        self.add_device_with_services(address, name, services);
    }

    pub fn add_device_with_services(
        &self,
        address: &str,
        name: Option<&str>,
        services: Vec<GattServiceDescriptor>,
    ) {
        self.state.lock().unwrap().devices.insert(
            address.to_string(),
            MockDevice {
                name: name.map(str::to_string),
                services,
                phy: None,
                connect_failures_remaining: 0,
                failed_to_connect_reason: None,
                hold_ready: false,
                connect_attempts: 0,
            },
        );
    }

    fn with_device<T>(&self, address: &str, f: impl FnOnce(&mut MockDevice) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        let device = state
            .devices
            .get_mut(address)
            .unwrap_or_else(|| panic!("mock device {address} not configured"));
        f(device)
    }

    /// Fail the first `count` connect attempts before letting one succeed.
    pub fn set_connect_failures(&self, address: &str, count: u32) {
        self.with_device(address, |d| d.connect_failures_remaining = count);
    }

    /// Deliver `FailedToConnect` with the given reason instead of a link.
    pub fn set_failed_to_connect(&self, address: &str, reason: i32) {
        self.with_device(address, |d| d.failed_to_connect_reason = Some(reason));
    }

    /// Suppress the automatic `Ready` event after `Connected`.
    pub fn set_hold_ready(&self, address: &str, hold: bool) {
        self.with_device(address, |d| d.hold_ready = hold);
    }

    pub fn set_device_phy(&self, address: &str, phy: PhyConfig) {
        self.with_device(address, |d| d.phy = Some(phy));
    }

    pub fn connect_attempts(&self, address: &str) -> u32 {
        self.with_device(address, |d| d.connect_attempts)
    }

    /// Deliver a late `Ready` for a link held by `set_hold_ready`.
    pub async fn release_ready(&self, address: &str) {
        let (tx, services) = {
            let state = self.state.lock().unwrap();
            let tx = state.links.get(address).cloned();
            let services = state
                .devices
                .get(address)
                .map(|d| d.services.clone())
                .unwrap_or_default();
            (tx, services)
        };
        if let Some(tx) = tx {
            let _ = tx.send(LinkEvent::Ready { services }).await;
        }
    }

    /// Deliver a disconnect confirmation on an open link.
    pub async fn disconnect_link(&self, address: &str, reason: i32) {
        let tx = {
            let mut state = self.state.lock().unwrap();
            state.links.remove(address)
        };
        if let Some(tx) = tx {
            let _ = tx.send(LinkEvent::Disconnected { reason }).await;
        }
    }

    pub async fn push_scan_sample(&self, sample: ScanSample) {
        let (tx, filter) = {
            let state = self.state.lock().unwrap();
            (state.scan_tx.clone(), state.scan_filter.clone())
        };
        if !filter.matches(&sample) {
            return;
        }
        if let Some(tx) = tx {
            let _ = tx.send(ScanUpdate::Sample(sample)).await;
        }
    }

    pub async fn push_scan_failure(&self, code: i32) {
        let tx = self.state.lock().unwrap().scan_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(ScanUpdate::Failed { code }).await;
        }
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Make the `index`-th write (0-based, per address) fail.
    pub fn fail_write_at(&self, address: &str, index: usize) {
        self.state
            .lock()
            .unwrap()
            .fail_write_at
            .insert(address.to_string(), index);
    }

    /// Forward every central-role write into a server event stream, tagged
    /// as originating from `local_address`.
    pub fn forward_writes_to(&self, events: mpsc::Sender<ServerEvent>, local_address: &str) {
        self.state.lock().unwrap().forward = Some((events, local_address.to_string()));
    }

    /// Script the next `open_server` call to fail.
    pub fn set_open_error(&self, error: ServerError) {
        self.state.lock().unwrap().open_error = Some(error);
    }

    /// Event sender of the currently open server, if any.
    pub fn server_event_sender(&self) -> Option<mpsc::Sender<ServerEvent>> {
        self.state.lock().unwrap().server_tx.clone()
    }

    pub fn opened_services(&self) -> Option<Vec<ServiceDefinition>> {
        self.state.lock().unwrap().opened_services.clone()
    }

    pub fn advertisement(&self) -> Option<Advertisement> {
        self.state.lock().unwrap().advertisement.clone()
    }

    async fn send_server_event(&self, event: ServerEvent) {
        let tx = self.state.lock().unwrap().server_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    pub async fn inject_client_connected(&self, address: &str, name: Option<&str>) {
        self.send_server_event(ServerEvent::ClientConnected {
            address: address.to_string(),
            name: name.map(str::to_string),
        })
        .await;
    }

    pub async fn inject_client_disconnected(&self, address: &str) {
        self.send_server_event(ServerEvent::ClientDisconnected {
            address: address.to_string(),
        })
        .await;
    }

    pub async fn inject_server_write(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    ) {
        self.send_server_event(ServerEvent::Write {
            address: address.to_string(),
            service,
            characteristic,
            value,
        })
        .await;
    }

    pub async fn inject_advertise_failure(&self, code: i32) {
        self.send_server_event(ServerEvent::AdvertiseFailed { code }).await;
    }
}

#[async_trait]
impl CentralRadio for MockRadio {
    fn has_all_permissions(&self) -> bool {
        self.state.lock().unwrap().permissions_granted
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<mpsc::Receiver<ScanUpdate>, RadioError> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.lock().unwrap();
        state.scan_tx = Some(tx);
        state.scan_filter = filter.clone();
        Ok(rx)
    }

    async fn connect(&self, address: &str) -> Result<mpsc::Receiver<LinkEvent>, RadioError> {
        let (tx, rx, events) = {
            let mut state = self.state.lock().unwrap();
            let device = state
                .devices
                .get_mut(address)
                .ok_or_else(|| RadioError::DeviceNotFound(address.to_string()))?;
            device.connect_attempts += 1;
            if device.connect_failures_remaining > 0 {
                device.connect_failures_remaining -= 1;
                return Err(RadioError::Backend("connect attempt failed".to_string()));
            }

            let mut events = Vec::new();
            if let Some(reason) = device.failed_to_connect_reason {
                events.push(LinkEvent::FailedToConnect { reason });
            } else {
                events.push(LinkEvent::Connected);
                if !device.hold_ready {
                    events.push(LinkEvent::Ready {
                        services: device.services.clone(),
                    });
                }
            }

            let (tx, rx) = mpsc::channel(8);
            state.links.insert(address.to_string(), tx.clone());
            (tx, rx, events)
        };
        for event in events {
            let _ = tx.send(event).await;
        }
        Ok(rx)
    }

    async fn disconnect(&self, address: &str) -> Result<(), RadioError> {
        let tx = {
            let mut state = self.state.lock().unwrap();
            state
                .links
                .remove(address)
                .ok_or_else(|| RadioError::NotConnected(address.to_string()))?
        };
        let _ = tx
            .send(LinkEvent::Disconnected {
                reason: crate::error::REASON_SUCCESS,
            })
            .await;
        Ok(())
    }

    async fn device_name(&self, address: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(address)
            .and_then(|d| d.name.clone())
    }

    async fn read_phy(&self, address: &str) -> Result<PhyConfig, RadioError> {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(address)
            .and_then(|d| d.phy)
            .ok_or(RadioError::NotSupported)
    }

    async fn write_characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), RadioError> {
        let forward = {
            let mut state = self.state.lock().unwrap();
            if !state.links.contains_key(address) {
                return Err(RadioError::NotConnected(address.to_string()));
            }
            let count = state.write_counts.entry(address.to_string()).or_insert(0);
            let index = *count;
            *count += 1;
            if state.fail_write_at.get(address) == Some(&index) {
                return Err(RadioError::Backend(format!(
                    "write {index} rejected by remote"
                )));
            }
            state.writes.push(RecordedWrite {
                address: address.to_string(),
                service,
                characteristic,
                value: value.to_vec(),
                write_type,
            });
            state.forward.clone()
        };

        if let Some((events, local_address)) = forward {
            let _ = events
                .send(ServerEvent::Write {
                    address: local_address,
                    service,
                    characteristic,
                    value: value.to_vec(),
                })
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl PeripheralRadio for MockRadio {
    fn has_all_permissions(&self) -> bool {
        self.state.lock().unwrap().permissions_granted
    }

    async fn open_server(
        &self,
        services: &[ServiceDefinition],
        advertisement: &Advertisement,
    ) -> Result<mpsc::Receiver<ServerEvent>, ServerError> {
        let (tx, rx) = {
            let mut state = self.state.lock().unwrap();
            if let Some(error) = state.open_error.take() {
                return Err(error);
            }
            state.opened_services = Some(services.to_vec());
            state.advertisement = Some(advertisement.clone());
            let (tx, rx) = mpsc::channel(256);
            state.server_tx = Some(tx.clone());
            (tx, rx)
        };
        let _ = tx.send(ServerEvent::Ready).await;
        Ok(rx)
    }

    async fn close_server(&self) {
        let mut state = self.state.lock().unwrap();
        state.server_tx = None;
    }
}
