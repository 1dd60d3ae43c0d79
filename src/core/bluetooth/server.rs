//! Peripheral-role GATT server session management.
//!
//! `GattServerSession` represents the whole advertising server: it holds the
//! declared service table, starts and stops advertising through the radio,
//! and owns one `ClientSession` per connected remote central. Incoming
//! writes are tagged with (client address, service UUID, characteristic
//! UUID) before protocol dispatch, which is what lets the speed-check
//! channel be told apart from user-declared channels without transport-level
//! special cases.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::core::bluetooth::constants::{
    UUID_SPEED_CHECK_CHARACTERISTIC, UUID_SPEED_CHECK_SERVICE,
};
use crate::core::bluetooth::radio::{PeripheralRadio, ServerEvent};
use crate::core::bluetooth::speedcheck::{ServerSpeedCheckState, SpeedCheckAccumulator};
use crate::core::bluetooth::types::{ConnectedClient, ServiceDefinition};
use crate::error::ServerError;

/// Events reported to the server observer.
#[derive(Debug, Clone)]
pub enum GattServerEvent {
    Started,
    Stopped,
    Error(ServerError),
    ClientConnected(ConnectedClient),
    ClientDisconnected { address: String },
    /// A write on a user-declared characteristic, tagged with its origin.
    DataReceived {
        address: String,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The per-client speed-check accumulator changed.
    SpeedCheckProgress {
        address: String,
        state: ServerSpeedCheckState,
    },
}

/// Per connected client: identity plus the write routes registered for
/// every (service, characteristic) pair in the declared table.
pub struct ClientSession {
    client: ConnectedClient,
    routes: HashSet<(Uuid, Uuid)>,
}

impl ClientSession {
    fn new(client: ConnectedClient, table: &[ServiceDefinition]) -> Self {
        let mut routes = HashSet::new();
        for service in table {
            for characteristic in &service.characteristics {
                routes.insert((service.uuid, characteristic.uuid));
            }
        }
        debug!(
            "[Client {}] registered {} write routes",
            client.address,
            routes.len()
        );
        Self { client, routes }
    }

    pub fn client(&self) -> &ConnectedClient {
        &self.client
    }

    fn accepts(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.routes.contains(&(service, characteristic))
    }

    fn close(&self) {
        debug!("[Client {}] session closed", self.client.address);
    }
}

struct ServerState {
    running: bool,
    table: Vec<ServiceDefinition>,
    clients: HashMap<String, ClientSession>,
    speed_checks: SpeedCheckAccumulator,
}

/// The advertising GATT server and its connected clients.
pub struct GattServerSession {
    radio: Arc<dyn PeripheralRadio>,
    events: mpsc::Sender<GattServerEvent>,
    config: Mutex<ServerConfig>,
    state: Arc<Mutex<ServerState>>,
    pump_handle: Mutex<Option<JoinHandle<()>>>,
}

impl GattServerSession {
    pub fn new(radio: Arc<dyn PeripheralRadio>) -> (Self, mpsc::Receiver<GattServerEvent>) {
        let (events, receiver) = mpsc::channel(256);
        (
            Self {
                radio,
                events,
                config: Mutex::new(ServerConfig::default()),
                state: Arc::new(Mutex::new(ServerState {
                    running: false,
                    table: Vec::new(),
                    clients: HashMap::new(),
                    speed_checks: SpeedCheckAccumulator::new(),
                })),
                pump_handle: Mutex::new(None),
            },
            receiver,
        )
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn config(&self) -> ServerConfig {
        self.config.lock().unwrap().clone()
    }

    fn ensure_not_running(&self) -> Result<(), ServerError> {
        if self.is_running() {
            warn!("cannot change settings while server is running");
            return Err(ServerError::Busy);
        }
        Ok(())
    }

    pub fn set_service_uuid(&self, uuid: Uuid) -> Result<(), ServerError> {
        self.ensure_not_running()?;
        debug!("set_service_uuid: {uuid}");
        self.config.lock().unwrap().service_uuid = uuid;
        Ok(())
    }

    /// Replace the user-declared characteristic list. The list must have
    /// been validated at the configuration boundary.
    pub fn set_characteristic_uuids(&self, uuids: Vec<Uuid>) -> Result<(), ServerError> {
        self.ensure_not_running()?;
        debug!("set_characteristic_uuids: {} entries", uuids.len());
        self.config.lock().unwrap().characteristic_uuids = uuids;
        Ok(())
    }

    pub fn set_manufacturer_data(
        &self,
        manufacturer: Option<(u16, Vec<u8>)>,
    ) -> Result<(), ServerError> {
        self.ensure_not_running()?;
        let mut config = self.config.lock().unwrap();
        match manufacturer {
            Some((id, data)) => {
                debug!("set_manufacturer_data: id=0x{id:04X}, {} bytes", data.len());
                config.manufacturer_id = Some(id);
                config.manufacturer_data = Some(data);
            }
            None => {
                config.manufacturer_id = None;
                config.manufacturer_data = None;
            }
        }
        Ok(())
    }

    pub fn set_speed_check_enabled(&self, enabled: bool) -> Result<(), ServerError> {
        self.ensure_not_running()?;
        self.config.lock().unwrap().speed_check_enabled = enabled;
        Ok(())
    }

    /// Replace the whole configuration in one step.
    pub fn apply_config(&self, config: ServerConfig) -> Result<(), ServerError> {
        self.ensure_not_running()?;
        *self.config.lock().unwrap() = config;
        Ok(())
    }

    /// Open the GATT server and start advertising. Fails fast with a
    /// distinct error per cause; `Started` is emitted once the radio
    /// confirms the service table is registered.
    pub async fn start(&self) -> Result<(), ServerError> {
        debug!("start: attempting to start GATT server");
        if self.is_running() {
            warn!("start: server already running");
            return Err(ServerError::Busy);
        }
        if !self.radio.has_all_permissions() {
            error!("start: missing permissions");
            self.emit(GattServerEvent::Error(ServerError::PermissionDenied))
                .await;
            return Err(ServerError::PermissionDenied);
        }

        let config = self.config();
        if config.characteristic_uuids.is_empty() {
            error!("start: no characteristics declared");
            self.emit(GattServerEvent::Error(ServerError::ServiceAddFailed))
                .await;
            return Err(ServerError::ServiceAddFailed);
        }
        let table = config.build_service_table();
        let advertisement = config.advertisement();

        info!(
            "start: opening server with service UUID={} ({} services declared)",
            config.service_uuid,
            table.len()
        );
        let server_events = match self.radio.open_server(&table, &advertisement).await {
            Ok(events) => events,
            Err(e) => {
                error!("start: failed to open server: {e}");
                self.emit(GattServerEvent::Error(e.clone())).await;
                return Err(e);
            }
        };

        self.state.lock().unwrap().table = table;
        let state = self.state.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            Self::pump(state, events, server_events).await;
        });
        *self.pump_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn pump(
        state: Arc<Mutex<ServerState>>,
        events: mpsc::Sender<GattServerEvent>,
        mut server_events: mpsc::Receiver<ServerEvent>,
    ) {
        while let Some(event) = server_events.recv().await {
            match event {
                ServerEvent::Ready => {
                    info!("GATT server is ready");
                    state.lock().unwrap().running = true;
                    Self::publish(&events, GattServerEvent::Started).await;
                }
                ServerEvent::ClientConnected { address, name } => {
                    let name = name.unwrap_or_else(|| "Unknown".to_string());
                    info!("client connected to server: {address} ({name})");
                    let client = ConnectedClient {
                        address: address.clone(),
                        name,
                    };
                    {
                        let mut state = state.lock().unwrap();
                        let session = ClientSession::new(client.clone(), &state.table);
                        state.clients.insert(address, session);
                    }
                    Self::publish(&events, GattServerEvent::ClientConnected(client)).await;
                }
                ServerEvent::ClientDisconnected { address } => {
                    info!("client disconnected from server: {address}");
                    if let Some(session) = state.lock().unwrap().clients.remove(&address) {
                        session.close();
                    }
                    Self::publish(&events, GattServerEvent::ClientDisconnected { address }).await;
                }
                ServerEvent::Write {
                    address,
                    service,
                    characteristic,
                    value,
                } => {
                    let outgoing = {
                        let mut state = state.lock().unwrap();
                        match state.clients.get(&address) {
                            None => {
                                warn!("write from unknown client {address}, dropping");
                                None
                            }
                            Some(session) if !session.accepts(service, characteristic) => {
                                warn!(
                                    "[Client {address}] write to undeclared characteristic \
                                     {characteristic} in service {service}, dropping"
                                );
                                None
                            }
                            Some(_) => {
                                if service == UUID_SPEED_CHECK_SERVICE
                                    && characteristic == UUID_SPEED_CHECK_CHARACTERISTIC
                                {
                                    let check = state.speed_checks.on_write(&address, &value);
                                    Some(GattServerEvent::SpeedCheckProgress {
                                        address,
                                        state: check,
                                    })
                                } else {
                                    Some(GattServerEvent::DataReceived {
                                        address,
                                        service,
                                        characteristic,
                                        value,
                                    })
                                }
                            }
                        }
                    };
                    if let Some(event) = outgoing {
                        Self::publish(&events, event).await;
                    }
                }
                ServerEvent::AdvertiseFailed { code } => {
                    error!("advertising failed with code {code}");
                    Self::publish(
                        &events,
                        GattServerEvent::Error(ServerError::Advertise { code }),
                    )
                    .await;
                }
            }
        }
        debug!("server event stream ended");
    }

    /// Stop advertising and close every client session. Idempotent.
    pub async fn stop(&self) {
        debug!("stop: stopping GATT server");
        self.radio.close_server().await;
        if let Some(handle) = self.pump_handle.lock().unwrap().take() {
            handle.abort();
        }
        let client_count = {
            let mut state = self.state.lock().unwrap();
            for session in state.clients.values() {
                session.close();
            }
            let count = state.clients.len();
            state.clients.clear();
            state.running = false;
            count
        };
        info!("stop: server stopped (disconnected {client_count} clients)");
        self.emit(GattServerEvent::Stopped).await;
    }

    pub fn connected_clients(&self) -> Vec<ConnectedClient> {
        let state = self.state.lock().unwrap();
        let mut clients: Vec<ConnectedClient> = state
            .clients
            .values()
            .map(|session| session.client().clone())
            .collect();
        clients.sort_by(|a, b| a.address.cmp(&b.address));
        clients
    }

    pub fn connected_client_count(&self) -> usize {
        self.state.lock().unwrap().clients.len()
    }

    pub fn speed_check_state(&self, address: &str) -> Option<ServerSpeedCheckState> {
        self.state
            .lock()
            .unwrap()
            .speed_checks
            .state(address)
            .cloned()
    }

    pub fn speed_check_states(&self) -> HashMap<String, ServerSpeedCheckState> {
        self.state.lock().unwrap().speed_checks.states().clone()
    }

    async fn emit(&self, event: GattServerEvent) {
        Self::publish(&self.events, event).await;
    }

    async fn publish(events: &mpsc::Sender<GattServerEvent>, event: GattServerEvent) {
        if let Err(e) = events.send(event).await {
            error!("Failed to emit server event: {e}");
        }
    }
}
