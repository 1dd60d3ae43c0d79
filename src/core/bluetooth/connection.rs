//! Central-role connection handling.
//!
//! One `ConnectionSession` exists per remote device address and walks the
//! lifecycle `Connecting -> Connected -> Ready -> Disconnecting ->
//! Disconnected(reason)`. A failed connect attempt removes the session
//! entirely. The `ConnectionRegistry` owns the address-keyed session map and
//! enforces at most one live session per address; disconnected sessions are
//! retained until explicitly removed so callers can show history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::constants::{CONNECT_RETRY_DELAY_MS, MAX_CONNECT_RETRIES};
use crate::core::bluetooth::radio::{CentralRadio, LinkEvent};
use crate::core::bluetooth::types::{GattServiceDescriptor, PhyConfig, WriteType};
use crate::error::{ConnectError, DisconnectReason, RadioError, REASON_UNKNOWN, WriteError};

/// Lifecycle state of one connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Ready,
    Disconnecting,
    Disconnected(DisconnectReason),
}

impl ConnectionState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

/// Events reported to the connection observer, exactly once each.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Fired when a session reaches `Ready`, never earlier.
    DeviceConnected { address: String, name: String },
    DeviceDisconnected {
        address: String,
        reason: DisconnectReason,
    },
    /// The session was removed after failing to connect.
    ConnectionFailed { address: String, reason: i32 },
    /// A PHY read or update resolved for an established link.
    PhyUpdated { address: String, phy: PhyConfig },
}

/// Point-in-time view of a session, retained across disconnects.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub address: String,
    pub name: String,
    pub state: ConnectionState,
    pub services: Vec<GattServiceDescriptor>,
    pub phy: Option<PhyConfig>,
}

struct SessionState {
    name: String,
    state: ConnectionState,
    services: Vec<GattServiceDescriptor>,
    phy: Option<PhyConfig>,
}

/// One session per remote device address. All transitions are applied by
/// the session's own driver task, serialized by the link event stream.
pub struct ConnectionSession {
    address: String,
    state: Mutex<SessionState>,
}

impl ConnectionSession {
    fn new(address: String, name: String) -> Self {
        Self {
            address,
            state: Mutex::new(SessionState {
                name,
                state: ConnectionState::Connecting,
                services: Vec::new(),
                phy: None,
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().state
    }

    pub fn is_disconnected(&self) -> bool {
        self.state().is_terminal()
    }

    fn cached_name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.lock().unwrap().state = state;
    }

    /// Snapshot the discovered service table and enter `Ready`. Any
    /// discovered service set is accepted; the snapshot is immutable for
    /// the rest of the session.
    fn on_ready(&self, name: String, services: Vec<GattServiceDescriptor>) {
        let mut state = self.state.lock().unwrap();
        state.name = name;
        state.services = services;
        state.state = ConnectionState::Ready;
    }

    fn set_phy(&self, phy: PhyConfig) {
        self.state.lock().unwrap().phy = Some(phy);
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        let state = self.state.lock().unwrap();
        state
            .services
            .iter()
            .find(|s| s.uuid == service)
            .and_then(|s| s.characteristic(characteristic))
            .is_some()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.state.lock().unwrap();
        ConnectionSnapshot {
            address: self.address.clone(),
            name: state.name.clone(),
            state: state.state,
            services: state.services.clone(),
            phy: state.phy,
        }
    }
}

struct RegistryInner {
    radio: Arc<dyn CentralRadio>,
    sessions: Mutex<HashMap<String, Arc<ConnectionSession>>>,
    events: mpsc::Sender<ConnectionEvent>,
}

impl RegistryInner {
    async fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.events.send(event).await {
            error!("Failed to emit connection event: {e}");
        }
    }
}

/// Address-keyed collection of connection sessions.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(radio: Arc<dyn CentralRadio>) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (events, receiver) = mpsc::channel(64);
        (
            Self {
                inner: Arc::new(RegistryInner {
                    radio,
                    sessions: Mutex::new(HashMap::new()),
                    events,
                }),
            },
            receiver,
        )
    }

    /// Connect to a device picked from scan results.
    ///
    /// Rejected when permissions are missing or a non-terminal session
    /// already exists for the address. A session retained in
    /// `Disconnected` is replaced by a fresh one. The connect request runs
    /// with the bounded auto-retry policy and auto-connect disabled.
    pub async fn connect(&self, address: &str) -> Result<(), ConnectError> {
        debug!("connect: attempting to connect to {address}");
        if !self.inner.radio.has_all_permissions() {
            warn!("connect: missing permissions");
            return Err(ConnectError::PermissionDenied);
        }

        let cached_name = self
            .inner
            .radio
            .device_name(address)
            .await
            .unwrap_or_else(|| "Unknown".to_string());

        let session = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            if let Some(existing) = sessions.get(address) {
                if !existing.is_disconnected() {
                    warn!("connect: already connecting or connected to {address}");
                    return Err(ConnectError::SessionExists {
                        address: address.to_string(),
                    });
                }
            }
            let session = Arc::new(ConnectionSession::new(
                address.to_string(),
                cached_name.clone(),
            ));
            sessions.insert(address.to_string(), session.clone());
            session
        };

        info!("connect: initiating connection to {address} ({cached_name})");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            Self::drive_connection(inner, session).await;
        });
        Ok(())
    }

    /// Connect to a manually entered address after validating its format.
    pub async fn connect_by_address(&self, address: &str) -> Result<(), ConnectError> {
        let pattern = Regex::new(r"^([0-9A-Fa-f]{2}:){5}[0-9A-Fa-f]{2}$").unwrap();
        if !pattern.is_match(address.trim()) {
            return Err(ConnectError::InvalidAddress(address.to_string()));
        }
        self.connect(address.trim()).await
    }

    async fn drive_connection(inner: Arc<RegistryInner>, session: Arc<ConnectionSession>) {
        let address = session.address().to_string();

        // Bounded auto-retry for the initial connect request only.
        let mut link = None;
        for attempt in 1..=MAX_CONNECT_RETRIES {
            match inner.radio.connect(&address).await {
                Ok(events) => {
                    link = Some(events);
                    break;
                }
                Err(e) => {
                    warn!("Connection attempt {attempt} failed for {address}: {e}");
                    if attempt < MAX_CONNECT_RETRIES {
                        tokio::time::sleep(Duration::from_millis(CONNECT_RETRY_DELAY_MS)).await;
                    }
                }
            }
        }
        let Some(mut link) = link else {
            error!("Failed to connect to {address} after {MAX_CONNECT_RETRIES} attempts");
            inner.sessions.lock().unwrap().remove(&address);
            inner
                .emit(ConnectionEvent::ConnectionFailed {
                    address,
                    reason: REASON_UNKNOWN,
                })
                .await;
            return;
        };

        while let Some(event) = link.recv().await {
            match event {
                LinkEvent::Connected => {
                    debug!("{address}: link established - waiting for ready state");
                    session.set_state(ConnectionState::Connected);
                }
                LinkEvent::Ready { services } => {
                    // The display name may be inaccessible under a security
                    // restriction; fall back to the name cached at connect.
                    let name = match inner.radio.device_name(&address).await {
                        Some(name) => name,
                        None => session.cached_name(),
                    };
                    info!(
                        "{address} ({name}): connection fully established, {} services",
                        services.len()
                    );
                    session.on_ready(name.clone(), services);
                    inner
                        .emit(ConnectionEvent::DeviceConnected {
                            address: address.clone(),
                            name,
                        })
                        .await;

                    // Best-effort PHY read; the PHY stays unknown on failure.
                    match inner.radio.read_phy(&address).await {
                        Ok(phy) => {
                            session.set_phy(phy);
                            inner
                                .emit(ConnectionEvent::PhyUpdated {
                                    address: address.clone(),
                                    phy,
                                })
                                .await;
                        }
                        Err(e) => warn!("{address}: failed to read PHY: {e}"),
                    }
                }
                LinkEvent::FailedToConnect { reason } => {
                    error!("{address}: failed to connect, reason={reason}");
                    inner.sessions.lock().unwrap().remove(&address);
                    inner
                        .emit(ConnectionEvent::ConnectionFailed { address, reason })
                        .await;
                    return;
                }
                LinkEvent::Disconnected { reason } => {
                    let reason = DisconnectReason::from_code(reason);
                    info!("{address}: disconnected, reason={reason}");
                    session.set_state(ConnectionState::Disconnected(reason));
                    inner
                        .emit(ConnectionEvent::DeviceDisconnected { address, reason })
                        .await;
                    return;
                }
            }
        }

        // The link stream ended without a disconnect confirmation.
        if !session.is_disconnected() {
            warn!("{address}: link event stream ended unexpectedly");
            session.set_state(ConnectionState::Disconnected(DisconnectReason::Unknown));
            inner
                .emit(ConnectionEvent::DeviceDisconnected {
                    address,
                    reason: DisconnectReason::Unknown,
                })
                .await;
        }
    }

    /// Request disconnection of an established session. The session stays
    /// in the registry and reaches `Disconnected` only when the radio
    /// confirms.
    pub async fn disconnect(&self, address: &str) -> Result<(), ConnectError> {
        let session = self.session(address).ok_or_else(|| ConnectError::NotConnected {
            address: address.to_string(),
        })?;
        match session.state() {
            ConnectionState::Connected | ConnectionState::Ready => {}
            _ => {
                warn!("disconnect: no established connection for {address}");
                return Err(ConnectError::NotConnected {
                    address: address.to_string(),
                });
            }
        }
        info!("disconnect: disconnecting {address}");
        session.set_state(ConnectionState::Disconnecting);
        self.inner.radio.disconnect(address).await?;
        Ok(())
    }

    /// Disconnect every established session.
    pub async fn disconnect_all(&self) {
        let addresses: Vec<String> = {
            let sessions = self.inner.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|s| {
                    matches!(
                        s.state(),
                        ConnectionState::Connected | ConnectionState::Ready
                    )
                })
                .map(|s| s.address().to_string())
                .collect()
        };
        info!("disconnect_all: disconnecting {} devices", addresses.len());
        for address in addresses {
            if let Err(e) = self.disconnect(&address).await {
                warn!("disconnect_all: {address}: {e}");
            }
        }
    }

    /// Purge a retained session; only valid once it reached `Disconnected`.
    pub fn remove_disconnected_device(&self, address: &str) -> bool {
        let mut sessions = self.inner.sessions.lock().unwrap();
        match sessions.get(address) {
            Some(session) if session.is_disconnected() => {
                debug!("remove_disconnected_device: removing {address}");
                sessions.remove(address);
                true
            }
            _ => false,
        }
    }

    /// Re-read the PHY of an established link and publish the result.
    pub async fn read_phy(&self, address: &str) -> Result<PhyConfig, ConnectError> {
        let session = self.session(address).ok_or_else(|| ConnectError::NotConnected {
            address: address.to_string(),
        })?;
        match session.state() {
            ConnectionState::Connected | ConnectionState::Ready => {}
            _ => {
                return Err(ConnectError::NotConnected {
                    address: address.to_string(),
                });
            }
        }
        let phy = self.inner.radio.read_phy(address).await?;
        session.set_phy(phy);
        self.inner
            .emit(ConnectionEvent::PhyUpdated {
                address: address.to_string(),
                phy,
            })
            .await;
        Ok(phy)
    }

    /// Write a characteristic on a ready session. The characteristic is
    /// resolved against the session's cached service snapshot, never a
    /// fresh remote query, and the call resolves only once the underlying
    /// write has completed or failed.
    pub async fn write_characteristic(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), WriteError> {
        if !self.inner.radio.has_all_permissions() {
            warn!("write_characteristic: missing permissions");
            return Err(WriteError::Radio(RadioError::PermissionDenied));
        }
        let Some(session) = self.session(address) else {
            warn!("write_characteristic: no connection found for {address}");
            return Err(WriteError::NotReady {
                address: address.to_string(),
            });
        };
        if session.state() != ConnectionState::Ready {
            warn!("write_characteristic: session for {address} is not ready");
            return Err(WriteError::NotReady {
                address: address.to_string(),
            });
        }
        if !session.has_characteristic(service, characteristic) {
            warn!("write_characteristic: characteristic not found");
            return Err(WriteError::CharacteristicNotFound {
                service,
                characteristic,
            });
        }
        debug!(
            "write_characteristic: {address} service={service} characteristic={characteristic} \
             len={}",
            value.len()
        );
        self.inner
            .radio
            .write_characteristic(address, service, characteristic, value, write_type)
            .await?;
        Ok(())
    }

    /// All sessions, including those retained after disconnecting.
    pub fn connected_devices(&self) -> Vec<ConnectionSnapshot> {
        let sessions = self.inner.sessions.lock().unwrap();
        let mut snapshots: Vec<ConnectionSnapshot> =
            sessions.values().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.address.cmp(&b.address));
        snapshots
    }

    pub fn session(&self, address: &str) -> Option<Arc<ConnectionSession>> {
        self.inner.sessions.lock().unwrap().get(address).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::{
        UUID_DEFAULT_SERVER_CHARACTERISTIC, UUID_DEFAULT_SERVER_SERVICE,
    };
    use crate::core::bluetooth::mock::MockRadio;
    use crate::core::bluetooth::types::PhyMode;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    async fn expect_connected(events: &mut mpsc::Receiver<ConnectionEvent>) -> String {
        match events.recv().await {
            Some(ConnectionEvent::DeviceConnected { name, .. }) => name,
            other => panic!("expected DeviceConnected, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn session_reaches_ready_and_reports_once() {
        let radio = MockRadio::new();
        radio.add_device(ADDR, Some("Beacon"));
        let (registry, mut events) = ConnectionRegistry::new(Arc::new(radio));

        registry.connect(ADDR).await.unwrap();
        assert_eq!(expect_connected(&mut events).await, "Beacon");

        let snapshot = &registry.connected_devices()[0];
        assert_eq!(snapshot.state, ConnectionState::Ready);
        assert_eq!(snapshot.services.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_connect_is_rejected_while_a_session_exists() {
        let radio = MockRadio::new();
        radio.add_device(ADDR, Some("Beacon"));
        let (registry, mut events) = ConnectionRegistry::new(Arc::new(radio));

        registry.connect(ADDR).await.unwrap();
        let second = registry.connect(ADDR).await;
        assert!(matches!(second, Err(ConnectError::SessionExists { .. })));

        let _ = expect_connected(&mut events).await;
        // Still connected: a third attempt is also rejected.
        assert!(registry.connect(ADDR).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_is_accepted_after_a_terminal_disconnect() {
        let radio = MockRadio::new();
        radio.add_device(ADDR, Some("Beacon"));
        let (registry, mut events) = ConnectionRegistry::new(Arc::new(radio.clone()));

        registry.connect(ADDR).await.unwrap();
        let _ = expect_connected(&mut events).await;

        radio.disconnect_link(ADDR, 19).await;
        match events.recv().await {
            Some(ConnectionEvent::DeviceDisconnected { reason, .. }) => {
                assert_eq!(reason, DisconnectReason::PeerUserTerminated);
            }
            other => panic!("expected DeviceDisconnected, got {other:?}"),
        }
        assert_eq!(
            registry.session(ADDR).unwrap().state(),
            ConnectionState::Disconnected(DisconnectReason::PeerUserTerminated)
        );

        // The retained record does not block a fresh session.
        registry.connect(ADDR).await.unwrap();
        let _ = expect_connected(&mut events).await;
        assert_eq!(registry.session(ADDR).unwrap().state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_removes_the_session_entirely() {
        let radio = MockRadio::new();
        radio.add_device(ADDR, Some("Beacon"));
        radio.set_failed_to_connect(ADDR, 133);
        let (registry, mut events) = ConnectionRegistry::new(Arc::new(radio));

        registry.connect(ADDR).await.unwrap();
        match events.recv().await {
            Some(ConnectionEvent::ConnectionFailed { reason, .. }) => assert_eq!(reason, 133),
            other => panic!("expected ConnectionFailed, got {other:?}"),
        }
        assert!(registry.connected_devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_up_to_three_attempts() {
        let radio = MockRadio::new();
        radio.add_device(ADDR, Some("Beacon"));
        radio.set_connect_failures(ADDR, 2);
        let (registry, mut events) = ConnectionRegistry::new(Arc::new(radio.clone()));

        registry.connect(ADDR).await.unwrap();
        let _ = expect_connected(&mut events).await;
        assert_eq!(radio.connect_attempts(ADDR), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_after_three_attempts() {
        let radio = MockRadio::new();
        radio.add_device(ADDR, Some("Beacon"));
        radio.set_connect_failures(ADDR, 3);
        let (registry, mut events) = ConnectionRegistry::new(Arc::new(radio.clone()));

        registry.connect(ADDR).await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::ConnectionFailed { .. })
        ));
        assert_eq!(radio.connect_attempts(ADDR), 3);
        assert!(registry.connected_devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn write_before_ready_fails_with_no_connection() {
        let radio = MockRadio::new();
        radio.add_device(ADDR, Some("Beacon"));
        radio.set_hold_ready(ADDR, true);
        let (registry, _events) = ConnectionRegistry::new(Arc::new(radio.clone()));

        registry.connect(ADDR).await.unwrap();
        // Let the driver task consume the Connected event; Ready is held.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            registry.session(ADDR).unwrap().state(),
            ConnectionState::Connected
        );

        let result = registry
            .write_characteristic(
                ADDR,
                UUID_DEFAULT_SERVER_SERVICE,
                UUID_DEFAULT_SERVER_CHARACTERISTIC,
                &[0x01],
                WriteType::WithResponse,
            )
            .await;
        assert!(matches!(result, Err(WriteError::NotReady { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn write_resolves_against_the_cached_service_snapshot() {
        let radio = MockRadio::new();
        radio.add_device(ADDR, Some("Beacon"));
        let (registry, mut events) = ConnectionRegistry::new(Arc::new(radio.clone()));

        registry.connect(ADDR).await.unwrap();
        let _ = expect_connected(&mut events).await;

        registry
            .write_characteristic(
                ADDR,
                UUID_DEFAULT_SERVER_SERVICE,
                UUID_DEFAULT_SERVER_CHARACTERISTIC,
                &[0x2A],
                WriteType::WithoutResponse,
            )
            .await
            .unwrap();
        let writes = radio.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].value, vec![0x2A]);
        assert_eq!(writes[0].write_type, WriteType::WithoutResponse);

        let unknown = Uuid::from_u128(0xdead_beef);
        let result = registry
            .write_characteristic(
                ADDR,
                UUID_DEFAULT_SERVER_SERVICE,
                unknown,
                &[0x00],
                WriteType::WithResponse,
            )
            .await;
        assert!(matches!(
            result,
            Err(WriteError::CharacteristicNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_is_only_valid_for_disconnected_sessions() {
        let radio = MockRadio::new();
        radio.add_device(ADDR, Some("Beacon"));
        let (registry, mut events) = ConnectionRegistry::new(Arc::new(radio.clone()));

        registry.connect(ADDR).await.unwrap();
        let _ = expect_connected(&mut events).await;
        assert!(!registry.remove_disconnected_device(ADDR));

        registry.disconnect(ADDR).await.unwrap();
        let _ = events.recv().await;
        assert!(registry.remove_disconnected_device(ADDR));
        assert!(registry.connected_devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn phy_is_best_effort_and_published_when_available() {
        let radio = MockRadio::new();
        radio.add_device(ADDR, Some("Beacon"));
        radio.set_device_phy(
            ADDR,
            PhyConfig {
                tx: PhyMode::Le2M,
                rx: PhyMode::Le2M,
            },
        );
        let (registry, mut events) = ConnectionRegistry::new(Arc::new(radio));

        registry.connect(ADDR).await.unwrap();
        let _ = expect_connected(&mut events).await;
        match events.recv().await {
            Some(ConnectionEvent::PhyUpdated { phy, .. }) => {
                assert_eq!(phy.to_string(), "LE 2M");
            }
            other => panic!("expected PhyUpdated, got {other:?}"),
        }
        assert!(registry.connected_devices()[0].phy.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn a_missing_phy_does_not_block_readiness() {
        let radio = MockRadio::new();
        radio.add_device(ADDR, Some("Beacon"));
        let (registry, mut events) = ConnectionRegistry::new(Arc::new(radio));

        registry.connect(ADDR).await.unwrap();
        let _ = expect_connected(&mut events).await;
        assert!(registry.connected_devices()[0].phy.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_by_address_validates_the_format() {
        let radio = MockRadio::new();
        radio.add_device(ADDR, Some("Beacon"));
        let (registry, _events) = ConnectionRegistry::new(Arc::new(radio));

        assert!(matches!(
            registry.connect_by_address("not-a-mac").await,
            Err(ConnectError::InvalidAddress(_))
        ));
        registry.connect_by_address(ADDR).await.unwrap();
    }
}
