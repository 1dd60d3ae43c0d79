//! Device discovery ranking.
//!
//! The ranker consumes scan samples, smooths RSSI per address and keeps the
//! published device list stable while samples stream in: every sample
//! republishes the current list in unchanged order (new addresses appended),
//! and a full re-sort by descending smoothed RSSI fires only once the stream
//! has been quiet for the debounce window. Stopping the scan cancels the
//! pending debounce and forces a final re-sort.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ScanFilter;
use crate::core::bluetooth::constants::SORT_DEBOUNCE_MS;
use crate::core::bluetooth::radio::{CentralRadio, ScanUpdate};
use crate::core::bluetooth::smoothing::RssiSmoother;
use crate::core::bluetooth::types::{ScanSample, ScannedDevice};
use crate::error::RadioError;

/// Updates published to the scan observer.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// The device list changed (data update or re-sort).
    DevicesUpdated(Vec<ScannedDevice>),
    /// Scanning failed with a platform error code.
    Failed { code: i32 },
}

#[derive(Default)]
struct RankerState {
    results: HashMap<String, ScannedDevice>,
    order: Vec<String>,
    smoother: RssiSmoother,
}

impl RankerState {
    /// Apply one sample and return the list in the preserved order, with
    /// addresses not yet ranked appended after the existing prefix.
    fn apply(&mut self, sample: ScanSample) -> Vec<ScannedDevice> {
        let smoothed = self.smoother.observe(&sample.address, sample.rssi);
        let name = sample
            .name
            .or_else(|| {
                self.results
                    .get(&sample.address)
                    .map(|device| device.name.clone())
            })
            .unwrap_or_else(|| "Unknown".to_string());

        let device = ScannedDevice {
            address: sample.address.clone(),
            name,
            rssi: sample.rssi,
            smoothed_rssi: smoothed,
            is_connectable: sample.is_connectable,
            last_seen: Utc::now(),
            manufacturer_data: sample.manufacturer_data,
            service_uuids: sample.service_uuids,
        };
        if !self.results.contains_key(&sample.address) {
            self.order.push(sample.address.clone());
        }
        self.results.insert(sample.address, device);
        self.snapshot()
    }

    /// Re-sort by descending smoothed RSSI and return the new order.
    fn sort(&mut self) -> Vec<ScannedDevice> {
        let mut devices: Vec<ScannedDevice> = self.results.values().cloned().collect();
        devices.sort_by(|a, b| {
            b.smoothed_rssi
                .partial_cmp(&a.smoothed_rssi)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        self.order = devices.iter().map(|d| d.address.clone()).collect();
        devices
    }

    fn snapshot(&self) -> Vec<ScannedDevice> {
        self.order
            .iter()
            .filter_map(|address| self.results.get(address).cloned())
            .collect()
    }

    fn clear(&mut self) {
        self.results.clear();
        self.order.clear();
        self.smoother.clear();
    }
}

/// Owns the live set of discovered devices and the debounced re-sort.
pub struct ScanRanker {
    radio: Arc<dyn CentralRadio>,
    events: mpsc::Sender<ScanEvent>,
    state: Arc<Mutex<RankerState>>,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl ScanRanker {
    pub fn new(radio: Arc<dyn CentralRadio>) -> (Self, mpsc::Receiver<ScanEvent>) {
        let (events, receiver) = mpsc::channel(64);
        (
            Self {
                radio,
                events,
                state: Arc::new(Mutex::new(RankerState::default())),
                cancel_token: CancellationToken::new(),
                scan_task_handle: None,
            },
            receiver,
        )
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Current device list in the published order.
    pub fn devices(&self) -> Vec<ScannedDevice> {
        self.state.lock().unwrap().snapshot()
    }

    /// Start a scan session. Any previous session is stopped and its
    /// results are cleared.
    pub async fn start_scan(&mut self, filter: &ScanFilter) -> Result<(), RadioError> {
        if !self.radio.has_all_permissions() {
            warn!("start_scan: missing permissions");
            return Err(RadioError::PermissionDenied);
        }
        if self.scan_task_handle.is_some() {
            self.stop_scan().await;
        }

        self.state.lock().unwrap().clear();
        let updates = self.radio.scan(filter).await?;

        self.cancel_token = CancellationToken::new();
        let cancel_token = self.cancel_token.clone();
        let state = self.state.clone();
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            Self::scan_task(state, events, updates, cancel_token).await;
        });
        self.scan_task_handle = Some(handle);
        info!("Device scan task started.");
        Ok(())
    }

    async fn scan_task(
        state: Arc<Mutex<RankerState>>,
        events: mpsc::Sender<ScanEvent>,
        mut updates: mpsc::Receiver<ScanUpdate>,
        cancel_token: CancellationToken,
    ) {
        // A single re-armed deadline, not one timer per sample.
        let mut sort_deadline: Option<Instant> = None;

        loop {
            let armed_deadline = sort_deadline;
            let sort_timer = async move {
                match armed_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                update = updates.recv() => {
                    match update {
                        Some(ScanUpdate::Sample(sample)) => {
                            debug!(
                                "scan_task: sample from {} rssi={}",
                                sample.address, sample.rssi
                            );
                            let list = state.lock().unwrap().apply(sample);
                            Self::publish(&events, ScanEvent::DevicesUpdated(list)).await;
                            sort_deadline =
                                Some(Instant::now() + Duration::from_millis(SORT_DEBOUNCE_MS));
                        }
                        Some(ScanUpdate::Failed { code }) => {
                            error!("scan_task: scan failed with code {code}");
                            Self::publish(&events, ScanEvent::Failed { code }).await;
                            break;
                        }
                        None => {
                            info!("scan_task: scan stream has ended.");
                            if sort_deadline.is_some() {
                                let list = state.lock().unwrap().sort();
                                Self::publish(&events, ScanEvent::DevicesUpdated(list)).await;
                            }
                            break;
                        }
                    }
                }
                _ = sort_timer => {
                    let list = state.lock().unwrap().sort();
                    Self::publish(&events, ScanEvent::DevicesUpdated(list)).await;
                    sort_deadline = None;
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    }

    /// Stop scanning, cancel any pending re-sort and publish a final
    /// sorted list.
    pub async fn stop_scan(&mut self) {
        info!("Stopping bluetooth scan.");
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            match handle.await {
                Ok(()) => info!("Scan task finished after cancellation."),
                Err(e) if e.is_cancelled() => info!("Scan task was cancelled."),
                Err(e) => error!("Scan task finished with a join error: {e:?}"),
            }
        }

        let list = self.state.lock().unwrap().sort();
        Self::publish(&self.events, ScanEvent::DevicesUpdated(list)).await;
    }

    async fn publish(events: &mpsc::Sender<ScanEvent>, event: ScanEvent) {
        if let Err(e) = events.send(event).await {
            error!("Failed to publish scan event: {e}");
        }
    }
}
