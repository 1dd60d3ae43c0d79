//! Speed-check protocol: framing, initiator and responder.
//!
//! The benchmark measures one-directional application-level throughput over
//! a GATT write channel. A run opens with a 5-byte control frame announcing
//! the total packet count, followed by fixed-size data packets written
//! strictly one at a time; the initiator waits for each write to complete
//! before issuing the next, so the responder observes packets in order and
//! can attribute byte counts deterministically.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::watch;

use crate::core::bluetooth::connection::ConnectionRegistry;
use crate::core::bluetooth::constants::{
    SPEED_CHECK_CONTROL_LEN, SPEED_CHECK_CONTROL_MAGIC, SPEED_CHECK_PACKET_SIZE,
    UUID_SPEED_CHECK_CHARACTERISTIC, UUID_SPEED_CHECK_SERVICE,
};
use crate::core::bluetooth::types::WriteType;
use crate::error::SpeedCheckError;

/// Encode a control frame announcing the total packet count.
pub fn encode_control(total_packets: i32) -> [u8; SPEED_CHECK_CONTROL_LEN] {
    let mut frame = [0u8; SPEED_CHECK_CONTROL_LEN];
    frame[0] = SPEED_CHECK_CONTROL_MAGIC;
    frame[1..].copy_from_slice(&total_packets.to_le_bytes());
    frame
}

/// Decode a control frame. Returns `None` for anything that is not a
/// control frame (wrong length or leading byte); such writes are data.
pub fn decode_control(data: &[u8]) -> Option<i32> {
    if data.len() != SPEED_CHECK_CONTROL_LEN || data[0] != SPEED_CHECK_CONTROL_MAGIC {
        return None;
    }
    Some(i32::from_le_bytes([data[1], data[2], data[3], data[4]]))
}

/// Live progress of an initiator-side benchmark run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeedCheckState {
    pub is_running: bool,
    pub packets_sent: i32,
    pub total_packets: i32,
    pub bytes_sent: u64,
    pub elapsed_ms: u64,
    pub throughput_bytes_per_second: Option<f64>,
    pub error: Option<String>,
}

/// Drives a benchmark run against a ready connection.
pub struct SpeedCheckRunner {
    registry: ConnectionRegistry,
    progress: watch::Sender<SpeedCheckState>,
}

impl SpeedCheckRunner {
    pub fn new(registry: ConnectionRegistry) -> (Self, watch::Receiver<SpeedCheckState>) {
        let (progress, receiver) = watch::channel(SpeedCheckState::default());
        (Self { registry, progress }, receiver)
    }

    /// Run a benchmark of `total_megabytes` against `address`, writing
    /// fixed-size packets with the given write type. Writes are issued one
    /// at a time; the first failure aborts the run with the failing packet
    /// index. Returns the final state on completion.
    pub async fn run(
        &self,
        address: &str,
        total_megabytes: f64,
        write_type: WriteType,
    ) -> Result<SpeedCheckState, SpeedCheckError> {
        if !(total_megabytes > 0.0) {
            return Err(SpeedCheckError::InvalidSize);
        }
        let total_bytes = (total_megabytes * 1024.0 * 1024.0) as u64;
        let total_packets = (total_bytes / SPEED_CHECK_PACKET_SIZE as u64) as i32;
        // Payload content carries no meaning to the protocol.
        let packet: Vec<u8> = (0..SPEED_CHECK_PACKET_SIZE).map(|i| i as u8).collect();

        info!(
            "speed check: {address} total_packets={total_packets} write_type={write_type:?}"
        );
        self.progress.send_replace(SpeedCheckState {
            is_running: true,
            total_packets,
            ..SpeedCheckState::default()
        });

        let started = Instant::now();

        // The control frame must be observed by the responder before any
        // data packet, so its completion is awaited before proceeding.
        let control = encode_control(total_packets);
        if let Err(e) = self
            .registry
            .write_characteristic(
                address,
                UUID_SPEED_CHECK_SERVICE,
                UUID_SPEED_CHECK_CHARACTERISTIC,
                &control,
                write_type,
            )
            .await
        {
            warn!("speed check: control frame write failed: {e}");
            let error = SpeedCheckError::ControlWriteFailed(e);
            self.progress.send_replace(SpeedCheckState {
                total_packets,
                error: Some(error.to_string()),
                ..SpeedCheckState::default()
            });
            return Err(error);
        }

        let mut packets_sent: i32 = 0;
        for index in 0..total_packets as usize {
            if let Err(e) = self
                .registry
                .write_characteristic(
                    address,
                    UUID_SPEED_CHECK_SERVICE,
                    UUID_SPEED_CHECK_CHARACTERISTIC,
                    &packet,
                    write_type,
                )
                .await
            {
                warn!("speed check: write failed at packet {index}: {e}");
                let error = SpeedCheckError::WriteFailed { index, source: e };
                self.progress.send_replace(SpeedCheckState {
                    packets_sent,
                    total_packets,
                    bytes_sent: packets_sent as u64 * SPEED_CHECK_PACKET_SIZE as u64,
                    error: Some(error.to_string()),
                    ..SpeedCheckState::default()
                });
                return Err(error);
            }
            packets_sent += 1;
            self.progress.send_replace(SpeedCheckState {
                is_running: true,
                packets_sent,
                total_packets,
                bytes_sent: packets_sent as u64 * SPEED_CHECK_PACKET_SIZE as u64,
                ..SpeedCheckState::default()
            });
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let bytes_sent = packets_sent as u64 * SPEED_CHECK_PACKET_SIZE as u64;
        let throughput = if elapsed_ms > 0 {
            bytes_sent as f64 * 1000.0 / elapsed_ms as f64
        } else {
            0.0
        };
        let state = SpeedCheckState {
            is_running: false,
            packets_sent,
            total_packets,
            bytes_sent,
            elapsed_ms,
            throughput_bytes_per_second: Some(throughput),
            error: None,
        };
        info!(
            "speed check: done, {bytes_sent} bytes in {elapsed_ms} ms ({throughput:.0} B/s)"
        );
        self.progress.send_replace(state.clone());
        Ok(state)
    }
}

/// Responder-side view of one client's benchmark run. A passive counter:
/// an external observer reads it against `total_packets` to judge progress.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSpeedCheckState {
    pub is_running: bool,
    pub packets_received: i32,
    pub total_packets: i32,
    pub bytes_received: u64,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// Accumulates speed-check writes per client address.
#[derive(Debug, Default)]
pub struct SpeedCheckAccumulator {
    by_client: HashMap<String, ServerSpeedCheckState>,
}

impl SpeedCheckAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one write on the speed-check channel and fold it into the
    /// client's state, returning the updated view.
    pub fn on_write(&mut self, address: &str, data: &[u8]) -> ServerSpeedCheckState {
        let now = Utc::now();
        let state = if let Some(total_packets) = decode_control(data) {
            // Control frame: (re)initialize the run for this client.
            debug!("speed check: control frame from {address}, total_packets={total_packets}");
            ServerSpeedCheckState {
                is_running: true,
                packets_received: 0,
                total_packets,
                bytes_received: 0,
                started_at: now,
                last_update: now,
            }
        } else {
            match self.by_client.get(address) {
                Some(current) if current.is_running => ServerSpeedCheckState {
                    packets_received: current.packets_received + 1,
                    bytes_received: current.bytes_received + data.len() as u64,
                    last_update: now,
                    ..current.clone()
                },
                // Data with no prior control frame (e.g. the control frame
                // was dropped): count it anyway with an unknown total.
                _ => ServerSpeedCheckState {
                    is_running: true,
                    packets_received: 1,
                    total_packets: 0,
                    bytes_received: data.len() as u64,
                    started_at: now,
                    last_update: now,
                },
            }
        };
        self.by_client.insert(address.to_string(), state.clone());
        state
    }

    pub fn state(&self, address: &str) -> Option<&ServerSpeedCheckState> {
        self.by_client.get(address)
    }

    pub fn states(&self) -> &HashMap<String, ServerSpeedCheckState> {
        &self.by_client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::bluetooth::mock::MockRadio;
    use crate::core::bluetooth::types::{
        GattCharacteristicDescriptor, GattServiceDescriptor, ServiceType, PERMISSION_WRITE,
        PROPERTY_WRITE,
    };

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn speed_check_services() -> Vec<GattServiceDescriptor> {
        vec![GattServiceDescriptor {
            uuid: UUID_SPEED_CHECK_SERVICE,
            service_type: ServiceType::Primary,
            characteristics: vec![GattCharacteristicDescriptor {
                uuid: UUID_SPEED_CHECK_CHARACTERISTIC,
                properties: PROPERTY_WRITE,
                permissions: PERMISSION_WRITE,
            }],
        }]
    }

    async fn ready_registry(radio: &MockRadio) -> ConnectionRegistry {
        radio.add_device_with_services(ADDR, Some("Responder"), speed_check_services());
        let (registry, mut events) = ConnectionRegistry::new(Arc::new(radio.clone()));
        registry.connect(ADDR).await.unwrap();
        let _ = events.recv().await;
        registry
    }

    #[test]
    fn control_frames_round_trip() {
        for n in [0, 1, 2048, i32::MAX] {
            assert_eq!(decode_control(&encode_control(n)), Some(n));
        }
    }

    #[test]
    fn control_frame_layout_is_magic_then_little_endian_count() {
        assert_eq!(encode_control(2048), [0xFF, 0x00, 0x08, 0x00, 0x00]);
    }

    #[test]
    fn non_control_writes_are_classified_as_data() {
        // Wrong length.
        assert_eq!(decode_control(&[0xFF, 0x00, 0x08, 0x00]), None);
        assert_eq!(decode_control(&[0xFF, 0x00, 0x08, 0x00, 0x00, 0x00]), None);
        // Wrong magic.
        assert_eq!(decode_control(&[0xFE, 0x00, 0x08, 0x00, 0x00]), None);
        assert_eq!(decode_control(&[]), None);
        // A full-size data packet is never a control frame.
        assert_eq!(decode_control(&[0u8; SPEED_CHECK_PACKET_SIZE]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn runner_sends_control_then_sequential_packets() {
        let radio = MockRadio::new();
        let registry = ready_registry(&radio).await;
        let (runner, progress) = SpeedCheckRunner::new(registry);

        // 2 KiB => exactly 4 packets.
        let state = runner
            .run(ADDR, 2.0 / 1024.0, WriteType::WithoutResponse)
            .await
            .unwrap();
        assert_eq!(state.packets_sent, 4);
        assert_eq!(state.bytes_sent, 4 * SPEED_CHECK_PACKET_SIZE as u64);
        assert!(state.throughput_bytes_per_second.is_some());
        assert!(!state.is_running);

        let writes = radio.writes();
        assert_eq!(writes.len(), 5);
        assert_eq!(writes[0].value, encode_control(4).to_vec());
        for write in &writes[1..] {
            assert_eq!(write.value.len(), SPEED_CHECK_PACKET_SIZE);
            assert_eq!(write.write_type, WriteType::WithoutResponse);
        }
        assert_eq!(progress.borrow().packets_sent, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn runner_aborts_on_the_first_failed_write() {
        let radio = MockRadio::new();
        let registry = ready_registry(&radio).await;
        let (runner, progress) = SpeedCheckRunner::new(registry);

        // Write 0 is the control frame; write 3 is data packet 2.
        radio.fail_write_at(ADDR, 3);
        let result = runner.run(ADDR, 2.0 / 1024.0, WriteType::WithResponse).await;
        match result {
            Err(SpeedCheckError::WriteFailed { index, .. }) => assert_eq!(index, 2),
            other => panic!("expected WriteFailed, got {other:?}"),
        }
        let state = progress.borrow().clone();
        assert!(!state.is_running);
        assert_eq!(state.packets_sent, 2);
        assert!(state.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn runner_rejects_a_non_positive_size() {
        let radio = MockRadio::new();
        let registry = ready_registry(&radio).await;
        let (runner, _progress) = SpeedCheckRunner::new(registry);
        assert!(matches!(
            runner.run(ADDR, 0.0, WriteType::WithResponse).await,
            Err(SpeedCheckError::InvalidSize)
        ));
    }

    #[test]
    fn accumulator_resets_on_a_control_frame() {
        let mut accumulator = SpeedCheckAccumulator::new();
        accumulator.on_write("client", &[0u8; SPEED_CHECK_PACKET_SIZE]);
        let state = accumulator.on_write("client", &encode_control(100));
        assert!(state.is_running);
        assert_eq!(state.packets_received, 0);
        assert_eq!(state.total_packets, 100);
        assert_eq!(state.bytes_received, 0);
    }

    #[test]
    fn accumulator_counts_data_packets() {
        let mut accumulator = SpeedCheckAccumulator::new();
        accumulator.on_write("client", &encode_control(2));
        accumulator.on_write("client", &[0u8; SPEED_CHECK_PACKET_SIZE]);
        let state = accumulator.on_write("client", &[0u8; SPEED_CHECK_PACKET_SIZE]);
        assert_eq!(state.packets_received, 2);
        assert_eq!(state.total_packets, 2);
        assert_eq!(state.bytes_received, 2 * SPEED_CHECK_PACKET_SIZE as u64);
    }

    #[test]
    fn data_without_a_control_frame_opens_an_unknown_total() {
        let mut accumulator = SpeedCheckAccumulator::new();
        let state = accumulator.on_write("client", &[0u8; SPEED_CHECK_PACKET_SIZE]);
        assert!(state.is_running);
        assert_eq!(state.packets_received, 1);
        assert_eq!(state.total_packets, 0);
        assert_eq!(state.bytes_received, SPEED_CHECK_PACKET_SIZE as u64);
    }

    #[test]
    fn accumulator_tracks_clients_independently() {
        let mut accumulator = SpeedCheckAccumulator::new();
        accumulator.on_write("one", &encode_control(10));
        accumulator.on_write("two", &[0u8; SPEED_CHECK_PACKET_SIZE]);
        assert_eq!(accumulator.state("one").unwrap().total_packets, 10);
        assert_eq!(accumulator.state("two").unwrap().total_packets, 0);
    }
}
