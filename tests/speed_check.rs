//! End-to-end speed-check benchmark over the in-memory radio: an initiator
//! registry on one mock radio is wired into a responder server on another,
//! so every central-role write arrives as a tagged client write.

use std::sync::Arc;

use blebench::core::bluetooth::connection::ConnectionRegistry;
use blebench::core::bluetooth::constants::{
    SPEED_CHECK_PACKET_SIZE, UUID_SPEED_CHECK_CHARACTERISTIC, UUID_SPEED_CHECK_SERVICE,
};
use blebench::core::bluetooth::mock::MockRadio;
use blebench::core::bluetooth::server::{GattServerEvent, GattServerSession};
use blebench::core::bluetooth::speedcheck::{encode_control, SpeedCheckRunner};
use blebench::core::bluetooth::types::{
    GattCharacteristicDescriptor, GattServiceDescriptor, ServiceType, WriteType, PERMISSION_WRITE,
    PROPERTY_WRITE,
};
use blebench::error::SpeedCheckError;

const RESPONDER: &str = "AA:BB:CC:DD:EE:FF";
const INITIATOR: &str = "11:22:33:44:55:66";

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

struct Bench {
    server: GattServerSession,
    server_events: tokio::sync::mpsc::Receiver<GattServerEvent>,
    central_radio: MockRadio,
    registry: ConnectionRegistry,
}

/// Start a responder server, connect the initiator registry and wire the
/// central's writes into the server's event stream.
async fn wire_bench() -> Bench {
    let server_radio = MockRadio::new();
    let (server, mut server_events) = GattServerSession::new(Arc::new(server_radio.clone()));
    server.start().await.unwrap();
    assert!(matches!(
        server_events.recv().await,
        Some(GattServerEvent::Started)
    ));
    server_radio
        .inject_client_connected(INITIATOR, Some("Initiator"))
        .await;
    assert!(matches!(
        server_events.recv().await,
        Some(GattServerEvent::ClientConnected(_))
    ));

    let central_radio = MockRadio::new();
    central_radio.add_device_with_services(RESPONDER, Some("Responder"), speed_check_services());
    central_radio.forward_writes_to(server_radio.server_event_sender().unwrap(), INITIATOR);

    let (registry, mut connection_events) = ConnectionRegistry::new(Arc::new(central_radio.clone()));
    registry.connect(RESPONDER).await.unwrap();
    let _ = connection_events.recv().await;

    Bench {
        server,
        server_events,
        central_radio,
        registry,
    }
}

#[tokio::test]
async fn a_one_mebibyte_run_delivers_2048_packets_after_the_control_frame() {
    let mut bench = wire_bench().await;
    let (runner, progress) = SpeedCheckRunner::new(bench.registry.clone());

    let run = tokio::spawn(async move {
        runner.run(RESPONDER, 1.0, WriteType::WithoutResponse).await
    });

    // The responder must observe the control frame first, then count every
    // data packet.
    let mut first = true;
    let mut received = 0;
    while received < 2048 {
        match bench.server_events.recv().await {
            Some(GattServerEvent::SpeedCheckProgress { address, state }) => {
                assert_eq!(address, INITIATOR);
                if first {
                    assert_eq!(state.packets_received, 0);
                    assert_eq!(state.total_packets, 2048);
                    assert_eq!(state.bytes_received, 0);
                    first = false;
                }
                assert_eq!(state.total_packets, 2048);
                received = state.packets_received;
            }
            other => panic!("expected SpeedCheckProgress, got {other:?}"),
        }
    }

    let state = run.await.unwrap().unwrap();
    assert_eq!(state.packets_sent, 2048);
    assert_eq!(state.total_packets, 2048);
    assert_eq!(state.bytes_sent, 1024 * 1024);
    assert!(state.throughput_bytes_per_second.is_some());
    assert!(state.error.is_none());
    assert_eq!(progress.borrow().packets_sent, 2048);

    let responder_state = bench.server.speed_check_state(INITIATOR).unwrap();
    assert_eq!(responder_state.packets_received, 2048);
    assert_eq!(responder_state.total_packets, 2048);
    assert_eq!(
        responder_state.bytes_received,
        2048 * SPEED_CHECK_PACKET_SIZE as u64
    );

    // Exactly one control frame plus 2048 data packets left the initiator,
    // in that order.
    let writes = bench.central_radio.writes();
    assert_eq!(writes.len(), 2049);
    assert_eq!(writes[0].value, encode_control(2048).to_vec());
    assert!(writes[1..]
        .iter()
        .all(|write| write.value.len() == SPEED_CHECK_PACKET_SIZE));
}

#[tokio::test]
async fn a_failed_write_aborts_the_run_and_reports_the_packet_index() {
    let mut bench = wire_bench().await;
    let (runner, _progress) = SpeedCheckRunner::new(bench.registry.clone());

    // Write 0 is the control frame, so data packet 5 is write 6.
    bench.central_radio.fail_write_at(RESPONDER, 6);

    let run = tokio::spawn(async move {
        // 8 KiB => 16 packets.
        runner.run(RESPONDER, 8.0 / 1024.0, WriteType::WithResponse).await
    });

    // Drain responder progress until the run aborts.
    let mut received = 0;
    while received < 5 {
        match bench.server_events.recv().await {
            Some(GattServerEvent::SpeedCheckProgress { state, .. }) => {
                received = state.packets_received;
            }
            other => panic!("expected SpeedCheckProgress, got {other:?}"),
        }
    }

    match run.await.unwrap() {
        Err(SpeedCheckError::WriteFailed { index, .. }) => assert_eq!(index, 5),
        other => panic!("expected WriteFailed, got {other:?}"),
    }

    // The responder keeps its partial, passive count.
    let state = bench.server.speed_check_state(INITIATOR).unwrap();
    assert_eq!(state.total_packets, 16);
    assert_eq!(state.packets_received, 5);
}
