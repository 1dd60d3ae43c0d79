//! Demo binary: scan for a fixed window, print the ranked device table and
//! optionally connect to one device to dump its service table.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::info;

use blebench::config::ScanFilter;
use blebench::core::bluetooth::backend::BluestCentralRadio;
use blebench::core::bluetooth::connection::{ConnectionEvent, ConnectionRegistry};
use blebench::core::bluetooth::scanner::{ScanEvent, ScanRanker};
use blebench::logging;

const SCAN_WINDOW_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let radio = Arc::new(BluestCentralRadio::new().await?);
    let (mut ranker, mut scan_events) = ScanRanker::new(radio.clone());
    ranker.start_scan(&ScanFilter::default()).await?;
    info!("Scanning for {SCAN_WINDOW_SECS} seconds...");

    let scan_window = tokio::time::sleep(Duration::from_secs(SCAN_WINDOW_SECS));
    tokio::pin!(scan_window);
    loop {
        tokio::select! {
            _ = &mut scan_window => break,
            event = scan_events.recv() => match event {
                Some(ScanEvent::DevicesUpdated(devices)) => {
                    info!("{} devices discovered", devices.len());
                }
                Some(ScanEvent::Failed { code }) => {
                    return Err(anyhow!("scan failed with code {code}"));
                }
                None => break,
            }
        }
    }
    ranker.stop_scan().await;

    if std::env::var("BLEBENCH_JSON").is_ok() {
        println!("{}", serde_json::to_string_pretty(&ranker.devices())?);
    } else {
        println!("{:<40} {:>6} {:>9}  name", "address", "rssi", "smoothed");
        for device in ranker.devices() {
            println!(
                "{:<40} {:>6} {:>9.1}  {}",
                device.address, device.rssi, device.smoothed_rssi, device.name
            );
        }
    }

    // With an address argument, connect and dump the service table.
    if let Some(address) = std::env::args().nth(1) {
        let (registry, mut events) = ConnectionRegistry::new(radio);
        registry.connect(&address).await?;
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::DeviceConnected { name, .. } => {
                    println!("connected to {name} ({address})");
                    for service in &registry.connected_devices()[0].services {
                        println!("  service {}", service.uuid);
                        for characteristic in &service.characteristics {
                            println!(
                                "    characteristic {} [{}]",
                                characteristic.uuid,
                                characteristic.property_names().join(", ")
                            );
                        }
                    }
                    break;
                }
                ConnectionEvent::ConnectionFailed { reason, .. } => {
                    return Err(anyhow!("connection failed (reason {reason})"));
                }
                _ => {}
            }
        }
        registry.disconnect(&address).await?;
    }

    Ok(())
}
