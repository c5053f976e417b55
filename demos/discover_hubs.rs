//! Basic example: Discover all nearby SmartTuppleware hubs
//!
//! Run with: cargo run --example discover_hubs

use smarttuppleware_ble::{HubManager, Result, ScannerEvent};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("smarttuppleware_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Starting SmartTuppleware hub discovery...");
    println!("Make sure your hub is powered and advertising.\n");

    let manager = HubManager::new().await?;
    let mut events = manager.subscribe_scanner();

    manager
        .start_scan_with_window(Duration::from_secs(30))
        .await?;

    println!("Scanning for 30 seconds...");
    println!("Press Ctrl+C to exit early.\n");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ScannerEvent::SightingsChanged(sighting)) => {
                    println!(
                        "Sighted hub: {} (name: {:?}, RSSI: {:?} dBm)",
                        sighting.identifier, sighting.name, sighting.rssi
                    );
                }
                Ok(ScannerEvent::ScanComplete) => {
                    println!("\nScan window elapsed.");
                    break;
                }
                Err(_) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted!");
                break;
            }
        }
    }

    println!("\n--- Scan Complete ---");
    println!("Total hubs found: {}", manager.sightings().len());
    for sighting in manager.sightings() {
        println!(
            "  {} - {:?} (RSSI: {:?})",
            sighting.identifier, sighting.name, sighting.rssi
        );
    }

    manager.shutdown().await?;
    println!("\nDone!");

    Ok(())
}
