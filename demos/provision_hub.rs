//! End-to-end example: pair with a hub and provision Wi-Fi credentials
//!
//! Run with: cargo run --example provision_hub -- <SSID> <PASSWORD>

use smarttuppleware_ble::{HubManager, Result, ScannerEvent, SessionEvent};
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

    let mut args = std::env::args().skip(1);
    let ssid = args.next().unwrap_or_else(|| {
        eprintln!("Usage: provision_hub <SSID> [PASSWORD]");
        std::process::exit(1);
    });
    let password = args.next().unwrap_or_default();

    println!("Scanning for a SmartTuppleware hub...");

    let manager = HubManager::new().await?;
    let mut scan_events = manager.subscribe_scanner();
    manager
        .start_scan_with_window(Duration::from_secs(15))
        .await?;

    // Connect to the first hub we sight
    let identifier = loop {
        match scan_events.recv().await {
            Ok(ScannerEvent::SightingsChanged(sighting)) => {
                println!(
                    "Found hub {} (RSSI: {:?} dBm)",
                    sighting.identifier, sighting.rssi
                );
                break sighting.identifier;
            }
            Ok(ScannerEvent::ScanComplete) => {
                eprintln!("No hub found within the scan window.");
                std::process::exit(1);
            }
            Err(_) => {
                eprintln!("Scanner stopped unexpectedly.");
                std::process::exit(1);
            }
        }
    };
    manager.stop_scan().await?;

    println!("Connecting to {}...", identifier);
    let session = manager.connect(&identifier).await?;
    let mut events = session.subscribe();

    // Buffered until the session reaches Ready
    manager.submit_credentials(&ssid, &password)?;

    while let Ok(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged(state) => {
                println!("  [{}]", state);
            }
            SessionEvent::HubVerified(identity) => {
                println!("Hub verified: {}", identity);
            }
            SessionEvent::CredentialsSent { success: true, .. } => {
                println!("Credentials delivered to {:?}!", ssid);
                break;
            }
            SessionEvent::CredentialsSent {
                success: false,
                reason,
            } => {
                eprintln!("Credential write failed: {:?}", reason);
                break;
            }
            SessionEvent::Ended { error } => {
                if let Some(error) = error {
                    eprintln!("Session ended: {}", error);
                }
                break;
            }
        }
    }

    manager.shutdown().await?;
    println!("Done!");

    Ok(())
}
