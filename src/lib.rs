// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # smarttuppleware-ble
//!
//! A cross-platform Rust library for pairing ZHAW SmartTuppleware hubs
//! over Bluetooth Low Energy and provisioning them with Wi-Fi
//! credentials.
//!
//! The library discovers nearby hubs, verifies a hub's self-reported
//! identity against the SmartTuppleware product signature, authenticates
//! with the hub's pairing token, and writes Wi-Fi credentials over GATT.
//! Every peripheral that does not present the exact expected signature is
//! rejected, so credentials are never sent to an unrelated or spoofed
//! device.
//!
//! ## Features
//!
//! - **Hub Discovery**: Bounded scan windows with per-device deduplicated
//!   sightings
//! - **Identity Verification**: Strict allow-list validation of the hub's
//!   identity payload
//! - **Pairing Sessions**: One connection at a time, driven through a
//!   sequenced connect → discover → verify → authenticate → provision
//!   state machine with per-step timeouts
//! - **Credential Provisioning**: Buffered submission that dispatches the
//!   moment the session is ready
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smarttuppleware_ble::{HubManager, Result, SessionEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Create the manager and scan for hubs
//!     let manager = HubManager::new().await?;
//!     manager.start_scan().await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     // Connect to the first sighted hub
//!     let sighting = manager
//!         .sightings()
//!         .into_iter()
//!         .next()
//!         .expect("no hub found");
//!     let session = manager.connect(&sighting.identifier).await?;
//!     let mut events = session.subscribe();
//!
//!     // Credentials are buffered until the session is ready
//!     manager.submit_credentials("HomeNet", "hunter2")?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             SessionEvent::HubVerified(identity) => {
//!                 println!("Verified hub: {}", identity);
//!             }
//!             SessionEvent::CredentialsSent { success, reason } => {
//!                 println!("Credentials sent: {} {:?}", success, reason);
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod credentials;
pub mod error;
pub mod hub_manager;
pub mod identity;
pub mod session;

// Re-exports for convenience
pub use credentials::Credentials;
pub use error::{Error, Result};
pub use hub_manager::{HubManager, SessionSlot};
pub use identity::HubIdentity;
pub use session::{CallbackHandle, PairingSession, PairingState, SessionConfig, SessionEvent};

// Re-export commonly used types from submodules
pub use ble::scanner::{HubScanner, HubSighting, ScannerEvent, DEFAULT_SCAN_WINDOW};
pub use ble::transport::{BleTransport, EndpointInventory, HubTransport};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<HubManager>();
        let _ = std::any::TypeId::of::<PairingSession>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<HubIdentity>();
        let _ = std::any::TypeId::of::<Credentials>();
        let _ = std::any::TypeId::of::<HubSighting>();
        let _ = std::any::TypeId::of::<SessionConfig>();
    }

    #[test]
    fn test_default_session_config() {
        let config = SessionConfig::default();
        assert!(config.connect_timeout > config.step_timeout);
        assert_eq!(config.pairing_token, ble::uuids::DEFAULT_PAIRING_TOKEN);
    }
}
