//! BLE communication module.
//!
//! This module provides low-level Bluetooth Low Energy functionality
//! for discovering and communicating with SmartTuppleware hubs.

pub mod scanner;
pub mod transport;
pub mod uuids;

pub use scanner::{HubScanner, HubSighting, ScannerEvent, SightingRegistry};
pub use transport::{BleTransport, EndpointInventory, HubTransport};
pub use uuids::*;
