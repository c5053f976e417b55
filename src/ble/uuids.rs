//! BLE Service and Characteristic UUIDs.
//!
//! Contains all UUID constants used for SmartTuppleware hub communication,
//! plus the fixed strings the hub firmware expects on the wire.

use uuid::Uuid;

// SmartTuppleware Hub Service (ZHAW Custom)
/// SmartTuppleware hub primary service UUID.
pub const HUB_SERVICE_UUID: Uuid = Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef0);
/// Scratch value characteristic UUID (Read, Write). Present on hub firmware
/// but not used by the pairing protocol.
pub const SCRATCH_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef1);
/// Wi-Fi credentials characteristic UUID (Write).
pub const WIFI_CREDENTIALS_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef2);
/// Hub identity characteristic UUID (Read).
pub const HUB_IDENTITY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef3);
/// Auth characteristic UUID (Write). Optional on older hub firmware.
pub const AUTH_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x12345678_1234_5678_1234_56789abcdef4);

/// Local name the hub advertises.
pub const HUB_LOCAL_NAME: &str = "SMARTTUPPLEWARE_HUB";

/// Pre-shared pairing token written to the auth characteristic.
///
/// A fixed shared secret, matching the hub firmware's default. This is the
/// existing wire contract, not an authentication scheme to build on.
pub const DEFAULT_PAIRING_TOKEN: &str = "pair-token-123";

/// Check if a service UUID is the SmartTuppleware hub service.
pub fn is_hub_service(uuid: &Uuid) -> bool {
    *uuid == HUB_SERVICE_UUID
}
