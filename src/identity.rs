//! Hub identity parsing and validation.
//!
//! The hub reports its identity as a UTF-8 JSON object read from the
//! identity characteristic. Validation is a strict allow-list: only a
//! payload carrying the exact SmartTuppleware product signature and a
//! non-empty device id is accepted. Anything else is rejected so the
//! library never provisions an unrelated or spoofed peripheral.

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Expected `type` field of the identity payload.
pub const EXPECTED_TYPE: &str = "SMARTTUPPLEWARE_HUB";
/// Expected `vendor` field of the identity payload.
pub const EXPECTED_VENDOR: &str = "ZHAW";
/// Expected `model` field of the identity payload.
pub const EXPECTED_MODEL: &str = "DVHUB";

/// Raw identity payload as sent by the hub.
#[derive(Debug, Deserialize)]
struct RawIdentity {
    #[serde(rename = "type")]
    device_type: String,
    vendor: String,
    model: String,
    fw: String,
    device_id: String,
}

/// A validated hub identity.
///
/// Only produced by [`HubIdentity::validate`]; immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubIdentity {
    /// Unique hub identifier (e.g. "hub-001"). Never empty.
    device_id: String,
    /// Firmware version string as reported by the hub.
    firmware_version: String,
    /// Vendor name, always [`EXPECTED_VENDOR`].
    vendor: String,
    /// Model name, always [`EXPECTED_MODEL`].
    model: String,
}

impl HubIdentity {
    /// Validate a raw identity payload.
    ///
    /// Decodes `raw` as UTF-8 JSON and accepts it only when `type`,
    /// `vendor` and `model` exactly match the product signature and
    /// `device_id` is non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentity`] for malformed UTF-8 or JSON,
    /// missing fields, a signature mismatch, or an empty device id.
    pub fn validate(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw).map_err(|_| Error::InvalidIdentity {
            context: "payload is not valid UTF-8".to_string(),
        })?;

        let parsed: RawIdentity =
            serde_json::from_str(text).map_err(|e| Error::InvalidIdentity {
                context: format!("payload is not a valid identity object: {}", e),
            })?;

        if parsed.device_type != EXPECTED_TYPE {
            debug!("Rejecting identity with type {:?}", parsed.device_type);
            return Err(Error::InvalidIdentity {
                context: format!("unexpected type {:?}", parsed.device_type),
            });
        }

        if parsed.vendor != EXPECTED_VENDOR {
            debug!("Rejecting identity with vendor {:?}", parsed.vendor);
            return Err(Error::InvalidIdentity {
                context: format!("unexpected vendor {:?}", parsed.vendor),
            });
        }

        if parsed.model != EXPECTED_MODEL {
            debug!("Rejecting identity with model {:?}", parsed.model);
            return Err(Error::InvalidIdentity {
                context: format!("unexpected model {:?}", parsed.model),
            });
        }

        if parsed.device_id.is_empty() {
            return Err(Error::InvalidIdentity {
                context: "empty device_id".to_string(),
            });
        }

        Ok(Self {
            device_id: parsed.device_id,
            firmware_version: parsed.fw,
            vendor: parsed.vendor,
            model: parsed.model,
        })
    }

    /// The hub's unique device id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The hub's firmware version string.
    pub fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    /// The hub's vendor name.
    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    /// The hub's model name.
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Display for HubIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} (fw {})",
            self.vendor, self.model, self.device_id, self.firmware_version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn payload(device_type: &str, vendor: &str, model: &str, device_id: &str) -> Vec<u8> {
        format!(
            r#"{{"type":"{}","vendor":"{}","model":"{}","fw":"1.0","device_id":"{}"}}"#,
            device_type, vendor, model, device_id
        )
        .into_bytes()
    }

    #[test]
    fn test_valid_identity() {
        let raw = payload("SMARTTUPPLEWARE_HUB", "ZHAW", "DVHUB", "abc");
        let identity = HubIdentity::validate(&raw).unwrap();
        assert_eq!(identity.device_id(), "abc");
        assert_eq!(identity.firmware_version(), "1.0");
        assert_eq!(identity.vendor(), "ZHAW");
        assert_eq!(identity.model(), "DVHUB");
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let raw = payload("OTHER_HUB", "ZHAW", "DVHUB", "abc");
        assert!(matches!(
            HubIdentity::validate(&raw),
            Err(Error::InvalidIdentity { .. })
        ));
    }

    #[test]
    fn test_vendor_mismatch_rejected() {
        let raw = payload("SMARTTUPPLEWARE_HUB", "ACME", "DVHUB", "abc");
        assert!(HubIdentity::validate(&raw).is_err());
    }

    #[test]
    fn test_model_mismatch_rejected() {
        let raw = payload("SMARTTUPPLEWARE_HUB", "ZHAW", "DVHUB2", "abc");
        assert!(HubIdentity::validate(&raw).is_err());
    }

    #[test]
    fn test_empty_device_id_rejected() {
        let raw = payload("SMARTTUPPLEWARE_HUB", "ZHAW", "DVHUB", "");
        assert!(HubIdentity::validate(&raw).is_err());
    }

    #[test]
    fn test_missing_field_rejected() {
        let raw = br#"{"type":"SMARTTUPPLEWARE_HUB","vendor":"ZHAW","model":"DVHUB"}"#;
        assert!(HubIdentity::validate(raw).is_err());
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(HubIdentity::validate(b"{not json").is_err());
        assert!(HubIdentity::validate(b"").is_err());
        assert!(HubIdentity::validate(b"42").is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        assert!(HubIdentity::validate(&[0xff, 0xfe, 0x80]).is_err());
    }

    #[test]
    fn test_display() {
        let raw = payload("SMARTTUPPLEWARE_HUB", "ZHAW", "DVHUB", "hub-001");
        let identity = HubIdentity::validate(&raw).unwrap();
        assert_eq!(format!("{}", identity), "ZHAW DVHUB hub-001 (fw 1.0)");
    }
}
