//! Wi-Fi credentials and their wire encoding.
//!
//! Credentials exist only for the duration of one submission attempt and
//! are never persisted. The wire payload is the UTF-8 JSON object the hub
//! firmware parses: `{"ssid": "...", "password": "..."}`.

use serde::Serialize;

use crate::error::{Error, Result};

/// Wi-Fi credentials to provision onto a hub.
#[derive(Clone, Serialize, PartialEq, Eq)]
pub struct Credentials {
    ssid: String,
    password: String,
}

impl Credentials {
    /// Create credentials for submission.
    ///
    /// The password may be empty (open networks).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if `ssid` is empty.
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let ssid = ssid.into();
        if ssid.is_empty() {
            return Err(Error::InvalidParameter {
                name: "ssid".to_string(),
                value: "<empty>".to_string(),
            });
        }

        Ok(Self {
            ssid,
            password: password.into(),
        })
    }

    /// The network SSID.
    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    /// Serialize to the wire payload written to the credentials
    /// characteristic.
    pub fn to_wire_payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Internal(format!("credential encode: {}", e)))
    }
}

// Keep passwords out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}
