//! Error types for the smarttuppleware-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The specified hub was not found among discovered sightings.
    #[error("Hub not found: {identifier}")]
    HubNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Operation requires a live session but none is connected.
    #[error("Hub not connected")]
    NotConnected,

    /// Failed to establish a connection to the hub.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection to the hub was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// The connected peripheral does not expose the hub service or its
    /// identity characteristic. This is a permanent mismatch for that
    /// device, not a retryable failure.
    #[error("Not a recognized hub device")]
    NotRecognizedHub,

    /// The hub's identity payload failed validation.
    #[error("Invalid hub identity: {context}")]
    InvalidIdentity {
        /// Description of what was invalid about the payload.
        context: String,
    },

    /// The hub rejected the pairing token write.
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed {
        /// Description of why authentication failed.
        reason: String,
    },

    /// A GATT operation did not complete within its bounded wait.
    #[error("Operation timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// The BLE scan could not be started. Recoverable; the caller may retry.
    #[error("Scan failed to start: {reason}")]
    ScanFailed {
        /// Description of why the scan could not start.
        reason: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
