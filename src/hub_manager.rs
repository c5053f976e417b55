//! Hub manager: discovery plus the single live pairing session.
//!
//! The manager is the collaborator-facing surface of the crate. It owns
//! the scanner and at most one [`PairingSession`]; starting a connection
//! to a new hub always fully tears down the previous session first, so
//! exactly one transport connection is ever live.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::ble::scanner::{HubScanner, HubSighting, ScannerEvent, DEFAULT_SCAN_WINDOW};
use crate::ble::transport::{BleTransport, HubTransport};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::identity::HubIdentity;
use crate::session::{PairingSession, SessionConfig};

/// Holder for the one live pairing session.
///
/// Replacing the occupant tears the previous session down completely
/// (transport released, flags and pending credentials cleared) before the
/// next session starts connecting. The slot is its own type so
/// collaborators that bring their own transport can use it without the
/// scanner.
#[derive(Default)]
pub struct SessionSlot {
    inner: tokio::sync::Mutex<Option<Arc<PairingSession>>>,
}

impl SessionSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new session over `transport`, superseding any live one.
    pub async fn replace(
        &self,
        transport: Arc<dyn HubTransport>,
        config: SessionConfig,
    ) -> Arc<PairingSession> {
        let mut slot = self.inner.lock().await;

        if let Some(previous) = slot.take() {
            info!("Superseding live session, tearing it down first");
            previous.shutdown().await;
        }

        let session = PairingSession::start(transport, config);
        *slot = Some(session.clone());
        session
    }

    /// Tear down the current session, if any.
    pub async fn close(&self) {
        let previous = self.inner.lock().await.take();
        if let Some(session) = previous {
            session.shutdown().await;
        }
    }

    /// Get the current session, if any.
    pub fn current(&self) -> Option<Arc<PairingSession>> {
        // Non-blocking view; a contended lock means a replace is in
        // flight and the slot is effectively empty for observers.
        self.inner.try_lock().ok().and_then(|slot| slot.clone())
    }
}

/// Central manager for discovering and provisioning hubs.
pub struct HubManager {
    /// BLE scanner.
    scanner: Arc<HubScanner>,
    /// The single live session.
    slot: SessionSlot,
    /// Configuration applied to every new session.
    session_config: SessionConfig,
}

impl HubManager {
    /// Create a new manager.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let scanner = HubScanner::new().await?;
        Ok(Self::with_scanner(scanner))
    }

    /// Create a manager around an existing scanner.
    pub fn with_scanner(scanner: HubScanner) -> Self {
        Self {
            scanner: Arc::new(scanner),
            slot: SessionSlot::new(),
            session_config: SessionConfig::default(),
        }
    }

    /// Override the configuration used for new sessions.
    pub fn set_session_config(&mut self, config: SessionConfig) {
        self.session_config = config;
    }

    /// Start a scan with the default window.
    pub async fn start_scan(&self) -> Result<()> {
        self.scanner.start_scan(DEFAULT_SCAN_WINDOW).await
    }

    /// Start a scan that auto-stops after `window`.
    pub async fn start_scan_with_window(&self, window: Duration) -> Result<()> {
        self.scanner.start_scan(window).await
    }

    /// Stop scanning. Idempotent.
    pub async fn stop_scan(&self) -> Result<()> {
        self.scanner.stop_scan().await
    }

    /// Snapshot of the current scan window's sightings.
    pub fn sightings(&self) -> Vec<HubSighting> {
        self.scanner.sightings()
    }

    /// Subscribe to scanner events.
    pub fn subscribe_scanner(&self) -> broadcast::Receiver<ScannerEvent> {
        self.scanner.subscribe()
    }

    /// Connect to a sighted hub and start pairing.
    ///
    /// Any previous session is fully torn down before the new connection
    /// begins. Progress is reported through the returned session's
    /// events.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HubNotFound`] if `identifier` was not sighted in
    /// the current scan window.
    pub async fn connect(&self, identifier: &str) -> Result<Arc<PairingSession>> {
        let peripheral =
            self.scanner
                .peripheral(identifier)
                .ok_or_else(|| Error::HubNotFound {
                    identifier: identifier.to_string(),
                })?;

        info!("Connecting to hub {}", identifier);

        let transport = Arc::new(BleTransport::new(
            self.scanner.adapter().clone(),
            peripheral,
        ));
        Ok(self.connect_transport(transport).await)
    }

    /// Start pairing over a pre-built transport.
    ///
    /// The injection seam for platforms (and tests) that construct their
    /// own [`HubTransport`].
    pub async fn connect_transport(
        &self,
        transport: Arc<dyn HubTransport>,
    ) -> Arc<PairingSession> {
        self.slot
            .replace(transport, self.session_config.clone())
            .await
    }

    /// Submit Wi-Fi credentials to the connected hub.
    ///
    /// Buffered until the session is ready if pairing is still in
    /// progress; the outcome arrives via
    /// [`SessionEvent::CredentialsSent`](crate::session::SessionEvent::CredentialsSent).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if there is no live session, or
    /// [`Error::InvalidParameter`] for an empty SSID.
    pub fn submit_credentials(&self, ssid: &str, password: &str) -> Result<()> {
        let session = self.slot.current().ok_or(Error::NotConnected)?;
        session.submit_credentials(Credentials::new(ssid, password)?)
    }

    /// Disconnect the live session, if any.
    pub async fn disconnect(&self) {
        self.slot.close().await;
    }

    /// Check if a session is connected and usable.
    pub fn is_connected(&self) -> bool {
        self.slot
            .current()
            .map(|session| session.is_connected())
            .unwrap_or(false)
    }

    /// Get the verified identity of the connected hub, if any.
    pub fn current_identity(&self) -> Option<HubIdentity> {
        self.slot.current().and_then(|session| session.current_identity())
    }

    /// Get the live session, if any.
    pub fn session(&self) -> Option<Arc<PairingSession>> {
        self.slot.current()
    }

    /// Clean shutdown of the session and scanning.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down hub manager");

        if let Err(e) = self.stop_scan().await {
            warn!("Error stopping scan during shutdown: {}", e);
        }

        self.slot.close().await;
        Ok(())
    }
}
