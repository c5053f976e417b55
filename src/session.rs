//! Pairing session state machine.
//!
//! A [`PairingSession`] owns one hub connection and drives it through
//! connect, service discovery, identity verification, authentication and
//! credential submission. All transport operations run on a single driver
//! task, so state transitions are processed one at a time and at most one
//! GATT operation is ever outstanding.
//!
//! Sessions are single-shot: once a session reaches
//! [`PairingState::Disconnected`] it is finished, and a new connection
//! requires a new session. This keeps the transport release path to
//! exactly one close per connection.

use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::ble::transport::HubTransport;
use crate::ble::uuids::DEFAULT_PAIRING_TOKEN;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::identity::HubIdentity;

/// State of a pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PairingState {
    /// Session created but not yet started.
    #[default]
    Idle,
    /// Opening the transport to the hub.
    Connecting,
    /// Enumerating GATT services and characteristics.
    DiscoveringServices,
    /// Reading the identity characteristic.
    ReadingIdentity,
    /// Writing the pairing token to the auth characteristic.
    Authenticating,
    /// Verified and authenticated; credentials may be submitted.
    Ready,
    /// A credential write is in flight.
    SendingCredentials,
    /// The hub acknowledged the credential write.
    Confirmed,
    /// Terminal state; transport released.
    Disconnected,
}

impl PairingState {
    /// Check if the session is connected and usable.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Ready | Self::SendingCredentials | Self::Confirmed)
    }

    /// Check if the session has terminated.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl std::fmt::Display for PairingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::ReadingIdentity => write!(f, "ReadingIdentity"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Ready => write!(f, "Ready"),
            Self::SendingCredentials => write!(f, "SendingCredentials"),
            Self::Confirmed => write!(f, "Confirmed"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Event emitted by a pairing session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session moved to a new state.
    StateChanged(PairingState),
    /// The hub's identity was read and validated.
    HubVerified(HubIdentity),
    /// A credential submission completed.
    CredentialsSent {
        /// Whether the hub acknowledged the write.
        success: bool,
        /// Human-readable failure reason, if any.
        reason: Option<String>,
    },
    /// The session terminated. `error` is `None` for an explicit
    /// disconnect.
    Ended {
        /// Human-readable failure reason, if any.
        error: Option<String>,
    },
}

/// Tunable parameters for a pairing session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bounded wait for the transport to report connected.
    pub connect_timeout: Duration,
    /// Bounded wait for each subsequent GATT operation.
    pub step_timeout: Duration,
    /// Pairing token written to the auth characteristic.
    pub pairing_token: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            step_timeout: Duration::from_secs(5),
            pairing_token: DEFAULT_PAIRING_TOKEN.to_string(),
        }
    }
}

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Commands from the session handle to the driver task.
enum Command {
    /// Re-check the pending credentials slot.
    Dispatch,
    /// Tear the session down.
    Disconnect,
}

/// Outcome of one driver step.
enum Flow {
    Continue,
    Cancelled,
    Fatal(Error),
}

/// One live pairing/provisioning session with a hub.
pub struct PairingSession {
    /// Transport to the hub, exclusively owned by this session.
    transport: Arc<dyn HubTransport>,
    /// Current state.
    state: Arc<RwLock<PairingState>>,
    /// Validated identity, once read.
    identity: Arc<RwLock<Option<HubIdentity>>>,
    /// Whether authentication completed (or was not required).
    authenticated: Arc<AtomicBool>,
    /// Single-slot buffer for a not-yet-dispatched submission.
    pending: Arc<Mutex<Option<Credentials>>>,
    /// Command channel to the driver task.
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// Session event channel.
    event_tx: broadcast::Sender<SessionEvent>,
    /// Driver task handle.
    driver_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl PairingSession {
    /// Start a session over the given transport.
    ///
    /// The returned session is already driving the pairing sequence;
    /// subscribe to events (or register callbacks) to observe progress.
    pub fn start(transport: Arc<dyn HubTransport>, config: SessionConfig) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(32);

        let session = Arc::new(Self {
            transport: transport.clone(),
            state: Arc::new(RwLock::new(PairingState::Idle)),
            identity: Arc::new(RwLock::new(None)),
            authenticated: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(None)),
            cmd_tx,
            event_tx: event_tx.clone(),
            driver_handle: Mutex::new(None),
            callback_counter: AtomicU64::new(0),
        });

        let driver = Driver {
            transport,
            config,
            state: session.state.clone(),
            identity: session.identity.clone(),
            authenticated: session.authenticated.clone(),
            pending: session.pending.clone(),
            cmd_rx,
            event_tx,
        };

        let handle = tokio::spawn(driver.run());
        *session.driver_handle.lock() = Some(handle);

        session
    }

    /// Get the current state.
    pub fn state(&self) -> PairingState {
        *self.state.read()
    }

    /// Check if the session is connected and usable.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Check if the session authenticated against the hub.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Get the verified hub identity, if the session has one.
    pub fn current_identity(&self) -> Option<HubIdentity> {
        self.identity.read().clone()
    }

    /// Submit Wi-Fi credentials for provisioning.
    ///
    /// If the session is not yet `Ready` the credentials are buffered
    /// (capacity one; a later call overwrites an undispatched earlier one)
    /// and dispatched the moment the session becomes ready. The outcome is
    /// reported via [`SessionEvent::CredentialsSent`]. Failed writes are
    /// not retried automatically; call again to retry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if the session has already
    /// terminated.
    pub fn submit_credentials(&self, credentials: Credentials) -> Result<()> {
        if self.state().is_terminal() {
            return Err(Error::NotConnected);
        }

        debug!("Buffering credential submission for {:?}", credentials.ssid());
        *self.pending.lock() = Some(credentials);

        self.cmd_tx
            .send(Command::Dispatch)
            .map_err(|_| Error::NotConnected)
    }

    /// Request disconnection. Teardown completes asynchronously; observe
    /// [`SessionEvent::Ended`] or use [`PairingSession::shutdown`].
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    /// Disconnect and wait for the driver task to finish tearing down.
    pub async fn shutdown(&self) {
        self.disconnect();

        let handle = self.driver_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Register a callback for state changes.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(PairingState) + Send + Sync + 'static,
    {
        self.register(move |event| {
            if let SessionEvent::StateChanged(state) = event {
                callback(state);
            }
        })
    }

    /// Register a callback for hub verification.
    pub fn on_hub_verified<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(HubIdentity) + Send + Sync + 'static,
    {
        self.register(move |event| {
            if let SessionEvent::HubVerified(identity) = event {
                callback(identity);
            }
        })
    }

    /// Register a callback for credential submission outcomes.
    pub fn on_credentials_sent<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(bool, Option<String>) + Send + Sync + 'static,
    {
        self.register(move |event| {
            if let SessionEvent::CredentialsSent { success, reason } = event {
                callback(success, reason);
            }
        })
    }

    fn register<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.event_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                callback(event);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }
}

impl Drop for PairingSession {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }
}

/// Driver task state. Owns the command receiver; all transport operations
/// happen here, strictly one at a time.
struct Driver {
    transport: Arc<dyn HubTransport>,
    config: SessionConfig,
    state: Arc<RwLock<PairingState>>,
    identity: Arc<RwLock<Option<HubIdentity>>>,
    authenticated: Arc<AtomicBool>,
    pending: Arc<Mutex<Option<Credentials>>>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl Driver {
    async fn run(mut self) {
        // Watch the link from the start, so a transport-reported drop
        // surfaces from any phase, not just the ready loop.
        let mut link = self.transport.link_watch();

        match self.establish(&mut link).await {
            Flow::Continue => self.ready_loop(link).await,
            Flow::Cancelled => self.teardown(None).await,
            Flow::Fatal(e) => self.teardown(Some(e)).await,
        }
    }

    /// Drive connect through authentication.
    async fn establish(&mut self, link: &mut watch::Receiver<bool>) -> Flow {
        let transport = self.transport.clone();

        self.set_state(PairingState::Connecting);
        let connect_timeout = self.config.connect_timeout;
        match self
            .step("connect", connect_timeout, transport.connect(), link)
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Flow::Fatal(Error::ConnectionFailed {
                    reason: e.to_string(),
                })
            }
            Err(flow) => return flow,
        }

        self.set_state(PairingState::DiscoveringServices);
        let step_timeout = self.config.step_timeout;
        let inventory = match self
            .step(
                "service discovery",
                step_timeout,
                transport.discover_endpoints(),
                link,
            )
            .await
        {
            Ok(Ok(inventory)) => inventory,
            Ok(Err(e)) => return Flow::Fatal(e),
            Err(flow) => return flow,
        };

        // A device without the hub service or its identity characteristic
        // is a permanent mismatch, not a retryable failure.
        if !inventory.is_recognized_hub() {
            return Flow::Fatal(Error::NotRecognizedHub);
        }

        self.set_state(PairingState::ReadingIdentity);
        let raw = match self
            .step("identity read", step_timeout, transport.read_identity(), link)
            .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return Flow::Fatal(e),
            Err(flow) => return flow,
        };

        let identity = match HubIdentity::validate(&raw) {
            Ok(identity) => identity,
            Err(e) => return Flow::Fatal(e),
        };

        info!("Hub verified: {}", identity);
        *self.identity.write() = Some(identity.clone());
        let _ = self.event_tx.send(SessionEvent::HubVerified(identity));

        if inventory.has_auth_characteristic {
            self.set_state(PairingState::Authenticating);
            let token = self.config.pairing_token.clone();
            match self
                .step(
                    "auth write",
                    step_timeout,
                    transport.write_auth(token.as_bytes()),
                    link,
                )
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Flow::Fatal(Error::AuthenticationFailed {
                        reason: e.to_string(),
                    })
                }
                Err(flow) => return flow,
            }
        } else {
            // No auth gate on this hub; treat as already authenticated.
            debug!("Hub exposes no auth characteristic, skipping authentication");
        }

        self.authenticated.store(true, Ordering::SeqCst);
        self.set_state(PairingState::Ready);
        Flow::Continue
    }

    /// Serve submissions until disconnect or link loss.
    async fn ready_loop(mut self, mut link: watch::Receiver<bool>) {
        loop {
            let buffered = self.pending.lock().take();
            if let Some(credentials) = buffered {
                match self.send_credentials(credentials).await {
                    Flow::Continue => continue,
                    Flow::Cancelled => return self.teardown(None).await,
                    Flow::Fatal(e) => return self.teardown(Some(e)).await,
                }
            }

            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Dispatch) => continue,
                    Some(Command::Disconnect) | None => return self.teardown(None).await,
                },
                changed = link.changed() => {
                    if changed.is_err() || !*link.borrow() {
                        return self.teardown(Some(Error::ConnectionLost)).await;
                    }
                }
            }
        }
    }

    /// Issue one credential write.
    async fn send_credentials(&mut self, credentials: Credentials) -> Flow {
        self.set_state(PairingState::SendingCredentials);
        info!("Sending Wi-Fi credentials for SSID {:?}", credentials.ssid());

        let payload = match credentials.to_wire_payload() {
            Ok(payload) => payload,
            Err(e) => {
                let _ = self.event_tx.send(SessionEvent::CredentialsSent {
                    success: false,
                    reason: Some(e.to_string()),
                });
                self.set_state(PairingState::Ready);
                return Flow::Continue;
            }
        };

        match tokio::time::timeout(
            self.config.step_timeout,
            self.transport.write_credentials(&payload),
        )
        .await
        {
            Ok(Ok(())) => {
                info!("Hub acknowledged credential write");
                self.set_state(PairingState::Confirmed);
                let _ = self.event_tx.send(SessionEvent::CredentialsSent {
                    success: true,
                    reason: None,
                });
                Flow::Continue
            }
            Ok(Err(e)) => {
                // The hub is still connected and authenticated; the caller
                // may resubmit.
                warn!("Credential write failed: {}", e);
                let _ = self.event_tx.send(SessionEvent::CredentialsSent {
                    success: false,
                    reason: Some(e.to_string()),
                });
                self.set_state(PairingState::Ready);
                Flow::Continue
            }
            Err(_) => {
                // A timed-out write may still be outstanding on the
                // transport; issuing another would violate the
                // single-operation invariant, so the session ends.
                let error = Error::Timeout {
                    operation: "credential write".to_string(),
                };
                let _ = self.event_tx.send(SessionEvent::CredentialsSent {
                    success: false,
                    reason: Some(error.to_string()),
                });
                Flow::Fatal(error)
            }
        }
    }

    /// Run one transport operation with a bounded wait, staying responsive
    /// to disconnect commands and transport-reported link drops.
    ///
    /// Outer `Err` carries the control-flow interruption
    /// (cancel/timeout/link loss); inner `Result` is the operation's own
    /// outcome.
    async fn step<T>(
        &mut self,
        label: &str,
        timeout: Duration,
        operation: impl Future<Output = Result<T>>,
        link: &mut watch::Receiver<bool>,
    ) -> std::result::Result<Result<T>, Flow> {
        tokio::pin!(operation);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = &mut operation => return Ok(result),
                _ = &mut deadline => {
                    warn!("Operation timed out: {}", label);
                    return Err(Flow::Fatal(Error::Timeout {
                        operation: label.to_string(),
                    }));
                }
                changed = link.changed() => {
                    if changed.is_err() || !*link.borrow() {
                        warn!("Link dropped during {}", label);
                        return Err(Flow::Fatal(Error::ConnectionLost));
                    }
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    // Buffered credentials are picked up on Ready entry.
                    Some(Command::Dispatch) => continue,
                    Some(Command::Disconnect) | None => return Err(Flow::Cancelled),
                }
            }
        }
    }

    /// Tear the session down, releasing the transport exactly once.
    async fn teardown(&mut self, error: Option<Error>) {
        let reason = error.map(|e| e.to_string());

        match &reason {
            Some(reason) => warn!("Session ending: {}", reason),
            None => info!("Session ending: disconnect requested"),
        }

        self.authenticated.store(false, Ordering::SeqCst);
        *self.identity.write() = None;
        *self.pending.lock() = None;

        let disconnect = self.transport.disconnect();
        if let Ok(Err(e)) = tokio::time::timeout(self.config.step_timeout, disconnect).await {
            debug!("Transport close reported: {}", e);
        }

        self.set_state(PairingState::Disconnected);
        let _ = self.event_tx.send(SessionEvent::Ended { error: reason });
    }

    /// Update the session state and emit an event.
    fn set_state(&self, new_state: PairingState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            debug!("Pairing state changed: {} -> {}", old_state, new_state);
            let _ = self.event_tx.send(SessionEvent::StateChanged(new_state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::{EndpointInventory, MockHubTransport};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::watch;

    fn identity_json() -> Vec<u8> {
        br#"{"type":"SMARTTUPPLEWARE_HUB","vendor":"ZHAW","model":"DVHUB","fw":"1.0","device_id":"hub-001"}"#
            .to_vec()
    }

    fn full_inventory() -> EndpointInventory {
        EndpointInventory {
            has_hub_service: true,
            has_identity_characteristic: true,
            has_auth_characteristic: true,
            has_credentials_characteristic: true,
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(200),
            step_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        }
    }

    /// Mock with the connect/discover/read/disconnect happy path wired up.
    /// Returns the link-state sender so tests can simulate link drops.
    fn happy_transport(inventory: EndpointInventory) -> (MockHubTransport, watch::Sender<bool>) {
        let (link_tx, link_rx) = watch::channel(true);

        let mut mock = MockHubTransport::new();
        mock.expect_connect().times(1).returning(|| Ok(()));
        mock.expect_discover_endpoints()
            .times(1)
            .returning(move || Ok(inventory));
        mock.expect_read_identity()
            .times(1)
            .returning(|| Ok(identity_json()));
        mock.expect_disconnect().times(1).returning(|| Ok(()));
        mock.expect_link_watch()
            .returning(move || link_rx.clone());

        (mock, link_tx)
    }

    /// Await the next event, bounded so a wedged test fails fast.
    async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    /// Collect state changes until the given state is reached.
    async fn states_until(
        rx: &mut broadcast::Receiver<SessionEvent>,
        target: PairingState,
    ) -> Vec<PairingState> {
        let mut states = Vec::new();
        loop {
            if let SessionEvent::StateChanged(state) = next_event(rx).await {
                states.push(state);
                if state == target {
                    return states;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_full_pairing_sequence() {
        let (mut mock, _link_tx) = happy_transport(full_inventory());
        mock.expect_write_auth()
            .withf(|token| token == DEFAULT_PAIRING_TOKEN.as_bytes())
            .times(1)
            .returning(|_| Ok(()));

        let session = PairingSession::start(Arc::new(mock), test_config());
        let mut rx = session.subscribe();

        let states = states_until(&mut rx, PairingState::Ready).await;
        assert_eq!(
            states,
            vec![
                PairingState::Connecting,
                PairingState::DiscoveringServices,
                PairingState::ReadingIdentity,
                PairingState::Authenticating,
                PairingState::Ready,
            ]
        );
        assert!(session.is_connected());
        assert!(session.is_authenticated());
        assert_eq!(
            session.current_identity().unwrap().device_id(),
            "hub-001"
        );

        session.shutdown().await;
        assert_eq!(session.state(), PairingState::Disconnected);
        assert!(session.current_identity().is_none());
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_hub_verified_event_carries_identity() {
        let (mut mock, _link_tx) = happy_transport(full_inventory());
        mock.expect_write_auth().returning(|_| Ok(()));

        let session = PairingSession::start(Arc::new(mock), test_config());
        let mut rx = session.subscribe();

        loop {
            if let SessionEvent::HubVerified(identity) = next_event(&mut rx).await {
                assert_eq!(identity.device_id(), "hub-001");
                assert_eq!(identity.vendor(), "ZHAW");
                break;
            }
        }

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_auth_characteristic_skips_authenticating() {
        let inventory = EndpointInventory {
            has_auth_characteristic: false,
            ..full_inventory()
        };
        let (mock, _link_tx) = happy_transport(inventory);
        // No expect_write_auth: any auth write would panic the mock.

        let session = PairingSession::start(Arc::new(mock), test_config());
        let mut rx = session.subscribe();

        let states = states_until(&mut rx, PairingState::Ready).await;
        assert!(!states.contains(&PairingState::Authenticating));
        assert!(session.is_authenticated());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_unrecognized_device_fails_fast() {
        let (_link_tx, link_rx) = watch::channel(true);
        let mut mock = MockHubTransport::new();
        mock.expect_connect().times(1).returning(|| Ok(()));
        mock.expect_discover_endpoints().times(1).returning(|| {
            Ok(EndpointInventory {
                has_hub_service: true,
                has_identity_characteristic: false,
                ..EndpointInventory::default()
            })
        });
        mock.expect_disconnect().times(1).returning(|| Ok(()));
        mock.expect_link_watch().returning(move || link_rx.clone());

        let session = PairingSession::start(Arc::new(mock), test_config());
        let mut rx = session.subscribe();

        loop {
            if let SessionEvent::Ended { error } = next_event(&mut rx).await {
                let error = error.unwrap();
                assert!(error.contains("recognized"), "unexpected reason: {}", error);
                break;
            }
        }
        assert_eq!(session.state(), PairingState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_identity_payload_fails() {
        let (_link_tx, link_rx) = watch::channel(true);
        let mut mock = MockHubTransport::new();
        mock.expect_connect().returning(|| Ok(()));
        mock.expect_discover_endpoints()
            .returning(|| Ok(full_inventory()));
        mock.expect_read_identity()
            .returning(|| Ok(b"{\"type\":\"IMPOSTOR\"}".to_vec()));
        mock.expect_disconnect().times(1).returning(|| Ok(()));
        mock.expect_link_watch().returning(move || link_rx.clone());

        let session = PairingSession::start(Arc::new(mock), test_config());
        let mut rx = session.subscribe();

        loop {
            match next_event(&mut rx).await {
                SessionEvent::HubVerified(_) => panic!("invalid identity must not verify"),
                SessionEvent::Ended { error } => {
                    assert!(error.unwrap().contains("Invalid hub identity"));
                    break;
                }
                _ => {}
            }
        }
        assert!(session.current_identity().is_none());
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal_and_suppresses_buffered_credentials() {
        let (_link_tx, link_rx) = watch::channel(true);
        let mut mock = MockHubTransport::new();
        mock.expect_connect().returning(|| Ok(()));
        mock.expect_discover_endpoints()
            .returning(|| Ok(full_inventory()));
        mock.expect_read_identity().returning(|| Ok(identity_json()));
        mock.expect_write_auth()
            .times(1)
            .returning(|_| Err(Error::Internal("write rejected".to_string())));
        mock.expect_disconnect().times(1).returning(|| Ok(()));
        mock.expect_link_watch().returning(move || link_rx.clone());
        // No expect_write_credentials: a dispatch would panic the mock.

        let session = PairingSession::start(Arc::new(mock), test_config());
        let mut rx = session.subscribe();

        // Buffer credentials before the session can possibly be ready.
        session
            .submit_credentials(Credentials::new("HomeNet", "hunter2").unwrap())
            .unwrap();

        loop {
            match next_event(&mut rx).await {
                SessionEvent::CredentialsSent { .. } => {
                    panic!("credentials callback must not fire after auth failure")
                }
                SessionEvent::Ended { error } => {
                    assert!(error.unwrap().contains("Authentication failed"));
                    break;
                }
                _ => {}
            }
        }
        assert!(!session.is_authenticated());
        assert_eq!(session.state(), PairingState::Disconnected);
    }

    #[tokio::test]
    async fn test_double_submit_before_ready_sends_second_payload_once() {
        let (mut mock, _link_tx) = happy_transport(full_inventory());
        mock.expect_write_auth().returning(|_| Ok(()));

        let sent = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sent_in_mock = sent.clone();
        mock.expect_write_credentials()
            .times(1)
            .returning(move |payload| {
                sent_in_mock.lock().push(payload.to_vec());
                Ok(())
            });

        let session = PairingSession::start(Arc::new(mock), test_config());
        let mut rx = session.subscribe();

        // Driver has not polled yet on the current-thread runtime, so both
        // submissions land before Connecting even begins.
        session
            .submit_credentials(Credentials::new("FirstNet", "first").unwrap())
            .unwrap();
        session
            .submit_credentials(Credentials::new("SecondNet", "second").unwrap())
            .unwrap();

        loop {
            if let SessionEvent::CredentialsSent { success, reason } = next_event(&mut rx).await {
                assert!(success, "send failed: {:?}", reason);
                break;
            }
        }

        let payloads = sent.lock().clone();
        assert_eq!(payloads.len(), 1);
        let value: serde_json::Value = serde_json::from_slice(&payloads[0]).unwrap();
        assert_eq!(value["ssid"], "SecondNet");

        assert_eq!(session.state(), PairingState::Confirmed);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_failure_returns_to_ready_and_allows_resubmit() {
        let (mut mock, _link_tx) = happy_transport(full_inventory());
        mock.expect_write_auth().returning(|_| Ok(()));

        let calls = Arc::new(AtomicU64::new(0));
        let calls_in_mock = calls.clone();
        mock.expect_write_credentials()
            .times(2)
            .returning(move |_| {
                if calls_in_mock.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Internal("write rejected".to_string()))
                } else {
                    Ok(())
                }
            });

        let session = PairingSession::start(Arc::new(mock), test_config());
        let mut rx = session.subscribe();
        states_until(&mut rx, PairingState::Ready).await;

        let credentials = Credentials::new("HomeNet", "hunter2").unwrap();
        session.submit_credentials(credentials.clone()).unwrap();

        loop {
            if let SessionEvent::CredentialsSent { success, reason } = next_event(&mut rx).await {
                assert!(!success);
                assert!(reason.unwrap().contains("write rejected"));
                break;
            }
        }
        // Non-fatal: the session is still connected for a retry.
        states_until(&mut rx, PairingState::Ready).await;
        assert!(session.is_connected());

        session.submit_credentials(credentials).unwrap();
        loop {
            if let SessionEvent::CredentialsSent { success, .. } = next_event(&mut rx).await {
                assert!(success);
                break;
            }
        }

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_link_drop_in_ready_tears_down_once() {
        let (mut mock, link_tx) = happy_transport(full_inventory());
        mock.expect_write_auth().returning(|_| Ok(()));

        let session = PairingSession::start(Arc::new(mock), test_config());
        let mut rx = session.subscribe();
        states_until(&mut rx, PairingState::Ready).await;

        link_tx.send(false).unwrap();

        loop {
            if let SessionEvent::Ended { error } = next_event(&mut rx).await {
                assert!(error.unwrap().contains("Connection lost"));
                break;
            }
        }
        assert_eq!(session.state(), PairingState::Disconnected);
        // expect_disconnect().times(1) verifies the single release on drop.
    }

    #[tokio::test]
    async fn test_submit_after_disconnect_is_rejected() {
        let (mut mock, _link_tx) = happy_transport(full_inventory());
        mock.expect_write_auth().returning(|_| Ok(()));

        let session = PairingSession::start(Arc::new(mock), test_config());
        let mut rx = session.subscribe();
        states_until(&mut rx, PairingState::Ready).await;

        session.shutdown().await;

        let credentials = Credentials::new("HomeNet", "hunter2").unwrap();
        assert!(matches!(
            session.submit_credentials(credentials),
            Err(Error::NotConnected)
        ));
    }

    /// Transport whose connect never completes; exercises the bounded
    /// per-step wait and the link watch during establishment.
    struct StallTransport {
        link_tx: Arc<watch::Sender<bool>>,
    }

    #[async_trait]
    impl HubTransport for StallTransport {
        async fn connect(&self) -> Result<()> {
            std::future::pending().await
        }

        async fn discover_endpoints(&self) -> Result<EndpointInventory> {
            unreachable!("connect never completes")
        }

        async fn read_identity(&self) -> Result<Vec<u8>> {
            unreachable!("connect never completes")
        }

        async fn write_auth(&self, _token: &[u8]) -> Result<()> {
            unreachable!("connect never completes")
        }

        async fn write_credentials(&self, _payload: &[u8]) -> Result<()> {
            unreachable!("connect never completes")
        }

        async fn disconnect(&self) -> Result<()> {
            let _ = self.link_tx.send(false);
            Ok(())
        }

        fn link_watch(&self) -> watch::Receiver<bool> {
            self.link_tx.subscribe()
        }
    }

    #[tokio::test]
    async fn test_unresponsive_hub_times_out_instead_of_wedging() {
        let link_tx = Arc::new(watch::channel(true).0);
        let transport = Arc::new(StallTransport { link_tx });

        let config = SessionConfig {
            connect_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let session = PairingSession::start(transport, config);
        let mut rx = session.subscribe();

        loop {
            if let SessionEvent::Ended { error } = next_event(&mut rx).await {
                assert!(error.unwrap().contains("timed out"));
                break;
            }
        }
        assert_eq!(session.state(), PairingState::Disconnected);
    }

    #[tokio::test]
    async fn test_link_drop_during_establish_ends_session() {
        let link_tx = Arc::new(watch::channel(true).0);
        let transport = Arc::new(StallTransport {
            link_tx: link_tx.clone(),
        });

        // Connect would stall well past the event bound; only the link
        // watch can end the session this quickly.
        let config = SessionConfig {
            connect_timeout: Duration::from_secs(30),
            ..test_config()
        };
        let session = PairingSession::start(transport, config);
        let mut rx = session.subscribe();

        loop {
            if let SessionEvent::StateChanged(PairingState::Connecting) =
                next_event(&mut rx).await
            {
                break;
            }
        }
        link_tx.send(false).unwrap();

        loop {
            if let SessionEvent::Ended { error } = next_event(&mut rx).await {
                assert!(error.unwrap().contains("Connection lost"));
                break;
            }
        }
        assert_eq!(session.state(), PairingState::Disconnected);
    }

    #[test]
    fn test_pairing_state_predicates() {
        assert!(!PairingState::Idle.is_connected());
        assert!(!PairingState::Connecting.is_connected());
        assert!(PairingState::Ready.is_connected());
        assert!(PairingState::SendingCredentials.is_connected());
        assert!(PairingState::Confirmed.is_connected());
        assert!(!PairingState::Disconnected.is_connected());
        assert!(PairingState::Disconnected.is_terminal());
        assert!(!PairingState::Ready.is_terminal());
    }

    #[test]
    fn test_pairing_state_display() {
        assert_eq!(format!("{}", PairingState::Ready), "Ready");
        assert_eq!(format!("{}", PairingState::Disconnected), "Disconnected");
    }
}
