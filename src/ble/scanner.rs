//! BLE scanning functionality.
//!
//! Provides the scanner for discovering SmartTuppleware hubs. Sightings
//! are deduplicated per physical device into a [`SightingRegistry`], and
//! every scan runs within a bounded wall-clock window that auto-stops
//! with a single "scan complete" signal.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{Stream, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, trace};

use crate::ble::uuids::{HUB_LOCAL_NAME, HUB_SERVICE_UUID};
use crate::error::{Error, Result};

/// Default scan window before the scan auto-stops.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(15);

/// One observed hub during the current scan window.
#[derive(Debug, Clone)]
pub struct HubSighting {
    /// Stable identifier for the physical device.
    pub identifier: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm, if reported.
    pub rssi: Option<i16>,
    /// When this device was last seen during the window.
    pub last_seen: Instant,
}

/// Deduplicated sightings for one scan window.
///
/// Keyed by device identifier with upsert semantics: a repeated sighting
/// overwrites name/RSSI in place and never duplicates or reorders the
/// collection.
#[derive(Debug, Default)]
pub struct SightingRegistry {
    entries: Vec<HubSighting>,
}

impl SightingRegistry {
    /// Insert a new sighting or update the existing entry in place.
    pub fn upsert(&mut self, sighting: HubSighting) {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.identifier == sighting.identifier)
        {
            Some(existing) => {
                existing.name = sighting.name;
                existing.rssi = sighting.rssi;
                existing.last_seen = sighting.last_seen;
            }
            None => self.entries.push(sighting),
        }
    }

    /// Look up a sighting by device identifier.
    pub fn get(&self, identifier: &str) -> Option<&HubSighting> {
        self.entries
            .iter()
            .find(|entry| entry.identifier == identifier)
    }

    /// Snapshot of all sightings in first-seen order.
    pub fn snapshot(&self) -> Vec<HubSighting> {
        self.entries.clone()
    }

    /// Number of distinct devices seen this window.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no devices have been seen.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all sightings (new scan window).
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Event emitted by the scanner.
#[derive(Debug, Clone)]
pub enum ScannerEvent {
    /// A hub was seen for the first time or updated.
    SightingsChanged(HubSighting),
    /// The scan window elapsed and the scan auto-stopped.
    ScanComplete,
}

/// Why the scan loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanExit {
    /// The window elapsed with no stop request.
    WindowElapsed,
    /// A stop request arrived before the window elapsed.
    Cancelled,
}

/// BLE scanner for discovering SmartTuppleware hubs.
pub struct HubScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Deduplicated sightings for the current window.
    registry: Arc<RwLock<SightingRegistry>>,
    /// Peripheral handles by identifier, for later connection.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// Channel for scanner events.
    event_tx: broadcast::Sender<ScannerEvent>,
    /// Handle to the scanning task.
    scan_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
    /// Stop signal for the current scan window.
    scan_cancel: RwLock<Option<Arc<Notify>>>,
}

impl HubScanner {
    /// Create a new hub scanner.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a new hub scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            adapter,
            is_scanning: Arc::new(RwLock::new(false)),
            registry: Arc::new(RwLock::new(SightingRegistry::default())),
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            scan_handle: Arc::new(RwLock::new(None)),
            scan_cancel: RwLock::new(None),
        }
    }

    /// Start scanning for hubs, auto-stopping after `window`.
    ///
    /// Opening a new window clears all sightings from the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScanFailed`] if the adapter cannot start scanning.
    /// This is recoverable; the caller may retry.
    pub async fn start_scan(&self, window: Duration) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan for hubs ({:?} window)", window);

        self.registry.write().clear();
        self.peripherals.write().clear();

        // Filter advertisements to peripherals announcing the hub service
        let filter = ScanFilter {
            services: vec![HUB_SERVICE_UUID],
        };
        self.adapter
            .start_scan(filter)
            .await
            .map_err(|e| Error::ScanFailed {
                reason: e.to_string(),
            })?;

        *self.is_scanning.write() = true;

        let cancel = Arc::new(Notify::new());
        *self.scan_cancel.write() = Some(cancel.clone());

        let adapter = self.adapter.clone();
        let is_scanning = self.is_scanning.clone();
        let registry = self.registry.clone();
        let peripherals = self.peripherals.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            let exit = Self::drive_scan_window(events, window, cancel, |event| {
                Self::handle_event(event, &adapter, &registry, &peripherals, &event_tx)
            })
            .await;

            match exit {
                ScanExit::WindowElapsed => {
                    let was_scanning = {
                        let mut flag = is_scanning.write();
                        std::mem::replace(&mut *flag, false)
                    };

                    // A concurrent stop_scan may have won the flag; the
                    // loser emits nothing.
                    if was_scanning {
                        info!("Scan window elapsed, auto-stopping");
                        if let Err(e) = adapter.stop_scan().await {
                            error!("Failed to stop scan: {}", e);
                        }
                        let _ = event_tx.send(ScannerEvent::ScanComplete);
                    }
                }
                ScanExit::Cancelled => {
                    debug!("Scan loop cancelled by stop request");
                }
            }
        });

        *self.scan_handle.write() = Some(handle);

        Ok(())
    }

    /// Pump adapter events until the window elapses or a stop request
    /// arrives.
    ///
    /// The stop signal is a stored-permit [`Notify`], so a stop requested
    /// while an event is mid-processing is still observed on the next
    /// loop iteration rather than after the remaining window.
    async fn drive_scan_window<S, F, Fut>(
        mut events: S,
        window: Duration,
        cancel: Arc<Notify>,
        mut on_event: F,
    ) -> ScanExit
    where
        S: Stream<Item = CentralEvent> + Unpin,
        F: FnMut(CentralEvent) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                Some(event) = events.next() => on_event(event).await,
                _ = &mut deadline => return ScanExit::WindowElapsed,
                _ = cancel.notified() => return ScanExit::Cancelled,
            }
        }
    }

    /// Stop scanning for hubs. Safe to call repeatedly or before any scan
    /// was started.
    pub async fn stop_scan(&self) -> Result<()> {
        let was_scanning = {
            let mut flag = self.is_scanning.write();
            std::mem::replace(&mut *flag, false)
        };
        if !was_scanning {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        // Wake the scan task out of its select so the join below is
        // prompt even on a quiet radio.
        if let Some(cancel) = self.scan_cancel.write().take() {
            cancel.notify_one();
        }

        self.adapter.stop_scan().await.map_err(Error::Bluetooth)?;

        // Wait for the scan task to complete
        let handle = self.scan_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Snapshot of the current window's sightings in first-seen order.
    pub fn sightings(&self) -> Vec<HubSighting> {
        self.registry.read().snapshot()
    }

    /// Look up the peripheral handle for a sighted device.
    pub fn peripheral(&self, identifier: &str) -> Option<Peripheral> {
        self.peripherals.read().get(identifier).cloned()
    }

    /// Subscribe to scanner events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScannerEvent> {
        self.event_tx.subscribe()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: btleplug::api::CentralEvent,
        adapter: &Adapter,
        registry: &Arc<RwLock<SightingRegistry>>,
        peripherals: &Arc<RwLock<HashMap<String, Peripheral>>>,
        event_tx: &broadcast::Sender<ScannerEvent>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                trace!("Device seen: {:?}", id);
                Self::process_peripheral(adapter, id, registry, peripherals, event_tx).await;
            }
            CentralEvent::ServicesAdvertisement { id, services } => {
                if services.contains(&HUB_SERVICE_UUID) {
                    trace!("Hub service advertisement: {:?}", id);
                    Self::process_peripheral(adapter, id, registry, peripherals, event_tx).await;
                }
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
            }
            CentralEvent::ManufacturerDataAdvertisement { .. } => {}
            CentralEvent::ServiceDataAdvertisement { .. } => {}
            CentralEvent::StateUpdate(_) => {}
        }
    }

    /// Process a sighted peripheral.
    async fn process_peripheral(
        adapter: &Adapter,
        id: btleplug::platform::PeripheralId,
        registry: &Arc<RwLock<SightingRegistry>>,
        peripherals: &Arc<RwLock<HashMap<String, Peripheral>>>,
        event_tx: &broadcast::Sender<ScannerEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        // Only surface hubs. Some platforms do not relay service UUIDs in
        // every advertisement, so also accept the hub's local name.
        let is_hub = properties.services.contains(&HUB_SERVICE_UUID)
            || properties
                .local_name
                .as_deref()
                .map(|n| n == HUB_LOCAL_NAME)
                .unwrap_or(false);

        if !is_hub {
            return;
        }

        let identifier = id.to_string();

        let sighting = HubSighting {
            identifier: identifier.clone(),
            name: properties.local_name,
            rssi: properties.rssi,
            last_seen: Instant::now(),
        };

        peripherals.write().insert(identifier, peripheral);
        registry.write().upsert(sighting.clone());

        let _ = event_tx.send(ScannerEvent::SightingsChanged(sighting));
    }
}

impl Drop for HubScanner {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
        if let Some(cancel) = self.scan_cancel.write().take() {
            cancel.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn sighting(identifier: &str, name: Option<&str>, rssi: Option<i16>) -> HubSighting {
        HubSighting {
            identifier: identifier.to_string(),
            name: name.map(str::to_string),
            rssi,
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn test_upsert_inserts_then_updates() {
        let mut registry = SightingRegistry::default();
        assert!(registry.is_empty());

        registry.upsert(sighting("dev-a", Some("SMARTTUPPLEWARE_HUB"), Some(-60)));
        assert_eq!(registry.len(), 1);

        registry.upsert(sighting("dev-a", Some("SMARTTUPPLEWARE_HUB"), Some(-42)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("dev-a").unwrap().rssi, Some(-42));
    }

    #[test]
    fn test_upsert_preserves_first_seen_order() {
        let mut registry = SightingRegistry::default();
        registry.upsert(sighting("dev-a", None, Some(-60)));
        registry.upsert(sighting("dev-b", None, Some(-70)));
        registry.upsert(sighting("dev-a", None, Some(-40)));

        let ids: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|s| s.identifier)
            .collect();
        assert_eq!(ids, vec!["dev-a", "dev-b"]);
    }

    #[tokio::test]
    async fn test_stop_request_interrupts_quiet_scan_loop() {
        // No adapter events arrive after a stop, so the loop must exit
        // without waiting out the remaining window.
        let cancel = Arc::new(Notify::new());
        cancel.notify_one();

        let exit = tokio::time::timeout(
            Duration::from_millis(100),
            HubScanner::drive_scan_window(
                futures::stream::pending(),
                Duration::from_secs(30),
                cancel,
                |_| async {},
            ),
        )
        .await
        .expect("stop request did not interrupt the scan loop");

        assert_eq!(exit, ScanExit::Cancelled);
    }

    #[tokio::test]
    async fn test_scan_window_elapses_without_stop() {
        let cancel = Arc::new(Notify::new());

        let exit = HubScanner::drive_scan_window(
            futures::stream::pending(),
            Duration::from_millis(20),
            cancel,
            |_| async {},
        )
        .await;

        assert_eq!(exit, ScanExit::WindowElapsed);
    }

    #[test]
    fn test_clear_opens_fresh_window() {
        let mut registry = SightingRegistry::default();
        registry.upsert(sighting("dev-a", None, None));
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.get("dev-a").is_none());
    }

    proptest! {
        /// Any sequence of sightings yields exactly one entry per device,
        /// holding the most recently observed name and signal strength.
        #[test]
        fn prop_dedupe_last_write_wins(
            events in proptest::collection::vec((0usize..4, -100i16..0, 0usize..3), 1..50)
        ) {
            let names = [None, Some("SMARTTUPPLEWARE_HUB"), Some("hub-kitchen")];

            let mut registry = SightingRegistry::default();
            let mut last: std::collections::HashMap<usize, (Option<&str>, i16)> =
                std::collections::HashMap::new();

            for (device, rssi, name_idx) in events {
                let id = format!("dev-{}", device);
                registry.upsert(sighting(&id, names[name_idx], Some(rssi)));
                last.insert(device, (names[name_idx], rssi));
            }

            prop_assert_eq!(registry.len(), last.len());
            for (device, (name, rssi)) in last {
                let id = format!("dev-{}", device);
                let entry = registry.get(&id).unwrap();
                prop_assert_eq!(entry.name.as_deref(), name);
                prop_assert_eq!(entry.rssi, Some(rssi));
            }
        }
    }
}
