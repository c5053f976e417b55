//! Transport abstraction over the hub's GATT endpoints.
//!
//! The pairing session talks to a [`HubTransport`] rather than to a
//! platform BLE stack directly, so the platform's API quirks stay out of
//! the protocol logic and the session can be exercised against a mock.
//! [`BleTransport`] is the production implementation over a btleplug
//! peripheral.

use async_trait::async_trait;
use btleplug::api::{Central, CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::uuids::{
    AUTH_CHARACTERISTIC_UUID, HUB_IDENTITY_CHARACTERISTIC_UUID, HUB_SERVICE_UUID,
    WIFI_CREDENTIALS_CHARACTERISTIC_UUID,
};
use crate::error::{Error, Result};

/// Which of the hub's logical endpoints a connected peripheral exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointInventory {
    /// The hub primary service is present.
    pub has_hub_service: bool,
    /// The readable identity characteristic is present.
    pub has_identity_characteristic: bool,
    /// The writable auth characteristic is present. Optional; older hub
    /// firmware ships without it.
    pub has_auth_characteristic: bool,
    /// The writable Wi-Fi credentials characteristic is present.
    pub has_credentials_characteristic: bool,
}

impl EndpointInventory {
    /// Whether the peripheral qualifies as a hub at all.
    ///
    /// Requires the service and the readable identity characteristic; the
    /// auth characteristic is optional.
    pub fn is_recognized_hub(&self) -> bool {
        self.has_hub_service && self.has_identity_characteristic
    }
}

/// Async GATT transport to one hub.
///
/// Implementations must support at most one outstanding operation; the
/// session guarantees it never issues a second operation before the prior
/// one completes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HubTransport: Send + Sync {
    /// Open the connection to the peripheral.
    async fn connect(&self) -> Result<()>;

    /// Enumerate services and report which hub endpoints are present.
    async fn discover_endpoints(&self) -> Result<EndpointInventory>;

    /// Read the raw identity payload.
    async fn read_identity(&self) -> Result<Vec<u8>>;

    /// Write the pairing token to the auth characteristic.
    async fn write_auth(&self, token: &[u8]) -> Result<()>;

    /// Write the credentials payload to the Wi-Fi characteristic.
    async fn write_credentials(&self, payload: &[u8]) -> Result<()>;

    /// Close the connection and release the underlying handle.
    async fn disconnect(&self) -> Result<()>;

    /// Watch the link state. The receiver holds `true` while the link is
    /// up and flips to `false` when the transport reports a disconnect.
    fn link_watch(&self) -> watch::Receiver<bool>;
}

/// Production [`HubTransport`] over a btleplug peripheral.
pub struct BleTransport {
    /// The adapter the peripheral was discovered on.
    adapter: Adapter,
    /// The peripheral to communicate with.
    peripheral: Peripheral,
    /// Cached characteristics by UUID, populated during discovery.
    characteristics: Arc<RwLock<HashMap<Uuid, Characteristic>>>,
    /// Link-state channel; flips to false on disconnect.
    link_tx: Arc<watch::Sender<bool>>,
    /// Handle to the disconnect monitor task.
    monitor_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl BleTransport {
    /// Create a transport for a peripheral on the given adapter.
    pub fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        let (link_tx, _) = watch::channel(true);

        Self {
            adapter,
            peripheral,
            characteristics: Arc::new(RwLock::new(HashMap::new())),
            link_tx: Arc::new(link_tx),
            monitor_handle: RwLock::new(None),
        }
    }

    fn characteristic(&self, uuid: &Uuid) -> Result<Characteristic> {
        self.characteristics
            .read()
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }

    /// Start the background task that watches adapter events for this
    /// peripheral's disconnect.
    fn spawn_disconnect_monitor(&self) {
        let adapter = self.adapter.clone();
        let peripheral_id = self.peripheral.id();
        let link_tx = self.link_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Failed to get adapter events for link monitor: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                if let btleplug::api::CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        info!("Transport link dropped: {:?}", id);
                        let _ = link_tx.send(false);
                        break;
                    }
                }
            }
        });

        *self.monitor_handle.write() = Some(handle);
    }
}

#[async_trait]
impl HubTransport for BleTransport {
    async fn connect(&self) -> Result<()> {
        debug!("Connecting to peripheral {:?}", self.peripheral.id());

        self.peripheral.connect().await.map_err(Error::Bluetooth)?;
        let _ = self.link_tx.send(true);
        self.spawn_disconnect_monitor();

        info!("Connected to peripheral {:?}", self.peripheral.id());
        Ok(())
    }

    async fn discover_endpoints(&self) -> Result<EndpointInventory> {
        self.peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)?;

        let mut inventory = EndpointInventory::default();
        let mut chars = self.characteristics.write();
        chars.clear();

        for service in self.peripheral.services() {
            trace!("Found service: {}", service.uuid);

            if service.uuid != HUB_SERVICE_UUID {
                continue;
            }
            inventory.has_hub_service = true;

            for characteristic in service.characteristics {
                debug!(
                    "Found characteristic: {} props {:?}",
                    characteristic.uuid, characteristic.properties
                );

                match characteristic.uuid {
                    HUB_IDENTITY_CHARACTERISTIC_UUID => {
                        inventory.has_identity_characteristic =
                            characteristic.properties.contains(CharPropFlags::READ);
                    }
                    AUTH_CHARACTERISTIC_UUID => {
                        inventory.has_auth_characteristic = characteristic
                            .properties
                            .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE);
                    }
                    WIFI_CREDENTIALS_CHARACTERISTIC_UUID => {
                        inventory.has_credentials_characteristic = characteristic
                            .properties
                            .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE);
                    }
                    _ => {}
                }

                chars.insert(characteristic.uuid, characteristic);
            }
        }

        debug!("Endpoint inventory: {:?}", inventory);
        Ok(inventory)
    }

    async fn read_identity(&self) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(&HUB_IDENTITY_CHARACTERISTIC_UUID)?;

        let data = self
            .peripheral
            .read(&characteristic)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Read {} bytes from identity characteristic", data.len());
        Ok(data)
    }

    async fn write_auth(&self, token: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(&AUTH_CHARACTERISTIC_UUID)?;

        self.peripheral
            .write(&characteristic, token, WriteType::WithResponse)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Wrote {} bytes to auth characteristic", token.len());
        Ok(())
    }

    async fn write_credentials(&self, payload: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(&WIFI_CREDENTIALS_CHARACTERISTIC_UUID)?;

        self.peripheral
            .write(&characteristic, payload, WriteType::WithResponse)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Wrote {} bytes to credentials characteristic", payload.len());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(handle) = self.monitor_handle.write().take() {
            handle.abort();
        }
        let _ = self.link_tx.send(false);

        match self.peripheral.disconnect().await {
            Ok(_) => {
                info!("Disconnected from peripheral {:?}", self.peripheral.id());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to disconnect cleanly: {}", e);
                Err(Error::Bluetooth(e))
            }
        }
    }

    fn link_watch(&self) -> watch::Receiver<bool> {
        self.link_tx.subscribe()
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor_handle.write().take() {
            handle.abort();
        }
    }
}
