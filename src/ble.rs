use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::stream::{BoxStream, StreamExt};
use std::{collections::HashMap, str::FromStr, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{LockError, Result},
    APPLE_MANUFACTURER_ID, SERVICE_UUID, YALE_MANUFACTURER_ID,
};

/// BLE link to a lock, as seen by the session.
///
/// Every call takes the connection handle explicitly; `disconnect` consumes
/// it, so a handle is released at most once.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Live GATT connection
    type Connection: Send + Sync + 'static;

    /// Open a GATT connection to `address` and discover its services
    async fn connect(&self, address: &str) -> Result<Self::Connection>;

    /// Write one frame to `characteristic`
    async fn write(&self, conn: &Self::Connection, characteristic: Uuid, data: &[u8])
        -> Result<()>;

    /// Read the current value of `characteristic`
    async fn read(&self, conn: &Self::Connection, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Enable notifications on `characteristic` and stream their values.
    ///
    /// The stream ends when the connection goes away.
    async fn subscribe_notifications(
        &self,
        conn: &Self::Connection,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>>;

    /// Current signal strength in dBm, if the platform reports it
    async fn rssi(&self, conn: &Self::Connection) -> Result<Option<i16>>;

    /// Close the connection
    async fn disconnect(&self, conn: Self::Connection) -> Result<()>;
}

/// Manufacturer data seen in one advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertiser address, `AA:BB:CC:DD:EE:FF`
    pub address: String,
    /// Manufacturer id to payload
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Signal strength, when reported
    pub rssi: Option<i16>,
}

/// [`Transport`] over the platform Bluetooth stack
pub struct BtleplugTransport {
    adapter: Adapter,
    scan_timeout: Duration,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Ble`] if the Bluetooth stack cannot be initialized,
    /// or [`LockError::DeviceNotFound`] if there is no adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LockError::DeviceNotFound {
                address: "bluetooth adapter".to_string(),
            })?;

        Ok(Self {
            adapter,
            scan_timeout: Duration::from_secs(10),
        })
    }

    /// How long `connect` scans for a lock it has not seen yet
    #[must_use]
    pub const fn with_scan_timeout(mut self, scan_timeout: Duration) -> Self {
        self.scan_timeout = scan_timeout;
        self
    }

    /// Stream lock advertisements carrying Apple or Yale manufacturer data.
    ///
    /// Starts a scan filtered on the lock service; the scan keeps running
    /// until the adapter is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Ble`] if the scan cannot be started.
    pub async fn advertisements(&self) -> Result<BoxStream<'static, Advertisement>> {
        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await?;
        info!("Listening for lock advertisements");

        let adapter = self.adapter.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let CentralEvent::ManufacturerDataAdvertisement {
                    id,
                    manufacturer_data,
                } = event
                else {
                    return None;
                };
                if !manufacturer_data.contains_key(&APPLE_MANUFACTURER_ID)
                    && !manufacturer_data.contains_key(&YALE_MANUFACTURER_ID)
                {
                    return None;
                }

                let peripheral = adapter.peripheral(&id).await.ok()?;
                let rssi = match peripheral.properties().await {
                    Ok(Some(properties)) => properties.rssi,
                    _ => None,
                };
                Some(Advertisement {
                    address: peripheral.address().to_string(),
                    manufacturer_data,
                    rssi,
                })
            }
        });

        Ok(stream.boxed())
    }

    async fn find_peripheral(&self, address: BDAddr) -> Result<Option<Peripheral>> {
        Ok(self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address() == address))
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| LockError::Protocol(format!("Characteristic {uuid} not found")))
}

#[async_trait]
impl Transport for BtleplugTransport {
    type Connection = Peripheral;

    async fn connect(&self, address: &str) -> Result<Peripheral> {
        let bd_addr = BDAddr::from_str(address).map_err(|e| {
            LockError::InvalidParameters(format!("Invalid lock address {address}: {e}"))
        })?;

        let peripheral = if let Some(peripheral) = self.find_peripheral(bd_addr).await? {
            peripheral
        } else {
            debug!("{address} not cached, scanning for {:?}", self.scan_timeout);
            self.adapter
                .start_scan(ScanFilter {
                    services: vec![SERVICE_UUID],
                })
                .await?;
            tokio::time::sleep(self.scan_timeout).await;
            self.adapter.stop_scan().await?;

            self.find_peripheral(bd_addr)
                .await?
                .ok_or_else(|| LockError::DeviceNotFound {
                    address: address.to_string(),
                })?
        };

        peripheral
            .connect()
            .await
            .map_err(|e| LockError::ConnectionFailed(e.to_string()))?;
        peripheral.discover_services().await?;

        if !peripheral.services().iter().any(|s| s.uuid == SERVICE_UUID) {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect from {address}: {e}");
            }
            return Err(LockError::Protocol(format!(
                "{address} does not expose the lock service"
            )));
        }

        info!("Connected to {address}");
        Ok(peripheral)
    }

    async fn write(&self, conn: &Peripheral, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let characteristic = find_characteristic(conn, characteristic)?;
        conn.write(&characteristic, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn read(&self, conn: &Peripheral, characteristic: Uuid) -> Result<Vec<u8>> {
        let characteristic = find_characteristic(conn, characteristic)?;
        Ok(conn.read(&characteristic).await?)
    }

    async fn subscribe_notifications(
        &self,
        conn: &Peripheral,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>> {
        let characteristic = find_characteristic(conn, characteristic)?;
        conn.subscribe(&characteristic).await?;

        let uuid = characteristic.uuid;
        let stream = conn
            .notifications()
            .await?
            .filter_map(move |notification| async move {
                (notification.uuid == uuid).then_some(notification.value)
            });
        Ok(stream.boxed())
    }

    async fn rssi(&self, conn: &Peripheral) -> Result<Option<i16>> {
        Ok(conn.properties().await?.and_then(|p| p.rssi))
    }

    async fn disconnect(&self, conn: Peripheral) -> Result<()> {
        conn.disconnect().await?;
        info!("Disconnected from {}", conn.address());
        Ok(())
    }
}
