use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        WriteType,
    },
    platform::{Manager, Peripheral},
};
use futures::stream::{BoxStream, StreamExt};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{DynoError, Result},
    types::{DeviceFilter, DeviceHandle},
};

/// Stream of raw notification payloads for one characteristic
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// A resolved characteristic inside a resolved service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    /// Owning service
    pub service: Uuid,
    /// Characteristic UUID
    pub uuid: Uuid,
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.uuid)
    }
}

/// Primitive operations over an attribute-based wireless link
///
/// Every method is a single link operation with no retry or timeout policy;
/// [`Transport`](crate::Transport) layers those on top.
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Whether the host has a usable Bluetooth adapter
    async fn is_available(&self) -> bool;

    /// Discover the first peripheral accepted by `filter`
    async fn request_device(&self, filter: &DeviceFilter, scan_timeout_ms: u64)
        -> Result<DeviceHandle>;

    /// Perform one connection attempt, including service discovery
    async fn connect(&self, device: &DeviceHandle) -> Result<()>;

    /// Current link state
    async fn is_connected(&self, device: &DeviceHandle) -> bool;

    /// Resolve a primary service
    async fn get_service(&self, device: &DeviceHandle, service: Uuid) -> Result<()>;

    /// Resolve a characteristic inside a service
    async fn get_characteristic(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicRef>;

    /// Read an attribute value
    async fn read_value(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>>;

    /// Write an attribute value
    async fn write_value(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
        data: &[u8],
    ) -> Result<()>;

    /// Enable notifications and return the payload stream
    async fn subscribe(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<NotificationStream>;

    /// Disable notifications
    async fn unsubscribe(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<()>;

    /// Request a disconnect
    async fn disconnect(&self, device: &DeviceHandle) -> Result<()>;

    /// Every peripheral this backend has seen
    async fn known_devices(&self) -> Vec<DeviceHandle>;
}

/// [`BleBackend`] backed by `btleplug`
pub struct BtleplugBackend {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, (DeviceHandle, Peripheral)>>>,
}

impl BtleplugBackend {
    /// Create a new btleplug backend
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn peripheral(&self, device: &DeviceHandle) -> Result<Peripheral> {
        self.peripherals
            .lock()
            .await
            .get(&device.id)
            .map(|(_, peripheral)| peripheral.clone())
            .ok_or(DynoError::DeviceNotFound)
    }

    async fn characteristic(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(device).await?;
        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
            .ok_or(DynoError::CharacteristicNotFound(characteristic.uuid))?;

        Ok((peripheral, found))
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    async fn is_available(&self) -> bool {
        self.manager
            .adapters()
            .await
            .is_ok_and(|adapters| !adapters.is_empty())
    }

    async fn request_device(
        &self,
        filter: &DeviceFilter,
        scan_timeout_ms: u64,
    ) -> Result<DeviceHandle> {
        info!("Starting scan for dynamometers...");

        let adapters = self.manager.adapters().await?;
        let central = adapters.first().ok_or(DynoError::Unavailable)?;

        central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_millis(scan_timeout_ms)).await;
        central.stop_scan().await?;

        let mut candidates = Vec::new();
        for peripheral in central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };

            let id = peripheral.id().to_string();
            if !filter.matches(&id, properties.local_name.as_deref()) {
                continue;
            }

            let handle = DeviceHandle::new(id.clone(), properties.local_name.clone());
            info!("Found dynamometer: {} ({})", handle, properties.address);
            candidates.push((properties.rssi.unwrap_or(i16::MIN), handle.clone()));
            self.peripherals
                .lock()
                .await
                .insert(id, (handle, peripheral));
        }

        info!("Scan completed. Found {} dynamometer(s)", candidates.len());

        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates
            .into_iter()
            .next()
            .map(|(_, handle)| handle)
            .ok_or(DynoError::DeviceNotFound)
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        Ok(())
    }

    async fn is_connected(&self, device: &DeviceHandle) -> bool {
        match self.peripheral(device).await {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn get_service(&self, device: &DeviceHandle, service: Uuid) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        if peripheral.services().iter().any(|s| s.uuid == service) {
            Ok(())
        } else {
            Err(DynoError::ServiceNotFound)
        }
    }

    async fn get_characteristic(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicRef> {
        let wanted = CharacteristicRef {
            service,
            uuid: characteristic,
        };
        self.characteristic(device, &wanted).await?;
        Ok(wanted)
    }

    async fn read_value(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>> {
        let (peripheral, found) = self.characteristic(device, characteristic).await?;
        Ok(peripheral.read(&found).await?)
    }

    async fn write_value(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
        data: &[u8],
    ) -> Result<()> {
        let (peripheral, found) = self.characteristic(device, characteristic).await?;
        let write_type = if found.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        peripheral
            .write(&found, data, write_type)
            .await
            .map_err(|e| DynoError::Transport(format!("Failed to write {characteristic}: {e}")))
    }

    async fn subscribe(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<NotificationStream> {
        let (peripheral, found) = self.characteristic(device, characteristic).await?;
        peripheral.subscribe(&found).await?;

        let uuid = found.uuid;
        let notifications = peripheral.notifications().await?;
        debug!("Notification stream opened for {}", characteristic);

        Ok(notifications
            .filter_map(move |n| futures::future::ready((n.uuid == uuid).then_some(n.value)))
            .boxed())
    }

    async fn unsubscribe(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<()> {
        let (peripheral, found) = self.characteristic(device, characteristic).await?;
        peripheral.unsubscribe(&found).await?;
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceHandle) -> Result<()> {
        self.peripheral(device).await?.disconnect().await?;
        Ok(())
    }

    async fn known_devices(&self) -> Vec<DeviceHandle> {
        self.peripherals
            .lock()
            .await
            .values()
            .map(|(handle, _)| handle.clone())
            .collect()
    }
}
