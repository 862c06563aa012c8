use async_trait::async_trait;
use futures::stream::StreamExt;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    ble::{BleBackend, CharacteristicRef, NotificationStream},
    error::{DynoError, Result},
    protocol::{Command, ProtocolRevision},
    types::{ConnectionParams, DeviceFilter, DeviceHandle, TimingConfig},
};

/// Hook consulted once the regular connection attempts are exhausted
///
/// While the handler keeps returning `true` the transport keeps trying to
/// connect until [`ConnectionParams::recovery_grace_ms`] has elapsed. A typical
/// handler asks the user to wake the device.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Called before every grace-period attempt; `round` starts at 1
    async fn on_connect_stalled(&self, device: &DeviceHandle, round: u32) -> bool;
}

/// Notification payloads delivered for one subscribed characteristic
#[derive(Debug)]
pub struct Subscription {
    characteristic: CharacteristicRef,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    /// The characteristic this subscription listens to
    #[must_use]
    pub const fn characteristic(&self) -> &CharacteristicRef {
        &self.characteristic
    }

    /// Wait for the next payload; `None` once the subscription is released
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    /// Take an already delivered payload without waiting
    pub fn try_next(&mut self) -> Option<Vec<u8>> {
        self.receiver.try_recv().ok()
    }
}

/// Connection management over a [`BleBackend`]
///
/// Adds the policy the raw backend lacks: bounded connect retries with
/// per-attempt timeouts, single-subscriber notification bookkeeping, a write
/// lock shared by every command and heartbeat, and a disconnect that waits for
/// the link to drop before flushing stray peripherals.
pub struct Transport {
    backend: Arc<dyn BleBackend>,
    generation: Arc<AtomicU64>,
    subscriptions: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    write_lock: Mutex<()>,
}

impl Transport {
    /// Wrap a backend
    #[must_use]
    pub fn new(backend: Arc<dyn BleBackend>) -> Self {
        Self {
            backend,
            generation: Arc::new(AtomicU64::new(0)),
            subscriptions: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Whether the host has a usable Bluetooth adapter
    pub async fn is_available(&self) -> bool {
        self.backend.is_available().await
    }

    /// Discover a peripheral accepted by `filter`
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::Unavailable`] without an adapter and
    /// [`DynoError::DeviceNotFound`] if nothing matched.
    pub async fn request_device(
        &self,
        filter: &DeviceFilter,
        scan_timeout_ms: u64,
    ) -> Result<DeviceHandle> {
        if !self.backend.is_available().await {
            return Err(DynoError::Unavailable);
        }
        self.backend.request_device(filter, scan_timeout_ms).await
    }

    /// Connect with bounded retries
    ///
    /// Each attempt races the backend connect against `params.timeout_ms`.
    /// After every attempt the link state is checked, so a connect that lands
    /// late still counts once the link is up.
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::ConnectionFailed`] once the attempts (and the
    /// recovery grace period, if a handler is supplied) are exhausted.
    pub async fn connect(
        &self,
        device: &DeviceHandle,
        params: &ConnectionParams,
        recovery: Option<&dyn RecoveryHandler>,
    ) -> Result<()> {
        info!("Connecting to {}", device);

        let mut last_error = None;
        for attempt in 1..=params.max_retries {
            if let Err(e) = self.connect_attempt(device, params.timeout_ms).await {
                warn!(
                    "Connection attempt {}/{} to {} failed: {}",
                    attempt, params.max_retries, device, e
                );
                last_error = Some(e);
            }

            if self.backend.is_connected(device).await {
                info!("Connected to {} on attempt {}", device, attempt);
                return Ok(());
            }
        }

        let describe = |last: Option<DynoError>| {
            last.map_or_else(
                || format!("{} attempts exhausted", params.max_retries),
                |e| format!("{} attempts exhausted, last error: {e}", params.max_retries),
            )
        };

        let Some(recovery) = recovery else {
            error!("Giving up on {} after {} attempts", device, params.max_retries);
            return Err(DynoError::ConnectionFailed(describe(last_error)));
        };

        let deadline = Instant::now() + Duration::from_millis(params.recovery_grace_ms);
        let mut round = 0;
        while Instant::now() < deadline {
            round += 1;
            if !recovery.on_connect_stalled(device, round).await {
                info!("Recovery handler abandoned connection to {}", device);
                break;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt_timeout = remaining.min(Duration::from_millis(params.timeout_ms));
            let timeout_ms = u64::try_from(attempt_timeout.as_millis()).unwrap_or(u64::MAX);
            if let Err(e) = self.connect_attempt(device, timeout_ms).await {
                debug!("Recovery round {} failed: {}", round, e);
                last_error = Some(e);
            }

            if self.backend.is_connected(device).await {
                info!("Connected to {} after {} recovery round(s)", device, round);
                return Ok(());
            }
        }

        error!("Recovery grace period for {} expired", device);
        Err(DynoError::ConnectionFailed(describe(last_error)))
    }

    async fn connect_attempt(&self, device: &DeviceHandle, timeout_ms: u64) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.generation);
        let backend = Arc::clone(&self.backend);
        let target = device.clone();

        // The backend call keeps running after a timeout; a link it brings up
        // once its generation is stale is torn down again.
        let pending = tokio::spawn(async move {
            let result = backend.connect(&target).await;
            if current.load(Ordering::SeqCst) != generation {
                debug!(
                    "Discarding late connect result for attempt generation {}",
                    generation
                );
                if result.is_ok() {
                    if let Err(e) = backend.disconnect(&target).await {
                        warn!("Failed to drop late link to {}: {}", target, e);
                    }
                }
            }
            result
        });

        match timeout(Duration::from_millis(timeout_ms), pending).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(DynoError::ConnectionFailed(join_error.to_string())),
            Err(_) => {
                self.generation.fetch_add(1, Ordering::SeqCst);
                Err(DynoError::ConnectionTimeout { timeout_ms })
            }
        }
    }

    /// Current link state
    pub async fn is_connected(&self, device: &DeviceHandle) -> bool {
        self.backend.is_connected(device).await
    }

    /// Resolve a primary service
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::ServiceNotFound`] if the peripheral lacks it.
    pub async fn get_service(&self, device: &DeviceHandle, service: Uuid) -> Result<()> {
        self.backend.get_service(device, service).await
    }

    /// Resolve a characteristic inside a service
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::CharacteristicNotFound`] if it is missing.
    pub async fn get_characteristic(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<CharacteristicRef> {
        self.backend
            .get_characteristic(device, service, characteristic)
            .await
    }

    /// Read an attribute value
    ///
    /// # Errors
    ///
    /// Propagates backend read failures.
    pub async fn read_value(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>> {
        self.backend.read_value(device, characteristic).await
    }

    /// Write an attribute value; writes never interleave
    ///
    /// # Errors
    ///
    /// Propagates backend write failures.
    pub async fn write_value(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
        data: &[u8],
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        debug!("Writing {:02X?} to {}", data, characteristic.uuid);
        self.backend.write_value(device, characteristic, data).await
    }

    /// Subscribe to a characteristic's notifications
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::AlreadySubscribed`] if a live subscription exists.
    pub async fn subscribe(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<Subscription> {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions
            .get(&characteristic.uuid)
            .is_some_and(|task| !task.is_finished())
        {
            return Err(DynoError::AlreadySubscribed(characteristic.uuid));
        }

        let stream = self.backend.subscribe(device, characteristic).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(forward_notifications(stream, sender));
        subscriptions.insert(characteristic.uuid, task);
        debug!("Subscribed to {}", characteristic);

        Ok(Subscription {
            characteristic: *characteristic,
            receiver,
        })
    }

    /// Release a subscription
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::NotSubscribed`] if there is nothing to release.
    pub async fn unsubscribe(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<()> {
        let task = self
            .subscriptions
            .lock()
            .await
            .remove(&characteristic.uuid)
            .ok_or(DynoError::NotSubscribed(characteristic.uuid))?;
        task.abort();
        debug!("Unsubscribed from {}", characteristic);

        self.backend.unsubscribe(device, characteristic).await
    }

    /// Disconnect and wait for the link to drop
    ///
    /// Every subscription is released first. The link is then polled every
    /// `disconnect_poll_interval_ms`, up to `disconnect_poll_attempts` times,
    /// and finally every other known peripheral is disconnected as well.
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::Transport`] if the link was still up after polling.
    /// Cleanup of the other peripherals happens regardless.
    pub async fn disconnect(&self, device: &DeviceHandle, timing: &TimingConfig) -> Result<()> {
        info!("Disconnecting from {}", device);

        let released: Vec<JoinHandle<()>> = self
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in released {
            task.abort();
        }

        if let Err(e) = self.backend.disconnect(device).await {
            warn!("Disconnect request for {} failed: {}", device, e);
        }

        let mut dropped = false;
        for _ in 0..timing.disconnect_poll_attempts {
            if !self.backend.is_connected(device).await {
                dropped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(timing.disconnect_poll_interval_ms)).await;
        }
        if !dropped {
            dropped = !self.backend.is_connected(device).await;
        }

        for other in self.backend.known_devices().await {
            if other.id == device.id {
                continue;
            }
            if let Err(e) = self.backend.disconnect(&other).await {
                debug!("Flushing {} failed: {}", other, e);
            }
        }

        if dropped {
            info!("Disconnected from {}", device);
            Ok(())
        } else {
            Err(DynoError::Transport(format!(
                "{device} still connected after {} checks",
                timing.disconnect_poll_attempts
            )))
        }
    }
}

/// Forward notification payloads into a channel until either side closes
async fn forward_notifications(
    mut notifications: NotificationStream,
    sender: mpsc::UnboundedSender<Vec<u8>>,
) {
    while let Some(payload) = notifications.next().await {
        if sender.send(payload).is_err() {
            break;
        }
    }
    debug!("Notification stream closed");
}

/// A connected peripheral with its resolved command and sample characteristics
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) transport: Arc<Transport>,
    pub(crate) device: DeviceHandle,
    pub(crate) revision: ProtocolRevision,
    pub(crate) command: CharacteristicRef,
    pub(crate) data: CharacteristicRef,
}

impl Link {
    /// Write one opcode to the command characteristic
    pub(crate) async fn send(&self, command: Command) -> Result<()> {
        debug!("Sending {} command", command);
        self.transport
            .write_value(&self.device, &self.command, &command.to_bytes())
            .await
    }

    /// Subscribe to the sample characteristic from a clean slate
    pub(crate) async fn resubscribe(&self) -> Result<Subscription> {
        self.release().await?;
        self.transport.subscribe(&self.device, &self.data).await
    }

    /// Drop the sample subscription, if any
    pub(crate) async fn release(&self) -> Result<()> {
        match self.transport.unsubscribe(&self.device, &self.data).await {
            Ok(()) | Err(DynoError::NotSubscribed(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn is_connected(&self) -> bool {
        self.transport.is_connected(&self.device).await
    }
}
