use crate::{
    ble::{BleBackend, BtleplugBackend},
    calibration,
    error::{DynoError, Result},
    protocol::{
        self, Command, ProtocolRevision, BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID,
        DEVICE_INFORMATION_SERVICE_UUID, FIRMWARE_REVISION_CHAR_UUID,
        HARDWARE_REVISION_CHAR_UUID, SYSTEM_ID_CHAR_UUID,
    },
    rep::{RepDetector, RepPhase},
    stream::{self, BatchCallback, CallbackResult, ForceDecoder, ValueCallback},
    transport::{Link, RecoveryHandler, Transport},
    types::{
        CalibrationResult, ConnectionParams, DeviceFilter, DeviceHandle, DeviceMetadata,
        DeviceStatus, ReferencePoint, RepSummary, TimingConfig,
    },
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Listener for status transitions
pub type StatusCallback = Arc<dyn Fn(DeviceStatus) + Send + Sync>;

/// Callback for rep start and stop events
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

type DisconnectCallback = Box<dyn FnOnce() + Send>;

/// Everything a [`DeviceSession`] can be configured with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Discovery and connection parameters
    pub params: ConnectionParams,
    /// Protocol timings
    pub timing: TimingConfig,
    /// Which peripherals `pair` accepts
    pub filter: DeviceFilter,
}

/// Optional consumers for [`DeviceSession::measure_rep`]
#[derive(Clone, Default)]
pub struct RepCallbacks {
    /// Called for every decoded value, in every phase
    pub on_value: Option<ValueCallback>,
    /// Called with every decoded notification batch, in every phase
    pub on_values: Option<BatchCallback>,
    /// Called once the rise is confirmed
    pub on_start: Option<EventCallback>,
    /// Called once the release is confirmed
    pub on_stop: Option<EventCallback>,
}

impl RepCallbacks {
    /// Set the per-value consumer
    #[must_use]
    pub fn on_value<F>(mut self, callback: F) -> Self
    where
        F: Fn(f64) -> CallbackResult + Send + Sync + 'static,
    {
        self.on_value = Some(Arc::new(callback));
        self
    }

    /// Set the per-batch consumer
    #[must_use]
    pub fn on_values<F>(mut self, callback: F) -> Self
    where
        F: Fn(&[f64]) -> CallbackResult + Send + Sync + 'static,
    {
        self.on_values = Some(Arc::new(callback));
        self
    }

    /// Set the rise callback
    #[must_use]
    pub fn on_start<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(callback));
        self
    }

    /// Set the release callback
    #[must_use]
    pub fn on_stop<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_stop = Some(Arc::new(callback));
        self
    }
}

/// Per-connection state; dropped as a whole on disconnect
struct Connection {
    link: Link,
    metadata: DeviceMetadata,
    reference: Option<ReferencePoint>,
    calibration: Option<CalibrationResult>,
}

#[derive(Default)]
struct SessionTasks {
    keep_alive: Option<JoinHandle<()>>,
    link_monitor: Option<JoinHandle<()>>,
    streaming: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn abort_all(&mut self) {
        for task in [
            self.keep_alive.take(),
            self.link_monitor.take(),
            self.streaming.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct SessionInner {
    transport: Arc<Transport>,
    config: SessionConfig,
    recovery: RwLock<Option<Arc<dyn RecoveryHandler>>>,
    status: RwLock<DeviceStatus>,
    paired: RwLock<Option<DeviceHandle>>,
    connection: RwLock<Option<Connection>>,
    tasks: Mutex<SessionTasks>,
    status_listeners: RwLock<Vec<StatusCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
    teardown_lock: Mutex<()>,
}

/// Connection manager for one force dynamometer
///
/// `DeviceSession` owns the single link to a dynamometer and walks it through
/// the status state machine:
///
/// ```text
/// Disconnected -> WaitingForSetup -> WaitingForCalibration -> Calibrating -> Ready
///                                                                             |  ^
///                                   Measuring -> MeasuringGoingUp -> MeasuringGoingDown
/// ```
///
/// Any state can fall back to `Disconnected`. The handle is cheap to clone;
/// clones share the same link. The session is not re-entrant: callers must not
/// run two `connect()` calls at once.
///
/// # Examples
///
/// ```no_run
/// use dynolink::{DeviceSession, RepCallbacks, SessionConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let session = DeviceSession::with_btleplug(SessionConfig::default()).await?;
///     session.on_disconnect(|| eprintln!("dynamometer lost")).await;
///
///     session.connect().await?;
///     session.setup(None, None).await?;
///     session.start_calibration().await?;
///
///     let rep = session
///         .measure_rep(RepCallbacks::default().on_start(|| println!("pull!")))
///         .await?;
///     println!("peak {:.2} kgf", rep.max);
///
///     session.disconnect().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    /// Create a session over any backend
    #[must_use]
    pub fn new(backend: Arc<dyn BleBackend>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                transport: Arc::new(Transport::new(backend)),
                config,
                recovery: RwLock::new(None),
                status: RwLock::new(DeviceStatus::Disconnected),
                paired: RwLock::new(None),
                connection: RwLock::new(None),
                tasks: Mutex::new(SessionTasks::default()),
                status_listeners: RwLock::new(Vec::new()),
                on_disconnect: Mutex::new(None),
                teardown_lock: Mutex::new(()),
            }),
        }
    }

    /// Create a session over the platform Bluetooth stack
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::Ble`] if the Bluetooth manager cannot be initialized.
    pub async fn with_btleplug(config: SessionConfig) -> Result<Self> {
        let backend = BtleplugBackend::new().await?;
        Ok(Self::new(Arc::new(backend), config))
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current status
    pub async fn status(&self) -> DeviceStatus {
        *self.inner.status.read().await
    }

    /// Register a listener for every status transition
    pub async fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(DeviceStatus) + Send + Sync + 'static,
    {
        self.inner
            .status_listeners
            .write()
            .await
            .push(Arc::new(callback));
    }

    /// Register the callback fired once when the link goes away
    ///
    /// The callback is cleared after it fires and has to be registered again
    /// for the next connection. Registering replaces any previous callback.
    pub async fn on_disconnect<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.inner.on_disconnect.lock().await = Some(Box::new(callback));
    }

    /// Install a handler that extends connection retries with a grace period
    pub async fn set_recovery_handler(&self, handler: Arc<dyn RecoveryHandler>) {
        *self.inner.recovery.write().await = Some(handler);
    }

    /// Whether a link is established
    pub async fn is_connected(&self) -> bool {
        match self.link().await {
            Ok(link) => link.is_connected().await,
            Err(_) => false,
        }
    }

    /// Whether continuous streaming is running
    pub async fn is_streaming(&self) -> bool {
        self.inner
            .tasks
            .lock()
            .await
            .streaming
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// The paired peripheral
    pub async fn device(&self) -> Option<DeviceHandle> {
        self.inner.paired.read().await.clone()
    }

    /// Protocol revision resolved for the current connection
    pub async fn revision(&self) -> Option<ProtocolRevision> {
        self.inner
            .connection
            .read()
            .await
            .as_ref()
            .map(|c| c.link.revision)
    }

    /// Metadata read during `connect`
    pub async fn metadata(&self) -> Option<DeviceMetadata> {
        self.inner
            .connection
            .read()
            .await
            .as_ref()
            .map(|c| c.metadata.clone())
    }

    /// Calibration for the current connection
    pub async fn calibration(&self) -> Option<CalibrationResult> {
        self.inner
            .connection
            .read()
            .await
            .as_ref()
            .and_then(|c| c.calibration)
    }

    /// Discover a dynamometer and remember it for `connect`
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::Unavailable`] without Bluetooth and
    /// [`DynoError::DeviceNotFound`] if no peripheral matches the filter.
    pub async fn pair(&self) -> Result<DeviceHandle> {
        let config = &self.inner.config;
        let device = self
            .inner
            .transport
            .request_device(&config.filter, config.params.scan_timeout_ms)
            .await?;

        info!("Paired with {}", device);
        *self.inner.paired.write().await = Some(device.clone());
        Ok(device)
    }

    /// Connect to the paired dynamometer, pairing first if needed
    ///
    /// Runs the whole bring-up: connect with retries, stabilization delay,
    /// protocol revision probing, best-effort metadata, characteristic
    /// resolution, keep-alive and link monitoring. Ends in
    /// [`DeviceStatus::WaitingForSetup`]. Calling it while connected is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::ConnectionFailed`] if the link cannot be held,
    /// [`DynoError::ServiceNotFound`] if neither protocol revision resolves,
    /// and any pairing error.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.connection.read().await.is_some() {
            debug!("connect() called while already connected");
            return Ok(());
        }

        let device = match self.device().await {
            Some(device) => device,
            None => self.pair().await?,
        };

        let recovery = self.inner.recovery.read().await.clone();
        let transport = &self.inner.transport;
        let params = &self.inner.config.params;
        transport
            .connect(&device, params, recovery.as_deref())
            .await?;

        match self.bring_up(&device).await {
            Ok(connection) => {
                let link = connection.link.clone();
                info!(
                    "Connected to {} ({} protocol, firmware {}, hardware {})",
                    device,
                    link.revision,
                    connection.metadata.firmware_version,
                    connection.metadata.hardware_version
                );
                *self.inner.connection.write().await = Some(connection);
                self.start_background_tasks(link).await;
                self.inner.set_status(DeviceStatus::WaitingForSetup).await;
                Ok(())
            }
            Err(e) => {
                error!("Connection bring-up for {} failed: {}", device, e);
                if let Err(cleanup) = transport.disconnect(&device, &self.inner.config.timing).await {
                    debug!("Cleanup after failed bring-up: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn bring_up(&self, device: &DeviceHandle) -> Result<Connection> {
        let transport = &self.inner.transport;
        let stabilization = self.inner.config.params.stabilization_delay_ms;

        tokio::time::sleep(Duration::from_millis(stabilization)).await;
        if !transport.is_connected(device).await {
            return Err(DynoError::ConnectionFailed(format!(
                "link dropped within {stabilization}ms of connecting"
            )));
        }

        let link = self.resolve_link(device).await?;
        let metadata = self.fetch_metadata(device).await;

        Ok(Connection {
            link,
            metadata,
            reference: None,
            calibration: None,
        })
    }

    /// Probe Modern first, then Legacy, resolving the full attribute triple
    async fn resolve_link(&self, device: &DeviceHandle) -> Result<Link> {
        let transport = &self.inner.transport;

        for revision in ProtocolRevision::PROBE_ORDER {
            let resolved = async {
                transport.get_service(device, revision.service_uuid()).await?;
                let command = transport
                    .get_characteristic(device, revision.service_uuid(), revision.write_uuid())
                    .await?;
                let data = transport
                    .get_characteristic(device, revision.service_uuid(), revision.read_uuid())
                    .await?;
                Ok::<_, DynoError>((command, data))
            }
            .await;

            match resolved {
                Ok((command, data)) => {
                    debug!("Resolved {} protocol on {}", revision, device);
                    return Ok(Link {
                        transport: Arc::clone(transport),
                        device: device.clone(),
                        revision,
                        command,
                        data,
                    });
                }
                Err(e) => debug!("{} protocol not available on {}: {}", revision, device, e),
            }
        }

        Err(DynoError::ServiceNotFound)
    }

    async fn fetch_metadata(&self, device: &DeviceHandle) -> DeviceMetadata {
        let battery_level = self
            .read_with_retry(
                device,
                BATTERY_SERVICE_UUID,
                BATTERY_LEVEL_CHAR_UUID,
                protocol::decode_battery_level,
            )
            .await;
        let mac_address = self
            .read_with_retry(
                device,
                DEVICE_INFORMATION_SERVICE_UUID,
                SYSTEM_ID_CHAR_UUID,
                protocol::decode_mac_address,
            )
            .await;
        let firmware_version = self
            .read_with_retry(
                device,
                DEVICE_INFORMATION_SERVICE_UUID,
                FIRMWARE_REVISION_CHAR_UUID,
                protocol::decode_version,
            )
            .await;
        let hardware_version = self
            .read_with_retry(
                device,
                DEVICE_INFORMATION_SERVICE_UUID,
                HARDWARE_REVISION_CHAR_UUID,
                protocol::decode_version,
            )
            .await;

        if battery_level.is_none() {
            warn!("Battery level unavailable");
        }
        if mac_address.is_none() {
            warn!("Device address unavailable");
        }

        DeviceMetadata {
            battery_level,
            mac_address,
            firmware_version: firmware_version.unwrap_or_else(|| {
                warn!("Firmware version unavailable, assuming {}", DeviceMetadata::DEFAULT_VERSION);
                DeviceMetadata::DEFAULT_VERSION.to_string()
            }),
            hardware_version: hardware_version.unwrap_or_else(|| {
                warn!("Hardware version unavailable, assuming {}", DeviceMetadata::DEFAULT_VERSION);
                DeviceMetadata::DEFAULT_VERSION.to_string()
            }),
        }
    }

    /// Read and decode one attribute, retrying with linear backoff
    async fn read_with_retry<T>(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
        decode: fn(&[u8]) -> Result<T>,
    ) -> Option<T> {
        let transport = &self.inner.transport;
        let timing = &self.inner.config.timing;

        for attempt in 1..=timing.metadata_attempts {
            let result = async {
                let found = transport
                    .get_characteristic(device, service, characteristic)
                    .await?;
                let raw = transport.read_value(device, &found).await?;
                decode(&raw)
            }
            .await;

            match result {
                Ok(value) => return Some(value),
                Err(e) => {
                    debug!(
                        "Reading {} failed on attempt {}/{}: {}",
                        characteristic, attempt, timing.metadata_attempts, e
                    );
                    if attempt < timing.metadata_attempts {
                        let backoff = timing.metadata_backoff_ms * u64::from(attempt);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }

        None
    }

    async fn start_background_tasks(&self, link: Link) {
        let timing = &self.inner.config.timing;
        let keep_alive = spawn_keep_alive(link.clone(), timing.keep_alive_interval_ms);
        let link_monitor = spawn_link_monitor(
            Arc::downgrade(&self.inner),
            link,
            timing.link_monitor_interval_ms,
        );

        let mut tasks = self.inner.tasks.lock().await;
        tasks.abort_all();
        tasks.keep_alive = Some(keep_alive);
        tasks.link_monitor = Some(link_monitor);
    }

    /// Choose the reference point used to scale samples
    ///
    /// Missing values come from the factory reference for the hardware
    /// version: `8.65 kgf / 235` for hardware `1.x`, `45 kgf / 3800` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::NotConnected`] without a link,
    /// [`DynoError::InvalidState`] while measuring, and
    /// [`DynoError::InvalidParameters`] if the values do not give a positive
    /// conversion factor.
    pub async fn setup(
        &self,
        reference_weight: Option<f64>,
        reference_adc_value: Option<i32>,
    ) -> Result<ReferencePoint> {
        self.ensure_idle().await?;

        let reference = {
            let mut connection = self.inner.connection.write().await;
            let connection = connection.as_mut().ok_or(DynoError::NotConnected)?;
            let defaults = ReferencePoint::for_hardware(&connection.metadata.hardware_version);
            let reference = ReferencePoint {
                weight: reference_weight.unwrap_or(defaults.weight),
                adc_value: reference_adc_value.unwrap_or(defaults.adc_value),
            };

            if !reference.is_valid() {
                return Err(DynoError::InvalidParameters(format!(
                    "reference {} kgf at {} counts gives no positive conversion factor",
                    reference.weight, reference.adc_value
                )));
            }

            connection.reference = Some(reference);
            reference
        };

        info!(
            "Reference set to {} kgf at {} counts",
            reference.weight, reference.adc_value
        );
        self.inner
            .set_status(DeviceStatus::WaitingForCalibration)
            .await;
        Ok(reference)
    }

    /// Measure the zero offset
    ///
    /// Samples the unloaded sensor for the calibration window and reduces the
    /// samples with a 10% trimmed mean. If `setup` was skipped the factory
    /// reference for the hardware version is used. Ends in
    /// [`DeviceStatus::Ready`]; on failure the previous status is restored.
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::CalibrationFailed`] if the window yields too few
    /// samples (the caller may retry), [`DynoError::NotConnected`] without a
    /// link, and [`DynoError::InvalidState`] while measuring.
    pub async fn start_calibration(&self) -> Result<CalibrationResult> {
        self.ensure_idle().await?;

        let (link, reference) = {
            let connection = self.inner.connection.read().await;
            let connection = connection.as_ref().ok_or(DynoError::NotConnected)?;
            let reference = connection.reference.unwrap_or_else(|| {
                let defaults = ReferencePoint::for_hardware(&connection.metadata.hardware_version);
                info!("No reference set, using factory reference {:?}", defaults);
                defaults
            });
            (connection.link.clone(), reference)
        };

        let previous = self.status().await;
        self.inner.set_status(DeviceStatus::Calibrating).await;

        let window = Duration::from_millis(self.inner.config.timing.calibration_window_ms);
        let outcome = match calibration::collect_samples(&link, window).await {
            Ok(samples) => calibration::zero_offset(samples),
            Err(e) => Err(e),
        };

        let zero_adc_value = match outcome {
            Ok(zero) => zero,
            Err(e) => {
                warn!("Calibration failed: {}", e);
                if self.inner.connection.read().await.is_some() {
                    self.inner.set_status(previous).await;
                }
                return Err(e);
            }
        };

        let result = CalibrationResult::new(zero_adc_value, reference);
        {
            let mut connection = self.inner.connection.write().await;
            let connection = connection.as_mut().ok_or(DynoError::NotConnected)?;
            connection.reference = Some(reference);
            connection.calibration = Some(result);
        }

        info!(
            "Calibrated: zero offset {} counts, {:.5} kgf per count",
            result.zero_adc_value,
            result.conversion_factor()
        );
        self.inner.set_status(DeviceStatus::Ready).await;
        Ok(result)
    }

    /// Stream calibrated force values to `on_value` until [`stop_streaming`]
    ///
    /// Values are in kgf, rounded to two decimals and never negative. Errors
    /// returned by the callback are logged and do not stop the stream.
    ///
    /// [`stop_streaming`]: Self::stop_streaming
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::InvalidState`] before calibration or while already
    /// measuring, and [`DynoError::NotConnected`] without a link.
    pub async fn start_continuous_streaming<F>(&self, on_value: F) -> Result<()>
    where
        F: Fn(f64) -> CallbackResult + Send + Sync + 'static,
    {
        self.ensure_idle().await?;
        let (link, decoder) = self.calibrated_link().await?;

        let subscription = link.resubscribe().await?;
        let task = stream::spawn_stream(subscription, decoder, Arc::new(on_value));

        if let Err(e) = link.send(Command::Start).await {
            task.abort();
            if let Err(release) = link.release().await {
                debug!("Releasing stream subscription failed: {}", release);
            }
            return Err(e);
        }

        if let Some(previous) = self.inner.tasks.lock().await.streaming.replace(task) {
            previous.abort();
        }

        info!("Continuous streaming started");
        self.inner.set_status(DeviceStatus::Measuring).await;
        Ok(())
    }

    /// Stop continuous streaming and return to [`DeviceStatus::Ready`]
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::NotConnected`] without a link,
    /// [`DynoError::InvalidState`] unless continuous streaming is running, or
    /// the stop write failure.
    pub async fn stop_streaming(&self) -> Result<()> {
        let link = self.link().await?;
        let task = {
            let mut tasks = self.inner.tasks.lock().await;
            let status = self.status().await;
            if status != DeviceStatus::Measuring || tasks.streaming.is_none() {
                return Err(DynoError::InvalidState {
                    state: format!("{status}, not streaming"),
                });
            }
            tasks.streaming.take()
        };

        let sent = link.send(Command::Stop).await;
        if let Some(task) = task {
            task.abort();
        }
        if let Err(e) = link.release().await {
            debug!("Releasing stream subscription failed: {}", e);
        }
        sent?;

        info!("Continuous streaming stopped");
        self.inner.set_status(DeviceStatus::Ready).await;
        Ok(())
    }

    /// Capture one contraction: rise, peak, release
    ///
    /// Every decoded value goes to the callbacks regardless of phase. The
    /// status follows the detector through `Measuring`, `MeasuringGoingUp` and
    /// `MeasuringGoingDown` and ends in `Ready`.
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::InvalidState`] before calibration or while already
    /// measuring, and [`DynoError::NotConnected`] if the link goes away before
    /// the contraction completes.
    pub async fn measure_rep(&self, callbacks: RepCallbacks) -> Result<RepSummary> {
        self.ensure_idle().await?;
        let (link, decoder) = self.calibrated_link().await?;

        let mut subscription = link.resubscribe().await?;
        self.inner.set_status(DeviceStatus::Measuring).await;

        let outcome = async {
            link.send(Command::Start).await?;
            let mut detector = RepDetector::new();

            while let Some(payload) = subscription.next().await {
                let values = decoder.decode_payload(&payload);

                if let Some(on_value) = &callbacks.on_value {
                    for &value in &values {
                        stream::deliver(on_value, value);
                    }
                }
                if let Some(on_values) = &callbacks.on_values {
                    if let Err(e) = on_values(&values) {
                        warn!("Batch consumer failed: {}", e);
                    }
                }

                let Some(phase) = detector.feed(&values) else {
                    continue;
                };
                debug!("Rep phase changed to {}", phase);

                match phase {
                    RepPhase::GoingUp => {
                        self.inner.set_status(phase.into()).await;
                        if let Some(on_start) = &callbacks.on_start {
                            on_start();
                        }
                    }
                    RepPhase::GoingDown => self.inner.set_status(phase.into()).await,
                    RepPhase::Done => {
                        if let Some(on_stop) = &callbacks.on_stop {
                            on_stop();
                        }
                        link.send(Command::Stop).await?;
                        return Ok(detector.into_summary());
                    }
                    RepPhase::Measuring => {}
                }
            }

            Err(DynoError::NotConnected)
        }
        .await;

        if let Err(e) = link.release().await {
            debug!("Releasing rep subscription failed: {}", e);
        }

        match outcome {
            Ok(summary) => {
                info!(
                    "Rep captured: peak {:.2} kgf, mean {:.2} kgf over {} values",
                    summary.max,
                    summary.avg,
                    summary.data.len()
                );
                self.inner.set_status(DeviceStatus::Ready).await;
                Ok(summary)
            }
            Err(e) => {
                warn!("Rep capture aborted: {}", e);
                if self.inner.connection.read().await.is_some() {
                    self.inner.set_status(DeviceStatus::Ready).await;
                }
                Err(e)
            }
        }
    }

    /// Re-read the battery level on the live link
    ///
    /// # Errors
    ///
    /// Returns [`DynoError::NotConnected`] without a link, or the read/decode
    /// failure.
    pub async fn refresh_battery(&self) -> Result<u8> {
        let link = self.link().await?;
        let transport = &self.inner.transport;
        let found = transport
            .get_characteristic(&link.device, BATTERY_SERVICE_UUID, BATTERY_LEVEL_CHAR_UUID)
            .await?;
        let level = protocol::decode_battery_level(&transport.read_value(&link.device, &found).await?)?;

        if let Some(connection) = self.inner.connection.write().await.as_mut() {
            connection.metadata.battery_level = Some(level);
        }
        debug!("Battery level {}%", level);
        Ok(level)
    }

    /// Release the link and every per-connection resource
    ///
    /// Cancels the keep-alive, streaming and link-monitor tasks, disconnects,
    /// forgets the paired device, revision, metadata and calibration, moves to
    /// [`DeviceStatus::Disconnected`] and fires the disconnect callback once.
    /// A second call is a no-op.
    ///
    /// # Errors
    ///
    /// Currently never fails; link-level problems are logged.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.teardown(false).await;
        Ok(())
    }

    async fn link(&self) -> Result<Link> {
        self.inner
            .connection
            .read()
            .await
            .as_ref()
            .map(|c| c.link.clone())
            .ok_or(DynoError::NotConnected)
    }

    async fn calibrated_link(&self) -> Result<(Link, ForceDecoder)> {
        let connection = self.inner.connection.read().await;
        let connection = connection.as_ref().ok_or(DynoError::NotConnected)?;
        let calibration = connection.calibration.ok_or_else(|| DynoError::InvalidState {
            state: "not calibrated".to_string(),
        })?;
        Ok((connection.link.clone(), ForceDecoder::new(&calibration)))
    }

    async fn ensure_idle(&self) -> Result<()> {
        let status = self.status().await;
        if status == DeviceStatus::Disconnected {
            return Err(DynoError::NotConnected);
        }
        if status.is_measuring() || status == DeviceStatus::Calibrating {
            return Err(DynoError::InvalidState {
                state: status.to_string(),
            });
        }
        Ok(())
    }
}

impl SessionInner {
    async fn set_status(&self, status: DeviceStatus) {
        {
            let mut current = self.status.write().await;
            if *current == status {
                return;
            }
            debug!("Status {} -> {}", *current, status);
            *current = status;
        }

        let listeners = self.status_listeners.read().await.clone();
        for listener in listeners {
            listener(status);
        }
    }

    /// Shared by `disconnect()` and the link monitor
    async fn teardown(&self, link_lost: bool) {
        // Held for the whole teardown; a concurrent caller waits and then
        // finds nothing left to release.
        let _guard = self.teardown_lock.lock().await;
        let (connection, paired) = {
            let mut connection = self.connection.write().await;
            let mut paired = self.paired.write().await;
            (connection.take(), paired.take())
        };
        if connection.is_none() && paired.is_none() {
            return;
        }

        {
            let mut tasks = self.tasks.lock().await;
            if link_lost {
                // Called from the monitor itself; let it finish on its own.
                tasks.link_monitor.take();
            }
            tasks.abort_all();
        }

        if let Some(connection) = connection {
            if link_lost {
                warn!("Connection to {} lost", connection.link.device);
            }
            if let Err(e) = self
                .transport
                .disconnect(&connection.link.device, &self.config.timing)
                .await
            {
                warn!("Disconnect did not complete cleanly: {}", e);
            }
        }

        self.set_status(DeviceStatus::Disconnected).await;

        let callback = self.on_disconnect.lock().await.take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();

        let Some(connection) = self.connection.get_mut().take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&self.transport);
            let timing = self.config.timing.clone();
            runtime.spawn(async move {
                if let Err(e) = transport.disconnect(&connection.link.device, &timing).await {
                    debug!("Disconnect on drop did not complete cleanly: {}", e);
                }
            });
        }
    }
}

fn spawn_keep_alive(link: Link, interval_ms: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(interval_ms);
        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            ticker.tick().await;
            if let Err(e) = link.send(Command::KeepAlive).await {
                debug!("Keep-alive write failed, heartbeat stopped: {}", e);
                break;
            }
        }
    })
}

fn spawn_link_monitor(session: Weak<SessionInner>, link: Link, interval_ms: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(interval_ms);

        loop {
            tokio::time::sleep(period).await;
            if link.is_connected().await {
                continue;
            }

            if let Some(session) = session.upgrade() {
                session.teardown(true).await;
            }
            break;
        }
    })
}
