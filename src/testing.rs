//! In-memory [`BleBackend`] used by the unit tests.

use async_trait::async_trait;
use bytes::BufMut;
use futures::{channel::mpsc, stream::StreamExt};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
};
use uuid::Uuid;

use crate::{
    ble::{BleBackend, CharacteristicRef, NotificationStream},
    error::{DynoError, Result},
    protocol::{
        Command, ProtocolRevision, BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID,
        DEVICE_INFORMATION_SERVICE_UUID, FIRMWARE_REVISION_CHAR_UUID,
        HARDWARE_REVISION_CHAR_UUID, SYSTEM_ID_CHAR_UUID,
    },
    types::{DeviceFilter, DeviceHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectBehavior {
    Succeed,
    Fail,
    FailTimes(u32),
    Hang,
    /// Connect lands after the given number of milliseconds
    Delay(u64),
    /// Connect reports success but the link is gone immediately afterwards
    DropAfterConnect,
}

struct MockState {
    available: bool,
    devices: Vec<DeviceHandle>,
    connected: HashSet<String>,
    connect_behavior: ConnectBehavior,
    connect_calls: u32,
    ignore_disconnect: bool,
    characteristics: HashSet<(Uuid, Uuid)>,
    values: HashMap<Uuid, Vec<u8>>,
    read_failures: HashMap<Uuid, u32>,
    writes: Vec<(Uuid, Vec<u8>)>,
    fail_writes: bool,
    subscribers: HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>,
    start_bursts: VecDeque<Vec<Vec<u8>>>,
}

pub(crate) struct MockBackend {
    state: Mutex<MockState>,
}

/// Encode samples the way the device batches them
pub(crate) fn payload(samples: &[i16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16(sample);
    }
    buf
}

impl MockBackend {
    /// One advertising dynamometer exposing `revision` plus the standard services
    pub(crate) fn dynamometer(revision: ProtocolRevision) -> Self {
        let mock = Self {
            state: Mutex::new(MockState {
                available: true,
                devices: vec![DeviceHandle::new(
                    "C0:FF:EE:00:00:42".to_string(),
                    Some("IsoForce-0042".to_string()),
                )],
                connected: HashSet::new(),
                connect_behavior: ConnectBehavior::Succeed,
                connect_calls: 0,
                ignore_disconnect: false,
                characteristics: HashSet::new(),
                values: HashMap::new(),
                read_failures: HashMap::new(),
                writes: Vec::new(),
                fail_writes: false,
                subscribers: HashMap::new(),
                start_bursts: VecDeque::new(),
            }),
        };

        mock.add_revision(revision);
        mock.set_attribute(BATTERY_SERVICE_UUID, BATTERY_LEVEL_CHAR_UUID, vec![76]);
        mock.set_attribute(
            DEVICE_INFORMATION_SERVICE_UUID,
            SYSTEM_ID_CHAR_UUID,
            vec![0x01, 0x02, 0x03, 0x04, 0x05, 0xAA, 0xBB, 0xCC],
        );
        mock.set_attribute(
            DEVICE_INFORMATION_SERVICE_UUID,
            FIRMWARE_REVISION_CHAR_UUID,
            b"3.1.0\0".to_vec(),
        );
        mock.set_attribute(
            DEVICE_INFORMATION_SERVICE_UUID,
            HARDWARE_REVISION_CHAR_UUID,
            b"2\0".to_vec(),
        );
        mock
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn add_revision(&self, revision: ProtocolRevision) {
        let mut state = self.lock();
        state
            .characteristics
            .insert((revision.service_uuid(), revision.write_uuid()));
        state
            .characteristics
            .insert((revision.service_uuid(), revision.read_uuid()));
    }

    pub(crate) fn set_attribute(&self, service: Uuid, characteristic: Uuid, value: Vec<u8>) {
        let mut state = self.lock();
        state.characteristics.insert((service, characteristic));
        state.values.insert(characteristic, value);
    }

    pub(crate) fn remove_attribute(&self, characteristic: Uuid) {
        let mut state = self.lock();
        state.characteristics.retain(|(_, c)| *c != characteristic);
        state.values.remove(&characteristic);
    }

    /// Make the next `count` reads of `characteristic` fail
    pub(crate) fn fail_reads(&self, characteristic: Uuid, count: u32) {
        self.lock().read_failures.insert(characteristic, count);
    }

    pub(crate) fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    pub(crate) fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.lock().connect_behavior = behavior;
    }

    pub(crate) fn set_ignore_disconnect(&self, ignore: bool) {
        self.lock().ignore_disconnect = ignore;
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub(crate) fn connect_calls(&self) -> u32 {
        self.lock().connect_calls
    }

    pub(crate) fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.lock().writes.clone()
    }

    /// Opcodes written so far, in order
    pub(crate) fn commands(&self) -> Vec<Command> {
        self.lock()
            .writes
            .iter()
            .filter_map(|(_, data)| data.first().copied().and_then(Command::from_u8))
            .collect()
    }

    pub(crate) fn add_connected_peripheral(&self, id: &str, name: Option<&str>) -> DeviceHandle {
        let handle = DeviceHandle::new(id.to_string(), name.map(ToString::to_string));
        let mut state = self.lock();
        state.devices.push(handle.clone());
        state.connected.insert(id.to_string());
        handle
    }

    /// Queue notification payloads to emit when the next start opcode is written
    pub(crate) fn queue_start_burst(&self, payloads: Vec<Vec<u8>>) {
        self.lock().start_bursts.push_back(payloads);
    }

    /// Push one notification to the current subscriber of `characteristic`
    pub(crate) fn emit(&self, characteristic: Uuid, payload: Vec<u8>) {
        if let Some(sender) = self.lock().subscribers.get(&characteristic) {
            let _ = sender.unbounded_send(payload);
        }
    }

    pub(crate) fn has_subscriber(&self, characteristic: Uuid) -> bool {
        self.lock().subscribers.contains_key(&characteristic)
    }

    /// Simulate the peripheral going out of range
    pub(crate) fn drop_link(&self) {
        let mut state = self.lock();
        state.connected.clear();
        state.subscribers.clear();
    }

    fn check_connected(state: &MockState, device: &DeviceHandle) -> Result<()> {
        if state.connected.contains(&device.id) {
            Ok(())
        } else {
            Err(DynoError::NotConnected)
        }
    }
}

#[async_trait]
impl BleBackend for MockBackend {
    async fn is_available(&self) -> bool {
        self.lock().available
    }

    async fn request_device(
        &self,
        filter: &DeviceFilter,
        _scan_timeout_ms: u64,
    ) -> Result<DeviceHandle> {
        self.lock()
            .devices
            .iter()
            .find(|d| filter.matches(&d.id, d.name.as_deref()))
            .cloned()
            .ok_or(DynoError::DeviceNotFound)
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<()> {
        let behavior = {
            let mut state = self.lock();
            state.connect_calls += 1;
            state.connect_behavior
        };

        match behavior {
            ConnectBehavior::Succeed => {
                self.lock().connected.insert(device.id.clone());
                Ok(())
            }
            ConnectBehavior::DropAfterConnect => Ok(()),
            ConnectBehavior::Fail => Err(DynoError::Transport("link refused".to_string())),
            ConnectBehavior::FailTimes(remaining) => {
                let mut state = self.lock();
                if remaining == 0 {
                    state.connected.insert(device.id.clone());
                    Ok(())
                } else {
                    state.connect_behavior = ConnectBehavior::FailTimes(remaining - 1);
                    Err(DynoError::Transport("link refused".to_string()))
                }
            }
            ConnectBehavior::Hang => futures::future::pending().await,
            ConnectBehavior::Delay(ms) => {
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                self.lock().connected.insert(device.id.clone());
                Ok(())
            }
        }
    }

    async fn is_connected(&self, device: &DeviceHandle) -> bool {
        self.lock().connected.contains(&device.id)
    }

    async fn get_service(&self, device: &DeviceHandle, service: Uuid) -> Result<()> {
        let state = self.lock();
        Self::check_connected(&state, device)?;
        if state.characteristics.iter().any(|(s, _)| *s == service) {
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
        let state = self.lock();
        Self::check_connected(&state, device)?;
        if state.characteristics.contains(&(service, characteristic)) {
            Ok(CharacteristicRef {
                service,
                uuid: characteristic,
            })
        } else {
            Err(DynoError::CharacteristicNotFound(characteristic))
        }
    }

    async fn read_value(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<u8>> {
        let mut state = self.lock();
        Self::check_connected(&state, device)?;
        if let Some(remaining) = state.read_failures.get_mut(&characteristic.uuid) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DynoError::Transport("read failed".to_string()));
            }
        }
        state
            .values
            .get(&characteristic.uuid)
            .cloned()
            .ok_or(DynoError::CharacteristicNotFound(characteristic.uuid))
    }

    async fn write_value(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
        data: &[u8],
    ) -> Result<()> {
        let mut state = self.lock();
        Self::check_connected(&state, device)?;
        if state.fail_writes {
            return Err(DynoError::Transport("write failed".to_string()));
        }
        state.writes.push((characteristic.uuid, data.to_vec()));

        if data.first() == Some(&(Command::Start as u8)) {
            if let Some(burst) = state.start_bursts.pop_front() {
                let senders: Vec<_> = state.subscribers.values().cloned().collect();
                for payload in burst {
                    for sender in &senders {
                        let _ = sender.unbounded_send(payload.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<NotificationStream> {
        let mut state = self.lock();
        Self::check_connected(&state, device)?;
        let (sender, receiver) = mpsc::unbounded();
        state.subscribers.insert(characteristic.uuid, sender);
        Ok(receiver.boxed())
    }

    async fn unsubscribe(
        &self,
        _device: &DeviceHandle,
        characteristic: &CharacteristicRef,
    ) -> Result<()> {
        self.lock().subscribers.remove(&characteristic.uuid);
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceHandle) -> Result<()> {
        let mut state = self.lock();
        if !state.ignore_disconnect {
            state.connected.remove(&device.id);
            state.subscribers.clear();
        }
        Ok(())
    }

    async fn known_devices(&self) -> Vec<DeviceHandle> {
        self.lock().devices.clone()
    }
}
