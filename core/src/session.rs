// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::action::{ActionCompletion, DeviceAction};
use crate::definitions::{Filter, Mtu, Rssi};
use crate::device_session::DeviceSnapshot;
use crate::errors::SessionError;
use crate::identifier::DeviceIdentifier;
use crate::radio::RadioDriver;
use crate::router::{Command, EventRouter, RouterOutputs, SessionEvent};
use crate::scanner_state::ScanPhase;
use crate::service::{spawn_service, ServiceHandle};
use crate::settings::SessionSettings;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Caller handle to a running scan session. Cheap to clone; every clone talks to the
/// same event router.
#[derive(Clone)]
pub struct BluetoothSession {
    commands: mpsc::Sender<Command>,
    scan_phase: watch::Receiver<ScanPhase>,
    devices: watch::Receiver<Vec<DeviceSnapshot>>,
    events: broadcast::Sender<SessionEvent>,
}

impl BluetoothSession {
    /// Spawns the event router on the current tokio runtime.
    ///
    /// The router keeps running until the returned [`ServiceHandle`] is shut down or every
    /// `BluetoothSession` clone is dropped. Shutting down stops scanning and disconnects
    /// all devices.
    pub fn start(driver: Arc<dyn RadioDriver>, settings: SessionSettings) -> (Self, ServiceHandle) {
        let (commands, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (scan_phase_tx, scan_phase) = watch::channel(ScanPhase::NotInitialized);
        let (devices_tx, devices) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(settings.event_channel_capacity);

        // Subscribed before spawning so no event emitted in between is lost.
        let radio_events = driver.subscribe();
        let outputs = RouterOutputs { scan_phase: scan_phase_tx, devices: devices_tx, events: events.clone() };
        let router = EventRouter::new(driver, settings, commands_rx, radio_events, outputs);
        let handle = spawn_service(move |stop| router.run(stop));

        (Self { commands, scan_phase, devices, events }, handle)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).await.map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)
    }

    /// Returns the phase the session settled in once the request was applied.
    pub async fn initialize(&self) -> Result<ScanPhase, SessionError> {
        self.request(Command::Initialize).await
    }

    pub async fn deinitialize(&self) -> Result<ScanPhase, SessionError> {
        self.request(Command::Deinitialize).await
    }

    pub async fn start_scanning(&self, filter: Filter) -> Result<ScanPhase, SessionError> {
        self.request(|reply| Command::StartScanning(filter, reply)).await
    }

    pub async fn stop_scanning(&self) -> Result<ScanPhase, SessionError> {
        self.request(Command::StopScanning).await
    }

    /// Switches the filter while idle. Devices found under another filter are forgotten.
    pub async fn refresh(&self, filter: Filter) -> Result<ScanPhase, SessionError> {
        self.request(|reply| Command::Refresh(filter, reply)).await
    }

    pub fn scan_phase(&self) -> watch::Receiver<ScanPhase> {
        self.scan_phase.clone()
    }

    /// Discovered devices in order of discovery, current list first, then every change.
    pub fn devices(&self) -> impl Stream<Item = Vec<DeviceSnapshot>> {
        stream::unfold((self.devices.clone(), true), |(mut rx, first)| async move {
            if !first {
                rx.changed().await.ok()?;
            }
            let list = rx.borrow_and_update().clone();
            Some((list, (rx, false)))
        })
    }

    pub fn devices_watch(&self) -> watch::Receiver<Vec<DeviceSnapshot>> {
        self.devices.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn device(&self, id: DeviceIdentifier) -> DeviceHandle {
        DeviceHandle { id, session: self.clone() }
    }
}

/// Commands for one discovered device. Fails with [`SessionError::DeviceNotFound`] until
/// the device has been discovered.
#[derive(Clone)]
pub struct DeviceHandle {
    id: DeviceIdentifier,
    session: BluetoothSession,
}

impl DeviceHandle {
    pub fn id(&self) -> DeviceIdentifier {
        self.id
    }

    pub async fn connect(&self) -> Result<(), SessionError> {
        let id = self.id;
        self.session.request(|reply| Command::Connect(id, reply)).await?
    }

    /// Disconnects, or cancels a connection attempt in progress.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let id = self.id;
        self.session.request(|reply| Command::Disconnect(id, reply)).await?
    }

    /// Only needed when automatic service discovery is switched off.
    pub async fn discover_services(&self) -> Result<(), SessionError> {
        let id = self.id;
        self.session.request(|reply| Command::DiscoverServices(id, reply)).await?
    }

    /// Queues `action` behind every action queued before it.
    ///
    /// The returned completion resolves to `false` if the action fails, the device is not
    /// ready for actions, or the connection goes away first.
    pub async fn enqueue_action(&self, action: DeviceAction) -> Result<ActionCompletion, SessionError> {
        let id = self.id;
        self.session.request(|reply| Command::EnqueueAction(id, action, reply)).await?
    }

    pub async fn request_mtu(&self, mtu: Mtu) -> Result<bool, SessionError> {
        let id = self.id;
        self.session.request(|reply| Command::RequestMtu(id, mtu, reply)).await?
    }

    pub async fn read_rssi(&self) -> Result<Rssi, SessionError> {
        let id = self.id;
        self.session.request(|reply| Command::ReadRssi(id, reply)).await?
    }

    pub async fn pair(&self) -> Result<(), SessionError> {
        let id = self.id;
        self.session.request(|reply| Command::Pair(id, reply)).await?
    }

    pub async fn unpair(&self) -> Result<(), SessionError> {
        let id = self.id;
        self.session.request(|reply| Command::Unpair(id, reply)).await?
    }

    /// Disconnects and drops the device. It shows up again only if rediscovered while
    /// scanning; until then every other call fails with [`SessionError::DeviceNotFound`].
    pub async fn forget(&self) -> Result<(), SessionError> {
        let id = self.id;
        self.session.request(|reply| Command::Forget(id, reply)).await?
    }

    pub async fn state(&self) -> Result<watch::Receiver<DeviceSnapshot>, SessionError> {
        let id = self.id;
        self.session.request(|reply| Command::WatchDevice(id, reply)).await?
    }

    pub async fn snapshot(&self) -> Result<DeviceSnapshot, SessionError> {
        Ok(self.state().await?.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::{AdvertisementData, AttributeRef, CharacteristicRef, Service};
    use crate::device_state::ConnectionPhase;
    use crate::identifier::uuid_from_short;
    use crate::radio::RadioEvent;
    use crate::settings::ReconnectionSettings;
    use crate::simulated::{RadioCall, SimulatedFailures, SimulatedRadio};
    use futures::StreamExt;
    use tokio::time::{sleep, timeout, Duration};

    fn device(n: u8) -> DeviceIdentifier {
        DeviceIdentifier::from_address(&format!("AA:BB:CC:00:11:{:02x}", n))
    }

    fn heart_rate() -> CharacteristicRef {
        CharacteristicRef::new(uuid_from_short(0x180D), uuid_from_short(0x2A37))
    }

    fn control_point() -> CharacteristicRef {
        CharacteristicRef::new(uuid_from_short(0x180D), uuid_from_short(0x2A39))
    }

    async fn short_wait() {
        sleep(Duration::from_millis(10)).await
    }

    fn start(radio: &Arc<SimulatedRadio>, settings: SessionSettings) -> (BluetoothSession, ServiceHandle) {
        BluetoothSession::start(radio.clone(), settings)
    }

    async fn scanning(radio: &Arc<SimulatedRadio>, settings: SessionSettings) -> (BluetoothSession, ServiceHandle) {
        let (session, handle) = start(radio, settings);
        session.initialize().await.unwrap();
        short_wait().await;
        assert_eq!(session.start_scanning(Filter::new()).await.unwrap(), ScanPhase::Scanning);
        (session, handle)
    }

    async fn wait_for_phase(handle: &DeviceHandle, phase: ConnectionPhase) {
        let mut state = handle.state().await.unwrap();
        timeout(Duration::from_secs(1), state.wait_for(|s| s.phase == phase))
            .await
            .unwrap()
            .unwrap();
    }

    async fn connected_device(radio: &Arc<SimulatedRadio>, settings: SessionSettings) -> (BluetoothSession, ServiceHandle, DeviceHandle) {
        let (session, handle) = scanning(radio, settings).await;
        radio.set_services(device(1), vec![Service::new(uuid_from_short(0x180D), vec![])]);
        radio.discover(device(1), AdvertisementData::with_name("hrm"));
        short_wait().await;
        let peripheral = session.device(device(1));
        peripheral.connect().await.unwrap();
        wait_for_phase(&peripheral, ConnectionPhase::Idle).await;
        (session, handle, peripheral)
    }

    #[tokio::test]
    async fn initialize_reaches_idle_with_no_devices() {
        let radio = Arc::new(SimulatedRadio::new());
        let (session, handle) = start(&radio, SessionSettings::default());

        assert_eq!(session.initialize().await.unwrap(), ScanPhase::Initializing);
        short_wait().await;
        assert_eq!(*session.scan_phase().borrow(), ScanPhase::Idle);
        assert!(session.devices_watch().borrow().is_empty());
        assert_eq!(
            radio.calls(),
            vec![RadioCall::StartMonitoringPermissions, RadioCall::StartMonitoringHardwareEnabled]
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn missing_hardware_is_terminal() {
        let radio = Arc::new(SimulatedRadio::new());
        radio.set_hardware_supported(false);
        let (session, handle) = start(&radio, SessionSettings::default());

        assert_eq!(session.initialize().await.unwrap(), ScanPhase::NoHardware);
        assert_eq!(session.start_scanning(Filter::new()).await.unwrap(), ScanPhase::NoHardware);
        assert!(radio.calls().is_empty());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn permission_and_radio_changes_are_followed() {
        let radio = Arc::new(SimulatedRadio::new());
        radio.set_permission(false);
        let (session, handle) = start(&radio, SessionSettings::default());
        session.initialize().await.unwrap();
        short_wait().await;
        assert_eq!(*session.scan_phase().borrow(), ScanPhase::MissingPermissions);

        radio.set_enabled(false);
        radio.set_permission(true);
        short_wait().await;
        assert_eq!(*session.scan_phase().borrow(), ScanPhase::Disabled);

        radio.set_enabled(true);
        short_wait().await;
        assert_eq!(*session.scan_phase().borrow(), ScanPhase::Idle);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn devices_stream_reports_discovery_order_without_duplicates() {
        let radio = Arc::new(SimulatedRadio::new());
        let (session, handle) = scanning(&radio, SessionSettings::default()).await;
        let mut devices = Box::pin(session.devices());
        assert!(devices.next().await.unwrap().is_empty());

        radio.discover(device(2), AdvertisementData::with_name("two"));
        radio.discover(device(1), AdvertisementData::with_name("one"));
        radio.discover(device(2), AdvertisementData::with_name("two"));
        short_wait().await;

        let list = session.devices_watch().borrow().clone();
        let ids: Vec<_> = list.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![device(2), device(1)]);
        assert!(devices.next().await.is_some());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn advertisements_outside_scanning_are_ignored() {
        let radio = Arc::new(SimulatedRadio::new());
        let (session, handle) = start(&radio, SessionSettings::default());
        session.initialize().await.unwrap();
        short_wait().await;

        radio.discover(device(1), AdvertisementData::default());
        short_wait().await;
        assert!(session.devices_watch().borrow().is_empty());
        assert_eq!(session.device(device(1)).connect().await, Err(SessionError::DeviceNotFound(device(1))));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn deinitialize_and_reinitialize_keeps_discovered_devices() {
        let radio = Arc::new(SimulatedRadio::new());
        let (session, handle) = scanning(&radio, SessionSettings::default()).await;
        radio.discover(device(1), AdvertisementData::default());
        radio.discover(device(2), AdvertisementData::default());
        short_wait().await;
        let before = session.devices_watch().borrow().clone();
        assert_eq!(before.len(), 2);

        assert_eq!(session.deinitialize().await.unwrap(), ScanPhase::Deinitialized);
        assert!(session.devices_watch().borrow().is_empty());
        assert!(!radio.is_scanning());

        session.initialize().await.unwrap();
        short_wait().await;
        assert_eq!(*session.scan_phase().borrow(), ScanPhase::Idle);
        assert_eq!(*session.devices_watch().borrow(), before);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn scan_start_failure_falls_back_to_idle() {
        let radio = Arc::new(SimulatedRadio::new());
        radio.set_failures(SimulatedFailures::START_SCAN);
        let (session, handle) = start(&radio, SessionSettings::default());
        let mut events = session.subscribe();
        session.initialize().await.unwrap();
        short_wait().await;

        assert_eq!(session.start_scanning(Filter::new()).await.unwrap(), ScanPhase::Idle);
        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= event == SessionEvent::ScanFailed;
        }
        assert!(saw_failure);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn non_connectable_devices_refuse_connect() {
        let radio = Arc::new(SimulatedRadio::new());
        let (session, handle) = scanning(&radio, SessionSettings::default()).await;
        radio.discover(device(1), AdvertisementData { is_connectable: false, ..Default::default() });
        short_wait().await;

        assert_eq!(session.device(device(1)).connect().await, Err(SessionError::NotConnectable(device(1))));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn queued_actions_run_in_order_and_all_succeed() {
        let radio = Arc::new(SimulatedRadio::new());
        let (_session, handle, peripheral) = connected_device(&radio, SessionSettings::default()).await;
        radio.hold_actions();

        let actions = vec![
            DeviceAction::ReadCharacteristic(heart_rate()),
            DeviceAction::WriteCharacteristic { characteristic: control_point(), value: vec![1] },
            DeviceAction::EnableNotification(heart_rate()),
            DeviceAction::ReadCharacteristic(control_point()),
        ];
        let mut completions = Vec::new();
        for action in actions.clone() {
            completions.push(peripheral.enqueue_action(action).await.unwrap());
        }
        let snapshot = peripheral.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, ConnectionPhase::HandlingAction);
        assert_eq!(snapshot.pending_actions, 4);

        radio.release_actions();
        for completion in completions {
            assert!(timeout(Duration::from_secs(1), completion).await.unwrap());
        }
        assert_eq!(radio.performed_actions(device(1)), actions);
        short_wait().await;

        let snapshot = peripheral.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, ConnectionPhase::Idle);
        assert_eq!(snapshot.values.get(&AttributeRef::from(control_point())), Some(&vec![1]));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn slow_action_does_not_block_other_devices() {
        let radio = Arc::new(SimulatedRadio::new());
        let (session, handle, peripheral) = connected_device(&radio, SessionSettings::default()).await;
        radio.hold_actions();
        let pending = peripheral.enqueue_action(DeviceAction::ReadCharacteristic(heart_rate())).await.unwrap();

        radio.discover(device(2), AdvertisementData::default());
        short_wait().await;
        let other = session.device(device(2));
        other.connect().await.unwrap();
        wait_for_phase(&other, ConnectionPhase::Idle).await;

        radio.release_actions();
        assert!(timeout(Duration::from_secs(1), pending).await.unwrap());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_link_reconnects_with_known_services() {
        let radio = Arc::new(SimulatedRadio::new());
        let (_session, handle, peripheral) = connected_device(&radio, SessionSettings::default()).await;
        radio.take_calls();

        radio.drop_connection(device(1));
        short_wait().await;
        wait_for_phase(&peripheral, ConnectionPhase::Idle).await;
        assert_eq!(radio.take_calls(), vec![RadioCall::Connect(device(1))]);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn limited_reconnection_gives_up() {
        let radio = Arc::new(SimulatedRadio::new());
        let settings = SessionSettings::default().with_reconnection(ReconnectionSettings::Limited(3));
        let (_session, handle, peripheral) = connected_device(&radio, settings).await;
        radio.set_answer_connect(false);

        radio.drop_connection(device(1));
        wait_for_phase(&peripheral, ConnectionPhase::Reconnecting { attempt: 0 }).await;
        radio.drop_connection(device(1));
        wait_for_phase(&peripheral, ConnectionPhase::Reconnecting { attempt: 1 }).await;
        radio.drop_connection(device(1));
        wait_for_phase(&peripheral, ConnectionPhase::Reconnecting { attempt: 2 }).await;
        radio.drop_connection(device(1));
        wait_for_phase(&peripheral, ConnectionPhase::Disconnected).await;
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_fails_outstanding_actions() {
        let radio = Arc::new(SimulatedRadio::new());
        let (_session, handle, peripheral) = connected_device(&radio, SessionSettings::default()).await;
        radio.hold_actions();
        let first = peripheral.enqueue_action(DeviceAction::ReadCharacteristic(heart_rate())).await.unwrap();
        let second = peripheral.enqueue_action(DeviceAction::ReadCharacteristic(control_point())).await.unwrap();

        peripheral.disconnect().await.unwrap();
        assert!(!first.await);
        assert!(!second.await);
        wait_for_phase(&peripheral, ConnectionPhase::Disconnected).await;

        let late = peripheral.enqueue_action(DeviceAction::ReadCharacteristic(heart_rate())).await.unwrap();
        assert!(!late.await);
        radio.release_actions();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_scanning_and_disconnects() {
        let radio = Arc::new(SimulatedRadio::new());
        let (session, handle, peripheral) = connected_device(&radio, SessionSettings::default()).await;
        radio.hold_actions();
        let pending = peripheral.enqueue_action(DeviceAction::ReadCharacteristic(heart_rate())).await.unwrap();

        handle.shutdown().await.unwrap();
        assert!(!pending.await);
        assert!(!radio.is_scanning());
        assert!(radio.calls().contains(&RadioCall::Disconnect(device(1))));
        assert_eq!(session.initialize().await, Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn mtu_rssi_and_pairing_pass_through() {
        let radio = Arc::new(SimulatedRadio::new());
        let (_session, handle, peripheral) = connected_device(&radio, SessionSettings::default()).await;
        radio.set_rssi(device(1), -42);

        assert_eq!(peripheral.request_mtu(247).await, Ok(true));
        assert_eq!(peripheral.read_rssi().await, Ok(-42));
        peripheral.pair().await.unwrap();
        peripheral.unpair().await.unwrap();
        short_wait().await;

        let snapshot = peripheral.snapshot().await.unwrap();
        assert_eq!(snapshot.mtu, Some(247));
        assert_eq!(snapshot.phase, ConnectionPhase::Idle);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn forget_disconnects_and_drops_the_device() {
        let radio = Arc::new(SimulatedRadio::new());
        let (session, handle, peripheral) = connected_device(&radio, SessionSettings::default()).await;
        radio.discover(device(2), AdvertisementData::default());
        short_wait().await;
        radio.hold_actions();
        let pending = peripheral.enqueue_action(DeviceAction::ReadCharacteristic(heart_rate())).await.unwrap();

        peripheral.forget().await.unwrap();
        assert!(!pending.await);
        assert!(radio.calls().contains(&RadioCall::Disconnect(device(1))));
        let ids: Vec<_> = session.devices_watch().borrow().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![device(2)]);
        assert_eq!(peripheral.snapshot().await, Err(SessionError::DeviceNotFound(device(1))));
        assert_eq!(peripheral.forget().await, Err(SessionError::DeviceNotFound(device(1))));

        radio.release_actions();
        radio.discover(device(1), AdvertisementData::with_name("hrm"));
        short_wait().await;
        let ids: Vec<_> = session.devices_watch().borrow().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![device(2), device(1)]);
        assert_eq!(peripheral.snapshot().await.unwrap().phase, ConnectionPhase::Disconnected);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn events_beyond_any_buffer_size_are_all_delivered() {
        let radio = Arc::new(SimulatedRadio::new());
        let (session, handle) = scanning(&radio, SessionSettings::default()).await;
        radio.set_services(device(1), vec![Service::new(uuid_from_short(0x180D), vec![])]);
        radio.discover(device(1), AdvertisementData::with_name("hrm"));
        short_wait().await;
        radio.set_answer_connect(false);
        let peripheral = session.device(device(1));
        peripheral.connect().await.unwrap();
        assert_eq!(peripheral.snapshot().await.unwrap().phase, ConnectionPhase::Connecting);

        radio.emit(RadioEvent::DeviceConnected { id: device(1) });
        for n in 0..600u16 {
            radio.discover(device((n % 100) as u8 + 2), AdvertisementData::default());
        }
        wait_for_phase(&peripheral, ConnectionPhase::Idle).await;
        short_wait().await;
        assert_eq!(session.devices_watch().borrow().len(), 101);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rssi_needs_a_connection() {
        let radio = Arc::new(SimulatedRadio::new());
        let (session, handle) = scanning(&radio, SessionSettings::default()).await;
        radio.discover(device(1), AdvertisementData::default());
        short_wait().await;

        assert_eq!(session.device(device(1)).read_rssi().await, Err(SessionError::NotConnected(device(1))));
        handle.shutdown().await.unwrap();
    }
}
