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

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::action::{ActionId, DeviceAction};
use crate::definitions::{AdvertisementData, AttributeRef, Mtu, Rssi, Service};
use crate::device_state::{self, ConnectionPhase, DeviceEffect, DeviceInput, DeviceState};
use crate::errors::RadioError;
use crate::identifier::DeviceIdentifier;
use crate::radio::RadioDriver;
use crate::settings::{ConnectionSettings, ReconnectionSettings};

/// Published view of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub id: DeviceIdentifier,
    pub advertisement: AdvertisementData,
    pub rssi: Rssi,
    pub phase: ConnectionPhase,
    pub mtu: Option<Mtu>,
    pub services: Option<Vec<Service>>,
    /// Executing plus queued actions.
    pub pending_actions: usize,
    /// Last known value of every attribute read, written or notified.
    pub values: HashMap<AttributeRef, Vec<u8>>,
}

/// Slow driver calls run off the router on the device's own worker.
#[derive(Debug)]
pub(crate) enum WorkerJob {
    /// `round` identifies the discovery the job was issued for.
    DiscoverServices { round: u64 },
    PerformAction { id: ActionId, action: DeviceAction },
}

#[derive(Debug)]
pub(crate) enum WorkerOutcome {
    ServicesDiscovered {
        round: u64,
        result: Result<Vec<Service>, RadioError>,
    },
    ActionPerformed {
        id: ActionId,
        action: DeviceAction,
        result: Result<Option<Vec<u8>>, RadioError>,
    },
}

#[derive(Debug)]
pub(crate) struct WorkerReply {
    pub device: DeviceIdentifier,
    pub outcome: WorkerOutcome,
}

fn spawn_worker(
    device: DeviceIdentifier,
    driver: Arc<dyn RadioDriver>,
    mut jobs: mpsc::UnboundedReceiver<WorkerJob>,
    replies: mpsc::UnboundedSender<WorkerReply>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let outcome = match job {
                WorkerJob::DiscoverServices { round } => WorkerOutcome::ServicesDiscovered {
                    round,
                    result: driver.discover_services(device).await,
                },
                WorkerJob::PerformAction { id, action } => {
                    let result = driver.perform_action(device, &action).await;
                    WorkerOutcome::ActionPerformed { id, action, result }
                }
            };
            if replies.send(WorkerReply { device, outcome }).is_err() {
                break;
            }
        }
        debug!("Worker for device {} stopped", device);
    })
}

/// One peripheral's connection state, value cache and worker, owned by the router.
pub(crate) struct DeviceSession {
    id: DeviceIdentifier,
    advertisement: AdvertisementData,
    rssi: Rssi,
    state: DeviceState,
    values: HashMap<AttributeRef, Vec<u8>>,
    // Bumped every time discovery starts; older results belong to a dead link.
    discovery_round: u64,
    settings: ConnectionSettings,
    driver: Arc<dyn RadioDriver>,
    jobs: mpsc::UnboundedSender<WorkerJob>,
    worker: JoinHandle<()>,
    snapshot: watch::Sender<DeviceSnapshot>,
}

impl DeviceSession {
    pub fn new(
        id: DeviceIdentifier,
        rssi: Rssi,
        advertisement: AdvertisementData,
        driver: Arc<dyn RadioDriver>,
        settings: ConnectionSettings,
        replies: mpsc::UnboundedSender<WorkerReply>,
    ) -> Self {
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let worker = spawn_worker(id, driver.clone(), jobs_rx, replies);
        let state = DeviceState::default();
        let snapshot = DeviceSnapshot {
            id,
            advertisement: advertisement.clone(),
            rssi,
            phase: state.phase(),
            mtu: None,
            services: None,
            pending_actions: 0,
            values: HashMap::new(),
        };
        let (snapshot, _) = watch::channel(snapshot);
        Self {
            id,
            advertisement,
            rssi,
            state,
            values: HashMap::new(),
            discovery_round: 0,
            settings,
            driver,
            jobs,
            worker,
            snapshot,
        }
    }

    pub fn id(&self) -> DeviceIdentifier {
        self.id
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.state.phase()
    }

    pub fn is_connectable(&self) -> bool {
        self.advertisement.is_connectable
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id,
            advertisement: self.advertisement.clone(),
            rssi: self.rssi,
            phase: self.state.phase(),
            mtu: self.state.mtu(),
            services: self.state.services().map(<[Service]>::to_vec),
            pending_actions: self.state.pending_actions(),
            values: self.values.clone(),
        }
    }

    pub fn watch(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.subscribe()
    }

    /// Applies `input` and every follow-up input its effects produce, running effects
    /// only after each new state is in place.
    pub async fn handle(&mut self, input: DeviceInput) {
        let mut inputs = VecDeque::from([input]);
        while let Some(input) = inputs.pop_front() {
            let before = self.state.phase();
            let current = std::mem::take(&mut self.state);
            let (next, effects) = device_state::next_state(current, input);
            self.state = next;

            let after = self.state.phase();
            if before != after {
                debug!("Device {}: {:?} -> {:?}", self.id, before, after);
            }
            for effect in effects {
                if let Some(follow_up) = self.run_effect(effect).await {
                    inputs.push_back(follow_up);
                }
            }
            if self.settings.auto_discover_services
                && after == ConnectionPhase::NoServices
                && before != ConnectionPhase::NoServices
            {
                inputs.push_back(DeviceInput::StartDiscovering);
            }
        }
        self.publish();
    }

    async fn run_effect(&mut self, effect: DeviceEffect) -> Option<DeviceInput> {
        match effect {
            DeviceEffect::Connect => match self.driver.connect(self.id).await {
                Ok(()) => None,
                Err(err) => {
                    warn!("Connecting to device {} failed: {}", self.id, err);
                    // Refused outright: not worth a retry.
                    Some(DeviceInput::ConnectionLost(ReconnectionSettings::Never))
                }
            },
            DeviceEffect::Disconnect => match self.driver.disconnect(self.id).await {
                Ok(()) => None,
                Err(err) => {
                    warn!("Disconnecting device {} failed: {}", self.id, err);
                    Some(DeviceInput::DidDisconnect)
                }
            },
            DeviceEffect::DiscoverServices => {
                self.discovery_round += 1;
                let round = self.discovery_round;
                if self.jobs.send(WorkerJob::DiscoverServices { round }).is_err() {
                    warn!("Worker for device {} is gone; cannot discover services", self.id);
                    return Some(DeviceInput::Disconnect);
                }
                None
            }
            DeviceEffect::PerformAction { id, action } => {
                debug!("Device {}: performing action {} {:?}", self.id, id, action);
                if self.jobs.send(WorkerJob::PerformAction { id, action }).is_err() {
                    warn!("Worker for device {} is gone; failing action {}", self.id, id);
                    return Some(DeviceInput::ActionCompleted { id, success: false });
                }
                None
            }
            DeviceEffect::CompleteAction { action, success } => {
                debug!("Device {}: action {} finished, success: {}", self.id, action.id, success);
                action.resolve(success);
                None
            }
            DeviceEffect::AbortActions(actions) => {
                info!("Device {}: dropping {} pending action(s)", self.id, actions.len());
                for action in actions {
                    action.resolve(false);
                }
                None
            }
        }
    }

    /// Applies a result from the device's worker. Results that no longer match the
    /// current state are dropped.
    pub async fn on_worker_outcome(&mut self, outcome: WorkerOutcome) {
        match outcome {
            WorkerOutcome::ServicesDiscovered { round, result } => {
                if round != self.discovery_round || self.state.phase() != ConnectionPhase::Discovering {
                    debug!("Device {}: ignoring late service discovery result (round {})", self.id, round);
                    return;
                }
                match result {
                    Ok(services) => {
                        info!("Device {}: discovered {} service(s)", self.id, services.len());
                        self.handle(DeviceInput::DidDiscoverServices(services)).await;
                    }
                    Err(err) => {
                        warn!("Service discovery on device {} failed: {}", self.id, err);
                        self.handle(DeviceInput::Disconnect).await;
                    }
                }
            }
            WorkerOutcome::ActionPerformed { id, action, result } => {
                if self.state.executing_action().map(|a| a.id) != Some(id) {
                    debug!("Device {}: ignoring result of stale action {}", self.id, id);
                    return;
                }
                let success = match result {
                    Ok(value) => {
                        let known = value.or_else(|| action.written_value().map(<[u8]>::to_vec));
                        if let Some(value) = known {
                            self.values.insert(action.attribute(), value);
                        }
                        true
                    }
                    Err(err) => {
                        warn!("Device {}: action {} failed: {}", self.id, id, err);
                        false
                    }
                };
                self.handle(DeviceInput::ActionCompleted { id, success }).await;
            }
        }
    }

    pub async fn on_connected(&mut self) {
        self.handle(DeviceInput::DidConnect).await;
    }

    pub async fn on_disconnected(&mut self) {
        let input = if self.state.phase() == ConnectionPhase::Disconnecting {
            DeviceInput::DidDisconnect
        } else {
            DeviceInput::ConnectionLost(self.settings.reconnection)
        };
        self.handle(input).await;
    }

    pub fn on_advertisement(&mut self, rssi: Rssi, advertisement: AdvertisementData) {
        self.rssi = rssi;
        self.advertisement = advertisement;
        self.publish();
    }

    pub fn on_value_updated(&mut self, attribute: AttributeRef, value: Vec<u8>) {
        self.values.insert(attribute, value);
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::PendingAction;
    use crate::definitions::CharacteristicRef;
    use crate::identifier::uuid_from_short;
    use crate::simulated::{RadioCall, SimulatedFailures, SimulatedRadio};
    use tokio::time::{timeout, Duration};

    struct Fixture {
        radio: Arc<SimulatedRadio>,
        session: DeviceSession,
        replies: mpsc::UnboundedReceiver<WorkerReply>,
    }

    impl Fixture {
        fn new(settings: ConnectionSettings) -> Self {
            let radio = Arc::new(SimulatedRadio::new());
            let (replies_tx, replies) = mpsc::unbounded_channel();
            let session = DeviceSession::new(
                device(),
                -50,
                AdvertisementData::with_name("sensor"),
                radio.clone(),
                settings,
                replies_tx,
            );
            radio.set_services(device(), vec![Service::new(uuid_from_short(0x180D), vec![])]);
            Self { radio, session, replies }
        }

        // Feeds the next worker result back, as the router would.
        async fn pump(&mut self) {
            let reply = timeout(Duration::from_secs(1), self.replies.recv()).await.unwrap().unwrap();
            assert_eq!(reply.device, device());
            self.session.on_worker_outcome(reply.outcome).await;
        }

        async fn connect_ready(&mut self) {
            self.session.handle(DeviceInput::Connect).await;
            self.session.on_connected().await;
            self.pump().await;
            assert_eq!(self.session.phase(), ConnectionPhase::Idle);
        }
    }

    fn device() -> DeviceIdentifier {
        DeviceIdentifier::from_address("AA:BB:CC:00:11:22")
    }

    fn heart_rate() -> CharacteristicRef {
        CharacteristicRef::new(uuid_from_short(0x180D), uuid_from_short(0x2A37))
    }

    #[tokio::test]
    async fn fresh_connection_discovers_services_automatically() {
        let mut fixture = Fixture::new(ConnectionSettings::default());
        fixture.session.handle(DeviceInput::Connect).await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::Connecting);

        fixture.session.on_connected().await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::Discovering);
        fixture.pump().await;

        let snapshot = fixture.session.watch().borrow().clone();
        assert_eq!(snapshot.phase, ConnectionPhase::Idle);
        assert_eq!(snapshot.services.map(|s| s.len()), Some(1));
        assert_eq!(
            fixture.radio.calls(),
            vec![RadioCall::Connect(device()), RadioCall::DiscoverServices(device())]
        );
    }

    #[tokio::test]
    async fn manual_discovery_waits_for_request() {
        let mut fixture = Fixture::new(ConnectionSettings { auto_discover_services: false, ..Default::default() });
        fixture.session.handle(DeviceInput::Connect).await;
        fixture.session.on_connected().await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::NoServices);

        fixture.session.handle(DeviceInput::StartDiscovering).await;
        fixture.pump().await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::Idle);
    }

    #[tokio::test]
    async fn read_result_lands_in_value_cache() {
        let mut fixture = Fixture::new(ConnectionSettings::default());
        fixture.radio.set_value(device(), heart_rate().into(), vec![72]);
        fixture.connect_ready().await;

        let (pending, done) = PendingAction::create(DeviceAction::ReadCharacteristic(heart_rate()));
        fixture.session.handle(DeviceInput::EnqueueAction(pending)).await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::HandlingAction);
        fixture.pump().await;

        assert!(done.await);
        assert_eq!(fixture.session.snapshot().values.get(&AttributeRef::from(heart_rate())), Some(&vec![72]));
        assert_eq!(fixture.session.phase(), ConnectionPhase::Idle);
    }

    #[tokio::test]
    async fn failed_action_resolves_false_and_queue_moves_on() {
        let mut fixture = Fixture::new(ConnectionSettings::default());
        fixture.connect_ready().await;
        fixture.radio.set_failures(SimulatedFailures::PERFORM_ACTION);

        let (first, first_done) = PendingAction::create(DeviceAction::ReadCharacteristic(heart_rate()));
        let (second, second_done) = PendingAction::create(DeviceAction::EnableNotification(heart_rate()));
        fixture.session.handle(DeviceInput::EnqueueAction(first)).await;
        fixture.session.handle(DeviceInput::EnqueueAction(second)).await;

        fixture.pump().await;
        assert!(!first_done.await);
        fixture.radio.set_failures(SimulatedFailures::empty());
        fixture.pump().await;
        assert!(second_done.await);
        assert_eq!(fixture.radio.performed_actions(device()).len(), 2);
    }

    #[tokio::test]
    async fn failed_discovery_disconnects() {
        let mut fixture = Fixture::new(ConnectionSettings::default());
        fixture.radio.set_failures(SimulatedFailures::DISCOVER_SERVICES);
        fixture.session.handle(DeviceInput::Connect).await;
        fixture.session.on_connected().await;
        fixture.pump().await;

        assert_eq!(fixture.session.phase(), ConnectionPhase::Disconnecting);
        assert_eq!(fixture.radio.calls().last(), Some(&RadioCall::Disconnect(device())));
        fixture.session.on_disconnected().await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn refused_connection_ends_disconnected() {
        let mut fixture = Fixture::new(ConnectionSettings::default());
        fixture.radio.set_failures(SimulatedFailures::CONNECT);
        fixture.session.handle(DeviceInput::Connect).await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn failed_disconnect_still_ends_disconnected() {
        let mut fixture = Fixture::new(ConnectionSettings::default());
        fixture.connect_ready().await;
        fixture.radio.set_failures(SimulatedFailures::DISCONNECT);
        fixture.session.handle(DeviceInput::Disconnect).await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::Disconnected);
    }

    #[tokio::test]
    async fn link_loss_reconnects_and_keeps_services() {
        let mut fixture = Fixture::new(ConnectionSettings::default());
        fixture.connect_ready().await;
        fixture.radio.take_calls();

        fixture.session.on_disconnected().await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::Reconnecting { attempt: 0 });
        fixture.session.on_connected().await;

        assert_eq!(fixture.session.phase(), ConnectionPhase::Idle);
        assert_eq!(fixture.radio.take_calls(), vec![RadioCall::Connect(device())]);
    }

    #[tokio::test]
    async fn late_action_result_after_reconnect_is_ignored() {
        let mut fixture = Fixture::new(ConnectionSettings::default());
        fixture.connect_ready().await;

        let (pending, done) = PendingAction::create(DeviceAction::ReadCharacteristic(heart_rate()));
        fixture.session.handle(DeviceInput::EnqueueAction(pending)).await;
        fixture.session.on_disconnected().await;
        assert!(!done.await);

        fixture.session.on_connected().await;
        fixture.pump().await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::Idle);
        assert!(fixture.session.snapshot().values.is_empty());
    }

    #[tokio::test]
    async fn discovery_result_from_a_dropped_link_is_ignored() {
        let mut fixture = Fixture::new(ConnectionSettings::default());
        fixture.radio.set_failures(SimulatedFailures::DISCOVER_SERVICES);
        fixture.session.handle(DeviceInput::Connect).await;
        fixture.session.on_connected().await;
        let stale = timeout(Duration::from_secs(1), fixture.replies.recv()).await.unwrap().unwrap();
        fixture.radio.set_failures(SimulatedFailures::empty());

        fixture.session.on_disconnected().await;
        fixture.session.on_connected().await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::Discovering);

        fixture.session.on_worker_outcome(stale.outcome).await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::Discovering);
        assert!(!fixture.radio.calls().contains(&RadioCall::Disconnect(device())));

        fixture.pump().await;
        assert_eq!(fixture.session.phase(), ConnectionPhase::Idle);
        assert_eq!(fixture.session.snapshot().services.map(|s| s.len()), Some(1));
    }

    #[tokio::test]
    async fn notifications_update_the_cache() {
        let mut fixture = Fixture::new(ConnectionSettings::default());
        let mut watch = fixture.session.watch();
        fixture.session.on_value_updated(heart_rate().into(), vec![80]);
        watch.changed().await.unwrap();
        assert_eq!(watch.borrow().values.get(&AttributeRef::from(heart_rate())), Some(&vec![80]));
    }
}
