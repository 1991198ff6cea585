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
use tokio::select;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::action::{ActionCompletion, DeviceAction, PendingAction};
use crate::definitions::{Filter, Mtu, Rssi};
use crate::device_session::{DeviceSession, DeviceSnapshot, WorkerReply};
use crate::device_state::{ConnectionPhase, DeviceInput};
use crate::errors::SessionError;
use crate::identifier::DeviceIdentifier;
use crate::radio::{RadioDriver, RadioEvent};
use crate::scanner_state::{self, ScanEffect, ScanInput, ScanPhase, ScanningState};
use crate::service::StopHandle;
use crate::settings::SessionSettings;

/// Change notifications published by a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ScanPhaseChanged(ScanPhase),
    DeviceAdded(DeviceIdentifier),
    DeviceStateChanged { id: DeviceIdentifier, phase: ConnectionPhase },
    ScanFailed,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

pub(crate) enum Command {
    Initialize(oneshot::Sender<ScanPhase>),
    Deinitialize(oneshot::Sender<ScanPhase>),
    StartScanning(Filter, oneshot::Sender<ScanPhase>),
    StopScanning(oneshot::Sender<ScanPhase>),
    Refresh(Filter, oneshot::Sender<ScanPhase>),
    Connect(DeviceIdentifier, Reply<()>),
    Disconnect(DeviceIdentifier, Reply<()>),
    DiscoverServices(DeviceIdentifier, Reply<()>),
    EnqueueAction(DeviceIdentifier, DeviceAction, Reply<ActionCompletion>),
    RequestMtu(DeviceIdentifier, Mtu, Reply<bool>),
    ReadRssi(DeviceIdentifier, Reply<Rssi>),
    Pair(DeviceIdentifier, Reply<()>),
    Unpair(DeviceIdentifier, Reply<()>),
    WatchDevice(DeviceIdentifier, Reply<watch::Receiver<DeviceSnapshot>>),
    Forget(DeviceIdentifier, Reply<()>),
}

/// Channels through which the router publishes its state.
pub(crate) struct RouterOutputs {
    pub scan_phase: watch::Sender<ScanPhase>,
    pub devices: watch::Sender<Vec<DeviceSnapshot>>,
    pub events: broadcast::Sender<SessionEvent>,
}

/// Single consumer of radio events, caller commands and worker results.
///
/// Owns the scan session state and every device session; nothing else mutates them.
pub(crate) struct EventRouter {
    driver: Arc<dyn RadioDriver>,
    settings: SessionSettings,

    commands: mpsc::Receiver<Command>,
    radio_events: mpsc::UnboundedReceiver<RadioEvent>,
    worker_replies: mpsc::UnboundedReceiver<WorkerReply>,
    worker_replies_tx: mpsc::UnboundedSender<WorkerReply>,

    scanning: ScanningState,
    devices: HashMap<DeviceIdentifier, DeviceSession>,
    published_phases: HashMap<DeviceIdentifier, ConnectionPhase>,

    outputs: RouterOutputs,
}

impl EventRouter {
    pub fn new(
        driver: Arc<dyn RadioDriver>,
        settings: SessionSettings,
        commands: mpsc::Receiver<Command>,
        radio_events: mpsc::UnboundedReceiver<RadioEvent>,
        outputs: RouterOutputs,
    ) -> Self {
        let (worker_replies_tx, worker_replies) = mpsc::unbounded_channel();
        Self {
            driver,
            settings,
            commands,
            radio_events,
            worker_replies,
            worker_replies_tx,
            scanning: ScanningState::default(),
            devices: HashMap::new(),
            published_phases: HashMap::new(),
            outputs,
        }
    }

    pub async fn run(mut self, mut stop: StopHandle) {
        info!("Event router started");
        loop {
            select! {
                biased;
                _ = stop.signaled() => {
                    info!("Event router shutdown requested");
                    break;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.on_command(command).await,
                        None => {
                            info!("All session handles dropped; stopping event router");
                            break;
                        }
                    }
                }
                event = self.radio_events.recv() => {
                    match event {
                        Some(event) => self.on_radio_event(event).await,
                        None => {
                            warn!("Radio event stream closed; stopping event router");
                            break;
                        }
                    }
                }
                Some(reply) = self.worker_replies.recv() => {
                    self.on_worker_reply(reply).await;
                }
            }
            self.publish();
        }
        self.teardown().await;
        self.publish();
        info!("Event router stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Initialize(reply) => {
                let hardware_supported = self.driver.is_hardware_supported().await;
                self.apply_scan(ScanInput::Initialize { hardware_supported }).await;
                self.publish();
                let _ = reply.send(self.scanning.phase());
            }
            Command::Deinitialize(reply) => {
                self.apply_scan(ScanInput::Deinitialize).await;
                if self.scanning.phase() == ScanPhase::Deinitialized {
                    self.disconnect_all().await;
                }
                self.publish();
                let _ = reply.send(self.scanning.phase());
            }
            Command::StartScanning(filter, reply) => {
                self.apply_scan(ScanInput::StartScanning(filter)).await;
                self.publish();
                let _ = reply.send(self.scanning.phase());
            }
            Command::StopScanning(reply) => {
                self.apply_scan(ScanInput::StopScanning).await;
                self.publish();
                let _ = reply.send(self.scanning.phase());
            }
            Command::Refresh(filter, reply) => {
                self.apply_scan(ScanInput::Refresh(filter)).await;
                self.publish();
                let _ = reply.send(self.scanning.phase());
            }
            Command::Connect(id, reply) => {
                let result = match self.devices.get_mut(&id) {
                    None => Err(SessionError::DeviceNotFound(id)),
                    Some(session) if !session.is_connectable() => Err(SessionError::NotConnectable(id)),
                    Some(session) => {
                        session.handle(DeviceInput::Connect).await;
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            Command::Disconnect(id, reply) => {
                let result = match self.devices.get_mut(&id) {
                    None => Err(SessionError::DeviceNotFound(id)),
                    Some(session) => {
                        session.handle(DeviceInput::Disconnect).await;
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            Command::DiscoverServices(id, reply) => {
                let result = match self.devices.get_mut(&id) {
                    None => Err(SessionError::DeviceNotFound(id)),
                    Some(session) if !session.phase().is_connected() => Err(SessionError::NotConnected(id)),
                    Some(session) => {
                        session.handle(DeviceInput::StartDiscovering).await;
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            Command::EnqueueAction(id, action, reply) => {
                let result = match self.devices.get_mut(&id) {
                    None => Err(SessionError::DeviceNotFound(id)),
                    Some(session) => {
                        let (pending, completion) = PendingAction::create(action);
                        debug!("Device {}: enqueueing action {}", id, pending.id);
                        session.handle(DeviceInput::EnqueueAction(pending)).await;
                        Ok(completion)
                    }
                };
                let _ = reply.send(result);
            }
            Command::RequestMtu(id, mtu, reply) => {
                self.spawn_connected_call(id, reply, move |driver| async move {
                    driver.request_mtu(id, mtu).await
                });
            }
            Command::ReadRssi(id, reply) => {
                self.spawn_connected_call(id, reply, move |driver| async move { driver.read_rssi(id).await });
            }
            Command::Pair(id, reply) => {
                self.spawn_known_call(id, reply, move |driver| async move { driver.pair(id).await });
            }
            Command::Unpair(id, reply) => {
                self.spawn_known_call(id, reply, move |driver| async move { driver.unpair(id).await });
            }
            Command::WatchDevice(id, reply) => {
                let result = self
                    .devices
                    .get(&id)
                    .map(DeviceSession::watch)
                    .ok_or(SessionError::DeviceNotFound(id));
                let _ = reply.send(result);
            }
            Command::Forget(id, reply) => {
                let result = self.forget(id).await;
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    /// Disconnects the device, then drops its session and worker.
    async fn forget(&mut self, id: DeviceIdentifier) -> Result<(), SessionError> {
        let Some(mut session) = self.devices.remove(&id) else {
            return Err(SessionError::DeviceNotFound(id));
        };
        if !matches!(session.phase(), ConnectionPhase::Disconnected | ConnectionPhase::Disconnecting) {
            session.handle(DeviceInput::Disconnect).await;
        }
        self.published_phases.remove(&id);
        self.apply_scan(ScanInput::ForgetDevice(id)).await;
        info!("Forgot device {}", id);
        Ok(())
    }

    // Pass-through driver calls that change no state run beside the router.
    fn spawn_known_call<T, F, Fut>(&self, id: DeviceIdentifier, reply: Reply<T>, call: F)
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn RadioDriver>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, crate::errors::RadioError>> + Send + 'static,
    {
        if !self.devices.contains_key(&id) {
            let _ = reply.send(Err(SessionError::DeviceNotFound(id)));
            return;
        }
        let driver = self.driver.clone();
        tokio::spawn(async move {
            let _ = reply.send(call(driver).await.map_err(SessionError::from));
        });
    }

    fn spawn_connected_call<T, F, Fut>(&self, id: DeviceIdentifier, reply: Reply<T>, call: F)
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn RadioDriver>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, crate::errors::RadioError>> + Send + 'static,
    {
        match self.devices.get(&id) {
            Some(session) if !session.phase().is_connected() => {
                let _ = reply.send(Err(SessionError::NotConnected(id)));
            }
            _ => self.spawn_known_call(id, reply, call),
        }
    }

    async fn on_radio_event(&mut self, event: RadioEvent) {
        debug!("Radio event: {:?}", event);
        match event {
            RadioEvent::PermissionChanged { granted } => {
                let enabled = granted && self.driver.is_hardware_enabled().await;
                self.apply_scan(ScanInput::PermissionChanged { granted, enabled }).await;
            }
            RadioEvent::BluetoothEnabled => self.apply_scan(ScanInput::BluetoothEnabled).await,
            RadioEvent::BluetoothDisabled => self.apply_scan(ScanInput::BluetoothDisabled).await,
            RadioEvent::FailedScanning => {
                warn!("Radio reported a scan failure");
                let _ = self.outputs.events.send(SessionEvent::ScanFailed);
                self.apply_scan(ScanInput::ScanFailed).await;
            }
            RadioEvent::DeviceDiscovered { id, rssi, advertisement } => {
                if !self.scanning.is_scanning() {
                    return;
                }
                self.apply_scan(ScanInput::DeviceDiscovered(id)).await;
                match self.devices.get_mut(&id) {
                    Some(session) => session.on_advertisement(rssi, advertisement),
                    None => {
                        info!("Discovered device {} ({:?})", id, advertisement.name);
                        let session = DeviceSession::new(
                            id,
                            rssi,
                            advertisement,
                            self.driver.clone(),
                            self.settings.connection,
                            self.worker_replies_tx.clone(),
                        );
                        self.published_phases.insert(id, session.phase());
                        self.devices.insert(id, session);
                        let _ = self.outputs.events.send(SessionEvent::DeviceAdded(id));
                    }
                }
            }
            RadioEvent::DeviceConnected { id } => {
                if let Some(session) = self.devices.get_mut(&id) {
                    session.on_connected().await;
                }
            }
            RadioEvent::DeviceDisconnected { id } => {
                if let Some(session) = self.devices.get_mut(&id) {
                    session.on_disconnected().await;
                }
            }
            RadioEvent::MtuUpdated { id, mtu } => {
                if let Some(session) = self.devices.get_mut(&id) {
                    session.handle(DeviceInput::DidUpdateMtu(mtu)).await;
                }
            }
            RadioEvent::ValueUpdated { id, attribute, value } => {
                if let Some(session) = self.devices.get_mut(&id) {
                    session.on_value_updated(attribute, value);
                }
            }
        }
    }

    async fn on_worker_reply(&mut self, reply: WorkerReply) {
        match self.devices.get_mut(&reply.device) {
            Some(session) => session.on_worker_outcome(reply.outcome).await,
            None => debug!("Dropping worker reply for unknown device {}", reply.device),
        }
    }

    /// Drives the scan session, feeding effect failures back in as inputs.
    async fn apply_scan(&mut self, input: ScanInput) {
        let mut inputs = VecDeque::from([input]);
        while let Some(input) = inputs.pop_front() {
            let transition = scanner_state::next_state(&self.scanning, input);
            let Some(next) = transition.state else {
                continue;
            };
            debug!("Scan session: {:?} -> {:?}", self.scanning.phase(), next.phase());
            self.scanning = next;
            for effect in transition.effects {
                if let Some(follow_up) = self.run_scan_effect(effect).await {
                    inputs.push_back(follow_up);
                }
            }
        }
    }

    async fn run_scan_effect(&mut self, effect: ScanEffect) -> Option<ScanInput> {
        match effect {
            ScanEffect::StartMonitoringPermissions => self.driver.start_monitoring_permissions().await,
            ScanEffect::StopMonitoringPermissions => self.driver.stop_monitoring_permissions().await,
            ScanEffect::StartMonitoringHardwareEnabled => self.driver.start_monitoring_hardware_enabled().await,
            ScanEffect::StopMonitoringHardwareEnabled => self.driver.stop_monitoring_hardware_enabled().await,
            ScanEffect::StartScan(filter) => {
                if let Err(err) = self.driver.start_scan(&filter).await {
                    warn!("Starting scan failed: {}", err);
                    let _ = self.outputs.events.send(SessionEvent::ScanFailed);
                    return Some(ScanInput::ScanFailed);
                }
            }
            ScanEffect::StopScan => self.driver.stop_scan().await,
        }
        None
    }

    async fn disconnect_all(&mut self) {
        for session in self.devices.values_mut() {
            if !matches!(session.phase(), ConnectionPhase::Disconnected | ConnectionPhase::Disconnecting) {
                session.handle(DeviceInput::Disconnect).await;
            }
        }
    }

    async fn teardown(&mut self) {
        self.apply_scan(ScanInput::Deinitialize).await;
        self.disconnect_all().await;
    }

    fn publish(&mut self) {
        let phase = self.scanning.phase();
        let phase_changed = self.outputs.scan_phase.send_if_modified(|current| {
            let changed = *current != phase;
            *current = phase;
            changed
        });
        if phase_changed {
            info!("Scan session is now {:?}", phase);
            let _ = self.outputs.events.send(SessionEvent::ScanPhaseChanged(phase));
        }

        for session in self.devices.values() {
            let phase = session.phase();
            if self.published_phases.insert(session.id(), phase) != Some(phase) {
                let _ = self.outputs.events.send(SessionEvent::DeviceStateChanged { id: session.id(), phase });
            }
        }

        let list: Vec<DeviceSnapshot> = self
            .scanning
            .visible_devices()
            .iter()
            .filter_map(|id| self.devices.get(id))
            .map(DeviceSession::snapshot)
            .collect();
        self.outputs.devices.send_if_modified(|current| {
            if *current == list {
                false
            } else {
                *current = list;
                true
            }
        });
    }
}
