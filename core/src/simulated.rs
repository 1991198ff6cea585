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

//! In-memory radio used by tests and demos.
//!
//! Every driver call is recorded. Calls that would make a real radio report something
//! back (connecting, disconnecting, permission monitoring, MTU requests) emit the
//! corresponding [`RadioEvent`] right away, so a session driven by it progresses on its
//! own unless a failure is configured.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bitflags::bitflags;
use log::debug;
use tokio::sync::{mpsc, watch};

use crate::action::DeviceAction;
use crate::definitions::{AdvertisementData, AttributeRef, Filter, Mtu, Rssi, Service};
use crate::errors::RadioError;
use crate::identifier::DeviceIdentifier;
use crate::radio::{RadioDriver, RadioEvent};

const DEFAULT_RSSI: Rssi = -60;

bitflags! {
    /// Driver calls that fail while the flag is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SimulatedFailures: u8 {
        const START_SCAN = 0x01;
        const CONNECT = 0x02;
        const DISCONNECT = 0x04;
        const DISCOVER_SERVICES = 0x08;
        const PERFORM_ACTION = 0x10;
        const REQUEST_MTU = 0x20;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartMonitoringPermissions,
    StopMonitoringPermissions,
    StartMonitoringHardwareEnabled,
    StopMonitoringHardwareEnabled,
    StartScan(Filter),
    StopScan,
    Connect(DeviceIdentifier),
    Disconnect(DeviceIdentifier),
    DiscoverServices(DeviceIdentifier),
    PerformAction(DeviceIdentifier, DeviceAction),
    RequestMtu(DeviceIdentifier, Mtu),
    ReadRssi(DeviceIdentifier),
    Pair(DeviceIdentifier),
    Unpair(DeviceIdentifier),
}

#[derive(Debug)]
struct SimulatedState {
    hardware_supported: bool,
    hardware_enabled: bool,
    permission_granted: bool,
    monitoring_permissions: bool,
    monitoring_hardware: bool,
    scanning: bool,
    answer_connect: bool,
    failures: SimulatedFailures,
    services: HashMap<DeviceIdentifier, Vec<Service>>,
    values: HashMap<(DeviceIdentifier, AttributeRef), Vec<u8>>,
    rssi: HashMap<DeviceIdentifier, Rssi>,
}

impl Default for SimulatedState {
    fn default() -> Self {
        Self {
            hardware_supported: true,
            hardware_enabled: true,
            permission_granted: true,
            monitoring_permissions: false,
            monitoring_hardware: false,
            scanning: false,
            answer_connect: true,
            failures: SimulatedFailures::empty(),
            services: HashMap::new(),
            values: HashMap::new(),
            rssi: HashMap::new(),
        }
    }
}

pub struct SimulatedRadio {
    state: Mutex<SimulatedState>,
    calls: Mutex<Vec<RadioCall>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RadioEvent>>>,
    // `true` while actions are held back.
    action_gate: watch::Sender<bool>,
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedRadio {
    /// Supported, enabled and permitted hardware with no peripherals around.
    pub fn new() -> Self {
        let (action_gate, _) = watch::channel(false);
        Self {
            state: Mutex::new(SimulatedState::default()),
            calls: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            action_gate,
        }
    }

    pub fn emit(&self, event: RadioEvent) {
        debug!("Simulated radio event: {:?}", event);
        locked(&self.subscribers).retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn set_hardware_supported(&self, supported: bool) {
        locked(&self.state).hardware_supported = supported;
    }

    /// Changes the permission, reporting it when permissions are monitored.
    pub fn set_permission(&self, granted: bool) {
        let monitoring = {
            let mut state = locked(&self.state);
            state.permission_granted = granted;
            state.monitoring_permissions
        };
        if monitoring {
            self.emit(RadioEvent::PermissionChanged { granted });
        }
    }

    /// Switches the radio on or off, reporting it when the hardware state is monitored.
    pub fn set_enabled(&self, enabled: bool) {
        let monitoring = {
            let mut state = locked(&self.state);
            state.hardware_enabled = enabled;
            state.monitoring_hardware
        };
        if monitoring {
            self.emit(if enabled { RadioEvent::BluetoothEnabled } else { RadioEvent::BluetoothDisabled });
        }
    }

    pub fn set_failures(&self, failures: SimulatedFailures) {
        locked(&self.state).failures = failures;
    }

    /// When `false`, connection requests are accepted but never answered.
    pub fn set_answer_connect(&self, answer: bool) {
        locked(&self.state).answer_connect = answer;
    }

    pub fn set_services(&self, id: DeviceIdentifier, services: Vec<Service>) {
        locked(&self.state).services.insert(id, services);
    }

    pub fn set_value(&self, id: DeviceIdentifier, attribute: AttributeRef, value: Vec<u8>) {
        locked(&self.state).values.insert((id, attribute), value);
    }

    pub fn value(&self, id: DeviceIdentifier, attribute: AttributeRef) -> Option<Vec<u8>> {
        locked(&self.state).values.get(&(id, attribute)).cloned()
    }

    pub fn set_rssi(&self, id: DeviceIdentifier, rssi: Rssi) {
        locked(&self.state).rssi.insert(id, rssi);
    }

    pub fn is_scanning(&self) -> bool {
        locked(&self.state).scanning
    }

    /// Reports an advertisement from a peripheral.
    pub fn discover(&self, id: DeviceIdentifier, advertisement: AdvertisementData) {
        let rssi = locked(&self.state).rssi.get(&id).copied().unwrap_or(DEFAULT_RSSI);
        self.emit(RadioEvent::DeviceDiscovered { id, rssi, advertisement });
    }

    /// Simulates the link to a peripheral going away.
    pub fn drop_connection(&self, id: DeviceIdentifier) {
        self.emit(RadioEvent::DeviceDisconnected { id });
    }

    pub fn notify(&self, id: DeviceIdentifier, attribute: AttributeRef, value: Vec<u8>) {
        self.emit(RadioEvent::ValueUpdated { id, attribute, value });
    }

    /// Makes `perform_action` wait until [`Self::release_actions`] is called.
    pub fn hold_actions(&self) {
        self.action_gate.send_replace(true);
    }

    pub fn release_actions(&self) {
        self.action_gate.send_replace(false);
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        locked(&self.calls).clone()
    }

    pub fn take_calls(&self) -> Vec<RadioCall> {
        std::mem::take(&mut *locked(&self.calls))
    }

    pub fn performed_actions(&self, id: DeviceIdentifier) -> Vec<DeviceAction> {
        locked(&self.calls)
            .iter()
            .filter_map(|call| match call {
                RadioCall::PerformAction(target, action) if *target == id => Some(action.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RadioCall) {
        locked(&self.calls).push(call);
    }

    fn fails(&self, failure: SimulatedFailures) -> bool {
        locked(&self.state).failures.contains(failure)
    }
}

#[async_trait]
impl RadioDriver for SimulatedRadio {
    async fn is_hardware_supported(&self) -> bool {
        locked(&self.state).hardware_supported
    }

    async fn is_hardware_enabled(&self) -> bool {
        locked(&self.state).hardware_enabled
    }

    async fn start_monitoring_permissions(&self) {
        self.record(RadioCall::StartMonitoringPermissions);
        let granted = {
            let mut state = locked(&self.state);
            state.monitoring_permissions = true;
            state.permission_granted
        };
        self.emit(RadioEvent::PermissionChanged { granted });
    }

    async fn stop_monitoring_permissions(&self) {
        self.record(RadioCall::StopMonitoringPermissions);
        locked(&self.state).monitoring_permissions = false;
    }

    async fn start_monitoring_hardware_enabled(&self) {
        self.record(RadioCall::StartMonitoringHardwareEnabled);
        locked(&self.state).monitoring_hardware = true;
    }

    async fn stop_monitoring_hardware_enabled(&self) {
        self.record(RadioCall::StopMonitoringHardwareEnabled);
        locked(&self.state).monitoring_hardware = false;
    }

    async fn start_scan(&self, filter: &Filter) -> Result<(), RadioError> {
        self.record(RadioCall::StartScan(filter.clone()));
        if self.fails(SimulatedFailures::START_SCAN) {
            return Err(RadioError::Rejected("scan could not be started".to_string()));
        }
        locked(&self.state).scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) {
        self.record(RadioCall::StopScan);
        locked(&self.state).scanning = false;
    }

    async fn connect(&self, id: DeviceIdentifier) -> Result<(), RadioError> {
        self.record(RadioCall::Connect(id));
        if self.fails(SimulatedFailures::CONNECT) {
            return Err(RadioError::Rejected("connection refused".to_string()));
        }
        if locked(&self.state).answer_connect {
            self.emit(RadioEvent::DeviceConnected { id });
        }
        Ok(())
    }

    async fn disconnect(&self, id: DeviceIdentifier) -> Result<(), RadioError> {
        self.record(RadioCall::Disconnect(id));
        if self.fails(SimulatedFailures::DISCONNECT) {
            return Err(RadioError::Other("disconnect failed".to_string()));
        }
        self.emit(RadioEvent::DeviceDisconnected { id });
        Ok(())
    }

    async fn discover_services(&self, id: DeviceIdentifier) -> Result<Vec<Service>, RadioError> {
        self.record(RadioCall::DiscoverServices(id));
        if self.fails(SimulatedFailures::DISCOVER_SERVICES) {
            return Err(RadioError::Timeout);
        }
        Ok(locked(&self.state).services.get(&id).cloned().unwrap_or_default())
    }

    async fn perform_action(&self, id: DeviceIdentifier, action: &DeviceAction) -> Result<Option<Vec<u8>>, RadioError> {
        self.record(RadioCall::PerformAction(id, action.clone()));
        let mut gate = self.action_gate.subscribe();
        // Sender lives as long as `self`.
        let _ = gate.wait_for(|held| !*held).await;

        if self.fails(SimulatedFailures::PERFORM_ACTION) {
            return Err(RadioError::Rejected(format!("{:?} rejected", action.attribute())));
        }
        let mut state = locked(&self.state);
        match action {
            DeviceAction::ReadCharacteristic(_) | DeviceAction::ReadDescriptor(_) => Ok(Some(
                state.values.get(&(id, action.attribute())).cloned().unwrap_or_default(),
            )),
            DeviceAction::WriteCharacteristic { value, .. } | DeviceAction::WriteDescriptor { value, .. } => {
                state.values.insert((id, action.attribute()), value.clone());
                Ok(None)
            }
            DeviceAction::EnableNotification(_) | DeviceAction::DisableNotification(_) => Ok(None),
        }
    }

    async fn request_mtu(&self, id: DeviceIdentifier, mtu: Mtu) -> Result<bool, RadioError> {
        self.record(RadioCall::RequestMtu(id, mtu));
        if self.fails(SimulatedFailures::REQUEST_MTU) {
            return Ok(false);
        }
        self.emit(RadioEvent::MtuUpdated { id, mtu });
        Ok(true)
    }

    async fn read_rssi(&self, id: DeviceIdentifier) -> Result<Rssi, RadioError> {
        self.record(RadioCall::ReadRssi(id));
        Ok(locked(&self.state).rssi.get(&id).copied().unwrap_or(DEFAULT_RSSI))
    }

    async fn pair(&self, id: DeviceIdentifier) -> Result<(), RadioError> {
        self.record(RadioCall::Pair(id));
        Ok(())
    }

    async fn unpair(&self, id: DeviceIdentifier) -> Result<(), RadioError> {
        self.record(RadioCall::Unpair(id));
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RadioEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        locked(&self.subscribers).push(tx);
        rx
    }
}
