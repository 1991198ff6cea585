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

//! Discovery lifecycle of a scan session.
//!
//! The machine is pure: [`next_state`] maps the current state and an input to the next
//! state plus the radio side effects the router has to run once the new state is
//! committed. A transition that keeps the current state produces no effects.

use crate::definitions::Filter;
use crate::identifier::DeviceIdentifier;

/// Devices seen under one filter, in order of first discovery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Discovered {
    pub devices: Vec<DeviceIdentifier>,
    pub filter: Filter,
}

impl Discovered {
    pub fn new(filter: Filter) -> Self {
        Self { devices: Vec::new(), filter }
    }

    pub fn contains(&self, identifier: &DeviceIdentifier) -> bool {
        self.devices.contains(identifier)
    }

    fn with_added(&self, identifier: DeviceIdentifier) -> Self {
        let mut devices = self.devices.clone();
        devices.push(identifier);
        Self { devices, filter: self.filter.clone() }
    }

    fn without(&self, identifier: &DeviceIdentifier) -> Self {
        let devices = self.devices.iter().filter(|d| *d != identifier).copied().collect();
        Self { devices, filter: self.filter.clone() }
    }

    /// Keeps the list when the filter is unchanged, otherwise starts over.
    fn for_filter(&self, filter: Filter) -> Self {
        if self.filter == filter {
            self.clone()
        } else {
            Self::new(filter)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanningState {
    NotInitialized,
    Initializing { discovered: Discovered },
    MissingPermissions,
    Disabled,
    Idle { discovered: Discovered },
    Scanning { discovered: Discovered },
    Deinitialized { previously_discovered: Discovered },
    NoHardware,
}

/// Flat, copyable view of [`ScanningState`] for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    NotInitialized,
    Initializing,
    MissingPermissions,
    Disabled,
    Idle,
    Scanning,
    Deinitialized,
    NoHardware,
}

impl ScanPhase {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Idle | Self::Scanning)
    }
}

impl Default for ScanningState {
    fn default() -> Self {
        Self::NotInitialized
    }
}

impl ScanningState {
    pub fn phase(&self) -> ScanPhase {
        match self {
            Self::NotInitialized => ScanPhase::NotInitialized,
            Self::Initializing { .. } => ScanPhase::Initializing,
            Self::MissingPermissions => ScanPhase::MissingPermissions,
            Self::Disabled => ScanPhase::Disabled,
            Self::Idle { .. } => ScanPhase::Idle,
            Self::Scanning { .. } => ScanPhase::Scanning,
            Self::Deinitialized { .. } => ScanPhase::Deinitialized,
            Self::NoHardware => ScanPhase::NoHardware,
        }
    }

    /// Devices exposed to callers: only enabled phases report any.
    pub fn visible_devices(&self) -> &[DeviceIdentifier] {
        match self {
            Self::Idle { discovered } | Self::Scanning { discovered } => &discovered.devices,
            _ => &[],
        }
    }

    pub fn filter(&self) -> Option<&Filter> {
        match self {
            Self::Initializing { discovered }
            | Self::Idle { discovered }
            | Self::Scanning { discovered } => Some(&discovered.filter),
            Self::Deinitialized { previously_discovered } => Some(&previously_discovered.filter),
            _ => None,
        }
    }

    /// Initializing, MissingPermissions, Disabled, Idle and Scanning.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Initializing { .. }
                | Self::MissingPermissions
                | Self::Disabled
                | Self::Idle { .. }
                | Self::Scanning { .. }
        )
    }

    /// Phases in which permission is known to be granted.
    pub fn is_permitted(&self) -> bool {
        matches!(self, Self::Disabled | Self::Idle { .. } | Self::Scanning { .. })
    }

    pub fn is_scanning(&self) -> bool {
        matches!(self, Self::Scanning { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanInput {
    Initialize { hardware_supported: bool },
    Deinitialize,
    PermissionChanged { granted: bool, enabled: bool },
    BluetoothEnabled,
    BluetoothDisabled,
    StartScanning(Filter),
    StopScanning,
    Refresh(Filter),
    ScanFailed,
    DeviceDiscovered(DeviceIdentifier),
    /// The caller dropped the device; it is reported again if rediscovered.
    ForgetDevice(DeviceIdentifier),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEffect {
    StartMonitoringPermissions,
    StopMonitoringPermissions,
    StartMonitoringHardwareEnabled,
    StopMonitoringHardwareEnabled,
    StartScan(Filter),
    StopScan,
}

/// Outcome of feeding one input to a state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<S, E> {
    /// `None` when the machine remains in its current state.
    pub state: Option<S>,
    pub effects: Vec<E>,
}

impl<S, E> Transition<S, E> {
    pub fn remain() -> Self {
        Self { state: None, effects: Vec::new() }
    }

    pub fn is_remain(&self) -> bool {
        self.state.is_none()
    }
}

pub fn next_state(current: &ScanningState, input: ScanInput) -> Transition<ScanningState, ScanEffect> {
    use ScanningState::*;

    let next = match (current, input) {
        (NotInitialized, ScanInput::Initialize { hardware_supported }) => {
            if hardware_supported {
                Initializing { discovered: Discovered::default() }
            } else {
                NoHardware
            }
        }
        (Deinitialized { previously_discovered }, ScanInput::Initialize { .. }) => Initializing {
            discovered: previously_discovered.clone(),
        },

        (Initializing { discovered }
        | Idle { discovered }
        | Scanning { discovered }, ScanInput::Deinitialize) => Deinitialized {
            previously_discovered: discovered.clone(),
        },
        (MissingPermissions | Disabled, ScanInput::Deinitialize) => Deinitialized {
            previously_discovered: Discovered::default(),
        },

        (Initializing { discovered }, ScanInput::PermissionChanged { granted, enabled }) => {
            if !granted {
                MissingPermissions
            } else if !enabled {
                Disabled
            } else {
                Idle { discovered: discovered.clone() }
            }
        }
        (Disabled | Idle { .. } | Scanning { .. }, ScanInput::PermissionChanged { granted: false, .. }) => {
            MissingPermissions
        }
        (MissingPermissions, ScanInput::PermissionChanged { granted: true, enabled }) => {
            if enabled {
                Idle { discovered: Discovered::default() }
            } else {
                Disabled
            }
        }

        (Disabled, ScanInput::BluetoothEnabled) => Idle { discovered: Discovered::default() },
        (Idle { .. } | Scanning { .. }, ScanInput::BluetoothDisabled) => Disabled,

        (Idle { discovered }, ScanInput::StartScanning(filter)) => Scanning {
            discovered: discovered.for_filter(filter),
        },
        (Scanning { discovered }, ScanInput::StartScanning(filter)) if discovered.filter != filter => {
            let next = Scanning { discovered: Discovered::new(filter.clone()) };
            return Transition {
                state: Some(next),
                effects: vec![ScanEffect::StopScan, ScanEffect::StartScan(filter)],
            };
        }
        (Idle { discovered }, ScanInput::Refresh(filter)) => Idle {
            discovered: discovered.for_filter(filter),
        },
        (Scanning { discovered }, ScanInput::StopScanning | ScanInput::ScanFailed) => Idle {
            discovered: discovered.clone(),
        },

        (Scanning { discovered }, ScanInput::DeviceDiscovered(identifier)) => {
            if discovered.contains(&identifier) {
                return Transition::remain();
            }
            Scanning { discovered: discovered.with_added(identifier) }
        }

        (Initializing { discovered }
        | Idle { discovered }
        | Scanning { discovered }
        | Deinitialized { previously_discovered: discovered }, ScanInput::ForgetDevice(identifier))
            if discovered.contains(&identifier) =>
        {
            let discovered = discovered.without(&identifier);
            match current {
                Initializing { .. } => Initializing { discovered },
                Idle { .. } => Idle { discovered },
                Scanning { .. } => Scanning { discovered },
                _ => Deinitialized { previously_discovered: discovered },
            }
        }

        _ => return Transition::remain(),
    };

    let effects = transition_effects(current, &next);
    Transition { state: Some(next), effects }
}

/// Side effects owed for moving from `old` to `new`, in the order they must run:
/// monitors are started before scanning starts and stopped after scanning stops.
pub fn transition_effects(old: &ScanningState, new: &ScanningState) -> Vec<ScanEffect> {
    let mut effects = Vec::new();

    if !old.is_active() && new.is_active() {
        effects.push(ScanEffect::StartMonitoringPermissions);
    }
    if !old.is_permitted() && new.is_permitted() {
        effects.push(ScanEffect::StartMonitoringHardwareEnabled);
    }

    match (old, new) {
        (ScanningState::Scanning { .. }, ScanningState::Scanning { .. }) => {}
        (_, ScanningState::Scanning { discovered }) => {
            effects.push(ScanEffect::StartScan(discovered.filter.clone()));
        }
        (ScanningState::Scanning { .. }, _) => effects.push(ScanEffect::StopScan),
        _ => {}
    }

    if old.is_permitted() && !new.is_permitted() {
        effects.push(ScanEffect::StopMonitoringHardwareEnabled);
    }
    if old.is_active() && !new.is_active() {
        effects.push(ScanEffect::StopMonitoringPermissions);
    }

    effects
}
