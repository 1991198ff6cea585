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

//! Connection lifecycle and action queue of a single peripheral.

use std::collections::VecDeque;

use crate::action::{ActionId, DeviceAction, PendingAction};
use crate::definitions::{Mtu, Service};
use crate::settings::ReconnectionSettings;

#[derive(Debug, PartialEq, Eq)]
pub enum ConnectedPhase {
    NoServices,
    Discovering,
    Idle {
        services: Vec<Service>,
    },
    HandlingAction {
        services: Vec<Service>,
        action: PendingAction,
        queue: VecDeque<PendingAction>,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub struct ConnectedState {
    pub mtu: Option<Mtu>,
    pub phase: ConnectedPhase,
}

impl ConnectedState {
    fn new(phase: ConnectedPhase) -> Self {
        Self { mtu: None, phase }
    }
}

#[derive(Debug, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Disconnected,
    Connecting,
    Connected(ConnectedState),
    Reconnecting {
        attempt: u32,
        services: Option<Vec<Service>>,
    },
    Disconnecting,
}

/// Flat view of [`DeviceState`] published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    NoServices,
    Discovering,
    Idle,
    HandlingAction,
    Reconnecting { attempt: u32 },
    Disconnecting,
}

impl ConnectionPhase {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::NoServices | Self::Discovering | Self::Idle | Self::HandlingAction
        )
    }
}

impl DeviceState {
    pub fn phase(&self) -> ConnectionPhase {
        match self {
            Self::Disconnected => ConnectionPhase::Disconnected,
            Self::Connecting => ConnectionPhase::Connecting,
            Self::Connected(connected) => match connected.phase {
                ConnectedPhase::NoServices => ConnectionPhase::NoServices,
                ConnectedPhase::Discovering => ConnectionPhase::Discovering,
                ConnectedPhase::Idle { .. } => ConnectionPhase::Idle,
                ConnectedPhase::HandlingAction { .. } => ConnectionPhase::HandlingAction,
            },
            Self::Reconnecting { attempt, .. } => ConnectionPhase::Reconnecting { attempt: *attempt },
            Self::Disconnecting => ConnectionPhase::Disconnecting,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn mtu(&self) -> Option<Mtu> {
        match self {
            Self::Connected(connected) => connected.mtu,
            _ => None,
        }
    }

    pub fn services(&self) -> Option<&[Service]> {
        match self {
            Self::Connected(ConnectedState {
                phase: ConnectedPhase::Idle { services } | ConnectedPhase::HandlingAction { services, .. },
                ..
            }) => Some(services.as_slice()),
            Self::Reconnecting { services: Some(services), .. } => Some(services.as_slice()),
            _ => None,
        }
    }

    pub fn executing_action(&self) -> Option<&PendingAction> {
        match self {
            Self::Connected(ConnectedState { phase: ConnectedPhase::HandlingAction { action, .. }, .. }) => {
                Some(action)
            }
            _ => None,
        }
    }

    /// Executing plus queued actions.
    pub fn pending_actions(&self) -> usize {
        match self {
            Self::Connected(ConnectedState { phase: ConnectedPhase::HandlingAction { queue, .. }, .. }) => {
                queue.len() + 1
            }
            _ => 0,
        }
    }
}

#[derive(Debug)]
pub enum DeviceInput {
    Connect,
    DidConnect,
    StartDiscovering,
    DidDiscoverServices(Vec<Service>),
    EnqueueAction(PendingAction),
    ActionCompleted { id: ActionId, success: bool },
    DidUpdateMtu(Mtu),
    /// The link dropped without being asked to.
    ConnectionLost(ReconnectionSettings),
    /// Caller asked to disconnect or to cancel a pending connection.
    Disconnect,
    DidDisconnect,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeviceEffect {
    Connect,
    Disconnect,
    DiscoverServices,
    PerformAction { id: ActionId, action: DeviceAction },
    CompleteAction { action: PendingAction, success: bool },
    AbortActions(Vec<PendingAction>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RaiseAttempt,
    GiveUp,
}

/// Decides whether a dropped link is retried once more.
pub fn retry(attempt: u32, settings: ReconnectionSettings) -> RetryDecision {
    match settings {
        ReconnectionSettings::Always => RetryDecision::RaiseAttempt,
        ReconnectionSettings::Never => RetryDecision::GiveUp,
        ReconnectionSettings::Limited(max) if attempt.saturating_add(1) < max => RetryDecision::RaiseAttempt,
        ReconnectionSettings::Limited(_) => RetryDecision::GiveUp,
    }
}

pub fn next_state(current: DeviceState, input: DeviceInput) -> (DeviceState, Vec<DeviceEffect>) {
    use DeviceState::*;

    match (current, input) {
        (Disconnected, DeviceInput::Connect) => (Connecting, vec![DeviceEffect::Connect]),

        (Connecting, DeviceInput::DidConnect) => (Connected(ConnectedState::new(ConnectedPhase::NoServices)), vec![]),
        (Reconnecting { services, .. }, DeviceInput::DidConnect) => {
            let phase = match services {
                Some(services) => ConnectedPhase::Idle { services },
                None => ConnectedPhase::NoServices,
            };
            (Connected(ConnectedState::new(phase)), vec![])
        }

        (Connected(ConnectedState { mtu, phase: ConnectedPhase::NoServices }), DeviceInput::StartDiscovering) => (
            Connected(ConnectedState { mtu, phase: ConnectedPhase::Discovering }),
            vec![DeviceEffect::DiscoverServices],
        ),
        (Connected(ConnectedState { mtu, phase: ConnectedPhase::Discovering }), DeviceInput::DidDiscoverServices(services)) => {
            (Connected(ConnectedState { mtu, phase: ConnectedPhase::Idle { services } }), vec![])
        }

        (Connected(connected), DeviceInput::EnqueueAction(pending)) => enqueue(connected, pending),
        (current, DeviceInput::EnqueueAction(pending)) => {
            (current, vec![DeviceEffect::CompleteAction { action: pending, success: false }])
        }

        (Connected(connected), DeviceInput::ActionCompleted { id, success }) => complete(connected, id, success),

        (Connected(ConnectedState { phase, .. }), DeviceInput::DidUpdateMtu(mtu)) => {
            (Connected(ConnectedState { mtu: Some(mtu), phase }), vec![])
        }

        (Connected(connected), DeviceInput::ConnectionLost(settings)) => {
            let (services, aborted) = take_actions(connected.phase);
            let mut effects = abort_effects(aborted);
            if !settings.allows_reconnect() {
                (Disconnected, effects)
            } else {
                effects.push(DeviceEffect::Connect);
                (Reconnecting { attempt: 0, services }, effects)
            }
        }
        (Reconnecting { attempt, services }, DeviceInput::ConnectionLost(settings)) => match retry(attempt, settings) {
            RetryDecision::RaiseAttempt => (
                Reconnecting { attempt: attempt.saturating_add(1), services },
                vec![DeviceEffect::Connect],
            ),
            RetryDecision::GiveUp => (Disconnected, vec![]),
        },
        (Connecting | Disconnecting, DeviceInput::ConnectionLost(_)) => (Disconnected, vec![]),

        (Connecting | Reconnecting { .. }, DeviceInput::Disconnect) => (Disconnecting, vec![DeviceEffect::Disconnect]),
        (Connected(connected), DeviceInput::Disconnect) => {
            let (_, aborted) = take_actions(connected.phase);
            let mut effects = abort_effects(aborted);
            effects.push(DeviceEffect::Disconnect);
            (Disconnecting, effects)
        }

        (Disconnecting, DeviceInput::DidDisconnect) => (Disconnected, vec![]),

        (current, _) => (current, vec![]),
    }
}

fn enqueue(connected: ConnectedState, pending: PendingAction) -> (DeviceState, Vec<DeviceEffect>) {
    let ConnectedState { mtu, phase } = connected;
    match phase {
        ConnectedPhase::Idle { services } => {
            let effect = DeviceEffect::PerformAction { id: pending.id, action: pending.action.clone() };
            let phase = ConnectedPhase::HandlingAction { services, action: pending, queue: VecDeque::new() };
            (DeviceState::Connected(ConnectedState { mtu, phase }), vec![effect])
        }
        ConnectedPhase::HandlingAction { services, action, mut queue } => {
            queue.push_back(pending);
            let phase = ConnectedPhase::HandlingAction { services, action, queue };
            (DeviceState::Connected(ConnectedState { mtu, phase }), vec![])
        }
        phase => (
            DeviceState::Connected(ConnectedState { mtu, phase }),
            vec![DeviceEffect::CompleteAction { action: pending, success: false }],
        ),
    }
}

fn complete(connected: ConnectedState, id: ActionId, success: bool) -> (DeviceState, Vec<DeviceEffect>) {
    let ConnectedState { mtu, phase } = connected;
    match phase {
        ConnectedPhase::HandlingAction { services, action, mut queue } if action.id == id => {
            let mut effects = vec![DeviceEffect::CompleteAction { action, success }];
            let phase = match queue.pop_front() {
                Some(next) => {
                    effects.push(DeviceEffect::PerformAction { id: next.id, action: next.action.clone() });
                    ConnectedPhase::HandlingAction { services, action: next, queue }
                }
                None => ConnectedPhase::Idle { services },
            };
            (DeviceState::Connected(ConnectedState { mtu, phase }), effects)
        }
        phase => (DeviceState::Connected(ConnectedState { mtu, phase }), vec![]),
    }
}

// Splits a connected phase into its known services and every action it still owns.
fn take_actions(phase: ConnectedPhase) -> (Option<Vec<Service>>, Vec<PendingAction>) {
    match phase {
        ConnectedPhase::NoServices | ConnectedPhase::Discovering => (None, Vec::new()),
        ConnectedPhase::Idle { services } => (Some(services), Vec::new()),
        ConnectedPhase::HandlingAction { services, action, queue } => {
            let mut actions = Vec::with_capacity(queue.len() + 1);
            actions.push(action);
            actions.extend(queue);
            (Some(services), actions)
        }
    }
}

fn abort_effects(aborted: Vec<PendingAction>) -> Vec<DeviceEffect> {
    if aborted.is_empty() {
        Vec::new()
    } else {
        vec![DeviceEffect::AbortActions(aborted)]
    }
}
