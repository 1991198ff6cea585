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

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::definitions::{AttributeRef, CharacteristicRef, DescriptorRef};

/// A unit of work a connected device executes against one of its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    ReadCharacteristic(CharacteristicRef),
    ReadDescriptor(DescriptorRef),
    WriteCharacteristic { characteristic: CharacteristicRef, value: Vec<u8> },
    WriteDescriptor { descriptor: DescriptorRef, value: Vec<u8> },
    EnableNotification(CharacteristicRef),
    DisableNotification(CharacteristicRef),
}

impl DeviceAction {
    pub fn attribute(&self) -> AttributeRef {
        match self {
            Self::ReadCharacteristic(c)
            | Self::EnableNotification(c)
            | Self::DisableNotification(c) => AttributeRef::Characteristic(*c),
            Self::WriteCharacteristic { characteristic, .. } => AttributeRef::Characteristic(*characteristic),
            Self::ReadDescriptor(d) => AttributeRef::Descriptor(*d),
            Self::WriteDescriptor { descriptor, .. } => AttributeRef::Descriptor(*descriptor),
        }
    }

    /// Value the attribute is known to hold once this action succeeded, if the action
    /// itself determines it.
    pub fn written_value(&self) -> Option<&[u8]> {
        match self {
            Self::WriteCharacteristic { value, .. } | Self::WriteDescriptor { value, .. } => Some(value.as_slice()),
            _ => None,
        }
    }
}

/// Identity of one enqueued action. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

impl ActionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sending half of an action's completion. Resolves at most once; dropping it
/// unresolved is observed by the caller as a failure.
#[derive(Debug)]
pub struct CompletionSignal {
    sender: Option<oneshot::Sender<bool>>,
}

impl CompletionSignal {
    pub fn resolve(mut self, success: bool) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(success);
        }
    }
}

/// Caller side of an action's completion.
///
/// Resolves to `true` when the radio reported success, `false` on failure or when the
/// action was discarded by a disconnect.
#[derive(Debug)]
pub struct ActionCompletion {
    receiver: oneshot::Receiver<bool>,
}

impl Future for ActionCompletion {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.receiver).poll(cx).map(|r| r.unwrap_or_default())
    }
}

/// Creates a linked completion pair.
pub fn completion_pair() -> (CompletionSignal, ActionCompletion) {
    let (sender, receiver) = oneshot::channel();
    (CompletionSignal { sender: Some(sender) }, ActionCompletion { receiver })
}

/// An action waiting in, or being executed from, a device's queue.
#[derive(Debug)]
pub struct PendingAction {
    pub id: ActionId,
    pub action: DeviceAction,
    completion: CompletionSignal,
}

impl PendingAction {
    pub fn new(action: DeviceAction, completion: CompletionSignal) -> Self {
        Self { id: ActionId::next(), action, completion }
    }

    /// Convenience for callers that want the completion future right away.
    pub fn create(action: DeviceAction) -> (Self, ActionCompletion) {
        let (signal, completion) = completion_pair();
        (Self::new(action, signal), completion)
    }

    pub fn resolve(self, success: bool) {
        self.completion.resolve(success);
    }
}

impl PartialEq for PendingAction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PendingAction {}
