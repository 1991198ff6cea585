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

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::action::DeviceAction;
use crate::definitions::{AdvertisementData, AttributeRef, Filter, Mtu, Rssi, Service};
use crate::errors::RadioError;
use crate::identifier::DeviceIdentifier;

/// Events a radio driver reports asynchronously, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    PermissionChanged { granted: bool },
    BluetoothEnabled,
    BluetoothDisabled,
    FailedScanning,
    DeviceDiscovered {
        id: DeviceIdentifier,
        rssi: Rssi,
        advertisement: AdvertisementData,
    },
    DeviceConnected { id: DeviceIdentifier },
    DeviceDisconnected { id: DeviceIdentifier },
    MtuUpdated { id: DeviceIdentifier, mtu: Mtu },
    /// Notification or indication received for a subscribed attribute.
    ValueUpdated {
        id: DeviceIdentifier,
        attribute: AttributeRef,
        value: Vec<u8>,
    },
}

/// Platform radio abstraction driven by the session.
///
/// Calls that start something long-running (`connect`, `start_scan`, monitoring) return as
/// soon as the request is accepted; their outcome arrives later as a [`RadioEvent`].
/// Timeouts are the driver's business and must be reported as events or errors.
#[async_trait]
pub trait RadioDriver: Send + Sync {
    async fn is_hardware_supported(&self) -> bool;

    async fn is_hardware_enabled(&self) -> bool;

    /// Must report the current permission state with a `PermissionChanged` event.
    async fn start_monitoring_permissions(&self);

    async fn stop_monitoring_permissions(&self);

    async fn start_monitoring_hardware_enabled(&self);

    async fn stop_monitoring_hardware_enabled(&self);

    async fn start_scan(&self, filter: &Filter) -> Result<(), RadioError>;

    async fn stop_scan(&self);

    async fn connect(&self, id: DeviceIdentifier) -> Result<(), RadioError>;

    async fn disconnect(&self, id: DeviceIdentifier) -> Result<(), RadioError>;

    async fn discover_services(&self, id: DeviceIdentifier) -> Result<Vec<Service>, RadioError>;

    /// Returns the value read, for reads. Writes and notification toggles return `None`.
    async fn perform_action(&self, id: DeviceIdentifier, action: &DeviceAction) -> Result<Option<Vec<u8>>, RadioError>;

    async fn request_mtu(&self, id: DeviceIdentifier, mtu: Mtu) -> Result<bool, RadioError>;

    async fn read_rssi(&self, id: DeviceIdentifier) -> Result<Rssi, RadioError>;

    async fn pair(&self, id: DeviceIdentifier) -> Result<(), RadioError>;

    async fn unpair(&self, id: DeviceIdentifier) -> Result<(), RadioError>;

    /// Hands out the stream of radio events. The session subscribes once and is the only
    /// consumer; every event must be delivered, so the channel is unbounded.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RadioEvent>;
}
