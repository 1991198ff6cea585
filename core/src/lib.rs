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

pub mod action;
pub mod definitions;
pub mod device_state;
pub mod errors;
pub mod identifier;
pub mod radio;
pub mod scanner_state;
pub mod settings;
pub mod simulated;

mod device_session;
mod router;
mod service;
mod session;

pub use action::{ActionCompletion, ActionId, DeviceAction};
pub use device_session::DeviceSnapshot;
pub use device_state::ConnectionPhase;
pub use errors::{RadioError, SessionError};
pub use identifier::DeviceIdentifier;
pub use radio::{RadioDriver, RadioEvent};
pub use router::SessionEvent;
pub use scanner_state::ScanPhase;
pub use service::ServiceHandle;
pub use session::{BluetoothSession, DeviceHandle};
pub use settings::{ConnectionSettings, ReconnectionSettings, SessionSettings};
pub use simulated::SimulatedRadio;
