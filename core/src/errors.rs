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

use thiserror::Error;

use crate::identifier::DeviceIdentifier;

/// Failure reported by a radio driver for a single call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Peripheral is not connected")]
    NotConnected,

    #[error("Operation not supported by the radio")]
    Unsupported,

    #[error("Operation rejected by the peripheral: {0}")]
    Rejected(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Radio error: {0}")]
    Other(String),
}

/// Error type of the caller-facing session API.
///
/// State machine failures never surface here; they are represented as states or as
/// completion signals resolving to `false`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Bluetooth session is closed")]
    Closed,

    #[error("Device {0} not found")]
    DeviceNotFound(DeviceIdentifier),

    #[error("Device {0} is not connected")]
    NotConnected(DeviceIdentifier),

    #[error("Device {0} does not accept connections")]
    NotConnectable(DeviceIdentifier),

    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
}
