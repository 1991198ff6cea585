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
use uuid::Uuid;

// Namespace for identifiers derived from hardware addresses.
const ADDRESS_NAMESPACE: Uuid = Uuid::from_u128(0x0e042ba4_82f1_4531_bd35_b455efebc627);

// 0000xxxx-0000-1000-8000-00805f9b34fb
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Stable identity of a peripheral.
///
/// Platforms either hand out a UUID per peripheral or expose the hardware address;
/// both map onto the same type so the rest of the crate never cares which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentifier(Uuid);

impl DeviceIdentifier {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Derives the identifier from a hardware address. Separators and letter case are ignored,
    /// so `AA:BB:CC:00:11:22` and `aabbcc001122` name the same device.
    pub fn from_address(address: &str) -> Self {
        let normalized: String = address
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self(Uuid::new_v5(&ADDRESS_NAMESPACE, normalized.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DeviceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Expands a 16-bit assigned number (e.g. `0x180D`, Heart Rate) into a full UUID.
pub fn uuid_from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}
