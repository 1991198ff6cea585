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

use std::collections::BTreeSet;

use bitflags::bitflags;
use uuid::Uuid;

/// Set of service UUIDs a scan is restricted to. Empty means "everything".
///
/// Compared by value: two filters with the same UUIDs are the same filter.
pub type Filter = BTreeSet<Uuid>;

/// Negotiated maximum transmission unit of a connection.
pub type Mtu = u16;

/// Received signal strength in dBm.
pub type Rssi = i16;

bitflags! {
    /// GATT characteristic properties as advertised in the characteristic declaration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// Snapshot of what a peripheral advertised the last time it was seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    pub name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub manufacturer_data: Option<Vec<u8>>,
    pub tx_power: Option<i16>,
    pub is_connectable: bool,
}

impl Default for AdvertisementData {
    fn default() -> Self {
        Self {
            name: None,
            service_uuids: Vec::new(),
            manufacturer_data: None,
            tx_power: None,
            is_connectable: true,
        }
    }
}

impl AdvertisementData {
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<Descriptor>,
}

impl Characteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self { uuid, properties, descriptors: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn new(uuid: Uuid, characteristics: Vec<Characteristic>) -> Self {
        Self { uuid, characteristics }
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&Characteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Addresses a characteristic by its owning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self { service, characteristic }
    }

    pub fn descriptor(self, descriptor: Uuid) -> DescriptorRef {
        DescriptorRef { characteristic: self, descriptor }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorRef {
    pub characteristic: CharacteristicRef,
    pub descriptor: Uuid,
}

/// Any attribute an action can target. Also keys the per-device value cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttributeRef {
    Characteristic(CharacteristicRef),
    Descriptor(DescriptorRef),
}

impl From<CharacteristicRef> for AttributeRef {
    fn from(value: CharacteristicRef) -> Self {
        Self::Characteristic(value)
    }
}

impl From<DescriptorRef> for AttributeRef {
    fn from(value: DescriptorRef) -> Self {
        Self::Descriptor(value)
    }
}
