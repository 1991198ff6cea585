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

/// What to do when an established connection drops unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectionSettings {
    /// Keep reconnecting until the caller disconnects.
    #[default]
    Always,
    /// Give up immediately and report the device as disconnected.
    Never,
    /// Reconnect at most this many times in a row. `Limited(0)` behaves like `Never`.
    Limited(u32),
}

impl ReconnectionSettings {
    /// Whether a dropped connection gets even a first reconnection attempt.
    pub fn allows_reconnect(self) -> bool {
        !matches!(self, Self::Never | Self::Limited(0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub reconnection: ReconnectionSettings,
    /// Start service discovery as soon as a fresh connection is established.
    pub auto_discover_services: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnection: ReconnectionSettings::default(),
            auto_discover_services: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub connection: ConnectionSettings,
    /// Capacity of the session event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            event_channel_capacity: 256,
        }
    }
}

impl SessionSettings {
    pub fn with_reconnection(mut self, reconnection: ReconnectionSettings) -> Self {
        self.connection.reconnection = reconnection;
        self
    }

    pub fn with_auto_discover_services(mut self, enabled: bool) -> Self {
        self.connection.auto_discover_services = enabled;
        self
    }
}
