//! Per-device connection state table.
//!
//! One [`ConnectionState`] per device, so a device can never be Connecting and
//! Connected at the same time. The table is owned by the tracker actor.

use std::collections::{BTreeMap, HashMap};

use crate::types::{ConnectionState, DeviceId};

/// What the tracker should do about a discovery event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// The device moved to Connecting; start exactly one attempt.
    Connect,
    /// An attempt is already in flight.
    AlreadyConnecting,
    /// The device is already linked.
    AlreadyConnected,
    /// The device is not in the registry; no state change.
    NotPaired,
}

/// Device states. Devices not present are Idle.
#[derive(Debug, Default)]
pub struct DeviceStateTable {
    states: HashMap<DeviceId, ConnectionState>,
}

impl DeviceStateTable {
    /// Current state of `device_id`.
    #[must_use]
    pub fn state(&self, device_id: &DeviceId) -> ConnectionState {
        self.states.get(device_id).copied().unwrap_or_default()
    }

    /// A paired device was seen. Checks and sets the connect guard in one step.
    pub fn on_discovered(&mut self, device_id: &DeviceId, paired: bool) -> DiscoveryOutcome {
        if !paired {
            return DiscoveryOutcome::NotPaired;
        }
        match self.state(device_id) {
            ConnectionState::Connecting => DiscoveryOutcome::AlreadyConnecting,
            ConnectionState::Connected => DiscoveryOutcome::AlreadyConnected,
            ConnectionState::Idle | ConnectionState::Discovering | ConnectionState::Disconnected => {
                self.states
                    .insert(device_id.clone(), ConnectionState::Connecting);
                DiscoveryOutcome::Connect
            }
        }
    }

    /// The link came up. Returns `false` if the device was already Connected.
    pub fn on_connected(&mut self, device_id: &DeviceId) -> bool {
        self.states
            .insert(device_id.clone(), ConnectionState::Connected)
            != Some(ConnectionState::Connected)
    }

    /// An attempt failed or timed out. Returns `false` if no attempt was in flight.
    pub fn on_connect_failed(&mut self, device_id: &DeviceId) -> bool {
        if self.state(device_id) != ConnectionState::Connecting {
            return false;
        }
        self.states
            .insert(device_id.clone(), ConnectionState::Disconnected);
        true
    }

    /// The link went down. Returns `false` if the device was neither
    /// Connecting nor Connected.
    pub fn on_disconnected(&mut self, device_id: &DeviceId) -> bool {
        if !self.state(device_id).is_engaged() {
            return false;
        }
        self.states
            .insert(device_id.clone(), ConnectionState::Disconnected);
        true
    }

    /// Forget `device_id`; it reads as Idle again.
    pub fn reset(&mut self, device_id: &DeviceId) -> ConnectionState {
        self.states.remove(device_id).unwrap_or_default()
    }

    /// Devices currently Connecting or Connected.
    #[must_use]
    pub fn engaged(&self) -> Vec<DeviceId> {
        self.states
            .iter()
            .filter(|(_, state)| state.is_engaged())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Every tracked device's state.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<DeviceId, ConnectionState> {
        self.states
            .iter()
            .map(|(id, state)| (id.clone(), *state))
            .collect()
    }
}
