// Copyright 2021 The Matrix.org Foundation C.I.C.
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

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;
use ruma_common::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};

use super::device::{DeviceInfo, VerificationState};

/// An in-memory registry of the device identity records we know about.
///
/// The registry is pure data, it never talks to the network. Records are
/// keyed by the `(user id, device id)` pair and mutations are atomic per
/// record.
#[derive(Clone, Debug, Default)]
pub struct DeviceRegistry {
    entries: Arc<DashMap<OwnedUserId, DashMap<OwnedDeviceId, DeviceInfo>>>,
}

impl DeviceRegistry {
    /// Create a new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the record of a single device.
    pub fn get(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceInfo> {
        self.entries.get(user_id)?.get(device_id).map(|d| d.clone())
    }

    /// Get a snapshot of all the devices of the given user.
    ///
    /// The snapshot is a copy, later registry changes don't show up in it.
    /// Unknown users yield an empty snapshot.
    pub fn user_devices(&self, user_id: &UserId) -> UserDevices {
        let entries = self
            .entries
            .get(user_id)
            .map(|d| {
                d.iter().map(|e| (e.key().to_owned(), e.value().clone())).collect()
            })
            .unwrap_or_default();

        UserDevices { entries }
    }

    /// Insert or update a device record.
    ///
    /// Existing records are merged by device id. The local trust decision
    /// always survives the merge, so a Blocked device can never be
    /// resurrected by a key download.
    pub fn upsert(&self, device: DeviceInfo) {
        let user_devices = self.entries.entry(device.user_id().to_owned()).or_default();

        if let Some(existing) = user_devices.get(device.device_id()) {
            device.set_verification_state(existing.verification_state());
        }

        user_devices.insert(device.device_id().to_owned(), device);
    }

    /// Insert or update a batch of devices belonging to the given user.
    pub fn upsert_devices(&self, user_id: &UserId, devices: Vec<DeviceInfo>) {
        for device in devices {
            debug_assert_eq!(device.user_id(), user_id);
            self.upsert(device);
        }
    }

    /// Remove a device record, returning it if there was one.
    pub fn remove(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceInfo> {
        self.entries.get(user_id)?.remove(device_id).map(|(_, d)| d)
    }

    /// Set the local verification state of a device.
    ///
    /// Returns false if the device isn't known.
    pub fn set_verification_state(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        state: VerificationState,
    ) -> bool {
        match self.get(user_id, device_id) {
            Some(device) => {
                device.set_verification_state(state);
                true
            }
            None => false,
        }
    }
}

/// A copy-on-read snapshot of the devices belonging to a single user.
#[derive(Debug, Default)]
pub struct UserDevices {
    entries: BTreeMap<OwnedDeviceId, DeviceInfo>,
}

impl UserDevices {
    /// Get the device with the given id out of the snapshot.
    pub fn get(&self, device_id: &DeviceId) -> Option<&DeviceInfo> {
        self.entries.get(device_id)
    }

    /// Iterate over the device ids in the snapshot.
    pub fn keys(&self) -> impl Iterator<Item = &DeviceId> {
        self.entries.keys().map(|id| id.as_ref())
    }

    /// Iterate over the devices in the snapshot.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.entries.values()
    }

    /// Does the snapshot contain any devices.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ruma_common::{device_id, user_id};

    use super::{DeviceRegistry, VerificationState};
    use crate::identities::device::tests::get_device;

    #[tokio::test]
    async fn unknown_users_yield_empty_snapshots() {
        let registry = DeviceRegistry::new();
        assert!(registry.user_devices(user_id!("@alice:example.org")).is_empty());
    }

    #[tokio::test]
    async fn upserts_merge_by_device_id() {
        let registry = DeviceRegistry::new();
        let device = get_device().await;

        registry.upsert(device.clone());
        registry.upsert(device.clone());

        let devices = registry.user_devices(device.user_id());
        assert_eq!(devices.devices().count(), 1);
        assert_eq!(devices.get(device.device_id()).unwrap(), &device);
    }

    #[tokio::test]
    async fn blocked_devices_stay_blocked_across_upserts() {
        let registry = DeviceRegistry::new();
        let device = get_device().await;

        registry.upsert(device.clone());
        assert!(registry.set_verification_state(
            device.user_id(),
            device.device_id(),
            VerificationState::Blocked,
        ));

        // A fresh record of the same device arrives with a key download.
        let fresh = get_device().await;
        registry.upsert(fresh);

        let stored = registry.get(device.user_id(), device.device_id()).unwrap();
        assert_eq!(stored.verification_state(), VerificationState::Blocked);
    }

    #[tokio::test]
    async fn verification_state_of_unknown_devices_cant_be_set() {
        let registry = DeviceRegistry::new();

        assert!(!registry.set_verification_state(
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            VerificationState::Verified,
        ));
    }
}
