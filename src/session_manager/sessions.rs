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

use std::{collections::HashSet, sync::Arc};

use ruma_common::{DeviceKeyAlgorithm, OwnedDeviceId, OwnedUserId, UserId};
use tracing::{info, warn};

use crate::{
    directory::{KeyDirectory, KeysClaimResponse, KeysQueryResponse, KeysUploadRequest},
    error::OlmResult,
    identities::DeviceInfo,
    olm::Account,
    store::Store,
    types::UserDeviceMap,
};

/// Coordinates the establishment of pairwise sessions with remote devices.
///
/// Device lists are refreshed and one-time keys claimed through the injected
/// key directory. Failures are handled per device, a device that can't get a
/// session today will get another chance the next time it is needed.
#[derive(Clone, Debug)]
pub(crate) struct SessionManager {
    account: Account,
    store: Store,
    directory: Arc<dyn KeyDirectory>,
}

impl SessionManager {
    pub fn new(account: Account, store: Store, directory: Arc<dyn KeyDirectory>) -> Self {
        Self { account, store, directory }
    }

    /// Make sure we share a pairwise session with every eligible device of
    /// the given users.
    ///
    /// Already established sessions are left alone, even if the exchange
    /// fails halfway through for other devices. Concurrent calls for
    /// overlapping user sets may race, the per-device writes are atomic and
    /// the last one wins.
    pub async fn ensure_sessions_with(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> OlmResult<()> {
        let users: Vec<OwnedUserId> = users.into_iter().map(|u| u.to_owned()).collect();

        let response = self.directory.download_keys(&users).await?;
        self.receive_keys_query_response(&response).await?;

        let missing = self.get_missing_sessions(users.iter().map(|u| u.as_ref())).await?;

        if missing.is_empty() {
            return Ok(());
        }

        let response = self.directory.claim_one_time_keys(&missing).await?;
        self.receive_keys_claim_response(&response).await?;

        Ok(())
    }

    /// Store the devices a key query response handed us.
    ///
    /// Records failing their identity or signature checks are dropped,
    /// devices that disappeared from their owner's list are marked deleted
    /// but stay around.
    pub async fn receive_keys_query_response(
        &self,
        response: &KeysQueryResponse,
    ) -> OlmResult<Vec<DeviceInfo>> {
        let mut changed_devices = Vec::new();

        for (user_id, device_id, device_keys) in response.device_keys.iter() {
            if user_id == self.account.user_id() && device_id == self.account.device_id() {
                continue;
            }

            if user_id != &*device_keys.user_id || device_id != &*device_keys.device_id {
                warn!(
                    user_id = device_keys.user_id.as_str(),
                    device_id = device_keys.device_id.as_str(),
                    "Mismatch in the device keys payload",
                );
                continue;
            }

            let device = self.store.get_device(user_id, device_id).await?;

            let device = if let Some(mut device) = device {
                if let Err(e) = device.update_device(device_keys) {
                    warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        error = ?e,
                        "Failed to update the device keys",
                    );
                    continue;
                }
                device.mark_as_live();
                device
            } else {
                match DeviceInfo::try_from(device_keys) {
                    Ok(d) => {
                        info!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            "Adding a new device to the device registry",
                        );
                        d
                    }
                    Err(e) => {
                        warn!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            error = ?e,
                            "Failed to create a new device",
                        );
                        continue;
                    }
                }
            };

            changed_devices.push(device);
        }

        // Devices that the owner removed stop being recipients, the records
        // themselves are kept.
        for user_id in response.device_keys.users() {
            let response_devices: HashSet<OwnedDeviceId> = response
                .device_keys
                .user_values(user_id)
                .map(|d| d.keys().cloned().collect())
                .unwrap_or_default();

            let stored_devices = self.store.get_user_devices(user_id).await?;

            for device in stored_devices.devices() {
                if !response_devices.contains(device.device_id()) {
                    device.mark_as_deleted();
                    changed_devices.push(device.clone());
                }
            }
        }

        self.store.save_devices(&changed_devices).await?;

        Ok(changed_devices)
    }

    /// Devices of the given users that we should claim a one-time key for.
    pub async fn get_missing_sessions(
        &self,
        users: impl Iterator<Item = &UserId>,
    ) -> OlmResult<UserDeviceMap<String>> {
        let mut missing = UserDeviceMap::new();

        for user_id in users {
            let user_devices = self.store.get_user_devices(user_id).await?;

            for device in user_devices.devices() {
                if device.is_blocked() || device.is_deleted() {
                    continue;
                }

                let sender_key = match device.get_key(DeviceKeyAlgorithm::Curve25519) {
                    Some(k) => k.to_owned(),
                    None => continue,
                };

                let is_missing = match self.store.get_sessions(&sender_key).await? {
                    Some(sessions) => sessions.lock().await.is_empty(),
                    None => true,
                };

                if is_missing {
                    missing.insert(
                        user_id,
                        device.device_id(),
                        "signed_curve25519".to_owned(),
                    );
                }
            }
        }

        Ok(missing)
    }

    /// Receive a successful key claim response and create new pairwise
    /// sessions with the claimed keys.
    pub async fn receive_keys_claim_response(
        &self,
        response: &KeysClaimResponse,
    ) -> OlmResult<()> {
        for (user_id, device_id, key_map) in response.one_time_keys.iter() {
            let device = match self.store.get_device(user_id, device_id).await {
                Ok(Some(d)) => d,
                Ok(None) => {
                    warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        "Tried to create an Olm session, but the device is unknown",
                    );
                    continue;
                }
                Err(e) => {
                    warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        error = ?e,
                        "Tried to create an Olm session, but the device \
                         can't be fetched from the store",
                    );
                    continue;
                }
            };

            let one_time_key = match key_map.values().next() {
                Some(k) => k,
                None => {
                    warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        "The key claim response didn't contain a key for the device",
                    );
                    continue;
                }
            };

            info!(
                user_id = user_id.as_str(),
                device_id = device_id.as_str(),
                "Creating an outbound Olm session",
            );

            let session = match self.account.create_outbound_session(&device, one_time_key).await
            {
                Ok(s) => s,
                Err(e) => {
                    warn!(
                        user_id = user_id.as_str(),
                        device_id = device_id.as_str(),
                        error = ?e,
                        "Failed to create an outbound Olm session",
                    );
                    continue;
                }
            };

            if let Err(e) = self.store.save_sessions(&[session]).await {
                warn!(error = ?e, "Failed to store a newly created Olm session");
                continue;
            }
        }

        Ok(())
    }

    /// Does the key directory need fresh key material from us.
    pub async fn should_upload_keys(&self) -> bool {
        self.account.should_upload_keys().await
    }

    /// Upload our device keys and a fresh batch of one-time keys.
    ///
    /// Does nothing if the directory already holds enough key material.
    pub async fn upload_keys(&self) -> OlmResult<()> {
        if !self.should_upload_keys().await {
            return Ok(());
        }

        self.account.generate_one_time_keys_if_needed().await;

        let device_keys =
            if self.account.shared() { None } else { Some(self.account.device_keys().await) };
        let one_time_keys = self.account.signed_one_time_keys().await;

        if device_keys.is_none() && one_time_keys.is_empty() {
            return Ok(());
        }

        let request = KeysUploadRequest { device_keys, one_time_keys };
        let response = self.directory.upload_keys(request).await?;

        self.account.receive_keys_upload_response(&response).await;
        self.store.save_account(self.account.clone()).await?;

        Ok(())
    }
}
