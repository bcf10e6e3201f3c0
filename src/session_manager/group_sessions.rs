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
use ruma_common::{OwnedRoomId, RoomId, UserId};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    identities::Device,
    olm::{Account, EncryptionSettings, OutboundGroupSession, ShareInfo},
    requests::{DeviceIdOrAllDevices, ToDeviceRequest},
    store::Store,
    types::events::encrypted::RoomEncryptedEventContent,
};

/// Manages the lifecycle of the per-room outbound group sessions.
///
/// A session moves from creation, through key distribution, into active use,
/// until a rotation condition or an explicit invalidation retires it.
#[derive(Clone, Debug)]
pub(crate) struct GroupSessionManager {
    account: Account,
    store: Store,
    /// The currently active outbound group sessions.
    outbound_group_sessions: Arc<DashMap<OwnedRoomId, OutboundGroupSession>>,
}

impl GroupSessionManager {
    const MAX_TO_DEVICE_MESSAGES: usize = 20;

    pub fn new(account: Account, store: Store) -> Self {
        Self {
            account,
            store,
            outbound_group_sessions: Arc::new(DashMap::new()),
        }
    }

    /// A shared handle on the active outbound sessions, used to answer
    /// incoming key requests.
    pub fn outbound_sessions_handle(&self) -> Arc<DashMap<OwnedRoomId, OutboundGroupSession>> {
        self.outbound_group_sessions.clone()
    }

    /// Get the active outbound group session for a room, if one exists.
    pub fn get_outbound_group_session(&self, room_id: &RoomId) -> Option<OutboundGroupSession> {
        self.outbound_group_sessions.get(room_id).map(|s| s.clone())
    }

    /// Flag the room's outbound session for rotation.
    ///
    /// This is the hook for external rotation triggers, most importantly a
    /// membership change. Returns true if there was a session to invalidate.
    pub fn invalidate_group_session(&self, room_id: &RoomId) -> bool {
        match self.outbound_group_sessions.get(room_id) {
            Some(session) => {
                session.invalidate_session();
                true
            }
            None => false,
        }
    }

    /// Should a new group session be created and shared before the next room
    /// message is encrypted.
    ///
    /// This should be checked on every message since sessions can expire at
    /// any time.
    pub fn should_share_group_session(&self, room_id: &RoomId) -> bool {
        match self.outbound_group_sessions.get(room_id) {
            Some(s) => !s.shared() || s.invalidated() || s.expired(),
            None => true,
        }
    }

    async fn create_outbound_group_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> OlmResult<OutboundGroupSession> {
        let (outbound, inbound) =
            self.account.create_group_session_pair(room_id, settings).await?;

        self.store.save_inbound_group_sessions(&[inbound]).await?;

        debug!(
            room_id = room_id.as_str(),
            session_id = outbound.session_id(),
            "Created a new outbound group session",
        );

        self.outbound_group_sessions.insert(room_id.to_owned(), outbound.clone());

        Ok(outbound)
    }

    async fn collect_recipient_devices(
        &self,
        users: impl Iterator<Item = &UserId>,
    ) -> OlmResult<Vec<Device>> {
        let mut devices = Vec::new();

        for user_id in users {
            let user_devices = self.store.get_user_devices(user_id).await?;

            devices.extend(
                user_devices
                    .devices()
                    .filter(|d| !d.is_blocked() && !d.is_deleted())
                    .map(|d| self.store.wrap_device(d.clone())),
            );
        }

        Ok(devices)
    }

    /// Create the current room key sharing requests for the given room.
    ///
    /// Creates a new session if none is active or the active one hit a
    /// rotation condition, then encrypts the session key for every recipient
    /// device that doesn't have it yet. Blocked and removed devices never
    /// receive the key.
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: impl Iterator<Item = &UserId>,
        settings: EncryptionSettings,
    ) -> OlmResult<Vec<Arc<ToDeviceRequest>>> {
        let session = match self.get_outbound_group_session(room_id) {
            Some(s) if !s.expired() && !s.invalidated() => s,
            _ => self.create_outbound_group_session(room_id, settings).await?,
        };

        let devices: Vec<Device> = self
            .collect_recipient_devices(users)
            .await?
            .into_iter()
            .filter(|d| !session.was_shared_with(d.user_id(), d.device_id()))
            .collect();

        let key_content = session.as_content().await;
        let message_index = session.message_index().await;
        let mut requests = Vec::new();

        for device_chunk in devices.chunks(Self::MAX_TO_DEVICE_MESSAGES) {
            let mut messages = BTreeMap::new();
            let mut share_infos = BTreeMap::new();

            for device in device_chunk {
                let encrypted = device.encrypt("m.room_key", key_content.clone()).await;

                let encrypted = match encrypted {
                    Ok(c) => c,
                    Err(OlmError::MissingSession)
                    | Err(OlmError::EventError(EventError::MissingSenderKey)) => {
                        info!(
                            user_id = device.user_id().as_str(),
                            device_id = device.device_id().as_str(),
                            "Can't share the room key, no Olm session with the device",
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                messages
                    .entry(device.user_id().to_owned())
                    .or_insert_with(BTreeMap::new)
                    .insert(
                        DeviceIdOrAllDevices::DeviceId(device.device_id().to_owned()),
                        serde_json::to_value(&encrypted)?,
                    );

                share_infos
                    .entry(device.user_id().to_owned())
                    .or_insert_with(BTreeMap::new)
                    .insert(device.device_id().to_owned(), ShareInfo { message_index });
            }

            if messages.is_empty() {
                continue;
            }

            let request = ToDeviceRequest {
                event_type: "m.room.encrypted".to_owned(),
                txn_id: Uuid::new_v4(),
                messages,
            };

            session.add_request(request.txn_id, Arc::new(request.clone()), share_infos);
            requests.push(Arc::new(request));
        }

        session.mark_as_shared();
        self.store.save_outbound_group_session(session.clone()).await?;

        Ok(requests)
    }

    /// Mark a previously returned room key sharing request as sent.
    pub fn mark_request_as_sent(&self, request_id: &Uuid) {
        for session in self.outbound_group_sessions.iter() {
            if session.has_request(request_id) {
                session.mark_request_as_sent(request_id);
                return;
            }
        }
    }

    /// Encrypt the given event content for the given room.
    ///
    /// The active outbound session is used, the caller needs to share one
    /// first, and rotate it when [`should_share_group_session()`] says so.
    ///
    /// [`should_share_group_session()`]: Self::should_share_group_session
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<RoomEncryptedEventContent> {
        let session = self
            .get_outbound_group_session(room_id)
            .ok_or(MegolmError::MissingOutboundSession)?;

        if !session.shared() || session.invalidated() || session.expired() {
            return Err(MegolmError::MissingOutboundSession);
        }

        Ok(session.encrypt(event_type, content).await)
    }
}
