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

use std::{
    cmp::max,
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use ruma_common::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, SecondsSinceUnixEpoch, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;
use vodozemac::megolm::{
    GroupSession, GroupSessionPickle, MegolmMessage, SessionConfig, SessionKey,
};

use super::super::IdentityKeys;
use crate::{
    error::SessionCreationError,
    requests::ToDeviceRequest,
    types::{
        events::{
            encrypted::{MegolmV1AesSha2Content, RoomEncryptedEventContent},
            room_key,
        },
        EventEncryptionAlgorithm,
    },
};

const ROTATION_PERIOD: Duration = Duration::from_millis(604800000);
const ROTATION_MESSAGES: u64 = 100;

/// Relation of a device towards an outbound group session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShareState {
    /// The session was never shared with the device.
    NotShared,
    /// The session was shared with the device at the given message index.
    Shared(u32),
}

/// Settings for an encrypted room.
///
/// This determines the algorithm and rotation periods of a group session.
/// The rotation decision itself belongs to the room-state owner, a session
/// can additionally be rotated at any time through
/// [`OutboundGroupSession::invalidate_session()`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long the session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
        }
    }
}

/// Struct holding info about the share state of an outbound group session
/// towards a single device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ShareInfo {
    /// The message index that the device received.
    pub message_index: u32,
}

/// A map of user id/device id to a [`ShareInfo`].
///
/// Holds the `ShareInfo` for all the user/device pairs that will receive the
/// room key.
pub(crate) type ShareInfoSet = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, ShareInfo>>;

/// Outbound group session.
///
/// Outbound group sessions are used to encrypt room messages, their key
/// needs to reach every participating device before the first ciphertext
/// does.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<RwLock<GroupSession>>,
    device_id: OwnedDeviceId,
    our_identity_keys: Arc<IdentityKeys>,
    session_id: Arc<str>,
    room_id: OwnedRoomId,
    creation_time: SecondsSinceUnixEpoch,
    message_count: Arc<AtomicU64>,
    shared: Arc<AtomicBool>,
    invalidated: Arc<AtomicBool>,
    settings: Arc<EncryptionSettings>,
    shared_with_set: Arc<DashMap<OwnedUserId, DashMap<OwnedDeviceId, ShareInfo>>>,
    to_share_with_set: Arc<DashMap<Uuid, (Arc<ToDeviceRequest>, ShareInfoSet)>>,
}

impl OutboundGroupSession {
    pub(crate) fn session_config(
        algorithm: &EventEncryptionAlgorithm,
    ) -> Result<SessionConfig, SessionCreationError> {
        match algorithm {
            EventEncryptionAlgorithm::MegolmV1AesSha2 => Ok(SessionConfig::version_1()),
            _ => Err(SessionCreationError::Algorithm(algorithm.to_owned())),
        }
    }

    /// Create a new outbound group session for the given room.
    ///
    /// # Arguments
    ///
    /// * `device_id` - The id of the device that created this session.
    ///
    /// * `our_identity_keys` - The identity keys of the account that created
    ///   this session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `settings` - Settings determining the algorithm and rotation period
    ///   of the outbound group session.
    pub fn new(
        device_id: OwnedDeviceId,
        our_identity_keys: Arc<IdentityKeys>,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> Result<Self, SessionCreationError> {
        let config = Self::session_config(&settings.algorithm)?;

        let session = GroupSession::new(config);
        let session_id = session.session_id();

        Ok(OutboundGroupSession {
            inner: Arc::new(RwLock::new(session)),
            device_id,
            our_identity_keys,
            session_id: session_id.into(),
            room_id: room_id.to_owned(),
            creation_time: SecondsSinceUnixEpoch::now(),
            message_count: Arc::new(AtomicU64::new(0)),
            shared: Arc::new(AtomicBool::new(false)),
            invalidated: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(settings),
            shared_with_set: Arc::new(DashMap::new()),
            to_share_with_set: Arc::new(DashMap::new()),
        })
    }

    /// The room the session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the encryption settings of this outbound session.
    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    /// This should be called if the user wishes to rotate this session on
    /// the next message.
    pub fn invalidate_session(&self) {
        self.invalidated.store(true, Ordering::Relaxed)
    }

    /// Has the session been invalidated.
    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Relaxed)
    }

    fn elapsed(&self) -> bool {
        let creation_time = Duration::from_secs(self.creation_time.get().into());
        let now = Duration::from_secs(SecondsSinceUnixEpoch::now().get().into());

        // The rotation period is user-provided, clamp it so a typo can't
        // make every message rotate the session.
        now.checked_sub(creation_time)
            .map(|elapsed| elapsed >= max(self.settings.rotation_period, Duration::from_secs(3600)))
            .unwrap_or(true)
    }

    /// Check if the session has expired and if it should be rotated.
    ///
    /// A session will expire after some time or if enough messages have been
    /// encrypted using it.
    pub fn expired(&self) -> bool {
        let count = self.message_count.load(Ordering::SeqCst);
        let rotation_period_msgs = self.settings.rotation_period_msgs.clamp(1, 10_000);

        count >= rotation_period_msgs || self.elapsed()
    }

    /// Mark the session as shared.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::Relaxed);
    }

    /// Check if the session has been marked as shared.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    /// Get the session key of this session.
    ///
    /// A session key can be used to create an `InboundGroupSession`.
    pub async fn session_key(&self) -> SessionKey {
        self.inner.read().await.session_key()
    }

    /// The current message index of the session ratchet.
    pub async fn message_index(&self) -> u32 {
        self.inner.read().await.message_index()
    }

    pub(crate) async fn encrypt_helper(&self, plaintext: String) -> MegolmMessage {
        let mut session = self.inner.write().await;
        self.message_count.fetch_add(1, Ordering::SeqCst);
        session.encrypt(&plaintext)
    }

    /// Encrypt the given event content using this session.
    ///
    /// The session needs to be shared before this method can be called.
    pub async fn encrypt(&self, event_type: &str, content: Value) -> RoomEncryptedEventContent {
        let payload = json!({
            "content": content,
            "room_id": &self.room_id,
            "type": event_type,
        });

        let ciphertext = self.encrypt_helper(payload.to_string()).await;

        MegolmV1AesSha2Content {
            ciphertext,
            sender_key: self.our_identity_keys.curve25519,
            device_id: self.device_id.clone(),
            session_id: self.session_id().to_owned(),
        }
        .into()
    }

    /// Get the `m.room_key` content that shares this session.
    pub(crate) async fn as_content(&self) -> Value {
        let content = room_key::MegolmV1AesSha2Content {
            room_id: self.room_id.clone(),
            session_id: self.session_id().to_owned(),
            session_key: self.session_key().await,
            chain_index: Some(self.message_index().await),
        };

        serde_json::to_value(room_key::RoomKeyContent::from(Box::new(content)))
            .expect("room key contents can always be serialized")
    }

    pub(crate) fn add_request(
        &self,
        request_id: Uuid,
        request: Arc<ToDeviceRequest>,
        share_infos: ShareInfoSet,
    ) {
        self.to_share_with_set.insert(request_id, (request, share_infos));
    }

    /// Is the to-device request with the given id still waiting to be sent.
    pub(crate) fn has_request(&self, request_id: &Uuid) -> bool {
        self.to_share_with_set.contains_key(request_id)
    }

    /// Mark the to-device request with the given id as sent.
    ///
    /// Records the recipients of the request in the shared-with set, and
    /// flips the session to shared once no request is left in flight.
    pub fn mark_request_as_sent(&self, request_id: &Uuid) {
        if let Some((_, (_, share_infos))) = self.to_share_with_set.remove(request_id) {
            for (user_id, infos) in share_infos {
                let user_devices = self.shared_with_set.entry(user_id).or_default();

                for (device_id, info) in infos {
                    user_devices.insert(device_id, info);
                }
            }

            if self.to_share_with_set.is_empty() {
                debug!(
                    session_id = self.session_id(),
                    room_id = self.room_id.as_str(),
                    "All m.room_key to-device requests were sent out, marking \
                     session as shared",
                );
                self.mark_as_shared();
            }
        } else {
            error!(
                request_id = request_id.to_string().as_str(),
                "Marking a to-device request carrying a room key as sent, \
                 but no request found with the given id",
            );
        }
    }

    /// The share state of the session towards the given device.
    pub(crate) fn is_shared_with(&self, user_id: &UserId, device_id: &DeviceId) -> ShareState {
        let shared = self
            .shared_with_set
            .get(user_id)
            .and_then(|d| d.get(device_id).map(|info| ShareState::Shared(info.message_index)));

        if let Some(state) = shared {
            return state;
        }

        // The request could still be in flight.
        self.to_share_with_set
            .iter()
            .find_map(|entry| {
                let (_, share_infos) = entry.value();

                share_infos
                    .get(user_id)
                    .and_then(|d| d.get(device_id))
                    .map(|info| ShareState::Shared(info.message_index))
            })
            .unwrap_or(ShareState::NotShared)
    }

    /// Was the session key handed out to the given device.
    pub(crate) fn was_shared_with(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        matches!(self.is_shared_with(user_id, device_id), ShareState::Shared(_))
    }

    /// Convert the session into a storable snapshot.
    pub async fn pickle(&self) -> PickledOutboundGroupSession {
        let pickle = self.inner.read().await.pickle();

        let shared_with_set = self
            .shared_with_set
            .iter()
            .map(|user| {
                let devices = user
                    .value()
                    .iter()
                    .map(|d| (d.key().to_owned(), d.value().to_owned()))
                    .collect();
                (user.key().to_owned(), devices)
            })
            .collect();

        PickledOutboundGroupSession {
            pickle,
            room_id: self.room_id.clone(),
            settings: (*self.settings).clone(),
            creation_time: self.creation_time,
            message_count: self.message_count.load(Ordering::SeqCst),
            shared: self.shared(),
            invalidated: self.invalidated(),
            shared_with_set,
        }
    }

    /// Restore a session from a previously stored snapshot.
    pub fn from_pickle(
        device_id: OwnedDeviceId,
        our_identity_keys: Arc<IdentityKeys>,
        pickle: PickledOutboundGroupSession,
    ) -> Self {
        let session: GroupSession = pickle.pickle.into();
        let session_id = session.session_id();

        let shared_with_set = pickle
            .shared_with_set
            .into_iter()
            .map(|(user_id, devices)| (user_id, devices.into_iter().collect()))
            .collect();

        Self {
            inner: Arc::new(RwLock::new(session)),
            device_id,
            our_identity_keys,
            session_id: session_id.into(),
            room_id: pickle.room_id,
            creation_time: pickle.creation_time,
            message_count: Arc::new(AtomicU64::new(pickle.message_count)),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
            invalidated: Arc::new(AtomicBool::new(pickle.invalidated)),
            settings: Arc::new(pickle.settings),
            shared_with_set: Arc::new(shared_with_set),
            to_share_with_set: Arc::new(DashMap::new()),
        }
    }
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("created_at", &self.creation_time)
            .field("message_count", &self.message_count)
            .finish()
    }
}

/// A storable snapshot of an [`OutboundGroupSession`].
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledOutboundGroupSession {
    /// The pickled ratchet state of the session.
    pub pickle: GroupSessionPickle,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
    /// The settings the session was created under.
    pub settings: EncryptionSettings,
    /// When the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// How many messages the session has encrypted.
    pub message_count: u64,
    /// Whether the session key reached all its recipients.
    pub shared: bool,
    /// Whether the session was flagged for rotation.
    pub invalidated: bool,
    /// The devices the session key was handed out to.
    pub(crate) shared_with_set: ShareInfoSet,
}
