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

use std::{collections::BTreeMap, fmt, sync::Arc};

use ruma_common::{DeviceKeyAlgorithm, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use vodozemac::{
    megolm::{
        DecryptedMessage, DecryptionError, ExportedSessionKey,
        InboundGroupSession as InnerSession, InboundGroupSessionPickle, MegolmMessage,
        SessionKey,
    },
    Curve25519PublicKey, Ed25519PublicKey, PickleError,
};

use super::{ExportedRoomKey, OutboundGroupSession};
use crate::{
    error::{EventError, MegolmError, MegolmResult, SessionCreationError},
    types::{
        deserialize_curve_key,
        events::{encrypted::EncryptedRoomEvent, forwarded_room_key, room_key},
        serialize_curve_key, EventEncryptionAlgorithm,
    },
};

/// Inbound group session.
///
/// Inbound group sessions decrypt the room messages of a single sender. The
/// ratchet state is strictly sequential, access is serialized by the inner
/// lock, and a watermark of the highest decrypted message index guards
/// against replays.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,
    session_id: Arc<str>,
    first_known_index: u32,
    /// The curve25519 key of the device that created the session.
    pub(crate) sender_key: Curve25519PublicKey,
    signing_keys: Arc<BTreeMap<DeviceKeyAlgorithm, String>>,
    room_id: OwnedRoomId,
    forwarding_curve25519_key_chain: Arc<Vec<String>>,
    imported: bool,
    decrypted_index_watermark: Arc<Mutex<Option<u32>>>,
}

impl InboundGroupSession {
    /// Create a new inbound group session for the given room.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public curve25519 key of the account that sent
    ///   us the session.
    ///
    /// * `signing_key` - The public ed25519 key of the account that sent us
    ///   the session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `session_key` - The private session key that is used to decrypt
    ///   messages.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
    ) -> Result<Self, SessionCreationError> {
        let config =
            OutboundGroupSession::session_config(&EventEncryptionAlgorithm::MegolmV1AesSha2)?;
        let session = InnerSession::new(session_key, config);
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        let signing_keys =
            BTreeMap::from([(DeviceKeyAlgorithm::Ed25519, signing_key.to_base64())]);

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key,
            signing_keys: Arc::new(signing_keys),
            room_id: room_id.to_owned(),
            forwarding_curve25519_key_chain: Arc::new(Vec::new()),
            imported: false,
            decrypted_index_watermark: Arc::new(Mutex::new(None)),
        })
    }

    /// Create a new inbound group session from an `m.room_key` event that
    /// arrived through an Olm encrypted channel.
    ///
    /// The id the session was advertised under must match the id the session
    /// key itself derives to, otherwise an attacker could inject a key of
    /// their own under someone else's session id.
    pub fn from_room_key_content(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        content: &room_key::MegolmV1AesSha2Content,
    ) -> Result<Self, SessionCreationError> {
        let session =
            Self::new(sender_key, signing_key, &content.room_id, &content.session_key)?;

        if session.session_id() != content.session_id {
            return Err(SessionCreationError::SessionIdMismatch {
                declared: content.session_id.clone(),
                derived: session.session_id().to_owned(),
            });
        }

        Ok(session)
    }

    /// Create a new inbound group session from an `m.forwarded_room_key`
    /// event.
    ///
    /// The key of the device that forwarded the session to us is appended to
    /// the forwarding key chain, every hop of a forwarded session stays
    /// visible to trust decisions.
    pub fn from_forwarded_content(
        forwarder_key: Curve25519PublicKey,
        content: &forwarded_room_key::MegolmV1AesSha2Content,
    ) -> Result<Self, SessionCreationError> {
        let config =
            OutboundGroupSession::session_config(&EventEncryptionAlgorithm::MegolmV1AesSha2)?;
        let session = InnerSession::import(&content.session_key, config);
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        if session_id != content.session_id {
            return Err(SessionCreationError::SessionIdMismatch {
                declared: content.session_id.clone(),
                derived: session_id,
            });
        }

        let mut forwarding_chain = content.forwarding_curve25519_key_chain.clone();
        forwarding_chain.push(forwarder_key.to_base64());

        let signing_keys = BTreeMap::from([(
            DeviceKeyAlgorithm::Ed25519,
            content.claimed_ed25519_key.to_base64(),
        )]);

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key: content.sender_key,
            signing_keys: Arc::new(signing_keys),
            room_id: content.room_id.clone(),
            forwarding_curve25519_key_chain: Arc::new(forwarding_chain),
            imported: true,
            decrypted_index_watermark: Arc::new(Mutex::new(None)),
        })
    }

    /// Create a new inbound group session from an exported version of the
    /// group session.
    pub fn from_export(exported_session: &ExportedRoomKey) -> Result<Self, SessionCreationError> {
        let config = OutboundGroupSession::session_config(&exported_session.algorithm)?;
        let session = InnerSession::import(&exported_session.session_key, config);
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        if session_id != exported_session.session_id {
            return Err(SessionCreationError::SessionIdMismatch {
                declared: exported_session.session_id.clone(),
                derived: session_id,
            });
        }

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key: exported_session.sender_key,
            signing_keys: Arc::new(exported_session.sender_claimed_keys.clone()),
            room_id: exported_session.room_id.clone(),
            forwarding_curve25519_key_chain: Arc::new(
                exported_session.forwarding_curve25519_key_chain.clone(),
            ),
            imported: true,
            decrypted_index_watermark: Arc::new(Mutex::new(None)),
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

    /// The curve25519 key of the device that created the session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The keys the creator of the session claimed to own.
    pub fn signing_keys(&self) -> &BTreeMap<DeviceKeyAlgorithm, String> {
        &self.signing_keys
    }

    /// The devices the session passed through before reaching us.
    ///
    /// Empty for sessions we received directly from their creator.
    pub fn forwarding_key_chain(&self) -> &[String] {
        &self.forwarding_curve25519_key_chain
    }

    /// Has the session been imported from an export or a forwarded room key,
    /// as opposed to being received directly as an `m.room_key` event.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Export this session at the first known message index.
    ///
    /// If only a limited part of this session should be exported use
    /// [`InboundGroupSession::export_at_index()`].
    pub async fn export(&self) -> ExportedRoomKey {
        self.export_at_index(self.first_known_index()).await
    }

    /// Export this session at the given message index.
    ///
    /// Indices before the first known one were already rotated out and can't
    /// be exported, the export silently starts at the first known index in
    /// that case.
    pub async fn export_at_index(&self, message_index: u32) -> ExportedRoomKey {
        let message_index = std::cmp::max(self.first_known_index(), message_index);

        let session_key: ExportedSessionKey = self
            .inner
            .lock()
            .await
            .export_at(message_index)
            .expect("can't export an index the session already knows about");

        ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: self.room_id.clone(),
            sender_key: self.sender_key,
            session_id: self.session_id().to_owned(),
            session_key,
            sender_claimed_keys: (*self.signing_keys).clone(),
            forwarding_curve25519_key_chain: (*self.forwarding_curve25519_key_chain).clone(),
        }
    }

    pub(crate) async fn decrypt_helper(
        &self,
        message: &MegolmMessage,
    ) -> Result<DecryptedMessage, DecryptionError> {
        self.inner.lock().await.decrypt(message)
    }

    /// Decrypt an event from a room timeline.
    ///
    /// Returns the decrypted payload and the ratchet index the event was
    /// encrypted at. The index advances strictly monotonically, decrypting
    /// at an index that was already consumed fails with
    /// [`MegolmError::ReplayedMessage`].
    pub async fn decrypt(&self, event: &EncryptedRoomEvent) -> MegolmResult<(Value, u32)> {
        let content = match &event.content {
            crate::types::events::encrypted::RoomEncryptedEventContent::MegolmV1AesSha2(c) => c,
            _ => return Err(EventError::UnsupportedAlgorithm.into()),
        };

        let decrypted = self.decrypt_helper(&content.ciphertext).await?;
        let message_index = decrypted.message_index;

        let mut watermark = self.decrypted_index_watermark.lock().await;

        if watermark.is_some_and(|w| message_index <= w) {
            return Err(MegolmError::ReplayedMessage {
                session_id: self.session_id().to_owned(),
                index: message_index,
            });
        }

        let plaintext = String::from_utf8_lossy(&decrypted.plaintext);
        let mut decrypted_value = serde_json::from_str::<Value>(&plaintext)?;
        let decrypted_object =
            decrypted_value.as_object_mut().ok_or(EventError::NotAnObject)?;

        // Stop a session that leaked from one room being used to forge
        // history in another.
        let payload_room: Option<OwnedRoomId> = decrypted_object
            .get("room_id")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        if payload_room.as_deref() != Some(&*event.room_id) {
            return Err(EventError::BadRoom(event.room_id.clone(), payload_room).into());
        }

        decrypted_object.insert("sender".to_owned(), event.sender.to_string().into());
        if let Some(event_id) = &event.event_id {
            decrypted_object.insert("event_id".to_owned(), event_id.clone().into());
        }

        *watermark = Some(message_index);

        Ok((decrypted_value, message_index))
    }

    /// Convert the session into a storable snapshot.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        let pickle = self.inner.lock().await.pickle();

        PickledInboundGroupSession {
            pickle,
            sender_key: self.sender_key,
            signing_keys: (*self.signing_keys).clone(),
            room_id: self.room_id.clone(),
            forwarding_curve25519_key_chain: (*self.forwarding_curve25519_key_chain).clone(),
            imported: self.imported,
            decrypted_index_watermark: *self.decrypted_index_watermark.lock().await,
        }
    }

    /// Restore a session from a previously stored snapshot.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Result<Self, PickleError> {
        let session: InnerSession = pickle.pickle.into();
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key: pickle.sender_key,
            signing_keys: Arc::new(pickle.signing_keys),
            room_id: pickle.room_id,
            forwarding_curve25519_key_chain: Arc::new(pickle.forwarding_curve25519_key_chain),
            imported: pickle.imported,
            decrypted_index_watermark: Arc::new(Mutex::new(pickle.decrypted_index_watermark)),
        })
    }
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id())
            .field("room_id", &self.room_id)
            .finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A storable snapshot of an [`InboundGroupSession`].
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledInboundGroupSession {
    /// The pickled ratchet state of the session.
    pub pickle: InboundGroupSessionPickle,
    /// The curve25519 key of the device that created the session.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The keys the creator of the session claimed to own.
    pub signing_keys: BTreeMap<DeviceKeyAlgorithm, String>,
    /// The room the session is used in.
    pub room_id: OwnedRoomId,
    /// The devices the session passed through before reaching us.
    pub forwarding_curve25519_key_chain: Vec<String>,
    /// Whether the session was imported rather than received directly.
    pub imported: bool,
    /// The highest message index that was already decrypted.
    #[serde(default)]
    pub decrypted_index_watermark: Option<u32>,
}
