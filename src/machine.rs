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

use std::sync::Arc;

use ruma_common::{DeviceId, OwnedDeviceId, OwnedUserId, RoomId, UserId};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vodozemac::{
    olm::OlmMessage, Curve25519PublicKey, Ed25519PublicKey,
};

use crate::{
    directory::KeyDirectory,
    error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    identities::{DeviceInfo, UserDevices, VerificationState},
    key_request::KeyRequestMachine,
    olm::{
        Account, EncryptionSettings, ExportedRoomKey, IdentityKeys, InboundGroupSession, Session,
    },
    requests::{OutgoingRequest, ToDeviceRequest},
    session_manager::{GroupSessionManager, SessionManager},
    store::{CryptoStore, CryptoStoreError, MemoryStore, Store},
    types::events::{
        encrypted::{
            parse_olm_message, EncryptedRoomEvent, EncryptedToDeviceEvent,
            RoomEncryptedEventContent, ToDeviceEncryptedEventContent,
        },
        olm_v1::AnyDecryptedOlmContent,
        room_key::RoomKeyContent,
        room_key_request::RoomKeyRequestContent,
        ToDeviceEvent,
    },
};

/// The result of a successful Olm decryption of a to-device event.
#[derive(Debug)]
pub struct OlmDecryptionResult {
    /// The `type` of the decrypted event.
    pub event_type: String,
    /// The full clear payload of the decrypted event.
    pub payload: Value,
    /// The decrypted event content, dispatched by its type.
    pub event: AnyDecryptedOlmContent,
    /// The curve25519 key of the device that encrypted the event.
    pub sender_key: Curve25519PublicKey,
    /// The ed25519 key the sender claims to own.
    ///
    /// The claim is only proven once the key is checked against a
    /// cross-signed device record.
    pub claimed_ed25519_key: Ed25519PublicKey,
}

/// The result of a successful Megolm decryption of a room event.
#[derive(Debug)]
pub struct RoomEventDecryptionResult {
    /// The full clear payload of the decrypted event.
    pub event: Value,
    /// The ratchet index the event was encrypted at.
    pub message_index: u32,
    /// The curve25519 key of the device that created the group session.
    pub sender_key: Curve25519PublicKey,
    /// The ed25519 key the session creator claims to own.
    pub claimed_ed25519_key: Option<Ed25519PublicKey>,
    /// The devices the group session was forwarded through before it
    /// reached us, empty for directly received sessions.
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// The state machine tying the end-to-end encryption pieces together.
///
/// One machine represents one device of one user. Network traffic flows
/// through the injected [`KeyDirectory`] for key material and through the
/// outgoing to-device request queue for everything else.
#[derive(Clone, Debug)]
pub struct CryptoMachine {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    account: Account,
    store: Store,
    session_manager: SessionManager,
    group_session_manager: GroupSessionManager,
    key_request_machine: KeyRequestMachine,
}

impl CryptoMachine {
    /// Create a new machine backed by an in-memory store.
    ///
    /// All the session and device state is lost when the machine is
    /// dropped, use [`CryptoMachine::with_store()`] to keep it.
    pub fn new(user_id: &UserId, device_id: &DeviceId, directory: Arc<dyn KeyDirectory>) -> Self {
        let account = Account::new(user_id.to_owned(), device_id.to_owned());
        let store = Store::new(Arc::new(MemoryStore::new()));

        Self::new_helper(account, store, directory)
    }

    /// Create a new machine backed by the given store.
    ///
    /// A previously stored account is picked up, otherwise a fresh one is
    /// created and stored.
    pub async fn with_store(
        user_id: &UserId,
        device_id: &DeviceId,
        directory: Arc<dyn KeyDirectory>,
        store: Arc<dyn CryptoStore>,
    ) -> Result<Self, CryptoStoreError> {
        let store = Store::new(store);

        let account = match store.load_account().await? {
            Some(account) => {
                debug!("Restored a previously stored account");
                account
            }
            None => {
                let account = Account::new(user_id.to_owned(), device_id.to_owned());
                store.save_account(account.clone()).await?;
                account
            }
        };

        Ok(Self::new_helper(account, store, directory))
    }

    fn new_helper(account: Account, store: Store, directory: Arc<dyn KeyDirectory>) -> Self {
        let session_manager =
            SessionManager::new(account.clone(), store.clone(), directory);
        let group_session_manager = GroupSessionManager::new(account.clone(), store.clone());
        let key_request_machine = KeyRequestMachine::new(
            account.user_id().to_owned(),
            account.device_id().to_owned(),
            store.clone(),
            group_session_manager.outbound_sessions_handle(),
        );

        Self {
            user_id: account.user_id().to_owned(),
            device_id: account.device_id().to_owned(),
            account,
            store,
            session_manager,
            group_session_manager,
            key_request_machine,
        }
    }

    /// The id of the user the machine belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The id of the device the machine belongs to.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public identity keys of our own device.
    pub fn identity_keys(&self) -> &IdentityKeys {
        self.account.identity_keys()
    }

    pub(crate) fn account(&self) -> &Account {
        &self.account
    }

    /// Does the key directory need fresh key material from us.
    pub async fn should_upload_keys(&self) -> bool {
        self.session_manager.should_upload_keys().await
    }

    /// Upload our device keys and a fresh batch of one-time keys to the key
    /// directory.
    pub async fn upload_keys(&self) -> OlmResult<()> {
        self.session_manager.upload_keys().await
    }

    /// Make sure we share a pairwise session with every eligible device of
    /// the given users.
    pub async fn ensure_sessions_with(
        &self,
        users: impl IntoIterator<Item = &UserId>,
    ) -> OlmResult<()> {
        self.session_manager.ensure_sessions_with(users).await
    }

    /// Get the stored device record of the given device.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceInfo>, CryptoStoreError> {
        self.store.get_device(user_id, device_id).await
    }

    /// Get a snapshot of the stored device records of the given user.
    pub async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<UserDevices, CryptoStoreError> {
        self.store.get_user_devices(user_id).await
    }

    /// Set the local verification state of a device.
    ///
    /// Returns false if the device isn't known.
    pub async fn set_device_verification_state(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        state: VerificationState,
    ) -> Result<bool, CryptoStoreError> {
        match self.store.get_device(user_id, device_id).await? {
            Some(device) => {
                device.set_verification_state(state);
                self.store.save_devices(&[device]).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Should a new group session be created and shared before the next
    /// message in the given room is encrypted.
    pub fn should_share_group_session(&self, room_id: &RoomId) -> bool {
        self.group_session_manager.should_share_group_session(room_id)
    }

    /// Flag the room's outbound group session for rotation, e.g. because
    /// the room membership changed.
    pub fn invalidate_group_session(&self, room_id: &RoomId) -> bool {
        self.group_session_manager.invalidate_group_session(room_id)
    }

    /// Create and distribute the room key for the given room.
    ///
    /// Pairwise sessions with all the recipient devices are established
    /// first, then the key is encrypted per device. The returned requests
    /// need to be sent out and acknowledged with
    /// [`CryptoMachine::mark_request_as_sent()`].
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: impl IntoIterator<Item = &UserId>,
        settings: EncryptionSettings,
    ) -> OlmResult<Vec<Arc<ToDeviceRequest>>> {
        let users: Vec<&UserId> = users.into_iter().collect();

        self.session_manager.ensure_sessions_with(users.iter().copied()).await?;
        self.group_session_manager
            .share_room_key(room_id, users.into_iter(), settings)
            .await
    }

    /// Encrypt the given event content for the given room.
    ///
    /// If no usable group session exists, or the active one hit a rotation
    /// condition, a new one is created and shared with the devices of the
    /// given users first. Any returned to-device requests carry the room
    /// key and must be sent out before the encrypted event itself.
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        users: impl IntoIterator<Item = &UserId>,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<(RoomEncryptedEventContent, Vec<Arc<ToDeviceRequest>>)> {
        let requests = if self.should_share_group_session(room_id) {
            self.share_room_key(room_id, users, EncryptionSettings::default())
                .await
                .map_err(|e| MegolmError::KeyShare(Box::new(e)))?
        } else {
            Vec::new()
        };

        let content =
            self.group_session_manager.encrypt(room_id, event_type, content).await?;

        Ok((content, requests))
    }

    /// Mark an outgoing request as sent.
    pub async fn mark_request_as_sent(&self, request_id: &Uuid) -> Result<(), CryptoStoreError> {
        self.group_session_manager.mark_request_as_sent(request_id);
        self.key_request_machine.mark_outgoing_request_as_sent(request_id).await
    }

    /// The queued up to-device requests that need to be sent out.
    pub fn outgoing_requests(&self) -> Vec<OutgoingRequest> {
        self.key_request_machine.outgoing_to_device_requests()
    }

    /// Receive an `m.room_key_request` to-device event.
    pub fn receive_room_key_request(&self, event: &ToDeviceEvent<RoomKeyRequestContent>) {
        self.key_request_machine.receive_incoming_key_request(event)
    }

    /// Answer or drop all the queued up room key requests.
    pub async fn collect_incoming_key_requests(&self) -> OlmResult<()> {
        self.key_request_machine.collect_incoming_key_requests().await
    }

    /// Try to decrypt an Olm message with the sessions we share with the
    /// given sender key.
    ///
    /// Returns the plaintext and the session that fit, `None` if no session
    /// matched the message.
    async fn try_decrypt_olm_message(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<Option<(Session, String)>> {
        let sessions = match self.store.get_sessions(&sender_key.to_base64()).await? {
            Some(s) => s,
            None => return Ok(None),
        };

        let mut sessions = sessions.lock().await;

        for session in sessions.iter_mut() {
            // If this is a pre-key message, check if it was encrypted for
            // our session. If it wasn't, decryption will fail, so no need to
            // try.
            if let OlmMessage::PreKey(m) = &message {
                if m.session_id() != session.session_id() {
                    continue;
                }

                return match session.decrypt(message).await {
                    Ok(p) => Ok(Some((session.clone(), p))),
                    Err(e) => {
                        // The message was intended for this session, yet it
                        // failed to decrypt. There's no point in trying
                        // other sessions, and creating a new one would use
                        // up another one-time key for nothing.
                        warn!(
                            sender = sender.as_str(),
                            session_id = session.session_id(),
                            error = ?e,
                            "Failed to decrypt a pre-key message with the \
                             corresponding session",
                        );

                        Err(OlmError::BadEncryptedMessage(
                            sender.to_owned(),
                            sender_key,
                            "a pre-key message for an existing session failed to decrypt",
                        ))
                    }
                };
            }

            if let Ok(p) = session.decrypt(message).await {
                return Ok(Some((session.clone(), p)));
            }

            // Decryption failures here are expected, we don't know which
            // session the other side used.
        }

        Ok(None)
    }

    /// Decrypt an Olm message, creating a new session from it if necessary.
    async fn decrypt_olm_message(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<String> {
        if let Some((session, plaintext)) =
            self.try_decrypt_olm_message(sender, sender_key, message).await?
        {
            // Decryption advanced the ratchet, persist the new state.
            self.store.save_sessions(&[session]).await?;
            return Ok(plaintext);
        }

        // No existing session decrypted the message, a pre-key message can
        // still establish a new session.
        let prekey_message = match message {
            OlmMessage::PreKey(m) => m,
            OlmMessage::Normal(_) => {
                warn!(
                    sender = sender.as_str(),
                    "Failed to decrypt a non-pre-key message with all \
                     available sessions",
                );

                return Err(OlmError::BadEncryptedMessage(
                    sender.to_owned(),
                    sender_key,
                    "no matching session",
                ));
            }
        };

        let result = match self.account.create_inbound_session(sender_key, prekey_message).await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    sender = sender.as_str(),
                    error = ?e,
                    "Failed to create a new Olm session from a pre-key message",
                );

                return Err(OlmError::BadEncryptedMessage(
                    sender.to_owned(),
                    sender_key,
                    "the pre-key message didn't establish a session",
                ));
            }
        };

        // The one-time key the message used up is gone, the account state
        // needs to hit the store before anything else does.
        self.store.save_account(self.account.clone()).await?;
        self.store.save_sessions(&[result.session]).await?;

        Ok(result.plaintext)
    }

    /// Parse a decrypted Olm payload and run the full set of checks
    /// protecting against relayed, redirected, and mis-attributed messages.
    ///
    /// The checks run in a fixed order and the first violation wins, every
    /// check runs even when a transport-level check looks redundant.
    fn parse_decrypted_payload(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        plaintext: &str,
        expected_room: Option<&RoomId>,
    ) -> OlmResult<OlmDecryptionResult> {
        let payload: Value = serde_json::from_str(plaintext)?;

        if !payload.is_object() {
            return Err(EventError::NotAnObject.into());
        }

        let recipient = payload
            .get("recipient")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingProperty("recipient".to_owned()))?;

        if recipient != self.user_id.as_str() {
            return Err(EventError::BadRecipient(
                self.user_id.clone(),
                recipient.to_owned().try_into().map_err(|_| EventError::MalformedMessage)?,
            )
            .into());
        }

        let recipient_key = payload
            .get("recipient_keys")
            .and_then(|k| k.get("ed25519"))
            .and_then(Value::as_str)
            .ok_or(EventError::MissingProperty("recipient_keys".to_owned()))?;

        if recipient_key != self.account.identity_keys().ed25519.to_base64() {
            return Err(EventError::BadRecipientKey(
                Box::new(self.account.identity_keys().ed25519),
                recipient_key.to_owned(),
            )
            .into());
        }

        let payload_sender = payload
            .get("sender")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingProperty("sender".to_owned()))?;

        if payload_sender != sender.as_str() {
            return Err(EventError::ForwardedMessageMismatch(
                sender.to_owned(),
                payload_sender.to_owned().try_into().map_err(|_| EventError::MalformedMessage)?,
            )
            .into());
        }

        if let Some(expected_room) = expected_room {
            let payload_room = payload
                .get("room_id")
                .and_then(Value::as_str)
                .and_then(|r| r.to_owned().try_into().ok());

            if payload_room.as_deref() != Some(expected_room) {
                return Err(EventError::BadRoom(expected_room.to_owned(), payload_room).into());
            }
        }

        let claimed_ed25519_key = payload
            .get("keys")
            .and_then(|k| k.get("ed25519"))
            .and_then(Value::as_str)
            .ok_or(EventError::MissingProperty("keys".to_owned()))?;
        let claimed_ed25519_key = Ed25519PublicKey::from_base64(claimed_ed25519_key)
            .map_err(|_| EventError::MalformedMessage)?;

        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingProperty("type".to_owned()))?
            .to_owned();
        let content = payload
            .get("content")
            .cloned()
            .ok_or(EventError::MissingProperty("content".to_owned()))?;

        let event = AnyDecryptedOlmContent::from_parts(&event_type, content)?;

        Ok(OlmDecryptionResult {
            event_type,
            payload,
            event,
            sender_key,
            claimed_ed25519_key,
        })
    }

    /// Create an inbound group session from a decrypted `m.room_key` event
    /// and add it to our crypto store.
    async fn add_room_key(
        &self,
        sender_key: Curve25519PublicKey,
        claimed_ed25519_key: Ed25519PublicKey,
        content: &RoomKeyContent,
    ) -> OlmResult<Option<InboundGroupSession>> {
        match content {
            RoomKeyContent::MegolmV1AesSha2(content) => {
                let session = InboundGroupSession::from_room_key_content(
                    sender_key,
                    claimed_ed25519_key,
                    content,
                )?;

                info!(
                    session_id = session.session_id(),
                    room_id = session.room_id().as_str(),
                    "Received a new Megolm room key",
                );

                self.store.save_inbound_group_sessions(&[session.clone()]).await?;

                Ok(Some(session))
            }
            RoomKeyContent::Unknown(content) => {
                warn!(
                    algorithm = content.algorithm.as_str(),
                    "Received a room key with an unsupported algorithm",
                );
                Ok(None)
            }
        }
    }

    /// Handle the side effects of a freshly decrypted to-device event, e.g.
    /// fetch Megolm sessions out of it.
    async fn handle_decrypted_to_device_event(
        &self,
        sender: &OwnedUserId,
        result: &OlmDecryptionResult,
    ) -> OlmResult<()> {
        match &result.event {
            AnyDecryptedOlmContent::RoomKey(content) => {
                self.add_room_key(result.sender_key, result.claimed_ed25519_key, content)
                    .await?;
            }
            AnyDecryptedOlmContent::ForwardedRoomKey(content) => {
                self.key_request_machine
                    .receive_forwarded_room_key(result.sender_key, sender, content)
                    .await?;
            }
            AnyDecryptedOlmContent::Dummy(_) => {
                debug!(sender = sender.as_str(), "Received an m.dummy event");
            }
            AnyDecryptedOlmContent::Custom { event_type, .. } => {
                debug!(
                    sender = sender.as_str(),
                    event_type = event_type.as_str(),
                    "Received a decrypted to-device event of an unhandled type",
                );
            }
        }

        Ok(())
    }

    /// Decrypt a to-device event.
    ///
    /// Returns the decrypted payload together with the keys of the sending
    /// device, or an error telling why the event must not be trusted.
    pub async fn decrypt_to_device_event(
        &self,
        event: &EncryptedToDeviceEvent,
    ) -> OlmResult<OlmDecryptionResult> {
        let content = match &event.content {
            ToDeviceEncryptedEventContent::OlmV1Curve25519AesSha2(c) => c,
            ToDeviceEncryptedEventContent::Unknown(_) => {
                warn!("Error decrypting a to-device event, unsupported encryption algorithm");
                return Err(EventError::UnsupportedAlgorithm.into());
            }
        };

        let sender_key = content.sender_key.ok_or(EventError::MissingSenderKey)?;
        let ciphertext = content.ciphertext.as_ref().ok_or(EventError::MissingCiphertext)?;

        let own_key = self.account.identity_keys().curve25519.to_base64();
        let own_ciphertext =
            ciphertext.get(&own_key).ok_or(EventError::NotInRecipients)?;

        let message = parse_olm_message(own_ciphertext)?;

        let plaintext = self.decrypt_olm_message(&event.sender, sender_key, &message).await?;
        let result =
            self.parse_decrypted_payload(&event.sender, sender_key, &plaintext, None)?;

        debug!(
            sender = event.sender.as_str(),
            event_type = result.event_type.as_str(),
            "Successfully decrypted a to-device event",
        );

        self.handle_decrypted_to_device_event(&event.sender, &result).await?;

        Ok(result)
    }

    /// Decrypt an encrypted room event.
    ///
    /// A missing inbound group session automatically queues a room key
    /// request, the event itself still fails to decrypt and should be
    /// retried once the key arrives.
    pub async fn decrypt_room_event(
        &self,
        event: &EncryptedRoomEvent,
    ) -> MegolmResult<RoomEventDecryptionResult> {
        let content = match &event.content {
            RoomEncryptedEventContent::MegolmV1AesSha2(c) => c,
            RoomEncryptedEventContent::Unknown(_) => {
                return Err(EventError::UnsupportedAlgorithm.into());
            }
        };

        let session = self
            .store
            .get_inbound_group_session(
                &event.room_id,
                &content.sender_key.to_base64(),
                &content.session_id,
            )
            .await?;

        let session = match session {
            Some(s) => s,
            None => {
                info!(
                    room_id = event.room_id.as_str(),
                    session_id = content.session_id.as_str(),
                    "Missing the room key to decrypt an event, requesting it",
                );

                self.key_request_machine
                    .create_outgoing_key_request(
                        &event.room_id,
                        content.sender_key,
                        &content.session_id,
                    )
                    .await?;

                return Err(MegolmError::UnknownInboundSessionId(
                    content.session_id.clone(),
                ));
            }
        };

        let (decrypted, message_index) = session.decrypt(event).await?;

        // Ratchet state advanced, persist it.
        self.store.save_inbound_group_sessions(&[session.clone()]).await?;

        let claimed_ed25519_key = session
            .signing_keys()
            .get(&ruma_common::DeviceKeyAlgorithm::Ed25519)
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok());

        Ok(RoomEventDecryptionResult {
            event: decrypted,
            message_index,
            sender_key: session.sender_key(),
            claimed_ed25519_key,
            forwarding_curve25519_key_chain: session.forwarding_key_chain().to_vec(),
        })
    }

    /// Export the inbound group sessions the given predicate picks.
    pub async fn export_room_keys(
        &self,
        mut predicate: impl FnMut(&InboundGroupSession) -> bool,
    ) -> Result<Vec<ExportedRoomKey>, CryptoStoreError> {
        let mut exported = Vec::new();

        for session in self.store.get_inbound_group_sessions().await? {
            if predicate(&session) {
                exported.push(session.export().await);
            }
        }

        Ok(exported)
    }

    /// Import previously exported inbound group sessions.
    ///
    /// Sessions we already know at an equal or earlier ratchet index are
    /// skipped. Returns how many sessions were actually imported.
    pub async fn import_room_keys(&self, keys: Vec<ExportedRoomKey>) -> OlmResult<usize> {
        let mut imported = 0;

        for key in keys {
            let session = InboundGroupSession::from_export(&key)?;

            let existing = self
                .store
                .get_inbound_group_session(
                    session.room_id(),
                    &session.sender_key().to_base64(),
                    session.session_id(),
                )
                .await?;

            let better = match &existing {
                Some(old) => session.first_known_index() < old.first_known_index(),
                None => true,
            };

            if better {
                self.store.save_inbound_group_sessions(&[session]).await?;
                imported += 1;
            }
        }

        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{Arc, RwLock as StdRwLock},
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use ruma_common::{device_id, room_id, user_id, OwnedUserId, RoomId};
    use serde_json::{json, Value};

    use super::CryptoMachine;
    use crate::{
        directory::{
            DirectoryError, KeyDirectory, KeysClaimResponse, KeysQueryResponse,
            KeysUploadRequest, KeysUploadResponse,
        },
        error::{EventError, MegolmError, OlmError},
        identities::VerificationState,
        olm::tests::{alice_device_id, alice_id, bob_device_id, bob_id},
        requests::{DeviceIdOrAllDevices, ToDeviceRequest},
        types::{
            events::{
                encrypted::{
                    EncryptedRoomEvent, EncryptedToDeviceEvent, OlmV1Curve25519AesSha2Content,
                    ToDeviceEncryptedEventContent,
                },
                olm_v1::AnyDecryptedOlmContent,
                room_key_request::RoomKeyRequestContent,
                ToDeviceEvent,
            },
            DeviceKeys, SignedKey, UserDeviceMap,
        },
    };

    /// A key directory answering from in-memory fixtures.
    #[derive(Debug, Default)]
    struct TestDirectory {
        device_keys: StdRwLock<UserDeviceMap<DeviceKeys>>,
        one_time_keys: StdRwLock<UserDeviceMap<BTreeMap<String, SignedKey>>>,
        uploaded_key_count: StdRwLock<u64>,
    }

    impl TestDirectory {
        async fn add_machine(&self, machine: &CryptoMachine) {
            let keys = machine.account().device_keys().await;
            self.device_keys.write().unwrap().insert(
                machine.user_id(),
                machine.device_id(),
                keys,
            );
        }

        async fn add_one_time_key(&self, machine: &CryptoMachine) {
            machine.account().generate_one_time_keys_helper(1).await;
            let keys = machine.account().signed_one_time_keys().await;
            machine.account().mark_keys_as_published().await;

            self.one_time_keys.write().unwrap().insert(
                machine.user_id(),
                machine.device_id(),
                keys,
            );
        }
    }

    #[async_trait]
    impl KeyDirectory for TestDirectory {
        async fn download_keys(
            &self,
            users: &[OwnedUserId],
        ) -> Result<KeysQueryResponse, DirectoryError> {
            let known = self.device_keys.read().unwrap();
            let mut device_keys = UserDeviceMap::new();

            for (user_id, device_id, keys) in known.iter() {
                if users.iter().any(|u| u == user_id) {
                    device_keys.insert(user_id, device_id, keys.clone());
                }
            }

            Ok(KeysQueryResponse { device_keys, failures: Default::default() })
        }

        async fn claim_one_time_keys(
            &self,
            one_time_keys: &UserDeviceMap<String>,
        ) -> Result<KeysClaimResponse, DirectoryError> {
            let mut known = self.one_time_keys.write().unwrap();
            let mut claimed = UserDeviceMap::new();

            for (user_id, device_id, _) in one_time_keys.iter() {
                if let Some(keys) = known.remove(user_id, device_id) {
                    claimed.insert(user_id, device_id, keys);
                }
            }

            Ok(KeysClaimResponse { one_time_keys: claimed, failures: Default::default() })
        }

        async fn upload_keys(
            &self,
            request: KeysUploadRequest,
        ) -> Result<KeysUploadResponse, DirectoryError> {
            let mut count = self.uploaded_key_count.write().unwrap();
            *count += request.one_time_keys.len() as u64;

            Ok(KeysUploadResponse {
                one_time_key_counts: BTreeMap::from([("signed_curve25519".to_owned(), *count)]),
            })
        }
    }

    async fn get_machine_pair_with_session() -> (CryptoMachine, CryptoMachine) {
        let alice_directory = Arc::new(TestDirectory::default());
        let bob_directory = Arc::new(TestDirectory::default());

        let alice = CryptoMachine::new(&alice_id(), &alice_device_id(), alice_directory.clone());
        let bob = CryptoMachine::new(&bob_id(), &bob_device_id(), bob_directory.clone());

        alice_directory.add_machine(&bob).await;
        alice_directory.add_one_time_key(&bob).await;
        bob_directory.add_machine(&alice).await;

        alice.ensure_sessions_with([bob.user_id()]).await.unwrap();

        // Bob learns about Alice's device through his own key download.
        bob.ensure_sessions_with([alice.user_id()]).await.unwrap();

        (alice, bob)
    }

    fn to_device_content_for(
        request: &ToDeviceRequest,
        machine: &CryptoMachine,
    ) -> ToDeviceEncryptedEventContent {
        let content = request
            .messages
            .get(machine.user_id())
            .and_then(|m| {
                m.get(&DeviceIdOrAllDevices::DeviceId(machine.device_id().to_owned()))
            })
            .expect("the request carries a message for the device");

        serde_json::from_value(content.clone()).unwrap()
    }

    fn test_payload(alice: &CryptoMachine, bob: &CryptoMachine) -> Value {
        json!({
            "sender": alice.user_id(),
            "sender_device": alice.device_id(),
            "keys": {
                "ed25519": alice.identity_keys().ed25519.to_base64(),
            },
            "recipient": bob.user_id(),
            "recipient_keys": {
                "ed25519": bob.identity_keys().ed25519.to_base64(),
            },
            "type": "m.test.message",
            "content": {
                "body": "crafted by hand",
            },
        })
    }

    /// Encrypt an arbitrary payload with the session Alice shares with Bob,
    /// sidestepping the payload construction of the session itself.
    async fn encrypt_raw_payload(
        alice: &CryptoMachine,
        bob: &CryptoMachine,
        payload: Value,
    ) -> EncryptedToDeviceEvent {
        let sessions = alice
            .store
            .get_sessions(&bob.identity_keys().curve25519.to_base64())
            .await
            .unwrap()
            .unwrap();
        let mut session = sessions.lock().await.first().unwrap().clone();

        let message = session.encrypt_helper(&payload.to_string()).await;
        alice.store.save_sessions(&[session]).await.unwrap();

        let content = OlmV1Curve25519AesSha2Content::new(
            alice.identity_keys().curve25519,
            bob.identity_keys().curve25519,
            &message,
        );

        ToDeviceEvent::new(alice.user_id().to_owned(), content.into())
    }

    async fn get_machine_pair_with_shared_room_key(
        room_id: &RoomId,
    ) -> (CryptoMachine, CryptoMachine) {
        let (alice, bob) = get_machine_pair_with_session().await;

        let requests = alice
            .share_room_key(room_id, [bob.user_id()], Default::default())
            .await
            .unwrap();
        assert_eq!(requests.len(), 1);

        let event = ToDeviceEvent::new(
            alice.user_id().to_owned(),
            to_device_content_for(&requests[0], &bob),
        );

        let result = bob.decrypt_to_device_event(&event).await.unwrap();
        assert_matches!(&result.event, AnyDecryptedOlmContent::RoomKey(_));

        for request in &requests {
            alice.mark_request_as_sent(&request.txn_id).await.unwrap();
        }

        (alice, bob)
    }

    #[tokio::test]
    async fn session_creation_through_the_directory() {
        let (alice, bob) = get_machine_pair_with_session().await;

        let sessions = alice
            .store
            .get_sessions(&bob.identity_keys().curve25519.to_base64())
            .await
            .unwrap()
            .expect("a session with Bob's device was established");

        assert_eq!(sessions.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn key_upload_cycle() {
        let directory = Arc::new(TestDirectory::default());
        let alice = CryptoMachine::new(&alice_id(), &alice_device_id(), directory.clone());

        assert!(alice.should_upload_keys().await);
        alice.upload_keys().await.unwrap();

        assert!(alice.account().shared());
        assert!(!alice.should_upload_keys().await);
        assert_ne!(*directory.uploaded_key_count.read().unwrap(), 0);
    }

    #[tokio::test]
    async fn olm_encryption_round_trip() {
        let (alice, bob) = get_machine_pair_with_session().await;

        let bob_device = alice
            .store
            .get_device_wrapped(bob.user_id(), bob.device_id())
            .await
            .unwrap()
            .unwrap();

        let content = json!({ "body": "a secret for bob" });
        let encrypted = bob_device.encrypt("m.test.message", content.clone()).await.unwrap();
        let event = ToDeviceEvent::new(alice.user_id().to_owned(), encrypted);

        let result = bob.decrypt_to_device_event(&event).await.unwrap();

        assert_eq!(result.event_type, "m.test.message");
        assert_eq!(result.sender_key, alice.identity_keys().curve25519);
        assert_eq!(result.claimed_ed25519_key, alice.identity_keys().ed25519);
        let decrypted_content =
            assert_matches!(result.event, AnyDecryptedOlmContent::Custom { content, .. } => content);
        assert_eq!(decrypted_content, content);

        // The message established an inbound session on Bob's side that is
        // used for the messages that follow.
        let encrypted = bob_device.encrypt("m.test.message", content.clone()).await.unwrap();
        let event = ToDeviceEvent::new(alice.user_id().to_owned(), encrypted);
        bob.decrypt_to_device_event(&event).await.unwrap();
    }

    #[tokio::test]
    async fn replayed_prekey_messages_are_fatal() {
        let (alice, bob) = get_machine_pair_with_session().await;

        let bob_device = alice
            .store
            .get_device_wrapped(bob.user_id(), bob.device_id())
            .await
            .unwrap()
            .unwrap();

        let encrypted = bob_device.encrypt("m.test.message", json!({})).await.unwrap();
        let event = ToDeviceEvent::new(alice.user_id().to_owned(), encrypted);

        bob.decrypt_to_device_event(&event).await.unwrap();

        // The same pre-key message matches the now existing session but
        // can't be decrypted again, trying other sessions would be useless.
        assert_matches!(
            bob.decrypt_to_device_event(&event).await,
            Err(OlmError::BadEncryptedMessage(..))
        );
    }

    #[tokio::test]
    async fn messages_for_other_devices_are_rejected() {
        let (alice, bob) = get_machine_pair_with_session().await;

        let payload = test_payload(&alice, &bob);
        let mut event = encrypt_raw_payload(&alice, &bob, payload).await;

        // Re-key the ciphertext map so our key isn't an entry anymore.
        if let ToDeviceEncryptedEventContent::OlmV1Curve25519AesSha2(c) = &mut event.content {
            let ciphertext = c.ciphertext.take().unwrap();
            c.ciphertext = Some(
                ciphertext
                    .into_values()
                    .map(|v| (alice.identity_keys().curve25519.to_base64(), v))
                    .collect(),
            );
        }

        assert_matches!(
            bob.decrypt_to_device_event(&event).await,
            Err(OlmError::EventError(EventError::NotInRecipients))
        );
    }

    #[tokio::test]
    async fn malformed_message_types_are_rejected() {
        let (alice, bob) = get_machine_pair_with_session().await;

        let payload = test_payload(&alice, &bob);
        let mut event = encrypt_raw_payload(&alice, &bob, payload).await;

        if let ToDeviceEncryptedEventContent::OlmV1Curve25519AesSha2(c) = &mut event.content {
            for entry in c.ciphertext.as_mut().unwrap().values_mut() {
                entry["type"] = "zero".into();
            }
        }

        assert_matches!(
            bob.decrypt_to_device_event(&event).await,
            Err(OlmError::EventError(EventError::MalformedMessage))
        );
    }

    #[tokio::test]
    async fn mismatched_recipients_are_rejected() {
        let (alice, bob) = get_machine_pair_with_session().await;

        let mut payload = test_payload(&alice, &bob);
        payload["recipient"] = "@charlie:example.org".into();

        let event = encrypt_raw_payload(&alice, &bob, payload).await;

        assert_matches!(
            bob.decrypt_to_device_event(&event).await,
            Err(OlmError::EventError(EventError::BadRecipient(..)))
        );
    }

    #[tokio::test]
    async fn mismatched_recipient_keys_are_rejected() {
        let (alice, bob) = get_machine_pair_with_session().await;

        let mut payload = test_payload(&alice, &bob);
        // Alice's own key instead of Bob's, as a relay attack would have it.
        payload["recipient_keys"]["ed25519"] =
            alice.identity_keys().ed25519.to_base64().into();

        let event = encrypt_raw_payload(&alice, &bob, payload).await;

        assert_matches!(
            bob.decrypt_to_device_event(&event).await,
            Err(OlmError::EventError(EventError::BadRecipientKey(..)))
        );
    }

    #[tokio::test]
    async fn mismatched_senders_are_rejected() {
        let (alice, bob) = get_machine_pair_with_session().await;

        let mut payload = test_payload(&alice, &bob);
        payload["sender"] = "@eve:example.org".into();

        let event = encrypt_raw_payload(&alice, &bob, payload).await;

        assert_matches!(
            bob.decrypt_to_device_event(&event).await,
            Err(OlmError::EventError(EventError::ForwardedMessageMismatch(..)))
        );
    }

    #[tokio::test]
    async fn payloads_without_claimed_keys_are_rejected() {
        let (alice, bob) = get_machine_pair_with_session().await;

        let mut payload = test_payload(&alice, &bob);
        payload.as_object_mut().unwrap().remove("keys");

        let event = encrypt_raw_payload(&alice, &bob, payload).await;

        let err = bob.decrypt_to_device_event(&event).await.unwrap_err();
        assert_matches!(
            err,
            OlmError::EventError(EventError::MissingProperty(p)) if p == "keys"
        );
    }

    #[tokio::test]
    async fn megolm_encryption_round_trip() {
        let room_id = room_id!("!test:example.org");
        let (alice, bob) = get_machine_pair_with_shared_room_key(room_id).await;

        let content = json!({ "body": "it's a secret to everybody" });
        let (encrypted, requests) = alice
            .encrypt(room_id, [bob.user_id()], "m.room.message", content.clone())
            .await
            .unwrap();
        assert!(requests.is_empty());

        let event = EncryptedRoomEvent {
            sender: alice.user_id().to_owned(),
            room_id: room_id.to_owned(),
            event_id: Some("$event1".to_owned()),
            content: encrypted,
        };

        let result = bob.decrypt_room_event(&event).await.unwrap();

        assert_eq!(result.event["content"], content);
        assert_eq!(result.event["type"], "m.room.message");
        assert_eq!(result.sender_key, alice.identity_keys().curve25519);
        assert_eq!(result.claimed_ed25519_key, Some(alice.identity_keys().ed25519));
        assert!(result.forwarding_curve25519_key_chain.is_empty());

        // Decrypting the same ciphertext again replays an already consumed
        // ratchet index.
        assert_matches!(
            bob.decrypt_room_event(&event).await,
            Err(MegolmError::ReplayedMessage { .. })
        );
    }

    #[tokio::test]
    async fn group_sessions_reject_cross_room_ciphertexts() {
        let (alice, _) = get_machine_pair_with_session().await;

        let (outbound, inbound) = alice
            .account()
            .create_group_session_pair(room_id!("!right:example.org"), Default::default())
            .await
            .unwrap();

        let content = outbound.encrypt("m.room.message", json!({ "body": "hi" })).await;

        let event = EncryptedRoomEvent {
            sender: alice.user_id().to_owned(),
            room_id: room_id!("!wrong:example.org").to_owned(),
            event_id: None,
            content,
        };

        assert_matches!(
            inbound.decrypt(&event).await,
            Err(MegolmError::EventError(EventError::BadRoom(..)))
        );
    }

    #[tokio::test]
    async fn blocked_devices_never_receive_room_keys() {
        let room_id = room_id!("!test:example.org");
        let second_device = device_id!("BOBSECONDDEVICE");

        let alice_directory = Arc::new(TestDirectory::default());
        let alice = CryptoMachine::new(&alice_id(), &alice_device_id(), alice_directory.clone());

        let bob1 = CryptoMachine::new(&bob_id(), &bob_device_id(), Arc::new(TestDirectory::default()));
        let bob2 = CryptoMachine::new(&bob_id(), second_device, Arc::new(TestDirectory::default()));

        for bob in [&bob1, &bob2] {
            alice_directory.add_machine(bob).await;
            alice_directory.add_one_time_key(bob).await;
        }

        alice.ensure_sessions_with([bob1.user_id()]).await.unwrap();
        assert!(alice
            .set_device_verification_state(
                bob1.user_id(),
                bob1.device_id(),
                VerificationState::Blocked,
            )
            .await
            .unwrap());

        let requests = alice
            .share_room_key(room_id, [bob1.user_id()], Default::default())
            .await
            .unwrap();

        let recipients: Vec<_> = requests
            .iter()
            .flat_map(|r| r.messages.values().flat_map(|m| m.keys()))
            .collect();

        // The unverified device gets the key, the blocked one never does.
        assert_eq!(
            recipients,
            [&DeviceIdOrAllDevices::DeviceId(second_device.to_owned())]
        );
    }

    #[tokio::test]
    async fn partial_claim_failures_leave_other_sessions_alone() {
        let second_device = device_id!("BOBSECONDDEVICE");

        let alice_directory = Arc::new(TestDirectory::default());
        let alice = CryptoMachine::new(&alice_id(), &alice_device_id(), alice_directory.clone());

        let bob1 = CryptoMachine::new(&bob_id(), &bob_device_id(), Arc::new(TestDirectory::default()));
        let bob2 = CryptoMachine::new(&bob_id(), second_device, Arc::new(TestDirectory::default()));

        alice_directory.add_machine(&bob1).await;
        alice_directory.add_machine(&bob2).await;
        // Only the first device has a one-time key to claim.
        alice_directory.add_one_time_key(&bob1).await;

        alice.ensure_sessions_with([bob1.user_id()]).await.unwrap();

        assert!(alice
            .store
            .get_sessions(&bob1.identity_keys().curve25519.to_base64())
            .await
            .unwrap()
            .is_some());
        assert!(alice
            .store
            .get_sessions(&bob2.identity_keys().curve25519.to_base64())
            .await
            .unwrap()
            .is_none());

        // Another attempt with nothing left to claim must not touch the
        // established session.
        alice.ensure_sessions_with([bob1.user_id()]).await.unwrap();
        assert!(alice
            .store
            .get_sessions(&bob1.identity_keys().curve25519.to_base64())
            .await
            .unwrap()
            .is_some());
    }

    async fn gossip_fixture() -> (
        CryptoMachine,
        CryptoMachine,
        EncryptedRoomEvent,
        RoomKeyRequestContent,
    ) {
        let room_id = room_id!("!test:example.org");
        let (alice, bob) = get_machine_pair_with_session().await;

        // Alice shares the room key and sends a message, but the key share
        // never reaches Bob.
        let requests = alice
            .share_room_key(room_id, [bob.user_id()], Default::default())
            .await
            .unwrap();
        for request in &requests {
            alice.mark_request_as_sent(&request.txn_id).await.unwrap();
        }

        let (content, _) = alice
            .encrypt(room_id, [bob.user_id()], "m.room.message", json!({ "body": "lost" }))
            .await
            .unwrap();

        let event = EncryptedRoomEvent {
            sender: alice.user_id().to_owned(),
            room_id: room_id.to_owned(),
            event_id: Some("$lost".to_owned()),
            content,
        };

        // Bob can't decrypt and asks for the key.
        assert_matches!(
            bob.decrypt_room_event(&event).await,
            Err(MegolmError::UnknownInboundSessionId(_))
        );

        let outgoing = bob.outgoing_requests();
        assert_eq!(outgoing.len(), 1);

        let request_content: RoomKeyRequestContent = serde_json::from_value(
            outgoing[0]
                .request
                .messages
                .get(bob.user_id())
                .and_then(|m| m.get(&DeviceIdOrAllDevices::AllDevices))
                .unwrap()
                .clone(),
        )
        .unwrap();

        (alice, bob, event, request_content)
    }

    #[tokio::test]
    async fn key_requests_are_deduplicated() {
        let (_, bob, event, _) = gossip_fixture().await;

        // Failing again doesn't queue a second request for the same key.
        assert_matches!(
            bob.decrypt_room_event(&event).await,
            Err(MegolmError::UnknownInboundSessionId(_))
        );
        assert_eq!(bob.outgoing_requests().len(), 1);
    }

    #[tokio::test]
    async fn room_key_requests_are_served_and_resolved() {
        let (alice, bob, event, request_content) = gossip_fixture().await;

        alice.receive_room_key_request(&ToDeviceEvent::new(
            bob.user_id().to_owned(),
            request_content,
        ));
        alice.collect_incoming_key_requests().await.unwrap();

        let forwards = alice.outgoing_requests();
        assert_eq!(forwards.len(), 1);

        let forward_event = ToDeviceEvent::new(
            alice.user_id().to_owned(),
            to_device_content_for(&forwards[0].request, &bob),
        );

        let result = bob.decrypt_to_device_event(&forward_event).await.unwrap();
        assert_matches!(&result.event, AnyDecryptedOlmContent::ForwardedRoomKey(_));

        // With the key in place the lost message decrypts, and the key
        // remembers where it travelled.
        let decrypted = bob.decrypt_room_event(&event).await.unwrap();
        assert_eq!(decrypted.event["content"]["body"], "lost");
        assert_eq!(
            decrypted.forwarding_curve25519_key_chain,
            [alice.identity_keys().curve25519.to_base64()]
        );

        // The answered request got cancelled on Bob's side.
        let cancellations: Vec<_> = bob
            .outgoing_requests()
            .iter()
            .filter(|r| r.request.event_type == "m.room_key_request")
            .cloned()
            .collect();
        assert_eq!(cancellations.len(), 1);
    }

    #[tokio::test]
    async fn cancellations_swallow_pending_requests() {
        let (alice, bob, _, request_content) = gossip_fixture().await;

        let cancellation = RoomKeyRequestContent::new_cancellation(
            request_content.requesting_device_id.clone(),
            request_content.request_id.clone(),
        );

        alice.receive_room_key_request(&ToDeviceEvent::new(
            bob.user_id().to_owned(),
            request_content,
        ));
        alice.receive_room_key_request(&ToDeviceEvent::new(
            bob.user_id().to_owned(),
            cancellation,
        ));
        alice.collect_incoming_key_requests().await.unwrap();

        assert!(alice.outgoing_requests().is_empty());
    }

    #[tokio::test]
    async fn cancellations_after_sharing_are_a_no_op() {
        let (alice, bob, _, request_content) = gossip_fixture().await;

        alice.receive_room_key_request(&ToDeviceEvent::new(
            bob.user_id().to_owned(),
            request_content.clone(),
        ));
        alice.collect_incoming_key_requests().await.unwrap();
        assert_eq!(alice.outgoing_requests().len(), 1);

        let cancellation = RoomKeyRequestContent::new_cancellation(
            request_content.requesting_device_id.clone(),
            request_content.request_id.clone(),
        );
        alice.receive_room_key_request(&ToDeviceEvent::new(
            bob.user_id().to_owned(),
            cancellation,
        ));
        alice.collect_incoming_key_requests().await.unwrap();

        // The already queued answer stays.
        assert_eq!(alice.outgoing_requests().len(), 1);
    }

    #[tokio::test]
    async fn key_requests_from_unknown_devices_are_refused() {
        let room_id = room_id!("!test:example.org");
        let (alice, bob) = get_machine_pair_with_shared_room_key(room_id).await;

        // Bob asks with a device Alice knows nothing about.
        let request_content = RoomKeyRequestContent::new_request(
            crate::types::events::room_key_request::RequestedKeyInfo::new(
                room_id.to_owned(),
                alice.identity_keys().curve25519,
                alice
                    .store
                    .get_inbound_group_sessions()
                    .await
                    .unwrap()
                    .first()
                    .unwrap()
                    .session_id()
                    .to_owned(),
            ),
            device_id!("GHOSTDEVICE").to_owned(),
            "request1".to_owned(),
        );

        alice.receive_room_key_request(&ToDeviceEvent::new(
            bob.user_id().to_owned(),
            request_content,
        ));
        alice.collect_incoming_key_requests().await.unwrap();

        assert!(alice.outgoing_requests().is_empty());
    }

    #[tokio::test]
    async fn room_key_import_export_cycle() {
        let room_id = room_id!("!test:example.org");
        let (alice, bob) = get_machine_pair_with_shared_room_key(room_id).await;

        let exported = bob.export_room_keys(|s| s.room_id() == room_id).await.unwrap();
        assert_eq!(exported.len(), 1);

        // Re-importing the same sessions changes nothing.
        assert_eq!(bob.import_room_keys(exported).await.unwrap(), 0);

        let charlie = CryptoMachine::new(
            user_id!("@charlie:example.org"),
            device_id!("CHARLIEDEVICE"),
            Arc::new(TestDirectory::default()),
        );

        let exported = bob.export_room_keys(|s| s.room_id() == room_id).await.unwrap();
        assert_eq!(charlie.import_room_keys(exported).await.unwrap(), 1);

        let (content, _) = alice
            .encrypt(room_id, [bob.user_id()], "m.room.message", json!({ "body": "hello" }))
            .await
            .unwrap();
        let event = EncryptedRoomEvent {
            sender: alice.user_id().to_owned(),
            room_id: room_id.to_owned(),
            event_id: None,
            content,
        };

        charlie.decrypt_room_event(&event).await.unwrap();
    }
}
