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
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use ruma_common::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedUserId, RoomId,
    SecondsSinceUnixEpoch, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{trace, warn};
use vodozemac::{
    olm::{Account as InnerAccount, AccountPickle, PreKeyMessage, SessionConfig},
    Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature, PickleError,
};

use super::{
    utility::canonical_json, EncryptionSettings, InboundGroupSession, OutboundGroupSession,
    Session,
};
use crate::{
    directory::KeysUploadResponse,
    error::{SessionCreationError, SignatureError},
    identities::DeviceInfo,
    types::{DeviceKeys, EventEncryptionAlgorithm, SignedKey},
};

/// The public identity key pair of an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityKeys {
    /// The ed25519 key, used for signing.
    pub ed25519: Ed25519PublicKey,
    /// The curve25519 key, used to establish pairwise sessions.
    pub curve25519: Curve25519PublicKey,
}

/// Our own device's cryptographic identity.
///
/// The account owns the long-term identity keys, the pool of one-time keys,
/// and is the factory for every kind of session this crate deals with.
#[derive(Clone)]
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    inner: Arc<Mutex<InnerAccount>>,
    identity_keys: Arc<IdentityKeys>,
    shared: Arc<AtomicBool>,
    uploaded_key_count: Arc<AtomicU64>,
}

/// The result of a successful pairwise session creation from a pre-key
/// message.
pub struct InboundCreationResult {
    /// The newly created session.
    pub session: Session,
    /// The plaintext of the pre-key message that established the session.
    pub plaintext: String,
}

impl fmt::Debug for InboundCreationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundCreationResult").field("session", &self.session).finish()
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .field("shared", &self.shared())
            .finish()
    }
}

impl Account {
    /// Create a fresh account with new identity keys.
    pub fn new(user_id: OwnedUserId, device_id: OwnedDeviceId) -> Self {
        let account = InnerAccount::new();
        let identity_keys = IdentityKeys {
            ed25519: account.ed25519_key(),
            curve25519: account.curve25519_key(),
        };

        Self {
            user_id,
            device_id,
            inner: Arc::new(Mutex::new(account)),
            identity_keys: Arc::new(identity_keys),
            shared: Arc::new(AtomicBool::new(false)),
            uploaded_key_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The id of the user the account belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The id of the device the account belongs to.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public identity keys of the account.
    pub fn identity_keys(&self) -> &IdentityKeys {
        &self.identity_keys
    }

    /// Have the account's device keys been uploaded to the key directory.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    /// Mark the account's device keys as uploaded.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::SeqCst)
    }

    /// The number of one-time keys the key directory is currently holding
    /// for us.
    pub fn uploaded_key_count(&self) -> u64 {
        self.uploaded_key_count.load(Ordering::SeqCst)
    }

    pub(crate) fn update_uploaded_key_count(&self, count: u64) {
        self.uploaded_key_count.store(count, Ordering::SeqCst);
    }

    /// Do the device keys or a fresh batch of one-time keys need to be
    /// uploaded.
    pub async fn should_upload_keys(&self) -> bool {
        if !self.shared() {
            return true;
        }

        // The server replenishes up to half of the maximum, upload when the
        // pool dips below a third of that.
        let max = self.max_one_time_keys().await as u64;
        self.uploaded_key_count() < max / 3
    }

    /// The maximum number of one-time keys the account can hold.
    pub async fn max_one_time_keys(&self) -> usize {
        self.inner.lock().await.max_number_of_one_time_keys()
    }

    pub(crate) async fn generate_one_time_keys_helper(&self, count: usize) {
        self.inner.lock().await.generate_one_time_keys(count);
    }

    /// Generate as many one-time keys as are needed to fill our published
    /// pool back up, returning how many were created.
    pub async fn generate_one_time_keys_if_needed(&self) -> u64 {
        let max = self.max_one_time_keys().await as u64;
        let target = max / 2;
        let uploaded = self.uploaded_key_count();

        let count = target.saturating_sub(uploaded);

        if count > 0 {
            self.generate_one_time_keys_helper(count as usize).await;
        }

        count
    }

    pub(crate) async fn one_time_keys(
        &self,
    ) -> std::collections::HashMap<vodozemac::KeyId, Curve25519PublicKey> {
        self.inner.lock().await.one_time_keys()
    }

    /// Mark the currently generated one-time keys as published.
    ///
    /// Keys that were marked as published can't be uploaded a second time.
    pub async fn mark_keys_as_published(&self) {
        self.inner.lock().await.mark_keys_as_published();
    }

    /// Sign the given message with the account's ed25519 key.
    pub async fn sign(&self, message: &str) -> Ed25519Signature {
        self.inner.lock().await.sign(message)
    }

    /// Sign the canonical form of the given JSON object.
    pub async fn sign_json(&self, json: Value) -> Result<Ed25519Signature, SignatureError> {
        let canonical = canonical_json(json)?;
        Ok(self.sign(&canonical).await)
    }

    /// The signed device keys upload payload for this account.
    pub async fn device_keys(&self) -> DeviceKeys {
        let mut device_keys = self.unsigned_device_keys();
        let json = serde_json::to_value(&device_keys)
            .expect("device keys can always be serialized");

        let signature = self
            .sign_json(json)
            .await
            .expect("device keys are a JSON object");

        device_keys
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
                signature.to_base64(),
            );

        device_keys
    }

    fn unsigned_device_keys(&self) -> DeviceKeys {
        let keys = BTreeMap::from([
            (
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Curve25519, &self.device_id),
                self.identity_keys.curve25519.to_base64(),
            ),
            (
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
                self.identity_keys.ed25519.to_base64(),
            ),
        ]);

        DeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            algorithms: vec![
                EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
                EventEncryptionAlgorithm::MegolmV1AesSha2,
            ],
            keys,
            signatures: Default::default(),
            unsigned: Default::default(),
        }
    }

    /// The signed one-time keys that haven't been published yet, keyed the
    /// way the key directory expects them.
    pub async fn signed_one_time_keys(&self) -> BTreeMap<String, SignedKey> {
        let mut signed_keys = BTreeMap::new();

        for (key_id, key) in self.one_time_keys().await {
            let json = json!({ "key": key.to_base64() });
            let signature = self
                .sign_json(json)
                .await
                .expect("one-time keys are a JSON object");

            let mut signed_key = SignedKey::new(key, Default::default());
            signed_key
                .signatures
                .entry(self.user_id.clone())
                .or_default()
                .insert(
                    DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
                    signature.to_base64(),
                );

            signed_keys.insert(format!("signed_curve25519:{}", key_id.to_base64()), signed_key);
        }

        signed_keys
    }

    /// Handle the response of a key upload request.
    ///
    /// Marks the uploaded keys as published and records the new server-side
    /// one-time key count.
    pub async fn receive_keys_upload_response(&self, response: &KeysUploadResponse) {
        if !self.shared() {
            trace!("Marking account as shared");
        }
        self.mark_as_shared();

        self.mark_keys_as_published().await;

        let count = response
            .one_time_key_counts
            .get("signed_curve25519")
            .copied()
            .unwrap_or_default();
        self.update_uploaded_key_count(count);
    }

    pub(crate) async fn create_outbound_session_helper(
        &self,
        identity_key: Curve25519PublicKey,
        one_time_key: Curve25519PublicKey,
    ) -> Session {
        let session = self.inner.lock().await.create_outbound_session(
            SessionConfig::version_1(),
            identity_key,
            one_time_key,
        );

        let now = SecondsSinceUnixEpoch::now();
        let session_id = session.session_id();

        Session {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            our_identity_keys: self.identity_keys.clone(),
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: identity_key,
            creation_time: now,
            last_use_time: now,
        }
    }

    /// Create a new pairwise session with the given device using a one-time
    /// key we claimed from the key directory.
    ///
    /// The one-time key needs to carry a valid signature made by the device
    /// that advertised it.
    pub async fn create_outbound_session(
        &self,
        device: &DeviceInfo,
        one_time_key: &SignedKey,
    ) -> Result<Session, SessionCreationError> {
        device.verify_one_time_key(one_time_key).map_err(|e| {
            warn!(
                user_id = device.user_id().as_str(),
                device_id = device.device_id().as_str(),
                error = ?e,
                "Failed to verify the signature of a claimed one-time key",
            );

            SessionCreationError::InvalidSignature(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        let identity_key = device.identity_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingCurveKey(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        Ok(self.create_outbound_session_helper(identity_key, one_time_key.key).await)
    }

    /// Create a new pairwise session from a pre-key message that was sent to
    /// us.
    ///
    /// This consumes the one-time key the message was encrypted with, the
    /// account needs to be saved afterwards.
    pub async fn create_inbound_session(
        &self,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult, SessionCreationError> {
        trace!("Creating a new Olm session from a pre-key message");

        let result = self
            .inner
            .lock()
            .await
            .create_inbound_session(their_identity_key, message)?;
        let now = SecondsSinceUnixEpoch::now();
        let session_id = result.session.session_id();

        let session = Session {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            our_identity_keys: self.identity_keys.clone(),
            inner: Arc::new(Mutex::new(result.session)),
            session_id: session_id.into(),
            sender_key: their_identity_key,
            creation_time: now,
            last_use_time: now,
        };

        let plaintext = String::from_utf8_lossy(&result.plaintext).to_string();

        Ok(InboundCreationResult { session, plaintext })
    }

    /// Create a new outbound group session for the given room, together with
    /// the matching inbound session for our own timeline.
    pub async fn create_group_session_pair(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> Result<(OutboundGroupSession, InboundGroupSession), SessionCreationError> {
        trace!(room_id = room_id.as_str(), "Creating a new Megolm session pair");

        let outbound = OutboundGroupSession::new(
            self.device_id.clone(),
            self.identity_keys.clone(),
            room_id,
            settings,
        )?;

        let inbound = InboundGroupSession::new(
            self.identity_keys.curve25519,
            self.identity_keys.ed25519,
            room_id,
            &outbound.session_key().await,
        )?;

        Ok((outbound, inbound))
    }

    /// Convert the account into a storable snapshot.
    pub async fn pickle(&self) -> PickledAccount {
        let pickle = self.inner.lock().await.pickle();

        PickledAccount {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            pickle,
            shared: self.shared(),
            uploaded_key_count: self.uploaded_key_count(),
        }
    }

    /// Restore an account from a previously stored snapshot.
    pub fn from_pickle(pickle: PickledAccount) -> Result<Self, PickleError> {
        let account: InnerAccount = pickle.pickle.into();
        let identity_keys = IdentityKeys {
            ed25519: account.ed25519_key(),
            curve25519: account.curve25519_key(),
        };

        Ok(Self {
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            inner: Arc::new(Mutex::new(account)),
            identity_keys: Arc::new(identity_keys),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
            uploaded_key_count: Arc::new(AtomicU64::new(pickle.uploaded_key_count)),
        })
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.user_id() == other.user_id()
            && self.device_id() == other.device_id()
            && self.identity_keys() == other.identity_keys()
    }
}

/// A storable snapshot of an [`Account`].
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledAccount {
    /// The id of the user the account belongs to.
    pub user_id: OwnedUserId,
    /// The id of the device the account belongs to.
    pub device_id: OwnedDeviceId,
    /// The pickled ratchet state of the account.
    pub pickle: AccountPickle,
    /// Whether the account's device keys have been uploaded.
    pub shared: bool,
    /// The number of one-time keys the directory holds for us.
    pub uploaded_key_count: u64,
}
