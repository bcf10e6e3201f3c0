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

use std::{fmt, sync::Arc};

use ruma_common::{OwnedDeviceId, OwnedUserId, SecondsSinceUnixEpoch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::trace;
use vodozemac::{
    olm::{DecryptionError, OlmMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey,
};

use super::IdentityKeys;
use crate::{
    error::{EventError, OlmResult},
    identities::DeviceInfo,
    types::events::encrypted::{OlmV1Curve25519AesSha2Content, ToDeviceEncryptedEventContent},
};

/// A pairwise cryptographic session with another device.
///
/// Multiple sessions may exist for the same device pair, decryption tries
/// them all until one fits. The ratchet state is strictly sequential,
/// concurrent use of the same session is serialized by the inner lock.
#[derive(Clone)]
pub struct Session {
    /// Our own user id.
    pub user_id: OwnedUserId,
    /// Our own device id.
    pub device_id: OwnedDeviceId,
    /// Our own identity keys.
    pub our_identity_keys: Arc<IdentityKeys>,
    /// The ratchet state of the session.
    pub inner: Arc<Mutex<InnerSession>>,
    /// The unique id of the session.
    pub session_id: Arc<str>,
    /// The curve25519 key of the device on the other end.
    pub sender_key: Curve25519PublicKey,
    /// When the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the curve25519 key of the device this session communicates with.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// Decrypt the given Olm message, advancing the ratchet.
    ///
    /// Returns the decrypted plaintext or a `DecryptionError` if the message
    /// wasn't encrypted with this session.
    pub async fn decrypt(&mut self, message: &OlmMessage) -> Result<String, DecryptionError> {
        let plaintext = self.inner.lock().await.decrypt(message)?;
        trace!(session_id = self.session_id(), "Decrypted an Olm message");

        let plaintext = String::from_utf8_lossy(&plaintext).to_string();
        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(plaintext)
    }

    pub(crate) async fn encrypt_helper(&mut self, plaintext: &str) -> OlmMessage {
        let message = self.inner.lock().await.encrypt(plaintext);
        self.last_use_time = SecondsSinceUnixEpoch::now();

        message
    }

    /// Encrypt the given event content for the device this session was
    /// established with.
    ///
    /// The payload embeds the sender, the recipient, and both of their
    /// signing keys so the receiving side can detect messages that were
    /// relayed or redirected.
    pub(crate) async fn encrypt(
        &mut self,
        recipient_device: &DeviceInfo,
        event_type: &str,
        content: Value,
    ) -> OlmResult<ToDeviceEncryptedEventContent> {
        let recipient_signing_key = recipient_device
            .fingerprint_key()
            .ok_or(EventError::MissingProperty("recipient_keys".to_owned()))?;

        let payload = json!({
            "sender": &self.user_id,
            "sender_device": &self.device_id,
            "keys": {
                "ed25519": self.our_identity_keys.ed25519.to_base64(),
            },
            "recipient": recipient_device.user_id(),
            "recipient_keys": {
                "ed25519": recipient_signing_key.to_base64(),
            },
            "type": event_type,
            "content": content,
        });

        let plaintext = serde_json::to_string(&payload)?;
        let ciphertext = self.encrypt_helper(&plaintext).await;

        Ok(OlmV1Curve25519AesSha2Content::new(
            self.our_identity_keys.curve25519,
            self.sender_key,
            &ciphertext,
        )
        .into())
    }

    /// Convert the session into a storable snapshot.
    pub async fn pickle(&self) -> PickledSession {
        let pickle = self.inner.lock().await.pickle();

        PickledSession {
            pickle,
            sender_key: self.sender_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a session from a previously stored snapshot.
    pub fn from_pickle(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        our_identity_keys: Arc<IdentityKeys>,
        pickle: PickledSession,
    ) -> Self {
        let session: InnerSession = pickle.pickle.into();
        let session_id = session.session_id();

        Session {
            user_id,
            device_id,
            our_identity_keys,
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A storable snapshot of a [`Session`].
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledSession {
    /// The pickled ratchet state of the session.
    pub pickle: SessionPickle,
    /// The curve25519 key of the device on the other end.
    #[serde(
        deserialize_with = "crate::types::deserialize_curve_key",
        serialize_with = "crate::types::serialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,
    /// When the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}
