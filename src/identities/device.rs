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
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use atomic::Atomic;
use ruma_common::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId,
    UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    error::{EventError, OlmError, OlmResult, SignatureError},
    olm::{InboundGroupSession, VerifyJson},
    store::Store,
    types::{
        events::{encrypted::ToDeviceEncryptedEventContent, forwarded_room_key},
        DeviceKeys, EventEncryptionAlgorithm, SignatureMap, SignedKey,
    },
};

/// The local verification state of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationState {
    /// We have never made a trust decision about the device.
    Unknown,
    /// The device is known but hasn't been verified.
    Unverified,
    /// The device has been verified and is trusted.
    Verified,
    /// The device has been blocked, it never receives keys.
    Blocked,
}

/// The identity record of an end-to-end encryption capable device.
///
/// Identity fields are immutable after creation, the verification state and
/// the deletion marker are the only mutable cells. Records are cheap to
/// clone, clones observe each other's state changes.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    algorithms: Arc<[EventEncryptionAlgorithm]>,
    keys: Arc<BTreeMap<OwnedDeviceKeyId, String>>,
    signatures: Arc<SignatureMap>,
    display_name: Arc<Option<String>>,
    deleted: Arc<AtomicBool>,
    verification: Arc<Atomic<VerificationState>>,
}

impl DeviceInfo {
    /// Create a new device identity record.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        algorithms: Vec<EventEncryptionAlgorithm>,
        keys: BTreeMap<OwnedDeviceKeyId, String>,
        signatures: SignatureMap,
        display_name: Option<String>,
    ) -> Self {
        Self {
            user_id,
            device_id,
            algorithms: algorithms.into(),
            keys: Arc::new(keys),
            signatures: Arc::new(signatures),
            display_name: Arc::new(display_name),
            deleted: Arc::new(AtomicBool::new(false)),
            verification: Arc::new(Atomic::new(VerificationState::Unknown)),
        }
    }

    /// The id of the user the device belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique id of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The display name the owner has given the device, if any.
    pub fn display_name(&self) -> Option<&str> {
        (*self.display_name).as_deref()
    }

    /// The encryption algorithms the device supports.
    pub fn algorithms(&self) -> &[EventEncryptionAlgorithm] {
        &self.algorithms
    }

    /// Get the key of the given algorithm belonging to this device.
    pub fn get_key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&str> {
        self.keys
            .get(&DeviceKeyId::from_parts(algorithm, &self.device_id))
            .map(|k| k.as_str())
    }

    /// The curve25519 identity key of the device.
    ///
    /// Returns `None` if the device doesn't advertise one or if the
    /// advertised key doesn't parse.
    pub fn identity_key(&self) -> Option<Curve25519PublicKey> {
        let key = self.get_key(DeviceKeyAlgorithm::Curve25519)?;
        Curve25519PublicKey::from_base64(key).ok()
    }

    /// The ed25519 fingerprint key of the device.
    ///
    /// Returns `None` if the device doesn't advertise one or if the
    /// advertised key doesn't parse.
    pub fn fingerprint_key(&self) -> Option<Ed25519PublicKey> {
        let key = self.get_key(DeviceKeyAlgorithm::Ed25519)?;
        Ed25519PublicKey::from_base64(key).ok()
    }

    /// All the keys the device advertises.
    pub fn keys(&self) -> &BTreeMap<OwnedDeviceKeyId, String> {
        &self.keys
    }

    /// The signatures the device uploaded alongside its keys.
    pub fn signatures(&self) -> &SignatureMap {
        &self.signatures
    }

    /// The local verification state of the device.
    pub fn verification_state(&self) -> VerificationState {
        self.verification.load(Ordering::Relaxed)
    }

    /// Is the device locally marked as verified.
    pub fn is_verified(&self) -> bool {
        self.verification_state() == VerificationState::Verified
    }

    /// Is the device locally marked as blocked.
    ///
    /// Blocked devices won't receive any group sessions.
    pub fn is_blocked(&self) -> bool {
        self.verification_state() == VerificationState::Blocked
    }

    pub(crate) fn set_verification_state(&self, state: VerificationState) {
        self.verification.store(state, Ordering::Relaxed)
    }

    /// Was the device removed from the owner's device list.
    ///
    /// Removed devices keep their record around, they only stop taking part
    /// in session establishment and key sharing.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_as_deleted(&self) {
        self.deleted.store(true, Ordering::Relaxed)
    }

    pub(crate) fn mark_as_live(&self) {
        self.deleted.store(false, Ordering::Relaxed)
    }

    /// Update the identity data of the device from a freshly downloaded
    /// key-directory record.
    ///
    /// The verification state is deliberately left alone, trust decisions
    /// only ever change through an explicit verification action.
    pub(crate) fn update_device(&mut self, device_keys: &DeviceKeys) -> Result<(), SignatureError> {
        self.verify_device_keys(device_keys)?;

        self.algorithms = device_keys.algorithms.clone().into();
        self.keys = Arc::new(device_keys.keys.clone());
        self.signatures = Arc::new(device_keys.signatures.clone());
        self.display_name = Arc::new(device_keys.unsigned.device_display_name.clone());

        Ok(())
    }

    /// Check that the device's own ed25519 key has signed the given key
    /// upload.
    pub(crate) fn verify_device_keys(
        &self,
        device_keys: &DeviceKeys,
    ) -> Result<(), SignatureError> {
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id);
        let signing_key = device_keys
            .keys
            .get(&key_id)
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
            .ok_or(SignatureError::NoSignatureFound)?;

        signing_key.verify_json(
            &self.user_id,
            &key_id,
            serde_json::to_value(device_keys)?,
        )
    }

    /// Check that one of our one-time keys was signed by this device.
    pub(crate) fn verify_one_time_key(&self, key: &SignedKey) -> Result<(), SignatureError> {
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id);

        self.fingerprint_key()
            .ok_or(SignatureError::NoSignatureFound)?
            .verify_json(&self.user_id, &key_id, serde_json::to_value(key)?)
    }
}

impl TryFrom<&DeviceKeys> for DeviceInfo {
    type Error = SignatureError;

    fn try_from(device_keys: &DeviceKeys) -> Result<Self, Self::Error> {
        let device = Self::new(
            device_keys.user_id.clone(),
            device_keys.device_id.clone(),
            device_keys.algorithms.clone(),
            device_keys.keys.clone(),
            device_keys.signatures.clone(),
            device_keys.unsigned.device_display_name.clone(),
        );

        device.verify_device_keys(device_keys)?;
        Ok(device)
    }
}

impl PartialEq for DeviceInfo {
    fn eq(&self, other: &Self) -> bool {
        self.user_id() == other.user_id() && self.device_id() == other.device_id()
    }
}

/// A device paired with the store it came out of.
///
/// The pairing gives the device access to the Olm sessions we share with it,
/// which is what single-device encryption needs.
#[derive(Clone, Debug)]
pub struct Device {
    pub(crate) inner: DeviceInfo,
    pub(crate) store: Store,
}

impl Deref for Device {
    type Target = DeviceInfo;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Device {
    /// Encrypt the given event content for this device using an established
    /// pairwise session.
    pub(crate) async fn encrypt(
        &self,
        event_type: &str,
        content: Value,
    ) -> OlmResult<ToDeviceEncryptedEventContent> {
        let sender_key = self
            .inner
            .identity_key()
            .ok_or(OlmError::EventError(EventError::MissingSenderKey))?;

        let session = self.store.get_sessions(&sender_key.to_base64()).await?;
        let mut session = if let Some(sessions) = session {
            let sessions = sessions.lock().await;

            match sessions.first() {
                Some(session) => session.clone(),
                None => return Err(OlmError::MissingSession),
            }
        } else {
            return Err(OlmError::MissingSession);
        };

        let message = session.encrypt(&self.inner, event_type, content).await?;
        self.store.save_sessions(&[session]).await?;

        Ok(message)
    }

    /// Encrypt the given inbound group session as a forwarded room key for
    /// this device.
    pub(crate) async fn encrypt_session(
        &self,
        session: &InboundGroupSession,
    ) -> OlmResult<ToDeviceEncryptedEventContent> {
        let export = session.export().await;

        let content: forwarded_room_key::MegolmV1AesSha2Content = export
            .try_into()
            .map_err(|_| OlmError::EventError(EventError::MissingProperty("keys".to_owned())))?;

        let content = serde_json::to_value(forwarded_room_key::ForwardedRoomKeyContent::from(
            Box::new(content),
        ))?;

        self.encrypt("m.forwarded_room_key", content).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ruma_common::{device_id, user_id};

    use super::{DeviceInfo, VerificationState};
    use crate::olm::Account;

    pub(crate) async fn get_device() -> DeviceInfo {
        let account = Account::new(
            user_id!("@alice:example.org").to_owned(),
            device_id!("ALICEDEVICE").to_owned(),
        );
        let device_keys = account.device_keys().await;

        (&device_keys).try_into().unwrap()
    }

    #[tokio::test]
    async fn device_keys_conversion() {
        let device = get_device().await;

        assert_eq!(device.user_id(), user_id!("@alice:example.org"));
        assert_eq!(device.device_id(), device_id!("ALICEDEVICE"));
        assert!(device.identity_key().is_some());
        assert!(device.fingerprint_key().is_some());
        assert_eq!(device.verification_state(), VerificationState::Unknown);
    }

    #[tokio::test]
    async fn tampered_device_keys_are_rejected() {
        let account = Account::new(
            user_id!("@alice:example.org").to_owned(),
            device_id!("ALICEDEVICE").to_owned(),
        );
        let mut device_keys = account.device_keys().await;
        device_keys.unsigned.device_display_name = None;
        device_keys
            .algorithms
            .push(crate::types::EventEncryptionAlgorithm::Unknown("m.bogus".to_owned()));

        assert!(DeviceInfo::try_from(&device_keys).is_err());
    }
}
