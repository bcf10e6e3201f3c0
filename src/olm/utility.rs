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

use ruma_common::{DeviceKeyId, UserId};
use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::error::SignatureError;

/// Convert a JSON object into the canonical string form that Matrix
/// signatures cover.
///
/// The `signatures` and `unsigned` fields are stripped. Since the maps this
/// crate serializes are ordered, compact serialization of the rest is already
/// canonical.
pub(crate) fn canonical_json(mut object: Value) -> Result<String, SignatureError> {
    let object = object.as_object_mut().ok_or(SignatureError::NotAnObject)?;

    object.remove("signatures");
    object.remove("unsigned");

    Ok(serde_json::to_string(&object)?)
}

/// Verification of Matrix style signed JSON objects with an ed25519 key.
pub(crate) trait VerifyJson {
    /// Check that the object carries a valid signature made by the given
    /// user with the given key id.
    ///
    /// The object is canonicalized before the check, a passing object would
    /// also pass on any other correctly implemented homeserver or client.
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        json: Value,
    ) -> Result<(), SignatureError>;
}

impl VerifyJson for Ed25519PublicKey {
    fn verify_json(
        &self,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        json: Value,
    ) -> Result<(), SignatureError> {
        let signature = json
            .get("signatures")
            .and_then(|s| s.get(user_id.as_str()))
            .and_then(|u| u.get(key_id.as_str()))
            .and_then(Value::as_str)
            .ok_or(SignatureError::NoSignatureFound)?;

        let signature = Ed25519Signature::from_base64(signature)
            .map_err(|e| SignatureError::InvalidSignature(e.to_string()))?;

        let canonical = canonical_json(json.clone())?;

        Ok(self.verify(canonical.as_bytes(), &signature)?)
    }
}

#[cfg(test)]
mod tests {
    use ruma_common::{device_id, user_id, DeviceKeyAlgorithm, DeviceKeyId};

    use super::VerifyJson;
    use crate::olm::Account;

    #[tokio::test]
    async fn own_device_keys_verify() {
        let account = Account::new(
            user_id!("@alice:example.org").to_owned(),
            device_id!("DEVICEID").to_owned(),
        );

        let device_keys = account.device_keys().await;
        let json = serde_json::to_value(&device_keys).unwrap();
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("DEVICEID"));

        account
            .identity_keys()
            .ed25519
            .verify_json(user_id!("@alice:example.org"), &key_id, json)
            .unwrap();
    }

    #[tokio::test]
    async fn tampered_json_fails_verification() {
        let account = Account::new(
            user_id!("@alice:example.org").to_owned(),
            device_id!("DEVICEID").to_owned(),
        );

        let device_keys = account.device_keys().await;
        let mut json = serde_json::to_value(&device_keys).unwrap();
        json["user_id"] = "@mallory:example.org".into();

        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("DEVICEID"));

        account
            .identity_keys()
            .ed25519
            .verify_json(user_id!("@alice:example.org"), &key_id, json)
            .unwrap_err();
    }
}
