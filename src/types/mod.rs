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

//! Customized types modeling Matrix keys and the containers they travel in.
//!
//! The types support lossless serialization cycles in a canonical JSON
//! supported way, meaning the white-space and field order won't be preserved
//! but the data will.

pub mod events;

use std::{
    collections::BTreeMap,
    fmt::{self, Display},
};

use ruma_common::{
    DeviceId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId, UserId,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

/// An encryption algorithm to be used to encrypt messages sent to a room.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum EventEncryptionAlgorithm {
    /// Olm version 1 using Curve25519, AES-256, and SHA-256.
    OlmV1Curve25519AesSha2,
    /// Megolm version 1 using AES-256 and SHA-256.
    MegolmV1AesSha2,
    /// An algorithm this crate doesn't understand.
    Unknown(String),
}

impl EventEncryptionAlgorithm {
    /// Get the wire representation of the algorithm.
    pub fn as_str(&self) -> &str {
        match self {
            Self::OlmV1Curve25519AesSha2 => "m.olm.v1.curve25519-aes-sha2",
            Self::MegolmV1AesSha2 => "m.megolm.v1.aes-sha2",
            Self::Unknown(a) => a,
        }
    }
}

impl From<&str> for EventEncryptionAlgorithm {
    fn from(value: &str) -> Self {
        match value {
            "m.olm.v1.curve25519-aes-sha2" => Self::OlmV1Curve25519AesSha2,
            "m.megolm.v1.aes-sha2" => Self::MegolmV1AesSha2,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

impl Display for EventEncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventEncryptionAlgorithm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventEncryptionAlgorithm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let algorithm = String::deserialize(deserializer)?;
        Ok(algorithm.as_str().into())
    }
}

/// Serialize a curve25519 key into its unpadded base64 representation.
pub(crate) fn serialize_curve_key<S>(
    key: &Curve25519PublicKey,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&key.to_base64())
}

/// Deserialize a curve25519 key from its unpadded base64 representation.
pub(crate) fn deserialize_curve_key<'de, D>(de: D) -> Result<Curve25519PublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

/// Serialize an ed25519 key into its unpadded base64 representation.
pub(crate) fn serialize_ed25519_key<S>(
    key: &Ed25519PublicKey,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&key.to_base64())
}

/// Deserialize an ed25519 key from its unpadded base64 representation.
pub(crate) fn deserialize_ed25519_key<'de, D>(de: D) -> Result<Ed25519PublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Ed25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

/// Signatures grouped first by the user that created them, then by the key
/// that was used.
pub type SignatureMap = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>;

/// The identity keys and metadata of a device, as uploaded to and downloaded
/// from the key-directory service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The id of the user the device belongs to.
    pub user_id: OwnedUserId,

    /// The unique id of the device.
    pub device_id: OwnedDeviceId,

    /// The encryption algorithms the device supports.
    pub algorithms: Vec<EventEncryptionAlgorithm>,

    /// Public identity keys, keyed by `<algorithm>:<device_id>`.
    pub keys: BTreeMap<OwnedDeviceKeyId, String>,

    /// Signatures over the canonical form of this object.
    pub signatures: SignatureMap,

    /// Additional unsigned data, not covered by the signatures.
    #[serde(default, skip_serializing_if = "UnsignedDeviceInfo::is_empty")]
    pub unsigned: UnsignedDeviceInfo,
}

/// Additional data added to device key information by intermediate servers,
/// not covered by the signatures.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnsignedDeviceInfo {
    /// The display name the device owner has set for the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

impl UnsignedDeviceInfo {
    /// Does the unsigned data carry any information.
    pub fn is_empty(&self) -> bool {
        self.device_display_name.is_none()
    }
}

/// A one-time public key for "pre-key" messages, signed by the device that
/// created it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedKey {
    /// The public part of the one-time key.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub key: Curve25519PublicKey,

    /// Signatures over the canonical form of this object.
    #[serde(default)]
    pub signatures: SignatureMap,

    /// Is the key a fallback key that may have been used before.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

impl SignedKey {
    /// Create a new signed one-time key.
    pub fn new(key: Curve25519PublicKey, signatures: SignatureMap) -> Self {
        Self { key, signatures, fallback: false }
    }
}

/// An explicit two-level keyed container, mapping a user id and a device id
/// to some value.
///
/// Lookups never expose the inner maps mutably, values leave the container
/// only as copies.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct UserDeviceMap<T>(BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, T>>);

impl<T> UserDeviceMap<T> {
    /// Create a new, empty map.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert a value for the given user/device pair, returning the previous
    /// value if there was one.
    pub fn insert(&mut self, user_id: &UserId, device_id: &DeviceId, value: T) -> Option<T> {
        self.0.entry(user_id.to_owned()).or_default().insert(device_id.to_owned(), value)
    }

    /// Get the value for the given user/device pair.
    pub fn get(&self, user_id: &UserId, device_id: &DeviceId) -> Option<&T> {
        self.0.get(user_id)?.get(device_id)
    }

    /// Remove the value for the given user/device pair, returning it.
    pub fn remove(&mut self, user_id: &UserId, device_id: &DeviceId) -> Option<T> {
        self.0.get_mut(user_id)?.remove(device_id)
    }

    /// Get the per-device values belonging to the given user.
    pub fn user_values(&self, user_id: &UserId) -> Option<&BTreeMap<OwnedDeviceId, T>> {
        self.0.get(user_id)
    }

    /// Iterate over the user ids this map holds values for.
    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.0.keys().map(|u| u.as_ref())
    }

    /// Iterate over all `(user_id, device_id, value)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &DeviceId, &T)> {
        self.0.iter().flat_map(|(user_id, devices)| {
            devices.iter().map(move |(device_id, value)| {
                (user_id.as_ref(), device_id.as_ref(), value)
            })
        })
    }

    /// Does the map hold any values.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|d| d.is_empty())
    }
}

impl<T> Default for UserDeviceMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use ruma_common::{device_id, user_id};

    use super::{EventEncryptionAlgorithm, UserDeviceMap};

    #[test]
    fn algorithm_serialization_cycle() {
        let algorithm = EventEncryptionAlgorithm::MegolmV1AesSha2;
        let serialized = serde_json::to_string(&algorithm).unwrap();

        assert_eq!(serialized, "\"m.megolm.v1.aes-sha2\"");
        assert_eq!(serde_json::from_str::<EventEncryptionAlgorithm>(&serialized).unwrap(), algorithm);

        let unknown: EventEncryptionAlgorithm = "m.fancy.new.algorithm".into();
        assert_eq!(unknown, EventEncryptionAlgorithm::Unknown("m.fancy.new.algorithm".to_owned()));
    }

    #[test]
    fn user_device_map_access() {
        let mut map = UserDeviceMap::new();
        assert!(map.is_empty());

        map.insert(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"), 1u8);
        map.insert(user_id!("@alice:localhost"), device_id!("OTHERDEVICE"), 2u8);

        assert_eq!(map.get(user_id!("@alice:localhost"), device_id!("ALICEDEVICE")), Some(&1));
        assert!(map.get(user_id!("@bob:localhost"), device_id!("ALICEDEVICE")).is_none());
        assert_eq!(map.iter().count(), 2);
        assert_eq!(map.users().count(), 1);
    }
}
