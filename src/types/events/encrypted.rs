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

//! Types for `m.room.encrypted` events, both the to-device and the room
//! message variant.

use std::collections::BTreeMap;

use ruma_common::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use vodozemac::{megolm::MegolmMessage, olm::OlmMessage, Curve25519PublicKey};

use super::{algorithm_serialization, ToDeviceEvent, UnknownContent};
use crate::error::EventError;

/// An `m.room.encrypted` to-device event.
pub type EncryptedToDeviceEvent = ToDeviceEvent<ToDeviceEncryptedEventContent>;

/// The content of an `m.room.encrypted` to-device event.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "super::AlgorithmHelper")]
pub enum ToDeviceEncryptedEventContent {
    /// The event content for events encrypted with the
    /// m.olm.v1.curve25519-aes-sha2 algorithm.
    OlmV1Curve25519AesSha2(OlmV1Curve25519AesSha2Content),
    /// An event content that was encrypted with an unknown algorithm.
    Unknown(UnknownContent),
}

algorithm_serialization!(
    ToDeviceEncryptedEventContent,
    OlmV1Curve25519AesSha2 => OlmV1Curve25519AesSha2Content,
);

/// The event content for events encrypted with the
/// m.olm.v1.curve25519-aes-sha2 algorithm.
///
/// The `sender_key` and the per-recipient ciphertext entries are kept loose
/// on purpose, remote servers and clients have been observed to produce both
/// missing fields and numbers in surprising encodings. The strict checks
/// happen when a ciphertext for our own device is picked out.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmV1Curve25519AesSha2Content {
    /// The curve25519 key of the device that encrypted the event.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "optional_curve_key",
        serialize_with = "serialize_optional_curve_key"
    )]
    pub sender_key: Option<Curve25519PublicKey>,

    /// The per-recipient ciphertext map, keyed by the base64 curve25519 key
    /// of the recipient device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ciphertext: Option<BTreeMap<String, Value>>,
}

impl OlmV1Curve25519AesSha2Content {
    /// Create a new content with a single recipient.
    pub fn new(
        sender_key: Curve25519PublicKey,
        recipient_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> Self {
        let ciphertext = serde_json::to_value(message)
            .expect("Olm messages can always be serialized");

        Self {
            sender_key: Some(sender_key),
            ciphertext: Some(BTreeMap::from([(recipient_key.to_base64(), ciphertext)])),
        }
    }
}

fn serialize_optional_curve_key<S>(
    key: &Option<Curve25519PublicKey>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match key {
        Some(key) => serializer.serialize_str(&key.to_base64()),
        None => serializer.serialize_none(),
    }
}

fn optional_curve_key<'de, D>(de: D) -> Result<Option<Curve25519PublicKey>, D::Error>
where
    D: Deserializer<'de>,
{
    let key: Option<String> = Deserialize::deserialize(de)?;

    key.map(|k| Curve25519PublicKey::from_base64(&k).map_err(serde::de::Error::custom))
        .transpose()
}

/// Pick the message type out of a raw ciphertext entry.
///
/// The type is accepted both as an integer and as a floating point number
/// with an integral value, some JSON stacks on the wire only know about
/// doubles.
fn lenient_message_type(value: &Value) -> Option<u64> {
    let number = value.as_number()?;

    number.as_u64().or_else(|| {
        let float = number.as_f64()?;

        (float.is_finite() && float >= 0.0 && float.fract() == 0.0).then_some(float as u64)
    })
}

/// Convert a raw per-recipient ciphertext entry into an [`OlmMessage`].
///
/// Returns [`EventError::MalformedMessage`] if the entry doesn't have the
/// expected `{"type": int, "body": string}` shape or if the body can't be
/// decoded.
pub(crate) fn parse_olm_message(entry: &Value) -> Result<OlmMessage, EventError> {
    let message_type = entry
        .get("type")
        .and_then(lenient_message_type)
        .ok_or(EventError::MalformedMessage)?;
    let body = entry
        .get("body")
        .and_then(Value::as_str)
        .ok_or(EventError::MalformedMessage)?;

    serde_json::from_value(json!({ "type": message_type, "body": body }))
        .map_err(|_| EventError::MalformedMessage)
}

/// An encrypted room message event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedRoomEvent {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The room the event was sent in.
    pub room_id: OwnedRoomId,
    /// The globally unique id of the event, if the event came from a
    /// timeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// The encrypted content of the event.
    pub content: RoomEncryptedEventContent,
}

/// The content of an `m.room.encrypted` room message event.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "super::AlgorithmHelper")]
pub enum RoomEncryptedEventContent {
    /// The event content for events encrypted with the m.megolm.v1.aes-sha2
    /// algorithm.
    MegolmV1AesSha2(MegolmV1AesSha2Content),
    /// An event content that was encrypted with an unknown algorithm.
    Unknown(UnknownContent),
}

algorithm_serialization!(
    RoomEncryptedEventContent,
    MegolmV1AesSha2 => MegolmV1AesSha2Content,
);

/// The event content for events encrypted with the m.megolm.v1.aes-sha2
/// algorithm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1AesSha2Content {
    /// The encrypted content of the event.
    pub ciphertext: MegolmMessage,

    /// The curve25519 key of the device that encrypted the event.
    #[serde(
        deserialize_with = "crate::types::deserialize_curve_key",
        serialize_with = "crate::types::serialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,

    /// The id of the device that encrypted the event.
    pub device_id: OwnedDeviceId,

    /// The id of the session that was used to encrypt the event.
    pub session_id: String,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::{parse_olm_message, ToDeviceEncryptedEventContent};
    use crate::error::EventError;

    #[test]
    fn unknown_algorithm_deserialization() {
        let json = json!({
            "algorithm": "m.unknown.algorithm",
            "some_key": "some_value",
        });

        let content: ToDeviceEncryptedEventContent = serde_json::from_value(json).unwrap();
        assert_matches!(content, ToDeviceEncryptedEventContent::Unknown(_));
    }

    #[test]
    fn message_type_wire_encodings() {
        let message = json!({
            "type": 0.0,
            "body": "AwogGHc",
        });

        // A float with an integral value is accepted, the body here is bogus
        // base64 so the whole entry is still rejected further down.
        assert_matches!(parse_olm_message(&message), Err(EventError::MalformedMessage));

        let message = json!({
            "type": 0.5,
            "body": "AwogGHc",
        });
        assert_matches!(parse_olm_message(&message), Err(EventError::MalformedMessage));

        let message = json!({
            "body": "AwogGHc",
        });
        assert_matches!(parse_olm_message(&message), Err(EventError::MalformedMessage));
    }
}
