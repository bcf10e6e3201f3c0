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

use std::collections::BTreeMap;

use ruma_common::{DeviceKeyAlgorithm, OwnedRoomId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vodozemac::{megolm::ExportedSessionKey, Curve25519PublicKey, Ed25519PublicKey};

mod inbound;
mod outbound;

pub use inbound::{InboundGroupSession, PickledInboundGroupSession};
pub(crate) use outbound::ShareInfo;
pub use outbound::{EncryptionSettings, OutboundGroupSession, PickledOutboundGroupSession};

use crate::types::{
    deserialize_curve_key, events::forwarded_room_key, serialize_curve_key,
    EventEncryptionAlgorithm,
};

/// An exported version of an [`InboundGroupSession`].
///
/// The export starts at a chosen ratchet index, indices before it can't be
/// recovered from the exported key.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct ExportedRoomKey {
    /// The encryption algorithm the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the session is used.
    pub room_id: OwnedRoomId,

    /// The curve25519 key of the device which initiated the session
    /// originally.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The id the session is advertised under.
    pub session_id: String,

    /// The exported key material of the session.
    pub session_key: ExportedSessionKey,

    /// The keys the original creator of the session claimed to own.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<DeviceKeyAlgorithm, String>,

    /// Chain of curve25519 keys through which this session was forwarded,
    /// via m.forwarded_room_key events.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// Error describing why an exported room key can't be turned into an
/// `m.forwarded_room_key` event content.
#[derive(Debug, Error)]
pub enum SessionExportError {
    /// The exported key doesn't claim an ed25519 key for its creator.
    #[error("the exported room key is missing the claimed ed25519 key of its creator")]
    MissingEd25519Key,
    /// The claimed ed25519 key doesn't parse.
    #[error(transparent)]
    InvalidEd25519Key(#[from] vodozemac::KeyError),
}

impl TryFrom<ExportedRoomKey> for forwarded_room_key::MegolmV1AesSha2Content {
    type Error = SessionExportError;

    fn try_from(key: ExportedRoomKey) -> Result<Self, Self::Error> {
        let claimed_ed25519_key = key
            .sender_claimed_keys
            .get(&DeviceKeyAlgorithm::Ed25519)
            .ok_or(SessionExportError::MissingEd25519Key)?;
        let claimed_ed25519_key = Ed25519PublicKey::from_base64(claimed_ed25519_key)?;

        Ok(Self {
            room_id: key.room_id,
            sender_key: key.sender_key,
            session_id: key.session_id,
            session_key: key.session_key,
            claimed_ed25519_key,
            forwarding_curve25519_key_chain: key.forwarding_curve25519_key_chain,
        })
    }
}
