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

//! Types for `m.forwarded_room_key` to-device events.

use ruma_common::OwnedRoomId;
use serde::{Deserialize, Serialize};
use vodozemac::{megolm::ExportedSessionKey, Curve25519PublicKey, Ed25519PublicKey};

use super::{algorithm_serialization, UnknownContent};
use crate::types::{
    deserialize_curve_key, deserialize_ed25519_key, serialize_curve_key, serialize_ed25519_key,
};

/// The content of an `m.forwarded_room_key` event.
#[derive(Debug, Deserialize)]
#[serde(try_from = "super::AlgorithmHelper")]
pub enum ForwardedRoomKeyContent {
    /// The `m.forwarded_room_key` event content for Megolm sessions.
    MegolmV1AesSha2(Box<MegolmV1AesSha2Content>),
    /// A forwarded room key that uses an unsupported algorithm.
    Unknown(UnknownContent),
}

algorithm_serialization!(
    ForwardedRoomKeyContent,
    MegolmV1AesSha2 => Box<MegolmV1AesSha2Content>,
);

/// The `m.forwarded_room_key` event content for Megolm sessions.
#[derive(Serialize, Deserialize)]
pub struct MegolmV1AesSha2Content {
    /// The room the session is used in.
    pub room_id: OwnedRoomId,

    /// The curve25519 key of the device that originally created the session,
    /// as claimed by the forwarder.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The id the session is advertised under.
    pub session_id: String,

    /// The exported Megolm session key.
    pub session_key: ExportedSessionKey,

    /// The ed25519 key of the device that originally created the session, as
    /// claimed by the forwarder.
    ///
    /// This claim can't be checked, unless we have received the session key
    /// directly from the creating device before.
    #[serde(
        rename = "sender_claimed_ed25519_key",
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub claimed_ed25519_key: Ed25519PublicKey,

    /// The devices the session passed through, each hop adds the curve25519
    /// key of the device it received the session from.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl std::fmt::Debug for MegolmV1AesSha2Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MegolmV1AesSha2Content")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key)
            .field("forwarding_curve25519_key_chain", &self.forwarding_curve25519_key_chain)
            .finish_non_exhaustive()
    }
}
