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

//! Types for `m.room_key` to-device events.

use ruma_common::OwnedRoomId;
use serde::{Deserialize, Serialize};
use vodozemac::megolm::SessionKey;

use super::{algorithm_serialization, UnknownContent};

/// The content of an `m.room_key` event.
///
/// The event is only ever valid when it arrived through an Olm encrypted
/// channel, the session key inside it is secret material.
#[derive(Debug, Deserialize)]
#[serde(try_from = "super::AlgorithmHelper")]
pub enum RoomKeyContent {
    /// The `m.room_key` event content for Megolm sessions.
    MegolmV1AesSha2(Box<MegolmV1AesSha2Content>),
    /// A room key that uses an unsupported algorithm.
    Unknown(UnknownContent),
}

algorithm_serialization!(
    RoomKeyContent,
    MegolmV1AesSha2 => Box<MegolmV1AesSha2Content>,
);

/// The `m.room_key` event content for Megolm sessions.
#[derive(Serialize, Deserialize)]
pub struct MegolmV1AesSha2Content {
    /// The room the session is used in.
    pub room_id: OwnedRoomId,

    /// The id the session is advertised under.
    ///
    /// Importing the key checks this against the id that the session key
    /// itself derives to.
    pub session_id: String,

    /// The Megolm session key.
    pub session_key: SessionKey,

    /// The ratchet index the session key was exported at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_index: Option<u32>,
}

impl std::fmt::Debug for MegolmV1AesSha2Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MegolmV1AesSha2Content")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("chain_index", &self.chain_index)
            .finish_non_exhaustive()
    }
}
