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

//! Types for the events that come out of a successful Olm decryption.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{forwarded_room_key::ForwardedRoomKeyContent, room_key::RoomKeyContent};

/// The content of an `m.dummy` event, sent to poke a wedged session back to
/// life.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DummyEventContent {}

/// An enum over the content kinds an Olm decrypted to-device event can carry,
/// selected by the `type` label of the decrypted payload.
#[derive(Debug)]
pub enum AnyDecryptedOlmContent {
    /// The content of an `m.room_key` event.
    RoomKey(RoomKeyContent),
    /// The content of an `m.forwarded_room_key` event.
    ForwardedRoomKey(ForwardedRoomKeyContent),
    /// The content of an `m.dummy` event.
    Dummy(DummyEventContent),
    /// The content of an event of an unknown or custom type.
    Custom {
        /// The `type` of the decrypted event.
        event_type: String,
        /// The raw content of the decrypted event.
        content: Value,
    },
}

impl AnyDecryptedOlmContent {
    /// Deserialize the content of a decrypted event by its `type` label.
    ///
    /// Unknown event types are kept around raw, the caller decides what to do
    /// with them.
    pub fn from_parts(event_type: &str, content: Value) -> Result<Self, serde_json::Error> {
        Ok(match event_type {
            "m.room_key" => Self::RoomKey(serde_json::from_value(content)?),
            "m.forwarded_room_key" => Self::ForwardedRoomKey(serde_json::from_value(content)?),
            "m.dummy" => Self::Dummy(serde_json::from_value(content)?),
            _ => Self::Custom { event_type: event_type.to_owned(), content },
        })
    }
}
