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

//! Types for `m.room_key_request` to-device events.

use ruma_common::{OwnedDeviceId, OwnedRoomId};
use serde::{Deserialize, Serialize};
use vodozemac::Curve25519PublicKey;

use crate::types::{
    deserialize_curve_key, serialize_curve_key, EventEncryptionAlgorithm,
};

/// The content of an `m.room_key_request` event.
///
/// Key requests travel in the clear, the answer to one never does.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// Whether this is a new request or the cancellation of a previous one.
    pub action: Action,

    /// The id of the device requesting the key.
    pub requesting_device_id: OwnedDeviceId,

    /// A random string uniquely identifying the request, scoped to the
    /// requesting device.
    pub request_id: String,

    /// The key being requested, present iff the action is `Request`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,
}

impl RoomKeyRequestContent {
    /// Create a new content requesting the given key.
    pub fn new_request(
        info: RequestedKeyInfo,
        requesting_device_id: OwnedDeviceId,
        request_id: String,
    ) -> Self {
        Self { action: Action::Request, requesting_device_id, request_id, body: Some(info) }
    }

    /// Create a new content cancelling a previously sent request.
    pub fn new_cancellation(requesting_device_id: OwnedDeviceId, request_id: String) -> Self {
        Self { action: Action::CancelRequest, requesting_device_id, request_id, body: None }
    }
}

/// The action of an `m.room_key_request` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// A request for a room key.
    #[serde(rename = "request")]
    Request,
    /// The cancellation of a previous request.
    #[serde(rename = "request_cancellation")]
    CancelRequest,
}

/// The info of the key that is being requested.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestedKeyInfo {
    /// The algorithm of the requested session.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room the session is used in.
    pub room_id: OwnedRoomId,

    /// The curve25519 key of the device that created the session.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The unique id of the requested session.
    pub session_id: String,
}

impl RequestedKeyInfo {
    /// Create a new info for a Megolm session.
    pub fn new(room_id: OwnedRoomId, sender_key: Curve25519PublicKey, session_id: String) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id,
            sender_key,
            session_id,
        }
    }
}
