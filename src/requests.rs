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

//! Outgoing to-device traffic, queued here and sent by the transport
//! collaborator.

use std::{collections::BTreeMap, sync::Arc};

use ruma_common::{OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

/// The recipient device of a to-device message.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceIdOrAllDevices {
    /// A single device, by id.
    DeviceId(OwnedDeviceId),
    /// Every device of the user.
    AllDevices,
}

impl Serialize for DeviceIdOrAllDevices {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::DeviceId(id) => serializer.serialize_str(id.as_str()),
            Self::AllDevices => serializer.serialize_str("*"),
        }
    }
}

impl<'de> Deserialize<'de> for DeviceIdOrAllDevices {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;

        Ok(match value.as_str() {
            "*" => Self::AllDevices,
            _ => Self::DeviceId(value.into()),
        })
    }
}

/// A to-device request waiting to be sent out.
///
/// The transport sends the messages and acknowledges the request by its
/// transaction id, nothing in this crate considers the request delivered
/// before that.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// The type of the events the request carries.
    pub event_type: String,

    /// The unique transaction id of the request.
    pub txn_id: Uuid,

    /// The event contents, per user and target device.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<DeviceIdOrAllDevices, Value>>,
}

impl ToDeviceRequest {
    /// Create a new to-device request with a single message.
    pub fn new(
        recipient: &UserId,
        recipient_device: DeviceIdOrAllDevices,
        event_type: &str,
        content: Value,
    ) -> Self {
        let mut messages = BTreeMap::new();
        messages
            .entry(recipient.to_owned())
            .or_insert_with(BTreeMap::new)
            .insert(recipient_device, content);

        Self { event_type: event_type.to_owned(), txn_id: Uuid::new_v4(), messages }
    }

    /// How many messages the request carries.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|m| m.len()).sum()
    }
}

/// An outgoing request queued by the state machine.
#[derive(Clone, Debug)]
pub struct OutgoingRequest {
    /// The unique id of the request, used to mark it as sent.
    pub request_id: Uuid,
    /// The request itself.
    pub request: Arc<ToDeviceRequest>,
}
