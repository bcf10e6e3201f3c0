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

//! Tracking of outgoing and incoming room key requests.

use std::sync::Arc;

use dashmap::DashMap;
use ruma_common::{OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId};
use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};
use uuid::Uuid;
use vodozemac::Curve25519PublicKey;

use crate::{
    error::{OlmError, OlmResult},
    identities::Device,
    olm::{InboundGroupSession, OutboundGroupSession},
    requests::{DeviceIdOrAllDevices, OutgoingRequest, ToDeviceRequest},
    store::{CryptoStoreError, Store},
    types::{
        events::{
            forwarded_room_key,
            room_key_request::{Action, RequestedKeyInfo, RoomKeyRequestContent},
            ToDeviceEvent,
        },
        EventEncryptionAlgorithm,
    },
};

/// The state machine tracking room key requests, ours and everyone else's.
///
/// Outgoing requests are deduplicated per requested session, one live
/// request at a time. Incoming requests are queued on receipt and answered
/// in a batch, a cancellation arriving in the same batch silently swallows
/// the request it cancels.
#[derive(Clone, Debug)]
pub(crate) struct KeyRequestMachine {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    store: Store,
    outbound_group_sessions: Arc<DashMap<OwnedRoomId, OutboundGroupSession>>,
    outgoing_to_device_requests: Arc<DashMap<Uuid, OutgoingRequest>>,
    incoming_key_requests:
        Arc<DashMap<(OwnedUserId, OwnedDeviceId, String), ToDeviceEvent<RoomKeyRequestContent>>>,
}

/// Bookkeeping for an outgoing key request, stored until the key arrives.
#[derive(Debug, Serialize, Deserialize)]
struct OutgoingKeyInfo {
    request_id: Uuid,
    info: RequestedKeyInfo,
    sent_out: bool,
}

trait Encode {
    fn encode(&self) -> String;
}

impl Encode for RequestedKeyInfo {
    fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.sender_key.to_base64(),
            self.room_id,
            self.session_id,
            self.algorithm
        )
    }
}

impl Encode for forwarded_room_key::MegolmV1AesSha2Content {
    fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.sender_key.to_base64(),
            self.room_id,
            self.session_id,
            EventEncryptionAlgorithm::MegolmV1AesSha2
        )
    }
}

impl KeyRequestMachine {
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        store: Store,
        outbound_group_sessions: Arc<DashMap<OwnedRoomId, OutboundGroupSession>>,
    ) -> Self {
        Self {
            user_id,
            device_id,
            store,
            outbound_group_sessions,
            outgoing_to_device_requests: Arc::new(DashMap::new()),
            incoming_key_requests: Arc::new(DashMap::new()),
        }
    }

    /// The queued up to-device requests that need to be sent out.
    pub fn outgoing_to_device_requests(&self) -> Vec<OutgoingRequest> {
        self.outgoing_to_device_requests.iter().map(|r| r.value().clone()).collect()
    }

    /// Receive a room key request event.
    ///
    /// The request is queued, [`collect_incoming_key_requests()`] resolves
    /// the queue. A cancellation with the same request id replaces the
    /// queued request, cancelling before we answered costs nothing.
    ///
    /// [`collect_incoming_key_requests()`]: Self::collect_incoming_key_requests
    pub fn receive_incoming_key_request(&self, event: &ToDeviceEvent<RoomKeyRequestContent>) {
        let sender = event.sender.clone();
        let device_id = event.content.requesting_device_id.clone();
        let request_id = event.content.request_id.clone();

        self.incoming_key_requests.insert((sender, device_id, request_id), event.clone());
    }

    /// Handle all the incoming key requests that are queued up and empty our
    /// key request queue.
    pub async fn collect_incoming_key_requests(&self) -> OlmResult<()> {
        for item in self.incoming_key_requests.iter() {
            let event = item.value();

            match event.content.action {
                Action::Request => self.handle_key_request(event).await?,
                Action::CancelRequest => {
                    // The matching request was either overwritten in the
                    // queue by this very event or already answered, both are
                    // fine.
                    trace!(
                        sender = event.sender.as_str(),
                        request_id = event.content.request_id.as_str(),
                        "Received a room key request cancellation",
                    );
                }
            }
        }

        self.incoming_key_requests.clear();

        Ok(())
    }

    async fn handle_key_request(
        &self,
        event: &ToDeviceEvent<RoomKeyRequestContent>,
    ) -> OlmResult<()> {
        let key_info = match &event.content.body {
            Some(info) => info,
            None => {
                warn!(
                    sender = event.sender.as_str(),
                    "Received a room key request without a body",
                );
                return Ok(());
            }
        };

        if key_info.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            info!(
                sender = event.sender.as_str(),
                algorithm = key_info.algorithm.as_str(),
                "Received a room key request for an unsupported algorithm",
            );
            return Ok(());
        }

        let session = self
            .store
            .get_inbound_group_session(
                &key_info.room_id,
                &key_info.sender_key.to_base64(),
                &key_info.session_id,
            )
            .await?;

        let session = match session {
            Some(s) => s,
            None => {
                info!(
                    sender = event.sender.as_str(),
                    session_id = key_info.session_id.as_str(),
                    "Received a room key request for an unknown inbound group session",
                );
                return Ok(());
            }
        };

        let device = self
            .store
            .get_device_wrapped(&event.sender, &event.content.requesting_device_id)
            .await?;

        let device = match device {
            Some(d) => d,
            None => {
                info!(
                    sender = event.sender.as_str(),
                    device_id = event.content.requesting_device_id.as_str(),
                    "Received a room key request from an unknown device",
                );
                return Ok(());
            }
        };

        if self.should_share_key(&device, &session) {
            self.share_session(&session, &device).await?;
        } else {
            info!(
                user_id = device.user_id().as_str(),
                device_id = device.device_id().as_str(),
                "Received a room key request that we won't serve",
            );
        }

        Ok(())
    }

    /// Check if it's ok to share a session with the given device.
    ///
    /// Our own devices get the key as long as they are verified. Devices of
    /// other users only ever get back sessions that were meant to reach them
    /// in the original share.
    fn should_share_key(&self, device: &Device, session: &InboundGroupSession) -> bool {
        if device.is_blocked() || device.is_deleted() {
            return false;
        }

        if device.user_id() == self.user_id {
            device.is_verified()
        } else {
            let outbound = self.outbound_group_sessions.get(session.room_id());

            match outbound {
                Some(outbound) if outbound.session_id() == session.session_id() => {
                    outbound.was_shared_with(device.user_id(), device.device_id())
                }
                Some(_) | None => false,
            }
        }
    }

    async fn share_session(&self, session: &InboundGroupSession, device: &Device) -> OlmResult<()> {
        let content = match device.encrypt_session(session).await {
            Ok(c) => c,
            Err(OlmError::MissingSession) => {
                info!(
                    user_id = device.user_id().as_str(),
                    device_id = device.device_id().as_str(),
                    "Can't serve a room key request, no Olm session with the \
                     requesting device",
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let request = ToDeviceRequest::new(
            device.user_id(),
            DeviceIdOrAllDevices::DeviceId(device.device_id().to_owned()),
            "m.room.encrypted",
            serde_json::to_value(content)?,
        );

        let request =
            OutgoingRequest { request_id: request.txn_id, request: Arc::new(request) };
        self.outgoing_to_device_requests.insert(request.request_id, request);

        Ok(())
    }

    /// Create a new outgoing key request for the key with the given session
    /// id.
    ///
    /// This queues up a new to-device request and stores the key info, so
    /// that a forwarded room key arriving later can be checked against what
    /// we actually asked for.
    ///
    /// This does nothing if a request for this key is already in flight,
    /// which is also what keeps the request traffic bounded.
    pub async fn create_outgoing_key_request(
        &self,
        room_id: &RoomId,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<(), CryptoStoreError> {
        let key_info =
            RequestedKeyInfo::new(room_id.to_owned(), sender_key, session_id.to_owned());

        let id: Option<Uuid> = self.store.get_object(&key_info.encode()).await?;

        if id.is_some() {
            // We already sent out a request for this key, nothing to do.
            return Ok(());
        }

        info!(
            room_id = room_id.as_str(),
            session_id = session_id,
            "Creating a new outgoing room key request",
        );

        let id = Uuid::new_v4();

        let content = RoomKeyRequestContent::new_request(
            key_info,
            self.device_id.clone(),
            id.to_string(),
        );

        let request = ToDeviceRequest::new(
            &self.user_id,
            DeviceIdOrAllDevices::AllDevices,
            "m.room_key_request",
            serde_json::to_value(&content)?,
        );

        let info = OutgoingKeyInfo {
            request_id: id,
            info: content.body.expect("the request content was just built with a body"),
            sent_out: false,
        };

        self.save_outgoing_key_info(id, info).await?;
        self.outgoing_to_device_requests
            .insert(id, OutgoingRequest { request_id: id, request: Arc::new(request) });

        Ok(())
    }

    async fn save_outgoing_key_info(
        &self,
        id: Uuid,
        info: OutgoingKeyInfo,
    ) -> Result<(), CryptoStoreError> {
        let id_string = id.to_string();
        self.store.save_object(&id_string, &info).await?;
        self.store.save_object(&info.info.encode(), &id).await?;

        Ok(())
    }

    async fn get_key_info(
        &self,
        content: &forwarded_room_key::MegolmV1AesSha2Content,
    ) -> Result<Option<OutgoingKeyInfo>, CryptoStoreError> {
        let id: Option<Uuid> = self.store.get_object(&content.encode()).await?;

        if let Some(id) = id {
            self.store.get_object(&id.to_string()).await
        } else {
            Ok(None)
        }
    }

    async fn delete_key_info(&self, info: &OutgoingKeyInfo) -> Result<(), CryptoStoreError> {
        self.store.delete_object(&info.request_id.to_string()).await?;
        self.store.delete_object(&info.info.encode()).await?;

        Ok(())
    }

    /// Mark the outgoing request as sent.
    pub async fn mark_outgoing_request_as_sent(&self, id: &Uuid) -> Result<(), CryptoStoreError> {
        self.outgoing_to_device_requests.remove(id);
        let info: Option<OutgoingKeyInfo> = self.store.get_object(&id.to_string()).await?;

        if let Some(mut info) = info {
            trace!(request_id = id.to_string().as_str(), "Marking a key request as sent");
            info.sent_out = true;
            self.save_outgoing_key_info(*id, info).await?;
        }

        Ok(())
    }

    /// Save an inbound group session we received through a key forward.
    ///
    /// The request bookkeeping is cleaned up and a cancellation is queued so
    /// other devices stop answering.
    async fn save_session(
        &self,
        key_info: OutgoingKeyInfo,
        session: InboundGroupSession,
    ) -> Result<(), CryptoStoreError> {
        trace!(
            session_id = session.session_id(),
            "Received a forwarded room key that we requested",
        );

        self.store.save_inbound_group_sessions(&[session]).await?;
        self.outgoing_to_device_requests.remove(&key_info.request_id);

        let content = RoomKeyRequestContent::new_cancellation(
            self.device_id.clone(),
            key_info.request_id.to_string(),
        );
        self.delete_key_info(&key_info).await?;

        let request = ToDeviceRequest::new(
            &self.user_id,
            DeviceIdOrAllDevices::AllDevices,
            "m.room_key_request",
            serde_json::to_value(&content)?,
        );

        self.outgoing_to_device_requests
            .insert(request.txn_id, OutgoingRequest { request_id: request.txn_id, request: Arc::new(request) });

        Ok(())
    }

    /// Receive a forwarded room key event that arrived through an Olm
    /// encrypted channel.
    ///
    /// Keys that nobody here asked for are dropped, honoring them would let
    /// any device inject sessions of its choosing.
    pub async fn receive_forwarded_room_key(
        &self,
        forwarder_key: Curve25519PublicKey,
        sender: &OwnedUserId,
        content: &forwarded_room_key::ForwardedRoomKeyContent,
    ) -> OlmResult<Option<InboundGroupSession>> {
        let content = match content {
            forwarded_room_key::ForwardedRoomKeyContent::MegolmV1AesSha2(c) => c,
            forwarded_room_key::ForwardedRoomKeyContent::Unknown(c) => {
                info!(
                    sender = sender.as_str(),
                    algorithm = c.algorithm.as_str(),
                    "Received a forwarded room key with an unsupported algorithm",
                );
                return Ok(None);
            }
        };

        let key_info = self.get_key_info(content).await?;

        let info = match key_info {
            Some(info) => info,
            None => {
                info!(
                    sender = sender.as_str(),
                    session_id = content.session_id.as_str(),
                    "Received a forwarded room key that we never requested",
                );
                return Ok(None);
            }
        };

        let session = InboundGroupSession::from_forwarded_content(forwarder_key, content)?;

        let old_session = self
            .store
            .get_inbound_group_session(
                session.room_id(),
                &session.sender_key().to_base64(),
                session.session_id(),
            )
            .await?;

        // Only replace a session we already have if the forward knows about
        // earlier messages.
        let better = match &old_session {
            Some(old) => session.first_known_index() < old.first_known_index(),
            None => true,
        };

        if better {
            self.save_session(info, session.clone()).await?;
            Ok(Some(session))
        } else {
            info!(
                session_id = session.session_id(),
                "Received a forwarded room key that isn't better than the \
                 session we already have",
            );
            Ok(None)
        }
    }
}
