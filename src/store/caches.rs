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

//! In-memory caches holding the session objects, shared between the memory
//! store and persistent store implementations.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use ruma_common::{OwnedRoomId, RoomId};
use tokio::sync::Mutex;

use crate::olm::{InboundGroupSession, Session};

/// A cache of pairwise sessions, keyed by the base64 curve25519 key of the
/// other device.
///
/// The per-key session list is behind a single lock, the ratchet state of a
/// session only ever advances under it.
#[derive(Clone, Debug, Default)]
pub struct SessionStore {
    entries: Arc<DashMap<String, Arc<Mutex<Vec<Session>>>>>,
}

impl SessionStore {
    /// Create a new, empty session cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the cache, replacing an existing session with the
    /// same id.
    pub async fn add(&self, session: Session) {
        let sessions = self
            .entries
            .entry(session.sender_key().to_base64())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();

        let mut sessions = sessions.lock().await;

        if !sessions.contains(&session) {
            sessions.push(session);
        }
    }

    /// Get all the sessions we share with the given device.
    pub fn get(&self, sender_key: &str) -> Option<Arc<Mutex<Vec<Session>>>> {
        self.entries.get(sender_key).map(|s| s.clone())
    }
}

/// A cache of inbound group sessions, keyed by the room id, the sender key,
/// and the session id.
#[derive(Clone, Debug, Default)]
pub struct GroupSessionStore {
    entries: Arc<DashMap<OwnedRoomId, HashMap<String, HashMap<String, InboundGroupSession>>>>,
}

impl GroupSessionStore {
    /// Create a new, empty group session cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an inbound group session to the cache.
    ///
    /// Returns true if the session wasn't in the cache before.
    pub fn add(&self, session: InboundGroupSession) -> bool {
        self.entries
            .entry(session.room_id().to_owned())
            .or_default()
            .entry(session.sender_key().to_base64())
            .or_default()
            .insert(session.session_id().to_owned(), session)
            .is_none()
    }

    /// Get the inbound group session with the given identifying triple.
    pub fn get(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Option<InboundGroupSession> {
        self.entries
            .get(room_id)?
            .get(sender_key)?
            .get(session_id)
            .cloned()
    }

    /// Get all the inbound group sessions the cache holds.
    pub fn get_all(&self) -> Vec<InboundGroupSession> {
        self.entries
            .iter()
            .flat_map(|room| {
                room.value()
                    .values()
                    .flat_map(|sessions| sessions.values().cloned())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}
