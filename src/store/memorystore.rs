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

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ruma_common::{DeviceId, OwnedRoomId, RoomId, UserId};
use tokio::sync::Mutex;

use super::{
    caches::{GroupSessionStore, SessionStore},
    CryptoStore, Result,
};
use crate::{
    identities::{DeviceInfo, DeviceRegistry, UserDevices},
    olm::{Account, InboundGroupSession, OutboundGroupSession, Session},
};

/// An in-memory only store that will forget all the E2EE keys once it's
/// dropped.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    account: Arc<Mutex<Option<Account>>>,
    sessions: SessionStore,
    inbound_group_sessions: GroupSessionStore,
    outbound_group_sessions: Arc<DashMap<OwnedRoomId, OutboundGroupSession>>,
    devices: DeviceRegistry,
    values: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        Ok(self.account.lock().await.clone())
    }

    async fn save_account(&self, account: Account) -> Result<()> {
        *self.account.lock().await = Some(account);
        Ok(())
    }

    async fn save_sessions(&self, sessions: &[Session]) -> Result<()> {
        for session in sessions {
            self.sessions.add(session.clone()).await;
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        Ok(self.sessions.get(sender_key))
    }

    async fn save_inbound_group_sessions(
        &self,
        sessions: &[InboundGroupSession],
    ) -> Result<()> {
        for session in sessions {
            self.inbound_group_sessions.add(session.clone());
        }

        Ok(())
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.get(room_id, sender_key, session_id))
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.get_all())
    }

    async fn save_outbound_group_session(&self, session: OutboundGroupSession) -> Result<()> {
        self.outbound_group_sessions.insert(session.room_id().to_owned(), session);
        Ok(())
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>> {
        Ok(self.outbound_group_sessions.get(room_id).map(|s| s.clone()))
    }

    async fn save_devices(&self, devices: &[DeviceInfo]) -> Result<()> {
        for device in devices {
            self.devices.upsert(device.clone());
        }

        Ok(())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceInfo>> {
        Ok(self.devices.get(user_id, device_id))
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices> {
        Ok(self.devices.user_devices(user_id))
    }

    async fn save_value(&self, key: String, value: String) -> Result<()> {
        self.values.insert(key, value);
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).map(|v| v.to_owned()))
    }

    async fn remove_value(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ruma_common::room_id;

    use super::MemoryStore;
    use crate::{
        identities::device::tests::get_device,
        olm::tests::get_account_and_session,
        store::CryptoStore,
    };

    #[tokio::test]
    async fn session_store_cycle() {
        let (account, session) = get_account_and_session().await;
        let store = MemoryStore::new();

        assert!(store.load_account().await.unwrap().is_none());
        store.save_account(account).await.unwrap();

        store.save_sessions(&[session.clone()]).await.unwrap();

        let sessions = store
            .get_sessions(&session.sender_key().to_base64())
            .await
            .unwrap()
            .unwrap();
        let sessions = sessions.lock().await;

        assert_eq!(&session, &sessions[0]);
    }

    #[tokio::test]
    async fn group_session_store_cycle() {
        let (account, _) = get_account_and_session().await;
        let room_id = room_id!("!test:localhost");

        let (outbound, inbound) = account
            .create_group_session_pair(room_id, Default::default())
            .await
            .unwrap();

        let store = MemoryStore::new();
        store.save_inbound_group_sessions(&[inbound.clone()]).await.unwrap();

        let loaded = store
            .get_inbound_group_session(
                room_id,
                &inbound.sender_key().to_base64(),
                outbound.session_id(),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(inbound, loaded);
        assert_eq!(store.get_inbound_group_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn device_store_cycle() {
        let device = get_device().await;
        let store = MemoryStore::new();

        store.save_devices(&[device.clone()]).await.unwrap();

        let loaded = store
            .get_device(device.user_id(), device.device_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device, loaded);

        let user_devices = store.get_user_devices(device.user_id()).await.unwrap();
        assert_eq!(user_devices.keys().next().unwrap(), device.device_id());
    }
}
