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

//! The persistent crypto store, consumed as an abstract key-value interface.

pub mod caches;
pub mod memorystore;

use std::{fmt::Debug, io::Error as IoError, ops::Deref, sync::Arc};

use async_trait::async_trait;
use ruma_common::{DeviceId, RoomId, UserId};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::sync::Mutex;

pub use memorystore::MemoryStore;

use crate::{
    identities::{Device, DeviceInfo, UserDevices},
    olm::{Account, InboundGroupSession, OutboundGroupSession, Session},
};

/// Error describing what went wrong while reading or writing the crypto
/// store.
#[derive(Error, Debug)]
pub enum CryptoStoreError {
    /// The store couldn't be reached.
    #[error("can't read or write from the store")]
    Io(#[from] IoError),

    /// A stored value couldn't be serialized or deserialized.
    #[error("error serializing data for the store")]
    Serialization(#[from] SerdeError),

    /// A stored ratchet snapshot couldn't be restored.
    #[error("error restoring a pickled session")]
    Pickle(#[from] vodozemac::PickleError),

    /// Sessions can only be stored after the account they belong to.
    #[error("can't save sessions in the store before an account is stored")]
    AccountUnset,
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, CryptoStoreError>;

/// The abstract persistence interface this crate reads and writes its state
/// through.
///
/// All the mutations are upserts scoped to a single key, a store
/// implementation never needs cross-key transactions.
#[async_trait]
pub trait CryptoStore: Debug + Send + Sync {
    /// Load an account that was previously stored.
    async fn load_account(&self) -> Result<Option<Account>>;

    /// Save the given account in the store.
    async fn save_account(&self, account: Account) -> Result<()>;

    /// Save the given pairwise sessions in the store.
    async fn save_sessions(&self, sessions: &[Session]) -> Result<()>;

    /// Get all the pairwise sessions established with the device owning the
    /// given curve25519 key.
    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>>;

    /// Save the given inbound group sessions in the store.
    async fn save_inbound_group_sessions(
        &self,
        sessions: &[InboundGroupSession],
    ) -> Result<()>;

    /// Get the inbound group session with the given identifying triple.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Get all the inbound group sessions the store holds.
    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>>;

    /// Save the given outbound group session in the store.
    async fn save_outbound_group_session(&self, session: OutboundGroupSession) -> Result<()>;

    /// Get the current outbound group session of the given room.
    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>>;

    /// Save the given device records in the store.
    ///
    /// Records are merged by device id, a device that is already known keeps
    /// its local trust decision.
    async fn save_devices(&self, devices: &[DeviceInfo]) -> Result<()>;

    /// Get the device record for the given user/device pair.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceInfo>>;

    /// Get a snapshot of all the device records of the given user.
    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices>;

    /// Save a generic string value under the given key.
    async fn save_value(&self, key: String, value: String) -> Result<()>;

    /// Get a generic string value stored under the given key.
    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    /// Remove the generic string value stored under the given key.
    async fn remove_value(&self, key: &str) -> Result<()>;
}

/// A shared handle to the crypto store, enriched with typed helpers.
#[derive(Clone, Debug)]
pub struct Store {
    inner: Arc<dyn CryptoStore>,
}

impl Store {
    /// Wrap the given store implementation.
    pub fn new(inner: Arc<dyn CryptoStore>) -> Self {
        Self { inner }
    }

    /// Get the device record for the given pair, wrapped so it can encrypt.
    pub(crate) async fn get_device_wrapped(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<Device>> {
        Ok(self
            .get_device(user_id, device_id)
            .await?
            .map(|inner| Device { inner, store: self.clone() }))
    }

    /// Wrap a device record so it can encrypt through our sessions.
    pub(crate) fn wrap_device(&self, inner: DeviceInfo) -> Device {
        Device { inner, store: self.clone() }
    }

    /// Store a serializable object under the given key.
    pub(crate) async fn save_object(
        &self,
        key: &str,
        value: &impl Serialize,
    ) -> Result<()> {
        self.save_value(key.to_owned(), serde_json::to_string(value)?).await
    }

    /// Load a serializable object stored under the given key.
    pub(crate) async fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_value(key)
            .await?
            .map(|v| serde_json::from_str(&v).map_err(CryptoStoreError::from))
            .transpose()
    }

    /// Remove the object stored under the given key.
    pub(crate) async fn delete_object(&self, key: &str) -> Result<()> {
        self.remove_value(key).await
    }
}

impl Deref for Store {
    type Target = dyn CryptoStore;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}
