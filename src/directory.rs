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

//! The abstract key-directory service this crate exchanges key material
//! through.
//!
//! The transport behind the trait is expected to be cancellable and
//! timeout-bound, this crate never retries on its own.

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use ruma_common::OwnedUserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{DeviceKeys, SignedKey, UserDeviceMap};

/// Error describing why a key-directory request didn't produce a response.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The request never reached the directory or the response never
    /// arrived. Retrying is expected to eventually succeed.
    #[error("the key-directory request failed: {0}")]
    NetworkFailure(String),

    /// The directory understood the request and refused it. Retrying the
    /// same request won't help.
    #[error("the key-directory rejected the request: {0}")]
    Rejected(String),
}

impl DirectoryError {
    /// Can the failed request be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkFailure(_))
    }
}

/// The response to a device-list download.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// The downloaded device keys, per user and device.
    #[serde(default)]
    pub device_keys: UserDeviceMap<DeviceKeys>,
    /// Servers that couldn't be reached, keyed by server name.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// The response to a one-time key claim.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// The claimed one-time keys, per user and device, keyed by
    /// `<algorithm>:<key_id>`.
    #[serde(default)]
    pub one_time_keys: UserDeviceMap<BTreeMap<String, SignedKey>>,
    /// Servers that couldn't be reached, keyed by server name.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// The body of a key upload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// Our signed device keys, uploaded once per device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// Fresh signed one-time keys, keyed by `<algorithm>:<key_id>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<String, SignedKey>,
}

/// The response to a key upload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// How many unclaimed one-time keys the directory now holds for us, per
    /// algorithm.
    #[serde(default)]
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// The key-directory service.
///
/// Implementations talk to a Matrix homeserver's `/keys/*` endpoints, tests
/// answer from fixtures. Concurrent calls for overlapping user sets are
/// allowed to race, the state updates driven by the responses are atomic per
/// device.
#[async_trait]
pub trait KeyDirectory: Debug + Send + Sync {
    /// Download the device lists of the given users.
    async fn download_keys(
        &self,
        users: &[OwnedUserId],
    ) -> Result<KeysQueryResponse, DirectoryError>;

    /// Claim a one-time key for each of the given devices.
    ///
    /// The map holds the wanted key algorithm per device, usually
    /// `signed_curve25519`.
    async fn claim_one_time_keys(
        &self,
        one_time_keys: &UserDeviceMap<String>,
    ) -> Result<KeysClaimResponse, DirectoryError>;

    /// Upload our own device keys and fresh one-time keys.
    async fn upload_keys(
        &self,
        request: KeysUploadRequest,
    ) -> Result<KeysUploadResponse, DirectoryError>;
}
