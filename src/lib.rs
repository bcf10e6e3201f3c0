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

//! A no-network state machine for Matrix end-to-end encryption session
//! management.
//!
//! The crate establishes, tracks, and uses pairwise (Olm) and group
//! (Megolm) cryptographic sessions to encrypt and decrypt room messages,
//! keeps per-device trust state, and resolves room-key-sharing requests.
//! The ratchet primitives come from [vodozemac], the network transport and
//! the persistent store are injected by the caller.
//!
//! [vodozemac]: https://github.com/matrix-org/vodozemac

#![warn(
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

pub mod directory;
mod error;
mod identities;
mod key_request;
mod machine;
pub mod olm;
mod requests;
mod session_manager;
pub mod store;
pub mod types;

pub use error::{
    EventError, MegolmError, MegolmResult, OlmError, OlmResult, SessionCreationError,
    SignatureError,
};
pub use identities::{DeviceInfo, DeviceRegistry, UserDevices, VerificationState};
pub use machine::{CryptoMachine, OlmDecryptionResult, RoomEventDecryptionResult};
pub use olm::EncryptionSettings;
pub use requests::{DeviceIdOrAllDevices, OutgoingRequest, ToDeviceRequest};
pub use store::CryptoStoreError;
