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

use ruma_common::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{directory::DirectoryError, store::CryptoStoreError, types::EventEncryptionAlgorithm};

/// Result type for device to device cryptographic operations.
pub type OlmResult<T> = std::result::Result<T, OlmError>;
/// Result type for group cryptographic operations.
pub type MegolmResult<T> = std::result::Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// A new pairwise session couldn't be created.
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// The key-directory service returned an error.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The message was successfully matched to a session, or no session could
    /// decrypt it, but the ciphertext itself could not be handled.
    ///
    /// This is terminal for the event, the sender needs to establish a fresh
    /// session with us.
    #[error("decryption failed because the Olm message from {0} with sender key {1} is bad: {2}")]
    BadEncryptedMessage(OwnedUserId, Curve25519PublicKey, &'static str),

    /// Encryption failed because the device does not have a valid Olm session
    /// with us.
    #[error(
        "encryption failed because the device does not \
            have a valid Olm session with us"
    )]
    MissingSession,
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// Decryption failed because we don't have the inbound group session the
    /// message was encrypted with.
    #[error("can't find the inbound group session {0} to decrypt the event")]
    UnknownInboundSessionId(String),

    /// The message index of the event was already used up by a previous
    /// message, someone may be replaying an old ciphertext.
    #[error(
        "the message with the index {index} of the session {session_id} \
        was already decrypted"
    )]
    ReplayedMessage {
        /// The unique id of the session that noticed the replay.
        session_id: String,
        /// The message index that was replayed.
        index: u32,
    },

    /// Room message encryption was attempted before the outbound group
    /// session was created and shared.
    #[error("the outbound group session for the room is missing or wasn't yet shared")]
    MissingOutboundSession,

    /// Sharing the room key with the recipient devices failed.
    #[error("sharing the room key with the recipient devices failed: {0}")]
    KeyShare(Box<OlmError>),

    /// The encrypted Megolm message couldn't be decrypted by the ratchet.
    #[error(transparent)]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error that occurs when an encrypted event or its decrypted payload is
/// malformed or fails one of the payload checks.
#[derive(Error, Debug)]
pub enum EventError {
    /// The event has been encrypted with an algorithm we don't support.
    #[error("the Encrypted message has been encrypted with an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The decrypted payload wasn't a JSON object.
    #[error("the decrypted payload isn't a JSON object")]
    NotAnObject,

    /// The event doesn't carry a per-recipient ciphertext map.
    #[error("the Encrypted message doesn't contain any ciphertext")]
    MissingCiphertext,

    /// The event doesn't carry the curve25519 key of the sending device.
    #[error("the Encrypted message is missing the sender key")]
    MissingSenderKey,

    /// The per-recipient ciphertext map doesn't contain an entry for our own
    /// identity key.
    #[error("the Encrypted message doesn't contain a ciphertext for our device")]
    NotInRecipients,

    /// The ciphertext entry for our device, or a field of the decrypted
    /// payload, has a missing or ill-shaped value.
    #[error("the Olm message for our device is malformed")]
    MalformedMessage,

    /// The decrypted payload names a different recipient than us.
    #[error("the intended recipient of the event doesn't match, expected {0}, got {1}")]
    BadRecipient(OwnedUserId, OwnedUserId),

    /// The decrypted payload names a different recipient ed25519 key than
    /// ours.
    #[error("the intended recipient key of the event doesn't match, expected {0}, got {1}")]
    BadRecipientKey(Box<Ed25519PublicKey>, String),

    /// The sender in the decrypted payload doesn't match the sender of the
    /// encrypted event, someone may be forwarding messages they shouldn't.
    #[error(
        "the sender of the plaintext doesn't match the sender of the \
        encrypted message, expected {0}, got {1}"
    )]
    ForwardedMessageMismatch(OwnedUserId, OwnedUserId),

    /// The room id in the decrypted payload doesn't match the room the event
    /// was received in.
    #[error(
        "the room id of the decrypted payload doesn't match the room id of \
        the event, expected {0}, got {1:?}"
    )]
    BadRoom(OwnedRoomId, Option<OwnedRoomId>),

    /// The decrypted payload is missing one of its required fields.
    #[error("the decrypted payload is missing the field {0}")]
    MissingProperty(String),
}

/// Error that occurs when a new cryptographic session can't be established.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// A pairwise session should have been created, but the claimed one-time
    /// key is missing.
    #[error(
        "tried to create a new Olm session for {0} {1}, but the signed \
        one-time key is missing"
    )]
    OneTimeKeyMissing(OwnedUserId, OwnedDeviceId),

    /// The claimed one-time key failed its signature check.
    #[error(
        "failed to verify the signature of a one-time key for the \
        device {0} {1}"
    )]
    InvalidSignature(OwnedUserId, OwnedDeviceId),

    /// The remote device doesn't advertise a curve25519 identity key.
    #[error(
        "tried to create an Olm session for {0} {1}, but the device is \
        missing a curve25519 key"
    )]
    DeviceMissingCurveKey(OwnedUserId, OwnedDeviceId),

    /// The session id derived from the imported session key doesn't match
    /// the session id the key was advertised under.
    #[error(
        "the session id of the imported session key doesn't match, \
        declared {declared}, derived {derived}"
    )]
    SessionIdMismatch {
        /// The session id the key was declared to belong to.
        declared: String,
        /// The session id that the session key itself derives to.
        derived: String,
    },

    /// A group session was requested for an algorithm we can't construct.
    #[error("the given algorithm {0} can't be used to create a group session")]
    Algorithm(EventEncryptionAlgorithm),

    /// The ratchet rejected the pre-key message while creating an inbound
    /// session.
    #[error(transparent)]
    InboundCreation(#[from] vodozemac::olm::SessionCreationError),

    /// The given key isn't a valid curve25519 key.
    #[error(transparent)]
    InvalidCurveKey(#[from] vodozemac::KeyError),

    /// The one-time key couldn't be deserialized.
    #[error(transparent)]
    InvalidJson(#[from] serde_json::Error),
}

/// Error that occurs when a signature on a JSON object can't be verified.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signed JSON value wasn't an object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The object doesn't contain a signature made by the expected signer.
    #[error("the provided JSON object doesn't contain the expected signature")]
    NoSignatureFound,

    /// The signature is valid base64, but not a valid ed25519 signature.
    #[error("the signature can't be decoded: {0}")]
    InvalidSignature(String),

    /// The signature didn't match the signed object.
    #[error(transparent)]
    VerificationError(#[from] vodozemac::SignatureError),

    /// The object couldn't be serialized into its canonical form.
    #[error(transparent)]
    JsonError(#[from] SerdeError),
}
