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

//! The crypto specific Olm and Megolm objects.
//!
//! Note: You'll only be interested in these if you are implementing a custom
//! `CryptoStore`.

mod account;
mod group_sessions;
mod session;
mod utility;

pub use account::{Account, IdentityKeys, InboundCreationResult, PickledAccount};
pub use group_sessions::{
    EncryptionSettings, ExportedRoomKey, InboundGroupSession, OutboundGroupSession,
    PickledInboundGroupSession, PickledOutboundGroupSession, SessionExportError,
};
pub(crate) use group_sessions::ShareInfo;
pub use session::{PickledSession, Session};
pub(crate) use utility::VerifyJson;

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;
    use ruma_common::{device_id, room_id, user_id, OwnedDeviceId, OwnedUserId};
    use vodozemac::olm::OlmMessage;

    use super::{Account, InboundGroupSession, Session};
    use crate::error::SessionCreationError;

    pub(crate) fn alice_id() -> OwnedUserId {
        user_id!("@alice:example.org").to_owned()
    }

    pub(crate) fn alice_device_id() -> OwnedDeviceId {
        device_id!("ALICEDEVICE").to_owned()
    }

    pub(crate) fn bob_id() -> OwnedUserId {
        user_id!("@bob:example.org").to_owned()
    }

    pub(crate) fn bob_device_id() -> OwnedDeviceId {
        device_id!("BOBDEVICE").to_owned()
    }

    /// Create a pair of accounts with an established session from Alice to
    /// Bob.
    pub(crate) async fn get_account_and_session() -> (Account, Session) {
        let alice = Account::new(alice_id(), alice_device_id());
        let bob = Account::new(bob_id(), bob_device_id());

        bob.generate_one_time_keys_helper(1).await;
        let one_time_key = *bob
            .one_time_keys()
            .await
            .values()
            .next()
            .expect("a one-time key was just generated");
        let sender_key = bob.identity_keys().curve25519;
        let session = alice.create_outbound_session_helper(sender_key, one_time_key).await;

        (alice, session)
    }

    #[test]
    fn account_creation() {
        let account = Account::new(alice_id(), alice_device_id());

        assert!(!account.shared());
        account.mark_as_shared();
        assert!(account.shared());
    }

    #[tokio::test]
    async fn one_time_key_creation() {
        let account = Account::new(alice_id(), alice_device_id());

        assert!(account.one_time_keys().await.is_empty());
        assert_ne!(account.max_one_time_keys().await, 0);

        let generated = account.generate_one_time_keys_if_needed().await;
        assert_ne!(generated, 0);
        assert!(!account.signed_one_time_keys().await.is_empty());

        account.mark_keys_as_published().await;
        assert!(account.one_time_keys().await.is_empty());
    }

    #[tokio::test]
    async fn session_creation() {
        let alice = Account::new(alice_id(), alice_device_id());
        let bob = Account::new(bob_id(), bob_device_id());

        alice.generate_one_time_keys_helper(1).await;
        let one_time_key = *alice.one_time_keys().await.values().next().unwrap();
        alice.mark_keys_as_published().await;

        let mut bob_session = bob
            .create_outbound_session_helper(alice.identity_keys().curve25519, one_time_key)
            .await;

        let plaintext = "Hello world";
        let message = bob_session.encrypt_helper(plaintext).await;

        let prekey_message = assert_matches!(message.clone(), OlmMessage::PreKey(m) => m);

        let result = alice
            .create_inbound_session(bob.identity_keys().curve25519, &prekey_message)
            .await
            .unwrap();

        assert_eq!(bob_session.session_id(), result.session.session_id());
        assert_eq!(plaintext, result.plaintext);
    }

    #[tokio::test]
    async fn group_session_creation() {
        let alice = Account::new(alice_id(), alice_device_id());
        let room_id = room_id!("!test:localhost");

        let (outbound, inbound) = alice
            .create_group_session_pair(room_id, Default::default())
            .await
            .unwrap();

        assert_eq!(0, outbound.message_index().await);
        assert!(!outbound.shared());
        outbound.mark_as_shared();
        assert!(outbound.shared());

        assert_eq!(0, inbound.first_known_index());
        assert_eq!(outbound.session_id(), inbound.session_id());
    }

    #[tokio::test]
    async fn group_session_export_cycle() {
        let alice = Account::new(alice_id(), alice_device_id());
        let room_id = room_id!("!test:localhost");

        let (_, inbound) = alice
            .create_group_session_pair(room_id, Default::default())
            .await
            .unwrap();

        let export = inbound.export().await;
        let imported = InboundGroupSession::from_export(&export).unwrap();

        assert_eq!(inbound.session_id(), imported.session_id());
        assert!(imported.has_been_imported());
    }

    #[tokio::test]
    async fn imports_with_a_mismatched_session_id_are_rejected() {
        let alice = Account::new(alice_id(), alice_device_id());
        let room_id = room_id!("!test:localhost");

        let (_, inbound) = alice
            .create_group_session_pair(room_id, Default::default())
            .await
            .unwrap();

        let mut export = inbound.export().await;
        export.session_id = "somebody+elses+session+id".to_owned();

        assert_matches!(
            InboundGroupSession::from_export(&export),
            Err(SessionCreationError::SessionIdMismatch { .. })
        );
    }
}
