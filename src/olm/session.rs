// Copyright 2024 The matrix-e2ee Contributors
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

use std::fmt;

use ruma::MilliSecondsSinceUnixEpoch;
use vodozemac::{
    olm::{OlmMessage, PreKeyMessage, SessionPickle},
    Curve25519PublicKey,
};

use crate::{error::OlmResult, secure_buffer::PicklingKey};

/// A pairwise Double-Ratchet session between our device and one remote
/// device.
///
/// Multiple sessions may exist for the same remote identity key; they are
/// ordered by [`Session::last_received`] descending and the newest one is
/// preferred for encryption.
pub struct Session {
    inner: vodozemac::olm::Session,
    session_id: String,
    sender_key: Curve25519PublicKey,
    last_received: MilliSecondsSinceUnixEpoch,
}

impl Session {
    pub(crate) fn new(
        inner: vodozemac::olm::Session,
        sender_key: Curve25519PublicKey,
        now: MilliSecondsSinceUnixEpoch,
    ) -> Self {
        let session_id = inner.session_id();

        Self { inner, session_id, sender_key, last_received: now }
    }

    /// The unique, opaque identifier of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The Curve25519 identity key of the remote device.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// When the last message was successfully decrypted with this session.
    pub fn last_received(&self) -> MilliSecondsSinceUnixEpoch {
        self.last_received
    }

    /// Encrypt a plaintext, advancing the ratchet.
    ///
    /// The produced message is a pre-key message until the remote device has
    /// answered at least once.
    pub fn encrypt(&mut self, plaintext: &str) -> OlmMessage {
        self.inner.encrypt(plaintext)
    }

    /// Decrypt a message, advancing the ratchet and updating
    /// [`Session::last_received`].
    pub fn decrypt(
        &mut self,
        message: &OlmMessage,
        now: MilliSecondsSinceUnixEpoch,
    ) -> OlmResult<Vec<u8>> {
        let plaintext = self.inner.decrypt(message)?;
        self.last_received = now;

        Ok(plaintext)
    }

    /// Check whether the given pre-key message was created for this session.
    pub fn matches_inbound(&self, message: &PreKeyMessage) -> bool {
        message.session_id() == self.session_id
    }

    /// Check whether the pre-key message was created for this session and
    /// comes from the expected remote identity key.
    pub fn matches_inbound_from(
        &self,
        sender_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> bool {
        self.sender_key == sender_key && self.matches_inbound(message)
    }

    /// Serialize the ratchet state into an opaque string under the pickling
    /// key.
    pub fn pickle(&self, pickling_key: &PicklingKey) -> String {
        self.inner.pickle().encrypt(pickling_key.pickle_key())
    }

    /// Restore a session from a pickle and the metadata stored next to it.
    pub fn from_pickle(
        pickle: &str,
        pickling_key: &PicklingKey,
        sender_key: Curve25519PublicKey,
        last_received: MilliSecondsSinceUnixEpoch,
    ) -> Result<Self, vodozemac::PickleError> {
        let pickle = SessionPickle::from_encrypted(pickle, pickling_key.pickle_key())?;
        let inner = vodozemac::olm::Session::from_pickle(pickle);
        let session_id = inner.session_id();

        Ok(Self { inner, session_id, sender_key, last_received })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id, MilliSecondsSinceUnixEpoch};
    use vodozemac::olm::OlmMessage;

    use super::Session;
    use crate::{olm::Account, secure_buffer::PicklingKey};

    fn now() -> MilliSecondsSinceUnixEpoch {
        MilliSecondsSinceUnixEpoch::now()
    }

    fn session_pair() -> (Account, Account, Session) {
        let alice = Account::new(user_id!("@alice:example.org"), device_id!("ALICE").as_str());
        let mut bob = Account::new(user_id!("@bob:example.org"), device_id!("BOB").as_str());

        bob.generate_one_time_keys(1);
        let one_time_key =
            bob.one_time_keys().values().next().expect("a one-time key was generated").to_base64();
        bob.mark_keys_as_published();

        let session = alice
            .create_outbound_session(&bob.curve25519_key().to_base64(), &one_time_key)
            .unwrap();

        (alice, bob, session)
    }

    #[test]
    fn olm_round_trip() {
        let (alice, mut bob, mut alice_session) = session_pair();

        let message = alice_session.encrypt("it's a secret to everybody");
        let prekey = assert_matches!(&message, OlmMessage::PreKey(m) => m.clone());

        let (mut bob_session, plaintext) =
            bob.create_inbound_session(alice.curve25519_key(), &prekey).unwrap();

        assert_eq!(plaintext, b"it's a secret to everybody");
        assert_eq!(bob_session.session_id(), alice_session.session_id());

        // The reply travels as a normal message and completes the ratchet.
        let reply = bob_session.encrypt("as long as you hold it");
        let decrypted = alice_session.decrypt(&reply, now()).unwrap();
        assert_eq!(decrypted, b"as long as you hold it");
    }

    #[test]
    fn prekey_matching() {
        let (_alice, _bob, mut alice_session) = session_pair();

        let message = alice_session.encrypt("hello");
        let prekey = assert_matches!(message, OlmMessage::PreKey(m) => m);

        assert!(alice_session.matches_inbound(&prekey));
        assert!(!alice_session
            .matches_inbound_from(Account::new(user_id!("@eve:example.org"), "EVE").curve25519_key(), &prekey));
    }

    #[test]
    fn pickle_round_trip_preserves_the_ratchet() {
        let (alice, mut bob, mut alice_session) = session_pair();
        let pickling_key = PicklingKey::generate().unwrap();

        let first = alice_session.encrypt("first");
        let prekey = assert_matches!(&first, OlmMessage::PreKey(m) => m.clone());
        let (mut bob_session, _) =
            bob.create_inbound_session(alice.curve25519_key(), &prekey).unwrap();

        let pickle = bob_session.pickle(&pickling_key);
        let mut restored = Session::from_pickle(
            &pickle,
            &pickling_key,
            bob_session.sender_key(),
            bob_session.last_received(),
        )
        .unwrap();

        assert_eq!(restored.session_id(), bob_session.session_id());

        // The restored ratchet can still talk to the other side.
        let message = alice_session.encrypt("second");
        let decrypted = restored.decrypt(&message, now()).unwrap();
        assert_eq!(decrypted, b"second");
    }
}
