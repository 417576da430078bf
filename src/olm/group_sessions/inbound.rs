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

use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use vodozemac::megolm::{
    ExportedSessionKey, InboundGroupSessionPickle, MegolmMessage, SessionConfig, SessionKey,
};

use crate::{error::MegolmResult, secure_buffer::PicklingKey};

/// Where an inbound group session's key material came from.
///
/// Sessions delivered over a pairwise channel remember the Olm session that
/// carried them; the two reserved markers cover sessions we generated
/// ourselves and sessions restored from a server-side backup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Delivered through the Olm session with the given id.
    Olm(String),
    /// Created locally as the decrypting half of our own outbound session.
    SelfGenerated,
    /// Imported from a server-side key backup.
    Backup,
}

impl SessionOrigin {
    const SELF_MARKER: &'static str = "SELF";
    const BACKUP_MARKER: &'static str = "BACKUP";

    pub fn as_str(&self) -> &str {
        match self {
            Self::Olm(session_id) => session_id,
            Self::SelfGenerated => Self::SELF_MARKER,
            Self::Backup => Self::BACKUP_MARKER,
        }
    }

    pub fn from_string(value: String) -> Self {
        match value.as_str() {
            Self::SELF_MARKER => Self::SelfGenerated,
            Self::BACKUP_MARKER => Self::Backup,
            _ => Self::Olm(value),
        }
    }
}

/// The symmetric ratchet used to decrypt one sender's messages in one room.
///
/// There is exactly one inbound session per (room, session id); the store
/// rejects duplicates.
pub struct InboundGroupSession {
    inner: vodozemac::megolm::InboundGroupSession,
    session_id: String,
    first_known_index: u32,
    room_id: OwnedRoomId,
    sender_id: OwnedUserId,
    /// The Curve25519 key of the device that created the session.
    pub sender_key: String,
    /// The Ed25519 key the sender claimed when it delivered the session.
    pub sender_claimed_ed25519_key: Option<String>,
    pub origin: SessionOrigin,
}

impl InboundGroupSession {
    /// Create an inbound session from a session-key payload delivered by a
    /// room-key event, or generated by our own outbound session.
    pub fn new(
        room_id: &RoomId,
        sender_id: &UserId,
        sender_key: String,
        sender_claimed_ed25519_key: Option<String>,
        origin: SessionOrigin,
        session_key: &SessionKey,
    ) -> Self {
        let inner =
            vodozemac::megolm::InboundGroupSession::new(session_key, SessionConfig::version_1());

        Self {
            session_id: inner.session_id(),
            first_known_index: inner.first_known_index(),
            inner,
            room_id: room_id.to_owned(),
            sender_id: sender_id.to_owned(),
            sender_key,
            sender_claimed_ed25519_key,
            origin,
        }
    }

    /// Import a session from an exported-at payload, e.g. one produced by
    /// [`InboundGroupSession::export_at`] or downloaded from a backup.
    ///
    /// Imported sessions can only decrypt from the export index onwards.
    pub fn import(
        room_id: &RoomId,
        sender_id: &UserId,
        sender_key: String,
        sender_claimed_ed25519_key: Option<String>,
        session_key: &ExportedSessionKey,
    ) -> Self {
        let inner =
            vodozemac::megolm::InboundGroupSession::import(session_key, SessionConfig::version_1());

        Self {
            session_id: inner.session_id(),
            first_known_index: inner.first_known_index(),
            inner,
            room_id: room_id.to_owned(),
            sender_id: sender_id.to_owned(),
            sender_key,
            sender_claimed_ed25519_key,
            origin: SessionOrigin::Backup,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn sender_id(&self) -> &UserId {
        &self.sender_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The first message index this session can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Decrypt a base64 Megolm message, advancing the ratchet to the needed
    /// index.
    ///
    /// Decrypting below [`InboundGroupSession::first_known_index`] fails.
    pub fn decrypt(&mut self, ciphertext: &str) -> MegolmResult<(Vec<u8>, u32)> {
        let message = MegolmMessage::from_base64(ciphertext)?;
        let decrypted = self.inner.decrypt(&message)?;

        Ok((decrypted.plaintext, decrypted.message_index))
    }

    /// Export the ratchet at the given message index.
    ///
    /// Returns `None` if the index lies before the first known one.
    pub fn export_at(&mut self, message_index: u32) -> Option<ExportedSessionKey> {
        self.inner.export_at(message_index)
    }

    /// Serialize the ratchet state into an opaque string under the pickling
    /// key.
    pub fn pickle(&self, pickling_key: &PicklingKey) -> String {
        self.inner.pickle().encrypt(pickling_key.pickle_key())
    }

    /// Restore a session from a pickle and the metadata stored next to it.
    #[allow(clippy::too_many_arguments)]
    pub fn from_pickle(
        pickle: &str,
        pickling_key: &PicklingKey,
        room_id: &RoomId,
        sender_id: &UserId,
        sender_key: String,
        sender_claimed_ed25519_key: Option<String>,
        origin: SessionOrigin,
    ) -> Result<Self, vodozemac::PickleError> {
        let pickle = InboundGroupSessionPickle::from_encrypted(pickle, pickling_key.pickle_key())?;
        let inner = vodozemac::megolm::InboundGroupSession::from_pickle(pickle);

        Ok(Self {
            session_id: inner.session_id(),
            first_known_index: inner.first_known_index(),
            inner,
            room_id: room_id.to_owned(),
            sender_id: sender_id.to_owned(),
            sender_key,
            sender_claimed_ed25519_key,
            origin,
        })
    }
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("origin", &self.origin)
            .finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{room_id, user_id};

    use super::{InboundGroupSession, SessionOrigin};
    use crate::{
        error::MegolmError,
        olm::{EncryptionSettings, OutboundGroupSession},
        secure_buffer::PicklingKey,
    };

    fn session_pair() -> (OutboundGroupSession, InboundGroupSession) {
        let room_id = room_id!("!test:example.org");
        let outbound = OutboundGroupSession::new(room_id, EncryptionSettings::default());

        let inbound = InboundGroupSession::new(
            room_id,
            user_id!("@alice:example.org"),
            "sender-curve-key".to_owned(),
            Some("sender-ed-key".to_owned()),
            SessionOrigin::SelfGenerated,
            &outbound.session_key(),
        );

        (outbound, inbound)
    }

    #[test]
    fn group_round_trip() {
        let (mut outbound, mut inbound) = session_pair();

        assert_eq!(outbound.session_id(), inbound.session_id());
        assert_eq!(inbound.first_known_index(), 0);

        let ciphertext = outbound.encrypt("a room message").to_base64();
        let (plaintext, index) = inbound.decrypt(&ciphertext).unwrap();

        assert_eq!(plaintext, b"a room message");
        assert_eq!(index, 0);
    }

    #[test]
    fn imported_sessions_cannot_rewind() {
        let (mut outbound, mut inbound) = session_pair();

        let early = outbound.encrypt("early").to_base64();
        let _ = outbound.encrypt("skipped");
        let late = outbound.encrypt("late").to_base64();

        let exported = inbound.export_at(2).unwrap();
        let mut imported = InboundGroupSession::import(
            inbound.room_id(),
            inbound.sender_id(),
            inbound.sender_key.clone(),
            inbound.sender_claimed_ed25519_key.clone(),
            &exported,
        );

        assert_eq!(imported.origin, SessionOrigin::Backup);
        assert_eq!(imported.first_known_index(), 2);

        let (plaintext, index) = imported.decrypt(&late).unwrap();
        assert_eq!(plaintext, b"late");
        assert_eq!(index, 2);

        assert_matches!(imported.decrypt(&early), Err(MegolmError::Decryption(_)));
    }

    #[test]
    fn origin_markers_round_trip() {
        assert_eq!(SessionOrigin::SelfGenerated.as_str(), "SELF");
        assert_eq!(SessionOrigin::Backup.as_str(), "BACKUP");
        assert_eq!(SessionOrigin::Olm("abc".to_owned()).as_str(), "abc");

        for origin in [
            SessionOrigin::SelfGenerated,
            SessionOrigin::Backup,
            SessionOrigin::Olm("abc".to_owned()),
        ] {
            assert_eq!(SessionOrigin::from_string(origin.as_str().to_owned()), origin);
        }
    }

    #[test]
    fn pickle_round_trip_preserves_the_ratchet() {
        let (mut outbound, inbound) = session_pair();
        let pickling_key = PicklingKey::generate().unwrap();

        let pickle = inbound.pickle(&pickling_key);
        let mut restored = InboundGroupSession::from_pickle(
            &pickle,
            &pickling_key,
            inbound.room_id(),
            inbound.sender_id(),
            inbound.sender_key.clone(),
            inbound.sender_claimed_ed25519_key.clone(),
            inbound.origin.clone(),
        )
        .unwrap();

        assert_eq!(restored.session_id(), inbound.session_id());
        assert_eq!(restored.first_known_index(), inbound.first_known_index());

        let ciphertext = outbound.encrypt("still readable").to_base64();
        let (plaintext, _) = restored.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, b"still readable");
    }
}
