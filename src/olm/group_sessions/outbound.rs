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

use std::{fmt, time::Duration};

use ruma::{MilliSecondsSinceUnixEpoch, OwnedRoomId, RoomId};
use vodozemac::megolm::{GroupSessionPickle, MegolmMessage, SessionConfig, SessionKey};

use crate::{secure_buffer::PicklingKey, types::RoomEncryptionContent, types::MEGOLM_V1_AES_SHA2};

const ROTATION_PERIOD: Duration = Duration::from_millis(604_800_000);
const ROTATION_MESSAGES: u64 = 100;

/// The rotation policy for the outbound group session of a room.
///
/// Taken from the room's `m.room.encryption` state event, with the spec
/// defaults of one week and a hundred messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptionSettings {
    pub algorithm: String,
    pub rotation_period: Duration,
    pub rotation_period_msgs: u64,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
        }
    }
}

impl From<&RoomEncryptionContent> for EncryptionSettings {
    fn from(content: &RoomEncryptionContent) -> Self {
        Self {
            algorithm: content.algorithm.clone(),
            rotation_period: content
                .rotation_period_ms
                .map_or(ROTATION_PERIOD, Duration::from_millis),
            rotation_period_msgs: content.rotation_period_msgs.unwrap_or(ROTATION_MESSAGES),
        }
    }
}

/// The symmetric ratchet encrypting the messages this device sends to one
/// room.
///
/// At most one current outbound session exists per room; it is rotated once
/// it hits the message count or age limit of its [`EncryptionSettings`].
pub struct OutboundGroupSession {
    inner: vodozemac::megolm::GroupSession,
    session_id: String,
    room_id: OwnedRoomId,
    creation_time: MilliSecondsSinceUnixEpoch,
    message_count: u64,
    settings: EncryptionSettings,
}

impl OutboundGroupSession {
    pub fn new(room_id: &RoomId, settings: EncryptionSettings) -> Self {
        let inner = vodozemac::megolm::GroupSession::new(SessionConfig::version_1());

        Self {
            session_id: inner.session_id(),
            inner,
            room_id: room_id.to_owned(),
            creation_time: MilliSecondsSinceUnixEpoch::now(),
            message_count: 0,
            settings,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn creation_time(&self) -> MilliSecondsSinceUnixEpoch {
        self.creation_time
    }

    /// The number of messages encrypted with this session so far.
    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// The message index the next encrypted message will use.
    pub fn message_index(&self) -> u32 {
        self.inner.message_index()
    }

    /// The ratchet key for the next message, in the form shipped to other
    /// devices in a room-key event.
    pub fn session_key(&self) -> SessionKey {
        self.inner.session_key()
    }

    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    /// Encrypt a plaintext, advancing the ratchet and the message counter.
    pub fn encrypt(&mut self, plaintext: &str) -> MegolmMessage {
        self.message_count += 1;
        self.inner.encrypt(plaintext)
    }

    /// Whether the session has to be rotated before the next message.
    pub fn expired(&self, now: MilliSecondsSinceUnixEpoch) -> bool {
        let age = now
            .get()
            .checked_sub(self.creation_time.get())
            .map_or(Duration::ZERO, |ms| Duration::from_millis(ms.into()));

        self.message_count >= self.settings.rotation_period_msgs
            || age >= self.settings.rotation_period
    }

    /// Serialize the ratchet state into an opaque string under the pickling
    /// key.
    pub fn pickle(&self, pickling_key: &PicklingKey) -> String {
        self.inner.pickle().encrypt(pickling_key.pickle_key())
    }

    /// Restore a session from a pickle and the metadata stored next to it.
    ///
    /// The rotation settings come from the room's current state rather than
    /// the store.
    pub fn from_pickle(
        pickle: &str,
        pickling_key: &PicklingKey,
        room_id: &RoomId,
        creation_time: MilliSecondsSinceUnixEpoch,
        message_count: u64,
        settings: EncryptionSettings,
    ) -> Result<Self, vodozemac::PickleError> {
        let pickle = GroupSessionPickle::from_encrypted(pickle, pickling_key.pickle_key())?;
        let inner = vodozemac::megolm::GroupSession::from_pickle(pickle);

        Ok(Self {
            session_id: inner.session_id(),
            inner,
            room_id: room_id.to_owned(),
            creation_time,
            message_count,
            settings,
        })
    }
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ruma::{room_id, MilliSecondsSinceUnixEpoch, UInt};

    use super::{EncryptionSettings, OutboundGroupSession, ROTATION_MESSAGES, ROTATION_PERIOD};
    use crate::types::RoomEncryptionContent;

    #[test]
    fn encryption_settings_conversion() {
        let mut content = RoomEncryptionContent {
            algorithm: "m.megolm.v1.aes-sha2".to_owned(),
            rotation_period_ms: None,
            rotation_period_msgs: None,
        };

        let settings = EncryptionSettings::from(&content);
        assert_eq!(settings.rotation_period, ROTATION_PERIOD);
        assert_eq!(settings.rotation_period_msgs, ROTATION_MESSAGES);

        content.rotation_period_ms = Some(3600);
        content.rotation_period_msgs = Some(500);

        let settings = EncryptionSettings::from(&content);
        assert_eq!(settings.rotation_period, Duration::from_millis(3600));
        assert_eq!(settings.rotation_period_msgs, 500);
    }

    #[test]
    fn rotation_by_message_count() {
        let settings =
            EncryptionSettings { rotation_period_msgs: 2, ..EncryptionSettings::default() };
        let mut session = OutboundGroupSession::new(room_id!("!test:example.org"), settings);
        let now = MilliSecondsSinceUnixEpoch::now();

        assert!(!session.expired(now));

        session.encrypt("one");
        assert!(!session.expired(now));

        session.encrypt("two");
        assert!(session.expired(now));
    }

    #[test]
    fn rotation_by_age() {
        let settings = EncryptionSettings {
            rotation_period: Duration::from_millis(10_000),
            ..EncryptionSettings::default()
        };
        let session = OutboundGroupSession::new(room_id!("!test:example.org"), settings);

        let now = session.creation_time();
        assert!(!session.expired(now));

        let later = MilliSecondsSinceUnixEpoch(now.get() + UInt::from(10_000u32));
        assert!(session.expired(later));
    }

    #[test]
    fn message_index_advances_with_the_counter() {
        let mut session =
            OutboundGroupSession::new(room_id!("!test:example.org"), EncryptionSettings::default());

        assert_eq!(session.message_index(), 0);
        session.encrypt("first");
        assert_eq!(session.message_index(), 1);
        assert_eq!(session.message_count(), 1);
    }
}
