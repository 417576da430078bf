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

//! The versioned, single-file store holding all long-lived crypto state of
//! one (user, device) pair.
//!
//! Ratchet state is stored pickled under the pickling key; the key itself
//! lives in the OS credential store and never touches the database file.

mod migrations;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
};

use rusqlite::{params, Connection, OptionalExtension};
use ruma::{
    DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId, RoomId,
    UInt, UserId,
};
use tracing::{debug, error, warn};
use vodozemac::Curve25519PublicKey;

pub use migrations::SCHEMA_VERSION;

use crate::{
    ciphers::{aes_ctr_256_decrypt, aes_ctr_256_encrypt, random_iv, AES_BLOCK_SIZE},
    error::{StoreError, StoreResult},
    identities::TrackedDevice,
    olm::{
        Account, EncryptionSettings, InboundGroupSession, OutboundGroupSession, Session,
        SessionOrigin,
    },
    secure_buffer::PicklingKey,
    utilities::{decode, encode},
};

fn ts_to_i64(ts: MilliSecondsSinceUnixEpoch) -> i64 {
    u64::from(ts.get()) as i64
}

fn ts_from_i64(value: i64) -> MilliSecondsSinceUnixEpoch {
    MilliSecondsSinceUnixEpoch(UInt::try_from(value.max(0)).unwrap_or(UInt::MAX))
}

/// The on-disk store of one (user, device) pair.
pub struct CryptoStore {
    conn: Connection,
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    pickling_key: PicklingKey,
}

impl CryptoStore {
    /// Open (or create) the store under the given application data
    /// directory, applying any pending schema migrations.
    ///
    /// The file lives at `<data_dir>/<user id with colons replaced by
    /// underscores>/quotient_<device id>.db3`.
    pub fn open(
        data_dir: &Path,
        user_id: &UserId,
        device_id: &DeviceId,
        pickling_key: PicklingKey,
    ) -> StoreResult<Self> {
        let dir = data_dir.join(user_id.as_str().replace(':', "_"));
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("quotient_{device_id}.db3"));
        debug!(path = %path.display(), "Opening the crypto store");

        let mut conn = Connection::open(path)?;
        migrations::run(&mut conn, user_id.as_str(), device_id.as_str())?;

        Ok(Self {
            conn,
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            pickling_key,
        })
    }

    /// The schema version of the open store.
    pub fn schema_version(&self) -> StoreResult<u32> {
        migrations::version(&self.conn)
    }

    fn with_transaction<T>(
        &mut self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let tx = self.conn.transaction()?;

        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                error!(error = %e, "Rolling back a store transaction");
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Account

    pub fn save_account(&mut self, account: &Account) -> StoreResult<()> {
        let pickle = account.pickle(&self.pickling_key);

        self.with_transaction(|tx| {
            tx.execute("DELETE FROM accounts", [])?;
            tx.execute("INSERT INTO accounts(pickle) VALUES (?1)", params![pickle])?;
            Ok(())
        })
    }

    pub fn load_account(&mut self) -> StoreResult<Option<Account>> {
        let pickle: Option<String> = self
            .conn
            .query_row("SELECT pickle FROM accounts", [], |row| row.get(0))
            .optional()?;

        pickle
            .map(|pickle| {
                Account::from_pickle(
                    &pickle,
                    &self.pickling_key,
                    &self.user_id,
                    self.device_id.as_str(),
                )
                .map_err(StoreError::from)
            })
            .transpose()
    }

    // ------------------------------------------------------------------
    // Olm sessions

    pub fn save_olm_session(&mut self, session: &Session) -> StoreResult<()> {
        let pickle = session.pickle(&self.pickling_key);
        let sender_key = session.sender_key().to_base64();
        let last_received = ts_to_i64(session.last_received());
        let session_id = session.session_id().to_owned();

        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO olm_sessions(sender_key, session_id, pickle, last_received) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![sender_key, session_id, pickle, last_received],
            )?;
            Ok(())
        })
    }

    pub fn update_olm_session(&mut self, session: &Session) -> StoreResult<()> {
        let pickle = session.pickle(&self.pickling_key);
        let sender_key = session.sender_key().to_base64();
        let session_id = session.session_id().to_owned();

        self.with_transaction(|tx| {
            tx.execute(
                "UPDATE olm_sessions SET pickle = ?1 WHERE sender_key = ?2 AND session_id = ?3",
                params![pickle, sender_key, session_id],
            )?;
            Ok(())
        })
    }

    pub fn set_olm_session_last_received(
        &mut self,
        session_id: &str,
        last_received: MilliSecondsSinceUnixEpoch,
    ) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE olm_sessions SET last_received = ?1 WHERE session_id = ?2",
            params![ts_to_i64(last_received), session_id],
        )?;
        Ok(())
    }

    /// Load every Olm session, grouped by the remote identity key and
    /// ordered newest-first.
    pub fn load_olm_sessions(&mut self) -> StoreResult<HashMap<String, Vec<Session>>> {
        let mut statement = self.conn.prepare(
            "SELECT sender_key, pickle, last_received FROM olm_sessions \
             ORDER BY last_received DESC",
        )?;

        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?.unwrap_or_default(),
            ))
        })?;

        let mut sessions: HashMap<String, Vec<Session>> = HashMap::new();

        for row in rows {
            let (sender_key, pickle, last_received) = row?;

            let key = match Curve25519PublicKey::from_base64(&sender_key) {
                Ok(key) => key,
                Err(e) => {
                    warn!(%sender_key, error = %e, "Skipping an Olm session with a corrupt sender key");
                    continue;
                }
            };

            match Session::from_pickle(&pickle, &self.pickling_key, key, ts_from_i64(last_received))
            {
                Ok(session) => sessions.entry(sender_key).or_default().push(session),
                Err(e) => warn!(error = %e, "Failed to unpickle an Olm session"),
            }
        }

        Ok(sessions)
    }

    // ------------------------------------------------------------------
    // Inbound group sessions

    /// Persist an inbound group session.
    ///
    /// There can only be one session per (room, session id); a second one
    /// is rejected with an integrity violation and the stored row stays.
    pub fn save_inbound_group_session(
        &mut self,
        session: &InboundGroupSession,
    ) -> StoreResult<()> {
        let pickle = session.pickle(&self.pickling_key);

        self.with_transaction(|tx| {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM inbound_megolm_sessions WHERE room_id = ?1 AND session_id = ?2",
                    params![session.room_id().as_str(), session.session_id()],
                    |row| row.get(0),
                )
                .optional()?;

            if exists.is_some() {
                return Err(StoreError::IntegrityViolation(format!(
                    "an inbound group session with the id {} already exists in room {}",
                    session.session_id(),
                    session.room_id(),
                )));
            }

            tx.execute(
                "INSERT INTO inbound_megolm_sessions\
                 (room_id, session_id, pickle, olm_session_id, sender_id, sender_key, sender_claimed_ed25519_key) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.room_id().as_str(),
                    session.session_id(),
                    pickle,
                    session.origin.as_str(),
                    session.sender_id().as_str(),
                    session.sender_key,
                    session.sender_claimed_ed25519_key,
                ],
            )?;

            Ok(())
        })
    }

    pub fn load_inbound_group_sessions(
        &mut self,
        room_id: &RoomId,
    ) -> StoreResult<Vec<InboundGroupSession>> {
        let mut statement = self.conn.prepare(
            "SELECT session_id, pickle, olm_session_id, sender_id, sender_key, \
                    sender_claimed_ed25519_key \
             FROM inbound_megolm_sessions WHERE room_id = ?1",
        )?;

        let rows = statement.query_map(params![room_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut sessions = Vec::new();

        for row in rows {
            let (session_id, pickle, origin, sender_id, sender_key, claimed_key) = row?;

            let sender_id = match sender_id.and_then(|s| OwnedUserId::try_from(s).ok()) {
                Some(sender) => sender,
                None => {
                    warn!(%session_id, "Skipping an inbound group session without a sender id");
                    continue;
                }
            };

            let origin = SessionOrigin::from_string(origin.unwrap_or_default());

            match InboundGroupSession::from_pickle(
                &pickle,
                &self.pickling_key,
                room_id,
                &sender_id,
                sender_key.unwrap_or_default(),
                claimed_key,
                origin,
            ) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(%session_id, error = %e, "Failed to unpickle a megolm session"),
            }
        }

        Ok(sessions)
    }

    pub fn get_inbound_group_session(
        &mut self,
        room_id: &RoomId,
        session_id: &str,
    ) -> StoreResult<Option<InboundGroupSession>> {
        Ok(self
            .load_inbound_group_sessions(room_id)?
            .into_iter()
            .find(|s| s.session_id() == session_id))
    }

    pub fn ed_key_for_megolm_session(&mut self, session_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT sender_claimed_ed25519_key FROM inbound_megolm_sessions \
                 WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    }

    pub fn sender_key_for_megolm_session(
        &mut self,
        session_id: &str,
    ) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT sender_key FROM inbound_megolm_sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten())
    }

    // ------------------------------------------------------------------
    // Group session message index ledger

    pub fn add_group_session_index_record(
        &mut self,
        room_id: &RoomId,
        session_id: &str,
        index: u32,
        event_id: &str,
        ts: MilliSecondsSinceUnixEpoch,
    ) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO group_session_record_index(room_id, session_id, i, event_id, ts) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![room_id.as_str(), session_id, index, event_id, ts_to_i64(ts)],
        )?;
        Ok(())
    }

    /// The (event id, timestamp) previously recorded for this message
    /// index, used to detect replays.
    pub fn group_session_index_record(
        &mut self,
        room_id: &RoomId,
        session_id: &str,
        index: u32,
    ) -> StoreResult<Option<(String, MilliSecondsSinceUnixEpoch)>> {
        Ok(self
            .conn
            .query_row(
                "SELECT event_id, ts FROM group_session_record_index \
                 WHERE room_id = ?1 AND session_id = ?2 AND i = ?3",
                params![room_id.as_str(), session_id, index],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?
            .map(|(event_id, ts)| (event_id, ts_from_i64(ts))))
    }

    // ------------------------------------------------------------------
    // Outbound group sessions

    pub fn save_outbound_group_session(
        &mut self,
        session: &OutboundGroupSession,
    ) -> StoreResult<()> {
        let pickle = session.pickle(&self.pickling_key);
        let room_id = session.room_id().to_owned();
        let session_id = session.session_id().to_owned();
        let creation_time = ts_to_i64(session.creation_time());
        let message_count = session.message_count() as i64;

        self.with_transaction(|tx| {
            tx.execute(
                "DELETE FROM outbound_megolm_sessions WHERE room_id = ?1 AND session_id = ?2",
                params![room_id.as_str(), session_id],
            )?;
            tx.execute(
                "INSERT INTO outbound_megolm_sessions\
                 (room_id, session_id, pickle, creation_time, message_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![room_id.as_str(), session_id, pickle, creation_time, message_count],
            )?;
            Ok(())
        })
    }

    /// Load the current (most recently created) outbound session of a room.
    pub fn load_outbound_group_session(
        &mut self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> StoreResult<Option<OutboundGroupSession>> {
        let row: Option<(String, i64, i64)> = self
            .conn
            .query_row(
                "SELECT pickle, creation_time, message_count FROM outbound_megolm_sessions \
                 WHERE room_id = ?1 ORDER BY creation_time DESC LIMIT 1",
                params![room_id.as_str()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
                        row.get::<_, Option<i64>>(2)?.unwrap_or_default(),
                    ))
                },
            )
            .optional()?;

        row.map(|(pickle, creation_time, message_count)| {
            OutboundGroupSession::from_pickle(
                &pickle,
                &self.pickling_key,
                room_id,
                ts_from_i64(creation_time),
                message_count as u64,
                settings,
            )
            .map_err(StoreError::from)
        })
        .transpose()
    }

    // ------------------------------------------------------------------
    // Sent-keys ledger

    /// Record that the given devices received the outbound session at the
    /// given message index.
    pub fn set_devices_received_key(
        &mut self,
        room_id: &RoomId,
        devices: &[(OwnedUserId, OwnedDeviceId, String)],
        session_id: &str,
        index: u32,
    ) -> StoreResult<()> {
        self.with_transaction(|tx| {
            for (user_id, device_id, curve_key) in devices {
                tx.execute(
                    "INSERT INTO sent_megolm_sessions\
                     (room_id, user_id, device_id, identity_key, session_id, i) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        room_id.as_str(),
                        user_id.as_str(),
                        device_id.as_str(),
                        curve_key,
                        session_id,
                        index
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Subtract the devices that already received the session from the
    /// candidate set.
    pub fn devices_without_key(
        &mut self,
        room_id: &RoomId,
        mut devices: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
        session_id: &str,
    ) -> StoreResult<BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>> {
        let mut statement = self.conn.prepare(
            "SELECT user_id, device_id FROM sent_megolm_sessions \
             WHERE room_id = ?1 AND session_id = ?2",
        )?;

        let rows = statement.query_map(params![room_id.as_str(), session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (user_id, device_id) = row?;

            if let Ok(user_id) = OwnedUserId::try_from(user_id) {
                if let Some(user_devices) = devices.get_mut(&user_id) {
                    user_devices.retain(|d| d.as_str() != device_id);

                    if user_devices.is_empty() {
                        devices.remove(&user_id);
                    }
                }
            }
        }

        Ok(devices)
    }

    // ------------------------------------------------------------------
    // Tracked users and devices

    /// Persist the whole device-tracking state, replacing what was there.
    pub fn save_device_list<'a>(
        &mut self,
        tracked_users: &BTreeSet<OwnedUserId>,
        outdated_users: &BTreeSet<OwnedUserId>,
        devices: impl Iterator<Item = &'a TrackedDevice>,
    ) -> StoreResult<()> {
        self.with_transaction(|tx| {
            tx.execute("DELETE FROM tracked_users", [])?;
            tx.execute("DELETE FROM outdated_users", [])?;
            tx.execute("DELETE FROM tracked_devices", [])?;

            for user in tracked_users {
                tx.execute(
                    "INSERT INTO tracked_users(matrix_id) VALUES (?1)",
                    params![user.as_str()],
                )?;
            }

            for user in outdated_users {
                tx.execute(
                    "INSERT INTO outdated_users(matrix_id) VALUES (?1)",
                    params![user.as_str()],
                )?;
            }

            for device in devices {
                tx.execute(
                    "INSERT INTO tracked_devices\
                     (matrix_id, device_id, curve_key_id, curve_key, ed_key_id, ed_key, verified, self_verified) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        device.user_id.as_str(),
                        device.device_id.as_str(),
                        device.curve25519_key_id.as_str(),
                        device.curve25519_key,
                        device.ed25519_key_id.as_str(),
                        device.ed25519_key,
                        device.verified,
                        device.self_verified,
                    ],
                )?;
            }

            Ok(())
        })
    }

    #[allow(clippy::type_complexity)]
    pub fn load_device_list(
        &mut self,
    ) -> StoreResult<(
        BTreeSet<OwnedUserId>,
        BTreeSet<OwnedUserId>,
        BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, TrackedDevice>>,
    )> {
        fn user_set(conn: &Connection, table: &str) -> StoreResult<BTreeSet<OwnedUserId>> {
            let mut statement = conn.prepare(&format!("SELECT matrix_id FROM {table}"))?;
            let rows = statement.query_map([], |row| row.get::<_, String>(0))?;

            let mut users = BTreeSet::new();
            for row in rows {
                match OwnedUserId::try_from(row?) {
                    Ok(user) => {
                        users.insert(user);
                    }
                    Err(e) => warn!(error = %e, "Skipping a malformed user id in {table}"),
                }
            }

            Ok(users)
        }

        let tracked = user_set(&self.conn, "tracked_users")?;
        let outdated = user_set(&self.conn, "outdated_users")?;

        let mut statement = self.conn.prepare(
            "SELECT matrix_id, device_id, curve_key_id, curve_key, ed_key_id, ed_key, \
                    verified, self_verified \
             FROM tracked_devices",
        )?;

        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<bool>>(6)?.unwrap_or_default(),
                row.get::<_, Option<bool>>(7)?.unwrap_or_default(),
            ))
        })?;

        let mut devices: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, TrackedDevice>> =
            BTreeMap::new();

        for row in rows {
            let (user, device, curve_key_id, curve_key, ed_key_id, ed_key, verified, self_verified) =
                row?;

            let record = (|| -> Option<TrackedDevice> {
                Some(TrackedDevice {
                    user_id: OwnedUserId::try_from(user).ok()?,
                    device_id: device.into(),
                    curve25519_key_id: OwnedDeviceKeyId::try_from(curve_key_id).ok()?,
                    curve25519_key: curve_key,
                    ed25519_key_id: OwnedDeviceKeyId::try_from(ed_key_id).ok()?,
                    ed25519_key: ed_key,
                    verified,
                    self_verified,
                })
            })();

            match record {
                Some(record) => {
                    devices
                        .entry(record.user_id.clone())
                        .or_default()
                        .insert(record.device_id.clone(), record);
                }
                None => warn!("Skipping a malformed tracked device row"),
            }
        }

        Ok((tracked, outdated, devices))
    }

    /// Mark the device owning the given Ed25519 key id as verified.
    pub fn set_session_verified(&mut self, ed_key_id: &str) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE tracked_devices SET verified = true WHERE ed_key_id = ?1",
            params![ed_key_id],
        )?;
        Ok(())
    }

    pub fn is_session_verified(&mut self, ed_key: &str) -> StoreResult<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT verified FROM tracked_devices WHERE ed_key = ?1",
                params![ed_key],
                |row| row.get::<_, Option<bool>>(0),
            )
            .optional()?
            .flatten()
            .unwrap_or_default())
    }

    pub fn ed_key_for_key_id(
        &mut self,
        user_id: &UserId,
        ed_key_id: &str,
    ) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT ed_key FROM tracked_devices WHERE matrix_id = ?1 AND ed_key_id = ?2",
                params![user_id.as_str(), ed_key_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn ed_key_for_curve_key(&mut self, curve_key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT ed_key FROM tracked_devices WHERE curve_key = ?1",
                params![curve_key],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ------------------------------------------------------------------
    // Encrypted blobs

    /// Store a small secret under a name, AES-CTR-256 encrypted with the
    /// pickling key prefix and a fresh random IV.
    pub fn store_encrypted(&mut self, name: &str, plaintext: &[u8]) -> StoreResult<()> {
        let iv = random_iv();
        let ciphertext = aes_ctr_256_encrypt(plaintext, self.pickling_key.pickle_key(), &iv)?;

        let cipher = encode(ciphertext);
        let iv = encode(iv);

        self.with_transaction(|tx| {
            tx.execute("DELETE FROM encrypted WHERE name = ?1", params![name])?;
            tx.execute(
                "INSERT INTO encrypted(name, cipher, iv) VALUES (?1, ?2, ?3)",
                params![name, cipher, iv],
            )?;
            Ok(())
        })
    }

    pub fn load_encrypted(&mut self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT cipher, iv FROM encrypted WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((cipher, iv)) = row else { return Ok(None) };

        let (Ok(cipher), Ok(iv)) = (decode(cipher), decode(iv)) else {
            warn!(name, "Corrupt base64 in an encrypted store record");
            return Ok(None);
        };

        let Ok(iv) = <[u8; AES_BLOCK_SIZE]>::try_from(iv) else {
            warn!(name, "Corrupt IV in an encrypted store record");
            return Ok(None);
        };

        Ok(Some(aes_ctr_256_decrypt(&cipher, self.pickling_key.pickle_key(), &iv)?))
    }

    // ------------------------------------------------------------------
    // Cross-signing keys

    pub fn save_master_key(&mut self, user_id: &UserId, key: &str) -> StoreResult<()> {
        self.with_transaction(|tx| {
            tx.execute("DELETE FROM master_keys WHERE user_id = ?1", params![user_id.as_str()])?;
            tx.execute(
                "INSERT INTO master_keys(user_id, key, verified) VALUES (?1, ?2, false)",
                params![user_id.as_str(), key],
            )?;
            Ok(())
        })
    }

    pub fn set_master_key_verified(&mut self, key: &str) -> StoreResult<()> {
        self.conn
            .execute("UPDATE master_keys SET verified = true WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn master_key(&mut self, user_id: &UserId) -> StoreResult<Option<(String, bool)>> {
        Ok(self
            .conn
            .query_row(
                "SELECT key, verified FROM master_keys WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| Ok((row.get(0)?, row.get::<_, Option<bool>>(1)?.unwrap_or_default())),
            )
            .optional()?)
    }

    pub fn save_self_signing_key(&mut self, user_id: &UserId, key: &str) -> StoreResult<()> {
        self.with_transaction(|tx| {
            tx.execute(
                "DELETE FROM self_signing_keys WHERE user_id = ?1",
                params![user_id.as_str()],
            )?;
            tx.execute(
                "INSERT INTO self_signing_keys(user_id, key) VALUES (?1, ?2)",
                params![user_id.as_str(), key],
            )?;
            Ok(())
        })
    }

    pub fn self_signing_key(&mut self, user_id: &UserId) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT key FROM self_signing_keys WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn save_user_signing_key(&mut self, user_id: &UserId, key: &str) -> StoreResult<()> {
        self.with_transaction(|tx| {
            tx.execute(
                "DELETE FROM user_signing_keys WHERE user_id = ?1",
                params![user_id.as_str()],
            )?;
            tx.execute(
                "INSERT INTO user_signing_keys(user_id, key) VALUES (?1, ?2)",
                params![user_id.as_str(), key],
            )?;
            Ok(())
        })
    }

    pub fn user_signing_key(&mut self, user_id: &UserId) -> StoreResult<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT key FROM user_signing_keys WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ------------------------------------------------------------------
    // Events awaiting their room key

    pub fn save_undecrypted_event(
        &mut self,
        room_id: &RoomId,
        ts: MilliSecondsSinceUnixEpoch,
        json: &str,
    ) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO events(room_id, ts, json) VALUES (?1, ?2, ?3)",
            params![room_id.as_str(), ts_to_i64(ts), json],
        )?;
        Ok(())
    }

    /// The events of a room that arrived before their room key, with the
    /// row ids needed to remove them once they decrypt.
    pub fn undecrypted_events(&mut self, room_id: &RoomId) -> StoreResult<Vec<(i64, String)>> {
        let mut statement =
            self.conn.prepare("SELECT rowid, json FROM events WHERE room_id = ?1 ORDER BY ts")?;

        let rows = statement
            .query_map(params![room_id.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?;

        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn remove_undecrypted_event(&mut self, rowid: i64) -> StoreResult<()> {
        self.conn.execute("DELETE FROM events WHERE rowid = ?1", params![rowid])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wholesale deletion

    /// Drop all crypto state. Used on logout.
    pub fn clear(&mut self) -> StoreResult<()> {
        self.with_transaction(|tx| {
            for statement in [
                "DELETE FROM accounts",
                "DELETE FROM olm_sessions",
                "DELETE FROM inbound_megolm_sessions",
                "DELETE FROM group_session_record_index",
                "DELETE FROM master_keys",
                "DELETE FROM self_signing_keys",
                "DELETE FROM user_signing_keys",
            ] {
                tx.execute(statement, [])?;
            }
            Ok(())
        })
    }

    /// Drop the ratchet state of one room.
    pub fn clear_room_data(&mut self, room_id: &RoomId) -> StoreResult<()> {
        self.with_transaction(|tx| {
            for statement in [
                "DELETE FROM inbound_megolm_sessions WHERE room_id = ?1",
                "DELETE FROM outbound_megolm_sessions WHERE room_id = ?1",
                "DELETE FROM group_session_record_index WHERE room_id = ?1",
            ] {
                tx.execute(statement, params![room_id.as_str()])?;
            }
            Ok(())
        })
    }
}

impl std::fmt::Debug for CryptoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoStore")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}
