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

//! The migration chain of the encrypted store.
//!
//! The schema version is the SQLite `user_version` pragma. Migrations run
//! strictly in order, one transaction each, and bump the version as their
//! last statement; running the chain on a store that is already current is
//! a no-op.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// The schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = 11;

pub fn version(conn: &Connection) -> StoreResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

pub fn run(conn: &mut Connection, own_user_id: &str, own_device_id: &str) -> StoreResult<()> {
    let steps: &[fn(&mut Connection, &str, &str) -> rusqlite::Result<()>] = &[
        migrate_to_1,
        migrate_to_2,
        migrate_to_3,
        migrate_to_4,
        migrate_to_5,
        migrate_to_6,
        migrate_to_7,
        migrate_to_8,
        migrate_to_9,
        migrate_to_10,
        migrate_to_11,
    ];

    let current = version(conn)?;

    for (step, migrate) in steps.iter().enumerate() {
        let target = step as u32 + 1;

        if current < target {
            debug!(version = target, "Migrating the store");
            migrate(conn, own_user_id, own_device_id)
                .map_err(|source| StoreError::MigrationFailed { version: target, source })?;
        }
    }

    Ok(())
}

fn migrate_to_1(conn: &mut Connection, _user: &str, _device: &str) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE accounts (pickle TEXT);
         CREATE TABLE olm_sessions (sender_key TEXT, session_id TEXT, pickle TEXT);
         CREATE TABLE inbound_megolm_sessions (room_id TEXT, sender_key TEXT, session_id TEXT, pickle TEXT);
         CREATE TABLE outbound_megolm_sessions (room_id TEXT, sender_key TEXT, session_id TEXT, pickle TEXT);
         CREATE TABLE group_session_record_index (room_id TEXT, session_id TEXT, i INTEGER, event_id TEXT, ts INTEGER);
         CREATE TABLE tracked_users (matrix_id TEXT);
         CREATE TABLE outdated_users (matrix_id TEXT);
         CREATE TABLE tracked_devices (matrix_id TEXT, device_id TEXT, curve_key_id TEXT, curve_key TEXT, ed_key_id TEXT, ed_key TEXT);",
    )?;

    tx.pragma_update(None, "user_version", 1)?;
    tx.commit()
}

fn migrate_to_2(conn: &mut Connection, _user: &str, _device: &str) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "ALTER TABLE inbound_megolm_sessions ADD ed25519_key TEXT;
         ALTER TABLE olm_sessions ADD last_received INTEGER;
         CREATE INDEX sessions_session_idx ON olm_sessions(session_id);
         CREATE INDEX outbound_room_idx ON outbound_megolm_sessions(room_id);
         CREATE INDEX inbound_room_idx ON inbound_megolm_sessions(room_id);
         CREATE INDEX group_session_idx ON group_session_record_index(room_id, session_id, i);",
    )?;

    tx.pragma_update(None, "user_version", 2)?;
    tx.commit()
}

fn migrate_to_3(conn: &mut Connection, _user: &str, _device: &str) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE inbound_megolm_sessions_temp AS
             SELECT room_id, session_id, pickle FROM inbound_megolm_sessions;
         DROP TABLE inbound_megolm_sessions;
         ALTER TABLE inbound_megolm_sessions_temp RENAME TO inbound_megolm_sessions;
         ALTER TABLE inbound_megolm_sessions ADD olm_session_id TEXT;
         ALTER TABLE inbound_megolm_sessions ADD sender_id TEXT;",
    )?;

    tx.pragma_update(None, "user_version", 3)?;
    tx.commit()
}

fn migrate_to_4(conn: &mut Connection, _user: &str, _device: &str) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE sent_megolm_sessions (room_id TEXT, user_id TEXT, device_id TEXT, identity_key TEXT, session_id TEXT, i INTEGER);
         ALTER TABLE outbound_megolm_sessions ADD creation_time INTEGER;
         ALTER TABLE outbound_megolm_sessions ADD message_count INTEGER;",
    )?;

    tx.pragma_update(None, "user_version", 4)?;
    tx.commit()
}

fn migrate_to_5(conn: &mut Connection, _user: &str, _device: &str) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch("ALTER TABLE tracked_devices ADD verified BOOL;")?;
    tx.pragma_update(None, "user_version", 5)?;
    tx.commit()
}

fn migrate_to_6(conn: &mut Connection, _user: &str, _device: &str) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch("CREATE TABLE encrypted (name TEXT, cipher TEXT, iv TEXT);")?;
    tx.pragma_update(None, "user_version", 6)?;
    tx.commit()
}

fn migrate_to_7(conn: &mut Connection, _user: &str, _device: &str) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(
        "CREATE TABLE master_keys (user_id TEXT, key TEXT, verified INTEGER);
         CREATE TABLE self_signing_keys (user_id TEXT, key TEXT);
         CREATE TABLE user_signing_keys (user_id TEXT, key TEXT);
         INSERT INTO outdated_users SELECT * FROM tracked_users;
         ALTER TABLE tracked_devices ADD self_verified INTEGER;",
    )?;

    tx.pragma_update(None, "user_version", 7)?;
    tx.commit()
}

// Back-fill the sender key of every inbound megolm session from the Olm
// session that delivered it. Sessions imported from a backup carry the
// reserved marker instead of an Olm session id and are left alone.
fn migrate_to_8(conn: &mut Connection, _user: &str, _device: &str) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch("ALTER TABLE inbound_megolm_sessions ADD sender_key TEXT;")?;

    let sessions: Vec<(String, String)> = {
        let mut statement =
            tx.prepare("SELECT session_id, olm_session_id FROM inbound_megolm_sessions")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?.unwrap_or_default()))
        })?;
        rows.collect::<Result<_, _>>()?
    };

    for (session_id, olm_session_id) in sessions {
        if olm_session_id.starts_with("BACKUP") {
            continue;
        }

        let sender_key: Option<String> = tx
            .query_row(
                "SELECT sender_key FROM olm_sessions WHERE session_id = ?1",
                params![olm_session_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(sender_key) = sender_key {
            tx.execute(
                "UPDATE inbound_megolm_sessions SET sender_key = ?1 WHERE session_id = ?2",
                params![sender_key, session_id],
            )?;
        }
    }

    tx.pragma_update(None, "user_version", 8)?;
    tx.commit()
}

// Sessions we generated for our own outbound traffic got the reserved
// marker as their origin; their sender key is our own Curve25519 key.
fn migrate_to_9(conn: &mut Connection, user: &str, device: &str) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    let own_curve_key: Option<String> = tx
        .query_row(
            "SELECT curve_key FROM tracked_devices WHERE matrix_id = ?1 AND device_id = ?2",
            params![user, device],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(own_curve_key) = own_curve_key {
        tx.execute(
            "UPDATE inbound_megolm_sessions SET sender_key = ?1 WHERE olm_session_id = 'SELF'",
            params![own_curve_key],
        )?;
    }

    tx.pragma_update(None, "user_version", 9)?;
    tx.commit()
}

fn migrate_to_10(conn: &mut Connection, _user: &str, _device: &str) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch("ALTER TABLE inbound_megolm_sessions ADD sender_claimed_ed25519_key TEXT;")?;

    let sender_keys: Vec<String> = {
        let mut statement = tx.prepare(
            "SELECT DISTINCT sender_key FROM inbound_megolm_sessions WHERE sender_key IS NOT NULL",
        )?;
        let rows = statement.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    for sender_key in sender_keys {
        let ed_key: Option<String> = tx
            .query_row(
                "SELECT ed_key FROM tracked_devices WHERE curve_key = ?1",
                params![sender_key],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(ed_key) = ed_key {
            tx.execute(
                "UPDATE inbound_megolm_sessions SET sender_claimed_ed25519_key = ?1 \
                 WHERE sender_key = ?2",
                params![ed_key, sender_key],
            )?;
        }
    }

    tx.pragma_update(None, "user_version", 10)?;
    tx.commit()
}

fn migrate_to_11(conn: &mut Connection, _user: &str, _device: &str) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch("CREATE TABLE events (room_id TEXT, ts INTEGER, json TEXT);")?;
    tx.pragma_update(None, "user_version", 11)?;
    tx.commit()
}
