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

//! The capabilities the core expects from its embedder: a homeserver
//! transport and an OS credential store.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use ruma::{
    OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, TransactionId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{DeviceKeys, RoomEncryptionContent, SignedOneTimeKey};

/// Failure of a transport call.
///
/// The long-poll sync is retried indefinitely on these; every other call
/// fails fast and leaves the retry decision to the caller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("the homeserver rejected the request: {0}")]
    Api(String),

    #[error("the request never reached the homeserver: {0}")]
    Network(String),
}

/// The `changed`/`left` device list delta of a sync response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceLists {
    #[serde(default)]
    pub changed: Vec<OwnedUserId>,
    #[serde(default)]
    pub left: Vec<OwnedUserId>,
}

/// The per-room data the core acts on.
#[derive(Clone, Debug)]
pub struct RoomUpdate {
    pub room_id: OwnedRoomId,
    /// The current `m.room.encryption` state, if the room is encrypted.
    pub encryption: Option<RoomEncryptionContent>,
    /// The members the room currently encrypts to.
    pub joined_members: Vec<OwnedUserId>,
}

/// A sync response, reduced to what the E2EE core consumes.
#[derive(Clone, Debug, Default)]
pub struct SyncResponse {
    pub next_batch: String,
    /// Published one-time key counts by algorithm.
    pub device_one_time_keys_count: BTreeMap<String, u64>,
    pub device_lists: DeviceLists,
    /// Raw to-device events, in delivery order.
    pub to_device_events: Vec<Value>,
    pub rooms: Vec<RoomUpdate>,
    pub account_data: Vec<Value>,
    pub presence: Vec<Value>,
}

/// The response to a keys upload.
#[derive(Clone, Debug, Default)]
pub struct KeysUploadResponse {
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// The response to a keys query.
#[derive(Clone, Debug, Default)]
pub struct KeysQueryResponse {
    pub device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>>,
}

/// The response to a one-time key claim.
#[derive(Clone, Debug, Default)]
pub struct KeysClaimResponse {
    /// user → device → key id (`signed_curve25519:<id>`) → signed key.
    pub one_time_keys:
        BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, BTreeMap<String, SignedOneTimeKey>>>,
}

/// The homeserver operations the core drives.
///
/// The implementation owns scheduling, authentication and retry policy; the
/// core treats every call as one logical request.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Long-poll the server for new events.
    async fn sync(
        &self,
        since: Option<&str>,
        filter: Option<&str>,
        timeout: Duration,
    ) -> Result<SyncResponse, TransportError>;

    /// Upload our device keys and fresh one-time keys.
    async fn upload_keys(
        &self,
        device_keys: Option<DeviceKeys>,
        one_time_keys: BTreeMap<String, SignedOneTimeKey>,
    ) -> Result<KeysUploadResponse, TransportError>;

    /// Fetch the device keys of the given users.
    async fn query_keys(
        &self,
        users: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
    ) -> Result<KeysQueryResponse, TransportError>;

    /// Claim one one-time key per listed device.
    async fn claim_keys(
        &self,
        devices: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>,
    ) -> Result<KeysClaimResponse, TransportError>;

    /// Send a batch of to-device messages.
    async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &TransactionId,
        messages: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
    ) -> Result<(), TransportError>;

    /// Send a room event, returning its event id.
    async fn send_message(
        &self,
        room_id: &RoomId,
        event_type: &str,
        txn_id: &TransactionId,
        content: Value,
    ) -> Result<OwnedEventId, TransportError>;
}

/// Access to the OS credential store.
///
/// Holds the access token and the pickling key; neither is ever written to
/// an ordinary file.
pub trait CredentialStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, std::io::Error>;
    fn write(&mut self, key: &str, value: &[u8]) -> Result<(), std::io::Error>;
    fn delete(&mut self, key: &str) -> Result<(), std::io::Error>;
}
