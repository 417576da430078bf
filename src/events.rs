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

//! To-device events as a sum type keyed by the Matrix event type string.
//!
//! Unknown event types fall back to a variant that preserves the original
//! JSON untouched.

use std::collections::BTreeMap;

use ruma::{MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{OlmEncryptedContent, RoomKeyContent};

/// A to-device event with a typed content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEvent<C> {
    pub sender: OwnedUserId,
    pub content: C,
}

/// Any to-device event the core reacts to.
#[derive(Clone, Debug)]
pub enum AnyToDeviceEvent {
    RoomEncrypted(ToDeviceEvent<OlmEncryptedContent>),
    RoomKey(ToDeviceEvent<RoomKeyContent>),
    KeyVerificationRequest(ToDeviceEvent<RequestContent>),
    KeyVerificationReady(ToDeviceEvent<ReadyContent>),
    KeyVerificationStart(ToDeviceEvent<StartContent>),
    KeyVerificationAccept(ToDeviceEvent<AcceptContent>),
    KeyVerificationKey(ToDeviceEvent<KeyContent>),
    KeyVerificationMac(ToDeviceEvent<MacContent>),
    KeyVerificationDone(ToDeviceEvent<DoneContent>),
    KeyVerificationCancel(ToDeviceEvent<CancelContent>),
    /// Anything else, with the original content JSON preserved.
    Custom { event_type: String, event: ToDeviceEvent<Value> },
}

impl AnyToDeviceEvent {
    /// Parse a raw to-device event.
    ///
    /// The fields the core depends on are parsed strictly; an event of a
    /// known type with a malformed content is an error rather than a
    /// `Custom` fallback.
    pub fn from_json(value: &Value) -> Result<Self, serde_json::Error> {
        fn event<C: serde::de::DeserializeOwned>(
            value: &Value,
        ) -> Result<ToDeviceEvent<C>, serde_json::Error> {
            serde_json::from_value(value.clone())
        }

        let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();

        Ok(match event_type {
            "m.room.encrypted" => Self::RoomEncrypted(event(value)?),
            "m.room_key" => Self::RoomKey(event(value)?),
            "m.key.verification.request" => Self::KeyVerificationRequest(event(value)?),
            "m.key.verification.ready" => Self::KeyVerificationReady(event(value)?),
            "m.key.verification.start" => Self::KeyVerificationStart(event(value)?),
            "m.key.verification.accept" => Self::KeyVerificationAccept(event(value)?),
            "m.key.verification.key" => Self::KeyVerificationKey(event(value)?),
            "m.key.verification.mac" => Self::KeyVerificationMac(event(value)?),
            "m.key.verification.done" => Self::KeyVerificationDone(event(value)?),
            "m.key.verification.cancel" => Self::KeyVerificationCancel(event(value)?),
            _ => Self::Custom { event_type: event_type.to_owned(), event: event(value)? },
        })
    }

    pub fn sender(&self) -> &OwnedUserId {
        match self {
            Self::RoomEncrypted(e) => &e.sender,
            Self::RoomKey(e) => &e.sender,
            Self::KeyVerificationRequest(e) => &e.sender,
            Self::KeyVerificationReady(e) => &e.sender,
            Self::KeyVerificationStart(e) => &e.sender,
            Self::KeyVerificationAccept(e) => &e.sender,
            Self::KeyVerificationKey(e) => &e.sender,
            Self::KeyVerificationMac(e) => &e.sender,
            Self::KeyVerificationDone(e) => &e.sender,
            Self::KeyVerificationCancel(e) => &e.sender,
            Self::Custom { event, .. } => &event.sender,
        }
    }
}

/// `m.key.verification.request` content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestContent {
    pub from_device: OwnedDeviceId,
    pub transaction_id: String,
    pub methods: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<MilliSecondsSinceUnixEpoch>,
}

/// `m.key.verification.ready` content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadyContent {
    pub from_device: OwnedDeviceId,
    pub transaction_id: String,
    pub methods: Vec<String>,
}

/// `m.key.verification.start` content.
///
/// Unknown fields are kept so that the canonical form of the event, which
/// both commitments bind, survives a round trip through this struct.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StartContent {
    pub from_device: OwnedDeviceId,
    pub transaction_id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_agreement_protocols: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_authentication_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_authentication_string: Vec<String>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// `m.key.verification.accept` content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptContent {
    pub transaction_id: String,
    pub method: String,
    pub commitment: String,
    pub key_agreement_protocol: String,
    pub hash: String,
    pub message_authentication_code: String,
    pub short_authentication_string: Vec<String>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// `m.key.verification.key` content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyContent {
    pub transaction_id: String,
    /// Unpadded base64 of the sender's ephemeral Curve25519 public key.
    pub key: String,
}

/// `m.key.verification.mac` content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MacContent {
    pub transaction_id: String,
    /// MAC of each verified key, keyed by its key id.
    pub mac: BTreeMap<String, String>,
    /// MAC over the sorted, comma-joined list of the key ids in `mac`.
    pub keys: String,
}

/// `m.key.verification.done` content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DoneContent {
    pub transaction_id: String,
}

/// `m.key.verification.cancel` content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CancelContent {
    pub transaction_id: String,
    pub code: String,
    pub reason: String,
}
