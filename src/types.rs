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

//! The wire formats the core reads and emits.
//!
//! Parsing is strict for the fields the core depends on and lenient for
//! everything else; unknown fields are retained as raw JSON so signatures
//! stay valid across a round trip.

use std::collections::BTreeMap;

use ruma::{
    DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedRoomId, OwnedUserId,
    UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ciphers::ed25519_verify, error::SignatureError, utilities::canonical_json_for_signing};

/// The event encryption algorithm used for pairwise, to-device traffic.
pub const OLM_V1_CURVE25519_AES_SHA2: &str = "m.olm.v1.curve25519-aes-sha2";
/// The event encryption algorithm used for room messages.
pub const MEGOLM_V1_AES_SHA2: &str = "m.megolm.v1.aes-sha2";
/// The key algorithm one-time keys are claimed and uploaded under.
pub const SIGNED_CURVE25519: &str = "signed_curve25519";

pub fn is_supported_algorithm(algorithm: &str) -> bool {
    algorithm == OLM_V1_CURVE25519_AES_SHA2 || algorithm == MEGOLM_V1_AES_SHA2
}

/// The device keys object a device uploads and other devices fetch with a
/// keys query.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceKeys {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub algorithms: Vec<String>,
    pub keys: BTreeMap<OwnedDeviceKeyId, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl DeviceKeys {
    fn key_with_algorithm(
        &self,
        algorithm: DeviceKeyAlgorithm,
    ) -> Option<(&OwnedDeviceKeyId, &str)> {
        self.keys
            .iter()
            .find(|(id, _)| id.algorithm() == algorithm)
            .map(|(id, key)| (id, key.as_str()))
    }

    /// The Curve25519 identity key advertised by the device, with its key id.
    pub fn curve25519_key(&self) -> Option<(&OwnedDeviceKeyId, &str)> {
        self.key_with_algorithm(DeviceKeyAlgorithm::Curve25519)
    }

    /// The Ed25519 signing key advertised by the device, with its key id.
    pub fn ed25519_key(&self) -> Option<(&OwnedDeviceKeyId, &str)> {
        self.key_with_algorithm(DeviceKeyAlgorithm::Ed25519)
    }

    /// Check the device's signature over its own keys object.
    pub fn verify_self_signature(&self) -> Result<(), SignatureError> {
        let ed25519_key = self
            .ed25519_key()
            .map(|(_, key)| key.to_owned())
            .ok_or(SignatureError::NoSignatureFound)?;

        let value = serde_json::to_value(self).map_err(|_| SignatureError::NotAnObject)?;
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id);

        verify_signed_json(&value, &self.user_id, &key_id, &ed25519_key)
    }
}

/// A one-time key together with the signature of the device that published
/// it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedOneTimeKey {
    /// Unpadded base64 of the 32 byte Curve25519 public key.
    pub key: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub signatures: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl SignedOneTimeKey {
    /// Check the publishing device's signature over the key.
    pub fn verify_signature(
        &self,
        user_id: &UserId,
        key_id: &DeviceKeyId,
        ed25519_key: &str,
    ) -> Result<(), SignatureError> {
        let value = serde_json::to_value(self).map_err(|_| SignatureError::NotAnObject)?;
        verify_signed_json(&value, user_id, key_id, ed25519_key)
    }
}

/// Verify a signed JSON object.
///
/// The object must carry a `signatures` map of the form
/// `user id → key id → signature`. `signatures` and `unsigned` are removed
/// before the object is canonicalized.
pub fn verify_signed_json(
    value: &Value,
    user_id: &UserId,
    key_id: &DeviceKeyId,
    ed25519_key: &str,
) -> Result<(), SignatureError> {
    let signature = value
        .get("signatures")
        .and_then(|s| s.get(user_id.as_str()))
        .and_then(|s| s.get(key_id.as_str()))
        .and_then(Value::as_str)
        .ok_or(SignatureError::NoSignatureFound)?
        .to_owned();

    let canonical = canonical_json_for_signing(value)?;

    ed25519_verify(ed25519_key, canonical.as_bytes(), &signature).map_err(|e| match e {
        crate::error::CipherError::Ed25519Verify(e) => SignatureError::Verification(e),
        crate::error::CipherError::InvalidKey(e) => SignatureError::InvalidKey(e),
        _ => SignatureError::NoSignatureFound,
    })
}

/// The content of an `m.room.encrypted` to-device event, the Olm envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmEncryptedContent {
    pub algorithm: String,
    /// Curve25519 identity key of the sending device.
    pub sender_key: String,
    /// Per-recipient ciphertexts, keyed by the recipient's Curve25519 key.
    pub ciphertext: BTreeMap<String, vodozemac::olm::OlmMessage>,
}

/// The content of an `m.room.encrypted` room event, the Megolm envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmEncryptedContent {
    pub algorithm: String,
    pub sender_key: String,
    pub device_id: OwnedDeviceId,
    pub session_id: String,
    /// Base64 encoded Megolm message.
    pub ciphertext: String,
}

/// The content of an `m.room_key` event, carried inside an Olm envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyContent {
    pub algorithm: String,
    pub room_id: OwnedRoomId,
    pub session_id: String,
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_index: Option<u32>,
}

/// The plaintext layout of a decrypted Olm message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmPayload {
    pub sender: OwnedUserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device: Option<OwnedDeviceId>,
    /// The long-term keys of the sender, `"ed25519"` is the one that matters.
    pub keys: BTreeMap<String, String>,
    pub recipient: OwnedUserId,
    pub recipient_keys: BTreeMap<String, String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub content: Value,
}

/// The fields of an `m.room.encryption` state event the core acts on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomEncryptionContent {
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};
    use serde_json::json;

    use super::{is_supported_algorithm, DeviceKeys};

    #[test]
    fn supported_algorithms() {
        assert!(is_supported_algorithm("m.olm.v1.curve25519-aes-sha2"));
        assert!(is_supported_algorithm("m.megolm.v1.aes-sha2"));
        assert!(!is_supported_algorithm("m.megolm.v2.aes-sha2"));
    }

    #[test]
    fn device_keys_round_trip_keeps_unknown_fields() {
        let json = json!({
            "user_id": "@alice:example.org",
            "device_id": "JLAFKJWSCS",
            "algorithms": ["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"],
            "keys": {
                "curve25519:JLAFKJWSCS": "wjLpTLRqbqBzLs63aYaEv2Boi6cFEbbM/sSRQ2oAKk4",
                "ed25519:JLAFKJWSCS": "nE6W2fCblxDcOFmeEtCHNl8/l8bXcu7GKyAswA4r3mM",
            },
            "signatures": {
                "@alice:example.org": {
                    "ed25519:JLAFKJWSCS": "m53Wkbh2HXkc3vFApZvCrfXcX3AI51GsDHustMhKwlv3TuOJMj4wistcOTM8q2+e/Ro7rWFUb9ZfnNbwptSUBA",
                },
            },
            "unknown_extension": { "a": 1 },
        });

        let keys: DeviceKeys = serde_json::from_value(json.clone()).unwrap();

        assert_eq!(keys.user_id, user_id!("@alice:example.org"));
        assert_eq!(keys.device_id, device_id!("JLAFKJWSCS"));
        assert!(keys.curve25519_key().is_some());
        assert!(keys.ed25519_key().is_some());

        assert_eq!(serde_json::to_value(&keys).unwrap(), json);
    }
}
