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

use std::collections::BTreeMap;

use ruma::{
    DeviceKeyAlgorithm, DeviceKeyId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedUserId,
    UserId,
};
use serde_json::{json, Value};
use tracing::debug;
use vodozemac::{
    olm::{IdentityKeys, PreKeyMessage, SessionConfig},
    Curve25519PublicKey, Ed25519PublicKey,
};

use super::Session;
use crate::{
    error::{OlmResult, SignatureError},
    secure_buffer::PicklingKey,
    types::{DeviceKeys, SignedOneTimeKey, MEGOLM_V1_AES_SHA2, OLM_V1_CURVE25519_AES_SHA2},
    utilities::canonical_json_for_signing,
};

/// The long-term cryptographic identity of this device.
///
/// Owns the private Ed25519 signing key, the private Curve25519 identity key
/// and the pool of one-time keys. Created once, when no prior pickle exists,
/// and destroyed only on logout. Every mutation has to be followed by a save
/// of the fresh pickle into the store.
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    inner: vodozemac::olm::Account,
    shared: bool,
}

impl Account {
    const ALGORITHMS: &'static [&'static str] =
        &[OLM_V1_CURVE25519_AES_SHA2, MEGOLM_V1_AES_SHA2];

    /// Create a fresh account with new identity keys and an empty one-time
    /// key pool.
    pub fn new(user_id: &UserId, device_id: &str) -> Self {
        debug!(%user_id, device_id, "Creating a new Olm account");

        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.into(),
            inner: vodozemac::olm::Account::new(),
            shared: false,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &OwnedDeviceId {
        &self.device_id
    }

    /// The public identity keys, stable for the lifetime of the device.
    pub fn identity_keys(&self) -> IdentityKeys {
        self.inner.identity_keys()
    }

    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.inner.curve25519_key()
    }

    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.inner.ed25519_key()
    }

    /// Has the initial device keys upload happened.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Mark the device keys as uploaded.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// Sign the given payload with our Ed25519 key, returning the unpadded
    /// base64 of the signature.
    pub fn sign(&self, payload: &str) -> String {
        self.inner.sign(payload).to_base64()
    }

    /// Canonicalize and sign a JSON object, ignoring its `signatures` and
    /// `unsigned` fields.
    pub fn sign_json(&self, value: &Value) -> Result<String, SignatureError> {
        Ok(self.sign(&canonical_json_for_signing(value)?))
    }

    /// The signed device keys object for uploading, with the user and device
    /// id bound in.
    pub fn device_keys(&self) -> DeviceKeys {
        let identity_keys = self.identity_keys();

        let curve_key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Curve25519, &self.device_id);
        let ed_key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id);

        let mut keys = BTreeMap::new();
        keys.insert(curve_key_id, identity_keys.curve25519.to_base64());
        keys.insert(ed_key_id.clone(), identity_keys.ed25519.to_base64());

        let unsigned = json!({
            "user_id": &self.user_id,
            "device_id": &self.device_id,
            "algorithms": Self::ALGORITHMS,
            "keys": &keys,
        });

        let signature = self
            .sign_json(&unsigned)
            .expect("a device keys object can always be canonicalized");

        let mut signatures = BTreeMap::new();
        signatures.insert(self.user_id.clone(), BTreeMap::from([(ed_key_id, signature)]));

        DeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            algorithms: Self::ALGORITHMS.iter().map(|a| (*a).to_owned()).collect(),
            keys,
            signatures,
            other: BTreeMap::new(),
        }
    }

    /// The largest one-time key pool the account can hold.
    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Generate `count` fresh one-time keys.
    ///
    /// The keys stay unpublished until [`Account::mark_keys_as_published`]
    /// is called after a successful upload.
    pub fn generate_one_time_keys(&mut self, count: usize) {
        debug!(count, "Generating new one-time keys");
        self.inner.generate_one_time_keys(count);
    }

    /// The currently unpublished one-time keys, addressed by their short id.
    pub fn one_time_keys(&self) -> BTreeMap<String, Curve25519PublicKey> {
        self.inner
            .one_time_keys()
            .into_iter()
            .map(|(id, key)| (id.to_base64(), key))
            .collect()
    }

    /// Sign the unpublished one-time keys for upload.
    ///
    /// Returns a map from `"signed_curve25519:<id>"` to the signed key
    /// record.
    pub fn signed_one_time_keys(&self) -> BTreeMap<String, SignedOneTimeKey> {
        let ed_key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id);

        self.one_time_keys()
            .into_iter()
            .map(|(id, key)| {
                let key = key.to_base64();
                let signature = self
                    .sign_json(&json!({ "key": key }))
                    .expect("a one-time key object can always be canonicalized");

                let mut signatures = BTreeMap::new();
                signatures.insert(
                    self.user_id.clone(),
                    BTreeMap::from([(ed_key_id.clone(), signature)]),
                );

                (
                    format!("signed_curve25519:{id}"),
                    SignedOneTimeKey { key, signatures, other: BTreeMap::new() },
                )
            })
            .collect()
    }

    /// Mark the one-time key pool as published after a successful upload.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Create an outbound Olm session towards a device, consuming one of its
    /// claimed one-time keys.
    pub fn create_outbound_session(
        &self,
        identity_key: &str,
        one_time_key: &str,
    ) -> OlmResult<Session> {
        let identity_key = Curve25519PublicKey::from_base64(identity_key)?;
        let one_time_key = Curve25519PublicKey::from_base64(one_time_key)?;

        let session =
            self.inner.create_outbound_session(SessionConfig::version_1(), identity_key, one_time_key);

        Ok(Session::new(session, identity_key, MilliSecondsSinceUnixEpoch::now()))
    }

    /// Create an inbound Olm session from the first pre-key message of a
    /// sender.
    ///
    /// The one-time key the message consumed is removed from the pool, so
    /// the account needs to be saved afterwards. Returns the new session
    /// together with the plaintext of the pre-key message.
    pub fn create_inbound_session(
        &mut self,
        sender_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> OlmResult<(Session, Vec<u8>)> {
        let result = self.inner.create_inbound_session(sender_key, message)?;

        debug!(session_id = %result.session.session_id(), "Created a new inbound Olm session");

        Ok((
            Session::new(result.session, sender_key, MilliSecondsSinceUnixEpoch::now()),
            result.plaintext,
        ))
    }

    /// Serialize the account into an opaque string under the pickling key.
    pub fn pickle(&self, pickling_key: &PicklingKey) -> String {
        self.inner.pickle().encrypt(pickling_key.pickle_key())
    }

    /// Restore an account from a pickle.
    ///
    /// A restored account has been through its initial key upload by
    /// definition, so it comes back marked as shared. Failure leaves nothing
    /// partially populated.
    pub fn from_pickle(
        pickle: &str,
        pickling_key: &PicklingKey,
        user_id: &UserId,
        device_id: &str,
    ) -> Result<Self, vodozemac::PickleError> {
        let pickle = vodozemac::olm::AccountPickle::from_encrypted(pickle, pickling_key.pickle_key())?;

        Ok(Self {
            user_id: user_id.to_owned(),
            device_id: device_id.into(),
            inner: vodozemac::olm::Account::from_pickle(pickle),
            shared: true,
        })
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys())
            .field("shared", &self.shared)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id, DeviceKeyAlgorithm, DeviceKeyId};

    use super::Account;
    use crate::{secure_buffer::PicklingKey, types::verify_signed_json};

    fn account() -> Account {
        Account::new(user_id!("@alice:example.org"), device_id!("ALICEDEVICE").as_str())
    }

    #[test]
    fn identity_keys_are_stable() {
        let account = account();
        assert_eq!(account.identity_keys(), account.identity_keys());
    }

    #[test]
    fn device_keys_are_self_signed() {
        let account = account();
        let device_keys = account.device_keys();

        device_keys.verify_self_signature().unwrap();

        assert_eq!(
            device_keys.curve25519_key().unwrap().1,
            account.curve25519_key().to_base64()
        );
        assert_eq!(device_keys.ed25519_key().unwrap().1, account.ed25519_key().to_base64());
    }

    #[test]
    fn one_time_keys_are_signed_and_consumed_on_publish() {
        let mut account = account();

        account.generate_one_time_keys(4);
        let signed = account.signed_one_time_keys();
        assert_eq!(signed.len(), 4);

        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, account.device_id());
        for (id, key) in &signed {
            assert!(id.starts_with("signed_curve25519:"));

            let value = serde_json::to_value(key).unwrap();
            verify_signed_json(
                &value,
                account.user_id(),
                &key_id,
                &account.ed25519_key().to_base64(),
            )
            .unwrap();
        }

        account.mark_keys_as_published();
        assert!(account.signed_one_time_keys().is_empty());
    }

    #[test]
    fn pickle_round_trip() {
        let pickling_key = PicklingKey::generate().unwrap();
        let mut account = account();
        account.generate_one_time_keys(2);

        let pickle = account.pickle(&pickling_key);
        let restored = Account::from_pickle(
            &pickle,
            &pickling_key,
            account.user_id(),
            account.device_id().as_str(),
        )
        .unwrap();

        assert_eq!(restored.identity_keys(), account.identity_keys());
        assert_eq!(restored.one_time_keys(), account.one_time_keys());
        assert!(restored.shared());
    }

    #[test]
    fn unpickling_with_the_wrong_key_fails() {
        let account = account();
        let pickle = account.pickle(&PicklingKey::generate().unwrap());

        let result = Account::from_pickle(
            &pickle,
            &PicklingKey::generate().unwrap(),
            account.user_id(),
            account.device_id().as_str(),
        );

        assert!(result.is_err());
    }
}
