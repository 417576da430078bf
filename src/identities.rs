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

//! Records for the peer devices whose keys we follow.

use ruma::{OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId};

use crate::{
    error::DeviceError,
    types::{is_supported_algorithm, DeviceKeys},
};

/// A peer device we track so that we can encrypt to it and verify its
/// signatures.
///
/// The Ed25519 key of a tracked device never changes; a keys query response
/// carrying a different one is a device-reuse event and is rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedDevice {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub curve25519_key_id: OwnedDeviceKeyId,
    pub curve25519_key: String,
    pub ed25519_key_id: OwnedDeviceKeyId,
    pub ed25519_key: String,
    /// Set by a successful interactive verification.
    pub verified: bool,
    /// Set when the device is cross-signed by its own user.
    pub self_verified: bool,
}

impl TrackedDevice {
    /// Build a tracked device from a validated device keys object.
    ///
    /// This checks the shape of the record (key presence, algorithm support,
    /// self-signature) but not its relation to previously stored records;
    /// the reuse check happens in the tracker, which knows the history.
    pub fn from_device_keys(device_keys: &DeviceKeys) -> Result<Self, DeviceError> {
        if let Some(unsupported) =
            device_keys.algorithms.iter().find(|a| !is_supported_algorithm(a))
        {
            return Err(DeviceError::UnsupportedAlgorithm(
                device_keys.device_id.clone(),
                device_keys.user_id.clone(),
                unsupported.clone(),
            ));
        }

        let (curve_key_id, curve_key) =
            device_keys.curve25519_key().ok_or(DeviceError::MissingKey("curve25519"))?;
        let (ed_key_id, ed_key) =
            device_keys.ed25519_key().ok_or(DeviceError::MissingKey("ed25519"))?;

        device_keys.verify_self_signature()?;

        Ok(Self {
            user_id: device_keys.user_id.clone(),
            device_id: device_keys.device_id.clone(),
            curve25519_key_id: curve_key_id.clone(),
            curve25519_key: curve_key.to_owned(),
            ed25519_key_id: ed_key_id.clone(),
            ed25519_key: ed_key.to_owned(),
            verified: false,
            self_verified: false,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id};

    use super::TrackedDevice;
    use crate::{error::DeviceError, olm::Account, types::DeviceKeys};

    pub(crate) fn device_keys_for_account(account: &Account) -> DeviceKeys {
        account.device_keys()
    }

    #[test]
    fn tracked_device_from_valid_keys() {
        let account = Account::new(user_id!("@alice:example.org"), "ALICEDEVICE");
        let device_keys = device_keys_for_account(&account);

        let device = TrackedDevice::from_device_keys(&device_keys).unwrap();

        assert_eq!(device.user_id, account.user_id());
        assert_eq!(&device.device_id, account.device_id());
        assert_eq!(device.curve25519_key, account.curve25519_key().to_base64());
        assert_eq!(device.ed25519_key, account.ed25519_key().to_base64());
        assert!(!device.verified);
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let account = Account::new(user_id!("@alice:example.org"), "ALICEDEVICE");
        let mut device_keys = device_keys_for_account(&account);
        device_keys.algorithms.push("m.megolm.v2.aes-sha2".to_owned());

        assert_matches!(
            TrackedDevice::from_device_keys(&device_keys),
            Err(DeviceError::UnsupportedAlgorithm(..))
        );
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let account = Account::new(user_id!("@alice:example.org"), "ALICEDEVICE");
        let mut device_keys = device_keys_for_account(&account);
        device_keys.algorithms.pop();

        assert_matches!(
            TrackedDevice::from_device_keys(&device_keys),
            Err(DeviceError::SignatureMismatch(_))
        );
    }
}
