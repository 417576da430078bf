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

//! Tracking of peer devices and of the users whose device lists went stale.

use std::collections::{BTreeMap, BTreeSet};

use ruma::{OwnedDeviceId, OwnedUserId, UserId};
use tracing::{debug, warn};

use crate::{
    error::{DeviceError, StoreResult},
    events::ToDeviceEvent,
    identities::TrackedDevice,
    store::CryptoStore,
    transport::{DeviceLists, KeysQueryResponse},
    types::OlmEncryptedContent,
};

/// The set of users whose devices we follow, their device records, and the
/// queue of encrypted events whose sender we don't know yet.
#[derive(Debug, Default)]
pub struct DeviceTracker {
    tracked_users: BTreeSet<OwnedUserId>,
    outdated_users: BTreeSet<OwnedUserId>,
    devices: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, TrackedDevice>>,
    /// Coalesces "refresh required" nudges into a single keys query.
    encryption_update_required: bool,
    pending_encrypted_events: Vec<ToDeviceEvent<OlmEncryptedContent>>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore the tracking state persisted in the store.
    pub fn load(store: &mut CryptoStore) -> StoreResult<Self> {
        let (tracked_users, outdated_users, devices) = store.load_device_list()?;

        Ok(Self {
            tracked_users,
            outdated_users,
            devices,
            encryption_update_required: false,
            pending_encrypted_events: Vec::new(),
        })
    }

    pub fn encryption_update_required(&self) -> bool {
        self.encryption_update_required
    }

    pub fn tracked_users(&self) -> &BTreeSet<OwnedUserId> {
        &self.tracked_users
    }

    pub fn outdated_users(&self) -> &BTreeSet<OwnedUserId> {
        &self.outdated_users
    }

    /// The devices we currently know for a user.
    pub fn user_devices(
        &self,
        user_id: &UserId,
    ) -> Option<&BTreeMap<OwnedDeviceId, TrackedDevice>> {
        self.devices.get(user_id)
    }

    pub fn device(&self, user_id: &UserId, device_id: &str) -> Option<&TrackedDevice> {
        self.devices.get(user_id)?.iter().find(|(id, _)| id.as_str() == device_id).map(|(_, d)| d)
    }

    /// Look up a device by its Curve25519 identity key.
    pub fn device_for_curve_key(
        &self,
        user_id: &UserId,
        curve_key: &str,
    ) -> Option<&TrackedDevice> {
        self.devices.get(user_id)?.values().find(|d| d.curve25519_key == curve_key)
    }

    pub fn is_known_curve_key(&self, user_id: &UserId, curve_key: &str) -> bool {
        self.device_for_curve_key(user_id, curve_key).is_some()
    }

    /// Start following the given users, marking the new ones as outdated so
    /// the next keys query picks them up.
    pub fn track_users<'a>(&mut self, users: impl IntoIterator<Item = &'a UserId>) {
        for user in users {
            if self.tracked_users.insert(user.to_owned()) {
                self.outdated_users.insert(user.to_owned());
                self.encryption_update_required = true;
            }
        }
    }

    /// Apply the device-list delta of a sync response.
    ///
    /// Returns true if any tracked user became outdated.
    pub fn consume_device_lists(&mut self, device_lists: &DeviceLists) -> bool {
        let mut has_new_outdated_user = false;

        for changed in &device_lists.changed {
            if self.tracked_users.contains(changed) {
                self.outdated_users.insert(changed.clone());
                has_new_outdated_user = true;
            }
        }

        for left in &device_lists.left {
            self.tracked_users.remove(left);
            self.outdated_users.remove(left);
            self.devices.remove(left);
        }

        has_new_outdated_user
    }

    /// The query map for the users whose device list is stale.
    pub fn users_for_key_query(&self) -> BTreeMap<OwnedUserId, Vec<OwnedDeviceId>> {
        self.outdated_users.iter().map(|user| (user.clone(), Vec::new())).collect()
    }

    /// Ingest a keys query response, replacing the device records of every
    /// returned user and persisting the whole device table.
    ///
    /// Records are validated one by one; a rejected record is skipped and
    /// the previously stored one, if any, is kept.
    pub fn receive_keys_query_response(
        &mut self,
        response: &KeysQueryResponse,
        store: &mut CryptoStore,
    ) -> StoreResult<()> {
        for (user_id, device_map) in &response.device_keys {
            let old_devices = self.devices.remove(user_id).unwrap_or_default();
            let mut new_devices = BTreeMap::new();

            for (device_id, device_keys) in device_map {
                if user_id != &device_keys.user_id {
                    warn!(
                        %user_id,
                        %device_id,
                        advertised = %device_keys.user_id,
                        "Mismatched user id in a device keys record"
                    );
                    continue;
                }

                let mut device = match TrackedDevice::from_device_keys(device_keys) {
                    Ok(device) => device,
                    Err(e) => {
                        warn!(%user_id, %device_id, error = %e, "Rejecting a device record");
                        continue;
                    }
                };

                if let Some(old) = old_devices.get(device_id) {
                    if old.ed25519_key != device.ed25519_key {
                        let e = DeviceError::DeviceReuse(device_id.clone(), user_id.clone());
                        warn!(%user_id, %device_id, error = %e, "Rejecting a device record");
                        new_devices.insert(device_id.clone(), old.clone());
                        continue;
                    }

                    // The keys are stable, so the trust decisions carry over.
                    device.verified = old.verified;
                    device.self_verified = old.self_verified;
                }

                new_devices.insert(device_id.clone(), device);
            }

            debug!(%user_id, devices = new_devices.len(), "Updated the devices of a user");
            self.devices.insert(user_id.clone(), new_devices);
            self.outdated_users.remove(user_id);
        }

        self.save(store)
    }

    /// Persist the whole tracking state.
    pub fn save(&self, store: &mut CryptoStore) -> StoreResult<()> {
        store.save_device_list(
            &self.tracked_users,
            &self.outdated_users,
            self.devices.values().flat_map(|devices| devices.values()),
        )
    }

    /// Mark a device as verified after a successful interactive
    /// verification.
    pub fn mark_device_verified(&mut self, user_id: &UserId, device_id: &str) {
        if let Some(devices) = self.devices.get_mut(user_id) {
            for device in devices.values_mut() {
                if device.device_id.as_str() == device_id {
                    device.verified = true;
                }
            }
        }
    }

    /// Queue an encrypted to-device event whose sender key we don't know,
    /// and mark the sender as outdated so the next query resolves it.
    pub fn queue_pending_event(&mut self, event: ToDeviceEvent<OlmEncryptedContent>) {
        self.tracked_users.insert(event.sender.clone());
        self.outdated_users.insert(event.sender.clone());
        self.encryption_update_required = true;
        self.pending_encrypted_events.push(event);
    }

    pub fn set_encryption_update_required(&mut self) {
        self.encryption_update_required = true;
    }

    pub fn clear_encryption_update_required(&mut self) {
        self.encryption_update_required = false;
    }

    /// Remove and return the queued events whose sender key is now known.
    pub fn drain_decryptable_events(&mut self) -> Vec<ToDeviceEvent<OlmEncryptedContent>> {
        let mut ready = Vec::new();
        let mut still_pending = Vec::new();

        for event in self.pending_encrypted_events.drain(..) {
            if self
                .devices
                .get(&event.sender)
                .is_some_and(|devices| {
                    devices.values().any(|d| d.curve25519_key == event.content.sender_key)
                })
            {
                ready.push(event);
            } else {
                still_pending.push(event);
            }
        }

        self.pending_encrypted_events = still_pending;
        ready
    }

    #[cfg(test)]
    pub(crate) fn pending_event_count(&self) -> usize {
        self.pending_encrypted_events.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ruma::{device_id, user_id, OwnedDeviceId, OwnedUserId};
    use tempfile::TempDir;

    use super::DeviceTracker;
    use crate::{
        olm::Account,
        store::CryptoStore,
        secure_buffer::PicklingKey,
        transport::{DeviceLists, KeysQueryResponse},
        types::DeviceKeys,
    };

    fn store(dir: &TempDir) -> CryptoStore {
        CryptoStore::open(
            dir.path(),
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            PicklingKey::from_bytes(vec![1; PicklingKey::LENGTH]).unwrap(),
        )
        .unwrap()
    }

    fn query_response(
        user_id: &OwnedUserId,
        device_keys: Vec<DeviceKeys>,
    ) -> KeysQueryResponse {
        let devices: BTreeMap<OwnedDeviceId, DeviceKeys> =
            device_keys.into_iter().map(|k| (k.device_id.clone(), k)).collect();

        KeysQueryResponse { device_keys: BTreeMap::from([(user_id.clone(), devices)]) }
    }

    #[test]
    fn tracked_users_become_outdated_on_change() {
        let mut tracker = DeviceTracker::new();
        let bob = user_id!("@bob:example.org").to_owned();

        tracker.track_users([bob.as_ref()]);
        assert!(tracker.encryption_update_required());
        assert!(tracker.outdated_users().contains(&bob));

        // A change notice for an untracked user is ignored.
        let lists = DeviceLists {
            changed: vec![user_id!("@stranger:example.org").to_owned()],
            left: vec![],
        };
        assert!(!tracker.consume_device_lists(&lists));

        let lists = DeviceLists { changed: vec![bob.clone()], left: vec![] };
        assert!(tracker.consume_device_lists(&lists));
    }

    #[test]
    fn left_users_are_dropped() {
        let mut tracker = DeviceTracker::new();
        let bob = user_id!("@bob:example.org").to_owned();

        tracker.track_users([bob.as_ref()]);

        let lists = DeviceLists { changed: vec![], left: vec![bob.clone()] };
        tracker.consume_device_lists(&lists);

        assert!(!tracker.tracked_users().contains(&bob));
        assert!(!tracker.outdated_users().contains(&bob));
    }

    #[test]
    fn valid_devices_are_ingested_and_persisted() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let mut tracker = DeviceTracker::new();

        let bob_account = Account::new(user_id!("@bob:example.org"), "BOBDEVICE");
        let bob = bob_account.user_id().to_owned();

        tracker.track_users([bob.as_ref()]);

        let response = query_response(&bob, vec![bob_account.device_keys()]);
        tracker.receive_keys_query_response(&response, &mut store).unwrap();

        assert!(!tracker.outdated_users().contains(&bob));
        assert!(tracker.is_known_curve_key(&bob, &bob_account.curve25519_key().to_base64()));

        let restored = DeviceTracker::load(&mut store).unwrap();
        assert!(restored.device(&bob, "BOBDEVICE").is_some());
    }

    #[test]
    fn device_reuse_keeps_the_stored_key() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let mut tracker = DeviceTracker::new();

        let bob_account = Account::new(user_id!("@bob:example.org"), "BOBDEVICE");
        let bob = bob_account.user_id().to_owned();
        tracker.track_users([bob.as_ref()]);

        let response = query_response(&bob, vec![bob_account.device_keys()]);
        tracker.receive_keys_query_response(&response, &mut store).unwrap();

        let original_key = bob_account.ed25519_key().to_base64();

        // The same device id announced with fresh keys is a reuse event.
        let impostor = Account::new(user_id!("@bob:example.org"), "BOBDEVICE");
        let response = query_response(&bob, vec![impostor.device_keys()]);
        tracker.receive_keys_query_response(&response, &mut store).unwrap();

        let device = tracker.device(&bob, "BOBDEVICE").unwrap();
        assert_eq!(device.ed25519_key, original_key);
    }

    #[test]
    fn mismatched_user_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let mut tracker = DeviceTracker::new();

        let eve_account = Account::new(user_id!("@eve:example.org"), "EVEDEVICE");
        let bob = user_id!("@bob:example.org").to_owned();
        tracker.track_users([bob.as_ref()]);

        // Eve's record served under Bob's user id.
        let response = query_response(&bob, vec![eve_account.device_keys()]);
        tracker.receive_keys_query_response(&response, &mut store).unwrap();

        assert!(tracker.device(&bob, "EVEDEVICE").is_none());
    }

    #[test]
    fn pending_events_drain_once_the_sender_is_known() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let mut tracker = DeviceTracker::new();

        let bob_account = Account::new(user_id!("@bob:example.org"), "BOBDEVICE");
        let bob = bob_account.user_id().to_owned();

        let event = crate::events::ToDeviceEvent {
            sender: bob.clone(),
            content: crate::types::OlmEncryptedContent {
                algorithm: crate::types::OLM_V1_CURVE25519_AES_SHA2.to_owned(),
                sender_key: bob_account.curve25519_key().to_base64(),
                ciphertext: BTreeMap::new(),
            },
        };

        tracker.queue_pending_event(event);
        assert!(tracker.encryption_update_required());
        assert!(tracker.outdated_users().contains(&bob));
        assert!(tracker.drain_decryptable_events().is_empty());
        assert_eq!(tracker.pending_event_count(), 1);

        let response = query_response(&bob, vec![bob_account.device_keys()]);
        tracker.receive_keys_query_response(&response, &mut store).unwrap();

        let drained = tracker.drain_decryptable_events();
        assert_eq!(drained.len(), 1);
        assert_eq!(tracker.pending_event_count(), 0);
    }
}
