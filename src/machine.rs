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

//! The session orchestrator: consumes sync responses, decrypts to-device
//! traffic, distributes and receives room keys, rotates outbound group
//! sessions and drives interactive verification.
//!
//! All state lives on one logical task; the only suspension points are the
//! transport calls.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use ruma::{
    DeviceId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedEventId, OwnedRoomId, OwnedUserId,
    RoomId, TransactionId, UInt, UserId,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use vodozemac::{megolm::SessionKey, olm::OlmMessage, Curve25519PublicKey};

use crate::{
    error::{MegolmError, OlmError, OlmResult, StoreError},
    events::{AnyToDeviceEvent, ToDeviceEvent},
    identities::TrackedDevice,
    olm::{
        Account, EncryptionSettings, InboundGroupSession, OutboundGroupSession, SessionOrigin,
    },
    secure_buffer::PicklingKey,
    store::CryptoStore,
    tracking::DeviceTracker,
    transport::{CredentialStore, KeysClaimResponse, SyncResponse, RoomUpdate, TransportClient},
    types::{
        MegolmEncryptedContent, OlmEncryptedContent, OlmPayload, RoomKeyContent,
        MEGOLM_V1_AES_SHA2, OLM_V1_CURVE25519_AES_SHA2, SIGNED_CURVE25519,
    },
    utilities::canonical_json,
    verification::{
        OutgoingVerification, Sas, VerificationEvent, Verifications,
    },
};

const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// One-time keys are replenished once the published count drops below this
/// fraction of the pool size.
const ONE_TIME_KEY_THRESHOLD: f64 = 0.4;

fn now() -> MilliSecondsSinceUnixEpoch {
    MilliSecondsSinceUnixEpoch::now()
}

/// Notifications the core pushes to its embedder.
#[derive(Clone, Debug)]
pub enum MachineSignal {
    /// A device finished interactive verification successfully.
    SessionVerified { user_id: OwnedUserId, device_id: OwnedDeviceId },
    /// The device list of these users went stale and a query is underway.
    DeviceKeysOutdated { users: Vec<OwnedUserId> },
    /// A room message couldn't be decrypted; it is parked until its key
    /// arrives.
    UndecryptableEvent { room_id: OwnedRoomId, event: Value },
    /// A new inbound group session is available.
    RoomKeyReceived { room_id: OwnedRoomId, session_id: String },
    /// A parked event became decryptable after its room key arrived.
    LateDecryptedEvent { room_id: OwnedRoomId, event: Value },
}

/// Aborts a running sync loop.
#[derive(Clone, Debug)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

struct RoomState {
    settings: EncryptionSettings,
    members: BTreeSet<OwnedUserId>,
}

/// The encryption state machine of one device.
pub struct CryptoMachine {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    account: Account,
    store: CryptoStore,
    tracker: DeviceTracker,
    transport: Arc<dyn TransportClient>,
    /// Olm sessions by remote identity key, newest first.
    olm_sessions: HashMap<String, Vec<crate::olm::Session>>,
    /// Inbound group sessions by room and session id; a missing room entry
    /// means the room hasn't been loaded from the store yet.
    inbound_sessions: HashMap<OwnedRoomId, HashMap<String, InboundGroupSession>>,
    outbound_sessions: HashMap<OwnedRoomId, OutboundGroupSession>,
    rooms: HashMap<OwnedRoomId, RoomState>,
    one_time_key_counts: BTreeMap<String, u64>,
    uploading_keys: bool,
    verifications: Verifications,
    next_batch: Option<String>,
    signals: UnboundedSender<MachineSignal>,
    signal_receiver: Option<UnboundedReceiver<MachineSignal>>,
    stopped: Arc<AtomicBool>,
}

impl CryptoMachine {
    /// Open the machine for a (user, device) pair.
    ///
    /// The pickling key is fetched from the credential store, or generated
    /// and stored there on first run; the account is restored from the
    /// store, or freshly created.
    pub async fn open(
        user_id: &UserId,
        device_id: &DeviceId,
        data_dir: &Path,
        transport: Arc<dyn TransportClient>,
        credentials: &mut dyn CredentialStore,
    ) -> OlmResult<Self> {
        let pickle_entry = format!("{user_id}-Pickle");

        let pickling_key = match credentials.read(&pickle_entry).map_err(StoreError::from)? {
            Some(bytes) => PicklingKey::from_bytes(bytes).map_err(StoreError::from)?,
            None => {
                debug!("Generating a new pickling key");
                let key = PicklingKey::generate().map_err(StoreError::from)?;
                credentials.write(&pickle_entry, key.as_bytes()).map_err(StoreError::from)?;
                key
            }
        };

        let mut store = CryptoStore::open(data_dir, user_id, device_id, pickling_key)?;

        let account = match store.load_account()? {
            Some(account) => {
                debug!("Restored the account from the store");
                account
            }
            None => {
                let account = Account::new(user_id, device_id.as_str());
                store.save_account(&account)?;
                account
            }
        };

        let tracker = DeviceTracker::load(&mut store)?;
        let olm_sessions = store.load_olm_sessions()?;

        let (signals, signal_receiver) = mpsc::unbounded_channel();

        Ok(Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            account,
            store,
            tracker,
            transport,
            olm_sessions,
            inbound_sessions: HashMap::new(),
            outbound_sessions: HashMap::new(),
            rooms: HashMap::new(),
            one_time_key_counts: BTreeMap::new(),
            uploading_keys: false,
            verifications: Verifications::new(),
            next_batch: None,
            signals,
            signal_receiver: Some(signal_receiver),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The receiver half of the signal channel. Can be taken once.
    pub fn signals(&mut self) -> Option<UnboundedReceiver<MachineSignal>> {
        self.signal_receiver.take()
    }

    /// A handle that aborts [`CryptoMachine::run_sync_loop`].
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { stopped: self.stopped.clone() }
    }

    /// Run the long-poll sync loop until the stop handle fires.
    ///
    /// Transport failures of the sync itself are retried indefinitely.
    pub async fn run_sync_loop(&mut self) -> OlmResult<()> {
        while !self.stopped.load(Ordering::Relaxed) {
            let response = match self
                .transport
                .sync(self.next_batch.as_deref(), None, SYNC_TIMEOUT)
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Sync failed, retrying");
                    continue;
                }
            };

            self.receive_sync_response(response).await?;
        }

        Ok(())
    }

    /// Consume one sync response.
    ///
    /// The processing order is fixed: one-time key accounting, device-list
    /// deltas, to-device events, room data, account data and presence, the
    /// batch token, and finally any pending device-keys refresh. Room keys
    /// in the to-device section therefore land before any room timeline
    /// decryption that needs them.
    pub async fn receive_sync_response(&mut self, response: SyncResponse) -> OlmResult<()> {
        self.one_time_key_counts = response.device_one_time_keys_count;
        self.replenish_one_time_keys().await?;

        if self.tracker.consume_device_lists(&response.device_lists) {
            self.query_device_keys().await;
        }

        for raw in &response.to_device_events {
            match AnyToDeviceEvent::from_json(raw) {
                Ok(event) => self.receive_to_device_event(event).await,
                Err(e) => warn!(error = %e, "Skipping a malformed to-device event"),
            }
        }

        for room in &response.rooms {
            self.update_room(room);
        }

        // Account data and presence carry nothing the crypto core acts on;
        // they are consumed here to keep the processing order stable.
        drop(response.account_data);
        drop(response.presence);

        self.next_batch = Some(response.next_batch);

        if self.tracker.encryption_update_required() {
            self.query_device_keys().await;
        }

        self.sweep_verifications().await;

        Ok(())
    }

    // ------------------------------------------------------------------
    // One-time keys

    async fn replenish_one_time_keys(&mut self) -> OlmResult<()> {
        let max = self.account.max_one_time_keys() as u64;
        let published =
            self.one_time_key_counts.get(SIGNED_CURVE25519).copied().unwrap_or_default();

        if (published as f64) >= ONE_TIME_KEY_THRESHOLD * max as f64 || self.uploading_keys {
            return Ok(());
        }

        self.uploading_keys = true;

        let target = max / 2;
        self.account.generate_one_time_keys((target - published) as usize);
        self.store.save_account(&self.account)?;

        let device_keys = (!self.account.shared()).then(|| self.account.device_keys());
        let one_time_keys = self.account.signed_one_time_keys();

        let result = self.transport.upload_keys(device_keys, one_time_keys).await;
        self.uploading_keys = false;

        match result {
            Ok(response) => {
                self.account.mark_keys_as_published();
                self.account.mark_as_shared();
                self.store.save_account(&self.account)?;
                self.one_time_key_counts = response.one_time_key_counts;
            }
            Err(e) => warn!(error = %e, "Failed to upload one-time keys"),
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Device tracking

    async fn query_device_keys(&mut self) {
        self.tracker.clear_encryption_update_required();

        let users = self.tracker.users_for_key_query();
        if users.is_empty() {
            return;
        }

        let _ = self.signals.send(MachineSignal::DeviceKeysOutdated {
            users: users.keys().cloned().collect(),
        });

        match self.transport.query_keys(users).await {
            Ok(response) => {
                if let Err(e) =
                    self.tracker.receive_keys_query_response(&response, &mut self.store)
                {
                    warn!(error = %e, "Failed to persist the updated device list");
                }

                for event in self.tracker.drain_decryptable_events() {
                    if let Err(e) = self.receive_encrypted_to_device(event).await {
                        warn!(error = %e, "Failed to decrypt a buffered to-device event");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "The device keys query failed");
                self.tracker.set_encryption_update_required();
            }
        }
    }

    // ------------------------------------------------------------------
    // To-device events

    async fn receive_to_device_event(&mut self, event: AnyToDeviceEvent) {
        match event {
            AnyToDeviceEvent::RoomEncrypted(event) => {
                if let Err(e) = self.receive_encrypted_to_device(event).await {
                    warn!(error = %e, "Failed to handle an encrypted to-device event");
                }
            }
            AnyToDeviceEvent::RoomKey(event) => {
                // Room keys are only trustworthy inside an Olm envelope.
                warn!(sender = %event.sender, "Ignoring a plaintext room key event");
            }
            AnyToDeviceEvent::KeyVerificationRequest(e) => {
                self.receive_verification_event(
                    e.sender.clone(),
                    VerificationEvent::Request(e.content),
                    false,
                )
                .await;
            }
            AnyToDeviceEvent::KeyVerificationReady(e) => {
                self.receive_verification_event(
                    e.sender.clone(),
                    VerificationEvent::Ready(e.content),
                    false,
                )
                .await;
            }
            AnyToDeviceEvent::KeyVerificationStart(e) => {
                self.receive_verification_event(
                    e.sender.clone(),
                    VerificationEvent::Start(e.content),
                    false,
                )
                .await;
            }
            AnyToDeviceEvent::KeyVerificationAccept(e) => {
                self.receive_verification_event(
                    e.sender.clone(),
                    VerificationEvent::Accept(e.content),
                    false,
                )
                .await;
            }
            AnyToDeviceEvent::KeyVerificationKey(e) => {
                self.receive_verification_event(
                    e.sender.clone(),
                    VerificationEvent::Key(e.content),
                    false,
                )
                .await;
            }
            AnyToDeviceEvent::KeyVerificationMac(e) => {
                self.receive_verification_event(
                    e.sender.clone(),
                    VerificationEvent::Mac(e.content),
                    false,
                )
                .await;
            }
            AnyToDeviceEvent::KeyVerificationDone(e) => {
                self.receive_verification_event(
                    e.sender.clone(),
                    VerificationEvent::Done(e.content),
                    false,
                )
                .await;
            }
            AnyToDeviceEvent::KeyVerificationCancel(e) => {
                self.receive_verification_event(
                    e.sender.clone(),
                    VerificationEvent::Cancel(e.content),
                    false,
                )
                .await;
            }
            AnyToDeviceEvent::Custom { event_type, .. } => {
                debug!(%event_type, "Ignoring an unhandled to-device event");
            }
        }
    }

    async fn receive_encrypted_to_device(
        &mut self,
        event: ToDeviceEvent<OlmEncryptedContent>,
    ) -> OlmResult<()> {
        if event.content.algorithm != OLM_V1_CURVE25519_AES_SHA2 {
            debug!(
                algorithm = %event.content.algorithm,
                "Dropping a to-device event with an unsupported algorithm"
            );
            return Ok(());
        }

        let sender = event.sender.clone();
        let sender_key = event.content.sender_key.clone();

        if !self.tracker.is_known_curve_key(&sender, &sender_key) {
            debug!(
                %sender,
                %sender_key,
                "Received an encrypted event from an unknown device, queueing it"
            );
            self.tracker.queue_pending_event(event);
            return Ok(());
        }

        let own_key = self.account.curve25519_key().to_base64();
        let Some(message) = event.content.ciphertext.get(&own_key).cloned() else {
            debug!(%sender, "The encrypted event has no ciphertext for our device");
            return Ok(());
        };

        let (plaintext, olm_session_id) = self.decrypt_olm_message(&sender_key, &message)?;
        let payload: OlmPayload = serde_json::from_slice(&plaintext)?;

        if payload.sender != sender {
            warn!(
                %sender,
                claimed = %payload.sender,
                "Dropping an Olm message whose payload names a different sender"
            );
            return Ok(());
        }

        let tracked_ed_key =
            self.tracker.device_for_curve_key(&sender, &sender_key).map(|d| d.ed25519_key.clone());
        let claimed_ed_key = payload.keys.get("ed25519").cloned();

        if claimed_ed_key.is_none() || claimed_ed_key != tracked_ed_key {
            warn!(%sender, "Dropping an Olm message with an invalid Ed25519 key");
            return Ok(());
        }

        if payload.recipient != self.user_id {
            warn!(
                %sender,
                recipient = %payload.recipient,
                "Dropping an Olm message addressed to another user"
            );
            return Ok(());
        }

        if payload.recipient_keys.get("ed25519")
            != Some(&self.account.ed25519_key().to_base64())
        {
            warn!(%sender, "Dropping an Olm message encrypted for another Ed25519 key");
            return Ok(());
        }

        match payload.event_type.as_str() {
            "m.room_key" => {
                let content: RoomKeyContent = serde_json::from_value(payload.content)?;
                self.receive_room_key(sender, sender_key, olm_session_id, claimed_ed_key, content)
            }
            event_type if event_type.starts_with("m.key.verification.") => {
                if let Some(event) = parse_verification_event(event_type, payload.content) {
                    self.receive_verification_event(sender, event, true).await;
                } else {
                    warn!(%sender, event_type, "Malformed encrypted verification event");
                }
                Ok(())
            }
            event_type => {
                debug!(%sender, event_type, "Skipping an encrypted to-device event");
                Ok(())
            }
        }
    }

    /// Find or create the Olm session that decrypts the message.
    ///
    /// Pre-key messages prefer an existing matching session; only when none
    /// matches is a fresh inbound session created, consuming one of our
    /// one-time keys.
    fn decrypt_olm_message(
        &mut self,
        sender_key: &str,
        message: &OlmMessage,
    ) -> OlmResult<(Vec<u8>, String)> {
        let timestamp = now();
        let sessions = self.olm_sessions.entry(sender_key.to_owned()).or_default();

        for i in 0..sessions.len() {
            let session = &mut sessions[i];

            let matches = match message {
                OlmMessage::PreKey(m) => {
                    if !session.matches_inbound(m) {
                        continue;
                    }
                    true
                }
                OlmMessage::Normal(_) => false,
            };

            match session.decrypt(message, timestamp) {
                Ok(plaintext) => {
                    let session_id = session.session_id().to_owned();
                    self.store.update_olm_session(session)?;
                    self.store.set_olm_session_last_received(&session_id, timestamp)?;

                    // Keep the newest session in front.
                    let session = sessions.remove(i);
                    sessions.insert(0, session);

                    return Ok((plaintext, session_id));
                }
                Err(e) => {
                    if matches {
                        warn!(
                            sender_key,
                            error = %e,
                            "The matching Olm session failed to decrypt its own pre-key message"
                        );
                        return Err(e);
                    }
                    // A non-matching session simply doesn't own this
                    // message; try the next one.
                }
            }
        }

        match message {
            OlmMessage::PreKey(m) => {
                let key = Curve25519PublicKey::from_base64(sender_key)?;
                let (session, plaintext) = self.account.create_inbound_session(key, m)?;

                // The used one-time key is gone from the pool.
                self.store.save_account(&self.account)?;
                self.store.save_olm_session(&session)?;

                let session_id = session.session_id().to_owned();
                self.olm_sessions.entry(sender_key.to_owned()).or_default().insert(0, session);

                Ok((plaintext, session_id))
            }
            OlmMessage::Normal(_) => {
                warn!(sender_key, "No Olm session could decrypt the message");
                Err(OlmError::MissingSession)
            }
        }
    }

    // ------------------------------------------------------------------
    // Room keys, inbound

    fn receive_room_key(
        &mut self,
        sender: OwnedUserId,
        sender_key: String,
        olm_session_id: String,
        sender_claimed_ed25519_key: Option<String>,
        content: RoomKeyContent,
    ) -> OlmResult<()> {
        if content.algorithm != MEGOLM_V1_AES_SHA2 {
            warn!(
                algorithm = %content.algorithm,
                "Received a room key with an unsupported algorithm"
            );
            return Ok(());
        }

        if !self.rooms.contains_key(&content.room_id) {
            debug!(
                room_id = %content.room_id,
                "Received a room key for a room without encryption, ignoring it"
            );
            return Ok(());
        }

        let session_key = SessionKey::from_base64(&content.session_key)
            .map_err(MegolmError::from)?;

        let session = InboundGroupSession::new(
            &content.room_id,
            &sender,
            sender_key,
            sender_claimed_ed25519_key,
            SessionOrigin::Olm(olm_session_id),
            &session_key,
        );

        info!(
            room_id = %content.room_id,
            session_id = session.session_id(),
            %sender,
            "Received a new inbound group session"
        );

        self.add_inbound_group_session(session)?;

        Ok(())
    }

    fn add_inbound_group_session(&mut self, session: InboundGroupSession) -> OlmResult<()> {
        let room_id = session.room_id().to_owned();
        let session_id = session.session_id().to_owned();

        match self.store.save_inbound_group_session(&session) {
            Ok(()) => {}
            Err(StoreError::IntegrityViolation(reason)) => {
                warn!(%reason, "Discarding a duplicated inbound group session");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        self.ensure_inbound_sessions_loaded(&room_id)?;
        self.inbound_sessions
            .entry(room_id.clone())
            .or_default()
            .insert(session_id.clone(), session);

        let _ = self.signals.send(MachineSignal::RoomKeyReceived {
            room_id: room_id.clone(),
            session_id: session_id.clone(),
        });

        self.retry_undecrypted_events(&room_id, &session_id)?;

        Ok(())
    }

    fn ensure_inbound_sessions_loaded(&mut self, room_id: &RoomId) -> OlmResult<()> {
        if !self.inbound_sessions.contains_key(room_id) {
            let sessions = self.store.load_inbound_group_sessions(room_id)?;
            let map = sessions.into_iter().map(|s| (s.session_id().to_owned(), s)).collect();
            self.inbound_sessions.insert(room_id.to_owned(), map);
        }

        Ok(())
    }

    fn retry_undecrypted_events(&mut self, room_id: &RoomId, session_id: &str) -> OlmResult<()> {
        for (rowid, json) in self.store.undecrypted_events(room_id)? {
            let Ok(event) = serde_json::from_str::<Value>(&json) else {
                self.store.remove_undecrypted_event(rowid)?;
                continue;
            };

            if event["content"]["session_id"].as_str() != Some(session_id) {
                continue;
            }

            match self.decrypt_room_event_impl(room_id, &event, false) {
                Ok(decrypted) => {
                    self.store.remove_undecrypted_event(rowid)?;
                    let _ = self.signals.send(MachineSignal::LateDecryptedEvent {
                        room_id: room_id.to_owned(),
                        event: decrypted,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "A parked event still doesn't decrypt with its room key")
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Room data and room message decryption

    fn update_room(&mut self, update: &RoomUpdate) {
        if let Some(encryption) = &update.encryption {
            debug!(room_id = %update.room_id, "Room has encryption enabled");

            self.tracker.track_users(update.joined_members.iter().map(|u| u.as_ref()));
            self.rooms.insert(
                update.room_id.clone(),
                RoomState {
                    settings: EncryptionSettings::from(encryption),
                    members: update.joined_members.iter().cloned().collect(),
                },
            );
        } else if let Some(room) = self.rooms.get_mut(&update.room_id) {
            if !update.joined_members.is_empty() {
                room.members = update.joined_members.iter().cloned().collect();
                self.tracker.track_users(update.joined_members.iter().map(|u| u.as_ref()));
            }
        }
    }

    /// Decrypt a Megolm room event.
    ///
    /// On success the plaintext event is returned with the sender, event id
    /// and server timestamp of the envelope merged in. An event whose
    /// session isn't known yet is parked and retried once the key arrives.
    pub fn decrypt_room_event(&mut self, room_id: &RoomId, event: &Value) -> Result<Value, MegolmError> {
        self.decrypt_room_event_impl(room_id, event, true)
    }

    fn decrypt_room_event_impl(
        &mut self,
        room_id: &RoomId,
        event: &Value,
        park_on_missing_key: bool,
    ) -> Result<Value, MegolmError> {
        let content: MegolmEncryptedContent =
            serde_json::from_value(event["content"].clone())?;

        if content.algorithm != MEGOLM_V1_AES_SHA2 {
            return Err(MegolmError::UnsupportedAlgorithm);
        }

        self.ensure_inbound_sessions_loaded(room_id).map_err(|e| match e {
            OlmError::Store(e) => MegolmError::Store(e),
            _ => MegolmError::MissingRoomKey,
        })?;

        let session = self
            .inbound_sessions
            .get_mut(room_id)
            .and_then(|sessions| sessions.get_mut(&content.session_id));

        let Some(session) = session else {
            if park_on_missing_key {
                self.store.save_undecrypted_event(room_id, now(), &event.to_string())?;
                let _ = self.signals.send(MachineSignal::UndecryptableEvent {
                    room_id: room_id.to_owned(),
                    event: event.clone(),
                });
            }

            return Err(MegolmError::MissingRoomKey);
        };

        // The envelope sender has to be the user the session was received
        // from.
        let event_sender = event["sender"]
            .as_str()
            .and_then(|s| OwnedUserId::try_from(s.to_owned()).ok());

        if event_sender.as_deref() != Some(session.sender_id()) {
            return Err(MegolmError::MismatchedSender(
                event_sender.unwrap_or_else(|| session.sender_id().to_owned()),
                session.sender_id().to_owned(),
            ));
        }

        let (plaintext, message_index) = session.decrypt(&content.ciphertext)?;

        let event_id = event["event_id"].as_str().unwrap_or_default().to_owned();
        let origin_server_ts = event["origin_server_ts"].as_u64().unwrap_or_default();

        // The same (session, index) must never produce two different
        // events.
        match self.store.group_session_index_record(room_id, &content.session_id, message_index)? {
            Some((known_event_id, known_ts)) => {
                if known_event_id != event_id || u64::from(known_ts.get()) != origin_server_ts {
                    return Err(MegolmError::ReplayedIndex {
                        index: message_index,
                        known_event_id,
                    });
                }
            }
            None => {
                self.store.add_group_session_index_record(
                    room_id,
                    &content.session_id,
                    message_index,
                    &event_id,
                    MilliSecondsSinceUnixEpoch(
                        UInt::try_from(origin_server_ts).unwrap_or(UInt::MAX),
                    ),
                )?;
            }
        }

        let mut decrypted: Value = serde_json::from_slice(&plaintext)?;

        if let Some(object) = decrypted.as_object_mut() {
            object.insert("sender".to_owned(), event["sender"].clone());
            object.insert("event_id".to_owned(), event["event_id"].clone());
            object.insert("origin_server_ts".to_owned(), event["origin_server_ts"].clone());

            if let Some(unsigned) = event.get("unsigned") {
                object.insert("unsigned".to_owned(), unsigned.clone());
            }
        }

        Ok(decrypted)
    }

    // ------------------------------------------------------------------
    // Outbound room messages

    /// Encrypt and send a room message, distributing the current outbound
    /// session to every room device that doesn't have it yet.
    pub async fn send_room_message(
        &mut self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> OlmResult<OwnedEventId> {
        let Some(room) = self.rooms.get(room_id) else {
            return Err(MegolmError::EncryptionNotEnabled(room_id.to_owned()).into());
        };

        let settings = room.settings.clone();
        let members: Vec<OwnedUserId> = room.members.iter().cloned().collect();

        self.ensure_outbound_session(room_id, settings)?;
        self.share_outbound_session(room_id, &members).await?;

        let (envelope, session_id, message_index) = {
            let session = self
                .outbound_sessions
                .get_mut(room_id)
                .expect("the outbound session was just ensured");

            let payload = json!({
                "room_id": room_id,
                "type": event_type,
                "content": content,
            });

            let message_index = session.message_index();
            let ciphertext = session.encrypt(&payload.to_string()).to_base64();

            (
                MegolmEncryptedContent {
                    algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
                    sender_key: self.account.curve25519_key().to_base64(),
                    device_id: self.device_id.clone(),
                    session_id: session.session_id().to_owned(),
                    ciphertext,
                },
                session.session_id().to_owned(),
                message_index,
            )
        };

        let session = self.outbound_sessions.get(room_id).expect("still present");
        self.store.save_outbound_group_session(session)?;

        debug!(%room_id, %session_id, message_index, "Sending an encrypted room message");

        let txn_id = TransactionId::new();
        let event_id = self
            .transport
            .send_message(room_id, "m.room.encrypted", &txn_id, serde_json::to_value(&envelope)?)
            .await?;

        Ok(event_id)
    }

    /// Load or create the current outbound session, rotating it when it has
    /// hit its message count or age limit.
    fn ensure_outbound_session(
        &mut self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> OlmResult<()> {
        if !self.outbound_sessions.contains_key(room_id) {
            if let Some(session) =
                self.store.load_outbound_group_session(room_id, settings.clone())?
            {
                self.outbound_sessions.insert(room_id.to_owned(), session);
            }
        }

        let rotate =
            self.outbound_sessions.get(room_id).map_or(true, |session| session.expired(now()));

        if rotate {
            let session = OutboundGroupSession::new(room_id, settings);
            info!(
                %room_id,
                session_id = session.session_id(),
                "Created a new outbound group session"
            );

            // The decrypting half for our own messages.
            let inbound = InboundGroupSession::new(
                room_id,
                &self.user_id,
                self.account.curve25519_key().to_base64(),
                Some(self.account.ed25519_key().to_base64()),
                SessionOrigin::SelfGenerated,
                &session.session_key(),
            );

            self.store.save_outbound_group_session(&session)?;
            self.outbound_sessions.insert(room_id.to_owned(), session);

            self.store.save_inbound_group_session(&inbound)?;
            self.ensure_inbound_sessions_loaded(room_id)?;
            self.inbound_sessions
                .entry(room_id.to_owned())
                .or_default()
                .insert(inbound.session_id().to_owned(), inbound);
        }

        Ok(())
    }

    /// Ship the current outbound session to the room devices that don't
    /// have it, creating Olm sessions on the way as needed.
    async fn share_outbound_session(
        &mut self,
        room_id: &RoomId,
        members: &[OwnedUserId],
    ) -> OlmResult<()> {
        let (session_id, session_key, message_index) = {
            let session =
                self.outbound_sessions.get(room_id).expect("the outbound session exists");
            (
                session.session_id().to_owned(),
                session.session_key().to_base64(),
                session.message_index(),
            )
        };

        let mut candidates: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>> = BTreeMap::new();

        for user in members {
            let Some(devices) = self.tracker.user_devices(user) else { continue };

            let mut device_ids: Vec<OwnedDeviceId> = devices.keys().cloned().collect();

            if user == &self.user_id {
                device_ids.retain(|d| d != &self.device_id);
            }

            if !device_ids.is_empty() {
                candidates.insert(user.clone(), device_ids);
            }
        }

        let to_send = self.store.devices_without_key(room_id, candidates, &session_id)?;

        if to_send.is_empty() {
            return Ok(());
        }

        // Claim one-time keys for the devices we don't have an Olm session
        // with yet.
        let mut to_claim: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>> = BTreeMap::new();

        for (user, devices) in &to_send {
            for device_id in devices {
                let Some(device) = self.tracker.device(user, device_id.as_str()) else {
                    continue;
                };

                let has_session = self
                    .olm_sessions
                    .get(&device.curve25519_key)
                    .is_some_and(|sessions| !sessions.is_empty());

                if !has_session {
                    to_claim
                        .entry(user.clone())
                        .or_default()
                        .insert(device_id.clone(), SIGNED_CURVE25519.to_owned());
                }
            }
        }

        if !to_claim.is_empty() {
            let response = self.transport.claim_keys(to_claim).await?;
            self.create_outbound_olm_sessions(&response);
        }

        let key_content = json!({
            "algorithm": MEGOLM_V1_AES_SHA2,
            "room_id": room_id,
            "session_id": session_id,
            "session_key": session_key,
            "chain_index": message_index,
        });

        let mut messages: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>> = BTreeMap::new();
        let mut receiving_devices: Vec<(OwnedUserId, OwnedDeviceId, String)> = Vec::new();

        for (user, devices) in &to_send {
            for device_id in devices {
                let Some(device) = self.tracker.device(user, device_id.as_str()).cloned() else {
                    continue;
                };

                match self.olm_encrypt_to_device(&device, "m.room_key", key_content.clone()) {
                    Ok(envelope) => {
                        messages
                            .entry(user.clone())
                            .or_default()
                            .insert(device_id.clone(), serde_json::to_value(envelope)?);
                        receiving_devices.push((
                            user.clone(),
                            device_id.clone(),
                            device.curve25519_key.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(
                            %user,
                            %device_id,
                            error = %e,
                            "Can't encrypt the room key for a device"
                        );
                    }
                }
            }
        }

        if messages.is_empty() {
            return Ok(());
        }

        debug!(
            %room_id,
            %session_id,
            devices = receiving_devices.len(),
            "Sending the room key to devices"
        );

        let txn_id = TransactionId::new();
        self.transport.send_to_device("m.room.encrypted", &txn_id, messages).await?;

        self.store.set_devices_received_key(
            room_id,
            &receiving_devices,
            &session_id,
            message_index,
        )?;

        Ok(())
    }

    /// Turn a one-time key claim response into outbound Olm sessions,
    /// verifying each key's signature first.
    fn create_outbound_olm_sessions(&mut self, response: &KeysClaimResponse) {
        for (user_id, devices) in &response.one_time_keys {
            for (device_id, keys) in devices {
                let Some(device) = self.tracker.device(user_id, device_id.as_str()).cloned()
                else {
                    warn!(%user_id, %device_id, "Got a one-time key for an unknown device");
                    continue;
                };

                let Some(one_time_key) = keys.values().next() else {
                    warn!(%user_id, %device_id, "The claim response carries no key");
                    continue;
                };

                if let Err(e) = one_time_key.verify_signature(
                    user_id,
                    &device.ed25519_key_id,
                    &device.ed25519_key,
                ) {
                    warn!(
                        %user_id,
                        %device_id,
                        error = %e,
                        "The one-time key signature doesn't verify, skipping the device"
                    );
                    continue;
                }

                match self
                    .account
                    .create_outbound_session(&device.curve25519_key, &one_time_key.key)
                {
                    Ok(session) => {
                        if let Err(e) = self.store.save_olm_session(&session) {
                            warn!(error = %e, "Failed to persist a new Olm session");
                            continue;
                        }

                        debug!(%user_id, %device_id, "Created an outbound Olm session");
                        self.olm_sessions
                            .entry(device.curve25519_key.clone())
                            .or_default()
                            .insert(0, session);
                    }
                    Err(e) => {
                        warn!(%user_id, %device_id, error = %e, "Failed to create an Olm session")
                    }
                }
            }
        }
    }

    /// Wrap a payload in a per-device Olm envelope using the newest session
    /// for the device.
    fn olm_encrypt_to_device(
        &mut self,
        device: &TrackedDevice,
        event_type: &str,
        content: Value,
    ) -> OlmResult<OlmEncryptedContent> {
        let payload = json!({
            "sender": &self.user_id,
            "sender_device": &self.device_id,
            "keys": { "ed25519": self.account.ed25519_key().to_base64() },
            "recipient": &device.user_id,
            "recipient_keys": { "ed25519": &device.ed25519_key },
            "type": event_type,
            "content": content,
        });

        let plaintext =
            canonical_json(&payload).expect("an Olm payload can always be canonicalized");

        let sessions = self
            .olm_sessions
            .get_mut(&device.curve25519_key)
            .filter(|sessions| !sessions.is_empty())
            .ok_or(OlmError::MissingSession)?;

        let session = &mut sessions[0];
        let message = session.encrypt(&plaintext);
        self.store.update_olm_session(session)?;

        Ok(OlmEncryptedContent {
            algorithm: OLM_V1_CURVE25519_AES_SHA2.to_owned(),
            sender_key: self.account.curve25519_key().to_base64(),
            ciphertext: BTreeMap::from([(device.curve25519_key.clone(), message)]),
        })
    }

    // ------------------------------------------------------------------
    // Verification

    /// Start verifying one of the remote user's devices.
    ///
    /// Returns the transaction id of the new verification flow.
    pub async fn request_verification(
        &mut self,
        user_id: &UserId,
        device_id: &str,
    ) -> OlmResult<String> {
        let remote_ed_key =
            self.tracker.device(user_id, device_id).map(|d| d.ed25519_key.clone());

        let (sas, request) = Sas::start_request(
            self.user_id.clone(),
            self.device_id.clone(),
            self.account.ed25519_key().to_base64(),
            user_id.to_owned(),
            device_id.into(),
            remote_ed_key,
            now(),
        );

        let transaction_id = sas.transaction_id().to_owned();
        let route =
            (sas.remote_user_id().clone(), sas.remote_device_id().clone(), sas.encrypted_transport());

        self.verifications.insert(sas);
        self.send_verification_messages(route.0, route.1, route.2, vec![request]).await?;

        Ok(transaction_id)
    }

    /// The user accepted an incoming verification request.
    pub async fn accept_verification(&mut self, transaction_id: &str) -> OlmResult<()> {
        let Some(sas) = self.verifications.get_mut(transaction_id) else {
            warn!(transaction_id, "Accepting an unknown verification");
            return Ok(());
        };

        let outgoing = sas.accept_request();
        let route =
            (sas.remote_user_id().clone(), sas.remote_device_id().clone(), sas.encrypted_transport());

        self.send_verification_messages(route.0, route.1, route.2, outgoing).await
    }

    /// The user confirmed that the short authentication strings match.
    pub async fn confirm_verification(&mut self, transaction_id: &str) -> OlmResult<()> {
        let (outgoing, route, newly_verified) = {
            let Some(sas) = self.verifications.get_mut(transaction_id) else {
                warn!(transaction_id, "Confirming an unknown verification");
                return Ok(());
            };

            let outgoing = sas.confirm();
            (
                outgoing,
                (
                    sas.remote_user_id().clone(),
                    sas.remote_device_id().clone(),
                    sas.encrypted_transport(),
                ),
                sas.take_newly_verified_key(),
            )
        };

        if let Some(ed_key_id) = newly_verified {
            self.apply_verification_trust(&route.0, &route.1, &ed_key_id)?;
        }

        self.send_verification_messages(route.0, route.1, route.2, outgoing).await
    }

    /// The emoji of an ongoing verification, once both keys are exchanged.
    pub fn verification_emoji(
        &self,
        transaction_id: &str,
    ) -> Option<Vec<(&'static str, &'static str)>> {
        let sas = self.verifications.get(transaction_id)?;
        let emoji = sas.emoji();

        if emoji.is_empty() {
            None
        } else {
            Some(emoji.to_vec())
        }
    }

    async fn receive_verification_event(
        &mut self,
        sender: OwnedUserId,
        event: VerificationEvent,
        encrypted: bool,
    ) {
        if let VerificationEvent::Request(content) = &event {
            let remote_ed_key = self
                .tracker
                .device(&sender, content.from_device.as_str())
                .map(|d| d.ed25519_key.clone());

            match Sas::from_request(
                self.user_id.clone(),
                self.device_id.clone(),
                self.account.ed25519_key().to_base64(),
                sender.clone(),
                content,
                remote_ed_key,
                encrypted,
                now(),
            ) {
                Some(sas) => {
                    info!(
                        %sender,
                        from_device = %content.from_device,
                        transaction_id = %content.transaction_id,
                        "Received a verification request"
                    );
                    self.verifications.insert(sas);
                }
                None => {
                    debug!(%sender, "Ignoring a verification request that is about to expire")
                }
            }

            return;
        }

        let transaction_id = event.transaction_id().to_owned();

        let (outgoing, route, newly_verified) = {
            let Some(sas) = self.verifications.get_mut(&transaction_id) else {
                warn!(
                    %sender,
                    %transaction_id,
                    "Received a verification event for an unknown transaction"
                );
                return;
            };

            let outgoing = if sas.remote_user_id() != &sender {
                vec![sas.cancel(crate::verification::CancelCode::UserMismatch)]
            } else {
                sas.receive(&event, now())
            };

            (
                outgoing,
                (
                    sas.remote_user_id().clone(),
                    sas.remote_device_id().clone(),
                    sas.encrypted_transport(),
                ),
                sas.take_newly_verified_key(),
            )
        };

        if let Some(ed_key_id) = newly_verified {
            if let Err(e) = self.apply_verification_trust(&route.0, &route.1, &ed_key_id) {
                warn!(error = %e, "Failed to persist the verification result");
            }
        }

        if let Err(e) =
            self.send_verification_messages(route.0, route.1, route.2, outgoing).await
        {
            warn!(error = %e, "Failed to send verification messages");
        }
    }

    fn apply_verification_trust(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        ed_key_id: &str,
    ) -> OlmResult<()> {
        info!(%user_id, %device_id, "Interactive verification succeeded");

        self.store.set_session_verified(ed_key_id)?;
        self.tracker.mark_device_verified(user_id, device_id.as_str());
        self.tracker.save(&mut self.store)?;

        let _ = self.signals.send(MachineSignal::SessionVerified {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
        });

        Ok(())
    }

    async fn send_verification_messages(
        &mut self,
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        encrypted: bool,
        outgoing: Vec<OutgoingVerification>,
    ) -> OlmResult<()> {
        for message in outgoing {
            let (event_type, content) = if encrypted {
                let device = self
                    .tracker
                    .device(&user_id, device_id.as_str())
                    .cloned()
                    .ok_or(OlmError::MissingSession)?;

                let envelope =
                    self.olm_encrypt_to_device(&device, message.event_type(), message.content())?;

                ("m.room.encrypted", serde_json::to_value(envelope)?)
            } else {
                (message.event_type(), message.content())
            };

            let txn_id = TransactionId::new();
            let messages = BTreeMap::from([(
                user_id.clone(),
                BTreeMap::from([(device_id.clone(), content)]),
            )]);

            self.transport.send_to_device(event_type, &txn_id, messages).await?;
        }

        Ok(())
    }

    async fn sweep_verifications(&mut self) {
        for (sas, cancel) in self.verifications.garbage_collect(now()) {
            debug!(
                transaction_id = sas.transaction_id(),
                "A verification timed out, cancelling it"
            );

            if let Err(e) = self
                .send_verification_messages(
                    sas.remote_user_id().clone(),
                    sas.remote_device_id().clone(),
                    sas.encrypted_transport(),
                    vec![cancel],
                )
                .await
            {
                warn!(error = %e, "Failed to send a verification cancel");
            }
        }
    }
}

impl std::fmt::Debug for CryptoMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoMachine")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

fn parse_verification_event(event_type: &str, content: Value) -> Option<VerificationEvent> {
    Some(match event_type {
        "m.key.verification.request" => {
            VerificationEvent::Request(serde_json::from_value(content).ok()?)
        }
        "m.key.verification.ready" => {
            VerificationEvent::Ready(serde_json::from_value(content).ok()?)
        }
        "m.key.verification.start" => {
            VerificationEvent::Start(serde_json::from_value(content).ok()?)
        }
        "m.key.verification.accept" => {
            VerificationEvent::Accept(serde_json::from_value(content).ok()?)
        }
        "m.key.verification.key" => VerificationEvent::Key(serde_json::from_value(content).ok()?),
        "m.key.verification.mac" => VerificationEvent::Mac(serde_json::from_value(content).ok()?),
        "m.key.verification.done" => {
            VerificationEvent::Done(serde_json::from_value(content).ok()?)
        }
        "m.key.verification.cancel" => {
            VerificationEvent::Cancel(serde_json::from_value(content).ok()?)
        }
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, HashMap},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use ruma::{
        device_id, room_id, user_id, DeviceId, OwnedDeviceId, OwnedEventId, OwnedRoomId,
        OwnedUserId, RoomId, TransactionId, UserId,
    };
    use serde_json::{json, Value};
    use tempfile::TempDir;

    use super::CryptoMachine;
    use crate::{
        error::MegolmError,
        olm::{Account, EncryptionSettings, OutboundGroupSession},
        transport::{
            CredentialStore, DeviceLists, KeysClaimResponse, KeysQueryResponse,
            KeysUploadResponse, RoomUpdate, SyncResponse, TransportClient, TransportError,
        },
        types::{DeviceKeys, RoomEncryptionContent, SignedOneTimeKey},
    };

    #[derive(Default)]
    struct MemoryCredentialStore {
        entries: HashMap<String, Vec<u8>>,
    }

    impl CredentialStore for MemoryCredentialStore {
        fn read(&self, key: &str) -> Result<Option<Vec<u8>>, std::io::Error> {
            Ok(self.entries.get(key).cloned())
        }

        fn write(&mut self, key: &str, value: &[u8]) -> Result<(), std::io::Error> {
            self.entries.insert(key.to_owned(), value.to_vec());
            Ok(())
        }

        fn delete(&mut self, key: &str) -> Result<(), std::io::Error> {
            self.entries.remove(key);
            Ok(())
        }
    }

    type ToDeviceBatch = (String, BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>);

    #[derive(Default)]
    struct MockTransport {
        uploads: Mutex<Vec<(Option<DeviceKeys>, BTreeMap<String, SignedOneTimeKey>)>>,
        query_responses: Mutex<Vec<KeysQueryResponse>>,
        claim_responses: Mutex<Vec<KeysClaimResponse>>,
        to_device: Mutex<Vec<ToDeviceBatch>>,
        room_messages: Mutex<Vec<(OwnedRoomId, Value)>>,
        event_counter: AtomicU64,
    }

    impl MockTransport {
        fn queue_query_response(&self, response: KeysQueryResponse) {
            self.query_responses.lock().unwrap().push(response);
        }

        fn queue_claim_response(&self, response: KeysClaimResponse) {
            self.claim_responses.lock().unwrap().push(response);
        }

        fn to_device_batches(&self) -> Vec<ToDeviceBatch> {
            self.to_device.lock().unwrap().clone()
        }

        fn take_to_device_batches(&self) -> Vec<ToDeviceBatch> {
            std::mem::take(&mut self.to_device.lock().unwrap())
        }
    }

    #[async_trait]
    impl TransportClient for MockTransport {
        async fn sync(
            &self,
            _since: Option<&str>,
            _filter: Option<&str>,
            _timeout: Duration,
        ) -> Result<SyncResponse, TransportError> {
            Err(TransportError::Network("the tests drive the machine directly".to_owned()))
        }

        async fn upload_keys(
            &self,
            device_keys: Option<DeviceKeys>,
            one_time_keys: BTreeMap<String, SignedOneTimeKey>,
        ) -> Result<KeysUploadResponse, TransportError> {
            let count = one_time_keys.len() as u64;
            self.uploads.lock().unwrap().push((device_keys, one_time_keys));

            Ok(KeysUploadResponse {
                one_time_key_counts: BTreeMap::from([("signed_curve25519".to_owned(), count)]),
            })
        }

        async fn query_keys(
            &self,
            _users: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
        ) -> Result<KeysQueryResponse, TransportError> {
            let mut responses = self.query_responses.lock().unwrap();

            if responses.is_empty() {
                Ok(KeysQueryResponse::default())
            } else {
                Ok(responses.remove(0))
            }
        }

        async fn claim_keys(
            &self,
            _devices: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>,
        ) -> Result<KeysClaimResponse, TransportError> {
            let mut responses = self.claim_responses.lock().unwrap();

            if responses.is_empty() {
                Ok(KeysClaimResponse::default())
            } else {
                Ok(responses.remove(0))
            }
        }

        async fn send_to_device(
            &self,
            event_type: &str,
            _txn_id: &TransactionId,
            messages: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
        ) -> Result<(), TransportError> {
            self.to_device.lock().unwrap().push((event_type.to_owned(), messages));
            Ok(())
        }

        async fn send_message(
            &self,
            room_id: &RoomId,
            _event_type: &str,
            _txn_id: &TransactionId,
            content: Value,
        ) -> Result<OwnedEventId, TransportError> {
            self.room_messages.lock().unwrap().push((room_id.to_owned(), content));

            let counter = self.event_counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("$event{counter}:example.org").try_into().expect("a valid event id"))
        }
    }

    async fn machine(
        dir: &TempDir,
        user_id: &UserId,
        device_id: &DeviceId,
        transport: Arc<MockTransport>,
    ) -> CryptoMachine {
        let mut credentials = MemoryCredentialStore::default();

        CryptoMachine::open(user_id, device_id, dir.path(), transport, &mut credentials)
            .await
            .unwrap()
    }

    fn empty_sync() -> SyncResponse {
        SyncResponse { next_batch: "batch".to_owned(), ..Default::default() }
    }

    fn encrypted_room_update(room_id: &RoomId, members: Vec<OwnedUserId>) -> RoomUpdate {
        RoomUpdate {
            room_id: room_id.to_owned(),
            encryption: Some(RoomEncryptionContent {
                algorithm: "m.megolm.v1.aes-sha2".to_owned(),
                rotation_period_ms: Some(604_800_000),
                rotation_period_msgs: Some(100),
            }),
            joined_members: members,
        }
    }

    fn query_response_for(accounts: &[&Account]) -> KeysQueryResponse {
        let mut device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>> =
            BTreeMap::new();

        for account in accounts {
            device_keys
                .entry(account.user_id().to_owned())
                .or_default()
                .insert(account.device_id().clone(), account.device_keys());
        }

        KeysQueryResponse { device_keys }
    }

    fn claim_response_for(accounts: &mut [&mut Account]) -> KeysClaimResponse {
        let mut one_time_keys: BTreeMap<
            OwnedUserId,
            BTreeMap<OwnedDeviceId, BTreeMap<String, SignedOneTimeKey>>,
        > = BTreeMap::new();

        for account in accounts {
            account.generate_one_time_keys(1);
            let signed = account.signed_one_time_keys();
            account.mark_keys_as_published();

            one_time_keys
                .entry(account.user_id().to_owned())
                .or_default()
                .insert(account.device_id().clone(), signed);
        }

        KeysClaimResponse { one_time_keys }
    }

    #[tokio::test]
    async fn fresh_account_uploads_device_and_one_time_keys() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::default());
        let mut alice = machine(
            &dir,
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            transport.clone(),
        )
        .await;

        alice.receive_sync_response(empty_sync()).await.unwrap();

        let uploads = transport.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);

        let (device_keys, one_time_keys) = &uploads[0];
        let device_keys = device_keys.as_ref().expect("the first upload carries device keys");
        device_keys.verify_self_signature().unwrap();

        let max = alice.account.max_one_time_keys() as u64;
        assert_eq!(one_time_keys.len() as u64, max / 2);
        assert!(alice.account.shared());
    }

    #[tokio::test]
    async fn replenishment_is_skipped_above_the_threshold() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::default());
        let mut alice = machine(
            &dir,
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            transport.clone(),
        )
        .await;

        let max = alice.account.max_one_time_keys() as u64;

        let mut response = empty_sync();
        response
            .device_one_time_keys_count
            .insert("signed_curve25519".to_owned(), max / 2);

        alice.receive_sync_response(response).await.unwrap();

        assert!(transport.uploads.lock().unwrap().is_empty());
    }

    /// A room key arrives from a device we have never seen: the event is
    /// buffered, the sender queried, and after the query the buffered event
    /// decrypts into a usable inbound group session.
    #[tokio::test]
    async fn unknown_sender_is_buffered_then_decrypted() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::default());
        let room_id = room_id!("!room:example.org");

        let mut alice = machine(
            &dir,
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            transport.clone(),
        )
        .await;

        // Let alice publish her one-time keys first.
        alice.receive_sync_response(empty_sync()).await.unwrap();

        let uploads = transport.uploads.lock().unwrap();
        let alice_one_time_key =
            uploads[0].1.values().next().expect("alice uploaded one-time keys").key.clone();
        drop(uploads);

        // Bob builds an outbound Olm session to alice and wraps a room key
        // in it.
        let mut bob = Account::new(user_id!("@bob:example.org"), "BOBDEVICE");
        let mut bob_session = bob
            .create_outbound_session(
                &alice.account.curve25519_key().to_base64(),
                &alice_one_time_key,
            )
            .unwrap();

        let mut bob_group_session =
            OutboundGroupSession::new(room_id, EncryptionSettings::default());

        let payload = json!({
            "sender": bob.user_id(),
            "sender_device": bob.device_id(),
            "keys": { "ed25519": bob.ed25519_key().to_base64() },
            "recipient": alice.user_id(),
            "recipient_keys": { "ed25519": alice.account.ed25519_key().to_base64() },
            "type": "m.room_key",
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "room_id": room_id,
                "session_id": bob_group_session.session_id(),
                "session_key": bob_group_session.session_key().to_base64(),
            },
        });

        let message = bob_session.encrypt(&payload.to_string());

        let event = json!({
            "type": "m.room.encrypted",
            "sender": bob.user_id(),
            "content": {
                "algorithm": "m.olm.v1.curve25519-aes-sha2",
                "sender_key": bob.curve25519_key().to_base64(),
                "ciphertext": {
                    (alice.account.curve25519_key().to_base64()): message,
                },
            },
        });

        // The query triggered by the buffered event will find bob.
        transport.queue_query_response(query_response_for(&[&bob]));

        let mut response = empty_sync();
        response.to_device_events.push(event);
        response.rooms.push(encrypted_room_update(
            room_id,
            vec![alice.user_id().to_owned(), bob.user_id().to_owned()],
        ));
        response.device_lists = DeviceLists::default();

        alice.receive_sync_response(response).await.unwrap();

        // The buffered event was decrypted: an Olm session and the group
        // session now exist.
        let bob_curve = bob.curve25519_key().to_base64();
        assert_eq!(alice.olm_sessions[&bob_curve].len(), 1);
        assert!(alice.inbound_sessions[room_id].contains_key(bob_group_session.session_id()));

        // A room message from bob now decrypts.
        let megolm_message = bob_group_session
            .encrypt(&json!({
                "room_id": room_id,
                "type": "m.room.message",
                "content": { "msgtype": "m.text", "body": "hi alice" },
            })
            .to_string())
            .to_base64();

        let room_event = json!({
            "type": "m.room.encrypted",
            "sender": bob.user_id(),
            "event_id": "$bob1:example.org",
            "origin_server_ts": 1_700_000_000_000u64,
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "sender_key": bob_curve,
                "device_id": "BOBDEVICE",
                "session_id": bob_group_session.session_id(),
                "ciphertext": megolm_message,
            },
        });

        let decrypted = alice.decrypt_room_event(room_id, &room_event).unwrap();
        assert_eq!(decrypted["content"]["body"], "hi alice");
        assert_eq!(decrypted["sender"], "@bob:example.org");
    }

    /// A second pre-key message from the same sender reuses the session the
    /// first one created instead of consuming another one-time key.
    #[tokio::test]
    async fn second_prekey_message_reuses_the_session() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::default());

        let mut alice = machine(
            &dir,
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            transport.clone(),
        )
        .await;

        alice.receive_sync_response(empty_sync()).await.unwrap();

        let uploads = transport.uploads.lock().unwrap();
        let alice_one_time_key = uploads[0].1.values().next().unwrap().key.clone();
        drop(uploads);

        let mut bob = Account::new(user_id!("@bob:example.org"), "BOBDEVICE");
        let mut bob_session = bob
            .create_outbound_session(
                &alice.account.curve25519_key().to_base64(),
                &alice_one_time_key,
            )
            .unwrap();

        // Alice learns about bob before the messages arrive.
        transport.queue_query_response(query_response_for(&[&bob]));
        let mut response = empty_sync();
        response.device_lists =
            DeviceLists { changed: vec![bob.user_id().to_owned()], left: vec![] };
        alice.tracker.track_users([bob.user_id()]);
        alice.receive_sync_response(response).await.unwrap();

        let event_for = |bob: &Account, bob_session: &mut crate::olm::Session, body: &str| {
            let payload = json!({
                "sender": bob.user_id(),
                "sender_device": bob.device_id(),
                "keys": { "ed25519": bob.ed25519_key().to_base64() },
                "recipient": "@alice:example.org",
                "recipient_keys": { "ed25519": alice.account.ed25519_key().to_base64() },
                "type": "m.dummy",
                "content": { "body": body },
            });

            json!({
                "type": "m.room.encrypted",
                "sender": bob.user_id(),
                "content": {
                    "algorithm": "m.olm.v1.curve25519-aes-sha2",
                    "sender_key": bob.curve25519_key().to_base64(),
                    "ciphertext": {
                        (alice.account.curve25519_key().to_base64()):
                            bob_session.encrypt(&payload.to_string()),
                    },
                },
            })
        };

        let first = event_for(&bob, &mut bob_session, "first");
        let second = event_for(&bob, &mut bob_session, "second");

        let mut response = empty_sync();
        response.to_device_events.push(first);
        response.to_device_events.push(second);
        alice.receive_sync_response(response).await.unwrap();

        // Both pre-key messages were handled by one inbound session.
        let bob_curve = bob.curve25519_key().to_base64();
        assert_eq!(alice.olm_sessions[&bob_curve].len(), 1);
        assert_eq!(
            alice.olm_sessions[&bob_curve][0].session_id(),
            bob_session.session_id()
        );
    }

    /// Megolm distribution: the first message ships the session to every
    /// room device exactly once, later messages ship nothing, and hitting
    /// the rotation limit produces a fresh session that is shipped again.
    #[tokio::test]
    async fn megolm_distribution_and_rotation() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::default());
        let room_id = room_id!("!room:example.org");

        let mut alice = machine(
            &dir,
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            transport.clone(),
        )
        .await;

        let mut bob = Account::new(user_id!("@bob:example.org"), "BOBDEVICE");
        let mut carol = Account::new(user_id!("@carol:example.org"), "CAROLDEVICE");

        transport.queue_query_response(query_response_for(&[&bob, &carol]));
        transport.queue_claim_response(claim_response_for(&mut [&mut bob, &mut carol]));

        let mut response = empty_sync();
        response.rooms.push(encrypted_room_update(
            room_id,
            vec![
                alice.user_id().to_owned(),
                bob.user_id().to_owned(),
                carol.user_id().to_owned(),
            ],
        ));
        alice.receive_sync_response(response).await.unwrap();

        // M1: one to-device batch with exactly one envelope per device.
        let event_id = alice
            .send_room_message(room_id, "m.room.message", json!({ "body": "m1" }))
            .await
            .unwrap();

        let batches = transport.take_to_device_batches();
        assert_eq!(batches.len(), 1);
        let (event_type, messages) = &batches[0];
        assert_eq!(event_type, "m.room.encrypted");
        assert_eq!(messages.len(), 2);
        assert!(messages[bob.user_id()].contains_key(bob.device_id()));
        assert!(messages[carol.user_id()].contains_key(carol.device_id()));

        let first_session_id =
            alice.outbound_sessions[room_id].session_id().to_owned();

        // Our own message decrypts through the self-generated inbound half.
        let sent = transport.room_messages.lock().unwrap().last().unwrap().clone();
        let own_event = json!({
            "type": "m.room.encrypted",
            "sender": alice.user_id(),
            "event_id": event_id,
            "origin_server_ts": 1_700_000_000_000u64,
            "content": sent.1,
        });
        let decrypted = alice.decrypt_room_event(room_id, &own_event).unwrap();
        assert_eq!(decrypted["content"]["body"], "m1");

        // Replaying the same index under a different event id is rejected.
        let mut replayed = own_event.clone();
        replayed["event_id"] = Value::from("$forged:example.org");
        assert_matches!(
            alice.decrypt_room_event(room_id, &replayed),
            Err(MegolmError::ReplayedIndex { .. })
        );

        // M2: the session is already everywhere, nothing to ship.
        alice
            .send_room_message(room_id, "m.room.message", json!({ "body": "m2" }))
            .await
            .unwrap();
        assert!(transport.to_device_batches().is_empty());

        // Drive the session to its 100 message rotation limit.
        for i in 2..100 {
            alice
                .send_room_message(room_id, "m.room.message", json!({ "body": format!("m{i}") }))
                .await
                .unwrap();
        }
        assert!(transport.to_device_batches().is_empty());

        // M101 rotates: fresh session id and a fresh distribution round.
        transport.queue_claim_response(KeysClaimResponse::default());
        alice
            .send_room_message(room_id, "m.room.message", json!({ "body": "m101" }))
            .await
            .unwrap();

        let batches = transport.take_to_device_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 2);

        let second_session_id = alice.outbound_sessions[room_id].session_id().to_owned();
        assert_ne!(first_session_id, second_session_id);
    }

    #[tokio::test]
    async fn verification_request_goes_out_as_plaintext_to_device() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::default());

        let mut alice = machine(
            &dir,
            user_id!("@alice:example.org"),
            device_id!("ALICEDEVICE"),
            transport.clone(),
        )
        .await;

        let transaction_id = alice
            .request_verification(user_id!("@bob:example.org"), "BOBDEVICE")
            .await
            .unwrap();

        let batches = transport.to_device_batches();
        assert_eq!(batches.len(), 1);

        let (event_type, messages) = &batches[0];
        assert_eq!(event_type, "m.key.verification.request");

        let content = &messages[user_id!("@bob:example.org")]
            [&OwnedDeviceId::from("BOBDEVICE")];
        assert_eq!(content["transaction_id"], Value::from(transaction_id));
        assert_eq!(content["methods"], json!(["m.sas.v1"]));
    }
}
