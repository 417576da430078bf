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

//! The interactive short-authentication-string verification, modelled as a
//! state machine that maps `(state, event)` to `(state, outgoing messages)`.
//! Timers live outside; the machine only knows its deadline.

use ruma::{MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedUserId, TransactionId, UInt};
use sha2::{Digest, Sha256};
use tracing::warn;
use vodozemac::{sas::EstablishedSas, Curve25519PublicKey};

use super::{emoji::emoji_from_index, CancelCode, OutgoingVerification, VerificationEvent};
use crate::{
    events::{
        AcceptContent, CancelContent, DoneContent, KeyContent, MacContent, ReadyContent,
        RequestContent, StartContent,
    },
    utilities::{canonical_json, encode},
};

/// The only verification method this implementation negotiates.
pub const SAS_V1: &str = "m.sas.v1";

const KEY_AGREEMENT_PROTOCOL: &str = "curve25519-hkdf-sha256";
const HASH: &str = "sha256";
const MESSAGE_AUTHENTICATION_CODE: &str = "hkdf-hmac-sha256.v2";
const SHORT_AUTHENTICATION_STRINGS: &[&str] = &["decimal", "emoji"];

/// How long a verification stays alive, measured from the request.
const REQUEST_TIMEOUT_MS: u64 = 600_000;
/// How long an incoming verification stays alive, measured from receipt.
const RECEIPT_TIMEOUT_MS: u64 = 120_000;
/// Sessions that would expire this quickly are not started at all.
const MINIMAL_TIMEOUT_MS: u64 = 5_000;

fn add_ms(ts: MilliSecondsSinceUnixEpoch, ms: u64) -> MilliSecondsSinceUnixEpoch {
    let sum = u64::from(ts.get()).saturating_add(ms);
    MilliSecondsSinceUnixEpoch(UInt::try_from(sum).unwrap_or(UInt::MAX))
}

/// The states of a verification session. `Canceled` and `Done` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SasState {
    /// A request from the remote device is waiting for the user to accept.
    Incoming,
    /// Our request is out, waiting for the remote `ready`.
    WaitingForReady,
    /// Methods are agreed on, nobody has started yet.
    Ready,
    /// Our `start` is out.
    WaitingForAccept,
    /// We accepted the remote `start`.
    Accepted,
    /// Our key is out, waiting for the remote key.
    WaitingForKey,
    /// Both keys are in, waiting for the user to compare the emoji.
    WaitingForVerification,
    /// The user confirmed, waiting for the remote MAC.
    WaitingForMac,
    Canceled,
    Done,
}

impl SasState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Done)
    }
}

/// One interactive verification flow with one remote device.
pub struct Sas {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    our_ed25519_key: String,
    remote_user_id: OwnedUserId,
    remote_device_id: OwnedDeviceId,
    remote_ed25519_key: Option<String>,
    transaction_id: String,
    encrypted_transport: bool,
    state: SasState,
    cancel_code: Option<CancelCode>,
    inner: Option<vodozemac::sas::Sas>,
    established: Option<EstablishedSas>,
    our_public_key: String,
    remote_methods: Vec<String>,
    commitment: Option<String>,
    start_event_canonical: Option<String>,
    start_sent_by_us: bool,
    emojis: Vec<(&'static str, &'static str)>,
    decimals: Option<(u16, u16, u16)>,
    pending_ed_key_id: Option<String>,
    mac_received: bool,
    local_verified: bool,
    newly_verified_key: Option<String>,
    expires_at: MilliSecondsSinceUnixEpoch,
}

impl Sas {
    #[allow(clippy::too_many_arguments)]
    fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        our_ed25519_key: String,
        remote_user_id: OwnedUserId,
        remote_device_id: OwnedDeviceId,
        remote_ed25519_key: Option<String>,
        transaction_id: String,
        encrypted_transport: bool,
        state: SasState,
        expires_at: MilliSecondsSinceUnixEpoch,
    ) -> Self {
        let inner = vodozemac::sas::Sas::new();
        let our_public_key = inner.public_key().to_base64();

        Self {
            user_id,
            device_id,
            our_ed25519_key,
            remote_user_id,
            remote_device_id,
            remote_ed25519_key,
            transaction_id,
            encrypted_transport,
            state,
            cancel_code: None,
            inner: Some(inner),
            established: None,
            our_public_key,
            remote_methods: Vec::new(),
            commitment: None,
            start_event_canonical: None,
            start_sent_by_us: false,
            emojis: Vec::new(),
            decimals: None,
            pending_ed_key_id: None,
            mac_received: false,
            local_verified: false,
            newly_verified_key: None,
            expires_at,
        }
    }

    /// Start an outgoing verification towards the given device.
    ///
    /// Returns the session and the request to send.
    pub fn start_request(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        our_ed25519_key: String,
        remote_user_id: OwnedUserId,
        remote_device_id: OwnedDeviceId,
        remote_ed25519_key: Option<String>,
        now: MilliSecondsSinceUnixEpoch,
    ) -> (Self, OutgoingVerification) {
        let transaction_id = TransactionId::new().to_string();

        let sas = Self::new(
            user_id,
            device_id.clone(),
            our_ed25519_key,
            remote_user_id,
            remote_device_id,
            remote_ed25519_key,
            transaction_id.clone(),
            false,
            SasState::WaitingForReady,
            add_ms(now, REQUEST_TIMEOUT_MS),
        );

        let request = OutgoingVerification::Request(RequestContent {
            from_device: device_id,
            transaction_id,
            methods: vec![SAS_V1.to_owned()],
            timestamp: Some(now),
        });

        (sas, request)
    }

    /// Create a session for an incoming verification request.
    ///
    /// The session expires at the earlier of ten minutes after the request
    /// timestamp and two minutes from now; requests that would expire almost
    /// immediately are not worth starting and yield `None`.
    #[allow(clippy::too_many_arguments)]
    pub fn from_request(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        our_ed25519_key: String,
        sender: OwnedUserId,
        content: &RequestContent,
        remote_ed25519_key: Option<String>,
        encrypted_transport: bool,
        now: MilliSecondsSinceUnixEpoch,
    ) -> Option<Self> {
        let request_ts = content.timestamp.unwrap_or(now);
        let expires_at = std::cmp::min(
            add_ms(request_ts, REQUEST_TIMEOUT_MS),
            add_ms(now, RECEIPT_TIMEOUT_MS),
        );

        if expires_at <= add_ms(now, MINIMAL_TIMEOUT_MS) {
            return None;
        }

        let mut sas = Self::new(
            user_id,
            device_id,
            our_ed25519_key,
            sender,
            content.from_device.clone(),
            remote_ed25519_key,
            content.transaction_id.clone(),
            encrypted_transport,
            SasState::Incoming,
            expires_at,
        );
        sas.remote_methods = content.methods.clone();

        Some(sas)
    }

    pub fn state(&self) -> SasState {
        self.state
    }

    pub fn cancel_code(&self) -> Option<&CancelCode> {
        self.cancel_code.as_ref()
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn remote_user_id(&self) -> &OwnedUserId {
        &self.remote_user_id
    }

    pub fn remote_device_id(&self) -> &OwnedDeviceId {
        &self.remote_device_id
    }

    pub fn encrypted_transport(&self) -> bool {
        self.encrypted_transport
    }

    pub fn is_done(&self) -> bool {
        self.state == SasState::Done
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == SasState::Canceled
    }

    /// The seven emoji the user compares, available once both keys are in.
    pub fn emoji(&self) -> &[(&'static str, &'static str)] {
        &self.emojis
    }

    /// The decimal form of the short authentication string.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        self.decimals
    }

    /// Provide the remote device's Ed25519 key once the tracker knows it.
    pub fn set_remote_ed25519_key(&mut self, key: String) {
        self.remote_ed25519_key = Some(key);
    }

    /// The key id that passed MAC validation, to be marked verified.
    pub fn take_newly_verified_key(&mut self) -> Option<String> {
        self.newly_verified_key.take()
    }

    pub fn timed_out(&self, now: MilliSecondsSinceUnixEpoch) -> bool {
        !self.state.is_terminal() && now >= self.expires_at
    }

    /// Cancel the session with the given code and produce the cancel event
    /// for the remote side.
    pub fn cancel(&mut self, code: CancelCode) -> OutgoingVerification {
        self.state = SasState::Canceled;

        let content = CancelContent {
            transaction_id: self.transaction_id.clone(),
            code: code.as_str().to_owned(),
            reason: code.reason().to_owned(),
        };

        self.cancel_code = Some(code);
        OutgoingVerification::Cancel(content)
    }

    /// The user accepted the incoming request.
    pub fn accept_request(&mut self) -> Vec<OutgoingVerification> {
        if self.state != SasState::Incoming {
            return vec![self.cancel(CancelCode::UnexpectedMessage)];
        }

        let methods = self.common_methods();

        if methods.is_empty() {
            return vec![self.cancel(CancelCode::UnknownMethod)];
        }

        let mut outgoing = vec![OutgoingVerification::Ready(ReadyContent {
            from_device: self.device_id.clone(),
            transaction_id: self.transaction_id.clone(),
            methods: methods.clone(),
        })];
        self.state = SasState::Ready;

        if methods.len() == 1 {
            outgoing.push(self.send_start());
        }

        outgoing
    }

    /// Feed a verification event into the state machine.
    pub fn receive(
        &mut self,
        event: &VerificationEvent,
        now: MilliSecondsSinceUnixEpoch,
    ) -> Vec<OutgoingVerification> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        if self.timed_out(now) {
            return vec![self.cancel(CancelCode::Timeout)];
        }

        match event {
            VerificationEvent::Cancel(content) => {
                warn!(
                    transaction_id = %self.transaction_id,
                    code = %content.code,
                    "The remote device cancelled the verification"
                );
                self.cancel_code = Some(CancelCode::from_code(&content.code));
                self.state = SasState::Canceled;
                Vec::new()
            }
            VerificationEvent::Ready(content) => match self.state {
                SasState::WaitingForReady => self.handle_ready(content),
                // Ready and start can arrive in the same sync, in which case
                // start may already have moved us on.
                SasState::Ready | SasState::WaitingForAccept | SasState::Accepted => Vec::new(),
                _ => vec![self.cancel(CancelCode::UnexpectedMessage)],
            },
            VerificationEvent::Start(content) => match self.state {
                SasState::WaitingForReady | SasState::Ready | SasState::WaitingForAccept => {
                    self.handle_start(content)
                }
                _ => vec![self.cancel(CancelCode::UnexpectedMessage)],
            },
            VerificationEvent::Accept(content) => {
                if self.state != SasState::WaitingForAccept {
                    return vec![self.cancel(CancelCode::UnexpectedMessage)];
                }

                self.commitment = Some(content.commitment.clone());
                self.state = SasState::WaitingForKey;
                vec![self.send_key()]
            }
            VerificationEvent::Key(content) => match self.state {
                SasState::Accepted | SasState::WaitingForKey => self.handle_key(content),
                _ => vec![self.cancel(CancelCode::UnexpectedMessage)],
            },
            VerificationEvent::Mac(content) => match self.state {
                SasState::WaitingForMac | SasState::WaitingForVerification => {
                    self.handle_mac(content)
                }
                _ => vec![self.cancel(CancelCode::UnexpectedMessage)],
            },
            VerificationEvent::Done(_) => {
                if self.state == SasState::Done {
                    Vec::new()
                } else {
                    vec![self.cancel(CancelCode::UnexpectedMessage)]
                }
            }
            VerificationEvent::Request(_) => vec![self.cancel(CancelCode::UnexpectedMessage)],
        }
    }

    /// The user confirmed that the emoji match.
    pub fn confirm(&mut self) -> Vec<OutgoingVerification> {
        if self.state != SasState::WaitingForVerification {
            return Vec::new();
        }

        let mut outgoing = vec![self.send_mac()];

        self.state = if self.mac_received { SasState::Done } else { SasState::WaitingForMac };
        self.local_verified = true;

        if self.pending_ed_key_id.is_some() {
            outgoing.extend(self.trust_keys());
        }

        outgoing
    }

    fn common_methods(&self) -> Vec<String> {
        self.remote_methods.iter().filter(|m| m.as_str() == SAS_V1).cloned().collect()
    }

    fn handle_ready(&mut self, content: &ReadyContent) -> Vec<OutgoingVerification> {
        self.remote_methods = content.methods.clone();
        let methods = self.common_methods();

        if methods.is_empty() {
            return vec![self.cancel(CancelCode::UnknownMethod)];
        }

        self.state = SasState::Ready;

        if methods.len() == 1 {
            vec![self.send_start()]
        } else {
            Vec::new()
        }
    }

    fn send_start(&mut self) -> OutgoingVerification {
        self.start_sent_by_us = true;

        let content = StartContent {
            from_device: self.device_id.clone(),
            transaction_id: self.transaction_id.clone(),
            method: SAS_V1.to_owned(),
            key_agreement_protocols: vec![KEY_AGREEMENT_PROTOCOL.to_owned()],
            hashes: vec![HASH.to_owned()],
            message_authentication_codes: vec![MESSAGE_AUTHENTICATION_CODE.to_owned()],
            short_authentication_string: SHORT_AUTHENTICATION_STRINGS
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            other: Default::default(),
        };

        self.start_event_canonical = canonical_start_event(&content);
        self.state = SasState::WaitingForAccept;

        OutgoingVerification::Start(content)
    }

    fn handle_start(&mut self, content: &StartContent) -> Vec<OutgoingVerification> {
        if content.method != SAS_V1 {
            return vec![self.cancel(CancelCode::UnknownMethod)];
        }

        if self.start_sent_by_us {
            // Both sides started; the party with the smaller (user, device)
            // keeps its start.
            if (self.remote_user_id.as_str(), self.remote_device_id.as_str())
                > (self.user_id.as_str(), self.device_id.as_str())
            {
                return Vec::new();
            }

            self.start_sent_by_us = false;
        }

        let Some(canonical) = canonical_start_event(content) else {
            return vec![self.cancel(CancelCode::InvalidMessage)];
        };

        let commitment = commitment_hash(&self.our_public_key, &canonical);
        self.start_event_canonical = Some(canonical);
        self.state = SasState::Accepted;

        vec![OutgoingVerification::Accept(AcceptContent {
            transaction_id: self.transaction_id.clone(),
            method: SAS_V1.to_owned(),
            commitment,
            key_agreement_protocol: KEY_AGREEMENT_PROTOCOL.to_owned(),
            hash: HASH.to_owned(),
            message_authentication_code: MESSAGE_AUTHENTICATION_CODE.to_owned(),
            short_authentication_string: SHORT_AUTHENTICATION_STRINGS
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            other: Default::default(),
        })]
    }

    fn send_key(&self) -> OutgoingVerification {
        OutgoingVerification::Key(KeyContent {
            transaction_id: self.transaction_id.clone(),
            key: self.our_public_key.clone(),
        })
    }

    fn handle_key(&mut self, content: &KeyContent) -> Vec<OutgoingVerification> {
        let mut outgoing = Vec::new();

        if self.start_sent_by_us {
            let canonical = self
                .start_event_canonical
                .as_deref()
                .expect("a sent start event always leaves its canonical form behind");

            if self.commitment.as_deref() != Some(&commitment_hash(&content.key, canonical)) {
                warn!(
                    transaction_id = %self.transaction_id,
                    "Commitment mismatch, aborting the verification"
                );
                return vec![self.cancel(CancelCode::MismatchedCommitment)];
            }
        } else {
            outgoing.push(self.send_key());
        }

        let Ok(their_key) = Curve25519PublicKey::from_base64(&content.key) else {
            return vec![self.cancel(CancelCode::InvalidMessage)];
        };

        let established = match self
            .inner
            .take()
            .expect("the SAS object is only consumed when a key event arrives")
            .diffie_hellman(their_key)
        {
            Ok(established) => established,
            Err(_) => return vec![self.cancel(CancelCode::InvalidMessage)],
        };

        let info = self.sas_info(&content.key);
        let bytes = established.bytes(&info);

        self.emojis =
            bytes.emoji_indices().iter().map(|index| emoji_from_index(*index)).collect();
        self.decimals = Some(bytes.decimals());
        self.established = Some(established);
        self.state = SasState::WaitingForVerification;

        outgoing
    }

    /// The info string for the SAS byte derivation. The party that sent the
    /// surviving `start` comes first.
    fn sas_info(&self, their_public_key: &str) -> String {
        let ours = format!("{}|{}|{}", self.user_id, self.device_id, self.our_public_key);
        let theirs =
            format!("{}|{}|{}", self.remote_user_id, self.remote_device_id, their_public_key);

        let (first, second) =
            if self.start_sent_by_us { (ours, theirs) } else { (theirs, ours) };

        format!("MATRIX_KEY_VERIFICATION_SAS|{first}|{second}|{}", self.transaction_id)
    }

    fn mac_info(&self, verifying: bool) -> String {
        let (first_user, first_device, second_user, second_device) = if verifying {
            (&self.remote_user_id, &self.remote_device_id, &self.user_id, &self.device_id)
        } else {
            (&self.user_id, &self.device_id, &self.remote_user_id, &self.remote_device_id)
        };

        format!(
            "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
             {second_user}{second_device}{}",
            self.transaction_id
        )
    }

    fn calculate_mac(&self, input: &str, verifying: bool, key_id: &str) -> String {
        let info = format!("{}{key_id}", self.mac_info(verifying));

        self.established
            .as_ref()
            .expect("MACs are only exchanged after the keys")
            .calculate_mac(input, &info)
            .to_base64()
    }

    fn send_mac(&mut self) -> OutgoingVerification {
        let key_id = format!("ed25519:{}", self.device_id);

        let keys = self.calculate_mac(&key_id, false, "");
        let mac = [(key_id.clone(), self.calculate_mac(&self.our_ed25519_key, false, &key_id))]
            .into_iter()
            .collect();

        OutgoingVerification::Mac(MacContent {
            transaction_id: self.transaction_id.clone(),
            mac,
            keys,
        })
    }

    fn handle_mac(&mut self, content: &MacContent) -> Vec<OutgoingVerification> {
        let mut key_ids: Vec<&str> = content.mac.keys().map(String::as_str).collect();
        key_ids.sort_unstable();
        let key_ids = key_ids.join(",");

        if self.calculate_mac(&key_ids, true, "") != content.keys {
            return vec![self.cancel(CancelCode::KeyMismatch)];
        }

        let ed_key_id = format!("ed25519:{}", self.remote_device_id);

        let Some(remote_ed_key) = self.remote_ed25519_key.clone() else {
            warn!(
                transaction_id = %self.transaction_id,
                "No Ed25519 key is tracked for the remote device, can't check its MAC"
            );
            return vec![self.cancel(CancelCode::KeyMismatch)];
        };

        if content.mac.get(&ed_key_id)
            != Some(&self.calculate_mac(&remote_ed_key, true, &ed_key_id))
        {
            return vec![self.cancel(CancelCode::KeyMismatch)];
        }

        self.pending_ed_key_id = Some(ed_key_id);

        if self.local_verified {
            self.trust_keys()
        } else {
            Vec::new()
        }
    }

    /// Both MAC and user confirmation are in; record the trust decision and
    /// wrap up.
    fn trust_keys(&mut self) -> Vec<OutgoingVerification> {
        self.newly_verified_key = self.pending_ed_key_id.clone();
        self.mac_received = true;

        if self.state == SasState::WaitingForMac {
            self.state = SasState::Done;
            vec![OutgoingVerification::Done(DoneContent {
                transaction_id: self.transaction_id.clone(),
            })]
        } else {
            Vec::new()
        }
    }
}

impl std::fmt::Debug for Sas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sas")
            .field("transaction_id", &self.transaction_id)
            .field("remote_user_id", &self.remote_user_id)
            .field("remote_device_id", &self.remote_device_id)
            .field("state", &self.state)
            .finish()
    }
}

fn canonical_start_event(content: &StartContent) -> Option<String> {
    let value = serde_json::to_value(content).ok()?;
    canonical_json(&value).ok()
}

/// `unpadded_base64(SHA256(public key ‖ canonical start event))`.
fn commitment_hash(public_key: &str, canonical_start_event: &str) -> String {
    let hash =
        Sha256::new().chain_update(public_key).chain_update(canonical_start_event).finalize();
    encode(hash)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id, MilliSecondsSinceUnixEpoch, UInt};

    use super::{Sas, SasState, SAS_V1};
    use crate::verification::{CancelCode, OutgoingVerification, VerificationEvent};

    fn now() -> MilliSecondsSinceUnixEpoch {
        MilliSecondsSinceUnixEpoch::now()
    }

    fn alice_and_bob() -> (Sas, Sas) {
        let (alice, request) = Sas::start_request(
            user_id!("@alice:example.org").to_owned(),
            device_id!("ALICEDEVICE").to_owned(),
            "alice-ed25519-key".to_owned(),
            user_id!("@bob:example.org").to_owned(),
            device_id!("BOBDEVICE").to_owned(),
            Some("bob-ed25519-key".to_owned()),
            now(),
        );

        let request_content = assert_matches!(request, OutgoingVerification::Request(c) => c);

        let bob = Sas::from_request(
            user_id!("@bob:example.org").to_owned(),
            device_id!("BOBDEVICE").to_owned(),
            "bob-ed25519-key".to_owned(),
            user_id!("@alice:example.org").to_owned(),
            &request_content,
            Some("alice-ed25519-key".to_owned()),
            false,
            now(),
        )
        .unwrap();

        (alice, bob)
    }

    fn deliver(
        messages: Vec<OutgoingVerification>,
        to: &mut Sas,
    ) -> Vec<OutgoingVerification> {
        let mut responses = Vec::new();

        for message in messages {
            responses.extend(to.receive(&message.clone().into_event(), now()));
        }

        responses
    }

    /// Run both sides to quiescence.
    fn pump(alice: &mut Sas, bob: &mut Sas, mut to_alice: Vec<OutgoingVerification>) {
        loop {
            let to_bob = deliver(to_alice, alice);
            if to_bob.is_empty() {
                break;
            }
            to_alice = deliver(to_bob, bob);
            if to_alice.is_empty() {
                break;
            }
        }
    }

    #[test]
    fn requests_that_would_expire_immediately_are_not_started() {
        let (_, request) = Sas::start_request(
            user_id!("@alice:example.org").to_owned(),
            device_id!("ALICEDEVICE").to_owned(),
            "alice-ed25519-key".to_owned(),
            user_id!("@bob:example.org").to_owned(),
            device_id!("BOBDEVICE").to_owned(),
            None,
            now(),
        );

        let mut content = assert_matches!(request, OutgoingVerification::Request(c) => c);
        // A request from the distant past has used up its ten minutes.
        content.timestamp = Some(MilliSecondsSinceUnixEpoch(UInt::from(1u32)));

        let result = Sas::from_request(
            user_id!("@bob:example.org").to_owned(),
            device_id!("BOBDEVICE").to_owned(),
            "bob-ed25519-key".to_owned(),
            user_id!("@alice:example.org").to_owned(),
            &content,
            None,
            false,
            now(),
        );

        assert!(result.is_none());
    }

    #[test]
    fn happy_path_verifies_both_sides() {
        let (mut alice, mut bob) = alice_and_bob();

        assert_eq!(alice.state(), SasState::WaitingForReady);
        assert_eq!(bob.state(), SasState::Incoming);

        let to_alice = bob.accept_request();
        pump(&mut alice, &mut bob, to_alice);

        assert_eq!(alice.state(), SasState::WaitingForVerification);
        assert_eq!(bob.state(), SasState::WaitingForVerification);

        assert_eq!(alice.emoji(), bob.emoji());
        assert_eq!(alice.emoji().len(), 7);
        assert_eq!(alice.decimals(), bob.decimals());

        let to_bob = alice.confirm();
        assert_eq!(alice.state(), SasState::WaitingForMac);

        let to_alice = deliver(to_bob, &mut bob);
        assert!(to_alice.is_empty());

        let to_alice = bob.confirm();
        assert_eq!(bob.state(), SasState::Done);

        let to_bob = deliver(to_alice, &mut alice);
        assert_eq!(alice.state(), SasState::Done);

        assert!(deliver(to_bob, &mut bob).is_empty());

        assert_eq!(alice.take_newly_verified_key().as_deref(), Some("ed25519:BOBDEVICE"));
        assert_eq!(bob.take_newly_verified_key().as_deref(), Some("ed25519:ALICEDEVICE"));
    }

    #[test]
    fn tampered_key_trips_the_commitment_check() {
        let (mut alice, mut bob) = alice_and_bob();

        // bob: ready + start; alice answers the ready with her own start and
        // wins the contest, so bob accepts hers.
        let to_alice = bob.accept_request();
        let to_bob = deliver(to_alice, &mut alice);
        let to_alice = deliver(to_bob, &mut bob);

        // bob's accept moves alice to WaitingForKey and makes her send her
        // key; bob answers with his own key.
        let to_bob = deliver(to_alice, &mut alice);
        assert_eq!(alice.state(), SasState::WaitingForKey);
        let mut to_alice = deliver(to_bob, &mut bob);

        // Tamper with bob's key on the wire.
        let key_content = assert_matches!(
            to_alice.pop(),
            Some(OutgoingVerification::Key(mut c)) => {
                c.key = "8v5ZYkzJZwYp61F5mLFnI8HUMe3sioY0Joh7fRBk0gY".to_owned();
                c
            }
        );

        let responses = alice.receive(&VerificationEvent::Key(key_content), now());

        assert_eq!(alice.state(), SasState::Canceled);
        assert_matches!(alice.cancel_code(), Some(CancelCode::MismatchedCommitment));

        // Bob learns about the cancellation.
        deliver(responses, &mut bob);
        assert_eq!(bob.state(), SasState::Canceled);
    }

    #[test]
    fn unknown_method_cancels() {
        let (mut alice, bob) = alice_and_bob();
        drop(bob);

        let ready = VerificationEvent::Ready(crate::events::ReadyContent {
            from_device: device_id!("BOBDEVICE").to_owned(),
            transaction_id: alice.transaction_id().to_owned(),
            methods: vec!["m.qr_code.show.v1".to_owned()],
        });

        let outgoing = alice.receive(&ready, now());

        assert_eq!(alice.state(), SasState::Canceled);
        assert_matches!(alice.cancel_code(), Some(CancelCode::UnknownMethod));
        assert_matches!(&outgoing[..], [OutgoingVerification::Cancel(c)] => {
            assert_eq!(c.code, "m.unknown_method");
        });
    }

    #[test]
    fn out_of_order_event_cancels() {
        let (mut alice, _bob) = alice_and_bob();

        let mac = VerificationEvent::Mac(crate::events::MacContent {
            transaction_id: alice.transaction_id().to_owned(),
            mac: Default::default(),
            keys: String::new(),
        });

        alice.receive(&mac, now());

        assert_eq!(alice.state(), SasState::Canceled);
        assert_matches!(alice.cancel_code(), Some(CancelCode::UnexpectedMessage));
    }

    #[test]
    fn timeout_cancels_with_the_right_code() {
        let (mut alice, _bob) = alice_and_bob();

        let far_future =
            MilliSecondsSinceUnixEpoch(now().get() + UInt::from(3_600_000u32));
        assert!(alice.timed_out(far_future));

        let outgoing = alice.cancel(CancelCode::Timeout);
        assert_matches!(outgoing, OutgoingVerification::Cancel(c) => {
            assert_eq!(c.code, "m.timeout");
        });
        assert_eq!(alice.state(), SasState::Canceled);
    }

    #[test]
    fn method_is_negotiated() {
        let (_, mut bob) = alice_and_bob();

        // Only one method in common: bob goes straight from ready to start.
        let outgoing = bob.accept_request();

        assert_eq!(outgoing.len(), 2);
        assert_matches!(&outgoing[0], OutgoingVerification::Ready(c) => {
            assert_eq!(c.methods, vec![SAS_V1.to_owned()]);
        });
        assert_matches!(&outgoing[1], OutgoingVerification::Start(c) => {
            assert_eq!(c.method, SAS_V1);
        });
        assert_eq!(bob.state(), SasState::WaitingForAccept);
    }
}
