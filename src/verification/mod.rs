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

//! Interactive device verification over short authentication strings.

mod emoji;
mod sas;

use std::collections::BTreeMap;

use ruma::MilliSecondsSinceUnixEpoch;
use serde_json::Value;

pub use sas::{Sas, SasState, SAS_V1};

use crate::events::{
    AcceptContent, CancelContent, DoneContent, KeyContent, MacContent, ReadyContent,
    RequestContent, StartContent,
};

/// The defined reasons a verification can be cancelled for.
///
/// For an incoming cancel event this records what the remote side reported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelCode {
    Timeout,
    User,
    UnexpectedMessage,
    UnknownTransaction,
    UnknownMethod,
    KeyMismatch,
    UserMismatch,
    InvalidMessage,
    SessionAccepted,
    MismatchedCommitment,
    MismatchedSas,
}

impl CancelCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "m.timeout",
            Self::User => "m.user",
            Self::UnexpectedMessage => "m.unexpected_message",
            Self::UnknownTransaction => "m.unknown_transaction",
            Self::UnknownMethod => "m.unknown_method",
            Self::KeyMismatch => "m.key_mismatch",
            Self::UserMismatch => "m.user_mismatch",
            Self::InvalidMessage => "m.invalid_message",
            Self::SessionAccepted => "m.accepted",
            Self::MismatchedCommitment => "m.mismatched_commitment",
            Self::MismatchedSas => "m.mismatched_sas",
        }
    }

    /// The human readable reason sent along with the code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Timeout => "The verification process timed out",
            Self::User => "The user cancelled the verification",
            Self::UnexpectedMessage => "The device received an unexpected message",
            Self::UnknownTransaction => "The received message was part of an unknown transaction",
            Self::UnknownMethod => "The device does not know how to handle the requested method",
            Self::KeyMismatch => "The key was not verified",
            Self::UserMismatch => "The expected user did not match the user verified",
            Self::InvalidMessage => "The device received an invalid message",
            Self::SessionAccepted => "The request was accepted by a different device",
            Self::MismatchedCommitment => "The hash commitment did not match",
            Self::MismatchedSas => "The SAS did not match",
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "m.timeout" => Self::Timeout,
            "m.unexpected_message" | "m.unknown_message" => Self::UnexpectedMessage,
            "m.unknown_transaction" => Self::UnknownTransaction,
            "m.unknown_method" => Self::UnknownMethod,
            "m.key_mismatch" => Self::KeyMismatch,
            "m.user_mismatch" => Self::UserMismatch,
            "m.invalid_message" => Self::InvalidMessage,
            "m.accepted" => Self::SessionAccepted,
            "m.mismatched_commitment" => Self::MismatchedCommitment,
            "m.mismatched_sas" => Self::MismatchedSas,
            _ => Self::User,
        }
    }
}

impl std::fmt::Display for CancelCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An incoming verification event, already stripped of its envelope.
#[derive(Clone, Debug)]
pub enum VerificationEvent {
    Request(RequestContent),
    Ready(ReadyContent),
    Start(StartContent),
    Accept(AcceptContent),
    Key(KeyContent),
    Mac(MacContent),
    Done(DoneContent),
    Cancel(CancelContent),
}

impl VerificationEvent {
    pub fn transaction_id(&self) -> &str {
        match self {
            Self::Request(c) => &c.transaction_id,
            Self::Ready(c) => &c.transaction_id,
            Self::Start(c) => &c.transaction_id,
            Self::Accept(c) => &c.transaction_id,
            Self::Key(c) => &c.transaction_id,
            Self::Mac(c) => &c.transaction_id,
            Self::Done(c) => &c.transaction_id,
            Self::Cancel(c) => &c.transaction_id,
        }
    }
}

/// A verification message to be sent to the remote device.
#[derive(Clone, Debug)]
pub enum OutgoingVerification {
    Request(RequestContent),
    Ready(ReadyContent),
    Start(StartContent),
    Accept(AcceptContent),
    Key(KeyContent),
    Mac(MacContent),
    Done(DoneContent),
    Cancel(CancelContent),
}

impl OutgoingVerification {
    /// The Matrix event type this message travels as.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Request(_) => "m.key.verification.request",
            Self::Ready(_) => "m.key.verification.ready",
            Self::Start(_) => "m.key.verification.start",
            Self::Accept(_) => "m.key.verification.accept",
            Self::Key(_) => "m.key.verification.key",
            Self::Mac(_) => "m.key.verification.mac",
            Self::Done(_) => "m.key.verification.done",
            Self::Cancel(_) => "m.key.verification.cancel",
        }
    }

    pub fn content(&self) -> Value {
        let content = match self {
            Self::Request(c) => serde_json::to_value(c),
            Self::Ready(c) => serde_json::to_value(c),
            Self::Start(c) => serde_json::to_value(c),
            Self::Accept(c) => serde_json::to_value(c),
            Self::Key(c) => serde_json::to_value(c),
            Self::Mac(c) => serde_json::to_value(c),
            Self::Done(c) => serde_json::to_value(c),
            Self::Cancel(c) => serde_json::to_value(c),
        };

        content.expect("verification contents always serialize")
    }

    /// Reinterpret the outgoing message as an incoming event, as the remote
    /// device will see it.
    pub fn into_event(self) -> VerificationEvent {
        match self {
            Self::Request(c) => VerificationEvent::Request(c),
            Self::Ready(c) => VerificationEvent::Ready(c),
            Self::Start(c) => VerificationEvent::Start(c),
            Self::Accept(c) => VerificationEvent::Accept(c),
            Self::Key(c) => VerificationEvent::Key(c),
            Self::Mac(c) => VerificationEvent::Mac(c),
            Self::Done(c) => VerificationEvent::Done(c),
            Self::Cancel(c) => VerificationEvent::Cancel(c),
        }
    }
}

/// The active verification sessions, addressed by transaction id.
#[derive(Debug, Default)]
pub struct Verifications {
    sessions: BTreeMap<String, Sas>,
}

impl Verifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sas: Sas) {
        self.sessions.insert(sas.transaction_id().to_owned(), sas);
    }

    pub fn get(&self, transaction_id: &str) -> Option<&Sas> {
        self.sessions.get(transaction_id)
    }

    pub fn get_mut(&mut self, transaction_id: &str) -> Option<&mut Sas> {
        self.sessions.get_mut(transaction_id)
    }

    /// Cancel the sessions that ran into their deadline and drop finished
    /// ones.
    ///
    /// Returns the cancel messages that still have to reach the remote
    /// devices.
    pub fn garbage_collect(
        &mut self,
        now: MilliSecondsSinceUnixEpoch,
    ) -> Vec<(Sas, OutgoingVerification)> {
        let timed_out: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, sas)| sas.timed_out(now))
            .map(|(txn, _)| txn.clone())
            .collect();

        let mut cancels = Vec::new();

        for txn in timed_out {
            if let Some(mut sas) = self.sessions.remove(&txn) {
                let cancel = sas.cancel(CancelCode::Timeout);
                cancels.push((sas, cancel));
            }
        }

        self.sessions.retain(|_, sas| !sas.is_done() && !sas.is_cancelled());

        cancels
    }
}
