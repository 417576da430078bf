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

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use thiserror::Error;

use crate::{secure_buffer::SecureBufferError, transport::TransportError};

pub type OlmResult<T> = Result<T, OlmError>;
pub type MegolmResult<T> = Result<T, MegolmError>;
pub type StoreResult<T> = Result<T, StoreError>;

/// Error for the low level cryptographic primitives.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("the cipher ran out of keystream before the end of the payload")]
    Aes,

    #[error("the key derivation produced the wrong number of bytes, {0} were requested")]
    WrongDerivedKeyLength(usize),

    #[error("the message authentication code doesn't match the expected one")]
    Hmac,

    #[error("the Ed25519 signature could not be verified: {0}")]
    Ed25519Verify(#[from] vodozemac::SignatureError),

    #[error("failed to decrypt the Curve25519 hybrid payload")]
    Curve25519Decrypt,

    #[error("the payload is too long for the cipher layer, {0} bytes were given")]
    PayloadTooLong(usize),

    #[error("one of the keys has an invalid format: {0}")]
    InvalidKey(#[from] vodozemac::KeyError),

    #[error("one of the inputs isn't valid base64")]
    InvalidBase64,

    #[error("the input isn't valid base58")]
    InvalidBase58,
}

/// Error when validating a signed JSON object, e.g. a device keys object or a
/// signed one-time key.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("the signed object isn't a JSON object")]
    NotAnObject,

    #[error("the signed object doesn't contain a signature for the given user and key id")]
    NoSignatureFound,

    #[error("the signed object can't be canonicalized: {0}")]
    CanonicalJson(#[from] ruma::CanonicalJsonError),

    #[error("the Ed25519 key or signature has an invalid format: {0}")]
    InvalidKey(#[from] vodozemac::KeyError),

    #[error("the signature didn't match the signed object: {0}")]
    Verification(#[from] vodozemac::SignatureError),
}

/// Error when ingesting a device record from a keys query response.
///
/// Every variant rejects the offending record; the previously stored record,
/// if any, stays untouched.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("the user id of the device keys doesn't match the user they were advertised for")]
    UserIdMismatch,

    #[error("the device {0} of user {1} advertises the unsupported algorithm {2}")]
    UnsupportedAlgorithm(OwnedDeviceId, OwnedUserId, String),

    #[error("the device keys object is missing the {0} key")]
    MissingKey(&'static str),

    #[error("the self-signature of the device keys doesn't verify: {0}")]
    SignatureMismatch(#[from] SignatureError),

    #[error("the Ed25519 key of the device {0} of user {1} changed")]
    DeviceReuse(OwnedDeviceId, OwnedUserId),
}

/// Error for the pairwise Olm machinery and to-device decryption.
#[derive(Debug, Error)]
pub enum OlmError {
    #[error("the to-device message uses an unsupported algorithm")]
    UnsupportedAlgorithm,

    #[error("the to-device message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    #[error("no Olm session could decrypt the message")]
    MissingSession,

    #[error("the event couldn't be decoded: {0}")]
    Decode(#[from] vodozemac::DecodeError),

    #[error("one of the keys has an invalid format: {0}")]
    InvalidKey(#[from] vodozemac::KeyError),

    #[error(transparent)]
    Decryption(#[from] vodozemac::olm::DecryptionError),

    #[error(transparent)]
    SessionCreation(#[from] vodozemac::olm::SessionCreationError),

    #[error("the stored pickle is corrupted: {0}")]
    CorruptedPickle(#[from] vodozemac::PickleError),

    #[error("the decrypted payload failed validation: {0}")]
    Event(#[from] EventError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Megolm(#[from] MegolmError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Error for group session handling and room message decryption.
#[derive(Debug, Error)]
pub enum MegolmError {
    #[error("the room message uses an unsupported algorithm")]
    UnsupportedAlgorithm,

    #[error("the room {0} doesn't have encryption enabled")]
    EncryptionNotEnabled(OwnedRoomId),

    #[error("no inbound group session is known for the message")]
    MissingRoomKey,

    #[error("a group session with the id {session_id} already exists in room {room_id}")]
    DuplicateSession { room_id: OwnedRoomId, session_id: String },

    #[error(
        "the megolm message index {index} was already used by event {known_event_id}, \
         refusing to decrypt a different event with it"
    )]
    ReplayedIndex { index: u32, known_event_id: String },

    #[error("the event sender {0} doesn't match the session owner {1}")]
    MismatchedSender(OwnedUserId, OwnedUserId),

    #[error(transparent)]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    #[error("the session key couldn't be decoded: {0}")]
    SessionKey(#[from] vodozemac::megolm::SessionKeyDecodeError),

    #[error("the message couldn't be decoded: {0}")]
    Decode(#[from] vodozemac::DecodeError),

    #[error("the stored pickle is corrupted: {0}")]
    CorruptedPickle(#[from] vodozemac::PickleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Error when the decrypted payload of an Olm message fails validation.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("the payload names the sender {0}, the event was sent by {1}")]
    MismatchedSender(OwnedUserId, OwnedUserId),

    #[error("the payload advertises an Ed25519 key that isn't the one we track for the sender")]
    MismatchedKeys,

    #[error("the payload is addressed to {0}, we are {1}")]
    MismatchedRecipient(OwnedUserId, OwnedUserId),

    #[error("the payload was encrypted for an Ed25519 key that isn't ours")]
    MismatchedRecipientKeys,

    #[error("the payload is missing the {0} field")]
    MissingField(&'static str),
}

/// Error for the on-disk store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("the migration to schema version {version} failed: {source}")]
    MigrationFailed { version: u32, source: rusqlite::Error },

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("a stored pickle is corrupted: {0}")]
    CorruptedPickle(#[from] vodozemac::PickleError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    SecureBuffer(#[from] SecureBufferError),
}
