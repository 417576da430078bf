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

//! The end-to-end encryption core of a Matrix client.
//!
//! This crate owns the cryptographic identity of one device and everything
//! that hangs off it: pairwise Olm sessions, Megolm group sessions for
//! rooms, the tracked set of peer devices and their trust state, the
//! encrypted on-disk store all of that is pickled into, and the interactive
//! SAS verification flow.
//!
//! The crate performs no I/O of its own apart from its store file; the
//! homeserver is reached through the [`TransportClient`] capability, OS
//! secrets through [`CredentialStore`]. The [`CryptoMachine`] is the single
//! entry point that ties the pieces together and is driven by sync
//! responses.

#![deny(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

pub mod ciphers;
mod error;
mod events;
mod identities;
mod machine;
pub mod olm;
mod secure_buffer;
pub mod store;
mod tracking;
mod transport;
mod types;
mod utilities;
pub mod verification;

pub use error::{
    CipherError, DeviceError, EventError, MegolmError, MegolmResult, OlmError, OlmResult,
    SignatureError, StoreError, StoreResult,
};
pub use events::{AnyToDeviceEvent, ToDeviceEvent};
pub use identities::TrackedDevice;
pub use machine::{CryptoMachine, MachineSignal, StopHandle};
pub use secure_buffer::{
    fill_from_secure_rng, FixedBuffer, PicklingKey, SecureBufferError, SecureHeap,
    TOTAL_SECURE_HEAP_SIZE,
};
pub use store::CryptoStore;
pub use tracking::DeviceTracker;
pub use transport::{
    CredentialStore, DeviceLists, KeysClaimResponse, KeysQueryResponse, KeysUploadResponse,
    RoomUpdate, SyncResponse, TransportClient, TransportError,
};
pub use types::{
    DeviceKeys, MegolmEncryptedContent, OlmEncryptedContent, RoomEncryptionContent,
    RoomKeyContent, SignedOneTimeKey, MEGOLM_V1_AES_SHA2, OLM_V1_CURVE25519_AES_SHA2,
};
