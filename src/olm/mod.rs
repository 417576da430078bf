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

//! The cryptographic identities and ratchet sessions of this device.

mod account;
mod group_sessions;
mod session;

pub use account::Account;
pub use group_sessions::{
    EncryptionSettings, InboundGroupSession, OutboundGroupSession, SessionOrigin,
};
pub use session::Session;
pub use vodozemac::olm::IdentityKeys;
