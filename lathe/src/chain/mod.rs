// Copyright 2025 The Lathe Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Transaction wire format and the external adapter contracts.
//!
//! Everything the kernel knows about the underlying chain lives here: the
//! raw transaction codec, script building and scanning, the metadata
//! anchor, and the blockchain/cache/purse/owner traits implemented by
//! plugins.

pub mod adapters;
pub mod metadata;
pub mod script;
pub mod transaction;

use serde_derive::{Deserialize, Serialize};

use crate::crypto::{ADDRESS_VERSION_MAIN, ADDRESS_VERSION_TEST};

/// The network an instance operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production chain.
    Main,
    /// Public test chain.
    Test,
    /// In-process mock chain.
    Mock,
}

impl Network {
    /// Address version byte for pay-to-pubkey-hash outputs.
    pub fn address_version(self) -> u8 {
        match self {
            Network::Main => ADDRESS_VERSION_MAIN,
            Network::Test | Network::Mock => ADDRESS_VERSION_TEST,
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Mock
    }
}
