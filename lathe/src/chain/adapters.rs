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

//! Contracts implemented by the external collaborators: blockchain,
//! cache, purse and owner plugins.
//!
//! Adapters are blocking; their call sites are the kernel's suspension
//! points. Adapter failures surface as [`anyhow::Error`] and are mapped
//! to the kernel taxonomy at the boundary: broadcast failures by
//! [`BroadcastFailure::classify`], everything else verbatim.

use anyhow::Result;
use serde_json::Value as Json;
use thiserror::Error;

use crate::bindings::Lock;
use crate::crypto::Txid;

/// Cache key prefix for jig states, indexed by location.
pub const KEY_JIG: &str = "jig://";
/// Cache key prefix for raw transactions, indexed by txid.
pub const KEY_TX: &str = "tx://";
/// Cache key prefix for spend pointers.
pub const KEY_SPEND: &str = "spend://";
/// Cache key prefix for block times.
pub const KEY_TIME: &str = "time://";
/// Cache key prefix for banned locations.
pub const KEY_BAN: &str = "ban://";
/// Cache key prefix for instance configuration.
pub const KEY_CONFIG: &str = "config://";

/// An unspent output, as reported by the blockchain adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// Funding transaction.
    pub txid: Txid,
    /// Output index.
    pub vout: u32,
    /// Locking script.
    pub script: Vec<u8>,
    /// Bound satoshis.
    pub satoshis: u64,
}

/// A spent output's relevant fields, handed to purse and owner plugins so
/// they can evaluate and sign inputs without refetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parent {
    /// Locking script of the output being spent.
    pub script: Vec<u8>,
    /// Satoshis of the output being spent.
    pub satoshis: u64,
}

/// Blockchain I/O contract.
pub trait Blockchain {
    /// Submits a raw transaction, returning its id.
    fn broadcast(&self, rawtx: &[u8]) -> Result<Txid>;
    /// Fetches a raw transaction by id.
    fn fetch(&self, txid: &Txid) -> Result<Vec<u8>>;
    /// Lists unspent outputs locked by the given script.
    fn utxos(&self, script: &[u8]) -> Result<Vec<Utxo>>;
    /// Reports the transaction spending an output, if any.
    fn spends(&self, txid: &Txid, vout: u32) -> Result<Option<Txid>>;
    /// Reports a transaction's block (or mempool acceptance) time in unix
    /// milliseconds.
    fn time(&self, txid: &Txid) -> Result<u64>;
}

/// Key-value cache contract over stringly-typed keys.
///
/// Caches may miss. Keys indexed by a hash (`jig://`, `tx://`) are
/// immutable: a conforming backend never returns a different value for a
/// key it once answered.
pub trait Cache {
    /// Reads a value.
    fn get(&self, key: &str) -> Result<Option<Json>>;
    /// Writes a value.
    fn set(&self, key: &str, value: &Json) -> Result<()>;
}

/// Fee-paying plugin.
pub trait Purse {
    /// Returns the transaction augmented with payment inputs and change
    /// outputs.
    fn pay(&self, rawtx: &[u8], parents: &[Parent]) -> Result<Vec<u8>>;
}

/// Signing plugin.
pub trait Owner {
    /// The lock assigned to newly created jigs.
    fn next_owner(&self) -> Result<Lock>;
    /// Signs the transaction's jig inputs. `locks[i]` is the lock guarding
    /// input `i`, where known; purse inputs pass `None`.
    fn sign(&self, rawtx: &[u8], parents: &[Parent], locks: &[Option<Lock>]) -> Result<Vec<u8>>;
}

/// Broadcast failures, classified from adapter error text so every
/// backend surfaces the same taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastFailure {
    /// An input is unknown or already confirmed spent.
    #[error("Broadcast failed: Missing inputs")]
    MissingInputs,
    /// An input conflicts with a mempool transaction.
    #[error("Broadcast failed: txn-mempool-conflict")]
    MempoolConflict,
    /// The same output is spent twice within the transaction.
    #[error("Broadcast failed: bad-txns-inputs-duplicate")]
    DuplicateInput,
    /// Outputs exceed inputs.
    #[error("Broadcast failed: bad-txns-in-belowout")]
    InBelowOut,
    /// An unlocking script failed verification.
    #[error("Broadcast failed: mandatory-script-verify-flag-failed")]
    ScriptVerifyFailed,
    /// The fee is below the relay floor.
    #[error("Broadcast failed: insufficient priority")]
    InsufficientPriority,
    /// A referenced transaction is unknown to the backend.
    #[error("Broadcast failed: No such mempool or blockchain transaction")]
    NoSuchTransaction,
    /// The transaction has no inputs.
    #[error("Broadcast failed: no inputs")]
    NoInputs,
    /// The transaction has no outputs.
    #[error("Broadcast failed: no outputs")]
    NoOutputs,
    /// Anything else, carried verbatim.
    #[error("Broadcast failed: {0}")]
    Other(String),
}

impl BroadcastFailure {
    /// Maps backend error text onto the taxonomy.
    pub fn classify(message: &str) -> BroadcastFailure {
        const PATTERNS: &[(&str, BroadcastFailure)] = &[
            ("Missing inputs", BroadcastFailure::MissingInputs),
            ("txn-mempool-conflict", BroadcastFailure::MempoolConflict),
            ("bad-txns-inputs-duplicate", BroadcastFailure::DuplicateInput),
            ("bad-txns-in-belowout", BroadcastFailure::InBelowOut),
            (
                "mandatory-script-verify-flag-failed",
                BroadcastFailure::ScriptVerifyFailed,
            ),
            ("insufficient priority", BroadcastFailure::InsufficientPriority),
            (
                "No such mempool or blockchain transaction",
                BroadcastFailure::NoSuchTransaction,
            ),
            ("bad-txns-vin-empty", BroadcastFailure::NoInputs),
            ("bad-txns-vout-empty", BroadcastFailure::NoOutputs),
        ];
        for (pattern, failure) in PATTERNS {
            if message.contains(pattern) {
                return failure.clone();
            }
        }
        BroadcastFailure::Other(message.to_owned())
    }

    /// Whether the failure is deterministic for the transaction contents
    /// (as opposed to transient backend state), and thus safe to ban on.
    pub fn is_deterministic(&self) -> bool {
        matches!(
            self,
            BroadcastFailure::DuplicateInput
                | BroadcastFailure::InBelowOut
                | BroadcastFailure::ScriptVerifyFailed
                | BroadcastFailure::NoInputs
                | BroadcastFailure::NoOutputs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_backend_text() {
        assert_eq!(
            BroadcastFailure::classify("258: txn-mempool-conflict"),
            BroadcastFailure::MempoolConflict
        );
        assert_eq!(
            BroadcastFailure::classify("16: bad-txns-inputs-duplicate"),
            BroadcastFailure::DuplicateInput
        );
        assert_eq!(
            BroadcastFailure::classify("Missing inputs"),
            BroadcastFailure::MissingInputs
        );
        assert_matches::assert_matches!(
            BroadcastFailure::classify("connection reset"),
            BroadcastFailure::Other(_)
        );
    }

    #[test]
    fn transient_failures_are_not_bannable() {
        assert!(!BroadcastFailure::classify("connection reset").is_deterministic());
        assert!(!BroadcastFailure::MempoolConflict.is_deterministic());
        assert!(BroadcastFailure::DuplicateInput.is_deterministic());
    }
}
