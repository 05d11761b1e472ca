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

//! An in-process blockchain with real UTXO accounting.
//!
//! Broadcast enforces the same failure taxonomy a production backend
//! surfaces: missing inputs, double spends, duplicate inputs, value
//! imbalance, fee floor and pay-to-pubkey-hash key checks. Time is a
//! logical clock advanced per accepted transaction, so tests stay
//! deterministic.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use lathe::chain::adapters::{Blockchain, Utxo};
use lathe::chain::script::{parse_anchor, parse_p2pkh};
use lathe::chain::transaction::Transaction;
use lathe::crypto::hash160;
use lathe::Txid;

/// Fee rate enforced by [`MockChain`], in satoshis per kilobyte.
pub const FEE_PER_KB: u64 = 500;

/// Unix time the mock chain starts at, in milliseconds.
pub const GENESIS_TIME: u64 = 1_600_000_000_000;

#[derive(Debug, Default)]
struct Inner {
    txs: HashMap<Txid, Vec<u8>>,
    unspent: HashMap<(Txid, u32), (Vec<u8>, u64)>,
    spends: HashMap<(Txid, u32), Txid>,
    times: HashMap<Txid, u64>,
    clock: u64,
}

/// The in-process mock blockchain. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockChain {
    inner: Rc<RefCell<Inner>>,
}

impl MockChain {
    /// An empty chain.
    pub fn new() -> MockChain {
        let chain = MockChain::default();
        chain.inner.borrow_mut().clock = GENESIS_TIME;
        chain
    }

    /// Required fee for a transaction of the given size.
    pub fn fee_for(len: usize) -> u64 {
        (len as u64 * FEE_PER_KB + 999) / 1000
    }

    /// Mints an output paying the address, outside normal validation.
    pub fn fund(&self, address: &str, satoshis: u64) -> Result<Utxo> {
        let (_, pubkey_hash) =
            lathe::crypto::decode_address(address).map_err(|e| anyhow!("{}", e))?;
        let script = lathe::chain::script::p2pkh_script(&pubkey_hash);
        let mut tx = Transaction::new();
        // A distinct locktime keeps repeated funding txids unique.
        tx.locktime = self.inner.borrow().txs.len() as u32;
        tx.outputs.push(lathe::chain::transaction::TxOut {
            satoshis,
            script: script.clone(),
        });
        let rawtx = tx.to_bytes();
        let txid = Txid::compute(&rawtx);
        let mut inner = self.inner.borrow_mut();
        inner.txs.insert(txid, rawtx);
        inner.unspent.insert((txid, 0), (script.clone(), satoshis));
        inner.clock += 1_000;
        let time = inner.clock;
        inner.times.insert(txid, time);
        Ok(Utxo {
            txid,
            vout: 0,
            script,
            satoshis,
        })
    }

    /// Number of accepted transactions.
    pub fn tx_count(&self) -> usize {
        self.inner.borrow().txs.len()
    }

    fn verify_p2pkh(prev_script: &[u8], unlock: &[u8]) -> Result<()> {
        let pubkey_hash = match parse_p2pkh(prev_script) {
            Some(hash) => hash,
            // Only standard pay-to-pubkey-hash locks are checked.
            None => return Ok(()),
        };
        // The pubkey is the last push of the unlocking script.
        if unlock.len() < 34 {
            bail!("16: mandatory-script-verify-flag-failed");
        }
        let pubkey = &unlock[unlock.len() - 33..];
        let push_len = unlock[unlock.len() - 34];
        if push_len != 33 || hash160(pubkey) != pubkey_hash {
            bail!("16: mandatory-script-verify-flag-failed");
        }
        Ok(())
    }
}

impl Blockchain for MockChain {
    fn broadcast(&self, rawtx: &[u8]) -> Result<Txid> {
        let tx = Transaction::from_bytes(rawtx).map_err(|e| anyhow!("{}", e))?;
        if tx.inputs.is_empty() {
            bail!("16: bad-txns-vin-empty");
        }
        if tx.outputs.is_empty() {
            bail!("16: bad-txns-vout-empty");
        }
        for (i, a) in tx.inputs.iter().enumerate() {
            for b in tx.inputs.iter().skip(i + 1) {
                if a.prev_txid == b.prev_txid && a.prev_vout == b.prev_vout {
                    bail!("16: bad-txns-inputs-duplicate");
                }
            }
        }

        let txid = Txid::compute(rawtx);
        let mut in_sum = 0u64;
        {
            let inner = self.inner.borrow();
            for input in &tx.inputs {
                let outpoint = (input.prev_txid, input.prev_vout);
                if inner.spends.contains_key(&outpoint) {
                    bail!("258: txn-mempool-conflict");
                }
                let (prev_script, satoshis) = match inner.unspent.get(&outpoint) {
                    Some(found) => found.clone(),
                    None => bail!("Missing inputs"),
                };
                MockChain::verify_p2pkh(&prev_script, &input.script)?;
                in_sum += satoshis;
            }
        }
        let out_sum: u64 = tx.outputs.iter().map(|o| o.satoshis).sum();
        if out_sum > in_sum {
            bail!("16: bad-txns-in-belowout");
        }
        let fee = in_sum - out_sum;
        if fee < MockChain::fee_for(rawtx.len()) {
            bail!("66: insufficient priority");
        }

        let mut inner = self.inner.borrow_mut();
        for input in &tx.inputs {
            let outpoint = (input.prev_txid, input.prev_vout);
            inner.unspent.remove(&outpoint);
            inner.spends.insert(outpoint, txid);
        }
        for (vout, output) in tx.outputs.iter().enumerate() {
            // Data carriers are not spendable.
            if parse_anchor(&output.script).is_some() {
                continue;
            }
            inner
                .unspent
                .insert((txid, vout as u32), (output.script.clone(), output.satoshis));
        }
        inner.txs.insert(txid, rawtx.to_vec());
        inner.clock += 1_000;
        let time = inner.clock;
        inner.times.insert(txid, time);
        log::debug!("mockchain accepted {} (fee {})", txid, fee);
        Ok(txid)
    }

    fn fetch(&self, txid: &Txid) -> Result<Vec<u8>> {
        self.inner
            .borrow()
            .txs
            .get(txid)
            .cloned()
            .ok_or_else(|| anyhow!("No such mempool or blockchain transaction"))
    }

    fn utxos(&self, script: &[u8]) -> Result<Vec<Utxo>> {
        let inner = self.inner.borrow();
        let mut utxos: Vec<Utxo> = inner
            .unspent
            .iter()
            .filter(|(_, (s, _))| s == script)
            .map(|((txid, vout), (script, satoshis))| Utxo {
                txid: *txid,
                vout: *vout,
                script: script.clone(),
                satoshis: *satoshis,
            })
            .collect();
        utxos.sort_by_key(|u| (u.txid, u.vout));
        Ok(utxos)
    }

    fn spends(&self, txid: &Txid, vout: u32) -> Result<Option<Txid>> {
        Ok(self.inner.borrow().spends.get(&(*txid, vout)).copied())
    }

    fn time(&self, txid: &Txid) -> Result<u64> {
        self.inner
            .borrow()
            .times
            .get(txid)
            .copied()
            .ok_or_else(|| anyhow!("No such mempool or blockchain transaction"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use lathe::chain::transaction::{TxIn, TxOut};

    fn keys() -> KeyPair {
        KeyPair::from_secret([7; 32], 0x6f)
    }

    fn spend(utxo: &Utxo, keys: &KeyPair, satoshis: u64) -> Transaction {
        let mut tx = Transaction::new();
        tx.inputs.push(TxIn {
            prev_txid: utxo.txid,
            prev_vout: utxo.vout,
            script: Vec::new(),
            sequence: 0xffff_ffff,
        });
        tx.outputs.push(TxOut {
            satoshis,
            script: utxo.script.clone(),
        });
        let rawtx = tx.to_bytes();
        for input in &mut tx.inputs {
            input.script = keys.unlock_script(&rawtx);
        }
        tx
    }

    #[test]
    fn accepts_a_valid_spend() {
        let chain = MockChain::new();
        let keys = keys();
        let utxo = chain.fund(&keys.address, 100_000).unwrap();
        let tx = spend(&utxo, &keys, 50_000);
        let txid = chain.broadcast(&tx.to_bytes()).unwrap();
        assert_eq!(chain.fetch(&txid).unwrap(), tx.to_bytes());
        assert_eq!(chain.spends(&utxo.txid, 0).unwrap(), Some(txid));
        assert!(chain.time(&txid).unwrap() > GENESIS_TIME);
    }

    #[test]
    fn rejects_double_spends() {
        let chain = MockChain::new();
        let keys = keys();
        let utxo = chain.fund(&keys.address, 100_000).unwrap();
        let a = spend(&utxo, &keys, 50_000);
        let b = spend(&utxo, &keys, 40_000);
        chain.broadcast(&a.to_bytes()).unwrap();
        let err = chain.broadcast(&b.to_bytes()).unwrap_err();
        assert!(err.to_string().contains("txn-mempool-conflict"));
    }

    #[test]
    fn rejects_duplicate_inputs() {
        let chain = MockChain::new();
        let keys = keys();
        let utxo = chain.fund(&keys.address, 100_000).unwrap();
        let mut tx = spend(&utxo, &keys, 50_000);
        let dup = tx.inputs[0].clone();
        tx.inputs.push(dup);
        let err = chain.broadcast(&tx.to_bytes()).unwrap_err();
        assert!(err.to_string().contains("bad-txns-inputs-duplicate"));
    }

    #[test]
    fn rejects_unknown_inputs_and_imbalance() {
        let chain = MockChain::new();
        let keys = keys();
        let utxo = chain.fund(&keys.address, 100_000).unwrap();

        let mut tx = spend(&utxo, &keys, 50_000);
        tx.inputs[0].prev_vout = 9;
        let err = chain.broadcast(&tx.to_bytes()).unwrap_err();
        assert!(err.to_string().contains("Missing inputs"));

        let tx = spend(&utxo, &keys, 200_000);
        let err = chain.broadcast(&tx.to_bytes()).unwrap_err();
        assert!(err.to_string().contains("bad-txns-in-belowout"));
    }

    #[test]
    fn rejects_wrong_key_material() {
        let chain = MockChain::new();
        let keys = keys();
        let thief = KeyPair::from_secret([9; 32], 0x6f);
        let utxo = chain.fund(&keys.address, 100_000).unwrap();
        let tx = spend(&utxo, &thief, 50_000);
        let err = chain.broadcast(&tx.to_bytes()).unwrap_err();
        assert!(err.to_string().contains("mandatory-script-verify-flag-failed"));
    }

    #[test]
    fn rejects_dust_fees() {
        let chain = MockChain::new();
        let keys = keys();
        let utxo = chain.fund(&keys.address, 100_000).unwrap();
        let tx = spend(&utxo, &keys, 99_999);
        let err = chain.broadcast(&tx.to_bytes()).unwrap_err();
        assert!(err.to_string().contains("insufficient priority"));
    }
}
