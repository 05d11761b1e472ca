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

//! The local purse and owner plugins backing a test instance.

use anyhow::{anyhow, bail, Result};
use lathe::chain::adapters::{Blockchain, Owner, Parent, Purse};
use lathe::chain::script::p2pkh_script;
use lathe::chain::transaction::{Transaction, TxIn};
use lathe::crypto::decode_address;
use lathe::{CommonLock, Lock};

use crate::keys::KeyPair;
use crate::mockchain::MockChain;

/// Fee margin added on top of the rate estimate, covering the inputs and
/// change the estimate cannot see yet.
const FEE_MARGIN: u64 = 200;

/// Pays fees from a funded mock address.
#[derive(Debug, Clone)]
pub struct LocalPurse {
    chain: MockChain,
    keys: KeyPair,
}

impl LocalPurse {
    /// A purse drawing on the keypair's UTXOs.
    pub fn new(chain: MockChain, keys: KeyPair) -> LocalPurse {
        LocalPurse { chain, keys }
    }

    /// The purse address, for funding.
    pub fn address(&self) -> &str {
        &self.keys.address
    }

    /// Spendable balance.
    pub fn balance(&self) -> Result<u64> {
        let (_, hash) = decode_address(&self.keys.address).map_err(|e| anyhow!("{}", e))?;
        let utxos = self.chain.utxos(&p2pkh_script(&hash))?;
        Ok(utxos.iter().map(|u| u.satoshis).sum())
    }
}

impl Purse for LocalPurse {
    fn pay(&self, rawtx: &[u8], parents: &[Parent]) -> Result<Vec<u8>> {
        let mut tx = Transaction::from_bytes(rawtx).map_err(|e| anyhow!("{}", e))?;
        let jig_in: u64 = parents.iter().map(|p| p.satoshis).sum();
        let out_sum: u64 = tx.outputs.iter().map(|o| o.satoshis).sum();

        let (_, hash) = decode_address(&self.keys.address).map_err(|e| anyhow!("{}", e))?;
        let our_script = p2pkh_script(&hash);
        let utxos = self.chain.utxos(&our_script)?;

        let mut funded = jig_in;
        let mut added = 0usize;
        let mut utxo_iter = utxos.into_iter();
        loop {
            // Size grows with every added input and the change output.
            let estimated = rawtx.len() + added * 140 + 34;
            let fee = MockChain::fee_for(estimated) + FEE_MARGIN;
            if funded >= out_sum + fee {
                let change = funded - out_sum - fee;
                if change > lathe::runtime::DUST {
                    tx.outputs.push(lathe::chain::transaction::TxOut {
                        satoshis: change,
                        script: our_script.clone(),
                    });
                }
                break;
            }
            let utxo = match utxo_iter.next() {
                Some(utxo) => utxo,
                None => bail!("purse has insufficient funds"),
            };
            tx.inputs.push(TxIn::unsigned(utxo.txid, utxo.vout));
            funded += utxo.satoshis;
            added += 1;
        }

        // Sign the purse's own inputs.
        let unsigned = tx.to_bytes();
        for input in &mut tx.inputs {
            if input.script.is_empty() {
                let outpoint = (input.prev_txid, input.prev_vout);
                let ours = self
                    .chain
                    .utxos(&our_script)?
                    .iter()
                    .any(|u| (u.txid, u.vout) == outpoint);
                if ours {
                    input.script = self.keys.unlock_script(&unsigned);
                }
            }
        }
        Ok(tx.to_bytes())
    }
}

/// Signs jig inputs and hands out the next owner lock.
#[derive(Debug, Clone)]
pub struct LocalOwner {
    keys: KeyPair,
}

impl LocalOwner {
    /// An owner over the given keypair.
    pub fn new(keys: KeyPair) -> LocalOwner {
        LocalOwner { keys }
    }

    /// The owner address.
    pub fn address(&self) -> &str {
        &self.keys.address
    }
}

impl Owner for LocalOwner {
    fn next_owner(&self) -> Result<Lock> {
        let lock = CommonLock::from_address(&self.keys.address).map_err(|e| anyhow!("{}", e))?;
        Ok(Lock::Common(lock))
    }

    fn sign(&self, rawtx: &[u8], _parents: &[Parent], locks: &[Option<Lock>]) -> Result<Vec<u8>> {
        let mut tx = Transaction::from_bytes(rawtx).map_err(|e| anyhow!("{}", e))?;
        for (i, lock) in locks.iter().enumerate() {
            let ours = match lock {
                Some(Lock::Common(common)) => common.address == self.keys.address,
                _ => false,
            };
            if ours {
                if let Some(input) = tx.inputs.get_mut(i) {
                    input.script = self.keys.unlock_script(rawtx);
                }
            }
        }
        Ok(tx.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lathe::chain::adapters::Blockchain;
    use lathe::chain::transaction::TxOut;

    fn wallet() -> (MockChain, LocalPurse) {
        let chain = MockChain::new();
        let keys = KeyPair::from_secret([3; 32], 0x6f);
        chain.fund(&keys.address, 1_000_000).unwrap();
        (chain.clone(), LocalPurse::new(chain, keys))
    }

    #[test]
    fn pays_and_broadcasts() {
        let (chain, purse) = wallet();
        let recipient = KeyPair::from_secret([4; 32], 0x6f);
        let (_, hash) = decode_address(&recipient.address).unwrap();
        let mut tx = Transaction::new();
        tx.outputs.push(TxOut {
            satoshis: 10_000,
            script: p2pkh_script(&hash),
        });
        let paid = purse.pay(&tx.to_bytes(), &[]).unwrap();
        chain.broadcast(&paid).unwrap();
        // Change returned to the purse.
        assert!(purse.balance().unwrap() > 900_000);
    }

    #[test]
    fn fails_without_funds() {
        let chain = MockChain::new();
        let keys = KeyPair::from_secret([5; 32], 0x6f);
        let purse = LocalPurse::new(chain, keys);
        let mut tx = Transaction::new();
        tx.outputs.push(TxOut {
            satoshis: 10_000,
            script: vec![0x51],
        });
        let err = purse.pay(&tx.to_bytes(), &[]).unwrap_err();
        assert!(err.to_string().contains("insufficient funds"));
    }
}
