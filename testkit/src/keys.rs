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

//! Mock key material.
//!
//! The testkit carries real addresses and pubkey hashes but no real
//! curve: signatures are deterministic digests over the transaction and
//! the secret. [`MockChain`](crate::MockChain) verifies that an
//! unlocking script carries the pubkey whose hash the locking script
//! pays to, which is what jig-level tests need from ownership.

use lathe::crypto::{address_from_pubkey, sha256};
use rand::Rng;

/// A mock keypair with a stable address.
#[derive(Debug, Clone)]
pub struct KeyPair {
    secret: [u8; 32],
    /// Compressed-format public key bytes.
    pub pubkey: [u8; 33],
    /// Base58check address over the pubkey hash.
    pub address: String,
}

impl KeyPair {
    /// Derives a keypair from the given randomness source.
    pub fn generate(rng: &mut impl Rng, address_version: u8) -> KeyPair {
        let mut secret = [0u8; 32];
        rng.fill(&mut secret);
        KeyPair::from_secret(secret, address_version)
    }

    /// Derives a keypair from secret bytes.
    pub fn from_secret(secret: [u8; 32], address_version: u8) -> KeyPair {
        let mut pubkey = [0u8; 33];
        pubkey[0] = 0x02;
        pubkey[1..].copy_from_slice(sha256(&secret).as_bytes());
        let address = address_from_pubkey(address_version, &pubkey);
        KeyPair {
            secret,
            pubkey,
            address,
        }
    }

    /// A deterministic placeholder signature over the transaction.
    pub fn sign(&self, rawtx: &[u8]) -> Vec<u8> {
        let mut preimage = rawtx.to_vec();
        preimage.extend_from_slice(&self.secret);
        let digest = sha256(&preimage);
        let mut sig = Vec::with_capacity(33);
        sig.push(0x30);
        sig.extend_from_slice(digest.as_bytes());
        sig
    }

    /// The unlocking script for a pay-to-pubkey-hash input: the
    /// signature push followed by the pubkey push.
    pub fn unlock_script(&self, rawtx: &[u8]) -> Vec<u8> {
        let mut script = Vec::new();
        lathe::chain::script::push_data(&mut script, &self.sign(rawtx));
        lathe::chain::script::push_data(&mut script, &self.pubkey);
        script
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn keypairs_are_deterministic_per_seed() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let ka = KeyPair::generate(&mut a, 0x6f);
        let kb = KeyPair::generate(&mut b, 0x6f);
        assert_eq!(ka.address, kb.address);
        let kc = KeyPair::generate(&mut a, 0x6f);
        assert_ne!(ka.address, kc.address);
    }

    #[test]
    fn unlock_script_carries_the_pubkey() {
        let mut rng = StdRng::seed_from_u64(1);
        let keys = KeyPair::generate(&mut rng, 0x6f);
        let script = keys.unlock_script(b"tx");
        let chunks_end = &script[script.len() - 33..];
        assert_eq!(chunks_end, &keys.pubkey[..]);
    }
}
