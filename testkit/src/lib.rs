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

//! Testkit for the lathe runtime.
//!
//! Assembles an instance over in-process plugins ([`MockChain`],
//! [`LocalCache`], [`LocalPurse`] and [`LocalOwner`]) so jig code can be
//! exercised synchronously, deterministically and without a network.
//!
//! ```ignore
//! let kit = TestKit::new("demo");
//! let class = kit.lathe.deploy(my_class)?;
//! let jig = class.construct(vec![])?;
//! let peer = kit.peer(&["mvNN..."]); // cold cache, same chain
//! ```

#![deny(unsafe_code, bare_trait_objects, missing_docs, unused_must_use)]

pub mod cache;
pub mod keys;
pub mod mockchain;
pub mod wallet;

pub use crate::cache::LocalCache;
pub use crate::keys::KeyPair;
pub use crate::mockchain::{MockChain, FEE_PER_KB, GENESIS_TIME};
pub use crate::wallet::{LocalOwner, LocalPurse};

use lathe::chain::Network;
use lathe::Lathe;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Satoshis granted to each fresh purse.
pub const PURSE_FUNDS: u64 = 100_000_000;

/// A fully wired test instance plus handles to its plugins.
#[derive(Debug)]
pub struct TestKit {
    /// The runtime instance.
    pub lathe: Lathe,
    /// The shared mock chain.
    pub chain: MockChain,
    /// The instance's cache.
    pub cache: LocalCache,
    /// The instance's owner plugin.
    pub owner: LocalOwner,
    /// The instance's purse plugin.
    pub purse: LocalPurse,
    rng: StdRng,
    app: String,
}

impl TestKit {
    /// A test instance with a fixed default seed.
    pub fn new(app: &str) -> TestKit {
        TestKit::with_seed(app, 42)
    }

    /// A deterministic test instance: same seed, same keys, same txids.
    pub fn with_seed(app: &str, seed: u64) -> TestKit {
        let chain = MockChain::new();
        let mut rng = StdRng::seed_from_u64(seed);
        TestKit::assemble(app, chain, &mut rng, &[])
    }

    fn assemble(app: &str, chain: MockChain, rng: &mut StdRng, trust: &[&str]) -> TestKit {
        let version = Network::Mock.address_version();
        let owner_keys = KeyPair::generate(rng, version);
        let purse_keys = KeyPair::generate(rng, version);
        chain
            .fund(&purse_keys.address, PURSE_FUNDS)
            .expect("funding the mock purse");

        let cache = LocalCache::new();
        let owner = LocalOwner::new(owner_keys);
        let purse = LocalPurse::new(chain.clone(), purse_keys);

        let mut builder = Lathe::builder()
            .app(app)
            .network(Network::Mock)
            .blockchain(chain.clone())
            .cache(cache.clone())
            .purse(purse.clone())
            .owner(owner.clone());
        for txid in trust {
            builder = builder.trust(*txid);
        }
        let lathe = builder.build().expect("assembling the test instance");
        TestKit {
            lathe,
            chain,
            cache,
            owner,
            purse,
            rng: rng.clone(),
            app: app.to_owned(),
        }
    }

    /// A second instance on the same chain with a cold cache and fresh
    /// keys, as another host would see the world. `trust` seeds its
    /// trusted txids.
    pub fn peer(&mut self, trust: &[&str]) -> TestKit {
        let app = self.app.clone();
        let chain = self.chain.clone();
        TestKit::assemble(&app, chain, &mut self.rng, trust)
    }
}
