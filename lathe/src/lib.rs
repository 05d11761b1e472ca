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

//! A deterministic smart-object runtime over a UTXO blockchain.
//!
//! Application authors register classes ("jigs"), sidekick code and
//! foreign-data plugins ("berries"); the runtime publishes their
//! manifests and state into transactions, re-executes those transactions
//! deterministically on any peer to reconstruct live objects, enforces
//! UTXO-like ownership over every object, and maintains a
//! replay-verifiable history.
//!
//! The entry point is [`Lathe`], built with [`Lathe::builder`] over four
//! pluggable adapters (blockchain, cache, purse, owner; see
//! [`chain::adapters`]; `lathe-testkit` ships in-process mocks). Live
//! objects are addressed through [`JigHandle`]s whose method calls are
//! recorded and committed as transactions.
//!
//! ```ignore
//! let lathe = Lathe::builder()
//!     .app("demo")
//!     .blockchain(chain)
//!     .cache(cache)
//!     .purse(purse)
//!     .owner(owner)
//!     .build()?;
//! let class = lathe.deploy(dragon_class)?;
//! let jig = class.construct(vec![Value::from(10)])?;
//! jig.call("feed", vec![])?;
//! jig.sync()?;
//! ```

#![deny(
    unsafe_code,
    bare_trait_objects,
    missing_docs,
    missing_debug_implementations,
    unused_must_use
)]

pub mod bindings;
pub mod chain;
pub mod codec;
pub mod crypto;
pub mod helpers;
pub mod load;
pub mod membrane;
pub mod runtime;
pub mod sandbox;
pub mod value;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::chain::adapters::{Blockchain, BroadcastFailure, Cache, Owner, Purse};
use crate::chain::Network;
use crate::helpers::Deadline;
use crate::load::Loader;
use crate::membrane::{Caller, Membrane};
use crate::runtime::{ExecutionError, Kernel};
use crate::sandbox::{BerryDef, ClassDef, ClassImpl};

pub use crate::bindings::{BindingError, CommonLock, Location, Lock, MAX_SATOSHIS};
pub use crate::chain::adapters::{Parent, Utxo};
pub use crate::chain::metadata::{Metadata, MetadataError, PROTOCOL_VERSION};
pub use crate::chain::transaction::{Transaction, TxError};
pub use crate::codec::CodecError;
pub use crate::crypto::{Hash, ParseHashError, Txid};
pub use crate::helpers::environment::EnvironmentError;
pub use crate::helpers::TimeoutError;
pub use crate::load::LoadError;
pub use crate::membrane::AccessError;
pub use crate::sandbox::{
    BerryFetch, ClassKind, ClassManifest, InstallError, MethodScope, MethodTarget,
};
pub use crate::value::{JigRef, Value};

// Re-exported so downstream crates spell class versions without adding
// the dependency themselves.
pub use semver;

/// Any failure surfaced by the runtime.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Binding validation failure.
    #[error(transparent)]
    Binding(#[from] BindingError),
    /// Membrane access failure.
    #[error(transparent)]
    Access(#[from] AccessError),
    /// Class installation failure.
    #[error(transparent)]
    Install(#[from] InstallError),
    /// Codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Transaction metadata failure.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// Raw transaction parse failure.
    #[error(transparent)]
    Transaction(#[from] TxError),
    /// Execution or ownership failure.
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    /// Broadcast failure.
    #[error(transparent)]
    Broadcast(#[from] BroadcastFailure),
    /// Load or replay failure.
    #[error(transparent)]
    Load(#[from] LoadError),
    /// A task overran its timeout.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    /// The host cannot run the kernel.
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
    /// A hex identifier failed to parse.
    #[error(transparent)]
    Hash(#[from] ParseHashError),
    /// An adapter failed.
    #[error("Adapter error: {0}")]
    Adapter(#[source] anyhow::Error),
}

impl Error {
    /// An application-defined method failure.
    pub fn custom(message: impl Into<String>) -> Error {
        ExecutionError::Custom(message.into()).into()
    }
}

/// Instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Application tag written into every transaction.
    #[serde(default)]
    pub app: String,
    /// Target network.
    #[serde(default)]
    pub network: Network,
    /// Per-task timeout; `None` disables the guard.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Client mode: only state-cache loads are permitted.
    #[serde(default)]
    pub client: bool,
    /// Initially trusted txids (or `*`).
    #[serde(default)]
    pub trust: Vec<String>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            app: String::new(),
            network: Network::Mock,
            timeout: Some(Duration::from_secs(30)),
            client: false,
            trust: Vec::new(),
        }
    }
}

thread_local! {
    static ACTIVE: RefCell<Option<Weak<Kernel>>> = RefCell::new(None);
}

/// Builder for a [`Lathe`] instance.
pub struct LatheBuilder {
    options: Options,
    blockchain: Option<Box<dyn Blockchain>>,
    cache: Option<Box<dyn Cache>>,
    purse: Option<Box<dyn Purse>>,
    owner: Option<Box<dyn Owner>>,
}

impl std::fmt::Debug for LatheBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatheBuilder")
            .field("options", &self.options)
            .finish()
    }
}

impl Default for LatheBuilder {
    fn default() -> Self {
        LatheBuilder {
            options: Options::default(),
            blockchain: None,
            cache: None,
            purse: None,
            owner: None,
        }
    }
}

impl LatheBuilder {
    /// Starts from default options.
    pub fn new() -> LatheBuilder {
        LatheBuilder::default()
    }

    /// Sets the application tag.
    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.options.app = app.into();
        self
    }

    /// Sets the target network.
    pub fn network(mut self, network: Network) -> Self {
        self.options.network = network;
        self
    }

    /// Sets the per-task timeout; `None` disables the guard.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Enables client mode (state-cache loads only).
    pub fn client(mut self, client: bool) -> Self {
        self.options.client = client;
        self
    }

    /// Adds an initially trusted txid (or `*`).
    pub fn trust(mut self, txid: impl Into<String>) -> Self {
        self.options.trust.push(txid.into());
        self
    }

    /// Replaces the whole option set.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Installs the blockchain adapter.
    pub fn blockchain(mut self, blockchain: impl Blockchain + 'static) -> Self {
        self.blockchain = Some(Box::new(blockchain));
        self
    }

    /// Installs the cache adapter.
    pub fn cache(mut self, cache: impl Cache + 'static) -> Self {
        self.cache = Some(Box::new(cache));
        self
    }

    /// Installs the purse plugin.
    pub fn purse(mut self, purse: impl Purse + 'static) -> Self {
        self.purse = Some(Box::new(purse));
        self
    }

    /// Installs the owner plugin.
    pub fn owner(mut self, owner: impl Owner + 'static) -> Self {
        self.owner = Some(Box::new(owner));
        self
    }

    /// Validates the host and assembles the instance.
    pub fn build(self) -> Result<Lathe, Error> {
        helpers::environment::check()?;
        let blockchain = self
            .blockchain
            .ok_or_else(|| ExecutionError::Unavailable("blockchain adapter".to_owned()))?;
        let cache = self
            .cache
            .ok_or_else(|| ExecutionError::Unavailable("cache adapter".to_owned()))?;
        let purse = self
            .purse
            .ok_or_else(|| ExecutionError::Unavailable("purse plugin".to_owned()))?;
        let owner = self
            .owner
            .ok_or_else(|| ExecutionError::Unavailable("owner plugin".to_owned()))?;
        let kernel = Rc::new(Kernel::new(blockchain, cache, purse, owner, self.options));
        let lathe = Lathe { kernel };
        lathe.activate();
        Ok(lathe)
    }
}

/// A runtime instance.
#[derive(Debug)]
pub struct Lathe {
    kernel: Rc<Kernel>,
}

impl Lathe {
    /// Starts building an instance.
    pub fn builder() -> LatheBuilder {
        LatheBuilder::new()
    }

    fn enter<T>(&self, f: impl FnOnce(&Kernel) -> Result<T, Error>) -> Result<T, Error> {
        let kernel = self.kernel.clone();
        self.kernel.queue.run(move || {
            kernel
                .deadline
                .set(Deadline::start(kernel.options.timeout));
            f(&kernel)
        })
    }

    fn handle(&self, jig: JigRef) -> JigHandle {
        JigHandle {
            kernel: Rc::downgrade(&self.kernel),
            jig,
        }
    }

    /// Registers a class definition so replay can resolve its manifest
    /// without deploying it from this instance.
    pub fn register(&self, def: Arc<dyn ClassDef>) {
        self.kernel
            .realm
            .borrow_mut()
            .make_available(ClassImpl::Plain(def));
    }

    /// Registers a berry class definition for replay resolution.
    pub fn register_berry(&self, def: Arc<dyn BerryDef>) {
        self.kernel
            .realm
            .borrow_mut()
            .make_available(ClassImpl::Berry(def));
    }

    /// Deploys a class with no dependencies.
    pub fn deploy(&self, def: Arc<dyn ClassDef>) -> Result<JigHandle, Error> {
        self.deploy_with_deps(def, &[])
    }

    /// Deploys a class whose manifest dependencies resolve to previously
    /// deployed code.
    pub fn deploy_with_deps(
        &self,
        def: Arc<dyn ClassDef>,
        deps: &[(&str, &JigHandle)],
    ) -> Result<JigHandle, Error> {
        let deps = resolve_deps(&self.kernel, deps)?;
        self.enter(|kernel| {
            let codes = kernel.op_deploy(vec![(ClassImpl::Plain(def), deps)])?;
            Ok(self.handle(codes[0]))
        })
    }

    /// Deploys a berry class.
    pub fn deploy_berry(
        &self,
        def: Arc<dyn BerryDef>,
        deps: &[(&str, &JigHandle)],
    ) -> Result<JigHandle, Error> {
        let deps = resolve_deps(&self.kernel, deps)?;
        self.enter(|kernel| {
            let codes = kernel.op_deploy(vec![(ClassImpl::Berry(def), deps)])?;
            Ok(self.handle(codes[0]))
        })
    }

    /// Loads the jig at a location.
    pub fn load(&self, location: &str) -> Result<JigHandle, Error> {
        self.enter(|kernel| {
            let jig = Loader::new(kernel).load(location)?;
            Ok(self.handle(jig))
        })
    }

    /// Replays a raw transaction provided out of band, trusting it.
    pub fn import(&self, rawtx: &[u8]) -> Result<Txid, Error> {
        self.enter(|kernel| Loader::new(kernel).import(rawtx))
    }

    /// Trusts a txid (or `*` for everything).
    pub fn trust(&self, txid: &str) -> Result<(), Error> {
        if txid != "*" && Txid::from_hex(txid).is_err() {
            return Err(ExecutionError::Custom(format!("Not trustable: {}", txid)).into());
        }
        load::trust_txid(&self.kernel, txid);
        Ok(())
    }

    /// Opens a batch transaction spanning several top-level entries.
    pub fn begin(&self) -> Result<(), Error> {
        self.enter(|kernel| kernel.begin_batch())
    }

    /// Publishes the open batch.
    pub fn publish(&self) -> Result<Txid, Error> {
        self.enter(|kernel| kernel.publish_batch())
    }

    /// Exports the open batch as a paid, signed raw transaction without
    /// broadcasting it.
    pub fn export(&self) -> Result<Vec<u8>, Error> {
        self.enter(|kernel| kernel.export_batch())
    }

    /// Discards the open batch, restoring every participant.
    pub fn rollback(&self) -> Result<(), Error> {
        self.enter(|kernel| kernel.rollback_batch())
    }

    /// Makes this the ambient instance for the current thread.
    pub fn activate(&self) {
        let weak = Rc::downgrade(&self.kernel);
        ACTIVE.with(|active| *active.borrow_mut() = Some(weak));
    }

    /// Detaches this instance from the ambient slot. In-flight work
    /// completes but later ambient lookups ignore the instance.
    pub fn deactivate(&self) {
        ACTIVE.with(|active| {
            let detach = active
                .borrow()
                .as_ref()
                .map(|w| w.ptr_eq(&Rc::downgrade(&self.kernel)))
                .unwrap_or(false);
            if detach {
                *active.borrow_mut() = None;
            }
        });
    }
}

fn resolve_deps(
    kernel: &Rc<Kernel>,
    deps: &[(&str, &JigHandle)],
) -> Result<BTreeMap<String, JigRef>, Error> {
    let mut out = BTreeMap::new();
    for (name, handle) in deps {
        // A handle from another instance indexes a different arena.
        if !handle.kernel.ptr_eq(&Rc::downgrade(kernel)) {
            return Err(ExecutionError::Unavailable(format!(
                "dependency {} from another instance",
                name
            ))
            .into());
        }
        out.insert((*name).to_owned(), handle.jig);
    }
    Ok(out)
}

/// A live reference to a jig (code, instance or berry).
///
/// Handles keep identity across upgrades and syncs; reads return
/// detached copies, and all mutation happens through recorded method
/// calls.
#[derive(Debug, Clone)]
pub struct JigHandle {
    kernel: Weak<Kernel>,
    jig: JigRef,
}

impl JigHandle {
    fn kernel(&self) -> Result<Rc<Kernel>, Error> {
        self.kernel
            .upgrade()
            .ok_or_else(|| ExecutionError::Unavailable("instance".to_owned()).into())
    }

    fn enter<T>(&self, f: impl FnOnce(&Kernel) -> Result<T, Error>) -> Result<T, Error> {
        let kernel = self.kernel()?;
        let inner = kernel.clone();
        kernel.queue.run(move || {
            inner.deadline.set(Deadline::start(inner.options.timeout));
            f(&inner)
        })
    }

    /// The raw arena reference; stable across upgrades and syncs.
    pub fn jig_ref(&self) -> JigRef {
        self.jig
    }

    /// Invokes a method.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        self.enter(|kernel| kernel.op_call(self.jig, method, args))
    }

    /// Instantiates this jig class.
    pub fn construct(&self, args: Vec<Value>) -> Result<JigHandle, Error> {
        let kernel = self.kernel()?;
        let jig = self.enter(|k| k.op_new(self.jig, args))?;
        Ok(JigHandle {
            kernel: Rc::downgrade(&kernel),
            jig,
        })
    }

    /// Reads a property; compound values come back as detached copies.
    pub fn get(&self, prop: &str) -> Result<Value, Error> {
        self.enter(|kernel| Membrane::new(kernel, self.jig).get(&[prop], &Caller::Host))
    }

    /// Reads a nested property.
    pub fn get_path(&self, path: &[&str]) -> Result<Value, Error> {
        self.enter(|kernel| Membrane::new(kernel, self.jig).get(path, &Caller::Host))
    }

    /// Whether the jig has the property.
    pub fn has(&self, prop: &str) -> Result<bool, Error> {
        self.enter(|kernel| Membrane::new(kernel, self.jig).has(&[prop], &Caller::Host))
    }

    /// Lists own keys (bindings and properties).
    pub fn keys(&self) -> Result<Vec<String>, Error> {
        self.enter(|kernel| Membrane::new(kernel, self.jig).own_keys(&Caller::Host))
    }

    /// The latest location.
    pub fn location(&self) -> Result<String, Error> {
        self.binding_string("location")
    }

    /// The origin location.
    pub fn origin(&self) -> Result<String, Error> {
        self.binding_string("origin")
    }

    fn binding_string(&self, name: &str) -> Result<String, Error> {
        match self.get(name)? {
            Value::String(s) => Ok(s),
            other => Err(ExecutionError::Custom(format!(
                "{} read as {}",
                name,
                other.type_name()
            ))
            .into()),
        }
    }

    /// The commit counter.
    pub fn nonce(&self) -> Result<u64, Error> {
        match self.get("nonce")? {
            Value::Number(n) => Ok(n as u64),
            _ => Ok(0),
        }
    }

    /// The owner value: an address string, a lock object, or null once
    /// destroyed.
    pub fn owner(&self) -> Result<Value, Error> {
        self.get("owner")
    }

    /// The bound satoshis.
    pub fn satoshis(&self) -> Result<u64, Error> {
        match self.get("satoshis")? {
            Value::Number(n) => Ok(n as u64),
            _ => Ok(0),
        }
    }

    /// Records an ownership approval without state change.
    pub fn auth(&self) -> Result<(), Error> {
        self.enter(|kernel| kernel.op_auth(self.jig))
    }

    /// Destroys the jig.
    pub fn destroy(&self) -> Result<(), Error> {
        self.enter(|kernel| kernel.op_destroy(self.jig))
    }

    /// Replaces this code jig's class definition.
    pub fn upgrade(&self, def: Arc<dyn ClassDef>) -> Result<(), Error> {
        self.upgrade_with_deps(def, &[])
    }

    /// Replaces this code jig's class definition, with dependencies.
    pub fn upgrade_with_deps(
        &self,
        def: Arc<dyn ClassDef>,
        deps: &[(&str, &JigHandle)],
    ) -> Result<(), Error> {
        let kernel = self.kernel()?;
        let deps = resolve_deps(&kernel, deps)?;
        self.enter(|kernel| kernel.op_upgrade(self.jig, ClassImpl::Plain(def), deps))
    }

    /// Follows the spend chain to the tip, replaying each transaction
    /// and advancing this handle in place.
    pub fn sync(&self) -> Result<(), Error> {
        self.enter(|kernel| Loader::new(kernel).sync(self.jig))
    }
}
