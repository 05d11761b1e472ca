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

//! The replay/load pipeline.
//!
//! Loading a location first consults the live registry, then the state
//! cache, and only then fetches and re-executes the transaction: its
//! metadata is parsed, its embedded code is trust-checked, its inputs
//! and references are materialized recursively, its exec script is run
//! through the same kernel operations a live environment would use, and
//! the resulting metadata and state hashes are compared byte-for-byte
//! against what the transaction declares. Deterministic failures ban the
//! location so repeated loads fail fast; bans rooted in missing trust
//! clear when the txid is later trusted.

use std::collections::BTreeSet;

use serde_json::{json, Value as Json};
use thiserror::Error;

use crate::bindings::{BerryTail, Bindings, Location, Lock, Slot};
use crate::chain::adapters::{KEY_BAN, KEY_JIG, KEY_TX};
use crate::chain::metadata::{ExecOp, Metadata, PROTOCOL_VERSION};
use crate::chain::transaction::Transaction;
use crate::codec::{self, CodecError};
use crate::crypto::{sha256, Txid};
use crate::helpers::stable_stringify;
use crate::membrane::rules::Rules;
use crate::runtime::{
    commit, Creation, CreationKind, ExecutionError, Kernel, Lifecycle, Record,
};
use crate::sandbox::{BerryFetch, ClassKind, ClassManifest, InstallError};
use crate::value::{JigRef, ObjectRef, Value};
use crate::Error;

/// Load and replay failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    /// The transaction embeds code and its txid is not trusted.
    #[error("Cannot load untrusted code: {0}")]
    Untrusted(String),
    /// The location failed deterministically before.
    #[error("Banned location: {0} ({1})")]
    Banned(String, String),
    /// Replay produced different transaction metadata.
    #[error("Metadata mismatch: {0}")]
    MetadataMismatch(String),
    /// Replay produced different state hashes.
    #[error("State mismatch: {0}")]
    StateMismatch(String),
    /// Replay produced a different exec script.
    #[error("Script mismatch: {0}")]
    ScriptMismatch(String),
    /// Client mode permits only cached states.
    #[error("Client mode: cannot load {0} without a cached state")]
    ClientMode(String),
    /// A cached or declared state is malformed.
    #[error("Bad state: {0}")]
    BadState(String),
    /// The location does not exist in its transaction.
    #[error("Cannot load {0}: not found")]
    NotFound(String),
}

/// Whether a txid's embedded source may execute.
pub(crate) fn is_trusted(kernel: &Kernel, txid_hex: &str) -> bool {
    let trust = kernel.trust.borrow();
    trust.contains("*") || trust.contains(txid_hex)
}

/// Trusts a txid and clears bans rooted in the missing trust.
pub(crate) fn trust_txid(kernel: &Kernel, txid_hex: &str) {
    kernel.trust.borrow_mut().insert(txid_hex.to_owned());
    let stale: Vec<String> = kernel
        .bans
        .borrow()
        .iter()
        .filter(|(location, reason)| {
            location.starts_with(txid_hex) && reason.starts_with("Cannot load untrusted code")
        })
        .map(|(location, _)| location.clone())
        .collect();
    for location in stale {
        kernel.bans.borrow_mut().remove(&location);
        let key = format!("{}{}", KEY_BAN, location);
        let _ = kernel.cache.set(&key, &Json::Null);
    }
}

fn ban(kernel: &Kernel, location: &str, reason: &str) {
    log::warn!("banning {}: {}", location, reason);
    kernel
        .bans
        .borrow_mut()
        .insert(location.to_owned(), reason.to_owned());
    let key = format!("{}{}", KEY_BAN, location);
    let _ = kernel.cache.set(&key, &json!({ "reason": reason }));
}

fn check_ban(kernel: &Kernel, location: &str) -> Result<(), Error> {
    let reason = match kernel.bans.borrow().get(location) {
        Some(reason) => Some(reason.clone()),
        None => {
            let key = format!("{}{}", KEY_BAN, location);
            match kernel.cache.get(&key) {
                Ok(Some(Json::Object(map))) => map
                    .get("reason")
                    .and_then(Json::as_str)
                    .map(str::to_owned),
                _ => None,
            }
        }
    };
    if let Some(reason) = reason {
        // A ban rooted in missing trust clears once trust arrives.
        if reason.starts_with("Cannot load untrusted code") {
            if let Some(txid) = location.get(..64) {
                if is_trusted(kernel, txid) {
                    kernel.bans.borrow_mut().remove(location);
                    let key = format!("{}{}", KEY_BAN, location);
                    let _ = kernel.cache.set(&key, &Json::Null);
                    return Ok(());
                }
            }
        }
        return Err(LoadError::Banned(location.to_owned(), reason).into());
    }
    Ok(())
}

fn bannable(error: &Error) -> bool {
    match error {
        Error::Load(e) => matches!(
            e,
            LoadError::Untrusted(_)
                | LoadError::MetadataMismatch(_)
                | LoadError::StateMismatch(_)
                | LoadError::ScriptMismatch(_)
                | LoadError::BadState(_)
                | LoadError::NotFound(_)
        ),
        Error::Metadata(_) | Error::Transaction(_) => true,
        _ => false,
    }
}

/// One load session; tracks txids being replayed to refuse cycles from a
/// misbehaving backend.
pub(crate) struct Loader<'k> {
    kernel: &'k Kernel,
    replaying: BTreeSet<String>,
}

impl<'k> Loader<'k> {
    pub fn new(kernel: &'k Kernel) -> Loader<'k> {
        Loader {
            kernel,
            replaying: BTreeSet::new(),
        }
    }

    /// Materializes the jig at a location, with ban bookkeeping.
    pub fn load(&mut self, location: &str) -> Result<JigRef, Error> {
        check_ban(self.kernel, location)?;
        match self.ensure_jig(location) {
            Ok(jig) => Ok(jig),
            Err(error) => {
                if bannable(&error) {
                    ban(self.kernel, location, &error.to_string());
                }
                Err(error)
            }
        }
    }

    /// Replays a raw transaction provided out of band, trusting it.
    pub fn import(&mut self, rawtx: &[u8]) -> Result<Txid, Error> {
        let txid = Txid::compute(rawtx);
        let fresh_trust = !is_trusted(self.kernel, &txid.to_hex());
        if fresh_trust {
            self.kernel.trust.borrow_mut().insert(txid.to_hex());
        }
        match self.replay_tx(txid, rawtx) {
            Ok(()) => {
                trust_txid(self.kernel, &txid.to_hex());
                Ok(txid)
            }
            Err(error) => {
                if fresh_trust {
                    self.kernel.trust.borrow_mut().remove(&txid.to_hex());
                }
                Err(error)
            }
        }
    }

    /// Follows the spend chain from the jig's location to the tip,
    /// replaying each spending transaction and advancing the jig.
    pub fn sync(&mut self, jig: JigRef) -> Result<(), Error> {
        if self.kernel.record.borrow().is_some() {
            return Err(ExecutionError::SyncInternal.into());
        }
        let origin = self
            .kernel
            .with_creation(jig, |c| c.bindings.origin.to_string());
        loop {
            self.kernel.deadline.get().check("sync")?;
            let location = self.kernel.with_creation(jig, |c| c.bindings.location.clone());
            let (txid, vout) = match location {
                Location::Deployed {
                    txid,
                    slot: Slot::Output(vout),
                    berry: None,
                } => (txid, vout),
                Location::Deployed { .. } => return Ok(()), // deletions and berries are tips
                other => {
                    return Err(ExecutionError::Unavailable(format!("sync of {}", other)).into())
                }
            };
            let spender = self
                .kernel
                .chain
                .spends(&txid, vout)
                .map_err(Error::Adapter)?;
            let spender = match spender {
                Some(spender) => spender,
                None => return Ok(()),
            };
            let rawtx = self.fetch_tx(&spender)?;
            self.replay_tx(spender, &rawtx)?;

            // Adopt the successor state produced for our origin.
            let successor = self.find_by_origin(&origin, &spender);
            match successor {
                Some(next) if next != jig => {
                    let (props, bindings, lifecycle) = self.kernel.with_creation(next, |c| {
                        (c.props.clone(), c.bindings.clone(), c.lifecycle.clone())
                    });
                    let location = bindings.location.to_string();
                    self.kernel.with_creation_mut(jig, |c| {
                        c.props = props;
                        c.bindings = bindings;
                        c.lifecycle = lifecycle;
                    });
                    self.kernel.registry.borrow_mut().insert(location, jig);
                }
                _ => {}
            }
            let destroyed = self.kernel.with_creation(jig, |c| c.lifecycle.is_destroyed());
            if destroyed {
                return Ok(());
            }
        }
    }

    fn find_by_origin(&self, origin: &str, txid: &Txid) -> Option<JigRef> {
        let registry = self.kernel.registry.borrow();
        let prefix = txid.to_hex();
        for (location, jig) in registry.iter() {
            if location.starts_with(&prefix) {
                let matches = self
                    .kernel
                    .with_creation(*jig, |c| c.bindings.origin.to_string() == origin);
                if matches {
                    return Some(*jig);
                }
            }
        }
        None
    }

    // ---------------------------------------------------------------
    // Materialization
    // ---------------------------------------------------------------

    /// Returns a live creation for the location, materializing it from
    /// the registry, the cache, a berry pluck, or a full replay.
    fn ensure_jig(&mut self, location: &str) -> Result<JigRef, Error> {
        if let Some(jig) = self.kernel.registry.borrow().get(location).copied() {
            return Ok(jig);
        }
        let parsed = Location::parse(location)?;
        match &parsed {
            Location::Native { name } => self
                .kernel
                .native(name)
                .ok_or_else(|| LoadError::NotFound(location.to_owned()).into()),
            Location::Deployed {
                berry: Some(tail), ..
            } => {
                if let Ok(Some(state)) = self.cached_state(location) {
                    return self.materialize(location, &parsed, &state);
                }
                self.pluck_berry(location, &parsed, tail.clone())
            }
            Location::Deployed { txid, .. } => {
                if let Ok(Some(state)) = self.cached_state(location) {
                    return self.materialize(location, &parsed, &state);
                }
                if self.kernel.options.client {
                    return Err(LoadError::ClientMode(location.to_owned()).into());
                }
                let rawtx = self.fetch_tx(txid)?;
                self.replay_tx(*txid, &rawtx)?;
                if let Some(jig) = self.kernel.registry.borrow().get(location).copied() {
                    return Ok(jig);
                }
                // The replay may register fresh creations rather than
                // reusing prior ones; fall back to the cached state.
                match self.cached_state(location)? {
                    Some(state) => self.materialize(location, &parsed, &state),
                    None => Err(LoadError::NotFound(location.to_owned()).into()),
                }
            }
            _ => Err(LoadError::BadState(format!("cannot load {}", location)).into()),
        }
    }

    fn cached_state(&self, location: &str) -> Result<Option<Json>, Error> {
        let key = format!("{}{}", KEY_JIG, location);
        self.kernel.cache.get(&key).map_err(Error::Adapter)
    }

    fn fetch_tx(&mut self, txid: &Txid) -> Result<Vec<u8>, Error> {
        let key = format!("{}{}", KEY_TX, txid);
        if let Ok(Some(Json::String(hex_tx))) = self.kernel.cache.get(&key) {
            if let Ok(bytes) = hex::decode(&hex_tx) {
                return Ok(bytes);
            }
        }
        self.kernel.deadline.get().check("load")?;
        let rawtx = self.kernel.chain.fetch(txid).map_err(Error::Adapter)?;
        let _ = self.kernel.cache.set(&key, &Json::String(hex::encode(&rawtx)));
        Ok(rawtx)
    }

    /// Builds a fresh creation from a cached (or freshly verified) state.
    fn materialize(
        &mut self,
        location_str: &str,
        location: &Location,
        state: &Json,
    ) -> Result<JigRef, Error> {
        let txid_hex = location
            .txid()
            .map(|t| t.to_hex())
            .ok_or_else(|| LoadError::BadState(format!("{} has no txid", location_str)))?;
        let map = state
            .as_object()
            .ok_or_else(|| LoadError::BadState("state is not an object".to_owned()))?;
        let kind = map
            .get("kind")
            .and_then(Json::as_str)
            .ok_or_else(|| LoadError::BadState("state has no kind".to_owned()))?;
        let version = map.get("version").and_then(Json::as_u64).unwrap_or(0);
        if version != u64::from(PROTOCOL_VERSION) {
            return Err(crate::chain::metadata::MetadataError::UnsupportedVersion(
                version as u8,
            )
            .into());
        }

        // Executing cached code still requires trust in its source.
        if kind == "code" && !is_trusted(self.kernel, &txid_hex) {
            return Err(LoadError::Untrusted(txid_hex).into());
        }

        let origin = map
            .get("origin")
            .and_then(Json::as_str)
            .ok_or_else(|| LoadError::BadState("state has no origin".to_owned()))?;
        let origin = self.resolve_reference(origin, &txid_hex)?;
        // A berry's hashed state cannot contain its own hash; the pinned
        // location is the cache key itself.
        let origin = if kind == "berry" {
            location_str.to_owned()
        } else {
            origin
        };
        let nonce = map
            .get("nonce")
            .and_then(Json::as_u64)
            .ok_or_else(|| LoadError::BadState("state has no nonce".to_owned()))?;
        let owner = match map.get("owner") {
            Some(Json::Null) | None => None,
            Some(value) => Some(Lock::from_json(value)?),
        };
        let satoshis = map.get("satoshis").and_then(Json::as_u64).unwrap_or(0);

        let (creation_kind, rules) = match kind {
            "code" => {
                let manifest = ClassManifest::from_json(
                    map.get("manifest")
                        .ok_or_else(|| LoadError::BadState("code state has no manifest".into()))?,
                )?;
                let deps_json = map.get("deps").cloned().unwrap_or_else(|| json!({}));
                let deps = self.decode_deps(&deps_json, &txid_hex)?;
                let def = self
                    .kernel
                    .realm
                    .borrow()
                    .find_available(&manifest)
                    .ok_or_else(|| InstallError::NotInstalled(manifest.name.clone()))?;
                let parent = match &manifest.parent {
                    Some(name) => Some(deps.get(name).copied().ok_or_else(|| {
                        LoadError::BadState(format!("missing parent dep {}", name))
                    })?),
                    None => match manifest.kind {
                        ClassKind::Jig => self.kernel.native("Jig"),
                        ClassKind::Berry => self.kernel.native("Berry"),
                        ClassKind::Sidekick => None,
                    },
                };
                let rules = match manifest.kind {
                    ClassKind::Jig => Rules::jig_code(),
                    ClassKind::Sidekick => Rules::sidekick_code(),
                    ClassKind::Berry => Rules::berry_code(),
                };
                let code = self
                    .kernel
                    .realm
                    .borrow_mut()
                    .install(def, deps, parent)
                    .map_err(Error::from)?;
                (CreationKind::Code { code }, rules)
            }
            "jig" | "berry" => {
                let class_loc = map
                    .get("class")
                    .and_then(Json::as_str)
                    .ok_or_else(|| LoadError::BadState("state has no class".to_owned()))?;
                let class_loc = self.resolve_reference(class_loc, &txid_hex)?;
                let class = self.ensure_jig(&class_loc)?;
                if kind == "jig" {
                    (CreationKind::Instance { class }, Rules::jig_instance())
                } else {
                    let path = match location {
                        Location::Deployed {
                            berry: Some(tail), ..
                        } => tail.path.clone(),
                        _ => String::new(),
                    };
                    (CreationKind::Berry { class, path }, Rules::berry_instance())
                }
            }
            other => {
                return Err(LoadError::BadState(format!("unknown kind {}", other)).into())
            }
        };

        let props_json = map
            .get("props")
            .ok_or_else(|| LoadError::BadState("state has no props".to_owned()))?;
        let props = self.decode_props(props_json, &txid_hex)?;

        let lifecycle = if location.is_deletion() {
            Lifecycle::Destroyed
        } else {
            Lifecycle::Live
        };
        let jig = JigRef(self.kernel.creations.borrow().len() as u32);
        self.kernel.creations.borrow_mut().push(Creation {
            kind: creation_kind,
            props,
            bindings: Bindings {
                origin: Location::parse(&origin)?,
                location: location.clone(),
                nonce,
                owner,
                satoshis,
            },
            rules,
            lifecycle,
            snapshot: None,
            poison: None,
        });
        self.kernel
            .registry
            .borrow_mut()
            .insert(location_str.to_owned(), jig);
        log::trace!("materialized {}", location_str);
        Ok(jig)
    }

    /// Resolves a state-internal reference: partial locations are
    /// relative to the transaction the state lives in.
    fn resolve_reference(&self, reference: &str, txid_hex: &str) -> Result<String, Error> {
        if reference.starts_with("_o") || reference.starts_with("_d") {
            return Ok(format!("{}{}", txid_hex, reference));
        }
        Ok(reference.to_owned())
    }

    fn decode_props(&mut self, json: &Json, txid_hex: &str) -> Result<ObjectRef, Error> {
        let value = self.decode_value(json, txid_hex)?;
        match value {
            Value::Object(obj) => Ok(obj),
            other => Err(LoadError::BadState(format!(
                "props decoded to {}",
                other.type_name()
            ))
            .into()),
        }
    }

    fn decode_value(&mut self, json: &Json, txid_hex: &str) -> Result<Value, Error> {
        // The hook cannot recurse into `self` (borrow rules), so collect
        // referenced locations first and load them ahead of decoding.
        let mut wanted = Vec::new();
        collect_jig_refs(json, &mut wanted);
        let mut resolved = std::collections::HashMap::new();
        for reference in wanted {
            let reference_str = match reference.as_str() {
                Some(s) => s.to_owned(),
                None => {
                    return Err(CodecError::BadJig(format!(
                        "unsupported jig reference {}",
                        reference
                    ))
                    .into())
                }
            };
            let absolute = self.resolve_reference(&reference_str, txid_hex)?;
            let jig = self.ensure_jig(&absolute)?;
            resolved.insert(reference_str, jig);
        }
        let mut hook = |reference: &Json| -> Result<Value, CodecError> {
            let reference = reference
                .as_str()
                .ok_or_else(|| CodecError::BadJig(reference.to_string()))?;
            resolved
                .get(reference)
                .copied()
                .map(Value::Jig)
                .ok_or_else(|| CodecError::BadJig(reference.to_owned()))
        };
        codec::decode_with(json, &mut hook).map_err(Error::from)
    }

    fn decode_deps(
        &mut self,
        json: &Json,
        txid_hex: &str,
    ) -> Result<std::collections::BTreeMap<String, JigRef>, Error> {
        let value = self.decode_value(json, txid_hex)?;
        let obj = match value {
            Value::Object(obj) => obj,
            _ => return Err(LoadError::BadState("deps is not an object".to_owned()).into()),
        };
        let mut deps = std::collections::BTreeMap::new();
        let pairs: Vec<(String, Value)> = obj
            .borrow()
            .props
            .iter()
            .map(|(k, v)| (k.as_str().to_owned(), v.clone()))
            .collect();
        for (name, value) in pairs {
            match value {
                Value::Jig(jig) => {
                    deps.insert(name, jig);
                }
                other => {
                    return Err(LoadError::BadState(format!(
                        "dep {} is {}",
                        name,
                        other.type_name()
                    ))
                    .into())
                }
            }
        }
        Ok(deps)
    }

    // ---------------------------------------------------------------
    // Berry plucking
    // ---------------------------------------------------------------

    fn pluck_berry(
        &mut self,
        location_str: &str,
        location: &Location,
        tail: BerryTail,
    ) -> Result<JigRef, Error> {
        let base = match location {
            Location::Deployed { txid, slot, .. } => Location::Deployed {
                txid: *txid,
                slot: *slot,
                berry: None,
            },
            _ => return Err(LoadError::BadState("berry without base".to_owned()).into()),
        };
        let class = self.ensure_jig(&base.to_string())?;
        let code = self
            .kernel
            .code_of(class)
            .ok_or_else(|| LoadError::BadState("berry base is not code".to_owned()))?;
        let def = {
            let realm = self.kernel.realm.borrow();
            let slot = realm.slot(code);
            if slot.manifest.kind != ClassKind::Berry {
                return Err(ExecutionError::NotAJigClass(slot.manifest.name.clone()).into());
            }
            slot.def.clone()
        };
        let berry_def = def
            .as_berry()
            .ok_or_else(|| LoadError::BadState("class has no pluck surface".to_owned()))?;

        self.kernel.deadline.get().check("load")?;
        let mut fetch = ChainFetch { kernel: self.kernel };
        let plucked = berry_def.pluck(&tail.path, &mut fetch)?;
        let props = match plucked {
            Value::Object(obj) => obj,
            other => {
                return Err(LoadError::BadState(format!(
                    "pluck returned {}",
                    other.type_name()
                ))
                .into())
            }
        };

        // Pin the plucked state by its canonical hash.
        let state = berry_state(self.kernel, class, &props, &base, &tail)?;
        let hash = sha256(stable_stringify(&state).as_bytes());
        if let Some(expected) = tail.hash {
            if expected != hash {
                log::error!(
                    "berry hash mismatch at {}: expected {} actual {}",
                    location_str,
                    expected,
                    hash
                );
                return Err(LoadError::StateMismatch(location_str.to_owned()).into());
            }
        }
        if let Some(version) = tail.version {
            if version != u32::from(PROTOCOL_VERSION) {
                return Err(crate::chain::metadata::MetadataError::UnsupportedVersion(
                    version as u8,
                )
                .into());
            }
        }

        let full = Location::Deployed {
            txid: base.txid().ok_or_else(|| {
                LoadError::BadState("berry base has no txid".to_owned())
            })?,
            slot: base.slot().ok_or_else(|| {
                LoadError::BadState("berry base has no slot".to_owned())
            })?,
            berry: Some(BerryTail {
                path: tail.path.clone(),
                hash: Some(hash),
                version: Some(u32::from(PROTOCOL_VERSION)),
            }),
        };

        let jig = JigRef(self.kernel.creations.borrow().len() as u32);
        self.kernel.creations.borrow_mut().push(Creation {
            kind: CreationKind::Berry {
                class,
                path: tail.path.clone(),
            },
            props,
            bindings: Bindings {
                origin: full.clone(),
                location: full.clone(),
                nonce: 1,
                owner: None,
                satoshis: 0,
            },
            rules: Rules::berry_instance(),
            lifecycle: Lifecycle::Live,
            snapshot: None,
            poison: None,
        });
        let full_str = full.to_string();
        {
            let mut registry = self.kernel.registry.borrow_mut();
            registry.insert(full_str.clone(), jig);
            if location_str != full_str {
                // Partial berry locations alias the pinned one.
                registry.insert(location_str.to_owned(), jig);
            }
        }
        let key = format!("{}{}", KEY_JIG, full_str);
        let _ = self.kernel.cache.set(&key, &state);
        Ok(jig)
    }

    // ---------------------------------------------------------------
    // Replay
    // ---------------------------------------------------------------

    /// Re-executes a transaction and verifies it byte-for-byte.
    pub(crate) fn replay_tx(&mut self, txid: Txid, rawtx: &[u8]) -> Result<(), Error> {
        let txid_hex = txid.to_hex();
        if self.replaying.contains(&txid_hex) {
            return Err(LoadError::BadState(format!("{} depends on itself", txid_hex)).into());
        }
        self.replaying.insert(txid_hex.clone());
        let result = self.replay_tx_inner(txid, rawtx);
        self.replaying.remove(&txid_hex);
        result
    }

    fn replay_tx_inner(&mut self, txid: Txid, rawtx: &[u8]) -> Result<(), Error> {
        self.kernel.deadline.get().check("replay")?;
        let tx = Transaction::from_bytes(rawtx)?;
        let (anchor_vout, metadata) = Metadata::from_transaction(&tx)?;
        if anchor_vout != 0 {
            return Err(LoadError::MetadataMismatch(
                "anchor must be the first output".to_owned(),
            )
            .into());
        }

        let has_code = metadata
            .exec
            .iter()
            .any(|e| matches!(e.op, ExecOp::Deploy | ExecOp::Upgrade));
        if has_code && !is_trusted(self.kernel, &txid.to_hex()) {
            return Err(LoadError::Untrusted(txid.to_hex()).into());
        }

        // Materialize inputs as fresh creations at their spent locations.
        let mut inputs = Vec::with_capacity(metadata.inputs);
        for input in tx.inputs.iter().take(metadata.inputs) {
            let location = format!("{}_o{}", input.prev_txid, input.prev_vout);
            let state = match self.cached_state(&location)? {
                Some(state) => state,
                None => {
                    // Load (and thereby cache) the prior state first.
                    self.ensure_jig(&location)?;
                    self.cached_state(&location)?
                        .ok_or_else(|| LoadError::NotFound(location.clone()))?
                }
            };
            let parsed = Location::parse(&location)?;
            let jig = self.materialize_fresh(&location, &parsed, &state)?;
            inputs.push(jig);
        }
        let mut refs = Vec::with_capacity(metadata.refs.len());
        for location in &metadata.refs {
            refs.push(self.ensure_jig(location)?);
        }

        if self.kernel.record.borrow().is_some() {
            return Err(ExecutionError::LoadInternal.into());
        }
        *self.kernel.record.borrow_mut() = Some(Record::new(txid.to_hex(), true));

        let result = self.execute_script(&metadata, &inputs, &refs, txid, rawtx);
        if let Err(error) = &result {
            let record = self.kernel.record.borrow_mut().take();
            if let Some(record) = record {
                commit::rollback(self.kernel, &record, &error.to_string());
            }
            return result;
        }
        Ok(())
    }

    fn execute_script(
        &mut self,
        metadata: &Metadata,
        inputs: &[JigRef],
        refs: &[JigRef],
        txid: Txid,
        rawtx: &[u8],
    ) -> Result<(), Error> {
        for entry in &metadata.exec {
            self.kernel.deadline.get().check("replay")?;
            let data = entry
                .data
                .as_array()
                .ok_or_else(|| LoadError::ScriptMismatch("data must be an array".to_owned()))?;
            match entry.op {
                ExecOp::Deploy => {
                    if data.len() % 2 != 0 || data.is_empty() {
                        return Err(LoadError::ScriptMismatch(
                            "deploy data must hold [manifest, props] pairs".to_owned(),
                        )
                        .into());
                    }
                    let mut defs = Vec::with_capacity(data.len() / 2);
                    for pair in data.chunks(2) {
                        let manifest = ClassManifest::from_json(&pair[0])?;
                        let def = self
                            .kernel
                            .realm
                            .borrow()
                            .find_available(&manifest)
                            .ok_or_else(|| InstallError::NotInstalled(manifest.name.clone()))?;
                        let deps_value =
                            self.decode_exec_value(&pair[1], inputs, refs)?;
                        let deps = deps_from_value(&deps_value)?;
                        defs.push((def, deps));
                    }
                    self.kernel.op_deploy(defs)?;
                }
                ExecOp::Upgrade => {
                    if data.len() != 3 {
                        return Err(LoadError::ScriptMismatch(
                            "upgrade data must be [target, manifest, props]".to_owned(),
                        )
                        .into());
                    }
                    let target = self.decode_exec_jig(&data[0], inputs, refs)?;
                    let manifest = ClassManifest::from_json(&data[1])?;
                    let def = self
                        .kernel
                        .realm
                        .borrow()
                        .find_available(&manifest)
                        .ok_or_else(|| InstallError::NotInstalled(manifest.name.clone()))?;
                    let deps_value = self.decode_exec_value(&data[2], inputs, refs)?;
                    let deps = deps_from_value(&deps_value)?;
                    self.kernel.op_upgrade(target, def, deps)?;
                }
                ExecOp::New => {
                    if data.len() != 2 {
                        return Err(LoadError::ScriptMismatch(
                            "new data must be [class, args]".to_owned(),
                        )
                        .into());
                    }
                    let class = self.decode_exec_jig(&data[0], inputs, refs)?;
                    let args = self.decode_exec_args(&data[1], inputs, refs)?;
                    self.kernel.op_new(class, args)?;
                }
                ExecOp::Call => {
                    if data.len() != 3 {
                        return Err(LoadError::ScriptMismatch(
                            "call data must be [target, method, args]".to_owned(),
                        )
                        .into());
                    }
                    let target = self.decode_exec_jig(&data[0], inputs, refs)?;
                    let method = data[1].as_str().ok_or_else(|| {
                        LoadError::ScriptMismatch("method must be a string".to_owned())
                    })?;
                    let args = self.decode_exec_args(&data[2], inputs, refs)?;
                    self.kernel.op_call(target, method, args)?;
                }
            }
        }

        let mut record = self
            .kernel
            .record
            .borrow_mut()
            .take()
            .ok_or_else(|| LoadError::BadState("replay record vanished".to_owned()))?;

        match self.verify_and_apply(metadata, &mut record, txid, rawtx) {
            Ok(()) => Ok(()),
            Err(error) => {
                commit::rollback(self.kernel, &record, &error.to_string());
                Err(error)
            }
        }
    }

    fn verify_and_apply(
        &mut self,
        metadata: &Metadata,
        record: &mut Record,
        txid: Txid,
        rawtx: &[u8],
    ) -> Result<(), Error> {
        // Assign the declared initial owners to creations.
        for (i, jig) in record.creates.clone().iter().enumerate() {
            let declared = metadata.cre.get(i).cloned().unwrap_or(Json::Null);
            let missing = self.kernel.with_creation(*jig, |c| c.bindings.owner.is_none());
            if missing && !declared.is_null() {
                let lock = Lock::from_json(&declared)?;
                self.kernel
                    .with_creation_mut(*jig, |c| c.bindings.owner = Some(lock));
            }
        }

        let closure = commit::close(self.kernel, record)?;
        let (replayed, states) = commit::build_metadata(self.kernel, record, &closure, false)?;
        verify(metadata, &replayed)?;
        commit::apply(self.kernel, record, &closure, &states, txid, rawtx);
        Ok(())
    }

    fn materialize_fresh(
        &mut self,
        location_str: &str,
        location: &Location,
        state: &Json,
    ) -> Result<JigRef, Error> {
        // Inputs get private copies so a failed replay cannot corrupt
        // live jigs; drop any registry entry pointing elsewhere first.
        let previous = self.kernel.registry.borrow_mut().remove(location_str);
        let result = self.materialize(location_str, location, state);
        if result.is_err() {
            if let Some(previous) = previous {
                self.kernel
                    .registry
                    .borrow_mut()
                    .insert(location_str.to_owned(), previous);
            }
        }
        result
    }

    fn decode_exec_jig(
        &mut self,
        json: &Json,
        inputs: &[JigRef],
        refs: &[JigRef],
    ) -> Result<JigRef, Error> {
        let tag = json
            .as_object()
            .and_then(|m| m.get("$jig"))
            .ok_or_else(|| LoadError::ScriptMismatch(format!("expected $jig, got {}", json)))?;
        match self.resolve_exec_ref(tag, inputs, refs)? {
            Value::Jig(jig) => Ok(jig),
            other => Err(LoadError::ScriptMismatch(format!(
                "$jig resolved to {}",
                other.type_name()
            ))
            .into()),
        }
    }

    fn decode_exec_args(
        &mut self,
        json: &Json,
        inputs: &[JigRef],
        refs: &[JigRef],
    ) -> Result<Vec<Value>, Error> {
        match self.decode_exec_value(json, inputs, refs)? {
            Value::Array(arr) => Ok(arr.borrow().elements.clone()),
            other => Err(LoadError::ScriptMismatch(format!(
                "args decoded to {}",
                other.type_name()
            ))
            .into()),
        }
    }

    fn decode_exec_value(
        &mut self,
        json: &Json,
        inputs: &[JigRef],
        refs: &[JigRef],
    ) -> Result<Value, Error> {
        let kernel = self.kernel;
        let mut hook = |reference: &Json| -> Result<Value, CodecError> {
            resolve_exec_ref_inner(kernel, reference, inputs, refs)
        };
        codec::decode_with(json, &mut hook).map_err(Error::from)
    }

    fn resolve_exec_ref(
        &mut self,
        reference: &Json,
        inputs: &[JigRef],
        refs: &[JigRef],
    ) -> Result<Value, Error> {
        resolve_exec_ref_inner(self.kernel, reference, inputs, refs).map_err(Error::from)
    }
}

/// Resolves an exec `$jig` payload: an index into inputs‖refs‖creates,
/// or a native location string.
fn resolve_exec_ref_inner(
    kernel: &Kernel,
    reference: &Json,
    inputs: &[JigRef],
    refs: &[JigRef],
) -> Result<Value, CodecError> {
    if let Some(index) = reference.as_u64() {
        let creates: Vec<JigRef> = kernel
            .record
            .borrow()
            .as_ref()
            .map(|r| r.creates.clone())
            .unwrap_or_default();
        let index = index as usize;
        let total = inputs.len() + refs.len() + creates.len();
        if index < inputs.len() {
            return Ok(Value::Jig(inputs[index]));
        }
        if index < inputs.len() + refs.len() {
            return Ok(Value::Jig(refs[index - inputs.len()]));
        }
        if index < total {
            return Ok(Value::Jig(creates[index - inputs.len() - refs.len()]));
        }
        return Err(CodecError::BadJig(format!("index {} out of range", index)));
    }
    if let Some(location) = reference.as_str() {
        if let Some(name) = location.strip_prefix("native://") {
            if let Some(jig) = kernel.native(name) {
                return Ok(Value::Jig(jig));
            }
        }
        return Err(CodecError::BadJig(location.to_owned()));
    }
    Err(CodecError::BadJig(reference.to_string()))
}

fn deps_from_value(
    value: &Value,
) -> Result<std::collections::BTreeMap<String, JigRef>, Error> {
    let obj = match value {
        Value::Object(obj) => obj,
        other => {
            return Err(
                LoadError::ScriptMismatch(format!("props are {}", other.type_name())).into(),
            )
        }
    };
    let deps_value = obj
        .borrow()
        .props
        .get(&crate::value::PropKey::new("deps"))
        .cloned()
        .unwrap_or_else(Value::object);
    let deps_obj = match deps_value {
        Value::Object(obj) => obj,
        other => {
            return Err(
                LoadError::ScriptMismatch(format!("deps are {}", other.type_name())).into(),
            )
        }
    };
    let mut deps = std::collections::BTreeMap::new();
    let pairs: Vec<(String, Value)> = deps_obj
        .borrow()
        .props
        .iter()
        .map(|(k, v)| (k.as_str().to_owned(), v.clone()))
        .collect();
    for (name, value) in pairs {
        match value {
            Value::Jig(jig) => {
                deps.insert(name, jig);
            }
            other => {
                return Err(LoadError::ScriptMismatch(format!(
                    "dep {} is {}",
                    name,
                    other.type_name()
                ))
                .into())
            }
        }
    }
    Ok(deps)
}

/// Gathers every `$jig` payload inside a state or exec JSON.
fn collect_jig_refs(json: &Json, out: &mut Vec<Json>) {
    match json {
        Json::Object(map) => {
            if map.len() == 1 {
                // Keys inside an `$obj` escape are plain property names,
                // even ones spelled like tags; only their values can hold
                // references.
                if let Some(payload) = map.get("$obj") {
                    if let Some(payload) = payload.as_object() {
                        for value in payload.values() {
                            collect_jig_refs(value, out);
                        }
                        return;
                    }
                }
                if let Some(reference) = map.get("$jig") {
                    out.push(reference.clone());
                    return;
                }
            }
            for value in map.values() {
                collect_jig_refs(value, out);
            }
        }
        Json::Array(items) => {
            for item in items {
                collect_jig_refs(item, out);
            }
        }
        _ => {}
    }
}

/// The canonical state of a berry instance.
fn berry_state(
    kernel: &Kernel,
    class: JigRef,
    props: &ObjectRef,
    base: &Location,
    tail: &BerryTail,
) -> Result<Json, Error> {
    let class_location = kernel.with_creation(class, |c| c.bindings.location.to_string());
    let mut hook = |jig: JigRef| -> Result<Json, CodecError> {
        let location = kernel.with_creation(jig, |c| c.bindings.location.clone());
        match location {
            Location::Deployed { .. } | Location::Native { .. } => {
                Ok(Json::String(location.to_string()))
            }
            other => Err(CodecError::BadJig(format!("berry references {}", other))),
        }
    };
    let props = codec::encode_with(&Value::Object(props.clone()), &mut hook)?;
    Ok(json!({
        "kind": "berry",
        "class": class_location,
        "origin": format!(
            "{}?berry={}",
            base,
            percent_encoding::utf8_percent_encode(&tail.path, BERRY_SET)
        ),
        "nonce": 1,
        "owner": Json::Null,
        "props": props,
        "satoshis": 0,
        "version": PROTOCOL_VERSION,
    }))
}

const BERRY_SET: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Byte-level comparison of declared and replayed metadata.
fn verify(declared: &Metadata, replayed: &Metadata) -> Result<(), Error> {
    if declared.inputs != replayed.inputs {
        return Err(LoadError::MetadataMismatch(format!(
            "in: declared {} replayed {}",
            declared.inputs, replayed.inputs
        ))
        .into());
    }
    if declared.refs != replayed.refs {
        return Err(LoadError::MetadataMismatch(format!(
            "ref: declared {:?} replayed {:?}",
            declared.refs, replayed.refs
        ))
        .into());
    }
    let declared_exec: Vec<Json> = declared
        .exec
        .iter()
        .map(|e| json!({ "op": e.op.as_str(), "data": e.data }))
        .collect();
    let replayed_exec: Vec<Json> = replayed
        .exec
        .iter()
        .map(|e| json!({ "op": e.op.as_str(), "data": e.data }))
        .collect();
    for (i, (a, b)) in declared_exec.iter().zip(&replayed_exec).enumerate() {
        if stable_stringify(a) != stable_stringify(b) {
            log::error!(
                "script mismatch at entry {}: declared {} replayed {}",
                i,
                stable_stringify(a),
                stable_stringify(b)
            );
            return Err(LoadError::ScriptMismatch(format!("entry {}", i)).into());
        }
    }
    if declared_exec.len() != replayed_exec.len() {
        return Err(LoadError::ScriptMismatch(format!(
            "length: declared {} replayed {}",
            declared_exec.len(),
            replayed_exec.len()
        ))
        .into());
    }
    if declared.out != replayed.out {
        log::error!(
            "state mismatch: declared {:?} replayed {:?}",
            declared.out,
            replayed.out
        );
        return Err(LoadError::StateMismatch("out".to_owned()).into());
    }
    if declared.del != replayed.del {
        log::error!(
            "state mismatch: declared {:?} replayed {:?}",
            declared.del,
            replayed.del
        );
        return Err(LoadError::StateMismatch("del".to_owned()).into());
    }
    let declared_cre = stable_stringify(&Json::Array(declared.cre.clone()));
    let replayed_cre = stable_stringify(&Json::Array(replayed.cre.clone()));
    if declared_cre != replayed_cre {
        return Err(LoadError::MetadataMismatch(format!(
            "cre: declared {} replayed {}",
            declared_cre, replayed_cre
        ))
        .into());
    }
    Ok(())
}

/// The fetch capability handed to berry classes.
struct ChainFetch<'k> {
    kernel: &'k Kernel,
}

impl BerryFetch for ChainFetch<'_> {
    fn fetch(&mut self, txid: &str) -> Result<Value, Error> {
        let txid: Txid = txid
            .parse()
            .map_err(|e: crate::crypto::ParseHashError| Error::from(e))?;
        let rawtx = self.kernel.chain.fetch(&txid).map_err(Error::Adapter)?;
        Ok(Value::String(hex::encode(rawtx)))
    }
}
