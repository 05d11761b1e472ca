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

//! Converts a closed record into a transaction.
//!
//! Closing resolves the input/reference/output/delete sets and checks the
//! record's worldview; building renders the exec script, the metadata and
//! the raw transaction; publishing pays, signs, broadcasts and patches
//! the participants. The same close/build path re-runs during replay, so
//! a loaded transaction verifies by byte comparison against what this
//! module would have produced.

use std::collections::HashMap;

use serde_json::{json, Value as Json};

use crate::bindings::{Location, Lock, Slot};
use crate::chain::adapters::{BroadcastFailure, Parent, KEY_JIG, KEY_SPEND, KEY_TX};
use crate::chain::metadata::{ExecEntry, ExecOp, Metadata, PROTOCOL_VERSION};
use crate::chain::script;
use crate::chain::transaction::{Transaction, TxIn, TxOut};
use crate::codec::{self, CodecError};
use crate::crypto::{sha256, Hash, Txid};
use crate::helpers::stable_stringify;
use crate::runtime::record::{Action, Record};
use crate::runtime::{CreationKind, ExecutionError, Kernel, Lifecycle};
use crate::value::{ArrayRef, JigRef, ObjectRef, PropKey, Value};
use crate::Error;

/// Satoshis floor applied to jig outputs so they relay.
pub const DUST: u64 = 546;

/// The resolved shape of a closed record.
#[derive(Debug)]
pub(crate) struct Closure {
    pub inputs: Vec<JigRef>,
    pub refs: Vec<JigRef>,
    pub creates: Vec<JigRef>,
    pub outputs: Vec<JigRef>,
    pub deletes: Vec<JigRef>,
    /// The `$jig` index space: inputs, refs, creates.
    pub space: Vec<JigRef>,
    /// Partial locations (`_o<i>` / `_d<i>`) for jigs located in this
    /// transaction, used inside hashed states.
    pub partials: HashMap<JigRef, String>,
}

/// Resolves the record's sets and checks its worldview. Jigs referenced
/// only through action arguments are folded into the read set first.
pub(crate) fn close(kernel: &Kernel, record: &mut Record) -> Result<Closure, Error> {
    let mut arg_jigs = Vec::new();
    for action in &record.actions {
        match action {
            Action::New { args, .. } | Action::Call { args, .. } => {
                for arg in args {
                    collect_jigs(arg, &mut arg_jigs, &mut Vec::new());
                }
            }
            _ => {}
        }
    }
    for jig in arg_jigs {
        let recordable = kernel.with_creation(jig, |c| c.rules.recordable_target);
        if recordable && !record.touched.contains(&jig) {
            record.read(jig);
        }
    }

    check_worldview(kernel, record)?;

    let inputs = record.inputs();
    let refs = record.refs();
    let creates = record.creates.clone();
    let outputs = record.outputs();
    let deletes = record.deletes.clone();
    let space = record.jig_space();

    let mut partials = HashMap::new();
    for (i, jig) in outputs.iter().enumerate() {
        partials.insert(*jig, format!("_o{}", i + 1));
    }
    for (i, jig) in deletes.iter().enumerate() {
        partials.insert(*jig, format!("_d{}", i));
    }

    Ok(Closure {
        inputs,
        refs,
        creates,
        outputs,
        deletes,
        space,
        partials,
    })
}

/// Every referenced jig resolving to the same origin must agree on its
/// location.
fn check_worldview(kernel: &Kernel, record: &Record) -> Result<(), Error> {
    let mut seen: HashMap<String, (String, JigRef)> = HashMap::new();
    let participants: Vec<JigRef> = record
        .touched
        .iter()
        .copied()
        .filter(|jig| !record.is_created(*jig))
        .collect();
    for jig in participants {
        let (origin, location) = kernel.with_creation(jig, |c| {
            (c.bindings.origin.clone(), c.bindings.location.clone())
        });
        if !origin.is_deployed() {
            continue;
        }
        let origin = origin.to_string();
        let location = location.to_string();
        if let Some((existing, _)) = seen.get(&origin) {
            if *existing != location {
                return Err(ExecutionError::InconsistentWorldview(format!(
                    "{} resolves to both {} and {}",
                    origin, existing, location
                ))
                .into());
            }
        } else {
            seen.insert(origin, (location, jig));
        }
    }
    Ok(())
}

fn collect_jigs(value: &Value, out: &mut Vec<JigRef>, seen: &mut Vec<usize>) {
    if let Some(ptr) = value.ptr_id() {
        if seen.contains(&ptr) {
            return;
        }
        seen.push(ptr);
    }
    match value {
        Value::Jig(jig) => {
            if !out.contains(jig) {
                out.push(*jig);
            }
        }
        Value::Object(obj) => {
            let values: Vec<Value> = obj.borrow().props.values().cloned().collect();
            for v in &values {
                collect_jigs(v, out, seen);
            }
        }
        Value::Array(arr) => {
            let values: Vec<Value> = {
                let data = arr.borrow();
                data.elements
                    .iter()
                    .chain(data.extras.values())
                    .cloned()
                    .collect()
            };
            for v in &values {
                collect_jigs(v, out, seen);
            }
        }
        Value::Set(set) => {
            let values: Vec<Value> = {
                let data = set.borrow();
                data.entries.iter().chain(data.props.values()).cloned().collect()
            };
            for v in &values {
                collect_jigs(v, out, seen);
            }
        }
        Value::Map(map) => {
            let values: Vec<Value> = {
                let data = map.borrow();
                data.entries
                    .iter()
                    .flat_map(|(k, v)| vec![k.clone(), v.clone()])
                    .chain(data.props.values().cloned())
                    .collect()
            };
            for v in &values {
                collect_jigs(v, out, seen);
            }
        }
        _ => {}
    }
}

/// Renders a jig reference for an exec payload: its index in the `$jig`
/// space, or a native location.
fn exec_jig_hook<'a>(
    kernel: &'a Kernel,
    index: &HashMap<JigRef, usize>,
) -> impl Fn(JigRef) -> Result<Json, CodecError> + 'a {
    let index = index.clone();
    move |jig: JigRef| {
        if let Some(i) = index.get(&jig) {
            return Ok(json!(i));
        }
        let native = kernel.with_creation(jig, |c| match &c.kind {
            CreationKind::Native { name } => Some(format!("native://{}", name)),
            _ => None,
        });
        match native {
            Some(loc) => Ok(Json::String(loc)),
            None => Err(CodecError::BadJig(format!(
                "creation {} is outside the transaction",
                jig.0
            ))),
        }
    }
}

/// Builds the metadata record plus the hashed state of every output and
/// deleted jig. When `assign_owners` is set, creations without an owner
/// get one from the owner plugin.
pub(crate) fn build_metadata(
    kernel: &Kernel,
    record: &Record,
    closure: &Closure,
    assign_owners: bool,
) -> Result<(Metadata, HashMap<JigRef, Json>), Error> {
    if assign_owners {
        for jig in &closure.creates {
            let missing = kernel.with_creation(*jig, |c| c.bindings.owner.is_none());
            if missing {
                kernel.deadline.get().check("publish")?;
                let lock = kernel.owner.next_owner().map_err(Error::Adapter)?;
                kernel.with_creation_mut(*jig, |c| c.bindings.owner = Some(lock));
            }
        }
    }

    let index: HashMap<JigRef, usize> = closure
        .space
        .iter()
        .enumerate()
        .map(|(i, jig)| (*jig, i))
        .collect();

    let mut exec = Vec::with_capacity(record.actions.len());
    for action in &record.actions {
        exec.push(encode_action(kernel, action, &index)?);
    }

    let refs: Vec<String> = closure
        .refs
        .iter()
        .map(|jig| kernel.with_creation(*jig, |c| c.bindings.location.to_string()))
        .collect();

    let mut states = HashMap::new();
    let mut out = Vec::with_capacity(closure.outputs.len());
    for jig in &closure.outputs {
        let state = state_json(kernel, *jig, &closure.partials)?;
        out.push(hash_state(&state));
        states.insert(*jig, state);
    }
    let mut del = Vec::with_capacity(closure.deletes.len());
    for jig in &closure.deletes {
        let state = state_json(kernel, *jig, &closure.partials)?;
        del.push(hash_state(&state));
        states.insert(*jig, state);
    }

    let mut cre = Vec::with_capacity(closure.creates.len());
    for jig in &closure.creates {
        let owner = kernel.with_creation(*jig, |c| c.bindings.owner.clone());
        match owner {
            Some(lock) => cre.push(lock.to_json()),
            // A jig created and destroyed in one record never binds.
            None if closure.deletes.contains(jig) => cre.push(Json::Null),
            None => {
                return Err(crate::bindings::BindingError::Owner(
                    "creation has no owner".to_owned(),
                )
                .into())
            }
        }
    }

    let metadata = Metadata {
        version: PROTOCOL_VERSION,
        app: kernel.options.app.clone(),
        inputs: closure.inputs.len(),
        refs,
        out,
        del,
        cre,
        exec,
    };
    Ok((metadata, states))
}

fn encode_action(
    kernel: &Kernel,
    action: &Action,
    index: &HashMap<JigRef, usize>,
) -> Result<ExecEntry, Error> {
    let hook = exec_jig_hook(kernel, index);
    let jig_tag = |jig: JigRef| -> Result<Json, Error> {
        Ok(json!({ "$jig": hook(jig).map_err(Error::from)? }))
    };
    let encode_args = |args: &[Value]| -> Result<Json, Error> {
        let arr = ArrayRef::default();
        arr.borrow_mut().elements.extend(args.iter().cloned());
        let mut h = |jig: JigRef| hook(jig);
        codec::encode_with(&Value::Array(arr), &mut h).map_err(Error::from)
    };

    let entry = match action {
        Action::Deploy { codes } => {
            let mut data = Vec::with_capacity(codes.len() * 2);
            for code_jig in codes {
                let (manifest, deps) = code_details(kernel, *code_jig)?;
                data.push(manifest);
                let mut h = |jig: JigRef| hook(jig);
                data.push(codec::encode_with(&deps, &mut h).map_err(Error::from)?);
            }
            ExecEntry {
                op: ExecOp::Deploy,
                data: Json::Array(data),
            }
        }
        Action::Upgrade { code } => {
            let (manifest, deps) = code_details(kernel, *code)?;
            let mut h = |jig: JigRef| hook(jig);
            let props = codec::encode_with(&deps, &mut h).map_err(Error::from)?;
            ExecEntry {
                op: ExecOp::Upgrade,
                data: Json::Array(vec![jig_tag(*code)?, manifest, props]),
            }
        }
        Action::New { class, args, .. } => ExecEntry {
            op: ExecOp::New,
            data: Json::Array(vec![jig_tag(*class)?, encode_args(args)?]),
        },
        Action::Call {
            target,
            method,
            args,
        } => ExecEntry {
            op: ExecOp::Call,
            data: Json::Array(vec![
                jig_tag(*target)?,
                Json::String(method.clone()),
                encode_args(args)?,
            ]),
        },
    };
    Ok(entry)
}

/// The manifest and dependency table of a code jig.
fn code_details(kernel: &Kernel, code_jig: JigRef) -> Result<(Json, Value), Error> {
    let code = kernel
        .code_of(code_jig)
        .ok_or_else(|| ExecutionError::NotAJigClass(format!("creation {}", code_jig.0)))?;
    let realm = kernel.realm.borrow();
    let slot = realm.slot(code);
    let manifest = slot.manifest.to_json();
    let deps_obj = ObjectRef::default();
    for (name, dep) in &slot.deps {
        deps_obj
            .borrow_mut()
            .props
            .insert(PropKey::new(name.clone()), Value::Jig(*dep));
    }
    let props = ObjectRef::default();
    props
        .borrow_mut()
        .props
        .insert(PropKey::new("deps"), Value::Object(deps_obj));
    Ok((manifest, Value::Object(props)))
}

/// The canonical hashed state of a jig after this commit.
///
/// Jig references inside the state render as absolute locations, or as
/// partial `_o<i>`/`_d<i>` forms for jigs located in the same
/// transaction (the txid cannot appear in data the txid depends on).
pub(crate) fn state_json(
    kernel: &Kernel,
    jig: JigRef,
    partials: &HashMap<JigRef, String>,
) -> Result<Json, Error> {
    let kind = kernel.with_creation(jig, |c| c.kind.clone());
    let deleted = partials
        .get(&jig)
        .map(|p| p.starts_with("_d"))
        .unwrap_or(false);

    let mut hook = |target: JigRef| -> Result<Json, CodecError> {
        Ok(Json::String(reference_location(kernel, target, partials)?))
    };

    let props_value = kernel.with_creation(jig, |c| Value::Object(c.props.clone()));
    let props = codec::encode_with(&props_value, &mut hook)?;

    let (origin, nonce, owner, satoshis) = kernel.with_creation(jig, |c| {
        (
            c.bindings.origin.clone(),
            c.bindings.nonce,
            c.bindings.owner.clone(),
            c.bindings.satoshis,
        )
    });
    let origin = match partials.get(&jig) {
        // A jig created in this transaction: origin is its own slot.
        Some(partial) if !origin.is_deployed() => partial.clone(),
        _ => origin.to_string(),
    };

    let mut state = json!({
        "kind": match &kind {
            CreationKind::Code { .. } => "code",
            CreationKind::Instance { .. } => "jig",
            CreationKind::Berry { .. } => "berry",
            CreationKind::Native { name } => {
                return Err(ExecutionError::Unavailable(format!("state of {}", name)).into())
            }
        },
        "origin": origin,
        "nonce": nonce + 1,
        "owner": if deleted {
            Json::Null
        } else {
            match owner {
                Some(lock) => lock.to_json(),
                None => Json::Null,
            }
        },
        "satoshis": if deleted { 0 } else { satoshis },
        "props": props,
        "version": PROTOCOL_VERSION,
    });
    match kind {
        CreationKind::Code { code } => {
            let (manifest, deps) = {
                let realm = kernel.realm.borrow();
                let slot = realm.slot(code);
                let deps_obj = ObjectRef::default();
                for (name, dep) in &slot.deps {
                    deps_obj
                        .borrow_mut()
                        .props
                        .insert(PropKey::new(name.clone()), Value::Jig(*dep));
                }
                (slot.manifest.to_json(), Value::Object(deps_obj))
            };
            state["manifest"] = manifest;
            state["deps"] = codec::encode_with(&deps, &mut hook)?;
        }
        CreationKind::Instance { class } | CreationKind::Berry { class, .. } => {
            state["class"] = Json::String(
                reference_location(kernel, class, partials).map_err(Error::from)?,
            );
        }
        CreationKind::Native { .. } => {}
    }
    Ok(state)
}

fn reference_location(
    kernel: &Kernel,
    jig: JigRef,
    partials: &HashMap<JigRef, String>,
) -> Result<String, CodecError> {
    if let Some(partial) = partials.get(&jig) {
        return Ok(partial.clone());
    }
    let location = kernel.with_creation(jig, |c| c.bindings.location.clone());
    match location {
        Location::Deployed { .. } | Location::Native { .. } => Ok(location.to_string()),
        other => Err(CodecError::BadJig(format!(
            "reference to unbound location {}",
            other
        ))),
    }
}

/// Hash of the canonical state bytes.
pub(crate) fn hash_state(state: &Json) -> Hash {
    sha256(stable_stringify(state).as_bytes())
}

/// Builds the unsigned transaction: the anchor output, one output per
/// surviving jig, and one input per spent jig.
pub(crate) fn build_tx(
    kernel: &Kernel,
    closure: &Closure,
    metadata: &Metadata,
) -> Result<(Transaction, Vec<Parent>, Vec<Option<Lock>>), Error> {
    let mut tx = Transaction::new();
    tx.outputs.push(TxOut {
        satoshis: 0,
        script: metadata.to_script(),
    });
    for jig in &closure.outputs {
        let (owner, satoshis) =
            kernel.with_creation(*jig, |c| (c.bindings.owner.clone(), c.bindings.satoshis));
        let lock = owner.ok_or_else(|| {
            crate::bindings::BindingError::Owner("output jig has no owner".to_owned())
        })?;
        tx.outputs.push(TxOut {
            satoshis: satoshis.max(DUST),
            script: lock.script(),
        });
    }

    let mut parents = Vec::with_capacity(closure.inputs.len());
    let mut locks = Vec::with_capacity(closure.inputs.len());
    for jig in &closure.inputs {
        // The spent output is the state before this record.
        let prior = kernel.with_creation(*jig, |c| {
            c.snapshot
                .as_ref()
                .map(|s| s.bindings.clone())
                .unwrap_or_else(|| c.bindings.clone())
        });
        let (txid, vout) = match &prior.location {
            Location::Deployed {
                txid,
                slot: Slot::Output(vout),
                ..
            } => (*txid, *vout),
            other => {
                return Err(crate::bindings::BindingError::Location(format!(
                    "{} (cannot spend)",
                    other
                ))
                .into())
            }
        };
        let lock = prior.owner.clone().ok_or_else(|| {
            crate::bindings::BindingError::Owner("input jig has no owner".to_owned())
        })?;
        tx.inputs.push(TxIn::unsigned(txid, vout));
        parents.push(Parent {
            script: lock.script(),
            satoshis: prior.satoshis.max(DUST),
        });
        locks.push(Some(lock));
    }
    Ok((tx, parents, locks))
}

/// Pays, signs and serializes the open record's transaction without
/// broadcasting it.
pub(crate) fn export(kernel: &Kernel, record: &mut Record) -> Result<Vec<u8>, Error> {
    let closure = close(kernel, record)?;
    let (metadata, _states) = build_metadata(kernel, record, &closure, true)?;
    let (tx, parents, locks) = build_tx(kernel, &closure, &metadata)?;
    pay_and_sign(kernel, &tx, &parents, &locks)
}

fn pay_and_sign(
    kernel: &Kernel,
    tx: &Transaction,
    parents: &[Parent],
    locks: &[Option<Lock>],
) -> Result<Vec<u8>, Error> {
    let rawtx = tx.to_bytes();
    kernel.deadline.get().check("publish")?;
    let paid = kernel.purse.pay(&rawtx, parents).map_err(Error::Adapter)?;
    kernel.deadline.get().check("publish")?;
    let signed = kernel
        .owner
        .sign(&paid, parents, locks)
        .map_err(Error::Adapter)?;
    Ok(signed)
}

/// Publishes a closed record: build, pay, sign, broadcast, then patch
/// the participants. Rolls the record back on failure.
pub(crate) fn publish(kernel: &Kernel, mut record: Record) -> Result<Txid, Error> {
    match publish_inner(kernel, &mut record) {
        Ok(txid) => Ok(txid),
        Err(error) => {
            rollback(kernel, &record, &error.to_string());
            Err(error)
        }
    }
}

fn publish_inner(kernel: &Kernel, record: &mut Record) -> Result<Txid, Error> {
    let closure = close(kernel, record)?;
    let (metadata, states) = build_metadata(kernel, record, &closure, true)?;
    let (tx, parents, locks) = build_tx(kernel, &closure, &metadata)?;
    let signed = pay_and_sign(kernel, &tx, &parents, &locks)?;

    kernel.deadline.get().check("publish")?;
    let txid = match kernel.chain.broadcast(&signed) {
        Ok(txid) => txid,
        Err(e) => return Err(BroadcastFailure::classify(&e.to_string()).into()),
    };
    log::info!(
        "published {} ({} in, {} out, {} del)",
        txid,
        closure.inputs.len(),
        closure.outputs.len(),
        closure.deletes.len()
    );

    apply(kernel, record, &closure, &states, txid, &signed);
    Ok(txid)
}

/// Patches bindings, lifecycles, the registry and the cache after a
/// transaction is known on-chain. Shared by publish and replay.
pub(crate) fn apply(
    kernel: &Kernel,
    record: &Record,
    closure: &Closure,
    states: &HashMap<JigRef, Json>,
    txid: Txid,
    rawtx: &[u8],
) {
    let mut old_locations = Vec::new();
    for jig in &closure.inputs {
        let old = kernel.with_creation(*jig, |c| {
            c.snapshot
                .as_ref()
                .map(|s| s.bindings.location.to_string())
                .unwrap_or_else(|| c.bindings.location.to_string())
        });
        old_locations.push(old);
    }

    for (i, jig) in closure.outputs.iter().enumerate() {
        let location = Location::Deployed {
            txid,
            slot: Slot::Output(i as u32 + 1),
            berry: None,
        };
        kernel.with_creation_mut(*jig, |c| {
            if !c.bindings.origin.is_deployed() {
                c.bindings.origin = location.clone();
            }
            c.bindings.location = location.clone();
            c.bindings.nonce += 1;
            c.lifecycle = Lifecycle::Live;
            c.snapshot = None;
        });
    }
    for (i, jig) in closure.deletes.iter().enumerate() {
        let location = Location::Deployed {
            txid,
            slot: Slot::Deletion(i as u32),
            berry: None,
        };
        kernel.with_creation_mut(*jig, |c| {
            if !c.bindings.origin.is_deployed() {
                c.bindings.origin = location.clone();
            }
            c.bindings.location = location;
            c.bindings.nonce += 1;
            c.bindings.owner = None;
            c.bindings.satoshis = 0;
            c.lifecycle = Lifecycle::Destroyed;
            c.snapshot = None;
        });
    }
    // Reads keep their snapshots only while the record is open.
    for jig in &record.touched {
        kernel.with_creation_mut(*jig, |c| c.snapshot = None);
    }

    {
        let mut registry = kernel.registry.borrow_mut();
        for old in &old_locations {
            registry.remove(old);
        }
        for jig in closure.outputs.iter().chain(&closure.deletes) {
            let location = kernel.with_creation(*jig, |c| c.bindings.location.to_string());
            registry.insert(location, *jig);
        }
    }

    // Trust our own code-bearing transactions.
    let has_code = record
        .actions
        .iter()
        .any(|a| matches!(a, Action::Deploy { .. } | Action::Upgrade { .. }));
    if has_code {
        kernel.trust.borrow_mut().insert(txid.to_hex());
    }

    // Cache writes are best-effort.
    let cache = &kernel.cache;
    let tx_key = format!("{}{}", KEY_TX, txid);
    if let Err(e) = cache.set(&tx_key, &Json::String(hex::encode(rawtx))) {
        log::warn!("cache write failed for {}: {}", tx_key, e);
    }
    for jig in closure.outputs.iter().chain(&closure.deletes) {
        if let Some(state) = states.get(jig) {
            let location = kernel.with_creation(*jig, |c| c.bindings.location.to_string());
            let key = format!("{}{}", KEY_JIG, location);
            if let Err(e) = cache.set(&key, state) {
                log::warn!("cache write failed for {}: {}", key, e);
            }
        }
    }
    for old in &old_locations {
        let key = format!("{}{}", KEY_SPEND, old);
        if let Err(e) = cache.set(&key, &Json::String(txid.to_hex())) {
            log::warn!("cache write failed for {}: {}", key, e);
        }
    }
}

/// Reverts every enrolled participant to its pre-record state. Jigs
/// created inside the record have no prior state; they are poisoned so
/// stale references fail loudly.
pub(crate) fn rollback(kernel: &Kernel, record: &Record, reason: &str) {
    log::warn!("rolling back record {}: {}", record.id, reason);
    for jig in record.touched.iter().chain(&record.creates) {
        kernel.with_creation_mut(*jig, |c| {
            if let Some(snapshot) = c.snapshot.take() {
                c.props = snapshot.props;
                c.bindings = snapshot.bindings;
                c.lifecycle = snapshot.lifecycle;
            } else if record.creates.contains(jig) && c.poison.is_none() {
                c.poison = Some(reason.to_owned());
                c.lifecycle = Lifecycle::Poisoned;
            }
        });
    }
}
