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

//! The execution kernel: the creation arena, the active record, and the
//! deploy/new/call/auth/destroy/upgrade operations.
//!
//! Every top-level entry opens a record (unless a batch is already open),
//! performs its operations through the membrane, and commits the record
//! as one transaction on return. Values crossing a jig boundary (method
//! arguments and foreign reads) are deep-copied, so no live graph is
//! ever shared between two jigs or with the host.

pub(crate) mod commit;
pub mod lifecycle;
pub mod queue;
pub(crate) mod record;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;

use crate::bindings::{Bindings, Location, Slot};
use crate::chain::adapters::{Blockchain, Cache, Owner, Purse};
use crate::helpers::Deadline;
use crate::membrane::rules::Rules;
use crate::sandbox::{
    ClassImpl, ClassKind, CodeId, MethodScope, MethodTarget, Realm, BANNED_GLOBALS,
};
use crate::value::{JigRef, ObjectRef, Value};
use crate::{Error, Options};

pub use self::commit::DUST;
pub use self::lifecycle::Lifecycle;
pub(crate) use self::record::{Action, Frame, Record};

/// Execution and ownership failures raised by kernel operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// A banned non-deterministic capability was requested by name.
    #[error("{0} is not defined (disabled because non-deterministic)")]
    Banned(String),
    /// A dependency name did not resolve.
    #[error("{0} is not defined")]
    NotDefined(String),
    /// The method is disabled for direct calls.
    #[error("{0} disabled")]
    MethodDisabled(String),
    /// `sync` may not be called from inside jig code.
    #[error("sync cannot be called internally")]
    SyncInternal,
    /// `load` may not be called from inside jig code.
    #[error("load cannot be called internally")]
    LoadInternal,
    /// The operation is not available for this creation kind or state.
    #[error("{0} unavailable")]
    Unavailable(String),
    /// `new` was applied to something that is not a jig class.
    #[error("not a jig class: {0}")]
    NotAJigClass(String),
    /// A jig reference was expected.
    #[error("not a jig: {0}")]
    NotAJig(String),
    /// No class in the hierarchy defines the method.
    #[error("Cannot call {0}: method not found")]
    MethodNotFound(String),
    /// Auth was attempted on a destroyed jig.
    #[error("Cannot auth destroyed jig")]
    AuthDestroyed,
    /// Upgrade was attempted on a destroyed jig.
    #[error("Cannot upgrade destroyed jig")]
    UpgradeDestroyed,
    /// The operation targets a destroyed jig.
    #[error("Cannot {0}: jig destroyed")]
    Destroyed(String),
    /// Two referenced jigs of the same origin presented different
    /// locations within one action.
    #[error("Inconsistent worldview: {0}")]
    InconsistentWorldview(String),
    /// An application-defined method failure.
    #[error("{0}")]
    Custom(String),
}

/// What a creation is.
#[derive(Debug, Clone)]
pub(crate) enum CreationKind {
    /// A deployed class (jig class, sidekick or berry class).
    Code { code: CodeId },
    /// An instance of a jig class.
    Instance { class: JigRef },
    /// A value plucked by a berry class.
    Berry { class: JigRef, path: String },
    /// A built-in primitive.
    Native { name: String },
}

/// Pre-record state retained for rollback.
#[derive(Debug)]
pub(crate) struct Snapshot {
    pub props: ObjectRef,
    pub bindings: Bindings,
    pub lifecycle: Lifecycle,
}

/// One slot of the creation arena.
#[derive(Debug)]
pub(crate) struct Creation {
    pub kind: CreationKind,
    pub props: ObjectRef,
    pub bindings: Bindings,
    pub rules: Rules,
    pub lifecycle: Lifecycle,
    pub snapshot: Option<Snapshot>,
    pub poison: Option<String>,
}

/// The shared kernel state behind one instance.
pub(crate) struct Kernel {
    pub creations: RefCell<Vec<Creation>>,
    pub realm: RefCell<Realm>,
    pub record: RefCell<Option<Record>>,
    pub trust: RefCell<BTreeSet<String>>,
    pub bans: RefCell<BTreeMap<String, String>>,
    /// Live registry: location string to creation.
    pub registry: RefCell<HashMap<String, JigRef>>,
    pub chain: Box<dyn Blockchain>,
    pub cache: Box<dyn Cache>,
    pub purse: Box<dyn Purse>,
    pub owner: Box<dyn Owner>,
    pub options: Options,
    pub queue: queue::SerialQueue,
    pub deadline: Cell<Deadline>,
    next_record: Cell<u64>,
}

/// Names of the built-in primitives, installed in this order.
pub(crate) const NATIVE_NAMES: &[&str] = &["Jig", "Berry", "Creation", "CommonLock"];

impl Kernel {
    /// Builds a kernel with the native primitives installed.
    pub fn new(
        chain: Box<dyn Blockchain>,
        cache: Box<dyn Cache>,
        purse: Box<dyn Purse>,
        owner: Box<dyn Owner>,
        options: Options,
    ) -> Kernel {
        let kernel = Kernel {
            creations: RefCell::new(Vec::new()),
            realm: RefCell::new(Realm::new()),
            record: RefCell::new(None),
            trust: RefCell::new(options.trust.iter().cloned().collect()),
            bans: RefCell::new(BTreeMap::new()),
            registry: RefCell::new(HashMap::new()),
            chain,
            cache,
            purse,
            owner,
            options,
            queue: queue::SerialQueue::new(),
            deadline: Cell::new(Deadline::unlimited()),
            next_record: Cell::new(1),
        };
        for name in NATIVE_NAMES {
            let jig = JigRef(kernel.creations.borrow().len() as u32);
            kernel.creations.borrow_mut().push(Creation {
                kind: CreationKind::Native {
                    name: (*name).to_owned(),
                },
                props: ObjectRef::default(),
                bindings: Bindings::native(name),
                rules: Rules::native_code(),
                lifecycle: Lifecycle::Live,
                snapshot: None,
                poison: None,
            });
            kernel
                .registry
                .borrow_mut()
                .insert(format!("native://{}", name), jig);
        }
        kernel
    }

    // ---------------------------------------------------------------
    // Arena access
    // ---------------------------------------------------------------

    pub fn with_creation<R>(&self, jig: JigRef, f: impl FnOnce(&Creation) -> R) -> R {
        f(&self.creations.borrow()[jig.0 as usize])
    }

    pub fn with_creation_mut<R>(&self, jig: JigRef, f: impl FnOnce(&mut Creation) -> R) -> R {
        f(&mut self.creations.borrow_mut()[jig.0 as usize])
    }

    /// The native primitive with the given name.
    pub fn native(&self, name: &str) -> Option<JigRef> {
        self.registry
            .borrow()
            .get(&format!("native://{}", name))
            .copied()
    }

    /// The class jig of an instance or berry; a code jig is its own class.
    pub fn class_of(&self, jig: JigRef) -> Option<JigRef> {
        self.with_creation(jig, |c| match &c.kind {
            CreationKind::Code { .. } => Some(jig),
            CreationKind::Instance { class } | CreationKind::Berry { class, .. } => Some(*class),
            CreationKind::Native { .. } => None,
        })
    }

    /// The realm slot of a code jig.
    pub fn code_of(&self, jig: JigRef) -> Option<CodeId> {
        self.with_creation(jig, |c| match &c.kind {
            CreationKind::Code { code } => Some(*code),
            _ => None,
        })
    }

    /// Walks a class's parent chain, starting at the class itself and
    /// stopping at native primitives.
    pub fn class_chain(&self, class: JigRef) -> Vec<JigRef> {
        let mut chain = Vec::new();
        let mut cursor = Some(class);
        while let Some(jig) = cursor {
            chain.push(jig);
            cursor = match self.code_of(jig) {
                Some(code) => {
                    let parent = self.realm.borrow().slot(code).parent;
                    // Native parents terminate the walk.
                    parent.filter(|p| self.code_of(*p).is_some())
                }
                None => None,
            };
        }
        chain
    }

    /// Whether code of `class` may see private members of `target`.
    pub fn class_has_access(&self, class: JigRef, target: JigRef) -> bool {
        match self.class_of(target) {
            Some(target_class) => self.class_chain(target_class).contains(&class),
            None => false,
        }
    }

    // ---------------------------------------------------------------
    // Record plumbing
    // ---------------------------------------------------------------

    fn fresh_record_id(&self) -> String {
        let n = self.next_record.get();
        self.next_record.set(n + 1);
        format!("{:064x}", n)
    }

    /// Opens an automatic record if none is active. Returns whether this
    /// call opened it (and thus owns its commit).
    fn ensure_record(&self) -> bool {
        let mut record = self.record.borrow_mut();
        if record.is_none() {
            *record = Some(Record::new(self.fresh_record_id(), false));
            true
        } else {
            false
        }
    }

    /// Opens a manual (batch) record.
    pub fn begin_batch(&self) -> Result<(), Error> {
        let mut record = self.record.borrow_mut();
        if record.is_some() {
            return Err(ExecutionError::Unavailable("transaction".to_owned()).into());
        }
        *record = Some(Record::new(self.fresh_record_id(), true));
        Ok(())
    }

    /// Publishes the open batch record.
    pub fn publish_batch(&self) -> Result<crate::crypto::Txid, Error> {
        let record = self
            .record
            .borrow_mut()
            .take()
            .ok_or_else(|| ExecutionError::Unavailable("publish".to_owned()))?;
        if !record.manual {
            // Not reachable through the public surface.
            return Err(ExecutionError::Unavailable("publish".to_owned()).into());
        }
        if !record.has_effects() {
            return Err(ExecutionError::Unavailable("publish of an empty transaction".to_owned()).into());
        }
        commit::publish(self, record)
    }

    /// Exports the open batch as a paid, signed raw transaction without
    /// broadcasting or closing it.
    pub fn export_batch(&self) -> Result<Vec<u8>, Error> {
        let mut record = self.record.borrow_mut();
        let record = record
            .as_mut()
            .filter(|r| r.manual)
            .ok_or_else(|| ExecutionError::Unavailable("export".to_owned()))?;
        commit::export(self, record)
    }

    /// Discards the open batch record, restoring every participant.
    pub fn rollback_batch(&self) -> Result<(), Error> {
        let record = self
            .record
            .borrow_mut()
            .take()
            .ok_or_else(|| ExecutionError::Unavailable("rollback".to_owned()))?;
        commit::rollback(self, &record, "rolled back");
        Ok(())
    }

    /// Runs one top-level operation, committing the automatic record it
    /// opened (if any) on success and rolling back on failure.
    fn with_entry<T>(&self, f: impl FnOnce(&Self) -> Result<T, Error>) -> Result<T, Error> {
        let opened = self.ensure_record();
        match f(self) {
            Ok(value) => {
                if opened {
                    let record = self.record.borrow_mut().take();
                    if let Some(record) = record {
                        if record.has_effects() {
                            commit::publish(self, record)?;
                        }
                    }
                }
                Ok(value)
            }
            Err(error) => {
                if opened {
                    let record = self.record.borrow_mut().take();
                    if let Some(record) = record {
                        commit::rollback(self, &record, &error.to_string());
                    }
                }
                Err(error)
            }
        }
    }

    /// Snapshots a creation the first time it enters the active record.
    pub fn enroll(&self, jig: JigRef) {
        let mut creations = self.creations.borrow_mut();
        let creation = &mut creations[jig.0 as usize];
        if creation.snapshot.is_none() {
            let props = match Value::Object(creation.props.clone()).deep_clone() {
                Value::Object(obj) => obj,
                _ => unreachable!("deep_clone preserves kind"),
            };
            creation.snapshot = Some(Snapshot {
                props,
                bindings: creation.bindings.clone(),
                lifecycle: creation.lifecycle.clone(),
            });
        }
    }

    /// The jig whose method invoked the currently executing one.
    pub fn parent_caller(&self) -> Option<JigRef> {
        let record = self.record.borrow();
        let stack = &record.as_ref()?.stack;
        if stack.len() >= 2 {
            Some(stack[stack.len() - 2].this)
        } else {
            None
        }
    }

    // ---------------------------------------------------------------
    // Shared checks
    // ---------------------------------------------------------------

    fn check_usable(&self, jig: JigRef, op: &str) -> Result<(), Error> {
        let poison = self.with_creation(jig, |c| c.poison.clone());
        if let Some(reason) = poison {
            return Err(self.poison_error(jig, &reason));
        }
        let destroyed = self.with_creation(jig, |c| c.lifecycle.is_destroyed());
        let pending_delete = self
            .record
            .borrow()
            .as_ref()
            .map(|r| r.is_deleted(jig))
            .unwrap_or(false);
        if destroyed || pending_delete {
            // A destroy-in-progress may keep running its own method.
            let own_frame = self
                .record
                .borrow()
                .as_ref()
                .and_then(|r| r.top_frame())
                .map(|f| f.this == jig)
                .unwrap_or(false);
            if !own_frame {
                return Err(ExecutionError::Destroyed(op.to_owned()).into());
            }
        }
        Ok(())
    }

    pub fn poison_error(&self, jig: JigRef, reason: &str) -> Error {
        let is_code = self.with_creation(jig, |c| matches!(c.kind, CreationKind::Code { .. }));
        if is_code {
            crate::membrane::AccessError::DeployFailed(reason.to_owned()).into()
        } else {
            crate::membrane::AccessError::Poisoned(reason.to_owned()).into()
        }
    }

    fn check_unbound(&self, jig: JigRef) -> Result<(), Error> {
        let unbound = self
            .record
            .borrow()
            .as_ref()
            .map(|r| r.is_unbound(jig))
            .unwrap_or(false);
        if unbound {
            return Err(crate::membrane::AccessError::Unbound.into());
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Dependency resolution
    // ---------------------------------------------------------------

    /// Resolves a free identifier for code of `class`.
    pub fn resolve_dep(&self, class: JigRef, name: &str) -> Result<JigRef, Error> {
        if let Some(code) = self.code_of(class) {
            if let Some(jig) = self.realm.borrow().slot(code).deps.get(name) {
                return Ok(*jig);
            }
        }
        if let Some(native) = self.native(name) {
            return Ok(native);
        }
        if BANNED_GLOBALS.contains(&name) {
            return Err(ExecutionError::Banned(name.to_owned()).into());
        }
        Err(ExecutionError::NotDefined(name.to_owned()).into())
    }

    // ---------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------

    /// Installs new code jigs as one deploy action.
    pub fn op_deploy(
        &self,
        defs: Vec<(ClassImpl, BTreeMap<String, JigRef>)>,
    ) -> Result<Vec<JigRef>, Error> {
        self.with_entry(|kernel| {
            let mut codes = Vec::with_capacity(defs.len());
            for (def, deps) in defs {
                codes.push(kernel.install_code(def, deps)?);
            }
            let mut record = self.record.borrow_mut();
            let record = record.as_mut().expect("record open during entry");
            record.actions.push(Action::Deploy {
                codes: codes.clone(),
            });
            Ok(codes)
        })
    }

    fn install_code(
        &self,
        def: ClassImpl,
        deps: BTreeMap<String, JigRef>,
    ) -> Result<JigRef, Error> {
        let manifest = def.manifest();
        for (name, dep) in &deps {
            let ok = self.with_creation(*dep, |c| {
                matches!(c.kind, CreationKind::Code { .. } | CreationKind::Native { .. })
            });
            if !ok {
                return Err(crate::sandbox::InstallError::BadDep(name.clone()).into());
            }
        }
        let parent = self.resolve_parent(&manifest, &deps)?;
        let rules = match manifest.kind {
            ClassKind::Jig => Rules::jig_code(),
            ClassKind::Sidekick => Rules::sidekick_code(),
            ClassKind::Berry => Rules::berry_code(),
        };
        // Dependencies are observed, not consumed.
        {
            let mut record = self.record.borrow_mut();
            let record = record.as_mut().expect("record open during entry");
            for dep in deps.values() {
                let recordable = self.with_creation(*dep, |c| c.rules.recordable_target);
                if recordable {
                    record.read(*dep);
                }
            }
        }
        let code = self
            .realm
            .borrow_mut()
            .install(def, deps, parent)
            .map_err(Error::from)?;
        let jig = JigRef(self.creations.borrow().len() as u32);
        self.creations.borrow_mut().push(Creation {
            kind: CreationKind::Code { code },
            props: ObjectRef::default(),
            bindings: Bindings::undeployed(),
            rules,
            lifecycle: Lifecycle::Deploying,
            snapshot: None,
            poison: None,
        });
        self.note_created(jig);
        Ok(jig)
    }

    fn resolve_parent(
        &self,
        manifest: &crate::sandbox::ClassManifest,
        deps: &BTreeMap<String, JigRef>,
    ) -> Result<Option<JigRef>, Error> {
        if let Some(parent_name) = &manifest.parent {
            let parent = deps.get(parent_name).copied().ok_or_else(|| {
                crate::sandbox::InstallError::MissingParent(parent_name.clone())
            })?;
            return Ok(Some(parent));
        }
        Ok(match manifest.kind {
            ClassKind::Jig => self.native("Jig"),
            ClassKind::Berry => self.native("Berry"),
            ClassKind::Sidekick => None,
        })
    }

    /// Assigns the provisional record location to a fresh creation.
    fn note_created(&self, jig: JigRef) {
        let location = {
            let mut record = self.record.borrow_mut();
            let record = record.as_mut().expect("record open during entry");
            record.create(jig);
            let index = record.creates.len() as u32 - 1;
            Location::Recording {
                record: record.id.clone(),
                slot: Slot::Output(index),
            }
        };
        self.with_creation_mut(jig, |c| {
            c.bindings.origin = location.clone();
            c.bindings.location = location;
            c.lifecycle = Lifecycle::Deploying;
        });
    }

    /// Instantiates a jig class.
    pub fn op_new(&self, class: JigRef, args: Vec<Value>) -> Result<JigRef, Error> {
        self.with_entry(|kernel| {
            kernel.check_usable(class, "new")?;
            let manifest_kind = match kernel.code_of(class) {
                Some(code) => kernel.realm.borrow().slot(code).manifest.kind,
                None => {
                    let name = kernel.with_creation(class, |c| format!("{:?}", c.kind));
                    return Err(ExecutionError::NotAJigClass(name).into());
                }
            };
            if manifest_kind != ClassKind::Jig {
                let name = kernel
                    .code_of(class)
                    .map(|code| kernel.realm.borrow().slot(code).manifest.name.clone())
                    .unwrap_or_default();
                return Err(ExecutionError::NotAJigClass(name).into());
            }

            {
                let mut record = kernel.record.borrow_mut();
                let record = record.as_mut().expect("record open during entry");
                record.read(class);
            }

            let instance = JigRef(kernel.creations.borrow().len() as u32);
            kernel.creations.borrow_mut().push(Creation {
                kind: CreationKind::Instance { class },
                props: ObjectRef::default(),
                bindings: Bindings::undeployed(),
                rules: Rules::jig_instance(),
                lifecycle: Lifecycle::Deploying,
                snapshot: None,
                poison: None,
            });
            kernel.note_created(instance);

            let action_args: Vec<Value> = args.iter().map(Value::deep_clone).collect();
            {
                let mut record = kernel.record.borrow_mut();
                let record = record.as_mut().expect("record open during entry");
                record.actions.push(Action::New {
                    class,
                    instance,
                    args: action_args,
                });
            }

            // Run the constructor when the hierarchy defines one.
            if let Some((defining, def)) = kernel.find_method(instance, "init") {
                kernel.invoke(instance, defining, &def, "init", args)?;
            }
            Ok(instance)
        })
    }

    /// Invokes a method on a jig instance or a static method on code.
    pub fn op_call(&self, target: JigRef, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        match method {
            "sync" => return Err(ExecutionError::SyncInternal.into()),
            "load" => return Err(ExecutionError::LoadInternal.into()),
            "auth" => return self.op_auth(target).map(|_| Value::Undefined),
            "destroy" => return self.op_destroy(target).map(|_| Value::Undefined),
            _ => {}
        }
        self.with_entry(|kernel| {
            kernel.check_usable(target, method)?;

            let disabled = kernel.with_creation(target, |c| {
                c.rules.disabled_methods.iter().any(|m| *m == method)
            });
            if disabled {
                return Err(ExecutionError::MethodDisabled(method.to_owned()).into());
            }

            // Private methods dispatch only within the class hierarchy.
            if method.starts_with('_') {
                let caller_class = kernel
                    .record
                    .borrow()
                    .as_ref()
                    .and_then(|r| r.top_frame())
                    .map(|f| f.class);
                let allowed = match caller_class {
                    Some(class) => kernel.class_has_access(class, target),
                    None => false,
                };
                if !allowed {
                    return Err(crate::membrane::AccessError::Private {
                        op: "call",
                        prop: method.to_owned(),
                    }
                    .into());
                }
            }

            let (defining, def) = kernel
                .find_method(target, method)
                .ok_or_else(|| ExecutionError::MethodNotFound(method.to_owned()))?;

            let recordable = kernel.with_creation(target, |c| {
                c.rules.recordable_target && c.rules.record_calls
            });
            let top_level = {
                let mut record = kernel.record.borrow_mut();
                let record = record.as_mut().expect("record open during entry");
                if recordable {
                    record.read(target);
                }
                record.stack.is_empty()
            };
            // Only smart-API targets enter the exec script; sidekick and
            // berry methods just evaluate.
            if top_level && recordable {
                let action_args: Vec<Value> = args.iter().map(Value::deep_clone).collect();
                let mut record = kernel.record.borrow_mut();
                let record = record.as_mut().expect("record open during entry");
                record.actions.push(Action::Call {
                    target,
                    method: method.to_owned(),
                    args: action_args,
                });
            }

            kernel.invoke(target, defining, &def, method, args)
        })
    }

    /// Records an ownership approval without state change.
    pub fn op_auth(&self, target: JigRef) -> Result<(), Error> {
        self.with_entry(|kernel| {
            kernel.check_usable(target, "auth").map_err(|e| {
                // Destroyed jigs surface the dedicated auth error.
                match e {
                    Error::Execution(ExecutionError::Destroyed(_)) => {
                        ExecutionError::AuthDestroyed.into()
                    }
                    other => other,
                }
            })?;
            let supported = kernel.with_creation(target, |c| {
                matches!(
                    c.kind,
                    CreationKind::Code { .. } | CreationKind::Instance { .. }
                )
            });
            if !supported {
                return Err(ExecutionError::Unavailable("auth".to_owned()).into());
            }
            let created = kernel
                .record
                .borrow()
                .as_ref()
                .map(|r| r.is_created(target))
                .unwrap_or(false);
            let undeployed =
                kernel.with_creation(target, |c| c.lifecycle == Lifecycle::Undeployed);
            if created || undeployed {
                return Err(ExecutionError::Unavailable("auth".to_owned()).into());
            }
            kernel.check_unbound(target)?;

            kernel.enroll(target);
            let mut record = kernel.record.borrow_mut();
            let record = record.as_mut().expect("record open during entry");
            record.auth(target);
            if record.stack.is_empty() {
                record.actions.push(Action::Call {
                    target,
                    method: "auth".to_owned(),
                    args: Vec::new(),
                });
            }
            Ok(())
        })
    }

    /// Destroys a jig. Idempotent within a record.
    pub fn op_destroy(&self, target: JigRef) -> Result<(), Error> {
        self.with_entry(|kernel| {
            let poison = kernel.with_creation(target, |c| c.poison.clone());
            if let Some(reason) = poison {
                return Err(kernel.poison_error(target, &reason));
            }
            let supported = kernel.with_creation(target, |c| {
                matches!(
                    c.kind,
                    CreationKind::Code { .. } | CreationKind::Instance { .. }
                )
            });
            if !supported {
                return Err(ExecutionError::Unavailable("destroy".to_owned()).into());
            }
            let already = kernel.with_creation(target, |c| c.lifecycle.is_destroyed())
                || kernel
                    .record
                    .borrow()
                    .as_ref()
                    .map(|r| r.is_deleted(target))
                    .unwrap_or(false);
            if already {
                return Ok(());
            }
            kernel.check_unbound(target)?;

            kernel.enroll(target);
            let (record_id, delete_index) = {
                let mut record = kernel.record.borrow_mut();
                let record = record.as_mut().expect("record open during entry");
                record.delete(target);
                if record.stack.is_empty() {
                    record.actions.push(Action::Call {
                        target,
                        method: "destroy".to_owned(),
                        args: Vec::new(),
                    });
                }
                (record.id.clone(), record.deletes.len() as u32 - 1)
            };
            kernel.with_creation_mut(target, |c| {
                c.bindings.location = Location::Recording {
                    record: record_id,
                    slot: Slot::Deletion(delete_index),
                };
            });
            Ok(())
        })
    }

    /// Replaces the class of a code jig.
    pub fn op_upgrade(
        &self,
        target: JigRef,
        def: ClassImpl,
        deps: BTreeMap<String, JigRef>,
    ) -> Result<(), Error> {
        self.with_entry(|kernel| {
            let destroyed = kernel.with_creation(target, |c| c.lifecycle.is_destroyed())
                || kernel
                    .record
                    .borrow()
                    .as_ref()
                    .map(|r| r.is_deleted(target))
                    .unwrap_or(false);
            if destroyed {
                return Err(ExecutionError::UpgradeDestroyed.into());
            }
            let code = match kernel.code_of(target) {
                Some(code) => code,
                None => return Err(ExecutionError::Unavailable("upgrade".to_owned()).into()),
            };
            kernel.check_unbound(target)?;

            let manifest = def.manifest();
            let old_kind = kernel.realm.borrow().slot(code).manifest.kind;
            if manifest.kind != old_kind {
                return Err(ExecutionError::Unavailable("upgrade".to_owned()).into());
            }
            let parent = kernel.resolve_parent(&manifest, &deps)?;
            kernel.enroll(target);
            // The new dependencies are observed, not consumed.
            {
                let mut record = kernel.record.borrow_mut();
                let record = record.as_mut().expect("record open during entry");
                for dep in deps.values() {
                    let recordable =
                        kernel.with_creation(*dep, |c| c.rules.recordable_target);
                    if recordable {
                        record.read(*dep);
                    }
                }
            }
            kernel
                .realm
                .borrow_mut()
                .replace(code, def, deps, parent)
                .map_err(Error::from)?;
            let mut record = kernel.record.borrow_mut();
            let record = record.as_mut().expect("record open during entry");
            record.update(target);
            record.actions.push(Action::Upgrade { code: target });
            Ok(())
        })
    }

    // ---------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------

    /// Finds the class in the hierarchy defining the method, with the
    /// current definition of that class.
    fn find_method(&self, target: JigRef, method: &str) -> Option<(JigRef, ClassImpl)> {
        let (start, method_target) = self.with_creation(target, |c| match &c.kind {
            CreationKind::Instance { class } | CreationKind::Berry { class, .. } => {
                (Some(*class), MethodTarget::Instance)
            }
            CreationKind::Code { .. } => (Some(target), MethodTarget::Static),
            CreationKind::Native { .. } => (None, MethodTarget::Static),
        });
        let start = start?;
        for class_jig in self.class_chain(start) {
            let code = self.code_of(class_jig)?;
            let realm = self.realm.borrow();
            let slot = realm.slot(code);
            if slot.manifest.has_method(method, method_target) {
                let def = slot.def.clone();
                return Some((class_jig, def));
            }
        }
        None
    }

    /// Runs a method body within a fresh frame.
    fn invoke(
        &self,
        this: JigRef,
        defining_class: JigRef,
        def: &ClassImpl,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Error> {
        // Values crossing the jig boundary are copied.
        let args: Vec<Value> = args.iter().map(Value::deep_clone).collect();
        {
            let mut record = self.record.borrow_mut();
            let record = record.as_mut().expect("record open during entry");
            record.stack.push(Frame {
                this,
                class: defining_class,
            });
        }
        let mut scope = MethodScope::new(self, this, defining_class);
        let result = def.as_class().invoke(&mut scope, method, &args);
        {
            let mut record = self.record.borrow_mut();
            let record = record.as_mut().expect("record open during entry");
            record.stack.pop();
        }
        // The return value crosses the boundary too.
        result.map(|value| value.deep_clone())
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("creations", &self.creations.borrow().len())
            .field("record", &self.record.borrow().is_some())
            .field("network", &self.options.network)
            .finish()
    }
}
