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

//! The hermetic execution realm.
//!
//! A class's executable body is a native [`ClassDef`] registered with the
//! realm; what goes on-chain is its [`ClassManifest`] (name, version,
//! digest, method table, dependency names). Replay resolves manifests
//! against the registry and refuses digests it cannot reproduce. Live
//! code jigs are stable handles into the class arena: an upgrade swaps
//! the slot's definition without changing handle identity.
//!
//! Method bodies receive a [`MethodScope`] as their only capability
//! surface. A scope offers property access on `this`, cross-jig reads,
//! creation, destruction and dispatch, and nothing else: no clock, no
//! randomness, no I/O. Dependencies resolve by name at call time;
//! well-known non-deterministic names are refused with an explanatory
//! hint.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use semver::Version;
use serde_json::{json, Value as Json};
use thiserror::Error;

use crate::crypto::{sha256, Hash};
use crate::helpers::stable_stringify;
use crate::membrane::rules;
use crate::membrane::{Caller, Membrane};
use crate::runtime::Kernel;
use crate::value::{JigRef, Value};
use crate::Error;

/// Index of an installed class in the realm arena.
pub type CodeId = usize;

/// Globals the sandbox refuses because they are non-deterministic or
/// unsupported, surfaced as `<Name> is not defined` with a hint.
pub const BANNED_GLOBALS: &[&str] = &[
    "Date",
    "Math",
    "RegExp",
    "Promise",
    "Symbol",
    "WeakMap",
    "WeakSet",
    "Proxy",
    "Reflect",
    "setTimeout",
    "setInterval",
    "XMLHttpRequest",
    "fetch",
    "random",
    "Int8Array",
    "Int16Array",
    "Int32Array",
    "Uint16Array",
    "Uint32Array",
    "Float32Array",
    "Float64Array",
];

/// Errors raised while installing a class into the realm.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstallError {
    /// The manifest carries no class name.
    #[error("anonymous classes and functions not supported")]
    Anonymous,
    /// The class name is not an identifier.
    #[error("Bad class name: {0}")]
    BadName(String),
    /// Getter/setter members are not supported.
    #[error("accessor properties not supported: {0}")]
    Accessor(String),
    /// A member shadows a reserved or binding name.
    #[error("Cannot define reserved property: {0}")]
    Reserved(String),
    /// Two members share a name.
    #[error("duplicate method: {0}")]
    DuplicateMethod(String),
    /// A dependency name is not an identifier or shadows a binding.
    #[error("Bad dependency name: {0}")]
    BadDep(String),
    /// A dependency names a banned global.
    #[error("{0} is not defined (disabled because non-deterministic)")]
    BannedDep(String),
    /// The declared parent is missing from the dependency list.
    #[error("parent {0} missing from deps")]
    MissingParent(String),
    /// A replayed manifest digest does not match the local definition.
    #[error("class digest mismatch: {0}")]
    DigestMismatch(String),
    /// No local definition matches the manifest.
    #[error("class {0} is not installed")]
    NotInstalled(String),
}

/// What a deployed class is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// A jig class: stateful, instantiable, mutable via methods.
    Jig,
    /// Sidekick code: plain class or function, immutable after deploy.
    Sidekick,
    /// A berry class: plucks immutable values from external content.
    Berry,
}

impl ClassKind {
    fn as_str(self) -> &'static str {
        match self {
            ClassKind::Jig => "jig",
            ClassKind::Sidekick => "sidekick",
            ClassKind::Berry => "berry",
        }
    }
}

/// Whether a method dispatches on instances or on the class itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodTarget {
    /// Instance method.
    Instance,
    /// Static method.
    Static,
}

/// How a member is defined. Only plain methods install; accessor members
/// exist so foreign definitions can be represented and refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// A plain method.
    Method,
    /// A getter accessor.
    Getter,
    /// A setter accessor.
    Setter,
}

/// One member of a class manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    /// Member name.
    pub name: String,
    /// Instance or static dispatch.
    pub target: MethodTarget,
    /// Plain method or accessor.
    pub kind: MethodKind,
}

/// The on-chain description of a class: everything a peer needs to match
/// the definition it has installed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassManifest {
    /// Class name; must be an identifier.
    pub name: String,
    /// Definition version.
    pub version: Version,
    /// Class kind.
    pub kind: ClassKind,
    /// Member table.
    pub methods: Vec<MethodDef>,
    /// Dependency names resolved at call time.
    pub deps: Vec<String>,
    /// Parent class name; must appear in `deps`.
    pub parent: Option<String>,
}

impl ClassManifest {
    /// Starts a manifest for the given class kind.
    pub fn new(name: impl Into<String>, kind: ClassKind) -> ClassManifest {
        ClassManifest {
            name: name.into(),
            version: Version::new(0, 1, 0),
            kind,
            methods: Vec::new(),
            deps: Vec::new(),
            parent: None,
        }
    }

    /// Sets the version.
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Adds an instance method.
    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(MethodDef {
            name: name.into(),
            target: MethodTarget::Instance,
            kind: MethodKind::Method,
        });
        self
    }

    /// Adds a static method.
    pub fn static_method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(MethodDef {
            name: name.into(),
            target: MethodTarget::Static,
            kind: MethodKind::Method,
        });
        self
    }

    /// Adds a dependency name.
    pub fn dep(mut self, name: impl Into<String>) -> Self {
        self.deps.push(name.into());
        self
    }

    /// Declares the parent class; it is also added to the deps.
    pub fn parent(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.deps.contains(&name) {
            self.deps.push(name.clone());
        }
        self.parent = Some(name);
        self
    }

    /// Whether the manifest declares the named method.
    pub fn has_method(&self, name: &str, target: MethodTarget) -> bool {
        self.methods
            .iter()
            .any(|m| m.name == name && m.target == target && m.kind == MethodKind::Method)
    }

    /// Renders the manifest for the exec script.
    pub fn to_json(&self) -> Json {
        let methods: Vec<Json> = self
            .methods
            .iter()
            .map(|m| {
                json!({
                    "name": m.name,
                    "target": match m.target {
                        MethodTarget::Instance => "instance",
                        MethodTarget::Static => "static",
                    },
                    "kind": match m.kind {
                        MethodKind::Method => "method",
                        MethodKind::Getter => "getter",
                        MethodKind::Setter => "setter",
                    },
                })
            })
            .collect();
        let mut out = json!({
            "name": self.name,
            "version": self.version.to_string(),
            "kind": self.kind.as_str(),
            "methods": methods,
            "deps": self.deps,
        });
        if let Some(parent) = &self.parent {
            out["parent"] = json!(parent);
        }
        out
    }

    /// Parses a manifest from the exec script.
    pub fn from_json(json: &Json) -> Result<ClassManifest, InstallError> {
        let bad = |what: &str| InstallError::BadName(what.to_owned());
        let map = json.as_object().ok_or_else(|| bad("manifest"))?;
        let name = map
            .get("name")
            .and_then(Json::as_str)
            .ok_or_else(|| bad("manifest name"))?
            .to_owned();
        let version = map
            .get("version")
            .and_then(Json::as_str)
            .and_then(|s| Version::parse(s).ok())
            .ok_or_else(|| bad("manifest version"))?;
        let kind = match map.get("kind").and_then(Json::as_str) {
            Some("jig") => ClassKind::Jig,
            Some("sidekick") => ClassKind::Sidekick,
            Some("berry") => ClassKind::Berry,
            _ => return Err(bad("manifest kind")),
        };
        let mut methods = Vec::new();
        for m in map
            .get("methods")
            .and_then(Json::as_array)
            .ok_or_else(|| bad("manifest methods"))?
        {
            let name = m
                .get("name")
                .and_then(Json::as_str)
                .ok_or_else(|| bad("method name"))?
                .to_owned();
            let target = match m.get("target").and_then(Json::as_str) {
                Some("instance") => MethodTarget::Instance,
                Some("static") => MethodTarget::Static,
                _ => return Err(bad("method target")),
            };
            let kind = match m.get("kind").and_then(Json::as_str) {
                Some("method") => MethodKind::Method,
                Some("getter") => MethodKind::Getter,
                Some("setter") => MethodKind::Setter,
                _ => return Err(bad("method kind")),
            };
            methods.push(MethodDef { name, target, kind });
        }
        let deps = map
            .get("deps")
            .and_then(Json::as_array)
            .ok_or_else(|| bad("manifest deps"))?
            .iter()
            .map(|d| d.as_str().map(str::to_owned).ok_or_else(|| bad("dep name")))
            .collect::<Result<Vec<_>, _>>()?;
        let parent = match map.get("parent") {
            None => None,
            Some(p) => Some(p.as_str().ok_or_else(|| bad("parent"))?.to_owned()),
        };
        Ok(ClassManifest {
            name,
            version,
            kind,
            methods,
            deps,
            parent,
        })
    }

    /// Content digest binding a manifest to a local definition.
    pub fn digest(&self) -> Hash {
        sha256(stable_stringify(&self.to_json()).as_bytes())
    }

    /// Validates the manifest for installation.
    pub fn validate(&self) -> Result<(), InstallError> {
        if self.name.is_empty() {
            return Err(InstallError::Anonymous);
        }
        if !is_identifier(&self.name) {
            return Err(InstallError::BadName(self.name.clone()));
        }
        let mut seen = Vec::new();
        for method in &self.methods {
            if method.kind != MethodKind::Method {
                return Err(InstallError::Accessor(method.name.clone()));
            }
            if !is_identifier(&method.name) {
                return Err(InstallError::BadName(method.name.clone()));
            }
            if rules::is_reserved(&method.name) || rules::is_binding(&method.name) {
                return Err(InstallError::Reserved(method.name.clone()));
            }
            let key = (method.name.clone(), method.target);
            if seen.contains(&key) {
                return Err(InstallError::DuplicateMethod(method.name.clone()));
            }
            seen.push(key);
        }
        let mut dep_seen = Vec::new();
        for dep in &self.deps {
            if !is_identifier(dep) {
                return Err(InstallError::BadDep(dep.clone()));
            }
            if rules::is_reserved(dep) || rules::is_binding(dep) {
                return Err(InstallError::BadDep(dep.clone()));
            }
            if BANNED_GLOBALS.contains(&dep.as_str()) {
                return Err(InstallError::BannedDep(dep.clone()));
            }
            if dep_seen.contains(dep) {
                return Err(InstallError::BadDep(dep.clone()));
            }
            dep_seen.push(dep.clone());
        }
        if let Some(parent) = &self.parent {
            if !self.deps.contains(parent) {
                return Err(InstallError::MissingParent(parent.clone()));
            }
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// The native execution body of a class.
pub trait ClassDef {
    /// The class manifest published on deploy.
    fn manifest(&self) -> ClassManifest;

    /// Executes a method. `scope` is the only capability surface; the
    /// method's effects happen through it.
    fn invoke(
        &self,
        scope: &mut MethodScope<'_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error>;
}

/// Handle a berry class uses to pull external content; the single
/// extension point that may reach outside the sandbox.
pub trait BerryFetch {
    /// Fetches a raw transaction by txid hex.
    fn fetch(&mut self, txid: &str) -> Result<Value, Error>;
}

/// A berry class: a [`ClassDef`] that can also pluck values from
/// external content.
pub trait BerryDef: ClassDef {
    /// Plucks the value at `path`. The result is pinned by the berry
    /// location's `hash` field.
    fn pluck(&self, path: &str, fetch: &mut dyn BerryFetch) -> Result<Value, Error>;
}

/// An installable class body.
#[derive(Clone)]
pub enum ClassImpl {
    /// Jig or sidekick class.
    Plain(Arc<dyn ClassDef>),
    /// Berry class.
    Berry(Arc<dyn BerryDef>),
}

impl ClassImpl {
    /// The manifest of the underlying definition.
    pub fn manifest(&self) -> ClassManifest {
        match self {
            ClassImpl::Plain(def) => def.manifest(),
            ClassImpl::Berry(def) => def.manifest(),
        }
    }

    /// The plain class surface.
    pub fn as_class(&self) -> &dyn ClassDef {
        match self {
            ClassImpl::Plain(def) => def.as_ref(),
            ClassImpl::Berry(def) => def.as_ref() as &dyn ClassDef,
        }
    }

    /// The berry surface, where the class has one.
    pub fn as_berry(&self) -> Option<&dyn BerryDef> {
        match self {
            ClassImpl::Plain(_) => None,
            ClassImpl::Berry(def) => Some(def.as_ref()),
        }
    }
}

impl fmt::Debug for ClassImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassImpl({})", self.manifest().name)
    }
}

/// An occupied slot in the class arena.
#[derive(Debug)]
pub struct ClassSlot {
    /// Current definition; swapped on upgrade.
    pub def: ClassImpl,
    /// Manifest of the current definition.
    pub manifest: ClassManifest,
    /// Resolved dependencies by name.
    pub deps: BTreeMap<String, JigRef>,
    /// Resolved parent class jig.
    pub parent: Option<JigRef>,
}

/// The realm: the class arena plus the registry of locally available
/// definitions replay may resolve against.
#[derive(Debug, Default)]
pub struct Realm {
    slots: Vec<ClassSlot>,
    available: Vec<ClassImpl>,
}

impl Realm {
    /// An empty realm.
    pub fn new() -> Realm {
        Realm::default()
    }

    /// Registers a definition for replay resolution.
    pub fn make_available(&mut self, def: ClassImpl) {
        let manifest = def.manifest();
        let digest = manifest.digest();
        if self
            .available
            .iter()
            .any(|d| d.manifest().digest() == digest)
        {
            return;
        }
        self.available.push(def);
    }

    /// Finds a registered definition matching the manifest exactly.
    pub fn find_available(&self, manifest: &ClassManifest) -> Option<ClassImpl> {
        let digest = manifest.digest();
        self.available
            .iter()
            .find(|d| d.manifest().digest() == digest)
            .cloned()
    }

    /// Validates and installs a class, returning its arena slot.
    pub fn install(
        &mut self,
        def: ClassImpl,
        deps: BTreeMap<String, JigRef>,
        parent: Option<JigRef>,
    ) -> Result<CodeId, InstallError> {
        let manifest = def.manifest();
        manifest.validate()?;
        self.make_available(def.clone());
        self.slots.push(ClassSlot {
            def,
            manifest,
            deps,
            parent,
        });
        Ok(self.slots.len() - 1)
    }

    /// Swaps a slot's definition in place; handle identity is unchanged.
    pub fn replace(
        &mut self,
        code: CodeId,
        def: ClassImpl,
        deps: BTreeMap<String, JigRef>,
        parent: Option<JigRef>,
    ) -> Result<(), InstallError> {
        let manifest = def.manifest();
        manifest.validate()?;
        self.make_available(def.clone());
        let slot = &mut self.slots[code];
        slot.def = def;
        slot.manifest = manifest;
        slot.deps = deps;
        slot.parent = parent;
        Ok(())
    }

    /// Borrows an installed slot.
    pub fn slot(&self, code: CodeId) -> &ClassSlot {
        &self.slots[code]
    }

    /// Number of installed slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no class is installed.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// The capability surface handed to an executing method.
///
/// All effects of a method happen through its scope: property access on
/// `this` (recorded and validated by the membrane), cross-jig reads,
/// creation, destruction, dispatch and dependency lookup.
#[derive(Debug)]
pub struct MethodScope<'k> {
    pub(crate) kernel: &'k Kernel,
    pub(crate) this: JigRef,
    pub(crate) class: JigRef,
}

impl<'k> MethodScope<'k> {
    pub(crate) fn new(kernel: &'k Kernel, this: JigRef, class: JigRef) -> MethodScope<'k> {
        MethodScope { kernel, this, class }
    }

    fn caller(&self) -> Caller {
        Caller::Method {
            this: self.this,
            class: self.class,
        }
    }

    /// `this` as a value, for storing self-references.
    pub fn this_jig(&self) -> Value {
        Value::Jig(self.this)
    }

    /// Reads an own property of `this`.
    pub fn get(&self, prop: &str) -> Result<Value, Error> {
        Membrane::new(self.kernel, self.this).get(&[prop], &self.caller())
    }

    /// Reads a nested property of `this`.
    pub fn get_path(&self, path: &[&str]) -> Result<Value, Error> {
        Membrane::new(self.kernel, self.this).get(path, &self.caller())
    }

    /// Writes an own property of `this`.
    pub fn set(&mut self, prop: &str, value: Value) -> Result<(), Error> {
        Membrane::new(self.kernel, self.this).set(&[prop], value, &self.caller())
    }

    /// Writes a nested property of `this`.
    pub fn set_path(&mut self, path: &[&str], value: Value) -> Result<(), Error> {
        Membrane::new(self.kernel, self.this).set(path, value, &self.caller())
    }

    /// Deletes an own property of `this`.
    pub fn delete(&mut self, prop: &str) -> Result<(), Error> {
        Membrane::new(self.kernel, self.this).delete(&[prop], &self.caller())
    }

    /// Whether `this` has the property.
    pub fn has(&self, prop: &str) -> Result<bool, Error> {
        Membrane::new(self.kernel, self.this).has(&[prop], &self.caller())
    }

    /// Reads a property of another jig; privacy rules apply.
    pub fn get_of(&self, target: &Value, prop: &str) -> Result<Value, Error> {
        let jig = expect_jig(target)?;
        Membrane::new(self.kernel, jig).get(&[prop], &self.caller())
    }

    /// Whether another jig has the property; privacy rules apply.
    pub fn has_of(&self, target: &Value, prop: &str) -> Result<bool, Error> {
        let jig = expect_jig(target)?;
        Membrane::new(self.kernel, jig).has(&[prop], &self.caller())
    }

    /// Own keys of another jig; privacy rules apply.
    pub fn keys_of(&self, target: &Value) -> Result<Vec<String>, Error> {
        let jig = expect_jig(target)?;
        Membrane::new(self.kernel, jig).own_keys(&self.caller())
    }

    /// The jig whose method invoked this one, if any.
    pub fn caller_jig(&self) -> Option<Value> {
        self.kernel.parent_caller().map(Value::Jig)
    }

    /// Resolves a dependency by its source-time name.
    pub fn dep(&self, name: &str) -> Result<Value, Error> {
        self.kernel.resolve_dep(self.class, name).map(Value::Jig)
    }

    /// Instantiates a jig class.
    pub fn new_instance(&mut self, class: &Value, args: Vec<Value>) -> Result<Value, Error> {
        let class = expect_jig(class)?;
        self.kernel.op_new(class, args).map(Value::Jig)
    }

    /// Invokes a method on another jig (or a static method on a class).
    pub fn call(&mut self, target: &Value, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        let jig = expect_jig(target)?;
        self.kernel.op_call(jig, method, args)
    }

    /// Destroys `this`. The current method may keep modifying its own
    /// fields; outside mutation is rejected from here on.
    pub fn destroy(&mut self) -> Result<(), Error> {
        self.kernel.op_destroy(self.this)
    }

    /// Records an ownership approval of `this` without state change.
    pub fn auth(&mut self) -> Result<(), Error> {
        self.kernel.op_auth(self.this)
    }

    /// Assigns a new owner; sugar over setting the `owner` binding.
    pub fn send(&mut self, owner: Value) -> Result<(), Error> {
        self.set("owner", owner)
    }
}

fn expect_jig(value: &Value) -> Result<JigRef, Error> {
    match value {
        Value::Jig(jig) => Ok(*jig),
        other => Err(crate::runtime::ExecutionError::NotAJig(other.type_name().to_owned()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> ClassManifest {
        ClassManifest::new("Dragon", ClassKind::Jig)
            .method("init")
            .method("feed")
            .static_method("species")
            .dep("Helper")
    }

    #[test]
    fn manifest_json_round_trip() {
        let m = manifest().parent("Creature");
        let parsed = ClassManifest::from_json(&m.to_json()).unwrap();
        assert_eq!(parsed, m);
        assert_eq!(parsed.digest(), m.digest());
    }

    #[test]
    fn digest_tracks_content() {
        let a = manifest();
        let b = manifest().method("sleep");
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn validation_rejects_bad_manifests() {
        assert_eq!(
            ClassManifest::new("", ClassKind::Jig).validate(),
            Err(InstallError::Anonymous)
        );
        assert_matches::assert_matches!(
            ClassManifest::new("1Bad", ClassKind::Jig).validate(),
            Err(InstallError::BadName(_))
        );
        assert_matches::assert_matches!(
            ClassManifest::new("A", ClassKind::Jig)
                .method("owner")
                .validate(),
            Err(InstallError::Reserved(_))
        );
        assert_matches::assert_matches!(
            ClassManifest::new("A", ClassKind::Jig)
                .method("constructor")
                .validate(),
            Err(InstallError::Reserved(_))
        );
        assert_matches::assert_matches!(
            ClassManifest::new("A", ClassKind::Jig)
                .method("f")
                .method("f")
                .validate(),
            Err(InstallError::DuplicateMethod(_))
        );
        assert_matches::assert_matches!(
            ClassManifest::new("A", ClassKind::Jig).dep("Math").validate(),
            Err(InstallError::BannedDep(_))
        );
        let mut m = ClassManifest::new("A", ClassKind::Jig);
        m.parent = Some("B".to_owned());
        assert_matches::assert_matches!(m.validate(), Err(InstallError::MissingParent(_)));
    }

    #[test]
    fn validation_rejects_accessors() {
        let mut m = ClassManifest::new("A", ClassKind::Jig);
        m.methods.push(MethodDef {
            name: "x".to_owned(),
            target: MethodTarget::Instance,
            kind: MethodKind::Getter,
        });
        assert_matches::assert_matches!(m.validate(), Err(InstallError::Accessor(_)));
    }

    #[test]
    fn banned_global_hint() {
        let err = ClassManifest::new("A", ClassKind::Jig)
            .dep("Date")
            .validate()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Date is not defined (disabled because non-deterministic)"
        );
    }
}
