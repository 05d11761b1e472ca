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

//! The per-jig access proxy.
//!
//! Every observable operation on a jig goes through a [`Membrane`], which
//! consults the target's [`Rules`](rules::Rules) record: binding fields
//! are surfaced read-only (owner/satoshis writable from inside methods),
//! private names are filtered on cross-jig access, immutable kinds refuse
//! writes, reads and updates are reported to the active record, and
//! method dispatch routes through the kernel. Nested properties are
//! addressed by path; segments past the root carry the parent's rules
//! with binding semantics stripped.

pub mod rules;

use thiserror::Error;

use crate::bindings::{parse_satoshis, BindingError, Lock};
use crate::helpers::compare_keys;
use crate::runtime::{CreationKind, Kernel};
use crate::value::{JigRef, PropKey, Value};
use crate::Error;

pub use self::rules::Rules;

/// Access failures raised by membrane operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    /// A private name was touched from a foreign jig.
    #[error("Cannot {op} private property {prop}")]
    Private {
        /// The operation attempted (read, set, delete, check, call).
        op: &'static str,
        /// The property name.
        prop: String,
    },
    /// A write was attempted outside the owning jig's methods.
    #[error("Attempt to update {0} outside of a method")]
    OutsideMethod(String),
    /// The target is immutable.
    #[error("Cannot {op}: immutable")]
    Immutable {
        /// The operation attempted.
        op: String,
    },
    /// A reserved name was written or deleted.
    #[error("Cannot set reserved property {0}")]
    Reserved(String),
    /// A binding field was written or deleted directly.
    #[error("Cannot {op} binding {name}")]
    Binding {
        /// The operation attempted.
        op: &'static str,
        /// The binding name.
        name: String,
    },
    /// The jig has a pending owner/satoshis change.
    #[error("unbound owner or satoshis value")]
    Unbound,
    /// Prototype mutation is never allowed.
    #[error("setPrototypeOf disabled")]
    SetPrototype,
    /// Extensibility mutation is never allowed.
    #[error("preventExtensions disabled")]
    PreventExtensions,
    /// A nested path's parent does not exist or is not a container.
    #[error("Cannot reach {0}")]
    Path(String),
    /// The jig was struck by an unrecoverable failure.
    #[error("Unhandled Error: {0}")]
    Poisoned(String),
    /// The code jig's deploy failed unrecoverably.
    #[error("Deploy failed: {0}")]
    DeployFailed(String),
    /// A validation error surfaced while writing a binding.
    #[error(transparent)]
    BadBinding(#[from] BindingError),
}

/// Who is performing a membrane operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// Host code outside any jig method.
    Host,
    /// Code of `class` executing a method with receiver `this`.
    Method {
        /// The receiver of the executing method.
        this: JigRef,
        /// The code jig of the class defining the executing method.
        class: JigRef,
    },
}

/// A property descriptor as reported by the membrane.
#[derive(Debug, Clone)]
pub struct PropDescriptor {
    /// The property value.
    pub value: Value,
    /// Whether writes are permitted (from inside methods).
    pub writable: bool,
    /// Whether the property shows up in key listings.
    pub enumerable: bool,
    /// Whether the property may be deleted or redefined.
    pub configurable: bool,
}

/// The access proxy for one creation.
#[derive(Debug)]
pub struct Membrane<'k> {
    kernel: &'k Kernel,
    target: JigRef,
}

impl<'k> Membrane<'k> {
    /// Wraps a creation.
    pub(crate) fn new(kernel: &'k Kernel, target: JigRef) -> Membrane<'k> {
        Membrane { kernel, target }
    }

    fn rules(&self) -> Rules {
        self.kernel.with_creation(self.target, |c| c.rules.clone())
    }

    fn check_poison(&self) -> Result<(), Error> {
        let poison = self.kernel.with_creation(self.target, |c| c.poison.clone());
        match poison {
            Some(reason) => Err(self.kernel.poison_error(self.target, &reason)),
            None => Ok(()),
        }
    }

    /// Whether the caller sits outside the target's class hierarchy.
    fn foreign_jig(&self, caller: &Caller) -> bool {
        match caller {
            // Host reflection is not jig-to-jig access.
            Caller::Host => false,
            Caller::Method { class, .. } => {
                !self.kernel.class_has_access(*class, self.target)
            }
        }
    }

    fn own_method(&self, caller: &Caller) -> bool {
        matches!(caller, Caller::Method { this, .. } if *this == self.target)
    }

    fn check_privacy(
        &self,
        rules: &Rules,
        path: &[&str],
        caller: &Caller,
        op: &'static str,
    ) -> Result<(), Error> {
        if !rules.privacy || !self.foreign_jig(caller) {
            return Ok(());
        }
        for segment in path {
            if rules::is_private(segment) {
                return Err(AccessError::Private {
                    op,
                    prop: (*segment).to_owned(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn record_read(&self, rules: &Rules) {
        if !rules.record_reads || !rules.recordable_target {
            return;
        }
        if let Some(record) = self.kernel.record.borrow_mut().as_mut() {
            // Only reads made by executing jig code enter the record;
            // replay reproduces exactly those. Host reflection between
            // batch entries leaves no trace.
            if !record.stack.is_empty() {
                record.read(self.target);
            }
        }
    }

    fn is_unbound(&self) -> bool {
        self.kernel
            .record
            .borrow()
            .as_ref()
            .map(|r| r.is_unbound(self.target))
            .unwrap_or(false)
    }

    fn has_binding_surface(&self, rules: &Rules) -> bool {
        rules.code_props || rules.jig_props || rules.berry_props
    }

    // ---------------------------------------------------------------
    // get / has / own_keys / descriptor
    // ---------------------------------------------------------------

    /// Reads the property at `path`.
    pub fn get(&self, path: &[&str], caller: &Caller) -> Result<Value, Error> {
        self.check_poison()?;
        let rules = self.rules();
        self.check_privacy(&rules, path, caller, "read")?;
        let root = *path.first().ok_or_else(|| AccessError::Path(String::new()))?;

        self.record_read(&rules);

        if path.len() == 1 && self.has_binding_surface(&rules) && rules::is_binding(root) {
            return self.read_binding(&rules, root);
        }

        let value = self.walk(path)?;
        // Live graphs stay inside the owning jig's methods.
        if self.own_method(caller) {
            Ok(value)
        } else {
            Ok(value.deep_clone())
        }
    }

    fn read_binding(&self, rules: &Rules, name: &str) -> Result<Value, Error> {
        let bindings = self.kernel.with_creation(self.target, |c| c.bindings.clone());
        let lifecycle = self.kernel.with_creation(self.target, |c| c.lifecycle.clone());
        match name {
            "location" | "origin" => {
                if rules.location_bindings && self.is_unbound() {
                    return Err(AccessError::Unbound.into());
                }
                let location = if name == "location" {
                    bindings.location
                } else {
                    bindings.origin
                };
                Ok(Value::String(location.to_string()))
            }
            "nonce" => Ok(Value::Number(bindings.nonce as f64)),
            "owner" => match bindings.owner {
                Some(lock) => Ok(lock_to_value(&lock)),
                None if lifecycle.is_destroyed() => Ok(Value::Null),
                // Berries are never spendable; their owner reads null.
                None if rules.berry_props => Ok(Value::Null),
                None => Err(AccessError::Unbound.into()),
            },
            "satoshis" => Ok(Value::Number(bindings.satoshis as f64)),
            _ => unreachable!("is_binding covers all names"),
        }
    }

    /// Whether the property at `path` exists.
    pub fn has(&self, path: &[&str], caller: &Caller) -> Result<bool, Error> {
        self.check_poison()?;
        let rules = self.rules();
        self.check_privacy(&rules, path, caller, "check")?;
        let root = *path.first().ok_or_else(|| AccessError::Path(String::new()))?;
        self.record_read(&rules);
        if path.len() == 1 && self.has_binding_surface(&rules) && rules::is_binding(root) {
            return Ok(true);
        }
        match self.walk(path) {
            Ok(Value::Undefined) => Ok(false),
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Lists own keys: binding names first, then properties, in canonical
    /// order. Private names are filtered for foreign jigs.
    pub fn own_keys(&self, caller: &Caller) -> Result<Vec<String>, Error> {
        self.check_poison()?;
        let rules = self.rules();
        self.record_read(&rules);
        let mut keys: Vec<String> = Vec::new();
        if self.has_binding_surface(&rules) {
            for name in rules::LOCATION_PROPS.iter().chain(rules::UTXO_PROPS) {
                keys.push((*name).to_owned());
            }
        }
        let props: Vec<String> = self.kernel.with_creation(self.target, |c| {
            c.props
                .borrow()
                .props
                .keys()
                .map(|k| k.as_str().to_owned())
                .collect()
        });
        keys.extend(props);
        if rules.privacy && self.foreign_jig(caller) {
            keys.retain(|k| !rules::is_private(k));
        }
        keys.sort_by(|a, b| compare_keys(a, b));
        Ok(keys)
    }

    /// Reports the descriptor of the property at `path`.
    pub fn descriptor(
        &self,
        path: &[&str],
        caller: &Caller,
    ) -> Result<Option<PropDescriptor>, Error> {
        let rules = self.rules();
        let root = *path.first().ok_or_else(|| AccessError::Path(String::new()))?;
        let value = match self.get(path, caller) {
            Ok(Value::Undefined) => return Ok(None),
            Ok(value) => value,
            Err(e) => return Err(e),
        };
        let depth_rules = if path.len() > 1 {
            Rules::child_property(&rules)
        } else {
            rules
        };
        let is_binding = path.len() == 1 && rules::is_binding(root);
        Ok(Some(PropDescriptor {
            value,
            writable: !depth_rules.immutable && !is_binding,
            enumerable: true,
            configurable: !depth_rules.immutable
                && !is_binding
                && !(depth_rules.reserved && rules::is_reserved(root)),
        }))
    }

    /// The prototype: the class jig for instances and berries, the parent
    /// class for code, nothing for natives.
    pub fn get_prototype(&self) -> Result<Value, Error> {
        self.check_poison()?;
        let kind = self.kernel.with_creation(self.target, |c| c.kind.clone());
        Ok(match kind {
            CreationKind::Instance { class } | CreationKind::Berry { class, .. } => {
                Value::Jig(class)
            }
            CreationKind::Code { code } => {
                match self.kernel.realm.borrow().slot(code).parent {
                    Some(parent) => Value::Jig(parent),
                    None => Value::Null,
                }
            }
            CreationKind::Native { .. } => Value::Null,
        })
    }

    /// Prototype mutation is refused for every kind.
    pub fn set_prototype(&self) -> Result<(), Error> {
        Err(AccessError::SetPrototype.into())
    }

    /// Extensibility mutation is refused for every kind.
    pub fn prevent_extensions(&self) -> Result<(), Error> {
        Err(AccessError::PreventExtensions.into())
    }

    // ---------------------------------------------------------------
    // set / define / delete
    // ---------------------------------------------------------------

    /// Writes the property at `path`.
    pub fn set(&self, path: &[&str], value: Value, caller: &Caller) -> Result<(), Error> {
        self.mutate(path, caller, "set", Some(value))
    }

    /// Defines the property at `path`; same policy as a write.
    pub fn define(&self, path: &[&str], value: Value, caller: &Caller) -> Result<(), Error> {
        self.mutate(path, caller, "define", Some(value))
    }

    /// Deletes the property at `path`.
    pub fn delete(&self, path: &[&str], caller: &Caller) -> Result<(), Error> {
        self.mutate(path, caller, "delete", None)
    }

    fn mutate(
        &self,
        path: &[&str],
        caller: &Caller,
        op: &'static str,
        value: Option<Value>,
    ) -> Result<(), Error> {
        self.check_poison()?;
        let rules = self.rules();
        let root = *path.first().ok_or_else(|| AccessError::Path(String::new()))?;

        if rules.immutable {
            return Err(AccessError::Immutable {
                op: format!("{} {}", op, root),
            }
            .into());
        }
        self.check_privacy(&rules, path, caller, op)?;
        if !self.own_method(caller) {
            let name = self.describe();
            return Err(AccessError::OutsideMethod(name).into());
        }

        if path.len() == 1 && rules::is_binding(root) {
            let value = match value {
                Some(value) => value,
                None => {
                    return Err(AccessError::Binding {
                        op: "delete",
                        name: root.to_owned(),
                    }
                    .into())
                }
            };
            return self.write_binding(root, value);
        }
        if rules::is_binding(root) {
            // Nested write under a binding name: no such container.
            return Err(AccessError::Path(path.join("."))).map_err(Error::from);
        }
        if rules.reserved && rules::is_reserved(root) {
            return Err(AccessError::Reserved(root.to_owned()).into());
        }

        self.kernel.enroll(self.target);
        if rules.record_updates {
            if let Some(record) = self.kernel.record.borrow_mut().as_mut() {
                record.update(self.target);
            }
        }
        self.write(path, value)
    }

    fn write_binding(&self, name: &str, value: Value) -> Result<(), Error> {
        match name {
            "location" | "origin" | "nonce" => Err(AccessError::Binding {
                op: "set",
                name: name.to_owned(),
            }
            .into()),
            "owner" => {
                let lock = Lock::from_value(&value)?;
                self.kernel.enroll(self.target);
                self.kernel
                    .with_creation_mut(self.target, |c| c.bindings.owner = Some(lock));
                self.note_unbound();
                Ok(())
            }
            "satoshis" => {
                let satoshis = parse_satoshis(&value)?;
                self.kernel.enroll(self.target);
                self.kernel
                    .with_creation_mut(self.target, |c| c.bindings.satoshis = satoshis);
                self.note_unbound();
                Ok(())
            }
            _ => unreachable!("is_binding covers all names"),
        }
    }

    fn note_unbound(&self) {
        if let Some(record) = self.kernel.record.borrow_mut().as_mut() {
            record.update(self.target);
            record.mark_unbound(self.target);
        }
    }

    // ---------------------------------------------------------------
    // apply / construct
    // ---------------------------------------------------------------

    /// Dispatches a method call through the kernel.
    pub fn apply(&self, method: &str, args: Vec<Value>) -> Result<Value, Error> {
        self.kernel.op_call(self.target, method, args)
    }

    /// Instantiates the target jig class through the kernel.
    pub fn construct(&self, args: Vec<Value>) -> Result<Value, Error> {
        self.kernel.op_new(self.target, args).map(Value::Jig)
    }

    // ---------------------------------------------------------------
    // Property graph walking
    // ---------------------------------------------------------------

    fn walk(&self, path: &[&str]) -> Result<Value, Error> {
        let root_obj = self.kernel.with_creation(self.target, |c| c.props.clone());
        let mut current = {
            let data = root_obj.borrow();
            match data.props.get(&PropKey::new(path[0])) {
                Some(value) => value.clone(),
                None => return Ok(Value::Undefined),
            }
        };
        for (i, segment) in path.iter().enumerate().skip(1) {
            let next = step(&current, segment);
            match next {
                Some(value) => current = value,
                None => {
                    // Distinguish "missing leaf" from "missing container".
                    if i == path.len() - 1 {
                        return Ok(Value::Undefined);
                    }
                    return Err(AccessError::Path(path[..=i].join(".")).into());
                }
            }
        }
        Ok(current)
    }

    fn write(&self, path: &[&str], value: Option<Value>) -> Result<(), Error> {
        let root_obj = self.kernel.with_creation(self.target, |c| c.props.clone());
        if path.len() == 1 {
            let mut data = root_obj.borrow_mut();
            match value {
                Some(value) => {
                    data.props.insert(PropKey::new(path[0]), value);
                }
                None => {
                    data.props.remove(&PropKey::new(path[0]));
                }
            }
            return Ok(());
        }
        let parent_path = &path[..path.len() - 1];
        let leaf = path[path.len() - 1];
        let parent = self.walk(parent_path)?;
        write_leaf(&parent, leaf, value, path)
    }

    fn describe(&self) -> String {
        self.kernel.with_creation(self.target, |c| match &c.kind {
            CreationKind::Code { code: _ } => "code".to_owned(),
            CreationKind::Instance { .. } => "jig".to_owned(),
            CreationKind::Berry { .. } => "berry".to_owned(),
            CreationKind::Native { name } => name.clone(),
        })
    }
}

fn step(current: &Value, segment: &str) -> Option<Value> {
    match current {
        Value::Object(obj) => obj.borrow().props.get(&PropKey::new(segment)).cloned(),
        Value::Array(arr) => {
            let data = arr.borrow();
            match crate::helpers::array_index(segment) {
                Some(i) if (i as usize) < data.elements.len() => {
                    Some(data.elements[i as usize].clone())
                }
                _ => data.extras.get(&PropKey::new(segment)).cloned(),
            }
        }
        Value::Set(set) => set.borrow().props.get(&PropKey::new(segment)).cloned(),
        Value::Map(map) => map.borrow().props.get(&PropKey::new(segment)).cloned(),
        _ => None,
    }
}

fn write_leaf(
    parent: &Value,
    leaf: &str,
    value: Option<Value>,
    full_path: &[&str],
) -> Result<(), Error> {
    let key = PropKey::new(leaf);
    match parent {
        Value::Object(obj) => {
            let mut data = obj.borrow_mut();
            match value {
                Some(v) => {
                    data.props.insert(key, v);
                }
                None => {
                    data.props.remove(&key);
                }
            }
            Ok(())
        }
        Value::Array(arr) => {
            let mut data = arr.borrow_mut();
            match crate::helpers::array_index(leaf) {
                Some(i) if (i as usize) < data.elements.len() => match value {
                    Some(v) => {
                        data.elements[i as usize] = v;
                        Ok(())
                    }
                    None => {
                        data.elements[i as usize] = Value::Undefined;
                        Ok(())
                    }
                },
                Some(i) if (i as usize) == data.elements.len() => {
                    if let Some(v) = value {
                        data.elements.push(v);
                    }
                    Ok(())
                }
                _ => {
                    match value {
                        Some(v) => {
                            data.extras.insert(key, v);
                        }
                        None => {
                            data.extras.remove(&key);
                        }
                    }
                    Ok(())
                }
            }
        }
        Value::Set(set) => {
            let mut data = set.borrow_mut();
            match value {
                Some(v) => {
                    data.props.insert(key, v);
                }
                None => {
                    data.props.remove(&key);
                }
            }
            Ok(())
        }
        Value::Map(map) => {
            let mut data = map.borrow_mut();
            match value {
                Some(v) => {
                    data.props.insert(key, v);
                }
                None => {
                    data.props.remove(&key);
                }
            }
            Ok(())
        }
        _ => Err(AccessError::Path(full_path.join(".")).into()),
    }
}

fn lock_to_value(lock: &Lock) -> Value {
    match lock {
        Lock::Common(common) => Value::String(common.address.clone()),
        Lock::Script(script) => {
            let obj = crate::value::ObjectRef::default();
            obj.borrow_mut()
                .props
                .insert(PropKey::new("script"), Value::bytes(script.script.clone()));
            obj.borrow_mut()
                .props
                .insert(PropKey::new("domain"), Value::Number(script.domain as f64));
            Value::Object(obj)
        }
    }
}
