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

//! The closed value universe of the sandbox.
//!
//! Jig state is built exclusively from these intrinsics: primitives, a
//! single byte-array kind, insertion-ordered sets and maps, plain objects
//! and arrays, and opaque cross-object references. Compound nodes are
//! shared (cloning a [`Value`] aliases the node), so state graphs may
//! contain duplicates and cycles, which the codec serializes with `$dup`
//! back-references.
//!
//! The enum being closed is the whitelist: host types outside it simply
//! cannot enter jig state.

use std::cell::{Ref, RefCell, RefMut};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::helpers::compare_keys;

/// Opaque reference to a creation (code jig, jig instance or berry) in the
/// kernel arena. The codec never looks inside; it resolves these through
/// caller-supplied hooks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JigRef(pub u32);

impl fmt::Debug for JigRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JigRef({})", self.0)
    }
}

/// Property key ordered by the canonical comparator: array-index keys
/// first in numeric order, then the remaining keys lexicographically.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropKey(pub String);

impl PropKey {
    /// Wraps a key.
    pub fn new(key: impl Into<String>) -> Self {
        PropKey(key.into())
    }

    /// Borrows the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialOrd for PropKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PropKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.0, &other.0)
    }
}

/// Canonically ordered property table.
pub type Props = BTreeMap<PropKey, Value>;

/// Plain object node. `class` tags instances of deployed sidekick classes
/// ("arbitrary objects"); untagged objects are plain intrinsic objects.
#[derive(Debug, Default)]
pub struct ObjectData {
    /// Own properties in canonical order.
    pub props: Props,
    /// Sidekick class for arbitrary-object instances.
    pub class: Option<JigRef>,
}

/// Array node: a dense prefix plus sparse slots and non-index properties.
#[derive(Debug, Default)]
pub struct ArrayData {
    /// The dense elements starting at index 0.
    pub elements: Vec<Value>,
    /// Sparse indices past the dense prefix and non-index properties.
    pub extras: Props,
}

/// Insertion-ordered set node.
#[derive(Debug, Default)]
pub struct SetData {
    /// Entries in insertion order.
    pub entries: Vec<Value>,
    /// Own properties attached to the set object itself.
    pub props: Props,
}

/// Insertion-ordered map node.
#[derive(Debug, Default)]
pub struct MapData {
    /// Key-value entries in insertion order.
    pub entries: Vec<(Value, Value)>,
    /// Own properties attached to the map object itself.
    pub props: Props,
}

macro_rules! shared_node {
    ($name:ident, $data:ty) => {
        /// Shared handle to a compound node; clones alias the same node.
        #[derive(Clone, Default)]
        pub struct $name(Rc<RefCell<$data>>);

        impl $name {
            /// Allocates a fresh node.
            pub fn new(data: $data) -> Self {
                $name(Rc::new(RefCell::new(data)))
            }

            /// Immutably borrows the node.
            pub fn borrow(&self) -> Ref<'_, $data> {
                self.0.borrow()
            }

            /// Mutably borrows the node.
            pub fn borrow_mut(&self) -> RefMut<'_, $data> {
                self.0.borrow_mut()
            }

            /// Node identity for duplicate and cycle detection.
            pub fn ptr_id(&self) -> usize {
                Rc::as_ptr(&self.0) as usize
            }

            /// Whether both handles alias the same node.
            pub fn same(&self, other: &Self) -> bool {
                Rc::ptr_eq(&self.0, &other.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0.try_borrow() {
                    Ok(data) => fmt::Debug::fmt(&*data, f),
                    Err(_) => write!(f, "<in cycle>"),
                }
            }
        }
    };
}

shared_node!(ObjectRef, ObjectData);
shared_node!(ArrayRef, ArrayData);
shared_node!(SetRef, SetData);
shared_node!(MapRef, MapData);
shared_node!(BytesRef, Vec<u8>);

/// A sandbox value.
#[derive(Clone, Debug)]
pub enum Value {
    /// The absent value.
    Undefined,
    /// The null value.
    Null,
    /// Boolean.
    Bool(bool),
    /// IEEE-754 double, including −0, NaN and ±∞.
    Number(f64),
    /// Unicode string.
    String(String),
    /// The single permitted typed array: unsigned 8-bit bytes.
    Bytes(BytesRef),
    /// Plain or arbitrary object.
    Object(ObjectRef),
    /// Array.
    Array(ArrayRef),
    /// Insertion-ordered set.
    Set(SetRef),
    /// Insertion-ordered map.
    Map(MapRef),
    /// Reference to another creation.
    Jig(JigRef),
}

impl Value {
    /// Allocates an empty plain object.
    pub fn object() -> Value {
        Value::Object(ObjectRef::default())
    }

    /// Allocates an empty array.
    pub fn array() -> Value {
        Value::Array(ArrayRef::default())
    }

    /// Allocates an empty set.
    pub fn set() -> Value {
        Value::Set(SetRef::default())
    }

    /// Allocates an empty map.
    pub fn map() -> Value {
        Value::Map(MapRef::default())
    }

    /// Allocates a byte array.
    pub fn bytes(data: Vec<u8>) -> Value {
        Value::Bytes(BytesRef::new(data))
    }

    /// Kind name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Jig(_) => "jig",
        }
    }

    /// Node identity for compound values; `None` for primitives.
    pub fn ptr_id(&self) -> Option<usize> {
        match self {
            Value::Bytes(r) => Some(r.ptr_id()),
            Value::Object(r) => Some(r.ptr_id()),
            Value::Array(r) => Some(r.ptr_id()),
            Value::Set(r) => Some(r.ptr_id()),
            Value::Map(r) => Some(r.ptr_id()),
            _ => None,
        }
    }

    /// SameValueZero identity: primitives by value (NaN equals NaN, −0
    /// equals 0), compound nodes by aliasing, jig references by target.
    /// This is the identity sets and map keys deduplicate on.
    pub fn same_value_zero(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => {
                (a.is_nan() && b.is_nan()) || a == b
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Jig(a), Value::Jig(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a.same(b),
            (Value::Object(a), Value::Object(b)) => a.same(b),
            (Value::Array(a), Value::Array(b)) => a.same(b),
            (Value::Set(a), Value::Set(b)) => a.same(b),
            (Value::Map(a), Value::Map(b)) => a.same(b),
            _ => false,
        }
    }

    /// Structural equality, cycle-safe. Numbers compare by bit pattern
    /// except that any NaN equals any NaN, so −0 and 0 stay distinct and
    /// round-trip tests can rely on exact recovery.
    pub fn deep_eq(&self, other: &Value) -> bool {
        let mut visited = Vec::new();
        deep_eq_inner(self, other, &mut visited)
    }

    /// Copies the whole reachable graph, preserving internal aliasing and
    /// cycles. Used for state snapshots and for handing values out of the
    /// membrane without leaking mutable aliases.
    pub fn deep_clone(&self) -> Value {
        let mut memo = std::collections::HashMap::new();
        deep_clone_inner(self, &mut memo)
    }
}

fn deep_clone_inner(
    value: &Value,
    memo: &mut std::collections::HashMap<usize, Value>,
) -> Value {
    if let Some(ptr) = value.ptr_id() {
        if let Some(copy) = memo.get(&ptr) {
            return copy.clone();
        }
    }
    match value {
        Value::Undefined => Value::Undefined,
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(*b),
        Value::Number(n) => Value::Number(*n),
        Value::String(s) => Value::String(s.clone()),
        Value::Jig(jig) => Value::Jig(*jig),
        Value::Bytes(bytes) => {
            let copy = BytesRef::new(bytes.borrow().clone());
            memo.insert(bytes.ptr_id(), Value::Bytes(copy.clone()));
            Value::Bytes(copy)
        }
        Value::Object(obj) => {
            let copy = ObjectRef::default();
            memo.insert(obj.ptr_id(), Value::Object(copy.clone()));
            let (class, pairs) = {
                let data = obj.borrow();
                (data.class, data.props.clone())
            };
            copy.borrow_mut().class = class;
            for (key, value) in &pairs {
                let cloned = deep_clone_inner(value, memo);
                copy.borrow_mut().props.insert(key.clone(), cloned);
            }
            Value::Object(copy)
        }
        Value::Array(arr) => {
            let copy = ArrayRef::default();
            memo.insert(arr.ptr_id(), Value::Array(copy.clone()));
            let (elements, extras) = {
                let data = arr.borrow();
                (data.elements.clone(), data.extras.clone())
            };
            for element in &elements {
                let cloned = deep_clone_inner(element, memo);
                copy.borrow_mut().elements.push(cloned);
            }
            for (key, value) in &extras {
                let cloned = deep_clone_inner(value, memo);
                copy.borrow_mut().extras.insert(key.clone(), cloned);
            }
            Value::Array(copy)
        }
        Value::Set(set) => {
            let copy = SetRef::default();
            memo.insert(set.ptr_id(), Value::Set(copy.clone()));
            let (entries, props) = {
                let data = set.borrow();
                (data.entries.clone(), data.props.clone())
            };
            for entry in &entries {
                let cloned = deep_clone_inner(entry, memo);
                copy.borrow_mut().entries.push(cloned);
            }
            for (key, value) in &props {
                let cloned = deep_clone_inner(value, memo);
                copy.borrow_mut().props.insert(key.clone(), cloned);
            }
            Value::Set(copy)
        }
        Value::Map(map) => {
            let copy = MapRef::default();
            memo.insert(map.ptr_id(), Value::Map(copy.clone()));
            let (entries, props) = {
                let data = map.borrow();
                (data.entries.clone(), data.props.clone())
            };
            for (key, value) in &entries {
                let ck = deep_clone_inner(key, memo);
                let cv = deep_clone_inner(value, memo);
                copy.borrow_mut().entries.push((ck, cv));
            }
            for (key, value) in &props {
                let cloned = deep_clone_inner(value, memo);
                copy.borrow_mut().props.insert(key.clone(), cloned);
            }
            Value::Map(copy)
        }
    }
}

fn deep_eq_inner(a: &Value, b: &Value, visited: &mut Vec<(usize, usize)>) -> bool {
    if let (Some(pa), Some(pb)) = (a.ptr_id(), b.ptr_id()) {
        if visited.contains(&(pa, pb)) {
            return true;
        }
        visited.push((pa, pb));
    }
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => {
            (x.is_nan() && y.is_nan()) || x.to_bits() == y.to_bits()
        }
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Jig(x), Value::Jig(y)) => x == y,
        (Value::Bytes(x), Value::Bytes(y)) => *x.borrow() == *y.borrow(),
        (Value::Object(x), Value::Object(y)) => {
            let x = x.borrow();
            let y = y.borrow();
            x.class == y.class && props_eq(&x.props, &y.props, visited)
        }
        (Value::Array(x), Value::Array(y)) => {
            let x = x.borrow();
            let y = y.borrow();
            x.elements.len() == y.elements.len()
                && x.elements
                    .iter()
                    .zip(&y.elements)
                    .all(|(a, b)| deep_eq_inner(a, b, visited))
                && props_eq(&x.extras, &y.extras, visited)
        }
        (Value::Set(x), Value::Set(y)) => {
            let x = x.borrow();
            let y = y.borrow();
            x.entries.len() == y.entries.len()
                && x.entries
                    .iter()
                    .zip(&y.entries)
                    .all(|(a, b)| deep_eq_inner(a, b, visited))
                && props_eq(&x.props, &y.props, visited)
        }
        (Value::Map(x), Value::Map(y)) => {
            let x = x.borrow();
            let y = y.borrow();
            x.entries.len() == y.entries.len()
                && x.entries.iter().zip(&y.entries).all(|((ka, va), (kb, vb))| {
                    deep_eq_inner(ka, kb, visited) && deep_eq_inner(va, vb, visited)
                })
                && props_eq(&x.props, &y.props, visited)
        }
        _ => false,
    }
}

fn props_eq(a: &Props, b: &Props, visited: &mut Vec<(usize, usize)>) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|((ka, va), (kb, vb))| ka == kb && deep_eq_inner(va, vb, visited))
}

impl SetData {
    /// Adds an entry unless an entry with the same identity is present.
    pub fn add(&mut self, value: Value) -> bool {
        if self.entries.iter().any(|e| e.same_value_zero(&value)) {
            return false;
        }
        self.entries.push(value);
        true
    }

    /// Whether an entry with the same identity is present.
    pub fn has(&self, value: &Value) -> bool {
        self.entries.iter().any(|e| e.same_value_zero(value))
    }

    /// Removes the entry with the same identity, if present.
    pub fn delete(&mut self, value: &Value) -> bool {
        match self.entries.iter().position(|e| e.same_value_zero(value)) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }
}

impl MapData {
    /// Looks up the value stored under a key with the same identity.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k.same_value_zero(key))
            .map(|(_, v)| v)
    }

    /// Inserts or replaces the entry for the key, preserving the original
    /// insertion position on replacement.
    pub fn set(&mut self, key: Value, value: Value) {
        for entry in &mut self.entries {
            if entry.0.same_value_zero(&key) {
                entry.1 = value;
                return;
            }
        }
        self.entries.push((key, value));
    }

    /// Whether an entry for the key is present.
    pub fn has(&self, key: &Value) -> bool {
        self.entries.iter().any(|(k, _)| k.same_value_zero(key))
    }

    /// Removes the entry for the key, if present.
    pub fn delete(&mut self, key: &Value) -> bool {
        match self.entries.iter().position(|(k, _)| k.same_value_zero(key)) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Number(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Number(v as f64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Value {
        Value::Number(f64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Number(f64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Value {
        Value::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_alias() {
        let obj = Value::object();
        let alias = obj.clone();
        if let (Value::Object(a), Value::Object(b)) = (&obj, &alias) {
            a.borrow_mut()
                .props
                .insert(PropKey::new("n"), Value::from(1));
            assert_eq!(b.borrow().props.len(), 1);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn props_iterate_in_canonical_order() {
        let mut props = Props::new();
        for key in &["b", "a", "10", "2"] {
            props.insert(PropKey::new(*key), Value::Undefined);
        }
        let keys: Vec<&str> = props.keys().map(PropKey::as_str).collect();
        assert_eq!(keys, vec!["2", "10", "a", "b"]);
    }

    #[test]
    fn same_value_zero_semantics() {
        assert!(Value::Number(f64::NAN).same_value_zero(&Value::Number(f64::NAN)));
        assert!(Value::Number(0.0).same_value_zero(&Value::Number(-0.0)));
        let a = Value::object();
        let b = Value::object();
        assert!(a.same_value_zero(&a.clone()));
        assert!(!a.same_value_zero(&b));
    }

    #[test]
    fn deep_eq_distinguishes_negative_zero() {
        assert!(Value::Number(0.0).deep_eq(&Value::Number(0.0)));
        assert!(!Value::Number(0.0).deep_eq(&Value::Number(-0.0)));
        assert!(Value::Number(f64::NAN).deep_eq(&Value::Number(f64::NAN)));
    }

    #[test]
    fn deep_eq_handles_cycles() {
        let a = ObjectRef::default();
        a.borrow_mut()
            .props
            .insert(PropKey::new("me"), Value::Object(a.clone()));
        let b = ObjectRef::default();
        b.borrow_mut()
            .props
            .insert(PropKey::new("me"), Value::Object(b.clone()));
        assert!(Value::Object(a).deep_eq(&Value::Object(b)));
    }

    #[test]
    fn set_dedups_by_identity() {
        let mut set = SetData::default();
        assert!(set.add(Value::from(1)));
        assert!(!set.add(Value::from(1)));
        let obj = Value::object();
        assert!(set.add(obj.clone()));
        assert!(!set.add(obj.clone()));
        assert!(set.add(Value::object()));
        assert_eq!(set.entries.len(), 3);
        assert!(set.delete(&obj));
        assert_eq!(set.entries.len(), 2);
    }

    #[test]
    fn deep_clone_preserves_aliasing_and_cycles() {
        let shared = Value::object();
        let root = ObjectRef::default();
        root.borrow_mut()
            .props
            .insert(PropKey::new("a"), shared.clone());
        root.borrow_mut()
            .props
            .insert(PropKey::new("b"), shared.clone());
        root.borrow_mut()
            .props
            .insert(PropKey::new("me"), Value::Object(root.clone()));

        let copy = Value::Object(root.clone()).deep_clone();
        assert!(copy.deep_eq(&Value::Object(root.clone())));
        if let Value::Object(out) = &copy {
            let a = out.borrow().props.get(&PropKey::new("a")).cloned().unwrap();
            let b = out.borrow().props.get(&PropKey::new("b")).cloned().unwrap();
            let me = out.borrow().props.get(&PropKey::new("me")).cloned().unwrap();
            assert!(a.same_value_zero(&b), "aliasing preserved");
            assert!(!a.same_value_zero(&shared), "nodes are fresh");
            assert!(me.same_value_zero(&copy), "cycle points at the copy");
        } else {
            unreachable!();
        }
    }

    #[test]
    fn map_replaces_in_place() {
        let mut map = MapData::default();
        map.set(Value::from("k"), Value::from(1));
        map.set(Value::from("j"), Value::from(2));
        map.set(Value::from("k"), Value::from(3));
        assert_eq!(map.entries.len(), 2);
        assert!(map.entries[0].1.deep_eq(&Value::from(3)));
    }
}
