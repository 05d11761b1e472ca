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

//! Canonical codec between sandbox values and their JSON-shaped on-chain
//! form.
//!
//! Every accepted value round-trips. Special tagged forms:
//!
//! | Tag | Encodes |
//! |---|---|
//! | `$n0` | negative zero |
//! | `$nan`, `$inf`, `$ninf` | NaN / ±∞ |
//! | `$und` | undefined |
//! | `$obj` | object whose own keys start with `$` |
//! | `$arr` | array with sparse slots or non-index properties |
//! | `$set`, `$map` | ordered collections, with optional `props` |
//! | `$ui8a` | base64 byte array |
//! | `$dup` | back-reference to a previously emitted position |
//! | `$jig` | opaque cross-object reference, resolved via hooks |
//! | `$arb` | arbitrary object, with its class under `T` |
//!
//! Emission walks the value graph once, emitting each fresh node at its
//! first occurrence and `$dup` paths thereafter; the decoder allocates
//! shells before descending so cycles patch up. Both sides walk object
//! keys in canonical comparator order, which is what guarantees a `$dup`
//! is always decoded after its target.

use std::collections::HashMap;

use serde_json::{json, Map as JsonMap, Value as Json};
use thiserror::Error;

use crate::helpers::{array_index, compare_keys};
use crate::value::{
    ArrayRef, BytesRef, JigRef, MapRef, ObjectRef, PropKey, Props, SetRef, Value,
};

/// Errors raised while encoding or decoding state.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A value outside the supported universe was encountered.
    #[error("Cannot encode {0}")]
    Unsupported(String),
    /// The wire form carried an unknown or malformed tag object.
    #[error("Bad tag: {0}")]
    BadTag(String),
    /// A `$dup` path did not resolve to a previously decoded node.
    #[error("Bad dup path: {0}")]
    BadDup(String),
    /// A `$ui8a` payload was not valid base64.
    #[error("Bad bytes: {0}")]
    BadBytes(String),
    /// A jig reference appeared with no resolution hook installed.
    #[error("Cannot encode jig reference outside a transaction context")]
    NoJigHook,
    /// The jig hook rejected a reference.
    #[error("Bad jig reference: {0}")]
    BadJig(String),
}

/// Hook rendering a jig reference to its opaque wire form.
pub type EncodeJig<'a> = dyn FnMut(JigRef) -> Result<Json, CodecError> + 'a;

/// Hook resolving an opaque wire form back to a jig value.
pub type DecodeJig<'a> = dyn FnMut(&Json) -> Result<Value, CodecError> + 'a;

/// Encodes a value that must not contain jig references.
pub fn encode(value: &Value) -> Result<Json, CodecError> {
    encode_with(value, &mut |_| Err(CodecError::NoJigHook))
}

/// Encodes a value, rendering jig references through `encode_jig`.
pub fn encode_with(value: &Value, encode_jig: &mut EncodeJig<'_>) -> Result<Json, CodecError> {
    let mut encoder = Encoder {
        encode_jig,
        paths: HashMap::new(),
    };
    let mut path = Vec::new();
    encoder.encode(value, &mut path)
}

/// Decodes a wire form that must not contain jig references.
pub fn decode(json: &Json) -> Result<Value, CodecError> {
    decode_with(json, &mut |_| Err(CodecError::NoJigHook))
}

/// Decodes a wire form, resolving jig references through `decode_jig`.
pub fn decode_with(json: &Json, decode_jig: &mut DecodeJig<'_>) -> Result<Value, CodecError> {
    let mut decoder = Decoder {
        decode_jig,
        nodes: HashMap::new(),
    };
    let mut path = Vec::new();
    decoder.decode(json, &mut path)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum PathComp {
    Key(String),
    Idx(usize),
}

impl PathComp {
    fn to_json(&self) -> Json {
        match self {
            PathComp::Key(k) => Json::String(k.clone()),
            PathComp::Idx(i) => json!(i),
        }
    }

    fn from_json(json: &Json) -> Result<Self, CodecError> {
        match json {
            Json::String(s) => Ok(PathComp::Key(s.clone())),
            Json::Number(n) => n
                .as_u64()
                .map(|i| PathComp::Idx(i as usize))
                .ok_or_else(|| CodecError::BadDup(json.to_string())),
            other => Err(CodecError::BadDup(other.to_string())),
        }
    }
}

struct Encoder<'a, 'b> {
    encode_jig: &'b mut EncodeJig<'a>,
    paths: HashMap<usize, Vec<PathComp>>,
}

impl Encoder<'_, '_> {
    fn encode(&mut self, value: &Value, path: &mut Vec<PathComp>) -> Result<Json, CodecError> {
        if let Some(ptr) = value.ptr_id() {
            if let Some(first) = self.paths.get(&ptr) {
                let comps: Vec<Json> = first.iter().map(PathComp::to_json).collect();
                return Ok(json!({ "$dup": comps }));
            }
            self.paths.insert(ptr, path.clone());
        }
        match value {
            Value::Undefined => Ok(json!({ "$und": 1 })),
            Value::Null => Ok(Json::Null),
            Value::Bool(b) => Ok(Json::Bool(*b)),
            Value::Number(n) => Ok(encode_number(*n)),
            Value::String(s) => Ok(Json::String(s.clone())),
            Value::Bytes(bytes) => Ok(json!({ "$ui8a": base64::encode(&*bytes.borrow()) })),
            Value::Jig(jig) => {
                let rendered = (self.encode_jig)(*jig)?;
                Ok(json!({ "$jig": rendered }))
            }
            Value::Object(obj) => self.encode_object(obj, path),
            Value::Array(arr) => self.encode_array(arr, path),
            Value::Set(set) => self.encode_set(set, path),
            Value::Map(map) => self.encode_map(map, path),
        }
    }

    fn encode_object(
        &mut self,
        obj: &ObjectRef,
        path: &mut Vec<PathComp>,
    ) -> Result<Json, CodecError> {
        let (class, pairs) = {
            let data = obj.borrow();
            let pairs: Vec<(String, Value)> = data
                .props
                .iter()
                .map(|(k, v)| (k.as_str().to_owned(), v.clone()))
                .collect();
            (data.class, pairs)
        };
        if let Some(class) = class {
            // Arbitrary object: state under $arb, its class under T.
            path.push(PathComp::Key("$arb".to_owned()));
            let state = self.encode_pairs(pairs, path)?;
            path.pop();
            let class_ref = (self.encode_jig)(class)?;
            return Ok(json!({ "$arb": state, "T": { "$jig": class_ref } }));
        }
        self.encode_pairs(pairs, path)
    }

    // Emits a property table as a plain object, escaping to `$obj` when
    // any own key starts with `$`.
    fn encode_pairs(
        &mut self,
        pairs: Vec<(String, Value)>,
        path: &mut Vec<PathComp>,
    ) -> Result<Json, CodecError> {
        let escape = pairs.iter().any(|(k, _)| k.starts_with('$'));
        if escape {
            path.push(PathComp::Key("$obj".to_owned()));
        }
        let mut out = JsonMap::new();
        for (key, value) in pairs {
            path.push(PathComp::Key(key.clone()));
            let encoded = self.encode(&value, path)?;
            path.pop();
            out.insert(key, encoded);
        }
        if escape {
            path.pop();
            Ok(json!({ "$obj": Json::Object(out) }))
        } else {
            Ok(Json::Object(out))
        }
    }

    fn encode_array(
        &mut self,
        arr: &ArrayRef,
        path: &mut Vec<PathComp>,
    ) -> Result<Json, CodecError> {
        let (elements, extras) = {
            let data = arr.borrow();
            let extras: Vec<(String, Value)> = data
                .extras
                .iter()
                .map(|(k, v)| (k.as_str().to_owned(), v.clone()))
                .collect();
            (data.elements.clone(), extras)
        };
        if extras.is_empty() {
            let mut out = Vec::with_capacity(elements.len());
            for (i, element) in elements.iter().enumerate() {
                path.push(PathComp::Idx(i));
                out.push(self.encode(element, path)?);
                path.pop();
            }
            return Ok(Json::Array(out));
        }
        // Sparse slots or non-index properties: object form under $arr.
        path.push(PathComp::Key("$arr".to_owned()));
        let mut out = JsonMap::new();
        for (i, element) in elements.iter().enumerate() {
            let key = i.to_string();
            path.push(PathComp::Key(key.clone()));
            out.insert(key, self.encode(element, path)?);
            path.pop();
        }
        for (key, value) in extras {
            path.push(PathComp::Key(key.clone()));
            let encoded = self.encode(&value, path)?;
            path.pop();
            out.insert(key, encoded);
        }
        path.pop();
        Ok(json!({ "$arr": Json::Object(out) }))
    }

    fn encode_set(&mut self, set: &SetRef, path: &mut Vec<PathComp>) -> Result<Json, CodecError> {
        let (entries, props) = {
            let data = set.borrow();
            (data.entries.clone(), clone_props(&data.props))
        };
        let mut encoded = Vec::with_capacity(entries.len());
        path.push(PathComp::Key("$set".to_owned()));
        for (i, entry) in entries.iter().enumerate() {
            path.push(PathComp::Idx(i));
            encoded.push(self.encode(entry, path)?);
            path.pop();
        }
        path.pop();
        let mut out = JsonMap::new();
        out.insert("$set".to_owned(), Json::Array(encoded));
        if !props.is_empty() {
            path.push(PathComp::Key("props".to_owned()));
            let props = self.encode_loose_props(props, path)?;
            path.pop();
            out.insert("props".to_owned(), props);
        }
        Ok(Json::Object(out))
    }

    fn encode_map(&mut self, map: &MapRef, path: &mut Vec<PathComp>) -> Result<Json, CodecError> {
        let (entries, props) = {
            let data = map.borrow();
            (data.entries.clone(), clone_props(&data.props))
        };
        let mut encoded = Vec::with_capacity(entries.len());
        path.push(PathComp::Key("$map".to_owned()));
        for (i, (key, value)) in entries.iter().enumerate() {
            path.push(PathComp::Idx(i));
            path.push(PathComp::Idx(0));
            let ek = self.encode(key, path)?;
            path.pop();
            path.push(PathComp::Idx(1));
            let ev = self.encode(value, path)?;
            path.pop();
            path.pop();
            encoded.push(Json::Array(vec![ek, ev]));
        }
        path.pop();
        let mut out = JsonMap::new();
        out.insert("$map".to_owned(), Json::Array(encoded));
        if !props.is_empty() {
            path.push(PathComp::Key("props".to_owned()));
            let props = self.encode_loose_props(props, path)?;
            path.pop();
            out.insert("props".to_owned(), props);
        }
        Ok(Json::Object(out))
    }

    // Properties hanging off a set/map node (the `props` side table).
    fn encode_loose_props(
        &mut self,
        props: Vec<(String, Value)>,
        path: &mut Vec<PathComp>,
    ) -> Result<Json, CodecError> {
        let mut out = JsonMap::new();
        for (key, value) in props {
            path.push(PathComp::Key(key.clone()));
            let encoded = self.encode(&value, path)?;
            path.pop();
            out.insert(key, encoded);
        }
        Ok(Json::Object(out))
    }
}

fn clone_props(props: &Props) -> Vec<(String, Value)> {
    props
        .iter()
        .map(|(k, v)| (k.as_str().to_owned(), v.clone()))
        .collect()
}

fn encode_number(n: f64) -> Json {
    if n.is_nan() {
        return json!({ "$nan": 1 });
    }
    if n == f64::INFINITY {
        return json!({ "$inf": 1 });
    }
    if n == f64::NEG_INFINITY {
        return json!({ "$ninf": 1 });
    }
    if n == 0.0 && n.is_sign_negative() {
        return json!({ "$n0": 1 });
    }
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return json!(n as i64);
    }
    json!(n)
}

struct Decoder<'a, 'b> {
    decode_jig: &'b mut DecodeJig<'a>,
    nodes: HashMap<Vec<PathComp>, Value>,
}

impl Decoder<'_, '_> {
    fn decode(&mut self, json: &Json, path: &mut Vec<PathComp>) -> Result<Value, CodecError> {
        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| CodecError::BadTag(format!("non-finite number {}", n))),
            Json::String(s) => Ok(Value::String(s.clone())),
            Json::Array(items) => {
                let arr = ArrayRef::default();
                self.nodes.insert(path.clone(), Value::Array(arr.clone()));
                for (i, item) in items.iter().enumerate() {
                    path.push(PathComp::Idx(i));
                    let element = self.decode(item, path)?;
                    path.pop();
                    arr.borrow_mut().elements.push(element);
                }
                Ok(Value::Array(arr))
            }
            Json::Object(map) => self.decode_object(map, path),
        }
    }

    fn decode_object(
        &mut self,
        map: &JsonMap<String, Json>,
        path: &mut Vec<PathComp>,
    ) -> Result<Value, CodecError> {
        let tagged = map.keys().any(|k| k.starts_with('$'));
        if !tagged {
            let obj = ObjectRef::default();
            self.nodes.insert(path.clone(), Value::Object(obj.clone()));
            self.decode_object_into(&obj, map, path)?;
            return Ok(Value::Object(obj));
        }
        let tag_keys: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|k| k.starts_with('$'))
            .collect();
        if tag_keys.len() != 1 {
            return Err(CodecError::BadTag(format!(
                "conflicting tags {}",
                tag_keys.join(", ")
            )));
        }
        let tag = tag_keys[0];
        match tag {
            "$und" => expect_keys(map, &["$und"]).map(|_| Value::Undefined),
            "$n0" => expect_keys(map, &["$n0"]).map(|_| Value::Number(-0.0)),
            "$nan" => expect_keys(map, &["$nan"]).map(|_| Value::Number(f64::NAN)),
            "$inf" => expect_keys(map, &["$inf"]).map(|_| Value::Number(f64::INFINITY)),
            "$ninf" => expect_keys(map, &["$ninf"]).map(|_| Value::Number(f64::NEG_INFINITY)),
            "$ui8a" => {
                expect_keys(map, &["$ui8a"])?;
                let text = map["$ui8a"]
                    .as_str()
                    .ok_or_else(|| CodecError::BadTag("$ui8a payload must be a string".into()))?;
                let data =
                    base64::decode(text).map_err(|e| CodecError::BadBytes(e.to_string()))?;
                let bytes = BytesRef::new(data);
                self.nodes.insert(path.clone(), Value::Bytes(bytes.clone()));
                Ok(Value::Bytes(bytes))
            }
            "$jig" => {
                expect_keys(map, &["$jig"])?;
                (self.decode_jig)(&map["$jig"])
            }
            "$dup" => {
                expect_keys(map, &["$dup"])?;
                let comps = map["$dup"]
                    .as_array()
                    .ok_or_else(|| CodecError::BadDup("path must be an array".into()))?;
                let mut target = Vec::with_capacity(comps.len());
                for comp in comps {
                    target.push(PathComp::from_json(comp)?);
                }
                self.nodes
                    .get(&target)
                    .cloned()
                    .ok_or_else(|| CodecError::BadDup(format!("{:?}", target)))
            }
            "$obj" => {
                expect_keys(map, &["$obj"])?;
                let inner = map["$obj"]
                    .as_object()
                    .ok_or_else(|| CodecError::BadTag("$obj payload must be an object".into()))?;
                // Register the shell at the outer position before
                // descending so self-references resolve.
                let obj = ObjectRef::default();
                self.nodes.insert(path.clone(), Value::Object(obj.clone()));
                path.push(PathComp::Key("$obj".to_owned()));
                self.decode_object_into(&obj, inner, path)?;
                path.pop();
                Ok(Value::Object(obj))
            }
            "$arr" => {
                expect_keys(map, &["$arr"])?;
                let inner = map["$arr"]
                    .as_object()
                    .ok_or_else(|| CodecError::BadTag("$arr payload must be an object".into()))?;
                let arr = ArrayRef::default();
                self.nodes.insert(path.clone(), Value::Array(arr.clone()));
                path.push(PathComp::Key("$arr".to_owned()));
                let mut pairs: Vec<(&String, &Json)> = inner.iter().collect();
                pairs.sort_by(|a, b| compare_keys(a.0, b.0));
                for (key, item) in pairs {
                    path.push(PathComp::Key(key.clone()));
                    let value = self.decode(item, path)?;
                    path.pop();
                    let mut data = arr.borrow_mut();
                    match array_index(key) {
                        Some(i) if (i as usize) == data.elements.len() => {
                            data.elements.push(value);
                        }
                        _ => {
                            data.extras.insert(PropKey::new(key.clone()), value);
                        }
                    }
                }
                path.pop();
                Ok(Value::Array(arr))
            }
            "$set" => {
                expect_keys(map, &["$set", "props"])?;
                let items = map["$set"]
                    .as_array()
                    .ok_or_else(|| CodecError::BadTag("$set payload must be an array".into()))?;
                let set = SetRef::default();
                self.nodes.insert(path.clone(), Value::Set(set.clone()));
                path.push(PathComp::Key("$set".to_owned()));
                for (i, item) in items.iter().enumerate() {
                    path.push(PathComp::Idx(i));
                    let entry = self.decode(item, path)?;
                    path.pop();
                    set.borrow_mut().entries.push(entry);
                }
                path.pop();
                if let Some(props) = map.get("props") {
                    path.push(PathComp::Key("props".to_owned()));
                    let props = self.decode_loose_props(props, path)?;
                    path.pop();
                    set.borrow_mut().props = props;
                }
                Ok(Value::Set(set))
            }
            "$map" => {
                expect_keys(map, &["$map", "props"])?;
                let items = map["$map"]
                    .as_array()
                    .ok_or_else(|| CodecError::BadTag("$map payload must be an array".into()))?;
                let out = MapRef::default();
                self.nodes.insert(path.clone(), Value::Map(out.clone()));
                path.push(PathComp::Key("$map".to_owned()));
                for (i, item) in items.iter().enumerate() {
                    let pair = item.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                        CodecError::BadTag("$map entries must be [key, value] pairs".into())
                    })?;
                    path.push(PathComp::Idx(i));
                    path.push(PathComp::Idx(0));
                    let key = self.decode(&pair[0], path)?;
                    path.pop();
                    path.push(PathComp::Idx(1));
                    let value = self.decode(&pair[1], path)?;
                    path.pop();
                    path.pop();
                    out.borrow_mut().entries.push((key, value));
                }
                path.pop();
                if let Some(props) = map.get("props") {
                    path.push(PathComp::Key("props".to_owned()));
                    let props = self.decode_loose_props(props, path)?;
                    path.pop();
                    out.borrow_mut().props = props;
                }
                Ok(Value::Map(out))
            }
            "$arb" => {
                expect_keys(map, &["$arb", "T"])?;
                let class_json = map
                    .get("T")
                    .and_then(|t| t.as_object())
                    .and_then(|t| t.get("$jig"))
                    .ok_or_else(|| CodecError::BadTag("$arb requires a T class".into()))?;
                let class = match (self.decode_jig)(class_json)? {
                    Value::Jig(jig) => jig,
                    other => {
                        return Err(CodecError::BadJig(format!(
                            "$arb class resolved to {}",
                            other.type_name()
                        )))
                    }
                };
                let state = map["$arb"]
                    .as_object()
                    .ok_or_else(|| CodecError::BadTag("$arb state must be an object".into()))?;
                let obj = ObjectRef::default();
                obj.borrow_mut().class = Some(class);
                self.nodes.insert(path.clone(), Value::Object(obj.clone()));
                path.push(PathComp::Key("$arb".to_owned()));
                if state.len() == 1 && state.contains_key("$obj") {
                    let inner = state["$obj"].as_object().ok_or_else(|| {
                        CodecError::BadTag("$obj payload must be an object".into())
                    })?;
                    path.push(PathComp::Key("$obj".to_owned()));
                    self.decode_object_into(&obj, inner, path)?;
                    path.pop();
                } else if state.keys().any(|k| k.starts_with('$')) {
                    return Err(CodecError::BadTag("unescaped $ key in $arb state".into()));
                } else {
                    self.decode_object_into(&obj, state, path)?;
                }
                path.pop();
                Ok(Value::Object(obj))
            }
            other => Err(CodecError::BadTag(other.to_owned())),
        }
    }

    // Fills a pre-registered object shell, walking keys in canonical order.
    fn decode_object_into(
        &mut self,
        obj: &ObjectRef,
        map: &JsonMap<String, Json>,
        path: &mut Vec<PathComp>,
    ) -> Result<(), CodecError> {
        let mut pairs: Vec<(&String, &Json)> = map.iter().collect();
        pairs.sort_by(|a, b| compare_keys(a.0, b.0));
        for (key, item) in pairs {
            path.push(PathComp::Key(key.clone()));
            let value = self.decode(item, path)?;
            path.pop();
            obj.borrow_mut()
                .props
                .insert(PropKey::new(key.clone()), value);
        }
        Ok(())
    }

    fn decode_loose_props(
        &mut self,
        json: &Json,
        path: &mut Vec<PathComp>,
    ) -> Result<Props, CodecError> {
        let map = json
            .as_object()
            .ok_or_else(|| CodecError::BadTag("props must be an object".into()))?;
        let mut props = Props::new();
        let mut pairs: Vec<(&String, &Json)> = map.iter().collect();
        pairs.sort_by(|a, b| compare_keys(a.0, b.0));
        for (key, item) in pairs {
            path.push(PathComp::Key(key.clone()));
            let value = self.decode(item, path)?;
            path.pop();
            props.insert(PropKey::new(key.clone()), value);
        }
        Ok(props)
    }
}

fn expect_keys(map: &JsonMap<String, Json>, allowed: &[&str]) -> Result<(), CodecError> {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(CodecError::BadTag(format!(
                "unexpected key {} beside {}",
                key, allowed[0]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{MapData, SetData};
    use serde_json::json;

    fn round_trip(value: &Value) -> Value {
        let encoded = encode(value).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert!(
            decoded.deep_eq(value),
            "round trip mismatch via {}",
            encoded
        );
        decoded
    }

    #[test]
    fn primitives() {
        round_trip(&Value::Null);
        round_trip(&Value::Undefined);
        round_trip(&Value::Bool(true));
        round_trip(&Value::from("text"));
        round_trip(&Value::from(42));
        round_trip(&Value::from(-1.5));
        round_trip(&Value::Number(f64::NAN));
        round_trip(&Value::Number(f64::INFINITY));
        round_trip(&Value::Number(f64::NEG_INFINITY));
        round_trip(&Value::Number(-0.0));
    }

    #[test]
    fn tagged_forms() {
        assert_eq!(encode(&Value::Undefined).unwrap(), json!({ "$und": 1 }));
        assert_eq!(encode(&Value::Number(-0.0)).unwrap(), json!({ "$n0": 1 }));
        assert_eq!(
            encode(&Value::Number(f64::NAN)).unwrap(),
            json!({ "$nan": 1 })
        );
        assert_eq!(encode(&Value::from(3)).unwrap(), json!(3));
        assert_eq!(
            encode(&Value::bytes(vec![0, 1, 255])).unwrap(),
            json!({ "$ui8a": "AAH/" })
        );
    }

    #[test]
    fn plain_object_and_escaping() {
        let obj = ObjectRef::default();
        obj.borrow_mut()
            .props
            .insert(PropKey::new("a"), Value::from(1));
        assert_eq!(
            encode(&Value::Object(obj.clone())).unwrap(),
            json!({ "a": 1 })
        );

        obj.borrow_mut()
            .props
            .insert(PropKey::new("$weird"), Value::from(2));
        let encoded = encode(&Value::Object(obj.clone())).unwrap();
        assert_eq!(encoded, json!({ "$obj": { "a": 1, "$weird": 2 } }));
        round_trip(&Value::Object(obj));
    }

    #[test]
    fn escaped_object_self_reference() {
        let obj = ObjectRef::default();
        obj.borrow_mut()
            .props
            .insert(PropKey::new("$self"), Value::Object(obj.clone()));
        let encoded = encode(&Value::Object(obj.clone())).unwrap();
        assert_eq!(encoded, json!({ "$obj": { "$self": { "$dup": [] } } }));
        let decoded = decode(&encoded).unwrap();
        if let Value::Object(out) = &decoded {
            let inner = out
                .borrow()
                .props
                .get(&PropKey::new("$self"))
                .cloned()
                .unwrap();
            assert!(inner.same_value_zero(&decoded));
        } else {
            unreachable!();
        }
    }

    #[test]
    fn dense_and_sparse_arrays() {
        let arr = ArrayRef::default();
        arr.borrow_mut().elements.push(Value::from(1));
        arr.borrow_mut().elements.push(Value::from("two"));
        assert_eq!(
            encode(&Value::Array(arr.clone())).unwrap(),
            json!([1, "two"])
        );

        arr.borrow_mut()
            .extras
            .insert(PropKey::new("9"), Value::from(9));
        arr.borrow_mut()
            .extras
            .insert(PropKey::new("name"), Value::from("n"));
        let encoded = encode(&Value::Array(arr.clone())).unwrap();
        assert_eq!(
            encoded,
            json!({ "$arr": { "0": 1, "1": "two", "9": 9, "name": "n" } })
        );
        round_trip(&Value::Array(arr));
    }

    #[test]
    fn sets_and_maps_with_props() {
        let mut data = SetData::default();
        data.add(Value::from(1));
        data.add(Value::from("x"));
        data.props.insert(PropKey::new("tag"), Value::from("s"));
        let set = Value::Set(SetRef::new(data));
        assert_eq!(
            encode(&set).unwrap(),
            json!({ "$set": [1, "x"], "props": { "tag": "s" } })
        );
        round_trip(&set);

        let mut data = MapData::default();
        data.set(Value::from("k"), Value::from(1));
        data.set(Value::from(2), Value::Null);
        let map = Value::Map(MapRef::new(data));
        assert_eq!(
            encode(&map).unwrap(),
            json!({ "$map": [["k", 1], [2, null]] })
        );
        round_trip(&map);
    }

    #[test]
    fn duplicates_emit_dup_paths() {
        let shared = Value::object();
        let obj = ObjectRef::default();
        obj.borrow_mut()
            .props
            .insert(PropKey::new("a"), shared.clone());
        obj.borrow_mut()
            .props
            .insert(PropKey::new("b"), shared.clone());
        let encoded = encode(&Value::Object(obj.clone())).unwrap();
        assert_eq!(encoded, json!({ "a": {}, "b": { "$dup": ["a"] } }));

        let decoded = decode(&encoded).unwrap();
        if let Value::Object(out) = decoded {
            let props = out.borrow();
            let a = props.props.get(&PropKey::new("a")).unwrap();
            let b = props.props.get(&PropKey::new("b")).unwrap();
            assert!(a.same_value_zero(b), "decoded duplicates must alias");
        } else {
            unreachable!();
        }
    }

    #[test]
    fn cycles_round_trip() {
        let obj = ObjectRef::default();
        obj.borrow_mut()
            .props
            .insert(PropKey::new("me"), Value::Object(obj.clone()));
        let encoded = encode(&Value::Object(obj.clone())).unwrap();
        assert_eq!(encoded, json!({ "me": { "$dup": [] } }));
        let decoded = decode(&encoded).unwrap();
        if let Value::Object(out) = &decoded {
            let inner = out.borrow().props.get(&PropKey::new("me")).cloned().unwrap();
            assert!(inner.same_value_zero(&decoded));
        } else {
            unreachable!();
        }
    }

    #[test]
    fn dup_across_canonical_order() {
        // First occurrence lands under key "2", which is canonically
        // earlier than "10" even though "10" sorts first lexically. The
        // decoder must walk in canonical order for the dup to resolve.
        let shared = Value::object();
        let obj = ObjectRef::default();
        obj.borrow_mut()
            .props
            .insert(PropKey::new("2"), shared.clone());
        obj.borrow_mut()
            .props
            .insert(PropKey::new("10"), shared.clone());
        let encoded = encode(&Value::Object(obj.clone())).unwrap();
        assert_eq!(encoded, json!({ "2": {}, "10": { "$dup": ["2"] } }));
        round_trip(&Value::Object(obj));
    }

    #[test]
    fn jig_hooks() {
        let mut encode_hook = |jig: JigRef| Ok(json!(jig.0));
        let value = Value::Jig(JigRef(7));
        let encoded = encode_with(&value, &mut encode_hook).unwrap();
        assert_eq!(encoded, json!({ "$jig": 7 }));

        let mut decode_hook = |json: &Json| {
            let id = json
                .as_u64()
                .ok_or_else(|| CodecError::BadJig("id".into()))?;
            Ok(Value::Jig(JigRef(id as u32)))
        };
        let decoded = decode_with(&encoded, &mut decode_hook).unwrap();
        assert!(decoded.same_value_zero(&value));
    }

    #[test]
    fn arb_objects_carry_their_class() {
        let obj = ObjectRef::default();
        obj.borrow_mut()
            .props
            .insert(PropKey::new("n"), Value::from(1));
        obj.borrow_mut().class = Some(JigRef(3));
        let mut encode_hook = |jig: JigRef| Ok(json!(jig.0));
        let encoded = encode_with(&Value::Object(obj.clone()), &mut encode_hook).unwrap();
        assert_eq!(encoded, json!({ "$arb": { "n": 1 }, "T": { "$jig": 3 } }));

        let mut decode_hook = |json: &Json| {
            let id = json
                .as_u64()
                .ok_or_else(|| CodecError::BadJig("id".into()))?;
            Ok(Value::Jig(JigRef(id as u32)))
        };
        let decoded = decode_with(&encoded, &mut decode_hook).unwrap();
        if let Value::Object(out) = &decoded {
            assert_eq!(out.borrow().class, Some(JigRef(3)));
        } else {
            unreachable!();
        }
        assert!(decoded.deep_eq(&Value::Object(obj)));
    }

    #[test]
    fn jigs_rejected_without_hook() {
        let err = encode(&Value::Jig(JigRef(0))).unwrap_err();
        assert!(err.to_string().contains("transaction context"));
    }

    #[test]
    fn unknown_tags_rejected() {
        assert!(decode(&json!({ "$wat": 1 })).is_err());
        assert!(decode(&json!({ "$und": 1, "extra": 2 })).is_err());
        assert!(decode(&json!({ "$set": [], "$map": [] })).is_err());
    }

    #[test]
    fn number_canonical_form() {
        // Integral doubles emit as JSON integers.
        assert_eq!(encode(&Value::Number(5.0)).unwrap().to_string(), "5");
        assert_eq!(encode(&Value::Number(-3.0)).unwrap().to_string(), "-3");
        assert_eq!(encode(&Value::Number(1.5)).unwrap().to_string(), "1.5");
    }

    #[test]
    fn encode_is_deterministic() {
        let build = || {
            let obj = ObjectRef::default();
            obj.borrow_mut()
                .props
                .insert(PropKey::new("z"), Value::from(1));
            obj.borrow_mut()
                .props
                .insert(PropKey::new("a"), Value::bytes(vec![1, 2]));
            Value::Object(obj)
        };
        let a = crate::helpers::stable_stringify(&encode(&build()).unwrap());
        let b = crate::helpers::stable_stringify(&encode(&build()).unwrap());
        assert_eq!(a, b);
    }
}
