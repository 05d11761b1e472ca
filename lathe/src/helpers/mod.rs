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

//! Determinism helpers shared by the codec, the record engine and the
//! replay pipeline: the canonical key comparator, the stable JSON
//! stringifier, and the suspension-point timeout guard.

pub mod environment;

use std::cmp::Ordering;
use std::fmt::Write;
use std::time::{Duration, Instant};

use serde_json::Value as Json;
use thiserror::Error;

/// Largest string key still treated as an array index.
///
/// Canonical decimal strings above this value are ordered as plain strings.
pub const MAX_ARRAY_INDEX: u64 = (1u64 << 32) - 2;

/// Parses a canonical array-index key.
///
/// A key qualifies iff it is a canonical decimal rendering (no sign, no
/// leading zero except `"0"` itself) of an integer not exceeding
/// [`MAX_ARRAY_INDEX`].
pub fn array_index(key: &str) -> Option<u64> {
    if key.is_empty() || key.len() > 10 {
        return None;
    }
    if key.len() > 1 && key.starts_with('0') {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = key.parse().ok()?;
    if value > MAX_ARRAY_INDEX {
        return None;
    }
    Some(value)
}

/// Canonical property-key order: array-index keys first in numeric order,
/// then the remaining keys in lexicographic byte order.
pub fn compare_keys(a: &str, b: &str) -> Ordering {
    match (array_index(a), array_index(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Serializes a JSON value to its canonical byte form.
///
/// Object keys are emitted in [`compare_keys`] order and no insignificant
/// whitespace is produced, so equal values always stringify to equal bytes.
/// State hashes and on-chain metadata are computed over this form.
pub fn stable_stringify(value: &Json) -> String {
    let mut out = String::new();
    write_json(&mut out, value);
    out
}

fn write_json(out: &mut String, value: &Json) {
    match value {
        Json::Null => out.push_str("null"),
        Json::Bool(true) => out.push_str("true"),
        Json::Bool(false) => out.push_str("false"),
        Json::Number(n) => {
            let _ = write!(out, "{}", n);
        }
        Json::String(s) => write_json_string(out, s),
        Json::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(out, item);
            }
            out.push(']');
        }
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| compare_keys(a, b));
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(out, key);
                out.push(':');
                write_json(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

fn write_json_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Error raised when a task overruns its timeout.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{phase} timeout")]
pub struct TimeoutError {
    /// The phase that overran (load, publish, replay, sync).
    pub phase: String,
}

/// Timeout guard carried through a kernel task.
///
/// Elapsed time is checked at each suspension point; a `None` deadline
/// disables the guard.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Starts a deadline `timeout` from now; `None` never expires.
    pub fn start(timeout: Option<Duration>) -> Self {
        Deadline {
            at: timeout.map(|t| Instant::now() + t),
        }
    }

    /// A deadline that never expires.
    pub fn unlimited() -> Self {
        Deadline { at: None }
    }

    /// Fails with `<phase> timeout` if the deadline has passed.
    pub fn check(&self, phase: &str) -> Result<(), TimeoutError> {
        match self.at {
            Some(at) if Instant::now() >= at => Err(TimeoutError {
                phase: phase.to_owned(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn array_index_accepts_canonical_decimals() {
        assert_eq!(array_index("0"), Some(0));
        assert_eq!(array_index("10"), Some(10));
        assert_eq!(array_index("4294967294"), Some(4_294_967_294));
    }

    #[test]
    fn array_index_rejects_non_canonical_keys() {
        assert_eq!(array_index(""), None);
        assert_eq!(array_index("01"), None);
        assert_eq!(array_index("-1"), None);
        assert_eq!(array_index("1.5"), None);
        assert_eq!(array_index("a"), None);
        // 2^32 - 1 and above are string keys, not indices.
        assert_eq!(array_index("4294967295"), None);
        assert_eq!(array_index("18446744073709551615"), None);
    }

    #[test]
    fn comparator_orders_indices_before_strings() {
        let mut keys = vec!["b", "a", "10", "2"];
        keys.sort_by(|a, b| compare_keys(a, b));
        assert_eq!(keys, vec!["2", "10", "a", "b"]);
    }

    #[test]
    fn stringify_is_canonical() {
        let a = json!({ "b": 1, "a": 2, "10": 3, "2": 4 });
        assert_eq!(stable_stringify(&a), r#"{"2":4,"10":3,"a":2,"b":1}"#);
    }

    #[test]
    fn stringify_escapes_strings() {
        let v = json!({ "k": "a\"b\\c\nd" });
        assert_eq!(stable_stringify(&v), "{\"k\":\"a\\\"b\\\\c\\nd\"}");
    }

    #[test]
    fn stringify_nested() {
        let v = json!([{ "y": [1, 2], "x": null }, true]);
        assert_eq!(stable_stringify(&v), r#"[{"x":null,"y":[1,2]},true]"#);
    }

    #[test]
    fn deadline_unlimited_never_fires() {
        assert!(Deadline::unlimited().check("load").is_ok());
        assert!(Deadline::start(None).check("load").is_ok());
    }

    #[test]
    fn deadline_zero_fires_immediately() {
        let deadline = Deadline::start(Some(Duration::from_secs(0)));
        let err = deadline.check("publish").unwrap_err();
        assert_eq!(err.to_string(), "publish timeout");
    }
}
