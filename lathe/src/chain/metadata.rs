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

//! The metadata record embedded in every lathe transaction.
//!
//! One anchor output carries an `OP_FALSE OP_RETURN` with four chunks:
//! `["run", <protocol-byte>, <app-string>, <metadata-JSON>]`. The metadata
//! JSON keys are `in` (jig input count), `ref` (read-only locations),
//! `out`/`del` (state hashes), `cre` (initial owner locks) and `exec`
//! (the ordered execution script). A `version` key is present iff it
//! differs from the declared protocol byte; presence otherwise is
//! rejected. Metadata bytes are produced with the stable stringifier so
//! they are canonical.

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Map as JsonMap, Value as Json};
use thiserror::Error;

use crate::chain::script::{anchor_script, parse_anchor};
use crate::chain::transaction::Transaction;
use crate::crypto::Hash;
use crate::helpers::stable_stringify;

/// Anchor prefix chunk.
pub const METADATA_PREFIX: &[u8] = b"run";

/// Protocol version gating every transaction.
pub const PROTOCOL_VERSION: u8 = 5;

/// Errors raised while locating or parsing transaction metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The transaction carries no conforming anchor output.
    #[error("Not a run transaction: {0}")]
    NotRun(String),
    /// The transaction declares a protocol version this kernel does not
    /// execute.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u8),
    /// The metadata JSON is malformed.
    #[error("Bad metadata: {0}")]
    Bad(String),
}

/// Operation tags appearing in the `exec` script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOp {
    /// Install a new code jig.
    Deploy,
    /// Replace the class of a code jig.
    Upgrade,
    /// Instantiate a jig class.
    New,
    /// Invoke an instance or static method.
    Call,
}

impl ExecOp {
    /// The wire tag.
    pub fn as_str(self) -> &'static str {
        match self {
            ExecOp::Deploy => "DEPLOY",
            ExecOp::Upgrade => "UPGRADE",
            ExecOp::New => "NEW",
            ExecOp::Call => "CALL",
        }
    }
}

impl fmt::Display for ExecOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecOp {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEPLOY" => Ok(ExecOp::Deploy),
            "UPGRADE" => Ok(ExecOp::Upgrade),
            "NEW" => Ok(ExecOp::New),
            "CALL" => Ok(ExecOp::Call),
            other => Err(MetadataError::Bad(format!("unknown op {}", other))),
        }
    }
}

/// One step of the execution script.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecEntry {
    /// Operation tag.
    pub op: ExecOp,
    /// Operation payload; `$jig` references index the transaction's jig
    /// space (inputs, then refs, then creations).
    pub data: Json,
}

/// Parsed transaction metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    /// Effective protocol version.
    pub version: u8,
    /// Application tag.
    pub app: String,
    /// Number of jig inputs (spent outputs), preceding the payment inputs.
    pub inputs: usize,
    /// Locations referenced but not spent.
    pub refs: Vec<String>,
    /// State hashes for new and updated outputs, in output order.
    pub out: Vec<Hash>,
    /// State hashes for deleted jigs, in deletion order.
    pub del: Vec<Hash>,
    /// Initial owner locks for created jigs, in creation order.
    pub cre: Vec<Json>,
    /// The ordered execution script.
    pub exec: Vec<ExecEntry>,
}

impl Metadata {
    /// Renders the metadata JSON (without the `version` key; the chunk
    /// byte declares it).
    pub fn to_json(&self) -> Json {
        let exec: Vec<Json> = self
            .exec
            .iter()
            .map(|e| json!({ "op": e.op.as_str(), "data": e.data }))
            .collect();
        json!({
            "app": self.app,
            "in": self.inputs,
            "ref": self.refs,
            "out": self.out,
            "del": self.del,
            "cre": self.cre,
            "exec": exec,
        })
    }

    /// Renders the four anchor chunks.
    pub fn to_chunks(&self) -> Vec<Vec<u8>> {
        vec![
            METADATA_PREFIX.to_vec(),
            vec![self.version],
            self.app.as_bytes().to_vec(),
            stable_stringify(&self.to_json()).into_bytes(),
        ]
    }

    /// Builds the anchor output script.
    pub fn to_script(&self) -> Vec<u8> {
        anchor_script(&self.to_chunks())
    }

    /// Parses anchor chunks back into metadata.
    pub fn from_chunks(chunks: &[Vec<u8>]) -> Result<Metadata, MetadataError> {
        if chunks.len() != 4 {
            return Err(MetadataError::NotRun(format!(
                "expected 4 chunks, found {}",
                chunks.len()
            )));
        }
        if chunks[0] != METADATA_PREFIX {
            return Err(MetadataError::NotRun("bad prefix".to_owned()));
        }
        if chunks[1].len() != 1 {
            return Err(MetadataError::NotRun("bad version chunk".to_owned()));
        }
        let declared = chunks[1][0];
        let app = String::from_utf8(chunks[2].clone())
            .map_err(|_| MetadataError::Bad("app is not utf-8".to_owned()))?;
        let json: Json = serde_json::from_slice(&chunks[3])
            .map_err(|e| MetadataError::Bad(e.to_string()))?;
        let map = json
            .as_object()
            .ok_or_else(|| MetadataError::Bad("metadata is not an object".to_owned()))?;

        for key in map.keys() {
            if !["app", "in", "ref", "out", "del", "cre", "exec", "version"]
                .contains(&key.as_str())
            {
                return Err(MetadataError::Bad(format!("unexpected key {}", key)));
            }
        }

        let version = match map.get("version") {
            None => declared,
            Some(v) => {
                let v = v
                    .as_u64()
                    .filter(|v| *v <= u64::from(u8::max_value()))
                    .ok_or_else(|| MetadataError::Bad("bad version".to_owned()))? as u8;
                if v == declared {
                    return Err(MetadataError::Bad(
                        "version key must differ from the declared byte".to_owned(),
                    ));
                }
                v
            }
        };
        if version != PROTOCOL_VERSION {
            return Err(MetadataError::UnsupportedVersion(version));
        }
        if let Some(meta_app) = map.get("app") {
            let meta_app = meta_app
                .as_str()
                .ok_or_else(|| MetadataError::Bad("app must be a string".to_owned()))?;
            if meta_app != app {
                return Err(MetadataError::Bad("app differs from chunk".to_owned()));
            }
        }

        let inputs = require(map, "in")?
            .as_u64()
            .ok_or_else(|| MetadataError::Bad("in must be a count".to_owned()))?
            as usize;
        let refs = string_array(require(map, "ref")?, "ref")?;
        let out = hash_array(require(map, "out")?, "out")?;
        let del = hash_array(require(map, "del")?, "del")?;
        let cre = require(map, "cre")?
            .as_array()
            .ok_or_else(|| MetadataError::Bad("cre must be an array".to_owned()))?
            .clone();

        let exec_json = require(map, "exec")?
            .as_array()
            .ok_or_else(|| MetadataError::Bad("exec must be an array".to_owned()))?;
        let mut exec = Vec::with_capacity(exec_json.len());
        for entry in exec_json {
            let entry = entry
                .as_object()
                .ok_or_else(|| MetadataError::Bad("exec entry must be an object".to_owned()))?;
            if entry.len() != 2 {
                return Err(MetadataError::Bad("exec entry keys must be op, data".to_owned()));
            }
            let op = entry
                .get("op")
                .and_then(Json::as_str)
                .ok_or_else(|| MetadataError::Bad("exec entry missing op".to_owned()))?
                .parse()?;
            let data = entry
                .get("data")
                .ok_or_else(|| MetadataError::Bad("exec entry missing data".to_owned()))?
                .clone();
            exec.push(ExecEntry { op, data });
        }

        Ok(Metadata {
            version,
            app,
            inputs,
            refs,
            out,
            del,
            cre,
            exec,
        })
    }

    /// Locates and parses the anchor within a transaction. The anchor may
    /// sit at any output index.
    pub fn from_transaction(tx: &Transaction) -> Result<(u32, Metadata), MetadataError> {
        for (vout, output) in tx.outputs.iter().enumerate() {
            if let Some(chunks) = parse_anchor(&output.script) {
                if chunks.first().map(Vec::as_slice) == Some(METADATA_PREFIX) {
                    let metadata = Metadata::from_chunks(&chunks)?;
                    return Ok((vout as u32, metadata));
                }
            }
        }
        Err(MetadataError::NotRun("no anchor output".to_owned()))
    }
}

fn require<'m>(map: &'m JsonMap<String, Json>, key: &str) -> Result<&'m Json, MetadataError> {
    map.get(key)
        .ok_or_else(|| MetadataError::Bad(format!("missing key {}", key)))
}

fn string_array(json: &Json, key: &str) -> Result<Vec<String>, MetadataError> {
    json.as_array()
        .ok_or_else(|| MetadataError::Bad(format!("{} must be an array", key)))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| MetadataError::Bad(format!("{} entries must be strings", key)))
        })
        .collect()
}

fn hash_array(json: &Json, key: &str) -> Result<Vec<Hash>, MetadataError> {
    json.as_array()
        .ok_or_else(|| MetadataError::Bad(format!("{} must be an array", key)))?
        .iter()
        .map(|v| {
            v.as_str()
                .and_then(|s| Hash::from_hex(s).ok())
                .ok_or_else(|| MetadataError::Bad(format!("{} entries must be hashes", key)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::transaction::TxOut;
    use crate::crypto::sha256;

    fn sample() -> Metadata {
        Metadata {
            version: PROTOCOL_VERSION,
            app: "demo".to_owned(),
            inputs: 1,
            refs: vec!["native://Jig".to_owned()],
            out: vec![sha256(b"state")],
            del: vec![],
            cre: vec![json!("mvKqN6u9cWbPq9m7nMPGJAxELPNJCHHfBv")],
            exec: vec![ExecEntry {
                op: ExecOp::Call,
                data: json!([{ "$jig": 0 }, "f", []]),
            }],
        }
    }

    #[test]
    fn chunk_round_trip() {
        let metadata = sample();
        let chunks = metadata.to_chunks();
        assert_eq!(chunks[0], METADATA_PREFIX);
        assert_eq!(chunks[1], vec![PROTOCOL_VERSION]);
        let parsed = Metadata::from_chunks(&chunks).unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn transaction_scan_finds_anchor_anywhere() {
        let metadata = sample();
        let mut tx = Transaction::new();
        tx.outputs.push(TxOut {
            satoshis: 546,
            script: vec![0x51],
        });
        tx.outputs.push(TxOut {
            satoshis: 0,
            script: metadata.to_script(),
        });
        let (vout, parsed) = Metadata::from_transaction(&tx).unwrap();
        assert_eq!(vout, 1);
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn rejects_foreign_transactions() {
        let tx = Transaction::new();
        assert_matches::assert_matches!(
            Metadata::from_transaction(&tx),
            Err(MetadataError::NotRun(_))
        );

        let mut chunks = sample().to_chunks();
        chunks[0] = b"not-run".to_vec();
        assert_matches::assert_matches!(
            Metadata::from_chunks(&chunks),
            Err(MetadataError::NotRun(_))
        );
    }

    #[test]
    fn rejects_other_protocol_versions() {
        let mut chunks = sample().to_chunks();
        chunks[1] = vec![PROTOCOL_VERSION + 1];
        assert_matches::assert_matches!(
            Metadata::from_chunks(&chunks),
            Err(MetadataError::UnsupportedVersion(_))
        );
    }

    #[test]
    fn rejects_redundant_version_key() {
        let metadata = sample();
        let mut json = metadata.to_json();
        json.as_object_mut()
            .unwrap()
            .insert("version".to_owned(), json!(PROTOCOL_VERSION));
        let chunks = vec![
            METADATA_PREFIX.to_vec(),
            vec![PROTOCOL_VERSION],
            b"demo".to_vec(),
            stable_stringify(&json).into_bytes(),
        ];
        assert_matches::assert_matches!(
            Metadata::from_chunks(&chunks),
            Err(MetadataError::Bad(_))
        );
    }

    #[test]
    fn rejects_unknown_keys_and_ops() {
        let metadata = sample();
        let mut json = metadata.to_json();
        json.as_object_mut()
            .unwrap()
            .insert("extra".to_owned(), json!(1));
        let chunks = vec![
            METADATA_PREFIX.to_vec(),
            vec![PROTOCOL_VERSION],
            b"demo".to_vec(),
            stable_stringify(&json).into_bytes(),
        ];
        assert!(Metadata::from_chunks(&chunks).is_err());

        let mut json = metadata.to_json();
        json["exec"][0]["op"] = json!("EVAL");
        let chunks = vec![
            METADATA_PREFIX.to_vec(),
            vec![PROTOCOL_VERSION],
            b"demo".to_vec(),
            stable_stringify(&json).into_bytes(),
        ];
        assert!(Metadata::from_chunks(&chunks).is_err());
    }

    #[test]
    fn metadata_bytes_are_canonical() {
        let a = stable_stringify(&sample().to_json());
        let b = stable_stringify(&sample().to_json());
        assert_eq!(a, b);
        // Keys appear in comparator order.
        assert!(a.find("\"app\"").unwrap() < a.find("\"cre\"").unwrap());
        assert!(a.find("\"cre\"").unwrap() < a.find("\"del\"").unwrap());
    }
}
