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

//! The five identity fields carried by every jig (`origin`, `location`,
//! `nonce`, `owner`, `satoshis`) and the location URL grammar.
//!
//! Location forms:
//!
//! - Deployed: `<64-hex-txid>_o<vout>` or `<64-hex-txid>_d<vdel>`
//! - Partial: `_o<vout>` or `_d<vdel>` (txid not yet known)
//! - Recording: `record://<scriptId>_o<i>` or `…_d<i>`
//! - Native: `native://<Name>`
//! - Error: `error://<message>` (`Undeployed` marks types awaiting deploy)
//! - Berry: `<base>?berry=<percent-encoded>&hash=<64-hex>&version=<int>`

use std::fmt;
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{json, Value as Json};
use thiserror::Error;

use crate::crypto::{decode_address, Hash, Txid};
use crate::value::{PropKey, Value};

/// Upper bound on the `satoshis` binding.
pub const MAX_SATOSHIS: u64 = 100_000_000;

/// Reserved error-location message for types awaiting deployment.
pub const UNDEPLOYED: &str = "Undeployed";

/// Validation errors for the binding fields.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindingError {
    /// The location string does not match the grammar.
    #[error("Bad location: {0}")]
    Location(String),
    /// The owner value is not an address, pubkey or lock.
    #[error("Bad owner: {0}")]
    Owner(String),
    /// The satoshis value is out of range or not an integer.
    #[error("Bad satoshis: {0}")]
    Satoshis(String),
}

/// An output or deletion slot within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
    /// `_o<vout>`: a spendable jig output.
    Output(u32),
    /// `_d<vdel>`: a deletion slot.
    Deletion(u32),
}

impl Slot {
    fn parse(s: &str) -> Option<Slot> {
        if s.len() < 2 {
            return None;
        }
        let (kind, digits) = s.split_at(1);
        if digits.is_empty() || digits.len() > 10 {
            return None;
        }
        if digits.len() > 1 && digits.starts_with('0') {
            return None;
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let index: u32 = digits.parse().ok()?;
        match kind {
            "o" => Some(Slot::Output(index)),
            "d" => Some(Slot::Deletion(index)),
            _ => None,
        }
    }

    /// Whether this is a deletion slot.
    pub fn is_deletion(&self) -> bool {
        matches!(self, Slot::Deletion(_))
    }

    /// The slot index.
    pub fn index(&self) -> u32 {
        match self {
            Slot::Output(i) | Slot::Deletion(i) => *i,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Output(i) => write!(f, "o{}", i),
            Slot::Deletion(i) => write!(f, "d{}", i),
        }
    }
}

/// Query-string tail identifying a berry plucked from a berry class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BerryTail {
    /// The pluck path handed to the berry class.
    pub path: String,
    /// Hash pinning the plucked state; absent while partial.
    pub hash: Option<Hash>,
    /// Protocol version the berry was plucked under; absent while partial.
    pub version: Option<u32>,
}

/// Structured form of a location string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Committed on-chain state.
    Deployed {
        /// Transaction carrying the state.
        txid: Txid,
        /// Output or deletion slot.
        slot: Slot,
        /// Berry tail for berry instances.
        berry: Option<BerryTail>,
    },
    /// Slot known, txid pending.
    Partial {
        /// Output or deletion slot.
        slot: Slot,
    },
    /// Provisional position inside an open record.
    Recording {
        /// Record (script) id.
        record: String,
        /// Output or deletion slot.
        slot: Slot,
    },
    /// Built-in primitive.
    Native {
        /// Primitive name.
        name: String,
    },
    /// Failure marker.
    Error {
        /// Failure reason; [`UNDEPLOYED`] marks types awaiting deploy.
        message: String,
    },
}

const BERRY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

impl Location {
    /// The error location for types awaiting deployment.
    pub fn undeployed() -> Location {
        Location::Error {
            message: UNDEPLOYED.to_owned(),
        }
    }

    /// The txid, for deployed locations.
    pub fn txid(&self) -> Option<Txid> {
        match self {
            Location::Deployed { txid, .. } => Some(*txid),
            _ => None,
        }
    }

    /// The slot, where the form carries one.
    pub fn slot(&self) -> Option<Slot> {
        match self {
            Location::Deployed { slot, .. }
            | Location::Partial { slot }
            | Location::Recording { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// Whether this location names committed on-chain state.
    pub fn is_deployed(&self) -> bool {
        matches!(self, Location::Deployed { .. })
    }

    /// Whether this location ends in a deletion slot.
    pub fn is_deletion(&self) -> bool {
        self.slot().map(|s| s.is_deletion()).unwrap_or(false)
    }

    /// Parses a location string.
    pub fn parse(s: &str) -> Result<Location, BindingError> {
        let bad = |reason: &str| BindingError::Location(format!("{} ({})", s, reason));

        if let Some(message) = s.strip_prefix("error://") {
            return Ok(Location::Error {
                message: message.to_owned(),
            });
        }
        if let Some(name) = s.strip_prefix("native://") {
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
                return Err(bad("bad native name"));
            }
            return Ok(Location::Native {
                name: name.to_owned(),
            });
        }
        if let Some(rest) = s.strip_prefix("record://") {
            let sep = rest.rfind('_').ok_or_else(|| bad("missing slot"))?;
            let (record, slot) = rest.split_at(sep);
            let slot = Slot::parse(&slot[1..]).ok_or_else(|| bad("bad slot"))?;
            if record.len() != 64 || !record.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(bad("bad record id"));
            }
            return Ok(Location::Recording {
                record: record.to_owned(),
                slot,
            });
        }

        let (base, query) = match s.find('?') {
            Some(at) => (&s[..at], Some(&s[at + 1..])),
            None => (s, None),
        };

        let location = if let Some(slot) = base.strip_prefix('_') {
            if query.is_some() {
                return Err(bad("berry tail on partial location"));
            }
            Location::Partial {
                slot: Slot::parse(slot).ok_or_else(|| bad("bad slot"))?,
            }
        } else {
            let sep = base.rfind('_').ok_or_else(|| bad("missing separator"))?;
            let (txid, slot) = base.split_at(sep);
            let slot = Slot::parse(&slot[1..]).ok_or_else(|| bad("bad slot"))?;
            if txid.len() != 64 || !txid.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(bad("bad txid"));
            }
            let txid = Txid::from_hex(txid).map_err(|_| bad("bad txid"))?;
            let berry = match query {
                Some(query) => Some(parse_berry_tail(query).map_err(|r| bad(&r))?),
                None => None,
            };
            Location::Deployed { txid, slot, berry }
        };
        Ok(location)
    }
}

fn parse_berry_tail(query: &str) -> Result<BerryTail, String> {
    let mut path = None;
    let mut hash = None;
    let mut version = None;
    for part in query.split('&') {
        let at = part.find('=').ok_or("bad query pair")?;
        let (key, value) = (&part[..at], &part[at + 1..]);
        match key {
            "berry" if path.is_none() => {
                let decoded = percent_decode_str(value)
                    .decode_utf8()
                    .map_err(|_| "bad berry path encoding".to_owned())?;
                path = Some(decoded.into_owned());
            }
            "hash" if hash.is_none() => {
                hash = Some(Hash::from_hex(value).map_err(|_| "bad berry hash".to_owned())?);
            }
            "version" if version.is_none() => {
                if value.is_empty()
                    || value.starts_with('0')
                    || !value.bytes().all(|b| b.is_ascii_digit())
                {
                    return Err("bad berry version".to_owned());
                }
                version = Some(value.parse().map_err(|_| "bad berry version".to_owned())?);
            }
            _ => return Err(format!("bad query key {}", key)),
        }
    }
    Ok(BerryTail {
        path: path.ok_or("missing berry path")?,
        hash,
        version,
    })
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Deployed { txid, slot, berry } => {
                write!(f, "{}_{}", txid, slot)?;
                if let Some(berry) = berry {
                    write!(
                        f,
                        "?berry={}",
                        utf8_percent_encode(&berry.path, BERRY_ENCODE_SET)
                    )?;
                    if let Some(hash) = &berry.hash {
                        write!(f, "&hash={}", hash)?;
                    }
                    if let Some(version) = berry.version {
                        write!(f, "&version={}", version)?;
                    }
                }
                Ok(())
            }
            Location::Partial { slot } => write!(f, "_{}", slot),
            Location::Recording { record, slot } => write!(f, "record://{}_{}", record, slot),
            Location::Native { name } => write!(f, "native://{}", name),
            Location::Error { message } => write!(f, "error://{}", message),
        }
    }
}

impl FromStr for Location {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Location::parse(s)
    }
}

/// The built-in pay-to-pubkey-hash lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonLock {
    /// Base58check address the lock pays to.
    pub address: String,
}

impl CommonLock {
    /// Unlock script budget for a signature plus compressed pubkey.
    pub const DOMAIN: usize = 108;

    /// Builds a lock over a validated address.
    pub fn from_address(address: &str) -> Result<CommonLock, BindingError> {
        decode_address(address)
            .map_err(|e| BindingError::Owner(format!("{}: {}", address, e)))?;
        Ok(CommonLock {
            address: address.to_owned(),
        })
    }

    /// The pubkey hash the lock pays to.
    pub fn pubkey_hash(&self) -> [u8; 20] {
        // The address was validated at construction.
        decode_address(&self.address).map(|(_, h)| h).unwrap_or([0; 20])
    }

    /// The locking script.
    pub fn script(&self) -> Vec<u8> {
        crate::chain::script::p2pkh_script(&self.pubkey_hash())
    }
}

/// A lock produced by a custom lock object: raw script plus an unlock
/// budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLock {
    /// The locking script.
    pub script: Vec<u8>,
    /// Maximum unlocking script size in bytes.
    pub domain: usize,
}

/// An owner policy: who may spend the jig's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lock {
    /// Built-in pay-to-pubkey-hash.
    Common(CommonLock),
    /// Custom script lock.
    Script(ScriptLock),
}

impl Lock {
    /// The locking script.
    pub fn script(&self) -> Vec<u8> {
        match self {
            Lock::Common(lock) => lock.script(),
            Lock::Script(lock) => lock.script.clone(),
        }
    }

    /// Maximum unlocking script size in bytes.
    pub fn domain(&self) -> usize {
        match self {
            Lock::Common(_) => CommonLock::DOMAIN,
            Lock::Script(lock) => lock.domain,
        }
    }

    /// Validates an owner value assigned from jig code or supplied by an
    /// owner plugin: a P2PKH address string, a public-key hex string, or
    /// an object carrying `script` bytes and a `domain` budget.
    pub fn from_value(value: &Value) -> Result<Lock, BindingError> {
        match value {
            Value::String(s) => Lock::from_text(s),
            Value::Object(obj) => {
                let data = obj.borrow();
                let script = match data.props.get(&PropKey::new("script")) {
                    Some(Value::Bytes(bytes)) => bytes.borrow().clone(),
                    _ => {
                        return Err(BindingError::Owner(
                            "lock object requires script bytes".to_owned(),
                        ))
                    }
                };
                let domain = match data.props.get(&PropKey::new("domain")) {
                    Some(Value::Number(n))
                        if n.fract() == 0.0 && *n >= 0.0 && *n <= 1e6 =>
                    {
                        *n as usize
                    }
                    _ => {
                        return Err(BindingError::Owner(
                            "lock object requires an integer domain".to_owned(),
                        ))
                    }
                };
                Ok(Lock::Script(ScriptLock { script, domain }))
            }
            other => Err(BindingError::Owner(format!(
                "unsupported owner type {}",
                other.type_name()
            ))),
        }
    }

    /// Validates an address or public-key hex string.
    pub fn from_text(s: &str) -> Result<Lock, BindingError> {
        // Compressed (66) or uncompressed (130) pubkey hex converts to the
        // common lock over its address.
        if (s.len() == 66 || s.len() == 130) && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            let pubkey =
                hex::decode(s).map_err(|e| BindingError::Owner(e.to_string()))?;
            let address = crate::crypto::address_from_pubkey(
                crate::crypto::ADDRESS_VERSION_TEST,
                &pubkey,
            );
            return Ok(Lock::Common(CommonLock { address }));
        }
        CommonLock::from_address(s).map(Lock::Common)
    }

    /// Renders the lock for transaction metadata.
    pub fn to_json(&self) -> Json {
        match self {
            Lock::Common(lock) => Json::String(lock.address.clone()),
            Lock::Script(lock) => json!({
                "script": hex::encode(&lock.script),
                "domain": lock.domain,
            }),
        }
    }

    /// Parses a lock from transaction metadata.
    pub fn from_json(json: &Json) -> Result<Lock, BindingError> {
        match json {
            Json::String(address) => CommonLock::from_address(address).map(Lock::Common),
            Json::Object(map) => {
                let script = map
                    .get("script")
                    .and_then(Json::as_str)
                    .and_then(|s| hex::decode(s).ok())
                    .ok_or_else(|| BindingError::Owner("bad lock script".to_owned()))?;
                let domain = map
                    .get("domain")
                    .and_then(Json::as_u64)
                    .ok_or_else(|| BindingError::Owner("bad lock domain".to_owned()))?;
                if map.len() != 2 {
                    return Err(BindingError::Owner("unexpected lock fields".to_owned()));
                }
                Ok(Lock::Script(ScriptLock {
                    script,
                    domain: domain as usize,
                }))
            }
            other => Err(BindingError::Owner(format!("unsupported lock form {}", other))),
        }
    }
}

/// Validates a satoshis value: a finite non-negative integer not above
/// [`MAX_SATOSHIS`].
pub fn parse_satoshis(value: &Value) -> Result<u64, BindingError> {
    match value {
        Value::Number(n) => {
            if !n.is_finite() || n.fract() != 0.0 {
                return Err(BindingError::Satoshis(format!("{} is not an integer", n)));
            }
            if *n < 0.0 {
                return Err(BindingError::Satoshis(format!("{} is negative", n)));
            }
            let n = *n as u64;
            if n > MAX_SATOSHIS {
                return Err(BindingError::Satoshis(format!(
                    "{} exceeds {}",
                    n, MAX_SATOSHIS
                )));
            }
            Ok(n)
        }
        other => Err(BindingError::Satoshis(format!(
            "unsupported type {}",
            other.type_name()
        ))),
    }
}

/// The identity fields tracked for every creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Bindings {
    /// Location of the creating transaction output.
    pub origin: Location,
    /// Location of the latest output or deletion slot.
    pub location: Location,
    /// Commit counter; 1 at creation.
    pub nonce: u64,
    /// Owner lock; `None` iff destroyed.
    pub owner: Option<Lock>,
    /// Bound satoshis.
    pub satoshis: u64,
}

impl Bindings {
    /// Bindings for a creation that has not entered a record yet.
    pub fn undeployed() -> Bindings {
        Bindings {
            origin: Location::undeployed(),
            location: Location::undeployed(),
            nonce: 0,
            owner: None,
            satoshis: 0,
        }
    }

    /// Bindings for a native primitive.
    pub fn native(name: &str) -> Bindings {
        let location = Location::Native {
            name: name.to_owned(),
        };
        Bindings {
            origin: location.clone(),
            location,
            nonce: 0,
            owner: None,
            satoshis: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(s: &str) -> Location {
        let location = Location::parse(s).unwrap();
        assert_eq!(location.to_string(), s);
        location
    }

    const TXID: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn deployed_locations() {
        let location = round_trip(&format!("{}_o1", TXID));
        assert_eq!(location.slot(), Some(Slot::Output(1)));
        assert!(location.is_deployed());

        let location = round_trip(&format!("{}_d0", TXID));
        assert!(location.is_deletion());
    }

    #[test]
    fn partial_and_recording_locations() {
        let location = round_trip("_o2");
        assert_eq!(location.slot(), Some(Slot::Output(2)));

        let record: String = "ab".repeat(32);
        round_trip(&format!("record://{}_d3", record));
    }

    #[test]
    fn native_and_error_locations() {
        let location = round_trip("native://Jig");
        assert!(matches!(location, Location::Native { .. }));
        let location = round_trip("error://Undeployed");
        assert_eq!(location, Location::undeployed());
        // Error messages may contain arbitrary text.
        round_trip("error://something went wrong");
    }

    #[test]
    fn berry_locations() {
        let full = format!(
            "{}_o1?berry=path%20with%20spaces&hash={}&version=5",
            TXID,
            "11".repeat(32)
        );
        let location = round_trip(&full);
        if let Location::Deployed { berry: Some(b), .. } = &location {
            assert_eq!(b.path, "path with spaces");
            assert_eq!(b.version, Some(5));
            assert!(b.hash.is_some());
        } else {
            unreachable!();
        }

        // Partial berries omit hash and/or version.
        let partial = format!("{}_o1?berry=x", TXID);
        let location = round_trip(&partial);
        if let Location::Deployed { berry: Some(b), .. } = &location {
            assert_eq!(b.hash, None);
            assert_eq!(b.version, None);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn bad_locations() {
        for s in &[
            "",
            "abc",
            "_o",
            "_o01",
            "_x1",
            "_o-1",
            &format!("{}_o1", "zz".repeat(32))[..],
            &format!("{}o1", TXID)[..],
            &format!("{}_o1?version=1", TXID)[..],
            &format!("{}_o1?berry=a&berry=b", TXID)[..],
            "_o1?berry=x",
            "record://abc_o1",
            "native://",
            "native://has space",
        ] {
            assert!(Location::parse(s).is_err(), "expected failure: {}", s);
        }
    }

    #[test]
    fn satoshis_bounds() {
        assert_eq!(parse_satoshis(&Value::from(0)).unwrap(), 0);
        assert_eq!(
            parse_satoshis(&Value::from(100_000_000)).unwrap(),
            MAX_SATOSHIS
        );
        assert!(parse_satoshis(&Value::from(100_000_001)).is_err());
        assert!(parse_satoshis(&Value::from(-1)).is_err());
        assert!(parse_satoshis(&Value::from(1.5)).is_err());
        assert!(parse_satoshis(&Value::Number(f64::NAN)).is_err());
        assert!(parse_satoshis(&Value::from("10")).is_err());
    }

    #[test]
    fn owner_from_pubkey_and_address() {
        let pubkey = "02".repeat(33);
        let lock = Lock::from_text(&pubkey).unwrap();
        if let Lock::Common(common) = &lock {
            // The derived address must itself validate.
            CommonLock::from_address(&common.address).unwrap();
        } else {
            unreachable!();
        }
        assert_eq!(lock.domain(), CommonLock::DOMAIN);

        assert!(Lock::from_text("not an address").is_err());
    }

    #[test]
    fn lock_json_round_trip() {
        let lock = Lock::Script(ScriptLock {
            script: vec![0x51],
            domain: 12,
        });
        let json = lock.to_json();
        assert_eq!(Lock::from_json(&json).unwrap(), lock);
    }
}
