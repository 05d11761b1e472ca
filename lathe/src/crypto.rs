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

//! Hashing primitives and identifier newtypes used across the kernel.
//!
//! State identity is content-derived: jig states hash to a [`Hash`] over
//! their canonical byte form, and transactions are identified by a [`Txid`]
//! (double-SHA-256, rendered in the reversed-hex convention of the
//! underlying chain).

use std::fmt;
use std::str::FromStr;

use ripemd::Ripemd160;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of a [`Hash`] and a [`Txid`] in bytes.
pub const HASH_SIZE: usize = 32;

/// Size of a HASH160 digest in bytes.
pub const HASH160_SIZE: usize = 20;

/// The size to crop identifiers in debug messages.
const BYTES_IN_DEBUG: usize = 4;

/// Errors raised when parsing hex-encoded identifiers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseHashError {
    /// The input was not valid hex.
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    /// The input decoded to the wrong number of bytes.
    #[error("invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected byte count.
        expected: usize,
        /// Actual byte count.
        actual: usize,
    },
}

fn write_short_hex(f: &mut fmt::Formatter<'_>, slice: &[u8]) -> fmt::Result {
    for byte in slice.iter().take(BYTES_IN_DEBUG) {
        write!(f, "{:02x}", byte)?;
    }
    if slice.len() > BYTES_IN_DEBUG {
        write!(f, "...")?;
    }
    Ok(())
}

fn bytes_from_hex(s: &str) -> Result<[u8; HASH_SIZE], ParseHashError> {
    let raw = hex::decode(s).map_err(|e| ParseHashError::InvalidHex(e.to_string()))?;
    if raw.len() != HASH_SIZE {
        return Err(ParseHashError::InvalidLength {
            expected: HASH_SIZE,
            actual: raw.len(),
        });
    }
    let mut bytes = [0; HASH_SIZE];
    bytes.copy_from_slice(&raw);
    Ok(bytes)
}

/// SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Wraps the provided bytes.
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    /// The all-zero hash.
    pub fn zero() -> Self {
        Hash([0; HASH_SIZE])
    }

    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Renders the digest as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a digest from 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, ParseHashError> {
        bytes_from_hex(s).map(Hash)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(")?;
        write_short_hex(f, &self.0)?;
        write!(f, ")")
    }
}

impl FromStr for Hash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(de::Error::custom)
    }
}

/// Transaction identifier.
///
/// Stored and rendered in display order (the byte-reversed form of the
/// double-SHA-256 of the raw transaction), so location strings embed it
/// verbatim.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Txid([u8; HASH_SIZE]);

impl Txid {
    /// Wraps display-order bytes.
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Txid(bytes)
    }

    /// Computes the id of a serialized transaction.
    pub fn compute(rawtx: &[u8]) -> Self {
        let digest = sha256d(rawtx);
        let mut bytes = *digest.as_bytes();
        bytes.reverse();
        Txid(bytes)
    }

    /// Returns the display-order bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Returns the wire-order (internal) bytes, as embedded in tx inputs.
    pub fn to_wire_bytes(&self) -> [u8; HASH_SIZE] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    /// Rebuilds the id from wire-order bytes.
    pub fn from_wire_bytes(mut bytes: [u8; HASH_SIZE]) -> Self {
        bytes.reverse();
        Txid(bytes)
    }

    /// Renders the id as 64 hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses an id from 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self, ParseHashError> {
        bytes_from_hex(s).map(Txid)
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txid(")?;
        write_short_hex(f, &self.0)?;
        write!(f, ")")
    }
}

impl FromStr for Txid {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Txid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Txid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Txid::from_hex(&s).map_err(de::Error::custom)
    }
}

/// Computes the SHA-256 digest of the input.
pub fn sha256(data: &[u8]) -> Hash {
    let digest: [u8; HASH_SIZE] = Sha256::digest(data).into();
    Hash(digest)
}

/// Computes the double-SHA-256 digest of the input.
pub fn sha256d(data: &[u8]) -> Hash {
    let first: [u8; HASH_SIZE] = Sha256::digest(data).into();
    let second: [u8; HASH_SIZE] = Sha256::digest(&first).into();
    Hash(second)
}

/// Computes RIPEMD-160 over SHA-256 of the input.
pub fn hash160(data: &[u8]) -> [u8; HASH160_SIZE] {
    let sha: [u8; HASH_SIZE] = Sha256::digest(data).into();
    let digest: [u8; HASH160_SIZE] = Ripemd160::digest(&sha).into();
    digest
}

/// Address version byte for pay-to-pubkey-hash outputs on the main network.
pub const ADDRESS_VERSION_MAIN: u8 = 0x00;
/// Address version byte for pay-to-pubkey-hash outputs on test networks.
pub const ADDRESS_VERSION_TEST: u8 = 0x6f;

/// Errors raised when decoding a base58check address.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// Malformed base58check payload.
    #[error("bad address encoding: {0}")]
    Encoding(String),
    /// Payload is not version byte + 20-byte hash.
    #[error("bad address length: {0}")]
    Length(usize),
}

/// Encodes a pubkey-hash address for the given version byte.
pub fn encode_address(version: u8, pubkey_hash: &[u8; HASH160_SIZE]) -> String {
    let mut payload = Vec::with_capacity(1 + HASH160_SIZE);
    payload.push(version);
    payload.extend_from_slice(pubkey_hash);
    bs58::encode(payload).with_check().into_string()
}

/// Decodes a base58check address into its version byte and pubkey hash.
pub fn decode_address(address: &str) -> Result<(u8, [u8; HASH160_SIZE]), AddressError> {
    let payload = bs58::decode(address)
        .with_check(None)
        .into_vec()
        .map_err(|e| AddressError::Encoding(e.to_string()))?;
    if payload.len() != 1 + HASH160_SIZE {
        return Err(AddressError::Length(payload.len()));
    }
    let mut hash = [0; HASH160_SIZE];
    hash.copy_from_slice(&payload[1..]);
    Ok((payload[0], hash))
}

/// Derives the pubkey-hash address of a serialized public key.
pub fn address_from_pubkey(version: u8, pubkey: &[u8]) -> String {
    encode_address(version, &hash160(pubkey))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_empty_vector() {
        assert_eq!(
            sha256(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn sha256d_differs_from_single() {
        let data = b"lathe";
        assert_ne!(sha256(data), sha256d(data));
        assert_eq!(sha256d(data), sha256(sha256(data).as_bytes()));
    }

    #[test]
    fn hash_hex_round_trip() {
        let hash = sha256(b"round trip");
        let parsed: Hash = hash.to_hex().parse().unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn hash_rejects_bad_hex() {
        assert_matches::assert_matches!(Hash::from_hex("zz"), Err(ParseHashError::InvalidHex(_)));
        assert_matches::assert_matches!(
            Hash::from_hex("00ff"),
            Err(ParseHashError::InvalidLength { actual: 2, .. })
        );
    }

    #[test]
    fn txid_display_order_reverses_wire_order() {
        let txid = Txid::compute(b"some raw tx");
        let wire = txid.to_wire_bytes();
        assert_eq!(Txid::from_wire_bytes(wire), txid);
        let mut reversed = wire;
        reversed.reverse();
        assert_eq!(&reversed, txid.as_bytes());
    }

    #[test]
    fn address_round_trip() {
        let hash = hash160(b"\x02fake compressed pubkey material");
        let address = encode_address(ADDRESS_VERSION_TEST, &hash);
        let (version, decoded) = decode_address(&address).unwrap();
        assert_eq!(version, ADDRESS_VERSION_TEST);
        assert_eq!(decoded, hash);
    }

    #[test]
    fn address_rejects_tampering() {
        let hash = hash160(b"key");
        let mut address = encode_address(ADDRESS_VERSION_MAIN, &hash);
        // Flip the final character; the checksum must no longer match.
        let last = address.pop().unwrap();
        address.push(if last == '1' { '2' } else { '1' });
        assert!(decode_address(&address).is_err());
    }

    #[test]
    fn serde_as_hex_strings() {
        let hash = sha256(b"serde");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
