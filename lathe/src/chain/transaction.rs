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

//! Raw transaction model and its little-endian serialization.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::crypto::{Txid, HASH_SIZE};

/// Default transaction version emitted by the kernel.
pub const TX_VERSION: u32 = 1;

/// Default input sequence.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// Errors raised while parsing a raw transaction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    /// The byte stream ended early.
    #[error("Bad transaction: truncated")]
    Truncated,
    /// Bytes remained after the locktime field.
    #[error("Bad transaction: trailing bytes")]
    TrailingBytes,
    /// A length prefix exceeded sane bounds.
    #[error("Bad transaction: oversized length {0}")]
    Oversized(u64),
}

/// A transaction input spending a prior output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    /// The transaction being spent.
    pub prev_txid: Txid,
    /// The output index being spent.
    pub prev_vout: u32,
    /// Unlocking script.
    pub script: Vec<u8>,
    /// Sequence number.
    pub sequence: u32,
}

impl TxIn {
    /// An input with an empty unlocking script, to be filled by signing.
    pub fn unsigned(prev_txid: Txid, prev_vout: u32) -> TxIn {
        TxIn {
            prev_txid,
            prev_vout,
            script: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }
    }
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    /// Bound satoshis.
    pub satoshis: u64,
    /// Locking script.
    pub script: Vec<u8>,
}

/// A raw transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    /// Format version.
    pub version: u32,
    /// Inputs.
    pub inputs: Vec<TxIn>,
    /// Outputs.
    pub outputs: Vec<TxOut>,
    /// Locktime.
    pub locktime: u32,
}

impl Transaction {
    /// An empty version-1 transaction.
    pub fn new() -> Transaction {
        Transaction {
            version: TX_VERSION,
            inputs: Vec::new(),
            outputs: Vec::new(),
            locktime: 0,
        }
    }

    /// Serializes to the wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_hint());
        // Writing to a Vec cannot fail.
        out.write_u32::<LittleEndian>(self.version).unwrap();
        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.extend_from_slice(&input.prev_txid.to_wire_bytes());
            out.write_u32::<LittleEndian>(input.prev_vout).unwrap();
            write_varint(&mut out, input.script.len() as u64);
            out.extend_from_slice(&input.script);
            out.write_u32::<LittleEndian>(input.sequence).unwrap();
        }
        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.write_u64::<LittleEndian>(output.satoshis).unwrap();
            write_varint(&mut out, output.script.len() as u64);
            out.extend_from_slice(&output.script);
        }
        out.write_u32::<LittleEndian>(self.locktime).unwrap();
        out
    }

    /// Parses the wire form, rejecting trailing bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Transaction, TxError> {
        let mut cursor = Cursor::new(bytes);
        let version = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| TxError::Truncated)?;
        let input_count = read_varint(&mut cursor)?;
        check_count(input_count, bytes.len())?;
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let mut wire = [0; HASH_SIZE];
            cursor.read_exact(&mut wire).map_err(|_| TxError::Truncated)?;
            let prev_txid = Txid::from_wire_bytes(wire);
            let prev_vout = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| TxError::Truncated)?;
            let script = read_blob(&mut cursor, bytes.len())?;
            let sequence = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| TxError::Truncated)?;
            inputs.push(TxIn {
                prev_txid,
                prev_vout,
                script,
                sequence,
            });
        }
        let output_count = read_varint(&mut cursor)?;
        check_count(output_count, bytes.len())?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let satoshis = cursor
                .read_u64::<LittleEndian>()
                .map_err(|_| TxError::Truncated)?;
            let script = read_blob(&mut cursor, bytes.len())?;
            outputs.push(TxOut { satoshis, script });
        }
        let locktime = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| TxError::Truncated)?;
        if cursor.position() != bytes.len() as u64 {
            return Err(TxError::TrailingBytes);
        }
        Ok(Transaction {
            version,
            inputs,
            outputs,
            locktime,
        })
    }

    /// The transaction id of the serialized form.
    pub fn txid(&self) -> Txid {
        Txid::compute(&self.to_bytes())
    }

    fn size_hint(&self) -> usize {
        let inputs: usize = self
            .inputs
            .iter()
            .map(|i| HASH_SIZE + 4 + 9 + i.script.len() + 4)
            .sum();
        let outputs: usize = self.outputs.iter().map(|o| 8 + 9 + o.script.len()).sum();
        4 + 9 + inputs + 9 + outputs + 4
    }
}

fn check_count(count: u64, available: usize) -> Result<(), TxError> {
    // Each entry consumes bytes, so a count past the buffer is garbage.
    if count > available as u64 {
        return Err(TxError::Oversized(count));
    }
    Ok(())
}

/// Writes a Bitcoin-style variable-length integer.
pub fn write_varint(out: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.write_u16::<LittleEndian>(n as u16).unwrap();
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.write_u32::<LittleEndian>(n as u32).unwrap();
    } else {
        out.push(0xff);
        out.write_u64::<LittleEndian>(n).unwrap();
    }
}

/// Reads a Bitcoin-style variable-length integer.
pub fn read_varint(cursor: &mut Cursor<&[u8]>) -> Result<u64, TxError> {
    let first = cursor.read_u8().map_err(|_| TxError::Truncated)?;
    let n = match first {
        0xfd => u64::from(
            cursor
                .read_u16::<LittleEndian>()
                .map_err(|_| TxError::Truncated)?,
        ),
        0xfe => u64::from(
            cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| TxError::Truncated)?,
        ),
        0xff => cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| TxError::Truncated)?,
        n => u64::from(n),
    };
    Ok(n)
}

fn read_blob(cursor: &mut Cursor<&[u8]>, available: usize) -> Result<Vec<u8>, TxError> {
    let len = read_varint(cursor)?;
    if len > available as u64 {
        return Err(TxError::Oversized(len));
    }
    let mut blob = vec![0; len as usize];
    cursor.read_exact(&mut blob).map_err(|_| TxError::Truncated)?;
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_round_trip() {
        let tx = Transaction::new();
        let bytes = tx.to_bytes();
        assert_eq!(Transaction::from_bytes(&bytes).unwrap(), tx);
    }

    #[test]
    fn full_round_trip() {
        let mut tx = Transaction::new();
        tx.inputs.push(TxIn {
            prev_txid: Txid::compute(b"parent"),
            prev_vout: 3,
            script: vec![1, 2, 3],
            sequence: SEQUENCE_FINAL,
        });
        tx.outputs.push(TxOut {
            satoshis: 546,
            script: vec![0x76, 0xa9],
        });
        tx.outputs.push(TxOut {
            satoshis: 0,
            script: Vec::new(),
        });
        let bytes = tx.to_bytes();
        let parsed = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, tx);
        assert_eq!(parsed.txid(), tx.txid());
    }

    #[test]
    fn txid_changes_with_content() {
        let mut a = Transaction::new();
        let mut b = Transaction::new();
        b.locktime = 1;
        assert_ne!(a.txid(), b.txid());
        a.locktime = 1;
        assert_eq!(a.txid(), b.txid());
    }

    #[test]
    fn rejects_truncated_and_trailing() {
        let tx = Transaction::new();
        let mut bytes = tx.to_bytes();
        assert_eq!(
            Transaction::from_bytes(&bytes[..bytes.len() - 1]),
            Err(TxError::Truncated)
        );
        bytes.push(0);
        assert_eq!(Transaction::from_bytes(&bytes), Err(TxError::TrailingBytes));
    }

    #[test]
    fn varint_boundaries() {
        for n in &[0u64, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, u64::max_value()] {
            let mut out = Vec::new();
            write_varint(&mut out, *n);
            let mut cursor = Cursor::new(out.as_slice());
            assert_eq!(read_varint(&mut cursor).unwrap(), *n);
        }
    }
}
