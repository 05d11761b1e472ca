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

//! Script building and scanning: pay-to-pubkey-hash locks and the
//! `OP_FALSE OP_RETURN` metadata anchor.

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::HASH160_SIZE;

/// `OP_0` / `OP_FALSE`.
pub const OP_FALSE: u8 = 0x00;
/// `OP_PUSHDATA1`.
pub const OP_PUSHDATA1: u8 = 0x4c;
/// `OP_PUSHDATA2`.
pub const OP_PUSHDATA2: u8 = 0x4d;
/// `OP_PUSHDATA4`.
pub const OP_PUSHDATA4: u8 = 0x4e;
/// `OP_RETURN`.
pub const OP_RETURN: u8 = 0x6a;
/// `OP_DUP`.
pub const OP_DUP: u8 = 0x76;
/// `OP_EQUALVERIFY`.
pub const OP_EQUALVERIFY: u8 = 0x88;
/// `OP_HASH160`.
pub const OP_HASH160: u8 = 0xa9;
/// `OP_CHECKSIG`.
pub const OP_CHECKSIG: u8 = 0xac;

/// Builds the standard pay-to-pubkey-hash locking script.
pub fn p2pkh_script(pubkey_hash: &[u8; HASH160_SIZE]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(HASH160_SIZE as u8);
    script.extend_from_slice(pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// Extracts the pubkey hash from a pay-to-pubkey-hash locking script.
pub fn parse_p2pkh(script: &[u8]) -> Option<[u8; HASH160_SIZE]> {
    if script.len() != 25 {
        return None;
    }
    if script[0] != OP_DUP
        || script[1] != OP_HASH160
        || script[2] != HASH160_SIZE as u8
        || script[23] != OP_EQUALVERIFY
        || script[24] != OP_CHECKSIG
    {
        return None;
    }
    let mut hash = [0; HASH160_SIZE];
    hash.copy_from_slice(&script[3..23]);
    Some(hash)
}

/// Appends a minimal data push for the chunk.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len == 0 {
        script.push(OP_FALSE);
    } else if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len <= 0xff {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len <= 0xffff {
        script.push(OP_PUSHDATA2);
        let mut buf = [0; 2];
        LittleEndian::write_u16(&mut buf, len as u16);
        script.extend_from_slice(&buf);
    } else {
        script.push(OP_PUSHDATA4);
        let mut buf = [0; 4];
        LittleEndian::write_u32(&mut buf, len as u32);
        script.extend_from_slice(&buf);
    }
    script.extend_from_slice(data);
}

/// Builds the safe-data anchor script: `OP_FALSE OP_RETURN` followed by
/// one push per chunk.
pub fn anchor_script(chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut script = Vec::new();
    script.push(OP_FALSE);
    script.push(OP_RETURN);
    for chunk in chunks {
        push_data(&mut script, chunk);
    }
    script
}

/// Parses an anchor script back into its data chunks.
///
/// Returns `None` when the script is not an `OP_FALSE OP_RETURN` data
/// carrier or any push is malformed.
pub fn parse_anchor(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    if script.len() < 2 || script[0] != OP_FALSE || script[1] != OP_RETURN {
        return None;
    }
    let mut chunks = Vec::new();
    let mut at = 2;
    while at < script.len() {
        let opcode = script[at];
        at += 1;
        let len = match opcode {
            OP_FALSE => 0,
            n if n < OP_PUSHDATA1 => n as usize,
            OP_PUSHDATA1 => {
                let n = *script.get(at)? as usize;
                at += 1;
                n
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(at..at + 2)?;
                at += 2;
                LittleEndian::read_u16(bytes) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(at..at + 4)?;
                at += 4;
                LittleEndian::read_u32(bytes) as usize
            }
            _ => return None,
        };
        let data = script.get(at..at + len)?;
        at += len;
        chunks.push(data.to_vec());
    }
    Some(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2pkh_round_trip() {
        let hash = [7; HASH160_SIZE];
        let script = p2pkh_script(&hash);
        assert_eq!(script.len(), 25);
        assert_eq!(parse_p2pkh(&script), Some(hash));
        assert_eq!(parse_p2pkh(&script[..24]), None);
    }

    #[test]
    fn anchor_round_trip() {
        let chunks = vec![
            b"run".to_vec(),
            vec![5],
            Vec::new(),
            vec![b'x'; 300],
        ];
        let script = anchor_script(&chunks);
        assert_eq!(&script[..2], &[OP_FALSE, OP_RETURN]);
        assert_eq!(parse_anchor(&script).unwrap(), chunks);
    }

    #[test]
    fn anchor_rejects_non_data_scripts() {
        assert_eq!(parse_anchor(&[OP_RETURN]), None);
        assert_eq!(parse_anchor(&p2pkh_script(&[0; HASH160_SIZE])), None);
        // Truncated push.
        assert_eq!(parse_anchor(&[OP_FALSE, OP_RETURN, 5, 1, 2]), None);
        // Non-push opcode in the body.
        assert_eq!(parse_anchor(&[OP_FALSE, OP_RETURN, OP_DUP]), None);
    }
}
