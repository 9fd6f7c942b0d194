/// Raw Bitcoin block parsing.
///
/// Pure byte-grammar parser: no I/O, no allocation beyond the returned
/// commit vector, panic-free on malformed input.
use crate::types::{BlockData, Commit, ParseError};
use byteorder::{LittleEndian, ReadBytesExt};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};

const HEADER_LEN: usize = 80;

fn need(cursor: &Cursor<&[u8]>, n: usize) -> Result<(), ParseError> {
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if remaining < n {
        return Err(ParseError::TooShort { needed: n, have: remaining });
    }
    Ok(())
}

fn skip(cursor: &mut Cursor<&[u8]>, n: usize) -> Result<(), ParseError> {
    need(cursor, n)?;
    cursor.set_position(cursor.position() + n as u64);
    Ok(())
}

/// Bitcoin varint (`CompactSize`): `<0xfd` is a literal byte; `0xfd`/`0xfe`/`0xff`
/// prefix a little-endian u16/u32/u64.
fn read_varint(cursor: &mut Cursor<&[u8]>) -> Result<u64, ParseError> {
    need(cursor, 1)?;
    let prefix = cursor.read_u8().map_err(|_| ParseError::BadVarint)?;
    match prefix {
        0xfd => {
            need(cursor, 2)?;
            cursor.read_u16::<LittleEndian>().map(u64::from).map_err(|_| ParseError::BadVarint)
        }
        0xfe => {
            need(cursor, 4)?;
            cursor.read_u32::<LittleEndian>().map(u64::from).map_err(|_| ParseError::BadVarint)
        }
        0xff => {
            need(cursor, 8)?;
            cursor.read_u64::<LittleEndian>().map_err(|_| ParseError::BadVarint)
        }
        v => Ok(v as u64),
    }
}

fn reverse32(mut bytes: [u8; 32]) -> [u8; 32] {
    bytes.reverse();
    bytes
}

/// Parses one raw serialized Bitcoin block into its hash, previous-block
/// hash, and ordered P2WSH commits. See spec §4.1 for the exact grammar.
pub fn parse_block(bytes: &[u8]) -> Result<BlockData, ParseError> {
    if bytes.len() < HEADER_LEN {
        return Err(ParseError::TooShort { needed: HEADER_LEN, have: bytes.len() });
    }

    let mut header_hash = [0u8; 32];
    header_hash.copy_from_slice(&Sha256::digest(Sha256::digest(&bytes[0..HEADER_LEN])));
    let hash = reverse32(header_hash);

    let mut previous = [0u8; 32];
    previous.copy_from_slice(&bytes[4..36]);
    let previous = reverse32(previous);

    let mut cursor = Cursor::new(bytes);
    skip(&mut cursor, HEADER_LEN)?;

    let tx_count = read_varint(&mut cursor)?;
    let mut commits = Vec::new();

    for _ in 0..tx_count {
        skip(&mut cursor, 4)?; // version

        let mut in_count = read_varint(&mut cursor)?;
        let mut segwit = false;
        if in_count == 0 {
            // marker/flag: 0x00 already consumed as in_count's single byte,
            // one more flag byte remains before the real input count.
            segwit = true;
            skip(&mut cursor, 1)?;
            in_count = read_varint(&mut cursor)?;
        }

        for _ in 0..in_count {
            skip(&mut cursor, 36)?; // outpoint: txid(32) + vout(4)
            let sig_size = read_varint(&mut cursor)?;
            skip(&mut cursor, sig_size as usize)?;
            skip(&mut cursor, 4)?; // sequence
        }

        let out_count = read_varint(&mut cursor)?;
        for _ in 0..out_count {
            skip(&mut cursor, 8)?; // value

            let offset = cursor.position() as usize;
            let pub_size = read_varint(&mut cursor)?;
            need(&mut cursor, pub_size as usize)?;

            if pub_size == 34 {
                let script_start = cursor.position() as usize;
                let script = &bytes[script_start..script_start + 34];
                if script[0] == 0x00 && script[1] == 0x20 {
                    let mut commit = [0u8; 32];
                    commit.copy_from_slice(&script[2..34]);
                    commits.push(Commit(commit));
                }
            } else if pub_size > u32::MAX as u64 {
                return Err(ParseError::BadScript { offset });
            }

            skip(&mut cursor, pub_size as usize)?;
        }

        if segwit {
            for _ in 0..in_count {
                let witness_count = read_varint(&mut cursor)?;
                for _ in 0..witness_count {
                    let witness_size = read_varint(&mut cursor)?;
                    skip(&mut cursor, witness_size as usize)?;
                }
            }
        }

        skip(&mut cursor, 4)?; // locktime
    }

    // Drain whatever's left so callers that pass a trailing-padded slice don't fail.
    let mut _rest = Vec::new();
    let _ = cursor.read_to_end(&mut _rest);

    Ok(BlockData { hash, previous, commits })
}
