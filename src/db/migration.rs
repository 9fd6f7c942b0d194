/// v1 -> v2 schema migration.
///
/// v1 stored block metadata as `hash_hex(64) || fingerprint_hex(64)` (128
/// ASCII bytes). Its fingerprint was a rolling SHA-256 written incrementally
/// as the scan passed over a block: each commit row contributes its own
/// `key || value`, and the block's hash (as hex ASCII) is folded in last;
/// the hex-encoded digest is compared against the stored fingerprint
/// string. v2 replaces this with a clean `sha256(concat(commit values))`
/// over raw bytes. Migration order matters for crash safety: corrupt rows
/// are deleted first, then every metadata row is rewritten in the v2
/// 96-byte binary layout with a recomputed fingerprint, and the version
/// marker is written last in the same batch as the final rewrite — a crash
/// before that point just leaves a v1 database behind and the whole
/// migration restarts cleanly.
use std::collections::HashSet;

use byteorder::{BigEndian, ByteOrder};
use rocksdb::{IteratorMode, WriteBatch};
use sha2::{Digest, Sha256};

use crate::types::{BlockMetadata, DbError};

use super::{decode_commit, encode_metadata, CommitDb, BLOCK_KEY_LEN, COMMIT_KEY_LEN, CURRENT_SCHEMA_VERSION, VERSION_KEY};

const LEGACY_METADATA_LEN: usize = 128;

struct LegacyRow {
    height: u64,
    hash_hex: [u8; 64],
    fingerprint_hex: [u8; 64],
    hasher: Sha256,
    corrupt: bool,
}

impl LegacyRow {
    fn new(height: u64) -> Self {
        Self { height, hash_hex: [0; 64], fingerprint_hex: [0; 64], hasher: Sha256::new(), corrupt: true }
    }
}

fn legacy_fingerprint_matches(row: LegacyRow) -> (u64, bool) {
    if row.corrupt {
        return (row.height, false);
    }
    let mut hasher = row.hasher;
    hasher.update(row.hash_hex);
    let digest = hasher.finalize();
    let mut our_fingerprint = [0u8; 64];
    hex::encode_to_slice(digest, &mut our_fingerprint).expect("32 bytes encodes to 64 hex chars");
    (row.height, our_fingerprint == row.fingerprint_hex)
}

/// Pass 1: find and delete corrupt v1 rows, mirroring `db_legacy_clean`.
fn clean_corrupt(db: &CommitDb) -> Result<HashSet<u64>, DbError> {
    let mut corrupt = HashSet::new();
    let mut current: Option<LegacyRow> = None;

    let iter = db.db.iterator(IteratorMode::Start);
    for item in iter {
        let (key, value) = item?;
        if key.len() == BLOCK_KEY_LEN {
            if let Some(row) = current.take() {
                let (height, ok) = legacy_fingerprint_matches(row);
                if !ok {
                    corrupt.insert(height);
                }
            }
            let height = BigEndian::read_u64(&key);
            let mut row = LegacyRow::new(height);
            if value.len() == LEGACY_METADATA_LEN {
                row.hash_hex.copy_from_slice(&value[0..64]);
                row.fingerprint_hex.copy_from_slice(&value[64..128]);
                row.corrupt = false;
            }
            current = Some(row);
        } else if key.len() == COMMIT_KEY_LEN {
            if let Some(row) = current.as_mut() {
                if value.len() != 32 {
                    row.corrupt = true;
                } else {
                    row.hasher.update(&key);
                    row.hasher.update(&value);
                }
            }
        }
    }
    if let Some(row) = current.take() {
        let (height, ok) = legacy_fingerprint_matches(row);
        if !ok {
            corrupt.insert(height);
        }
    }

    if !corrupt.is_empty() {
        let mut batch = WriteBatch::default();
        let iter = db.db.iterator(IteratorMode::Start);
        let mut height = 0u64;
        for item in iter {
            let (key, _) = item?;
            if key.len() == BLOCK_KEY_LEN {
                height = BigEndian::read_u64(&key);
            }
            if corrupt.contains(&height) {
                batch.delete(key);
            }
        }
        db.db.write(batch)?;
    }

    Ok(corrupt)
}

/// Rewrites every surviving v1 row into the v2 binary layout and writes the
/// version marker. Idempotent: re-running after `get_version()` already
/// reports v2 is a caller error, not handled here.
pub fn migrate_v1_to_v2(db: &CommitDb) -> Result<(), DbError> {
    clean_corrupt(db)?;

    let mut batch = WriteBatch::default();
    let mut current_height: Option<u64> = None;
    let mut current_hash_hex: [u8; 64] = [0; 64];
    let mut commits_hasher = Sha256::new();
    let mut has_commits = false;

    let flush = |height: u64,
                 hash_hex: &[u8; 64],
                 hasher: Sha256,
                 has_commits: bool,
                 batch: &mut WriteBatch| {
        let mut hash = [0u8; 32];
        hex::decode_to_slice(hash_hex, &mut hash).expect("legacy hash hex is well-formed");
        let fingerprint = if has_commits { hasher.finalize().into() } else { [0u8; 32] };
        let metadata = BlockMetadata { height, hash, previous: [0u8; 32], fingerprint };
        let key = super::height_key(height);
        batch.put(key, encode_metadata(&metadata));
    };

    let iter = db.db.iterator(IteratorMode::Start);
    for item in iter {
        let (key, value) = item?;
        if key.len() == BLOCK_KEY_LEN {
            if let Some(h) = current_height.take() {
                flush(h, &current_hash_hex, commits_hasher, has_commits, &mut batch);
            }
            commits_hasher = Sha256::new();
            has_commits = false;
            let height = BigEndian::read_u64(&key);
            current_height = Some(height);
            if value.len() == LEGACY_METADATA_LEN {
                current_hash_hex.copy_from_slice(&value[0..64]);
            }
        } else if key.len() == COMMIT_KEY_LEN {
            if decode_commit(&value).is_ok() {
                has_commits = true;
                commits_hasher.update(&value);
            }
        }
    }
    if let Some(h) = current_height.take() {
        flush(h, &current_hash_hex, commits_hasher, has_commits, &mut batch);
    }

    let mut version_value = [0u8; 2];
    BigEndian::write_u16(&mut version_value, CURRENT_SCHEMA_VERSION);
    batch.put(VERSION_KEY, version_value);

    db.db.write(batch)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocksdb::Options;
    use tempfile::TempDir;

    use super::super::commit_key;

    fn write_legacy_block(db: &rocksdb::DB, height: u64, hash_hex: &str, fingerprint_hex: &str, commits: &[[u8; 32]]) {
        let mut batch = WriteBatch::default();
        let key = super::super::height_key(height);
        let mut value = vec![0u8; 128];
        value[0..64].copy_from_slice(hash_hex.as_bytes());
        value[64..128].copy_from_slice(fingerprint_hex.as_bytes());
        batch.put(key, value);
        for (i, c) in commits.iter().enumerate() {
            let ckey = commit_key(height, i as u32);
            batch.put(ckey, c);
        }
        db.write(batch).unwrap();
    }

    fn legacy_fingerprint(height: u64, hash_hex: &str, commits: &[[u8; 32]]) -> String {
        let mut hasher = Sha256::new();
        for (i, c) in commits.iter().enumerate() {
            hasher.update(commit_key(height, i as u32));
            hasher.update(c);
        }
        hasher.update(hash_hex.as_bytes());
        hex::encode(hasher.finalize())
    }

    #[tokio::test]
    async fn migrates_a_valid_legacy_block_to_v2() {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let raw = rocksdb::DB::open(&opts, dir.path()).unwrap();

        let hash_hex = "11".repeat(32);
        let commits = [[0x11u8; 32], [0x22; 32]];
        let expected_fp_hex = legacy_fingerprint(481_824, &hash_hex, &commits);
        write_legacy_block(&raw, 481_824, &hash_hex, &expected_fp_hex, &commits);
        drop(raw);

        let (db, _) = CommitDb::open(dir.path()).unwrap();
        migrate_v1_to_v2(&db).unwrap();

        assert_eq!(db.get_version().unwrap(), Some(CURRENT_SCHEMA_VERSION));
        let result = db.load_range(481_824, 481_824).unwrap();
        assert!(result.corrupted.is_empty());
        assert_eq!(result.blocks.len(), 1);
        let expected_fp: [u8; 32] = Sha256::digest(commits.concat()).into();
        assert_eq!(result.blocks[0].metadata.fingerprint, expected_fp);
    }

    #[tokio::test]
    async fn corrupt_legacy_block_is_removed_before_migration() {
        let dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let raw = rocksdb::DB::open(&opts, dir.path()).unwrap();

        let hash_hex = "22".repeat(32);
        // wrong fingerprint on purpose
        write_legacy_block(&raw, 481_824, &hash_hex, &"00".repeat(32), &[[0x33; 32]]);
        drop(raw);

        let (db, _) = CommitDb::open(dir.path()).unwrap();
        migrate_v1_to_v2(&db).unwrap();

        let result = db.load_range(0, u64::MAX).unwrap();
        assert!(result.blocks.is_empty());
    }
}
