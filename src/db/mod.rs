/// Commit database.
///
/// A single flat RocksDB keyspace partitioned by key length (spec §3):
/// 2-byte schema version key, 8-byte big-endian height keys for block
/// metadata, 16-byte big-endian `(height, order)` keys for commits. No
/// column families are needed since there is only one logical table.
pub mod migration;

use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;

use crate::types::{Block, BlockHash, BlockMetadata, Commit, DbError};

pub const CURRENT_SCHEMA_VERSION: u16 = 2;
const VERSION_KEY: [u8; 2] = [0, 0];
const BLOCK_KEY_LEN: usize = 8;
const COMMIT_KEY_LEN: usize = 16;
const METADATA_VALUE_LEN: usize = 96;

pub struct IsNew(pub bool);

/// Result of a ranged load: blocks reconstructed up to (not including) the
/// first corrupted height, plus the corrupted heights encountered.
pub struct LoadResult {
    pub blocks: Vec<Block>,
    pub corrupted: Vec<u64>,
}

pub fn height_key(height: u64) -> [u8; BLOCK_KEY_LEN] {
    let mut key = [0u8; BLOCK_KEY_LEN];
    BigEndian::write_u64(&mut key, height);
    key
}

pub fn commit_key(height: u64, order: u32) -> [u8; COMMIT_KEY_LEN] {
    let mut key = [0u8; COMMIT_KEY_LEN];
    BigEndian::write_u64(&mut key[0..8], height);
    BigEndian::write_u32(&mut key[8..12], order);
    key
}

fn encode_metadata(m: &BlockMetadata) -> [u8; METADATA_VALUE_LEN] {
    let mut value = [0u8; METADATA_VALUE_LEN];
    value[0..32].copy_from_slice(&m.hash);
    value[32..64].copy_from_slice(&m.previous);
    value[64..96].copy_from_slice(&m.fingerprint);
    value
}

fn decode_metadata(height: u64, value: &[u8]) -> Result<BlockMetadata, DbError> {
    if value.len() != METADATA_VALUE_LEN {
        return Err(DbError::WrongLength {
            what: "block metadata",
            expected: METADATA_VALUE_LEN,
            got: value.len(),
        });
    }
    let mut hash = [0u8; 32];
    let mut previous = [0u8; 32];
    let mut fingerprint = [0u8; 32];
    hash.copy_from_slice(&value[0..32]);
    previous.copy_from_slice(&value[32..64]);
    fingerprint.copy_from_slice(&value[64..96]);
    Ok(BlockMetadata { height, hash, previous, fingerprint })
}

fn decode_commit(value: &[u8]) -> Result<Commit, DbError> {
    if value.len() != 32 {
        return Err(DbError::WrongLength { what: "commit", expected: 32, got: value.len() });
    }
    let mut c = [0u8; 32];
    c.copy_from_slice(value);
    Ok(Commit(c))
}

fn block_fingerprint(commits: &[Commit]) -> [u8; 32] {
    if commits.is_empty() {
        return [0u8; 32];
    }
    let mut hasher = Sha256::new();
    for c in commits {
        hasher.update(c.as_bytes());
    }
    hasher.finalize().into()
}

fn xor32(a: [u8; 32], b: [u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

#[derive(Clone)]
pub struct CommitDb {
    db: Arc<DB>,
    /// Held across every batch write and across process shutdown so the
    /// store is never observed mid-write.
    critical: Arc<AsyncMutex<()>>,
}

/// RocksDB tuning for this workload: sequential-height writes in large
/// batches, almost no random reads outside of `get_block_by_*`/`find_commits`.
fn tuned_options() -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.set_write_buffer_size(256 * 1024 * 1024);
    opts.set_max_write_buffer_number(4);
    opts.set_min_write_buffer_number_to_merge(2);
    opts.set_target_file_size_base(256 * 1024 * 1024);
    opts.set_level_zero_file_num_compaction_trigger(8);
    opts.set_max_background_jobs(8);
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    opts.increase_parallelism(8);
    opts
}

impl CommitDb {
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, IsNew), DbError> {
        let opts = tuned_options();
        let is_new = !path.as_ref().join("CURRENT").exists();

        let db = DB::open(&opts, path)?;
        let store = Self { db: Arc::new(db), critical: Arc::new(AsyncMutex::new(())) };

        if is_new {
            let mut batch = WriteBatch::default();
            let mut value = [0u8; 2];
            BigEndian::write_u16(&mut value, CURRENT_SCHEMA_VERSION);
            batch.put(VERSION_KEY, value);
            store.db.write(batch)?;
        }

        Ok((store, IsNew(is_new)))
    }

    pub fn critical_lock(&self) -> Arc<AsyncMutex<()>> {
        self.critical.clone()
    }

    /// `None` means the version key is absent: a legacy v1 database.
    pub fn get_version(&self) -> Result<Option<u16>, DbError> {
        match self.db.get(VERSION_KEY)? {
            Some(bytes) if bytes.len() == 2 => Ok(Some(BigEndian::read_u16(&bytes))),
            Some(bytes) => Err(DbError::WrongLength { what: "version", expected: 2, got: bytes.len() }),
            None => Ok(None),
        }
    }

    pub fn store_block(&self, batch: &mut WriteBatch, block: &Block) {
        for (order, commit) in block.commits.iter().enumerate() {
            let key = commit_key(block.metadata.height, order as u32);
            batch.put(key, commit.as_bytes());
        }
        let key = height_key(block.metadata.height);
        let value = encode_metadata(&block.metadata);
        batch.put(key, value);
    }

    pub fn remove_block(&self, batch: &mut WriteBatch, height: u64) {
        let prefix = height_key(height);
        let iter = self.db.iterator(IteratorMode::From(&prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, _) = item.expect("rocksdb iterator error");
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete(key);
        }
    }

    /// Deletes every row whose height prefix is >= `height`, flushed
    /// synchronously under the critical lock.
    pub async fn remove_blocks_after(&self, height: u64) -> Result<(), DbError> {
        let mut batch = WriteBatch::default();
        let start = height_key(height);
        let iter = self.db.iterator(IteratorMode::From(&start, rocksdb::Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            batch.delete(key);
        }
        self.write(batch).await
    }

    /// Atomically applies `batch` with fsync, serialized under the
    /// process-wide critical lock.
    pub async fn write(&self, batch: WriteBatch) -> Result<(), DbError> {
        let _guard = self.critical.lock().await;
        let mut write_opts = rocksdb::WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Ordered load over `[start, end]` by height; stops reconstructing
    /// (but does not error out) at the first corrupted height.
    pub fn load_range(&self, start: u64, end: u64) -> Result<LoadResult, DbError> {
        let mut blocks = Vec::new();
        let mut corrupted = Vec::new();

        let start_key = height_key(start);
        let iter = self.db.iterator(IteratorMode::From(&start_key, rocksdb::Direction::Forward));

        let mut current_height: Option<u64> = None;
        let mut current_metadata: Option<BlockMetadata> = None;
        let mut current_commits: Vec<Commit> = Vec::new();
        let mut halted = false;

        let flush_current = |metadata: &BlockMetadata,
                              commits: &[Commit],
                              blocks: &mut Vec<Block>,
                              corrupted: &mut Vec<u64>|
         -> bool {
            let fp = block_fingerprint(commits);
            if fp != metadata.fingerprint {
                corrupted.push(metadata.height);
                return false;
            }
            blocks.push(Block { metadata: *metadata, commits: commits.to_vec() });
            true
        };

        for item in iter {
            if halted {
                break;
            }
            let (key, value) = item?;
            if key.len() == BLOCK_KEY_LEN {
                let height = BigEndian::read_u64(&key);
                if height > end {
                    break;
                }
                if let Some(metadata) = current_metadata.take() {
                    if !flush_current(&metadata, &current_commits, &mut blocks, &mut corrupted) {
                        halted = true;
                        break;
                    }
                }
                current_commits.clear();
                current_height = Some(height);
                match decode_metadata(height, &value) {
                    Ok(metadata) => current_metadata = Some(metadata),
                    Err(_) => {
                        corrupted.push(height);
                        halted = true;
                        break;
                    }
                }
            } else if key.len() == COMMIT_KEY_LEN {
                if current_height.is_none() {
                    continue;
                }
                match decode_commit(&value) {
                    Ok(c) => current_commits.push(c),
                    Err(_) => {
                        if let Some(h) = current_height {
                            corrupted.push(h);
                        }
                        halted = true;
                    }
                }
            }
        }

        if !halted {
            if let Some(metadata) = current_metadata.take() {
                flush_current(&metadata, &current_commits, &mut blocks, &mut corrupted);
            }
        }

        Ok(LoadResult { blocks, corrupted })
    }

    pub fn get_block_by_height(&self, height: u64) -> Result<Option<BlockMetadata>, DbError> {
        let iter = self.db.iterator(IteratorMode::End);
        for item in iter {
            let (key, value) = item?;
            if key.len() == BLOCK_KEY_LEN {
                let h = BigEndian::read_u64(&key);
                if h == height {
                    return Ok(Some(decode_metadata(h, &value)?));
                }
            }
        }
        Ok(None)
    }

    pub fn get_block_by_hash(&self, hash: BlockHash) -> Result<Option<BlockMetadata>, DbError> {
        let iter = self.db.iterator(IteratorMode::End);
        for item in iter {
            let (key, value) = item?;
            if key.len() == BLOCK_KEY_LEN {
                let h = BigEndian::read_u64(&key);
                let metadata = decode_metadata(h, &value)?;
                if metadata.hash == hash {
                    return Ok(Some(metadata));
                }
            }
        }
        Ok(None)
    }

    pub fn find_commits(&self, commit: Commit) -> Result<Vec<u64>, DbError> {
        let mut out = Vec::new();
        let mut height = 0u64;
        let iter = self.db.iterator(IteratorMode::Start);
        for item in iter {
            let (key, value) = item?;
            if key.len() == BLOCK_KEY_LEN {
                height = BigEndian::read_u64(&key);
            } else if key.len() == COMMIT_KEY_LEN {
                let c = decode_commit(&value)?;
                if c == commit {
                    out.push(height);
                }
            }
        }
        Ok(out)
    }

    pub fn compute_db_fingerprint(&self) -> Result<[u8; 32], DbError> {
        let mut fingerprint = [0u8; 32];
        let iter = self.db.iterator(IteratorMode::Start);
        for item in iter {
            let (key, value) = item?;
            if key.len() == BLOCK_KEY_LEN {
                let height = BigEndian::read_u64(&key);
                let metadata = decode_metadata(height, &value)?;
                fingerprint = xor32(fingerprint, metadata.fingerprint);
            }
        }
        Ok(fingerprint)
    }

    pub fn inspect(&self) -> Result<DbStats, DbError> {
        let version = self.get_version()?;
        let mut lowest = None;
        let mut highest = None;
        let mut total_commits = 0u64;
        let iter = self.db.iterator(IteratorMode::Start);
        for item in iter {
            let (key, _) = item?;
            if key.len() == BLOCK_KEY_LEN {
                let h = BigEndian::read_u64(&key);
                lowest = Some(lowest.map_or(h, |l: u64| l.min(h)));
                highest = Some(highest.map_or(h, |hh: u64| hh.max(h)));
            } else if key.len() == COMMIT_KEY_LEN {
                total_commits += 1;
            }
        }
        Ok(DbStats {
            version,
            lowest_height: lowest,
            highest_height: highest,
            total_commits,
            fingerprint: self.compute_db_fingerprint()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DbStats {
    pub version: Option<u16>,
    pub lowest_height: Option<u64>,
    pub highest_height: Option<u64>,
    pub total_commits: u64,
    pub fingerprint: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockData;
    use tempfile::TempDir;

    fn block_at(height: u64, previous: [u8; 32], commits: Vec<Commit>) -> Block {
        let data = BlockData { hash: [height as u8; 32], previous, commits };
        data.into_block(height)
    }

    #[tokio::test]
    async fn open_creates_version_key() {
        let dir = TempDir::new().unwrap();
        let (db, is_new) = CommitDb::open(dir.path()).unwrap();
        assert!(is_new.0);
        assert_eq!(db.get_version().unwrap(), Some(CURRENT_SCHEMA_VERSION));
    }

    #[tokio::test]
    async fn store_and_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let (db, _) = CommitDb::open(dir.path()).unwrap();

        let a = Commit([0x11; 32]);
        let b = Commit([0x22; 32]);
        let block = block_at(481_824, [0x00; 32], vec![a, b]);

        let mut batch = WriteBatch::default();
        db.store_block(&mut batch, &block);
        db.write(batch).await.unwrap();

        let result = db.load_range(481_824, 481_824).unwrap();
        assert!(result.corrupted.is_empty());
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].commits, vec![a, b]);
        assert_eq!(result.blocks[0].metadata.fingerprint, block.metadata.fingerprint);
    }

    #[tokio::test]
    async fn remove_blocks_after_deletes_everything_from_height() {
        let dir = TempDir::new().unwrap();
        let (db, _) = CommitDb::open(dir.path()).unwrap();

        for h in 481_824..481_828u64 {
            let block = block_at(h, [0; 32], vec![]);
            let mut batch = WriteBatch::default();
            db.store_block(&mut batch, &block);
            db.write(batch).await.unwrap();
        }

        db.remove_blocks_after(481_826).await.unwrap();

        assert!(db.get_block_by_height(481_824).unwrap().is_some());
        assert!(db.get_block_by_height(481_825).unwrap().is_some());
        assert!(db.get_block_by_height(481_826).unwrap().is_none());
        assert!(db.get_block_by_height(481_827).unwrap().is_none());
    }

    #[tokio::test]
    async fn fingerprint_mismatch_is_detected_and_halts_load() {
        let dir = TempDir::new().unwrap();
        let (db, _) = CommitDb::open(dir.path()).unwrap();

        let mut block = block_at(481_824, [0; 32], vec![Commit([0x11; 32])]);
        block.metadata.fingerprint = [0xff; 32]; // force mismatch
        let mut batch = WriteBatch::default();
        db.store_block(&mut batch, &block);
        db.write(batch).await.unwrap();

        let result = db.load_range(481_824, 481_824).unwrap();
        assert!(result.blocks.is_empty());
        assert_eq!(result.corrupted, vec![481_824]);
    }

    #[tokio::test]
    async fn db_fingerprint_is_order_independent_xor_fold() {
        let dir = TempDir::new().unwrap();
        let (db, _) = CommitDb::open(dir.path()).unwrap();

        let block1 = block_at(481_824, [0; 32], vec![Commit([0x11; 32])]);
        let block2 = block_at(481_825, [0; 32], vec![Commit([0x22; 32]), Commit([0x33; 32])]);

        let mut batch = WriteBatch::default();
        db.store_block(&mut batch, &block2);
        db.store_block(&mut batch, &block1);
        db.write(batch).await.unwrap();

        let expected = xor32(block1.metadata.fingerprint, block2.metadata.fingerprint);
        assert_eq!(db.compute_db_fingerprint().unwrap(), expected);
    }
}
