/// Accumulates block writes into a single RocksDB batch and flushes them at
/// a configured capacity (spec §4.4: flush at 10,000 cached blocks, or on
/// channel close). One keyspace, one batch — no column-family routing is
/// needed here.
use rocksdb::WriteBatch;

use crate::constants::BATCH_CAPACITY;
use crate::db::CommitDb;
use crate::metrics::{self, Timer};
use crate::types::{Block, DbError};

pub struct BatchWriter<'a> {
    db: &'a CommitDb,
    batch: WriteBatch,
    cached: usize,
    capacity: usize,
}

impl<'a> BatchWriter<'a> {
    pub fn new(db: &'a CommitDb) -> Self {
        Self::with_capacity(db, BATCH_CAPACITY)
    }

    pub fn with_capacity(db: &'a CommitDb, capacity: usize) -> Self {
        Self { db, batch: WriteBatch::default(), cached: 0, capacity }
    }

    pub fn store(&mut self, block: &Block) {
        self.db.store_block(&mut self.batch, block);
        self.cached += 1;
    }

    pub fn remove(&mut self, height: u64) {
        self.db.remove_block(&mut self.batch, height);
        self.cached += 1;
    }

    pub fn should_flush(&self) -> bool {
        self.cached >= self.capacity
    }

    pub fn pending(&self) -> usize {
        self.cached
    }

    /// Atomically commits whatever's pending. The batch is replaced before
    /// the write happens so a caller that retries after an error never
    /// resends already-cached operations.
    pub async fn flush(&mut self) -> Result<(), DbError> {
        if self.cached == 0 {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        self.cached = 0;
        let timer = Timer::new();
        let result = self.db.write(batch).await;
        metrics::record_batch_flush(timer.elapsed_secs());
        result
    }
}
