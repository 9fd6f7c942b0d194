/// Synchronizer / ingester (spec §4.4): drives block sources, detects
/// reorgs against the in-memory chain map, batches writes, and advances
/// the commit engine.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rocksdb::WriteBatch;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::batch_writer::BatchWriter;
use crate::block_source::direct::DirectSource;
use crate::block_source::rest::RestSource;
use crate::block_source::{BlockSource, DEFAULT_CHANNEL_CAPACITY};
use crate::chain_map::ChainMap;
use crate::commit_engine::CommitEngine;
use crate::constants::{checkpoint_hash, ACTIVATION_HEIGHT, CHECKPOINT_HEIGHT, DIRECT_SOURCE_THRESHOLD};
use crate::core::Core;
use crate::metrics;
use crate::reorg::reorg_to;
use crate::types::{BlockData, BlockHash, CoreError};

/// How long to wait between chaininfo probes once caught up to the tip,
/// and after a transport error, respectively.
const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

pub struct Ingester<E: CommitEngine> {
    core: Arc<Core<E>>,
    rest: RestSource,
    direct_data_dir: Option<PathBuf>,
    chain_map: ChainMap,
    current_hash: BlockHash,
    current_height: u64,
    idle_interval: Duration,
    backoff: Duration,
}

impl<E: CommitEngine> Ingester<E> {
    /// Rebuilds the chain map and current tip from whatever is already on
    /// disk, returning the ingester alongside any corrupted heights found
    /// while loading (spec §4.3 load-time corruption detection).
    pub async fn bootstrap(
        core: Core<E>,
        rest_base_url: String,
        direct_data_dir: Option<PathBuf>,
    ) -> Result<(Self, Vec<u64>), CoreError> {
        let rest = RestSource::new(rest_base_url)?;
        let checkpoint = checkpoint_hash();
        let mut chain_map = ChainMap::seeded_at(checkpoint);

        let load = core.db.load_range(ACTIVATION_HEIGHT, u64::MAX)?;
        for block in &load.blocks {
            chain_map.insert(block.metadata.hash, block.metadata.previous);
        }
        let (current_hash, current_height) = match load.blocks.last() {
            Some(last) => (last.metadata.hash, last.metadata.height),
            None => (checkpoint, CHECKPOINT_HEIGHT),
        };

        let ingester = Self {
            core: Arc::new(core),
            rest,
            direct_data_dir,
            chain_map,
            current_hash,
            current_height,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            backoff: DEFAULT_BACKOFF,
        };
        Ok((ingester, load.corrupted))
    }

    pub fn current_height(&self) -> u64 {
        self.current_height
    }

    pub fn current_hash(&self) -> BlockHash {
        self.current_hash
    }

    /// Fetches each corrupted height individually from the REST source, in
    /// ascending order, and rewrites it. Requires the upstream node to be
    /// reachable; any failure here is fatal, since proceeding would leave
    /// the commit engine fed from a database known to be inconsistent.
    pub async fn repair(&self, mut corrupted: Vec<u64>) -> Result<(), CoreError> {
        corrupted.sort_unstable();
        for height in corrupted {
            let metadata = self.core.db.get_block_by_height(height)?.ok_or_else(|| {
                CoreError::Invariant(format!("corrupted height {height} has no metadata row to repair from"))
            })?;
            let data = self.rest.fetch_block(metadata.hash).await.map_err(|e| {
                error!(height, error = %e, "repair: upstream unreachable, aborting");
                CoreError::Source(e)
            })?;
            let block = data.into_block(height);
            let mut batch = WriteBatch::default();
            self.core.db.store_block(&mut batch, &block);
            self.core.db.write(batch).await?;
            info!(height, "repaired corrupted block");
        }
        Ok(())
    }

    /// Runs the synchronizer forever: probe, catch up (or idle), repeat.
    pub async fn run(&mut self) -> Result<(), CoreError> {
        loop {
            self.run_once().await?;
        }
    }

    async fn run_once(&mut self) -> Result<(), CoreError> {
        let tip = match self.rest.probe_tip().await {
            Ok(tip) => tip,
            Err(e) => {
                warn!(error = %e, "tip probe failed, backing off");
                sleep(self.backoff).await;
                return Ok(());
            }
        };

        if tip.top_hash == self.current_hash {
            sleep(self.idle_interval).await;
            return Ok(());
        }

        let delta = tip.height.saturating_sub(self.current_height);
        let source = self.select_source(delta);
        info!(delta, source = source.label(), current_height = self.current_height, "catching up");

        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let target = tip.top_hash;
        let source_label = source.label();
        let chain_map_snapshot = self.chain_map.clone();
        let handle = tokio::spawn(async move { source.stream_range(target, &chain_map_snapshot, delta, tx).await });

        metrics::set_blocks_behind_tip(delta as i64);
        self.drain(rx, source_label).await?;

        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "block source attempt failed, will retry"),
            Err(e) => warn!(error = %e, "block source task panicked"),
        }
        Ok(())
    }

    /// Direct source wins once the gap exceeds the threshold and a data
    /// directory is configured and actually contains block files;
    /// otherwise falls back to REST (spec §4.2.2).
    fn select_source(&self, delta: u64) -> BlockSource {
        if delta > DIRECT_SOURCE_THRESHOLD {
            if let Some(dir) = &self.direct_data_dir {
                let direct = DirectSource::new(dir.clone(), self.core.network);
                if direct.check_path().is_ok() {
                    return BlockSource::Direct(direct);
                }
            }
        }
        let rest = RestSource::new(self.rest.base_url().to_string())
            .expect("constructing a second REST client cannot fail once the first succeeded");
        BlockSource::Rest(rest)
    }

    /// Per-block processing per spec §4.4's decision tree. Reorgs flush
    /// the pending batch first, then retry the same block once state has
    /// moved to the new ancestor.
    async fn drain(&mut self, rx: mpsc::Receiver<BlockData>, source_label: &str) -> Result<(), CoreError> {
        let mut writer = BatchWriter::new(&self.core.db);
        let mut stream = ReceiverStream::new(rx);
        while let Some(data) = stream.next().await {
            let mut data = data;
            loop {
                if data.previous == self.current_hash {
                    let height = self.current_height + 1;
                    let block = data.into_block(height);

                    self.core.commit_engine.acquire();
                    let loaded = self.core.commit_engine.load_block(&block);
                    self.core.commit_engine.release();
                    loaded.map_err(CoreError::Other)?;

                    writer.store(&block);
                    self.chain_map.insert(block.metadata.hash, block.metadata.previous);
                    self.current_hash = block.metadata.hash;
                    self.current_height = height;

                    metrics::increment_blocks_processed(source_label, 1);
                    metrics::set_chain_tip_height("local", height as i64);

                    if writer.should_flush() {
                        writer.flush().await?;
                    }
                    break;
                } else if self.chain_map.contains(&data.previous) {
                    writer.flush().await?;
                    let new_height = reorg_to(
                        &mut self.chain_map,
                        &self.core.db,
                        self.core.commit_engine.as_ref(),
                        self.current_hash,
                        data.previous,
                    )
                    .await?;
                    self.current_hash = data.previous;
                    self.current_height = new_height;
                    debug!(new_height, "resuming ingestion after reorg");
                    continue;
                } else {
                    metrics::increment_invariant_violations("disconnected_block");
                    return Err(CoreError::Invariant(format!(
                        "block {} (prev {}) connects to neither current tip {} nor the chain map",
                        hex::encode(data.hash),
                        hex::encode(data.previous),
                        hex::encode(self.current_hash)
                    )));
                }
            }
        }
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_engine::NullCommitEngine;
    use crate::constants::Network;
    use crate::db::CommitDb;
    use crate::types::Commit;
    use tempfile::TempDir;

    async fn new_ingester() -> (Ingester<NullCommitEngine>, TempDir) {
        let dir = TempDir::new().unwrap();
        let (db, _) = CommitDb::open(dir.path()).unwrap();
        let core = Core::new(db, NullCommitEngine::new(CHECKPOINT_HEIGHT), Network::Mainnet);
        let (ingester, corrupted) =
            Ingester::bootstrap(core, "http://127.0.0.1:1/rest".to_string(), None).await.unwrap();
        assert!(corrupted.is_empty());
        (ingester, dir)
    }

    fn chained_block(height: u64, previous: BlockHash, commits: Vec<Commit>) -> BlockData {
        BlockData { hash: [height as u8; 32], previous, commits }
    }

    #[tokio::test]
    async fn cold_start_five_empty_blocks() {
        let (mut ingester, _dir) = new_ingester().await;
        assert_eq!(ingester.current_height(), CHECKPOINT_HEIGHT);

        let (tx, rx) = mpsc::channel(16);
        let mut previous = ingester.current_hash();
        for h in (CHECKPOINT_HEIGHT + 1)..=(CHECKPOINT_HEIGHT + 5) {
            let block = chained_block(h, previous, vec![]);
            previous = block.hash;
            tx.send(block).await.unwrap();
        }
        drop(tx);

        ingester.drain(rx, "rest").await.unwrap();

        assert_eq!(ingester.current_height(), CHECKPOINT_HEIGHT + 5);
        let fingerprint = ingester.core.db.compute_db_fingerprint().unwrap();
        assert_eq!(fingerprint, [0u8; 32]);
    }

    #[tokio::test]
    async fn one_block_with_two_commits() {
        let (mut ingester, _dir) = new_ingester().await;
        let a = Commit([0x11; 32]);
        let b = Commit([0x22; 32]);
        let (tx, rx) = mpsc::channel(4);
        tx.send(chained_block(CHECKPOINT_HEIGHT + 1, ingester.current_hash(), vec![a, b])).await.unwrap();
        drop(tx);

        ingester.drain(rx, "rest").await.unwrap();

        let result = ingester.core.db.load_range(CHECKPOINT_HEIGHT + 1, CHECKPOINT_HEIGHT + 1).unwrap();
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].commits, vec![a, b]);
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(a.as_bytes());
        hasher.update(b.as_bytes());
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(result.blocks[0].metadata.fingerprint, expected);
    }

    #[tokio::test]
    async fn reorg_of_depth_two_truncates_and_resumes() {
        let (mut ingester, _dir) = new_ingester().await;

        let (tx, rx) = mpsc::channel(16);
        let mut previous = ingester.current_hash();
        let mut hash_at = std::collections::HashMap::new();
        hash_at.insert(CHECKPOINT_HEIGHT, previous);
        for h in (CHECKPOINT_HEIGHT + 1)..=(CHECKPOINT_HEIGHT + 5) {
            let block = chained_block(h, previous, vec![]);
            hash_at.insert(h, block.hash);
            previous = block.hash;
            tx.send(block).await.unwrap();
        }
        drop(tx);
        ingester.drain(rx, "rest").await.unwrap();
        assert_eq!(ingester.current_height(), CHECKPOINT_HEIGHT + 5);

        // New block whose `previous` is the hash stored at height+2 (two
        // heights back), not the current tip.
        let reorg_previous = hash_at[&(CHECKPOINT_HEIGHT + 2)];
        let new_tip_height = CHECKPOINT_HEIGHT + 3;
        let (tx2, rx2) = mpsc::channel(4);
        tx2.send(chained_block(new_tip_height, reorg_previous, vec![])).await.unwrap();
        drop(tx2);

        ingester.drain(rx2, "rest").await.unwrap();

        assert_eq!(ingester.current_height(), new_tip_height);
        assert_eq!(ingester.core.commit_engine.get_height(), new_tip_height);
        assert!(ingester.core.db.get_block_by_height(CHECKPOINT_HEIGHT + 1).unwrap().is_some());
        assert!(ingester.core.db.get_block_by_height(CHECKPOINT_HEIGHT + 2).unwrap().is_some());
        assert!(ingester.core.db.get_block_by_height(CHECKPOINT_HEIGHT + 3).unwrap().is_some());
        assert!(ingester.core.db.get_block_by_height(CHECKPOINT_HEIGHT + 4).unwrap().is_none());
        assert!(ingester.core.db.get_block_by_height(CHECKPOINT_HEIGHT + 5).unwrap().is_none());
    }

    #[tokio::test]
    async fn unconnected_block_is_an_invariant_violation() {
        let (mut ingester, _dir) = new_ingester().await;
        let (tx, rx) = mpsc::channel(4);
        tx.send(chained_block(CHECKPOINT_HEIGHT + 1, [0xff; 32], vec![])).await.unwrap();
        drop(tx);

        let result = ingester.drain(rx, "rest").await;
        assert!(matches!(result, Err(CoreError::Invariant(_))));
    }
}
