/// Reorg controller (spec §4.5): walks the chain map back to the highest
/// common ancestor, truncates the database, and rewinds the commit engine
/// to match.
use tracing::info;

use crate::chain_map::ChainMap;
use crate::commit_engine::CommitEngine;
use crate::constants::{checkpoint_hash, CHECKPOINT_HEIGHT};
use crate::db::CommitDb;
use crate::metrics;
use crate::types::{BlockHash, CoreError};

/// Rewinds state so `target` becomes the new tip. Returns `target`'s
/// height. Fatal (`CoreError::Invariant`) if `target` is not reachable
/// through the chain map — a reorg deeper than the seed checkpoint is
/// unsupported.
pub async fn reorg_to<E: CommitEngine>(
    chain_map: &mut ChainMap,
    db: &CommitDb,
    commit_engine: &E,
    current_hash: BlockHash,
    target: BlockHash,
) -> Result<u64, CoreError> {
    let discarded = chain_map.walk_back_to(current_hash, target).ok_or_else(|| {
        metrics::increment_invariant_violations("reorg_target_unreachable");
        CoreError::Invariant(format!(
            "reorg target {} unreachable from {} (deeper than checkpoint)",
            hex::encode(target),
            hex::encode(current_hash)
        ))
    })?;

    let target_height = if target == checkpoint_hash() {
        CHECKPOINT_HEIGHT
    } else {
        db.get_block_by_hash(target)?.map(|m| m.height).ok_or_else(|| {
            metrics::increment_invariant_violations("reorg_target_missing_height");
            CoreError::Invariant(format!("reorg target {} has no stored height", hex::encode(target)))
        })?
    };

    db.remove_blocks_after(target_height + 1).await?;
    chain_map.prune_after(&discarded);

    commit_engine.acquire();
    while commit_engine.get_height() > target_height {
        commit_engine.unload_block();
    }
    commit_engine.finish_reorg();
    commit_engine.release();

    metrics::increment_reorg_events(discarded.len() as i64);

    info!(
        target_height,
        orphaned = discarded.len(),
        new_tip = %hex::encode(target),
        "reorg complete"
    );

    Ok(target_height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_engine::NullCommitEngine;
    use crate::types::{Block, BlockData, Commit};
    use rocksdb::WriteBatch;
    use tempfile::TempDir;

    fn block_at(height: u64, previous: [u8; 32]) -> Block {
        BlockData { hash: [height as u8; 32], previous, commits: vec![Commit([height as u8; 32])] }.into_block(height)
    }

    #[tokio::test]
    async fn reorg_truncates_db_and_rewinds_engine() {
        let dir = TempDir::new().unwrap();
        let (db, _) = CommitDb::open(dir.path()).unwrap();
        let engine = NullCommitEngine::new(CHECKPOINT_HEIGHT);

        let mut chain_map = ChainMap::seeded_at(checkpoint_hash());
        let mut previous = checkpoint_hash();
        let mut current_hash = previous;
        for h in (CHECKPOINT_HEIGHT + 1)..=(CHECKPOINT_HEIGHT + 5) {
            let block = block_at(h, previous);
            let mut batch = WriteBatch::default();
            db.store_block(&mut batch, &block);
            db.write(batch).await.unwrap();
            chain_map.insert(block.metadata.hash, block.metadata.previous);
            engine.load_block(&block).unwrap();
            previous = block.metadata.hash;
            current_hash = previous;
        }
        assert_eq!(engine.get_height(), CHECKPOINT_HEIGHT + 5);

        let target_height = CHECKPOINT_HEIGHT + 2;
        let target_hash = [((target_height) as u8); 32];
        let new_height =
            reorg_to(&mut chain_map, &db, &engine, current_hash, target_hash).await.unwrap();

        assert_eq!(new_height, target_height);
        assert_eq!(engine.get_height(), target_height);
        assert!(db.get_block_by_height(target_height + 1).unwrap().is_none());
        assert!(db.get_block_by_height(target_height).unwrap().is_some());
    }

    #[tokio::test]
    async fn reorg_past_checkpoint_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (db, _) = CommitDb::open(dir.path()).unwrap();
        let engine = NullCommitEngine::new(CHECKPOINT_HEIGHT);
        let mut chain_map = ChainMap::seeded_at(checkpoint_hash());

        let result = reorg_to(&mut chain_map, &db, &engine, checkpoint_hash(), [0xaa; 32]).await;
        assert!(matches!(result, Err(CoreError::Invariant(_))));
    }
}
