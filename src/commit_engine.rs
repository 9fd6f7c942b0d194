/// The commit engine contract (spec §6).
///
/// `libcomb` itself is an external collaborator out of scope for this
/// crate — it maintains the value-layer state (keys, stacks, transactions,
/// deciders, merkle segments, balances) built on top of the ordered commit
/// log this crate produces. This module models exactly the calling
/// convention the core uses against it, nothing more.
use crate::types::{Block, Commit, Tag};

/// Everything the core is allowed to ask of the commit engine. The core
/// trusts the engine to reject any semantic violation on its own terms;
/// this crate only guarantees it calls `load_block` with strictly
/// ascending heights and commit order matching §4.1.
pub trait CommitEngine: Send + Sync {
    fn reset(&self);
    fn switch_to_testnet(&self);
    fn set_height(&self, height: u64);
    fn load_block(&self, block: &Block) -> Result<(), String>;
    /// Unloads the current tip block, returning the engine's new height.
    fn unload_block(&self) -> u64;
    fn finish_reorg(&self);
    fn get_height(&self) -> u64;
    fn get_commit_count(&self) -> u64;
    fn have_commit(&self, commit: &Commit) -> bool;
    fn get_commit_tag(&self, commit: &Commit) -> Option<Tag>;
    /// Acquired for the span of a single block advance or repair write.
    fn acquire(&self);
    fn release(&self);
}

/// In-process stand-in for `libcomb`, used by the binary when no external
/// engine is wired in and by the test suite. Tracks just enough state
/// (height, and which commits have been loaded at which tag) to exercise
/// the ingester/reorg contract end-to-end.
pub struct NullCommitEngine {
    state: std::sync::Mutex<NullState>,
    acquired: std::sync::atomic::AtomicBool,
}

struct NullState {
    height: u64,
    testnet: bool,
    /// Commits loaded per height, oldest first — popped on `unload_block`.
    loaded: Vec<(u64, Vec<Commit>)>,
}

impl NullCommitEngine {
    pub fn new(checkpoint_height: u64) -> Self {
        Self {
            state: std::sync::Mutex::new(NullState { height: checkpoint_height, testnet: false, loaded: Vec::new() }),
            acquired: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl CommitEngine for NullCommitEngine {
    fn reset(&self) {
        let mut s = self.state.lock().unwrap();
        s.height = 0;
        s.loaded.clear();
    }

    fn switch_to_testnet(&self) {
        self.state.lock().unwrap().testnet = true;
    }

    fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    fn load_block(&self, block: &Block) -> Result<(), String> {
        let mut s = self.state.lock().unwrap();
        if block.metadata.height != s.height + 1 {
            return Err(format!(
                "non-contiguous load: engine at {}, got block {}",
                s.height, block.metadata.height
            ));
        }
        s.height = block.metadata.height;
        s.loaded.push((block.metadata.height, block.commits.clone()));
        Ok(())
    }

    fn unload_block(&self) -> u64 {
        let mut s = self.state.lock().unwrap();
        if let Some((height, _)) = s.loaded.pop() {
            s.height = height.saturating_sub(1);
        }
        s.height
    }

    fn finish_reorg(&self) {}

    fn get_height(&self) -> u64 {
        self.state.lock().unwrap().height
    }

    fn get_commit_count(&self) -> u64 {
        self.state.lock().unwrap().loaded.iter().map(|(_, c)| c.len() as u64).sum()
    }

    fn have_commit(&self, commit: &Commit) -> bool {
        self.state.lock().unwrap().loaded.iter().any(|(_, c)| c.contains(commit))
    }

    fn get_commit_tag(&self, commit: &Commit) -> Option<Tag> {
        let s = self.state.lock().unwrap();
        for (height, commits) in &s.loaded {
            if let Some(order) = commits.iter().position(|c| c == commit) {
                return Some(Tag { height: *height, order: order as u32 });
            }
        }
        None
    }

    fn acquire(&self) {
        let was_held = self.acquired.swap(true, std::sync::atomic::Ordering::SeqCst);
        debug_assert!(!was_held, "commit engine lock acquired while already held");
    }

    fn release(&self) {
        self.acquired.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockData;

    fn block_at(height: u64, commits: Vec<Commit>) -> Block {
        BlockData { hash: [height as u8; 32], previous: [0; 32], commits }.into_block(height)
    }

    #[test]
    fn load_then_unload_round_trips_height() {
        let engine = NullCommitEngine::new(481_823);
        engine.set_height(481_823);
        engine.load_block(&block_at(481_824, vec![Commit([0x11; 32])])).unwrap();
        assert_eq!(engine.get_height(), 481_824);
        assert_eq!(engine.unload_block(), 481_823);
    }

    #[test]
    fn have_commit_and_get_tag_reflect_loaded_blocks() {
        let engine = NullCommitEngine::new(0);
        let commit = Commit([0x22; 32]);
        engine.load_block(&block_at(1, vec![commit])).unwrap();
        assert!(engine.have_commit(&commit));
        assert_eq!(engine.get_commit_tag(&commit), Some(Tag { height: 1, order: 0 }));
    }

    #[test]
    fn load_block_rejects_non_contiguous_height() {
        let engine = NullCommitEngine::new(0);
        assert!(engine.load_block(&block_at(5, vec![])).is_err());
    }
}
