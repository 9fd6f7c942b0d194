/// Block sources: two interchangeable ways to pull a contiguous backlog of
/// blocks once a target hash and a chain map are known (spec §4.2).
///
/// Tip discovery has exactly one mechanism (`GET /rest/chaininfo.json`)
/// regardless of which source streams the catch-up range, so `probe_tip`
/// lives on the REST source alone; the ingester always keeps a REST client
/// around for it even when direct-reading `blk*.dat` files for the backlog.
pub mod direct;
pub mod rest;

use tokio::sync::mpsc;

use crate::chain_map::ChainMap;
use crate::types::{BlockData, BlockHash, SourceError};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Remote tip as reported by the chaininfo probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainInfo {
    pub height: u64,
    pub known_height: u64,
    pub top_hash: BlockHash,
}

/// The catch-up mechanism selected for one sync cycle.
pub enum BlockSource {
    Rest(rest::RestSource),
    Direct(direct::DirectSource),
}

impl BlockSource {
    /// Streams every block from the successor of a hash already present in
    /// `chain_map` up to and including `target`, in ascending chain order,
    /// onto `sink`. Closes `sink` on completion; on error the channel is
    /// dropped and no partial range should be treated as usable by the
    /// caller.
    pub async fn stream_range(
        &self,
        target: BlockHash,
        chain_map: &ChainMap,
        approx_len: u64,
        sink: mpsc::Sender<BlockData>,
    ) -> Result<(), SourceError> {
        match self {
            BlockSource::Rest(s) => s.stream_range(target, chain_map, approx_len, sink).await,
            BlockSource::Direct(s) => s.stream_range(target, chain_map, approx_len, sink).await,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            BlockSource::Rest(_) => "rest",
            BlockSource::Direct(_) => "direct",
        }
    }
}
