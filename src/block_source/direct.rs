/// Direct block source: reads `blk*.dat` files straight off disk, tracing
/// the chain backward through an in-memory hash map rebuilt after each file
/// (spec §4.2.2). Preferred over the REST source once the catch-up gap
/// exceeds `DIRECT_SOURCE_THRESHOLD` and a data directory is configured.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info};

use crate::chain_map::ChainMap;
use crate::constants::{Network, DIRECT_SOURCE_WORKERS};
use crate::parser::parse_block;
use crate::types::{BlockData, BlockHash, SourceError};

const SOURCE: &str = "direct";
const RECORD_HEADER_LEN: usize = 8; // 4-byte magic + 4-byte little-endian length

pub struct DirectSource {
    data_dir: PathBuf,
    network: Network,
    workers: usize,
}

impl DirectSource {
    pub fn new(data_dir: impl Into<PathBuf>, network: Network) -> Self {
        Self { data_dir: data_dir.into(), network, workers: DIRECT_SOURCE_WORKERS }
    }

    /// Fails unless at least one `blk*.dat` file is present, mirroring
    /// `direct_check_path`.
    pub fn check_path(&self) -> Result<usize, SourceError> {
        let files = self.list_block_files()?;
        if files.is_empty() {
            return Err(SourceError::NoConnection);
        }
        info!(count = files.len(), "(direct) found block files");
        Ok(files.len())
    }

    fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    /// Newest-first filename order, so backward tracing from the tip hits
    /// recent blocks first and rarely needs to scan the whole set.
    fn list_block_files(&self) -> Result<Vec<PathBuf>, SourceError> {
        let dir = self.blocks_dir();
        let entries = fs::read_dir(&dir).map_err(|e| SourceError::Transport { source: SOURCE.into(), cause: e.to_string() })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("blk") && n.ends_with(".dat"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files.reverse();
        Ok(files)
    }

    pub(crate) async fn stream_range(
        &self,
        target: BlockHash,
        chain_map: &ChainMap,
        approx_len: u64,
        sink: mpsc::Sender<BlockData>,
    ) -> Result<(), SourceError> {
        let files = self.list_block_files()?;
        let magic = self.network.magic();
        let semaphore = Arc::new(Semaphore::new(self.workers.max(1)));

        let mut blocks: HashMap<BlockHash, BlockData> = HashMap::new();
        let mut chain: Option<Vec<BlockHash>> = None;

        // Each wave of files is parsed with bounded concurrency; the trace
        // itself runs between waves so it always sees a stable map.
        for batch in files.chunks(self.workers.max(1)) {
            let mut handles = Vec::with_capacity(batch.len());
            for path in batch {
                let path = path.clone();
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore is never closed");
                handles.push(tokio::task::spawn_blocking(move || {
                    let result = parse_block_file(&path, magic);
                    drop(permit);
                    result
                }));
            }
            for handle in handles {
                let parsed = handle.await.map_err(|e| SourceError::Decode { source: SOURCE.into(), cause: e.to_string() })??;
                for block in parsed {
                    blocks.insert(block.hash, block);
                }
            }

            if let Some(found) = trace_chain(&blocks, target, chain_map) {
                let progress = (found.len() as f64 / approx_len.max(1) as f64) * 100.0;
                debug!(progress, "(direct) mining");
                chain = Some(found);
                break;
            }
        }

        let Some(chain) = chain else {
            return Err(SourceError::NoConnection);
        };

        for hash in chain {
            let block = blocks.remove(&hash).expect("traced hash was parsed from the block files");
            if sink.send(block).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Parses every block record in one `blk*.dat` file. Records begin with a
/// 4-byte magic then a 4-byte little-endian length; scanning stops at the
/// first position whose magic doesn't match.
fn parse_block_file(path: &Path, magic: [u8; 4]) -> Result<Vec<BlockData>, SourceError> {
    let file = fs::File::open(path).map_err(|e| SourceError::Transport { source: SOURCE.into(), cause: e.to_string() })?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| SourceError::Transport { source: SOURCE.into(), cause: e.to_string() })?;
    let data = &mmap[..];

    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + RECORD_HEADER_LEN <= data.len() {
        if data[pos..pos + 4] != magic[..] {
            break;
        }
        let size = LittleEndian::read_u32(&data[pos + 4..pos + 8]) as usize;
        pos += RECORD_HEADER_LEN;
        if pos + size > data.len() {
            break;
        }
        match parse_block(&data[pos..pos + size]) {
            Ok(block) => out.push(block),
            Err(_) => break,
        }
        pos += size;
    }
    Ok(out)
}

/// Follows `previous` pointers from `target` through the parsed map until a
/// hash already in `chain_map` is hit, returning the chain in ascending
/// (old-to-new) order. `None` means no connecting path has been found yet.
fn trace_chain(blocks: &HashMap<BlockHash, BlockData>, target: BlockHash, chain_map: &ChainMap) -> Option<Vec<BlockHash>> {
    if chain_map.contains(&target) {
        return Some(Vec::new());
    }
    let mut chain = Vec::new();
    let mut hash = target;
    loop {
        let block = blocks.get(&hash)?;
        chain.push(hash);
        hash = block.previous;
        if chain_map.contains(&hash) {
            chain.reverse();
            return Some(chain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn raw_block(previous: [u8; 32]) -> Vec<u8> {
        let mut header = vec![0u8; 80];
        let mut prev_wire = previous;
        prev_wire.reverse();
        header[4..36].copy_from_slice(&prev_wire);
        header.push(0); // tx_count varint = 0
        header
    }

    fn record(magic: [u8; 4], block: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&magic);
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
        out.extend_from_slice(block);
        out
    }

    #[test]
    fn parse_block_file_stops_at_mismatched_magic() {
        let dir = TempDir::new().unwrap();
        let magic = [0xf9, 0xbe, 0xb4, 0xd9];
        let path = dir.path().join("blk00000.dat");
        let block = raw_block([0; 32]);
        let mut data = record(magic, &block);
        data.extend_from_slice(&[0xff; 16]); // trailing garbage, not a valid record
        fs::write(&path, &data).unwrap();

        let parsed = parse_block_file(&path, magic).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn list_block_files_is_reverse_sorted() {
        let dir = TempDir::new().unwrap();
        let blocks_dir = dir.path().join("blocks");
        fs::create_dir_all(&blocks_dir).unwrap();
        fs::write(blocks_dir.join("blk00000.dat"), b"").unwrap();
        fs::write(blocks_dir.join("blk00001.dat"), b"").unwrap();
        fs::write(blocks_dir.join("blk00002.dat"), b"").unwrap();

        let source = DirectSource::new(dir.path(), Network::Mainnet);
        let files = source.list_block_files().unwrap();
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_str().unwrap().to_string()).collect();
        assert_eq!(names, vec!["blk00002.dat", "blk00001.dat", "blk00000.dat"]);
    }

    #[test]
    fn check_path_fails_with_no_block_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("blocks")).unwrap();
        let source = DirectSource::new(dir.path(), Network::Mainnet);
        assert!(source.check_path().is_err());
    }

    #[test]
    fn trace_chain_follows_previous_pointers_to_a_known_hash() {
        let root = [0u8; 32];
        let mut chain_map = ChainMap::seeded_at(root);
        chain_map.insert([1; 32], root);

        let mut blocks = HashMap::new();
        blocks.insert([2; 32], BlockData { hash: [2; 32], previous: [1; 32], commits: vec![] });
        blocks.insert([3; 32], BlockData { hash: [3; 32], previous: [2; 32], commits: vec![] });

        let chain = trace_chain(&blocks, [3; 32], &chain_map).unwrap();
        assert_eq!(chain, vec![[2; 32], [3; 32]]);
    }
}
