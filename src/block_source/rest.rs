/// REST block source: walks headers backward from a target hash via a
/// remote node's REST interface, then fetches and parses each block binary
/// (spec §4.2.1).
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::chain_map::ChainMap;
use crate::constants::HTTP_TIMEOUT_SECS;
use crate::parser::parse_block;
use crate::types::{BlockData, BlockHash, SourceError};

use super::ChainInfo;

const SOURCE: &str = "rest";

pub struct RestSource {
    client: Client,
    base_url: String,
}

impl RestSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(transport)?;
        Ok(Self { client, base_url: base_url.into() })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /rest/chaininfo.json`, the sole mechanism for discovering the
    /// remote tip.
    pub async fn probe_tip(&self) -> Result<ChainInfo, SourceError> {
        let body = self.get(format!("{}/chaininfo.json", self.base_url)).await?;
        let raw: RawChainInfo = serde_json::from_slice(&body).map_err(decode)?;
        let top_hash = parse_hex32(&raw.best_block_hash).map_err(|cause| SourceError::Decode { source: SOURCE.into(), cause })?;
        Ok(ChainInfo { height: raw.blocks, known_height: raw.headers, top_hash })
    }

    pub(crate) async fn stream_range(
        &self,
        target: BlockHash,
        chain_map: &ChainMap,
        approx_len: u64,
        sink: mpsc::Sender<BlockData>,
    ) -> Result<(), SourceError> {
        let chain = self.trace_chain(target, chain_map, approx_len).await?;
        for (i, hash) in chain.iter().enumerate() {
            let block = self.get_block(*hash).await?;
            let progress = (i as f64 / approx_len.max(1) as f64) * 100.0;
            debug!(progress, "(rest) mining");
            if sink.send(block).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Traces backward from `target` via `previousblockhash` headers until a
    /// hash already in `chain_map` is reached, then reverses so older blocks
    /// come first.
    async fn trace_chain(&self, target: BlockHash, chain_map: &ChainMap, approx_len: u64) -> Result<Vec<BlockHash>, SourceError> {
        if chain_map.contains(&target) {
            return Ok(Vec::new());
        }
        let mut chain = Vec::new();
        let mut hash = target;
        loop {
            if chain_map.contains(&hash) {
                break;
            }
            chain.push(hash);
            let headers = self.get_headers(hash).await?;
            let header = headers.into_iter().next().ok_or_else(|| SourceError::Decode {
                source: SOURCE.into(),
                cause: format!("cannot find header for {}", hex::encode(hash)),
            })?;
            hash = parse_hex32(&header.previousblockhash).map_err(|cause| SourceError::Decode { source: SOURCE.into(), cause })?;
            let progress = (chain.len() as f64 / approx_len.max(1) as f64) * 100.0;
            debug!(progress, "(rest) tracing");
        }
        chain.reverse();
        Ok(chain)
    }

    async fn get_headers(&self, hash: BlockHash) -> Result<Vec<RawHeader>, SourceError> {
        let body = self.get(format!("{}/headers/1/{}.json", self.base_url, hex::encode(hash))).await?;
        serde_json::from_slice(&body).map_err(decode)
    }

    /// Fetches and parses a single block by hash. Used by the repair path
    /// (spec §4.5) to refetch individually corrupted heights.
    pub async fn fetch_block(&self, hash: BlockHash) -> Result<BlockData, SourceError> {
        self.get_block(hash).await
    }

    async fn get_block(&self, hash: BlockHash) -> Result<BlockData, SourceError> {
        let body = self.get(format!("{}/block/{}.bin", self.base_url, hex::encode(hash))).await?;
        let parsed = parse_block(&body).map_err(|e| SourceError::Decode { source: SOURCE.into(), cause: e.to_string() })?;
        if parsed.hash != hash {
            return Err(SourceError::Decode {
                source: SOURCE.into(),
                cause: format!("received wrong block {} != {}", hex::encode(parsed.hash), hex::encode(hash)),
            });
        }
        Ok(parsed)
    }

    async fn get(&self, url: String) -> Result<Vec<u8>, SourceError> {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let response = client.get(&url).header("Content-Type", "text/plain").send().map_err(transport)?;
            response.bytes().map(|b| b.to_vec()).map_err(transport)
        })
        .await
        .map_err(|e| SourceError::Transport { source: SOURCE.into(), cause: e.to_string() })?
    }
}

fn transport(e: reqwest::Error) -> SourceError {
    SourceError::Transport { source: SOURCE.into(), cause: e.to_string() }
}

fn decode(e: serde_json::Error) -> SourceError {
    SourceError::Decode { source: SOURCE.into(), cause: e.to_string() }
}

fn parse_hex32(s: &str) -> Result<BlockHash, String> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out).map_err(|e| e.to_string())?;
    Ok(out)
}

#[derive(Deserialize)]
struct RawChainInfo {
    blocks: u64,
    headers: u64,
    #[serde(rename = "bestblockhash")]
    best_block_hash: String,
}

#[derive(Deserialize)]
struct RawHeader {
    previousblockhash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex32_rejects_wrong_length() {
        assert!(parse_hex32("abcd").is_err());
    }

    #[test]
    fn parse_hex32_round_trips_a_hash() {
        let hash = [0x42u8; 32];
        let hex_str = hex::encode(hash);
        assert_eq!(parse_hex32(&hex_str).unwrap(), hash);
    }

    #[test]
    fn chaininfo_json_maps_bestblockhash_field() {
        let raw = r#"{"blocks":481824,"headers":481824,"bestblockhash":"00"}"#;
        let parsed: RawChainInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.blocks, 481_824);
        assert_eq!(parsed.best_block_hash, "00");
    }
}
