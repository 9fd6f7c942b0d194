use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte P2WSH script hash extracted from a commitment output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commit(pub [u8; 32]);

impl Commit {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commit({})", hex::encode(self.0))
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A commit's position in the global commit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub height: u64,
    pub order: u32,
}

/// Display-endianness Bitcoin block hash.
pub type BlockHash = [u8; 32];

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub height: u64,
    pub hash: BlockHash,
    pub previous: BlockHash,
    pub fingerprint: [u8; 32],
}

impl fmt::Debug for BlockMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockMetadata")
            .field("height", &self.height)
            .field("hash", &hex::encode(self.hash))
            .field("previous", &hex::encode(self.previous))
            .field("fingerprint", &hex::encode(self.fingerprint))
            .finish()
    }
}

/// A fully reconstructed block: metadata plus its ordered commits.
#[derive(Debug, Clone)]
pub struct Block {
    pub metadata: BlockMetadata,
    pub commits: Vec<Commit>,
}

/// Parser output before a height has been assigned by the ingester.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub hash: BlockHash,
    pub previous: BlockHash,
    pub commits: Vec<Commit>,
}

impl BlockData {
    /// `sha256(concat(commits))`, or the all-zero value when empty.
    pub fn fingerprint(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        if self.commits.is_empty() {
            return [0u8; 32];
        }
        let mut hasher = Sha256::new();
        for c in &self.commits {
            hasher.update(c.as_bytes());
        }
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    pub fn into_block(self, height: u64) -> Block {
        let fingerprint = self.fingerprint();
        Block {
            metadata: BlockMetadata {
                height,
                hash: self.hash,
                previous: self.previous,
                fingerprint,
            },
            commits: self.commits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    TooShort { needed: usize, have: usize },
    BadVarint,
    BadScript { offset: usize },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::TooShort { needed, have } => {
                write!(f, "truncated block: needed {needed} bytes, have {have}")
            }
            ParseError::BadVarint => write!(f, "malformed varint"),
            ParseError::BadScript { offset } => write!(f, "malformed script at offset {offset}"),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug)]
pub enum SourceError {
    Transport { source: String, cause: String },
    Decode { source: String, cause: String },
    NoConnection,
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Transport { source, cause } => {
                write!(f, "[{source}] transport error: {cause}")
            }
            SourceError::Decode { source, cause } => {
                write!(f, "[{source}] decode error: {cause}")
            }
            SourceError::NoConnection => {
                write!(f, "no connection to a known block could be established")
            }
        }
    }
}

impl std::error::Error for SourceError {}

#[derive(Debug)]
pub enum DbError {
    Rocks(rocksdb::Error),
    Corrupt { height: u64, reason: String },
    WrongLength { what: &'static str, expected: usize, got: usize },
    UnknownSchemaVersion(u16),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Rocks(e) => write!(f, "rocksdb error: {e}"),
            DbError::Corrupt { height, reason } => {
                write!(f, "corrupt block at height {height}: {reason}")
            }
            DbError::WrongLength { what, expected, got } => {
                write!(f, "wrong-length {what}: expected {expected}, got {got}")
            }
            DbError::UnknownSchemaVersion(v) => write!(f, "unknown schema version 0x{v:04x}"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<rocksdb::Error> for DbError {
    fn from(e: rocksdb::Error) -> Self {
        DbError::Rocks(e)
    }
}

#[derive(Debug)]
pub enum CoreError {
    Parse(ParseError),
    Source(SourceError),
    Db(DbError),
    /// Fatal: the chain presented to the ingester cannot be reconciled
    /// against current state or the chain map (e.g. a reorg deeper than
    /// the seed checkpoint).
    Invariant(String),
    Other(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Parse(e) => write!(f, "{e}"),
            CoreError::Source(e) => write!(f, "{e}"),
            CoreError::Db(e) => write!(f, "{e}"),
            CoreError::Invariant(msg) => write!(f, "invariant violation: {msg}"),
            CoreError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<ParseError> for CoreError {
    fn from(e: ParseError) -> Self {
        CoreError::Parse(e)
    }
}

impl From<SourceError> for CoreError {
    fn from(e: SourceError) -> Self {
        CoreError::Source(e)
    }
}

impl From<DbError> for CoreError {
    fn from(e: DbError) -> Self {
        CoreError::Db(e)
    }
}

impl From<rocksdb::Error> for CoreError {
    fn from(e: rocksdb::Error) -> Self {
        CoreError::Db(DbError::Rocks(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_block_has_zero_fingerprint() {
        let b = BlockData { hash: [1; 32], previous: [0; 32], commits: vec![] };
        assert_eq!(b.fingerprint(), [0u8; 32]);
    }

    #[test]
    fn fingerprint_is_sha256_of_concatenated_commits() {
        use sha2::{Digest, Sha256};
        let a = Commit([0x11; 32]);
        let b = Commit([0x22; 32]);
        let block = BlockData { hash: [0; 32], previous: [0; 32], commits: vec![a, b] };
        let mut hasher = Sha256::new();
        hasher.update(a.as_bytes());
        hasher.update(b.as_bytes());
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(block.fingerprint(), expected);
    }
}
