/// Chain constants
///
/// Fixed points that anchor the indexer to a specific Bitcoin network: the
/// height at which commitment outputs start appearing, the checkpoint that
/// seeds the chain map so the indexer never has to trace back further than
/// it needs to, and the per-network `blk*.dat` magic bytes.

/// First height at which P2WSH commitment outputs can appear (mainnet).
pub const ACTIVATION_HEIGHT: u64 = 481_824;

/// Height of the hard-coded checkpoint immediately preceding activation.
pub const CHECKPOINT_HEIGHT: u64 = 481_823;

/// Hash of the checkpoint block, display endianness, hex-encoded.
pub const CHECKPOINT_HASH_HEX: &str =
    "000000000000000000cbeff0b533f8e1189cf09dfbebf57a8ebe349362811b80";

/// Decodes [`CHECKPOINT_HASH_HEX`] into the 32-byte form used by the chain
/// map and reorg controller.
pub fn checkpoint_hash() -> [u8; 32] {
    let mut out = [0u8; 32];
    hex::decode_to_slice(CHECKPOINT_HASH_HEX, &mut out)
        .expect("CHECKPOINT_HASH_HEX is a well-formed constant");
    out
}

/// `blk*.dat` record magic, mainnet.
pub const MAGIC_MAINNET: [u8; 4] = [0xf9, 0xbe, 0xb4, 0xd9];

/// `blk*.dat` record magic, testnet.
pub const MAGIC_TESTNET: [u8; 4] = [0x0b, 0x11, 0x09, 0x07];

/// Blocks buffered per write batch before a flush is forced.
pub const BATCH_CAPACITY: usize = 10_000;

/// Direct-source file-parser worker count.
pub const DIRECT_SOURCE_WORKERS: usize = 4;

/// Size of each worker's reusable scan buffer, in bytes.
pub const DIRECT_SOURCE_BUFFER_SIZE: usize = 128 * 1024 * 1024;

/// Gap (in blocks) above which the direct source is preferred over REST.
pub const DIRECT_SOURCE_THRESHOLD: u64 = 10_000;

/// Default HTTP timeout for REST calls.
pub const HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn magic(self) -> [u8; 4] {
        match self {
            Network::Mainnet => MAGIC_MAINNET,
            Network::Testnet => MAGIC_TESTNET,
        }
    }

    /// Directory name for this network's commit database.
    pub fn db_dirname(self) -> &'static str {
        match self {
            Network::Mainnet => "commits",
            Network::Testnet => "commits_testnet",
        }
    }
}
