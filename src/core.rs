/// Bundles the process's shared handles into one owned value, replacing
/// the scattered globals (`COMBInfo`, `DBInfo`, `NodeInfo`, `BTC`, `Wallet`)
/// the source this crate is modeled on leans on (spec §9).
use std::sync::Arc;

use crate::commit_engine::CommitEngine;
use crate::constants::Network;
use crate::db::CommitDb;

/// Shared, cheaply-cloned state passed by reference to the ingester, the
/// reorg controller, and the signal handler alike.
pub struct Core<E: CommitEngine> {
    pub db: CommitDb,
    pub commit_engine: Arc<E>,
    pub network: Network,
}

impl<E: CommitEngine> Core<E> {
    pub fn new(db: CommitDb, commit_engine: E, network: Network) -> Self {
        if network == Network::Testnet {
            commit_engine.switch_to_testnet();
        }
        Self { db, commit_engine: Arc::new(commit_engine), network }
    }
}
