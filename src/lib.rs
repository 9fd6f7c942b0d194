pub mod batch_writer;
pub mod block_source;
pub mod chain_map;
pub mod commit_engine;
pub mod config;
pub mod constants;
pub mod core;
pub mod db;
pub mod ingester;
pub mod metrics;
pub mod parser;
pub mod reorg;
pub mod signal;
pub mod telemetry;
pub mod types;
