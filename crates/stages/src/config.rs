//! Configuration of the sync pipeline.

use serde::{Deserialize, Serialize};
use stagedsync_primitives::ChainSpec;
use std::path::PathBuf;

/// Top level configuration of a [`SyncContext`](crate::SyncContext).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// The chain being synced.
    pub chain: ChainSpec,
    /// Collector settings.
    pub etl: EtlConfig,
    /// Sender recovery settings.
    pub senders: SendersConfig,
}

/// Collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    /// Directory for collector spill files.
    pub dir: PathBuf,
    /// In-memory byte budget before a sorted run is spilled.
    pub buffer_size: usize,
}

impl EtlConfig {
    /// Creates a collector configuration over the given scratch directory.
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, buffer_size: stagedsync_etl::DEFAULT_BUFFER_CAPACITY }
    }
}

/// Sender recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendersConfig {
    /// Number of recovery packages handed to a worker at once.
    pub batch_size: usize,
    /// Worker thread ceiling. Defaults to the available parallelism.
    pub max_workers: Option<usize>,
    /// When set, senders of blocks more than this many blocks behind the
    /// stage watermark are deleted by the prune cycle.
    pub prune_distance: Option<u64>,
}

impl Default for SendersConfig {
    fn default() -> Self {
        Self { batch_size: 50_000, max_workers: None, prune_distance: None }
    }
}
