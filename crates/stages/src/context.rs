use crate::{config::SyncConfig, registry};
use stagedsync_db::{DatabaseError, TxMut};
use stagedsync_etl::Collector;
use stagedsync_primitives::{BlockNumber, ChainSpec, StageId};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// State shared by all stages across sync cycles.
///
/// Holds the chain spec and collector settings, the cooperative stop flag,
/// the externally signalled unwind height, and a per-cycle cache of stage
/// watermarks so that intra-cycle lookups do not repeatedly hit the store.
#[derive(Debug)]
pub struct SyncContext {
    config: SyncConfig,
    progress: HashMap<&'static str, BlockNumber>,
    prune_progress: HashMap<&'static str, BlockNumber>,
    first_cycle: bool,
    done: bool,
    unwind_height: Option<BlockNumber>,
    stop: Arc<AtomicBool>,
}

impl SyncContext {
    /// Creates a context from the given configuration.
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            progress: HashMap::new(),
            prune_progress: HashMap::new(),
            first_cycle: true,
            done: false,
            unwind_height: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The chain being synced.
    pub fn chain_spec(&self) -> &ChainSpec {
        &self.config.chain
    }

    /// The sender recovery settings.
    pub fn senders_config(&self) -> &crate::config::SendersConfig {
        &self.config.senders
    }

    /// Creates a collector over the configured scratch directory, wired to
    /// the context's stop flag.
    pub fn new_collector(&self) -> Collector {
        Collector::new(self.config.etl.dir.clone(), self.config.etl.buffer_size)
            .with_stop_flag(self.stop.clone())
    }

    /// Current forward progress of a stage, cached after the first lookup.
    pub fn get_progress(&mut self, tx: &TxMut, id: StageId) -> Result<BlockNumber, DatabaseError> {
        if let Some(progress) = self.progress.get(id.as_str()) {
            return Ok(*progress)
        }
        let progress = registry::read_stage_progress(tx, id)?;
        self.progress.insert(id.as_str(), progress);
        Ok(progress)
    }

    /// Stores the forward progress of a stage, both in the cache and the
    /// store.
    pub fn update_progress(
        &mut self,
        tx: &TxMut,
        id: StageId,
        progress: BlockNumber,
    ) -> Result<(), DatabaseError> {
        self.progress.insert(id.as_str(), progress);
        registry::write_stage_progress(tx, id, progress)
    }

    /// Current prune progress of a stage, cached after the first lookup.
    pub fn get_prune_progress(
        &mut self,
        tx: &TxMut,
        id: StageId,
    ) -> Result<BlockNumber, DatabaseError> {
        if let Some(progress) = self.prune_progress.get(id.as_str()) {
            return Ok(*progress)
        }
        let progress = registry::read_stage_prune_progress(tx, id)?;
        self.prune_progress.insert(id.as_str(), progress);
        Ok(progress)
    }

    /// Stores the prune progress of a stage, both in the cache and the store.
    pub fn update_prune_progress(
        &mut self,
        tx: &TxMut,
        id: StageId,
        progress: BlockNumber,
    ) -> Result<(), DatabaseError> {
        self.prune_progress.insert(id.as_str(), progress);
        registry::write_stage_prune_progress(tx, id, progress)
    }

    /// Drops the watermark cache.
    ///
    /// Called at cycle boundaries and after any stage failure, so cached
    /// values never outlive an aborted transaction.
    pub fn clear_cache(&mut self) {
        self.progress.clear();
        self.prune_progress.clear();
    }

    /// Whether the driver is still in its first cycle. Some stages bulk-load
    /// differently before the first cycle completed.
    pub fn is_first_cycle(&self) -> bool {
        self.first_cycle
    }

    /// Marks the first cycle as completed.
    pub fn clear_first_cycle(&mut self) {
        self.first_cycle = false;
    }

    /// The externally requested unwind height, if any.
    pub fn unwind_height(&self) -> Option<BlockNumber> {
        self.unwind_height
    }

    /// Requests (or clears) an unwind to the given height.
    pub fn set_unwind_height(&mut self, height: Option<BlockNumber>) {
        self.unwind_height = height;
    }

    /// Whether a stage at `progress` has work to do for the pending unwind,
    /// and if so, the height to unwind to.
    pub fn needs_unwind(&self, progress: BlockNumber) -> Option<BlockNumber> {
        match self.unwind_height {
            Some(height) if height < progress => Some(height),
            _ => None,
        }
    }

    /// A handle to the stop flag.
    ///
    /// Hosts wire their signal handlers to this; the handler must do nothing
    /// but store `true`, which is async-signal-safe.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Whether a stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Whether syncing is finished.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Marks syncing as finished; the driver exits after the current cycle.
    pub fn set_done(&mut self) {
        self.done = true;
    }
}
