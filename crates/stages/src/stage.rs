use crate::{SyncContext, StageResult};
use stagedsync_db::TxnManager;
use stagedsync_primitives::StageId;
use tracing::warn;

/// A stage is a segmented part of the syncing process of the node.
///
/// Each stage takes care of a well-defined transformation, such as building
/// the hash to number index or recovering transaction senders, and persists
/// its results to the store.
///
/// Stages have a unique [id](StageId) and a unique ordinal (> 0) that fixes
/// their position in the pipeline; they implement a way to roll forwards
/// ([`Stage::forward`]), a way to roll back ([`Stage::unwind`]), and
/// optionally a way to delete history ([`Stage::prune`]). A stage is
/// constructed once at startup and reused across cycles.
///
/// On success a stage commits its own transaction, so that destination rows
/// and the watermark always land atomically. On any failure it returns
/// without committing and the driver discards the transaction.
pub trait Stage: Send {
    /// The unique id of the stage.
    fn id(&self) -> StageId;

    /// The unique ordinal fixing the stage's position in the pipeline. Must
    /// be greater than zero.
    fn ordinal(&self) -> u32;

    /// Whether this stage implements [`Stage::prune`].
    fn has_pruning(&self) -> bool {
        false
    }

    /// Whether this stage should be skipped entirely.
    fn is_disabled(&self) -> bool {
        false
    }

    /// Roll the stage forward to its predecessor's watermark.
    fn forward(&mut self, txn: &mut TxnManager<'_>, ctx: &mut SyncContext) -> StageResult;

    /// Roll the stage back to the unwind height carried by the context.
    fn unwind(&mut self, txn: &mut TxnManager<'_>, ctx: &mut SyncContext) -> StageResult;

    /// Delete historical rows below the configured prune horizon.
    fn prune(&mut self, _txn: &mut TxnManager<'_>, _ctx: &mut SyncContext) -> StageResult {
        warn!(target: "sync::pipeline", stage = %self.id(), "Prune called but not implemented for stage");
        Ok(())
    }
}
