use crate::{Stage, StageError, StageResult, SyncContext};
use stagedsync_db::{tables, DatabaseError, TxnManager};
use stagedsync_etl::LoadMode;
use stagedsync_primitives::StageId;
use tracing::{debug, info, warn};

/// Maintains the inverse hash index: `HeaderNumbers` maps each canonical
/// header hash back to its block number, derived from `CanonicalHashes`.
#[derive(Debug)]
pub struct BlockHashesStage {
    ordinal: u32,
}

impl BlockHashesStage {
    /// Creates the stage with its pipeline position.
    pub fn new(ordinal: u32) -> Self {
        Self { ordinal }
    }
}

impl Stage for BlockHashesStage {
    fn id(&self) -> StageId {
        StageId::BLOCK_HASHES
    }

    fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Walks `CanonicalHashes` above the stage watermark up to the `Bodies`
    /// watermark, collecting each entry with key and value swapped, and
    /// loads the result into `HeaderNumbers`. An empty destination takes the
    /// append fast path; otherwise entries are upserted.
    fn forward(&mut self, txn: &mut TxnManager<'_>, ctx: &mut SyncContext) -> StageResult {
        let target = ctx.get_progress(txn, StageId::BODIES)?;
        let progress = ctx.get_progress(txn, self.id())?;
        if progress == target {
            return Ok(())
        }
        if progress > target {
            return Err(StageError::InvalidProgress { stage: self.id(), progress })
        }

        let mut collector = ctx.new_collector();
        let mut expected = progress + 1;
        let mut last_number = progress;
        {
            let mut source = txn.cursor::<tables::CanonicalHashes>()?;
            let mut walker = source.walk(Some(expected))?;
            while let Some(entry) = walker.next() {
                let (number, hash) = entry.map_err(|err| match err {
                    // the only undecodable content in this table is a hash
                    // of the wrong width
                    DatabaseError::Decode(_) => StageError::BadBlockHash { number: expected },
                    other => StageError::Database(other),
                })?;
                if number != expected {
                    return Err(StageError::BadChainSequence { expected, got: number })
                }

                // swap key and value: the index is hash to number
                collector.collect(hash.to_vec(), number.to_be_bytes().to_vec())?;
                last_number = number;
                expected += 1;
            }
        }
        if last_number != target {
            // the canonical table ran out before the bodies watermark
            return Err(StageError::BadChainSequence { expected: target, got: last_number })
        }

        debug!(target: "sync::stages::block_hashes", entries = collector.len(), "Collected entries");
        if collector.is_empty() {
            return Ok(())
        }

        let mode = if txn.entries::<tables::HeaderNumbers>()? == 0 {
            LoadMode::Append
        } else {
            LoadMode::Upsert
        };
        {
            let mut destination = txn.cursor::<tables::HeaderNumbers>()?;
            collector.load(&mut destination, None, mode, 10)?;
        }

        ctx.update_progress(txn, self.id(), last_number)?;
        txn.commit()?;
        info!(target: "sync::stages::block_hashes", progress = last_number, "Stage finished");
        Ok(())
    }

    /// Deletes the inverse entries of every canonical hash above the unwind
    /// height. A missing inverse entry is logged but tolerated, so unwinding
    /// twice is a no-op.
    fn unwind(&mut self, txn: &mut TxnManager<'_>, ctx: &mut SyncContext) -> StageResult {
        let progress = ctx.get_progress(txn, self.id())?;
        let unwind_to = match ctx.needs_unwind(progress) {
            Some(height) => height,
            None => return Ok(()),
        };

        let mut expected = unwind_to + 1;
        {
            let mut source = txn.cursor::<tables::CanonicalHashes>()?;
            let mut index = txn.cursor::<tables::HeaderNumbers>()?;
            let mut walker = source.walk(Some(expected))?;
            while let Some(entry) = walker.next() {
                let (number, hash) = entry.map_err(|err| match err {
                    DatabaseError::Decode(_) => StageError::BadBlockHash { number: expected },
                    other => StageError::Database(other),
                })?;
                if number != expected {
                    return Err(StageError::BadChainSequence { expected, got: number })
                }

                if index.seek_exact(hash)?.is_some() {
                    index.delete_current()?;
                } else {
                    warn!(
                        target: "sync::stages::block_hashes",
                        block = number,
                        "Could not locate index entry for block hash"
                    );
                }
                expected += 1;
            }
        }

        ctx.update_progress(txn, self.id(), unwind_to)?;
        txn.commit()?;
        info!(target: "sync::stages::block_hashes", progress = unwind_to, "Unwind finished");
        Ok(())
    }
}
