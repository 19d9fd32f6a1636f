//! Persistent per-stage progress watermarks.

use stagedsync_db::{tables, DatabaseError, TxMut};
use stagedsync_primitives::{BlockNumber, StageId};

/// Reads the forward progress watermark of a stage. Absent means genesis.
pub fn read_stage_progress(tx: &TxMut, id: StageId) -> Result<BlockNumber, DatabaseError> {
    Ok(tx.get::<tables::SyncStageProgress>(id.as_str().to_string())?.unwrap_or_default())
}

/// Writes the forward progress watermark of a stage.
pub fn write_stage_progress(
    tx: &TxMut,
    id: StageId,
    progress: BlockNumber,
) -> Result<(), DatabaseError> {
    tx.put::<tables::SyncStageProgress>(id.as_str().to_string(), progress)
}

/// Reads the prune progress watermark of a stage. Absent means genesis.
pub fn read_stage_prune_progress(tx: &TxMut, id: StageId) -> Result<BlockNumber, DatabaseError> {
    Ok(tx.get::<tables::SyncStagePruneProgress>(id.as_str().to_string())?.unwrap_or_default())
}

/// Writes the prune progress watermark of a stage.
pub fn write_stage_prune_progress(
    tx: &TxMut,
    id: StageId,
    progress: BlockNumber,
) -> Result<(), DatabaseError> {
    tx.put::<tables::SyncStagePruneProgress>(id.as_str().to_string(), progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagedsync_db::Env;
    use tempfile::TempDir;

    #[test]
    fn missing_watermarks_default_to_zero() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path().join("test.redb")).unwrap();
        let tx = env.tx_mut().unwrap();
        assert_eq!(read_stage_progress(&tx, StageId::SENDERS).unwrap(), 0);
        assert_eq!(read_stage_prune_progress(&tx, StageId::SENDERS).unwrap(), 0);
    }

    #[test]
    fn watermark_roundtrip() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(dir.path().join("test.redb")).unwrap();
        let tx = env.tx_mut().unwrap();
        write_stage_progress(&tx, StageId::BLOCK_HASHES, 42).unwrap();
        write_stage_prune_progress(&tx, StageId::BLOCK_HASHES, 7).unwrap();
        assert_eq!(read_stage_progress(&tx, StageId::BLOCK_HASHES).unwrap(), 42);
        assert_eq!(read_stage_prune_progress(&tx, StageId::BLOCK_HASHES).unwrap(), 7);
        // distinct watermark spaces
        assert_eq!(read_stage_progress(&tx, StageId::SENDERS).unwrap(), 0);
    }
}
