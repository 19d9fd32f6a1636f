use stagedsync_db::DatabaseError;
use stagedsync_etl::EtlError;
use stagedsync_primitives::{BlockNumber, ChainId, StageId};
use thiserror::Error;

/// The outcome of a stage operation.
pub type StageResult = Result<(), StageError>;

/// A stage execution error.
#[derive(Error, Debug)]
pub enum StageError {
    /// A transaction commits to a chain id other than the one being synced.
    #[error("unknown chain id {got}, expected {expected}")]
    UnknownChainId {
        /// The chain id of the active chain spec.
        expected: ChainId,
        /// The chain id found in the transaction.
        got: ChainId,
    },
    /// The chain spec names a consensus engine this build does not know.
    #[error("unknown consensus engine")]
    UnknownConsensusEngine,
    /// A stored header hash does not have the expected length.
    #[error("bad block hash at block #{number}")]
    BadBlockHash {
        /// The block whose hash entry is malformed.
        number: BlockNumber,
    },
    /// Canonical entries are out of sequence.
    #[error("bad chain sequence: expected block #{expected}, got #{got}")]
    BadChainSequence {
        /// The block number that should have come next.
        expected: BlockNumber,
        /// The block number actually found.
        got: BlockNumber,
    },
    /// A block range with a start beyond its end.
    #[error("invalid block range {start}..={end}")]
    InvalidRange {
        /// Range start.
        start: BlockNumber,
        /// Range end.
        end: BlockNumber,
    },
    /// A stage watermark is ahead of its predecessor's.
    #[error("invalid progress {progress} for stage {stage}")]
    InvalidProgress {
        /// The stage with the inconsistent watermark.
        stage: StageId,
        /// The watermark found.
        progress: BlockNumber,
    },
    /// A block failed validation.
    #[error("invalid block #{0}")]
    InvalidBlock(BlockNumber),
    /// A transaction failed validation or sender recovery.
    #[error("invalid transaction at index {index} of block #{block}")]
    InvalidTransaction {
        /// The block containing the transaction.
        block: BlockNumber,
        /// The index of the transaction within the block.
        index: usize,
    },
    /// A block body expected in the range is missing.
    #[error("missing block body for block #{0}")]
    MissingSenders(BlockNumber),
    /// Stored data failed to decode.
    #[error("decoding error: {0}")]
    Decoding(String),
    /// Any error not covered by the taxonomy, caught at the stage boundary.
    #[error("unexpected error: {0}")]
    Unexpected(#[from] Box<dyn std::error::Error + Send + Sync>),
    /// The storage layer failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),
    /// The collector failed.
    #[error(transparent)]
    Etl(#[from] EtlError),
    /// The stage was interrupted before committing.
    #[error("stage execution was interrupted")]
    Aborted,
    /// The operation is not implemented for this stage.
    #[error("not implemented")]
    NotImplemented,
}

/// The stable result taxonomy, with fixed ordinals.
///
/// [`StageError`] carries structured context for logs and matching; this enum
/// is the wire- and log-stable classification every error maps onto.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageCode {
    /// The operation succeeded.
    Success = 0,
    /// See [`StageError::UnknownChainId`].
    UnknownChainId = 1,
    /// See [`StageError::UnknownConsensusEngine`].
    UnknownConsensusEngine = 2,
    /// See [`StageError::BadBlockHash`].
    BadBlockHash = 3,
    /// See [`StageError::BadChainSequence`].
    BadChainSequence = 4,
    /// See [`StageError::InvalidRange`].
    InvalidRange = 5,
    /// See [`StageError::InvalidProgress`].
    InvalidProgress = 6,
    /// See [`StageError::InvalidBlock`].
    InvalidBlock = 7,
    /// See [`StageError::InvalidTransaction`].
    InvalidTransaction = 8,
    /// See [`StageError::MissingSenders`].
    MissingSenders = 9,
    /// See [`StageError::Decoding`].
    DecodingError = 10,
    /// See [`StageError::Unexpected`].
    UnexpectedError = 11,
    /// An error that could not be classified.
    UnknownError = 12,
    /// See [`StageError::Database`].
    DbError = 13,
    /// See [`StageError::Aborted`].
    Aborted = 14,
    /// See [`StageError::NotImplemented`].
    NotImplemented = 15,
}

impl StageError {
    /// The stable classification of this error.
    pub fn code(&self) -> StageCode {
        match self {
            StageError::UnknownChainId { .. } => StageCode::UnknownChainId,
            StageError::UnknownConsensusEngine => StageCode::UnknownConsensusEngine,
            StageError::BadBlockHash { .. } => StageCode::BadBlockHash,
            StageError::BadChainSequence { .. } => StageCode::BadChainSequence,
            StageError::InvalidRange { .. } => StageCode::InvalidRange,
            StageError::InvalidProgress { .. } => StageCode::InvalidProgress,
            StageError::InvalidBlock(_) => StageCode::InvalidBlock,
            StageError::InvalidTransaction { .. } => StageCode::InvalidTransaction,
            StageError::MissingSenders(_) => StageCode::MissingSenders,
            StageError::Decoding(_) => StageCode::DecodingError,
            StageError::Unexpected(_) => StageCode::UnexpectedError,
            StageError::Database(DatabaseError::Decode(_)) => StageCode::DecodingError,
            StageError::Database(_) => StageCode::DbError,
            // an append below the destination tail means the chain data the
            // collector was fed is out of order
            StageError::Etl(EtlError::Database(DatabaseError::AppendOutOfOrder { .. })) => {
                StageCode::BadChainSequence
            }
            StageError::Etl(EtlError::Database(_)) => StageCode::DbError,
            StageError::Etl(EtlError::Aborted) => StageCode::Aborted,
            StageError::Etl(_) => StageCode::UnexpectedError,
            StageError::Aborted => StageCode::Aborted,
            StageError::NotImplemented => StageCode::NotImplemented,
        }
    }
}

/// The stable classification of a [`StageResult`].
pub fn code_of(result: &StageResult) -> StageCode {
    match result {
        Ok(()) => StageCode::Success,
        Err(err) => err.code(),
    }
}

/// A pipeline execution error.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A stage returned a non-success result, terminating the cycle.
    #[error("stage {stage} failed: {source}")]
    Stage {
        /// The stage that failed.
        stage: StageId,
        /// The failure itself.
        #[source]
        source: StageError,
    },
    /// The pipeline failed to access the store outside of a stage.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_ordinal_stable() {
        assert_eq!(StageCode::Success as u8, 0);
        assert_eq!(StageCode::BadBlockHash as u8, 3);
        assert_eq!(StageCode::MissingSenders as u8, 9);
        assert_eq!(StageCode::DbError as u8, 13);
        assert_eq!(StageCode::NotImplemented as u8, 15);
    }

    #[test]
    fn append_violation_maps_to_bad_chain_sequence() {
        let err = StageError::Etl(EtlError::Database(DatabaseError::AppendOutOfOrder {
            table: "HeaderNumbers",
        }));
        assert_eq!(err.code(), StageCode::BadChainSequence);
    }

    #[test]
    fn success_maps_to_success() {
        assert_eq!(code_of(&Ok(())), StageCode::Success);
        assert_eq!(code_of(&Err(StageError::Aborted)), StageCode::Aborted);
    }
}
