//! Declarations of all tables used by the sync pipeline.

use crate::{
    models::{BlockNumHash, StoredBlockBody, StoredSenders},
    table::Table,
};
use stagedsync_primitives::{BlockNumber, HeaderHash};

/// Declares a [`Table`](crate::table::Table): a unit struct whose name is the
/// persistent table name.
macro_rules! table {
    ($(#[$docs:meta])+ $name:ident => $key:ty => $value:ty) => {
        $(#[$docs])+
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $name;

        impl $crate::table::Table for $name {
            const NAME: &'static str = stringify!($name);
            type Key = $key;
            type Value = $value;
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", stringify!($name))
            }
        }
    };
}

table!(
    /// The canonical chain: block number to header hash, written by the
    /// upstream download stages.
    CanonicalHashes => BlockNumber => HeaderHash
);

table!(
    /// Inverse of [`CanonicalHashes`], maintained by the `BlockHashes` stage.
    HeaderNumbers => HeaderHash => BlockNumber
);

table!(
    /// Block bodies keyed by number and hash, written by the upstream
    /// download stages.
    BlockBodies => BlockNumHash => StoredBlockBody
);

table!(
    /// Recovered sender addresses per block, maintained by the `Senders`
    /// stage.
    Senders => BlockNumber => StoredSenders
);

table!(
    /// Forward progress watermark per stage key.
    SyncStageProgress => String => BlockNumber
);

table!(
    /// Prune progress watermark per stage key.
    SyncStagePruneProgress => String => BlockNumber
);

/// Names of every table, used to materialize them when a database is opened.
pub const ALL_TABLES: [&str; 6] = [
    CanonicalHashes::NAME,
    HeaderNumbers::NAME,
    BlockBodies::NAME,
    Senders::NAME,
    SyncStageProgress::NAME,
    SyncStagePruneProgress::NAME,
];

/// The canonical big-endian key layout for a block number.
pub fn block_key(number: BlockNumber) -> [u8; 8] {
    number.to_be_bytes()
}
