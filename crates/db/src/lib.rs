//! Typed key-value storage layer for the staged sync pipeline.
//!
//! Tables are declared as unit types implementing [`table::Table`]; access
//! goes through [`Tx`]/[`TxMut`] transaction wrappers and typed
//! [`cursor::Cursor`]s. The backing store is an embedded ordered key-value
//! database ([`redb`]); everything above it only assumes the contracts the
//! sync pipeline needs (ordered scans, append-or-fail fast inserts, ACID
//! transactions spanning arbitrary tables).

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

pub mod cursor;
mod error;
pub mod models;
pub mod table;
pub mod tables;
mod tx;

pub use error::DatabaseError;
pub use tx::{Tx, TxMut, TxnManager};

use std::path::Path;

/// Every table stores raw byte slices; typing lives in the [`table::Table`]
/// layer above.
pub(crate) fn raw_table_definition(
    name: &str,
) -> redb::TableDefinition<'_, &'static [u8], &'static [u8]> {
    redb::TableDefinition::new(name)
}

/// A handle to the database environment.
#[derive(Debug)]
pub struct Env {
    db: redb::Database,
}

impl Env {
    /// Opens (creating if necessary) the database at `path` and materializes
    /// every table.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let db = redb::Database::create(path)?;
        let env = Self { db };
        env.create_tables()?;
        Ok(env)
    }

    fn create_tables(&self) -> Result<(), DatabaseError> {
        let tx = self.db.begin_write()?;
        for name in tables::ALL_TABLES {
            tx.open_table(raw_table_definition(name))?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Begins a read-only transaction.
    pub fn tx(&self) -> Result<Tx, DatabaseError> {
        Ok(Tx { inner: self.db.begin_read()? })
    }

    /// Begins a read-write transaction. At most one can be live at a time;
    /// this blocks until the previous one commits or aborts.
    pub fn tx_mut(&self) -> Result<TxMut, DatabaseError> {
        Ok(TxMut { inner: self.db.begin_write()? })
    }
}
