use thiserror::Error;

/// Storage layer error.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open the database file.
    #[error("failed to open database: {0}")]
    Open(#[from] redb::DatabaseError),
    /// Failed to begin a transaction.
    #[error("failed to begin transaction: {0}")]
    Transaction(#[from] redb::TransactionError),
    /// Failed to open a table.
    #[error("failed to open table: {0}")]
    Table(#[from] redb::TableError),
    /// Low level storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    /// Failed to commit a transaction.
    #[error("failed to commit transaction: {0}")]
    Commit(#[from] redb::CommitError),
    /// A stored value could not be decoded.
    #[error("failed to decode stored value: {0}")]
    Decode(String),
    /// An append-mode insert was attempted with a key that does not sort
    /// after the current table tail.
    #[error("append key out of order in table {table}")]
    AppendOutOfOrder {
        /// The table the append was attempted on.
        table: &'static str,
    },
    /// An insert was attempted for a key that already exists.
    #[error("key already exists in table {table}")]
    DuplicateKey {
        /// The table the insert was attempted on.
        table: &'static str,
    },
    /// A cursor operation that requires a current entry was called on an
    /// unpositioned cursor.
    #[error("cursor has no current entry")]
    NoCurrentEntry,
}
