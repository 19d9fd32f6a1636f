//! Transaction wrappers around the underlying store.

use crate::{
    cursor::Cursor,
    raw_table_definition,
    table::{Decode, Encode, Table},
    DatabaseError, Env,
};
use std::ops::{Deref, DerefMut};

/// A read-only transaction.
#[derive(Debug)]
pub struct Tx {
    pub(crate) inner: redb::ReadTransaction,
}

impl Tx {
    /// Gets the value stored under `key`, if any.
    pub fn get<T: Table>(&self, key: T::Key) -> Result<Option<T::Value>, DatabaseError> {
        let table = self.inner.open_table(raw_table_definition(T::NAME))?;
        let key = key.encode();
        let result = match redb::ReadableTable::get(&table, key.as_ref())? {
            Some(guard) => Ok(Some(T::Value::decode(guard.value())?)),
            None => Ok(None),
        };
        result
    }

    /// Number of entries in the table.
    pub fn entries<T: Table>(&self) -> Result<usize, DatabaseError> {
        let table = self.inner.open_table(raw_table_definition(T::NAME))?;
        Ok(redb::ReadableTableMetadata::len(&table)? as usize)
    }
}

/// A read-write transaction.
pub struct TxMut {
    pub(crate) inner: redb::WriteTransaction,
}

impl std::fmt::Debug for TxMut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxMut").finish()
    }
}

impl TxMut {
    /// Gets the value stored under `key`, if any.
    pub fn get<T: Table>(&self, key: T::Key) -> Result<Option<T::Value>, DatabaseError> {
        let table = self.inner.open_table(raw_table_definition(T::NAME))?;
        let key = key.encode();
        let result = match redb::ReadableTable::get(&table, key.as_ref())? {
            Some(guard) => Ok(Some(T::Value::decode(guard.value())?)),
            None => Ok(None),
        };
        result
    }

    /// Stores `value` under `key`, overwriting any previous value.
    pub fn put<T: Table>(&self, key: T::Key, value: T::Value) -> Result<(), DatabaseError> {
        let mut table =
            self.inner.open_table(raw_table_definition(T::NAME))?;
        let key = key.encode();
        let value = value.encode();
        table.insert(key.as_ref(), value.as_ref())?;
        Ok(())
    }

    /// Deletes the entry stored under `key`, returning whether it existed.
    pub fn delete<T: Table>(&self, key: T::Key) -> Result<bool, DatabaseError> {
        let mut table =
            self.inner.open_table(raw_table_definition(T::NAME))?;
        let key = key.encode();
        let removed = table.remove(key.as_ref())?.is_some();
        Ok(removed)
    }

    /// Number of entries in the table.
    pub fn entries<T: Table>(&self) -> Result<usize, DatabaseError> {
        let table = self.inner.open_table(raw_table_definition(T::NAME))?;
        Ok(redb::ReadableTableMetadata::len(&table)? as usize)
    }

    /// Opens a cursor over table `T`.
    ///
    /// Opening a second cursor over the same table while the first is alive
    /// is rejected by the store.
    pub fn cursor<T: Table>(&self) -> Result<Cursor<'_, T>, DatabaseError> {
        let table = self.inner.open_table(raw_table_definition(T::NAME))?;
        Ok(Cursor::new(table))
    }

    /// Commits the transaction.
    pub fn commit(self) -> Result<(), DatabaseError> {
        self.inner.commit()?;
        Ok(())
    }

    /// Aborts the transaction, discarding all writes.
    pub fn abort(self) -> Result<(), DatabaseError> {
        self.inner.abort()?;
        Ok(())
    }
}

/// A container for the write transaction a stage works in.
///
/// `TxMut::commit` takes `self`, which would leave the caller without a
/// transaction; stages however need to commit and keep going (and the driver
/// needs to hand one container through a whole cycle). The container re-opens
/// a fresh transaction after every commit or abort.
pub struct TxnManager<'env> {
    env: &'env Env,
    tx: Option<TxMut>,
}

impl<'env> std::fmt::Debug for TxnManager<'env> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnManager").field("open", &self.tx.is_some()).finish()
    }
}

impl<'env> TxnManager<'env> {
    /// Creates a new container with an open transaction.
    pub fn new(env: &'env Env) -> Result<Self, DatabaseError> {
        Ok(Self { env, tx: Some(env.tx_mut()?) })
    }

    /// Commits the current transaction and opens a new one.
    pub fn commit(&mut self) -> Result<(), DatabaseError> {
        if let Some(tx) = self.tx.take() {
            tx.commit()?;
        }
        self.tx = Some(self.env.tx_mut()?);
        Ok(())
    }

    /// Aborts the current transaction, discarding its writes, and opens a new
    /// one.
    pub fn abort(&mut self) -> Result<(), DatabaseError> {
        if let Some(tx) = self.tx.take() {
            tx.abort()?;
        }
        self.tx = Some(self.env.tx_mut()?);
        Ok(())
    }
}

impl<'env> Deref for TxnManager<'env> {
    type Target = TxMut;

    /// Dereference as the inner transaction.
    ///
    /// # Panics
    ///
    /// Panics if the inner transaction does not exist, which cannot happen
    /// outside of this module.
    fn deref(&self) -> &Self::Target {
        self.tx.as_ref().expect("transaction container is never left empty")
    }
}

impl<'env> DerefMut for TxnManager<'env> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.tx.as_mut().expect("transaction container is never left empty")
    }
}
