//! Cursors over tables inside a write transaction.

use crate::{
    table::{Decode, Encode, Table, TableRow},
    DatabaseError,
};
use redb::ReadableTable;
use std::{
    marker::PhantomData,
    ops::{Bound, RangeBounds},
};

/// The result of a cursor positioning operation.
pub type PairResult<T> = Result<Option<TableRow<T>>, DatabaseError>;

type RawTable<'txn> = redb::Table<'txn, &'static [u8], &'static [u8]>;

/// A cursor over table `T`.
///
/// The underlying store exposes ordered range queries rather than a stateful
/// cursor, so the cursor tracks the encoded key of its current entry and
/// re-seeks on every step.
pub struct Cursor<'txn, T: Table> {
    pub(crate) inner: RawTable<'txn>,
    /// Encoded key of the entry the cursor is positioned on.
    position: Option<Vec<u8>>,
    _marker: PhantomData<T>,
}

impl<'txn, T: Table> std::fmt::Debug for Cursor<'txn, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").field("table", &T::NAME).field("position", &self.position).finish()
    }
}

fn decode_row<T: Table>(key: &[u8], value: &[u8]) -> Result<TableRow<T>, DatabaseError> {
    Ok((T::Key::decode(key)?, T::Value::decode(value)?))
}

impl<'txn, T: Table> Cursor<'txn, T> {
    pub(crate) fn new(inner: RawTable<'txn>) -> Self {
        Self { inner, position: None, _marker: PhantomData }
    }

    fn settle(&mut self, pair: Option<(Vec<u8>, Vec<u8>)>) -> PairResult<T> {
        match pair {
            Some((key, value)) => {
                let row = decode_row::<T>(&key, &value)?;
                self.position = Some(key);
                Ok(Some(row))
            }
            None => Ok(None),
        }
    }

    fn range_first(
        &self,
        bounds: (Bound<&[u8]>, Bound<&[u8]>),
        from_back: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, DatabaseError> {
        let mut range = self.inner.range::<&[u8]>(bounds)?;
        let entry = if from_back { range.next_back() } else { range.next() };
        match entry {
            Some(res) => {
                let (key, value) = res?;
                Ok(Some((key.value().to_vec(), value.value().to_vec())))
            }
            None => Ok(None),
        }
    }

    /// Positions the cursor at the first entry in the table, returning it.
    pub fn first(&mut self) -> PairResult<T> {
        let pair = self.range_first((Bound::Unbounded, Bound::Unbounded), false)?;
        self.settle(pair)
    }

    /// Positions the cursor at the last entry in the table, returning it.
    pub fn last(&mut self) -> PairResult<T> {
        let pair = self.range_first((Bound::Unbounded, Bound::Unbounded), true)?;
        self.settle(pair)
    }

    /// Seeks to the entry whose key is greater than or equal to `key`.
    pub fn seek(&mut self, key: T::Key) -> PairResult<T> {
        let encoded = key.encode();
        let pair = self.range_first((Bound::Included(encoded.as_ref()), Bound::Unbounded), false)?;
        self.settle(pair)
    }

    /// Seeks to the entry with exactly the given key.
    pub fn seek_exact(&mut self, key: T::Key) -> PairResult<T> {
        let encoded = key.encode();
        let value = self.inner.get(encoded.as_ref())?.map(|guard| guard.value().to_vec());
        let pair = value.map(|value| (encoded.as_ref().to_vec(), value));
        self.settle(pair)
    }

    /// Positions the cursor at the next entry, returning it.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> PairResult<T> {
        match self.position.take() {
            Some(current) => {
                let pair = self
                    .range_first((Bound::Excluded(current.as_slice()), Bound::Unbounded), false)?;
                self.position = Some(current);
                self.settle(pair)
            }
            None => self.first(),
        }
    }

    /// Positions the cursor at the previous entry, returning it.
    pub fn prev(&mut self) -> PairResult<T> {
        match self.position.take() {
            Some(current) => {
                let pair = self
                    .range_first((Bound::Unbounded, Bound::Excluded(current.as_slice())), true)?;
                self.position = Some(current);
                self.settle(pair)
            }
            None => self.last(),
        }
    }

    /// Returns the entry the cursor is positioned on.
    pub fn current(&mut self) -> PairResult<T> {
        match self.position.clone() {
            Some(current) => {
                let value = self.inner.get(current.as_slice())?.map(|g| g.value().to_vec());
                let pair = value.map(|value| (current, value));
                self.settle(pair)
            }
            None => Ok(None),
        }
    }

    /// Deletes the entry the cursor is positioned on.
    pub fn delete_current(&mut self) -> Result<(), DatabaseError> {
        let current = self.position.clone().ok_or(DatabaseError::NoCurrentEntry)?;
        self.inner.remove(current.as_slice())?;
        Ok(())
    }

    /// Inserts the pair, overwriting any existing value under the key.
    pub fn upsert(&mut self, key: T::Key, value: T::Value) -> Result<(), DatabaseError> {
        let key = key.encode();
        let value = value.encode();
        self.upsert_raw(key.as_ref(), value.as_ref())
    }

    /// Inserts the pair; fails if the key already exists.
    pub fn insert(&mut self, key: T::Key, value: T::Value) -> Result<(), DatabaseError> {
        let key = key.encode();
        if self.inner.get(key.as_ref())?.is_some() {
            return Err(DatabaseError::DuplicateKey { table: T::NAME })
        }
        let value = value.encode();
        self.upsert_raw(key.as_ref(), value.as_ref())
    }

    /// Appends the pair at the end of the table.
    ///
    /// The key must sort strictly after the current table tail; this is the
    /// fast path for loading pre-sorted data.
    pub fn append(&mut self, key: T::Key, value: T::Value) -> Result<(), DatabaseError> {
        let key = key.encode();
        let value = value.encode();
        self.append_raw(key.as_ref(), value.as_ref())
    }

    /// [`Cursor::upsert`] for pre-encoded pairs which must not be re-encoded.
    pub fn upsert_raw(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.inner.insert(key, value)?;
        self.position = Some(key.to_vec());
        Ok(())
    }

    /// [`Cursor::append`] for pre-encoded pairs which must not be re-encoded.
    pub fn append_raw(&mut self, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        let out_of_order = match self.inner.last()? {
            Some((tail, _)) => key <= tail.value(),
            None => false,
        };
        if out_of_order {
            return Err(DatabaseError::AppendOutOfOrder { table: T::NAME })
        }
        self.inner.insert(key, value)?;
        self.position = Some(key.to_vec());
        Ok(())
    }

    /// Returns an iterator starting at the first entry greater than or equal
    /// to `start_key`, or at the table start when `None`.
    pub fn walk(&mut self, start_key: Option<T::Key>) -> Result<Walker<'_, 'txn, T>, DatabaseError> {
        let start = match start_key {
            Some(key) => self.seek(key)?,
            None => self.first()?,
        }
        .map(Ok);
        Ok(Walker { cursor: self, start })
    }

    /// Returns an iterator over the entries whose keys fall in `range`.
    pub fn walk_range(
        &mut self,
        range: impl RangeBounds<T::Key>,
    ) -> Result<RangeWalker<'_, 'txn, T>, DatabaseError> {
        let end = match range.end_bound() {
            Bound::Included(key) => Bound::Included(key.clone()),
            Bound::Excluded(key) => Bound::Excluded(key.clone()),
            Bound::Unbounded => Bound::Unbounded,
        };
        let start = match range.start_bound() {
            Bound::Included(key) => self.seek(key.clone())?,
            Bound::Excluded(key) => {
                let mut entry = self.seek(key.clone())?;
                if let Some((found, _)) = &entry {
                    if found == key {
                        entry = self.next()?;
                    }
                }
                entry
            }
            Bound::Unbounded => self.first()?,
        }
        .map(Ok);
        Ok(RangeWalker::new(self, start, end))
    }
}

/// Forward iterator over a cursor.
pub struct Walker<'cursor, 'txn, T: Table> {
    cursor: &'cursor mut Cursor<'txn, T>,
    start: Option<Result<TableRow<T>, DatabaseError>>,
}

impl<'cursor, 'txn, T: Table> Walker<'cursor, 'txn, T> {
    /// Deletes the entry the walker currently points to.
    pub fn delete_current(&mut self) -> Result<(), DatabaseError> {
        self.cursor.delete_current()
    }
}

impl<'cursor, 'txn, T: Table> Iterator for Walker<'cursor, 'txn, T> {
    type Item = Result<TableRow<T>, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.start.take();
        if start.is_some() {
            return start
        }
        self.cursor.next().transpose()
    }
}

/// Forward iterator over a bounded key range of a cursor.
pub struct RangeWalker<'cursor, 'txn, T: Table> {
    cursor: &'cursor mut Cursor<'txn, T>,
    start: Option<Result<TableRow<T>, DatabaseError>>,
    end_key: Bound<T::Key>,
    is_done: bool,
}

impl<'cursor, 'txn, T: Table> RangeWalker<'cursor, 'txn, T> {
    fn new(
        cursor: &'cursor mut Cursor<'txn, T>,
        start: Option<Result<TableRow<T>, DatabaseError>>,
        end_key: Bound<T::Key>,
    ) -> Self {
        // mark done if the range is empty
        let is_done = match &start {
            Some(Ok((start_key, _))) => match &end_key {
                Bound::Included(end) => start_key > end,
                Bound::Excluded(end) => start_key >= end,
                Bound::Unbounded => false,
            },
            None => true,
            _ => false,
        };
        Self { cursor, start, end_key, is_done }
    }

    /// Deletes the entry the walker currently points to.
    pub fn delete_current(&mut self) -> Result<(), DatabaseError> {
        self.cursor.delete_current()
    }
}

impl<'cursor, 'txn, T: Table> Iterator for RangeWalker<'cursor, 'txn, T> {
    type Item = Result<TableRow<T>, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_done {
            return None
        }

        let next_item = self.start.take().or_else(|| self.cursor.next().transpose());
        match next_item {
            Some(Ok((key, value))) => match &self.end_key {
                Bound::Included(end) if &key <= end => Some(Ok((key, value))),
                Bound::Excluded(end) if &key < end => Some(Ok((key, value))),
                Bound::Unbounded => Some(Ok((key, value))),
                _ => {
                    self.is_done = true;
                    None
                }
            },
            Some(res @ Err(_)) => Some(res),
            None => {
                self.is_done = true;
                None
            }
        }
    }
}
