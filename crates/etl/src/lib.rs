//! ETL data collector.
//!
//! This crate is useful for dumping unsorted data into temporary files and
//! loading its sorted representation later on, either appending to or
//! upserting into a destination table.
//!
//! This has multiple uses, such as optimizing database inserts (for B-tree
//! based databases) and memory management (as it moves the buffer to disk
//! instead of memory).

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

use stagedsync_db::{cursor::Cursor, table::Table, DatabaseError};
use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

/// Maximum length of a collected key.
pub const MAX_KEY_SIZE: usize = 1 << 12;

/// Maximum length of a collected value.
pub const MAX_VALUE_SIZE: usize = 1 << 20;

/// Default in-memory byte budget before a sorted run is spilled to disk.
pub const DEFAULT_BUFFER_CAPACITY: usize = 512 * 1024 * 1024;

/// Name prefix of spill files, used to sweep stale ones left behind by a
/// crashed process.
const SPILL_FILE_PREFIX: &str = "etl-";
const SPILL_FILE_SUFFIX: &str = ".tmp";

/// Collector error.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Failed to read or write a spill file. Includes a full scratch disk.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A spill file does not contain what the collector wrote.
    #[error("corrupt spill file: {0}")]
    CorruptRun(&'static str),
    /// An entry exceeded [`MAX_KEY_SIZE`] or [`MAX_VALUE_SIZE`].
    #[error("entry exceeds size limits (key {key} bytes, value {value} bytes)")]
    OversizedEntry {
        /// Length of the rejected key.
        key: usize,
        /// Length of the rejected value.
        value: usize,
    },
    /// Writing to the destination table failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),
    /// The load was interrupted by the stop flag.
    #[error("load interrupted")]
    Aborted,
}

/// How entries are written into the destination table on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Fast-path insert requiring keys to sort strictly after the destination
    /// table tail. A violation is fatal.
    Append,
    /// Insert-or-overwrite.
    Upsert,
}

/// Optional per-entry mapping applied during load; returning `None` drops the
/// entry.
pub type Transform<'a> = &'a mut dyn FnMut(Vec<u8>, Vec<u8>) -> Option<(Vec<u8>, Vec<u8>)>;

/// An ETL (extract, transform, load) data collector.
///
/// Data is pushed (extract) to the collector which internally flushes the
/// data in a sorted (transform) manner to files of some specified capacity.
/// The data can later be loaded into a destination table in sorted order.
///
/// The collector assumes exclusive ownership of its scratch directory:
/// construction sweeps any stale spill files matching the `etl-*` pattern
/// that a crashed process may have left behind.
#[derive(Debug)]
pub struct Collector {
    /// Directory for spill file storage.
    scratch_dir: PathBuf,
    /// Collection of sorted runs spilled to disk.
    files: Vec<EtlFile>,
    /// In-memory buffer of entries not yet spilled.
    buffer: Vec<(Vec<u8>, Vec<u8>)>,
    /// Current buffer size in bytes.
    buffer_size_bytes: usize,
    /// Maximum buffer capacity in bytes, triggers a spill when exceeded.
    buffer_capacity_bytes: usize,
    /// Total number of entries collected, including all spilled runs.
    len: u64,
    /// Cooperative stop flag observed while loading.
    stop: Option<Arc<AtomicBool>>,
}

impl Collector {
    /// Create a new collector spilling into `scratch_dir` once `buffer_capacity_bytes`
    /// of entries accumulated in memory.
    pub fn new(scratch_dir: impl Into<PathBuf>, buffer_capacity_bytes: usize) -> Self {
        let scratch_dir = scratch_dir.into();
        sweep_stale_files(&scratch_dir);
        Self {
            scratch_dir,
            files: Vec::new(),
            buffer: Vec::new(),
            buffer_size_bytes: 0,
            buffer_capacity_bytes,
            len: 0,
            stop: None,
        }
    }

    /// Sets the flag whose raising interrupts a running [`Collector::load`].
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Total number of entries collected so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if no entries have been collected.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Collect an entry.
    ///
    /// When the in-memory byte budget is exceeded the buffer is sorted and
    /// written out as a new run in the scratch directory.
    pub fn collect(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), EtlError> {
        if key.len() > MAX_KEY_SIZE || value.len() > MAX_VALUE_SIZE {
            return Err(EtlError::OversizedEntry { key: key.len(), value: value.len() })
        }
        self.buffer_size_bytes += key.len() + value.len();
        self.buffer.push((key, value));
        if self.buffer_size_bytes > self.buffer_capacity_bytes {
            self.flush()?;
        }
        self.len += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EtlError> {
        self.buffer_size_bytes = 0;
        self.buffer.sort_unstable();
        let buf = std::mem::take(&mut self.buffer);
        self.files.push(EtlFile::new(&self.scratch_dir, buf)?);
        Ok(())
    }

    /// Consume all entries in `(key, value)` order, writing them into
    /// `cursor`.
    ///
    /// If nothing was spilled the in-memory buffer is sorted once and
    /// streamed directly; otherwise the remaining buffer is flushed as a
    /// final run and all runs are merged with a min-heap keyed on
    /// `(key, value, run_id)`, the run id breaking ties so the merge stays
    /// stable with respect to insertion order across runs.
    ///
    /// Progress is reported at each multiple of `log_every_percent`.
    pub fn load<T: Table>(
        &mut self,
        cursor: &mut Cursor<'_, T>,
        mut transform: Option<Transform<'_>>,
        mode: LoadMode,
        log_every_percent: u8,
    ) -> Result<(), EtlError> {
        let total = self.len;
        if total == 0 {
            return Ok(())
        }
        let step = (total * log_every_percent.clamp(1, 100) as u64 / 100).max(1);
        let stop = self.stop.clone();
        let mut processed = 0u64;

        let mut emit = |key: Vec<u8>, value: Vec<u8>| -> Result<(), EtlError> {
            if let Some(stop) = &stop {
                if stop.load(Ordering::Relaxed) {
                    return Err(EtlError::Aborted)
                }
            }
            let entry = match transform.as_mut() {
                Some(transform) => transform(key, value),
                None => Some((key, value)),
            };
            if let Some((key, value)) = entry {
                match mode {
                    LoadMode::Append => cursor.append_raw(&key, &value)?,
                    LoadMode::Upsert => cursor.upsert_raw(&key, &value)?,
                }
            }
            processed += 1;
            if processed % step == 0 {
                info!(target: "etl", "Loaded {}%", processed * 100 / total);
            }
            Ok(())
        };

        if self.files.is_empty() {
            // Hot path for small deltas: nothing was spilled, sort in place
            // and stream straight to the destination.
            let mut buffer = std::mem::take(&mut self.buffer);
            buffer.sort_unstable();
            for (key, value) in buffer {
                emit(key, value)?;
            }
        } else {
            if !self.buffer.is_empty() {
                self.flush()?;
            }
            let mut heap = BinaryHeap::new();
            for (id, file) in self.files.iter_mut().enumerate() {
                if let Some((key, value)) = file.read_next()? {
                    heap.push(Reverse((key, value, id)));
                }
            }
            while let Some(Reverse((key, value, id))) = heap.pop() {
                if let Some((next_key, next_value)) = self.files[id].read_next()? {
                    heap.push(Reverse((next_key, next_value, id)));
                }
                emit(key, value)?;
            }
        }

        self.files.clear();
        self.buffer.clear();
        self.buffer_size_bytes = 0;
        self.len = 0;
        Ok(())
    }
}

/// Removes leftover spill files from `dir`, best effort.
fn sweep_stale_files(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(SPILL_FILE_PREFIX) && name.ends_with(SPILL_FILE_SUFFIX) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

/// A sorted run spilled to a temporary file.
///
/// Records are length prefixed: two big-endian `u32` lengths followed by the
/// key and value bytes. The file is removed when the run is dropped.
#[derive(Debug)]
struct EtlFile {
    file: BufReader<NamedTempFile>,
    len: usize,
}

impl EtlFile {
    /// Spill the (pre-sorted) buffer into a new temporary file in `dir`.
    fn new(dir: &Path, buffer: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Self, EtlError> {
        std::fs::create_dir_all(dir)?;
        let file = tempfile::Builder::new()
            .prefix(SPILL_FILE_PREFIX)
            .suffix(SPILL_FILE_SUFFIX)
            .tempfile_in(dir)?;
        let mut writer = BufWriter::new(file);
        for (key, value) in &buffer {
            writer.write_all(&(key.len() as u32).to_be_bytes())?;
            writer.write_all(&(value.len() as u32).to_be_bytes())?;
            writer.write_all(key)?;
            writer.write_all(value)?;
        }

        let mut file = BufReader::new(writer.into_inner().map_err(|err| err.into_error())?);
        file.seek(SeekFrom::Start(0))?;
        Ok(Self { file, len: buffer.len() })
    }

    /// Read the next entry in the file.
    fn read_next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, EtlError> {
        if self.len == 0 {
            return Ok(None)
        }

        let mut key_length = [0u8; 4];
        let mut value_length = [0u8; 4];
        self.read_exact(&mut key_length)?;
        self.read_exact(&mut value_length)?;

        let key_length = u32::from_be_bytes(key_length) as usize;
        let value_length = u32::from_be_bytes(value_length) as usize;
        if key_length > MAX_KEY_SIZE || value_length > MAX_VALUE_SIZE {
            return Err(EtlError::CorruptRun("record length out of bounds"))
        }

        let mut key = vec![0; key_length];
        let mut value = vec![0; value_length];
        self.read_exact(&mut key)?;
        self.read_exact(&mut value)?;

        self.len -= 1;
        Ok(Some((key, value)))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), EtlError> {
        self.file.read_exact(buf).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                EtlError::CorruptRun("short read")
            } else {
                EtlError::Io(err)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagedsync_db::{tables, DatabaseError, Env, TxMut};
    use stagedsync_primitives::B256;
    use tempfile::TempDir;

    fn test_env(dir: &TempDir) -> Env {
        Env::open(dir.path().join("test.redb")).unwrap()
    }

    fn spill_count(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_name().to_string_lossy().starts_with("etl-"))
                    .count()
            })
            .unwrap_or(0)
    }

    fn entries(n: u64) -> Vec<(B256, u64)> {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(1337);
        (0..n).map(|id| (B256::from(rng.gen::<[u8; 32]>()), id)).collect()
    }

    fn load_into_header_numbers(
        collector: &mut Collector,
        tx: &TxMut,
        mode: LoadMode,
    ) -> Result<(), EtlError> {
        let mut cursor = tx.cursor::<tables::HeaderNumbers>().unwrap();
        collector.load(&mut cursor, None, mode, 10)
    }

    #[test]
    fn sorted_load_with_spills() {
        let db_dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let env = test_env(&db_dir);

        let mut entries = entries(10_000);
        // tiny budget to force several runs
        let mut collector = Collector::new(scratch.path(), 1024);
        for (hash, number) in entries.clone() {
            collector.collect(hash.to_vec(), number.to_be_bytes().to_vec()).unwrap();
        }
        assert_eq!(collector.len(), 10_000);
        assert!(spill_count(scratch.path()) > 1);

        let tx = env.tx_mut().unwrap();
        load_into_header_numbers(&mut collector, &tx, LoadMode::Append).unwrap();

        entries.sort_unstable();
        let mut cursor = tx.cursor::<tables::HeaderNumbers>().unwrap();
        let stored: Vec<_> = cursor.walk(None).unwrap().collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(stored, entries);
    }

    #[test]
    fn in_memory_fast_path() {
        let db_dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let env = test_env(&db_dir);

        let mut collector = Collector::new(scratch.path(), DEFAULT_BUFFER_CAPACITY);
        collector.collect(vec![2], vec![20]).unwrap();
        collector.collect(vec![1], vec![10]).unwrap();
        assert_eq!(spill_count(scratch.path()), 0);

        let tx = env.tx_mut().unwrap();
        {
            let mut cursor = tx.cursor::<tables::Senders>().unwrap();
            collector.load(&mut cursor, None, LoadMode::Append, 10).unwrap();
        }
        assert!(collector.is_empty());
        assert_eq!(spill_count(scratch.path()), 0);
    }

    #[test]
    fn load_is_insertion_order_independent() {
        let db_dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let env = test_env(&db_dir);

        let x = (B256::repeat_byte(0x01), 1u64);
        let y = (B256::repeat_byte(0x02), 2u64);

        let mut first = Vec::new();
        let mut second = Vec::new();
        for (out, order) in [(&mut first, [x, y]), (&mut second, [y, x])] {
            let tx = env.tx_mut().unwrap();
            let mut collector = Collector::new(scratch.path(), DEFAULT_BUFFER_CAPACITY);
            for (hash, number) in order {
                collector.collect(hash.to_vec(), number.to_be_bytes().to_vec()).unwrap();
            }
            load_into_header_numbers(&mut collector, &tx, LoadMode::Upsert).unwrap();
            {
                let mut cursor = tx.cursor::<tables::HeaderNumbers>().unwrap();
                *out = cursor.walk(None).unwrap().collect::<Result<Vec<_>, _>>().unwrap();
            }
            tx.abort().unwrap();
        }
        assert_eq!(first, second);
    }

    #[test]
    fn append_rejects_key_below_destination_tail() {
        let db_dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let env = test_env(&db_dir);

        let tx = env.tx_mut().unwrap();
        tx.put::<tables::HeaderNumbers>(B256::repeat_byte(0xbb), 2).unwrap();

        let mut collector = Collector::new(scratch.path(), DEFAULT_BUFFER_CAPACITY);
        collector.collect(B256::repeat_byte(0xaa).to_vec(), 1u64.to_be_bytes().to_vec()).unwrap();

        let result = load_into_header_numbers(&mut collector, &tx, LoadMode::Append);
        assert!(matches!(
            result,
            Err(EtlError::Database(DatabaseError::AppendOutOfOrder { .. }))
        ));
        // failed before touching the destination
        assert_eq!(tx.entries::<tables::HeaderNumbers>().unwrap(), 1);
    }

    #[test]
    fn transform_can_drop_entries() {
        let db_dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let env = test_env(&db_dir);

        let mut collector = Collector::new(scratch.path(), DEFAULT_BUFFER_CAPACITY);
        for number in 1u64..=6 {
            collector
                .collect(B256::with_last_byte(number as u8).to_vec(), number.to_be_bytes().to_vec())
                .unwrap();
        }

        let tx = env.tx_mut().unwrap();
        {
            let mut cursor = tx.cursor::<tables::HeaderNumbers>().unwrap();
            let mut keep_even = |key: Vec<u8>, value: Vec<u8>| {
                (value[7] % 2 == 0).then_some((key, value))
            };
            collector
                .load(&mut cursor, Some(&mut keep_even), LoadMode::Append, 10)
                .unwrap();
        }
        assert_eq!(tx.entries::<tables::HeaderNumbers>().unwrap(), 3);
    }

    #[test]
    fn drop_removes_spill_files() {
        let scratch = TempDir::new().unwrap();
        let mut collector = Collector::new(scratch.path(), 16);
        for number in 0u64..100 {
            collector.collect(number.to_be_bytes().to_vec(), vec![0u8; 16]).unwrap();
        }
        assert!(spill_count(scratch.path()) > 0);
        drop(collector);
        assert_eq!(spill_count(scratch.path()), 0);
    }

    #[test]
    fn construction_sweeps_stale_files() {
        let scratch = TempDir::new().unwrap();
        let stale = scratch.path().join("etl-stale.tmp");
        std::fs::write(&stale, b"junk").unwrap();
        let _collector = Collector::new(scratch.path(), DEFAULT_BUFFER_CAPACITY);
        assert!(!stale.exists());
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let scratch = TempDir::new().unwrap();
        let mut collector = Collector::new(scratch.path(), DEFAULT_BUFFER_CAPACITY);
        let result = collector.collect(vec![0u8; MAX_KEY_SIZE + 1], Vec::new());
        assert!(matches!(result, Err(EtlError::OversizedEntry { .. })));
        assert!(collector.is_empty());
    }

    #[test]
    fn stop_flag_aborts_load() {
        let db_dir = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let env = test_env(&db_dir);

        let stop = Arc::new(AtomicBool::new(false));
        let mut collector =
            Collector::new(scratch.path(), DEFAULT_BUFFER_CAPACITY).with_stop_flag(stop.clone());
        collector.collect(vec![1], vec![1]).unwrap();
        stop.store(true, Ordering::Relaxed);

        let tx = env.tx_mut().unwrap();
        let mut cursor = tx.cursor::<tables::Senders>().unwrap();
        let result = collector.load(&mut cursor, None, LoadMode::Append, 10);
        assert!(matches!(result, Err(EtlError::Aborted)));
    }
}
