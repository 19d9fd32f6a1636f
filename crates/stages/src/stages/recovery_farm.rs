//! Worker farm performing parallel ECDSA sender recovery.

use crate::StageError;
use stagedsync_etl::Collector;
use stagedsync_primitives::{Address, BlockNumber, Signature, TxHash};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
};
use tracing::debug;

/// Everything a worker needs to produce one sender address without further
/// context.
#[derive(Debug, Clone)]
pub(crate) struct RecoveryPackage {
    /// The block the transaction belongs to.
    pub block_number: BlockNumber,
    /// The index of the transaction within the block.
    pub tx_index: usize,
    /// The hash the sender signed.
    pub signing_hash: TxHash,
    /// The recoverable signature. `s` has already been range checked.
    pub signature: Signature,
}

struct Batch {
    seq: u64,
    packages: Vec<RecoveryPackage>,
}

type BatchResult = Result<Vec<(BlockNumber, Address)>, StageError>;

/// State shared between the producer and the workers, guarded by one mutex.
/// A single condvar signals every transition: work queued, result harvested,
/// shutdown.
struct Shared {
    pending: VecDeque<Batch>,
    /// Completed batches by sequence number, bounded by the harvest
    /// capacity.
    harvested: BTreeMap<u64, BatchResult>,
    /// The sequence number the producer will consume next.
    next_harvest: u64,
    idle_workers: usize,
    live_workers: usize,
    shutdown: bool,
}

/// Orchestrates sender recovery across a bounded pool of worker threads.
///
/// The producer accumulates [`RecoveryPackage`]s into batches and hands each
/// batch to the first idle worker, spawning new workers up to the ceiling.
/// Completed batches land on a bounded harvest queue; the producer drains it
/// in dispatch order (so per-block address concatenation preserves
/// transaction order even when a block spans batches) and groups addresses
/// per block into the collector.
///
/// No worker outlives the farm: drop requests shutdown and joins every
/// thread.
pub(crate) struct RecoveryFarm {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    max_workers: usize,
    batch_size: usize,
    harvest_capacity: usize,
    batch: Vec<RecoveryPackage>,
    next_seq: u64,
    current_block: Option<BlockNumber>,
    current_senders: Vec<u8>,
    total_recovered: u64,
}

impl RecoveryFarm {
    pub(crate) fn new(stop: Arc<AtomicBool>, max_workers: usize, batch_size: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            shared: Arc::new((
                Mutex::new(Shared {
                    pending: VecDeque::new(),
                    harvested: BTreeMap::new(),
                    next_harvest: 0,
                    idle_workers: 0,
                    live_workers: 0,
                    shutdown: false,
                }),
                Condvar::new(),
            )),
            stop,
            handles: Vec::new(),
            max_workers,
            batch_size: batch_size.max(1),
            harvest_capacity: max_workers * 2,
            batch: Vec::new(),
            next_seq: 0,
            current_block: None,
            current_senders: Vec::new(),
            total_recovered: 0,
        }
    }

    /// Queues a package, dispatching the current batch once full.
    pub(crate) fn push(
        &mut self,
        collector: &mut Collector,
        package: RecoveryPackage,
    ) -> Result<(), StageError> {
        self.batch.push(package);
        if self.batch.len() >= self.batch_size {
            self.dispatch(collector)?;
        }
        Ok(())
    }

    /// Dispatches the accumulated batch, draining harvestable results while
    /// blocked waiting for a free worker.
    fn dispatch(&mut self, collector: &mut Collector) -> Result<(), StageError> {
        if self.batch.is_empty() {
            return Ok(())
        }
        let mut batch =
            Some(Batch { seq: self.next_seq, packages: std::mem::take(&mut self.batch) });
        self.next_seq += 1;

        let shared = Arc::clone(&self.shared);
        let (lock, condvar) = &*shared;
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(StageError::Aborted)
            }

            let mut spawn = false;
            let ready = {
                let mut guard = lock.lock().expect("farm mutex poisoned");
                let ready = take_ready(&mut guard);
                if batch.is_some() {
                    if guard.idle_workers > guard.pending.len() {
                        guard.pending.push_back(batch.take().expect("checked above"));
                        condvar.notify_all();
                    } else if guard.live_workers < self.max_workers {
                        guard.live_workers += 1;
                        guard.pending.push_back(batch.take().expect("checked above"));
                        spawn = true;
                    } else if ready.is_empty() {
                        // every worker busy, ceiling reached, nothing to
                        // harvest: this is the back-pressure point
                        let _unused =
                            condvar.wait(guard).expect("farm mutex poisoned");
                        continue
                    }
                }
                ready
            };

            if spawn {
                self.spawn_worker()?;
            }
            // collector writes happen outside the lock
            for result in ready {
                self.absorb(collector, result?)?;
            }
            if batch.is_none() {
                return Ok(())
            }
        }
    }

    /// Dispatches the final partial batch, waits until every outstanding
    /// batch has been harvested into the collector, and stops the workers.
    pub(crate) fn finish(&mut self, collector: &mut Collector) -> Result<(), StageError> {
        self.dispatch(collector)?;

        let shared = Arc::clone(&self.shared);
        let (lock, condvar) = &*shared;
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(StageError::Aborted)
            }
            let ready = {
                let mut guard = lock.lock().expect("farm mutex poisoned");
                if guard.next_harvest == self.next_seq {
                    break
                }
                let ready = take_ready(&mut guard);
                if ready.is_empty() {
                    let _unused = condvar.wait(guard).expect("farm mutex poisoned");
                    continue
                }
                ready
            };
            for result in ready {
                self.absorb(collector, result?)?;
            }
        }

        self.flush_block(collector)?;
        self.shutdown();
        debug!(
            target: "sync::stages::senders",
            recovered = self.total_recovered,
            "Recovery farm drained"
        );
        Ok(())
    }

    fn absorb(
        &mut self,
        collector: &mut Collector,
        results: Vec<(BlockNumber, Address)>,
    ) -> Result<(), StageError> {
        for (block_number, address) in results {
            if self.current_block != Some(block_number) {
                self.flush_block(collector)?;
                self.current_block = Some(block_number);
            }
            self.current_senders.extend_from_slice(address.as_slice());
            self.total_recovered += 1;
        }
        Ok(())
    }

    fn flush_block(&mut self, collector: &mut Collector) -> Result<(), StageError> {
        if let Some(block_number) = self.current_block.take() {
            let senders = std::mem::take(&mut self.current_senders);
            collector.collect(block_number.to_be_bytes().to_vec(), senders)?;
        }
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<(), StageError> {
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.stop);
        let harvest_capacity = self.harvest_capacity;
        let handle = std::thread::Builder::new()
            .name("sender-recovery".to_string())
            .spawn(move || worker_loop(shared, stop, harvest_capacity))
            .map_err(|err| StageError::Unexpected(Box::new(err)))?;
        self.handles.push(handle);
        Ok(())
    }

    fn shutdown(&mut self) {
        {
            let (lock, condvar) = &*self.shared;
            lock.lock().expect("farm mutex poisoned").shutdown = true;
            condvar.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for RecoveryFarm {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Removes the consecutive run of completed batches starting at
/// `next_harvest`.
fn take_ready(shared: &mut Shared) -> Vec<BatchResult> {
    let mut ready = Vec::new();
    while let Some(result) = shared.harvested.remove(&shared.next_harvest) {
        shared.next_harvest += 1;
        ready.push(result);
    }
    ready
}

fn worker_loop(
    shared: Arc<(Mutex<Shared>, Condvar)>,
    stop: Arc<AtomicBool>,
    harvest_capacity: usize,
) {
    let (lock, condvar) = &*shared;
    let mut guard = lock.lock().expect("farm mutex poisoned");
    loop {
        if guard.shutdown || stop.load(Ordering::Relaxed) {
            guard.live_workers -= 1;
            condvar.notify_all();
            return
        }

        if let Some(batch) = guard.pending.pop_front() {
            drop(guard);
            let result = recover_batch(&batch, &stop);

            guard = lock.lock().expect("farm mutex poisoned");
            // respect the harvest bound, but never hold back the batch the
            // producer is waiting on next
            while guard.harvested.len() >= harvest_capacity &&
                batch.seq != guard.next_harvest &&
                !guard.shutdown
            {
                guard = condvar.wait(guard).expect("farm mutex poisoned");
            }
            guard.harvested.insert(batch.seq, result);
            condvar.notify_all();
        } else {
            guard.idle_workers += 1;
            guard = condvar.wait(guard).expect("farm mutex poisoned");
            guard.idle_workers -= 1;
        }
    }
}

fn recover_batch(batch: &Batch, stop: &AtomicBool) -> BatchResult {
    let mut recovered = Vec::with_capacity(batch.packages.len());
    for package in &batch.packages {
        if stop.load(Ordering::Relaxed) {
            return Err(StageError::Aborted)
        }
        // the producer already enforced the low-s rule at packaging time
        let address = package
            .signature
            .recover_signer_unchecked(package.signing_hash)
            .ok_or(StageError::InvalidTransaction {
                block: package.block_number,
                index: package.tx_index,
            })?;
        recovered.push((package.block_number, address));
    }
    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{signed_tx, signer_address};
    use stagedsync_etl::Collector;
    use stagedsync_primitives::{
        Transaction, TransactionKind, TxLegacy, B256, U256,
    };
    use tempfile::TempDir;

    fn package(block_number: BlockNumber, tx_index: usize, secret_byte: u8) -> RecoveryPackage {
        let secret = B256::with_last_byte(secret_byte);
        let tx = Transaction::Legacy(TxLegacy {
            chain_id: Some(1),
            nonce: tx_index as u64,
            gas_price: 1,
            gas_limit: 21_000,
            to: TransactionKind::Call(Default::default()),
            value: U256::from(1),
            input: Default::default(),
        });
        let signed = signed_tx(secret, tx);
        RecoveryPackage {
            block_number,
            tx_index,
            signing_hash: signed.signature_hash(),
            signature: signed.signature,
        }
    }

    fn collected(collector: &mut Collector) -> Vec<(u64, Vec<u8>)> {
        // drain the collector through a throwaway table
        let dir = TempDir::new().unwrap();
        let env = stagedsync_db::Env::open(dir.path().join("drain.redb")).unwrap();
        let tx = env.tx_mut().unwrap();
        {
            let mut cursor = tx.cursor::<stagedsync_db::tables::Senders>().unwrap();
            collector
                .load(&mut cursor, None, stagedsync_etl::LoadMode::Append, 100)
                .unwrap();
        }
        let mut cursor = tx.cursor::<stagedsync_db::tables::Senders>().unwrap();
        cursor
            .walk(None)
            .unwrap()
            .map(|res| {
                let (number, senders) = res.unwrap();
                (number, senders.clone().0.iter().flat_map(|a| a.to_vec()).collect())
            })
            .collect()
    }

    #[test]
    fn preserves_transaction_order_across_batches() {
        let scratch = TempDir::new().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let mut collector = Collector::new(scratch.path(), 1 << 20);
        // batch size 2 forces the three packages of block 1 to span batches
        let mut farm = RecoveryFarm::new(stop, 2, 2);

        let packages: Vec<_> =
            (0..3).map(|index| package(1, index, index as u8 + 1)).collect();
        let expected: Vec<u8> = packages
            .iter()
            .enumerate()
            .flat_map(|(index, _)| signer_address(B256::with_last_byte(index as u8 + 1)).to_vec())
            .collect();

        for package in packages {
            farm.push(&mut collector, package).unwrap();
        }
        farm.finish(&mut collector).unwrap();

        let rows = collected(&mut collector);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, 1);
        assert_eq!(rows[0].1, expected);
    }

    #[test]
    fn groups_addresses_by_block() {
        let scratch = TempDir::new().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let mut collector = Collector::new(scratch.path(), 1 << 20);
        let mut farm = RecoveryFarm::new(stop, 4, 3);

        for block in 1u64..=5 {
            for index in 0..2 {
                farm.push(&mut collector, package(block, index, block as u8)).unwrap();
            }
        }
        farm.finish(&mut collector).unwrap();

        let rows = collected(&mut collector);
        assert_eq!(rows.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        for (_, senders) in rows {
            assert_eq!(senders.len(), 40);
        }
    }

    #[test]
    fn invalid_signature_surfaces_as_invalid_transaction() {
        let scratch = TempDir::new().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let mut collector = Collector::new(scratch.path(), 1 << 20);
        let mut farm = RecoveryFarm::new(stop, 2, 1);

        let mut bad = package(7, 0, 1);
        bad.signature = Signature { r: U256::ZERO, s: U256::ZERO, odd_y_parity: false };
        farm.push(&mut collector, bad).unwrap();

        let result = farm.finish(&mut collector);
        assert!(matches!(
            result,
            Err(StageError::InvalidTransaction { block: 7, index: 0 })
        ));
    }

    #[test]
    fn stop_aborts_promptly_and_joins_workers() {
        let scratch = TempDir::new().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let mut collector = Collector::new(scratch.path(), 1 << 20);
        let mut farm = RecoveryFarm::new(stop.clone(), 2, 1);

        farm.push(&mut collector, package(1, 0, 1)).unwrap();
        stop.store(true, Ordering::Relaxed);
        let result = farm.finish(&mut collector);
        assert!(matches!(result, Err(StageError::Aborted)));
        drop(farm); // joins without hanging
    }
}
