use crate::{
    config::SendersConfig,
    stages::recovery_farm::{RecoveryFarm, RecoveryPackage},
    Stage, StageError, StageResult, SyncContext,
};
use stagedsync_db::{models::BlockNumHash, tables, TxnManager};
use stagedsync_etl::LoadMode;
use stagedsync_primitives::{
    BlockNumber, ChainSpec, StageId, Transaction, TransactionSigned, TxType,
};
use tracing::info;

/// Recovers the sender address of every transaction of every canonical block
/// and persists them as fixed-width per-block records in the `Senders`
/// table.
///
/// Signing hashes are computed on the producer side; the CPU-bound curve
/// recovery is spread over a [`RecoveryFarm`] of worker threads.
#[derive(Debug)]
pub struct SendersStage {
    ordinal: u32,
    batch_size: usize,
    max_workers: usize,
    prune_distance: Option<u64>,
}

impl SendersStage {
    /// Creates the stage with its pipeline position and settings.
    pub fn new(ordinal: u32, config: &SendersConfig) -> Self {
        let max_workers = config.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        });
        Self {
            ordinal,
            batch_size: config.batch_size,
            max_workers,
            prune_distance: config.prune_distance,
        }
    }
}

impl Stage for SendersStage {
    fn id(&self) -> StageId {
        StageId::SENDERS
    }

    fn ordinal(&self) -> u32 {
        self.ordinal
    }

    fn has_pruning(&self) -> bool {
        self.prune_distance.is_some()
    }

    fn forward(&mut self, txn: &mut TxnManager<'_>, ctx: &mut SyncContext) -> StageResult {
        let target = ctx.get_progress(txn, StageId::BLOCK_HASHES)?;
        let progress = ctx.get_progress(txn, self.id())?;
        if progress == target {
            return Ok(())
        }
        if progress > target {
            return Err(StageError::InvalidProgress { stage: self.id(), progress })
        }

        info!(
            target: "sync::stages::senders",
            from = progress + 1,
            to = target,
            "Recovering senders"
        );

        let mut collector = ctx.new_collector();
        let mut farm =
            RecoveryFarm::new(ctx.stop_handle(), self.max_workers, self.batch_size);
        let chain_spec = *ctx.chain_spec();
        {
            let mut canonical = txn.cursor::<tables::CanonicalHashes>()?;
            let mut walker = canonical.walk_range(progress + 1..=target)?;
            let mut expected = progress + 1;
            while let Some(entry) = walker.next() {
                if ctx.is_stopping() {
                    return Err(StageError::Aborted)
                }
                let (number, hash) = entry?;
                if number != expected {
                    return Err(StageError::BadChainSequence { expected, got: number })
                }

                let body = txn
                    .get::<tables::BlockBodies>(BlockNumHash((number, hash)))?
                    .ok_or(StageError::MissingSenders(number))?;
                for (index, transaction) in body.transactions.iter().enumerate() {
                    let package = build_package(&chain_spec, number, index, transaction)?;
                    farm.push(&mut collector, package)?;
                }
                expected += 1;
            }
            if expected != target + 1 {
                return Err(StageError::BadChainSequence { expected: target, got: expected - 1 })
            }
        }
        farm.finish(&mut collector)?;

        {
            let mut destination = txn.cursor::<tables::Senders>()?;
            collector.load(&mut destination, None, LoadMode::Append, 10)?;
        }
        ctx.update_progress(txn, self.id(), target)?;
        txn.commit()?;
        info!(target: "sync::stages::senders", progress = target, "Stage finished");
        Ok(())
    }

    /// Deletes every senders record above the unwind height.
    fn unwind(&mut self, txn: &mut TxnManager<'_>, ctx: &mut SyncContext) -> StageResult {
        let progress = ctx.get_progress(txn, self.id())?;
        let unwind_to = match ctx.needs_unwind(progress) {
            Some(height) => height,
            None => return Ok(()),
        };

        {
            let mut cursor = txn.cursor::<tables::Senders>()?;
            let mut walker = cursor.walk(Some(unwind_to + 1))?;
            while walker.next().transpose()?.is_some() {
                walker.delete_current()?;
            }
        }
        ctx.update_progress(txn, self.id(), unwind_to)?;
        txn.commit()?;
        info!(target: "sync::stages::senders", progress = unwind_to, "Unwind finished");
        Ok(())
    }

    /// Deletes senders records more than the configured distance behind the
    /// stage watermark.
    fn prune(&mut self, txn: &mut TxnManager<'_>, ctx: &mut SyncContext) -> StageResult {
        let distance = match self.prune_distance {
            Some(distance) => distance,
            None => return Ok(()),
        };
        let progress = ctx.get_progress(txn, self.id())?;
        let threshold = progress.saturating_sub(distance);
        let done_to = ctx.get_prune_progress(txn, self.id())?;
        if threshold <= done_to {
            return Ok(())
        }

        let mut pruned = 0u64;
        {
            let mut cursor = txn.cursor::<tables::Senders>()?;
            let mut walker = cursor.walk_range(done_to..threshold)?;
            while walker.next().transpose()?.is_some() {
                walker.delete_current()?;
                pruned += 1;
            }
        }
        ctx.update_prune_progress(txn, self.id(), threshold)?;
        txn.commit()?;
        info!(target: "sync::stages::senders", pruned, up_to = threshold, "Prune finished");
        Ok(())
    }
}

/// Validates a transaction against the chain rules that gate sender
/// recovery and packages it for a worker.
fn build_package(
    chain_spec: &ChainSpec,
    block_number: BlockNumber,
    tx_index: usize,
    transaction: &TransactionSigned,
) -> Result<RecoveryPackage, StageError> {
    let invalid = StageError::InvalidTransaction { block: block_number, index: tx_index };

    // typed envelopes are only acceptable once their fork is active
    match transaction.transaction.tx_type() {
        TxType::Legacy => {}
        TxType::Eip2930 => {
            if !chain_spec.is_berlin_active_at(block_number) {
                return Err(invalid)
            }
        }
        TxType::Eip1559 => {
            if !chain_spec.is_london_active_at(block_number) {
                return Err(invalid)
            }
        }
    }

    match transaction.transaction.chain_id() {
        Some(chain_id) => {
            if chain_id != chain_spec.chain_id {
                return Err(StageError::UnknownChainId {
                    expected: chain_spec.chain_id,
                    got: chain_id,
                })
            }
            // a replay protected legacy transaction before the fork that
            // introduced replay protection cannot be canonical
            if matches!(transaction.transaction, Transaction::Legacy(_)) &&
                !chain_spec.is_eip155_active_at(block_number)
            {
                return Err(invalid)
            }
        }
        // pre-EIP-155 legacy transactions carry no chain id
        None => {}
    }

    if transaction.signature.is_high_s() {
        return Err(invalid)
    }

    Ok(RecoveryPackage {
        block_number,
        tx_index,
        signing_hash: transaction.signature_hash(),
        signature: transaction.signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{random_chain, signed_tx, signer_address, TestEnv, TestBlock};
    use assert_matches::assert_matches;
    use stagedsync_primitives::{
        Signature, TransactionKind, TxLegacy, B256, U256,
    };

    fn test_stage() -> SendersStage {
        let config =
            SendersConfig { batch_size: 4, max_workers: Some(2), prune_distance: None };
        SendersStage::new(2, &config)
    }

    fn forward(test: &TestEnv, ctx: &mut SyncContext) -> StageResult {
        let mut txn = TxnManager::new(&test.env).unwrap();
        let result = test_stage().forward(&mut txn, ctx);
        ctx.clear_cache();
        result
    }

    fn legacy_tx(secret_byte: u8, nonce: u64) -> TransactionSigned {
        let tx = Transaction::Legacy(TxLegacy {
            chain_id: Some(1),
            nonce,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: TransactionKind::Call(Default::default()),
            value: U256::from(1),
            input: Default::default(),
        });
        signed_tx(B256::with_last_byte(secret_byte), tx)
    }

    #[test]
    fn recovers_senders_of_a_single_block() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();

        let txs = vec![legacy_tx(0x5a, 0), legacy_tx(0xb6, 1)];
        let expected: Vec<u8> = [0x5au8, 0xb6]
            .iter()
            .flat_map(|byte| signer_address(B256::with_last_byte(*byte)).to_vec())
            .collect();

        test.seed_chain(&[TestBlock::new(1, txs)]);
        test.set_stage_progress(StageId::BLOCK_HASHES, 1);

        forward(&test, &mut ctx).unwrap();

        assert_eq!(test.stage_progress(StageId::SENDERS), 1);
        let senders = test.senders(1).expect("senders row missing");
        assert_eq!(senders.len(), 40);
        assert_eq!(senders, expected);
    }

    #[test]
    fn recovers_random_chain_and_matches_direct_recovery() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();

        let blocks = random_chain(0xfeed, 1..=12, 0..3);
        test.seed_chain(&blocks);
        test.set_stage_progress(StageId::BLOCK_HASHES, 12);

        forward(&test, &mut ctx).unwrap();

        assert_eq!(test.stage_progress(StageId::SENDERS), 12);
        for block in &blocks {
            let expected: Vec<u8> = block
                .transactions
                .iter()
                .flat_map(|tx| tx.recover_signer().unwrap().to_vec())
                .collect();
            let stored = test.senders(block.number).unwrap_or_default();
            assert_eq!(stored, expected, "block {}", block.number);
        }
    }

    #[test]
    fn empty_range_is_a_no_op() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();
        forward(&test, &mut ctx).unwrap();
        assert_eq!(test.stage_progress(StageId::SENDERS), 0);
        assert_eq!(test.entries::<tables::Senders>(), 0);
    }

    #[test]
    fn missing_body_fails() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();
        // canonical hash present, body absent
        test.seed_canonical(&[(1, B256::repeat_byte(0x11))]);
        test.set_stage_progress(StageId::BLOCK_HASHES, 1);

        let result = forward(&test, &mut ctx);
        assert_matches!(result, Err(StageError::MissingSenders(1)));
        assert_eq!(test.stage_progress(StageId::SENDERS), 0);
    }

    #[test]
    fn high_s_signature_fails() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();

        let good = legacy_tx(0x01, 0);
        let high_s = Signature {
            r: good.signature.r,
            s: U256::MAX,
            odd_y_parity: good.signature.odd_y_parity,
        };
        let bad = TransactionSigned::from_transaction_and_signature(
            good.transaction.clone(),
            high_s,
        );

        test.seed_chain(&[TestBlock::new(1, vec![bad])]);
        test.set_stage_progress(StageId::BLOCK_HASHES, 1);

        let result = forward(&test, &mut ctx);
        assert_matches!(
            result,
            Err(StageError::InvalidTransaction { block: 1, index: 0 })
        );
    }

    #[test]
    fn foreign_chain_id_fails() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();

        let tx = Transaction::Legacy(TxLegacy {
            chain_id: Some(99),
            nonce: 0,
            gas_price: 1,
            gas_limit: 21_000,
            to: TransactionKind::Call(Default::default()),
            value: U256::ZERO,
            input: Default::default(),
        });
        let tx = signed_tx(B256::with_last_byte(3), tx);
        test.seed_chain(&[TestBlock::new(1, vec![tx])]);
        test.set_stage_progress(StageId::BLOCK_HASHES, 1);

        let result = forward(&test, &mut ctx);
        assert_matches!(
            result,
            Err(StageError::UnknownChainId { expected: 1, got: 99 })
        );
    }

    #[test]
    fn cancellation_aborts_without_commit() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();

        let blocks = random_chain(0xabcd, 1..=20, 1..2);
        test.seed_chain(&blocks);
        test.set_stage_progress(StageId::BLOCK_HASHES, 20);

        ctx.stop_handle().store(true, std::sync::atomic::Ordering::Relaxed);
        let result = forward(&test, &mut ctx);

        assert_matches!(result, Err(StageError::Aborted));
        assert_eq!(test.stage_progress(StageId::SENDERS), 0);
        assert_eq!(test.entries::<tables::Senders>(), 0);
        assert_eq!(test.spill_file_count(), 0);
    }

    #[test]
    fn unwind_deletes_rows_above_height() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();

        let blocks = random_chain(0x77, 1..=6, 1..3);
        test.seed_chain(&blocks);
        test.set_stage_progress(StageId::BLOCK_HASHES, 6);
        forward(&test, &mut ctx).unwrap();

        ctx.set_unwind_height(Some(2));
        {
            let mut txn = TxnManager::new(&test.env).unwrap();
            test_stage().unwind(&mut txn, &mut ctx).unwrap();
        }
        ctx.clear_cache();

        assert_eq!(test.stage_progress(StageId::SENDERS), 2);
        for block in &blocks {
            let row = test.senders(block.number);
            if block.number <= 2 {
                assert_eq!(row.is_some(), !block.transactions.is_empty());
            } else {
                assert_eq!(row, None);
            }
        }
    }

    #[test]
    fn prune_deletes_history_below_distance() {
        let test = TestEnv::new();
        let mut ctx = test.ctx();

        let blocks = random_chain(0x99, 1..=10, 1..2);
        test.seed_chain(&blocks);
        test.set_stage_progress(StageId::BLOCK_HASHES, 10);
        forward(&test, &mut ctx).unwrap();

        let mut config = SendersConfig::default();
        config.prune_distance = Some(4);
        let mut pruning_stage = SendersStage::new(2, &config);
        assert!(pruning_stage.has_pruning());

        {
            let mut txn = TxnManager::new(&test.env).unwrap();
            pruning_stage.prune(&mut txn, &mut ctx).unwrap();
        }
        ctx.clear_cache();

        assert_eq!(test.prune_progress(StageId::SENDERS), 6);
        for number in 1u64..6 {
            assert_eq!(test.senders(number), None);
        }
        for number in 6u64..=10 {
            assert!(test.senders(number).is_some());
        }
    }
}
