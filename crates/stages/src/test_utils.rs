//! Shared helpers for stage tests: a disposable database environment and
//! deterministic chain generators with properly signed transactions.

use crate::{
    config::{EtlConfig, SendersConfig, SyncConfig},
    registry, SyncContext,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use stagedsync_db::{
    models::{BlockNumHash, StoredBlockBody},
    table::Table,
    tables, Env, TxMut,
};
use stagedsync_primitives::{
    keccak256, transaction::util, Address, BlockNumber, ChainSpec, HeaderHash, StageId,
    Transaction, TransactionKind, TransactionSigned, TxEip1559, TxLegacy, B256, U256,
};
use std::ops::{Range, RangeInclusive};
use tempfile::TempDir;

/// A canonical block as the upstream download stages would persist it.
pub(crate) struct TestBlock {
    pub(crate) number: BlockNumber,
    pub(crate) hash: HeaderHash,
    pub(crate) transactions: Vec<TransactionSigned>,
}

impl TestBlock {
    pub(crate) fn new(number: BlockNumber, transactions: Vec<TransactionSigned>) -> Self {
        // nothing validates header contents here, a deterministic unique
        // hash is all the tables need
        let hash = keccak256(number.to_be_bytes());
        Self { number, hash, transactions }
    }
}

/// A temporary database plus the scratch directory a context points at.
pub(crate) struct TestEnv {
    pub(crate) env: Env,
    dir: TempDir,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        let dir = TempDir::new().expect("failed to create test dir");
        let env = Env::open(dir.path().join("stagedsync.redb")).expect("failed to open test db");
        Self { env, dir }
    }

    pub(crate) fn ctx(&self) -> SyncContext {
        SyncContext::new(SyncConfig {
            chain: ChainSpec::all_active(1),
            etl: EtlConfig {
                dir: self.dir.path().join("etl"),
                buffer_size: 1 << 20,
            },
            senders: SendersConfig::default(),
        })
    }

    fn commit(&self, f: impl FnOnce(&TxMut)) {
        let tx = self.env.tx_mut().expect("failed to begin transaction");
        f(&tx);
        tx.commit().expect("failed to commit");
    }

    fn query<R>(&self, f: impl FnOnce(&TxMut) -> R) -> R {
        let tx = self.env.tx_mut().expect("failed to begin transaction");
        let result = f(&tx);
        tx.abort().expect("failed to abort");
        result
    }

    pub(crate) fn seed_canonical(&self, entries: &[(BlockNumber, HeaderHash)]) {
        self.commit(|tx| {
            for (number, hash) in entries {
                tx.put::<tables::CanonicalHashes>(*number, *hash).unwrap();
            }
        });
    }

    pub(crate) fn seed_chain(&self, blocks: &[TestBlock]) {
        self.commit(|tx| {
            for block in blocks {
                tx.put::<tables::CanonicalHashes>(block.number, block.hash).unwrap();
                tx.put::<tables::BlockBodies>(
                    BlockNumHash((block.number, block.hash)),
                    StoredBlockBody { transactions: block.transactions.clone() },
                )
                .unwrap();
            }
        });
    }

    pub(crate) fn set_stage_progress(&self, id: StageId, progress: BlockNumber) {
        self.commit(|tx| registry::write_stage_progress(tx, id, progress).unwrap());
    }

    pub(crate) fn stage_progress(&self, id: StageId) -> BlockNumber {
        self.query(|tx| registry::read_stage_progress(tx, id).unwrap())
    }

    pub(crate) fn prune_progress(&self, id: StageId) -> BlockNumber {
        self.query(|tx| registry::read_stage_prune_progress(tx, id).unwrap())
    }

    pub(crate) fn header_number(&self, hash: HeaderHash) -> Option<BlockNumber> {
        self.query(|tx| tx.get::<tables::HeaderNumbers>(hash).unwrap())
    }

    pub(crate) fn senders(&self, number: BlockNumber) -> Option<Vec<u8>> {
        self.query(|tx| {
            tx.get::<tables::Senders>(number).unwrap().map(|senders| {
                senders.0.iter().flat_map(|address| address.to_vec()).collect()
            })
        })
    }

    pub(crate) fn entries<T: Table>(&self) -> usize {
        self.query(|tx| tx.entries::<T>().unwrap())
    }

    pub(crate) fn put_raw<T: Table>(&self, key: &[u8], value: &[u8]) {
        self.commit(|tx| {
            let mut cursor = tx.cursor::<T>().unwrap();
            cursor.upsert_raw(key, value).unwrap();
        });
    }

    pub(crate) fn spill_file_count(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("etl"))
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|entry| entry.file_name().to_string_lossy().starts_with("etl-"))
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Signs the transaction with the given secret, producing the full signed
/// form.
pub(crate) fn signed_tx(secret: B256, transaction: Transaction) -> TransactionSigned {
    let signature =
        util::sign_message(secret, transaction.signature_hash()).expect("invalid secret");
    TransactionSigned::from_transaction_and_signature(transaction, signature)
}

/// The address belonging to a secret key.
pub(crate) fn signer_address(secret: B256) -> Address {
    let secret = SecretKey::from_slice(secret.as_ref()).expect("invalid secret");
    util::public_key_to_address(PublicKey::from_secret_key(SECP256K1, &secret))
}

/// Generates a deterministic canonical chain with signed transactions of
/// mixed envelope types.
pub(crate) fn random_chain(
    seed: u64,
    numbers: RangeInclusive<BlockNumber>,
    txs_per_block: Range<usize>,
) -> Vec<TestBlock> {
    let mut rng = StdRng::seed_from_u64(seed);
    numbers
        .map(|number| {
            let tx_count = rng.gen_range(txs_per_block.clone());
            let transactions = (0..tx_count).map(|index| random_tx(&mut rng, index)).collect();
            TestBlock::new(number, transactions)
        })
        .collect()
}

fn random_tx(rng: &mut StdRng, index: usize) -> TransactionSigned {
    let secret = random_secret(rng);
    let to = TransactionKind::Call(Address::from(rng.gen::<[u8; 20]>()));
    let transaction = if rng.gen_bool(0.5) {
        Transaction::Legacy(TxLegacy {
            chain_id: Some(1),
            nonce: index as u64,
            gas_price: rng.gen_range(1..1_000_000_000u128),
            gas_limit: 21_000,
            to,
            value: U256::from(rng.gen::<u64>()),
            input: Default::default(),
        })
    } else {
        Transaction::Eip1559(TxEip1559 {
            chain_id: 1,
            nonce: index as u64,
            max_priority_fee_per_gas: rng.gen_range(1..1_000_000u128),
            max_fee_per_gas: rng.gen_range(1_000_000..1_000_000_000u128),
            gas_limit: 21_000,
            to,
            value: U256::from(rng.gen::<u64>()),
            input: Default::default(),
            access_list: Default::default(),
        })
    };
    signed_tx(secret, transaction)
}

fn random_secret(rng: &mut StdRng) -> B256 {
    loop {
        let candidate = B256::from(rng.gen::<[u8; 32]>());
        if SecretKey::from_slice(candidate.as_ref()).is_ok() {
            return candidate
        }
    }
}
