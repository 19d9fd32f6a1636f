//! Primitive types for the staged sync pipeline.
//!
//! This crate holds the small vocabulary every other crate speaks: block
//! numbers and hashes, stage identifiers, the chain spec with its fork
//! schedule, and the transaction model with signature recovery.

#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

mod chain;
mod stage;
pub mod transaction;

pub use chain::ChainSpec;
pub use stage::StageId;
pub use transaction::{
    AccessList, AccessListItem, Signature, Transaction, TransactionKind, TransactionSigned,
    TxEip1559, TxEip2930, TxLegacy, TxType,
};

pub use alloy_primitives::{self, keccak256, Address, Bytes, B256, U256};

/// Block height. Zero is genesis.
pub type BlockNumber = u64;

/// An EIP-155 chain identifier.
pub type ChainId = u64;

/// The Keccak-256 hash of a block header.
pub type HeaderHash = B256;

/// The Keccak-256 hash of a transaction envelope.
pub type TxHash = B256;
