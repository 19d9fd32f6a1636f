//! Storage models for block related data.

use crate::{
    table::{Decode, Encode},
    DatabaseError,
};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use stagedsync_primitives::{Address, BlockNumber, HeaderHash, TransactionSigned};

/// The key under which block bodies are stored: the block number followed by
/// the header hash, both in their canonical byte layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockNumHash(pub (BlockNumber, HeaderHash));

impl BlockNumHash {
    /// The block number part of the key.
    pub fn number(&self) -> BlockNumber {
        self.0 .0
    }

    /// The hash part of the key.
    pub fn hash(&self) -> HeaderHash {
        self.0 .1
    }
}

impl From<(BlockNumber, HeaderHash)> for BlockNumHash {
    fn from(tpl: (BlockNumber, HeaderHash)) -> Self {
        BlockNumHash(tpl)
    }
}

impl Encode for BlockNumHash {
    type Encoded = [u8; 40];

    fn encode(self) -> Self::Encoded {
        let mut buf = [0u8; 40];
        buf[..8].copy_from_slice(&self.number().to_be_bytes());
        buf[8..].copy_from_slice(self.hash().as_slice());
        buf
    }
}

impl Decode for BlockNumHash {
    fn decode(buf: &[u8]) -> Result<Self, DatabaseError> {
        if buf.len() != 40 {
            return Err(DatabaseError::Decode(format!(
                "expected 40 byte block key, got {}",
                buf.len()
            )))
        }
        let number = BlockNumber::decode(&buf[..8])?;
        let hash = HeaderHash::decode(&buf[8..])?;
        Ok(BlockNumHash((number, hash)))
    }
}

/// The transactions of a block, stored as an RLP list in the canonical
/// envelope encodings.
#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable, RlpDecodable)]
pub struct StoredBlockBody {
    /// Transactions in execution order.
    pub transactions: Vec<TransactionSigned>,
}

impl Encode for StoredBlockBody {
    type Encoded = Vec<u8>;

    fn encode(self) -> Self::Encoded {
        alloy_rlp::encode(&self)
    }
}

impl Decode for StoredBlockBody {
    fn decode(buf: &[u8]) -> Result<Self, DatabaseError> {
        <Self as alloy_rlp::Decodable>::decode(&mut &buf[..])
            .map_err(|err| DatabaseError::Decode(format!("invalid block body: {err}")))
    }
}

/// Recovered sender addresses of a block, stored as the fixed-width
/// concatenation of 20 byte addresses in transaction order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredSenders(pub Vec<Address>);

impl Encode for StoredSenders {
    type Encoded = Vec<u8>;

    fn encode(self) -> Self::Encoded {
        let mut buf = Vec::with_capacity(self.0.len() * Address::len_bytes());
        for address in &self.0 {
            buf.extend_from_slice(address.as_slice());
        }
        buf
    }
}

impl Decode for StoredSenders {
    fn decode(buf: &[u8]) -> Result<Self, DatabaseError> {
        if buf.len() % Address::len_bytes() != 0 {
            return Err(DatabaseError::Decode(format!(
                "senders record length {} is not a multiple of 20",
                buf.len()
            )))
        }
        Ok(StoredSenders(buf.chunks(Address::len_bytes()).map(Address::from_slice).collect()))
    }
}
