use crate::{Address, B256};
use alloy_rlp::{RlpDecodable, RlpDecodableWrapper, RlpEncodable, RlpEncodableWrapper};

/// A list of addresses and storage keys that the transaction plans to access.
/// Accesses outside the list are possible, but become more expensive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, RlpEncodable, RlpDecodable)]
pub struct AccessListItem {
    /// Account address that will be accessed during transaction execution.
    pub address: Address,
    /// The storage keys to be accessed.
    pub storage_keys: Vec<B256>,
}

/// AccessList as defined in [EIP-2930](https://eips.ethereum.org/EIPS/eip-2930).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct AccessList(pub Vec<AccessListItem>);
