use crate::{BlockNumber, ChainId};
use serde::{Deserialize, Serialize};

/// Fork schedule of the chain being synced.
///
/// Only the activations that change transaction validity rules are tracked:
/// EIP-155 replay protection, and the blocks at which the typed envelopes
/// (EIP-2930, EIP-1559) become acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSpec {
    /// The chain id transactions must commit to once EIP-155 is active.
    pub chain_id: ChainId,
    /// Homestead activation block.
    pub homestead_block: Option<BlockNumber>,
    /// Spurious Dragon activation block (EIP-155).
    pub eip155_block: Option<BlockNumber>,
    /// Berlin activation block (EIP-2930 envelopes).
    pub berlin_block: Option<BlockNumber>,
    /// London activation block (EIP-1559 envelopes).
    pub london_block: Option<BlockNumber>,
}

/// Ethereum mainnet fork schedule.
pub const MAINNET: ChainSpec = ChainSpec {
    chain_id: 1,
    homestead_block: Some(1_150_000),
    eip155_block: Some(2_675_000),
    berlin_block: Some(12_244_000),
    london_block: Some(12_965_000),
};

impl ChainSpec {
    /// A spec with every fork active from genesis, for the given chain id.
    pub const fn all_active(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            homestead_block: Some(0),
            eip155_block: Some(0),
            berlin_block: Some(0),
            london_block: Some(0),
        }
    }

    /// Whether EIP-155 replay protection is in force at `number`.
    pub fn is_eip155_active_at(&self, number: BlockNumber) -> bool {
        self.is_active(self.eip155_block, number)
    }

    /// Whether EIP-2930 transactions are acceptable at `number`.
    pub fn is_berlin_active_at(&self, number: BlockNumber) -> bool {
        self.is_active(self.berlin_block, number)
    }

    /// Whether EIP-1559 transactions are acceptable at `number`.
    pub fn is_london_active_at(&self, number: BlockNumber) -> bool {
        self.is_active(self.london_block, number)
    }

    fn is_active(&self, fork: Option<BlockNumber>, number: BlockNumber) -> bool {
        fork.map_or(false, |at| number >= at)
    }
}

impl Default for ChainSpec {
    fn default() -> Self {
        MAINNET
    }
}
