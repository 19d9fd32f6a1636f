/// Transaction envelope type as introduced in
/// [EIP-2718](https://eips.ethereum.org/EIPS/eip-2718).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxType {
    /// Legacy transaction.
    Legacy = 0,
    /// AccessList transaction ([EIP-2930](https://eips.ethereum.org/EIPS/eip-2930)).
    Eip2930 = 1,
    /// Dynamic fee transaction ([EIP-1559](https://eips.ethereum.org/EIPS/eip-1559)).
    Eip1559 = 2,
}

impl TryFrom<u8> for TxType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TxType::Legacy),
            1 => Ok(TxType::Eip2930),
            2 => Ok(TxType::Eip1559),
            other => Err(other),
        }
    }
}
