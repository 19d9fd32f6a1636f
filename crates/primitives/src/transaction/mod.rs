//! Transaction model: the three envelopes the sync pipeline understands and
//! the signing-hash rules needed to recover senders.

mod access_list;
mod signature;
mod tx_type;
/// secp256k1 recovery and signing glue.
pub mod util;

use crate::{keccak256, Address, Bytes, ChainId, TxHash, U256};
use alloy_rlp::{length_of_length, Decodable, Encodable, Error as RlpError, Header};

pub use access_list::{AccessList, AccessListItem};
pub use signature::{Signature, SECP256K1N_HALF};
pub use tx_type::TxType;

/// Legacy transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TxLegacy {
    /// Added as EIP-155: Simple replay attack protection
    pub chain_id: Option<ChainId>,
    /// A scalar value equal to the number of transactions sent by the sender; formally Tn.
    pub nonce: u64,
    /// A scalar value equal to the number of Wei to be paid per unit of gas
    /// for all computation costs incurred as a result of the execution of
    /// this transaction; formally Tp.
    pub gas_price: u128,
    /// A scalar value equal to the maximum amount of gas that should be used
    /// in executing this transaction; formally Tg.
    pub gas_limit: u64,
    /// The 160-bit address of the message call's recipient, or ∅ for a
    /// contract creation transaction; formally Tt.
    pub to: TransactionKind,
    /// A scalar value equal to the number of Wei to be transferred to the
    /// message call's recipient; formally Tv.
    pub value: U256,
    /// Input data of the message call or the EVM init code on creation;
    /// formally Td / Ti.
    pub input: Bytes,
}

impl TxLegacy {
    fn fields_len(&self) -> usize {
        self.nonce.length() +
            self.gas_price.length() +
            self.gas_limit.length() +
            self.to.length() +
            self.value.length() +
            self.input.length()
    }

    fn encode_fields(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.nonce.encode(out);
        self.gas_price.encode(out);
        self.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.input.encode(out);
    }
}

/// Transaction with an access list ([EIP-2930](https://eips.ethereum.org/EIPS/eip-2930)).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TxEip2930 {
    /// Added as EIP-155: Simple replay attack protection
    pub chain_id: ChainId,
    /// A scalar value equal to the number of transactions sent by the sender; formally Tn.
    pub nonce: u64,
    /// Wei per unit of gas; formally Tp.
    pub gas_price: u128,
    /// Gas ceiling of the transaction; formally Tg.
    pub gas_limit: u64,
    /// Recipient or ∅ for creation; formally Tt.
    pub to: TransactionKind,
    /// Transferred Wei; formally Tv.
    pub value: U256,
    /// Call data or init code; formally Td / Ti.
    pub input: Bytes,
    /// Addresses and storage keys the transaction plans to access.
    pub access_list: AccessList,
}

impl TxEip2930 {
    fn fields_len(&self) -> usize {
        self.chain_id.length() +
            self.nonce.length() +
            self.gas_price.length() +
            self.gas_limit.length() +
            self.to.length() +
            self.value.length() +
            self.input.length() +
            self.access_list.length()
    }

    fn encode_fields(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.chain_id.encode(out);
        self.nonce.encode(out);
        self.gas_price.encode(out);
        self.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.input.encode(out);
        self.access_list.encode(out);
    }
}

/// Dynamic fee transaction ([EIP-1559](https://eips.ethereum.org/EIPS/eip-1559)).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TxEip1559 {
    /// Added as EIP-155: Simple replay attack protection
    pub chain_id: ChainId,
    /// A scalar value equal to the number of transactions sent by the sender; formally Tn.
    pub nonce: u64,
    /// Maximum priority fee the sender is willing to pay, in Wei per gas.
    pub max_priority_fee_per_gas: u128,
    /// Maximum total fee the sender is willing to pay, in Wei per gas.
    pub max_fee_per_gas: u128,
    /// Gas ceiling of the transaction; formally Tg.
    pub gas_limit: u64,
    /// Recipient or ∅ for creation; formally Tt.
    pub to: TransactionKind,
    /// Transferred Wei; formally Tv.
    pub value: U256,
    /// Call data or init code; formally Td / Ti.
    pub input: Bytes,
    /// Addresses and storage keys the transaction plans to access.
    pub access_list: AccessList,
}

impl TxEip1559 {
    fn fields_len(&self) -> usize {
        self.chain_id.length() +
            self.nonce.length() +
            self.max_priority_fee_per_gas.length() +
            self.max_fee_per_gas.length() +
            self.gas_limit.length() +
            self.to.length() +
            self.value.length() +
            self.input.length() +
            self.access_list.length()
    }

    fn encode_fields(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.chain_id.encode(out);
        self.nonce.encode(out);
        self.max_priority_fee_per_gas.encode(out);
        self.max_fee_per_gas.encode(out);
        self.gas_limit.encode(out);
        self.to.encode(out);
        self.value.encode(out);
        self.input.encode(out);
        self.access_list.encode(out);
    }
}

/// An unsigned transaction in one of the three supported envelopes
/// ([EIP-2718](https://eips.ethereum.org/EIPS/eip-2718)).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Transaction {
    /// Legacy transaction, with or without EIP-155 replay protection.
    Legacy(TxLegacy),
    /// EIP-2930 access list transaction.
    Eip2930(TxEip2930),
    /// EIP-1559 dynamic fee transaction.
    Eip1559(TxEip1559),
}

impl Transaction {
    /// The envelope type of this transaction.
    pub fn tx_type(&self) -> TxType {
        match self {
            Transaction::Legacy(_) => TxType::Legacy,
            Transaction::Eip2930(_) => TxType::Eip2930,
            Transaction::Eip1559(_) => TxType::Eip1559,
        }
    }

    /// The chain id this transaction commits to, if any.
    ///
    /// Only pre-EIP-155 legacy transactions return `None`.
    pub fn chain_id(&self) -> Option<ChainId> {
        match self {
            Transaction::Legacy(tx) => tx.chain_id,
            Transaction::Eip2930(tx) => Some(tx.chain_id),
            Transaction::Eip1559(tx) => Some(tx.chain_id),
        }
    }

    /// The hash the sender signed.
    ///
    /// Legacy transactions hash `rlp([nonce, gas_price, gas_limit, to, value,
    /// input])`, extended with `[chain_id, 0, 0]` under EIP-155. Typed
    /// envelopes hash `type ∥ rlp(fields)`.
    pub fn signature_hash(&self) -> TxHash {
        let mut buf = Vec::with_capacity(self.signing_payload_len());
        self.encode_for_signing(&mut buf);
        keccak256(&buf)
    }

    fn signing_payload_len(&self) -> usize {
        match self {
            Transaction::Legacy(tx) => {
                let payload = tx.fields_len() + eip155_fields_len(tx.chain_id);
                payload + length_of_length(payload)
            }
            Transaction::Eip2930(tx) => {
                let payload = tx.fields_len();
                1 + payload + length_of_length(payload)
            }
            Transaction::Eip1559(tx) => {
                let payload = tx.fields_len();
                1 + payload + length_of_length(payload)
            }
        }
    }

    fn encode_for_signing(&self, out: &mut dyn alloy_rlp::BufMut) {
        match self {
            Transaction::Legacy(tx) => {
                let payload_length = tx.fields_len() + eip155_fields_len(tx.chain_id);
                Header { list: true, payload_length }.encode(out);
                tx.encode_fields(out);
                if let Some(id) = tx.chain_id {
                    // EIP-155 encodes the chain id followed by two empty values
                    id.encode(out);
                    0u8.encode(out);
                    0u8.encode(out);
                }
            }
            Transaction::Eip2930(tx) => {
                out.put_u8(TxType::Eip2930 as u8);
                Header { list: true, payload_length: tx.fields_len() }.encode(out);
                tx.encode_fields(out);
            }
            Transaction::Eip1559(tx) => {
                out.put_u8(TxType::Eip1559 as u8);
                Header { list: true, payload_length: tx.fields_len() }.encode(out);
                tx.encode_fields(out);
            }
        }
    }
}

fn eip155_fields_len(chain_id: Option<ChainId>) -> usize {
    // EIP-155 appends the chain id and two zero-length strings
    chain_id.map_or(0, |id| id.length() + 2)
}

/// Whether the transaction is a contract creation or a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactionKind {
    /// A transaction that creates a contract.
    #[default]
    Create,
    /// A transaction that calls a contract or transfers value.
    Call(Address),
}

impl Encodable for TransactionKind {
    fn length(&self) -> usize {
        match self {
            TransactionKind::Call(to) => to.length(),
            TransactionKind::Create => 1,
        }
    }

    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        match self {
            TransactionKind::Call(to) => to.encode(out),
            TransactionKind::Create => out.put_u8(alloy_rlp::EMPTY_STRING_CODE),
        }
    }
}

impl Decodable for TransactionKind {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        match buf.first() {
            Some(&alloy_rlp::EMPTY_STRING_CODE) => {
                *buf = &buf[1..];
                Ok(TransactionKind::Create)
            }
            Some(_) => Ok(TransactionKind::Call(Address::decode(buf)?)),
            None => Err(RlpError::InputTooShort),
        }
    }
}

/// A transaction together with its signature and cached envelope hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionSigned {
    /// The unsigned part.
    pub transaction: Transaction,
    /// The recoverable signature.
    pub signature: Signature,
    hash: TxHash,
}

impl TransactionSigned {
    /// Create a new signed transaction from a transaction and its signature,
    /// computing the envelope hash.
    pub fn from_transaction_and_signature(transaction: Transaction, signature: Signature) -> Self {
        let mut tx = Self { transaction, signature, hash: Default::default() };
        let mut buf = Vec::with_capacity(tx.envelope_len());
        tx.encode_enveloped(&mut buf);
        tx.hash = keccak256(&buf);
        tx
    }

    /// The envelope hash, `keccak256(type ∥ rlp(fields ∥ signature))` for
    /// typed transactions and `keccak256(rlp(fields ∥ signature))` for
    /// legacy ones.
    pub fn hash(&self) -> TxHash {
        self.hash
    }

    /// The hash the sender signed.
    pub fn signature_hash(&self) -> TxHash {
        self.transaction.signature_hash()
    }

    /// Recover the address of the signer, enforcing the EIP-2 low-`s` rule.
    pub fn recover_signer(&self) -> Option<Address> {
        self.signature.recover_signer(self.signature_hash())
    }

    fn envelope_payload_len(&self) -> usize {
        match &self.transaction {
            Transaction::Legacy(tx) => {
                tx.fields_len() + self.signature.payload_len_with_eip155_chain_id(tx.chain_id)
            }
            Transaction::Eip2930(tx) => tx.fields_len() + self.signature.payload_len(),
            Transaction::Eip1559(tx) => tx.fields_len() + self.signature.payload_len(),
        }
    }

    fn envelope_len(&self) -> usize {
        let payload = self.envelope_payload_len();
        match &self.transaction {
            Transaction::Legacy(_) => payload + length_of_length(payload),
            // one extra byte for the envelope type
            _ => 1 + payload + length_of_length(payload),
        }
    }

    /// Encode the consensus envelope, without the string wrapper typed
    /// transactions carry inside an RLP list.
    fn encode_enveloped(&self, out: &mut dyn alloy_rlp::BufMut) {
        let payload_length = self.envelope_payload_len();
        match &self.transaction {
            Transaction::Legacy(tx) => {
                Header { list: true, payload_length }.encode(out);
                tx.encode_fields(out);
                self.signature.encode_with_eip155_chain_id(out, tx.chain_id);
            }
            Transaction::Eip2930(tx) => {
                out.put_u8(TxType::Eip2930 as u8);
                Header { list: true, payload_length }.encode(out);
                tx.encode_fields(out);
                self.signature.encode(out);
            }
            Transaction::Eip1559(tx) => {
                out.put_u8(TxType::Eip1559 as u8);
                Header { list: true, payload_length }.encode(out);
                tx.encode_fields(out);
                self.signature.encode(out);
            }
        }
    }
}

/// Encodes the transaction the way it appears inside a block body: legacy
/// transactions as a plain RLP list, typed transactions as an RLP string
/// wrapping the envelope.
impl Encodable for TransactionSigned {
    fn length(&self) -> usize {
        let envelope = self.envelope_len();
        match &self.transaction {
            Transaction::Legacy(_) => envelope,
            _ => length_of_length(envelope) + envelope,
        }
    }

    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        match &self.transaction {
            Transaction::Legacy(_) => self.encode_enveloped(out),
            _ => {
                Header { list: false, payload_length: self.envelope_len() }.encode(out);
                self.encode_enveloped(out);
            }
        }
    }
}

impl Decodable for TransactionSigned {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if header.payload_length > buf.len() {
            return Err(RlpError::InputTooShort)
        }
        let mut payload = &buf[..header.payload_length];
        *buf = &buf[header.payload_length..];

        if header.list {
            // legacy: fields followed by (v, r, s)
            let tx = TxLegacy {
                chain_id: None,
                nonce: Decodable::decode(&mut payload)?,
                gas_price: Decodable::decode(&mut payload)?,
                gas_limit: Decodable::decode(&mut payload)?,
                to: Decodable::decode(&mut payload)?,
                value: Decodable::decode(&mut payload)?,
                input: Decodable::decode(&mut payload)?,
            };
            let (signature, chain_id) = Signature::decode_with_eip155_chain_id(&mut payload)?;
            if !payload.is_empty() {
                return Err(RlpError::UnexpectedLength)
            }
            let tx = TxLegacy { chain_id, ..tx };
            Ok(Self::from_transaction_and_signature(Transaction::Legacy(tx), signature))
        } else {
            // typed envelope: type byte followed by rlp(fields ∥ signature)
            let tx_type = *payload.first().ok_or(RlpError::InputTooShort)?;
            payload = &payload[1..];
            let tx_type = TxType::try_from(tx_type)
                .map_err(|_| RlpError::Custom("unsupported typed transaction"))?;

            let inner = Header::decode(&mut payload)?;
            if !inner.list || inner.payload_length != payload.len() {
                return Err(RlpError::UnexpectedLength)
            }

            let transaction = match tx_type {
                TxType::Eip2930 => Transaction::Eip2930(TxEip2930 {
                    chain_id: Decodable::decode(&mut payload)?,
                    nonce: Decodable::decode(&mut payload)?,
                    gas_price: Decodable::decode(&mut payload)?,
                    gas_limit: Decodable::decode(&mut payload)?,
                    to: Decodable::decode(&mut payload)?,
                    value: Decodable::decode(&mut payload)?,
                    input: Decodable::decode(&mut payload)?,
                    access_list: Decodable::decode(&mut payload)?,
                }),
                TxType::Eip1559 => Transaction::Eip1559(TxEip1559 {
                    chain_id: Decodable::decode(&mut payload)?,
                    nonce: Decodable::decode(&mut payload)?,
                    max_priority_fee_per_gas: Decodable::decode(&mut payload)?,
                    max_fee_per_gas: Decodable::decode(&mut payload)?,
                    gas_limit: Decodable::decode(&mut payload)?,
                    to: Decodable::decode(&mut payload)?,
                    value: Decodable::decode(&mut payload)?,
                    input: Decodable::decode(&mut payload)?,
                    access_list: Decodable::decode(&mut payload)?,
                }),
                TxType::Legacy => {
                    return Err(RlpError::Custom("legacy transaction inside a typed envelope"))
                }
            };
            let signature = Signature::decode(&mut payload)?;
            if !payload.is_empty() {
                return Err(RlpError::UnexpectedLength)
            }
            Ok(Self::from_transaction_and_signature(transaction, signature))
        }
    }
}
