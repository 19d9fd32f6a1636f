use crate::{transaction::util, Address, ChainId, TxHash, U256};
use alloy_rlp::{Decodable, Encodable, Error as RlpError};

/// The order of the secp256k1 curve, divided by two. Signatures that should be
/// checked according to EIP-2 should have an S value less than or equal to
/// this.
///
/// `57896044618658097711785492504343953926418782139537452191302581570759080747168`
pub const SECP256K1N_HALF: U256 = U256::from_be_bytes([
    0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0x5D, 0x57, 0x6E, 0x73, 0x57, 0xA4, 0x50, 0x1D, 0xDF, 0xE9, 0x2F, 0x46, 0x68, 0x1B, 0x20, 0xA0,
]);

/// r, s: Values corresponding to the signature of the transaction and used to
/// determine the sender of the transaction; formally Tr and Ts. This is
/// expanded in Appendix F of the yellow paper.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature {
    /// The R field of the signature; the point on the curve.
    pub r: U256,
    /// The S field of the signature; the point on the curve.
    pub s: U256,
    /// yParity: Signature Y parity; formally Ty
    pub odd_y_parity: bool,
}

impl Signature {
    /// Output the `v` of the signature depending on `chain_id`.
    #[inline]
    pub fn v(&self, chain_id: Option<ChainId>) -> u64 {
        if let Some(chain_id) = chain_id {
            // EIP-155: v = {0, 1} + CHAIN_ID * 2 + 35
            self.odd_y_parity as u64 + chain_id * 2 + 35
        } else {
            self.odd_y_parity as u64 + 27
        }
    }

    /// Output the length of the `v`, `r`, `s` fields without an RLP header,
    /// using the legacy scheme with EIP-155 support depending on `chain_id`.
    pub(crate) fn payload_len_with_eip155_chain_id(&self, chain_id: Option<ChainId>) -> usize {
        self.v(chain_id).length() + self.r.length() + self.s.length()
    }

    /// Encode the `v`, `r`, `s` values without an RLP header.
    /// Encodes the `v` value using the legacy scheme with EIP-155 support
    /// depending on `chain_id`.
    pub(crate) fn encode_with_eip155_chain_id(
        &self,
        out: &mut dyn alloy_rlp::BufMut,
        chain_id: Option<ChainId>,
    ) {
        self.v(chain_id).encode(out);
        self.r.encode(out);
        self.s.encode(out);
    }

    /// Decodes the `v`, `r`, `s` values without an RLP header.
    /// This will return a chain id if the `v` value is
    /// [EIP-155](https://eips.ethereum.org/EIPS/eip-155) compatible.
    pub(crate) fn decode_with_eip155_chain_id(
        buf: &mut &[u8],
    ) -> alloy_rlp::Result<(Self, Option<ChainId>)> {
        let v = u64::decode(buf)?;
        let r = Decodable::decode(buf)?;
        let s = Decodable::decode(buf)?;
        if v >= 35 {
            // EIP-155: v = {0, 1} + CHAIN_ID * 2 + 35
            let odd_y_parity = ((v - 35) % 2) != 0;
            let chain_id = (v - 35) >> 1;
            Ok((Signature { r, s, odd_y_parity }, Some(chain_id)))
        } else {
            // non-EIP-155 legacy scheme, v = 27 for even y-parity, v = 28 for odd y-parity
            if v != 27 && v != 28 {
                return Err(RlpError::Custom("invalid Ethereum signature (V is not 27 or 28)"))
            }
            let odd_y_parity = v == 28;
            Ok((Signature { r, s, odd_y_parity }, None))
        }
    }

    /// Output the length of the `odd_y_parity`, `r`, `s` fields without an
    /// RLP header.
    pub(crate) fn payload_len(&self) -> usize {
        self.odd_y_parity.length() + self.r.length() + self.s.length()
    }

    /// Encode the `odd_y_parity`, `r`, `s` values without an RLP header.
    pub(crate) fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.odd_y_parity.encode(out);
        self.r.encode(out);
        self.s.encode(out);
    }

    /// Decodes the `odd_y_parity`, `r`, `s` values without an RLP header.
    pub(crate) fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        Ok(Signature {
            odd_y_parity: Decodable::decode(buf)?,
            r: Decodable::decode(buf)?,
            s: Decodable::decode(buf)?,
        })
    }

    /// Whether the S value violates [EIP-2](https://eips.ethereum.org/EIPS/eip-2).
    pub fn is_high_s(&self) -> bool {
        self.s > SECP256K1N_HALF
    }

    /// Recover signer from message hash, _without ensuring that the signature
    /// has a low `s` value_.
    ///
    /// Using this for signature validation will succeed even if the signature
    /// is malleable or not compliant with EIP-2. This is provided for
    /// compatibility with old signatures which have large `s` values.
    pub fn recover_signer_unchecked(&self, hash: TxHash) -> Option<Address> {
        let mut sig: [u8; 65] = [0; 65];

        sig[0..32].copy_from_slice(&self.r.to_be_bytes::<32>());
        sig[32..64].copy_from_slice(&self.s.to_be_bytes::<32>());
        sig[64] = self.odd_y_parity as u8;

        // NOTE: we are removing the error from the underlying crypto library as it will restrain
        // primitive errors and we care only if recovery is passing or not.
        util::recover_signer_unchecked(&sig, &hash.0).ok()
    }

    /// Recover signer address from message hash. This ensures that the
    /// signature S value is not greater than `secp256k1n / 2`, as specified in
    /// [EIP-2](https://eips.ethereum.org/EIPS/eip-2).
    ///
    /// If the S value is too large, then this will return `None`.
    pub fn recover_signer(&self, hash: TxHash) -> Option<Address> {
        if self.is_high_s() {
            return None
        }

        self.recover_signer_unchecked(hash)
    }
}
