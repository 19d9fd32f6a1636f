//! Table traits.

use crate::DatabaseError;
use stagedsync_primitives::{BlockNumber, B256};
use std::fmt::Debug;

/// Trait that transforms data going into the database.
///
/// Encodings must preserve ordering: the lexicographic order of the encoded
/// bytes has to match the logical order of the values, since cursors iterate
/// in encoded-byte order.
pub trait Encode: Send + Sync + Sized + Debug {
    /// Encoded type.
    type Encoded: AsRef<[u8]> + Send + Sync;

    /// Encodes the value for storage.
    fn encode(self) -> Self::Encoded;
}

/// Trait that transforms data coming out of the database.
pub trait Decode: Send + Sync + Sized + Debug {
    /// Decodes the value from its stored form.
    fn decode(buf: &[u8]) -> Result<Self, DatabaseError>;
}

/// A database table: a name plus the key and value types stored under it.
pub trait Table: Send + Sync + Debug + 'static {
    /// The name of the table as present in the store.
    const NAME: &'static str;
    /// Key element of the table.
    type Key: Encode + Decode + Ord + Clone;
    /// Value element of the table.
    type Value: Encode + Decode;
}

/// A key-value pair of a table.
pub type TableRow<T> = (<T as Table>::Key, <T as Table>::Value);

impl Encode for BlockNumber {
    type Encoded = [u8; 8];

    fn encode(self) -> Self::Encoded {
        self.to_be_bytes()
    }
}

impl Decode for BlockNumber {
    fn decode(buf: &[u8]) -> Result<Self, DatabaseError> {
        let bytes: [u8; 8] = buf
            .try_into()
            .map_err(|_| DatabaseError::Decode(format!("expected 8 byte key, got {}", buf.len())))?;
        Ok(BlockNumber::from_be_bytes(bytes))
    }
}

impl Encode for B256 {
    type Encoded = [u8; 32];

    fn encode(self) -> Self::Encoded {
        self.0
    }
}

impl Decode for B256 {
    fn decode(buf: &[u8]) -> Result<Self, DatabaseError> {
        if buf.len() != 32 {
            return Err(DatabaseError::Decode(format!("expected 32 byte hash, got {}", buf.len())))
        }
        Ok(B256::from_slice(buf))
    }
}

impl Encode for String {
    type Encoded = Vec<u8>;

    fn encode(self) -> Self::Encoded {
        self.into_bytes()
    }
}

impl Decode for String {
    fn decode(buf: &[u8]) -> Result<Self, DatabaseError> {
        String::from_utf8(buf.to_vec())
            .map_err(|err| DatabaseError::Decode(format!("invalid utf-8 key: {err}")))
    }
}

impl Encode for Vec<u8> {
    type Encoded = Vec<u8>;

    fn encode(self) -> Self::Encoded {
        self
    }
}

impl Decode for Vec<u8> {
    fn decode(buf: &[u8]) -> Result<Self, DatabaseError> {
        Ok(buf.to_vec())
    }
}
