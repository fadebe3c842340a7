use serde::{de::DeserializeOwned, Serialize};

use crate::{QueuedTransaction, RelayProtocolError, SyncCursor, H160, H256};

/// Types with a canonical byte encoding for storage keys and values.
pub trait Encode {
    /// Serialize to a vec
    fn to_vec(&self) -> Vec<u8>;
}

/// Types that can be read back from their canonical encoding.
pub trait Decode: Sized {
    /// Parse from bytes
    fn read_from(bytes: &[u8]) -> Result<Self, RelayProtocolError>;
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], RelayProtocolError> {
    bytes
        .try_into()
        .map_err(|_| RelayProtocolError::InvalidLength {
            expected: N,
            actual: bytes.len(),
        })
}

impl Encode for H256 {
    fn to_vec(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl Decode for H256 {
    fn read_from(bytes: &[u8]) -> Result<Self, RelayProtocolError> {
        Ok(H256(fixed::<32>(bytes)?))
    }
}

impl Encode for H160 {
    fn to_vec(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

impl Decode for H160 {
    fn read_from(bytes: &[u8]) -> Result<Self, RelayProtocolError> {
        Ok(H160(fixed::<20>(bytes)?))
    }
}

// Integers are big-endian so rocksdb key order matches numeric order.
impl Encode for u32 {
    fn to_vec(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }
}

impl Decode for u32 {
    fn read_from(bytes: &[u8]) -> Result<Self, RelayProtocolError> {
        Ok(u32::from_be_bytes(fixed::<4>(bytes)?))
    }
}

impl Encode for u64 {
    fn to_vec(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }
}

impl Decode for u64 {
    fn read_from(bytes: &[u8]) -> Result<Self, RelayProtocolError> {
        Ok(u64::from_be_bytes(fixed::<8>(bytes)?))
    }
}

impl Encode for () {
    fn to_vec(&self) -> Vec<u8> {
        Vec::new()
    }
}

impl Decode for () {
    fn read_from(_bytes: &[u8]) -> Result<Self, RelayProtocolError> {
        Ok(())
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn to_vec(&self) -> Vec<u8> {
        let mut buf = self.0.to_vec();
        buf.extend(self.1.to_vec());
        buf
    }
}

fn json_to_vec<T: Serialize>(value: &T) -> Vec<u8> {
    // serde_json only fails on non-string map keys, which these records do not have
    serde_json::to_vec(value).unwrap_or_default()
}

fn json_read<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RelayProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

macro_rules! impl_json_codec {
    ($($ty:ty),*) => {
        $(
            impl Encode for $ty {
                fn to_vec(&self) -> Vec<u8> {
                    json_to_vec(self)
                }
            }

            impl Decode for $ty {
                fn read_from(bytes: &[u8]) -> Result<Self, RelayProtocolError> {
                    json_read(bytes)
                }
            }
        )*
    };
}

impl_json_codec!(QueuedTransaction, SyncCursor);
