pub use primitive_types::{H160, H256, U256};

pub use chain::*;
pub use cursor::*;
pub use status::*;
pub use transaction::*;

mod chain;
mod cursor;
pub mod serialize;
mod status;
mod transaction;

/// Hash identifying a transaction. Hex encoded at the edges, binary inside.
pub type TxHash = H256;

/// An account address on the chain.
pub type Address = H160;

/// Keccak256 of some bytes as an H256.
pub fn keccak256(bytes: impl AsRef<[u8]>) -> H256 {
    use sha3::{Digest, Keccak256};
    H256::from_slice(&Keccak256::digest(bytes.as_ref()))
}
