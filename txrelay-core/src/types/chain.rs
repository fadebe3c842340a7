use serde::{Deserialize, Serialize};

use crate::{Address, TxHash, H256};

/// A block as seen by the syncer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// height
    pub number: u64,
    /// block hash
    pub hash: H256,
    /// transactions in block order
    pub transactions: Vec<BlockTransaction>,
}

/// A transaction reference inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTransaction {
    /// transaction hash
    pub hash: TxHash,
    /// position in the block
    pub index: u32,
    /// signer
    pub sender: Address,
}

/// Execution outcome of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// transaction hash
    pub hash: TxHash,
    /// block height the transaction was mined at
    pub block_number: u64,
    /// position in the block
    pub index: u32,
    /// whether execution succeeded
    pub success: bool,
}
