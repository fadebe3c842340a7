use std::fmt::Debug;

use async_trait::async_trait;

use crate::{Block, ChainResult, DecodedTransaction, Receipt, TxHash, U256};

/// Everything the relay needs from a chain node.
///
/// Implementations translate between the relay's types and a specific
/// chain's wire format and RPC surface.
#[async_trait]
pub trait ChainInterface: Send + Sync + Debug {
    /// Parse raw signed bytes into their relevant fields. Fails with
    /// [`crate::ChainCommunicationError::InvalidEncoding`] on garbage.
    fn decode_transaction(&self, raw: &[u8]) -> ChainResult<DecodedTransaction>;

    /// Height of the newest block the node knows.
    async fn latest_block_number(&self) -> ChainResult<u64>;

    /// Fetch a block with its transactions, `None` if not produced yet.
    async fn block_by_number(&self, height: u64) -> ChainResult<Option<Block>>;

    /// Receipt for a mined transaction, `None` if unknown.
    async fn transaction_receipt(&self, hash: TxHash) -> ChainResult<Option<Receipt>>;

    /// Submit signed bytes. A refusal by the node is
    /// [`crate::ChainCommunicationError::Rejected`].
    async fn send_raw_transaction(&self, raw: &[u8]) -> ChainResult<TxHash>;

    /// Current network fee level.
    async fn gas_price(&self) -> ChainResult<U256>;
}
