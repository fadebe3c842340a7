use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::{Http, JsonRpcError, Middleware, Provider, ProviderError, RpcError};
use ethers::types::{BlockNumber, Bytes, U64};
use tracing::{debug, instrument, warn};

use txrelay_core::{
    Block, BlockTransaction, ChainCommunicationError, ChainInterface, ChainResult,
    DecodedTransaction, Receipt, TxHash, U256,
};

use crate::decode_raw_transaction;

/// A [`ChainInterface`] backed by an Ethereum JSON-RPC node over HTTP.
#[derive(Debug, Clone)]
pub struct EthereumChain {
    provider: Arc<Provider<Http>>,
}

impl EthereumChain {
    /// Connect to the node at `url`.
    pub fn new(url: &str) -> ChainResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|err| ChainCommunicationError::CustomError(format!("invalid rpc url: {err}")))?;
        Ok(Self {
            provider: Arc::new(provider),
        })
    }
}

/// Sort a node error into the relay's categories. Rate limiting and
/// connection problems are transient, any other JSON-RPC error means the
/// node looked at the request and refused it.
pub fn classify_provider_error(err: &ProviderError) -> ChainCommunicationError {
    match err.as_error_response() {
        Some(response) => classify_json_rpc_error(response),
        None => ChainCommunicationError::from_transport_err(err),
    }
}

/// See [`classify_provider_error`].
pub fn classify_json_rpc_error(err: &JsonRpcError) -> ChainCommunicationError {
    let msg = err.message.to_ascii_lowercase().replace('_', " ");
    if err.code == 429
        || msg.contains("429")
        || msg.contains("rate limit")
        || msg.contains("too many requests")
    {
        ChainCommunicationError::Transport(err.message.clone())
    } else {
        ChainCommunicationError::Rejected(err.message.clone())
    }
}

fn transport(err: ProviderError) -> ChainCommunicationError {
    ChainCommunicationError::from_transport_err(err)
}

/// In-block index reported by the node, or the position in the block body
/// when it is missing or does not fit.
fn block_position(index: Option<U64>, position: usize) -> u32 {
    let fallback = u32::try_from(position).unwrap_or(u32::MAX);
    index
        .and_then(|index| u32::try_from(index.as_u64()).ok())
        .unwrap_or(fallback)
}

#[async_trait]
impl ChainInterface for EthereumChain {
    fn decode_transaction(&self, raw: &[u8]) -> ChainResult<DecodedTransaction> {
        decode_raw_transaction(raw)
    }

    async fn latest_block_number(&self) -> ChainResult<u64> {
        let number = self.provider.get_block_number().await.map_err(transport)?;
        Ok(number.as_u64())
    }

    #[instrument(skip(self), level = "trace")]
    async fn block_by_number(&self, height: u64) -> ChainResult<Option<Block>> {
        let Some(block) = self
            .provider
            .get_block_with_txs(BlockNumber::Number(height.into()))
            .await
            .map_err(transport)?
        else {
            return Ok(None);
        };
        // pending blocks have neither
        let (Some(hash), Some(number)) = (block.hash, block.number) else {
            debug!(height, "Block is not sealed yet");
            return Ok(None);
        };
        let transactions = block
            .transactions
            .iter()
            .enumerate()
            .map(|(position, tx)| BlockTransaction {
                hash: tx.hash,
                index: block_position(tx.transaction_index, position),
                sender: tx.from,
            })
            .collect();
        Ok(Some(Block {
            number: number.as_u64(),
            hash,
            transactions,
        }))
    }

    async fn transaction_receipt(&self, hash: TxHash) -> ChainResult<Option<Receipt>> {
        let Some(receipt) = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(transport)?
        else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };
        Ok(Some(Receipt {
            hash,
            block_number: block_number.as_u64(),
            index: u32::try_from(receipt.transaction_index.as_u64()).map_err(|_| {
                ChainCommunicationError::InvalidEncoding(format!(
                    "receipt index {} out of range",
                    receipt.transaction_index
                ))
            })?,
            success: receipt.status.map(|status| status.as_u64() == 1).unwrap_or(true),
        }))
    }

    #[instrument(skip_all, fields(bytes = raw.len()))]
    async fn send_raw_transaction(&self, raw: &[u8]) -> ChainResult<TxHash> {
        match self
            .provider
            .send_raw_transaction(Bytes::from(raw.to_vec()))
            .await
        {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(err) => {
                let err = classify_provider_error(&err);
                warn!(error = %err, "Node did not accept transaction");
                Err(err)
            }
        }
    }

    async fn gas_price(&self) -> ChainResult<U256> {
        self.provider.get_gas_price().await.map_err(transport)
    }
}
