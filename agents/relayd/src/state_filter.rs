use std::sync::Arc;

use async_trait::async_trait;
use derive_new::new;
use tracing::{debug, info, warn};

use txrelay_base::{
    db::{FinalizeOutcome, QueueStore},
    sync::{SyncError, SyncFilter},
    RelayMetrics,
};
use txrelay_core::{
    Block, BlockTransaction, ChainCommunicationError, ChainInterface, Confirmation, StatusFlag,
};

/// Finalizes queued transactions the syncer finds on chain.
#[derive(new, Debug)]
pub struct StateFilter {
    store: Arc<dyn QueueStore>,
    metrics: Arc<RelayMetrics>,
}

#[async_trait]
impl SyncFilter for StateFilter {
    fn name(&self) -> &str {
        "state"
    }

    async fn filter(
        &self,
        chain: &dyn ChainInterface,
        block: &Block,
        tx: &BlockTransaction,
    ) -> Result<bool, SyncError> {
        // most transactions on chain are not ours, skip the receipt lookup
        if self.store.retrieve(&tx.hash).await?.is_none() {
            return Ok(false);
        }

        let Some(receipt) = chain.transaction_receipt(tx.hash).await? else {
            // the node has the block but not yet the receipt
            return Err(ChainCommunicationError::Transport(format!(
                "no receipt for {:?} in block {}",
                tx.hash, block.number
            ))
            .into());
        };
        let confirmation = Confirmation::new(receipt.block_number, receipt.index);

        match self
            .store
            .finalize(&tx.hash, confirmation, receipt.success)
            .await?
        {
            FinalizeOutcome::NotLocal => Ok(false),
            FinalizeOutcome::Unchanged(_) => {
                debug!(tx_hash = ?tx.hash, height = block.number, "Already finalized");
                Ok(true)
            }
            FinalizeOutcome::Finalized { tx: finalized, obsoleted } => {
                let outcome = if finalized.status.has(StatusFlag::Final) {
                    "final"
                } else {
                    "obsolete"
                };
                if !receipt.success {
                    warn!(tx_hash = ?tx.hash, height = block.number, "Transaction failed on chain");
                }
                info!(
                    tx_hash = ?tx.hash,
                    height = receipt.block_number,
                    index = receipt.index,
                    outcome,
                    obsoleted = obsoleted.len(),
                    "Finalized transaction"
                );
                self.metrics
                    .transactions_finalized
                    .with_label_values(&[outcome])
                    .inc();
                if !obsoleted.is_empty() {
                    self.metrics
                        .transactions_finalized
                        .with_label_values(&["obsolete"])
                        .inc_by(obsoleted.len() as u64);
                }
                Ok(true)
            }
        }
    }
}
