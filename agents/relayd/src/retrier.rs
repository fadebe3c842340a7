use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use derive_new::new;
use tracing::{debug, info, instrument, warn};

use txrelay_base::{
    db::{QueueError, QueueResult, QueueStore, StatusFilter},
    RelayMetrics,
};
use txrelay_core::{
    ChainCommunicationError, ChainInterface, ChainResult, FeeEscalator, QueuedTransaction,
    TransactionSigner, U256,
};

use crate::dispatcher::cutoff;

/// Replaces transactions that stay unconfirmed for too long with copies
/// signed at a higher fee.
#[derive(new, Debug)]
pub struct Retrier {
    chain: Arc<dyn ChainInterface>,
    store: Arc<dyn QueueStore>,
    signer: Arc<dyn TransactionSigner>,
    escalator: FeeEscalator,
    pending_threshold: Duration,
    metrics: Arc<RelayMetrics>,
}

impl Retrier {
    /// Replace every in-flight entry submitted before the pending threshold.
    /// Returns the number of replacements queued.
    ///
    /// A replacement that cannot be signed or stored leaves the stale entry
    /// in flight, it is picked up again in the next pass.
    #[instrument(skip_all)]
    pub async fn process(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let stale = self
            .store
            .list_upcoming(&StatusFilter::pending_before(cutoff(
                now,
                self.pending_threshold,
            )))
            .await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let network_fee = match self.chain.gas_price().await {
            Ok(fee) => fee,
            Err(err) => {
                warn!(?err, candidates = stale.len(), "Could not fetch network fee, skipping retries");
                return Ok(0);
            }
        };

        let mut replaced = 0;
        for tx in stale {
            if tx.sender != self.signer.address() {
                warn!(tx_hash = ?tx.hash, sender = ?tx.sender, "No key for sender, cannot replace stuck transaction");
                continue;
            }
            let replacement = match self.resign(&tx, network_fee, now).await {
                Ok(replacement) => replacement,
                Err(err) => {
                    warn!(?err, tx_hash = ?tx.hash, "Failed to re-sign stuck transaction");
                    continue;
                }
            };
            match self.store.replace(&tx.hash, &replacement).await {
                Ok(_) => {
                    info!(
                        tx_hash = ?tx.hash,
                        replacement = ?replacement.hash,
                        nonce = tx.nonce,
                        old_fee = %tx.fee,
                        new_fee = %replacement.fee,
                        "Replaced stuck transaction"
                    );
                    self.metrics.transactions_retried.inc();
                    replaced += 1;
                }
                Err(err @ QueueError::Db(_)) => return Err(err),
                Err(err) => {
                    warn!(?err, tx_hash = ?tx.hash, "Failed to store replacement");
                }
            }
        }
        Ok(replaced)
    }

    /// Sign `tx` again at the escalated fee and check the result only differs
    /// in fee.
    async fn resign(
        &self,
        tx: &QueuedTransaction,
        network_fee: U256,
        now: DateTime<Utc>,
    ) -> ChainResult<QueuedTransaction> {
        let fee = self.escalator.escalate(tx.fee, network_fee);
        debug!(tx_hash = ?tx.hash, old_fee = %tx.fee, %network_fee, new_fee = %fee, "Escalating fee");

        let original = self.chain.decode_transaction(&tx.raw)?;
        let raw = self.signer.sign_with_fee(&original, fee).await?;
        let decoded = self.chain.decode_transaction(&raw)?;
        if decoded.sender != tx.sender || decoded.nonce != tx.nonce || decoded.fee <= tx.fee {
            return Err(ChainCommunicationError::Signer(format!(
                "replacement does not keep sender and nonce with a higher fee: \
                 sender {:?}, nonce {}, fee {}",
                decoded.sender, decoded.nonce, decoded.fee
            )));
        }
        Ok(QueuedTransaction::replacement(tx, decoded, now))
    }
}
