use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use txrelay_core::{Block, BlockTransaction, ChainCommunicationError, ChainInterface, SyncCursor};

use crate::db::{CursorStore, DbError, QueueError};
use crate::RelayMetrics;

// minimum sleep duration after a failed step to avoid busy waiting
const MIN_SLEEP_DURATION: Duration = Duration::from_millis(100);

/// Errors raised while scanning blocks
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A history cursor went past its target. Not a failure.
    #[error("Cursor {0} reached its target height")]
    SyncDone(u32),
    /// Talking to the node failed
    #[error(transparent)]
    Chain(#[from] ChainCommunicationError),
    /// Cursor storage failed
    #[error(transparent)]
    Db(#[from] DbError),
    /// A filter's queue update failed
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl SyncError {
    /// The same block can be tried again later
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Chain(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Storage is broken, the scan cannot continue
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Db(_) | SyncError::Queue(QueueError::Db(_)))
    }
}

/// Hook run for every transaction of every scanned block.
///
/// Blocks are re-processed after a crash, so filters must be idempotent.
#[async_trait]
pub trait SyncFilter: Send + Sync + Debug {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Inspect `tx`. Returns whether the transaction was relevant.
    async fn filter(
        &self,
        chain: &dyn ChainInterface,
        block: &Block,
        tx: &BlockTransaction,
    ) -> Result<bool, SyncError>;
}

enum Step {
    /// One block processed and persisted
    Advanced,
    /// The next block does not exist yet
    Waiting,
}

/// Walks blocks along persisted cursors and feeds their transactions to the
/// registered filters.
#[derive(Debug)]
pub struct ChainSyncer {
    chain: Arc<dyn ChainInterface>,
    store: Arc<dyn CursorStore>,
    filters: Vec<Arc<dyn SyncFilter>>,
    interval: Duration,
    metrics: Arc<RelayMetrics>,
    cancel: CancellationToken,
}

impl ChainSyncer {
    /// A syncer polling every `interval` once caught up.
    pub fn new(
        chain: Arc<dyn ChainInterface>,
        store: Arc<dyn CursorStore>,
        filters: Vec<Arc<dyn SyncFilter>>,
        interval: Duration,
        metrics: Arc<RelayMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            chain,
            store,
            filters,
            interval,
            metrics,
            cancel,
        }
    }

    /// Decide which cursors to run, persisting any new ones.
    ///
    /// Persisted unfinished cursors are resumed. A persisted head cursor is
    /// bounded at the current latest height and a fresh head cursor starts
    /// right after it, so nothing between the old head and now is skipped.
    /// Without persisted cursors a history cursor covers
    /// `[history_start, latest]` (unless `skip_history`) and a head cursor
    /// starts at `latest + 1`.
    pub async fn prepare_cursors(
        &self,
        history_start: u64,
        skip_history: bool,
    ) -> Result<Vec<SyncCursor>, SyncError> {
        let latest = self.chain.latest_block_number().await?;
        let existing = self.store.retrieve_cursors().await?;

        let mut cursors = vec![];
        if existing.is_empty() {
            if skip_history {
                info!(latest, "Skipping history sync");
            } else {
                let id = self.store.next_cursor_id().await?;
                let history = SyncCursor::history(id, history_start, latest);
                info!(id, start = history_start, target = latest, "Creating history cursor");
                cursors.push(history);
            }
        } else {
            for cursor in existing {
                let cursor = if cursor.target_height.is_none() {
                    let bounded = cursor.bounded_at(latest);
                    info!(id = cursor.id, from = cursor.current_height, target = latest, "Bounding interrupted head cursor");
                    if bounded.done {
                        // the old head record must not be bounded again at a later height
                        self.store.store_cursor(&bounded).await?;
                    }
                    bounded
                } else {
                    cursor
                };
                if cursor.done {
                    trace!(id = cursor.id, "Cursor already done");
                    continue;
                }
                info!(id = cursor.id, height = cursor.current_height, target = ?cursor.target_height, "Resuming cursor");
                cursors.push(cursor);
            }
        }

        let head = SyncCursor::head(self.store.next_cursor_id().await?, latest + 1);
        info!(id = head.id, start = head.start_height, "Creating head cursor");
        cursors.push(head);

        for cursor in &cursors {
            self.store.store_cursor(cursor).await?;
        }
        Ok(cursors)
    }

    /// Run every cursor in its own task.
    pub fn spawn(self: Arc<Self>, cursors: Vec<SyncCursor>) -> Vec<JoinHandle<Result<SyncCursor, SyncError>>> {
        cursors
            .into_iter()
            .map(|cursor| {
                let syncer = self.clone();
                let span = info_span!("sync", id = cursor.id, mode = %cursor.mode);
                tokio::spawn(async move { syncer.sync_cursor(cursor).await }.instrument(span))
            })
            .collect()
    }

    /// Scan along `cursor` until it is done, cancelled or hits a fatal
    /// error. Returns the cursor's final state.
    pub async fn sync_cursor(&self, mut cursor: SyncCursor) -> Result<SyncCursor, SyncError> {
        let mut attempt_count: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                debug!(height = cursor.current_height, "Sync cancelled");
                return Ok(cursor);
            }

            let sleep_duration = match self.step(&mut cursor).await {
                Ok(Step::Advanced) => {
                    attempt_count = 0;
                    continue;
                }
                Ok(Step::Waiting) => {
                    attempt_count = 0;
                    self.interval
                }
                Err(SyncError::SyncDone(id)) => {
                    info!(id, height = cursor.current_height, "History sync done");
                    return Ok(cursor);
                }
                Err(err) if err.is_fatal() => {
                    error!(?err, height = cursor.current_height, "Sync stopped");
                    return Err(err);
                }
                Err(err) => {
                    // backoff = MIN_SLEEP_DURATION * 2^attempt_count, capped at the poll interval
                    attempt_count = attempt_count.saturating_add(1);
                    let backoff = MIN_SLEEP_DURATION
                        .checked_mul(1 << attempt_count.min(16))
                        .unwrap_or(self.interval);
                    warn!(?err, height = cursor.current_height, attempt_count, "Failed to sync block, retrying");
                    std::cmp::min(backoff, self.interval.max(MIN_SLEEP_DURATION))
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(height = cursor.current_height, "Sync cancelled");
                    return Ok(cursor);
                }
                _ = sleep(sleep_duration) => {}
            }
        }
    }

    async fn step(&self, cursor: &mut SyncCursor) -> Result<Step, SyncError> {
        if cursor.done {
            return Err(SyncError::SyncDone(cursor.id));
        }
        let height = cursor.current_height;
        let Some(block) = self.chain.block_by_number(height).await? else {
            trace!(height, "Block not produced yet");
            return Ok(Step::Waiting);
        };
        self.process_block(&block).await?;

        // persisted only after every filter ran, a crash re-processes the block
        cursor.advance();
        self.store.store_cursor(cursor).await?;
        self.metrics
            .sync_height
            .with_label_values(&[cursor.mode.to_string().as_str()])
            .set(cursor.current_height.try_into().unwrap_or(i64::MAX));
        Ok(Step::Advanced)
    }

    /// Run every filter on every transaction of `block`.
    ///
    /// A failure for one transaction is logged and skipped unless it is
    /// retryable (the whole block is tried again) or fatal.
    pub async fn process_block(&self, block: &Block) -> Result<(), SyncError> {
        trace!(height = block.number, txs = block.transactions.len(), "Processing block");
        for tx in &block.transactions {
            for filter in &self.filters {
                match filter.filter(self.chain.as_ref(), block, tx).await {
                    Ok(true) => debug!(filter = filter.name(), tx_hash = ?tx.hash, height = block.number, "Filter matched"),
                    Ok(false) => {}
                    Err(err) if err.is_retryable() || err.is_fatal() => return Err(err),
                    Err(err) => {
                        warn!(?err, filter = filter.name(), tx_hash = ?tx.hash, height = block.number, "Filter failed, skipping transaction");
                    }
                }
            }
        }
        Ok(())
    }
}
