use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use derive_new::new;
use itertools::Itertools;
use tracing::{debug, info, instrument, warn};

use txrelay_base::{
    db::{QueueError, QueueResult, QueueStore, StatusFilter},
    RelayMetrics,
};
use txrelay_core::{Address, ChainInterface, QueuedTransaction, Transition};

use crate::RelayError;

/// `now - age`, or the beginning of time if that underflows.
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Remaining submission budget per sender for one dispatch pass.
///
/// A sender's budget is computed from the store the first time the sender
/// shows up in the pass and only decremented locally afterwards.
#[derive(Debug)]
pub struct InFlightCounter<'a> {
    store: &'a dyn QueueStore,
    limit: usize,
    budgets: HashMap<Address, usize>,
}

impl<'a> InFlightCounter<'a> {
    /// An empty counter allowing `limit` in-flight transactions per sender
    pub fn new(store: &'a dyn QueueStore, limit: usize) -> Self {
        Self {
            store,
            limit,
            budgets: HashMap::new(),
        }
    }

    /// Submissions `sender` may still make in this pass
    pub async fn remaining(&mut self, sender: &Address) -> QueueResult<usize> {
        if let Some(budget) = self.budgets.get(sender) {
            return Ok(*budget);
        }
        let in_flight = self.store.count_in_flight(sender).await?;
        let budget = self.limit.saturating_sub(in_flight);
        debug!(?sender, in_flight, budget, "Computed sender budget");
        self.budgets.insert(*sender, budget);
        Ok(budget)
    }

    /// Record one successful submission for `sender`
    pub fn consume(&mut self, sender: &Address) {
        if let Some(budget) = self.budgets.get_mut(sender) {
            *budget = budget.saturating_sub(1);
        }
    }
}

/// Submits queued transactions to the node under a per-sender in-flight cap.
#[derive(new, Debug)]
pub struct Dispatcher {
    chain: Arc<dyn ChainInterface>,
    store: Arc<dyn QueueStore>,
    inflight_limit: usize,
    batch_limit: Option<usize>,
    error_threshold: Duration,
    metrics: Arc<RelayMetrics>,
}

impl Dispatcher {
    /// Run one dispatch pass and return the number of submissions the node
    /// accepted.
    ///
    /// Failed entries older than the error threshold are queued again first.
    /// Candidates are submitted per sender in nonce order; after a failed
    /// submission the sender's later nonces wait for the next pass. Only
    /// storage errors abort the pass.
    #[instrument(skip_all)]
    pub async fn process(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let requeued = self
            .store
            .list_upcoming(&StatusFilter::failed_before(cutoff(now, self.error_threshold)))
            .await?;
        if !requeued.is_empty() {
            info!(count = requeued.len(), "Requeued failed transactions");
        }

        let mut filter = StatusFilter::dispatchable();
        if let Some(limit) = self.batch_limit {
            filter = filter.with_limit(limit);
        }
        let candidates = self.store.list_upcoming(&filter).await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut counter = InFlightCounter::new(self.store.as_ref(), self.inflight_limit);
        let mut blocked: HashSet<Address> = HashSet::new();
        let mut dispatched = 0;
        for tx in order_by_sender(candidates) {
            if blocked.contains(&tx.sender) {
                debug!(tx_hash = ?tx.hash, sender = ?tx.sender, "Sender blocked for this pass");
                continue;
            }
            if counter.remaining(&tx.sender).await? == 0 {
                debug!(tx_hash = ?tx.hash, sender = ?tx.sender, "Sender at in-flight limit");
                continue;
            }
            match self.submit(&tx, now).await {
                Ok(true) => {
                    counter.consume(&tx.sender);
                    dispatched += 1;
                }
                Ok(false) => {
                    blocked.insert(tx.sender);
                }
                Err(err) => return Err(err),
            }
        }
        if dispatched > 0 {
            info!(dispatched, "Dispatch pass done");
        }
        Ok(dispatched)
    }

    /// Reserve and submit one entry. Returns whether the node accepted it.
    #[instrument(skip_all, fields(tx_hash = ?tx.hash, nonce = tx.nonce))]
    async fn submit(&self, tx: &QueuedTransaction, now: DateTime<Utc>) -> QueueResult<bool> {
        match self.store.transition(&tx.hash, Transition::Reserve, now).await {
            Ok(_) => {}
            Err(err @ QueueError::Db(_)) => return Err(err),
            Err(err) => {
                warn!(?err, "Could not reserve transaction, skipping");
                return Ok(false);
            }
        }

        match self.chain.send_raw_transaction(&tx.raw).await {
            Ok(_) => {
                self.store
                    .transition(&tx.hash, Transition::Submitted, now)
                    .await?;
                self.metrics.transactions_dispatched.inc();
                debug!("Submitted transaction");
                Ok(true)
            }
            Err(err) => {
                let err = RelayError::Submission(err);
                warn!(error = %err, sender = ?tx.sender, "Submission failed");
                self.store
                    .transition(&tx.hash, Transition::LocalError, now)
                    .await?;
                self.metrics.dispatch_failures.inc();
                Ok(false)
            }
        }
    }
}

/// Group candidates by sender, senders in order of first appearance, each
/// sender's entries by ascending nonce.
fn order_by_sender(candidates: Vec<QueuedTransaction>) -> Vec<QueuedTransaction> {
    let mut first_seen: HashMap<Address, usize> = HashMap::new();
    for (position, tx) in candidates.iter().enumerate() {
        first_seen.entry(tx.sender).or_insert(position);
    }
    candidates
        .into_iter()
        .sorted_by_key(|tx| (first_seen.get(&tx.sender).copied().unwrap_or_default(), tx.nonce))
        .collect()
}
