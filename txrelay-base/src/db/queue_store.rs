use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use txrelay_core::{
    Address, Confirmation, InvalidTransition, QueuedTransaction, StatusFlag, StatusSet,
    Transition, TxHash,
};

use super::DbError;

/// Queue store result type
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The hash is already known, terminal or not
    #[error("Transaction {0:?} is already queued")]
    Duplicate(TxHash),
    /// No record for this hash
    #[error("Transaction {0:?} is not in the queue")]
    NotFound(TxHash),
    /// The record's current status does not allow the change
    #[error("Transaction {hash:?}: {source}")]
    InvalidTransition {
        /// the record
        hash: TxHash,
        /// what was attempted
        #[source]
        source: InvalidTransition,
    },
    /// Storage failure
    #[error(transparent)]
    Db(#[from] DbError),
}

impl QueueError {
    /// Whether the store itself is inconsistent
    pub fn is_integrity(&self) -> bool {
        matches!(self, QueueError::Db(DbError::Integrity(_)))
    }
}

/// Selection criteria for [`QueueStore::list_upcoming`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFilter {
    /// every one of these flags must be set
    pub include: StatusSet,
    /// none of these flags may be set
    pub exclude: StatusSet,
    /// only entries whose last activity is strictly before this instant
    pub older_than: Option<DateTime<Utc>>,
    /// re-flag matches from LOCAL_ERROR to QUEUED in the same write
    pub requeue: bool,
    /// stop after this many matches
    pub limit: Option<usize>,
}

impl StatusFilter {
    /// Entries waiting for their first (or next) submission
    pub fn dispatchable() -> Self {
        Self {
            include: StatusFlag::Queued.into(),
            exclude: StatusSet::of(&[StatusFlag::Reserved, StatusFlag::Final, StatusFlag::Obsolete]),
            ..Default::default()
        }
    }

    /// Failed entries whose last attempt is older than `cutoff`, requeued on
    /// retrieval so a second listing does not return them again
    pub fn failed_before(cutoff: DateTime<Utc>) -> Self {
        Self {
            include: StatusFlag::LocalError.into(),
            exclude: StatusSet::TERMINAL,
            older_than: Some(cutoff),
            requeue: true,
            limit: None,
        }
    }

    /// In-flight entries submitted before `cutoff`
    pub fn pending_before(cutoff: DateTime<Utc>) -> Self {
        Self {
            include: StatusFlag::InNetwork.into(),
            exclude: StatusSet::TERMINAL,
            older_than: Some(cutoff),
            requeue: false,
            limit: None,
        }
    }

    /// Cap the number of returned entries
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `tx` satisfies the filter
    pub fn matches(&self, tx: &QueuedTransaction) -> bool {
        let flags = tx.status.flags();
        flags.contains_all(self.include)
            && !flags.intersects(self.exclude)
            && self
                .older_than
                .map_or(true, |cutoff| tx.last_activity() < cutoff)
    }
}

/// What [`QueueStore::finalize`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The hash was not admitted by this relay
    NotLocal,
    /// Already confirmed earlier, nothing written
    Unchanged(QueuedTransaction),
    /// Confirmation recorded, other entries for the same nonce obsoleted
    Finalized {
        /// the confirmed entry after the update
        tx: QueuedTransaction,
        /// siblings that became OBSOLETE
        obsoleted: Vec<TxHash>,
    },
}

/// Durable transaction queue.
///
/// Every mutating call is atomic: either all of its writes land or none do.
#[async_trait]
pub trait QueueStore: Send + Sync + Debug {
    /// Admit a new entry. Fails with [`QueueError::Duplicate`] if the hash is
    /// known. Returns the entry's insertion index.
    async fn create(&self, tx: &QueuedTransaction) -> QueueResult<u64>;

    /// Look an entry up by hash
    async fn retrieve(&self, hash: &TxHash) -> QueueResult<Option<QueuedTransaction>>;

    /// Apply a status transition. Submission outcomes also stamp
    /// `last_attempt_at` with `now`.
    async fn transition(
        &self,
        hash: &TxHash,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> QueueResult<QueuedTransaction>;

    /// Non-terminal entries matching `filter`, in insertion order.
    async fn list_upcoming(&self, filter: &StatusFilter) -> QueueResult<Vec<QueuedTransaction>>;

    /// Number of entries from `sender` that are in flight
    async fn count_in_flight(&self, sender: &Address) -> QueueResult<usize>;

    /// Every entry for `(sender, nonce)`, in no particular order
    async fn siblings(&self, sender: &Address, nonce: u64) -> QueueResult<Vec<QueuedTransaction>>;

    /// Mark the in-flight `stale` entry superseded by `replacement` and
    /// admit `replacement`, in one write.
    async fn replace(
        &self,
        stale: &TxHash,
        replacement: &QueuedTransaction,
    ) -> QueueResult<QueuedTransaction>;

    /// Record that `hash` was mined. Non-terminal entries become FINAL on
    /// success and OBSOLETE otherwise. Other non-terminal entries for the
    /// same nonce become OBSOLETE.
    async fn finalize(
        &self,
        hash: &TxHash,
        confirmation: Confirmation,
        success: bool,
    ) -> QueueResult<FinalizeOutcome>;

    /// Turn reservations left behind by an interrupted dispatch pass into
    /// local errors. Returns the affected hashes.
    async fn release_reservations(&self, now: DateTime<Utc>) -> QueueResult<Vec<TxHash>>;
}
