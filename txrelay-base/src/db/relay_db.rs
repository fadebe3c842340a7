use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::WriteBatch;
use tracing::{debug, instrument, warn};

use txrelay_core::{
    Address, Confirmation, Decode, InvalidTransition, QueuedTransaction, Transition, TxHash, H256,
};

use super::{
    DbError, DbResult, FinalizeOutcome, QueueError, QueueResult, QueueStore, StatusFilter,
    TypedDB, DB,
};

// Keys must not be reused for another purpose: existing databases would
// decode them as the wrong type.
const TX_BY_HASH: &str = "tx_by_hash_";
const INDEX_BY_HASH: &str = "index_by_hash_";
const HASH_BY_INDEX: &str = "hash_by_index_";
const LIVE_HASH_BY_INDEX: &str = "live_hash_by_index_";
const IN_FLIGHT_BY_SENDER: &str = "in_flight_by_sender_";
const HASH_BY_SENDER_NONCE: &str = "hash_by_sender_nonce_";
const HIGHEST_INDEX: &str = "highest_index_";
pub(super) const CURSOR_BY_ID: &str = "cursor_by_id_";
pub(super) const HIGHEST_CURSOR_ID: &str = "highest_cursor_id_";

const ENTITY: &str = "relay";

/// Relay storage on top of rocksdb.
///
/// Writes are serialized through a store-wide lock and each operation lands
/// as one `WriteBatch`, so readers never observe half of a transition.
#[derive(Debug, Clone)]
pub struct RelayRocksDB {
    db: TypedDB,
    write_lock: Arc<Mutex<()>>,
}

impl std::ops::Deref for RelayRocksDB {
    type Target = TypedDB;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl RelayRocksDB {
    /// Instantiate a new `RelayRocksDB`
    pub fn new(db: DB) -> Self {
        Self {
            db: TypedDB::new(ENTITY.to_owned(), db),
            write_lock: Default::default(),
        }
    }

    pub(super) fn lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    fn retrieve_tx(&self, hash: &TxHash) -> DbResult<Option<QueuedTransaction>> {
        self.retrieve_value_by_key(TX_BY_HASH, hash)
    }

    fn require_tx(&self, hash: &TxHash) -> QueueResult<QueuedTransaction> {
        self.retrieve_tx(hash)?.ok_or(QueueError::NotFound(*hash))
    }

    fn require_index(&self, hash: &TxHash) -> DbResult<u64> {
        self.retrieve_value_by_key(INDEX_BY_HASH, hash)?
            .ok_or_else(|| DbError::Integrity(format!("no insertion index for {hash:?}")))
    }

    fn highest_index(&self) -> DbResult<u64> {
        self.retrieve_value_by_key(HIGHEST_INDEX, &())
            .map(|index: Option<u64>| index.unwrap_or_default())
    }

    /// Queue the writes that persist `tx` and keep the secondary indexes in
    /// line with its status.
    fn stage_record(&self, batch: &mut WriteBatch, index: u64, tx: &QueuedTransaction) {
        self.put_in_batch(batch, TX_BY_HASH, &tx.hash, tx);
        if tx.status.is_terminal() {
            self.delete_in_batch(batch, LIVE_HASH_BY_INDEX, &index);
        } else {
            self.put_in_batch(batch, LIVE_HASH_BY_INDEX, &index, &tx.hash);
        }
        let in_flight_key = (tx.sender, tx.hash);
        if tx.status.is_in_flight() {
            self.put_in_batch(batch, IN_FLIGHT_BY_SENDER, &in_flight_key, &());
        } else {
            self.delete_in_batch(batch, IN_FLIGHT_BY_SENDER, &in_flight_key);
        }
    }

    /// Queue the writes that admit `tx` under the next insertion index.
    /// Caller holds the write lock and has checked for duplicates.
    fn stage_new(&self, batch: &mut WriteBatch, next_index: u64, tx: &QueuedTransaction) {
        self.put_in_batch(batch, HIGHEST_INDEX, &(), &next_index);
        self.put_in_batch(batch, INDEX_BY_HASH, &tx.hash, &next_index);
        self.put_in_batch(batch, HASH_BY_INDEX, &next_index, &tx.hash);
        self.put_in_batch(
            batch,
            HASH_BY_SENDER_NONCE,
            &((tx.sender, tx.nonce), tx.hash),
            &(),
        );
        self.stage_record(batch, next_index, tx);
    }

    fn sibling_hashes(&self, sender: &Address, nonce: u64) -> DbResult<Vec<TxHash>> {
        use txrelay_core::Encode;

        let key_prefix = (*sender, nonce).to_vec();
        self.scan_values::<()>(HASH_BY_SENDER_NONCE, &key_prefix)?
            .into_iter()
            .map(|(key, ())| -> DbResult<TxHash> {
                Ok(H256::read_from(&key[key_prefix.len()..])?)
            })
            .collect()
    }

    /// Retrieve an entry by its insertion index
    pub fn retrieve_tx_by_index(&self, index: u64) -> DbResult<Option<QueuedTransaction>> {
        match self.retrieve_value_by_key::<_, TxHash>(HASH_BY_INDEX, &index)? {
            Some(hash) => self.retrieve_tx(&hash),
            None => Ok(None),
        }
    }
}

fn invalid(hash: TxHash, source: InvalidTransition) -> QueueError {
    QueueError::InvalidTransition { hash, source }
}

#[async_trait]
impl QueueStore for RelayRocksDB {
    #[instrument(skip_all, fields(tx_hash = ?tx.hash))]
    async fn create(&self, tx: &QueuedTransaction) -> QueueResult<u64> {
        let _guard = self.lock();
        if self.retrieve_tx(&tx.hash)?.is_some() {
            return Err(QueueError::Duplicate(tx.hash));
        }
        let index = self.highest_index()? + 1;
        let mut batch = WriteBatch::default();
        self.stage_new(&mut batch, index, tx);
        self.write(batch)?;
        debug!(index, sender = ?tx.sender, nonce = tx.nonce, "Stored new transaction");
        Ok(index)
    }

    async fn retrieve(&self, hash: &TxHash) -> QueueResult<Option<QueuedTransaction>> {
        Ok(self.retrieve_tx(hash)?)
    }

    async fn transition(
        &self,
        hash: &TxHash,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> QueueResult<QueuedTransaction> {
        let _guard = self.lock();
        let mut tx = self.require_tx(hash)?;
        let index = self.require_index(hash)?;
        tx.transition(transition).map_err(|e| invalid(*hash, e))?;
        if matches!(transition, Transition::Submitted | Transition::LocalError) {
            tx.last_attempt_at = Some(now);
        }
        let mut batch = WriteBatch::default();
        self.stage_record(&mut batch, index, &tx);
        self.write(batch)?;
        debug!(tx_hash = ?hash, ?transition, status = ?tx.status, "Updated transaction status");
        Ok(tx)
    }

    async fn list_upcoming(&self, filter: &StatusFilter) -> QueueResult<Vec<QueuedTransaction>> {
        let _guard = self.lock();
        let mut batch = WriteBatch::default();
        let mut matched = vec![];
        for (key, hash) in self.scan_values::<TxHash>(LIVE_HASH_BY_INDEX, &[])? {
            if filter.limit.is_some_and(|limit| matched.len() >= limit) {
                break;
            }
            let index = u64::read_from(&key).map_err(DbError::from)?;
            let mut tx = self.retrieve_tx(&hash)?.ok_or_else(|| {
                DbError::Integrity(format!(
                    "live index {index} points at missing transaction {hash:?}"
                ))
            })?;
            if !filter.matches(&tx) {
                continue;
            }
            if filter.requeue {
                tx.transition(Transition::Requeue)
                    .map_err(|e| invalid(hash, e))?;
                self.stage_record(&mut batch, index, &tx);
            }
            matched.push(tx);
        }
        if filter.requeue && !matched.is_empty() {
            self.write(batch)?;
            debug!(count = matched.len(), "Requeued failed transactions");
        }
        Ok(matched)
    }

    async fn count_in_flight(&self, sender: &Address) -> QueueResult<usize> {
        Ok(self.count_keys(IN_FLIGHT_BY_SENDER, sender.as_bytes())?)
    }

    async fn siblings(&self, sender: &Address, nonce: u64) -> QueueResult<Vec<QueuedTransaction>> {
        self.sibling_hashes(sender, nonce)?
            .iter()
            .map(|hash| -> QueueResult<QueuedTransaction> {
                self.retrieve_tx(hash)?.ok_or_else(|| {
                    QueueError::Db(DbError::Integrity(format!(
                        "nonce index points at missing transaction {hash:?}"
                    )))
                })
            })
            .collect()
    }

    #[instrument(skip_all, fields(stale = ?stale, replacement = ?replacement.hash))]
    async fn replace(
        &self,
        stale: &TxHash,
        replacement: &QueuedTransaction,
    ) -> QueueResult<QueuedTransaction> {
        let _guard = self.lock();
        if self.retrieve_tx(&replacement.hash)?.is_some() {
            return Err(QueueError::Duplicate(replacement.hash));
        }
        let mut old = self.require_tx(stale)?;
        if !old.status.is_in_flight() {
            return Err(invalid(
                *stale,
                InvalidTransition {
                    from: old.status.flags(),
                    transition: Transition::Supersede,
                },
            ));
        }
        let old_index = self.require_index(stale)?;
        old.transition(Transition::Supersede)
            .map_err(|e| invalid(*stale, e))?;
        old.superseded_by = Some(replacement.hash);

        let mut batch = WriteBatch::default();
        self.stage_record(&mut batch, old_index, &old);
        self.stage_new(&mut batch, self.highest_index()? + 1, replacement);
        self.write(batch)?;
        debug!(nonce = old.nonce, fee = %replacement.fee, "Superseded in-flight transaction");
        Ok(old)
    }

    #[instrument(skip(self))]
    async fn finalize(
        &self,
        hash: &TxHash,
        confirmation: Confirmation,
        success: bool,
    ) -> QueueResult<FinalizeOutcome> {
        let _guard = self.lock();
        let Some(mut tx) = self.retrieve_tx(hash)? else {
            return Ok(FinalizeOutcome::NotLocal);
        };
        if tx.confirmation.is_some() {
            return Ok(FinalizeOutcome::Unchanged(tx));
        }

        let mut batch = WriteBatch::default();
        if tx.status.is_terminal() {
            // mined although it had been superseded or failed earlier
            warn!(tx_hash = ?hash, status = ?tx.status, "Terminal transaction seen on chain");
        } else {
            tx.transition(Transition::Finalize { success })
                .map_err(|e| invalid(*hash, e))?;
        }
        tx.confirmation = Some(confirmation);
        self.stage_record(&mut batch, self.require_index(hash)?, &tx);

        let mut obsoleted = vec![];
        for sibling_hash in self.sibling_hashes(&tx.sender, tx.nonce)? {
            if sibling_hash == *hash {
                continue;
            }
            let mut sibling = self.require_tx(&sibling_hash)?;
            if sibling.status.is_terminal() {
                continue;
            }
            sibling
                .transition(Transition::Finalize { success: false })
                .map_err(|e| invalid(sibling_hash, e))?;
            self.stage_record(&mut batch, self.require_index(&sibling_hash)?, &sibling);
            obsoleted.push(sibling_hash);
        }

        self.write(batch)?;
        Ok(FinalizeOutcome::Finalized { tx, obsoleted })
    }

    async fn release_reservations(&self, now: DateTime<Utc>) -> QueueResult<Vec<TxHash>> {
        use txrelay_core::StatusFlag;

        let _guard = self.lock();
        let mut batch = WriteBatch::default();
        let mut released = vec![];
        for (key, hash) in self.scan_values::<TxHash>(LIVE_HASH_BY_INDEX, &[])? {
            let index = u64::read_from(&key).map_err(DbError::from)?;
            let mut tx = self.require_tx(&hash)?;
            if !tx.status.has(StatusFlag::Reserved) {
                continue;
            }
            tx.transition(Transition::LocalError)
                .map_err(|e| invalid(hash, e))?;
            tx.last_attempt_at = Some(now);
            self.stage_record(&mut batch, index, &tx);
            released.push(hash);
        }
        if !released.is_empty() {
            self.write(batch)?;
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use txrelay_core::{DecodedTransaction, StatusFlag, H160, U256};

    use super::*;

    fn tmp_db() -> (tempfile::TempDir, RelayRocksDB) {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = DB::from_path(temp_dir.path()).unwrap();
        (temp_dir, RelayRocksDB::new(db))
    }

    fn queued(sender: u8, nonce: u64, tag: u8) -> QueuedTransaction {
        let decoded = DecodedTransaction::new(
            H256::from_low_u64_be(((sender as u64) << 32) | (nonce << 8) | tag as u64),
            H160::repeat_byte(sender),
            Some(H160::repeat_byte(0xaa)),
            nonce,
            U256::from(100u64),
            vec![sender, nonce as u8, tag],
        );
        QueuedTransaction::new(decoded, Utc::now() - Duration::seconds(600))
    }

    async fn submit(db: &RelayRocksDB, hash: &TxHash) -> QueuedTransaction {
        db.transition(hash, Transition::Reserve, Utc::now()).await.unwrap();
        db.transition(hash, Transition::Submitted, Utc::now())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected_and_keeps_one_record() {
        let (_dir, db) = tmp_db();
        let tx = queued(1, 0, 0);
        assert_eq!(db.create(&tx).await.unwrap(), 1);
        assert!(matches!(
            db.create(&tx).await,
            Err(QueueError::Duplicate(hash)) if hash == tx.hash
        ));
        let all = db.list_upcoming(&StatusFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(db.retrieve_tx_by_index(2).unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_transition_writes_nothing() {
        let (_dir, db) = tmp_db();
        let tx = queued(1, 0, 0);
        db.create(&tx).await.unwrap();
        let err = db
            .transition(&tx.hash, Transition::Submitted, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        let stored = db.retrieve(&tx.hash).await.unwrap().unwrap();
        assert_eq!(stored, tx);
    }

    #[tokio::test]
    async fn unknown_hash_is_not_found() {
        let (_dir, db) = tmp_db();
        let err = db
            .transition(&H256::zero(), Transition::Reserve, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn dispatchable_listing_is_in_insertion_order() {
        let (_dir, db) = tmp_db();
        let txs = [queued(2, 1, 0), queued(1, 0, 0), queued(2, 0, 0)];
        for tx in &txs {
            db.create(tx).await.unwrap();
        }
        db.transition(&txs[1].hash, Transition::Reserve, Utc::now())
            .await
            .unwrap();

        let listed = db
            .list_upcoming(&StatusFilter::dispatchable())
            .await
            .unwrap();
        let hashes: Vec<_> = listed.iter().map(|tx| tx.hash).collect();
        assert_eq!(hashes, vec![txs[0].hash, txs[2].hash]);

        let limited = db
            .list_upcoming(&StatusFilter::dispatchable().with_limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn failed_entries_are_requeued_once() {
        let (_dir, db) = tmp_db();
        let tx = queued(1, 0, 0);
        db.create(&tx).await.unwrap();
        db.transition(&tx.hash, Transition::Reserve, Utc::now())
            .await
            .unwrap();
        let failed_at = Utc::now() - Duration::seconds(120);
        db.transition(&tx.hash, Transition::LocalError, failed_at)
            .await
            .unwrap();

        // too recent for a 300s threshold
        let recent = db
            .list_upcoming(&StatusFilter::failed_before(Utc::now() - Duration::seconds(300)))
            .await
            .unwrap();
        assert!(recent.is_empty());

        let cutoff = Utc::now() - Duration::seconds(60);
        let first = db
            .list_upcoming(&StatusFilter::failed_before(cutoff))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].status.has(StatusFlag::Queued));
        assert!(!first[0].status.has(StatusFlag::LocalError));

        let second = db
            .list_upcoming(&StatusFilter::failed_before(cutoff))
            .await
            .unwrap();
        assert!(second.is_empty());
        let stored = db.retrieve(&tx.hash).await.unwrap().unwrap();
        assert!(stored.status.has(StatusFlag::Queued));
    }

    #[tokio::test]
    async fn in_flight_count_follows_status() {
        let (_dir, db) = tmp_db();
        let sender = H160::repeat_byte(1);
        let a = queued(1, 0, 0);
        let b = queued(1, 1, 0);
        let other = queued(2, 0, 0);
        for tx in [&a, &b, &other] {
            db.create(tx).await.unwrap();
        }
        assert_eq!(db.count_in_flight(&sender).await.unwrap(), 0);

        submit(&db, &a.hash).await;
        submit(&db, &b.hash).await;
        submit(&db, &other.hash).await;
        assert_eq!(db.count_in_flight(&sender).await.unwrap(), 2);

        db.finalize(&a.hash, Confirmation::new(10, 0), true)
            .await
            .unwrap();
        assert_eq!(db.count_in_flight(&sender).await.unwrap(), 1);
        assert_eq!(
            db.count_in_flight(&H160::repeat_byte(2)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn replace_supersedes_and_admits_atomically() {
        let (_dir, db) = tmp_db();
        let stale = queued(1, 5, 0);
        db.create(&stale).await.unwrap();
        submit(&db, &stale.hash).await;

        let mut bumped = queued(1, 5, 1);
        bumped.fee = U256::from(110u64);
        bumped.replaces = Some(stale.hash);
        let old = db.replace(&stale.hash, &bumped).await.unwrap();
        assert!(old.status.has(StatusFlag::Obsolete));
        assert_eq!(old.superseded_by, Some(bumped.hash));

        let siblings = db.siblings(&stale.sender, 5).await.unwrap();
        assert_eq!(siblings.len(), 2);
        assert_eq!(db.count_in_flight(&stale.sender).await.unwrap(), 0);

        // the stale entry is no longer in flight so it cannot be replaced again
        let again = queued(1, 5, 2);
        assert!(matches!(
            db.replace(&stale.hash, &again).await,
            Err(QueueError::InvalidTransition { .. })
        ));
        assert!(db.retrieve(&again.hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finalize_is_idempotent_and_obsoletes_siblings() {
        let (_dir, db) = tmp_db();
        let original = queued(1, 3, 0);
        let replacement = queued(1, 3, 1);
        db.create(&original).await.unwrap();
        submit(&db, &original.hash).await;
        db.replace(&original.hash, &replacement).await.unwrap();

        // the replacement is mined
        let outcome = db
            .finalize(&replacement.hash, Confirmation::new(42, 7), true)
            .await
            .unwrap();
        let FinalizeOutcome::Finalized { tx, obsoleted } = outcome else {
            panic!("expected finalization, got {outcome:?}");
        };
        assert!(tx.status.has(StatusFlag::Final));
        assert_eq!(tx.confirmation, Some(Confirmation::new(42, 7)));
        assert!(obsoleted.is_empty());

        let again = db
            .finalize(&replacement.hash, Confirmation::new(42, 7), true)
            .await
            .unwrap();
        assert!(matches!(again, FinalizeOutcome::Unchanged(ref t) if t == &tx));

        assert_eq!(
            db.finalize(&H256::repeat_byte(9), Confirmation::new(1, 0), true)
                .await
                .unwrap(),
            FinalizeOutcome::NotLocal
        );
    }

    #[tokio::test]
    async fn mined_original_obsoletes_pending_replacement() {
        let (_dir, db) = tmp_db();
        let original = queued(1, 3, 0);
        let replacement = queued(1, 3, 1);
        db.create(&original).await.unwrap();
        submit(&db, &original.hash).await;
        db.replace(&original.hash, &replacement).await.unwrap();

        let outcome = db
            .finalize(&original.hash, Confirmation::new(50, 1), true)
            .await
            .unwrap();
        let FinalizeOutcome::Finalized { tx, obsoleted } = outcome else {
            panic!("expected finalization, got {outcome:?}");
        };
        // status stays as superseded, the confirmation is still recorded
        assert!(tx.status.has(StatusFlag::Obsolete));
        assert_eq!(tx.confirmation, Some(Confirmation::new(50, 1)));
        assert_eq!(obsoleted, vec![replacement.hash]);
        let replaced = db.retrieve(&replacement.hash).await.unwrap().unwrap();
        assert!(replaced.status.is_terminal());
        assert!(db
            .list_upcoming(&StatusFilter::dispatchable())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reservations_are_released() {
        let (_dir, db) = tmp_db();
        let tx = queued(1, 0, 0);
        db.create(&tx).await.unwrap();
        db.transition(&tx.hash, Transition::Reserve, Utc::now())
            .await
            .unwrap();
        let released = db.release_reservations(Utc::now()).await.unwrap();
        assert_eq!(released, vec![tx.hash]);
        let stored = db.retrieve(&tx.hash).await.unwrap().unwrap();
        assert!(stored.status.has(StatusFlag::LocalError));
        assert!(db.release_reservations(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dangling_live_entry_is_an_integrity_error() {
        let (_dir, db) = tmp_db();
        db.store_value_by_key(LIVE_HASH_BY_INDEX, &1u64, &H256::repeat_byte(3))
            .unwrap();
        let err = db
            .list_upcoming(&StatusFilter::dispatchable())
            .await
            .unwrap_err();
        assert!(err.is_integrity());
    }
}
