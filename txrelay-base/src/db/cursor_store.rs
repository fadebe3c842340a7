use std::fmt::Debug;

use async_trait::async_trait;

use txrelay_core::SyncCursor;

use super::relay_db::{CURSOR_BY_ID, HIGHEST_CURSOR_ID};
use super::{DbResult, RelayRocksDB};

/// Durable storage for sync cursors.
#[async_trait]
pub trait CursorStore: Send + Sync + Debug {
    /// Insert or overwrite a cursor
    async fn store_cursor(&self, cursor: &SyncCursor) -> DbResult<()>;

    /// Every stored cursor, ordered by id
    async fn retrieve_cursors(&self) -> DbResult<Vec<SyncCursor>>;

    /// Allocate a fresh cursor id
    async fn next_cursor_id(&self) -> DbResult<u32>;
}

#[async_trait]
impl CursorStore for RelayRocksDB {
    async fn store_cursor(&self, cursor: &SyncCursor) -> DbResult<()> {
        self.store_value_by_key(CURSOR_BY_ID, &cursor.id, cursor)
    }

    async fn retrieve_cursors(&self) -> DbResult<Vec<SyncCursor>> {
        Ok(self
            .scan_values::<SyncCursor>(CURSOR_BY_ID, &[])?
            .into_iter()
            .map(|(_, cursor)| cursor)
            .collect())
    }

    async fn next_cursor_id(&self) -> DbResult<u32> {
        let _guard = self.lock();
        let id = self
            .retrieve_value_by_key(HIGHEST_CURSOR_ID, &())?
            .map_or(1, |highest: u32| highest + 1);
        self.store_value_by_key(HIGHEST_CURSOR_ID, &(), &id)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DB;

    #[tokio::test]
    async fn cursors_round_trip_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = RelayRocksDB::new(DB::from_path(dir.path()).unwrap());

        let first = db.next_cursor_id().await.unwrap();
        let second = db.next_cursor_id().await.unwrap();
        assert_eq!((first, second), (1, 2));

        let mut head = SyncCursor::head(second, 100);
        db.store_cursor(&head).await.unwrap();
        db.store_cursor(&SyncCursor::history(first, 0, 99)).await.unwrap();
        head.advance();
        db.store_cursor(&head).await.unwrap();

        let cursors = db.retrieve_cursors().await.unwrap();
        assert_eq!(cursors.len(), 2);
        assert_eq!(cursors[0].id, first);
        assert_eq!(cursors[1], head);
    }
}
