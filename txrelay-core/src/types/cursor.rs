use serde::{Deserialize, Serialize};

/// How a cursor walks the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncMode {
    /// A bounded range of already produced blocks
    History,
    /// Follow new blocks forever
    Head,
}

/// Progress of one chain scan. `current_height` is the next block to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// store key
    pub id: u32,
    /// history or head
    pub mode: SyncMode,
    /// first height of the scan
    pub start_height: u64,
    /// next height to process
    pub current_height: u64,
    /// last height to process (inclusive), `None` follows the head
    pub target_height: Option<u64>,
    /// set when a history cursor went past its target
    pub done: bool,
}

impl SyncCursor {
    /// Scan `[start, target]` once.
    pub fn history(id: u32, start: u64, target: u64) -> Self {
        Self {
            id,
            mode: SyncMode::History,
            start_height: start,
            current_height: start,
            target_height: Some(target),
            done: start > target,
        }
    }

    /// Follow the chain from `start`.
    pub fn head(id: u32, start: u64) -> Self {
        Self {
            id,
            mode: SyncMode::Head,
            start_height: start,
            current_height: start,
            target_height: None,
            done: false,
        }
    }

    /// Turn an interrupted head scan into a bounded one ending at `target`,
    /// keeping its progress.
    pub fn bounded_at(self, target: u64) -> Self {
        Self {
            mode: SyncMode::History,
            target_height: Some(target),
            done: self.done || self.current_height > target,
            ..self
        }
    }

    /// Record that `current_height` was fully processed.
    pub fn advance(&mut self) {
        self.current_height += 1;
        if let Some(target) = self.target_height {
            if self.current_height > target {
                self.done = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_finishes_after_target() {
        let mut cursor = SyncCursor::history(1, 10, 11);
        assert!(!cursor.done);
        cursor.advance();
        assert_eq!(cursor.current_height, 11);
        assert!(!cursor.done);
        cursor.advance();
        assert!(cursor.done);
    }

    #[test]
    fn empty_range_is_done_immediately() {
        assert!(SyncCursor::history(1, 12, 11).done);
    }

    #[test]
    fn head_never_finishes() {
        let mut cursor = SyncCursor::head(2, 0);
        for _ in 0..100 {
            cursor.advance();
        }
        assert!(!cursor.done);
        assert_eq!(cursor.current_height, 100);
    }

    #[test]
    fn bounding_a_head_keeps_progress() {
        let mut cursor = SyncCursor::head(2, 5);
        cursor.advance();
        let bounded = cursor.bounded_at(9);
        assert_eq!(bounded.mode, SyncMode::History);
        assert_eq!(bounded.start_height, 5);
        assert_eq!(bounded.current_height, 6);
        assert!(!bounded.done);
        assert!(cursor.bounded_at(5).done);
    }
}
