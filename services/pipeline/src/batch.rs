//! Per-item batch results.
//!
//! A queue delivers messages in batches but a batch is never atomic: each
//! item succeeds, is dropped, or is marked for redelivery on its own, and
//! the worker reports the whole batch as a [`BatchSummary`] instead of a
//! single pass/fail.

use serde::Serialize;
use uuid::Uuid;

/// What happened to a single message in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Handled to completion.
    Succeeded,
    /// Permanently unprocessable (validation failure, unknown id); the
    /// message is discarded and must not be redelivered.
    Dropped,
    /// Failed on infrastructure; the item should be redelivered.
    Retry,
}

/// Outcome of one message, keyed by its envelope id.
#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub message_id: Uuid,
    pub outcome: ItemOutcome,
    /// Short human-readable cause for dropped/retry items.
    pub detail: Option<String>,
}

/// Aggregated results for one delivered batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub items: Vec<ItemResult>,
}

impl BatchSummary {
    pub fn with_capacity(len: usize) -> Self {
        Self {
            items: Vec::with_capacity(len),
        }
    }

    pub fn record(&mut self, message_id: Uuid, outcome: ItemOutcome, detail: Option<String>) {
        self.items.push(ItemResult {
            message_id,
            outcome,
            detail,
        });
    }

    pub fn succeeded(&self) -> usize {
        self.count(ItemOutcome::Succeeded)
    }

    pub fn dropped(&self) -> usize {
        self.count(ItemOutcome::Dropped)
    }

    pub fn retries(&self) -> usize {
        self.count(ItemOutcome::Retry)
    }

    /// Ids of items that should be redelivered.
    pub fn retry_ids(&self) -> Vec<Uuid> {
        self.items
            .iter()
            .filter(|item| item.outcome == ItemOutcome::Retry)
            .map(|item| item.message_id)
            .collect()
    }

    fn count(&self, outcome: ItemOutcome) -> usize {
        self.items.iter().filter(|item| item.outcome == outcome).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = BatchSummary::with_capacity(3);
        let ok = Uuid::new_v4();
        let dropped = Uuid::new_v4();
        let retry = Uuid::new_v4();

        summary.record(ok, ItemOutcome::Succeeded, None);
        summary.record(dropped, ItemOutcome::Dropped, Some("bad payload".to_string()));
        summary.record(retry, ItemOutcome::Retry, Some("store unavailable".to_string()));

        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.dropped(), 1);
        assert_eq!(summary.retries(), 1);
        assert_eq!(summary.retry_ids(), vec![retry]);
    }
}
