//! Unread/badge aggregation
//!
//! Each badge category gets its own aggregator so schedule/link alert
//! counts and message-thread counts are never combined into one figure.
//! Counting is a full O(threads) sweep per query; counterpart sets are
//! tens, not thousands, so incremental bookkeeping is not worth having.

use dashmap::DashMap;

use crate::types::{AlertRecord, AlertStatus, ThreadWatermark};

/// A thread contributes 1 when its last message is newer than the
/// reader's last-read watermark and was not sent by the reader.
pub fn unread_count(threads: &[ThreadWatermark], reader_id: &str) -> usize {
    threads
        .iter()
        .filter(|w| w.last_message_sender_id != reader_id)
        .filter(|w| match w.last_read_at {
            Some(read) => w.last_message_at > read,
            None => true,
        })
        .count()
}

/// Unread records in a reconciled alert array.
pub fn unread_alerts(records: &[AlertRecord]) -> usize {
    records.iter().filter(|r| r.status == AlertStatus::Unread).count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BadgeCategory {
    Alerts,
    Messages,
}

/// Watermark cache for one badge category.
///
/// Threads are registered when their counterpart is linked and removed on
/// unlink, so a departed counterpart can never hold the badge up.
pub struct BadgeAggregator {
    category: BadgeCategory,
    watermarks: DashMap<String, Option<ThreadWatermark>>,
}

impl BadgeAggregator {
    pub fn new(category: BadgeCategory) -> Self {
        Self { category, watermarks: DashMap::new() }
    }

    pub fn category(&self) -> BadgeCategory {
        self.category
    }

    /// Ensure a thread slot exists (no watermark seen yet).
    pub fn register(&self, thread_id: &str) {
        self.watermarks.entry(thread_id.to_string()).or_insert(None);
    }

    /// Record the latest watermark for a thread.
    pub fn upsert(&self, watermark: ThreadWatermark) {
        self.watermarks.insert(watermark.thread_id.clone(), Some(watermark));
    }

    pub fn remove(&self, thread_id: &str) {
        self.watermarks.remove(thread_id);
    }

    pub fn thread_count(&self) -> usize {
        self.watermarks.len()
    }

    pub fn count(&self, reader_id: &str) -> usize {
        let threads: Vec<ThreadWatermark> = self
            .watermarks
            .iter()
            .filter_map(|entry| entry.value().clone())
            .collect();
        unread_count(&threads, reader_id)
    }
}
