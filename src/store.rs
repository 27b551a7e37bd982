//! External collaborator interfaces
//!
//! The engine talks to the outside world through three seams: a document
//! store (whole-document read/write/watch, no partial-array mutation), a
//! fire-and-forget push notifier, and a local cache used only for offline
//! fallback display. Concrete backends live outside this crate; tests use
//! the in-memory store at the bottom of this file.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{AlertKind, LinkRecord};

/// Alert array document id for a recipient (canonical id where known).
pub fn alert_doc_id(recipient: &str) -> String {
    format!("notifications/{recipient}")
}

/// Timetable document id for a student.
pub fn timetable_doc_id(student: &str) -> String {
    format!("timetables/{student}")
}

// =============================================================================
// Subscriptions
// =============================================================================

/// A live subscription handle. Closing invokes the disposer exactly once;
/// close is idempotent and also runs on drop, so a handle can never leak
/// its listener.
pub struct Subscription {
    disposer: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(disposer: impl FnOnce() + Send + 'static) -> Self {
        Self { disposer: Some(Box::new(disposer)) }
    }

    /// A handle with nothing to dispose.
    pub fn empty() -> Self {
        Self { disposer: None }
    }

    pub fn close(&mut self) {
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.disposer.is_none()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Change callback for a watched document. `None` means the document does
/// not (or no longer) exist.
pub type DocHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Change callback for a link query: the full current result set.
pub type LinkHandler = Arc<dyn Fn(Vec<LinkRecord>) + Send + Sync>;

/// Which link field a query matches on. Historical rows keyed documents by
/// either the raw account id or the canonical id-number, so callers query
/// both shapes and union the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkField {
    StudentId,
    StudentIdNumber,
    ParentId,
    ParentIdNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkFilter {
    pub field: LinkField,
    pub value: String,
}

impl LinkFilter {
    pub fn matches(&self, record: &LinkRecord) -> bool {
        let value = Some(self.value.as_str());
        match self.field {
            LinkField::StudentId => record.student_id == self.value,
            LinkField::StudentIdNumber => record.student_id_number.as_deref() == value,
            LinkField::ParentId => record.parent_id == self.value,
            LinkField::ParentIdNumber => record.parent_id_number.as_deref() == value,
        }
    }
}

// =============================================================================
// Document store
// =============================================================================

/// Abstraction over the hosted document database.
///
/// The store offers no compare-and-set and no per-element array operation;
/// the whole document is the write unit. All engine correctness derives
/// from idempotent merge logic on top of this, never from mutual
/// exclusion. Watch callbacks deliver an initial snapshot on registration
/// and fire again on every subsequent change.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_doc(&self, id: &str) -> Result<Option<Value>>;

    /// Whole-document write. With `merge`, top-level fields are merged
    /// into an existing document instead of replacing it.
    async fn set_doc(&self, id: &str, value: Value, merge: bool) -> Result<()>;

    fn watch_doc(&self, id: &str, on_change: DocHandler) -> Subscription;

    fn watch_links(&self, filter: LinkFilter, on_change: LinkHandler) -> Subscription;
}

// =============================================================================
// Push notifications
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct NotifyPayload {
    pub alert_id: String,
    pub kind: AlertKind,
    pub title: String,
    pub body: String,
}

/// Fire-and-forget push delivery. Invoked at most once per synthesized
/// alert record; delivery guarantees are the service's problem.
pub trait Notifier: Send + Sync {
    fn notify(&self, recipient_id: &str, payload: &NotifyPayload);
}

/// Default notifier: log only. Useful in tests and headless runs.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, recipient_id: &str, payload: &NotifyPayload) {
        log::info!(
            "Notify {}: [{}] {}: {}",
            recipient_id,
            payload.kind,
            payload.title,
            payload.body
        );
    }
}

// =============================================================================
// Local cache
// =============================================================================

/// On-device cache for offline fallback display. Never a source of truth
/// for reconciliation decisions.
pub trait LocalCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

/// Simple in-process cache.
#[derive(Default)]
pub struct MemoryCache {
    inner: parking_lot::Mutex<std::collections::HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.inner.lock().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.inner.lock().remove(key);
    }
}

// =============================================================================
// In-memory store (test double)
// =============================================================================

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    type DocWatchers = Arc<Mutex<HashMap<u64, (String, DocHandler)>>>;
    type LinkWatchers = Arc<Mutex<HashMap<u64, (LinkFilter, LinkHandler)>>>;

    /// In-memory `DocumentStore` with synchronous watch delivery, used by
    /// crate tests. Counts writes so tests can assert the
    /// write-only-if-changed contract.
    #[derive(Default)]
    pub struct MemoryStore {
        docs: Mutex<HashMap<String, Value>>,
        links: Mutex<Vec<LinkRecord>>,
        doc_watchers: DocWatchers,
        link_watchers: LinkWatchers,
        next_id: AtomicU64,
        write_count: AtomicUsize,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn writes(&self) -> usize {
            self.write_count.load(Ordering::SeqCst)
        }

        pub fn doc_watcher_count(&self) -> usize {
            self.doc_watchers.lock().len()
        }

        pub fn link_watcher_count(&self) -> usize {
            self.link_watchers.lock().len()
        }

        /// Replace the link collection and re-fire every link watcher with
        /// its filtered view, like a backend query snapshot.
        pub fn put_links(&self, records: Vec<LinkRecord>) {
            *self.links.lock() = records;
            let watchers: Vec<(LinkFilter, LinkHandler)> =
                self.link_watchers.lock().values().cloned().collect();
            for (filter, handler) in watchers {
                handler(self.filtered_links(&filter));
            }
        }

        /// Delete a document and notify its watchers with `None`.
        pub fn delete_doc(&self, id: &str) {
            self.docs.lock().remove(id);
            self.fire_doc(id, None);
        }

        fn filtered_links(&self, filter: &LinkFilter) -> Vec<LinkRecord> {
            self.links.lock().iter().filter(|r| filter.matches(r)).cloned().collect()
        }

        fn fire_doc(&self, id: &str, value: Option<Value>) {
            let watchers: Vec<DocHandler> = self
                .doc_watchers
                .lock()
                .values()
                .filter(|(watched, _)| watched == id)
                .map(|(_, h)| h.clone())
                .collect();
            for handler in watchers {
                handler(value.clone());
            }
        }
    }

    #[async_trait]
    impl DocumentStore for MemoryStore {
        async fn get_doc(&self, id: &str) -> Result<Option<Value>> {
            Ok(self.docs.lock().get(id).cloned())
        }

        async fn set_doc(&self, id: &str, value: Value, merge: bool) -> Result<()> {
            let next = {
                let mut docs = self.docs.lock();
                let next = match (merge, docs.get(id)) {
                    (true, Some(Value::Object(existing))) => {
                        let mut merged = existing.clone();
                        if let Value::Object(incoming) = value {
                            for (k, v) in incoming {
                                merged.insert(k, v);
                            }
                        }
                        Value::Object(merged)
                    }
                    _ => value,
                };
                docs.insert(id.to_string(), next.clone());
                next
            };
            self.write_count.fetch_add(1, Ordering::SeqCst);
            self.fire_doc(id, Some(next));
            Ok(())
        }

        fn watch_doc(&self, id: &str, on_change: DocHandler) -> Subscription {
            let watcher_id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.doc_watchers
                .lock()
                .insert(watcher_id, (id.to_string(), on_change.clone()));
            // Initial snapshot
            on_change(self.docs.lock().get(id).cloned());

            let watchers = Arc::clone(&self.doc_watchers);
            Subscription::new(move || {
                watchers.lock().remove(&watcher_id);
            })
        }

        fn watch_links(&self, filter: LinkFilter, on_change: LinkHandler) -> Subscription {
            let watcher_id = self.next_id.fetch_add(1, Ordering::SeqCst);
            self.link_watchers
                .lock()
                .insert(watcher_id, (filter.clone(), on_change.clone()));
            on_change(self.filtered_links(&filter));

            let watchers = Arc::clone(&self.link_watchers);
            Subscription::new(move || {
                watchers.lock().remove(&watcher_id);
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use crate::types::LinkStatus;
    use parking_lot::Mutex;
    use serde_json::json;

    fn link(student: &str, parent: &str, status: LinkStatus) -> LinkRecord {
        LinkRecord {
            student_id: student.to_string(),
            student_id_number: Some(format!("{student}-num")),
            parent_id: parent.to_string(),
            parent_id_number: None,
            status,
            student_name: None,
        }
    }

    #[test]
    fn test_subscription_close_is_idempotent() {
        let count = Arc::new(Mutex::new(0u32));
        let counter = Arc::clone(&count);
        let mut sub = Subscription::new(move || *counter.lock() += 1);
        assert!(!sub.is_closed());
        sub.close();
        sub.close();
        drop(sub);
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_link_filter_matches_both_shapes() {
        let record = link("s-1", "p-1", LinkStatus::Active);
        assert!(LinkFilter { field: LinkField::StudentId, value: "s-1".into() }.matches(&record));
        assert!(LinkFilter { field: LinkField::StudentIdNumber, value: "s-1-num".into() }
            .matches(&record));
        assert!(!LinkFilter { field: LinkField::ParentIdNumber, value: "p-1".into() }
            .matches(&record));
    }

    #[tokio::test]
    async fn test_memory_store_watch_doc_delivers_initial_and_updates() {
        let store = MemoryStore::new();
        store.set_doc("d/1", json!({"a": 1}), false).await.unwrap();

        let seen: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut sub = store.watch_doc("d/1", Arc::new(move |v| sink.lock().push(v)));

        store.set_doc("d/1", json!({"a": 2}), false).await.unwrap();
        sub.close();
        store.set_doc("d/1", json!({"a": 3}), false).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Some(json!({"a": 1})));
        assert_eq!(seen[1], Some(json!({"a": 2})));
    }

    #[tokio::test]
    async fn test_memory_store_merge_keeps_siblings() {
        let store = MemoryStore::new();
        store.set_doc("d/1", json!({"a": 1, "b": 2}), false).await.unwrap();
        store.set_doc("d/1", json!({"b": 3}), true).await.unwrap();
        let doc = store.get_doc("d/1").await.unwrap().unwrap();
        assert_eq!(doc, json!({"a": 1, "b": 3}));
    }

    #[test]
    fn test_memory_store_link_watchers_filtered() {
        let store = MemoryStore::new();
        let seen: Arc<Mutex<Vec<Vec<LinkRecord>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = store.watch_links(
            LinkFilter { field: LinkField::ParentId, value: "p-1".into() },
            Arc::new(move |records| sink.lock().push(records)),
        );

        store.put_links(vec![
            link("s-1", "p-1", LinkStatus::Active),
            link("s-2", "p-2", LinkStatus::Active),
        ]);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2); // initial empty + one snapshot
        assert!(seen[0].is_empty());
        assert_eq!(seen[1].len(), 1);
        assert_eq!(seen[1][0].student_id, "s-1");
    }

    #[test]
    fn test_memory_cache() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into());
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        cache.remove("k");
        assert_eq!(cache.get("k"), None);
    }
}
