//! Link topology management
//!
//! Owns the dynamic mapping from linked counterpart to live subscription.
//! Link-set snapshots arrive from two unioned queries (historical rows key
//! by either the raw account id or the canonical id-number); the manager
//! diffs them against the tracked set, opens timetable subscriptions for
//! added counterparts and tears down removed ones, purging their schedule
//! alerts from the reconciled output.
//!
//! Everything is event-driven: subscription callbacks forward into a
//! bounded channel drained by `run`, which also carries a minute tick for
//! clock-driven re-evaluation. A full snapshot that matches the tracked
//! set is a no-op, so duplicate deliveries are harmless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::badges::{BadgeAggregator, BadgeCategory};
use crate::error::{EngineError, Result};
use crate::reconcile::{purge_owner, reconcile, OwnerContext};
use crate::session::{day_name, extract_active};
use crate::store::{
    alert_doc_id, timetable_doc_id, DocumentStore, LinkField, LinkFilter, LocalCache, Notifier,
    NotifyPayload, Subscription,
};
use crate::time_window::minutes_of;
use crate::types::{
    ActiveSessions, AlertArrayDocument, EngineConfig, LinkRecord, LinkStatus, LocalIdentity, Role,
    ThreadWatermark, TimetableShape,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Which of the two link queries a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSlot {
    Raw,
    Canonical,
}

impl LinkSlot {
    fn index(self) -> usize {
        match self {
            LinkSlot::Raw => 0,
            LinkSlot::Canonical => 1,
        }
    }
}

/// Per-counterpart subscription lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    TearingDown,
}

#[derive(Debug)]
pub enum TopologyEvent {
    Links { slot: LinkSlot, records: Vec<LinkRecord> },
    Timetable { counterpart: String, doc: Option<Value> },
}

/// Cheap control handle for a running manager.
#[derive(Clone)]
pub struct TopologyHandle {
    stop: Arc<Notify>,
}

impl TopologyHandle {
    /// Stop the `run` loop and tear down. The signal is sticky: it lands
    /// even if `run` is mid-pass or not yet at its select point, and it
    /// cannot be crowded out by a full event channel.
    pub fn shutdown(&self) {
        self.stop.notify_one();
    }
}

struct Tracked {
    state: SubState,
    subscription: Subscription,
    /// False until the first timetable snapshot lands; reconciliation
    /// skips unloaded counterparts instead of purging them.
    loaded: bool,
    timetable: Option<TimetableShape>,
    student_name: Option<String>,
    /// Raw account id, kept for purging historical records keyed by it.
    raw_id: String,
}

struct CounterpartInfo {
    raw_id: String,
    student_name: Option<String>,
}

#[derive(Default)]
struct OwnTimetable {
    loaded: bool,
    shape: Option<TimetableShape>,
}

/// The manager instance. All listener handles live in explicit maps owned
/// here and move only through the state-machine transitions; there are no
/// ambient globals.
pub struct LinkTopologyManager {
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
    cache: Arc<dyn LocalCache>,
    identity: LocalIdentity,
    config: EngineConfig,
    tz: Tz,
    tx: mpsc::Sender<TopologyEvent>,
    rx: Mutex<Option<mpsc::Receiver<TopologyEvent>>>,
    stop: Arc<Notify>,
    tracked: Mutex<HashMap<String, Tracked>>,
    link_slots: Mutex<[Vec<LinkRecord>; 2]>,
    link_subs: Mutex<Vec<Subscription>>,
    own_timetable: Mutex<OwnTimetable>,
    message_badges: BadgeAggregator,
}

impl LinkTopologyManager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        notifier: Arc<dyn Notifier>,
        cache: Arc<dyn LocalCache>,
        identity: LocalIdentity,
        config: EngineConfig,
    ) -> Result<Self> {
        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|_| EngineError::InvalidTimezone(config.timezone.clone()))?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            store,
            notifier,
            cache,
            identity,
            config,
            tz,
            tx,
            rx: Mutex::new(Some(rx)),
            stop: Arc::new(Notify::new()),
            tracked: Mutex::new(HashMap::new()),
            link_slots: Mutex::new([Vec::new(), Vec::new()]),
            link_subs: Mutex::new(Vec::new()),
            own_timetable: Mutex::new(OwnTimetable::default()),
            message_badges: BadgeAggregator::new(BadgeCategory::Messages),
        })
    }

    pub fn handle(&self) -> TopologyHandle {
        TopologyHandle { stop: Arc::clone(&self.stop) }
    }

    pub fn message_badges(&self) -> &BadgeAggregator {
        &self.message_badges
    }

    /// Record a message-thread watermark for badge counting.
    pub fn observe_watermark(&self, watermark: ThreadWatermark) {
        self.message_badges.upsert(watermark);
    }

    /// Currently tracked counterpart keys, sorted.
    pub fn tracked_counterparts(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.tracked.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn counterpart_state(&self, key: &str) -> Option<SubState> {
        self.tracked.lock().get(key).map(|t| t.state)
    }

    /// Open the link watches (both key shapes) and, for a student device,
    /// the watch on its own timetable. Calling again is a no-op; the
    /// watches are already live.
    pub fn start(&self) {
        {
            let subs = self.link_subs.lock();
            if !subs.is_empty() {
                log::warn!("Topology: start() called twice, ignoring");
                return;
            }
        }
        let mut filters: Vec<(LinkSlot, LinkFilter)> = Vec::new();
        match self.identity.role {
            Role::Parent => {
                filters.push((
                    LinkSlot::Raw,
                    LinkFilter { field: LinkField::ParentId, value: self.identity.uid.clone() },
                ));
                if let Some(number) = &self.identity.id_number {
                    filters.push((
                        LinkSlot::Canonical,
                        LinkFilter { field: LinkField::ParentIdNumber, value: number.clone() },
                    ));
                }
            }
            Role::Student => {
                filters.push((
                    LinkSlot::Raw,
                    LinkFilter { field: LinkField::StudentId, value: self.identity.uid.clone() },
                ));
                if let Some(number) = &self.identity.id_number {
                    filters.push((
                        LinkSlot::Canonical,
                        LinkFilter { field: LinkField::StudentIdNumber, value: number.clone() },
                    ));
                }
            }
        }

        let mut subs = self.link_subs.lock();
        for (slot, filter) in filters {
            let tx = self.tx.clone();
            let sub = self.store.watch_links(
                filter,
                Arc::new(move |records| {
                    if tx.try_send(TopologyEvent::Links { slot, records }).is_err() {
                        log::warn!("Topology channel full, dropping link snapshot");
                    }
                }),
            );
            subs.push(sub);
        }

        if self.identity.role == Role::Student {
            let own = self.identity.canonical_id().to_string();
            let tx = self.tx.clone();
            let event_key = own.clone();
            let sub = self.store.watch_doc(
                &timetable_doc_id(&own),
                Arc::new(move |doc| {
                    let event = TopologyEvent::Timetable { counterpart: event_key.clone(), doc };
                    if tx.try_send(event).is_err() {
                        log::warn!("Topology channel full, dropping timetable update");
                    }
                }),
            );
            subs.push(sub);
        }

        log::info!(
            "Topology: watching links for {} as {:?}",
            self.identity.canonical_id(),
            self.identity.role
        );
    }

    /// Event loop: drains subscription events and re-evaluates on a fixed
    /// tick. Runs until the handle signals shutdown or the channel
    /// closes, then tears down.
    pub async fn run(&self) {
        let rx = self.rx.lock().take();
        let Some(mut rx) = rx else {
            log::warn!("Topology: run() called twice, ignoring");
            return;
        };

        self.start();

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.stop.notified() => break,
                _ = ticker.tick() => self.tick().await,
                event = rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
            }
        }

        self.teardown();
        log::info!("Topology: stopped");
    }

    /// Process every queued event without waiting. Lets embedders (and
    /// tests) step the manager instead of spawning `run`.
    pub async fn pump(&self) {
        loop {
            let event = {
                let mut guard = self.rx.lock();
                let Some(rx) = guard.as_mut() else { return };
                rx.try_recv()
            };
            match event {
                Ok(event) => self.dispatch(event).await,
                Err(_) => return,
            }
        }
    }

    async fn dispatch(&self, event: TopologyEvent) {
        match event {
            TopologyEvent::Links { slot, records } => self.apply_link_snapshot(slot, records).await,
            TopologyEvent::Timetable { counterpart, doc } => {
                self.apply_timetable(&counterpart, doc).await
            }
        }
    }

    /// Close every open subscription. Mandatory on unmount/logout, safe to
    /// call repeatedly. Does not purge: logging out is not unlinking.
    pub fn teardown(&self) {
        {
            let mut subs = self.link_subs.lock();
            for sub in subs.iter_mut() {
                sub.close();
            }
            subs.clear();
        }
        let mut tracked = self.tracked.lock();
        for (key, entry) in tracked.iter_mut() {
            entry.state = SubState::TearingDown;
            entry.subscription.close();
            entry.state = SubState::Unsubscribed;
            log::debug!("Topology: closed subscription for {}", key);
        }
        tracked.clear();
    }

    // =========================================================================
    // Link-set diffing
    // =========================================================================

    async fn apply_link_snapshot(&self, slot: LinkSlot, records: Vec<LinkRecord>) {
        {
            let mut slots = self.link_slots.lock();
            slots[slot.index()] = records;
        }
        let desired = self.desired_counterparts();
        self.sync_tracked(desired).await;
    }

    /// Union both query slots, keep active links, key by canonical id with
    /// raw-id fallback when the canonical id is missing.
    fn desired_counterparts(&self) -> HashMap<String, CounterpartInfo> {
        let slots = self.link_slots.lock();
        let mut desired: HashMap<String, CounterpartInfo> = HashMap::new();
        for record in slots.iter().flatten() {
            if record.status != LinkStatus::Active {
                continue;
            }
            let (key, raw_id, student_name) = match self.identity.role {
                Role::Parent => {
                    let key = record.student_id_number.clone().unwrap_or_else(|| {
                        log::debug!(
                            "Link for student {} lacks an id number, keying by raw id",
                            record.student_id
                        );
                        record.student_id.clone()
                    });
                    (key, record.student_id.clone(), record.student_name.clone())
                }
                Role::Student => {
                    let key = record
                        .parent_id_number
                        .clone()
                        .unwrap_or_else(|| record.parent_id.clone());
                    (key, record.parent_id.clone(), None)
                }
            };
            desired.entry(key).or_insert(CounterpartInfo { raw_id, student_name });
        }
        desired
    }

    async fn sync_tracked(&self, desired: HashMap<String, CounterpartInfo>) {
        let mut added: Vec<String> = Vec::new();
        let mut removed: Vec<(String, Tracked)> = Vec::new();
        {
            let mut tracked = self.tracked.lock();
            let stale: Vec<String> =
                tracked.keys().filter(|k| !desired.contains_key(*k)).cloned().collect();
            for key in stale {
                if let Some(mut entry) = tracked.remove(&key) {
                    entry.state = SubState::TearingDown;
                    removed.push((key, entry));
                }
            }
            for (key, info) in desired {
                // Idempotent under duplicate snapshots: already-tracked
                // counterparts are left alone, no double subscription.
                if tracked.contains_key(&key) {
                    continue;
                }
                tracked.insert(
                    key.clone(),
                    Tracked {
                        state: SubState::Subscribing,
                        subscription: Subscription::empty(),
                        // A student device needs no per-parent data feed.
                        loaded: self.identity.role == Role::Student,
                        timetable: None,
                        student_name: info.student_name,
                        raw_id: info.raw_id,
                    },
                );
                added.push(key);
            }
        }

        for key in &added {
            log::info!("Topology: tracking counterpart {}", key);
            self.message_badges.register(key);
            match self.identity.role {
                Role::Parent => {
                    let tx = self.tx.clone();
                    let event_key = key.clone();
                    let sub = self.store.watch_doc(
                        &timetable_doc_id(key),
                        Arc::new(move |doc| {
                            let event = TopologyEvent::Timetable {
                                counterpart: event_key.clone(),
                                doc,
                            };
                            if tx.try_send(event).is_err() {
                                log::warn!("Topology channel full, dropping timetable update");
                            }
                        }),
                    );
                    let mut tracked = self.tracked.lock();
                    match tracked.get_mut(key) {
                        Some(entry) => {
                            entry.subscription = sub;
                            entry.state = SubState::Subscribed;
                        }
                        // Unlinked while subscribing: disposer runs via drop.
                        None => drop(sub),
                    }
                }
                Role::Student => {
                    if let Some(entry) = self.tracked.lock().get_mut(key) {
                        entry.state = SubState::Subscribed;
                    }
                }
            }
        }
        // A newly linked parent gets the current schedule now, not at the
        // next tick.
        if self.identity.role == Role::Student && !added.is_empty() {
            self.reconcile_self().await;
        }

        for (key, mut entry) in removed {
            log::info!("Topology: untracking counterpart {}", key);
            entry.subscription.close();
            entry.state = SubState::Unsubscribed;
            self.message_badges.remove(&key);
            self.cache.remove(&timetable_cache_key(&key));
            match self.identity.role {
                Role::Parent => {
                    // Purge the removed student's schedule alerts from our
                    // own document, under both ids history may have used.
                    let recipient = self.identity.canonical_id().to_string();
                    self.purge_recipient(&recipient, &key).await;
                    if entry.raw_id != key {
                        self.purge_recipient(&recipient, &entry.raw_id).await;
                    }
                }
                Role::Student => {
                    // Our schedule alerts no longer belong in the removed
                    // parent's document.
                    let owner = self.identity.canonical_id().to_string();
                    self.purge_recipient(&key, &owner).await;
                }
            }
        }
    }

    // =========================================================================
    // Timetable updates and reconciliation
    // =========================================================================

    async fn apply_timetable(&self, counterpart: &str, doc: Option<Value>) {
        let timetable = doc.as_ref().and_then(parse_timetable_doc);
        if doc.is_some() && timetable.is_none() {
            log::warn!(
                "Timetable for {} has an unrecognized shape, keeping last-known state",
                counterpart
            );
            return;
        }

        // Mirror for offline display; never read back for reconciliation.
        match &timetable {
            Some(shape) => {
                if let Ok(serialized) = serde_json::to_string(shape) {
                    self.cache.set(&timetable_cache_key(counterpart), serialized);
                }
            }
            None => self.cache.remove(&timetable_cache_key(counterpart)),
        }

        let own =
            self.identity.role == Role::Student && counterpart == self.identity.canonical_id();
        if own {
            {
                let mut state = self.own_timetable.lock();
                state.loaded = true;
                state.shape = timetable;
            }
            self.reconcile_self().await;
        } else {
            {
                let mut tracked = self.tracked.lock();
                let Some(entry) = tracked.get_mut(counterpart) else {
                    log::debug!("Timetable update for untracked counterpart {}", counterpart);
                    return;
                };
                entry.loaded = true;
                entry.timetable = timetable;
            }
            self.reconcile_counterpart(counterpart).await;
        }
    }

    /// Clock-driven pass: re-evaluate every tracked counterpart (parent)
    /// or the local schedule (student).
    pub async fn tick(&self) {
        match self.identity.role {
            Role::Parent => {
                let keys: Vec<String> = self.tracked.lock().keys().cloned().collect();
                for key in keys {
                    self.reconcile_counterpart(&key).await;
                }
            }
            Role::Student => self.reconcile_self().await,
        }
    }

    async fn reconcile_counterpart(&self, key: &str) {
        let (loaded, timetable, raw_id, student_name) = {
            let tracked = self.tracked.lock();
            let Some(entry) = tracked.get(key) else { return };
            (entry.loaded, entry.timetable.clone(), entry.raw_id.clone(), entry.student_name.clone())
        };
        // No snapshot yet: keep whatever the document holds, retry later.
        if !loaded {
            return;
        }

        let now = Utc::now();
        let local = now.with_timezone(&self.tz).naive_local();
        let active = match &timetable {
            Some(shape) => extract_active(
                shape,
                day_name(local.date()),
                local,
                self.config.counterpart_grace_minutes,
                self.config.counterpart_range_policy,
            ),
            None => ActiveSessions::new(),
        };

        let recipient = self.identity.canonical_id().to_string();
        let ctx = OwnerContext {
            owner_id: key,
            source_exists: timetable.is_some(),
            now,
            now_minutes: minutes_of(&local.time()),
            grace_minutes: self.config.counterpart_grace_minutes,
            policy: self.config.counterpart_range_policy,
            recent_secs: self.config.recent_record_secs,
            student_id: Some(&raw_id),
            parent_id: Some(&self.identity.uid),
            student_name: student_name.as_deref(),
        };
        self.reconcile_into(&recipient, &active, &ctx).await;
    }

    /// Student device: merge the local schedule into the own document and
    /// every active-linked parent's document.
    async fn reconcile_self(&self) {
        let (loaded, timetable) = {
            let state = self.own_timetable.lock();
            (state.loaded, state.shape.clone())
        };
        if !loaded {
            return;
        }

        let now = Utc::now();
        let local = now.with_timezone(&self.tz).naive_local();
        let active = match &timetable {
            Some(shape) => extract_active(
                shape,
                day_name(local.date()),
                local,
                self.config.self_grace_minutes,
                self.config.self_range_policy,
            ),
            None => ActiveSessions::new(),
        };

        let owner = self.identity.canonical_id().to_string();
        let display_name = self.identity.display_name.clone();
        let mut recipients = vec![owner.clone()];
        recipients.extend(self.tracked.lock().keys().cloned());

        for recipient in recipients {
            let ctx = OwnerContext {
                owner_id: &owner,
                source_exists: timetable.is_some(),
                now,
                now_minutes: minutes_of(&local.time()),
                grace_minutes: self.config.self_grace_minutes,
                policy: self.config.self_range_policy,
                recent_secs: self.config.recent_record_secs,
                student_id: Some(&self.identity.uid),
                parent_id: None,
                student_name: display_name.as_deref(),
            };
            self.reconcile_into(&recipient, &active, &ctx).await;
        }
    }

    /// One read-reconcile-write pass against a recipient's document.
    /// Writes only when the pass changed the array; notifies once per
    /// synthesized record, and only after the write landed.
    async fn reconcile_into(
        &self,
        recipient: &str,
        active: &ActiveSessions,
        ctx: &OwnerContext<'_>,
    ) {
        let doc_id = alert_doc_id(recipient);
        let Some(mut doc) = self.read_alert_doc(&doc_id).await else { return };

        let outcome = reconcile(&doc.notifications, active, ctx);
        if !outcome.changed {
            return;
        }

        doc.notifications = outcome.next;
        if !self.write_alert_doc(&doc_id, &doc).await {
            return;
        }
        log::debug!(
            "Reconciled {}: {} record(s), {} new",
            doc_id,
            doc.notifications.len(),
            outcome.created.len()
        );
        for record in &outcome.created {
            self.notifier.notify(
                recipient,
                &NotifyPayload {
                    alert_id: record.id.clone(),
                    kind: record.kind.clone(),
                    title: record.title.clone(),
                    body: record.message.clone(),
                },
            );
        }
    }

    async fn purge_recipient(&self, recipient: &str, owner_id: &str) {
        let doc_id = alert_doc_id(recipient);
        let Some(mut doc) = self.read_alert_doc(&doc_id).await else { return };
        let outcome = purge_owner(&doc.notifications, owner_id, Utc::now());
        if !outcome.changed {
            return;
        }
        doc.notifications = outcome.next;
        if self.write_alert_doc(&doc_id, &doc).await {
            log::debug!("Purged {} alerts for {}", doc_id, owner_id);
        }
    }

    /// Read failures are transient (retry next tick); an undecodable
    /// document skips the pass rather than clobbering foreign data.
    async fn read_alert_doc(&self, doc_id: &str) -> Option<AlertArrayDocument> {
        match self.store.get_doc(doc_id).await {
            Ok(Some(value)) => match serde_json::from_value::<AlertArrayDocument>(value) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    log::warn!("Alert document {} is undecodable, skipping pass: {}", doc_id, e);
                    None
                }
            },
            Ok(None) => Some(AlertArrayDocument::default()),
            Err(e) => {
                log::warn!("Failed to read {}: {} (will retry)", doc_id, e);
                None
            }
        }
    }

    async fn write_alert_doc(&self, doc_id: &str, doc: &AlertArrayDocument) -> bool {
        let value = match serde_json::to_value(doc) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Failed to serialize {}: {}", doc_id, e);
                return false;
            }
        };
        match self.store.set_doc(doc_id, value, true).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to write {}: {} (will retry)", doc_id, e);
                false
            }
        }
    }
}

fn timetable_cache_key(counterpart: &str) -> String {
    format!("timetable:{counterpart}")
}

/// Timetable documents either wrap the subjects under a `subjects` field
/// or are the shape directly.
fn parse_timetable_doc(value: &Value) -> Option<TimetableShape> {
    let subjects = value.get("subjects").unwrap_or(value);
    serde_json::from_value(subjects.clone()).ok()
}
