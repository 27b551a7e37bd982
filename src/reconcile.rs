//! Alert reconciliation
//!
//! One reconciliation pass merges a freshly computed active-session set
//! into the existing alert array, producing the next array: retain valid
//! records, drop stale ones, synthesize new ones, and dedup by
//! (subjectId, compositeKey) keeping the latest createdAt.
//!
//! The backing store only supports whole-document read-modify-write, so
//! two devices can race on the same document. That is accepted, not
//! prevented: every pass is idempotent, and latest-wins dedup self-heals
//! whatever duplication a race produced on the next pass.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::time_window::{is_within, RangePolicy};
use crate::types::{ActiveSessions, AlertKind, AlertRecord, AlertStatus};

/// Who and what one reconciliation pass is scoped to.
///
/// `owner_id` is the subject entity whose `schedule_current` records are
/// candidates; everything else in the document is protected. Grace and
/// range policy come from the caller because self-view and counterpart
/// view evaluate differently.
#[derive(Debug, Clone)]
pub struct OwnerContext<'a> {
    pub owner_id: &'a str,
    /// False when the owning schedule source no longer exists; all
    /// candidates for the owner are then dropped unconditionally.
    pub source_exists: bool,
    pub now: DateTime<Utc>,
    /// Minutes since local midnight, for re-evaluating stored ranges.
    pub now_minutes: u32,
    pub grace_minutes: u32,
    pub policy: RangePolicy,
    /// Records created within this window survive a transient failure to
    /// re-derive their session (read-race flicker suppression).
    pub recent_secs: i64,
    pub student_id: Option<&'a str>,
    pub parent_id: Option<&'a str>,
    pub student_name: Option<&'a str>,
}

/// Result of one pass. `next` is written back only when `changed`;
/// `created` feeds the push-notification hook, at most once per record.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub next: Vec<AlertRecord>,
    pub created: Vec<AlertRecord>,
    pub changed: bool,
}

/// Latest-wins comparison for duplicate records. Falls back to
/// lexicographic order on the raw string for odd timestamps (RFC3339
/// strings order lexicographically anyway).
fn is_newer(a: &AlertRecord, b: &AlertRecord) -> bool {
    match (a.created_at_ts(), b.created_at_ts()) {
        (Some(x), Some(y)) => x > y,
        _ => a.created_at > b.created_at,
    }
}

/// Merge `active` into `existing` for the owner in `ctx`.
///
/// Protected records (pending-decision types, any non-`schedule_current`
/// type, and `schedule_current` records of other owners) pass through
/// unmodified and in order.
pub fn reconcile(
    existing: &[AlertRecord],
    active: &ActiveSessions,
    ctx: &OwnerContext<'_>,
) -> ReconcileOutcome {
    // Step 1: partition, preserving order on both sides.
    let mut protected: Vec<AlertRecord> = Vec::new();
    let mut candidates: Vec<AlertRecord> = Vec::new();
    for record in existing {
        if record.kind.is_schedule_current() && record.subject_id == ctx.owner_id {
            candidates.push(record.clone());
        } else {
            protected.push(record.clone());
        }
    }

    // Step 2: retain candidates that are still within their stored window
    // and either re-derived this pass or too recent to trust their absence.
    let mut retained: Vec<AlertRecord> = Vec::new();
    if ctx.source_exists {
        for record in candidates {
            let within = is_within(
                record.time.as_deref().unwrap_or(""),
                ctx.now_minutes,
                ctx.grace_minutes,
                ctx.policy,
            );
            let in_active = record
                .composite_key
                .as_deref()
                .map(|key| active.contains_key(key))
                .unwrap_or(false);
            let recent = record
                .created_at_ts()
                .map(|ts| (ctx.now - ts).num_seconds() < ctx.recent_secs)
                .unwrap_or(false);

            if within && (in_active || recent) {
                retained.push(record);
            } else {
                log::debug!(
                    "Dropping stale schedule alert {} (key {:?}, within={}, active={}, recent={})",
                    record.id,
                    record.composite_key,
                    within,
                    in_active,
                    recent
                );
            }
        }
    } else if !candidates.is_empty() {
        log::debug!(
            "Schedule source for {} gone, purging {} alert(s)",
            ctx.owner_id,
            candidates.len()
        );
    }

    // Step 3: synthesize a fresh unread record for every active session
    // with no retained counterpart.
    let mut created: Vec<AlertRecord> = Vec::new();
    for (key, session) in active {
        let already = retained
            .iter()
            .any(|r| r.composite_key.as_deref() == Some(key.as_str()));
        if already {
            continue;
        }

        let message = match ctx.student_name {
            Some(name) => format!("{}: {} ({})", name, session.subject, session.time),
            None => format!("{} ({})", session.subject, session.time),
        };
        created.push(AlertRecord {
            id: format!("alert-{}", Uuid::new_v4()),
            kind: AlertKind::schedule_current(),
            title: "Class in session".to_string(),
            message,
            created_at: ctx.now.to_rfc3339(),
            status: AlertStatus::Unread,
            subject_id: ctx.owner_id.to_string(),
            student_id: ctx.student_id.map(str::to_string),
            parent_id: ctx.parent_id.map(str::to_string),
            link_id: None,
            request_id: None,
            composite_key: Some(key.clone()),
            subject: Some(session.subject.clone()),
            time: Some(session.time.clone()),
            student_name: ctx.student_name.map(str::to_string),
            extra: serde_json::Map::new(),
        });
    }

    // Step 4: dedup the union by (subjectId, compositeKey), latest
    // createdAt wins. Order-preserving so an unchanged document compares
    // equal to its input and no redundant write happens.
    let mut merged: Vec<AlertRecord> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    for record in retained.into_iter().chain(created.iter().cloned()) {
        let dedup_key = (
            record.subject_id.clone(),
            // Records without a composite key never collide.
            record.composite_key.clone().unwrap_or_else(|| record.id.clone()),
        );
        match index.get(&dedup_key) {
            Some(&slot) => {
                if is_newer(&record, &merged[slot]) {
                    merged[slot] = record;
                }
            }
            None => {
                index.insert(dedup_key, merged.len());
                merged.push(record);
            }
        }
    }

    // Step 5: protected first, untouched, then the reconciled candidates.
    let mut next = protected;
    next.extend(merged);
    let changed = next != existing;

    ReconcileOutcome { next, created, changed }
}

/// Scoped purge for a removed counterpart: a pass with an empty active set
/// and no schedule source, dropping every `schedule_current` record owned
/// by `owner_id` while leaving everything else alone.
pub fn purge_owner(
    existing: &[AlertRecord],
    owner_id: &str,
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    let ctx = OwnerContext {
        owner_id,
        source_exists: false,
        now,
        now_minutes: 0,
        grace_minutes: 0,
        policy: RangePolicy::FailClosed,
        recent_secs: 0,
        student_id: None,
        parent_id: None,
        student_name: None,
    };
    reconcile(existing, &ActiveSessions::new(), &ctx)
}

// =============================================================================
// Recipient-device mutations
// =============================================================================

/// Mark one record read. Returns the next array and whether it changed.
pub fn mark_read(existing: &[AlertRecord], alert_id: &str) -> (Vec<AlertRecord>, bool) {
    let mut next = existing.to_vec();
    let mut changed = false;
    if let Some(record) = next.iter_mut().find(|r| r.id == alert_id) {
        if record.status == AlertStatus::Unread {
            record.status = AlertStatus::Read;
            changed = true;
        }
    }
    (next, changed)
}

/// Delete one record. Pending-decision records are not deletable here;
/// they go through [`resolve_pending`].
pub fn remove_alert(existing: &[AlertRecord], alert_id: &str) -> (Vec<AlertRecord>, bool) {
    if let Some(record) = existing.iter().find(|r| r.id == alert_id) {
        if record.kind.is_pending_decision() {
            log::warn!(
                "Refusing to delete pending-decision alert {} ({})",
                record.id,
                record.kind
            );
            return (existing.to_vec(), false);
        }
    }
    let next: Vec<AlertRecord> = existing.iter().filter(|r| r.id != alert_id).cloned().collect();
    let changed = next.len() != existing.len();
    (next, changed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Accepted,
    Declined,
}

impl Resolution {
    fn as_str(self) -> &'static str {
        match self {
            Resolution::Accepted => "accepted",
            Resolution::Declined => "declined",
        }
    }
}

/// Resolve a pending-decision record: the one sanctioned mutation of a
/// protected record. The request kind is rewritten to its terminal
/// response kind with a fresh timestamp and the resolution recorded.
pub fn resolve_pending(
    existing: &[AlertRecord],
    alert_id: &str,
    resolution: Resolution,
    now: DateTime<Utc>,
) -> (Vec<AlertRecord>, bool) {
    let mut next = existing.to_vec();
    let mut changed = false;
    if let Some(record) = next.iter_mut().find(|r| r.id == alert_id) {
        let response_kind = match record.kind.0.as_str() {
            AlertKind::LINK_REQUEST => Some(AlertKind::LINK_RESPONSE),
            AlertKind::SCHEDULE_PERMISSION_REQUEST => {
                Some(AlertKind::SCHEDULE_PERMISSION_RESPONSE)
            }
            _ => None,
        };
        if let Some(kind) = response_kind {
            record.kind = AlertKind(kind.to_string());
            record.status = AlertStatus::Read;
            record.created_at = now.to_rfc3339();
            record.extra.insert(
                "resolution".to_string(),
                serde_json::Value::String(resolution.as_str().to_string()),
            );
            changed = true;
        } else {
            log::warn!("Alert {} is not pending-decision, ignoring resolution", alert_id);
        }
    }
    (next, changed)
}
