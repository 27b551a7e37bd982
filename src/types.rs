use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time_window::RangePolicy;

// =============================================================================
// Timetable
// =============================================================================

/// One timetable row in the flat shape: the entry carries its own subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableEntry {
    pub subject: String,
    pub day: String,
    /// Raw range string, e.g. "08:00AM-09:30AM". Parsed lazily by the
    /// time-window evaluator; malformed values degrade per policy.
    pub time: String,
}

/// One timetable slot in the map shape: subject is the map key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableSlot {
    pub day: String,
    pub time: String,
}

/// A timetable document's subjects, in either of the two shapes found in
/// production data: a map keyed by subject name, or a flat list of entries
/// each carrying its own subject. Resolved once here; everything downstream
/// sees uniform `(subject, day, time)` triples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimetableShape {
    Flat(Vec<TimetableEntry>),
    Subjects(HashMap<String, Vec<TimetableSlot>>),
}

impl TimetableShape {
    /// Iterate `(subject, day, time)` regardless of shape.
    pub fn entries(&self) -> Vec<(&str, &str, &str)> {
        match self {
            TimetableShape::Flat(rows) => rows
                .iter()
                .map(|e| (e.subject.as_str(), e.day.as_str(), e.time.as_str()))
                .collect(),
            TimetableShape::Subjects(map) => map
                .iter()
                .flat_map(|(subject, slots)| {
                    slots
                        .iter()
                        .map(move |s| (subject.as_str(), s.day.as_str(), s.time.as_str()))
                })
                .collect(),
        }
    }
}

// =============================================================================
// Active sessions
// =============================================================================

/// A session happening right now. Ephemeral: recomputed every evaluation
/// tick and never persisted; only its presence or absence drives the
/// lifecycle of `schedule_current` alert records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub subject: String,
    pub time: String,
    pub day_key: String,
    /// `day_subject_time_YYYY-MM-DD`. The date stamp rolls at local
    /// midnight so the same weekday next week yields a distinct key.
    pub composite_key: String,
}

/// The output of one extraction pass, keyed by composite key (set
/// semantics: duplicate source rows collapse to one session).
pub type ActiveSessions = std::collections::BTreeMap<String, ActiveSession>;

// =============================================================================
// Alert records
// =============================================================================

/// Open string tag for an alert record's type.
///
/// Kept as a string rather than a closed enum so records written by newer
/// clients round-trip through whole-document rewrites untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertKind(pub String);

impl AlertKind {
    pub const SCHEDULE_CURRENT: &'static str = "schedule_current";
    pub const LINK_REQUEST: &'static str = "link_request";
    pub const LINK_RESPONSE: &'static str = "link_response";
    pub const SCHEDULE_PERMISSION_REQUEST: &'static str = "schedule_permission_request";
    pub const SCHEDULE_PERMISSION_RESPONSE: &'static str = "schedule_permission_response";

    pub fn schedule_current() -> Self {
        AlertKind(Self::SCHEDULE_CURRENT.to_string())
    }

    pub fn is_schedule_current(&self) -> bool {
        self.0 == Self::SCHEDULE_CURRENT
    }

    /// Pending-decision types are immutable until explicitly resolved;
    /// reconciliation must never delete or alter them.
    pub fn is_pending_decision(&self) -> bool {
        self.0 == Self::LINK_REQUEST || self.0 == Self::SCHEDULE_PERMISSION_REQUEST
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    #[default]
    Unread,
    Read,
}

/// One notification record inside a recipient's alert array document.
///
/// Field names and enum values are the wire format shared with other
/// clients; the flattened `extra` map preserves any fields this version
/// does not model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AlertKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    /// RFC3339 timestamp string. Stored as a string because that is what
    /// existing documents contain; parsed only for latest-wins dedup.
    pub created_at: String,
    #[serde(default)]
    pub status: AlertStatus,
    /// Owning entity: the student whose schedule produced this record.
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Stored range string, re-evaluated on every reconciliation pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AlertRecord {
    /// Parse `createdAt` for latest-wins comparisons. RFC3339 strings also
    /// order lexicographically, which is the fallback for odd data.
    pub fn created_at_ts(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// The whole alert array document: the sole unit of read/write granularity
/// in the backing store. Unknown sibling fields survive rewrites via the
/// flattened extras map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertArrayDocument {
    #[serde(default)]
    pub notifications: Vec<AlertRecord>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// =============================================================================
// Links
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Pending,
    Active,
    Declined,
}

/// A parent↔student link row. Historical rows may carry either the raw
/// account id or the canonical id-number in their key fields, so the
/// topology manager queries by both shapes and unions the results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRecord {
    pub student_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id_number: Option<String>,
    pub parent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id_number: Option<String>,
    pub status: LinkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_name: Option<String>,
}

// =============================================================================
// Message watermarks
// =============================================================================

/// Last-message / last-read watermarks for one message thread, as seen by
/// one reader. Ephemeral; rebuilt from live subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadWatermark {
    pub thread_id: String,
    pub last_message_at: DateTime<Utc>,
    pub last_message_sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Identity and configuration
// =============================================================================

/// Which side of the parent↔student link this device runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Parent,
    Student,
}

/// The local account: raw account id plus the canonical human-readable
/// id-number used as document keys where available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIdentity {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub role: Role,
}

impl LocalIdentity {
    /// Canonical id where known, raw uid otherwise. Used as the alert
    /// document key for this account.
    pub fn canonical_id(&self) -> &str {
        self.id_number.as_deref().unwrap_or(&self.uid)
    }
}

/// Engine configuration stored in ~/.rollcall/config.json.
///
/// Grace minutes and the malformed-range policy differ by caller role, so
/// both are configuration, never constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Window grace when evaluating the local account's own schedule.
    #[serde(default = "default_self_grace_minutes")]
    pub self_grace_minutes: u32,
    /// Window grace when evaluating a linked counterpart's schedule.
    #[serde(default = "default_counterpart_grace_minutes")]
    pub counterpart_grace_minutes: u32,
    /// How long a just-created record is protected from removal when a
    /// transient read fails to re-derive its session.
    #[serde(default = "default_recent_record_secs")]
    pub recent_record_secs: i64,
    #[serde(default = "default_self_range_policy")]
    pub self_range_policy: RangePolicy,
    #[serde(default = "default_counterpart_range_policy")]
    pub counterpart_range_policy: RangePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            tick_interval_secs: default_tick_interval_secs(),
            self_grace_minutes: default_self_grace_minutes(),
            counterpart_grace_minutes: default_counterpart_grace_minutes(),
            recent_record_secs: default_recent_record_secs(),
            self_range_policy: default_self_range_policy(),
            counterpart_range_policy: default_counterpart_range_policy(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_self_grace_minutes() -> u32 {
    1
}

fn default_counterpart_grace_minutes() -> u32 {
    3
}

fn default_recent_record_secs() -> i64 {
    600
}

fn default_self_range_policy() -> RangePolicy {
    RangePolicy::FailClosed
}

fn default_counterpart_range_policy() -> RangePolicy {
    RangePolicy::FailOpen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timetable_shapes_yield_same_entries() {
        let flat: TimetableShape =
            serde_json::from_str(r#"[{"subject":"Math","day":"Monday","time":"8-9"}]"#).unwrap();
        let map: TimetableShape =
            serde_json::from_str(r#"{"Math":[{"day":"Monday","time":"8-9"}]}"#).unwrap();

        assert_eq!(flat.entries(), vec![("Math", "Monday", "8-9")]);
        assert_eq!(map.entries(), vec![("Math", "Monday", "8-9")]);
    }

    #[test]
    fn test_alert_record_unknown_fields_round_trip() {
        let raw = r#"{
            "id": "alert-1",
            "type": "homework_due",
            "title": "Homework",
            "message": "Due tomorrow",
            "createdAt": "2026-03-02T08:00:00Z",
            "status": "unread",
            "subjectId": "s-100",
            "homeworkId": "hw-7"
        }"#;
        let record: AlertRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.kind.0, "homework_due");
        assert!(!record.kind.is_schedule_current());
        assert!(!record.kind.is_pending_decision());

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["homeworkId"], "hw-7");
        assert_eq!(back["type"], "homework_due");
    }

    #[test]
    fn test_alert_document_preserves_siblings() {
        let raw = r#"{"notifications":[],"schemaVersion":2}"#;
        let doc: AlertArrayDocument = serde_json::from_str(raw).unwrap();
        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["schemaVersion"], 2);
    }

    #[test]
    fn test_engine_config_defaults_from_empty_json() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.tick_interval_secs, 60);
        assert_eq!(config.self_grace_minutes, 1);
        assert_eq!(config.counterpart_grace_minutes, 3);
        assert_eq!(config.recent_record_secs, 600);
        assert_eq!(config.self_range_policy, RangePolicy::FailClosed);
        assert_eq!(config.counterpart_range_policy, RangePolicy::FailOpen);
    }

    #[test]
    fn test_canonical_id_falls_back_to_uid() {
        let identity = LocalIdentity {
            uid: "uid-1".into(),
            id_number: None,
            display_name: None,
            role: Role::Parent,
        };
        assert_eq!(identity.canonical_id(), "uid-1");
    }
}
