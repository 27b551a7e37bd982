//! Session extraction
//!
//! Turns a timetable (either storage shape) plus the current local time
//! into the set of sessions happening now, keyed by composite key. The
//! composite key embeds the local calendar date so a session recurring on
//! the same weekday next week never collides with today's record.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Weekday};

use crate::time_window::{is_within, minutes_of, RangePolicy};
use crate::types::{ActiveSession, ActiveSessions, TimetableShape};

/// `day_subject_time_YYYY-MM-DD`.
pub fn composite_key(day: &str, subject: &str, time: &str, date_stamp: &str) -> String {
    format!("{day}_{subject}_{time}_{date_stamp}")
}

/// Weekday name as written in timetable data.
pub fn day_name(date: NaiveDate) -> &'static str {
    match date.weekday() {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Compute the currently active sessions for `current_day` at `now_local`.
///
/// Day comparison is case-insensitive; duplicate source rows collapse to
/// one session per composite key. `grace_minutes` and `policy` come from
/// the caller because self-view and counterpart-view evaluate differently.
pub fn extract_active(
    timetable: &TimetableShape,
    current_day: &str,
    now_local: NaiveDateTime,
    grace_minutes: u32,
    policy: RangePolicy,
) -> ActiveSessions {
    let now_minutes = minutes_of(&now_local.time());
    let date_stamp = now_local.date().format("%Y-%m-%d").to_string();

    let mut active = ActiveSessions::new();
    for (subject, day, time) in timetable.entries() {
        if !day.eq_ignore_ascii_case(current_day) {
            continue;
        }
        if !is_within(time, now_minutes, grace_minutes, policy) {
            continue;
        }
        let key = composite_key(day, subject, time, &date_stamp);
        active.entry(key.clone()).or_insert_with(|| ActiveSession {
            subject: subject.to_string(),
            time: time.to_string(),
            day_key: day.to_string(),
            composite_key: key,
        });
    }
    active
}
