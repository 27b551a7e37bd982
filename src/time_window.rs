//! Time-window evaluation
//!
//! Parses the flexible "HH:MM(AM/PM)-HH:MM(AM/PM)" range strings found in
//! timetable data and tests whether a wall-clock minute falls inside them.
//! Real documents are messy: bare hours ("8-9"), compact tokens ("0800"),
//! mixed dashes, stray spaces before the meridiem. Malformed ranges never
//! error; they degrade to the caller's `RangePolicy`.

use chrono::Timelike;
use serde::{Deserialize, Serialize};

/// What a malformed or single-sided range means to the caller.
///
/// Parent-side display fails open (missing data still shows the session);
/// student-side alert generation fails closed (no alert from garbage).
/// The choice is per caller, never global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RangePolicy {
    FailOpen,
    FailClosed,
}

/// Accepted range separators: hyphen, en dash, em dash, minus sign.
const SEPARATORS: [char; 4] = ['-', '–', '—', '−'];

/// Parse a single time token to minutes since midnight.
///
/// Accepts `H`, `H:MM`, `HHMM`, each with an optional case-insensitive
/// AM/PM suffix (internal spaces allowed). Returns `None` for anything
/// unparseable; the range policy decides what that means.
pub fn to_minutes_since_midnight(token: &str) -> Option<u32> {
    let upper = token.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return None;
    }

    let (digits, meridiem) = match upper.find(['A', 'P']) {
        Some(pos) => {
            let suffix = &upper[pos..];
            if !matches!(suffix, "AM" | "PM" | "A" | "P") {
                return None;
            }
            (upper[..pos].trim_end(), Some(suffix.starts_with('P')))
        }
        None => (upper.as_str(), None),
    };

    let (hours, minutes) = if let Some((h, m)) = digits.split_once(':') {
        (h.trim().parse::<u32>().ok()?, m.trim().parse::<u32>().ok()?)
    } else if digits.len() >= 3 && digits.chars().all(|c| c.is_ascii_digit()) {
        // Compact HHMM / HMM
        let (h, m) = digits.split_at(digits.len() - 2);
        (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?)
    } else {
        // Bare hour ("8" in "8-9")
        (digits.trim().parse::<u32>().ok()?, 0)
    };

    if minutes >= 60 {
        return None;
    }

    let h24 = match meridiem {
        Some(pm) => {
            if hours == 0 || hours > 12 {
                return None;
            }
            match (pm, hours) {
                (true, 12) => 12,
                (true, h) => h + 12,
                (false, 12) => 0,
                (false, h) => h,
            }
        }
        None => {
            if hours > 23 {
                return None;
            }
            hours
        }
    };

    Some(h24 * 60 + minutes)
}

/// Split a range string on the first recognized separator.
///
/// Single-sided ranges ("8-", "-9") are treated as malformed.
fn split_range(range: &str) -> Option<(&str, &str)> {
    let range = range.trim();
    for sep in SEPARATORS {
        if let Some((start, end)) = range.split_once(sep) {
            let (start, end) = (start.trim(), end.trim());
            if start.is_empty() || end.is_empty() {
                return None;
            }
            return Some((start, end));
        }
    }
    None
}

/// Test whether `now_minutes` (minutes since local midnight) falls inside
/// the range, widened by `grace_minutes` on both ends.
///
/// A range whose end precedes its start crosses midnight: it matches when
/// now is at or after start−grace OR at or before end+grace.
pub fn is_within(
    range: &str,
    now_minutes: u32,
    grace_minutes: u32,
    policy: RangePolicy,
) -> bool {
    let fallback = policy == RangePolicy::FailOpen;

    let Some((start_raw, end_raw)) = split_range(range) else {
        log::debug!("Unparseable time range {:?}, policy {:?}", range, policy);
        return fallback;
    };

    let (start, end) = match (
        to_minutes_since_midnight(start_raw),
        to_minutes_since_midnight(end_raw),
    ) {
        (Some(s), Some(e)) => (s, e),
        _ => {
            log::debug!("Unparseable time token in {:?}, policy {:?}", range, policy);
            return fallback;
        }
    };

    // now >= start - grace, written without underflow
    let after_start = now_minutes + grace_minutes >= start;
    let before_end = now_minutes <= end + grace_minutes;

    if end < start {
        // Midnight rollover, e.g. 11:00PM-01:00AM
        after_start || before_end
    } else {
        after_start && before_end
    }
}

/// Minutes since midnight for a local wall-clock time.
pub fn minutes_of<T: Timelike>(time: &T) -> u32 {
    time.hour() * 60 + time.minute()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_hour_minute() {
        assert_eq!(to_minutes_since_midnight("8:30"), Some(510));
        assert_eq!(to_minutes_since_midnight("08:00"), Some(480));
        assert_eq!(to_minutes_since_midnight("23:59"), Some(1439));
    }

    #[test]
    fn test_token_meridiem() {
        assert_eq!(to_minutes_since_midnight("8:00AM"), Some(480));
        assert_eq!(to_minutes_since_midnight("8:00 pm"), Some(1200));
        assert_eq!(to_minutes_since_midnight("12:00AM"), Some(0));
        assert_eq!(to_minutes_since_midnight("12:15PM"), Some(735));
    }

    #[test]
    fn test_token_compact() {
        assert_eq!(to_minutes_since_midnight("0800"), Some(480));
        assert_eq!(to_minutes_since_midnight("1330"), Some(810));
        assert_eq!(to_minutes_since_midnight("0930PM"), Some(1290));
    }

    #[test]
    fn test_token_bare_hour() {
        assert_eq!(to_minutes_since_midnight("8"), Some(480));
        assert_eq!(to_minutes_since_midnight("23"), Some(1380));
    }

    #[test]
    fn test_token_garbage() {
        assert_eq!(to_minutes_since_midnight(""), None);
        assert_eq!(to_minutes_since_midnight("noon"), None);
        assert_eq!(to_minutes_since_midnight("25:00"), None);
        assert_eq!(to_minutes_since_midnight("8:75"), None);
        assert_eq!(to_minutes_since_midnight("13:00PM"), None);
    }

    #[test]
    fn test_within_basic() {
        // 08:00 == 480
        assert!(is_within("08:00AM-09:30AM", 480, 0, RangePolicy::FailClosed));
        assert!(is_within("08:00AM-09:30AM", 570, 0, RangePolicy::FailClosed));
        assert!(!is_within("08:00AM-09:30AM", 571, 0, RangePolicy::FailClosed));
    }

    #[test]
    fn test_within_grace() {
        // 10:05 with a 09:00-10:00 window
        assert!(!is_within("09:00-10:00", 605, 0, RangePolicy::FailClosed));
        assert!(is_within("09:00-10:00", 605, 10, RangePolicy::FailClosed));
        // grace also widens the start
        assert!(is_within("09:00-10:00", 538, 2, RangePolicy::FailClosed));
        assert!(!is_within("09:00-10:00", 537, 2, RangePolicy::FailClosed));
    }

    #[test]
    fn test_within_rollover() {
        // 11:00PM-01:00AM at 00:30
        assert!(is_within("11:00PM-01:00AM", 30, 0, RangePolicy::FailClosed));
        assert!(is_within("11:00PM-01:00AM", 1400, 0, RangePolicy::FailClosed));
        assert!(!is_within("11:00PM-01:00AM", 720, 0, RangePolicy::FailClosed));
    }

    #[test]
    fn test_within_dash_variants() {
        for range in ["8:00–9:00", "8:00—9:00", "8:00−9:00", " 8:00 - 9:00 "] {
            assert!(is_within(range, 510, 0, RangePolicy::FailClosed), "{range}");
        }
    }

    #[test]
    fn test_malformed_follows_policy() {
        for range in ["", "whenever", "8-", "-9", "8:xx-9:00"] {
            assert!(is_within(range, 0, 0, RangePolicy::FailOpen), "{range}");
            assert!(!is_within(range, 0, 0, RangePolicy::FailClosed), "{range}");
        }
    }

    #[test]
    fn test_bare_hour_range() {
        // "8-9" from legacy map-shaped timetables
        assert!(is_within("8-9", 510, 0, RangePolicy::FailClosed));
        assert!(!is_within("8-9", 545, 0, RangePolicy::FailClosed));
    }
}
