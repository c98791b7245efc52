//! Repeat advancer: the state transition applied to a reminder each time it fires.
//!
//! | Repeat    | Transition                                                   |
//! |-----------|--------------------------------------------------------------|
//! | `Once`    | status → `Completed`                                         |
//! | `Daily`   | anchor + k local days, smallest k with a result after `now`  |
//! | `Weekly`  | anchor + 7k local days, smallest k with a result after `now` |
//! | `Unknown` | status → `Completed`, with a warning                         |
//!
//! Arithmetic happens on wall-clock time in the reminder's own zone,
//! starting from the `local_anchor` recorded at creation, so a 09:00
//! reminder stays at 09:00 local across DST changes.

use chime_core::{Reminder, ReminderStatus, RepeatType};
use chrono::{DateTime, Days, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::error::{Result, SchedulerError};

/// Compute the state `reminder` moves to when it fires at `now`.
///
/// Pure: the caller persists the returned value.
pub fn advance(reminder: &Reminder, now: DateTime<Utc>) -> Result<Reminder> {
    let mut next = reminder.clone();
    match reminder.repeat_type {
        RepeatType::Once => next.status = ReminderStatus::Completed,
        RepeatType::Daily => {
            next.next_fire_at = next_occurrence(reminder, 1, now)?;
        }
        RepeatType::Weekly => {
            next.next_fire_at = next_occurrence(reminder, 7, now)?;
        }
        RepeatType::Unknown => {
            warn!(reminder_id = reminder.id, "unknown repeat type, marking reminder completed");
            next.status = ReminderStatus::Completed;
        }
    }
    Ok(next)
}

/// Parse the reminder's IANA zone, falling back to UTC.
pub fn reminder_zone(reminder: &Reminder) -> Tz {
    reminder.timezone.parse::<Tz>().unwrap_or_else(|_| {
        warn!(reminder_id = reminder.id, timezone = %reminder.timezone, "unknown timezone, using UTC");
        Tz::UTC
    })
}

/// Wall-clock reading of `at` in `timezone` (UTC if the zone is unknown).
pub fn local_anchor(timezone: &str, at: DateTime<Utc>) -> NaiveDateTime {
    let tz = timezone.parse::<Tz>().unwrap_or(Tz::UTC);
    at.with_timezone(&tz).naive_local()
}

/// First `local_anchor + k * period_days` (k ≥ 1, local calendar days) strictly after `now`.
///
/// Candidates always start from the stored anchor, never from the previous
/// fire time, so a DST gap adjustment on one day does not shift later
/// occurrences.
fn next_occurrence(reminder: &Reminder, period_days: u64, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let tz = reminder_zone(reminder);
    let anchor = reminder.local_anchor;

    // Skip whole periods that are certainly in the past; two periods of
    // slack keep the first candidate at or before `now` across offset changes.
    let elapsed_days = (now.with_timezone(&tz).date_naive() - anchor.date()).num_days();
    let mut k = (elapsed_days.max(0) as u64 / period_days).saturating_sub(2).max(1);
    loop {
        let local = k
            .checked_mul(period_days)
            .and_then(|days| anchor.checked_add_days(Days::new(days)))
            .ok_or_else(|| SchedulerError::Advance {
                id: reminder.id,
                reason: "next occurrence out of range".to_string(),
            })?;
        if let Some(candidate) = resolve_local(&tz, local) {
            if candidate > now {
                return Ok(candidate);
            }
        }
        k += 1;
    }
}

/// Map a wall-clock time to an instant.
///
/// Ambiguous times (clocks falling back) take the earlier instant; times in
/// a gap (clocks springing forward) move one hour later.
fn resolve_local(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| {
            tz.from_local_datetime(&(local + chrono::Duration::hours(1)))
                .earliest()
        })
        .map(|t| t.with_timezone(&Utc))
}
