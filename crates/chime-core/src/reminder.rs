//! Reminder domain types, shared between the scheduler engine, the
//! notification router, and the gateway.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChimeError;

/// How a reminder repeats after it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RepeatType {
    Once,
    Daily,
    Weekly,
    /// Anything the store holds that this build does not understand.
    #[serde(other)]
    Unknown,
}

impl RepeatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepeatType::Once => "ONCE",
            RepeatType::Daily => "DAILY",
            RepeatType::Weekly => "WEEKLY",
            RepeatType::Unknown => "UNKNOWN",
        }
    }

    /// Lenient parse used when reading rows: unrecognised values become
    /// [`RepeatType::Unknown`] so the advancer can apply its fallback.
    pub fn from_stored(s: &str) -> Self {
        s.parse().unwrap_or(RepeatType::Unknown)
    }
}

impl fmt::Display for RepeatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RepeatType {
    type Err = ChimeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ONCE" => Ok(RepeatType::Once),
            "DAILY" => Ok(RepeatType::Daily),
            "WEEKLY" => Ok(RepeatType::Weekly),
            _ => Err(ChimeError::InvalidValue {
                field: "repeat_type",
                value: s.to_string(),
            }),
        }
    }
}

/// Which delivery channels a reminder fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationChannel {
    Line,
    Email,
    Both,
    /// Unset or unrecognised; the router treats it as LINE.
    #[serde(other)]
    Unknown,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Line => "LINE",
            NotificationChannel::Email => "EMAIL",
            NotificationChannel::Both => "BOTH",
            NotificationChannel::Unknown => "UNKNOWN",
        }
    }

    pub fn from_stored(s: Option<&str>) -> Self {
        s.and_then(|v| v.parse().ok())
            .unwrap_or(NotificationChannel::Unknown)
    }
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationChannel {
    type Err = ChimeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LINE" => Ok(NotificationChannel::Line),
            "EMAIL" => Ok(NotificationChannel::Email),
            "BOTH" => Ok(NotificationChannel::Both),
            _ => Err(ChimeError::InvalidValue {
                field: "notification_channel",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle state of a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReminderStatus {
    /// Eligible for firing once `next_fire_at` arrives.
    Active,
    /// Terminal: a ONCE reminder that fired, or an unknown repeat kind.
    Completed,
}

impl ReminderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderStatus::Active => "ACTIVE",
            ReminderStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReminderStatus {
    type Err = ChimeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(ReminderStatus::Active),
            "COMPLETED" => Ok(ReminderStatus::Completed),
            other => Err(ChimeError::InvalidValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted reminder record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    /// Durable row id; the lock key is derived from it.
    pub id: i64,
    /// Target conversation (LINE user, group, or room id).
    pub room_id: String,
    pub content: String,
    /// IANA zone id, e.g. `"Asia/Taipei"`.
    pub timezone: String,
    /// Absolute instant of the next firing.
    pub next_fire_at: DateTime<Utc>,
    /// Wall-clock time of the first firing in `timezone`. Repeats are
    /// computed from it and it is never rewritten.
    pub local_anchor: NaiveDateTime,
    pub repeat_type: RepeatType,
    pub channel: NotificationChannel,
    pub status: ReminderStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Reminder {
    /// Key under which processing of this reminder is serialised cluster-wide.
    pub fn lock_key(&self) -> String {
        format!("reminder_{}", self.id)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ReminderStatus::Active && self.next_fire_at <= now
    }
}

/// Input for creating a reminder; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReminder {
    pub room_id: String,
    pub content: String,
    pub timezone: String,
    pub next_fire_at: DateTime<Utc>,
    pub repeat_type: RepeatType,
    pub channel: NotificationChannel,
    pub created_by: String,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "SENT",
            DeliveryStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = ChimeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "SENT" => Ok(DeliveryStatus::Sent),
            "FAILED" => Ok(DeliveryStatus::Failed),
            other => Err(ChimeError::InvalidValue {
                field: "delivery_status",
                value: other.to_string(),
            }),
        }
    }
}

/// Transport used for one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryMethod {
    Line,
    Email,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMethod::Line => "LINE",
            DeliveryMethod::Email => "EMAIL",
        }
    }
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryMethod {
    type Err = ChimeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "LINE" => Ok(DeliveryMethod::Line),
            "EMAIL" => Ok(DeliveryMethod::Email),
            other => Err(ChimeError::InvalidValue {
                field: "delivery_method",
                value: other.to_string(),
            }),
        }
    }
}

/// One row per delivery attempt per channel. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderLog {
    /// Assigned by the sink; `None` until persisted.
    pub id: Option<i64>,
    pub reminder_id: i64,
    pub room_id: String,
    pub status: DeliveryStatus,
    pub method: DeliveryMethod,
    pub sent_at: DateTime<Utc>,
    /// Click-to-confirm token embedded in reminder emails.
    pub confirmation_token: Option<String>,
    pub error_message: Option<String>,
    pub user_response_status: Option<String>,
    pub user_response_at: Option<DateTime<Utc>>,
}

impl ReminderLog {
    pub fn sent(reminder: &Reminder, method: DeliveryMethod, at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            reminder_id: reminder.id,
            room_id: reminder.room_id.clone(),
            status: DeliveryStatus::Sent,
            method,
            sent_at: at,
            confirmation_token: None,
            error_message: None,
            user_response_status: None,
            user_response_at: None,
        }
    }

    pub fn failed(
        reminder: &Reminder,
        method: DeliveryMethod,
        at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            error_message: Some(error.into()),
            ..Self::sent(reminder, method, at)
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.confirmation_token = token;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Reminder {
        Reminder {
            id: 42,
            room_id: "U123".into(),
            content: "stand-up".into(),
            timezone: "Asia/Taipei".into(),
            next_fire_at: Utc.with_ymd_and_hms(2026, 3, 1, 1, 0, 0).unwrap(),
            local_anchor: NaiveDateTime::parse_from_str("2026-03-01 09:00", "%Y-%m-%d %H:%M")
                .unwrap(),
            repeat_type: RepeatType::Daily,
            channel: NotificationChannel::Both,
            status: ReminderStatus::Active,
            created_by: "U123".into(),
            created_at: Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn lock_key_uses_reminder_id() {
        assert_eq!(sample().lock_key(), "reminder_42");
    }

    #[test]
    fn due_boundary_is_inclusive() {
        let r = sample();
        assert!(r.is_due(r.next_fire_at));
        assert!(!r.is_due(r.next_fire_at - chrono::Duration::seconds(1)));
    }

    #[test]
    fn completed_reminder_is_never_due() {
        let mut r = sample();
        r.status = ReminderStatus::Completed;
        assert!(!r.is_due(r.next_fire_at + chrono::Duration::days(1)));
    }

    #[test]
    fn stored_repeat_type_falls_back_to_unknown() {
        assert_eq!(RepeatType::from_stored("daily"), RepeatType::Daily);
        assert_eq!(RepeatType::from_stored("MONTHLY"), RepeatType::Unknown);
    }

    #[test]
    fn stored_channel_null_is_unknown() {
        assert_eq!(NotificationChannel::from_stored(None), NotificationChannel::Unknown);
        assert_eq!(
            NotificationChannel::from_stored(Some("both")),
            NotificationChannel::Both
        );
    }

    #[test]
    fn unknown_repeat_type_deserializes() {
        let t: RepeatType = serde_json::from_str(r#""HOURLY""#).unwrap();
        assert_eq!(t, RepeatType::Unknown);
    }

    #[test]
    fn failed_log_carries_error() {
        let r = sample();
        let log = ReminderLog::failed(&r, DeliveryMethod::Line, r.next_fire_at, "boom");
        assert_eq!(log.status, DeliveryStatus::Failed);
        assert_eq!(log.error_message.as_deref(), Some("boom"));
        assert_eq!(log.reminder_id, 42);
    }
}
