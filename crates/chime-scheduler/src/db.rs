use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{types::Type, Connection};

use crate::error::Result;

/// Initialise the scheduler schema in `conn`. Safe to call on every startup.
///
/// Instants are stored as epoch milliseconds so range queries compare
/// integers rather than formatted strings.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS reminders (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id       TEXT    NOT NULL,
            content       TEXT    NOT NULL,
            timezone      TEXT    NOT NULL,
            next_fire_at  INTEGER NOT NULL,   -- epoch ms, UTC
            local_anchor  TEXT    NOT NULL,   -- first fire, wall clock in `timezone`
            repeat_type   TEXT    NOT NULL,   -- ONCE | DAILY | WEEKLY
            channel       TEXT,               -- LINE | EMAIL | BOTH, NULL = LINE
            status        TEXT    NOT NULL DEFAULT 'ACTIVE',
            created_by    TEXT    NOT NULL,
            created_at    INTEGER NOT NULL
        );

        -- Polling: SELECT … WHERE status = 'ACTIVE' AND next_fire_at <= ?
        CREATE INDEX IF NOT EXISTS idx_reminders_due ON reminders (status, next_fire_at);
        CREATE INDEX IF NOT EXISTS idx_reminders_room ON reminders (room_id);

        CREATE TABLE IF NOT EXISTS reminder_logs (
            id                    INTEGER PRIMARY KEY AUTOINCREMENT,
            reminder_id           INTEGER NOT NULL,
            room_id               TEXT    NOT NULL,
            status                TEXT    NOT NULL,   -- SENT | FAILED
            method                TEXT    NOT NULL,   -- LINE | EMAIL
            sent_at               INTEGER NOT NULL,
            confirmation_token    TEXT,
            error_message         TEXT,
            user_response_status  TEXT,
            user_response_at      INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_reminder_logs_reminder ON reminder_logs (reminder_id);
        CREATE INDEX IF NOT EXISTS idx_reminder_logs_token ON reminder_logs (confirmation_token);

        -- One row per held lock; the primary key is the mutual exclusion.
        CREATE TABLE IF NOT EXISTS scheduler_locks (
            lock_key     TEXT    NOT NULL PRIMARY KEY,
            owner        TEXT    NOT NULL,
            acquired_at  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_scheduler_locks_acquired ON scheduler_locks (acquired_at);

        CREATE TABLE IF NOT EXISTS room_emails (
            room_id     TEXT    NOT NULL,
            address     TEXT    NOT NULL,
            enabled     INTEGER NOT NULL DEFAULT 1,
            created_at  INTEGER NOT NULL,
            PRIMARY KEY (room_id, address)
        );
        ",
    )?;
    Ok(())
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Convert a stored epoch-ms column back to an instant.
pub(crate) fn from_millis(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {ms}").into(),
        )
    })
}

const LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

pub(crate) fn to_local_text(at: NaiveDateTime) -> String {
    at.format(LOCAL_FORMAT).to_string()
}

/// Parse a stored wall-clock column.
pub(crate) fn from_local_text(idx: usize, text: &str) -> rusqlite::Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('reminders', 'reminder_logs', 'scheduler_locks', 'room_emails')",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn millis_round_trip_keeps_precision() {
        let at = DateTime::from_timestamp_millis(1_767_225_600_123).unwrap();
        assert_eq!(from_millis(0, to_millis(at)).unwrap(), at);
    }
}
