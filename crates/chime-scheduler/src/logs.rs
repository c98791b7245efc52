use std::sync::Mutex;

use chime_channels::{ChannelError, ReminderLogSink};
use chime_core::{DeliveryMethod, DeliveryStatus, ReminderLog};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::{
    db::{from_millis, init_db, to_millis},
    error::{Result, SchedulerError},
};

/// User-response status written when an email confirm link is followed.
pub const RESPONSE_CONFIRMED: &str = "CONFIRMED";

/// SQLite-backed append-only store of delivery attempts.
pub struct SqliteReminderLogStore {
    conn: Mutex<Connection>,
}

impl SqliteReminderLogStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::Poisoned)
    }

    /// Append one row and return its id.
    pub fn append(&self, log: &ReminderLog) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO reminder_logs
             (reminder_id, room_id, status, method, sent_at, confirmation_token,
              error_message, user_response_status, user_response_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                log.reminder_id,
                log.room_id,
                log.status.as_str(),
                log.method.as_str(),
                to_millis(log.sent_at),
                log.confirmation_token,
                log.error_message,
                log.user_response_status,
                log.user_response_at.map(to_millis),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(log_id = id, reminder_id = log.reminder_id, status = %log.status, "reminder log appended");
        Ok(id)
    }

    /// Every attempt recorded for `reminder_id`, oldest first.
    pub fn list_for_reminder(&self, reminder_id: i64) -> Result<Vec<ReminderLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, reminder_id, room_id, status, method, sent_at, confirmation_token,
                    error_message, user_response_status, user_response_at
             FROM reminder_logs WHERE reminder_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([reminder_id], row_to_log)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Record that the recipient clicked the confirm link carrying `token`.
    ///
    /// Returns `false` for unknown or already-confirmed tokens.
    pub fn confirm(&self, token: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE reminder_logs
             SET user_response_status = ?1, user_response_at = ?2
             WHERE confirmation_token = ?3 AND user_response_status IS NULL",
            params![RESPONSE_CONFIRMED, to_millis(at), token],
        )?;
        if n > 0 {
            info!(rows = n, "reminder confirmed by recipient");
        }
        Ok(n > 0)
    }
}

impl ReminderLogSink for SqliteReminderLogStore {
    fn save(&self, log: &ReminderLog) -> std::result::Result<(), ChannelError> {
        self.append(log)
            .map(|_| ())
            .map_err(|e| ChannelError::Log(e.to_string()))
    }
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReminderLog> {
    let status: String = row.get(3)?;
    let method: String = row.get(4)?;
    let response_at: Option<i64> = row.get(9)?;
    let conversion = |idx: usize, e: chime_core::ChimeError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };

    Ok(ReminderLog {
        id: Some(row.get(0)?),
        reminder_id: row.get(1)?,
        room_id: row.get(2)?,
        status: status
            .parse::<DeliveryStatus>()
            .map_err(|e| conversion(3, e))?,
        method: method
            .parse::<DeliveryMethod>()
            .map_err(|e| conversion(4, e))?,
        sent_at: from_millis(5, row.get(5)?)?,
        confirmation_token: row.get(6)?,
        error_message: row.get(7)?,
        user_response_status: row.get(8)?,
        user_response_at: response_at.map(|ms| from_millis(9, ms)).transpose()?,
    })
}
