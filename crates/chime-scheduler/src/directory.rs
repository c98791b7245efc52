use std::sync::Mutex;

use chime_channels::{ChannelError, EmailDirectory};
use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::info;

use crate::{
    db::{init_db, to_millis},
    error::{Result, SchedulerError},
};

/// SQLite-backed room → email address directory.
pub struct SqliteEmailDirectory {
    conn: Mutex<Connection>,
}

impl SqliteEmailDirectory {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::Poisoned)
    }

    /// Subscribe `address` to `room_id`, re-enabling it if it was disabled.
    pub fn add_address(&self, room_id: &str, address: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO room_emails (room_id, address, enabled, created_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT (room_id, address) DO UPDATE SET enabled = 1",
            params![room_id, address, to_millis(Utc::now())],
        )?;
        info!(%room_id, %address, "email address enabled for room");
        Ok(())
    }

    /// Toggle an existing subscription. Returns `false` if it does not exist.
    pub fn set_enabled(&self, room_id: &str, address: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE room_emails SET enabled = ?1 WHERE room_id = ?2 AND address = ?3",
            params![enabled, room_id, address],
        )?;
        Ok(n > 0)
    }

    fn enabled_addresses(&self, room_id: &str) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT address FROM room_emails
             WHERE room_id = ?1 AND enabled = 1 ORDER BY created_at, address",
        )?;
        let rows = stmt.query_map([room_id], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

impl EmailDirectory for SqliteEmailDirectory {
    fn list_enabled_addresses(&self, room_id: &str) -> std::result::Result<Vec<String>, ChannelError> {
        self.enabled_addresses(room_id)
            .map_err(|e| ChannelError::Directory(e.to_string()))
    }
}
