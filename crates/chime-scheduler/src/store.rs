use std::sync::Mutex;

use chime_core::{NewReminder, NotificationChannel, Reminder, ReminderStatus, RepeatType};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, instrument, warn};

use crate::{
    db::{from_local_text, from_millis, init_db, to_local_text, to_millis},
    error::{Result, SchedulerError},
    repeat::local_anchor,
};

/// Persistence contract for reminders.
///
/// Several scheduler processes may share one backing store; implementations
/// only need per-call atomicity; cross-process exclusion is the lock's job.
pub trait ReminderStore: Send + Sync {
    /// Persist a new ACTIVE reminder and return it with its assigned id.
    fn insert(&self, new: &NewReminder) -> Result<Reminder>;

    /// All ACTIVE reminders with `next_fire_at <= before`, oldest first.
    fn find_due(&self, before: DateTime<Utc>) -> Result<Vec<Reminder>>;

    fn find_by_id(&self, id: i64) -> Result<Option<Reminder>>;

    fn find_by_room(&self, room_id: &str) -> Result<Vec<Reminder>>;

    /// Write back the mutable state of an existing reminder in one transaction.
    fn save(&self, reminder: &Reminder) -> Result<()>;

    /// Delete a reminder. Returns `false` if it did not exist.
    fn delete(&self, id: i64) -> Result<bool>;
}

const SELECT_COLUMNS: &str = "SELECT id, room_id, content, timezone, next_fire_at, repeat_type,
                                     channel, status, created_by, created_at, local_anchor
                              FROM reminders";

/// SQLite-backed [`ReminderStore`].
pub struct SqliteReminderStore {
    conn: Mutex<Connection>,
}

impl SqliteReminderStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::Poisoned)
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Reminder>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let reminders = stmt
            .query_map(args, row_to_reminder)?
            .filter_map(|r| match r {
                Ok(reminder) => Some(reminder),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable reminder row");
                    None
                }
            })
            .collect();
        Ok(reminders)
    }
}

impl ReminderStore for SqliteReminderStore {
    #[instrument(skip(self, new), fields(room_id = %new.room_id))]
    fn insert(&self, new: &NewReminder) -> Result<Reminder> {
        let now = Utc::now();
        // Instants are returned at stored (millisecond) precision.
        let next_fire_at = from_millis(4, to_millis(new.next_fire_at))?;
        let anchor = local_anchor(&new.timezone, next_fire_at);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO reminders
             (room_id, content, timezone, next_fire_at, local_anchor, repeat_type, channel,
              status, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'ACTIVE', ?8, ?9)",
            params![
                new.room_id,
                new.content,
                new.timezone,
                to_millis(next_fire_at),
                to_local_text(anchor),
                new.repeat_type.as_str(),
                new.channel.as_str(),
                new.created_by,
                to_millis(now),
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(reminder_id = id, next_fire_at = %new.next_fire_at, "reminder created");

        Ok(Reminder {
            id,
            room_id: new.room_id.clone(),
            content: new.content.clone(),
            timezone: new.timezone.clone(),
            next_fire_at,
            local_anchor: anchor,
            repeat_type: new.repeat_type,
            channel: new.channel,
            status: ReminderStatus::Active,
            created_by: new.created_by.clone(),
            created_at: from_millis(0, to_millis(now))?,
        })
    }

    fn find_due(&self, before: DateTime<Utc>) -> Result<Vec<Reminder>> {
        self.query(
            &format!(
                "{SELECT_COLUMNS} WHERE status = 'ACTIVE' AND next_fire_at <= ?1
                 ORDER BY next_fire_at"
            ),
            [to_millis(before)],
        )
    }

    fn find_by_id(&self, id: i64) -> Result<Option<Reminder>> {
        let conn = self.conn()?;
        let reminder = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                [id],
                row_to_reminder,
            )
            .optional()?;
        Ok(reminder)
    }

    fn find_by_room(&self, room_id: &str) -> Result<Vec<Reminder>> {
        self.query(
            &format!("{SELECT_COLUMNS} WHERE room_id = ?1 ORDER BY next_fire_at"),
            [room_id],
        )
    }

    #[instrument(skip(self, reminder), fields(reminder_id = reminder.id))]
    fn save(&self, reminder: &Reminder) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let n = tx.execute(
            "UPDATE reminders
             SET content = ?1, timezone = ?2, next_fire_at = ?3, repeat_type = ?4,
                 channel = ?5, status = ?6
             WHERE id = ?7",
            params![
                reminder.content,
                reminder.timezone,
                to_millis(reminder.next_fire_at),
                reminder.repeat_type.as_str(),
                reminder.channel.as_str(),
                reminder.status.as_str(),
                reminder.id,
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::ReminderNotFound { id: reminder.id });
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM reminders WHERE id = ?1", [id])?;
        if n > 0 {
            info!(reminder_id = id, "reminder deleted");
        }
        Ok(n > 0)
    }
}

/// Map a SQLite row to a `Reminder`.
fn row_to_reminder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reminder> {
    let status: String = row.get(7)?;
    let status = status.parse::<ReminderStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let repeat: String = row.get(5)?;
    let channel: Option<String> = row.get(6)?;
    let anchor: String = row.get(10)?;

    Ok(Reminder {
        id: row.get(0)?,
        room_id: row.get(1)?,
        content: row.get(2)?,
        timezone: row.get(3)?,
        next_fire_at: from_millis(4, row.get(4)?)?,
        local_anchor: from_local_text(10, &anchor)?,
        repeat_type: RepeatType::from_stored(&repeat),
        channel: NotificationChannel::from_stored(channel.as_deref()),
        status,
        created_by: row.get(8)?,
        created_at: from_millis(9, row.get(9)?)?,
    })
}
