use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No reminder with the given ID exists in the store.
    #[error("Reminder not found: {id}")]
    ReminderNotFound { id: i64 },

    /// A store mutex was poisoned by a panicking holder.
    #[error("Store connection poisoned")]
    Poisoned,

    /// The next occurrence of a repeating reminder could not be computed.
    #[error("Cannot advance reminder {id}: {reason}")]
    Advance { id: i64, reason: String },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
