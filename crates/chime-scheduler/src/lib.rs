//! `chime-scheduler`: reminder scheduling over SQLite.
//!
//! # Overview
//!
//! Reminders live in a SQLite `reminders` table. The [`engine::SchedulerEngine`]
//! polls it every tick and hands each due reminder to the
//! [`processor::ReminderProcessor`], which takes a [`lock::DistributedLock`],
//! advances the reminder with [`repeat::advance`], persists it, and only then
//! notifies through the channel router. Several gateway processes may share
//! one database; the lock table keeps each firing to a single sender.
//!
//! # Repeat kinds
//!
//! | Kind     | After firing                                          |
//! |----------|-------------------------------------------------------|
//! | `Once`   | Marked `COMPLETED`                                    |
//! | `Daily`  | Same local time on the next future day                |
//! | `Weekly` | Same local time and weekday in the next future week   |

pub mod db;
pub mod directory;
pub mod engine;
pub mod error;
pub mod lock;
pub mod logs;
pub mod processor;
pub mod repeat;
pub mod store;

pub use directory::SqliteEmailDirectory;
pub use engine::{LockJanitor, SchedulerEngine, TickStats};
pub use error::{Result, SchedulerError};
pub use lock::{DistributedLock, LockGuard, LockStore, SqliteLockStore};
pub use logs::SqliteReminderLogStore;
pub use processor::{ProcessOutcome, ReminderProcessor};
pub use store::{ReminderStore, SqliteReminderStore};
