//! `chime-core`: configuration, errors, and the reminder domain types shared
//! by the scheduler, the channel router, and the gateway binary.

pub mod config;
pub mod error;
pub mod reminder;

pub use config::ChimeConfig;
pub use error::{ChimeError, Result};
pub use reminder::{
    DeliveryMethod, DeliveryStatus, NewReminder, NotificationChannel, Reminder, ReminderLog,
    ReminderStatus, RepeatType,
};
