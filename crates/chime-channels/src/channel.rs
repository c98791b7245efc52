use async_trait::async_trait;
use chime_core::{Reminder, ReminderLog};

use crate::error::ChannelError;

/// Push transport for LINE rooms.
///
/// Implementations must be `Send + Sync` so one instance can be shared by
/// every worker of the scheduler loop.
#[async_trait]
pub trait LineTransport: Send + Sync {
    /// Push `message` to the LINE user, group, or room `room_id`.
    async fn push(&self, room_id: &str, message: &str) -> Result<(), ChannelError>;
}

/// Lookup of the email addresses subscribed to a room.
pub trait EmailDirectory: Send + Sync {
    /// Addresses with `enabled = true` for `room_id`. An empty list is not an error.
    fn list_enabled_addresses(&self, room_id: &str) -> Result<Vec<String>, ChannelError>;
}

/// Outbound email transport.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    /// Deliver `content` for `reminder` to a single `address`.
    ///
    /// `Ok(false)` means the transport refused the message without raising;
    /// the router records it as a failure just like `Err`.
    async fn send(
        &self,
        reminder: &Reminder,
        address: &str,
        content: &str,
        confirmation_token: &str,
    ) -> Result<bool, ChannelError>;
}

/// Append-only sink for delivery attempts.
pub trait ReminderLogSink: Send + Sync {
    fn save(&self, log: &ReminderLog) -> Result<(), ChannelError>;
}

/// Best-effort rewrite of reminder text before delivery.
#[async_trait]
pub trait ContentEnhancer: Send + Sync {
    async fn enhance(&self, text: &str) -> Result<String, ChannelError>;
}
