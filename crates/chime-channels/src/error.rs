use thiserror::Error;

/// Errors raised by delivery transports and their collaborators.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// A message could not be delivered to the remote endpoint.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// An operation exceeded its allowed time budget.
    #[error("Operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The transport is not configured in this deployment.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The email directory could not be read.
    #[error("Directory lookup failed: {0}")]
    Directory(String),

    /// The enhancement service failed or returned garbage.
    #[error("Enhancement failed: {0}")]
    Enhance(String),

    /// A ReminderLog row could not be written.
    #[error("Log write failed: {0}")]
    Log(String),
}
