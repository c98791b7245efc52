use std::{future::Future, sync::Arc, time::Duration};

use chime_core::{DeliveryMethod, DeliveryStatus, NotificationChannel, Reminder, ReminderLog};
use chrono::Utc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    channel::{EmailDirectory, EmailTransport, LineTransport, ReminderLogSink},
    error::ChannelError,
};

/// Per-channel outcome of one [`NotificationRouter::send`] call.
///
/// `None` means the channel was not attempted (not selected, or email with
/// no enabled addresses).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub line: Option<DeliveryStatus>,
    pub email: Option<DeliveryStatus>,
}

impl DeliveryReport {
    pub fn any_sent(&self) -> bool {
        self.line == Some(DeliveryStatus::Sent) || self.email == Some(DeliveryStatus::Sent)
    }
}

/// Routes a fired reminder to LINE, email, or both.
///
/// Channel failures are isolated: each channel is bounded by `send_timeout`
/// as a whole (a room's email addresses share one deadline), errors are
/// caught, and every attempted channel yields exactly one ReminderLog row.
/// Nothing here returns an error to the caller.
pub struct NotificationRouter {
    line: Arc<dyn LineTransport>,
    email: Arc<dyn EmailTransport>,
    directory: Arc<dyn EmailDirectory>,
    logs: Arc<dyn ReminderLogSink>,
    send_timeout: Duration,
}

impl NotificationRouter {
    pub fn new(
        line: Arc<dyn LineTransport>,
        email: Arc<dyn EmailTransport>,
        directory: Arc<dyn EmailDirectory>,
        logs: Arc<dyn ReminderLogSink>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            line,
            email,
            directory,
            logs,
            send_timeout,
        }
    }

    /// Deliver `content` over the channel(s) selected on `reminder`.
    ///
    /// Returns once every selected channel has finished or timed out.
    pub async fn send(&self, reminder: &Reminder, content: &str) -> DeliveryReport {
        match reminder.channel {
            NotificationChannel::Line => DeliveryReport {
                line: Some(self.send_line_only(reminder, content).await),
                email: None,
            },
            NotificationChannel::Email => DeliveryReport {
                line: None,
                email: self.send_email_only(reminder, content).await,
            },
            NotificationChannel::Both => {
                let (line, email) = tokio::join!(
                    self.send_line_only(reminder, content),
                    self.send_email_only(reminder, content),
                );
                DeliveryReport {
                    line: Some(line),
                    email,
                }
            }
            NotificationChannel::Unknown => {
                warn!(reminder_id = reminder.id, "notification channel unset, defaulting to LINE");
                DeliveryReport {
                    line: Some(self.send_line_only(reminder, content).await),
                    email: None,
                }
            }
        }
    }

    /// Push to the reminder's LINE room and record the outcome.
    pub async fn send_line_only(&self, reminder: &Reminder, content: &str) -> DeliveryStatus {
        let deadline = Instant::now() + self.send_timeout;
        let result = self
            .bounded(deadline, self.line.push(&reminder.room_id, content))
            .await;
        let now = Utc::now();

        let log = match result {
            Ok(()) => {
                info!(reminder_id = reminder.id, room_id = %reminder.room_id, "LINE reminder sent");
                ReminderLog::sent(reminder, DeliveryMethod::Line, now)
            }
            Err(e) => {
                error!(reminder_id = reminder.id, room_id = %reminder.room_id, error = %e, "LINE reminder failed");
                ReminderLog::failed(reminder, DeliveryMethod::Line, now, e.to_string())
            }
        };
        let status = log.status;
        self.record(&log);
        status
    }

    /// Email every enabled address of the room and record one aggregate row.
    ///
    /// Returns `None` without writing a row when the room has no addresses.
    pub async fn send_email_only(
        &self,
        reminder: &Reminder,
        content: &str,
    ) -> Option<DeliveryStatus> {
        let addresses = match self.directory.list_enabled_addresses(&reminder.room_id) {
            Ok(a) => a,
            Err(e) => {
                error!(reminder_id = reminder.id, error = %e, "email directory lookup failed");
                let log = ReminderLog::failed(reminder, DeliveryMethod::Email, Utc::now(), e.to_string());
                self.record(&log);
                return Some(DeliveryStatus::Failed);
            }
        };

        if addresses.is_empty() {
            info!(reminder_id = reminder.id, room_id = %reminder.room_id, "no enabled email addresses, skipping email");
            return None;
        }

        let deadline = Instant::now() + self.send_timeout;
        let token = Uuid::new_v4().simple().to_string();
        let mut sent = 0usize;
        let mut failures: Vec<String> = Vec::new();

        // One address failing must not stop the others. Addresses still
        // waiting when the deadline passes are recorded as timed out.
        for address in &addresses {
            let result = self
                .bounded(deadline, self.email.send(reminder, address, content, &token))
                .await;
            match result {
                Ok(true) => sent += 1,
                Ok(false) => {
                    warn!(reminder_id = reminder.id, %address, "email transport rejected message");
                    failures.push(format!("{address}: rejected"));
                }
                Err(e) => {
                    warn!(reminder_id = reminder.id, %address, error = %e, "email send failed");
                    failures.push(format!("{address}: {e}"));
                }
            }
        }

        info!(
            reminder_id = reminder.id,
            sent,
            total = addresses.len(),
            "email reminder delivery finished"
        );

        let now = Utc::now();
        let mut log = if sent > 0 {
            ReminderLog::sent(reminder, DeliveryMethod::Email, now)
        } else {
            ReminderLog::failed(reminder, DeliveryMethod::Email, now, "")
        };
        if !failures.is_empty() {
            log.error_message = Some(failures.join("; "));
        }
        let log = log.with_token(Some(token));

        let status = log.status;
        self.record(&log);
        Some(status)
    }

    async fn bounded<T>(
        &self,
        deadline: Instant,
        fut: impl Future<Output = Result<T, ChannelError>>,
    ) -> Result<T, ChannelError> {
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                ms: self.send_timeout.as_millis() as u64,
            }),
        }
    }

    fn record(&self, log: &ReminderLog) {
        if let Err(e) = self.logs.save(log) {
            error!(reminder_id = log.reminder_id, method = %log.method, error = %e, "failed to write reminder log");
        }
    }
}
