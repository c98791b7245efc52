use async_trait::async_trait;
use chime_channels::{ChannelError, EmailTransport};
use chime_core::{config::EmailConfig, Reminder};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, warn};

/// SMTP relay transport (STARTTLS).
pub struct SmtpEmailTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    confirm_base_url: Option<String>,
}

impl SmtpEmailTransport {
    pub fn new(config: &EmailConfig) -> Result<Self, ChannelError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| ChannelError::ConfigError(format!("invalid from address: {e}")))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| ChannelError::ConfigError(format!("smtp relay: {e}")))?
            .port(config.smtp_port);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
            confirm_base_url: config
                .confirm_base_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
        })
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    async fn send(
        &self,
        reminder: &Reminder,
        address: &str,
        content: &str,
        confirmation_token: &str,
    ) -> Result<bool, ChannelError> {
        let to: Mailbox = address
            .parse()
            .map_err(|e| ChannelError::SendFailed(format!("invalid address {address}: {e}")))?;

        let link = self
            .confirm_base_url
            .as_deref()
            .map(|base| confirm_url(base, confirmation_token));
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject_line(content))
            .header(ContentType::TEXT_PLAIN)
            .body(body_text(content, link.as_deref()))
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;

        debug!(reminder_id = reminder.id, %address, "sending reminder email");
        match self.mailer.send(message).await {
            Ok(resp) => Ok(resp.is_positive()),
            Err(e) => {
                warn!(reminder_id = reminder.id, %address, error = %e, "smtp send failed");
                Err(ChannelError::SendFailed(e.to_string()))
            }
        }
    }
}

/// Stand-in used when no SMTP relay is configured.
pub struct UnconfiguredEmail;

#[async_trait]
impl EmailTransport for UnconfiguredEmail {
    async fn send(&self, _: &Reminder, _: &str, _: &str, _: &str) -> Result<bool, ChannelError> {
        Err(ChannelError::ConfigError("SMTP relay not configured".to_string()))
    }
}

const SUBJECT_PREVIEW_CHARS: usize = 60;

fn subject_line(content: &str) -> String {
    let first = content.lines().next().unwrap_or("").trim();
    if first.is_empty() {
        return "Reminder".to_string();
    }
    let mut preview: String = first.chars().take(SUBJECT_PREVIEW_CHARS).collect();
    if first.chars().count() > SUBJECT_PREVIEW_CHARS {
        preview.push('…');
    }
    format!("Reminder: {preview}")
}

fn body_text(content: &str, confirm_link: Option<&str>) -> String {
    match confirm_link {
        Some(link) => format!("{content}\n\nGot it? Let us know: {link}\n"),
        None => format!("{content}\n"),
    }
}

fn confirm_url(base: &str, token: &str) -> String {
    format!("{base}/reminders/confirm/{token}")
}
