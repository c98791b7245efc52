//! `chime-channels`: delivery side of reminder scheduling.
//!
//! Transports (LINE push, email) and the enhancement function are traits so
//! the gateway can plug in real clients and tests can plug in fakes. The
//! [`NotificationRouter`] fans a fired reminder out to the configured
//! channels and records one [`ReminderLog`](chime_core::ReminderLog) row per
//! channel attempted.

pub mod channel;
pub mod enhance;
pub mod error;
pub mod router;

pub use channel::{ContentEnhancer, EmailDirectory, EmailTransport, LineTransport, ReminderLogSink};
pub use enhance::{enhance_or_raw, PassthroughEnhancer};
pub use error::ChannelError;
pub use router::{DeliveryReport, NotificationRouter};
