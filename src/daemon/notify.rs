//! Notification sinks.
//!
//! Chat and mail transports live outside this daemon; everything here goes
//! through the `Notifier` seam, and every failure is logged and swallowed
//! by the callers.

use thiserror::Error;

#[derive(Error, Debug)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

pub trait Notifier: Send {
    fn notify_chat(&self, user: &str, subject: &str, body: &str) -> Result<(), NotifyError>;

    fn notify_mail(
        &self,
        from: &str,
        user: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError>;
}

/// Default sink: the operational log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify_chat(&self, user: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        tracing::info!(user, subject, body, "chat notification");
        Ok(())
    }

    fn notify_mail(
        &self,
        from: &str,
        user: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        tracing::info!(from, user, subject, body, "mail notification");
        Ok(())
    }
}
