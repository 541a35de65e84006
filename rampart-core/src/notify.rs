//! Best-effort webhook notifications.
//!
//! The notification channel is a side channel: its failure is logged by the
//! engine and never changes the run's real terminal status.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to build notification client")]
    Client(#[source] reqwest::Error),
    #[error("failed to send notification")]
    Send(#[source] reqwest::Error),
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, success: bool, message: &str) -> Result<(), NotifyError>;
}

fn payload(success: bool, message: &str) -> serde_json::Value {
    serde_json::json!({
        "status": if success { "success" } else { "failure" },
        "message": message,
    })
}

/// Posts a small JSON payload to a configured webhook with a short timeout.
#[derive(Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(NotifyError::Client)?;
        Ok(WebhookNotifier {
            client,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, success: bool, message: &str) -> Result<(), NotifyError> {
        self.client
            .post(&self.url)
            .json(&payload(success, message))
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(NotifyError::Send)?;
        tracing::debug!("notification sent");
        Ok(())
    }
}

/// Used when no webhook is configured; the notification becomes a log line so
/// the exactly-once contract still holds.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, success: bool, message: &str) -> Result<(), NotifyError> {
        if success {
            tracing::info!(message = %message, "run notification");
        } else {
            tracing::error!(message = %message, "run notification");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    #[derive(Debug, Default)]
    pub(crate) struct RecordingNotifier {
        pub sends: AtomicUsize,
        pub last: Mutex<Option<(bool, String)>>,
    }

    #[async_trait::async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, success: bool, message: &str) -> Result<(), NotifyError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some((success, message.to_owned()));
            Ok(())
        }
    }

    /// A notifier whose sends always fail, for the swallow-and-log path.
    #[derive(Debug, Default)]
    pub(crate) struct BrokenNotifier {
        pub sends: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Notifier for BrokenNotifier {
        async fn send(&self, _success: bool, _message: &str) -> Result<(), NotifyError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Err(NotifyError::Client(
                reqwest::Client::builder()
                    .user_agent("\u{0}")
                    .build()
                    .unwrap_err(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_payload_status() {
        let ok = payload(true, "backup myapp completed");
        assert_eq!(ok["status"], "success");
        assert_eq!(ok["message"], "backup myapp completed");

        let bad = payload(false, "backup myapp failed");
        assert_eq!(bad["status"], "failure");
    }
}
