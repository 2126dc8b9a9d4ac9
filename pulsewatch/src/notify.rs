use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::MonitorError;

/// Delivery options attached to every outgoing notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationOptions {
    /// Deliver without an audible client notification
    pub silent: bool,
    /// Text carries HTML markup the sink should honor
    pub parse_html: bool,
}

impl NotificationOptions {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }
}

/// Outbound notification channel.
///
/// Dispatch failures are logged by callers and never retried.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(
        &self,
        destination: &str,
        text: &str,
        options: &NotificationOptions,
    ) -> Result<(), MonitorError>;
}

/// One notification captured by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub destination: String,
    pub text: String,
    pub options: NotificationOptions,
}

/// Sink that records notifications in memory instead of delivering them.
///
/// Used by tests and dry-run deployments.
#[derive(Debug, Default)]
pub struct MemorySink {
    sent: Mutex<Vec<SentNotification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far.
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().clone()
    }

    /// Drain and return everything sent so far.
    pub fn take(&self) -> Vec<SentNotification> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn send(
        &self,
        destination: &str,
        text: &str,
        options: &NotificationOptions,
    ) -> Result<(), MonitorError> {
        self.sent.lock().push(SentNotification {
            destination: destination.to_string(),
            text: text.to_string(),
            options: *options,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.send("chat-1", "first", &NotificationOptions::default())
            .await
            .unwrap();
        sink.send("chat-1", "second", &NotificationOptions::silent())
            .await
            .unwrap();

        let sent = sink.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].text, "first");
        assert!(sent[1].options.silent);
        assert!(sink.sent().is_empty());
    }
}
