//! User-visible notifications. The core reports through a sink and never
//! renders anything itself.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Connection,
    Authorization,
    Replication,
    VirtualHook,
    Trade,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub severity: Severity,
    pub topic: Topic,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn new(severity: Severity, topic: Topic, message: impl Into<String>) -> Self {
        Self {
            severity,
            topic,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn info(topic: Topic, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, topic, message)
    }

    pub fn warning(topic: Topic, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, topic, message)
    }

    pub fn error(topic: Topic, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, topic, message)
    }
}

/// Destination for notifications (toast, journal, log).
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, n: Notification) {
        match n.severity {
            Severity::Info => info!(topic = ?n.topic, "{}", n.message),
            Severity::Warning => warn!(topic = ?n.topic, "{}", n.message),
            Severity::Error => error!(topic = ?n.topic, "{}", n.message),
        }
    }
}

/// Logs and re-broadcasts notifications to any number of listeners.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, n: Notification) {
        TracingSink.notify(n.clone());
        // No listeners is fine.
        let _ = self.tx.send(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_sink_delivers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();

        sink.notify(Notification::warning(Topic::VirtualHook, "no counterpart"));

        let got = rx.try_recv().unwrap();
        assert_eq!(got.severity, Severity::Warning);
        assert_eq!(got.topic, Topic::VirtualHook);
        assert_eq!(got.message, "no counterpart");
    }
}
