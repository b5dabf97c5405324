//! # Operator alerts
//!
//! Failures that need a human (a rebuild that could not complete, a broken
//! data source) are pushed through an [`AlertSink`] instead of being raised,
//! so one bad configuration never stops the rest of a pass.
//!
//! [`Notifier`] logs every alert and fans it out to subscribers over a
//! broadcast channel; forwarding to mail or chat is left to subscribers.
//!
//! ```rust,ignore
//! let notifier = Notifier::new();
//! let mut rx = notifier.subscribe();
//! notifier.notify("rebuild failed", json!({"table": "config_report_demo_cases_1a2b3c4d"}));
//! let alert = rx.recv().await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

/// Default broadcast buffer
const DEFAULT_CAPACITY: usize = 256;

/// A notification for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique id
    pub id: String,
    /// Human readable message
    pub message: String,
    /// Structured context, e.g. the serialized configuration
    pub context: serde_json::Value,
    /// When the alert was raised
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// Create an alert stamped now
    pub fn new(message: impl Into<String>, context: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message: message.into(),
            context,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for operator alerts
pub trait AlertSink: Send + Sync {
    /// Send an alert; must not fail
    fn notify(&self, message: &str, context: serde_json::Value);
}

/// Alert counters
#[derive(Debug, Default)]
pub struct NotifierStats {
    sent: AtomicU64,
    undelivered: AtomicU64,
}

impl NotifierStats {
    /// Alerts raised
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Alerts raised while nobody was subscribed
    pub fn undelivered(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }
}

/// Logging, broadcasting alert sink
pub struct Notifier {
    sender: broadcast::Sender<Alert>,
    stats: NotifierStats,
}

impl Notifier {
    /// Notifier with the default buffer
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Notifier with a custom buffer
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: NotifierStats::default(),
        }
    }

    /// Receive future alerts
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.sender.subscribe()
    }

    /// Counters
    pub fn stats(&self) -> &NotifierStats {
        &self.stats
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertSink for Notifier {
    fn notify(&self, message: &str, context: serde_json::Value) {
        let alert = Alert::new(message, context);
        error!(alert_id = %alert.id, context = %alert.context, "{}", alert.message);
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(alert).is_err() {
            self.stats.undelivered.fetch_add(1, Ordering::Relaxed);
            debug!("no alert subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribers_receive_alerts() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();

        notifier.notify("rebuild failed", json!({"table": "t1"}));
        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.message, "rebuild failed");
        assert_eq!(alert.context["table"], "t1");
        assert_eq!(notifier.stats().sent(), 1);
    }

    #[test]
    fn test_alert_without_subscribers_is_counted() {
        let notifier = Notifier::new();
        notifier.notify("nobody listening", json!({}));
        assert_eq!(notifier.stats().undelivered(), 1);
    }
}
