//! Fire-and-forget notification channel.
//!
//! The pipeline reports progress through a `Notifier`; delivery is
//! best-effort and never blocks or fails a stage. The broadcast
//! implementation serialises tagged JSON messages for any attached
//! listeners (UI bridge, log sink); tests use `NullNotifier` or a
//! subscribed receiver.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Console log severity forwarded to the UI channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A message on the notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum NotifyMessage {
    Event {
        task_id: String,
        name: String,
        payload: serde_json::Value,
    },
    ConsoleLog {
        task_id: String,
        level: LogLevel,
        message: String,
    },
}

/// Outward notification capability, injected into the pipeline context.
pub trait Notifier: Send + Sync {
    /// Emit a named event for a task. Fire-and-forget.
    fn emit(&self, task_id: &str, event_name: &str, payload: serde_json::Value);

    /// Forward a console log line for a task. Fire-and-forget.
    fn console_log(&self, task_id: &str, level: LogLevel, message: &str);
}

/// Broadcasts serialised messages to any number of subscribers.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<String>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    fn send(&self, msg: &NotifyMessage) {
        if let Ok(json) = serde_json::to_string(msg) {
            // A send error only means there are no receivers right now.
            let _ = self.tx.send(json);
        }
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn emit(&self, task_id: &str, event_name: &str, payload: serde_json::Value) {
        self.send(&NotifyMessage::Event {
            task_id: task_id.to_string(),
            name: event_name.to_string(),
            payload,
        });
    }

    fn console_log(&self, task_id: &str, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(%task_id, "{message}"),
            LogLevel::Info => tracing::info!(%task_id, "{message}"),
            LogLevel::Warn => tracing::warn!(%task_id, "{message}"),
            LogLevel::Error => tracing::error!(%task_id, "{message}"),
        }
        self.send(&NotifyMessage::ConsoleLog {
            task_id: task_id.to_string(),
            level,
            message: message.to_string(),
        });
    }
}

/// Discards everything. For tests and headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn emit(&self, _task_id: &str, _event_name: &str, _payload: serde_json::Value) {}

    fn console_log(&self, _task_id: &str, _level: LogLevel, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_broadcast_delivers_to_subscriber() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();
        notifier.emit("T1", "story_completed", json!({"story_id": "S1"}));

        let msg = rx.try_recv().unwrap();
        assert!(msg.contains("story_completed"));
        assert!(msg.contains("S1"));
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let notifier = BroadcastNotifier::new(8);
        notifier.emit("T1", "story_completed", json!({}));
        notifier.console_log("T1", LogLevel::Info, "hello");
    }

    #[test]
    fn test_message_is_tagged_json() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();
        notifier.console_log("T1", LogLevel::Warn, "careful");
        let msg = rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(value["type"], "ConsoleLog");
        assert_eq!(value["data"]["level"], "warn");
    }

    #[test]
    fn test_null_notifier_is_silent() {
        NullNotifier.emit("T1", "x", json!({}));
        NullNotifier.console_log("T1", LogLevel::Error, "ignored");
    }
}
