//! Broadcast bus: fan-out of agent updates, metrics, and log records to
//! dashboard subscribers.

use crate::agent::Agent;
use crate::metrics::MetricsSnapshot;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, mpsc};

/// Buffered log records kept for the `history` frame on subscriber join.
const LOG_BUFFER_SIZE: usize = 2000;

/// Per-subscriber frame queue depth; a subscriber that can't keep up is dropped.
const SUBSCRIBER_QUEUE: usize = 256;

/// Trailing output included in an agent_update frame.
const UPDATE_OUTPUT_CAP: usize = 2000;

/// One buffered log record.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

#[derive(Default)]
struct SubscriberSet {
    senders: Vec<mpsc::Sender<serde_json::Value>>,
}

impl SubscriberSet {
    fn subscribe(&mut self) -> mpsc::Receiver<serde_json::Value> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.senders.push(tx);
        rx
    }

    /// Deliver to every subscriber, dropping the ones that fail.
    fn send(&mut self, frame: &serde_json::Value) {
        self.senders.retain(|tx| tx.try_send(frame.clone()).is_ok());
    }
}

/// Fan-out hub for dashboard and log-stream clients.
#[derive(Default)]
pub struct BroadcastBus {
    dashboard: Mutex<SubscriberSet>,
    logs: Mutex<SubscriberSet>,
    /// Std mutex: written from the tracing layer, which is synchronous.
    log_buffer: StdMutex<VecDeque<LogRecord>>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dashboard subscriber (agent updates, terminal output, metrics).
    pub async fn subscribe(&self) -> mpsc::Receiver<serde_json::Value> {
        self.dashboard.lock().await.subscribe()
    }

    /// Register a log subscriber; the buffered history frame arrives first.
    pub async fn subscribe_logs(&self) -> mpsc::Receiver<serde_json::Value> {
        let mut logs = self.logs.lock().await;
        let rx = logs.subscribe();
        let history: Vec<LogRecord> = self
            .log_buffer
            .lock()
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default();
        if let Some(tx) = logs.senders.last() {
            let _ = tx.try_send(serde_json::json!({"type": "history", "logs": history}));
        }
        rx
    }

    pub async fn broadcast(&self, frame: serde_json::Value) {
        self.dashboard.lock().await.send(&frame);
    }

    pub async fn broadcast_agent_update(&self, agent: &Agent) {
        let output_tail: String = agent
            .last_output
            .chars()
            .rev()
            .take(UPDATE_OUTPUT_CAP)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        self.broadcast(serde_json::json!({
            "type": "agent_update",
            "agent_id": agent.id,
            "project": agent.project_name,
            "status": agent.status.as_str(),
            "last_output": output_tail,
            "last_activity": agent.last_activity.to_rfc3339(),
            "task": agent.task_description,
            "sub_agent_count": agent.sub_agent_count,
            "needs_attention": agent.needs_attention,
            "parked": agent.parked,
        }))
        .await;
    }

    pub async fn broadcast_terminal_output(&self, agent_id: &str, output: &str) {
        self.broadcast(serde_json::json!({
            "type": "terminal_output",
            "agent_id": agent_id,
            "output": output,
        }))
        .await;
    }

    pub async fn broadcast_metrics(&self, snapshot: &MetricsSnapshot) {
        let payload = serde_json::to_value(snapshot).unwrap_or_default();
        let mut frame = serde_json::json!({"type": "metrics_update"});
        if let (Some(frame_map), Some(payload_map)) = (frame.as_object_mut(), payload.as_object()) {
            for (key, value) in payload_map {
                frame_map.insert(key.clone(), value.clone());
            }
        }
        self.broadcast(frame).await;
    }

    /// Buffer a log record and push it to log subscribers.
    ///
    /// Synchronous so the tracing layer can call it; delivery uses try_lock
    /// and drops the frame under contention rather than blocking a log site.
    pub fn push_log(&self, record: LogRecord) {
        if let Ok(mut buffer) = self.log_buffer.lock() {
            if buffer.len() == LOG_BUFFER_SIZE {
                buffer.pop_front();
            }
            buffer.push_back(record.clone());
        }
        if let Ok(mut logs) = self.logs.try_lock() {
            let frame = serde_json::json!({
                "type": "log",
                "timestamp": record.timestamp,
                "level": record.level,
                "target": record.target,
                "message": record.message,
            });
            logs.send(&frame);
        }
    }

    pub fn log_history(&self) -> Vec<LogRecord> {
        self.log_buffer
            .lock()
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Tracing layer that mirrors every event into the bus's log stream.
pub struct BusLayer {
    bus: std::sync::Arc<BroadcastBus>,
}

impl BusLayer {
    pub fn new(bus: std::sync::Arc<BroadcastBus>) -> Self {
        Self { bus }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for BusLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.bus.push_log(LogRecord {
            timestamp: chrono::Utc::now().format("%H:%M:%S%.3f").to_string(),
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.render(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn render(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        let fields: Vec<String> = self
            .fields
            .into_iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        if self.message.is_empty() {
            fields.join(" ")
        } else {
            format!("{} {}", self.message, fields.join(" "))
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    #[tokio::test]
    async fn broadcast_reaches_subscriber() {
        let bus = BroadcastBus::new();
        let mut rx = bus.subscribe().await;

        let agent = Agent::new("ab12cd", "api", "forge__api__ab12cd", "/wt", "agent/ab12cd/task");
        bus.broadcast_agent_update(&agent).await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame["type"], "agent_update");
        assert_eq!(frame["agent_id"], "ab12cd");
        assert_eq!(frame["status"], "starting");
    }

    #[tokio::test]
    async fn dead_subscribers_are_dropped() {
        let bus = BroadcastBus::new();
        let rx = bus.subscribe().await;
        drop(rx);

        bus.broadcast(serde_json::json!({"type": "ping"})).await;
        assert!(bus.dashboard.lock().await.senders.is_empty());
    }

    #[tokio::test]
    async fn log_subscriber_receives_history_first() {
        let bus = BroadcastBus::new();
        bus.push_log(LogRecord {
            timestamp: "12:00:00.000".into(),
            level: "INFO".into(),
            target: "forge".into(),
            message: "earlier record".into(),
        });

        let mut rx = bus.subscribe_logs().await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first["type"], "history");
        assert_eq!(first["logs"].as_array().unwrap().len(), 1);

        bus.push_log(LogRecord {
            timestamp: "12:00:01.000".into(),
            level: "WARN".into(),
            target: "forge".into(),
            message: "live record".into(),
        });
        let live = rx.recv().await.unwrap();
        assert_eq!(live["type"], "log");
        assert_eq!(live["message"], "live record");
    }

    #[test]
    fn log_buffer_is_bounded() {
        let bus = BroadcastBus::new();
        for i in 0..(LOG_BUFFER_SIZE + 10) {
            bus.push_log(LogRecord {
                timestamp: String::new(),
                level: "INFO".into(),
                target: "forge".into(),
                message: format!("record {i}"),
            });
        }
        let history = bus.log_history();
        assert_eq!(history.len(), LOG_BUFFER_SIZE);
        assert_eq!(history[0].message, "record 10");
    }
}
