//! Connector contract: platform-agnostic message types, the adapter trait,
//! and the outbound chunking helper.

use crate::error::Result;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

pub mod discord;
pub mod telegram;

/// Inbound message stream type produced by adapters.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// Reserve for the ` [i/N]` chunk indicator suffix.
const CHUNK_INDICATOR_RESERVE: usize = 8;

/// Platform-agnostic interactive button definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionButton {
    /// Display text, e.g. "Approve".
    pub label: String,
    /// Control action, e.g. "approve".
    pub action: String,
    /// Target agent.
    pub agent_id: String,
}

/// What an inbound message carries, by shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Text {
        text: String,
    },
    Command {
        name: String,
        args: Vec<String>,
    },
    Media {
        text: String,
        /// Temp-file paths downloaded by the adapter; staged into the
        /// worktree (and cleaned up) by the router.
        paths: Vec<String>,
    },
    /// An interactive button was pressed on a previously sent notification.
    Button {
        action: String,
        agent_id: String,
    },
}

/// Platform-agnostic incoming message, populated by the adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub connector_id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub kind: InboundKind,
    /// Routing hints the adapter may have extracted (e.g. from a reply
    /// reference to an agent notification). The router fills these in
    /// during resolution when absent.
    pub project_name: Option<String>,
    pub agent_id: Option<String>,
}

impl InboundMessage {
    pub fn text(
        connector_id: impl Into<String>,
        channel_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            connector_id: connector_id.into(),
            channel_id: channel_id.into(),
            sender_id: sender_id.into(),
            sender_name: String::new(),
            kind: InboundKind::Text { text: text.into() },
            project_name: None,
            agent_id: None,
        }
    }
}

/// Platform-agnostic outgoing message.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub text: String,
    pub media_paths: Vec<String>,
    pub parse_mode: Option<String>,
    /// Rendered as interactive buttons where the platform supports them;
    /// adapters without buttons rely on the textual hint in `text`.
    pub action_buttons: Vec<ActionButton>,
}

impl OutboundMessage {
    pub fn text(channel_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Channel details for the dashboard picker.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Connector health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub connected: bool,
    pub detail: String,
}

/// Static trait for chat platform adapters.
///
/// Adapters own their platform's background tasks: `start` connects and
/// returns the inbound stream; the router drains it. Outbound chunking to the
/// platform limit is the adapter's responsibility (via [`chunk_text`]).
pub trait Connector: Send + Sync + 'static {
    /// Connector id from configuration.
    fn id(&self) -> &str;

    /// Platform type string ("telegram", "discord", ...).
    fn connector_type(&self) -> &str;

    /// Connect to the platform and return the inbound message stream.
    fn start(&self) -> impl std::future::Future<Output = Result<InboundStream>> + Send;

    /// Gracefully stop the adapter.
    fn stop(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Send a message to a channel.
    fn send_message(
        &self,
        message: OutboundMessage,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Check if a channel id is valid and reachable.
    fn validate_channel(
        &self,
        channel_id: &str,
    ) -> impl std::future::Future<Output = bool> + Send;

    /// Get channel details. `None` on failure.
    fn get_channel_info(
        &self,
        channel_id: &str,
    ) -> impl std::future::Future<Output = Option<ChannelInfo>> + Send;

    /// List channels known to the adapter.
    fn list_channels(&self) -> impl std::future::Future<Output = Vec<ChannelInfo>> + Send;

    /// Connector health.
    fn health_check(&self) -> impl std::future::Future<Output = HealthStatus> + Send;

    /// Chats observed since start, persisted into connector settings so they
    /// survive restart. `id -> display name`.
    fn known_chats(&self) -> HashMap<String, String> {
        HashMap::new()
    }
}

/// Dynamic companion trait for `Arc<dyn ConnectorDyn>` storage.
pub trait ConnectorDyn: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn connector_type(&self) -> &str;

    fn start<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>>;

    fn stop<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn send_message<'a>(
        &'a self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn validate_channel<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = bool> + Send + 'a>>;

    fn get_channel_info<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Option<ChannelInfo>> + Send + 'a>>;

    fn list_channels<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Vec<ChannelInfo>> + Send + 'a>>;

    fn health_check<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = HealthStatus> + Send + 'a>>;

    fn known_chats(&self) -> HashMap<String, String>;
}

impl std::fmt::Debug for dyn ConnectorDyn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorDyn")
            .field("id", &self.id())
            .field("connector_type", &self.connector_type())
            .finish()
    }
}

/// Blanket implementation: any `Connector` is usable as `ConnectorDyn`.
impl<T: Connector> ConnectorDyn for T {
    fn id(&self) -> &str {
        Connector::id(self)
    }

    fn connector_type(&self) -> &str {
        Connector::connector_type(self)
    }

    fn start<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>> {
        Box::pin(Connector::start(self))
    }

    fn stop<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Connector::stop(self))
    }

    fn send_message<'a>(
        &'a self,
        message: OutboundMessage,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(Connector::send_message(self, message))
    }

    fn validate_channel<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = bool> + Send + 'a>> {
        Box::pin(Connector::validate_channel(self, channel_id))
    }

    fn get_channel_info<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Option<ChannelInfo>> + Send + 'a>> {
        Box::pin(Connector::get_channel_info(self, channel_id))
    }

    fn list_channels<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Vec<ChannelInfo>> + Send + 'a>> {
        Box::pin(Connector::list_channels(self))
    }

    fn health_check<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = HealthStatus> + Send + 'a>> {
        Box::pin(Connector::health_check(self))
    }

    fn known_chats(&self) -> HashMap<String, String> {
        Connector::known_chats(self)
    }
}

/// Split text into chunks that fit within `limit` characters.
///
/// Preferred split points, in order: paragraph breaks, line breaks, sentence
/// ends, hard limit. Appends ` [i/N]` indicators when more than one chunk is
/// produced.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let effective_limit = limit.saturating_sub(CHUNK_INDICATOR_RESERVE).max(1);
    let mut chunks: Vec<String> = Vec::new();
    let mut remaining = text;

    loop {
        if remaining.chars().count() <= effective_limit {
            chunks.push(remaining.to_string());
            break;
        }
        let window_end = char_offset(remaining, effective_limit);
        let split_pos = find_split_point(&remaining[..window_end], effective_limit);
        chunks.push(remaining[..split_pos].trim_end().to_string());
        remaining = remaining[split_pos..].trim_start();
    }

    if chunks.len() > 1 {
        let total = chunks.len();
        chunks = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| format!("{} [{}/{}]", chunk, i + 1, total))
            .collect();
    }

    chunks
}

/// Byte offset of the `n`th character (or the full length).
fn char_offset(text: &str, n: usize) -> usize {
    text.char_indices().nth(n).map(|(i, _)| i).unwrap_or(text.len())
}

/// Best split point within the window, as a byte offset.
fn find_split_point(window: &str, limit: usize) -> usize {
    let floor = limit / 4;

    if let Some(pos) = window.rfind("\n\n") {
        if pos > floor {
            return pos + 2;
        }
    }
    if let Some(pos) = window.rfind('\n') {
        if pos > floor {
            return pos + 1;
        }
    }
    if let Some(pos) = window.rfind(". ") {
        if pos > floor {
            return pos + 2;
        }
    }
    window.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_text("hello", 100), vec!["hello"]);
    }

    #[test]
    fn chunks_carry_indicators_and_reconstruct() {
        let paragraphs: Vec<String> = (0..20).map(|i| format!("paragraph {i} with some text")).collect();
        let original = paragraphs.join("\n\n");
        let chunks = chunk_text(&original, 120);
        assert!(chunks.len() > 1);

        let total = chunks.len();
        let mut rebuilt = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.chars().count() <= 120, "chunk over limit: {}", chunk.len());
            let indicator = format!(" [{}/{}]", i + 1, total);
            let body = chunk.strip_suffix(&indicator).expect("indicator present");
            rebuilt.push(body.to_string());
        }
        // Paragraph structure survives modulo collapsed break whitespace.
        assert_eq!(
            rebuilt.join(" ").split_whitespace().collect::<Vec<_>>(),
            original.split_whitespace().collect::<Vec<_>>()
        );
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = chunk_text(&text, 100);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with(&"a".repeat(60)));
        assert!(chunks[1].starts_with(&"b".repeat(60)));
    }

    #[test]
    fn hard_splits_unbreakable_text() {
        let text = "z".repeat(250);
        let chunks = chunk_text(&text, 100);
        assert!(chunks.len() >= 3);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100);
        }
    }

    #[test]
    fn hard_split_respects_multibyte_boundaries() {
        let text = "é".repeat(150);
        let chunks = chunk_text(&text, 100);
        assert!(chunks.len() > 1);
        let rebuilt: String = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let indicator = format!(" [{}/{}]", i + 1, chunks.len());
                c.strip_suffix(&indicator).unwrap().to_string()
            })
            .collect();
        assert_eq!(rebuilt, text);
    }
}
