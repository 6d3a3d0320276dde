//! Telegram adapter (teloxide, getUpdates long polling).

use crate::connector::{
    ActionButton, ChannelInfo, Connector, HealthStatus, InboundKind, InboundMessage,
    InboundStream, OutboundMessage, chunk_text,
};
use crate::error::{ConnectorError, Result};
use anyhow::Context as _;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use teloxide::Bot;
use teloxide::net::Download as _;
use teloxide::payloads::{GetUpdatesSetters as _, SendMessageSetters as _};
use teloxide::prelude::Requester as _;
use teloxide::types::{
    ChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, Message, ParseMode, UpdateKind,
};
use tokio::sync::mpsc;

/// Telegram message length limit.
const CHUNK_LIMIT: usize = 4096;

/// Long-poll timeout passed to getUpdates.
const POLL_TIMEOUT_SECS: u32 = 30;

/// Temp directory for downloaded media, cleaned up by the router after staging.
const MEDIA_TMP_PREFIX: &str = "forge_tg_";

pub struct TelegramConnector {
    connector_id: String,
    bot: Bot,
    /// Empty list admits everyone.
    allowed_users: Arc<Vec<i64>>,
    known_chats: Arc<Mutex<HashMap<String, String>>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl TelegramConnector {
    pub fn new(
        connector_id: impl Into<String>,
        credentials: &HashMap<String, String>,
        settings: &HashMap<String, serde_json::Value>,
    ) -> Result<Self> {
        let connector_id = connector_id.into();
        let token = credentials
            .get("bot_token")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ConnectorError::MissingCredential {
                id: connector_id.clone(),
                key: "bot_token".into(),
            })?;

        let allowed_users = settings
            .get("allowed_users")
            .and_then(|v| v.as_array())
            .map(|users| users.iter().filter_map(|u| u.as_i64()).collect())
            .unwrap_or_default();

        let known_chats = settings
            .get("known_chats")
            .and_then(|v| v.as_object())
            .map(|chats| {
                chats
                    .iter()
                    .filter_map(|(id, name)| Some((id.clone(), name.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            connector_id,
            bot: Bot::new(token),
            allowed_users: Arc::new(allowed_users),
            known_chats: Arc::new(Mutex::new(known_chats)),
            shutdown_tx: Mutex::new(None),
        })
    }

    /// Clone sharing the bot handle and chat map, for the poll task.
    fn poll_handle(&self) -> Self {
        Self {
            connector_id: self.connector_id.clone(),
            bot: self.bot.clone(),
            allowed_users: self.allowed_users.clone(),
            known_chats: self.known_chats.clone(),
            shutdown_tx: Mutex::new(None),
        }
    }

    fn user_allowed(&self, user_id: i64) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.contains(&user_id)
    }

    fn remember_chat(&self, chat_id: String, name: String) {
        if let Ok(mut chats) = self.known_chats.lock() {
            chats.insert(chat_id, name);
        }
    }

    /// Download an attached file into a temp directory the router will clean up.
    async fn download_media(&self, file_id: &teloxide::types::FileId, name: &str) -> Option<String> {
        let file = match self.bot.get_file(file_id.clone()).await {
            Ok(file) => file,
            Err(error) => {
                tracing::warn!(%error, "failed to resolve telegram file");
                return None;
            }
        };

        let dir = std::env::temp_dir().join(format!("{MEDIA_TMP_PREFIX}{}", uuid::Uuid::new_v4().simple()));
        if let Err(error) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!(%error, "failed to create media temp dir");
            return None;
        }
        let dest: PathBuf = dir.join(name);

        let mut out = match tokio::fs::File::create(&dest).await {
            Ok(out) => out,
            Err(error) => {
                tracing::warn!(%error, "failed to create media temp file");
                return None;
            }
        };
        if let Err(error) = self.bot.download_file(&file.path, &mut out).await {
            tracing::warn!(%error, "failed to download telegram media");
            return None;
        }
        Some(dest.display().to_string())
    }

    /// Convert a Telegram message into the platform-agnostic inbound shape.
    async fn to_inbound(&self, message: &Message) -> Option<InboundMessage> {
        let user = message.from.as_ref()?;
        if user.is_bot {
            return None;
        }
        if !self.user_allowed(user.id.0 as i64) {
            tracing::warn!(user_id = user.id.0, "telegram user not in allowlist");
            let _ = self.bot.send_message(message.chat.id, "Not authorized.").await;
            return None;
        }

        let chat_id = message.chat.id.to_string();
        let chat_name = message
            .chat
            .title()
            .map(str::to_string)
            .or_else(|| user.username.clone())
            .unwrap_or_else(|| user.full_name());
        self.remember_chat(chat_id.clone(), chat_name);

        let text = message
            .text()
            .or_else(|| message.caption())
            .unwrap_or_default()
            .to_string();

        // Collect any attached media into temp files.
        let mut media_paths: Vec<String> = Vec::new();
        if let Some(photos) = message.photo() {
            // Largest rendition only.
            if let Some(photo) = photos.last() {
                let name = format!("photo_{}.jpg", photo.file.unique_id);
                if let Some(path) = self.download_media(&photo.file.id, &name).await {
                    media_paths.push(path);
                }
            }
        }
        if let Some(document) = message.document() {
            let name = document
                .file_name
                .clone()
                .unwrap_or_else(|| format!("document_{}", document.file.unique_id));
            if let Some(path) = self.download_media(&document.file.id, &name).await {
                media_paths.push(path);
            }
        }
        if let Some(voice) = message.voice() {
            let name = format!("voice_{}.ogg", voice.file.unique_id);
            if let Some(path) = self.download_media(&voice.file.id, &name).await {
                media_paths.push(path);
            }
        }

        let kind = if !media_paths.is_empty() {
            InboundKind::Media {
                text,
                paths: media_paths,
            }
        } else if let Some(rest) = text.strip_prefix('/') {
            let mut parts = rest.split_whitespace();
            let name = parts
                .next()
                .map(|n| n.split('@').next().unwrap_or(n).to_string())
                .unwrap_or_default();
            InboundKind::Command {
                name,
                args: parts.map(str::to_string).collect(),
            }
        } else if text.is_empty() {
            return None;
        } else {
            InboundKind::Text { text }
        };

        Some(InboundMessage {
            connector_id: self.connector_id.clone(),
            channel_id: chat_id,
            sender_id: user.id.to_string(),
            sender_name: user.full_name(),
            kind,
            project_name: None,
            agent_id: None,
        })
    }

    fn parse_chat_id(channel_id: &str) -> Option<ChatId> {
        channel_id.parse::<i64>().ok().map(ChatId)
    }
}

impl Connector for TelegramConnector {
    fn id(&self) -> &str {
        &self.connector_id
    }

    fn connector_type(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<InboundStream> {
        // Fail fast on bad credentials before spawning the poll loop.
        let me = self
            .bot
            .get_me()
            .await
            .context("telegram getMe failed, check bot token")?;
        tracing::info!(
            connector = %self.connector_id,
            bot = %me.username(),
            "telegram connector connected"
        );

        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        if let Ok(mut slot) = self.shutdown_tx.lock() {
            *slot = Some(shutdown_tx);
        }

        let bot = self.bot.clone();
        let connector_id = self.connector_id.clone();
        let this = self.poll_handle();

        tokio::spawn(async move {
            let mut offset: i32 = 0;
            loop {
                let poll = async {
                    bot.get_updates()
                        .offset(offset)
                        .timeout(POLL_TIMEOUT_SECS)
                        .await
                };
                let updates = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = poll => result,
                };

                let updates = match updates {
                    Ok(updates) => updates,
                    Err(error) => {
                        tracing::warn!(%error, connector = %connector_id, "telegram poll failed, backing off");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                for update in updates {
                    offset = offset.max(update.id.0 as i32 + 1);
                    match update.kind {
                        UpdateKind::Message(message) => {
                            if let Some(inbound) = this.to_inbound(&message).await {
                                if inbound_tx.send(inbound).await.is_err() {
                                    return;
                                }
                            }
                        }
                        UpdateKind::CallbackQuery(query) => {
                            // Acknowledge so the client stops its spinner.
                            let _ = bot.answer_callback_query(query.id.clone()).await;

                            let Some(data) = query.data.as_deref() else { continue };
                            let Some((action, agent_id)) = data.split_once(':') else {
                                continue;
                            };
                            let channel_id = query
                                .message
                                .as_ref()
                                .map(|m| m.chat().id.to_string())
                                .unwrap_or_default();
                            let inbound = InboundMessage {
                                connector_id: connector_id.clone(),
                                channel_id,
                                sender_id: query.from.id.to_string(),
                                sender_name: query.from.full_name(),
                                kind: InboundKind::Button {
                                    action: action.to_string(),
                                    agent_id: agent_id.to_string(),
                                },
                                project_name: None,
                                agent_id: Some(agent_id.to_string()),
                            };
                            if inbound_tx.send(inbound).await.is_err() {
                                return;
                            }
                        }
                        _ => {}
                    }
                }
            }
            tracing::info!(connector = %connector_id, "telegram poll loop stopped");
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(
            inbound_rx,
        )))
    }

    async fn stop(&self) -> Result<()> {
        let tx = self.shutdown_tx.lock().ok().and_then(|mut slot| slot.take());
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        Ok(())
    }

    async fn send_message(&self, message: OutboundMessage) -> Result<()> {
        let chat_id = Self::parse_chat_id(&message.channel_id)
            .with_context(|| format!("invalid telegram chat id: {}", message.channel_id))?;

        let chunks = chunk_text(&message.text, CHUNK_LIMIT);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            let mut request = self.bot.send_message(chat_id, chunk);
            if message.parse_mode.as_deref() == Some("markdown") {
                request = request.parse_mode(ParseMode::Markdown);
            }
            // Buttons ride on the final chunk.
            if i == last && !message.action_buttons.is_empty() {
                request = request.reply_markup(button_markup(&message.action_buttons));
            }
            request
                .await
                .context("failed to send telegram message")?;
        }

        for path in &message.media_paths {
            self.bot
                .send_document(chat_id, InputFile::file(PathBuf::from(path)))
                .await
                .context("failed to send telegram document")?;
        }
        Ok(())
    }

    async fn validate_channel(&self, channel_id: &str) -> bool {
        match Self::parse_chat_id(channel_id) {
            Some(chat_id) => self.bot.get_chat(chat_id).await.is_ok(),
            None => false,
        }
    }

    async fn get_channel_info(&self, channel_id: &str) -> Option<ChannelInfo> {
        let chat_id = Self::parse_chat_id(channel_id)?;
        let chat = self.bot.get_chat(chat_id).await.ok()?;
        let name = chat
            .title()
            .map(str::to_string)
            .or_else(|| chat.username().map(str::to_string))
            .unwrap_or_else(|| channel_id.to_string());
        Some(ChannelInfo {
            id: channel_id.to_string(),
            name,
            kind: if chat.is_private() { "dm".into() } else { "group".into() },
        })
    }

    async fn list_channels(&self) -> Vec<ChannelInfo> {
        // Bots can't enumerate chats; offer the ones we've seen.
        let chats = self
            .known_chats
            .lock()
            .map(|chats| chats.clone())
            .unwrap_or_default();
        chats
            .into_iter()
            .map(|(id, name)| ChannelInfo {
                id,
                name,
                kind: "known".into(),
            })
            .collect()
    }

    async fn health_check(&self) -> HealthStatus {
        match self.bot.get_me().await {
            Ok(me) => HealthStatus {
                connected: true,
                detail: format!("@{}", me.username()),
            },
            Err(error) => HealthStatus {
                connected: false,
                detail: error.to_string(),
            },
        }
    }

    fn known_chats(&self) -> HashMap<String, String> {
        self.known_chats
            .lock()
            .map(|chats| chats.clone())
            .unwrap_or_default()
    }
}

fn button_markup(buttons: &[ActionButton]) -> InlineKeyboardMarkup {
    let row: Vec<InlineKeyboardButton> = buttons
        .iter()
        .map(|b| {
            InlineKeyboardButton::callback(b.label.clone(), format!("{}:{}", b.action, b.agent_id))
        })
        .collect();
    InlineKeyboardMarkup::new(vec![row])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> TelegramConnector {
        let credentials = [("bot_token".to_string(), "123:abc".to_string())]
            .into_iter()
            .collect();
        let settings = [(
            "allowed_users".to_string(),
            serde_json::json!([7, 8]),
        )]
        .into_iter()
        .collect();
        TelegramConnector::new("tg", &credentials, &settings).unwrap()
    }

    #[test]
    fn missing_token_is_rejected() {
        let credentials = HashMap::new();
        let settings = HashMap::new();
        assert!(TelegramConnector::new("tg", &credentials, &settings).is_err());
    }

    #[test]
    fn allowlist_is_enforced_when_present() {
        let connector = connector();
        assert!(connector.user_allowed(7));
        assert!(!connector.user_allowed(9));
    }

    #[test]
    fn empty_allowlist_admits_everyone() {
        let credentials = [("bot_token".to_string(), "123:abc".to_string())]
            .into_iter()
            .collect();
        let connector = TelegramConnector::new("tg", &credentials, &HashMap::new()).unwrap();
        assert!(connector.user_allowed(12345));
    }

    #[test]
    fn known_chats_survive_settings_round_trip() {
        let credentials = [("bot_token".to_string(), "123:abc".to_string())]
            .into_iter()
            .collect();
        let settings = [(
            "known_chats".to_string(),
            serde_json::json!({"-100": "team chat"}),
        )]
        .into_iter()
        .collect();
        let connector = TelegramConnector::new("tg", &credentials, &settings).unwrap();
        assert_eq!(
            Connector::known_chats(&connector).get("-100").map(String::as_str),
            Some("team chat")
        );
    }

    #[test]
    fn chat_id_parsing() {
        assert_eq!(
            TelegramConnector::parse_chat_id("-1001234"),
            Some(ChatId(-1001234))
        );
        assert_eq!(TelegramConnector::parse_chat_id("not-a-chat"), None);
    }
}
