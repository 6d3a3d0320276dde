//! Discord adapter (serenity gateway).

use crate::connector::{
    ActionButton, ChannelInfo, Connector, HealthStatus, InboundKind, InboundMessage,
    InboundStream, OutboundMessage, chunk_text,
};
use crate::error::{ConnectorError, Result};
use anyhow::Context as _;
use async_trait::async_trait;
use serenity::all::{
    ChannelId, Context, CreateActionRow, CreateAttachment, CreateButton,
    CreateInteractionResponse, CreateMessage, EventHandler, GatewayIntents, Http, Interaction,
    Message, Ready, ShardManager,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

/// Discord message length limit.
const CHUNK_LIMIT: usize = 2000;

const MEDIA_TMP_PREFIX: &str = "forge_dc_";

pub struct DiscordConnector {
    connector_id: String,
    token: String,
    /// Empty list admits everyone.
    allowed_users: Vec<u64>,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    known_chats: Arc<std::sync::Mutex<HashMap<String, String>>>,
    shard_manager: Arc<RwLock<Option<Arc<ShardManager>>>>,
}

impl DiscordConnector {
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
            })?
            .clone();

        let allowed_users = settings
            .get("allowed_users")
            .and_then(|v| v.as_array())
            .map(|users| users.iter().filter_map(|u| u.as_u64()).collect())
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
            token,
            allowed_users,
            http: Arc::new(RwLock::new(None)),
            known_chats: Arc::new(std::sync::Mutex::new(known_chats)),
            shard_manager: Arc::new(RwLock::new(None)),
        })
    }

    async fn get_http(&self) -> Result<Arc<Http>> {
        self.http
            .read()
            .await
            .clone()
            .ok_or_else(|| ConnectorError::NotRunning(self.connector_id.clone()).into())
    }

    fn parse_channel_id(channel_id: &str) -> Option<ChannelId> {
        channel_id
            .parse::<u64>()
            .ok()
            .filter(|id| *id != 0)
            .map(ChannelId::new)
    }
}

struct Handler {
    connector_id: String,
    allowed_users: Vec<u64>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    known_chats: Arc<std::sync::Mutex<HashMap<String, String>>>,
}

impl Handler {
    fn user_allowed(&self, user_id: u64) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.contains(&user_id)
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(connector = %self.connector_id, bot = %ready.user.name, "discord connector connected");
    }

    async fn message(&self, _ctx: Context, message: Message) {
        if message.author.bot {
            return;
        }
        if !self.user_allowed(message.author.id.get()) {
            tracing::warn!(user_id = message.author.id.get(), "discord user not in allowlist, ignoring");
            return;
        }

        let channel_id = message.channel_id.get().to_string();
        if let Ok(mut chats) = self.known_chats.lock() {
            chats.insert(channel_id.clone(), format!("#{}", message.channel_id.get()));
        }

        // Download attachments into temp files for staging.
        let mut media_paths: Vec<String> = Vec::new();
        for attachment in &message.attachments {
            let bytes = match attachment.download().await {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::warn!(%error, "failed to download discord attachment");
                    continue;
                }
            };
            let dir = std::env::temp_dir()
                .join(format!("{MEDIA_TMP_PREFIX}{}", uuid::Uuid::new_v4().simple()));
            if tokio::fs::create_dir_all(&dir).await.is_err() {
                continue;
            }
            let dest = dir.join(&attachment.filename);
            if tokio::fs::write(&dest, &bytes).await.is_ok() {
                media_paths.push(dest.display().to_string());
            }
        }

        let text = message.content.clone();
        let kind = if !media_paths.is_empty() {
            InboundKind::Media {
                text,
                paths: media_paths,
            }
        } else if let Some(rest) = text.strip_prefix('/') {
            let mut parts = rest.split_whitespace();
            let name = parts.next().unwrap_or_default().to_string();
            InboundKind::Command {
                name,
                args: parts.map(str::to_string).collect(),
            }
        } else if text.is_empty() {
            return;
        } else {
            InboundKind::Text { text }
        };

        let inbound = InboundMessage {
            connector_id: self.connector_id.clone(),
            channel_id,
            sender_id: message.author.id.get().to_string(),
            sender_name: message.author.name.clone(),
            kind,
            project_name: None,
            agent_id: None,
        };
        let _ = self.inbound_tx.send(inbound).await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Component(component) = interaction else {
            return;
        };
        let _ = component
            .create_response(&ctx.http, CreateInteractionResponse::Acknowledge)
            .await;

        let Some((action, agent_id)) = component.data.custom_id.split_once(':') else {
            return;
        };
        let inbound = InboundMessage {
            connector_id: self.connector_id.clone(),
            channel_id: component.channel_id.get().to_string(),
            sender_id: component.user.id.get().to_string(),
            sender_name: component.user.name.clone(),
            kind: InboundKind::Button {
                action: action.to_string(),
                agent_id: agent_id.to_string(),
            },
            project_name: None,
            agent_id: Some(agent_id.to_string()),
        };
        let _ = self.inbound_tx.send(inbound).await;
    }
}

impl Connector for DiscordConnector {
    fn id(&self) -> &str {
        &self.connector_id
    }

    fn connector_type(&self) -> &str {
        "discord"
    }

    async fn start(&self) -> Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(256);

        let handler = Handler {
            connector_id: self.connector_id.clone(),
            allowed_users: self.allowed_users.clone(),
            inbound_tx,
            known_chats: self.known_chats.clone(),
        };

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILDS;

        let mut client = serenity::Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .context("failed to build discord client")?;

        *self.http.write().await = Some(client.http.clone());
        *self.shard_manager.write().await = Some(client.shard_manager.clone());

        let connector_id = self.connector_id.clone();
        tokio::spawn(async move {
            if let Err(error) = client.start().await {
                tracing::error!(%error, connector = %connector_id, "discord gateway error");
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(
            inbound_rx,
        )))
    }

    async fn stop(&self) -> Result<()> {
        if let Some(manager) = self.shard_manager.read().await.clone() {
            manager.shutdown_all().await;
        }
        *self.http.write().await = None;
        Ok(())
    }

    async fn send_message(&self, message: OutboundMessage) -> Result<()> {
        let http = self.get_http().await?;
        let channel_id = Self::parse_channel_id(&message.channel_id)
            .with_context(|| format!("invalid discord channel id: {}", message.channel_id))?;

        let chunks = chunk_text(&message.text, CHUNK_LIMIT);
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            let mut create = CreateMessage::new().content(chunk.clone());
            if i == last && !message.action_buttons.is_empty() {
                create = create.components(vec![button_row(&message.action_buttons)]);
            }
            if i == last && !message.media_paths.is_empty() {
                for path in &message.media_paths {
                    let attachment = CreateAttachment::path(PathBuf::from(path))
                        .await
                        .context("failed to read media attachment")?;
                    create = create.add_file(attachment);
                }
            }
            channel_id
                .send_message(&*http, create)
                .await
                .context("failed to send discord message")?;
        }
        Ok(())
    }

    async fn validate_channel(&self, channel_id: &str) -> bool {
        let Ok(http) = self.get_http().await else {
            return false;
        };
        match Self::parse_channel_id(channel_id) {
            Some(id) => id.to_channel(&*http).await.is_ok(),
            None => false,
        }
    }

    async fn get_channel_info(&self, channel_id: &str) -> Option<ChannelInfo> {
        let http = self.get_http().await.ok()?;
        let id = Self::parse_channel_id(channel_id)?;
        let channel = id.to_channel(&*http).await.ok()?;
        let (name, kind) = match channel {
            serenity::all::Channel::Guild(guild_channel) => {
                (format!("#{}", guild_channel.name), "guild".to_string())
            }
            serenity::all::Channel::Private(private) => {
                (private.recipient.name.clone(), "dm".to_string())
            }
            _ => (channel_id.to_string(), "other".to_string()),
        };
        Some(ChannelInfo {
            id: channel_id.to_string(),
            name,
            kind,
        })
    }

    async fn list_channels(&self) -> Vec<ChannelInfo> {
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
        match self.get_http().await {
            Ok(http) => match http.get_current_user().await {
                Ok(user) => HealthStatus {
                    connected: true,
                    detail: user.name.clone(),
                },
                Err(error) => HealthStatus {
                    connected: false,
                    detail: error.to_string(),
                },
            },
            Err(_) => HealthStatus {
                connected: false,
                detail: "gateway not started".into(),
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

fn button_row(buttons: &[ActionButton]) -> CreateActionRow {
    let created: Vec<CreateButton> = buttons
        .iter()
        .map(|b| CreateButton::new(format!("{}:{}", b.action, b.agent_id)).label(b.label.clone()))
        .collect();
    CreateActionRow::Buttons(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_token_is_rejected() {
        assert!(DiscordConnector::new("dc", &HashMap::new(), &HashMap::new()).is_err());
    }

    #[test]
    fn channel_id_parsing() {
        assert_eq!(
            DiscordConnector::parse_channel_id("123456789"),
            Some(ChannelId::new(123456789))
        );
        assert_eq!(DiscordConnector::parse_channel_id("general"), None);
    }
}
