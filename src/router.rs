//! Connector router: channel bindings, sticky context, reply channels,
//! command dispatch, smart routing, and outbound fan-out.

use crate::agent::{Agent, AgentStatus};
use crate::config::ChannelBinding;
use crate::connector::{
    ActionButton, ConnectorDyn, InboundKind, InboundMessage, OutboundMessage,
    discord::DiscordConnector, telegram::TelegramConnector,
};
use crate::error::{ConnectorError, Error};
use crate::lifecycle::{DEFAULT_BRANCH_PREFIX, Lifecycle};
use crate::media::{self, MediaStager};
use crate::registry::Registry;
use futures::StreamExt as _;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// Delay before media references are sent to a freshly spawned agent, so
/// they land after the start sequence delivers the task.
const MEDIA_REFS_DELAY: Duration = Duration::from_secs(5);

/// Inbound task descriptions are capped when assigned to a reused agent.
const TASK_DESCRIPTION_CAP: usize = 200;

static TARGET_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?s)^@([\w-]+)(?::([\w-]+))?[:\s]\s*(.*)").unwrap());

const HELP_TEXT: &str = "Agent Forge — Command Reference\n\
━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\
\n\
AGENT MANAGEMENT\n\
  /status — List all active agents and their status\n\
  /spawn <project> [task] — Spawn a new agent\n\
  /kill <agent_id> — Terminate an agent\n\
  /projects — List available projects\n\
\n\
AGENT CONTROL\n\
  /approve [agent_id] — Approve a pending action\n\
  /approve_all [agent_id] — Approve all pending actions\n\
  /reject [agent_id] — Reject a pending action\n\
  /interrupt [agent_id] — Interrupt an agent\n\
\n\
  Control commands use your last-interacted agent\n\
  if no agent_id is given.\n\
\n\
SENDING MESSAGES\n\
  @project message — Send to the most recent agent\n\
  @project:agent_id message — Send to a specific agent\n\
\n\
  If the channel is bound to a single project, just\n\
  type your message directly — no prefix needed.\n\
\n\
  You can also send photos, files, and voice messages\n\
  with or without a caption. They'll be staged into\n\
  the agent's worktree.";

/// Parse `@project[:agent_id] message`. Empty strings when there is no match.
pub fn parse_target(text: &str) -> (String, String, String) {
    match TARGET_RE.captures(text) {
        Some(captures) => (
            captures.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
            captures.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            captures
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
        ),
        None => (String::new(), String::new(), String::new()),
    }
}

/// Inverse of [`parse_target`] for explicit addressing.
pub fn format_target(project: &str, agent_id: &str, text: &str) -> String {
    if agent_id.is_empty() {
        format!("@{project} {text}")
    } else {
        format!("@{project}:{agent_id} {text}")
    }
}

type ChannelKey = (String, String);

pub struct ConnectorRouter {
    registry: Arc<Registry>,
    lifecycle: Arc<Lifecycle>,
    stager: MediaStager,
    connectors: RwLock<HashMap<String, Arc<dyn ConnectorDyn>>>,
    /// (connector_id, channel_id) -> [(project_name, binding)], inbound only.
    channel_map: RwLock<HashMap<ChannelKey, Vec<(String, ChannelBinding)>>>,
    /// Sticky context: last agent each channel interacted with.
    context: Mutex<HashMap<ChannelKey, String>>,
    /// Channels that addressed a project explicitly; eligible for fan-out
    /// even without a configured binding.
    reply_channels: Mutex<HashMap<String, HashSet<ChannelKey>>>,
    stream_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ConnectorRouter {
    pub fn new(registry: Arc<Registry>, lifecycle: Arc<Lifecycle>, stager: MediaStager) -> Arc<Self> {
        let router = Arc::new(Self {
            registry,
            lifecycle,
            stager,
            connectors: RwLock::new(HashMap::new()),
            channel_map: RwLock::new(HashMap::new()),
            context: Mutex::new(HashMap::new()),
            reply_channels: Mutex::new(HashMap::new()),
            stream_tasks: Mutex::new(HashMap::new()),
        });
        let map = build_channel_map(&router.registry);
        *router.channel_map.try_write().expect("fresh router lock") = map;
        router
    }

    /// Instantiate and start every enabled connector. Failures are isolated:
    /// a connector that can't start is logged and left out of the running set.
    pub async fn start(self: &Arc<Self>) {
        let config = self.registry.config();
        for (connector_id, connector_cfg) in &config.connectors {
            if !connector_cfg.enabled {
                tracing::info!(connector = %connector_id, "connector disabled, skipping");
                continue;
            }
            let connector = match create_connector(connector_id, connector_cfg) {
                Ok(connector) => connector,
                Err(error) => {
                    tracing::warn!(%error, connector = %connector_id, "skipping connector");
                    continue;
                }
            };
            self.start_connector(connector_id, connector).await;
        }
        self.rebuild_channel_map().await;
    }

    async fn start_connector(self: &Arc<Self>, connector_id: &str, connector: Arc<dyn ConnectorDyn>) {
        match connector.start().await {
            Ok(mut stream) => {
                let router = Arc::clone(self);
                let drained_id = connector_id.to_string();
                let task = tokio::spawn(async move {
                    while let Some(message) = stream.next().await {
                        router.handle_inbound(message).await;
                    }
                    tracing::info!(connector = %drained_id, "inbound stream ended");
                });
                self.stream_tasks
                    .lock()
                    .await
                    .insert(connector_id.to_string(), task);
                self.connectors
                    .write()
                    .await
                    .insert(connector_id.to_string(), connector);
                tracing::info!(connector = %connector_id, "started connector");
            }
            Err(error) => {
                tracing::error!(%error, connector = %connector_id, "failed to start connector");
            }
        }
    }

    /// Stop all running connectors.
    pub async fn stop(&self) {
        let connectors: Vec<(String, Arc<dyn ConnectorDyn>)> = {
            let mut map = self.connectors.write().await;
            map.drain().collect()
        };
        for (connector_id, connector) in connectors {
            if let Err(error) = connector.stop().await {
                tracing::error!(%error, connector = %connector_id, "error stopping connector");
            } else {
                tracing::info!(connector = %connector_id, "stopped connector");
            }
        }
        for (_, task) in self.stream_tasks.lock().await.drain() {
            task.abort();
        }
    }

    /// Stop and recreate a single connector from current config.
    pub async fn restart_connector(self: &Arc<Self>, connector_id: &str) -> bool {
        if let Some(old) = self.connectors.write().await.remove(connector_id) {
            if let Err(error) = old.stop().await {
                tracing::error!(%error, connector = %connector_id, "error stopping connector");
            }
        }
        if let Some(task) = self.stream_tasks.lock().await.remove(connector_id) {
            task.abort();
        }

        let config = self.registry.config();
        let started = match config.connectors.get(connector_id) {
            Some(cfg) if cfg.enabled => match create_connector(connector_id, cfg) {
                Ok(connector) => {
                    self.start_connector(connector_id, connector).await;
                    self.connectors.read().await.contains_key(connector_id)
                }
                Err(error) => {
                    tracing::warn!(%error, connector = %connector_id, "cannot recreate connector");
                    false
                }
            },
            _ => false,
        };
        self.rebuild_channel_map().await;
        if started {
            tracing::info!(connector = %connector_id, "restarted connector");
        }
        started
    }

    /// Rebuild the binding lookup from current configuration. Call after any
    /// config mutation.
    pub async fn rebuild_channel_map(&self) {
        *self.channel_map.write().await = build_channel_map(&self.registry);
    }

    /// Configured vs running state per connector id.
    pub async fn status(&self) -> HashMap<String, serde_json::Value> {
        let running = self.connectors.read().await;
        self.registry
            .config()
            .connectors
            .iter()
            .map(|(id, cfg)| {
                (
                    id.clone(),
                    serde_json::json!({
                        "type": cfg.connector_type,
                        "enabled": cfg.enabled,
                        "running": running.contains_key(id),
                    }),
                )
            })
            .collect()
    }

    pub async fn get_connector(&self, connector_id: &str) -> Option<Arc<dyn ConnectorDyn>> {
        self.connectors.read().await.get(connector_id).cloned()
    }

    #[cfg(test)]
    pub(crate) async fn insert_connector(&self, connector: Arc<dyn ConnectorDyn>) {
        self.connectors
            .write()
            .await
            .insert(connector.id().to_string(), connector);
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Route one inbound message.
    pub async fn handle_inbound(self: &Arc<Self>, message: InboundMessage) {
        self.persist_known_chats(&message.connector_id).await;

        match message.kind.clone() {
            InboundKind::Command { name, args } => {
                self.handle_command(&message, &name, &args).await;
            }
            InboundKind::Button { action, agent_id } => {
                self.handle_control(&message, &action, Some(agent_id)).await;
            }
            InboundKind::Text { text } => {
                self.route_message(message, text, Vec::new()).await;
            }
            InboundKind::Media { text, paths } => {
                self.route_message(message, text, paths).await;
            }
        }
    }

    async fn route_message(
        self: &Arc<Self>,
        message: InboundMessage,
        mut text: String,
        media_paths: Vec<String>,
    ) {
        let mut project_name = message.project_name.clone().unwrap_or_default();
        let mut agent_id = message.agent_id.clone().unwrap_or_default();

        if project_name.is_empty() {
            let key = (message.connector_id.clone(), message.channel_id.clone());
            let bindings = self.channel_map.read().await.get(&key).cloned().unwrap_or_default();

            match bindings.len() {
                1 => project_name = bindings[0].0.clone(),
                n if n > 1 => {
                    let (parsed_project, parsed_agent, remainder) = parse_target(&text);
                    if !parsed_project.is_empty() {
                        project_name = parsed_project;
                        agent_id = parsed_agent;
                        text = remainder;
                    } else {
                        if let Some((ctx_project, ctx_agent)) = self.context_target(&key).await {
                            project_name = ctx_project;
                            agent_id = ctx_agent;
                        }
                        // A reply reference the connector extracted also works.
                        if project_name.is_empty() {
                            if let Some(hint) = &message.agent_id {
                                if let Some(agent) = self.lifecycle.agents().get(hint).await {
                                    project_name = agent.project_name;
                                    agent_id = hint.clone();
                                }
                            }
                        }
                        if project_name.is_empty() {
                            let projects: Vec<&str> =
                                bindings.iter().map(|(p, _)| p.as_str()).collect();
                            self.reply(
                                &message,
                                &format!(
                                    "Multiple projects bound to this channel: {}\nUse @project message to specify.",
                                    projects.join(", ")
                                ),
                            )
                            .await;
                            return;
                        }
                    }
                }
                _ => {
                    let (parsed_project, parsed_agent, remainder) = parse_target(&text);
                    if !parsed_project.is_empty() {
                        project_name = parsed_project;
                        agent_id = parsed_agent;
                        text = remainder;
                    } else {
                        if let Some((ctx_project, ctx_agent)) = self.context_target(&key).await {
                            project_name = ctx_project;
                            agent_id = ctx_agent;
                        }
                        if project_name.is_empty() {
                            self.reply(
                                &message,
                                "Usage: @project message\nOr: @project:agent_id message",
                            )
                            .await;
                            return;
                        }
                    }
                }
            }
        }

        if self.registry.get_project(&project_name).is_err() {
            let available = self.registry.project_names().join(", ");
            self.reply(
                &message,
                &format!("Unknown project: '{project_name}'\nAvailable: {available}"),
            )
            .await;
            return;
        }

        // Resolve the receiving agent.
        let (agent, newly_spawned) = if !agent_id.is_empty() {
            match self.lifecycle.agents().get(&agent_id).await {
                Some(agent) => (agent, false),
                None => {
                    self.reply(&message, &format!("Agent `{agent_id}` not found.")).await;
                    return;
                }
            }
        } else {
            match self.smart_route(&project_name, &message, &text).await {
                Some(result) => result,
                None => return,
            }
        };

        if newly_spawned {
            // The task text is delivered by the start sequence; only media
            // needs handling here.
            if media_paths.is_empty() {
                self.reply(
                    &message,
                    &format!("Spawned agent `{}` for {}", agent.id, project_name),
                )
                .await;
            } else {
                match self.stage_media(&agent, &media_paths).await {
                    Ok((staged, reference)) => {
                        self.schedule_media_refs(&agent.id, staged.clone(), reference);
                        let listing: Vec<String> =
                            staged.iter().map(|p| format!("  - {p}")).collect();
                        self.reply(
                            &message,
                            &format!(
                                "Spawned agent `{}` for {}\nStaged:\n{}",
                                agent.id,
                                project_name,
                                listing.join("\n")
                            ),
                        )
                        .await;
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to process media for auto-spawned agent");
                        self.reply(
                            &message,
                            &format!(
                                "Spawned agent `{}` for {} (media staging failed)",
                                agent.id, project_name
                            ),
                        )
                        .await;
                    }
                }
                cleanup_temp_files(&media_paths).await;
            }
            self.remember_interaction(&message, &project_name, &agent.id).await;
            return;
        }

        if !media_paths.is_empty() {
            let result = self.stage_media(&agent, &media_paths).await;
            match result {
                Ok((staged, reference)) => {
                    self.lifecycle
                        .send_message_with_media(&agent.id, &text, &staged, &reference)
                        .await;
                    let listing: Vec<String> = staged.iter().map(|p| format!("  - {p}")).collect();
                    self.reply(
                        &message,
                        &format!(
                            "Staged to `{}` ({}):\n{}",
                            agent.id,
                            project_name,
                            listing.join("\n")
                        ),
                    )
                    .await;
                    self.remember_interaction(&message, &project_name, &agent.id).await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to process media message");
                    self.reply(&message, "Failed to process media attachment.").await;
                }
            }
            cleanup_temp_files(&media_paths).await;
        } else if self.lifecycle.send_message(&agent.id, &text).await {
            self.reply(&message, &format!("Sent to `{}` ({})", agent.id, project_name))
                .await;
            self.remember_interaction(&message, &project_name, &agent.id).await;
        } else {
            self.reply(&message, &format!("Failed to send message to `{}`.", agent.id))
                .await;
        }
    }

    /// Smart load balancer: reuse an idle agent, spawn a new one under the
    /// cap, or report busy. `None` means routing failed and a reply was sent.
    async fn smart_route(
        self: &Arc<Self>,
        project_name: &str,
        message: &InboundMessage,
        text: &str,
    ) -> Option<(Agent, bool)> {
        let agents = self.lifecycle.agents().list(Some(project_name)).await;
        let active: Vec<&Agent> = agents
            .iter()
            .filter(|a| a.status != AgentStatus::Stopped)
            .collect();

        if active.is_empty() {
            return self.auto_spawn(project_name, message, text).await;
        }

        // Idle agents are at a prompt and free for a new task.
        let idle = active
            .iter()
            .filter(|a| a.status == AgentStatus::Idle)
            .max_by_key(|a| a.last_activity);
        if let Some(agent) = idle {
            self.lifecycle.clear_context(&agent.id).await;
            let task: String = text.chars().take(TASK_DESCRIPTION_CAP).collect();
            let updated = self
                .lifecycle
                .agents()
                .update(&agent.id, |a| a.task_description = task)
                .await?;
            return Some((updated, false));
        }

        let max_agents = self.registry.config().get_max_agents(project_name);
        if active.len() < max_agents {
            return self.auto_spawn(project_name, message, text).await;
        }

        let busy: Vec<String> = active
            .iter()
            .map(|a| {
                let task = if a.task_description.is_empty() {
                    String::new()
                } else {
                    format!(" — {}", a.task_description)
                };
                format!("  [{}] {}{}", a.status, a.id, task)
            })
            .collect();
        self.reply(
            message,
            &format!(
                "All agents for {} are busy ({}/{}):\n{}",
                project_name,
                active.len(),
                max_agents,
                busy.join("\n")
            ),
        )
        .await;
        None
    }

    async fn auto_spawn(
        self: &Arc<Self>,
        project_name: &str,
        message: &InboundMessage,
        task: &str,
    ) -> Option<(Agent, bool)> {
        match self
            .lifecycle
            .spawn_agent(project_name, task, DEFAULT_BRANCH_PREFIX, "")
            .await
        {
            Ok(agent) => Some((agent, true)),
            Err(error) => {
                self.reply(message, &format!("Failed to spawn agent: {error}")).await;
                None
            }
        }
    }

    /// Stage every attachment into the agent's worktree and build the
    /// combined reference sentence.
    async fn stage_media(
        &self,
        agent: &Agent,
        media_paths: &[String],
    ) -> std::io::Result<(Vec<String>, String)> {
        let mut staged: Vec<String> = Vec::new();
        let mut last_type = None;
        for path in media_paths {
            let (paths, media_type) = self
                .stager
                .process_and_stage(path, &agent.worktree_path)
                .await?;
            staged.extend(paths);
            last_type = Some(media_type);
        }
        let reference = match last_type {
            Some(media_type) => media::build_media_reference(&staged, media_type),
            None => String::new(),
        };
        Ok((staged, reference))
    }

    /// Deliver media references to a freshly spawned agent after its start
    /// sequence has had time to send the task.
    fn schedule_media_refs(self: &Arc<Self>, agent_id: &str, staged: Vec<String>, reference: String) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(MEDIA_REFS_DELAY).await;
            let text = if reference.is_empty() {
                let listing: Vec<String> = staged.iter().map(|p| format!("  - {p}")).collect();
                format!("Media files staged:\n{}", listing.join("\n"))
            } else {
                reference
            };
            lifecycle.send_message(&agent_id, &text).await;
        });
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(self: &Arc<Self>, message: &InboundMessage, name: &str, args: &[String]) {
        match name {
            "help" | "commands" | "start" => {
                self.reply(message, HELP_TEXT).await;
            }
            "status" => {
                let grouped = self.lifecycle.agents().by_project().await;
                if grouped.is_empty() {
                    self.reply(message, "No active agents.").await;
                    return;
                }
                let mut projects: Vec<&String> = grouped.keys().collect();
                projects.sort();
                let mut lines: Vec<String> = Vec::new();
                for project in projects {
                    lines.push(format!("** {project} **"));
                    for agent in &grouped[project] {
                        let task = if agent.task_description.is_empty() {
                            String::new()
                        } else {
                            format!(" - {}", agent.task_description)
                        };
                        lines.push(format!("  [{}] {}{}", agent.status, agent.id, task));
                    }
                }
                self.reply(message, &lines.join("\n")).await;
            }
            "projects" => {
                let config = self.registry.config();
                if config.projects.is_empty() {
                    self.reply(message, "No projects registered.").await;
                    return;
                }
                let mut names: Vec<&String> = config.projects.keys().collect();
                names.sort();
                let lines: Vec<String> = names
                    .iter()
                    .map(|name| {
                        let project = &config.projects[*name];
                        if project.description.is_empty() {
                            format!("* {name}")
                        } else {
                            format!("* {name} - {}", project.description)
                        }
                    })
                    .collect();
                self.reply(message, &lines.join("\n")).await;
            }
            "spawn" => {
                let Some(project_name) = args.first() else {
                    self.reply(message, "Usage: /spawn project [task description]").await;
                    return;
                };
                if self.registry.get_project(project_name).is_err() {
                    let available = self.registry.project_names().join(", ");
                    self.reply(
                        message,
                        &format!("Unknown project: '{project_name}'\nAvailable: {available}"),
                    )
                    .await;
                    return;
                }
                let task = args[1..].join(" ");
                match self
                    .lifecycle
                    .spawn_agent(project_name, &task, DEFAULT_BRANCH_PREFIX, "")
                    .await
                {
                    Ok(agent) => {
                        let mut reply = format!("Spawned agent `{}` for {}", agent.id, project_name);
                        if !task.is_empty() {
                            reply.push_str(&format!("\nTask: {task}"));
                        }
                        self.reply(message, &reply).await;
                        self.remember_interaction(message, project_name, &agent.id).await;
                    }
                    Err(error) => {
                        self.reply(message, &format!("Failed to spawn agent: {error}")).await;
                    }
                }
            }
            "kill" => {
                let Some(agent_id) = args.first() else {
                    self.reply(message, "Usage: /kill agent_id").await;
                    return;
                };
                if self.lifecycle.kill_agent(agent_id).await {
                    self.reply(message, &format!("Agent `{agent_id}` killed.")).await;
                } else {
                    self.reply(message, &format!("Agent `{agent_id}` not found.")).await;
                }
            }
            "approve" | "approve_all" | "reject" | "interrupt" => {
                self.handle_control(message, name, args.first().cloned()).await;
            }
            other => {
                self.reply(message, &format!("Unknown command: /{other}")).await;
            }
        }
    }

    /// Control action targeting: explicit arg, then sticky context, then the
    /// single-agent shortcut, then a usage hint.
    async fn handle_control(
        self: &Arc<Self>,
        message: &InboundMessage,
        action: &str,
        explicit: Option<String>,
    ) {
        let key = (message.connector_id.clone(), message.channel_id.clone());
        let agent_id = match explicit {
            Some(id) if !id.is_empty() => Some(id),
            _ => match self.sticky_context(&key).await {
                Some(id) => Some(id),
                None => self.single_agent_shortcut(&key).await,
            },
        };

        let Some(agent_id) = agent_id else {
            self.reply(
                message,
                &format!("Usage: /{action} [agent_id]\nSend a message to an agent first to set context."),
            )
            .await;
            return;
        };

        if self.lifecycle.agents().get(&agent_id).await.is_none() {
            self.reply(message, &format!("Agent `{agent_id}` not found.")).await;
            return;
        }

        match self.lifecycle.send_control(&agent_id, action).await {
            Ok(()) => {
                self.reply(message, &format!("Sent `{action}` to agent `{agent_id}`")).await;
                self.context.lock().await.insert(key, agent_id);
            }
            Err(error) => {
                tracing::warn!(%error, agent_id = %agent_id, "control send failed");
                self.reply(message, &format!("Failed to send `{action}` to agent `{agent_id}`."))
                    .await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Context helpers
    // -----------------------------------------------------------------------

    /// Sticky agent for a channel, cleared when the agent no longer exists.
    async fn sticky_context(&self, key: &ChannelKey) -> Option<String> {
        let agent_id = self.context.lock().await.get(key).cloned()?;
        if self.lifecycle.agents().contains(&agent_id).await {
            Some(agent_id)
        } else {
            self.context.lock().await.remove(key);
            None
        }
    }

    /// Sticky context resolved to `(project, agent_id)`.
    async fn context_target(&self, key: &ChannelKey) -> Option<(String, String)> {
        let agent_id = self.sticky_context(key).await?;
        let agent = self.lifecycle.agents().get(&agent_id).await?;
        Some((agent.project_name, agent_id))
    }

    /// When the channel binds exactly one project with exactly one live
    /// agent, that agent is the implicit target.
    async fn single_agent_shortcut(&self, key: &ChannelKey) -> Option<String> {
        let bindings = self.channel_map.read().await.get(key).cloned()?;
        if bindings.len() != 1 {
            return None;
        }
        let agents = self.lifecycle.agents().list(Some(&bindings[0].0)).await;
        if agents.len() == 1 {
            Some(agents[0].id.clone())
        } else {
            None
        }
    }

    async fn remember_interaction(&self, message: &InboundMessage, project_name: &str, agent_id: &str) {
        let key = (message.connector_id.clone(), message.channel_id.clone());
        self.context.lock().await.insert(key.clone(), agent_id.to_string());
        self.reply_channels
            .lock()
            .await
            .entry(project_name.to_string())
            .or_default()
            .insert(key);
    }

    /// Save a connector's newly observed chats into its settings so they
    /// survive restart.
    async fn persist_known_chats(&self, connector_id: &str) {
        let Some(connector) = self.get_connector(connector_id).await else {
            return;
        };
        let known = connector.known_chats();
        if known.is_empty() {
            return;
        }
        let serialized = serde_json::json!(known);
        let current = self
            .registry
            .config()
            .connectors
            .get(connector_id)
            .and_then(|c| c.settings.get("known_chats").cloned());
        if current.as_ref() == Some(&serialized) {
            return;
        }
        let connector_id = connector_id.to_string();
        if let Err(error) = self.registry.update(move |config| {
            if let Some(cfg) = config.connectors.get_mut(&connector_id) {
                cfg.settings.insert("known_chats".into(), serialized);
            }
        }) {
            tracing::debug!(%error, "failed to persist known chats");
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Reply on the same connector/channel a message came from.
    async fn reply(&self, original: &InboundMessage, text: &str) {
        let Some(connector) = self.get_connector(&original.connector_id).await else {
            tracing::warn!(connector = %original.connector_id, "cannot reply: connector not found");
            return;
        };
        let out = OutboundMessage::text(&original.channel_id, text);
        if let Err(error) = connector.send_message(out).await {
            tracing::error!(%error, connector = %original.connector_id, "failed to send reply");
        }
    }

    /// Plain fan-out to every outbound-enabled binding plus tracked reply
    /// channels. Per-recipient errors are logged, never propagated.
    pub async fn send_to_project_channels(
        &self,
        project_name: &str,
        text: &str,
        media_paths: &[String],
    ) {
        self.fan_out(project_name, |channel_id| OutboundMessage {
            channel_id: channel_id.to_string(),
            text: text.to_string(),
            media_paths: media_paths.to_vec(),
            ..Default::default()
        })
        .await;
    }

    /// Rich fan-out carrying action buttons.
    pub async fn send_to_project_channels_rich(
        &self,
        project_name: &str,
        text: &str,
        buttons: Vec<ActionButton>,
    ) {
        self.fan_out(project_name, |channel_id| OutboundMessage {
            channel_id: channel_id.to_string(),
            text: text.to_string(),
            action_buttons: buttons.clone(),
            ..Default::default()
        })
        .await;
    }

    async fn fan_out<F>(&self, project_name: &str, make_message: F)
    where
        F: Fn(&str) -> OutboundMessage,
    {
        let config = self.registry.config();
        let mut sent: HashSet<ChannelKey> = HashSet::new();

        if let Some(project) = config.projects.get(project_name) {
            for binding in &project.channels {
                if !binding.outbound {
                    continue;
                }
                let Some(connector) = self.get_connector(&binding.connector_id).await else {
                    tracing::warn!(
                        connector = %binding.connector_id,
                        project = %project_name,
                        "connector not found for outbound"
                    );
                    continue;
                };
                match connector.send_message(make_message(&binding.channel_id)).await {
                    Ok(()) => {
                        sent.insert((binding.connector_id.clone(), binding.channel_id.clone()));
                    }
                    Err(error) => {
                        tracing::error!(
                            %error,
                            connector = %binding.connector_id,
                            channel = %binding.channel_id,
                            "failed to send outbound"
                        );
                    }
                }
            }
        }

        let reply_channels = self
            .reply_channels
            .lock()
            .await
            .get(project_name)
            .cloned()
            .unwrap_or_default();
        for (connector_id, channel_id) in reply_channels {
            if sent.contains(&(connector_id.clone(), channel_id.clone())) {
                continue;
            }
            let Some(connector) = self.get_connector(&connector_id).await else {
                continue;
            };
            if let Err(error) = connector.send_message(make_message(&channel_id)).await {
                tracing::debug!(
                    %error,
                    connector = %connector_id,
                    channel = %channel_id,
                    "failed to send to reply channel"
                );
            }
        }
    }
}

fn build_channel_map(registry: &Registry) -> HashMap<ChannelKey, Vec<(String, ChannelBinding)>> {
    let mut map: HashMap<ChannelKey, Vec<(String, ChannelBinding)>> = HashMap::new();
    for (project_name, project) in &registry.config().projects {
        for binding in &project.channels {
            if !binding.inbound {
                continue;
            }
            map.entry((binding.connector_id.clone(), binding.channel_id.clone()))
                .or_default()
                .push((project_name.clone(), binding.clone()));
        }
    }
    map
}

/// Instantiate an adapter by config type.
fn create_connector(
    connector_id: &str,
    cfg: &crate::config::ConnectorConfig,
) -> Result<Arc<dyn ConnectorDyn>, Error> {
    match cfg.connector_type.as_str() {
        "telegram" => Ok(Arc::new(TelegramConnector::new(
            connector_id,
            &cfg.credentials,
            &cfg.settings,
        )?)),
        "discord" => Ok(Arc::new(DiscordConnector::new(
            connector_id,
            &cfg.credentials,
            &cfg.settings,
        )?)),
        "slack" | "whatsapp" | "signal" => {
            Err(ConnectorError::UnsupportedType(cfg.connector_type.clone()).into())
        }
        other => Err(ConnectorError::UnknownType(other.to_string()).into()),
    }
}

/// Remove adapter temp files after staging; prune empty `forge_*` dirs.
async fn cleanup_temp_files(paths: &[String]) {
    for path in paths {
        let path = Path::new(path);
        if tokio::fs::remove_file(path).await.is_err() {
            continue;
        }
        if let Some(parent) = path.parent() {
            let is_forge_tmp = parent
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("forge_"));
            if is_forge_tmp {
                let _ = tokio::fs::remove_dir(parent).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentStore;
    use crate::connector::{ChannelInfo, Connector, HealthStatus, InboundStream};
    use crate::store::ForgeStore;
    use indoc::indoc;
    use std::io::Write as _;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn target_parser_handles_all_forms() {
        assert_eq!(
            parse_target("@api fix the login bug"),
            ("api".into(), "".into(), "fix the login bug".into())
        );
        assert_eq!(
            parse_target("@api:ab12cd please continue"),
            ("api".into(), "ab12cd".into(), "please continue".into())
        );
        assert_eq!(
            parse_target("@my-project: do it"),
            ("my-project".into(), "".into(), "do it".into())
        );
        assert_eq!(parse_target("no prefix here"), ("".into(), "".into(), "".into()));
    }

    #[test]
    fn target_parser_spans_lines() {
        let (project, agent, text) = parse_target("@api first line\nsecond line");
        assert_eq!(project, "api");
        assert_eq!(agent, "");
        assert_eq!(text, "first line\nsecond line");
    }

    #[test]
    fn connector_creation_errors_are_typed() {
        let cfg = crate::config::ConnectorConfig {
            connector_type: "carrier-pigeon".into(),
            ..Default::default()
        };
        let error = create_connector("cp", &cfg).unwrap_err();
        assert!(matches!(
            error,
            Error::Connector(ConnectorError::UnknownType(ref kind)) if kind == "carrier-pigeon"
        ));

        let cfg = crate::config::ConnectorConfig {
            connector_type: "slack".into(),
            ..Default::default()
        };
        let error = create_connector("sl", &cfg).unwrap_err();
        assert!(matches!(
            error,
            Error::Connector(ConnectorError::UnsupportedType(ref kind)) if kind == "slack"
        ));

        // A telegram entry without credentials fails on the missing token.
        let cfg = crate::config::ConnectorConfig {
            connector_type: "telegram".into(),
            ..Default::default()
        };
        let error = create_connector("tg", &cfg).unwrap_err();
        assert!(matches!(
            error,
            Error::Connector(ConnectorError::MissingCredential { .. })
        ));
    }

    #[test]
    fn target_parse_inverts_format() {
        for (project, agent, text) in [
            ("api", "", "fix the login bug"),
            ("api", "ab12cd", "continue"),
            ("my-project", "ff00aa", "multi word message"),
        ] {
            let formatted = format_target(project, agent, text);
            assert_eq!(
                parse_target(&formatted),
                (project.to_string(), agent.to_string(), text.to_string())
            );
        }
    }

    /// Recording connector for router tests.
    struct MockConnector {
        connector_id: String,
        sent: Arc<StdMutex<Vec<OutboundMessage>>>,
    }

    impl Connector for MockConnector {
        fn id(&self) -> &str {
            &self.connector_id
        }

        fn connector_type(&self) -> &str {
            "mock"
        }

        async fn start(&self) -> crate::error::Result<InboundStream> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn send_message(&self, message: OutboundMessage) -> crate::error::Result<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn validate_channel(&self, _channel_id: &str) -> bool {
            true
        }

        async fn get_channel_info(&self, _channel_id: &str) -> Option<ChannelInfo> {
            None
        }

        async fn list_channels(&self) -> Vec<ChannelInfo> {
            Vec::new()
        }

        async fn health_check(&self) -> HealthStatus {
            HealthStatus {
                connected: true,
                detail: String::new(),
            }
        }
    }

    async fn test_router(
        config: &str,
    ) -> (Arc<ConnectorRouter>, Arc<Lifecycle>, Arc<StdMutex<Vec<OutboundMessage>>>) {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(config.as_bytes()).unwrap();
        let (_, path) = file.keep().unwrap();
        let registry = Arc::new(Registry::load(path).unwrap());

        let store = ForgeStore::open_in_memory().await.unwrap();
        let agents = Arc::new(AgentStore::new());
        let lifecycle = Arc::new(Lifecycle::new(registry.clone(), agents, store, 8080));
        let router = ConnectorRouter::new(
            registry,
            lifecycle.clone(),
            MediaStager::new(std::env::temp_dir().join("forge-router-tests")),
        );

        let sent = Arc::new(StdMutex::new(Vec::new()));
        router
            .insert_connector(Arc::new(MockConnector {
                connector_id: "mock".into(),
                sent: sent.clone(),
            }))
            .await;
        (router, lifecycle, sent)
    }

    const BOUND_CONFIG: &str = indoc! {r#"
        [projects.api]
        path = "/nonexistent/api"

        [[projects.api.channels]]
        connector_id = "mock"
        channel_id = "c1"
        inbound = true
        outbound = true

        [projects.web]
        path = "/nonexistent/web"

        [[projects.web.channels]]
        connector_id = "mock"
        channel_id = "shared"

        [[projects.api.channels]]
        connector_id = "mock"
        channel_id = "shared"
    "#};

    fn agent_for(project: &str, id: &str, status: AgentStatus) -> Agent {
        let mut agent = Agent::new(
            id,
            project,
            format!("forge__{project}__{id}"),
            format!("/tmp/{id}"),
            format!("agent/{id}/task"),
        );
        agent.status = status;
        agent
    }

    #[tokio::test]
    async fn channel_map_is_rebuilt_from_config() {
        let (router, _, _) = test_router(BOUND_CONFIG).await;
        let map = router.channel_map.read().await;
        assert_eq!(map[&("mock".to_string(), "c1".to_string())].len(), 1);
        assert_eq!(map[&("mock".to_string(), "shared".to_string())].len(), 2);
    }

    #[tokio::test]
    async fn ambiguous_channel_asks_for_target() {
        let (router, _, sent) = test_router(BOUND_CONFIG).await;
        router
            .handle_inbound(InboundMessage::text("mock", "shared", "u1", "hello"))
            .await;

        let outbound = sent.lock().unwrap();
        assert_eq!(outbound.len(), 1);
        assert!(outbound[0].text.contains("Multiple projects bound"));
        assert!(outbound[0].text.contains("api"));
        assert!(outbound[0].text.contains("web"));
    }

    #[tokio::test]
    async fn unbound_channel_gets_usage_hint() {
        let (router, _, sent) = test_router(BOUND_CONFIG).await;
        router
            .handle_inbound(InboundMessage::text("mock", "unbound", "u1", "hello"))
            .await;

        let outbound = sent.lock().unwrap();
        assert!(outbound[0].text.starts_with("Usage: @project message"));
    }

    #[tokio::test]
    async fn unknown_project_lists_available() {
        let (router, _, sent) = test_router(BOUND_CONFIG).await;
        router
            .handle_inbound(InboundMessage::text("mock", "unbound", "u1", "@ghost do it"))
            .await;

        let outbound = sent.lock().unwrap();
        assert!(outbound[0].text.contains("Unknown project: 'ghost'"));
        assert!(outbound[0].text.contains("api, web"));
    }

    #[tokio::test]
    async fn explicit_agent_routes_directly() {
        let (router, lifecycle, sent) = test_router(BOUND_CONFIG).await;
        lifecycle
            .agents()
            .insert(agent_for("api", "ab12cd", AgentStatus::Working))
            .await;

        router
            .handle_inbound(InboundMessage::text(
                "mock",
                "unbound",
                "u1",
                "@api:ab12cd keep going",
            ))
            .await;

        // send_message fails (no tmux session), so the reply reports failure,
        // but resolution reached the explicit agent.
        let outbound = sent.lock().unwrap();
        assert!(outbound[0].text.contains("ab12cd"));
    }

    #[tokio::test]
    async fn missing_explicit_agent_reports_not_found() {
        let (router, _, sent) = test_router(BOUND_CONFIG).await;
        router
            .handle_inbound(InboundMessage::text("mock", "c1", "u1", "@api:zzzzzz hello"))
            .await;

        let outbound = sent.lock().unwrap();
        assert_eq!(outbound[0].text, "Agent `zzzzzz` not found.");
    }

    #[tokio::test]
    async fn busy_project_at_cap_lists_agents() {
        let config = indoc! {r#"
            [defaults]
            max_agents_per_project = 1

            [projects.api]
            path = "/nonexistent/api"

            [[projects.api.channels]]
            connector_id = "mock"
            channel_id = "c1"
        "#};
        let (router, lifecycle, sent) = test_router(config).await;
        let mut busy = agent_for("api", "busy01", AgentStatus::Working);
        busy.task_description = "long refactor".into();
        lifecycle.agents().insert(busy).await;

        router
            .handle_inbound(InboundMessage::text("mock", "c1", "u1", "new task"))
            .await;

        let outbound = sent.lock().unwrap();
        assert!(outbound[0].text.contains("All agents for api are busy (1/1)"));
        assert!(outbound[0].text.contains("busy01"));
        assert!(outbound[0].text.contains("long refactor"));
    }

    #[tokio::test]
    async fn control_without_context_gets_usage() {
        let (router, _, sent) = test_router(BOUND_CONFIG).await;
        router
            .handle_inbound(InboundMessage {
                kind: InboundKind::Command {
                    name: "approve".into(),
                    args: vec![],
                },
                ..InboundMessage::text("mock", "unbound", "u1", "")
            })
            .await;

        let outbound = sent.lock().unwrap();
        assert!(outbound[0].text.starts_with("Usage: /approve [agent_id]"));
    }

    #[tokio::test]
    async fn single_agent_shortcut_resolves_control() {
        let (router, lifecycle, sent) = test_router(BOUND_CONFIG).await;
        lifecycle
            .agents()
            .insert(agent_for("api", "only01", AgentStatus::WaitingInput))
            .await;

        router
            .handle_inbound(InboundMessage {
                kind: InboundKind::Command {
                    name: "approve".into(),
                    args: vec![],
                },
                ..InboundMessage::text("mock", "c1", "u1", "")
            })
            .await;

        // send_raw fails without tmux, so the shortcut resolves but delivery
        // reports failure for agent only01.
        let outbound = sent.lock().unwrap();
        assert!(outbound[0].text.contains("only01"));
    }

    #[tokio::test]
    async fn status_command_groups_by_project() {
        let (router, lifecycle, sent) = test_router(BOUND_CONFIG).await;
        lifecycle
            .agents()
            .insert(agent_for("api", "aa0001", AgentStatus::Idle))
            .await;
        lifecycle
            .agents()
            .insert(agent_for("web", "bb0002", AgentStatus::Working))
            .await;

        router
            .handle_inbound(InboundMessage {
                kind: InboundKind::Command {
                    name: "status".into(),
                    args: vec![],
                },
                ..InboundMessage::text("mock", "c1", "u1", "")
            })
            .await;

        let outbound = sent.lock().unwrap();
        let text = &outbound[0].text;
        assert!(text.contains("** api **"));
        assert!(text.contains("[idle] aa0001"));
        assert!(text.contains("** web **"));
        assert!(text.contains("[working] bb0002"));
    }

    #[tokio::test]
    async fn kill_command_reports_missing_agent() {
        let (router, _, sent) = test_router(BOUND_CONFIG).await;
        router
            .handle_inbound(InboundMessage {
                kind: InboundKind::Command {
                    name: "kill".into(),
                    args: vec!["nosuch".into()],
                },
                ..InboundMessage::text("mock", "c1", "u1", "")
            })
            .await;

        let outbound = sent.lock().unwrap();
        assert_eq!(outbound[0].text, "Agent `nosuch` not found.");
    }

    #[tokio::test]
    async fn unknown_command_is_reported() {
        let (router, _, sent) = test_router(BOUND_CONFIG).await;
        router
            .handle_inbound(InboundMessage {
                kind: InboundKind::Command {
                    name: "dance".into(),
                    args: vec![],
                },
                ..InboundMessage::text("mock", "c1", "u1", "")
            })
            .await;

        let outbound = sent.lock().unwrap();
        assert_eq!(outbound[0].text, "Unknown command: /dance");
    }

    #[tokio::test]
    async fn fan_out_covers_bindings_and_reply_channels_once() {
        let (router, _, sent) = test_router(BOUND_CONFIG).await;

        // Register a reply channel that duplicates the binding, plus a new one.
        let message = InboundMessage::text("mock", "c1", "u1", "x");
        router.remember_interaction(&message, "api", "ab12cd").await;
        let other = InboundMessage::text("mock", "extra", "u1", "x");
        router.remember_interaction(&other, "api", "ab12cd").await;

        router.send_to_project_channels("api", "notification", &[]).await;

        let outbound = sent.lock().unwrap();
        let channels: Vec<&str> = outbound.iter().map(|m| m.channel_id.as_str()).collect();
        // c1 (binding) once, shared (binding) once, extra (reply channel) once.
        assert_eq!(channels.iter().filter(|c| **c == "c1").count(), 1);
        assert_eq!(channels.iter().filter(|c| **c == "extra").count(), 1);
        assert_eq!(outbound.len(), 3);
    }

    #[tokio::test]
    async fn rich_fan_out_carries_buttons() {
        let (router, _, sent) = test_router(BOUND_CONFIG).await;
        let buttons = vec![ActionButton {
            label: "Approve".into(),
            action: "approve".into(),
            agent_id: "ab12cd".into(),
        }];
        router
            .send_to_project_channels_rich("api", "needs input", buttons)
            .await;

        let outbound = sent.lock().unwrap();
        assert!(!outbound.is_empty());
        assert_eq!(outbound[0].action_buttons.len(), 1);
        assert_eq!(outbound[0].action_buttons[0].action, "approve");
    }

    #[tokio::test]
    async fn sticky_context_clears_when_agent_dies() {
        let (router, lifecycle, _) = test_router(BOUND_CONFIG).await;
        lifecycle
            .agents()
            .insert(agent_for("api", "gone01", AgentStatus::Idle))
            .await;

        let key = ("mock".to_string(), "c1".to_string());
        router.context.lock().await.insert(key.clone(), "gone01".into());
        assert_eq!(router.sticky_context(&key).await.as_deref(), Some("gone01"));

        lifecycle.agents().remove("gone01").await;
        assert_eq!(router.sticky_context(&key).await, None);
        assert!(router.context.lock().await.get(&key).is_none());
    }

    #[tokio::test]
    async fn button_press_targets_named_agent() {
        let (router, _, sent) = test_router(BOUND_CONFIG).await;
        router
            .handle_inbound(InboundMessage {
                kind: InboundKind::Button {
                    action: "approve".into(),
                    agent_id: "nosuch".into(),
                },
                ..InboundMessage::text("mock", "c1", "u1", "")
            })
            .await;

        let outbound = sent.lock().unwrap();
        assert_eq!(outbound[0].text, "Agent `nosuch` not found.");
    }
}
