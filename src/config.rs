//! Configuration schema: serde models for forge.toml.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub server: ServerConfig,
    /// Legacy single-connector Telegram section, migrated into `connectors`
    /// at load time when no connectors are configured.
    pub telegram: TelegramConfig,
    pub connectors: HashMap<String, ConnectorConfig>,
    pub defaults: DefaultsConfig,
    pub profiles: HashMap<String, AgentProfile>,
    pub projects: HashMap<String, ProjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub secret_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            secret_key: "change-me-in-production".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub allowed_users: Vec<i64>,
}

/// A single step in an agent's boot sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartSequenceStep {
    pub action: StartAction,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartAction {
    Wait,
    Send,
    WaitForIdle,
}

/// Named preset with system prompt, instructions, and start sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProfile {
    pub description: String,
    pub system_prompt: String,
    pub instructions: String,
    pub start_sequence: Vec<StartSequenceStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub enabled: bool,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_seconds: f64,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            model: "claude-haiku-4-5-20251001".into(),
            max_tokens: 300,
            timeout_seconds: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseRelayConfig {
    pub enabled: bool,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_seconds: f64,
    /// Declared for config compatibility; not currently bound to behavior.
    pub fallback_to_summary: bool,
}

impl Default for ResponseRelayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "claude-haiku-4-5-20251001".into(),
            max_tokens: 4000,
            timeout_seconds: 15.0,
            fallback_to_summary: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub collect_interval_seconds: f64,
    pub enable_gpu: bool,
    pub enable_per_agent: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collect_interval_seconds: 5.0,
            enable_gpu: true,
            enable_per_agent: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub max_agents_per_project: usize,
    /// Launch command for the agent tool.
    pub claude_command: String,
    /// Env vars exported before launch.
    pub claude_env: HashMap<String, String>,
    pub poll_interval_seconds: f64,
    /// Global instruction layer merged into every new agent's instructions.
    pub agent_instructions: String,
    pub summary: SummaryConfig,
    pub response_relay: ResponseRelayConfig,
    pub metrics: MetricsConfig,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_agents_per_project: 5,
            claude_command: "claude".into(),
            claude_env: HashMap::new(),
            poll_interval_seconds: 3.0,
            agent_instructions: String::new(),
            summary: SummaryConfig::default(),
            response_relay: ResponseRelayConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Platform type: "telegram", "discord", "slack", "whatsapp", "signal".
    #[serde(rename = "type")]
    pub connector_type: String,
    pub enabled: bool,
    pub credentials: HashMap<String, String>,
    pub settings: HashMap<String, serde_json::Value>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connector_type: String::new(),
            enabled: true,
            credentials: HashMap::new(),
            settings: HashMap::new(),
        }
    }
}

/// A per-project subscription marking a chat channel as an inbound/outbound endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub connector_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub channel_name: String,
    #[serde(default = "default_true")]
    pub inbound: bool,
    #[serde(default = "default_true")]
    pub outbound: bool,
}

fn default_true() -> bool {
    true
}

/// Per-project sandbox allow-list. Opaque to the supervision core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub allowed_hosts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Filesystem path to an existing git repository.
    pub path: String,
    pub default_branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_agents: Option<usize>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxConfig>,
    pub channels: Vec<ChannelBinding>,
    pub agent_instructions: String,
    /// Paths relative to the project root whose content is inlined into
    /// every new agent's instruction file.
    pub context_files: Vec<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            default_branch: "main".into(),
            max_agents: None,
            description: String::new(),
            sandbox: None,
            channels: Vec::new(),
            agent_instructions: String::new(),
            context_files: Vec::new(),
        }
    }
}

impl ForgeConfig {
    pub fn get_profile(&self, name: &str) -> Option<&AgentProfile> {
        self.profiles.get(name)
    }

    /// Max agents for a project, falling back to the global default.
    pub fn get_max_agents(&self, project_name: &str) -> usize {
        self.projects
            .get(project_name)
            .and_then(|p| p.max_agents)
            .unwrap_or(self.defaults.max_agents_per_project)
    }

    /// Telegram bot token from the environment or the legacy config section.
    pub fn get_bot_token(&self) -> String {
        std::env::var("AGENT_FORGE_TELEGRAM_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.telegram.bot_token.clone())
    }

    /// Anthropic API key for summarization and response extraction.
    ///
    /// Resolution order: AGENT_FORGE_ANTHROPIC_API_KEY > ANTHROPIC_API_KEY > config value.
    pub fn get_summary_api_key(&self) -> String {
        std::env::var("AGENT_FORGE_ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty()))
            .unwrap_or_else(|| self.defaults.summary.api_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn parses_minimal_config() {
        let raw = indoc! {r#"
            [server]
            port = 9090

            [projects.api]
            path = "/srv/api"
            default_branch = "develop"
            max_agents = 3

            [[projects.api.channels]]
            connector_id = "tg"
            channel_id = "-100123"
            inbound = true
            outbound = false

            [connectors.tg]
            type = "telegram"

            [connectors.tg.credentials]
            bot_token = "abc"

            [profiles.reviewer]
            description = "code review preset"
            system_prompt = "review carefully"

            [[profiles.reviewer.start_sequence]]
            action = "wait"
            value = "5"

            [[profiles.reviewer.start_sequence]]
            action = "send"
            value = "{task}"
        "#};

        let config: ForgeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.get_max_agents("api"), 3);
        assert_eq!(config.get_max_agents("unknown"), 5);

        let binding = &config.projects["api"].channels[0];
        assert!(binding.inbound);
        assert!(!binding.outbound);

        let profile = config.get_profile("reviewer").unwrap();
        assert_eq!(profile.start_sequence.len(), 2);
        assert_eq!(profile.start_sequence[0].action, StartAction::Wait);
        assert_eq!(profile.start_sequence[1].value, "{task}");

        assert_eq!(config.connectors["tg"].connector_type, "telegram");
        assert!(config.connectors["tg"].enabled);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = ForgeConfig::default();
        config.projects.insert(
            "web".into(),
            ProjectConfig {
                path: "/srv/web".into(),
                description: "frontend".into(),
                context_files: vec!["ARCHITECTURE.md".into()],
                ..Default::default()
            },
        );
        let serialized = toml::to_string(&config).unwrap();
        let reparsed: ForgeConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(reparsed.projects["web"].path, "/srv/web");
        assert_eq!(reparsed.projects["web"].context_files, vec!["ARCHITECTURE.md"]);
    }

    #[test]
    fn unknown_start_action_is_rejected() {
        let raw = indoc! {r#"
            [profiles.bad]
            start_sequence = [{ action = "poke", value = "" }]
        "#};
        assert!(toml::from_str::<ForgeConfig>(raw).is_err());
    }
}
