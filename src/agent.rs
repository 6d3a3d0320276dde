//! Agent record and status types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session name prefix shared by every agent terminal session.
///
/// `forge__{project}__{short_id}` is the single source of truth for recovery:
/// any tmux session matching the pattern is treated as a live agent.
pub const SESSION_PREFIX: &str = "forge__";

/// Liveness state of one agent, inferred from its terminal scrollback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Working,
    WaitingInput,
    Idle,
    Stopped,
    Error,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Working => "working",
            AgentStatus::WaitingInput => "waiting_input",
            AgentStatus::Idle => "idle",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "starting" => Some(AgentStatus::Starting),
            "working" => Some(AgentStatus::Working),
            "waiting_input" => Some(AgentStatus::WaitingInput),
            "idle" => Some(AgentStatus::Idle),
            "stopped" => Some(AgentStatus::Stopped),
            "error" => Some(AgentStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One long-running coding session: a tmux session on a dedicated git worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Short random hex id (6 chars), unique across the process lifetime.
    pub id: String,
    pub project_name: String,
    pub session_name: String,
    pub worktree_path: String,
    pub branch_name: String,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Most recent captured scrollback; compared against the next capture
    /// to distinguish WORKING from IDLE.
    #[serde(default)]
    pub last_output: String,
    #[serde(default)]
    pub task_description: String,
    /// Live sub-agent count maintained by hook events; never negative.
    #[serde(default)]
    pub sub_agent_count: u32,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub needs_attention: bool,
    #[serde(default)]
    pub parked: bool,
    /// Last extracted response text, used to dedup repeated relays.
    #[serde(default)]
    pub last_response: String,
    #[serde(default)]
    pub last_user_message: String,
    #[serde(default)]
    pub output_log_path: String,
    /// Byte offset into the pipe-log recorded when the user last messaged
    /// the agent, so the relay only considers output produced after it.
    #[serde(default)]
    pub last_relay_offset: u64,
}

impl Agent {
    pub fn new(
        id: impl Into<String>,
        project_name: impl Into<String>,
        session_name: impl Into<String>,
        worktree_path: impl Into<String>,
        branch_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_name: project_name.into(),
            session_name: session_name.into(),
            worktree_path: worktree_path.into(),
            branch_name: branch_name.into(),
            status: AgentStatus::Starting,
            created_at: now,
            last_activity: now,
            last_output: String::new(),
            task_description: String::new(),
            sub_agent_count: 0,
            profile: String::new(),
            needs_attention: false,
            parked: false,
            last_response: String::new(),
            last_user_message: String::new(),
            output_log_path: String::new(),
            last_relay_offset: 0,
        }
    }
}

/// Build the tmux session name for a project + agent id pair.
pub fn session_name(project_name: &str, agent_id: &str) -> String {
    format!("{SESSION_PREFIX}{project_name}__{agent_id}")
}

/// Parse a session name back into `(project_name, agent_id)`.
///
/// Returns `None` for sessions that don't belong to the supervisor.
pub fn parse_session_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(SESSION_PREFIX)?;
    // The agent id never contains "__", so split from the right.
    let (project, id) = rest.rsplit_once("__")?;
    if project.is_empty() || id.is_empty() {
        return None;
    }
    Some((project, id))
}

/// Generate a 6-char lowercase hex agent id.
pub fn generate_agent_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_name_round_trips() {
        let name = session_name("api", "ab12cd");
        assert_eq!(name, "forge__api__ab12cd");
        assert_eq!(parse_session_name(&name), Some(("api", "ab12cd")));
    }

    #[test]
    fn parse_rejects_foreign_sessions() {
        assert_eq!(parse_session_name("main"), None);
        assert_eq!(parse_session_name("forge__justone"), None);
        assert_eq!(parse_session_name("forge____"), None);
    }

    #[test]
    fn parse_handles_project_names_with_separators() {
        // A project named "my__app" still parses because the id is the last segment.
        assert_eq!(
            parse_session_name("forge__my__app__ab12cd"),
            Some(("my__app", "ab12cd"))
        );
    }

    #[test]
    fn generated_ids_are_short_hex() {
        let id = generate_agent_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn status_parse_inverts_as_str() {
        for status in [
            AgentStatus::Starting,
            AgentStatus::Working,
            AgentStatus::WaitingInput,
            AgentStatus::Idle,
            AgentStatus::Stopped,
            AgentStatus::Error,
        ] {
            assert_eq!(AgentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AgentStatus::parse("bogus"), None);
    }
}
