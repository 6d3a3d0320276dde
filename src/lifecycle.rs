//! Agent lifecycle: spawn, kill, restart, messaging, and session recovery.

use crate::agent::{self, Agent, AgentStatus};
use crate::agents::AgentStore;
use crate::config::{AgentProfile, StartAction, StartSequenceStep};
use crate::error::{AgentError, ConfigError, Result};
use crate::registry::Registry;
use crate::store::{EventType, ForgeStore};
use crate::worktree::sanitize_for_branch;
use crate::{monitor, terminal, worktree};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Default branch prefix for normal spawns; A/B spawns use `compare`.
pub const DEFAULT_BRANCH_PREFIX: &str = "agent";

/// Per-agent pipe-log filename inside the worktree.
const OUTPUT_LOG_NAME: &str = ".agent_output.log";

/// Filename the coding tool reads its merged instructions from.
const INSTRUCTIONS_FILE: &str = "CLAUDE.md";

/// wait_for_idle poll cadence and default timeout.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(2);
const IDLE_DEFAULT_TIMEOUT: f64 = 120.0;

pub struct Lifecycle {
    registry: Arc<Registry>,
    agents: Arc<AgentStore>,
    store: ForgeStore,
    /// Local server port, baked into the sub-agent hook URL.
    server_port: u16,
    /// Start-sequence workers keyed by agent id so kill can cancel them.
    sequence_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Lifecycle {
    pub fn new(
        registry: Arc<Registry>,
        agents: Arc<AgentStore>,
        store: ForgeStore,
        server_port: u16,
    ) -> Self {
        Self {
            registry,
            agents,
            store,
            server_port,
            sequence_tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn agents(&self) -> &Arc<AgentStore> {
        &self.agents
    }

    /// Spawn a new agent for a project.
    pub async fn spawn_agent(
        self: &Arc<Self>,
        project_name: &str,
        task: &str,
        branch_prefix: &str,
        profile_name: &str,
    ) -> Result<Agent> {
        let project = self.registry.get_project(project_name)?;
        let config = self.registry.config();
        let max_agents = config.get_max_agents(project_name);

        let current = self.agents.count_active(project_name).await;
        if current >= max_agents {
            return Err(AgentError::LimitReached {
                project: project_name.to_string(),
                current,
                max: max_agents,
            }
            .into());
        }

        let profile = if profile_name.is_empty() {
            None
        } else {
            Some(
                config
                    .get_profile(profile_name)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownProfile(profile_name.to_string()))?,
            )
        };

        let short_id = agent::generate_agent_id();
        let task_slug = if task.is_empty() {
            "task".to_string()
        } else {
            sanitize_for_branch(task)
        };
        let branch_name = format!("{branch_prefix}/{short_id}/{task_slug}");
        let session_name = agent::session_name(project_name, &short_id);
        let project_path = PathBuf::from(&project.path);
        let worktree_dir = project_path.join(".worktrees").join(&short_id);

        worktree::create_worktree(
            &project_path,
            &branch_name,
            &project.default_branch,
            &worktree_dir,
        )
        .await?;

        // Worktree scaffolding: media dir, gitignored env files, hook config,
        // merged instruction layers. Any failure unwinds the worktree and
        // branch before surfacing.
        let scaffold = async {
            tokio::fs::create_dir_all(worktree_dir.join(".media")).await?;
            copy_env_files(&project_path, &worktree_dir).await;
            self.install_hooks(&worktree_dir, &short_id).await?;
            generate_instructions(
                &worktree_dir,
                &config.defaults.agent_instructions,
                &project.agent_instructions,
                profile.as_ref().map(|p| p.instructions.as_str()).unwrap_or(""),
                &project_path,
                &project.context_files,
            )
            .await
        };
        if let Err(error) = scaffold.await {
            worktree::remove_worktree(&project_path, &worktree_dir, true).await;
            worktree::delete_branch(&project_path, &branch_name).await;
            return Err(error);
        }

        let command = build_launch_command(
            &worktree_dir,
            &config.defaults.claude_command,
            &config.defaults.claude_env,
            profile.as_ref().map(|p| p.system_prompt.as_str()).unwrap_or(""),
        );

        if let Err(error) =
            terminal::create_session(&session_name, &worktree_dir.display().to_string(), &command)
                .await
        {
            // Unwind the partial spawn before surfacing the error.
            worktree::remove_worktree(&project_path, &worktree_dir, true).await;
            worktree::delete_branch(&project_path, &branch_name).await;
            return Err(error.into());
        }

        let output_log = worktree_dir.join(OUTPUT_LOG_NAME);
        terminal::enable_pipe_pane(&session_name, &output_log.display().to_string()).await;

        let mut new_agent = Agent::new(
            &short_id,
            project_name,
            &session_name,
            worktree_dir.display().to_string(),
            &branch_name,
        );
        new_agent.task_description = task.to_string();
        new_agent.profile = profile_name.to_string();
        new_agent.output_log_path = output_log.display().to_string();
        self.agents.insert(new_agent.clone()).await;

        if let Err(error) = self
            .store
            .log_event(
                &short_id,
                project_name,
                EventType::Spawned,
                Some(serde_json::json!({"branch": branch_name, "task": task, "profile": profile_name})),
            )
            .await
        {
            tracing::warn!(%error, "failed to log spawn event");
        }

        self.schedule_start_sequence(&short_id, profile.as_ref(), task)
            .await;

        tracing::info!(
            agent_id = %short_id,
            project = %project_name,
            branch = %new_agent.branch_name,
            profile = %if profile_name.is_empty() { "none" } else { profile_name },
            "spawned agent"
        );
        Ok(new_agent)
    }

    /// Spawn `count` agents on the same task, cycling through `profiles`,
    /// with the `compare` branch prefix. A mid-way failure surfaces the
    /// error; earlier spawns stay in place.
    pub async fn spawn_comparison(
        self: &Arc<Self>,
        project_name: &str,
        task: &str,
        profiles: &[String],
        count: usize,
    ) -> Result<Vec<Agent>> {
        if profiles.is_empty() {
            return Err(
                ConfigError::Invalid("at least one profile is required for comparison mode".into())
                    .into(),
            );
        }
        let count = if count == 0 { profiles.len() } else { count };

        let mut spawned = Vec::with_capacity(count);
        for i in 0..count {
            let profile = &profiles[i % profiles.len()];
            let agent = self
                .spawn_agent(project_name, task, "compare", profile)
                .await?;
            spawned.push(agent);
        }
        tracing::info!(
            count = spawned.len(),
            project = %project_name,
            "spawned comparison agents"
        );
        Ok(spawned)
    }

    /// Kill an agent and clean up its session, worktree, and branch.
    ///
    /// Cleanup steps are best-effort; the agent always leaves the store.
    pub async fn kill_agent(&self, agent_id: &str) -> bool {
        let Some(agent) = self.agents.get(agent_id).await else {
            tracing::warn!(agent_id = %agent_id, "agent not found");
            return false;
        };

        // Cancel any in-flight start sequence first.
        if let Some(handle) = self.sequence_tasks.lock().await.remove(agent_id) {
            handle.abort();
        }

        terminal::disable_pipe_pane(&agent.session_name).await;
        if !agent.output_log_path.is_empty() {
            let _ = tokio::fs::remove_file(&agent.output_log_path).await;
        }
        terminal::kill_session(&agent.session_name).await;

        if let Ok(project) = self.registry.get_project(&agent.project_name) {
            let project_path = PathBuf::from(&project.path);
            worktree::remove_worktree(&project_path, Path::new(&agent.worktree_path), true).await;
            worktree::delete_branch(&project_path, &agent.branch_name).await;
        }

        self.agents.remove(agent_id).await;
        if let Err(error) = self.store.delete_snapshot(agent_id).await {
            tracing::warn!(%error, "failed to delete snapshot");
        }
        if let Err(error) = self
            .store
            .log_event(agent_id, &agent.project_name, EventType::Killed, None)
            .await
        {
            tracing::warn!(%error, "failed to log kill event");
        }

        tracing::info!(agent_id = %agent_id, project = %agent.project_name, "killed agent");
        true
    }

    /// Kill and respawn with the same project, task, and profile.
    pub async fn restart_agent(self: &Arc<Self>, agent_id: &str) -> Result<Agent> {
        let agent = self
            .agents
            .get(agent_id)
            .await
            .ok_or_else(|| AgentError::NotFound {
                id: agent_id.to_string(),
            })?;

        let project_name = agent.project_name.clone();
        let task = agent.task_description.clone();
        let profile = agent.profile.clone();

        self.kill_agent(agent_id).await;
        let replacement = self
            .spawn_agent(&project_name, &task, DEFAULT_BRANCH_PREFIX, &profile)
            .await?;

        if let Err(error) = self
            .store
            .log_event(
                &replacement.id,
                &project_name,
                EventType::AgentRestarted,
                Some(serde_json::json!({"previous_id": agent_id})),
            )
            .await
        {
            tracing::warn!(%error, "failed to log restart event");
        }
        Ok(replacement)
    }

    /// Clear an agent's conversation context by sending `/clear`.
    ///
    /// Intended only for an already-idle agent (the router enforces this).
    pub async fn clear_context(&self, agent_id: &str) -> bool {
        let Some(agent) = self.agents.get(agent_id).await else {
            return false;
        };
        let sent = terminal::send_keys(&agent.session_name, "/clear").await;
        if sent {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.agents
                .update(agent_id, |a| a.last_activity = Utc::now())
                .await;
        }
        sent
    }

    /// Send a text message to an agent's terminal.
    pub async fn send_message(&self, agent_id: &str, message: &str) -> bool {
        let Some(agent) = self.agents.get(agent_id).await else {
            tracing::warn!(agent_id = %agent_id, "agent not found");
            return false;
        };

        let sent = terminal::send_keys(&agent.session_name, message).await;
        if sent {
            // Record the pipe-log high-water mark so the relay only considers
            // output produced after this prompt.
            let offset = tokio::fs::metadata(&agent.output_log_path)
                .await
                .map(|m| m.len())
                .unwrap_or(agent.last_relay_offset);
            self.agents
                .update(agent_id, |a| {
                    a.last_activity = Utc::now();
                    a.last_user_message = message.to_string();
                    a.last_relay_offset = offset;
                })
                .await;
            if let Err(error) = self
                .store
                .log_event(
                    agent_id,
                    &agent.project_name,
                    EventType::MessageSent,
                    Some(serde_json::json!({"preview": preview(message)})),
                )
                .await
            {
                tracing::warn!(%error, "failed to log message event");
            }
        }
        sent
    }

    /// Send a message that references media files staged in the worktree.
    pub async fn send_message_with_media(
        &self,
        agent_id: &str,
        message: &str,
        media_paths: &[String],
        media_context: &str,
    ) -> bool {
        if !self.agents.contains(agent_id).await {
            return false;
        }
        let reference = if media_context.is_empty() {
            format!("Referenced files: {}", media_paths.join(", "))
        } else {
            media_context.to_string()
        };
        let full = if message.is_empty() {
            reference
        } else {
            format!("{message}\n\n{reference}")
        };
        self.send_message(agent_id, &full).await
    }

    /// Send a control action mapped onto raw keys.
    pub async fn send_control(&self, agent_id: &str, action: &str) -> Result<()> {
        let agent = self
            .agents
            .get(agent_id)
            .await
            .ok_or_else(|| AgentError::NotFound {
                id: agent_id.to_string(),
            })?;

        let keys: &[&str] = match action {
            "approve" => &["Enter"],
            "approve_all" => &["Down", "Enter"],
            "reject" => &["Escape"],
            "interrupt" => &["C-c"],
            "up" => &["Up"],
            "down" => &["Down"],
            other => {
                return Err(AgentError::UnknownControlAction(other.to_string()).into());
            }
        };

        if !terminal::send_raw(&agent.session_name, keys).await {
            return Err(anyhow::anyhow!(
                "failed to deliver control keys to agent {agent_id}"
            )
            .into());
        }

        self.agents
            .update(agent_id, |a| a.last_activity = Utc::now())
            .await;
        if let Err(error) = self
            .store
            .log_event(
                agent_id,
                &agent.project_name,
                EventType::ControlSent,
                Some(serde_json::json!({"action": action})),
            )
            .await
        {
            tracing::warn!(%error, "failed to log control event");
        }
        tracing::info!(agent_id = %agent_id, action = %action, "sent control");
        Ok(())
    }

    /// Rebuild the agent map from live tmux sessions, merging persisted
    /// snapshot fields on top. Idempotent: recovering twice yields the same
    /// set of agents.
    pub async fn recover_sessions(&self) -> usize {
        let sessions = terminal::list_sessions().await;
        let snapshots: HashMap<String, crate::store::AgentSnapshot> = match self
            .store
            .load_snapshots()
            .await
        {
            Ok(snapshots) => snapshots
                .into_iter()
                .map(|s| (s.agent_id.clone(), s))
                .collect(),
            Err(error) => {
                tracing::warn!(%error, "failed to load snapshots for recovery");
                HashMap::new()
            }
        };

        let mut recovered = 0;
        let mut seen_ids: Vec<String> = Vec::new();
        for session in sessions {
            let Some((project_name, short_id)) = agent::parse_session_name(&session.name) else {
                continue;
            };
            seen_ids.push(short_id.to_string());

            if self.agents.contains(short_id).await {
                continue;
            }
            let Ok(project) = self.registry.get_project(project_name) else {
                tracing::warn!(
                    session = %session.name,
                    project = %project_name,
                    "recovered session references unknown project"
                );
                continue;
            };

            let worktree_path = PathBuf::from(&project.path)
                .join(".worktrees")
                .join(short_id);

            // Detect with previous == current so the "output changed" branch
            // cannot fire and produce a spurious WORKING->IDLE notification
            // on the first poll.
            let output = terminal::capture_pane(&session.name, 100).await;
            let status = monitor::detect_status(&output, &output);

            let mut recovered_agent = Agent::new(
                short_id,
                project_name,
                &session.name,
                worktree_path.display().to_string(),
                format!("{DEFAULT_BRANCH_PREFIX}/{short_id}/recovered"),
            );
            recovered_agent.status = status;
            recovered_agent.last_output = output;
            recovered_agent.output_log_path =
                worktree_path.join(OUTPUT_LOG_NAME).display().to_string();

            if let Some(snapshot) = snapshots.get(short_id) {
                recovered_agent.branch_name = snapshot.branch_name.clone();
                recovered_agent.task_description = snapshot.task_description.clone();
                recovered_agent.profile = snapshot.profile.clone();
                recovered_agent.needs_attention = snapshot.needs_attention;
                recovered_agent.parked = snapshot.parked;
                recovered_agent.created_at = snapshot.created_at;
                recovered_agent.last_activity = snapshot.last_activity;
                recovered_agent.last_response = snapshot.last_response.clone();
                recovered_agent.last_user_message = snapshot.last_user_message.clone();
            }

            self.agents.insert(recovered_agent).await;
            recovered += 1;
        }

        // Snapshots without a live session are stale.
        for (agent_id, snapshot) in &snapshots {
            if !seen_ids.contains(agent_id) {
                tracing::debug!(agent_id = %agent_id, project = %snapshot.project_name, "dropping stale snapshot");
                if let Err(error) = self.store.delete_snapshot(agent_id).await {
                    tracing::warn!(%error, "failed to delete stale snapshot");
                }
            }
        }

        if recovered > 0 {
            tracing::info!(count = recovered, "recovered existing agent sessions");
        }
        recovered
    }

    async fn schedule_start_sequence(
        self: &Arc<Self>,
        agent_id: &str,
        profile: Option<&AgentProfile>,
        task: &str,
    ) {
        let steps = start_sequence_for(profile, task);
        if steps.is_empty() {
            return;
        }

        let lifecycle = Arc::clone(self);
        let agent_id_owned = agent_id.to_string();
        let task_owned = task.to_string();
        let handle = tokio::spawn(async move {
            lifecycle
                .execute_start_sequence(&agent_id_owned, &steps, &task_owned)
                .await;
            lifecycle.sequence_tasks.lock().await.remove(&agent_id_owned);
        });
        self.sequence_tasks
            .lock()
            .await
            .insert(agent_id.to_string(), handle);
    }

    /// Run the start sequence steps, substituting `{task}` in send values.
    /// Aborts silently if the agent is killed mid-sequence.
    async fn execute_start_sequence(&self, agent_id: &str, steps: &[StartSequenceStep], task: &str) {
        for step in steps {
            match self.agents.get(agent_id).await {
                Some(agent) if agent.status != AgentStatus::Stopped => {}
                _ => return,
            }

            match step.action {
                StartAction::Wait => {
                    let delay = step.value.parse::<f64>().unwrap_or(3.0);
                    tokio::time::sleep(Duration::from_secs_f64(delay.max(0.0))).await;
                }
                StartAction::Send => {
                    let text = step.value.replace("{task}", task);
                    self.send_message(agent_id, &text).await;
                }
                StartAction::WaitForIdle => {
                    self.wait_for_idle(agent_id, &step.value).await;
                }
            }
        }
    }

    /// Poll the pane until an idle prompt pattern appears, giving up after
    /// the configured timeout. Never errors.
    async fn wait_for_idle(&self, agent_id: &str, timeout_value: &str) {
        let timeout = timeout_value.parse::<f64>().unwrap_or(IDLE_DEFAULT_TIMEOUT);
        let idle_patterns = [
            regex::Regex::new(r"(?m)^>\s*$").unwrap(),
            regex::Regex::new("╭─").unwrap(),
            regex::Regex::new("What would you").unwrap(),
        ];

        let mut elapsed = 0.0;
        while elapsed < timeout {
            let Some(agent) = self.agents.get(agent_id).await else {
                return;
            };
            if agent.status == AgentStatus::Stopped {
                return;
            }

            let output = terminal::capture_pane(&agent.session_name, 20).await;
            if !output.is_empty() && idle_patterns.iter().any(|p| p.is_match(&output)) {
                return;
            }

            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            elapsed += IDLE_POLL_INTERVAL.as_secs_f64();
        }
        tracing::warn!(agent_id = %agent_id, timeout, "wait_for_idle timed out");
    }

    /// Write the hook settings that make the coding tool report sub-agent
    /// start/stop to the local server.
    async fn install_hooks(&self, worktree_dir: &Path, agent_id: &str) -> Result<()> {
        let endpoint = format!("http://localhost:{}/api/hooks/event", self.server_port);
        let hook_command = |event: &str| {
            format!(
                "curl -s -X POST -H 'Content-Type: application/json' \
                 -d '{{\"agent_id\":\"{agent_id}\",\"hook_event\":\"{event}\"}}' {endpoint}"
            )
        };
        let hooks = serde_json::json!({
            "hooks": {
                "SubagentStart": [{
                    "matcher": "",
                    "hooks": [{"type": "command", "command": hook_command("SubagentStart")}],
                }],
                "SubagentStop": [{
                    "matcher": "",
                    "hooks": [{"type": "command", "command": hook_command("SubagentStop")}],
                }],
            }
        });

        let claude_dir = worktree_dir.join(".claude");
        tokio::fs::create_dir_all(&claude_dir).await?;
        let settings_path = claude_dir.join("settings.local.json");
        tokio::fs::write(&settings_path, serde_json::to_string_pretty(&hooks).unwrap_or_default())
            .await?;
        tracing::info!(path = %settings_path.display(), "installed sub-agent hooks");
        Ok(())
    }
}

fn preview(message: &str) -> String {
    let trimmed: String = message.chars().take(100).collect();
    if trimmed.len() < message.len() {
        format!("{trimmed}...")
    } else {
        trimmed
    }
}

/// The profile's sequence, or the default `wait 3` + `send {task}` when a
/// task is present.
fn start_sequence_for(profile: Option<&AgentProfile>, task: &str) -> Vec<StartSequenceStep> {
    if let Some(profile) = profile {
        if !profile.start_sequence.is_empty() {
            return profile.start_sequence.clone();
        }
    }
    if task.is_empty() {
        return Vec::new();
    }
    vec![
        StartSequenceStep {
            action: StartAction::Wait,
            value: "3".into(),
        },
        StartSequenceStep {
            action: StartAction::Send,
            value: "{task}".into(),
        },
    ]
}

/// Copy `.env*` files from the project root into the worktree. They are
/// gitignored so the worktree checkout doesn't include them, but the code
/// needs them to run.
async fn copy_env_files(project_path: &Path, worktree_dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(project_path).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(".env") {
            continue;
        }
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            if let Err(error) = tokio::fs::copy(entry.path(), worktree_dir.join(name)).await {
                tracing::warn!(%error, file = %name, "failed to copy env file");
            }
        }
    }
}

/// Generate the merged instruction file in the worktree.
///
/// Layers in order: global, project, profile, then each context file framed
/// with its relative path as a heading. Existing content is preserved after
/// a visible separator. Nothing is written when all layers are empty.
async fn generate_instructions(
    worktree_dir: &Path,
    global: &str,
    project_instructions: &str,
    profile_instructions: &str,
    project_path: &Path,
    context_files: &[String],
) -> Result<()> {
    let mut sections: Vec<String> = Vec::new();

    for layer in [global, project_instructions, profile_instructions] {
        let trimmed = layer.trim();
        if !trimmed.is_empty() {
            sections.push(trimmed.to_string());
        }
    }

    for context_file in context_files {
        let path = project_path.join(context_file);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) if !content.trim().is_empty() => {
                sections.push(format!("## {}\n\n{}", context_file, content.trim()));
            }
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(path = %path.display(), "context file not found");
            }
        }
    }

    if sections.is_empty() {
        return Ok(());
    }

    let generated = sections.join("\n\n");
    let instructions_path = worktree_dir.join(INSTRUCTIONS_FILE);
    let existing = tokio::fs::read_to_string(&instructions_path)
        .await
        .map(|c| c.trim().to_string())
        .unwrap_or_default();

    let merged = if existing.is_empty() {
        format!("{generated}\n")
    } else {
        format!("{generated}\n\n---\n\n{existing}\n")
    };

    tokio::fs::write(&instructions_path, merged).await?;
    tracing::info!(
        path = %instructions_path.display(),
        layers = sections.len(),
        "generated agent instructions"
    );
    Ok(())
}

/// Compose the shell command the terminal session runs: env exports, the
/// configured tool command, and the profile system prompt (shell-escaped).
fn build_launch_command(
    worktree_dir: &Path,
    claude_command: &str,
    claude_env: &HashMap<String, String>,
    system_prompt: &str,
) -> String {
    let mut env_pairs: Vec<(&String, &String)> = claude_env.iter().collect();
    env_pairs.sort();
    let env_exports: String = env_pairs
        .iter()
        .map(|(k, v)| format!("export {k}={v} && "))
        .collect();

    let mut command = claude_command.to_string();
    let prompt = system_prompt.trim();
    if !prompt.is_empty() {
        let escaped = prompt.replace('\'', "'\\''");
        command = format!("{command} --append-system-prompt '{escaped}'");
    }

    format!("cd {} && {env_exports}{command}", worktree_dir.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentProfile, StartAction};

    #[test]
    fn default_sequence_waits_then_sends_task() {
        let steps = start_sequence_for(None, "fix login bug");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].action, StartAction::Wait);
        assert_eq!(steps[0].value, "3");
        assert_eq!(steps[1].action, StartAction::Send);
        assert_eq!(steps[1].value, "{task}");
    }

    #[test]
    fn empty_task_yields_no_default_sequence() {
        assert!(start_sequence_for(None, "").is_empty());
    }

    #[test]
    fn profile_sequence_takes_precedence() {
        let profile = AgentProfile {
            start_sequence: vec![StartSequenceStep {
                action: StartAction::WaitForIdle,
                value: "60".into(),
            }],
            ..Default::default()
        };
        let steps = start_sequence_for(Some(&profile), "task");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].action, StartAction::WaitForIdle);
    }

    #[test]
    fn launch_command_escapes_system_prompt() {
        let command = build_launch_command(
            Path::new("/srv/api/.worktrees/ab12cd"),
            "claude",
            &HashMap::new(),
            "don't break 'things'",
        );
        assert!(command.starts_with("cd /srv/api/.worktrees/ab12cd && claude"));
        assert!(command.contains("--append-system-prompt 'don'\\''t break '\\''things'\\'''"));
    }

    #[test]
    fn launch_command_exports_env_sorted() {
        let env: HashMap<String, String> = [
            ("B_VAR".to_string(), "2".to_string()),
            ("A_VAR".to_string(), "1".to_string()),
        ]
        .into_iter()
        .collect();
        let command = build_launch_command(Path::new("/wt"), "claude", &env, "");
        assert_eq!(
            command,
            "cd /wt && export A_VAR=1 && export B_VAR=2 && claude"
        );
    }

    #[tokio::test]
    async fn instructions_merge_layers_and_preserve_existing() {
        let dir = tempfile::tempdir().unwrap();
        let worktree = dir.path().join("wt");
        let project = dir.path().join("project");
        std::fs::create_dir_all(&worktree).unwrap();
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("NOTES.md"), "project notes here").unwrap();
        std::fs::write(worktree.join("CLAUDE.md"), "pre-existing local rules").unwrap();

        generate_instructions(
            &worktree,
            "global rules",
            "project rules",
            "profile rules",
            &project,
            &["NOTES.md".to_string(), "MISSING.md".to_string()],
        )
        .await
        .unwrap();

        let merged = std::fs::read_to_string(worktree.join("CLAUDE.md")).unwrap();
        assert_eq!(
            merged,
            "global rules\n\nproject rules\n\nprofile rules\n\n## NOTES.md\n\nproject notes here\n\n---\n\npre-existing local rules\n"
        );
    }

    #[tokio::test]
    async fn empty_layers_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        generate_instructions(dir.path(), "", "", "", dir.path(), &[])
            .await
            .unwrap();
        assert!(!dir.path().join("CLAUDE.md").exists());
    }

    #[test]
    fn preview_truncates_long_messages() {
        let long = "m".repeat(150);
        let p = preview(&long);
        assert_eq!(p.chars().count(), 103);
        assert!(p.ends_with("..."));
        assert_eq!(preview("short"), "short");
    }

    #[tokio::test]
    async fn control_failures_are_typed() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        std::io::Write::write_all(&mut file, b"").unwrap();
        let (_, path) = file.keep().unwrap();
        let registry = Arc::new(crate::registry::Registry::load(path).unwrap());
        let store = crate::store::ForgeStore::open_in_memory().await.unwrap();
        let lifecycle = Lifecycle::new(registry, Arc::new(AgentStore::new()), store, 8080);

        let mut agent = Agent::new(
            "ct0001",
            "api",
            "forge__api__ct0001",
            "/tmp/ct0001",
            "agent/ct0001/task",
        );
        agent.status = AgentStatus::Idle;
        lifecycle.agents().insert(agent).await;

        let error = lifecycle.send_control("ct0001", "dance").await.unwrap_err();
        assert!(matches!(
            error,
            crate::error::Error::Agent(AgentError::UnknownControlAction(ref action)) if action == "dance"
        ));

        let error = lifecycle.send_control("nosuch", "approve").await.unwrap_err();
        assert!(matches!(
            error,
            crate::error::Error::Agent(AgentError::NotFound { .. })
        ));
    }
}
