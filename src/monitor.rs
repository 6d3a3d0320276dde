//! Status monitor: polls agent terminals, infers liveness state, and fires
//! transition side effects (events, snapshots, notifications, broadcasts).

use crate::agent::{Agent, AgentStatus};
use crate::agents::AgentStore;
use crate::broadcast::BroadcastBus;
use crate::connector::ActionButton;
use crate::extract::{self, ExtractOptions};
use crate::metrics::MetricsCollector;
use crate::registry::Registry;
use crate::router::ConnectorRouter;
use crate::store::{EventType, ForgeStore};
use crate::summarize::{self, SummarizeOptions};
use crate::terminal;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::{Mutex, watch};

/// Scrollback lines captured per poll.
const CAPTURE_LINES: u32 = 5000;

/// Detection inspects only the trailing portion of a capture.
const DETECT_TAIL_CHARS: usize = 2000;

/// Lines searched backward for the prompt behind a WAITING_INPUT hit.
const PROMPT_SEARCH_WINDOW: usize = 30;
const PROMPT_CONTEXT_LINES: usize = 3;

/// Regex activity summary shape.
const SUMMARY_TAIL_LINES: usize = 40;
const SUMMARY_KEEP_LINES: usize = 15;
const SUMMARY_LINE_WIDTH: usize = 120;

/// Patterns that indicate the agent is waiting for user input.
static INPUT_PATTERNS: LazyLock<Vec<regex::Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bAllow\b",
        r"\bY/n\b",
        r"\by/N\b",
        r"(?i)\byes/no\b",
        r"(?i)\bDo you want\b",
        r"(?i)\[y/n\]",
        r"(?i)\(y/n\)",
    ]
    .iter()
    .map(|p| regex::Regex::new(p).unwrap())
    .collect()
});

/// Patterns that indicate an error state.
static ERROR_PATTERNS: LazyLock<Vec<regex::Regex>> = LazyLock::new(|| {
    [r"(?i)\bError:", r"(?i)\bfatal:", r"\bFAILED\b"]
        .iter()
        .map(|p| regex::Regex::new(p).unwrap())
        .collect()
});

/// Prompt patterns matched against the last non-empty line.
static IDLE_PROMPT_PATTERNS: LazyLock<Vec<regex::Regex>> = LazyLock::new(|| {
    [r"[>❯]\s*$", r"\$\s*$"]
        .iter()
        .map(|p| regex::Regex::new(p).unwrap())
        .collect()
});

/// Noise lines dropped from activity summaries: prompts, spinners,
/// separators, and agent TUI chrome.
static SUMMARY_NOISE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?x)
          ^\s*[>❯$\#]\s*$
        | ^\s*[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏⣾⣽⣻⢿⡿⣟⣯⣷]
        | ^\s*[|/\-\\]\s\S.{0,30}$
        | ^[\s─━=~_*]{6,}$
        | ^[\s\-]{6,}$
        | ^\s*⏵
        | ^\s*[❯>]\s+\S
        | ^\s*[✢-✿]
        | .*\bChannelling\b
        | ^\s*⏺\s*$
        | ^\s*[·.…↑↓←→]+\s*$
        | ^\s*·\s+\S+…\s*$
        | ^\s*\S{1,4}\s*$
        | ^\s*\w+…\s*$
        | ^\s*\w*\(thinking\)\s*$
        ",
    )
    .unwrap()
});

/// Detect agent status from terminal output.
///
/// Priority order: input prompts, error indicators, idle prompt on the last
/// non-empty line, changed output (working), unchanged output (idle).
pub fn detect_status(output: &str, previous_output: &str) -> AgentStatus {
    if output.is_empty() {
        return AgentStatus::Idle;
    }

    let tail = char_tail(output, DETECT_TAIL_CHARS);

    if INPUT_PATTERNS.iter().any(|p| p.is_match(tail)) {
        return AgentStatus::WaitingInput;
    }
    if ERROR_PATTERNS.iter().any(|p| p.is_match(tail)) {
        return AgentStatus::Error;
    }

    if let Some(last_line) = tail.trim_end().lines().next_back() {
        if IDLE_PROMPT_PATTERNS.iter().any(|p| p.is_match(last_line)) {
            return AgentStatus::Idle;
        }
    }

    if output != previous_output {
        return AgentStatus::Working;
    }
    AgentStatus::Idle
}

/// Extract the prompt/question context behind a WAITING_INPUT detection:
/// up to 3 lines of context ending at the matching pattern, ANSI-stripped.
pub fn extract_prompt_text(output: &str) -> String {
    if output.is_empty() {
        return String::new();
    }
    let cleaned = extract::strip_ansi(output);
    let lines: Vec<&str> = cleaned.trim_end().lines().collect();
    if lines.is_empty() {
        return String::new();
    }

    let window_start = lines.len().saturating_sub(PROMPT_SEARCH_WINDOW);
    let window = &lines[window_start..];

    let Some(match_idx) = window
        .iter()
        .rposition(|line| INPUT_PATTERNS.iter().any(|p| p.is_match(line)))
    else {
        return String::new();
    };

    let start = match_idx.saturating_sub(PROMPT_CONTEXT_LINES);
    let mut context: Vec<&str> = window[start..=match_idx].to_vec();
    while context.first().is_some_and(|line| line.trim().is_empty()) {
        context.remove(0);
    }
    context.join("\n")
}

/// Pure-regex activity summary: the last 15 meaningful lines, 120 chars each.
pub fn extract_activity_summary(output: &str) -> String {
    if output.trim().is_empty() {
        return String::new();
    }
    let cleaned = extract::strip_ansi(output);
    let lines: Vec<&str> = cleaned.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return String::new();
    }

    let tail_start = lines.len().saturating_sub(SUMMARY_TAIL_LINES);
    let meaningful: Vec<&str> = lines[tail_start..]
        .iter()
        .copied()
        .filter(|line| !SUMMARY_NOISE_RE.is_match(line))
        .collect();
    if meaningful.is_empty() {
        return String::new();
    }

    let keep_start = meaningful.len().saturating_sub(SUMMARY_KEEP_LINES);
    meaningful[keep_start..]
        .iter()
        .map(|line| line.chars().take(SUMMARY_LINE_WIDTH).collect::<String>())
        .collect::<Vec<_>>()
        .join("\n")
}

fn char_tail(text: &str, n: usize) -> &str {
    if text.len() <= n {
        return text;
    }
    let mut start = text.len() - n;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Periodically polls every live agent and pushes status updates.
pub struct StatusMonitor {
    registry: Arc<Registry>,
    agents: Arc<AgentStore>,
    store: ForgeStore,
    bus: Arc<BroadcastBus>,
    router: Arc<ConnectorRouter>,
    resized_sessions: Mutex<HashSet<String>>,
    metrics: Option<Mutex<MetricsCollector>>,
}

impl StatusMonitor {
    pub fn new(
        registry: Arc<Registry>,
        agents: Arc<AgentStore>,
        store: ForgeStore,
        bus: Arc<BroadcastBus>,
        router: Arc<ConnectorRouter>,
    ) -> Self {
        let metrics = if registry.config().defaults.metrics.enabled {
            Some(Mutex::new(MetricsCollector::new(
                registry.config().defaults.metrics.enable_gpu,
            )))
        } else {
            None
        };
        Self {
            registry,
            agents,
            store,
            bus,
            router,
            resized_sessions: Mutex::new(HashSet::new()),
            metrics,
        }
    }

    /// Background polling loop. Exits when the shutdown signal fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut last_metrics = tokio::time::Instant::now();
        tracing::info!(
            poll_interval = self.registry.config().defaults.poll_interval_seconds,
            "status monitor started"
        );

        loop {
            let interval = self.registry.config().defaults.poll_interval_seconds;
            tokio::select! {
                _ = shutdown.wait_for(|v| *v) => break,
                _ = tokio::time::sleep(Duration::from_secs_f64(interval.max(0.5))) => {}
            }

            self.poll().await;

            if let Some(metrics) = &self.metrics {
                let metrics_interval = self
                    .registry
                    .config()
                    .defaults
                    .metrics
                    .collect_interval_seconds;
                if last_metrics.elapsed().as_secs_f64() >= metrics_interval {
                    let per_agent = self.registry.config().defaults.metrics.enable_per_agent;
                    let agents = self.agents.list(None).await;
                    let snapshot = metrics.lock().await.collect_all(&agents, per_agent).await;
                    self.bus.broadcast_metrics(&snapshot).await;
                    last_metrics = tokio::time::Instant::now();
                }
            }
        }
        tracing::info!("status monitor stopped");
    }

    /// One full pass over every non-STOPPED agent.
    pub async fn poll(&self) {
        for agent in self.agents.list(None).await {
            if agent.status == AgentStatus::Stopped {
                continue;
            }
            self.poll_agent(agent).await;
        }
    }

    async fn poll_agent(&self, agent: Agent) {
        // Resize legacy sessions created with the default 80-column width.
        {
            let mut resized = self.resized_sessions.lock().await;
            if !resized.contains(&agent.session_name) {
                terminal::resize_window(&agent.session_name).await;
                resized.insert(agent.session_name.clone());
            }
        }

        let output = terminal::capture_pane(&agent.session_name, CAPTURE_LINES).await;

        if !terminal::session_exists(&agent.session_name).await {
            self.handle_session_gone(&agent, &output).await;
        } else {
            let new_status = detect_status(&output, &agent.last_output);
            if new_status != agent.status {
                self.handle_transition(&agent, new_status, &output).await;
            }
        }

        let Some(updated) = self
            .agents
            .update(&agent.id, |a| a.last_output = output.clone())
            .await
        else {
            return;
        };

        if !output.is_empty() && output != agent.last_output {
            self.bus.broadcast_terminal_output(&agent.id, &output).await;
        }
        if let Err(error) = self.store.save_snapshot(&updated).await {
            tracing::warn!(%error, agent_id = %agent.id, "failed to save snapshot");
        }
        self.bus.broadcast_agent_update(&updated).await;
    }

    async fn handle_session_gone(&self, agent: &Agent, output: &str) {
        let old_status = agent.status;
        self.agents
            .update(&agent.id, |a| {
                a.status = AgentStatus::Stopped;
                a.needs_attention = true;
                a.parked = false;
            })
            .await;

        if old_status == AgentStatus::Stopped {
            return;
        }
        self.log_status_change(agent, AgentStatus::Stopped).await;

        if old_status == AgentStatus::Working {
            self.relay_response(agent, output).await;
        } else {
            let mut message = format!("Agent `{}` ({}) stopped", agent.id, agent.project_name);
            let summary = self.activity_summary(&agent.last_output).await;
            if !summary.is_empty() {
                message.push_str(&format!("\n```\n{summary}\n```"));
            }
            self.router
                .send_to_project_channels(&agent.project_name, &message, &[])
                .await;
        }
    }

    async fn handle_transition(&self, agent: &Agent, new_status: AgentStatus, output: &str) {
        let old_status = agent.status;
        self.agents
            .update(&agent.id, |a| {
                a.status = new_status;
                match new_status {
                    AgentStatus::Idle | AgentStatus::WaitingInput | AgentStatus::Error => {
                        a.needs_attention = true;
                        a.parked = false;
                    }
                    AgentStatus::Working => a.needs_attention = false,
                    _ => {}
                }
            })
            .await;
        self.log_status_change(agent, new_status).await;

        if new_status == AgentStatus::WaitingInput {
            self.notify_waiting_input(agent, output).await;
        } else if new_status != AgentStatus::Working {
            if new_status == AgentStatus::Idle && old_status == AgentStatus::Working {
                self.relay_response(agent, output).await;
            } else {
                let mut message = format!(
                    "Agent `{}` ({}): {} -> {}",
                    agent.id, agent.project_name, old_status, new_status
                );
                let summary = self.activity_summary(output).await;
                if !summary.is_empty() {
                    message.push_str(&format!("\n```\n{summary}\n```"));
                }
                self.router
                    .send_to_project_channels(&agent.project_name, &message, &[])
                    .await;
            }
        }
    }

    async fn log_status_change(&self, agent: &Agent, status: AgentStatus) {
        if let Err(error) = self
            .store
            .log_event(
                &agent.id,
                &agent.project_name,
                EventType::StatusChange,
                Some(serde_json::json!({"status": status.as_str()})),
            )
            .await
        {
            tracing::warn!(%error, "failed to log status change");
        }
    }

    /// Rich WAITING_INPUT notification: prompt context plus action buttons,
    /// with a textual hint for platforms that can't render buttons.
    async fn notify_waiting_input(&self, agent: &Agent, output: &str) {
        let prompt = extract_prompt_text(output);
        let header = format!(
            "Agent `{}` ({}) is waiting for input",
            agent.id, agent.project_name
        );
        let mut text = if prompt.is_empty() {
            header
        } else {
            format!("{header}:\n```\n{prompt}\n```")
        };
        text.push_str("\n\nReply: /approve | /reject | /interrupt");

        let buttons = vec![
            ActionButton {
                label: "Approve".into(),
                action: "approve".into(),
                agent_id: agent.id.clone(),
            },
            ActionButton {
                label: "Reject".into(),
                action: "reject".into(),
                agent_id: agent.id.clone(),
            },
            ActionButton {
                label: "Interrupt".into(),
                action: "interrupt".into(),
                agent_id: agent.id.clone(),
            },
        ];

        self.router
            .send_to_project_channels_rich(&agent.project_name, &text, buttons)
            .await;
    }

    /// Activity summary via the LLM when configured, else the regex tail.
    async fn activity_summary(&self, output: &str) -> String {
        let config = self.registry.config();
        let summary_cfg = &config.defaults.summary;
        let api_key = config.get_summary_api_key();
        if summary_cfg.enabled && !api_key.is_empty() {
            let options = SummarizeOptions {
                api_key,
                model: summary_cfg.model.clone(),
                max_tokens: summary_cfg.max_tokens,
                timeout: Duration::from_secs_f64(summary_cfg.timeout_seconds),
            };
            if let Some(summary) = summarize::summarize_output(output, &options).await {
                return summary;
            }
        }
        extract_activity_summary(output)
    }

    /// Extract the agent's response from the rendered pane and relay it to
    /// bound channels, suppressing repeats of the previous extract.
    async fn relay_response(&self, agent: &Agent, output: &str) {
        if output.trim().is_empty() {
            return;
        }

        let config = self.registry.config();
        let relay_cfg = &config.defaults.response_relay;
        let api_key = config.get_summary_api_key();

        let mut extracted = None;
        if relay_cfg.enabled && !api_key.is_empty() {
            let options = ExtractOptions {
                api_key,
                model: relay_cfg.model.clone(),
                max_tokens: relay_cfg.max_tokens,
                timeout: Duration::from_secs_f64(relay_cfg.timeout_seconds),
                user_question: agent.last_user_message.clone(),
            };
            extracted = extract::extract_response(output, &options).await;
        }
        let Some(text) = extracted.or_else(|| extract::extract_response_regex(output)) else {
            return;
        };
        if text.is_empty() || text == agent.last_response {
            return;
        }

        self.agents
            .update(&agent.id, |a| a.last_response = text.clone())
            .await;

        let message = format!(
            "Agent `{}` ({}) response:\n\n{}",
            agent.id, agent.project_name, text
        );
        self.router
            .send_to_project_channels(&agent.project_name, &message, &[])
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn waiting_input_outranks_error() {
        let output = "Error: boom\nDo you want to proceed?";
        assert_eq!(detect_status(output, ""), AgentStatus::WaitingInput);
    }

    #[test]
    fn input_prompt_variants_detected() {
        for tail in [
            "Allow edit? (y/n)",
            "Proceed? [y/N]",
            "continue? Y/n",
            "Do you want to run this command?",
            "please answer yes/no",
        ] {
            assert_eq!(detect_status(tail, ""), AgentStatus::WaitingInput, "{tail}");
        }
    }

    #[test]
    fn error_detected_when_no_prompt() {
        assert_eq!(detect_status("Error: compilation failed\nmore", ""), AgentStatus::Error);
        assert_eq!(detect_status("fatal: not a git repository\nx", ""), AgentStatus::Error);
        assert_eq!(detect_status("3 tests FAILED\nsummary", ""), AgentStatus::Error);
        // Lowercase "failed" is not the FAILED marker.
        assert_eq!(detect_status("build failed somehow", "different"), AgentStatus::Working);
    }

    #[test]
    fn idle_prompt_on_last_line() {
        assert_eq!(detect_status("did things\n> ", "x"), AgentStatus::Idle);
        assert_eq!(detect_status("done\n❯", "x"), AgentStatus::Idle);
        assert_eq!(detect_status("shell\nuser@host $ ", "x"), AgentStatus::Idle);
    }

    #[test]
    fn changed_output_is_working_unchanged_is_idle() {
        assert_eq!(detect_status("compiling...", "linking..."), AgentStatus::Working);
        assert_eq!(detect_status("compiling...", "compiling..."), AgentStatus::Idle);
        assert_eq!(detect_status("", ""), AgentStatus::Idle);
    }

    #[test]
    fn detection_only_sees_the_tail() {
        // An old error scrolled far out of the tail window is ignored.
        let output = format!("Error: old failure\n{}\nall good", "padding\n".repeat(500));
        assert_eq!(detect_status(&output, &output), AgentStatus::Idle);
    }

    #[test]
    fn prompt_text_carries_context_lines() {
        let output = indoc! {"
            some earlier output
            Claude wants to edit src/auth.rs
            this change removes the session check
            Allow edit? (y/n)
        "};
        let prompt = extract_prompt_text(output);
        assert!(prompt.ends_with("Allow edit? (y/n)"));
        assert!(prompt.contains("Claude wants to edit src/auth.rs"));
        assert_eq!(prompt.lines().count(), 4);
    }

    #[test]
    fn prompt_text_empty_without_match() {
        assert_eq!(extract_prompt_text("just regular output\nnothing to ask"), "");
        assert_eq!(extract_prompt_text(""), "");
    }

    #[test]
    fn prompt_text_strips_ansi() {
        let output = "\x1b[1mDo you want\x1b[0m to continue?";
        assert_eq!(extract_prompt_text(output), "Do you want to continue?");
    }

    #[test]
    fn activity_summary_filters_noise_and_truncates() {
        let mut lines = vec![
            "────────────────".to_string(),
            "⠋ Spinning".to_string(),
            "· Scurrying…".to_string(),
            "ai(thinking)".to_string(),
        ];
        for i in 0..20 {
            lines.push(format!("meaningful progress line {i}"));
        }
        lines.push("w".repeat(200));
        let summary = extract_activity_summary(&lines.join("\n"));

        let summary_lines: Vec<&str> = summary.lines().collect();
        assert_eq!(summary_lines.len(), SUMMARY_KEEP_LINES);
        assert!(summary_lines.iter().all(|l| l.chars().count() <= SUMMARY_LINE_WIDTH));
        assert!(!summary.contains("Spinning"));
        assert!(!summary.contains("Scurrying"));
    }

    #[test]
    fn activity_summary_of_noise_is_empty() {
        assert_eq!(extract_activity_summary("⠋\n───────\n> \n"), "");
        assert_eq!(extract_activity_summary(""), "");
    }

    #[test]
    fn char_tail_is_boundary_safe() {
        let text = format!("{}✶tail", "a".repeat(3000));
        let tail = char_tail(&text, DETECT_TAIL_CHARS);
        assert!(tail.ends_with("✶tail"));
        assert!(tail.len() <= DETECT_TAIL_CHARS + 4);
    }

    mod stack {
        use super::super::*;
        use crate::agent::Agent;
        use crate::agents::AgentStore;
        use crate::connector::{
            ChannelInfo, Connector, HealthStatus, InboundStream, OutboundMessage,
        };
        use crate::lifecycle::Lifecycle;
        use crate::media::MediaStager;
        use crate::store::ForgeStore;
        use indoc::indoc;
        use std::io::Write as _;
        use std::sync::Mutex as StdMutex;

        struct RecordingConnector {
            sent: Arc<StdMutex<Vec<OutboundMessage>>>,
        }

        impl Connector for RecordingConnector {
            fn id(&self) -> &str {
                "mock"
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

        async fn harness() -> (
            StatusMonitor,
            Arc<Lifecycle>,
            ForgeStore,
            Arc<StdMutex<Vec<OutboundMessage>>>,
        ) {
            // LLM paths disabled so polls never leave the process.
            let config = indoc! {r#"
                [defaults.summary]
                enabled = false

                [defaults.response_relay]
                enabled = false

                [projects.api]
                path = "/nonexistent/api"

                [[projects.api.channels]]
                connector_id = "mock"
                channel_id = "c1"
            "#};
            let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
            file.write_all(config.as_bytes()).unwrap();
            let (_, path) = file.keep().unwrap();
            let registry = Arc::new(crate::registry::Registry::load(path).unwrap());

            let store = ForgeStore::open_in_memory().await.unwrap();
            let agents = Arc::new(AgentStore::new());
            let lifecycle = Arc::new(Lifecycle::new(
                registry.clone(),
                agents,
                store.clone(),
                8080,
            ));
            let router = ConnectorRouter::new(
                registry.clone(),
                lifecycle.clone(),
                MediaStager::new(std::env::temp_dir().join("forge-monitor-tests")),
            );
            let sent = Arc::new(StdMutex::new(Vec::new()));
            router
                .insert_connector(Arc::new(RecordingConnector { sent: sent.clone() }))
                .await;

            let bus = Arc::new(crate::broadcast::BroadcastBus::new());
            let monitor = StatusMonitor::new(registry, lifecycle.agents().clone(), store.clone(), bus, router);
            (monitor, lifecycle, store, sent)
        }

        fn working_agent(id: &str) -> Agent {
            let mut agent = Agent::new(
                id,
                "api",
                format!("forge__api__{id}"),
                format!("/tmp/{id}"),
                format!("agent/{id}/task"),
            );
            agent.status = AgentStatus::Working;
            agent
        }

        #[tokio::test]
        async fn vanished_session_marks_agent_stopped_and_snapshots() {
            let (monitor, lifecycle, store, _) = harness().await;
            lifecycle.agents().insert(working_agent("dead01")).await;

            monitor.poll().await;

            let agent = lifecycle.agents().get("dead01").await.unwrap();
            assert_eq!(agent.status, AgentStatus::Stopped);
            assert!(agent.needs_attention);
            assert!(!agent.parked);

            // The persisted snapshot reflects the transition.
            let snapshots = store.load_snapshots().await.unwrap();
            assert_eq!(snapshots.len(), 1);
            assert_eq!(snapshots[0].status, AgentStatus::Stopped);
        }

        #[tokio::test]
        async fn response_relay_dedups_identical_extracts() {
            let (monitor, lifecycle, _, sent) = harness().await;
            lifecycle.agents().insert(working_agent("rel001")).await;
            let agent = lifecycle.agents().get("rel001").await.unwrap();

            let output = "I fixed the login bug.\nAll tests pass now.";
            monitor.relay_response(&agent, output).await;
            assert_eq!(sent.lock().unwrap().len(), 1);
            assert!(sent.lock().unwrap()[0].text.contains("I fixed the login bug."));

            // A second identical extract is suppressed.
            let agent = lifecycle.agents().get("rel001").await.unwrap();
            assert_eq!(agent.last_response, "I fixed the login bug.\nAll tests pass now.");
            monitor.relay_response(&agent, output).await;
            assert_eq!(sent.lock().unwrap().len(), 1);

            // A different extract goes out again.
            let agent = lifecycle.agents().get("rel001").await.unwrap();
            monitor.relay_response(&agent, "Different final answer.").await;
            assert_eq!(sent.lock().unwrap().len(), 2);
        }

        #[tokio::test]
        async fn waiting_input_notification_carries_buttons() {
            let (monitor, lifecycle, _, sent) = harness().await;
            lifecycle.agents().insert(working_agent("wait01")).await;
            let agent = lifecycle.agents().get("wait01").await.unwrap();

            let output = "Claude wants to run: rm -rf build\nAllow edit? (y/n)";
            monitor
                .handle_transition(&agent, AgentStatus::WaitingInput, output)
                .await;

            let updated = lifecycle.agents().get("wait01").await.unwrap();
            assert_eq!(updated.status, AgentStatus::WaitingInput);
            assert!(updated.needs_attention);

            let outbound = sent.lock().unwrap();
            assert_eq!(outbound.len(), 1);
            assert!(outbound[0].text.contains("waiting for input"));
            assert!(outbound[0].text.contains("Allow edit? (y/n)"));
            assert!(outbound[0].text.contains("/approve | /reject | /interrupt"));
            let actions: Vec<&str> = outbound[0]
                .action_buttons
                .iter()
                .map(|b| b.action.as_str())
                .collect();
            assert_eq!(actions, vec!["approve", "reject", "interrupt"]);
            assert!(outbound[0].action_buttons.iter().all(|b| b.agent_id == "wait01"));
        }
    }
}
