//! Control API and dashboard streams (axum).

use crate::agent::Agent;
use crate::broadcast::BroadcastBus;
use crate::lifecycle::{DEFAULT_BRANCH_PREFIX, Lifecycle};
use crate::registry::Registry;
use crate::router::ConnectorRouter;
use crate::store::{EventFilter, ForgeStore};
use crate::terminal;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Shared handles for every route.
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub lifecycle: Arc<Lifecycle>,
    pub router: Arc<ConnectorRouter>,
    pub store: ForgeStore,
    pub bus: Arc<BroadcastBus>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Start the HTTP server; resolves once the listener is bound.
pub async fn start_http_server(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/projects", get(list_projects))
        .route("/agents", get(list_agents).post(spawn_agent))
        .route("/agents/compare", post(spawn_comparison))
        .route("/agents/{agent_id}", get(get_agent).delete(kill_agent))
        .route("/agents/{agent_id}/message", post(send_message))
        .route("/agents/{agent_id}/control", post(send_control))
        .route("/agents/{agent_id}/restart", post(restart_agent))
        .route("/agents/{agent_id}/terminal", get(get_terminal))
        .route("/agents/{agent_id}/events", get(agent_events))
        .route("/agents/{agent_id}/acknowledge", post(acknowledge_agent))
        .route("/agents/{agent_id}/park", post(park_agent))
        .route("/agents/{agent_id}/unpark", post(unpark_agent))
        .route("/stats", get(stats))
        .route("/profiles", get(list_profiles))
        .route("/profiles/{name}", get(get_profile))
        .route("/events", get(list_events))
        .route("/hooks/event", post(hook_event))
        .route("/connectors", get(connector_status))
        .route("/connectors/{connector_id}/health", get(connector_health))
        .route("/connectors/{connector_id}/channels", get(connector_channels))
        .route(
            "/connectors/{connector_id}/channels/{channel_id}",
            get(connector_channel_info),
        )
        .route("/connectors/{connector_id}/restart", post(restart_connector))
        .route("/config/reload", post(reload_config));

    let app = Router::new()
        .route("/health", get(health))
        .nest("/api", api_routes)
        .route("/ws", get(dashboard_socket))
        .route("/ws/logs", get(log_socket))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "HTTP server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    Ok(handle)
}

fn agent_to_json(agent: &Agent) -> Value {
    json!({
        "id": agent.id,
        "project": agent.project_name,
        "session_name": agent.session_name,
        "worktree_path": agent.worktree_path,
        "branch_name": agent.branch_name,
        "status": agent.status.as_str(),
        "created_at": agent.created_at.to_rfc3339(),
        "last_activity": agent.last_activity.to_rfc3339(),
        "task": agent.task_description,
        "profile": agent.profile,
        "sub_agent_count": agent.sub_agent_count,
        "needs_attention": agent.needs_attention,
        "parked": agent.parked,
    })
}

fn not_found(agent_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(json!({"detail": format!("Agent not found: {agent_id}")})),
    )
        .into_response()
}

async fn health(State(state): State<Arc<ApiState>>) -> axum::Json<Value> {
    let agents = state.lifecycle.agents().list(None).await;
    axum::Json(json!({
        "status": "ok",
        "agents": agents.len(),
        "uptime_seconds": (chrono::Utc::now() - state.started_at).num_seconds(),
    }))
}

async fn list_projects(State(state): State<Arc<ApiState>>) -> axum::Json<Value> {
    let config = state.registry.config();
    let mut projects: Vec<Value> = Vec::new();
    let mut names: Vec<&String> = config.projects.keys().collect();
    names.sort();
    for name in names {
        let project = &config.projects[name];
        let active = state.lifecycle.agents().count_active(name).await;
        projects.push(json!({
            "name": name,
            "path": project.path,
            "default_branch": project.default_branch,
            "description": project.description,
            "max_agents": config.get_max_agents(name),
            "active_agents": active,
            "channels": project.channels,
        }));
    }
    axum::Json(json!({"projects": projects}))
}

#[derive(Deserialize)]
struct ListAgentsQuery {
    project: Option<String>,
}

async fn list_agents(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListAgentsQuery>,
) -> axum::Json<Value> {
    let agents = state.lifecycle.agents().list(query.project.as_deref()).await;
    axum::Json(json!({"agents": agents.iter().map(agent_to_json).collect::<Vec<_>>()}))
}

async fn get_agent(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
) -> Response {
    match state.lifecycle.agents().get(&agent_id).await {
        Some(agent) => axum::Json(agent_to_json(&agent)).into_response(),
        None => not_found(&agent_id),
    }
}

#[derive(Deserialize)]
struct SpawnRequest {
    project: String,
    #[serde(default)]
    task: String,
    #[serde(default)]
    profile: String,
}

async fn spawn_agent(
    State(state): State<Arc<ApiState>>,
    axum::Json(body): axum::Json<SpawnRequest>,
) -> Response {
    match state
        .lifecycle
        .spawn_agent(&body.project, &body.task, DEFAULT_BRANCH_PREFIX, &body.profile)
        .await
    {
        Ok(agent) => (StatusCode::CREATED, axum::Json(agent_to_json(&agent))).into_response(),
        Err(error) => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"detail": error.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct CompareRequest {
    project: String,
    #[serde(default)]
    task: String,
    profiles: Vec<String>,
    #[serde(default)]
    count: usize,
}

async fn spawn_comparison(
    State(state): State<Arc<ApiState>>,
    axum::Json(body): axum::Json<CompareRequest>,
) -> Response {
    match state
        .lifecycle
        .spawn_comparison(&body.project, &body.task, &body.profiles, body.count)
        .await
    {
        Ok(agents) => (
            StatusCode::CREATED,
            axum::Json(json!({"agents": agents.iter().map(agent_to_json).collect::<Vec<_>>()})),
        )
            .into_response(),
        Err(error) => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"detail": error.to_string()})),
        )
            .into_response(),
    }
}

async fn kill_agent(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
) -> Response {
    if state.lifecycle.kill_agent(&agent_id).await {
        axum::Json(json!({"status": "killed", "agent_id": agent_id})).into_response()
    } else {
        not_found(&agent_id)
    }
}

#[derive(Deserialize)]
struct MessageRequest {
    message: String,
}

async fn send_message(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
    axum::Json(body): axum::Json<MessageRequest>,
) -> Response {
    if state.lifecycle.send_message(&agent_id, &body.message).await {
        axum::Json(json!({"status": "sent"})).into_response()
    } else {
        not_found(&agent_id)
    }
}

#[derive(Deserialize)]
struct ControlRequest {
    action: String,
}

async fn send_control(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
    axum::Json(body): axum::Json<ControlRequest>,
) -> Response {
    if !state.lifecycle.agents().contains(&agent_id).await {
        return not_found(&agent_id);
    }
    match state.lifecycle.send_control(&agent_id, &body.action).await {
        Ok(()) => axum::Json(json!({"status": "sent", "action": body.action})).into_response(),
        Err(error) => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"detail": error.to_string()})),
        )
            .into_response(),
    }
}

async fn restart_agent(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
) -> Response {
    match state.lifecycle.restart_agent(&agent_id).await {
        Ok(agent) => axum::Json(agent_to_json(&agent)).into_response(),
        Err(error) => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"detail": error.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct TerminalQuery {
    #[serde(default = "default_terminal_lines")]
    lines: u32,
}

fn default_terminal_lines() -> u32 {
    100
}

async fn get_terminal(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
    Query(query): Query<TerminalQuery>,
) -> Response {
    let Some(agent) = state.lifecycle.agents().get(&agent_id).await else {
        return not_found(&agent_id);
    };
    let output = terminal::capture_pane(&agent.session_name, query.lines.min(5000)).await;
    axum::Json(json!({"agent_id": agent_id, "output": output})).into_response()
}

#[derive(Deserialize)]
struct EventsQuery {
    agent_id: Option<String>,
    project: Option<String>,
    event_type: Option<String>,
    #[serde(default)]
    limit: i64,
}

async fn list_events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let filter = EventFilter {
        agent_id: query.agent_id,
        project_name: query.project,
        event_type: query.event_type,
        limit: query.limit,
    };
    match state.store.get_events(filter).await {
        Ok(events) => axum::Json(json!({"events": events})).into_response(),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({"detail": error.to_string()})),
        )
            .into_response(),
    }
}

async fn agent_events(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let filter = EventFilter {
        agent_id: Some(agent_id),
        project_name: None,
        event_type: query.event_type,
        limit: query.limit,
    };
    match state.store.get_events(filter).await {
        Ok(events) => axum::Json(json!({"events": events})).into_response(),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({"detail": error.to_string()})),
        )
            .into_response(),
    }
}

async fn acknowledge_agent(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
) -> Response {
    match state
        .lifecycle
        .agents()
        .update(&agent_id, |a| a.needs_attention = false)
        .await
    {
        Some(agent) => {
            state.bus.broadcast_agent_update(&agent).await;
            axum::Json(json!({"status": "acknowledged"})).into_response()
        }
        None => not_found(&agent_id),
    }
}

async fn park_agent(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
) -> Response {
    match state
        .lifecycle
        .agents()
        .update(&agent_id, |a| {
            a.parked = true;
            a.needs_attention = false;
        })
        .await
    {
        Some(agent) => {
            state.bus.broadcast_agent_update(&agent).await;
            axum::Json(json!({"status": "parked"})).into_response()
        }
        None => not_found(&agent_id),
    }
}

async fn unpark_agent(
    State(state): State<Arc<ApiState>>,
    Path(agent_id): Path<String>,
) -> Response {
    match state
        .lifecycle
        .agents()
        .update(&agent_id, |a| a.parked = false)
        .await
    {
        Some(agent) => {
            state.bus.broadcast_agent_update(&agent).await;
            axum::Json(json!({"status": "unparked"})).into_response()
        }
        None => not_found(&agent_id),
    }
}

async fn stats(State(state): State<Arc<ApiState>>) -> axum::Json<Value> {
    let agents = state.lifecycle.agents().list(None).await;
    let mut by_status: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    let mut by_project: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut total_sub_agents = 0u32;
    for agent in &agents {
        *by_status.entry(agent.status.as_str()).or_default() += 1;
        *by_project.entry(agent.project_name.clone()).or_default() += 1;
        total_sub_agents += agent.sub_agent_count;
    }
    axum::Json(json!({
        "total_agents": agents.len(),
        "by_status": by_status,
        "by_project": by_project,
        "total_sub_agents": total_sub_agents,
        "needs_attention": agents.iter().filter(|a| a.needs_attention).count(),
    }))
}

async fn list_profiles(State(state): State<Arc<ApiState>>) -> axum::Json<Value> {
    let config = state.registry.config();
    let mut names: Vec<&String> = config.profiles.keys().collect();
    names.sort();
    let profiles: Vec<Value> = names
        .iter()
        .map(|name| {
            let profile = &config.profiles[*name];
            json!({
                "name": name,
                "description": profile.description,
                "has_system_prompt": !profile.system_prompt.is_empty(),
                "start_sequence_steps": profile.start_sequence.len(),
            })
        })
        .collect();
    axum::Json(json!({"profiles": profiles}))
}

async fn get_profile(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Response {
    match state.registry.config().get_profile(&name) {
        Some(profile) => axum::Json(json!({
            "name": name,
            "description": profile.description,
            "system_prompt": profile.system_prompt,
            "instructions": profile.instructions,
            "start_sequence": profile.start_sequence,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            axum::Json(json!({"detail": format!("Profile not found: {name}")})),
        )
            .into_response(),
    }
}

/// Sub-agent hook endpoint. Unknown agent ids are ignored with 200 so the
/// hook command inside the coding tool never blocks an agent.
async fn hook_event(
    State(state): State<Arc<ApiState>>,
    axum::Json(body): axum::Json<Value>,
) -> axum::Json<Value> {
    let agent_id = body.get("agent_id").and_then(|v| v.as_str()).unwrap_or_default();
    let event = body.get("hook_event").and_then(|v| v.as_str()).unwrap_or_default();

    let updated = match event {
        "SubagentStart" => {
            state
                .lifecycle
                .agents()
                .update(agent_id, |a| a.sub_agent_count += 1)
                .await
        }
        "SubagentStop" => {
            state
                .lifecycle
                .agents()
                .update(agent_id, |a| a.sub_agent_count = a.sub_agent_count.saturating_sub(1))
                .await
        }
        _ => None,
    };

    match updated {
        Some(agent) => {
            tracing::info!(
                agent_id = %agent.id,
                count = agent.sub_agent_count,
                event = %event,
                "sub-agent hook event"
            );
            axum::Json(json!({"status": "ok", "sub_agent_count": agent.sub_agent_count}))
        }
        None => axum::Json(json!({"status": "ignored"})),
    }
}

async fn connector_status(State(state): State<Arc<ApiState>>) -> axum::Json<Value> {
    axum::Json(json!({"connectors": state.router.status().await}))
}

fn connector_not_found(connector_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        axum::Json(json!({"detail": format!("Connector not running: {connector_id}")})),
    )
        .into_response()
}

async fn connector_health(
    State(state): State<Arc<ApiState>>,
    Path(connector_id): Path<String>,
) -> Response {
    match state.router.get_connector(&connector_id).await {
        Some(connector) => axum::Json(json!(connector.health_check().await)).into_response(),
        None => connector_not_found(&connector_id),
    }
}

async fn connector_channels(
    State(state): State<Arc<ApiState>>,
    Path(connector_id): Path<String>,
) -> Response {
    match state.router.get_connector(&connector_id).await {
        Some(connector) => {
            axum::Json(json!({"channels": connector.list_channels().await})).into_response()
        }
        None => connector_not_found(&connector_id),
    }
}

async fn connector_channel_info(
    State(state): State<Arc<ApiState>>,
    Path((connector_id, channel_id)): Path<(String, String)>,
) -> Response {
    let Some(connector) = state.router.get_connector(&connector_id).await else {
        return connector_not_found(&connector_id);
    };
    let valid = connector.validate_channel(&channel_id).await;
    let info = connector.get_channel_info(&channel_id).await;
    axum::Json(json!({"channel_id": channel_id, "valid": valid, "info": info})).into_response()
}

async fn restart_connector(
    State(state): State<Arc<ApiState>>,
    Path(connector_id): Path<String>,
) -> Response {
    if state.router.restart_connector(&connector_id).await {
        axum::Json(json!({"status": "restarted"})).into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"detail": format!("Connector '{connector_id}' not restarted")})),
        )
            .into_response()
    }
}

async fn reload_config(State(state): State<Arc<ApiState>>) -> Response {
    match state.registry.reload() {
        Ok(()) => {
            state.router.rebuild_channel_map().await;
            axum::Json(json!({"status": "reloaded"})).into_response()
        }
        Err(error) => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"detail": error.to_string()})),
        )
            .into_response(),
    }
}

async fn dashboard_socket(
    State(state): State<Arc<ApiState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| pump_frames(socket, state, false))
}

async fn log_socket(State(state): State<Arc<ApiState>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| pump_frames(socket, state, true))
}

/// Forward bus frames to one WebSocket client until either side closes.
async fn pump_frames(mut socket: WebSocket, state: Arc<ApiState>, logs: bool) {
    let mut rx = if logs {
        state.bus.subscribe_logs().await
    } else {
        state.bus.subscribe().await
    };

    while let Some(frame) = rx.recv().await {
        let text = frame.to_string();
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}
