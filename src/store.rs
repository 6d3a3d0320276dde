//! Event log and agent snapshot storage (SQLite).

use crate::agent::{Agent, AgentStatus};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Row as _, SqlitePool};
use sqlx::sqlite::SqliteConnectOptions;
use std::path::Path;
use std::str::FromStr as _;

/// Scrollback retained in a snapshot row.
const SNAPSHOT_OUTPUT_CAP: usize = 5000;
const SNAPSHOT_RESPONSE_CAP: usize = 5000;
const SNAPSHOT_USER_MESSAGE_CAP: usize = 2000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Spawned,
    Killed,
    StatusChange,
    MessageSent,
    ControlSent,
    AgentRestarted,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Spawned => "spawned",
            EventType::Killed => "killed",
            EventType::StatusChange => "status_change",
            EventType::MessageSent => "message_sent",
            EventType::ControlSent => "control_sent",
            EventType::AgentRestarted => "agent_restarted",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row in the append-only event log.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: i64,
    pub timestamp: String,
    pub agent_id: String,
    pub project_name: String,
    pub event_type: String,
    pub payload: Option<Value>,
}

/// Optional filters for event queries.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub agent_id: Option<String>,
    pub project_name: Option<String>,
    pub event_type: Option<String>,
    pub limit: i64,
}

/// Persisted agent state, loaded at startup to re-dress recovered sessions.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub project_name: String,
    pub session_name: String,
    pub worktree_path: String,
    pub branch_name: String,
    pub status: AgentStatus,
    pub task_description: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_output: String,
    pub needs_attention: bool,
    pub parked: bool,
    pub last_response: String,
    pub last_user_message: String,
    pub profile: String,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL DEFAULT (datetime('now')),
    agent_id TEXT NOT NULL,
    project_name TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT
);

CREATE TABLE IF NOT EXISTS agent_snapshots (
    agent_id TEXT PRIMARY KEY,
    project_name TEXT NOT NULL,
    session_name TEXT NOT NULL,
    worktree_path TEXT NOT NULL,
    branch_name TEXT NOT NULL,
    status TEXT NOT NULL,
    task_description TEXT,
    created_at TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    last_output TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_agent ON events(agent_id);
CREATE INDEX IF NOT EXISTS idx_events_project ON events(project_name);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
"#;

/// Columns added after the initial schema. Applied additively on open so
/// databases from older builds keep working.
const SNAPSHOT_MIGRATIONS: &[(&str, &str)] = &[
    ("needs_attention", "INTEGER NOT NULL DEFAULT 0"),
    ("parked", "INTEGER NOT NULL DEFAULT 0"),
    ("last_response", "TEXT"),
    ("last_user_message", "TEXT"),
    ("profile", "TEXT"),
];

#[derive(Debug, Clone)]
pub struct ForgeStore {
    pool: SqlitePool,
}

impl ForgeStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(StoreError::Connect)?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(StoreError::Connect)?;
        let store = Self { pool };
        store.init().await?;
        tracing::info!(path = %path.display(), "database initialised");
        Ok(store)
    }

    /// Open an in-memory database. Test-oriented, but usable for ephemeral runs.
    ///
    /// Pinned to a single connection: every pooled connection would otherwise
    /// get its own empty `:memory:` database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(StoreError::Connect)?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(format!("failed to create schema: {e}")))?;
        self.migrate_snapshot_columns().await?;
        Ok(())
    }

    /// Inspect existing `agent_snapshots` columns and add any missing ones.
    async fn migrate_snapshot_columns(&self) -> Result<()> {
        let rows = sqlx::query("PRAGMA table_info(agent_snapshots)")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                StoreError::Migration(format!("failed to inspect agent_snapshots columns: {e}"))
            })?;
        let existing: std::collections::HashSet<String> = rows
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();

        for (name, definition) in SNAPSHOT_MIGRATIONS {
            if !existing.contains(*name) {
                let statement = format!("ALTER TABLE agent_snapshots ADD COLUMN {name} {definition}");
                sqlx::query(&statement)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| {
                        StoreError::Migration(format!("failed to add column {name}: {e}"))
                    })?;
                tracing::info!(column = %name, "migrated agent_snapshots");
            }
        }
        Ok(())
    }

    /// Append an event row. `payload` is stored as a JSON string.
    pub async fn log_event(
        &self,
        agent_id: &str,
        project_name: &str,
        event_type: EventType,
        payload: Option<Value>,
    ) -> Result<()> {
        let payload_str = payload.map(|p| p.to_string());
        sqlx::query(
            "INSERT INTO events (agent_id, project_name, event_type, payload) VALUES (?, ?, ?, ?)",
        )
        .bind(agent_id)
        .bind(project_name)
        .bind(event_type.as_str())
        .bind(payload_str)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(format!("failed to insert event: {e}")))?;
        Ok(())
    }

    /// Query events with optional filters, newest first.
    pub async fn get_events(&self, filter: EventFilter) -> Result<Vec<Event>> {
        let mut query = String::from(
            "SELECT id, timestamp, agent_id, project_name, event_type, payload FROM events",
        );
        let mut clauses: Vec<&str> = Vec::new();
        if filter.agent_id.is_some() {
            clauses.push("agent_id = ?");
        }
        if filter.project_name.is_some() {
            clauses.push("project_name = ?");
        }
        if filter.event_type.is_some() {
            clauses.push("event_type = ?");
        }
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDER BY id DESC LIMIT ?");

        let mut sql = sqlx::query(&query);
        if let Some(agent_id) = &filter.agent_id {
            sql = sql.bind(agent_id);
        }
        if let Some(project_name) = &filter.project_name {
            sql = sql.bind(project_name);
        }
        if let Some(event_type) = &filter.event_type {
            sql = sql.bind(event_type);
        }
        let limit = if filter.limit > 0 { filter.limit } else { 100 };
        sql = sql.bind(limit.clamp(1, 1000));

        let rows = sql
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("failed to query events: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let payload: Option<String> = row.get("payload");
                Event {
                    id: row.get("id"),
                    timestamp: row.get("timestamp"),
                    agent_id: row.get("agent_id"),
                    project_name: row.get("project_name"),
                    event_type: row.get("event_type"),
                    payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
                }
            })
            .collect())
    }

    /// Upsert the current state of an agent.
    pub async fn save_snapshot(&self, agent: &Agent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO agent_snapshots (
                agent_id, project_name, session_name, worktree_path, branch_name,
                status, task_description, created_at, last_activity, last_output,
                needs_attention, parked, last_response, last_user_message, profile
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&agent.id)
        .bind(&agent.project_name)
        .bind(&agent.session_name)
        .bind(&agent.worktree_path)
        .bind(&agent.branch_name)
        .bind(agent.status.as_str())
        .bind(&agent.task_description)
        .bind(agent.created_at.to_rfc3339())
        .bind(agent.last_activity.to_rfc3339())
        .bind(tail_chars(&agent.last_output, SNAPSHOT_OUTPUT_CAP))
        .bind(agent.needs_attention as i64)
        .bind(agent.parked as i64)
        .bind(tail_chars(&agent.last_response, SNAPSHOT_RESPONSE_CAP))
        .bind(tail_chars(&agent.last_user_message, SNAPSHOT_USER_MESSAGE_CAP))
        .bind(&agent.profile)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(format!("failed to save agent snapshot: {e}")))?;
        Ok(())
    }

    /// Load all saved agent snapshots.
    pub async fn load_snapshots(&self) -> Result<Vec<AgentSnapshot>> {
        let rows = sqlx::query(
            "SELECT agent_id, project_name, session_name, worktree_path, branch_name, status, \
             task_description, created_at, last_activity, last_output, needs_attention, parked, \
             last_response, last_user_message, profile FROM agent_snapshots",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(format!("failed to load snapshots: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|row| AgentSnapshot {
                agent_id: row.get("agent_id"),
                project_name: row.get("project_name"),
                session_name: row.get("session_name"),
                worktree_path: row.get("worktree_path"),
                branch_name: row.get("branch_name"),
                status: AgentStatus::parse(&row.get::<String, _>("status"))
                    .unwrap_or(AgentStatus::Stopped),
                task_description: row.get::<Option<String>, _>("task_description").unwrap_or_default(),
                created_at: parse_timestamp(&row.get::<String, _>("created_at")),
                last_activity: parse_timestamp(&row.get::<String, _>("last_activity")),
                last_output: row.get::<Option<String>, _>("last_output").unwrap_or_default(),
                needs_attention: row.get::<i64, _>("needs_attention") != 0,
                parked: row.get::<i64, _>("parked") != 0,
                last_response: row.get::<Option<String>, _>("last_response").unwrap_or_default(),
                last_user_message: row
                    .get::<Option<String>, _>("last_user_message")
                    .unwrap_or_default(),
                profile: row.get::<Option<String>, _>("profile").unwrap_or_default(),
            })
            .collect())
    }

    /// Remove a snapshot when an agent is killed.
    pub async fn delete_snapshot(&self, agent_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM agent_snapshots WHERE agent_id = ?")
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("failed to delete snapshot: {e}")))?;
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Keep the trailing `cap` characters of a string on a char boundary.
fn tail_chars(text: &str, cap: usize) -> &str {
    if text.len() <= cap {
        return text;
    }
    let mut start = text.len() - cap;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    fn sample_agent() -> Agent {
        let mut agent = Agent::new(
            "ab12cd",
            "api",
            "forge__api__ab12cd",
            "/srv/api/.worktrees/ab12cd",
            "agent/ab12cd/fix-login-bug",
        );
        agent.task_description = "fix login bug".into();
        agent.needs_attention = true;
        agent.parked = true;
        agent.last_response = "done, tests pass".into();
        agent.last_user_message = "fix login bug".into();
        agent.profile = "reviewer".into();
        agent
    }

    #[tokio::test]
    async fn snapshot_round_trips_every_field() {
        let store = ForgeStore::open_in_memory().await.unwrap();
        let agent = sample_agent();
        store.save_snapshot(&agent).await.unwrap();

        let snapshots = store.load_snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        let snap = &snapshots[0];
        assert_eq!(snap.agent_id, agent.id);
        assert_eq!(snap.project_name, agent.project_name);
        assert_eq!(snap.session_name, agent.session_name);
        assert_eq!(snap.worktree_path, agent.worktree_path);
        assert_eq!(snap.branch_name, agent.branch_name);
        assert_eq!(snap.status, agent.status);
        assert_eq!(snap.task_description, agent.task_description);
        assert_eq!(snap.needs_attention, agent.needs_attention);
        assert_eq!(snap.parked, agent.parked);
        assert_eq!(snap.last_response, agent.last_response);
        assert_eq!(snap.last_user_message, agent.last_user_message);
        assert_eq!(snap.profile, agent.profile);
        assert_eq!(snap.created_at.timestamp(), agent.created_at.timestamp());
        assert_eq!(snap.last_activity.timestamp(), agent.last_activity.timestamp());
    }

    #[tokio::test]
    async fn snapshot_upsert_replaces_previous_row() {
        let store = ForgeStore::open_in_memory().await.unwrap();
        let mut agent = sample_agent();
        store.save_snapshot(&agent).await.unwrap();
        agent.status = crate::agent::AgentStatus::Idle;
        store.save_snapshot(&agent).await.unwrap();

        let snapshots = store.load_snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].status, crate::agent::AgentStatus::Idle);
    }

    #[tokio::test]
    async fn delete_snapshot_removes_row() {
        let store = ForgeStore::open_in_memory().await.unwrap();
        store.save_snapshot(&sample_agent()).await.unwrap();
        store.delete_snapshot("ab12cd").await.unwrap();
        assert!(store.load_snapshots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_filter_and_order() {
        let store = ForgeStore::open_in_memory().await.unwrap();
        store
            .log_event("a1", "api", EventType::Spawned, None)
            .await
            .unwrap();
        store
            .log_event(
                "a1",
                "api",
                EventType::StatusChange,
                Some(serde_json::json!({"status": "working"})),
            )
            .await
            .unwrap();
        store
            .log_event("b2", "web", EventType::Spawned, None)
            .await
            .unwrap();

        let all = store.get_events(EventFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        // Newest first.
        assert_eq!(all[0].agent_id, "b2");

        let by_agent = store
            .get_events(EventFilter {
                agent_id: Some("a1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_agent.len(), 2);

        let by_type = store
            .get_events(EventFilter {
                event_type: Some("status_change".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_type.len(), 1);
        assert_eq!(
            by_type[0].payload.as_ref().unwrap()["status"],
            serde_json::json!("working")
        );
    }

    #[tokio::test]
    async fn migration_is_idempotent() {
        let store = ForgeStore::open_in_memory().await.unwrap();
        // Running the migration again must be a no-op.
        store.migrate_snapshot_columns().await.unwrap();
        store.save_snapshot(&sample_agent()).await.unwrap();
        assert_eq!(store.load_snapshots().await.unwrap().len(), 1);
    }

    #[test]
    fn tail_chars_respects_char_boundaries() {
        let text = "ab✳cd";
        let tail = tail_chars(text, 4);
        assert!(tail.len() <= 4 + 2);
        assert!(text.ends_with(tail));
        assert_eq!(tail_chars("short", 100), "short");
    }
}
