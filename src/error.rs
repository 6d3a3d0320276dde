//! Top-level error types for Agent Forge.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("project not found: '{0}'")]
    UnknownProject(String),

    #[error("profile not found: '{0}'")]
    UnknownProfile(String),
}

/// Terminal multiplexer subprocess errors.
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("tmux not found on PATH")]
    NotInstalled,

    #[error("tmux io error: {0}")]
    Io(String),

    #[error("tmux command timed out: {0}")]
    Timeout(String),

    #[error("failed to create session '{name}': {stderr}")]
    CreateFailed { name: String, stderr: String },
}

/// Git worktree subprocess errors.
#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("git worktree add failed: {0}")]
    AddFailed(String),

    #[error("failed to run git: {0}")]
    Exec(String),

    #[error("git command timed out: {0}")]
    Timeout(String),
}

/// Agent lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent not found: {id}")]
    NotFound { id: String },

    #[error("agent limit reached for '{project}': {current}/{max}")]
    LimitReached {
        project: String,
        current: usize,
        max: usize,
    },

    #[error("unknown control action: '{0}'")]
    UnknownControlAction(String),
}

/// Connector configuration and delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("unknown connector type: '{0}'")]
    UnknownType(String),

    #[error("no adapter bundled for connector type: '{0}'")]
    UnsupportedType(String),

    #[error("connector '{id}' missing credential: {key}")]
    MissingCredential { id: String, key: String },

    #[error("connector '{0}' is not running")]
    NotRunning(String),
}

/// Event and snapshot storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to connect to SQLite: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("query failed: {0}")]
    Query(String),
}
