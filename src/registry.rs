//! Config registry: load, validate, hot-reload, and persist forge.toml.

use crate::config::{ConnectorConfig, ForgeConfig, ProjectConfig};
use crate::error::{ConfigError, Result};
use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Loads the config file, validates project paths, and provides lookup.
///
/// The live config is held in an [`ArcSwap`] so readers take a cheap snapshot
/// while reloads and edits swap the whole document atomically.
pub struct Registry {
    config_path: PathBuf,
    config: ArcSwap<ForgeConfig>,
}

impl Registry {
    pub fn load(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        let config = read_config(&config_path)?;
        let registry = Self {
            config_path,
            config: ArcSwap::from_pointee(config),
        };
        registry.migrate_legacy_telegram();
        registry.validate_projects();
        Ok(registry)
    }

    /// Current config snapshot.
    pub fn config(&self) -> Arc<ForgeConfig> {
        self.config.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn get_project(&self, name: &str) -> Result<ProjectConfig> {
        self.config()
            .projects
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProject(name.to_string()).into())
    }

    pub fn project_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.config().projects.keys().cloned().collect();
        names.sort();
        names
    }

    /// Apply an in-memory mutation, persist to disk, and swap the live config.
    pub fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ForgeConfig),
    {
        let mut next = (*self.config()).clone();
        mutate(&mut next);
        self.save(&next)?;
        self.config.store(Arc::new(next));
        Ok(())
    }

    /// Re-read the config file from disk.
    pub fn reload(&self) -> Result<()> {
        let config = read_config(&self.config_path)?;
        self.config.store(Arc::new(config));
        self.migrate_legacy_telegram();
        self.validate_projects();
        tracing::info!(path = %self.config_path.display(), "config reloaded");
        Ok(())
    }

    fn save(&self, config: &ForgeConfig) -> Result<()> {
        let serialized = toml::to_string_pretty(config)
            .map_err(|e| ConfigError::Invalid(format!("failed to serialize config: {e}")))?;
        std::fs::write(&self.config_path, serialized)?;
        tracing::info!(path = %self.config_path.display(), "config saved");
        Ok(())
    }

    /// Auto-create a Telegram connector entry from the legacy `[telegram]`
    /// section (or env token) when no connectors are configured.
    fn migrate_legacy_telegram(&self) {
        let current = self.config();
        let token = current.get_bot_token();
        if token.is_empty() || !current.connectors.is_empty() {
            return;
        }
        let mut next = (*current).clone();
        next.connectors.insert(
            "telegram".into(),
            ConnectorConfig {
                connector_type: "telegram".into(),
                enabled: true,
                credentials: [("bot_token".to_string(), token)].into_iter().collect(),
                settings: [(
                    "allowed_users".to_string(),
                    serde_json::json!(next.telegram.allowed_users),
                )]
                .into_iter()
                .collect(),
            },
        );
        self.config.store(Arc::new(next));
        tracing::info!("migrated legacy telegram config to connectors");
    }

    /// Warn about projects whose paths are missing or not git repositories.
    fn validate_projects(&self) {
        for (name, project) in &self.config().projects {
            let path = Path::new(&project.path);
            if !path.exists() {
                tracing::warn!(project = %name, path = %project.path, "project path does not exist");
            } else if !path.join(".git").exists() {
                tracing::warn!(project = %name, path = %project.path, "project path is not a git repo");
            }
        }
    }
}

fn read_config(path: &Path) -> Result<ForgeConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let config = toml::from_str(&raw).map_err(|e| ConfigError::Load {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(config)
}
