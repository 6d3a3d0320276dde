//! Agent Forge: supervision and routing for long-running coding-agent
//! terminal sessions across git projects and chat platforms.

pub mod agent;
pub mod agents;
pub mod api;
pub mod broadcast;
pub mod config;
pub mod connector;
pub mod error;
pub mod extract;
pub mod lifecycle;
pub mod media;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod router;
pub mod store;
pub mod summarize;
pub mod terminal;
pub mod worktree;

pub use error::{Error, Result};
