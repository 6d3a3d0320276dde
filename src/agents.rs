//! In-memory store of live agents.
//!
//! One mutex around the whole map. Entries are cloned out; mutations go
//! through [`AgentStore::update`] so the lock is never held across awaits.

use crate::agent::{Agent, AgentStatus};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct AgentStore {
    agents: Mutex<HashMap<String, Agent>>,
}

impl AgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, agent_id: &str) -> Option<Agent> {
        self.agents.lock().await.get(agent_id).cloned()
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.agents.lock().await.contains_key(agent_id)
    }

    pub async fn insert(&self, agent: Agent) {
        self.agents.lock().await.insert(agent.id.clone(), agent);
    }

    pub async fn remove(&self, agent_id: &str) -> Option<Agent> {
        self.agents.lock().await.remove(agent_id)
    }

    /// Apply a mutation to an agent in place. Returns the updated clone,
    /// or `None` when the agent is gone.
    pub async fn update<F>(&self, agent_id: &str, mutate: F) -> Option<Agent>
    where
        F: FnOnce(&mut Agent),
    {
        let mut agents = self.agents.lock().await;
        let agent = agents.get_mut(agent_id)?;
        mutate(agent);
        Some(agent.clone())
    }

    /// All agents, optionally filtered by project.
    pub async fn list(&self, project_name: Option<&str>) -> Vec<Agent> {
        let agents = self.agents.lock().await;
        let mut result: Vec<Agent> = agents
            .values()
            .filter(|a| project_name.is_none_or(|p| a.project_name == p))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        result
    }

    /// Agents grouped by project name.
    pub async fn by_project(&self) -> HashMap<String, Vec<Agent>> {
        let agents = self.agents.lock().await;
        let mut grouped: HashMap<String, Vec<Agent>> = HashMap::new();
        for agent in agents.values() {
            grouped
                .entry(agent.project_name.clone())
                .or_default()
                .push(agent.clone());
        }
        grouped
    }

    /// Count non-STOPPED agents for a project, used against the max cap.
    pub async fn count_active(&self, project_name: &str) -> usize {
        self.agents
            .lock()
            .await
            .values()
            .filter(|a| a.project_name == project_name && a.status != AgentStatus::Stopped)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    fn agent(id: &str, project: &str, status: AgentStatus) -> Agent {
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
    async fn active_count_excludes_stopped() {
        let store = AgentStore::new();
        store.insert(agent("a1", "api", AgentStatus::Working)).await;
        store.insert(agent("a2", "api", AgentStatus::Stopped)).await;
        store.insert(agent("a3", "web", AgentStatus::Idle)).await;

        assert_eq!(store.count_active("api").await, 1);
        assert_eq!(store.count_active("web").await, 1);
        assert_eq!(store.count_active("missing").await, 0);
    }

    #[tokio::test]
    async fn list_filters_by_project() {
        let store = AgentStore::new();
        store.insert(agent("a1", "api", AgentStatus::Idle)).await;
        store.insert(agent("a2", "web", AgentStatus::Idle)).await;

        assert_eq!(store.list(Some("api")).await.len(), 1);
        assert_eq!(store.list(None).await.len(), 2);
        assert_eq!(store.by_project().await.len(), 2);
    }

    #[tokio::test]
    async fn update_mutates_in_place() {
        let store = AgentStore::new();
        store.insert(agent("a1", "api", AgentStatus::Starting)).await;

        let updated = store
            .update("a1", |a| a.status = AgentStatus::Working)
            .await
            .unwrap();
        assert_eq!(updated.status, AgentStatus::Working);
        assert_eq!(store.get("a1").await.unwrap().status, AgentStatus::Working);
        assert!(store.update("nope", |_| {}).await.is_none());
    }
}
