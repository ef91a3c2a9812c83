use crate::domain::ids::AgentId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-agent mutual exclusion for balance and aggregate updates.
///
/// Operations on different agents never contend. Holders must not call
/// another locking operation for the same agent, the guards are not
/// reentrant.
#[derive(Clone, Default)]
pub struct AgentLocks {
    slots: Arc<Mutex<HashMap<AgentId, Arc<AsyncMutex<()>>>>>,
}

impl AgentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, agent_id: AgentId) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(agent_id).or_default().clone()
    }

    pub async fn lock(&self, agent_id: AgentId) -> OwnedMutexGuard<()> {
        self.slot(agent_id).lock_owned().await
    }

    /// Locks several agents in ascending id order so that two callers
    /// locking overlapping sets cannot deadlock.
    pub async fn lock_many(&self, agent_ids: &[AgentId]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = agent_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for agent_id in ids {
            guards.push(self.lock(agent_id).await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_agent_is_serialized() {
        let locks = AgentLocks::new();
        let agent = AgentId::new();

        let guard = locks.lock(agent).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(agent).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_agents_do_not_contend() {
        let locks = AgentLocks::new();
        let _a = locks.lock(AgentId::new()).await;
        let _b = tokio::time::timeout(Duration::from_millis(50), locks.lock(AgentId::new()))
            .await
            .expect("independent agents must not block each other");
    }

    #[tokio::test]
    async fn test_lock_many_dedups() {
        let locks = AgentLocks::new();
        let agent = AgentId::new();
        let guards = locks.lock_many(&[agent, agent, AgentId::new()]).await;
        assert_eq!(guards.len(), 2);
    }
}
