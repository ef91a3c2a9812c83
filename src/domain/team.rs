use super::ids::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TeamRelation {
    /// Member registered directly under the agent.
    Direct,
    /// Member registered under one of the agent's direct members.
    Indirect,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStatus {
    Active,
    Removed,
}

/// Membership of `member_id` in the downline of `agent_id`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TeamEdge {
    pub agent_id: AgentId,
    pub member_id: AgentId,
    pub relation: TeamRelation,
    pub status: EdgeStatus,
    pub created_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl TeamEdge {
    pub fn new(
        agent_id: AgentId,
        member_id: AgentId,
        relation: TeamRelation,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id,
            member_id,
            relation,
            status: EdgeStatus::Active,
            created_at: now,
            removed_at: None,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == EdgeStatus::Active
    }

    pub fn remove(&mut self, now: DateTime<Utc>) {
        self.status = EdgeStatus::Removed;
        self.removed_at = Some(now);
    }
}
