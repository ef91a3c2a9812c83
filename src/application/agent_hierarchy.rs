use super::LedgerContext;
use super::commission_engine::fold_balances;
use super::retry::retry_on_conflict;
use crate::config::TeamScope;
use crate::domain::agent::Agent;
use crate::domain::ids::AgentId;
use crate::domain::ports::{Guard, Write, WriteSet};
use crate::domain::team::{TeamEdge, TeamRelation};
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use std::collections::{HashSet, VecDeque};
use tracing::{info, warn};

/// Parent/child edges of the agent tree and the team aggregates derived
/// from them.
#[derive(Clone)]
pub struct AgentHierarchy {
    ctx: LedgerContext,
}

impl AgentHierarchy {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    /// Places `child_id` directly under `parent_id`.
    pub async fn attach(&self, parent_id: AgentId, child_id: AgentId) -> Result<TeamEdge> {
        if parent_id == child_id {
            return Err(LedgerError::CycleDetected {
                parent: parent_id.to_string(),
                child: child_id.to_string(),
            });
        }
        let _guards = self.ctx.locks.lock_many(&[parent_id, child_id]).await;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || async move {
            let parent = self.ctx.require_agent(parent_id).await?;
            let child = self.ctx.require_agent(child_id).await?;
            let (set, edge) = self.attach_writes(parent, child).await?;
            self.ctx.store.commit(set).await?;
            info!(%parent_id, %child_id, "agent attached");
            Ok(edge)
        })
        .await
    }

    /// Registers a brand-new agent under `parent_id` in a single commit.
    ///
    /// `child` must not be stored yet; it is written with the edge and the
    /// parent's new team size.
    pub(crate) async fn attach_new(&self, parent_id: AgentId, child: Agent) -> Result<(Agent, TeamEdge)> {
        let _guard = self.ctx.locks.lock(parent_id).await;
        let child = &child;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || async move {
            let parent = self.ctx.require_agent(parent_id).await?;
            let mut registered = child.clone();
            registered.version = 0;
            let (set, edge) = self.attach_writes(parent, registered).await?;
            let set = set
                .guard(Guard::AccountRefFree(child.account_ref.clone()))
                .guard(Guard::ReferralCodeFree(child.referral_code.clone()));
            let stored_child = set
                .writes
                .iter()
                .find_map(|w| match w {
                    Write::Agent(a) if a.agent_id == child.agent_id => Some(a.clone()),
                    _ => None,
                })
                .ok_or_else(|| {
                    LedgerError::InvariantViolation("attach did not write the child".into())
                })?;
            self.ctx.store.commit(set).await?;
            info!(%parent_id, child_id = %child.agent_id, "agent registered under parent");
            Ok((stored_child, edge))
        })
        .await
    }

    /// Builds the writes linking `child` under `parent`: the direct edge,
    /// the indirect edge under the grandparent, the child's upline and the
    /// parent's team size.
    async fn attach_writes(&self, mut parent: Agent, mut child: Agent) -> Result<(WriteSet, TeamEdge)> {
        if let Some(existing) = child.parent_agent_id {
            return Err(LedgerError::ValidationError(format!(
                "agent {} already has upline {existing}",
                child.agent_id
            )));
        }
        if self.is_ancestor(child.agent_id, &parent).await? {
            return Err(LedgerError::CycleDetected {
                parent: parent.agent_id.to_string(),
                child: child.agent_id.to_string(),
            });
        }

        let now = self.ctx.clock.now();
        let edge = self
            .new_edge(parent.agent_id, child.agent_id, TeamRelation::Direct, now)
            .await?;
        // The upline walk above reads agents nobody has locked; the store
        // repeats it atomically with the commit.
        let mut set = WriteSet::new()
            .put(Write::Edge(edge.clone()))
            .guard(Guard::NoCycle {
                parent: parent.agent_id,
                child: child.agent_id,
            });

        if let Some(grandparent_id) = parent.parent_agent_id {
            let indirect = self
                .new_edge(grandparent_id, child.agent_id, TeamRelation::Indirect, now)
                .await?;
            set = set.put(Write::Edge(indirect));
        }

        child.parent_agent_id = Some(parent.agent_id);
        child.version += 1;
        parent.team_size += 1;
        parent.version += 1;

        Ok((set.put(Write::Agent(child)).put(Write::Agent(parent)), edge))
    }

    /// A fresh active edge, reusing the slot of a previously removed one.
    async fn new_edge(
        &self,
        agent_id: AgentId,
        member_id: AgentId,
        relation: TeamRelation,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<TeamEdge> {
        let mut edge = TeamEdge::new(agent_id, member_id, relation, now);
        match self.ctx.store.edge(agent_id, member_id).await? {
            Some(existing) if existing.is_active() => {
                return Err(LedgerError::ValidationError(format!(
                    "{member_id} is already a member of {agent_id}"
                )));
            }
            Some(existing) => edge.version = existing.version + 1,
            None => edge.version = 1,
        }
        Ok(edge)
    }

    /// Whether `candidate` sits above `agent` in the tree.
    async fn is_ancestor(&self, candidate: AgentId, agent: &Agent) -> Result<bool> {
        let mut seen = HashSet::new();
        let mut cursor = agent.parent_agent_id;
        while let Some(current) = cursor {
            if current == candidate {
                return Ok(true);
            }
            if !seen.insert(current) {
                return Err(LedgerError::InvariantViolation(format!(
                    "upline of {} loops through {current}",
                    agent.agent_id
                )));
            }
            cursor = self.ctx.require_agent(current).await?.parent_agent_id;
        }
        Ok(false)
    }

    /// Soft-removes `child_id` from under `parent_id`. Commission already
    /// credited for past team sales stays where it is.
    pub async fn detach(&self, parent_id: AgentId, child_id: AgentId) -> Result<TeamEdge> {
        let _guards = self.ctx.locks.lock_many(&[parent_id, child_id]).await;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || {
            self.detach_locked(parent_id, child_id)
        })
        .await
    }

    async fn detach_locked(&self, parent_id: AgentId, child_id: AgentId) -> Result<TeamEdge> {
        let mut parent = self.ctx.require_agent(parent_id).await?;
        let mut child = self.ctx.require_agent(child_id).await?;
        let mut edge = self
            .ctx
            .store
            .edge(parent_id, child_id)
            .await?
            .filter(|e| e.is_active() && e.relation == TeamRelation::Direct)
            .ok_or_else(|| LedgerError::not_found("team edge", format!("{parent_id}->{child_id}")))?;

        if parent.team_size == 0 {
            return Err(LedgerError::InvariantViolation(format!(
                "agent {parent_id} has an active member but team size 0"
            )));
        }

        let now = self.ctx.clock.now();
        edge.remove(now);
        edge.version += 1;
        let mut set = WriteSet::new().put(Write::Edge(edge.clone()));

        if let Some(grandparent_id) = parent.parent_agent_id
            && let Some(mut indirect) = self.ctx.store.edge(grandparent_id, child_id).await?
            && indirect.is_active()
        {
            indirect.remove(now);
            indirect.version += 1;
            set = set.put(Write::Edge(indirect));
        }

        parent.team_size -= 1;
        parent.version += 1;
        child.parent_agent_id = None;
        child.version += 1;

        self.ctx
            .store
            .commit(set.put(Write::Agent(parent)).put(Write::Agent(child)))
            .await?;
        info!(%parent_id, %child_id, "agent detached");
        Ok(edge)
    }

    /// Active edges under `agent_id`.
    pub async fn members(&self, agent_id: AgentId) -> Result<Vec<TeamEdge>> {
        Ok(self
            .ctx
            .store
            .edges_of(agent_id)
            .await?
            .into_iter()
            .filter(TeamEdge::is_active)
            .collect())
    }

    async fn direct_members(&self, agent_id: AgentId) -> Result<Vec<AgentId>> {
        Ok(self
            .members(agent_id)
            .await?
            .into_iter()
            .filter(|e| e.relation == TeamRelation::Direct)
            .map(|e| e.member_id)
            .collect())
    }

    /// Direct-sale volume of the agent's team.
    ///
    /// With [`TeamScope::Direct`] only members under an active direct edge
    /// count; [`TeamScope::Recursive`] walks the whole downline.
    pub async fn team_sales(&self, agent_id: AgentId) -> Result<Decimal> {
        self.ctx.require_agent(agent_id).await?;

        let mut members: Vec<AgentId> = self.direct_members(agent_id).await?;
        if self.ctx.config.team_scope == TeamScope::Recursive {
            let mut seen: HashSet<AgentId> = members.iter().copied().collect();
            let mut queue: VecDeque<AgentId> = members.iter().copied().collect();
            while let Some(member) = queue.pop_front() {
                for below in self.direct_members(member).await? {
                    if below != agent_id && seen.insert(below) {
                        members.push(below);
                        queue.push_back(below);
                    }
                }
            }
        }

        let mut total = Decimal::ZERO;
        for member in members {
            let entries = self.ctx.store.commissions_for_agent(member).await?;
            total += fold_balances(&entries, &[]).total_sales;
        }
        Ok(total)
    }

    /// Stores the current team sales on the agent and reconciles the cached
    /// team size with the active direct edges.
    pub async fn refresh_team(&self, agent_id: AgentId) -> Result<Agent> {
        let _guard = self.ctx.locks.lock(agent_id).await;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || async move {
            let agent = self.ctx.require_agent(agent_id).await?;
            let team_sales = self.team_sales(agent_id).await?;
            let team_size = u32::try_from(self.direct_members(agent_id).await?.len())
                .map_err(|_| LedgerError::InvariantViolation("team size overflow".into()))?;

            if team_size != agent.team_size {
                warn!(
                    %agent_id,
                    cached = agent.team_size,
                    actual = team_size,
                    "team size drifted from edges"
                );
            }
            if team_sales == agent.team_sales && team_size == agent.team_size {
                return Ok(agent);
            }

            let mut updated = agent;
            updated.team_sales = team_sales;
            updated.team_size = team_size;
            updated.version += 1;
            self.ctx
                .store
                .commit(WriteSet::new().put(Write::Agent(updated.clone())))
                .await?;
            Ok(updated)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::commission_engine::CommissionEngine;
    use crate::config::LedgerConfig;
    use crate::domain::agent::AgentStatus;
    use crate::domain::commission::CommissionType;
    use crate::domain::ids::OrderId;
    use crate::domain::ports::{LedgerStoreRef, SystemClock};
    use crate::domain::team::EdgeStatus;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn setup(config: LedgerConfig, count: usize) -> (AgentHierarchy, CommissionEngine, Vec<AgentId>) {
        let store: LedgerStoreRef = Arc::new(InMemoryLedgerStore::new());
        let ctx = LedgerContext::new(store, Arc::new(SystemClock), config);
        let mut ids = Vec::new();
        for i in 0..count {
            let mut agent = Agent::new(
                format!("acct-{i}"),
                format!("CODE{i:04}"),
                1,
                dec!(5),
                AgentStatus::Active,
                Utc::now(),
            );
            agent.version = 1;
            ids.push(agent.agent_id);
            ctx.store
                .commit(WriteSet::new().put(Write::Agent(agent)))
                .await
                .unwrap();
        }
        (AgentHierarchy::new(ctx.clone()), CommissionEngine::new(ctx), ids)
    }

    #[tokio::test]
    async fn test_attach_increments_team_size() {
        let (hierarchy, _, ids) = setup(LedgerConfig::default(), 2).await;
        let edge = hierarchy.attach(ids[0], ids[1]).await.unwrap();
        assert_eq!(edge.relation, TeamRelation::Direct);

        let parent = hierarchy.ctx.require_agent(ids[0]).await.unwrap();
        let child = hierarchy.ctx.require_agent(ids[1]).await.unwrap();
        assert_eq!(parent.team_size, 1);
        assert_eq!(child.parent_agent_id, Some(ids[0]));
    }

    #[tokio::test]
    async fn test_attach_missing_agent() {
        let (hierarchy, _, ids) = setup(LedgerConfig::default(), 1).await;
        assert!(matches!(
            hierarchy.attach(ids[0], AgentId::new()).await,
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_attach_rejects_cycles() {
        let (hierarchy, _, ids) = setup(LedgerConfig::default(), 3).await;
        hierarchy.attach(ids[0], ids[1]).await.unwrap();
        hierarchy.attach(ids[1], ids[2]).await.unwrap();

        // ids[0] is above ids[2]; placing it under ids[2] closes a loop.
        let root = hierarchy.ctx.require_agent(ids[0]).await.unwrap();
        assert!(root.parent_agent_id.is_none());
        assert!(matches!(
            hierarchy.attach(ids[2], ids[0]).await,
            Err(LedgerError::CycleDetected { .. })
        ));
        assert!(matches!(
            hierarchy.attach(ids[1], ids[1]).await,
            Err(LedgerError::CycleDetected { .. })
        ));
    }

    #[tokio::test]
    async fn test_grandparent_gets_indirect_edge() {
        let (hierarchy, _, ids) = setup(LedgerConfig::default(), 3).await;
        hierarchy.attach(ids[0], ids[1]).await.unwrap();
        hierarchy.attach(ids[1], ids[2]).await.unwrap();

        let top = hierarchy.members(ids[0]).await.unwrap();
        assert_eq!(top.len(), 2);
        assert!(
            top.iter()
                .any(|e| e.member_id == ids[2] && e.relation == TeamRelation::Indirect)
        );
        // Only direct members count towards team size.
        let root = hierarchy.ctx.require_agent(ids[0]).await.unwrap();
        assert_eq!(root.team_size, 1);
    }

    #[tokio::test]
    async fn test_detach_soft_removes() {
        let (hierarchy, _, ids) = setup(LedgerConfig::default(), 2).await;
        hierarchy.attach(ids[0], ids[1]).await.unwrap();
        let edge = hierarchy.detach(ids[0], ids[1]).await.unwrap();
        assert_eq!(edge.status, EdgeStatus::Removed);

        let stored = hierarchy.ctx.store.edge(ids[0], ids[1]).await.unwrap();
        assert_eq!(stored.map(|e| e.status), Some(EdgeStatus::Removed));
        let parent = hierarchy.ctx.require_agent(ids[0]).await.unwrap();
        assert_eq!(parent.team_size, 0);
        assert!(hierarchy.detach(ids[0], ids[1]).await.is_err());

        // Re-attaching reactivates the same edge slot.
        hierarchy.attach(ids[0], ids[1]).await.unwrap();
        assert_eq!(hierarchy.members(ids[0]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_team_sales_direct_scope_is_shallow() {
        let (hierarchy, commissions, ids) = setup(LedgerConfig::default(), 3).await;
        hierarchy.attach(ids[0], ids[1]).await.unwrap();
        hierarchy.attach(ids[1], ids[2]).await.unwrap();

        commissions
            .compute_and_record(ids[1], &OrderId::from("o-1"), None, dec!(1000), CommissionType::DirectSale)
            .await
            .unwrap();
        commissions
            .compute_and_record(ids[2], &OrderId::from("o-2"), None, dec!(300), CommissionType::DirectSale)
            .await
            .unwrap();

        assert_eq!(hierarchy.team_sales(ids[0]).await.unwrap(), dec!(1000));
        assert_eq!(hierarchy.team_sales(ids[1]).await.unwrap(), dec!(300));

        let refreshed = hierarchy.refresh_team(ids[0]).await.unwrap();
        assert_eq!(refreshed.team_sales, dec!(1000));
    }

    #[tokio::test]
    async fn test_team_sales_recursive_scope() {
        let config = LedgerConfig {
            team_scope: TeamScope::Recursive,
            ..LedgerConfig::default()
        };
        let (hierarchy, commissions, ids) = setup(config, 3).await;
        hierarchy.attach(ids[0], ids[1]).await.unwrap();
        hierarchy.attach(ids[1], ids[2]).await.unwrap();
        commissions
            .compute_and_record(ids[1], &OrderId::from("o-1"), None, dec!(1000), CommissionType::DirectSale)
            .await
            .unwrap();
        commissions
            .compute_and_record(ids[2], &OrderId::from("o-2"), None, dec!(300), CommissionType::DirectSale)
            .await
            .unwrap();

        assert_eq!(hierarchy.team_sales(ids[0]).await.unwrap(), dec!(1300));
    }

    #[tokio::test]
    async fn test_crossed_attaches_cannot_both_commit() {
        let (hierarchy, _, ids) = setup(LedgerConfig::default(), 4).await;
        let (r1, l1, r2, l2) = (ids[0], ids[1], ids[2], ids[3]);
        hierarchy.attach(r1, l1).await.unwrap();
        hierarchy.attach(r2, l2).await.unwrap();

        // Both attaches read the tree before either commits, so each passes
        // its own upline walk.
        let store = &hierarchy.ctx.store;
        let (first, _) = hierarchy
            .attach_writes(
                store.agent(l1).await.unwrap().unwrap(),
                store.agent(r2).await.unwrap().unwrap(),
            )
            .await
            .unwrap();
        let (second, _) = hierarchy
            .attach_writes(
                store.agent(l2).await.unwrap().unwrap(),
                store.agent(r1).await.unwrap().unwrap(),
            )
            .await
            .unwrap();

        store.commit(first).await.unwrap();
        assert!(matches!(
            store.commit(second).await,
            Err(LedgerError::Conflict(_))
        ));
        assert_eq!(store.agent(r1).await.unwrap().unwrap().parent_agent_id, None);

        // Retried from fresh state the attach sees the cycle itself.
        assert!(matches!(
            hierarchy.attach(l2, r1).await,
            Err(LedgerError::CycleDetected { .. })
        ));
    }
}
