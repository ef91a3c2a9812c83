use super::LedgerContext;
use super::retry::retry_on_conflict;
use crate::domain::agent::Agent;
use crate::domain::ids::AgentId;
use crate::domain::level::{LevelUpgrade, Tier};
use crate::domain::ports::{Write, WriteSet};
use crate::error::{LedgerError, Result};
use tracing::info;

/// Highest tier whose thresholds the agent meets, or the lowest tier when
/// none is met. `None` only for an empty table.
pub fn evaluate<'a>(tiers: &'a [Tier], agent: &Agent) -> Option<&'a Tier> {
    tiers
        .iter()
        .filter(|t| agent.total_sales >= t.min_sales && agent.team_size >= t.min_team_size)
        .max_by_key(|t| t.level)
        .or_else(|| tiers.iter().min_by_key(|t| t.level))
}

#[derive(Clone)]
pub struct LevelEngine {
    ctx: LedgerContext,
}

impl LevelEngine {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    fn tiers(&self) -> &[Tier] {
        self.ctx.config.tiers_descending()
    }

    /// The tier `agent` qualifies for under the configured table.
    pub fn evaluate(&self, agent: &Agent) -> Result<Tier> {
        evaluate(self.tiers(), agent)
            .cloned()
            .ok_or_else(|| LedgerError::ConfigError("tier table is empty".into()))
    }

    /// Promotes the agent when it qualifies for a strictly higher tier.
    ///
    /// Returns the agent's tier after the call and whether it changed. A
    /// lower evaluation leaves the agent where it is.
    pub async fn maybe_upgrade(&self, agent_id: AgentId) -> Result<(Tier, bool)> {
        let _guard = self.ctx.locks.lock(agent_id).await;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || async move {
            let agent = self.ctx.require_agent(agent_id).await?;
            let qualified = self.evaluate(&agent)?;
            if qualified.level <= agent.level {
                let current = self
                    .ctx
                    .config
                    .tier(agent.level)
                    .cloned()
                    .unwrap_or(qualified);
                return Ok((current, false));
            }
            self.change_level(agent, &qualified, true).await?;
            Ok((qualified, true))
        })
        .await
    }

    /// Administrative override. The only way a level can go down.
    pub async fn set_level(&self, agent_id: AgentId, level: u32) -> Result<Agent> {
        let tier = self
            .ctx
            .config
            .tier(level)
            .cloned()
            .ok_or_else(|| LedgerError::ValidationError(format!("unknown level {level}")))?;
        let _guard = self.ctx.locks.lock(agent_id).await;
        let tier = &tier;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || async move {
            let agent = self.ctx.require_agent(agent_id).await?;
            if agent.level == tier.level {
                return Ok(agent);
            }
            self.change_level(agent, tier, false).await
        })
        .await
    }

    async fn change_level(&self, mut agent: Agent, tier: &Tier, automatic: bool) -> Result<Agent> {
        let upgrade = LevelUpgrade {
            agent_id: agent.agent_id,
            from_level: agent.level,
            to_level: tier.level,
            automatic,
            at: self.ctx.clock.now(),
        };
        agent.level = tier.level;
        agent.commission_rate = tier.commission_rate;
        agent.version += 1;

        self.ctx
            .store
            .commit(
                WriteSet::new()
                    .put(Write::Agent(agent.clone()))
                    .put(Write::LevelUpgrade(upgrade.clone())),
            )
            .await?;
        info!(
            agent_id = %agent.agent_id,
            from = upgrade.from_level,
            to = upgrade.to_level,
            tier = %tier.name,
            automatic,
            "agent level changed"
        );
        Ok(agent)
    }
}
