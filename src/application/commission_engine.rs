use super::LedgerContext;
use super::retry::retry_on_conflict;
use crate::config::EarningPolicy;
use crate::domain::agent::Agent;
use crate::domain::commission::{CommissionEntry, CommissionStatus, CommissionType};
use crate::domain::ids::{AgentId, CommissionId, OrderId, UserId};
use crate::domain::money::{Amount, percent_of};
use crate::domain::ports::{Guard, Write, WriteSet};
use crate::domain::withdrawal::WithdrawalRequest;
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, error, info};

/// Balances derived from an agent's commission and withdrawal logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balances {
    pub total_sales: Decimal,
    pub total_commission: Decimal,
    pub withdrawn: Decimal,
}

impl Balances {
    pub fn available(&self) -> Decimal {
        self.total_commission - self.withdrawn
    }
}

/// Folds the logs into balances.
///
/// Only earned or paid entries that have not been reversed count; an
/// original and its offset both drop out. `total_sales` sums the order
/// amounts of direct sales. Every withdrawal that has not failed holds its
/// amount.
pub fn fold_balances(entries: &[CommissionEntry], withdrawals: &[WithdrawalRequest]) -> Balances {
    let reversed: HashSet<CommissionId> = entries.iter().filter_map(|e| e.reverses).collect();
    let mut balances = Balances::default();
    for entry in entries {
        if entry.is_offset()
            || reversed.contains(&entry.commission_id)
            || !entry.status.is_settled()
        {
            continue;
        }
        balances.total_commission += entry.amount;
        if entry.r#type == CommissionType::DirectSale {
            balances.total_sales += entry.order_amount;
        }
    }
    balances.withdrawn = withdrawals
        .iter()
        .filter(|w| w.status.holds_funds())
        .map(|w| w.amount)
        .sum();
    balances
}

/// Writes `balances` into `agent`, refusing to store a broken invariant.
fn apply_balances(agent: &mut Agent, balances: Balances) -> Result<()> {
    agent.total_sales = balances.total_sales;
    agent.total_commission = balances.total_commission;
    agent.available_commission = balances.available();
    if let Err(err) = agent.check_invariants() {
        error!(agent_id = %agent.agent_id, ?balances, "aggregate recomputation broke an invariant");
        return Err(err);
    }
    Ok(())
}

/// Records commission entries and keeps the agent aggregates in step with
/// them.
#[derive(Clone)]
pub struct CommissionEngine {
    ctx: LedgerContext,
}

impl CommissionEngine {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    /// Credits `agent_id` for its share of an order.
    ///
    /// Direct sales use the agent's tier rate, every other type the fixed
    /// rate table. The entry and the refreshed aggregates are committed
    /// together. Calling again for the same agent, order and type returns
    /// the entry already recorded.
    pub async fn compute_and_record(
        &self,
        agent_id: AgentId,
        order_id: &OrderId,
        user_id: Option<&UserId>,
        order_amount: Decimal,
        r#type: CommissionType,
    ) -> Result<CommissionEntry> {
        let order_amount = Amount::new(order_amount)?.value();
        let _guard = self.ctx.locks.lock(agent_id).await;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || {
            self.record_locked(agent_id, order_id, user_id, order_amount, r#type)
        })
        .await
    }

    async fn record_locked(
        &self,
        agent_id: AgentId,
        order_id: &OrderId,
        user_id: Option<&UserId>,
        order_amount: Decimal,
        r#type: CommissionType,
    ) -> Result<CommissionEntry> {
        let mut agent = self.ctx.require_agent(agent_id).await?;
        let mut entries = self.ctx.store.commissions_for_agent(agent_id).await?;

        if let Some(existing) = entries
            .iter()
            .find(|e| &e.order_id == order_id && e.r#type == r#type && !e.is_offset())
        {
            debug!(%agent_id, %order_id, %r#type, "commission already recorded");
            return Ok(existing.clone());
        }
        if !agent.is_active() {
            return Err(LedgerError::ValidationError(format!(
                "agent {agent_id} is {} and cannot earn commission",
                agent.status
            )));
        }

        let config = &self.ctx.config;
        let rate = config
            .commission_rates
            .fixed_rate(r#type)
            .unwrap_or(agent.commission_rate);
        let status = match config.earning_policy {
            EarningPolicy::Immediate => CommissionStatus::Earned,
            EarningPolicy::Deferred => CommissionStatus::Pending,
        };
        let entry = CommissionEntry {
            commission_id: CommissionId::new(),
            agent_id,
            order_id: order_id.clone(),
            user_id: user_id.cloned(),
            order_amount,
            rate,
            amount: percent_of(order_amount, rate, config.token_decimals),
            r#type,
            status,
            reverses: None,
            created_at: self.ctx.clock.now(),
            version: 1,
        };

        entries.push(entry.clone());
        let withdrawals = self.ctx.store.withdrawals_for_agent(agent_id).await?;
        apply_balances(&mut agent, fold_balances(&entries, &withdrawals))?;
        agent.version += 1;

        self.ctx
            .store
            .commit(
                WriteSet::new()
                    .put(Write::Commission(entry.clone()))
                    .put(Write::Agent(agent))
                    .guard(Guard::NoCommission(agent_id, order_id.clone(), r#type)),
            )
            .await?;

        info!(
            %agent_id,
            %order_id,
            commission_type = %r#type,
            %rate,
            amount = %entry.amount,
            "commission recorded"
        );
        Ok(entry)
    }

    /// Appends an entry cancelling `commission_id` and refreshes the owner's
    /// aggregates in the same commit.
    pub async fn reverse(&self, commission_id: CommissionId) -> Result<CommissionEntry> {
        let original = self
            .ctx
            .store
            .commission(commission_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("commission entry", commission_id))?;
        if original.is_offset() {
            return Err(LedgerError::ValidationError(format!(
                "commission entry {commission_id} is itself an offset"
            )));
        }

        let _guard = self.ctx.locks.lock(original.agent_id).await;
        let original = &original;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || {
            self.reverse_locked(original)
        })
        .await
    }

    async fn reverse_locked(&self, original: &CommissionEntry) -> Result<CommissionEntry> {
        let agent_id = original.agent_id;
        let (mut offsets, agent) = self
            .reversal_writes(agent_id, std::slice::from_ref(original))
            .await?;
        let offset = offsets
            .pop()
            .ok_or_else(|| LedgerError::InvariantViolation("reversal built no offset".into()))?;

        self.ctx
            .store
            .commit(
                WriteSet::new()
                    .put(Write::Commission(offset.clone()))
                    .put(Write::Agent(agent))
                    .guard(Guard::NotReversed(original.commission_id)),
            )
            .await?;

        info!(
            %agent_id,
            reversed = %original.commission_id,
            amount = %offset.amount,
            "commission reversed"
        );
        Ok(offset)
    }

    /// Builds the offsets cancelling `originals`, all owned by `agent_id`,
    /// and the agent with its aggregates refolded over them. Nothing is
    /// written. Fails before any write if an original is already reversed
    /// or the agent's balances would go negative.
    pub(crate) async fn reversal_writes(
        &self,
        agent_id: AgentId,
        originals: &[CommissionEntry],
    ) -> Result<(Vec<CommissionEntry>, Agent)> {
        let mut entries = self.ctx.store.commissions_for_agent(agent_id).await?;
        let now = self.ctx.clock.now();
        let mut offsets = Vec::with_capacity(originals.len());
        for original in originals {
            if original.agent_id != agent_id {
                return Err(LedgerError::ValidationError(format!(
                    "commission entry {} does not belong to agent {agent_id}",
                    original.commission_id
                )));
            }
            if entries
                .iter()
                .any(|e| e.reverses == Some(original.commission_id))
            {
                return Err(LedgerError::AlreadyReversed(
                    original.commission_id.to_string(),
                ));
            }
            let offset = original.offset(now);
            entries.push(offset.clone());
            offsets.push(offset);
        }

        let mut agent = self.ctx.require_agent(agent_id).await?;
        let withdrawals = self.ctx.store.withdrawals_for_agent(agent_id).await?;
        apply_balances(&mut agent, fold_balances(&entries, &withdrawals))?;
        agent.version += 1;
        Ok((offsets, agent))
    }

    /// Recomputes the agent's balances from its logs. Idempotent, so it can
    /// be re-run after any partial failure.
    pub async fn refresh_aggregates(&self, agent_id: AgentId) -> Result<Agent> {
        let _guard = self.ctx.locks.lock(agent_id).await;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || {
            self.refresh_locked(agent_id)
        })
        .await
    }

    async fn refresh_locked(&self, agent_id: AgentId) -> Result<Agent> {
        let agent = self.ctx.require_agent(agent_id).await?;
        let entries = self.ctx.store.commissions_for_agent(agent_id).await?;
        let withdrawals = self.ctx.store.withdrawals_for_agent(agent_id).await?;

        let mut refreshed = agent.clone();
        apply_balances(&mut refreshed, fold_balances(&entries, &withdrawals))?;
        if refreshed == agent {
            return Ok(agent);
        }

        info!(
            %agent_id,
            before = %agent.available_commission,
            after = %refreshed.available_commission,
            "aggregates corrected from ledger"
        );
        refreshed.version += 1;
        self.ctx
            .store
            .commit(WriteSet::new().put(Write::Agent(refreshed.clone())))
            .await?;
        Ok(refreshed)
    }

    /// Moves an entry forward (pending -> earned -> paid).
    pub async fn advance_status(
        &self,
        commission_id: CommissionId,
        status: CommissionStatus,
    ) -> Result<CommissionEntry> {
        let entry = self
            .ctx
            .store
            .commission(commission_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("commission entry", commission_id))?;

        let _guard = self.ctx.locks.lock(entry.agent_id).await;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || {
            self.advance_locked(entry.agent_id, commission_id, status)
        })
        .await
    }

    async fn advance_locked(
        &self,
        agent_id: AgentId,
        commission_id: CommissionId,
        status: CommissionStatus,
    ) -> Result<CommissionEntry> {
        let mut entries = self.ctx.store.commissions_for_agent(agent_id).await?;
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.commission_id == commission_id)
        else {
            return Err(LedgerError::not_found("commission entry", commission_id));
        };
        if entry.status == status {
            return Ok(entry.clone());
        }
        if !entry.status.can_advance_to(status) {
            return Err(LedgerError::InvalidTransition {
                entity: "commission entry",
                from: entry.status.to_string(),
                to: status.to_string(),
            });
        }
        entry.status = status;
        entry.version += 1;
        let updated = entry.clone();

        let mut agent = self.ctx.require_agent(agent_id).await?;
        let withdrawals = self.ctx.store.withdrawals_for_agent(agent_id).await?;
        apply_balances(&mut agent, fold_balances(&entries, &withdrawals))?;
        agent.version += 1;

        self.ctx
            .store
            .commit(
                WriteSet::new()
                    .put(Write::Commission(updated.clone()))
                    .put(Write::Agent(agent)),
            )
            .await?;
        debug!(%agent_id, %commission_id, %status, "commission status advanced");
        Ok(updated)
    }

    /// Commission history of an agent, oldest first.
    pub async fn entries_for(&self, agent_id: AgentId) -> Result<Vec<CommissionEntry>> {
        let mut entries = self.ctx.store.commissions_for_agent(agent_id).await?;
        entries.sort_by_key(|e| (e.created_at, e.commission_id));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::domain::agent::AgentStatus;
    use crate::domain::ids::WithdrawalId;
    use crate::domain::ports::{LedgerStoreRef, SystemClock};
    use crate::domain::withdrawal::WithdrawalStatus;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn entry(amount: Decimal, order_amount: Decimal, r#type: CommissionType) -> CommissionEntry {
        CommissionEntry {
            commission_id: CommissionId::new(),
            agent_id: AgentId::new(),
            order_id: OrderId::from("o"),
            user_id: None,
            order_amount,
            rate: dec!(5),
            amount,
            r#type,
            status: CommissionStatus::Earned,
            reverses: None,
            created_at: Utc::now(),
            version: 1,
        }
    }

    fn withdrawal(amount: Decimal, status: WithdrawalStatus) -> WithdrawalRequest {
        WithdrawalRequest {
            withdrawal_id: WithdrawalId::new(),
            agent_id: AgentId::new(),
            amount,
            fee: Decimal::ZERO,
            net_amount: amount,
            target_address: "T".into(),
            status,
            external_tx_ref: None,
            created_at: Utc::now(),
            settled_at: None,
            version: 1,
        }
    }

    #[test]
    fn test_fold_skips_reversed_and_pending() {
        let direct = entry(dec!(50), dec!(1000), CommissionType::DirectSale);
        let team = entry(dec!(4), dec!(200), CommissionType::TeamSale);
        let refunded = entry(dec!(10), dec!(200), CommissionType::DirectSale);
        let offset = refunded.offset(Utc::now());
        let mut pending = entry(dec!(7), dec!(140), CommissionType::DirectSale);
        pending.status = CommissionStatus::Pending;

        let balances = fold_balances(
            &[direct, team, refunded, offset, pending],
            &[
                withdrawal(dec!(20), WithdrawalStatus::Completed),
                withdrawal(dec!(15), WithdrawalStatus::Failed),
            ],
        );
        assert_eq!(balances.total_sales, dec!(1000));
        assert_eq!(balances.total_commission, dec!(54));
        assert_eq!(balances.withdrawn, dec!(20));
        assert_eq!(balances.available(), dec!(34));
    }

    async fn engine_with_agent() -> (CommissionEngine, AgentId) {
        let store: LedgerStoreRef = Arc::new(InMemoryLedgerStore::new());
        let ctx = LedgerContext::new(store, Arc::new(SystemClock), LedgerConfig::default());
        let mut agent = Agent::new("a", "CODEA", 1, dec!(5), AgentStatus::Active, Utc::now());
        agent.version = 1;
        let agent_id = agent.agent_id;
        ctx.store
            .commit(WriteSet::new().put(Write::Agent(agent)))
            .await
            .unwrap();
        (CommissionEngine::new(ctx), agent_id)
    }

    #[tokio::test]
    async fn test_direct_sale_uses_agent_rate() {
        let (engine, agent_id) = engine_with_agent().await;
        let entry = engine
            .compute_and_record(
                agent_id,
                &OrderId::from("o-1"),
                None,
                dec!(1000),
                CommissionType::DirectSale,
            )
            .await
            .unwrap();
        assert_eq!(entry.rate, dec!(5));
        assert_eq!(entry.amount, dec!(50));
        assert_eq!(entry.status, CommissionStatus::Earned);

        let agent = engine.ctx.require_agent(agent_id).await.unwrap();
        assert_eq!(agent.total_sales, dec!(1000));
        assert_eq!(agent.total_commission, dec!(50));
        assert_eq!(agent.available_commission, dec!(50));
    }

    #[tokio::test]
    async fn test_other_types_use_fixed_rates() {
        let (engine, agent_id) = engine_with_agent().await;
        let cases = [
            (CommissionType::TeamSale, dec!(2), dec!(20)),
            (CommissionType::ReferralBonus, dec!(5), dec!(50)),
            (CommissionType::LevelBonus, dec!(1), dec!(10)),
        ];
        for (r#type, rate, amount) in cases {
            let entry = engine
                .compute_and_record(agent_id, &OrderId::from("o-1"), None, dec!(1000), r#type)
                .await
                .unwrap();
            assert_eq!(entry.r#type, r#type);
            assert_eq!(entry.rate, rate, "{}", r#type);
            assert_eq!(entry.amount, amount, "{}", r#type);
        }

        let agent = engine.ctx.require_agent(agent_id).await.unwrap();
        // None of them is a direct sale.
        assert_eq!(agent.total_sales, dec!(0));
        assert_eq!(agent.total_commission, dec!(80));
    }

    #[tokio::test]
    async fn test_record_is_idempotent_per_order_and_type() {
        let (engine, agent_id) = engine_with_agent().await;
        let order = OrderId::from("o-1");
        let first = engine
            .compute_and_record(agent_id, &order, None, dec!(100), CommissionType::DirectSale)
            .await
            .unwrap();
        let second = engine
            .compute_and_record(agent_id, &order, None, dec!(100), CommissionType::DirectSale)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.entries_for(agent_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_small_roundings_never_inflate_total() {
        let (engine, agent_id) = engine_with_agent().await;
        for i in 0..25 {
            engine
                .compute_and_record(
                    agent_id,
                    &OrderId::from(format!("o-{i}")),
                    None,
                    dec!(0.333333),
                    CommissionType::DirectSale,
                )
                .await
                .unwrap();
        }
        let entries = engine.entries_for(agent_id).await.unwrap();
        let sum: Decimal = entries.iter().map(|e| e.amount).sum();
        let agent = engine.ctx.require_agent(agent_id).await.unwrap();
        assert_eq!(entries[0].amount, dec!(0.016667));
        assert_eq!(agent.total_commission, sum);
        assert_eq!(sum, dec!(0.416675));
    }

    #[tokio::test]
    async fn test_reverse_twice_fails() {
        let (engine, agent_id) = engine_with_agent().await;
        let entry = engine
            .compute_and_record(
                agent_id,
                &OrderId::from("o-1"),
                None,
                dec!(1000),
                CommissionType::DirectSale,
            )
            .await
            .unwrap();

        let offset = engine.reverse(entry.commission_id).await.unwrap();
        assert_eq!(offset.amount, dec!(-50));
        let agent = engine.ctx.require_agent(agent_id).await.unwrap();
        assert_eq!(agent.total_commission, dec!(0));
        assert_eq!(agent.available_commission, dec!(0));

        assert!(matches!(
            engine.reverse(entry.commission_id).await,
            Err(LedgerError::AlreadyReversed(_))
        ));
        // The original is still there, untouched.
        let stored = engine.ctx.store.commission(entry.commission_id).await.unwrap();
        assert_eq!(stored, Some(entry));
    }

    #[tokio::test]
    async fn test_refresh_heals_drifted_aggregates() {
        let (engine, agent_id) = engine_with_agent().await;
        engine
            .compute_and_record(
                agent_id,
                &OrderId::from("o-1"),
                None,
                dec!(1000),
                CommissionType::DirectSale,
            )
            .await
            .unwrap();

        let mut drifted = engine.ctx.require_agent(agent_id).await.unwrap();
        drifted.available_commission = dec!(3);
        drifted.version += 1;
        engine
            .ctx
            .store
            .commit(WriteSet::new().put(Write::Agent(drifted)))
            .await
            .unwrap();

        let healed = engine.refresh_aggregates(agent_id).await.unwrap();
        assert_eq!(healed.available_commission, dec!(50));
        // A second refresh has nothing to correct.
        let again = engine.refresh_aggregates(agent_id).await.unwrap();
        assert_eq!(again.version, healed.version);
    }

    #[tokio::test]
    async fn test_deferred_entries_count_once_earned() {
        let store: LedgerStoreRef = Arc::new(InMemoryLedgerStore::new());
        let config = LedgerConfig {
            earning_policy: EarningPolicy::Deferred,
            ..LedgerConfig::default()
        };
        let ctx = LedgerContext::new(store, Arc::new(SystemClock), config);
        let mut agent = Agent::new("a", "CODEA", 1, dec!(5), AgentStatus::Active, Utc::now());
        agent.version = 1;
        let agent_id = agent.agent_id;
        ctx.store
            .commit(WriteSet::new().put(Write::Agent(agent)))
            .await
            .unwrap();
        let engine = CommissionEngine::new(ctx);

        let entry = engine
            .compute_and_record(
                agent_id,
                &OrderId::from("o-1"),
                None,
                dec!(100),
                CommissionType::DirectSale,
            )
            .await
            .unwrap();
        assert_eq!(entry.status, CommissionStatus::Pending);
        let agent = engine.ctx.require_agent(agent_id).await.unwrap();
        assert_eq!(agent.available_commission, dec!(0));

        engine
            .advance_status(entry.commission_id, CommissionStatus::Earned)
            .await
            .unwrap();
        let agent = engine.ctx.require_agent(agent_id).await.unwrap();
        assert_eq!(agent.available_commission, dec!(5));

        assert!(matches!(
            engine
                .advance_status(entry.commission_id, CommissionStatus::Pending)
                .await,
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_inactive_agent_cannot_earn() {
        let (engine, agent_id) = engine_with_agent().await;
        let mut agent = engine.ctx.require_agent(agent_id).await.unwrap();
        agent.status = AgentStatus::Suspended;
        agent.version += 1;
        engine
            .ctx
            .store
            .commit(WriteSet::new().put(Write::Agent(agent)))
            .await
            .unwrap();

        let result = engine
            .compute_and_record(
                agent_id,
                &OrderId::from("o-1"),
                None,
                dec!(100),
                CommissionType::DirectSale,
            )
            .await;
        assert!(matches!(result, Err(LedgerError::ValidationError(_))));
    }
}
