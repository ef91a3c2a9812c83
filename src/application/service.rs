use super::LedgerContext;
use super::agent_hierarchy::AgentHierarchy;
use super::commission_engine::CommissionEngine;
use super::level_engine::LevelEngine;
use super::payment_ledger::{PaymentLedger, Reconciliation};
use super::read_models::{AgentSnapshot, PaymentSnapshot};
use super::referral_book::ReferralBook;
use super::retry::retry_on_conflict;
use super::withdrawal_ledger::WithdrawalLedger;
use crate::config::LedgerConfig;
use crate::domain::agent::{Agent, AgentStatus};
use crate::domain::commission::{CommissionEntry, CommissionType};
use crate::domain::ids::{AgentId, CommissionId, PaymentId, TxRef, UserId, WithdrawalId};
use crate::domain::payment::{OrderRef, PaymentRequest, PaymentStatus};
use crate::domain::ports::{
    AddressAllocatorRef, ClockRef, ExchangeRateProviderRef, Guard, LedgerClientRef,
    LedgerStoreRef, OrderCancellerRef, Write, WriteSet,
};
use crate::domain::referral::Referral;
use crate::domain::withdrawal::{WithdrawalRequest, WithdrawalStatus};
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// The outside world the ledger talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger_client: LedgerClientRef,
    pub rates: ExchangeRateProviderRef,
    pub addresses: AddressAllocatorRef,
    pub orders: OrderCancellerRef,
    pub clock: ClockRef,
}

/// The service object behind every inbound command.
///
/// `Ledger` wires the components to one store and one configuration. It is
/// cheap to clone and safe to share between tasks; all state lives in the
/// store.
#[derive(Clone)]
pub struct Ledger {
    ctx: LedgerContext,
    payments: Arc<PaymentLedger>,
    commissions: CommissionEngine,
    hierarchy: AgentHierarchy,
    levels: LevelEngine,
    withdrawals: WithdrawalLedger,
    referrals: ReferralBook,
}

impl Ledger {
    /// Creates a new `Ledger`.
    ///
    /// # Arguments
    ///
    /// * `config` - Ledger settings; normalized and validated here.
    /// * `store` - Durable storage for every entity.
    /// * `collaborators` - Settlement network, rates, addresses, orders and clock.
    pub fn new(
        mut config: LedgerConfig,
        store: LedgerStoreRef,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.normalize();
        config.validate()?;

        let ctx = LedgerContext::new(store, collaborators.clock, config);
        let commissions = CommissionEngine::new(ctx.clone());
        Ok(Self {
            payments: Arc::new(PaymentLedger::new(
                ctx.clone(),
                collaborators.ledger_client,
                collaborators.rates,
                collaborators.addresses,
                collaborators.orders,
            )),
            hierarchy: AgentHierarchy::new(ctx.clone()),
            levels: LevelEngine::new(ctx.clone()),
            withdrawals: WithdrawalLedger::new(ctx.clone()),
            referrals: ReferralBook::new(ctx.clone(), commissions.clone()),
            commissions,
            ctx,
        })
    }

    /// Registers an agent at the lowest tier, optionally under the agent
    /// owning `parent_referral_code`.
    pub async fn register_agent(
        &self,
        account_ref: &str,
        parent_referral_code: Option<&str>,
    ) -> Result<Agent> {
        let account_ref = account_ref.trim();
        if account_ref.is_empty() {
            return Err(LedgerError::ValidationError("account reference is empty".into()));
        }
        if self.ctx.store.agent_by_account(account_ref).await?.is_some() {
            return Err(LedgerError::Conflict(format!(
                "account {account_ref} is already registered"
            )));
        }

        let parent = match parent_referral_code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => {
                let code = code.to_ascii_uppercase();
                let parent = self
                    .ctx
                    .store
                    .agent_by_referral_code(&code)
                    .await?
                    .ok_or_else(|| LedgerError::not_found("referral code", &code))?;
                if !parent.is_active() {
                    return Err(LedgerError::ValidationError(format!(
                        "upline {} is {} and cannot take new members",
                        parent.agent_id, parent.status
                    )));
                }
                Some(parent.agent_id)
            }
            None => None,
        };

        let config = &self.ctx.config;
        let tier = config
            .lowest_tier()
            .ok_or_else(|| LedgerError::ConfigError("tier table is empty".into()))?;
        let status = if config.auto_activate_agents {
            AgentStatus::Active
        } else {
            AgentStatus::Pending
        };

        let agent = retry_on_conflict(config.max_conflict_retries, move || async move {
            let mut agent = Agent::new(
                account_ref,
                String::new(),
                tier.level,
                tier.commission_rate,
                status,
                self.ctx.clock.now(),
            );
            agent.referral_code = referral_code_for(agent.agent_id);
            match parent {
                Some(parent_id) => Ok(self.hierarchy.attach_new(parent_id, agent).await?.0),
                None => {
                    agent.version = 1;
                    self.ctx
                        .store
                        .commit(
                            WriteSet::new()
                                .put(Write::Agent(agent.clone()))
                                .guard(Guard::AccountRefFree(agent.account_ref.clone()))
                                .guard(Guard::ReferralCodeFree(agent.referral_code.clone())),
                        )
                        .await?;
                    Ok(agent)
                }
            }
        })
        .await?;

        info!(
            agent_id = %agent.agent_id,
            account = %agent.account_ref,
            referral_code = %agent.referral_code,
            upline = ?agent.parent_agent_id,
            "agent registered"
        );
        if let Some(parent_id) = parent {
            self.levels.maybe_upgrade(parent_id).await?;
        }
        Ok(agent)
    }

    /// Opens the payment for a checkout. The attributed agent, if any, must
    /// exist.
    pub async fn create_order_payment(
        &self,
        order: OrderRef,
        quote_amount: Decimal,
        quote_currency: &str,
    ) -> Result<PaymentRequest> {
        if let Some(agent_id) = order.agent_id {
            self.ctx.require_agent(agent_id).await?;
        }
        self.payments
            .create_payment(order, quote_amount, quote_currency)
            .await
    }

    /// Reconciles a payment with the network and, once it is confirmed,
    /// credits the sale.
    ///
    /// Settlement is idempotent, so calling this again for a confirmed
    /// payment finishes any settlement that was interrupted.
    pub async fn confirm_transaction(
        &self,
        payment_id: PaymentId,
        tx_ref: &TxRef,
    ) -> Result<Reconciliation> {
        let outcome = self
            .payments
            .reconcile_confirmation(payment_id, tx_ref)
            .await?;
        if outcome.payment.status == PaymentStatus::Confirmed {
            self.settle_order(&outcome.payment).await?;
        }
        Ok(outcome)
    }

    async fn settle_order(&self, payment: &PaymentRequest) -> Result<()> {
        let Some(agent_id) = payment.order.agent_id else {
            return Ok(());
        };
        let order_id = payment.order_id();
        let user_id = payment.order.user_id.as_ref();

        let agent = self.ctx.require_agent(agent_id).await?;
        if !agent.is_active() {
            warn!(%agent_id, %order_id, status = %agent.status, "sale not credited to inactive agent");
            return Ok(());
        }
        self.commissions
            .compute_and_record(
                agent_id,
                order_id,
                user_id,
                payment.amount,
                CommissionType::DirectSale,
            )
            .await?;

        if let Some(parent_id) = agent.parent_agent_id {
            let parent = self.ctx.require_agent(parent_id).await?;
            if parent.is_active() {
                self.commissions
                    .compute_and_record(
                        parent_id,
                        order_id,
                        user_id,
                        payment.amount,
                        CommissionType::TeamSale,
                    )
                    .await?;
            }
            self.hierarchy.refresh_team(parent_id).await?;
            self.levels.maybe_upgrade(parent_id).await?;
        }
        self.levels.maybe_upgrade(agent_id).await?;
        Ok(())
    }

    /// Reverses every commission credited for the payment's order and marks
    /// the payment refunded, all in one commit.
    ///
    /// Every credited agent is locked and refolded before anything is
    /// written, so a refund that would drive one of them negative (an upline
    /// that already withdrew its share, say) fails with
    /// `InvariantViolation` and leaves the ledger untouched. Refunding an
    /// already refunded payment only refreshes the team aggregates.
    pub async fn refund_payment(&self, payment_id: PaymentId, reason: &str) -> Result<PaymentRequest> {
        let payment = self.payments.require(payment_id).await?;
        let entries = self
            .ctx
            .store
            .commissions_for_order(payment.order_id())
            .await?;
        let agents: Vec<AgentId> = entries.iter().map(|e| e.agent_id).collect();
        let uplines: BTreeSet<AgentId> = entries
            .iter()
            .filter(|e| e.r#type == CommissionType::TeamSale)
            .map(|e| e.agent_id)
            .collect();

        let refunded = {
            let _guards = self.ctx.locks.lock_many(&agents).await;
            retry_on_conflict(self.ctx.config.max_conflict_retries, move || {
                self.refund_locked(payment_id, reason)
            })
            .await?
        };

        // Team sales are a cache over the members' commission logs.
        for upline in uplines {
            self.hierarchy.refresh_team(upline).await?;
        }
        Ok(refunded)
    }

    async fn refund_locked(&self, payment_id: PaymentId, reason: &str) -> Result<PaymentRequest> {
        let mut payment = self.payments.require(payment_id).await?;
        if !payment.mark_refunded(reason, self.ctx.clock.now())? {
            return Ok(payment);
        }

        let entries = self
            .ctx
            .store
            .commissions_for_order(payment.order_id())
            .await?;
        let reversed: HashSet<CommissionId> = entries.iter().filter_map(|e| e.reverses).collect();
        let mut by_agent: BTreeMap<AgentId, Vec<CommissionEntry>> = BTreeMap::new();
        for entry in entries {
            if !entry.is_offset() && !reversed.contains(&entry.commission_id) {
                by_agent.entry(entry.agent_id).or_default().push(entry);
            }
        }

        let mut set = WriteSet::new();
        let mut reversed_total = Decimal::ZERO;
        for (agent_id, originals) in &by_agent {
            let (offsets, agent) = self
                .commissions
                .reversal_writes(*agent_id, originals)
                .await?;
            for original in originals {
                set = set.guard(Guard::NotReversed(original.commission_id));
            }
            for offset in offsets {
                reversed_total -= offset.amount;
                set = set.put(Write::Commission(offset));
            }
            set = set.put(Write::Agent(agent));
        }
        self.ctx
            .store
            .commit(set.put(Write::Payment(payment.clone())))
            .await?;

        info!(
            %payment_id,
            order_id = %payment.order_id(),
            %reason,
            agents = by_agent.len(),
            %reversed_total,
            "payment refunded and commissions reversed"
        );
        Ok(payment)
    }

    pub async fn request_withdrawal(
        &self,
        agent_id: AgentId,
        amount: Decimal,
        target_address: &str,
    ) -> Result<WithdrawalRequest> {
        self.withdrawals
            .request_withdrawal(agent_id, amount, target_address)
            .await
    }

    pub async fn settle_withdrawal(
        &self,
        withdrawal_id: WithdrawalId,
        status: WithdrawalStatus,
        external_tx_ref: Option<TxRef>,
    ) -> Result<WithdrawalRequest> {
        self.withdrawals
            .settle(withdrawal_id, status, external_tx_ref)
            .await
    }

    /// Activates, suspends or terminates an agent. Terminated agents stay
    /// terminated.
    pub async fn set_agent_status(&self, agent_id: AgentId, status: AgentStatus) -> Result<Agent> {
        let _guard = self.ctx.locks.lock(agent_id).await;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || async move {
            let mut agent = self.ctx.require_agent(agent_id).await?;
            if agent.status == status {
                return Ok(agent);
            }
            if !agent.status.can_transition_to(status) {
                return Err(LedgerError::InvalidTransition {
                    entity: "agent",
                    from: agent.status.to_string(),
                    to: status.to_string(),
                });
            }
            let from = agent.status;
            agent.status = status;
            agent.version += 1;
            self.ctx
                .store
                .commit(WriteSet::new().put(Write::Agent(agent.clone())))
                .await?;
            info!(%agent_id, %from, to = %status, "agent status changed");
            Ok(agent)
        })
        .await
    }

    pub async fn attribute_referral(&self, referral_code: &str, user_id: &UserId) -> Result<Referral> {
        self.referrals.attribute(referral_code, user_id).await
    }

    pub async fn confirm_referral(&self, user_id: &UserId, qualifying_amount: Decimal) -> Result<Referral> {
        self.referrals.confirm(user_id, qualifying_amount).await
    }

    /// Expires overdue payments as of the ledger clock.
    pub async fn sweep_expired(&self) -> Result<Vec<PaymentRequest>> {
        self.payments.sweep_expired(self.ctx.clock.now()).await
    }

    pub async fn agent_snapshot(&self, agent_id: AgentId) -> Result<AgentSnapshot> {
        let agent = self.ctx.require_agent(agent_id).await?;
        Ok(AgentSnapshot::from_agent(&agent, &self.ctx.config))
    }

    /// Every agent, in registration order.
    pub async fn all_agent_snapshots(&self) -> Result<Vec<AgentSnapshot>> {
        let mut agents = self.ctx.store.agents().await?;
        agents.sort_by_key(|a| (a.created_at, a.agent_id));
        Ok(agents
            .iter()
            .map(|a| AgentSnapshot::from_agent(a, &self.ctx.config))
            .collect())
    }

    pub async fn payment_snapshot(&self, payment_id: PaymentId) -> Result<PaymentSnapshot> {
        let payment = self.payments.require(payment_id).await?;
        Ok(PaymentSnapshot::from_payment(&payment, self.ctx.clock.now()))
    }

    pub async fn commission_history(&self, agent_id: AgentId) -> Result<Vec<CommissionEntry>> {
        self.commissions.entries_for(agent_id).await
    }

    pub async fn withdrawal_history(&self, agent_id: AgentId) -> Result<Vec<WithdrawalRequest>> {
        self.withdrawals.withdrawals_for(agent_id).await
    }

    pub async fn agent_by_account(&self, account_ref: &str) -> Result<Option<Agent>> {
        self.ctx.store.agent_by_account(account_ref).await
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.ctx.config
    }

    pub fn store(&self) -> &LedgerStoreRef {
        &self.ctx.store
    }

    pub fn payments(&self) -> &Arc<PaymentLedger> {
        &self.payments
    }

    pub fn commissions(&self) -> &CommissionEngine {
        &self.commissions
    }

    pub fn hierarchy(&self) -> &AgentHierarchy {
        &self.hierarchy
    }

    pub fn levels(&self) -> &LevelEngine {
        &self.levels
    }

    pub fn withdrawals(&self) -> &WithdrawalLedger {
        &self.withdrawals
    }

    pub fn referrals(&self) -> &ReferralBook {
        &self.referrals
    }
}

/// Eight uppercase hex characters from the random tail of the id.
fn referral_code_for(agent_id: AgentId) -> String {
    let hex = agent_id.0.simple().to_string();
    hex[hex.len() - 8..].to_ascii_uppercase()
}
