use super::LedgerContext;
use super::retry::retry_on_conflict;
use crate::domain::ids::{AgentId, TxRef, WithdrawalId};
use crate::domain::money::round_to_unit;
use crate::domain::ports::{Write, WriteSet};
use crate::domain::withdrawal::{WithdrawalRequest, WithdrawalStatus};
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use tracing::info;

/// Payouts of available commission.
#[derive(Clone)]
pub struct WithdrawalLedger {
    ctx: LedgerContext,
}

impl WithdrawalLedger {
    pub fn new(ctx: LedgerContext) -> Self {
        Self { ctx }
    }

    /// Reserves `amount` from the agent's available commission and records
    /// the request. The debit and the request land in the same commit.
    pub async fn request_withdrawal(
        &self,
        agent_id: AgentId,
        amount: Decimal,
        target_address: &str,
    ) -> Result<WithdrawalRequest> {
        let config = &self.ctx.config;
        if amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount {
                amount,
                reason: "withdrawal amount must be positive".to_string(),
            });
        }
        if amount < config.min_withdrawal || amount > config.max_withdrawal {
            return Err(LedgerError::InvalidAmount {
                amount,
                reason: format!(
                    "withdrawal must be between {} and {}",
                    config.min_withdrawal, config.max_withdrawal
                ),
            });
        }
        let target_address = target_address.trim();
        if target_address.is_empty() {
            return Err(LedgerError::ValidationError(
                "withdrawal target address is empty".into(),
            ));
        }

        let _guard = self.ctx.locks.lock(agent_id).await;
        retry_on_conflict(config.max_conflict_retries, move || {
            self.request_locked(agent_id, amount, target_address)
        })
        .await
    }

    async fn request_locked(
        &self,
        agent_id: AgentId,
        amount: Decimal,
        target_address: &str,
    ) -> Result<WithdrawalRequest> {
        let mut agent = self.ctx.require_agent(agent_id).await?;
        if !agent.is_active() {
            return Err(LedgerError::ValidationError(format!(
                "agent {agent_id} is {} and cannot withdraw",
                agent.status
            )));
        }
        agent.debit_available(amount)?;
        agent.version += 1;

        let config = &self.ctx.config;
        let fee = round_to_unit(amount * config.withdrawal_fee_rate, config.token_decimals);
        let request = WithdrawalRequest {
            withdrawal_id: WithdrawalId::new(),
            agent_id,
            amount,
            fee,
            net_amount: amount - fee,
            target_address: target_address.to_string(),
            status: WithdrawalStatus::Pending,
            external_tx_ref: None,
            created_at: self.ctx.clock.now(),
            settled_at: None,
            version: 1,
        };

        self.ctx
            .store
            .commit(
                WriteSet::new()
                    .put(Write::Withdrawal(request.clone()))
                    .put(Write::Agent(agent.clone())),
            )
            .await?;
        info!(
            %agent_id,
            withdrawal_id = %request.withdrawal_id,
            %amount,
            %fee,
            available = %agent.available_commission,
            "withdrawal requested"
        );
        Ok(request)
    }

    /// Moves a withdrawal along its lifecycle. A failed payout returns the
    /// reserved amount to the agent in the same commit. Settling to the
    /// status it already has is a no-op.
    pub async fn settle(
        &self,
        withdrawal_id: WithdrawalId,
        status: WithdrawalStatus,
        external_tx_ref: Option<TxRef>,
    ) -> Result<WithdrawalRequest> {
        let agent_id = self.require(withdrawal_id).await?.agent_id;
        let _guard = self.ctx.locks.lock(agent_id).await;
        let external_tx_ref = &external_tx_ref;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || {
            self.settle_locked(withdrawal_id, status, external_tx_ref)
        })
        .await
    }

    async fn settle_locked(
        &self,
        withdrawal_id: WithdrawalId,
        status: WithdrawalStatus,
        external_tx_ref: &Option<TxRef>,
    ) -> Result<WithdrawalRequest> {
        let mut request = self.require(withdrawal_id).await?;
        if request.status == status {
            return Ok(request);
        }
        if !request.status.can_transition_to(status) {
            return Err(LedgerError::InvalidTransition {
                entity: "withdrawal",
                from: request.status.to_string(),
                to: status.to_string(),
            });
        }

        let from = request.status;
        request.status = status;
        if let Some(tx_ref) = external_tx_ref {
            request.external_tx_ref = Some(tx_ref.clone());
        }
        if matches!(status, WithdrawalStatus::Completed | WithdrawalStatus::Failed) {
            request.settled_at = Some(self.ctx.clock.now());
        }
        request.version += 1;

        let mut writes = WriteSet::new().put(Write::Withdrawal(request.clone()));
        if status == WithdrawalStatus::Failed {
            let mut agent = self.ctx.require_agent(request.agent_id).await?;
            agent.credit_available(request.amount)?;
            agent.version += 1;
            writes = writes.put(Write::Agent(agent));
        }
        self.ctx.store.commit(writes).await?;

        info!(
            agent_id = %request.agent_id,
            %withdrawal_id,
            %from,
            to = %status,
            "withdrawal settled"
        );
        Ok(request)
    }

    /// Withdrawal history of an agent, oldest first.
    pub async fn withdrawals_for(&self, agent_id: AgentId) -> Result<Vec<WithdrawalRequest>> {
        let mut withdrawals = self.ctx.store.withdrawals_for_agent(agent_id).await?;
        withdrawals.sort_by_key(|w| (w.created_at, w.withdrawal_id));
        Ok(withdrawals)
    }

    pub async fn withdrawal(&self, withdrawal_id: WithdrawalId) -> Result<Option<WithdrawalRequest>> {
        self.ctx.store.withdrawal(withdrawal_id).await
    }

    async fn require(&self, withdrawal_id: WithdrawalId) -> Result<WithdrawalRequest> {
        self.ctx
            .store
            .withdrawal(withdrawal_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("withdrawal", withdrawal_id))
    }
}
