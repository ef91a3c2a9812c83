use super::LedgerContext;
use super::commission_engine::CommissionEngine;
use super::retry::retry_on_conflict;
use crate::domain::commission::CommissionType;
use crate::domain::ids::{AgentId, OrderId, UserId};
use crate::domain::ports::{Guard, Write, WriteSet};
use crate::domain::referral::{Referral, ReferralStatus};
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use tracing::info;

/// Attribution of users to the agent whose referral code they signed up
/// with, and the one-off bonus paid when they first qualify.
#[derive(Clone)]
pub struct ReferralBook {
    ctx: LedgerContext,
    commissions: CommissionEngine,
}

impl ReferralBook {
    pub fn new(ctx: LedgerContext, commissions: CommissionEngine) -> Self {
        Self { ctx, commissions }
    }

    /// Links `user_id` to the agent owning `referral_code`. A user can be
    /// attributed once; repeating the same attribution returns it.
    pub async fn attribute(&self, referral_code: &str, user_id: &UserId) -> Result<Referral> {
        let code = referral_code.trim().to_ascii_uppercase();
        let agent = self
            .ctx
            .store
            .agent_by_referral_code(&code)
            .await?
            .ok_or_else(|| LedgerError::not_found("referral code", &code))?;
        if !agent.is_active() {
            return Err(LedgerError::ValidationError(format!(
                "agent {} is {} and cannot refer users",
                agent.agent_id, agent.status
            )));
        }

        if let Some(existing) = self.ctx.store.referral_for_user(user_id).await? {
            if existing.agent_id == agent.agent_id {
                return Ok(existing);
            }
            return Err(LedgerError::Conflict(format!(
                "user {user_id} is already referred by agent {}",
                existing.agent_id
            )));
        }

        let mut referral = Referral::new(agent.agent_id, user_id.clone(), code, self.ctx.clock.now());
        referral.version = 1;
        self.ctx
            .store
            .commit(
                WriteSet::new()
                    .put(Write::Referral(referral.clone()))
                    .guard(Guard::NoReferralFor(user_id.clone())),
            )
            .await?;
        info!(agent_id = %agent.agent_id, %user_id, "referral attributed");
        Ok(referral)
    }

    /// Pays the referral bonus on `qualifying_amount` and marks the
    /// referral confirmed. Safe to repeat: the bonus entry is recorded once
    /// per user.
    pub async fn confirm(&self, user_id: &UserId, qualifying_amount: Decimal) -> Result<Referral> {
        let referral = self.require_for_user(user_id).await?;
        if referral.status == ReferralStatus::Confirmed {
            return Ok(referral);
        }

        let order_id = OrderId::from(format!("referral:{user_id}"));
        let bonus = self
            .commissions
            .compute_and_record(
                referral.agent_id,
                &order_id,
                Some(user_id),
                qualifying_amount,
                CommissionType::ReferralBonus,
            )
            .await?;

        let bonus = &bonus;
        let confirmed = retry_on_conflict(self.ctx.config.max_conflict_retries, move || async move {
            let mut referral = self.require_for_user(user_id).await?;
            if referral.status == ReferralStatus::Confirmed {
                return Ok(referral);
            }
            referral.status = ReferralStatus::Confirmed;
            referral.bonus_amount = bonus.amount;
            referral.bonus_paid = true;
            referral.confirmed_at = Some(self.ctx.clock.now());
            referral.version += 1;
            self.ctx
                .store
                .commit(WriteSet::new().put(Write::Referral(referral.clone())))
                .await?;
            Ok(referral)
        })
        .await?;

        info!(
            agent_id = %confirmed.agent_id,
            %user_id,
            bonus = %confirmed.bonus_amount,
            "referral confirmed"
        );
        Ok(confirmed)
    }

    pub async fn referrals_of(&self, agent_id: AgentId) -> Result<Vec<Referral>> {
        let mut referrals = self.ctx.store.referrals_for_agent(agent_id).await?;
        referrals.sort_by_key(|r| (r.created_at, r.referral_id));
        Ok(referrals)
    }

    async fn require_for_user(&self, user_id: &UserId) -> Result<Referral> {
        self.ctx
            .store
            .referral_for_user(user_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("referral", user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::domain::agent::{Agent, AgentStatus};
    use crate::domain::ports::{LedgerStoreRef, SystemClock};
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn book_with_agents() -> (ReferralBook, AgentId, AgentId) {
        let store: LedgerStoreRef = Arc::new(InMemoryLedgerStore::new());
        let ctx = LedgerContext::new(store, Arc::new(SystemClock), LedgerConfig::default());
        let mut ids = Vec::new();
        for (account, code) in [("a", "CODEA"), ("b", "CODEB")] {
            let mut agent = Agent::new(account, code, 1, dec!(5), AgentStatus::Active, Utc::now());
            agent.version = 1;
            ids.push(agent.agent_id);
            ctx.store
                .commit(WriteSet::new().put(Write::Agent(agent)))
                .await
                .unwrap();
        }
        let book = ReferralBook::new(ctx.clone(), CommissionEngine::new(ctx));
        (book, ids[0], ids[1])
    }

    #[tokio::test]
    async fn test_attribute_once_per_user() {
        let (book, a, _) = book_with_agents().await;
        let user = UserId::from("u-1");

        let referral = book.attribute("codea", &user).await.unwrap();
        assert_eq!(referral.agent_id, a);
        assert_eq!(referral.status, ReferralStatus::Pending);

        let again = book.attribute("CODEA", &user).await.unwrap();
        assert_eq!(again, referral);

        assert!(matches!(
            book.attribute("CODEB", &user).await,
            Err(LedgerError::Conflict(_))
        ));
        assert!(matches!(
            book.attribute("NOPE", &UserId::from("u-2")).await,
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_confirm_pays_bonus_once() {
        let (book, a, _) = book_with_agents().await;
        let user = UserId::from("u-1");
        book.attribute("CODEA", &user).await.unwrap();

        let confirmed = book.confirm(&user, dec!(200)).await.unwrap();
        assert_eq!(confirmed.status, ReferralStatus::Confirmed);
        assert!(confirmed.bonus_paid);
        // Default referral bonus rate is 5%.
        assert_eq!(confirmed.bonus_amount, dec!(10));

        let again = book.confirm(&user, dec!(200)).await.unwrap();
        assert_eq!(again, confirmed);

        let agent = book.ctx.require_agent(a).await.unwrap();
        assert_eq!(agent.total_commission, dec!(10));
        assert_eq!(agent.total_sales, dec!(0));
        assert_eq!(book.referrals_of(a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_confirm_unknown_user() {
        let (book, _, _) = book_with_agents().await;
        assert!(matches!(
            book.confirm(&UserId::from("ghost"), dec!(10)).await,
            Err(LedgerError::NotFound { .. })
        ));
    }
}
