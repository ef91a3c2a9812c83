use super::{CommitView, in_upline, validate_write_set};
use crate::domain::agent::Agent;
use crate::domain::commission::CommissionEntry;
use crate::domain::ids::{AgentId, CommissionId, OrderId, PaymentId, ReferralId, UserId, WithdrawalId};
use crate::domain::level::LevelUpgrade;
use crate::domain::payment::{PaymentRequest, PaymentStatus};
use crate::domain::ports::{Guard, LedgerStore, Write, WriteSet};
use crate::domain::referral::Referral;
use crate::domain::team::TeamEdge;
use crate::domain::withdrawal::WithdrawalRequest;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    agents: HashMap<AgentId, Agent>,
    edges: HashMap<(AgentId, AgentId), TeamEdge>,
    commissions: HashMap<CommissionId, CommissionEntry>,
    payments: HashMap<PaymentId, PaymentRequest>,
    withdrawals: HashMap<WithdrawalId, WithdrawalRequest>,
    referrals: HashMap<ReferralId, Referral>,
    level_upgrades: Vec<LevelUpgrade>,
}

impl Tables {
    fn apply(&mut self, set: WriteSet) {
        for write in set.writes {
            match write {
                Write::Agent(a) => {
                    self.agents.insert(a.agent_id, a);
                }
                Write::Edge(e) => {
                    self.edges.insert((e.agent_id, e.member_id), e);
                }
                Write::Commission(c) => {
                    self.commissions.insert(c.commission_id, c);
                }
                Write::Payment(p) => {
                    self.payments.insert(p.payment_id, p);
                }
                Write::Withdrawal(w) => {
                    self.withdrawals.insert(w.withdrawal_id, w);
                }
                Write::Referral(r) => {
                    self.referrals.insert(r.referral_id, r);
                }
                Write::LevelUpgrade(u) => self.level_upgrades.push(u),
            }
        }
    }
}

impl CommitView for Tables {
    fn stored_version(&self, write: &Write) -> Result<u64> {
        let version = match write {
            Write::Agent(a) => self.agents.get(&a.agent_id).map(|s| s.version),
            Write::Edge(e) => self.edges.get(&(e.agent_id, e.member_id)).map(|s| s.version),
            Write::Commission(c) => self.commissions.get(&c.commission_id).map(|s| s.version),
            Write::Payment(p) => self.payments.get(&p.payment_id).map(|s| s.version),
            Write::Withdrawal(w) => self.withdrawals.get(&w.withdrawal_id).map(|s| s.version),
            Write::Referral(r) => self.referrals.get(&r.referral_id).map(|s| s.version),
            Write::LevelUpgrade(_) => None,
        };
        Ok(version.unwrap_or(0))
    }

    fn guard_holds(&self, guard: &Guard, set: &WriteSet) -> Result<bool> {
        let holds = match guard {
            Guard::NoActivePayment(order_id) => {
                let written: Vec<PaymentId> = set
                    .writes
                    .iter()
                    .filter_map(|w| match w {
                        Write::Payment(p) => Some(p.payment_id),
                        _ => None,
                    })
                    .collect();
                !self.payments.values().any(|p| {
                    p.order_id() == order_id
                        && p.status.is_active()
                        && !written.contains(&p.payment_id)
                })
            }
            Guard::AccountRefFree(account) => {
                !self.agents.values().any(|a| &a.account_ref == account)
            }
            Guard::ReferralCodeFree(code) => {
                !self.agents.values().any(|a| &a.referral_code == code)
            }
            Guard::NotReversed(id) => !self
                .commissions
                .values()
                .any(|c| c.reverses.as_ref() == Some(id)),
            Guard::NoCommission(agent_id, order_id, r#type) => {
                !self.commissions.values().any(|c| {
                    c.agent_id == *agent_id
                        && &c.order_id == order_id
                        && c.r#type == *r#type
                        && !c.is_offset()
                })
            }
            Guard::NoReferralFor(user_id) => !self
                .referrals
                .values()
                .any(|r| &r.referred_user_id == user_id),
            Guard::NoCycle { parent, child } => !in_upline(*parent, *child, |id| {
                Ok(self.agents.get(&id).and_then(|a| a.parent_agent_id))
            })?,
        };
        Ok(holds)
    }
}

/// A thread-safe in-memory ledger store.
///
/// All tables sit behind one `tokio::sync::RwLock`, so a commit validates
/// and applies its write set while holding the write lock.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn commit(&self, set: WriteSet) -> Result<()> {
        let mut tables = self.tables.write().await;
        validate_write_set(&*tables, &set)?;
        tables.apply(set);
        Ok(())
    }

    async fn agent(&self, agent_id: AgentId) -> Result<Option<Agent>> {
        let tables = self.tables.read().await;
        Ok(tables.agents.get(&agent_id).cloned())
    }

    async fn agent_by_account(&self, account_ref: &str) -> Result<Option<Agent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .agents
            .values()
            .find(|a| a.account_ref == account_ref)
            .cloned())
    }

    async fn agent_by_referral_code(&self, code: &str) -> Result<Option<Agent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .agents
            .values()
            .find(|a| a.referral_code == code)
            .cloned())
    }

    async fn agents(&self) -> Result<Vec<Agent>> {
        let tables = self.tables.read().await;
        Ok(sorted_by(tables.agents.values().cloned().collect(), |a| a.agent_id))
    }

    async fn edge(&self, agent_id: AgentId, member_id: AgentId) -> Result<Option<TeamEdge>> {
        let tables = self.tables.read().await;
        Ok(tables.edges.get(&(agent_id, member_id)).cloned())
    }

    async fn edges_of(&self, agent_id: AgentId) -> Result<Vec<TeamEdge>> {
        let tables = self.tables.read().await;
        let edges = tables
            .edges
            .values()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect();
        Ok(sorted_by(edges, |e| e.member_id))
    }

    async fn commission(&self, commission_id: CommissionId) -> Result<Option<CommissionEntry>> {
        let tables = self.tables.read().await;
        Ok(tables.commissions.get(&commission_id).cloned())
    }

    async fn commissions_for_agent(&self, agent_id: AgentId) -> Result<Vec<CommissionEntry>> {
        let tables = self.tables.read().await;
        let entries = tables
            .commissions
            .values()
            .filter(|c| c.agent_id == agent_id)
            .cloned()
            .collect();
        Ok(sorted_by(entries, |c| c.commission_id))
    }

    async fn commissions_for_order(&self, order_id: &OrderId) -> Result<Vec<CommissionEntry>> {
        let tables = self.tables.read().await;
        let entries = tables
            .commissions
            .values()
            .filter(|c| &c.order_id == order_id)
            .cloned()
            .collect();
        Ok(sorted_by(entries, |c| c.commission_id))
    }

    async fn payment(&self, payment_id: PaymentId) -> Result<Option<PaymentRequest>> {
        let tables = self.tables.read().await;
        Ok(tables.payments.get(&payment_id).cloned())
    }

    async fn payments_for_order(&self, order_id: &OrderId) -> Result<Vec<PaymentRequest>> {
        let tables = self.tables.read().await;
        let payments = tables
            .payments
            .values()
            .filter(|p| p.order_id() == order_id)
            .cloned()
            .collect();
        Ok(sorted_by(payments, |p| p.payment_id))
    }

    async fn payments_with_status(&self, status: PaymentStatus) -> Result<Vec<PaymentRequest>> {
        let tables = self.tables.read().await;
        let payments = tables
            .payments
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        Ok(sorted_by(payments, |p| p.payment_id))
    }

    async fn withdrawal(&self, withdrawal_id: WithdrawalId) -> Result<Option<WithdrawalRequest>> {
        let tables = self.tables.read().await;
        Ok(tables.withdrawals.get(&withdrawal_id).cloned())
    }

    async fn withdrawals_for_agent(&self, agent_id: AgentId) -> Result<Vec<WithdrawalRequest>> {
        let tables = self.tables.read().await;
        let withdrawals = tables
            .withdrawals
            .values()
            .filter(|w| w.agent_id == agent_id)
            .cloned()
            .collect();
        Ok(sorted_by(withdrawals, |w| w.withdrawal_id))
    }

    async fn referral(&self, referral_id: ReferralId) -> Result<Option<Referral>> {
        let tables = self.tables.read().await;
        Ok(tables.referrals.get(&referral_id).cloned())
    }

    async fn referral_for_user(&self, user_id: &UserId) -> Result<Option<Referral>> {
        let tables = self.tables.read().await;
        Ok(tables
            .referrals
            .values()
            .find(|r| &r.referred_user_id == user_id)
            .cloned())
    }

    async fn referrals_for_agent(&self, agent_id: AgentId) -> Result<Vec<Referral>> {
        let tables = self.tables.read().await;
        let referrals = tables
            .referrals
            .values()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect();
        Ok(sorted_by(referrals, |r| r.referral_id))
    }

    async fn level_upgrades(&self, agent_id: AgentId) -> Result<Vec<LevelUpgrade>> {
        let tables = self.tables.read().await;
        Ok(tables
            .level_upgrades
            .iter()
            .filter(|u| u.agent_id == agent_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentStatus;
    use crate::error::LedgerError;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn agent(account: &str, code: &str) -> Agent {
        let mut agent = Agent::new(account, code, 1, dec!(5), AgentStatus::Active, Utc::now());
        agent.version = 1;
        agent
    }

    #[tokio::test]
    async fn test_commit_and_read_agent() {
        let store = InMemoryLedgerStore::new();
        let agent = agent("acct-1", "AAAA1111");

        store
            .commit(WriteSet::new().put(Write::Agent(agent.clone())))
            .await
            .unwrap();

        assert_eq!(store.agent(agent.agent_id).await.unwrap(), Some(agent.clone()));
        assert_eq!(
            store.agent_by_account("acct-1").await.unwrap(),
            Some(agent.clone())
        );
        assert_eq!(
            store.agent_by_referral_code("AAAA1111").await.unwrap(),
            Some(agent)
        );
        assert!(store.agent_by_account("acct-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let mut agent = agent("acct-1", "AAAA1111");
        store
            .commit(WriteSet::new().put(Write::Agent(agent.clone())))
            .await
            .unwrap();

        // Two writers both read version 1 and try to write version 2.
        agent.version = 2;
        agent.available_commission = dec!(10);
        store
            .commit(WriteSet::new().put(Write::Agent(agent.clone())))
            .await
            .unwrap();

        agent.available_commission = dec!(20);
        let err = store
            .commit(WriteSet::new().put(Write::Agent(agent.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));

        let stored = store.agent(agent.agent_id).await.unwrap().unwrap();
        assert_eq!(stored.available_commission, dec!(10));
    }

    #[tokio::test]
    async fn test_failed_guard_writes_nothing() {
        let store = InMemoryLedgerStore::new();
        let first = agent("acct-1", "AAAA1111");
        store
            .commit(WriteSet::new().put(Write::Agent(first)))
            .await
            .unwrap();

        let second = agent("acct-2", "AAAA1111");
        let err = store
            .commit(
                WriteSet::new()
                    .put(Write::Agent(second.clone()))
                    .guard(Guard::ReferralCodeFree("AAAA1111".into())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
        assert!(store.agent(second.agent_id).await.unwrap().is_none());
    }
}
