use super::agent::Agent;
use super::commission::{CommissionEntry, CommissionType};
use super::ids::{AgentId, CommissionId, OrderId, PaymentId, ReferralId, TxRef, UserId, WithdrawalId};
use super::level::LevelUpgrade;
use super::payment::{PaymentRequest, PaymentStatus};
use super::referral::Referral;
use super::team::TeamEdge;
use super::withdrawal::WithdrawalRequest;
use crate::error::{ExternalError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

/// A single record written by a commit.
///
/// Versioned records carry the version they will have *after* the commit;
/// the store accepts the write only if the stored version is exactly one
/// less (a missing record counts as version 0).
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Agent(Agent),
    Edge(TeamEdge),
    Commission(CommissionEntry),
    Payment(PaymentRequest),
    Withdrawal(WithdrawalRequest),
    Referral(Referral),
    LevelUpgrade(LevelUpgrade),
}

/// Conditions over the stored state checked atomically with the writes.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// No pending or processing payment exists for the order, other than
    /// the payments written by the same commit.
    NoActivePayment(OrderId),
    AccountRefFree(String),
    ReferralCodeFree(String),
    /// No offsetting entry exists for the commission.
    NotReversed(CommissionId),
    /// No entry of this type exists for the agent and order.
    NoCommission(AgentId, OrderId, CommissionType),
    NoReferralFor(UserId),
    /// `child` is neither `parent` nor anywhere on `parent`'s upline.
    NoCycle { parent: AgentId, child: AgentId },
}

/// An atomic unit of work: every write lands or none does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSet {
    pub writes: Vec<Write>,
    pub guards: Vec<Guard>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, write: Write) -> Self {
        self.writes.push(write);
        self
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Durable storage of every ledger entity.
///
/// All mutation goes through [`LedgerStore::commit`]. Implementations must
/// apply a `WriteSet` atomically and reject it with
/// [`crate::error::LedgerError::Conflict`] if any version check or guard
/// fails.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn commit(&self, set: WriteSet) -> Result<()>;

    async fn agent(&self, agent_id: AgentId) -> Result<Option<Agent>>;
    async fn agent_by_account(&self, account_ref: &str) -> Result<Option<Agent>>;
    async fn agent_by_referral_code(&self, code: &str) -> Result<Option<Agent>>;
    async fn agents(&self) -> Result<Vec<Agent>>;

    async fn edge(&self, agent_id: AgentId, member_id: AgentId) -> Result<Option<TeamEdge>>;
    /// Every edge, active or removed, under `agent_id`.
    async fn edges_of(&self, agent_id: AgentId) -> Result<Vec<TeamEdge>>;

    async fn commission(&self, commission_id: CommissionId) -> Result<Option<CommissionEntry>>;
    async fn commissions_for_agent(&self, agent_id: AgentId) -> Result<Vec<CommissionEntry>>;
    async fn commissions_for_order(&self, order_id: &OrderId) -> Result<Vec<CommissionEntry>>;

    async fn payment(&self, payment_id: PaymentId) -> Result<Option<PaymentRequest>>;
    async fn payments_for_order(&self, order_id: &OrderId) -> Result<Vec<PaymentRequest>>;
    async fn payments_with_status(&self, status: PaymentStatus) -> Result<Vec<PaymentRequest>>;

    async fn withdrawal(&self, withdrawal_id: WithdrawalId) -> Result<Option<WithdrawalRequest>>;
    async fn withdrawals_for_agent(&self, agent_id: AgentId) -> Result<Vec<WithdrawalRequest>>;

    async fn referral(&self, referral_id: ReferralId) -> Result<Option<Referral>>;
    async fn referral_for_user(&self, user_id: &UserId) -> Result<Option<Referral>>;
    async fn referrals_for_agent(&self, agent_id: AgentId) -> Result<Vec<Referral>>;

    async fn level_upgrades(&self, agent_id: AgentId) -> Result<Vec<LevelUpgrade>>;
}

/// What the settlement network reports about a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TxObservation {
    pub tx_ref: TxRef,
    pub confirmations: u32,
    pub amount: Decimal,
    pub from: String,
    pub to: String,
    /// `false` when the network rejected or reverted the transaction.
    pub valid: bool,
}

/// Read access to the settlement network.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// `Ok(None)` when the transaction is not (yet) known to the network.
    async fn confirmation_depth(
        &self,
        tx_ref: &TxRef,
    ) -> std::result::Result<Option<TxObservation>, ExternalError>;
}

#[async_trait]
pub trait ExchangeRateProvider: Send + Sync {
    async fn convert(
        &self,
        amount: Decimal,
        from_currency: &str,
        to_currency: &str,
    ) -> std::result::Result<Decimal, ExternalError>;
}

/// Hands out the deposit address a payment must be sent to.
#[async_trait]
pub trait AddressAllocator: Send + Sync {
    async fn allocate(&self, order_id: &OrderId) -> std::result::Result<String, ExternalError>;
}

/// The order-management collaborator, told when an order's payment expires.
#[async_trait]
pub trait OrderCanceller: Send + Sync {
    async fn cancel_order(
        &self,
        order_id: &OrderId,
        reason: &str,
    ) -> std::result::Result<(), ExternalError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;
pub type LedgerClientRef = Arc<dyn LedgerClient>;
pub type ExchangeRateProviderRef = Arc<dyn ExchangeRateProvider>;
pub type AddressAllocatorRef = Arc<dyn AddressAllocator>;
pub type OrderCancellerRef = Arc<dyn OrderCanceller>;
pub type ClockRef = Arc<dyn Clock>;
