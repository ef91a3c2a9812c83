use super::ids::AgentId;
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Active,
    Suspended,
    Terminated,
}

impl AgentStatus {
    /// Terminated agents are never reactivated.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        match (self, next) {
            (Self::Terminated, _) => false,
            (from, to) => from != to,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// An agent in the referral hierarchy together with its commission
/// aggregates.
///
/// The aggregates are caches of values that can always be re-derived from
/// the commission log, the withdrawal log and the team edges.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Agent {
    pub agent_id: AgentId,
    /// Reference to the external account (bot user, web account) owning
    /// this agent. Unique.
    pub account_ref: String,
    pub status: AgentStatus,
    pub level: u32,
    /// Immediate upline. Weak reference, no ownership.
    pub parent_agent_id: Option<AgentId>,
    pub referral_code: String,
    /// Percentage applied to direct sales, derived from `level`.
    pub commission_rate: Decimal,
    pub total_sales: Decimal,
    pub total_commission: Decimal,
    pub available_commission: Decimal,
    pub team_size: u32,
    pub team_sales: Decimal,
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped on every committed write.
    pub version: u64,
}

impl Agent {
    pub fn new(
        account_ref: impl Into<String>,
        referral_code: impl Into<String>,
        level: u32,
        commission_rate: Decimal,
        status: AgentStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent_id: AgentId::new(),
            account_ref: account_ref.into(),
            status,
            level,
            parent_agent_id: None,
            referral_code: referral_code.into(),
            commission_rate,
            total_sales: Decimal::ZERO,
            total_commission: Decimal::ZERO,
            available_commission: Decimal::ZERO,
            team_size: 0,
            team_sales: Decimal::ZERO,
            created_at: now,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    /// Reserves `amount` of the available commission.
    pub fn debit_available(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        if self.available_commission < amount {
            return Err(LedgerError::InsufficientBalance {
                needed: amount,
                available: self.available_commission,
            });
        }
        self.available_commission -= amount;
        Ok(())
    }

    /// Returns a previously reserved amount.
    pub fn credit_available(&mut self, amount: Decimal) -> Result<(), LedgerError> {
        let credited = self.available_commission + amount;
        if credited > self.total_commission {
            return Err(LedgerError::InvariantViolation(format!(
                "crediting {amount} to agent {} would exceed total commission {}",
                self.agent_id, self.total_commission
            )));
        }
        self.available_commission = credited;
        Ok(())
    }

    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        if self.available_commission < Decimal::ZERO {
            return Err(LedgerError::InvariantViolation(format!(
                "agent {} available commission is negative ({})",
                self.agent_id, self.available_commission
            )));
        }
        if self.available_commission > self.total_commission {
            return Err(LedgerError::InvariantViolation(format!(
                "agent {} available commission {} exceeds total {}",
                self.agent_id, self.available_commission, self.total_commission
            )));
        }
        Ok(())
    }
}
