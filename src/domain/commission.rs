use super::ids::{AgentId, CommissionId, OrderId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum CommissionType {
    DirectSale,
    TeamSale,
    ReferralBonus,
    LevelBonus,
}

impl fmt::Display for CommissionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DirectSale => "direct_sale",
            Self::TeamSale => "team_sale",
            Self::ReferralBonus => "referral_bonus",
            Self::LevelBonus => "level_bonus",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CommissionStatus {
    Pending,
    Earned,
    Paid,
}

impl CommissionStatus {
    /// Entries only move forward: pending -> earned -> paid.
    pub fn can_advance_to(self, next: CommissionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Earned) | (Self::Earned, Self::Paid)
        )
    }

    /// Whether an entry in this status counts towards the agent's balance.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Earned | Self::Paid)
    }
}

impl fmt::Display for CommissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Earned => "earned",
            Self::Paid => "paid",
        };
        f.write_str(s)
    }
}

/// Append-only record crediting an agent for a share of an order.
///
/// Only `status` changes after creation. A refund is recorded as a second
/// entry with a negated amount whose `reverses` points at the original.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct CommissionEntry {
    pub commission_id: CommissionId,
    pub agent_id: AgentId,
    pub order_id: OrderId,
    pub user_id: Option<UserId>,
    pub order_amount: Decimal,
    /// Percentage, e.g. `5` for 5%.
    pub rate: Decimal,
    pub amount: Decimal,
    pub r#type: CommissionType,
    pub status: CommissionStatus,
    pub reverses: Option<CommissionId>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl CommissionEntry {
    pub fn is_offset(&self) -> bool {
        self.reverses.is_some()
    }

    /// Builds the offsetting entry cancelling `self`.
    pub fn offset(&self, now: DateTime<Utc>) -> Self {
        Self {
            commission_id: CommissionId::new(),
            agent_id: self.agent_id,
            order_id: self.order_id.clone(),
            user_id: self.user_id.clone(),
            order_amount: -self.order_amount,
            rate: self.rate,
            amount: -self.amount,
            r#type: self.r#type,
            status: self.status,
            reverses: Some(self.commission_id),
            created_at: now,
            version: 1,
        }
    }
}
