use super::ids::{AgentId, TxRef, WithdrawalId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WithdrawalStatus {
    pub fn can_transition_to(self, next: WithdrawalStatus) -> bool {
        use WithdrawalStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Completed) | (Pending, Failed) | (Processing, Failed)
        )
    }

    /// Whether the reserved amount is still held against the balance.
    pub fn holds_funds(self) -> bool {
        self != Self::Failed
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for WithdrawalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown withdrawal status '{other}'")),
        }
    }
}

/// Payout of commission to an external address. `amount` is reserved from
/// the agent's available balance when the request is created.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct WithdrawalRequest {
    pub withdrawal_id: WithdrawalId,
    pub agent_id: AgentId,
    pub amount: Decimal,
    pub fee: Decimal,
    pub net_amount: Decimal,
    pub target_address: String,
    pub status: WithdrawalStatus,
    pub external_tx_ref: Option<TxRef>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub version: u64,
}
