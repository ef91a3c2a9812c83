use crate::config::LedgerConfig;
use crate::domain::agent::{Agent, AgentStatus};
use crate::domain::ids::{AgentId, OrderId, PaymentId};
use crate::domain::payment::{PaymentRequest, PaymentStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Serialize, Serializer};

fn serialize_decimal<S>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.normalize().to_string())
}

/// Agent state as shown to the agent portal and written by the CLI.
#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct AgentSnapshot {
    pub account: String,
    pub status: AgentStatus,
    pub level: u32,
    pub level_name: String,
    #[serde(serialize_with = "serialize_decimal")]
    pub commission_rate: Decimal,
    #[serde(serialize_with = "serialize_decimal")]
    pub total_sales: Decimal,
    #[serde(serialize_with = "serialize_decimal")]
    pub total_commission: Decimal,
    #[serde(serialize_with = "serialize_decimal")]
    pub available_commission: Decimal,
    pub team_size: u32,
    #[serde(serialize_with = "serialize_decimal")]
    pub team_sales: Decimal,
    pub referral_code: String,
    pub agent_id: AgentId,
}

impl AgentSnapshot {
    pub fn from_agent(agent: &Agent, config: &LedgerConfig) -> Self {
        let level_name = config
            .tier(agent.level)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| format!("Level {}", agent.level));
        Self {
            agent_id: agent.agent_id,
            account: agent.account_ref.clone(),
            status: agent.status,
            level: agent.level,
            level_name,
            referral_code: agent.referral_code.clone(),
            commission_rate: agent.commission_rate,
            total_sales: agent.total_sales,
            total_commission: agent.total_commission,
            available_commission: agent.available_commission,
            team_size: agent.team_size,
            team_sales: agent.team_sales,
        }
    }
}

/// What the checkout page polls while waiting for confirmations.
#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct PaymentSnapshot {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub status: PaymentStatus,
    #[serde(serialize_with = "serialize_decimal")]
    pub amount: Decimal,
    pub settlement_token: String,
    pub target_address: String,
    pub confirmations: u32,
    pub required_confirmations: u32,
    pub seconds_remaining: i64,
}

impl PaymentSnapshot {
    pub fn from_payment(payment: &PaymentRequest, now: DateTime<Utc>) -> Self {
        Self {
            payment_id: payment.payment_id,
            order_id: payment.order_id().clone(),
            status: payment.status,
            amount: payment.amount,
            settlement_token: payment.settlement_token.clone(),
            target_address: payment.target_address.clone(),
            confirmations: payment.confirmations,
            required_confirmations: payment.required_confirmations,
            seconds_remaining: payment.seconds_remaining(now),
        }
    }
}
