use super::ids::{AgentId, OrderId, PaymentId, TxRef, UserId};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    /// A transaction has been seen but is still short of the required depth.
    Processing,
    Confirmed,
    Expired,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// Statuses that still count as the one active payment of an order.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Confirmed)
                | (Processing, Processing)
                | (Processing, Confirmed)
                | (Pending, Expired)
                | (Processing, Expired)
                | (Pending, Failed)
                | (Processing, Failed)
                | (Confirmed, Refunded)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        };
        f.write_str(s)
    }
}

/// The order a payment settles, with its commission attribution.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct OrderRef {
    pub order_id: OrderId,
    /// Agent credited with the sale, if the buyer came through one.
    pub agent_id: Option<AgentId>,
    pub user_id: Option<UserId>,
}

impl OrderRef {
    pub fn new(order_id: impl Into<OrderId>) -> Self {
        Self {
            order_id: order_id.into(),
            agent_id: None,
            user_id: None,
        }
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PaymentRequest {
    pub payment_id: PaymentId,
    pub order: OrderRef,
    pub quote_amount: Decimal,
    pub quote_currency: String,
    /// Expected amount in settlement-token units.
    pub amount: Decimal,
    pub settlement_token: String,
    pub target_address: String,
    pub required_confirmations: u32,
    pub confirmations: u32,
    pub tx_ref: Option<TxRef>,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub refund_reason: Option<String>,
    pub version: u64,
}

impl PaymentRequest {
    pub fn order_id(&self) -> &OrderId {
        &self.order.order_id
    }

    /// Whether the payment is still active but past its deadline.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && self.expires_at < now
    }

    /// Moves a confirmed payment to `refunded`. Returns `false` when it
    /// already was refunded.
    pub fn mark_refunded(&mut self, reason: &str, now: DateTime<Utc>) -> Result<bool, LedgerError> {
        if self.status == PaymentStatus::Refunded {
            return Ok(false);
        }
        if !self.status.can_transition_to(PaymentStatus::Refunded) {
            return Err(LedgerError::InvalidTransition {
                entity: "payment",
                from: self.status.to_string(),
                to: PaymentStatus::Refunded.to_string(),
            });
        }
        self.status = PaymentStatus::Refunded;
        self.refunded_at = Some(now);
        self.refund_reason = Some(reason.to_string());
        self.version += 1;
        Ok(true)
    }

    /// Seconds left before expiry; zero once elapsed or no longer active.
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        if !self.status.is_active() {
            return 0;
        }
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Emitted when a payment reaches its required confirmation depth.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementEvent {
    pub payment_id: PaymentId,
    pub order: OrderRef,
    pub amount: Decimal,
    pub tx_ref: TxRef,
    pub confirmed_at: DateTime<Utc>,
}

impl SettlementEvent {
    pub fn from_payment(payment: &PaymentRequest) -> Option<Self> {
        match (&payment.tx_ref, payment.confirmed_at) {
            (Some(tx_ref), Some(confirmed_at)) if payment.status == PaymentStatus::Confirmed => {
                Some(Self {
                    payment_id: payment.payment_id,
                    order: payment.order.clone(),
                    amount: payment.amount,
                    tx_ref: tx_ref.clone(),
                    confirmed_at,
                })
            }
            _ => None,
        }
    }
}
