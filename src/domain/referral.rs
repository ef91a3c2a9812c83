use super::ids::{AgentId, ReferralId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ReferralStatus {
    Pending,
    Confirmed,
}

/// Attribution of a signed-up user to the agent whose code they used.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Referral {
    pub referral_id: ReferralId,
    pub agent_id: AgentId,
    pub referred_user_id: UserId,
    pub referral_code: String,
    pub status: ReferralStatus,
    pub bonus_amount: Decimal,
    pub bonus_paid: bool,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Referral {
    pub fn new(
        agent_id: AgentId,
        referred_user_id: UserId,
        referral_code: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            referral_id: ReferralId::new(),
            agent_id,
            referred_user_id,
            referral_code: referral_code.into(),
            status: ReferralStatus::Pending,
            bonus_amount: Decimal::ZERO,
            bonus_paid: false,
            created_at: now,
            confirmed_at: None,
            version: 0,
        }
    }
}
