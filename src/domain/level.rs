use super::ids::AgentId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A commission tier and the thresholds to reach it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Tier {
    pub level: u32,
    pub name: String,
    pub min_sales: Decimal,
    pub min_team_size: u32,
    /// Percentage applied to the agent's direct sales.
    pub commission_rate: Decimal,
}

impl Tier {
    pub fn new(
        level: u32,
        name: impl Into<String>,
        min_sales: Decimal,
        min_team_size: u32,
        commission_rate: Decimal,
    ) -> Self {
        Self {
            level,
            name: name.into(),
            min_sales,
            min_team_size,
            commission_rate,
        }
    }
}

/// Audit record of a tier change.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LevelUpgrade {
    pub agent_id: AgentId,
    pub from_level: u32,
    pub to_level: u32,
    /// `false` for administrative overrides.
    pub automatic: bool,
    pub at: DateTime<Utc>,
}
