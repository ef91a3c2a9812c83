//! Ledger configuration.
//!
//! Every knob has a default so an empty JSON object is a valid
//! configuration file.

use crate::domain::commission::CommissionType;
use crate::domain::level::Tier;
use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// When a freshly recorded commission becomes withdrawable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EarningPolicy {
    /// Entries are written as `earned`.
    #[default]
    Immediate,
    /// Entries are written as `pending` and advanced by an external policy.
    Deferred,
}

/// How far down the hierarchy team sales are rolled up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TeamScope {
    /// Direct members only.
    #[default]
    Direct,
    /// The whole downline.
    Recursive,
}

/// Fixed rates (percent) for the commission types that do not use the
/// agent's own tier rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommissionRates {
    pub team_sale: Decimal,
    pub referral_bonus: Decimal,
    pub level_bonus: Decimal,
}

impl Default for CommissionRates {
    fn default() -> Self {
        Self {
            team_sale: dec!(2),
            referral_bonus: dec!(5),
            level_bonus: dec!(1),
        }
    }
}

impl CommissionRates {
    /// Rate for a non-direct commission type. `None` for direct sales.
    pub fn fixed_rate(&self, r#type: CommissionType) -> Option<Decimal> {
        match r#type {
            CommissionType::DirectSale => None,
            CommissionType::TeamSale => Some(self.team_sale),
            CommissionType::ReferralBonus => Some(self.referral_bonus),
            CommissionType::LevelBonus => Some(self.level_bonus),
        }
    }
}

/// Bounded exponential backoff for calls to external collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub settlement_token: String,
    /// Decimal places of the token's smallest unit.
    pub token_decimals: u32,
    pub min_payment: Decimal,
    pub max_payment: Decimal,
    pub payment_timeout_secs: i64,
    pub required_confirmations: u32,
    pub min_withdrawal: Decimal,
    pub max_withdrawal: Decimal,
    /// Fraction of the withdrawn amount kept as fee, e.g. `0.02`.
    pub withdrawal_fee_rate: Decimal,
    pub commission_rates: CommissionRates,
    pub tiers: Vec<Tier>,
    pub earning_policy: EarningPolicy,
    pub team_scope: TeamScope,
    /// Newly registered agents start `active` instead of `pending`.
    pub auto_activate_agents: bool,
    pub retry: RetryPolicy,
    /// Bound on optimistic-concurrency retries inside one operation.
    pub max_conflict_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            settlement_token: "USDT".to_string(),
            token_decimals: 6,
            min_payment: dec!(1),
            max_payment: dec!(100000),
            payment_timeout_secs: 30 * 60,
            required_confirmations: 19,
            min_withdrawal: dec!(10),
            max_withdrawal: dec!(50000),
            withdrawal_fee_rate: dec!(0.02),
            commission_rates: CommissionRates::default(),
            tiers: default_tiers(),
            earning_policy: EarningPolicy::default(),
            team_scope: TeamScope::default(),
            auto_activate_agents: true,
            retry: RetryPolicy::default(),
            max_conflict_retries: 5,
        }
    }
}

pub fn default_tiers() -> Vec<Tier> {
    vec![
        Tier::new(4, "Platinum", dec!(200000), 50, dec!(12)),
        Tier::new(3, "Gold", dec!(50000), 20, dec!(10)),
        Tier::new(2, "Silver", dec!(10000), 5, dec!(8)),
        Tier::new(1, "Bronze", dec!(0), 0, dec!(5)),
    ]
}

impl LedgerConfig {
    /// Reads a JSON configuration file and validates it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: LedgerConfig = serde_json::from_str(&raw)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Sorts the tier table by descending level.
    pub fn normalize(&mut self) {
        self.tiers.sort_by(|a, b| b.level.cmp(&a.level));
    }

    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(LedgerError::ConfigError("tier table is empty".into()));
        }
        let mut seen = HashSet::new();
        for tier in &self.tiers {
            if !seen.insert(tier.level) {
                return Err(LedgerError::ConfigError(format!(
                    "duplicate tier level {}",
                    tier.level
                )));
            }
            check_percent("tier commission_rate", tier.commission_rate)?;
        }
        check_percent("team_sale rate", self.commission_rates.team_sale)?;
        check_percent("referral_bonus rate", self.commission_rates.referral_bonus)?;
        check_percent("level_bonus rate", self.commission_rates.level_bonus)?;

        if self.min_payment <= Decimal::ZERO || self.min_payment > self.max_payment {
            return Err(LedgerError::ConfigError(
                "payment limits must satisfy 0 < min <= max".into(),
            ));
        }
        if self.min_withdrawal <= Decimal::ZERO || self.min_withdrawal > self.max_withdrawal {
            return Err(LedgerError::ConfigError(
                "withdrawal limits must satisfy 0 < min <= max".into(),
            ));
        }
        if self.withdrawal_fee_rate < Decimal::ZERO || self.withdrawal_fee_rate >= Decimal::ONE {
            return Err(LedgerError::ConfigError(
                "withdrawal_fee_rate must be in [0, 1)".into(),
            ));
        }
        if self.payment_timeout_secs <= 0 {
            return Err(LedgerError::ConfigError(
                "payment_timeout_secs must be positive".into(),
            ));
        }
        if self.required_confirmations == 0 {
            return Err(LedgerError::ConfigError(
                "required_confirmations must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(LedgerError::ConfigError(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The tier table, highest level first.
    pub fn tiers_descending(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn lowest_tier(&self) -> Option<&Tier> {
        self.tiers.iter().min_by_key(|t| t.level)
    }

    pub fn tier(&self, level: u32) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.level == level)
    }
}

fn check_percent(what: &str, value: Decimal) -> Result<()> {
    if value < Decimal::ZERO || value > Decimal::ONE_HUNDRED {
        return Err(LedgerError::ConfigError(format!(
            "{what} must be between 0 and 100, got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let mut config = LedgerConfig::default();
        config.normalize();
        config.validate().unwrap();
        assert_eq!(config.tiers_descending()[0].level, 4);
        assert_eq!(config.lowest_tier().unwrap().name, "Bronze");
    }

    #[test]
    fn test_load_partial_json_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{ "min_withdrawal": "20", "tiers": [
                {{ "level": 1, "name": "Bronze", "min_sales": "0", "min_team_size": 0, "commission_rate": "5" }},
                {{ "level": 2, "name": "Silver", "min_sales": "0", "min_team_size": 1, "commission_rate": "8" }}
            ] }}"#
        )
        .unwrap();

        let config = LedgerConfig::load(file.path()).unwrap();
        assert_eq!(config.min_withdrawal, dec!(20));
        assert_eq!(config.settlement_token, "USDT");
        assert_eq!(config.tiers[0].name, "Silver");
    }

    #[test]
    fn test_rejects_duplicate_levels() {
        let mut config = LedgerConfig::default();
        config.tiers.push(Tier::new(1, "Again", dec!(0), 0, dec!(1)));
        assert!(matches!(
            config.validate(),
            Err(LedgerError::ConfigError(_))
        ));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 500,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }
}
