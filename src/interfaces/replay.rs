//! Drives a [`Ledger`] from command-file rows against a simulated
//! settlement network.

use super::csv::command_reader::{CommandKind, CommandRecord};
use crate::application::service::{Collaborators, Ledger};
use crate::config::LedgerConfig;
use crate::domain::agent::Agent;
use crate::domain::ids::{OrderId, TxRef, UserId, WithdrawalId};
use crate::domain::payment::{OrderRef, PaymentRequest, PaymentStatus};
use crate::domain::ports::{LedgerStoreRef, TxObservation};
use crate::domain::withdrawal::WithdrawalStatus;
use crate::error::{LedgerError, Result};
use crate::infrastructure::simulated::{
    DerivedAddressAllocator, FixedRateProvider, ManualClock, RecordingOrderCanceller,
    SimulatedLedgerClient,
};
use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct Replay {
    ledger: Ledger,
    network: SimulatedLedgerClient,
    clock: ManualClock,
    /// Withdrawal labels from the command file.
    withdrawals: HashMap<String, WithdrawalId>,
}

impl Replay {
    pub fn new(config: LedgerConfig, store: LedgerStoreRef) -> Result<Self> {
        let network = SimulatedLedgerClient::new();
        let clock = ManualClock::new(Utc::now());
        let collaborators = Collaborators {
            ledger_client: Arc::new(network.clone()),
            rates: Arc::new(
                FixedRateProvider::new()
                    .with_rate("USD", &config.settlement_token, dec!(1))
                    .with_rate("CNY", &config.settlement_token, dec!(0.14)),
            ),
            addresses: Arc::new(DerivedAddressAllocator::new("T")),
            orders: Arc::new(RecordingOrderCanceller::new()),
            clock: Arc::new(clock.clone()),
        };
        Ok(Self {
            ledger: Ledger::new(config, store, collaborators)?,
            network,
            clock,
            withdrawals: HashMap::new(),
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub async fn apply(&mut self, record: &CommandRecord) -> Result<()> {
        debug!(?record, "replaying command");
        match record.command {
            CommandKind::Register => {
                let parent_code = match record.detail() {
                    Some(parent) => Some(self.agent(parent).await?.referral_code),
                    None => None,
                };
                self.ledger
                    .register_agent(record.agent()?, parent_code.as_deref())
                    .await?;
            }
            CommandKind::Order => {
                let agent = self.agent(record.agent()?).await?;
                let currency = record
                    .detail()
                    .unwrap_or(self.ledger.config().settlement_token.as_str())
                    .to_string();
                let order = OrderRef::new(record.reference()?).with_agent(agent.agent_id);
                self.ledger
                    .create_order_payment(order, record.amount()?, &currency)
                    .await?;
            }
            CommandKind::Confirm => {
                let order_id = OrderId::from(record.reference()?);
                let payment = self
                    .latest_payment(&order_id, |p| p.status.is_active())
                    .await?;
                let confirmations = match record.detail() {
                    Some(raw) => raw.parse::<u32>().map_err(|_| {
                        LedgerError::ValidationError(format!("invalid confirmation count '{raw}'"))
                    })?,
                    None => payment.required_confirmations,
                };
                let tx_ref = payment
                    .tx_ref
                    .clone()
                    .unwrap_or_else(|| TxRef::from(format!("sim-{}", payment.payment_id)));
                self.network.record(TxObservation {
                    tx_ref: tx_ref.clone(),
                    confirmations,
                    amount: record.amount.unwrap_or(payment.amount),
                    from: "buyer".to_string(),
                    to: payment.target_address.clone(),
                    valid: true,
                });
                self.ledger
                    .confirm_transaction(payment.payment_id, &tx_ref)
                    .await?;
            }
            CommandKind::Withdraw => {
                let account = record.agent()?;
                let label = record.reference()?;
                if self.withdrawals.contains_key(label) {
                    return Err(LedgerError::ValidationError(format!(
                        "withdrawal label '{label}' is already used"
                    )));
                }
                let agent = self.agent(account).await?;
                let address = record
                    .detail()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("wallet-{account}"));
                let request = self
                    .ledger
                    .request_withdrawal(agent.agent_id, record.amount()?, &address)
                    .await?;
                self.withdrawals
                    .insert(label.to_string(), request.withdrawal_id);
            }
            CommandKind::Settle => {
                let label = record.reference()?;
                let withdrawal_id = *self
                    .withdrawals
                    .get(label)
                    .ok_or_else(|| LedgerError::not_found("withdrawal label", label))?;
                let raw = record.detail().ok_or_else(|| {
                    LedgerError::ValidationError("settle needs a status in the detail column".into())
                })?;
                let status = raw
                    .parse::<WithdrawalStatus>()
                    .map_err(LedgerError::ValidationError)?;
                let payout = (status == WithdrawalStatus::Completed)
                    .then(|| TxRef::from(format!("payout-{label}")));
                self.ledger
                    .settle_withdrawal(withdrawal_id, status, payout)
                    .await?;
            }
            CommandKind::Refund => {
                let order_id = OrderId::from(record.reference()?);
                let payment = self
                    .latest_payment(&order_id, |p| p.status == PaymentStatus::Confirmed)
                    .await?;
                self.ledger
                    .refund_payment(payment.payment_id, record.detail().unwrap_or("refund"))
                    .await?;
            }
            CommandKind::Referral => {
                let agent = self.agent(record.agent()?).await?;
                self.ledger
                    .attribute_referral(&agent.referral_code, &UserId::from(record.reference()?))
                    .await?;
            }
            CommandKind::Qualify => {
                self.ledger
                    .confirm_referral(&UserId::from(record.reference()?), record.amount()?)
                    .await?;
            }
            CommandKind::Sweep => {
                if let Some(amount) = record.amount {
                    let seconds = amount
                        .trunc()
                        .to_i64()
                        .filter(|s| *s >= 0)
                        .ok_or_else(|| {
                            LedgerError::ValidationError(format!("cannot advance the clock by {amount}"))
                        })?;
                    self.clock.advance(Duration::seconds(seconds));
                }
                self.ledger.sweep_expired().await?;
            }
        }
        Ok(())
    }

    async fn agent(&self, account: &str) -> Result<Agent> {
        self.ledger
            .agent_by_account(account)
            .await?
            .ok_or_else(|| LedgerError::not_found("agent", account))
    }

    async fn latest_payment(
        &self,
        order_id: &OrderId,
        wanted: impl Fn(&PaymentRequest) -> bool,
    ) -> Result<PaymentRequest> {
        self.ledger
            .payments()
            .payments_for_order(order_id)
            .await?
            .into_iter()
            .rev()
            .find(|p| wanted(p))
            .ok_or_else(|| LedgerError::not_found("payment for order", order_id))
    }
}
