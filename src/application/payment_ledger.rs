use super::LedgerContext;
use super::retry::{call_external, retry_on_conflict};
use crate::domain::ids::{OrderId, PaymentId, TxRef};
use crate::domain::money::{Amount, round_to_unit};
use crate::domain::payment::{OrderRef, PaymentRequest, PaymentStatus, SettlementEvent};
use crate::domain::ports::{
    AddressAllocatorRef, ExchangeRateProviderRef, Guard, LedgerClientRef, OrderCancellerRef,
    TxObservation, Write, WriteSet,
};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of checking a payment against the settlement network.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub payment: PaymentRequest,
    /// Set only by the call that moved the payment to `confirmed`.
    pub settlement: Option<SettlementEvent>,
}

impl Reconciliation {
    fn unchanged(payment: PaymentRequest) -> Self {
        Self {
            payment,
            settlement: None,
        }
    }
}

/// Lifecycle of payment requests, from checkout to confirmation, expiry or
/// refund.
#[derive(Clone)]
pub struct PaymentLedger {
    ctx: LedgerContext,
    ledger_client: LedgerClientRef,
    rates: ExchangeRateProviderRef,
    addresses: AddressAllocatorRef,
    orders: OrderCancellerRef,
}

impl PaymentLedger {
    pub fn new(
        ctx: LedgerContext,
        ledger_client: LedgerClientRef,
        rates: ExchangeRateProviderRef,
        addresses: AddressAllocatorRef,
        orders: OrderCancellerRef,
    ) -> Self {
        Self {
            ctx,
            ledger_client,
            rates,
            addresses,
            orders,
        }
    }

    /// Opens the payment for an order.
    ///
    /// The quote is converted into the settlement token and must land within
    /// the configured payment limits. At most one pending or processing
    /// payment may exist per order; the check is part of the commit.
    pub async fn create_payment(
        &self,
        order: OrderRef,
        quote_amount: Decimal,
        quote_currency: &str,
    ) -> Result<PaymentRequest> {
        let quote_amount = Amount::new(quote_amount)?.value();
        let config = &self.ctx.config;
        let order_id = order.order_id.clone();

        if self
            .ctx
            .store
            .payments_for_order(&order_id)
            .await?
            .iter()
            .any(|p| p.status.is_active())
        {
            return Err(LedgerError::DuplicatePayment(order_id.to_string()));
        }

        let token = config.settlement_token.as_str();
        let converted = call_external(&config.retry, "exchange rate", move || {
            self.rates.convert(quote_amount, quote_currency, token)
        })
        .await?;
        let amount = round_to_unit(converted, config.token_decimals);
        if amount < config.min_payment || amount > config.max_payment {
            return Err(LedgerError::AmountOutOfRange {
                amount,
                min: config.min_payment,
                max: config.max_payment,
            });
        }

        let order_ref = &order_id;
        let target_address = call_external(&config.retry, "address allocation", move || {
            self.addresses.allocate(order_ref)
        })
        .await?;

        let now = self.ctx.clock.now();
        let payment = PaymentRequest {
            payment_id: PaymentId::new(),
            order,
            quote_amount,
            quote_currency: quote_currency.to_ascii_uppercase(),
            amount,
            settlement_token: config.settlement_token.clone(),
            target_address,
            required_confirmations: config.required_confirmations,
            confirmations: 0,
            tx_ref: None,
            status: PaymentStatus::Pending,
            created_at: now,
            expires_at: now + ChronoDuration::seconds(config.payment_timeout_secs),
            confirmed_at: None,
            refunded_at: None,
            failure_reason: None,
            refund_reason: None,
            version: 1,
        };

        let result = self
            .ctx
            .store
            .commit(
                WriteSet::new()
                    .put(Write::Payment(payment.clone()))
                    .guard(Guard::NoActivePayment(order_id.clone())),
            )
            .await;
        match result {
            Err(LedgerError::Conflict(_)) => {
                Err(LedgerError::DuplicatePayment(order_id.to_string()))
            }
            other => other,
        }?;

        info!(
            payment_id = %payment.payment_id,
            %order_id,
            amount = %payment.amount,
            token = %payment.settlement_token,
            expires_at = %payment.expires_at,
            "payment created"
        );
        Ok(payment)
    }

    /// Checks `tx_ref` against the network and advances the payment.
    ///
    /// The network is queried before anything is read for update, so a
    /// timeout leaves the payment untouched. Repeating the call for an
    /// already confirmed payment returns it without a settlement event.
    pub async fn reconcile_confirmation(
        &self,
        payment_id: PaymentId,
        tx_ref: &TxRef,
    ) -> Result<Reconciliation> {
        let payment = self.require(payment_id).await?;
        if let Some(done) = Self::precheck(&payment, tx_ref)? {
            return Ok(done);
        }

        let client = &self.ledger_client;
        let observation = call_external(&self.ctx.config.retry, "confirmation lookup", move || {
            client.confirmation_depth(tx_ref)
        })
        .await?;
        let Some(observation) = observation else {
            debug!(%payment_id, %tx_ref, "transaction not yet visible");
            return Ok(Reconciliation::unchanged(payment));
        };

        let observation = &observation;
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || {
            self.apply_observation(payment_id, tx_ref, observation)
        })
        .await
    }

    /// Rejects confirmations that cannot apply and short-circuits the ones
    /// already applied.
    fn precheck(payment: &PaymentRequest, tx_ref: &TxRef) -> Result<Option<Reconciliation>> {
        match payment.status {
            PaymentStatus::Confirmed | PaymentStatus::Refunded
                if payment.tx_ref.as_ref() == Some(tx_ref) =>
            {
                Ok(Some(Reconciliation::unchanged(payment.clone())))
            }
            PaymentStatus::Pending | PaymentStatus::Processing => match &payment.tx_ref {
                Some(bound) if bound != tx_ref => Err(LedgerError::ValidationError(format!(
                    "payment {} is already bound to transaction {bound}",
                    payment.payment_id
                ))),
                _ => Ok(None),
            },
            status => Err(LedgerError::InvalidTransition {
                entity: "payment",
                from: status.to_string(),
                to: PaymentStatus::Confirmed.to_string(),
            }),
        }
    }

    async fn apply_observation(
        &self,
        payment_id: PaymentId,
        tx_ref: &TxRef,
        observation: &TxObservation,
    ) -> Result<Reconciliation> {
        let mut payment = self.require(payment_id).await?;
        if let Some(done) = Self::precheck(&payment, tx_ref)? {
            return Ok(done);
        }

        let now = self.ctx.clock.now();
        let rejection = if !observation.valid {
            Some("transaction is invalid".to_string())
        } else if observation.to != payment.target_address {
            Some(format!(
                "transaction pays {} instead of {}",
                observation.to, payment.target_address
            ))
        } else if observation.amount < payment.amount {
            Some(format!(
                "transaction amount {} is below the requested {}",
                observation.amount, payment.amount
            ))
        } else {
            None
        };

        let next = match &rejection {
            Some(_) => PaymentStatus::Failed,
            None if observation.confirmations >= payment.required_confirmations => {
                PaymentStatus::Confirmed
            }
            None if observation.confirmations > 0 => PaymentStatus::Processing,
            None => payment.status,
        };
        if next == payment.status
            && observation.confirmations == payment.confirmations
            && payment.tx_ref.is_some()
        {
            return Ok(Reconciliation::unchanged(payment));
        }
        if next != payment.status && !payment.status.can_transition_to(next) {
            return Err(LedgerError::InvalidTransition {
                entity: "payment",
                from: payment.status.to_string(),
                to: next.to_string(),
            });
        }

        let from = payment.status;
        payment.status = next;
        payment.tx_ref = Some(tx_ref.clone());
        payment.confirmations = observation.confirmations;
        payment.failure_reason = rejection;
        if next == PaymentStatus::Confirmed {
            payment.confirmed_at = Some(now);
        }
        payment.version += 1;

        self.ctx
            .store
            .commit(WriteSet::new().put(Write::Payment(payment.clone())))
            .await?;

        match next {
            PaymentStatus::Failed => warn!(
                %payment_id,
                %tx_ref,
                reason = payment.failure_reason.as_deref().unwrap_or_default(),
                "payment failed"
            ),
            _ => info!(
                %payment_id,
                %tx_ref,
                %from,
                to = %next,
                confirmations = payment.confirmations,
                required = payment.required_confirmations,
                "payment advanced"
            ),
        }

        let settlement = if next == PaymentStatus::Confirmed {
            SettlementEvent::from_payment(&payment)
        } else {
            None
        };
        Ok(Reconciliation {
            payment,
            settlement,
        })
    }

    /// Expires every active payment, pending or processing, whose deadline
    /// is before `now`.
    ///
    /// Each row is its own version-checked commit; a row changed by someone
    /// else in the meantime is left alone. Safe to run from several workers.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<PaymentRequest>> {
        let mut candidates = self
            .ctx
            .store
            .payments_with_status(PaymentStatus::Pending)
            .await?;
        candidates.extend(
            self.ctx
                .store
                .payments_with_status(PaymentStatus::Processing)
                .await?,
        );

        let mut expired = Vec::new();
        for mut payment in candidates.into_iter().filter(|p| p.is_expired_at(now)) {
            payment.status = PaymentStatus::Expired;
            payment.version += 1;
            match self
                .ctx
                .store
                .commit(WriteSet::new().put(Write::Payment(payment.clone())))
                .await
            {
                Ok(()) => {}
                Err(LedgerError::Conflict(reason)) => {
                    debug!(payment_id = %payment.payment_id, %reason, "payment changed during sweep, skipped");
                    continue;
                }
                Err(err) => return Err(err),
            }
            info!(
                payment_id = %payment.payment_id,
                order_id = %payment.order_id(),
                "payment expired"
            );
            self.cancel_order(payment.order_id()).await;
            expired.push(payment);
        }
        Ok(expired)
    }

    async fn cancel_order(&self, order_id: &OrderId) {
        let orders = &self.orders;
        let result = call_external(&self.ctx.config.retry, "order cancellation", move || {
            orders.cancel_order(order_id, "payment expired")
        })
        .await;
        if let Err(err) = result {
            warn!(%order_id, error = %err, "could not cancel order of expired payment");
        }
    }

    /// Runs [`Self::sweep_expired`] every `period` until the task is aborted.
    pub fn spawn_expiry_sweeper(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let now = self.ctx.clock.now();
                match self.sweep_expired(now).await {
                    Ok(expired) if !expired.is_empty() => {
                        debug!(count = expired.len(), "expiry sweep finished");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "expiry sweep failed"),
                }
            }
        })
    }

    /// Marks a confirmed payment refunded. Refunding twice returns the
    /// refunded payment.
    pub async fn refund(&self, payment_id: PaymentId, reason: &str) -> Result<PaymentRequest> {
        retry_on_conflict(self.ctx.config.max_conflict_retries, move || async move {
            let mut payment = self.require(payment_id).await?;
            if !payment.mark_refunded(reason, self.ctx.clock.now())? {
                return Ok(payment);
            }
            self.ctx
                .store
                .commit(WriteSet::new().put(Write::Payment(payment.clone())))
                .await?;
            info!(%payment_id, order_id = %payment.order_id(), %reason, "payment refunded");
            Ok(payment)
        })
        .await
    }

    pub async fn payment(&self, payment_id: PaymentId) -> Result<Option<PaymentRequest>> {
        self.ctx.store.payment(payment_id).await
    }

    /// Every payment ever opened for the order, oldest first.
    pub async fn payments_for_order(&self, order_id: &OrderId) -> Result<Vec<PaymentRequest>> {
        let mut payments = self.ctx.store.payments_for_order(order_id).await?;
        payments.sort_by_key(|p| (p.created_at, p.payment_id));
        Ok(payments)
    }

    pub(crate) async fn require(&self, payment_id: PaymentId) -> Result<PaymentRequest> {
        self.ctx
            .store
            .payment(payment_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("payment", payment_id))
    }
}
