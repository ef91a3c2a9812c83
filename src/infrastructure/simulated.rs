//! In-process stand-ins for the settlement network and its neighbours.
//!
//! The command-line replay runs against these, and so do the tests.

use crate::domain::ids::{OrderId, TxRef};
use crate::domain::ports::{
    AddressAllocator, Clock, ExchangeRateProvider, LedgerClient, OrderCanceller, TxObservation,
};
use crate::error::ExternalError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Settlement network whose transactions are recorded by hand.
#[derive(Default, Clone)]
pub struct SimulatedLedgerClient {
    transactions: Arc<Mutex<HashMap<TxRef, TxObservation>>>,
    /// Number of upcoming lookups that fail with a transient error.
    transient_failures: Arc<Mutex<u32>>,
    lookups: Arc<Mutex<u32>>,
}

impl SimulatedLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, observation: TxObservation) {
        self.transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(observation.tx_ref.clone(), observation);
    }

    /// Updates the depth of an already recorded transaction.
    pub fn set_confirmations(&self, tx_ref: &TxRef, confirmations: u32) {
        if let Some(tx) = self
            .transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(tx_ref)
        {
            tx.confirmations = confirmations;
        }
    }

    pub fn fail_next(&self, times: u32) {
        *self
            .transient_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = times;
    }

    pub fn lookups(&self) -> u32 {
        *self.lookups.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedgerClient {
    async fn confirmation_depth(
        &self,
        tx_ref: &TxRef,
    ) -> Result<Option<TxObservation>, ExternalError> {
        *self.lookups.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        {
            let mut failures = self
                .transient_failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *failures > 0 {
                *failures -= 1;
                return Err(ExternalError::Transient(format!(
                    "timeout looking up {tx_ref}"
                )));
            }
        }
        Ok(self
            .transactions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tx_ref)
            .cloned())
    }
}

/// Converts with a fixed table of rates; identical currencies convert 1:1.
#[derive(Default, Clone)]
pub struct FixedRateProvider {
    rates: HashMap<(String, String), Decimal>,
}

impl FixedRateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, from: &str, to: &str, rate: Decimal) -> Self {
        self.rates
            .insert((from.to_ascii_uppercase(), to.to_ascii_uppercase()), rate);
        self
    }
}

#[async_trait]
impl ExchangeRateProvider for FixedRateProvider {
    async fn convert(
        &self,
        amount: Decimal,
        from_currency: &str,
        to_currency: &str,
    ) -> Result<Decimal, ExternalError> {
        let from = from_currency.to_ascii_uppercase();
        let to = to_currency.to_ascii_uppercase();
        if from == to {
            return Ok(amount);
        }
        self.rates
            .get(&(from.clone(), to.clone()))
            .map(|rate| amount * rate)
            .ok_or_else(|| ExternalError::Permanent(format!("no rate for {from}/{to}")))
    }
}

/// Derives a fresh deposit address per order.
#[derive(Default, Clone)]
pub struct DerivedAddressAllocator {
    prefix: String,
}

impl DerivedAddressAllocator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl AddressAllocator for DerivedAddressAllocator {
    async fn allocate(&self, _order_id: &OrderId) -> Result<String, ExternalError> {
        Ok(format!("{}{}", self.prefix, Uuid::now_v7().simple()))
    }
}

/// Order-management stand-in that remembers which orders were cancelled.
#[derive(Default, Clone)]
pub struct RecordingOrderCanceller {
    cancelled: Arc<Mutex<Vec<OrderId>>>,
}

impl RecordingOrderCanceller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelled(&self) -> Vec<OrderId> {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl OrderCanceller for RecordingOrderCanceller {
    async fn cancel_order(&self, order_id: &OrderId, _reason: &str) -> Result<(), ExternalError> {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(order_id.clone());
        Ok(())
    }
}

/// A clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_fixed_rates() {
        let rates = FixedRateProvider::new().with_rate("CNY", "USDT", dec!(0.14));
        assert_eq!(rates.convert(dec!(100), "cny", "usdt").await, Ok(dec!(14.00)));
        assert_eq!(rates.convert(dec!(5), "USDT", "USDT").await, Ok(dec!(5)));
        assert!(matches!(
            rates.convert(dec!(5), "EUR", "USDT").await,
            Err(ExternalError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn test_simulated_client_transient_failures() {
        let client = SimulatedLedgerClient::new();
        let tx_ref = TxRef::from("0xabc");
        client.record(TxObservation {
            tx_ref: tx_ref.clone(),
            confirmations: 3,
            amount: dec!(10),
            from: "from".into(),
            to: "to".into(),
            valid: true,
        });
        client.fail_next(1);

        assert!(client.confirmation_depth(&tx_ref).await.is_err());
        let seen = client.confirmation_depth(&tx_ref).await.unwrap().unwrap();
        assert_eq!(seen.confirmations, 3);
        assert_eq!(client.lookups(), 2);
    }
}
