#![allow(dead_code)]

use chrono::Utc;
use commission_ledger::application::service::{Collaborators, Ledger};
use commission_ledger::config::{LedgerConfig, RetryPolicy};
use commission_ledger::domain::ids::TxRef;
use commission_ledger::domain::payment::{OrderRef, PaymentRequest};
use commission_ledger::domain::ports::TxObservation;
use commission_ledger::infrastructure::in_memory::InMemoryLedgerStore;
use commission_ledger::infrastructure::simulated::{
    DerivedAddressAllocator, FixedRateProvider, ManualClock, RecordingOrderCanceller,
    SimulatedLedgerClient,
};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;

pub struct Harness {
    pub ledger: Ledger,
    pub network: SimulatedLedgerClient,
    pub clock: ManualClock,
    pub orders: RecordingOrderCanceller,
}

/// Fast retries and a shallow confirmation requirement.
pub fn test_config() -> LedgerConfig {
    LedgerConfig {
        required_confirmations: 3,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        ..LedgerConfig::default()
    }
}

pub fn harness_with(config: LedgerConfig) -> Harness {
    let network = SimulatedLedgerClient::new();
    let clock = ManualClock::new(Utc::now());
    let orders = RecordingOrderCanceller::new();
    let collaborators = Collaborators {
        ledger_client: Arc::new(network.clone()),
        rates: Arc::new(FixedRateProvider::new()),
        addresses: Arc::new(DerivedAddressAllocator::new("T")),
        orders: Arc::new(orders.clone()),
        clock: Arc::new(clock.clone()),
    };
    let ledger = Ledger::new(config, Arc::new(InMemoryLedgerStore::new()), collaborators)
        .expect("test config is valid");
    Harness {
        ledger,
        network,
        clock,
        orders,
    }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

impl Harness {
    /// Puts a matching transaction on the simulated network.
    pub fn broadcast(&self, payment: &PaymentRequest, confirmations: u32) -> TxRef {
        let tx_ref = TxRef::from(format!("tx-{}", payment.payment_id));
        self.network.record(TxObservation {
            tx_ref: tx_ref.clone(),
            confirmations,
            amount: payment.amount,
            from: "buyer".into(),
            to: payment.target_address.clone(),
            valid: true,
        });
        tx_ref
    }

    /// Opens a payment for `order` and confirms it in full.
    pub async fn settle(&self, order: OrderRef, amount: Decimal) -> PaymentRequest {
        let payment = self
            .ledger
            .create_order_payment(order, amount, "USDT")
            .await
            .unwrap();
        let tx_ref = self.broadcast(&payment, payment.required_confirmations);
        self.ledger
            .confirm_transaction(payment.payment_id, &tx_ref)
            .await
            .unwrap()
            .payment
    }
}

pub fn write_commands(path: &Path, rows: &[&str]) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().flexible(true).from_writer(file);
    wtr.write_record(["command", "agent", "reference", "amount", "detail"])?;
    for row in rows {
        let fields: Vec<&str> = row.split(',').collect();
        wtr.write_record(&fields)?;
    }
    wtr.flush()?;
    Ok(())
}
