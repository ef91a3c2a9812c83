//! Application layer: the ledger components and the service object that
//! wires them together.
//!
//! Every mutating operation follows the same shape: take the per-agent
//! lock(s) it needs, read the current records, validate, and submit one
//! [`WriteSet`](crate::domain::ports::WriteSet) whose version checks make
//! the read-validate-write sequence atomic against the store.

pub mod agent_hierarchy;
pub mod commission_engine;
pub mod level_engine;
pub mod locks;
pub mod payment_ledger;
pub mod read_models;
pub mod referral_book;
pub mod retry;
pub mod service;
pub mod withdrawal_ledger;

use crate::config::LedgerConfig;
use crate::domain::agent::Agent;
use crate::domain::ids::AgentId;
use crate::domain::ports::{ClockRef, LedgerStoreRef};
use crate::error::{LedgerError, Result};
use locks::AgentLocks;
use std::sync::Arc;

/// Handles shared by every component. Cheap to clone.
#[derive(Clone)]
pub struct LedgerContext {
    pub store: LedgerStoreRef,
    pub clock: ClockRef,
    pub config: Arc<LedgerConfig>,
    pub locks: AgentLocks,
}

impl LedgerContext {
    pub fn new(store: LedgerStoreRef, clock: ClockRef, config: LedgerConfig) -> Self {
        Self {
            store,
            clock,
            config: Arc::new(config),
            locks: AgentLocks::new(),
        }
    }

    pub(crate) async fn require_agent(&self, agent_id: AgentId) -> Result<Agent> {
        self.store
            .agent(agent_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("agent", agent_id))
    }
}
