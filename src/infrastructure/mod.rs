//! Storage backends for [`crate::domain::ports::LedgerStore`] and the
//! collaborator implementations used by the command-line simulator.

pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod simulated;

use crate::domain::ids::AgentId;
use crate::domain::ports::{Guard, Write, WriteSet};
use crate::error::{LedgerError, Result};
use std::collections::HashSet;

/// Read access a backend offers while it holds its commit lock.
pub(crate) trait CommitView {
    /// Stored version of the record a write targets, 0 when absent.
    fn stored_version(&self, write: &Write) -> Result<u64>;
    fn guard_holds(&self, guard: &Guard, set: &WriteSet) -> Result<bool>;
}

/// Checks every version and guard of `set` against `view`.
pub(crate) fn validate_write_set(view: &impl CommitView, set: &WriteSet) -> Result<()> {
    let mut targets = HashSet::new();
    for write in &set.writes {
        let Some((key, new_version)) = write_key(write) else {
            continue;
        };
        if !targets.insert(key.clone()) {
            return Err(LedgerError::InvariantViolation(format!(
                "write set touches {key} twice"
            )));
        }
        let stored = view.stored_version(write)?;
        if new_version != stored + 1 {
            return Err(LedgerError::Conflict(format!(
                "{key} is at version {stored}, write expected {}",
                new_version.saturating_sub(1)
            )));
        }
    }
    for guard in &set.guards {
        if !view.guard_holds(guard, set)? {
            return Err(LedgerError::Conflict(format!("guard failed: {guard:?}")));
        }
    }
    Ok(())
}

fn write_key(write: &Write) -> Option<(String, u64)> {
    match write {
        Write::Agent(a) => Some((format!("agent:{}", a.agent_id), a.version)),
        Write::Edge(e) => Some((format!("edge:{}:{}", e.agent_id, e.member_id), e.version)),
        Write::Commission(c) => Some((format!("commission:{}", c.commission_id), c.version)),
        Write::Payment(p) => Some((format!("payment:{}", p.payment_id), p.version)),
        Write::Withdrawal(w) => Some((format!("withdrawal:{}", w.withdrawal_id), w.version)),
        Write::Referral(r) => Some((format!("referral:{}", r.referral_id), r.version)),
        Write::LevelUpgrade(_) => None,
    }
}

/// Whether `candidate` is `agent_id` or one of its uplines, following the
/// stored parent links. A looping upline counts as a hit.
pub(crate) fn in_upline(
    agent_id: AgentId,
    candidate: AgentId,
    mut parent_of: impl FnMut(AgentId) -> Result<Option<AgentId>>,
) -> Result<bool> {
    let mut seen = HashSet::new();
    let mut cursor = Some(agent_id);
    while let Some(current) = cursor {
        if current == candidate || !seen.insert(current) {
            return Ok(true);
        }
        cursor = parent_of(current)?;
    }
    Ok(false)
}
