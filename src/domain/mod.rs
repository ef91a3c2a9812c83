//! Ledger entities, their local state machines, and the ports the
//! application layer talks to.

pub mod agent;
pub mod commission;
pub mod ids;
pub mod level;
pub mod money;
pub mod payment;
pub mod ports;
pub mod referral;
pub mod team;
pub mod withdrawal;
