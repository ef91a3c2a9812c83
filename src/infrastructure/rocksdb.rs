use super::{CommitView, in_upline, validate_write_set};
use crate::domain::agent::Agent;
use crate::domain::commission::CommissionEntry;
use crate::domain::ids::{AgentId, CommissionId, OrderId, PaymentId, ReferralId, UserId, WithdrawalId};
use crate::domain::level::LevelUpgrade;
use crate::domain::payment::{PaymentRequest, PaymentStatus};
use crate::domain::ports::{Guard, LedgerStore, Write, WriteSet};
use crate::domain::referral::Referral;
use crate::domain::team::TeamEdge;
use crate::domain::withdrawal::WithdrawalRequest;
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CF_AGENTS: &str = "agents";
pub const CF_EDGES: &str = "edges";
pub const CF_COMMISSIONS: &str = "commissions";
pub const CF_PAYMENTS: &str = "payments";
pub const CF_WITHDRAWALS: &str = "withdrawals";
pub const CF_REFERRALS: &str = "referrals";
pub const CF_LEVEL_UPGRADES: &str = "level_upgrades";

const COLUMN_FAMILIES: [&str; 7] = [
    CF_AGENTS,
    CF_EDGES,
    CF_COMMISSIONS,
    CF_PAYMENTS,
    CF_WITHDRAWALS,
    CF_REFERRALS,
    CF_LEVEL_UPGRADES,
];

fn storage_error(e: impl std::error::Error + Send + Sync + 'static) -> LedgerError {
    LedgerError::InternalError(Box::new(e))
}

fn edge_key(agent_id: AgentId, member_id: AgentId) -> Vec<u8> {
    let mut key = agent_id.as_bytes().to_vec();
    key.extend_from_slice(member_id.as_bytes());
    key
}

/// A persistent store implementation using RocksDB.
///
/// Each entity lives in its own column family as JSON. Commits are
/// validated and written as one `WriteBatch` while holding `commit_lock`,
/// which makes version checks and guards atomic with the write for every
/// handle sharing this `Arc<DB>`.
#[derive(Clone)]
pub struct RocksDbLedgerStore {
    db: Arc<DB>,
    commit_lock: Arc<Mutex<()>>,
}

impl RocksDbLedgerStore {
    /// Opens or creates a RocksDB instance at `path` with every column
    /// family the ledger needs.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, descriptors).map_err(storage_error)?;

        Ok(Self {
            db: Arc::new(db),
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            LedgerError::InternalError(Box::new(std::io::Error::other(format!(
                "column family {name} not found"
            ))))
        })
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &'static str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.cf(cf)?;
        match self.db.get_pinned_cf(handle, key).map_err(storage_error)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decodes every value in `cf` whose key starts with `prefix`.
    fn scan<T: DeserializeOwned>(&self, cf: &'static str, prefix: &[u8]) -> Result<Vec<T>> {
        let handle = self.cf(cf)?;
        let mut items = Vec::new();
        let iter = if prefix.is_empty() {
            self.db.iterator_cf(handle, IteratorMode::Start)
        } else {
            self.db.prefix_iterator_cf(handle, prefix)
        };
        for item in iter {
            let (key, value) = item.map_err(storage_error)?;
            if !key.starts_with(prefix) {
                break;
            }
            items.push(serde_json::from_slice(&value)?);
        }
        Ok(items)
    }

    fn scan_filter<T: DeserializeOwned>(
        &self,
        cf: &'static str,
        keep: impl Fn(&T) -> bool,
    ) -> Result<Vec<T>> {
        Ok(self
            .scan::<T>(cf, &[])?
            .into_iter()
            .filter(|item| keep(item))
            .collect())
    }

    fn put_json<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf: &'static str,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        let handle = self.cf(cf)?;
        batch.put_cf(handle, key, serde_json::to_vec(value)?);
        Ok(())
    }

    fn build_batch(&self, set: &WriteSet) -> Result<WriteBatch> {
        let mut batch = WriteBatch::default();
        for write in &set.writes {
            match write {
                Write::Agent(a) => self.put_json(&mut batch, CF_AGENTS, a.agent_id.as_bytes(), a)?,
                Write::Edge(e) => {
                    self.put_json(&mut batch, CF_EDGES, &edge_key(e.agent_id, e.member_id), e)?
                }
                Write::Commission(c) => {
                    self.put_json(&mut batch, CF_COMMISSIONS, c.commission_id.as_bytes(), c)?
                }
                Write::Payment(p) => {
                    self.put_json(&mut batch, CF_PAYMENTS, p.payment_id.as_bytes(), p)?
                }
                Write::Withdrawal(w) => {
                    self.put_json(&mut batch, CF_WITHDRAWALS, w.withdrawal_id.as_bytes(), w)?
                }
                Write::Referral(r) => {
                    self.put_json(&mut batch, CF_REFERRALS, r.referral_id.as_bytes(), r)?
                }
                Write::LevelUpgrade(u) => {
                    let mut key = u.agent_id.as_bytes().to_vec();
                    key.extend_from_slice(Uuid::now_v7().as_bytes());
                    self.put_json(&mut batch, CF_LEVEL_UPGRADES, &key, u)?
                }
            }
        }
        Ok(batch)
    }
}

impl CommitView for RocksDbLedgerStore {
    fn stored_version(&self, write: &Write) -> Result<u64> {
        let version = match write {
            Write::Agent(a) => self
                .get_json::<Agent>(CF_AGENTS, a.agent_id.as_bytes())?
                .map(|s| s.version),
            Write::Edge(e) => self
                .get_json::<TeamEdge>(CF_EDGES, &edge_key(e.agent_id, e.member_id))?
                .map(|s| s.version),
            Write::Commission(c) => self
                .get_json::<CommissionEntry>(CF_COMMISSIONS, c.commission_id.as_bytes())?
                .map(|s| s.version),
            Write::Payment(p) => self
                .get_json::<PaymentRequest>(CF_PAYMENTS, p.payment_id.as_bytes())?
                .map(|s| s.version),
            Write::Withdrawal(w) => self
                .get_json::<WithdrawalRequest>(CF_WITHDRAWALS, w.withdrawal_id.as_bytes())?
                .map(|s| s.version),
            Write::Referral(r) => self
                .get_json::<Referral>(CF_REFERRALS, r.referral_id.as_bytes())?
                .map(|s| s.version),
            Write::LevelUpgrade(_) => None,
        };
        Ok(version.unwrap_or(0))
    }

    fn guard_holds(&self, guard: &Guard, set: &WriteSet) -> Result<bool> {
        let holds = match guard {
            Guard::NoActivePayment(order_id) => {
                let written: Vec<PaymentId> = set
                    .writes
                    .iter()
                    .filter_map(|w| match w {
                        Write::Payment(p) => Some(p.payment_id),
                        _ => None,
                    })
                    .collect();
                self.scan_filter::<PaymentRequest>(CF_PAYMENTS, |p| {
                    p.order_id() == order_id
                        && p.status.is_active()
                        && !written.contains(&p.payment_id)
                })?
                .is_empty()
            }
            Guard::AccountRefFree(account) => self
                .scan_filter::<Agent>(CF_AGENTS, |a| &a.account_ref == account)?
                .is_empty(),
            Guard::ReferralCodeFree(code) => self
                .scan_filter::<Agent>(CF_AGENTS, |a| &a.referral_code == code)?
                .is_empty(),
            Guard::NotReversed(id) => self
                .scan_filter::<CommissionEntry>(CF_COMMISSIONS, |c| c.reverses.as_ref() == Some(id))?
                .is_empty(),
            Guard::NoCommission(agent_id, order_id, r#type) => self
                .scan_filter::<CommissionEntry>(CF_COMMISSIONS, |c| {
                    c.agent_id == *agent_id
                        && &c.order_id == order_id
                        && c.r#type == *r#type
                        && !c.is_offset()
                })?
                .is_empty(),
            Guard::NoReferralFor(user_id) => self
                .scan_filter::<Referral>(CF_REFERRALS, |r| &r.referred_user_id == user_id)?
                .is_empty(),
            Guard::NoCycle { parent, child } => !in_upline(*parent, *child, |id| {
                Ok(self
                    .get_json::<Agent>(CF_AGENTS, id.as_bytes())?
                    .and_then(|a| a.parent_agent_id))
            })?,
        };
        Ok(holds)
    }
}

#[async_trait]
impl LedgerStore for RocksDbLedgerStore {
    async fn commit(&self, set: WriteSet) -> Result<()> {
        let _guard = self.commit_lock.lock().await;
        validate_write_set(self, &set)?;
        let batch = self.build_batch(&set)?;
        self.db.write(batch).map_err(storage_error)?;
        Ok(())
    }

    async fn agent(&self, agent_id: AgentId) -> Result<Option<Agent>> {
        self.get_json(CF_AGENTS, agent_id.as_bytes())
    }

    async fn agent_by_account(&self, account_ref: &str) -> Result<Option<Agent>> {
        Ok(self
            .scan_filter::<Agent>(CF_AGENTS, |a| a.account_ref == account_ref)?
            .into_iter()
            .next())
    }

    async fn agent_by_referral_code(&self, code: &str) -> Result<Option<Agent>> {
        Ok(self
            .scan_filter::<Agent>(CF_AGENTS, |a| a.referral_code == code)?
            .into_iter()
            .next())
    }

    async fn agents(&self) -> Result<Vec<Agent>> {
        self.scan(CF_AGENTS, &[])
    }

    async fn edge(&self, agent_id: AgentId, member_id: AgentId) -> Result<Option<TeamEdge>> {
        self.get_json(CF_EDGES, &edge_key(agent_id, member_id))
    }

    async fn edges_of(&self, agent_id: AgentId) -> Result<Vec<TeamEdge>> {
        self.scan(CF_EDGES, agent_id.as_bytes())
    }

    async fn commission(&self, commission_id: CommissionId) -> Result<Option<CommissionEntry>> {
        self.get_json(CF_COMMISSIONS, commission_id.as_bytes())
    }

    async fn commissions_for_agent(&self, agent_id: AgentId) -> Result<Vec<CommissionEntry>> {
        self.scan_filter(CF_COMMISSIONS, |c: &CommissionEntry| c.agent_id == agent_id)
    }

    async fn commissions_for_order(&self, order_id: &OrderId) -> Result<Vec<CommissionEntry>> {
        self.scan_filter(CF_COMMISSIONS, |c: &CommissionEntry| &c.order_id == order_id)
    }

    async fn payment(&self, payment_id: PaymentId) -> Result<Option<PaymentRequest>> {
        self.get_json(CF_PAYMENTS, payment_id.as_bytes())
    }

    async fn payments_for_order(&self, order_id: &OrderId) -> Result<Vec<PaymentRequest>> {
        self.scan_filter(CF_PAYMENTS, |p: &PaymentRequest| p.order_id() == order_id)
    }

    async fn payments_with_status(&self, status: PaymentStatus) -> Result<Vec<PaymentRequest>> {
        self.scan_filter(CF_PAYMENTS, |p: &PaymentRequest| p.status == status)
    }

    async fn withdrawal(&self, withdrawal_id: WithdrawalId) -> Result<Option<WithdrawalRequest>> {
        self.get_json(CF_WITHDRAWALS, withdrawal_id.as_bytes())
    }

    async fn withdrawals_for_agent(&self, agent_id: AgentId) -> Result<Vec<WithdrawalRequest>> {
        self.scan_filter(CF_WITHDRAWALS, |w: &WithdrawalRequest| w.agent_id == agent_id)
    }

    async fn referral(&self, referral_id: ReferralId) -> Result<Option<Referral>> {
        self.get_json(CF_REFERRALS, referral_id.as_bytes())
    }

    async fn referral_for_user(&self, user_id: &UserId) -> Result<Option<Referral>> {
        Ok(self
            .scan_filter::<Referral>(CF_REFERRALS, |r| &r.referred_user_id == user_id)?
            .into_iter()
            .next())
    }

    async fn referrals_for_agent(&self, agent_id: AgentId) -> Result<Vec<Referral>> {
        self.scan_filter(CF_REFERRALS, |r: &Referral| r.agent_id == agent_id)
    }

    async fn level_upgrades(&self, agent_id: AgentId) -> Result<Vec<LevelUpgrade>> {
        self.scan(CF_LEVEL_UPGRADES, agent_id.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentStatus;
    use crate::domain::team::TeamRelation;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDbLedgerStore::open(dir.path()).expect("Failed to open RocksDB");

        for cf in COLUMN_FAMILIES {
            assert!(store.db.cf_handle(cf).is_some(), "missing {cf}");
        }
    }

    #[tokio::test]
    async fn test_rocksdb_agent_round_trip_and_conflict() {
        let dir = tempdir().unwrap();
        let store = RocksDbLedgerStore::open(dir.path()).unwrap();

        let mut agent = Agent::new("acct-1", "CODE0001", 1, dec!(5), AgentStatus::Active, Utc::now());
        agent.version = 1;
        store
            .commit(WriteSet::new().put(Write::Agent(agent.clone())))
            .await
            .unwrap();

        assert_eq!(store.agent(agent.agent_id).await.unwrap(), Some(agent.clone()));
        assert_eq!(
            store.agent_by_referral_code("CODE0001").await.unwrap(),
            Some(agent.clone())
        );

        // Same version again is a lost update.
        let err = store
            .commit(WriteSet::new().put(Write::Agent(agent)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_rocksdb_edges_prefix_scan() {
        let dir = tempdir().unwrap();
        let store = RocksDbLedgerStore::open(dir.path()).unwrap();

        let parent = AgentId::new();
        let other = AgentId::new();
        let mut set = WriteSet::new();
        for agent_id in [parent, parent, other] {
            let mut edge = TeamEdge::new(agent_id, AgentId::new(), TeamRelation::Direct, Utc::now());
            edge.version = 1;
            set = set.put(Write::Edge(edge));
        }
        store.commit(set).await.unwrap();

        assert_eq!(store.edges_of(parent).await.unwrap().len(), 2);
        assert_eq!(store.edges_of(other).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rocksdb_rejects_upline_cycle() {
        let dir = tempdir().unwrap();
        let store = RocksDbLedgerStore::open(dir.path()).unwrap();

        let mut top = Agent::new("top", "CODE0001", 1, dec!(5), AgentStatus::Active, Utc::now());
        let mut below = Agent::new("below", "CODE0002", 1, dec!(5), AgentStatus::Active, Utc::now());
        top.version = 1;
        below.version = 1;
        below.parent_agent_id = Some(top.agent_id);
        store
            .commit(
                WriteSet::new()
                    .put(Write::Agent(top.clone()))
                    .put(Write::Agent(below.clone())),
            )
            .await
            .unwrap();

        top.parent_agent_id = Some(below.agent_id);
        top.version = 2;
        let err = store
            .commit(WriteSet::new().put(Write::Agent(top.clone())).guard(Guard::NoCycle {
                parent: below.agent_id,
                child: top.agent_id,
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
        assert_eq!(store.agent(top.agent_id).await.unwrap().unwrap().parent_agent_id, None);
    }
}
