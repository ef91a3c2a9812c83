use chrono::Utc;
use commission_ledger::domain::agent::{Agent, AgentStatus};
use commission_ledger::domain::ports::{Guard, LedgerStoreRef, Write, WriteSet};
use commission_ledger::error::LedgerError;
use commission_ledger::infrastructure::in_memory::InMemoryLedgerStore;
use rust_decimal_macros::dec;
use std::sync::Arc;

#[tokio::test]
async fn test_store_as_trait_object() {
    let store: LedgerStoreRef = Arc::new(InMemoryLedgerStore::new());

    let mut agent = Agent::new("alice", "ABCD1234", 1, dec!(5), AgentStatus::Active, Utc::now());
    agent.version = 1;
    let agent_id = agent.agent_id;

    // Verify Send + Sync by spawning tasks
    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .commit(
                    WriteSet::new()
                        .put(Write::Agent(agent))
                        .guard(Guard::AccountRefFree("alice".into())),
                )
                .await
        })
    };
    writer.await.unwrap().unwrap();

    let reader = {
        let store = store.clone();
        tokio::spawn(async move { store.agent_by_referral_code("ABCD1234").await })
    };
    let stored = reader.await.unwrap().unwrap().unwrap();
    assert_eq!(stored.agent_id, agent_id);
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn test_stale_version_is_rejected() {
    let store: LedgerStoreRef = Arc::new(InMemoryLedgerStore::new());

    let mut agent = Agent::new("bob", "BOB00001", 1, dec!(5), AgentStatus::Active, Utc::now());
    agent.version = 1;
    store
        .commit(WriteSet::new().put(Write::Agent(agent.clone())))
        .await
        .unwrap();

    // Same version again: someone else's write won
    agent.total_sales = dec!(10);
    let err = store
        .commit(WriteSet::new().put(Write::Agent(agent.clone())))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Conflict(_)));

    let stored = store.agent(agent.agent_id).await.unwrap().unwrap();
    assert_eq!(stored.total_sales, dec!(0));
}
