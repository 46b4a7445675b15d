//! AttestationStore over SQLite: data survives a reopen

use std::sync::Arc;
use std::time::Duration;

use notary_core::{verify_hash_chain, ReceiptMode};
use notary_persist::{AttestationStore, SqliteBackend, StoreConfig, SubmitRequest};

#[tokio::test]
async fn test_receipts_and_chain_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("notary.db").display());

    let id = {
        let backend = SqliteBackend::new(&url).await.unwrap();
        let store = AttestationStore::new(Arc::new(backend), StoreConfig::default());
        for commit in ["one", "two", "three"] {
            store
                .submit(SubmitRequest {
                    initiator_commit: Some(commit.to_string()),
                    chain_scope: Some("acct-1".to_string()),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        store.locate("two").await.unwrap().unwrap().id
    };

    let backend = SqliteBackend::new(&url).await.unwrap();
    let store = AttestationStore::new(Arc::new(backend), StoreConfig::default());

    let record = store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.mode, ReceiptMode::Pending);
    assert_eq!(record.initiator_commit, "two");

    let chain = store.scope_records("acct-1").await.unwrap();
    assert_eq!(chain.len(), 3);
    assert!(verify_hash_chain(&chain).valid);
    assert_eq!(store.list_jobs(10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_jobs_expire_with_ttl() {
    let backend = SqliteBackend::new("sqlite::memory:").await.unwrap();
    let config = StoreConfig {
        job_ttl: Duration::from_millis(30),
        ..Default::default()
    };
    let store = AttestationStore::new(Arc::new(backend), config);

    store
        .submit(SubmitRequest {
            initiator_commit: Some("abc".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(store.list_jobs(10).await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(store.list_jobs(10).await.unwrap().is_empty());
    // the receipt itself does not expire
    assert!(store.locate("abc").await.unwrap().is_some());
}
