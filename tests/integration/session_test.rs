//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 存储会话集成测试

#[path = "../common/mod.rs"]
mod common;

use common::{manager_for, RecordingStore};
use oxstore::{
    CacheObject, CacheStore, CacheTx, CacheVersion, KeyCacheObject, SessionHolders, StoreConfig,
};
use std::sync::Arc;

fn near_config() -> StoreConfig {
    StoreConfig {
        near_cache: true,
        ..Default::default()
    }
}

async fn put(mgr: &oxstore::StoreManager, tx: Option<&CacheTx>, key: &str) {
    mgr.put(
        tx,
        &KeyCacheObject::new(key),
        &CacheObject::from(key),
        CacheVersion::new(1, 1, 1),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_session_shared_across_managers_in_transaction() {
    let store = Arc::new(RecordingStore::new().session_aware());
    let holders = SessionHolders::new();
    let primary = manager_for("primary", store.clone(), &holders, &StoreConfig::default());
    let near = manager_for("near", store.clone(), &holders, &near_config());
    assert_eq!(holders.len(), 1);

    let tx = CacheTx::new();
    put(&primary, Some(&tx), "a").await;
    put(&near, Some(&tx), "b").await;
    primary.end_session(&tx, true).await.unwrap();

    let seen = store.sessions();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|s| s.tx == Some(tx.id())));
    // 同一个会话，调用次数依次递增
    assert_eq!(
        seen.iter().map(|s| s.prior_calls).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(
        seen.iter().map(|s| s.cache.as_str()).collect::<Vec<_>>(),
        vec!["primary", "near", "primary"]
    );
}

#[tokio::test]
async fn test_end_session_is_idempotent() {
    let store = Arc::new(RecordingStore::new().session_aware());
    let holders = SessionHolders::new();
    let primary = manager_for("idem_primary", store.clone(), &holders, &StoreConfig::default());
    let near = manager_for("idem_near", store.clone(), &holders, &near_config());

    let tx = CacheTx::new();
    put(&primary, Some(&tx), "a").await;

    primary.end_session(&tx, true).await.unwrap();
    near.end_session(&tx, true).await.unwrap();
    primary.end_session(&tx, false).await.unwrap();

    assert_eq!(store.tx_ends(), 1);
    let registry = holders.registry_for(&(store.clone() as Arc<dyn CacheStore>));
    assert!(!tx.has_session(&registry));
}

#[tokio::test]
async fn test_session_removed_when_tx_end_fails() {
    let store = Arc::new(RecordingStore::new().session_aware());
    store.fail_tx_end(true);
    let holders = SessionHolders::new();
    let mgr = manager_for("tx_end_fail", store.clone(), &holders, &StoreConfig::default());
    let registry = holders.registry_for(&(store.clone() as Arc<dyn CacheStore>));

    let tx = CacheTx::new();
    put(&mgr, Some(&tx), "a").await;
    assert!(tx.has_session(&registry));

    let err = mgr.end_session(&tx, true).await.unwrap_err();
    assert!(matches!(err, oxstore::CacheError::Write { .. }), "{:?}", err);
    assert!(!tx.has_session(&registry));

    // 同一事务之后的调用得到新的会话
    put(&mgr, Some(&tx), "b").await;
    let last = store.sessions().pop().unwrap();
    assert_eq!(last.prior_calls, 0);
}

#[tokio::test]
async fn test_calls_without_transaction_get_fresh_sessions() {
    let store = Arc::new(RecordingStore::new().session_aware());
    let mgr = manager_for(
        "no_tx",
        store.clone(),
        &SessionHolders::new(),
        &StoreConfig::default(),
    );

    put(&mgr, None, "a").await;
    put(&mgr, None, "b").await;

    let seen = store.sessions();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|s| s.tx.is_none() && s.prior_calls == 0));
}

#[tokio::test]
async fn test_store_without_sessions_sees_none() {
    let store = Arc::new(RecordingStore::new());
    let mgr = manager_for(
        "sessionless",
        store.clone(),
        &SessionHolders::new(),
        &StoreConfig::default(),
    );

    let tx = CacheTx::new();
    put(&mgr, Some(&tx), "a").await;
    mgr.end_session(&tx, true).await.unwrap();

    assert!(store.sessions().is_empty());
    assert_eq!(store.tx_ends(), 1);
}

#[tokio::test]
async fn test_separate_stores_get_separate_sessions() {
    let first = Arc::new(RecordingStore::new().session_aware());
    let second = Arc::new(RecordingStore::new().session_aware());
    let holders = SessionHolders::new();
    let a = manager_for("first", first.clone(), &holders, &StoreConfig::default());
    let b = manager_for("second", second.clone(), &holders, &StoreConfig::default());
    assert_eq!(holders.len(), 2);

    let tx = CacheTx::new();
    put(&a, Some(&tx), "x").await;
    put(&b, Some(&tx), "y").await;

    assert_eq!(first.sessions()[0].prior_calls, 0);
    assert_eq!(second.sessions()[0].prior_calls, 0);

    a.end_session(&tx, true).await.unwrap();
    b.end_session(&tx, false).await.unwrap();
    assert_eq!(first.tx_ends(), 1);
    assert_eq!(second.tx_ends(), 1);
}
