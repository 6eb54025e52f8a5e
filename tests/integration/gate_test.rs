//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 加载合并集成测试

#[path = "../common/mod.rs"]
mod common;

use common::{manager_for, plain, RecordingStore};
use futures::future::join_all;
use oxstore::{
    CacheError, CacheObject, CacheStore, KeyCacheObject, LoadGate, LoadVisitor, SessionHolders,
    StoreConfig,
};
use std::sync::Arc;

#[tokio::test]
async fn test_concurrent_loads_share_one_store_call() {
    let store = Arc::new(RecordingStore::new().with_load_delay(50));
    store.insert("hot", plain("value"));
    let mgr = manager_for(
        "coalesce",
        store.clone(),
        &SessionHolders::new(),
        &StoreConfig::default(),
    );

    let key = KeyCacheObject::new("hot");
    let results = join_all((0..16).map(|_| mgr.load(None, &key))).await;

    assert_eq!(results.len(), 16);
    for res in results {
        assert_eq!(res.unwrap(), Some(CacheObject::from("value")));
    }
    assert_eq!(store.loads(), 1);
}

#[tokio::test]
async fn test_shared_failure_reaches_every_waiter() {
    let store = Arc::new(RecordingStore::new().with_load_delay(50));
    store.fail_loads(true);
    let mgr = manager_for(
        "coalesce_fail",
        store.clone(),
        &SessionHolders::new(),
        &StoreConfig::default(),
    );

    let key = KeyCacheObject::new("broken");
    let results = join_all((0..8).map(|_| mgr.load(None, &key))).await;

    for res in results {
        assert!(matches!(res, Err(CacheError::Load { .. })));
    }
    assert_eq!(store.loads(), 1);

    // 失败不会被缓存，之后的加载重新访问存储
    store.fail_loads(false);
    assert_eq!(mgr.load(None, &key).await.unwrap(), None);
    assert_eq!(store.loads(), 2);
}

#[tokio::test]
async fn test_sequential_loads_are_not_coalesced() {
    let store = Arc::new(RecordingStore::new());
    store.insert("k", plain("v"));
    let mgr = manager_for(
        "sequential",
        store.clone(),
        &SessionHolders::new(),
        &StoreConfig::default(),
    );

    let key = KeyCacheObject::new("k");
    for _ in 0..3 {
        mgr.load(None, &key).await.unwrap();
    }
    assert_eq!(store.loads(), 3);
}

#[tokio::test]
async fn test_bulk_load_joins_in_flight_single_load() {
    let store = Arc::new(RecordingStore::new().with_load_delay(50));
    store.insert("a", plain("1"));
    store.insert("b", plain("2"));
    let mgr = manager_for(
        "bulk_join",
        store.clone(),
        &SessionHolders::new(),
        &StoreConfig::default(),
    );

    let a = KeyCacheObject::new("a");
    let keys = vec![a.clone(), KeyCacheObject::new("b")];
    let mut seen = Vec::new();

    let mut visit = |k, v| seen.push((k, v));
    let (single, bulk) = futures::join!(
        mgr.load(None, &a),
        mgr.load_all(None, &keys, LoadVisitor::Value(&mut visit))
    );

    assert_eq!(single.unwrap(), Some(CacheObject::from("1")));
    assert!(bulk.unwrap());
    seen.sort_by_key(|(k, _)| k.to_string());
    assert_eq!(
        seen,
        vec![
            (a, Some(CacheObject::from("1"))),
            (KeyCacheObject::new("b"), Some(CacheObject::from("2"))),
        ]
    );
    // "a" 由单键加载负责，批量加载只为 "b" 访问存储
    assert_eq!(store.loads(), 2);
    assert_eq!(store.load_alls(), 0);
}

#[tokio::test]
async fn test_bulk_load_at_threshold_goes_direct() {
    let store = Arc::new(RecordingStore::new());
    let cfg = StoreConfig::default();
    let mgr = manager_for("threshold", store.clone(), &SessionHolders::new(), &cfg);
    assert_eq!(mgr.load_all_threshold(), Some(cfg.load_all_threshold));

    let keys: Vec<_> = (0..=cfg.load_all_threshold)
        .map(|i| KeyCacheObject::new(format!("k{}", i).as_str()))
        .collect();
    for key in keys.iter().step_by(2) {
        store.insert(key.object().clone(), plain("v"));
    }

    let mut found = 0;
    mgr.load_all(
        None,
        &keys,
        LoadVisitor::Value(&mut |_, v| {
            if v.is_some() {
                found += 1;
            }
        }),
    )
    .await
    .unwrap();

    assert_eq!(found, keys.len().div_ceil(2));
    assert_eq!(store.load_alls(), 1);
    assert_eq!(store.loads(), 0);
}

#[tokio::test]
async fn test_gate_load_all_with_no_contention() {
    let store: Arc<RecordingStore> = Arc::new(RecordingStore::new());
    store.insert("x", plain("1"));
    let gate = LoadGate::new(store.clone() as Arc<dyn CacheStore>, 5);

    let keys = vec![CacheObject::from("x"), CacheObject::from("y")];
    let mut seen = Vec::new();
    gate.load_all(None, &keys, &mut |k, v| seen.push((k, v)))
        .await
        .unwrap();

    assert_eq!(seen, vec![(CacheObject::from("x"), plain("1"))]);
    assert_eq!(store.load_alls(), 1);
    assert_eq!(gate.in_flight(), 0);
}
