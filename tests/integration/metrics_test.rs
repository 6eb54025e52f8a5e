//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 存储操作指标集成测试

#[path = "../common/mod.rs"]
mod common;

use common::{generate_unique_cache_name, manager_for, RecordingStore};
use oxstore::metrics::{get_metrics_string, GLOBAL_METRICS};
use oxstore::utils::create_write_behind_config;
use oxstore::{CacheObject, CacheVersion, KeyCacheObject, SessionHolders, StoreConfig};
use serial_test::serial;
use std::sync::Arc;

#[tokio::test]
#[serial]
async fn test_store_operations_are_counted() {
    let name = generate_unique_cache_name("metrics_ops");
    let store = Arc::new(RecordingStore::new());
    store.fail_at("bad");
    let mgr = manager_for(&name, store, &SessionHolders::new(), &StoreConfig::default());

    let ver = CacheVersion::new(1, 1, 1);
    mgr.put(None, &KeyCacheObject::new("k"), &CacheObject::from("v"), ver)
        .await
        .unwrap();
    mgr.load(None, &KeyCacheObject::new("k")).await.unwrap();
    mgr.put(None, &KeyCacheObject::new("bad"), &CacheObject::from("v"), ver)
        .await
        .unwrap_err();

    assert_eq!(GLOBAL_METRICS.store_op_count(&name, "put", "ok"), 1);
    assert_eq!(GLOBAL_METRICS.store_op_count(&name, "put", "error"), 1);
    assert_eq!(GLOBAL_METRICS.store_op_count(&name, "load", "ok"), 1);

    let output = get_metrics_string();
    assert!(output.contains(&format!(
        "store_operations_total{{cache=\"{}\", operation=\"put\", result=\"error\"}} 1",
        name
    )));
    assert!(output.contains(&format!(
        "store_operation_duration_seconds_count{{cache=\"{}\", operation=\"load\"}} 1",
        name
    )));
}

#[tokio::test]
#[serial]
async fn test_write_behind_gauges() {
    let name = generate_unique_cache_name("metrics_wb");
    let store = Arc::new(RecordingStore::new());
    store.fail_at("bad");
    let mut cfg = create_write_behind_config(1000, 0);
    cfg.write_behind.max_retries = 0;
    let mgr = manager_for(&name, store, &SessionHolders::new(), &cfg);

    let ver = CacheVersion::new(1, 1, 1);
    for key in ["a", "bad"] {
        mgr.put(None, &KeyCacheObject::new(key), &CacheObject::from("v"), ver)
            .await
            .unwrap();
    }
    assert!(get_metrics_string().contains(&format!(
        "store_write_behind_buffer_size{{cache=\"{}\"}} 2",
        name
    )));

    mgr.force_flush().await.unwrap_err();
    let output = get_metrics_string();
    assert!(output.contains(&format!(
        "store_write_behind_buffer_size{{cache=\"{}\"}} 0",
        name
    )));
    assert!(output.contains(&format!(
        "store_write_behind_flush_failures_total{{cache=\"{}\"}} 1",
        name
    )));
}
