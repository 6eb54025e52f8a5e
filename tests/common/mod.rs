//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了测试的通用工具函数和设置。

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use oxstore::context::DefaultCacheContext;
use oxstore::store::{CacheStore, EntriesView, KeysView, LoadCacheSink, StoreCapabilities};
use oxstore::{
    CacheObject, SessionHolders, StoreConfig, StoreEntry, StoreError, StoreManager, StoreResult,
    StoreSession, StoreValue,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub use oxstore::utils::{generate_unique_cache_name, setup_logging};

/// 存储在一次调用中看到的会话
#[derive(Debug, Clone, PartialEq)]
pub struct SessionObservation {
    pub op: &'static str,
    pub tx: Option<Uuid>,
    pub cache: String,
    /// 本次调用之前同一会话上已经发生的调用次数
    pub prior_calls: u64,
}

/// 记录调用并可注入故障的存储
#[derive(Debug, Default)]
pub struct RecordingStore {
    data: DashMap<CacheObject, StoreValue>,
    caps: StoreCapabilities,
    loads: AtomicUsize,
    load_alls: AtomicUsize,
    writes: AtomicUsize,
    write_alls: AtomicUsize,
    deletes: AtomicUsize,
    delete_alls: AtomicUsize,
    tx_ends: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
    load_delay_ms: AtomicU64,
    fail_loads: AtomicBool,
    fail_tx_end: AtomicBool,
    fail_key: Mutex<Option<CacheObject>>,
    sessions: Mutex<Vec<SessionObservation>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_aware(mut self) -> Self {
        self.caps.session_aware = true;
        self
    }

    pub fn local(mut self) -> Self {
        self.caps.local = true;
        self
    }

    pub fn lifecycle_aware(mut self) -> Self {
        self.caps.lifecycle_aware = true;
        self
    }

    /// 每次加载前等待，便于构造并发重叠
    pub fn with_load_delay(self, ms: u64) -> Self {
        self.load_delay_ms.store(ms, Ordering::Relaxed);
        self
    }

    /// 所有加载都失败
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::Relaxed);
    }

    /// tx_end 失败
    pub fn fail_tx_end(&self, fail: bool) {
        self.fail_tx_end.store(fail, Ordering::Relaxed);
    }

    /// 处理到该键时失败（该键之前的条目已写入）
    pub fn fail_at(&self, key: impl Into<CacheObject>) {
        *self.fail_key.lock().unwrap() = Some(key.into());
    }

    pub fn insert(&self, key: impl Into<CacheObject>, value: StoreValue) {
        self.data.insert(key.into(), value);
    }

    pub fn get(&self, key: impl Into<CacheObject>) -> Option<StoreValue> {
        self.data.get(&key.into()).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn load_alls(&self) -> usize {
        self.load_alls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn write_alls(&self) -> usize {
        self.write_alls.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn delete_alls(&self) -> usize {
        self.delete_alls.load(Ordering::SeqCst)
    }

    pub fn tx_ends(&self) -> usize {
        self.tx_ends.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// 所有存储调用的总次数
    pub fn total_calls(&self) -> usize {
        self.loads()
            + self.load_alls()
            + self.writes()
            + self.write_alls()
            + self.deletes()
            + self.delete_alls()
            + self.tx_ends()
    }

    pub fn sessions(&self) -> Vec<SessionObservation> {
        self.sessions.lock().unwrap().clone()
    }

    fn observe(&self, op: &'static str, ses: Option<&StoreSession>) {
        if let Some(ses) = ses {
            let prior_calls = ses.with_properties(|p| {
                let prior = p.get("calls").and_then(|v| v.as_u64()).unwrap_or(0);
                p.insert("calls".to_string(), serde_json::json!(prior + 1));
                prior
            });
            self.sessions.lock().unwrap().push(SessionObservation {
                op,
                tx: ses.transaction(),
                cache: ses.cache_name(),
                prior_calls,
            });
        }
    }

    fn check(&self, key: &CacheObject) -> StoreResult<()> {
        if self.fail_key.lock().unwrap().as_ref() == Some(key) {
            return Err(StoreError::Writer(format!("injected failure at {}", key)));
        }
        Ok(())
    }

    async fn before_load(&self) -> StoreResult<()> {
        let delay = self.load_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_loads.load(Ordering::Relaxed) {
            return Err(StoreError::Loader("injected load failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for RecordingStore {
    fn capabilities(&self) -> StoreCapabilities {
        self.caps
    }

    async fn load(
        &self,
        ses: Option<&StoreSession>,
        key: &CacheObject,
    ) -> StoreResult<Option<StoreValue>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.observe("load", ses);
        self.before_load().await?;
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn load_all(
        &self,
        ses: Option<&StoreSession>,
        keys: &[CacheObject],
    ) -> StoreResult<Vec<(CacheObject, StoreValue)>> {
        self.load_alls.fetch_add(1, Ordering::SeqCst);
        self.observe("load_all", ses);
        self.before_load().await?;
        Ok(keys
            .iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn load_cache(
        &self,
        ses: Option<&StoreSession>,
        sink: &mut LoadCacheSink<'_>,
        _args: &[serde_json::Value],
    ) -> StoreResult<()> {
        self.observe("load_cache", ses);
        let snapshot: Vec<(CacheObject, StoreValue)> = self
            .data
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (k, v) in snapshot {
            sink(k, v);
        }
        Ok(())
    }

    async fn write(&self, ses: Option<&StoreSession>, entry: StoreEntry) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.observe("write", ses);
        self.check(&entry.key)?;
        self.data.insert(entry.key, entry.value);
        Ok(())
    }

    async fn write_all(
        &self,
        ses: Option<&StoreSession>,
        entries: &mut EntriesView,
    ) -> StoreResult<()> {
        self.write_alls.fetch_add(1, Ordering::SeqCst);
        self.observe("write_all", ses);
        entries.try_consume(|e| {
            self.check(&e.key)?;
            self.data.insert(e.key.clone(), e.value.clone());
            Ok(())
        })
    }

    async fn delete(&self, ses: Option<&StoreSession>, key: &CacheObject) -> StoreResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.observe("delete", ses);
        self.check(key)?;
        self.data.remove(key);
        Ok(())
    }

    async fn delete_all(&self, ses: Option<&StoreSession>, keys: &mut KeysView) -> StoreResult<()> {
        self.delete_alls.fetch_add(1, Ordering::SeqCst);
        self.observe("delete_all", ses);
        keys.try_consume(|k| {
            self.check(k)?;
            self.data.remove(k);
            Ok(())
        })
    }

    async fn tx_end(&self, ses: Option<&StoreSession>, _commit: bool) -> StoreResult<()> {
        self.tx_ends.fetch_add(1, Ordering::SeqCst);
        self.observe("tx_end", ses);
        if self.fail_tx_end.load(Ordering::Relaxed) {
            return Err(StoreError::Writer("injected tx_end failure".to_string()));
        }
        Ok(())
    }

    async fn start(&self) -> StoreResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> StoreResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 普通存储值
pub fn plain(v: &str) -> StoreValue {
    StoreValue::Plain(CacheObject::from(v))
}

/// 使用默认配置为存储创建管理器
pub fn manager_for(
    name: &str,
    store: Arc<dyn CacheStore>,
    holders: &SessionHolders,
    cfg: &StoreConfig,
) -> StoreManager {
    setup_logging();
    let ctx = Arc::new(DefaultCacheContext::new(name));
    StoreManager::new(ctx, holders, Some(store), cfg).expect("failed to create store manager")
}

/// 使用指定上下文创建管理器
pub fn manager_with_context(
    ctx: DefaultCacheContext,
    store: Arc<dyn CacheStore>,
    cfg: &StoreConfig,
) -> StoreManager {
    setup_logging();
    StoreManager::new(Arc::new(ctx), &SessionHolders::new(), Some(store), cfg)
        .expect("failed to create store manager")
}
