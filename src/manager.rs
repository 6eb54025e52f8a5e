//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了存储同步管理器，负责决定每个缓存操作是否以及如何访问后端存储。

use crate::adapter::KeyValueAdapter;
use crate::config::StoreConfig;
use crate::context::CacheContext;
use crate::error::{CacheError, Result, StoreError};
use crate::metrics::GLOBAL_METRICS;
use crate::object::{CacheObject, CacheVersion, KeyCacheObject, StoreEntry, StoreValue};
use crate::session::{CacheTx, SessionHolders, SessionRegistry, SessionScope};
use crate::store::{CacheStore, EntriesView, KeysView, StoreCapabilities};
use crate::sync::{LoadGate, WriteBehindStore};
use ahash::{AHashMap, AHashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// 批量加载的访问器
///
/// 一次调用只使用一种形式；带版本的形式要求本地存储
pub enum LoadVisitor<'a> {
    /// (键, 值)，值可能不存在
    Value(&'a mut (dyn FnMut(KeyCacheObject, Option<CacheObject>) + Send)),
    /// (键, 值, 版本)，只对存在的键调用，值保持存储中的形式
    Versioned(&'a mut (dyn FnMut(KeyCacheObject, CacheObject, CacheVersion) + Send)),
}

/// 遍历整个存储时的访问器：(键, 值, 本地存储的版本)
pub type LoadCacheVisitor<'a> =
    dyn FnMut(KeyCacheObject, CacheObject, Option<CacheVersion>) + Send + 'a;

/// 事务结束时保证移除会话，即使通知存储失败
struct DetachOnDrop<'a> {
    registry: &'a SessionRegistry,
    tx: &'a CacheTx,
}

impl Drop for DetachOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.detach(self.tx);
    }
}

/// 存储同步管理器
///
/// 负责把缓存引擎的加载、写入、删除和批量操作同步到后端存储
pub struct StoreManager {
    ctx: Arc<dyn CacheContext>,
    /// 用户配置的原始存储
    cfg_store: Option<Arc<dyn CacheStore>>,
    /// 实际使用的存储（启用写后缓冲时为包装后的存储）
    store: Option<Arc<dyn CacheStore>>,
    write_behind_store: Option<Arc<WriteBehindStore>>,
    gate: Option<LoadGate>,
    sessions: Option<Arc<SessionRegistry>>,
    caps: StoreCapabilities,
    write_through: bool,
    write_behind: bool,
    near_cache: bool,
    convert_binary: AtomicBool,
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("cache", &self.ctx.name())
            .field("store", &self.store)
            .field("caps", &self.caps)
            .field("write_through", &self.write_through)
            .field("write_behind", &self.write_behind)
            .field("convert_binary", &self.convert_binary())
            .finish()
    }
}

impl StoreManager {
    /// 创建存储同步管理器
    ///
    /// # 参数
    ///
    /// * `ctx` - 缓存上下文
    /// * `holders` - 会话注册表集合，共享同一存储的管理器应传入同一个集合
    /// * `store` - 后端存储，None 表示未配置存储
    /// * `cfg` - 存储配置
    ///
    /// # 返回值
    ///
    /// 配置无效时返回配置错误
    pub fn new(
        ctx: Arc<dyn CacheContext>,
        holders: &SessionHolders,
        store: Option<Arc<dyn CacheStore>>,
        cfg: &StoreConfig,
    ) -> Result<Self> {
        cfg.validate()?;

        let caps = store
            .as_ref()
            .map(|s| s.capabilities())
            .unwrap_or_default();
        let sessions = store.as_ref().map(|s| holders.registry_for(s));

        let write_behind_store = match &store {
            Some(s) if cfg.write_behind.enabled => Some(Arc::new(WriteBehindStore::new(
                ctx.name(),
                s.clone(),
                cfg.write_behind.clone(),
                cfg.failure_warn_threshold,
            ))),
            _ => None,
        };
        let effective: Option<Arc<dyn CacheStore>> = match &write_behind_store {
            Some(wb) => Some(wb.clone() as Arc<dyn CacheStore>),
            None => store.clone(),
        };
        let gate = effective
            .as_ref()
            .map(|s| LoadGate::new(s.clone(), cfg.load_all_threshold));

        let mut convert_binary = !ctx.keep_binary_in_store();
        if convert_binary && !ctx.binary_enabled() {
            warn!(
                "keep_binary_in_store is disabled but binary mode is not enabled, \
                 objects are passed to the store as is [cache={}]",
                ctx.name()
            );
            convert_binary = false;
        }

        debug!(
            "Store manager created [cache={}, configured={}, local={}, sessions={}, write_behind={}]",
            ctx.name(),
            store.is_some(),
            caps.local,
            caps.session_aware,
            cfg.write_behind.enabled
        );

        Ok(Self {
            ctx,
            cfg_store: store,
            store: effective,
            write_behind_store,
            gate,
            sessions,
            caps,
            write_through: cfg.write_through,
            write_behind: cfg.write_behind.enabled,
            near_cache: cfg.near_cache,
            convert_binary: AtomicBool::new(convert_binary),
        })
    }

    /// 是否配置了存储
    pub fn is_configured(&self) -> bool {
        self.store.is_some()
    }

    /// 存储是否为本地存储（值与版本一起保存）
    pub fn is_local_store(&self) -> bool {
        self.caps.local
    }

    pub fn write_through(&self) -> bool {
        self.write_through
    }

    pub fn write_behind(&self) -> bool {
        self.write_behind
    }

    /// 写入存储前是否把二进制对象解包为普通对象
    pub fn convert_binary(&self) -> bool {
        self.convert_binary.load(Ordering::Relaxed)
    }

    pub fn set_convert_binary(&self, convert: bool) {
        self.convert_binary.store(convert, Ordering::Relaxed);
    }

    /// 主节点之外的副本是否也需要写存储
    pub fn write_to_store_from_dht(&self) -> bool {
        self.write_behind || self.caps.local
    }

    /// 实际使用的存储（可能被写后缓冲包装）
    pub fn store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.store.as_ref()
    }

    /// 用户配置的原始存储
    pub fn configured_store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cfg_store.as_ref()
    }

    /// 写后缓冲存储（未启用时为 None）
    pub fn write_behind_store(&self) -> Option<&Arc<WriteBehindStore>> {
        self.write_behind_store.as_ref()
    }

    /// 批量加载绕过合并门的阈值
    pub fn load_all_threshold(&self) -> Option<usize> {
        self.gate.as_ref().map(|g| g.load_all_threshold())
    }

    fn cache_name(&self) -> &str {
        self.ctx.name()
    }

    fn adapter(&self) -> KeyValueAdapter<'_> {
        KeyValueAdapter::new(self.ctx.as_ref(), self.convert_binary(), self.caps.local)
    }

    fn session(&self, tx: Option<&CacheTx>) -> Option<SessionScope> {
        self.sessions
            .as_ref()
            .and_then(|r| r.begin(tx, self.cache_name()))
    }

    fn record(&self, op: &str, started: Instant, ok: bool) {
        GLOBAL_METRICS.record_store_op(self.cache_name(), op, if ok { "ok" } else { "error" });
        GLOBAL_METRICS.record_duration(self.cache_name(), op, started.elapsed().as_secs_f64());
    }

    fn binary_mismatch(&self, e: &StoreError) -> Option<CacheError> {
        match e {
            StoreError::TypeMismatch(_) if self.ctx.binary_enabled() => {
                Some(CacheError::Configuration(format!(
                    "Cache store must work with binary objects if binary mode is enabled for cache [cache={}]: {}",
                    self.cache_name(),
                    e
                )))
            }
            _ => None,
        }
    }

    fn load_error(&self, e: StoreError) -> CacheError {
        self.binary_mismatch(&e).unwrap_or_else(|| CacheError::Load {
            cache: self.cache_name().to_string(),
            source: e,
        })
    }

    fn write_error(&self, e: StoreError) -> CacheError {
        self.binary_mismatch(&e).unwrap_or_else(|| CacheError::Write {
            cache: self.cache_name().to_string(),
            source: e,
        })
    }

    fn partial_error(&self, e: StoreError, keys: Vec<KeyCacheObject>) -> CacheError {
        if let Some(err) = self.binary_mismatch(&e) {
            return err;
        }
        if keys.is_empty() {
            return self.write_error(e);
        }
        CacheError::PartialUpdate {
            cache: self.cache_name().to_string(),
            keys,
            source: e,
        }
    }

    async fn load_raw(
        &self,
        gate: &LoadGate,
        tx: Option<&CacheTx>,
        key: &KeyCacheObject,
    ) -> Result<Option<StoreValue>> {
        let store_key = self.adapter().to_store_key(key)?;
        debug!("Loading value from store for key: {}", store_key);

        let started = Instant::now();
        let ses = self.session(tx);
        let res = gate.load(ses.as_deref(), &store_key).await;
        drop(ses);
        self.record("load", started, res.is_ok());
        res.map_err(|e| self.load_error(e))
    }

    /// 从存储加载单个键
    ///
    /// 内部键直接返回 None
    #[instrument(skip(self, tx), level = "debug", fields(cache = %self.cache_name()))]
    pub async fn load(
        &self,
        tx: Option<&CacheTx>,
        key: &KeyCacheObject,
    ) -> Result<Option<CacheObject>> {
        let Some(gate) = &self.gate else {
            return Ok(None);
        };
        if key.is_internal() {
            return Ok(None);
        }

        let raw = self.load_raw(gate, tx, key).await?;
        let value = self.adapter().from_store(raw)?;
        debug!(
            "Loaded value from store [key={}, found={}]",
            key,
            value.is_some()
        );
        Ok(value)
    }

    /// 从存储批量加载
    ///
    /// 键数少于阈值时经过合并门，否则直接调用存储的批量接口。
    /// 返回是否配置了存储。
    #[instrument(skip(self, tx, keys, visitor), level = "debug", fields(cache = %self.cache_name(), keys = keys.len()))]
    pub async fn load_all(
        &self,
        tx: Option<&CacheTx>,
        keys: &[KeyCacheObject],
        visitor: LoadVisitor<'_>,
    ) -> Result<bool> {
        let (Some(store), Some(gate)) = (&self.store, &self.gate) else {
            if let LoadVisitor::Value(vis) = visitor {
                for key in keys {
                    vis(key.clone(), None);
                }
            }
            return Ok(false);
        };

        if matches!(visitor, LoadVisitor::Versioned(_)) && !self.caps.local {
            return Err(CacheError::Configuration(format!(
                "Versioned load requires a local store [cache={}]",
                self.cache_name()
            )));
        }

        if keys.is_empty() {
            return Ok(true);
        }

        let adapter = self.adapter();

        if keys.len() == 1 {
            let key = &keys[0];
            let raw = if key.is_internal() {
                None
            } else {
                self.load_raw(gate, tx, key).await?
            };
            match visitor {
                LoadVisitor::Value(vis) => vis(key.clone(), adapter.from_store(raw)?),
                LoadVisitor::Versioned(vis) => {
                    if let Some(raw) = raw {
                        let (value, version) = self.versioned(raw)?;
                        vis(key.clone(), value, version);
                    }
                }
            }
            return Ok(true);
        }

        let mut origin: AHashMap<CacheObject, KeyCacheObject> = AHashMap::with_capacity(keys.len());
        let mut store_keys = Vec::with_capacity(keys.len());
        for key in keys {
            if adapter.skip(key) {
                continue;
            }
            let store_key = adapter.to_store_key(key)?;
            if origin.insert(store_key.clone(), key.clone()).is_none() {
                store_keys.push(store_key);
            }
        }
        if store_keys.is_empty() {
            return Ok(true);
        }

        let started = Instant::now();
        let ses = self.session(tx);
        let mut found: Vec<(CacheObject, StoreValue)> = Vec::new();
        let res = if store_keys.len() < gate.load_all_threshold() {
            gate.load_all(ses.as_deref(), &store_keys, &mut |k, v| found.push((k, v)))
                .await
        } else {
            debug!(
                "Loading {} keys directly from store [threshold={}]",
                store_keys.len(),
                gate.load_all_threshold()
            );
            store
                .load_all(ses.as_deref(), &store_keys)
                .await
                .map(|entries| found = entries)
        };
        drop(ses);
        self.record("load_all", started, res.is_ok());
        res.map_err(|e| self.load_error(e))?;

        let mut visitor = visitor;
        for (store_key, raw) in found {
            let key = origin
                .get(&store_key)
                .cloned()
                .unwrap_or_else(|| adapter.to_cache_key(store_key));
            match &mut visitor {
                LoadVisitor::Value(vis) => {
                    let (value, _) = adapter.unpack(raw)?;
                    vis(key, Some(value));
                }
                LoadVisitor::Versioned(vis) => {
                    let (value, version) = self.versioned(raw)?;
                    vis(key, value, version);
                }
            }
        }
        Ok(true)
    }

    /// 本地存储批量加载，访问器收到 (键, 值, 版本)
    pub async fn local_store_load_all(
        &self,
        tx: Option<&CacheTx>,
        keys: &[KeyCacheObject],
        visitor: &mut (dyn FnMut(KeyCacheObject, CacheObject, CacheVersion) + Send),
    ) -> Result<bool> {
        self.load_all(tx, keys, LoadVisitor::Versioned(visitor)).await
    }

    /// 带版本的值按存储中的形式交给访问器，不重新编码为二进制
    fn versioned(&self, raw: StoreValue) -> Result<(CacheObject, CacheVersion)> {
        match raw.into_parts() {
            (value, Some(version)) => Ok((value, version)),
            (_, None) => Err(CacheError::Load {
                cache: self.cache_name().to_string(),
                source: StoreError::Loader("local store returned a value without version".to_string()),
            }),
        }
    }

    /// 遍历整个存储
    ///
    /// 未配置存储时打印警告并返回 false
    #[instrument(skip(self, visitor, args), level = "debug", fields(cache = %self.cache_name()))]
    pub async fn load_cache(
        &self,
        visitor: &mut LoadCacheVisitor<'_>,
        args: &[serde_json::Value],
    ) -> Result<bool> {
        let Some(store) = &self.store else {
            warn!(
                "Calling load_cache on a cache with no configured store [cache={}]",
                self.cache_name()
            );
            return Ok(false);
        };

        let adapter = self.adapter();
        let mut conversion: Option<CacheError> = None;
        let mut count = 0usize;

        let started = Instant::now();
        let ses = self.session(None);
        let res = store
            .load_cache(
                ses.as_deref(),
                &mut |k, raw| {
                    if conversion.is_some() {
                        return;
                    }
                    match adapter.unpack(raw) {
                        Ok((value, version)) => {
                            count += 1;
                            visitor(adapter.to_cache_key(k), value, version);
                        }
                        Err(e) => conversion = Some(e),
                    }
                },
                args,
            )
            .await;
        drop(ses);
        self.record("load_cache", started, res.is_ok());
        res.map_err(|e| self.load_error(e))?;

        if let Some(e) = conversion {
            return Err(e);
        }
        info!(
            "Loaded {} entries from store [cache={}]",
            count,
            self.cache_name()
        );
        Ok(true)
    }

    /// 写入单个条目
    ///
    /// 内部键返回 true 且不访问存储
    #[instrument(skip(self, tx, value), level = "debug", fields(cache = %self.cache_name()))]
    pub async fn put(
        &self,
        tx: Option<&CacheTx>,
        key: &KeyCacheObject,
        value: &CacheObject,
        version: CacheVersion,
    ) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let adapter = self.adapter();
        if adapter.skip(key) {
            return Ok(true);
        }

        let entry = StoreEntry::new(
            adapter.to_store_key(key)?,
            adapter.to_store_value(value, version)?,
        );
        debug!("Storing value in cache store [key={}]", entry.key);

        let started = Instant::now();
        let ses = self.session(tx);
        let res = store.write(ses.as_deref(), entry).await;
        drop(ses);
        self.record("put", started, res.is_ok());
        res.map_err(|e| self.write_error(e))?;
        Ok(true)
    }

    /// 批量写入
    ///
    /// 失败时错误中携带存储尚未确认的键
    #[instrument(skip(self, tx, entries), level = "debug", fields(cache = %self.cache_name(), entries = entries.len()))]
    pub async fn put_all(
        &self,
        tx: Option<&CacheTx>,
        entries: &[(KeyCacheObject, CacheObject, CacheVersion)],
    ) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        match entries {
            [] => return Ok(true),
            [(key, value, version)] => return self.put(tx, key, value, *version).await,
            _ => {}
        }

        let adapter = self.adapter();
        let mut records: Vec<StoreEntry> = Vec::with_capacity(entries.len());
        let mut origin = Vec::with_capacity(entries.len());
        let mut positions: AHashMap<CacheObject, usize> = AHashMap::with_capacity(entries.len());
        for (key, value, version) in entries {
            if adapter.skip(key) {
                continue;
            }
            let entry = StoreEntry::new(
                adapter.to_store_key(key)?,
                adapter.to_store_value(value, *version)?,
            );
            // 重复的键保留第一次出现的位置和最后一次的值
            match positions.get(&entry.key) {
                Some(&i) => {
                    records[i] = entry;
                    origin[i] = key.clone();
                }
                None => {
                    positions.insert(entry.key.clone(), records.len());
                    records.push(entry);
                    origin.push(key.clone());
                }
            }
        }
        if records.is_empty() {
            return Ok(true);
        }

        let mut view = EntriesView::new(records);
        let started = Instant::now();
        let ses = self.session(tx);
        let res = store.write_all(ses.as_deref(), &mut view).await;
        drop(ses);
        self.record("put_all", started, res.is_ok());

        match res {
            Ok(()) => Ok(true),
            Err(e) => {
                let failed: Vec<KeyCacheObject> = view
                    .remaining_positions()
                    .map(|i| origin[i].clone())
                    .collect();
                warn!(
                    "Bulk write to store failed [cache={}, failed={}]: {}",
                    self.cache_name(),
                    failed.len(),
                    e
                );
                Err(self.partial_error(e, failed))
            }
        }
    }

    /// 删除单个键
    ///
    /// 内部键返回 false 且不访问存储
    #[instrument(skip(self, tx), level = "debug", fields(cache = %self.cache_name()))]
    pub async fn remove(&self, tx: Option<&CacheTx>, key: &KeyCacheObject) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let adapter = self.adapter();
        if adapter.skip(key) {
            return Ok(false);
        }

        let store_key = adapter.to_store_key(key)?;
        debug!("Removing value from cache store [key={}]", store_key);

        let started = Instant::now();
        let ses = self.session(tx);
        let res = store.delete(ses.as_deref(), &store_key).await;
        drop(ses);
        self.record("remove", started, res.is_ok());
        res.map_err(|e| self.write_error(e))?;
        Ok(true)
    }

    /// 批量删除，部分失败的处理与 [`put_all`](Self::put_all) 相同
    #[instrument(skip(self, tx, keys), level = "debug", fields(cache = %self.cache_name(), keys = keys.len()))]
    pub async fn remove_all(&self, tx: Option<&CacheTx>, keys: &[KeyCacheObject]) -> Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        match keys {
            [] => return Ok(true),
            [key] => return self.remove(tx, key).await,
            _ => {}
        }

        let adapter = self.adapter();
        let mut records = Vec::with_capacity(keys.len());
        let mut origin = Vec::with_capacity(keys.len());
        let mut seen = AHashSet::with_capacity(keys.len());
        for key in keys {
            if adapter.skip(key) {
                continue;
            }
            let store_key = adapter.to_store_key(key)?;
            if seen.insert(store_key.clone()) {
                records.push(store_key);
                origin.push(key.clone());
            }
        }
        if records.is_empty() {
            return Ok(true);
        }

        let mut view = KeysView::new(records);
        let started = Instant::now();
        let ses = self.session(tx);
        let res = store.delete_all(ses.as_deref(), &mut view).await;
        drop(ses);
        self.record("remove_all", started, res.is_ok());

        match res {
            Ok(()) => Ok(true),
            Err(e) => {
                let failed: Vec<KeyCacheObject> = view
                    .remaining_positions()
                    .map(|i| origin[i].clone())
                    .collect();
                warn!(
                    "Bulk remove from store failed [cache={}, failed={}]: {}",
                    self.cache_name(),
                    failed.len(),
                    e
                );
                Err(self.partial_error(e, failed))
            }
        }
    }

    /// 工作单元结束
    ///
    /// 通知存储提交或回滚，然后无论通知是否成功都移除事务上的会话。
    /// 同一事务再次调用时直接返回。
    #[instrument(skip(self, tx), level = "debug", fields(cache = %self.cache_name(), tx = %tx.id()))]
    pub async fn end_session(&self, tx: &CacheTx, commit: bool) -> Result<()> {
        let (Some(store), Some(registry)) = (&self.store, &self.sessions) else {
            return Ok(());
        };
        if registry.is_ended(tx) {
            debug!("Store session already ended [tx={}]", tx.id());
            return Ok(());
        }

        let _detach = DetachOnDrop {
            registry: registry.as_ref(),
            tx,
        };
        let started = Instant::now();
        let ses = self.session(Some(tx));
        let res = store.tx_end(ses.as_deref(), commit).await;
        drop(ses);
        self.record("tx_end", started, res.is_ok());
        res.map_err(|e| self.write_error(e))
    }

    /// 立即刷新写后缓冲，未启用时什么都不做
    pub async fn force_flush(&self) -> Result<()> {
        match &self.write_behind_store {
            Some(wb) => wb.force_flush().await.map_err(|e| self.write_error(e)),
            None => Ok(()),
        }
    }

    /// 启动存储（近端缓存不负责存储的生命周期）
    #[instrument(skip(self), level = "info", fields(cache = %self.cache_name()))]
    pub async fn start(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if self.near_cache || !store.capabilities().lifecycle_aware {
            return Ok(());
        }
        store.start().await.map_err(|e| {
            CacheError::Lifecycle(format!(
                "Failed to start cache store [cache={}]: {}",
                self.cache_name(),
                e
            ))
        })?;
        info!("Cache store started [cache={}]", self.cache_name());
        Ok(())
    }

    /// 停止存储，失败只记录日志
    #[instrument(skip(self), level = "info", fields(cache = %self.cache_name()))]
    pub async fn stop(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if self.near_cache || !store.capabilities().lifecycle_aware {
            return;
        }
        match store.stop().await {
            Ok(()) => info!("Cache store stopped [cache={}]", self.cache_name()),
            Err(e) => error!(
                "Failed to stop cache store [cache={}]: {}",
                self.cache_name(),
                e
            ),
        }
    }
}
