//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 基于内存的后端存储实现，主要用于测试和本地开发。

use super::{CacheStore, EntriesView, KeysView, LoadCacheSink, StoreCapabilities};
use crate::error::{StoreError, StoreResult};
use crate::object::{CacheObject, StoreEntry, StoreValue};
use crate::session::StoreSession;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, instrument};

/// 内存存储
///
/// 可以配置为本地存储（保存版本）、接受会话，或拒绝二进制对象（模拟只认识普通对象的存储）。
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: DashMap<CacheObject, StoreValue>,
    capabilities: StoreCapabilities,
    reject_binary: bool,
    tx_commits: AtomicU64,
    tx_rollbacks: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明为本地存储
    pub fn local(mut self) -> Self {
        self.capabilities.local = true;
        self
    }

    /// 接受会话
    pub fn with_sessions(mut self) -> Self {
        self.capabilities.session_aware = true;
        self
    }

    /// 拒绝二进制形式的键值
    pub fn reject_binary(mut self) -> Self {
        self.reject_binary = true;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 直接读取存储内容（绕过管理器）
    pub fn get(&self, key: &CacheObject) -> Option<StoreValue> {
        self.data.get(key).map(|v| v.clone())
    }

    /// 直接写入存储内容（绕过管理器）
    pub fn insert(&self, key: CacheObject, value: StoreValue) {
        self.data.insert(key, value);
    }

    /// (提交次数, 回滚次数)
    pub fn tx_counts(&self) -> (u64, u64) {
        (
            self.tx_commits.load(Ordering::Relaxed),
            self.tx_rollbacks.load(Ordering::Relaxed),
        )
    }

    fn check(&self, obj: &CacheObject) -> StoreResult<()> {
        if self.reject_binary && obj.is_binary() {
            return Err(StoreError::TypeMismatch(format!(
                "binary object cannot be cast to a plain value: {}",
                obj
            )));
        }
        Ok(())
    }

    fn check_entry(&self, entry: &StoreEntry) -> StoreResult<()> {
        self.check(&entry.key)?;
        self.check(entry.value.value())
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    async fn load(
        &self,
        _ses: Option<&StoreSession>,
        key: &CacheObject,
    ) -> StoreResult<Option<StoreValue>> {
        self.check(key)?;
        Ok(self.get(key))
    }

    async fn load_all(
        &self,
        _ses: Option<&StoreSession>,
        keys: &[CacheObject],
    ) -> StoreResult<Vec<(CacheObject, StoreValue)>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            self.check(key)?;
            if let Some(v) = self.get(key) {
                out.push((key.clone(), v));
            }
        }
        Ok(out)
    }

    #[instrument(skip(self, _ses, sink), level = "debug")]
    async fn load_cache(
        &self,
        _ses: Option<&StoreSession>,
        sink: &mut LoadCacheSink<'_>,
        _args: &[serde_json::Value],
    ) -> StoreResult<()> {
        // 快照后再回调，避免回调期间持有分片锁
        let snapshot: Vec<(CacheObject, StoreValue)> = self
            .data
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        debug!("Memory store load_cache: entries={}", snapshot.len());
        for (k, v) in snapshot {
            sink(k, v);
        }
        Ok(())
    }

    async fn write(&self, _ses: Option<&StoreSession>, entry: StoreEntry) -> StoreResult<()> {
        self.check_entry(&entry)?;
        self.data.insert(entry.key, entry.value);
        Ok(())
    }

    async fn write_all(
        &self,
        _ses: Option<&StoreSession>,
        entries: &mut EntriesView,
    ) -> StoreResult<()> {
        entries.try_consume(|entry| {
            self.check_entry(entry)?;
            self.data.insert(entry.key.clone(), entry.value.clone());
            Ok(())
        })
    }

    async fn delete(&self, _ses: Option<&StoreSession>, key: &CacheObject) -> StoreResult<()> {
        self.check(key)?;
        self.data.remove(key);
        Ok(())
    }

    async fn delete_all(&self, _ses: Option<&StoreSession>, keys: &mut KeysView) -> StoreResult<()> {
        keys.try_consume(|key| {
            self.check(key)?;
            self.data.remove(key);
            Ok(())
        })
    }

    async fn tx_end(&self, _ses: Option<&StoreSession>, commit: bool) -> StoreResult<()> {
        if commit {
            self.tx_commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tx_rollbacks.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
