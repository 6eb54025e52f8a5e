//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了后端存储接口以及内置的存储实现。

pub mod memory;
pub mod sql;
pub mod view;

use crate::error::StoreResult;
use crate::object::{CacheObject, StoreEntry, StoreValue};
use crate::session::StoreSession;
use async_trait::async_trait;

pub use memory::MemoryStore;
pub use sql::SqlStore;
pub use view::{BatchRecord, BatchView, EntriesView, KeysView};

/// 存储能力标志
///
/// 管理器构造时读取一次，之后按值判断
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// 是否接受会话
    pub session_aware: bool,
    /// 是否需要 start/stop 生命周期调用
    pub lifecycle_aware: bool,
    /// 本地存储：值与版本一起持久化
    pub local: bool,
}

/// 加载整个存储时的回调
pub type LoadCacheSink<'a> = dyn FnMut(CacheObject, StoreValue) + Send + 'a;

/// 后端存储接口
///
/// 可插拔的持久化实现（数据库、文件系统等）。`ses` 在存储不接受会话时为 None。
/// 批量方法有逐条调用的默认实现。
#[async_trait]
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    /// 存储能力
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::default()
    }

    /// 按键加载
    async fn load(&self, ses: Option<&StoreSession>, key: &CacheObject)
        -> StoreResult<Option<StoreValue>>;

    /// 批量加载，只返回存在的键
    async fn load_all(
        &self,
        ses: Option<&StoreSession>,
        keys: &[CacheObject],
    ) -> StoreResult<Vec<(CacheObject, StoreValue)>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(v) = self.load(ses, key).await? {
                out.push((key.clone(), v));
            }
        }
        Ok(out)
    }

    /// 遍历整个存储
    async fn load_cache(
        &self,
        _ses: Option<&StoreSession>,
        _sink: &mut LoadCacheSink<'_>,
        _args: &[serde_json::Value],
    ) -> StoreResult<()> {
        Ok(())
    }

    /// 写入单个条目
    async fn write(&self, ses: Option<&StoreSession>, entry: StoreEntry) -> StoreResult<()>;

    /// 批量写入
    ///
    /// 每写入一条就从视图中移除，失败时视图中剩下未写入的条目
    async fn write_all(&self, ses: Option<&StoreSession>, entries: &mut EntriesView) -> StoreResult<()> {
        let pending: Vec<StoreEntry> = entries.iter().cloned().collect();
        for entry in pending {
            let key = entry.key.clone();
            self.write(ses, entry).await?;
            entries.remove(&key);
        }
        Ok(())
    }

    /// 删除单个键
    async fn delete(&self, ses: Option<&StoreSession>, key: &CacheObject) -> StoreResult<()>;

    /// 批量删除，语义同 [`write_all`](Self::write_all)
    async fn delete_all(&self, ses: Option<&StoreSession>, keys: &mut KeysView) -> StoreResult<()> {
        for key in keys.remaining_keys() {
            self.delete(ses, &key).await?;
            keys.remove(&key);
        }
        Ok(())
    }

    /// 工作单元结束（提交或回滚）
    async fn tx_end(&self, _ses: Option<&StoreSession>, _commit: bool) -> StoreResult<()> {
        Ok(())
    }

    /// 启动存储
    async fn start(&self) -> StoreResult<()> {
        Ok(())
    }

    /// 停止存储
    async fn stop(&self) -> StoreResult<()> {
        Ok(())
    }
}
