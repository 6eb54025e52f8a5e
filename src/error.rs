//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了存储同步层的错误类型和处理机制。

use crate::object::KeyCacheObject;
use std::sync::Arc;
use thiserror::Error;

/// 后端存储报告的错误
///
/// 由 [`CacheStore`](crate::store::CacheStore) 实现返回。需要实现 `Clone`，
/// 因为合并加载时同一个失败要传递给所有等待者。
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// 存储无法处理给定的键或值类型（例如收到了二进制对象）
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// 加载失败
    #[error("Loader error: {0}")]
    Loader(String),

    /// 写入或删除失败
    #[error("Writer error: {0}")]
    Writer(String),

    /// 数据库错误
    #[error("Database error: {0}")]
    Database(String),

    /// IO错误
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// 存储已关闭
    #[error("Store is shut down: {0}")]
    Shutdown(String),
}

impl From<sea_orm::DbErr> for StoreError {
    fn from(e: sea_orm::DbErr) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(Arc::new(e))
    }
}

/// 存储操作结果类型别名
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 存储同步层错误类型枚举
///
/// 管理器把存储层的各种失败统一翻译成这里的分类
#[derive(Error, Debug)]
pub enum CacheError {
    /// 配置错误（例如缓存启用了二进制模式但存储无法处理二进制对象）
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 从存储加载失败
    #[error("Failed to load from cache store [cache={cache}]: {source}")]
    Load {
        cache: String,
        #[source]
        source: StoreError,
    },

    /// 写入或删除失败
    #[error("Failed to update cache store [cache={cache}]: {source}")]
    Write {
        cache: String,
        #[source]
        source: StoreError,
    },

    /// 批量更新部分失败，`keys` 为尚未确认写入的键
    #[error("Partial update of cache store [cache={cache}, failed={}]: {source}", keys.len())]
    PartialUpdate {
        cache: String,
        keys: Vec<KeyCacheObject>,
        #[source]
        source: StoreError,
    },

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO错误
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// 存储生命周期错误
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}

impl CacheError {
    /// 返回部分失败时未写入的键
    pub fn failed_keys(&self) -> Option<&[KeyCacheObject]> {
        match self {
            CacheError::PartialUpdate { keys, .. } => Some(keys),
            _ => None,
        }
    }

    /// 返回底层存储错误（如果有）
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            CacheError::Load { source, .. }
            | CacheError::Write { source, .. }
            | CacheError::PartialUpdate { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// 缓存操作结果类型别名
///
/// 简化错误处理，所有管理器操作都返回此类型
pub type Result<T> = std::result::Result<T, CacheError>;
