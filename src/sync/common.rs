//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了写后缓冲区和加载合并的公共类型与工具函数

use crate::object::{CacheObject, StoreValue};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// 写后缓冲区中的待执行操作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation {
    Write(StoreValue),
    Delete,
}

impl BatchOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            BatchOperation::Write(_) => "write",
            BatchOperation::Delete => "delete",
        }
    }
}

/// 刷新时最终失败并被丢弃的条目
#[derive(Debug, Clone)]
pub struct FlushFailure {
    /// 存储键
    pub key: CacheObject,
    /// 失败的操作
    pub operation: BatchOperation,
    /// 最后一次错误
    pub error: crate::error::StoreError,
    /// 尝试次数
    pub attempts: u32,
    /// 放弃的时间
    pub failed_at: DateTime<Utc>,
}

/// 估算操作大小的工具函数
pub fn estimate_operation_size(key: &CacheObject, operation: &BatchOperation) -> usize {
    let key_len = key.hash_bytes().len();
    match operation {
        BatchOperation::Write(v) => key_len + v.value().hash_bytes().len(),
        BatchOperation::Delete => key_len,
    }
}

/// 计算重试延迟的工具函数 (指数退避)
pub fn calculate_retry_delay(attempt: u32, base_delay_ms: u64) -> Duration {
    let factor = 2_u64.saturating_pow(attempt);
    Duration::from_millis(base_delay_ms.saturating_mul(factor))
}
