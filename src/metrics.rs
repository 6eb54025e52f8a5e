//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了存储同步层的指标收集和监控功能。

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{span, Level};

/// 指标收集器
///
/// 用于收集和存储存储同步层的各种运行时指标
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// 存储操作总数统计
    /// key: "cache:op:result"
    pub store_operations: Arc<Mutex<HashMap<String, u64>>>,
    /// 操作耗时
    /// key: "cache:op" -> (total_duration_secs, count)
    pub operation_duration: Arc<Mutex<HashMap<String, (f64, u64)>>>,
    /// 写后缓冲区大小
    pub write_behind_buffer_size: Arc<Mutex<HashMap<String, usize>>>,
    /// 写后刷新最终失败（被丢弃）的条目数
    pub flush_failures: Arc<Mutex<HashMap<String, u64>>>,
}

lazy_static! {
    /// 全局指标实例
    pub static ref GLOBAL_METRICS: Metrics = Metrics::default();
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Metrics {
    /// 记录存储操作
    ///
    /// # 参数
    ///
    /// * `cache` - 缓存名称
    /// * `op` - 操作类型（load/load_all/put/put_all/remove/remove_all/tx_end）
    /// * `result` - 操作结果（ok/error/partial）
    pub fn record_store_op(&self, cache: &str, op: &str, result: &str) {
        let span = span!(Level::TRACE, "store_op", cache, op, result);
        let _enter = span.enter();
        let key = format!("{}:{}:{}", cache, op, result);
        *lock(&self.store_operations).entry(key).or_insert(0) += 1;
    }

    /// 记录操作耗时
    pub fn record_duration(&self, cache: &str, op: &str, duration_secs: f64) {
        let key = format!("{}:{}", cache, op);
        let mut map = lock(&self.operation_duration);
        let entry = map.entry(key).or_insert((0.0, 0));
        entry.0 += duration_secs;
        entry.1 += 1;
    }

    /// 设置写后缓冲区大小
    pub fn set_write_behind_buffer_size(&self, cache: &str, size: usize) {
        lock(&self.write_behind_buffer_size).insert(cache.to_string(), size);
    }

    /// 累加被丢弃的条目数
    pub fn record_flush_failures(&self, cache: &str, count: u64) {
        *lock(&self.flush_failures)
            .entry(cache.to_string())
            .or_insert(0) += count;
    }

    /// 读取某个操作计数，主要用于测试
    pub fn store_op_count(&self, cache: &str, op: &str, result: &str) -> u64 {
        let key = format!("{}:{}:{}", cache, op, result);
        lock(&self.store_operations).get(&key).copied().unwrap_or(0)
    }
}

/// 获取指标字符串
///
/// 将所有指标格式化为字符串返回，用于监控系统采集
pub fn get_metrics_string() -> String {
    let metrics = &GLOBAL_METRICS;
    let ops = lock(&metrics.store_operations);
    let dur = lock(&metrics.operation_duration);
    let buffer = lock(&metrics.write_behind_buffer_size);
    let failures = lock(&metrics.flush_failures);

    let mut output = String::new();
    for (k, v) in ops.iter() {
        let parts: Vec<&str> = k.split(':').collect();
        if parts.len() == 3 {
            output.push_str(&format!(
                "store_operations_total{{cache=\"{}\", operation=\"{}\", result=\"{}\"}} {}\n",
                parts[0], parts[1], parts[2], v
            ));
        }
    }
    for (k, (total, count)) in dur.iter() {
        if let Some((cache, op)) = k.split_once(':') {
            output.push_str(&format!(
                "store_operation_duration_seconds_sum{{cache=\"{}\", operation=\"{}\"}} {}\n",
                cache, op, total
            ));
            output.push_str(&format!(
                "store_operation_duration_seconds_count{{cache=\"{}\", operation=\"{}\"}} {}\n",
                cache, op, count
            ));
        }
    }
    for (k, v) in buffer.iter() {
        output.push_str(&format!(
            "store_write_behind_buffer_size{{cache=\"{}\"}} {}\n",
            k, v
        ));
    }
    for (k, v) in failures.iter() {
        output.push_str(&format!(
            "store_write_behind_flush_failures_total{{cache=\"{}\"}} {}\n",
            k, v
        ));
    }
    output
}
