//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 统一工具模块
//!
//! 提供测试和示例共用的工具函数，包括：
//! - 日志设置工具
//! - 配置创建工具
//! - 缓存名称生成工具

pub mod throttle;

use crate::config::{StoreConfig, WriteBehindConfig};
use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

pub use throttle::FailureThrottle;

static INIT: Once = Once::new();

pub fn setup_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_span_events(FmtSpan::CLOSE)
            .with_env_filter(EnvFilter::new("debug"))
            .try_init()
            .ok();
    });
}

/// 创建写直通配置
pub fn create_write_through_config() -> StoreConfig {
    StoreConfig {
        write_through: true,
        ..Default::default()
    }
}

/// 创建写后配置，刷新频率为0时只在达到阈值或手动刷新时写入
pub fn create_write_behind_config(flush_size: usize, flush_frequency_ms: u64) -> StoreConfig {
    StoreConfig {
        write_through: true,
        write_behind: WriteBehindConfig {
            enabled: true,
            flush_size,
            flush_frequency_ms,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// 生成唯一的缓存名称
pub fn generate_unique_cache_name(base: &str) -> String {
    format!("{}_{}", base, uuid::Uuid::new_v4().simple())
}
