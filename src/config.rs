//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了存储同步层的配置结构和解析逻辑。

use crate::error::{CacheError, Result};
use crate::sync::gate::DEFAULT_LOAD_ALL_THRESHOLD;
use crate::utils::throttle::DEFAULT_FAILURE_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_VERSION: u32 = 1;

/// 存储配置
///
/// 描述一个缓存如何与后端存储同步
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_version: Option<u32>,
    /// 写直通：缓存更新同步写入存储
    pub write_through: bool,
    /// 写后缓冲配置
    pub write_behind: WriteBehindConfig,
    /// 批量加载时绕过合并门的键数阈值
    pub load_all_threshold: usize,
    /// 连续失败多少次后打印告警
    pub failure_warn_threshold: u32,
    /// 近端缓存：与主缓存共享存储，不负责存储的生命周期
    pub near_cache: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            config_version: None,
            write_through: false,
            write_behind: WriteBehindConfig::default(),
            load_all_threshold: DEFAULT_LOAD_ALL_THRESHOLD,
            failure_warn_threshold: DEFAULT_FAILURE_THRESHOLD,
            near_cache: false,
        }
    }
}

/// 写后缓冲配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct WriteBehindConfig {
    /// 是否启用写后缓冲
    pub enabled: bool,
    /// 缓冲条目数达到该值时唤醒刷新任务
    pub flush_size: usize,
    /// 刷新任务（分片）数量
    pub flush_thread_count: usize,
    /// 定时刷新间隔（毫秒），0 表示只按数量刷新
    pub flush_frequency_ms: u64,
    /// 单次写入存储的最大条目数
    pub batch_size: usize,
    /// 失败后的最大重试次数
    pub max_retries: u32,
    /// 重试基础延迟（毫秒）
    pub retry_delay_ms: u64,
    /// 缓冲区最大容量，达到时在调用线程内同步刷新
    pub max_buffer_size: usize,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            flush_size: 10240,
            flush_thread_count: 1,
            flush_frequency_ms: 5000,
            batch_size: 512,
            max_retries: 3,
            retry_delay_ms: 100,
            max_buffer_size: 30720,
        }
    }
}

impl StoreConfig {
    /// 从TOML字符串解析并校验配置
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(s)
            .map_err(|e| CacheError::Configuration(format!("Invalid store config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 从TOML文件读取配置
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        self.check().map_err(CacheError::Configuration)
    }

    fn check(&self) -> std::result::Result<(), String> {
        if let Some(version) = &self.config_version {
            if *version > CONFIG_VERSION {
                return Err(format!(
                    "Unsupported config version: {}, max supported: {}",
                    version, CONFIG_VERSION
                ));
            }
        }

        if self.load_all_threshold == 0 {
            return Err("load_all_threshold cannot be zero".to_string());
        }

        if self.failure_warn_threshold == 0 {
            return Err("failure_warn_threshold cannot be zero".to_string());
        }

        let wb = &self.write_behind;
        if wb.enabled {
            if !self.write_through {
                return Err("write_behind requires write_through to be enabled".to_string());
            }

            if wb.flush_size == 0 {
                return Err("write_behind flush_size cannot be zero".to_string());
            }

            if wb.flush_thread_count == 0 || wb.flush_thread_count > 64 {
                return Err("write_behind flush_thread_count must be between 1 and 64".to_string());
            }

            if wb.batch_size == 0 || wb.batch_size > 10000 {
                return Err("write_behind batch_size must be between 1 and 10000".to_string());
            }

            if wb.flush_frequency_ms > 3_600_000 {
                return Err("write_behind flush_frequency_ms cannot exceed one hour".to_string());
            }

            if wb.max_buffer_size < wb.flush_size {
                return Err(format!(
                    "write_behind max_buffer_size ({}) must be >= flush_size ({})",
                    wb.max_buffer_size, wb.flush_size
                ));
            }
        }

        Ok(())
    }
}
