//! oxstore - 分布式缓存的存储同步层
//!
//! 负责让分区缓存与外部后端存储保持一致：会话管理、加载合并、
//! 写直通与写后缓冲，以及批量操作的部分失败报告。

#![doc(html_root_url = "https://docs.rs/oxstore/0.1.0")]

pub use serde;
pub use serde::{Deserialize, Serialize};
pub use serde_json;
pub use tokio;

pub mod adapter;
pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod object;
pub mod serialization;
pub mod session;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod utils;

// Re-export commonly used items
pub use config::{StoreConfig, WriteBehindConfig};
pub use context::{CacheContext, DefaultCacheContext};
pub use error::{CacheError, Result, StoreError, StoreResult};
pub use manager::{LoadCacheVisitor, LoadVisitor, StoreManager};
pub use object::{BinaryObject, CacheObject, CacheVersion, KeyCacheObject, StoreEntry, StoreValue};
pub use session::{CacheTx, SessionHolders, SessionRegistry, StoreSession};
pub use store::{CacheStore, EntriesView, KeysView, MemoryStore, SqlStore, StoreCapabilities};
pub use sync::{LoadGate, WriteBehindStats, WriteBehindStore};

/// oxstore 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
