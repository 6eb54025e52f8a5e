//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存对象、版本以及与后端存储交换的数据结构。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// 缓存内部的二进制（可移植）编码对象
///
/// 字节内容由 [`Serializer`](crate::serialization::Serializer) 生成，
/// 只有在需要时才会被解包成普通对象。
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinaryObject {
    bytes: Vec<u8>,
}

impl BinaryObject {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl fmt::Debug for BinaryObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinaryObject(len={})", self.bytes.len())
    }
}

/// 缓存对象
///
/// 既可以是普通对象形式，也可以是缓存的二进制编码形式
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheObject {
    /// 普通对象
    Plain(serde_json::Value),
    /// 二进制编码对象
    Binary(BinaryObject),
}

impl CacheObject {
    /// 创建普通对象
    pub fn plain(value: impl Into<serde_json::Value>) -> Self {
        CacheObject::Plain(value.into())
    }

    /// 是否为二进制编码对象
    pub fn is_binary(&self) -> bool {
        matches!(self, CacheObject::Binary(_))
    }

    /// 返回普通对象的值
    pub fn as_plain(&self) -> Option<&serde_json::Value> {
        match self {
            CacheObject::Plain(v) => Some(v),
            CacheObject::Binary(_) => None,
        }
    }

    /// 用于哈希分片的稳定字节表示
    pub fn hash_bytes(&self) -> Vec<u8> {
        match self {
            CacheObject::Plain(v) => {
                let mut out = vec![0u8];
                out.extend_from_slice(v.to_string().as_bytes());
                out
            }
            CacheObject::Binary(b) => {
                let mut out = vec![1u8];
                out.extend_from_slice(b.as_bytes());
                out
            }
        }
    }
}

// serde_json::Value 未实现 Hash，使用其规范化文本表示
impl Hash for CacheObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            CacheObject::Plain(v) => {
                0u8.hash(state);
                v.to_string().hash(state);
            }
            CacheObject::Binary(b) => {
                1u8.hash(state);
                b.hash(state);
            }
        }
    }
}

impl fmt::Display for CacheObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheObject::Plain(v) => write!(f, "{}", v),
            CacheObject::Binary(b) => write!(f, "{:?}", b),
        }
    }
}

impl From<serde_json::Value> for CacheObject {
    fn from(v: serde_json::Value) -> Self {
        CacheObject::Plain(v)
    }
}

impl From<&str> for CacheObject {
    fn from(v: &str) -> Self {
        CacheObject::Plain(serde_json::Value::String(v.to_string()))
    }
}

/// 缓存键
///
/// `internal` 标记内部簿记用的键，这类键永远不会持久化
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyCacheObject {
    object: CacheObject,
    internal: bool,
}

impl KeyCacheObject {
    /// 创建普通（可持久化）的键
    pub fn new(object: impl Into<CacheObject>) -> Self {
        Self {
            object: object.into(),
            internal: false,
        }
    }

    /// 创建内部键
    pub fn internal(object: impl Into<CacheObject>) -> Self {
        Self {
            object: object.into(),
            internal: true,
        }
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn object(&self) -> &CacheObject {
        &self.object
    }

    pub fn into_object(self) -> CacheObject {
        self.object
    }
}

impl fmt::Display for KeyCacheObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.internal {
            write!(f, "internal:{}", self.object)
        } else {
            write!(f, "{}", self.object)
        }
    }
}

/// 缓存条目版本
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheVersion {
    /// 拓扑版本
    pub topology_version: u32,
    /// 全局递增序号
    pub order: u64,
    /// 产生此版本的节点序号
    pub node_order: u32,
}

impl CacheVersion {
    pub fn new(topology_version: u32, order: u64, node_order: u32) -> Self {
        Self {
            topology_version,
            order,
            node_order,
        }
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ver[topVer={}, order={}, nodeOrder={}]",
            self.topology_version, self.order, self.node_order
        )
    }
}

/// 与存储交换的值
///
/// 本地存储会把版本与值一起持久化，其它存储只保存值
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreValue {
    Plain(CacheObject),
    Versioned {
        value: CacheObject,
        version: CacheVersion,
    },
}

impl StoreValue {
    /// 返回值部分
    pub fn value(&self) -> &CacheObject {
        match self {
            StoreValue::Plain(v) => v,
            StoreValue::Versioned { value, .. } => value,
        }
    }

    /// 返回版本部分（仅本地存储）
    pub fn version(&self) -> Option<CacheVersion> {
        match self {
            StoreValue::Plain(_) => None,
            StoreValue::Versioned { version, .. } => Some(*version),
        }
    }

    /// 拆分为值和版本
    pub fn into_parts(self) -> (CacheObject, Option<CacheVersion>) {
        match self {
            StoreValue::Plain(v) => (v, None),
            StoreValue::Versioned { value, version } => (value, Some(version)),
        }
    }
}

/// 写入存储的条目
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: CacheObject,
    pub value: StoreValue,
}

impl StoreEntry {
    pub fn new(key: CacheObject, value: StoreValue) -> Self {
        Self { key, value }
    }
}
