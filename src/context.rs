//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存引擎向存储同步层暴露的上下文接口。

use crate::error::Result;
use crate::object::{CacheObject, KeyCacheObject};
use crate::serialization::{Serializer, SerializerEnum};

/// 缓存上下文
///
/// 存储同步层只通过此接口访问缓存引擎：读取缓存名称和二进制模式配置，
/// 以及在内部表示和存储表示之间转换键值。
pub trait CacheContext: Send + Sync + std::fmt::Debug {
    /// 缓存名称
    fn name(&self) -> &str;

    /// 缓存是否启用了二进制（可移植）编码
    fn binary_enabled(&self) -> bool;

    /// 是否要求以二进制形式把对象交给存储
    fn keep_binary_in_store(&self) -> bool;

    /// 把存储返回的键转换为缓存键
    fn to_cache_key(&self, store_key: CacheObject) -> KeyCacheObject;

    /// 如有必要，把二进制对象解包为普通对象
    fn unwrap_binary_if_needed(&self, obj: CacheObject) -> Result<CacheObject>;

    /// 把普通对象编码为缓存的二进制形式
    fn marshal_to_binary(&self, obj: CacheObject) -> Result<CacheObject>;
}

/// 默认缓存上下文
///
/// 使用配置的序列化器作为二进制编码
#[derive(Debug, Clone)]
pub struct DefaultCacheContext {
    name: String,
    binary_enabled: bool,
    keep_binary_in_store: bool,
    serializer: SerializerEnum,
}

impl DefaultCacheContext {
    /// 创建未启用二进制模式的上下文
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binary_enabled: false,
            keep_binary_in_store: true,
            serializer: SerializerEnum::default(),
        }
    }

    /// 设置二进制模式
    pub fn with_binary(mut self, enabled: bool) -> Self {
        self.binary_enabled = enabled;
        self
    }

    /// 设置是否以二进制形式交给存储
    pub fn with_keep_binary_in_store(mut self, keep: bool) -> Self {
        self.keep_binary_in_store = keep;
        self
    }

    /// 设置序列化器
    pub fn with_serializer(mut self, serializer: SerializerEnum) -> Self {
        self.serializer = serializer;
        self
    }
}

impl CacheContext for DefaultCacheContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn binary_enabled(&self) -> bool {
        self.binary_enabled
    }

    fn keep_binary_in_store(&self) -> bool {
        self.keep_binary_in_store
    }

    fn to_cache_key(&self, store_key: CacheObject) -> KeyCacheObject {
        KeyCacheObject::new(store_key)
    }

    fn unwrap_binary_if_needed(&self, obj: CacheObject) -> Result<CacheObject> {
        match obj {
            CacheObject::Binary(b) => Ok(CacheObject::Plain(self.serializer.from_binary(&b)?)),
            plain => Ok(plain),
        }
    }

    fn marshal_to_binary(&self, obj: CacheObject) -> Result<CacheObject> {
        match obj {
            CacheObject::Plain(v) => Ok(CacheObject::Binary(self.serializer.to_binary(&v)?)),
            binary => Ok(binary),
        }
    }
}
