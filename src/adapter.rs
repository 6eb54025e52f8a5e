//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块负责缓存内部键值与存储所需表示之间的转换。

use crate::context::CacheContext;
use crate::error::Result;
use crate::object::{CacheObject, CacheVersion, KeyCacheObject, StoreValue};

/// 键值转换器
///
/// 每次调用时根据管理器当前的标志构造，本身不保存状态
#[derive(Clone, Copy)]
pub struct KeyValueAdapter<'a> {
    ctx: &'a dyn CacheContext,
    convert_binary: bool,
    local_store: bool,
}

impl<'a> KeyValueAdapter<'a> {
    pub fn new(ctx: &'a dyn CacheContext, convert_binary: bool, local_store: bool) -> Self {
        Self {
            ctx,
            convert_binary,
            local_store,
        }
    }

    /// 内部键永远不与存储交互
    pub fn skip(&self, key: &KeyCacheObject) -> bool {
        key.is_internal()
    }

    /// 转换缓存键为存储键
    pub fn to_store_key(&self, key: &KeyCacheObject) -> Result<CacheObject> {
        self.to_store_object(key.object().clone())
    }

    /// 转换缓存值为存储值
    pub fn to_store_object(&self, obj: CacheObject) -> Result<CacheObject> {
        if self.convert_binary {
            self.ctx.unwrap_binary_if_needed(obj)
        } else {
            Ok(obj)
        }
    }

    /// 构造写入存储的载荷，本地存储附带版本
    pub fn to_store_value(&self, value: &CacheObject, version: CacheVersion) -> Result<StoreValue> {
        let value = self.to_store_object(value.clone())?;
        if self.local_store {
            Ok(StoreValue::Versioned { value, version })
        } else {
            Ok(StoreValue::Plain(value))
        }
    }

    /// 存储键转换回缓存键
    pub fn to_cache_key(&self, store_key: CacheObject) -> KeyCacheObject {
        self.ctx.to_cache_key(store_key)
    }

    /// 存储返回的原始值转换为缓存值
    ///
    /// 本地存储的（值, 版本）只保留值部分
    pub fn from_store(&self, raw: Option<StoreValue>) -> Result<Option<CacheObject>> {
        raw.map(|raw| self.unpack(raw).map(|(value, _)| value))
            .transpose()
    }

    /// 拆开存储返回的值，缓存启用二进制模式时重新编码
    pub fn unpack(&self, raw: StoreValue) -> Result<(CacheObject, Option<CacheVersion>)> {
        let (value, version) = raw.into_parts();
        if self.ctx.binary_enabled() {
            Ok((self.ctx.marshal_to_binary(value)?, version))
        } else {
            Ok((value, version))
        }
    }
}
