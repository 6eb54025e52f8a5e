//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了缓存二进制编码使用的序列化机制。

pub mod json;

use crate::error::Result;
use crate::object::BinaryObject;
use serde::{de::DeserializeOwned, Serialize};

pub use json::JsonSerializer;

/// 序列化器特征
///
/// 定义序列化和反序列化操作的接口
pub trait Serializer: Send + Sync {
    /// 序列化值为字节数组
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// 从字节数组反序列化值
    fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;

    /// 把普通对象编码为缓存的二进制形式
    fn to_binary(&self, value: &serde_json::Value) -> Result<BinaryObject> {
        Ok(BinaryObject::new(self.serialize(value)?))
    }

    /// 把二进制形式解包为普通对象
    fn from_binary(&self, binary: &BinaryObject) -> Result<serde_json::Value> {
        self.deserialize(binary.as_bytes())
    }
}

/// 序列化器枚举
///
/// 用于在缓存上下文中按值持有序列化器
#[derive(Clone, Debug)]
pub enum SerializerEnum {
    Json(JsonSerializer),
}

impl Default for SerializerEnum {
    fn default() -> Self {
        SerializerEnum::Json(JsonSerializer::new())
    }
}

impl Serializer for SerializerEnum {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            SerializerEnum::Json(s) => s.serialize(value),
        }
    }

    fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            SerializerEnum::Json(s) => s.deserialize(data),
        }
    }
}
