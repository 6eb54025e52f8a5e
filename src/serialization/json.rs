//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! JSON序列化器，作为缓存默认的二进制编码。
//!
//! 启用压缩时，编码结果的第一个字节标记后续内容是否经过gzip压缩，
//! 只有超过阈值的对象才会被压缩。

use super::Serializer;
use crate::error::{CacheError, Result};
use serde::{de::DeserializeOwned, Serialize};

const RAW: u8 = 0;
const GZIP: u8 = 1;

/// 默认压缩阈值（字节）
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// JSON序列化器
#[derive(Clone, Debug)]
pub struct JsonSerializer {
    /// 压缩阈值，None 表示不压缩（编码结果不带标记字节）
    compression_threshold: Option<usize>,
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self {
            compression_threshold: None,
        }
    }

    /// 创建启用压缩的JSON序列化器
    ///
    /// 超过 `threshold` 字节的对象以gzip压缩后的形式保存
    pub fn with_compression(threshold: usize) -> Self {
        Self {
            compression_threshold: Some(threshold),
        }
    }

    /// 是否启用压缩
    pub fn is_compressed(&self) -> bool {
        self.compression_threshold.is_some()
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "flate2")]
fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(feature = "flate2")]
fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoded = Vec::new();
    GzDecoder::new(data).read_to_end(&mut decoded)?;
    Ok(decoded)
}

#[cfg(not(feature = "flate2"))]
fn gzip(_data: &[u8]) -> Result<Vec<u8>> {
    Err(CacheError::Serialization(
        "compression requires the flate2 feature".to_string(),
    ))
}

#[cfg(not(feature = "flate2"))]
fn gunzip(_data: &[u8]) -> Result<Vec<u8>> {
    Err(CacheError::Serialization(
        "compressed payload requires the flate2 feature".to_string(),
    ))
}

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let json =
            serde_json::to_vec(value).map_err(|e| CacheError::Serialization(e.to_string()))?;

        let Some(threshold) = self.compression_threshold else {
            return Ok(json);
        };

        let (marker, body) = if cfg!(feature = "flate2") && json.len() > threshold {
            (GZIP, gzip(&json)?)
        } else {
            (RAW, json)
        };
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(marker);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        let json = match self.compression_threshold {
            None => std::borrow::Cow::Borrowed(data),
            Some(_) => match data.split_first() {
                Some((&RAW, body)) => std::borrow::Cow::Borrowed(body),
                Some((&GZIP, body)) => std::borrow::Cow::Owned(gunzip(body)?),
                Some((marker, _)) => {
                    return Err(CacheError::Serialization(format!(
                        "unknown payload marker: {}",
                        marker
                    )))
                }
                None => {
                    return Err(CacheError::Serialization("empty payload".to_string()));
                }
            },
        };

        serde_json::from_slice(&json).map_err(|e| CacheError::Serialization(e.to_string()))
    }
}
