//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 基于SQLite（sea-orm）的后端存储实现。
//!
//! 行以 (缓存名, 键) 为主键，缓存名取自会话，
//! 因此多个缓存可以共享同一个存储实例而互不干扰。

use super::{CacheStore, EntriesView, KeysView, LoadCacheSink, StoreCapabilities};
use crate::error::{StoreError, StoreResult};
use crate::object::{CacheObject, CacheVersion, StoreEntry, StoreValue};
use crate::session::StoreSession;
use async_trait::async_trait;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, QueryResult,
    Statement, Value,
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS cache_store (
        cache_name TEXT NOT NULL,
        store_key TEXT NOT NULL,
        store_value TEXT NOT NULL,
        version TEXT,
        PRIMARY KEY (cache_name, store_key)
    )
"#;

/// 批量加载时每条语句最多携带的键数
const LOAD_ALL_CHUNK_SIZE: usize = 500;

const UPSERT_SQL: &str = r#"
    INSERT INTO cache_store (cache_name, store_key, store_value, version)
    VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(cache_name, store_key)
    DO UPDATE SET store_value = excluded.store_value, version = excluded.version
"#;

/// SQLite存储
pub struct SqlStore {
    db: Arc<DatabaseConnection>,
    default_cache: String,
    local: bool,
}

impl std::fmt::Debug for SqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlStore")
            .field("default_cache", &self.default_cache)
            .field("local", &self.local)
            .finish()
    }
}

impl SqlStore {
    /// 连接数据库并创建表
    ///
    /// # 参数
    ///
    /// * `connection_string` - 例如 `sqlite::memory:` 或 `sqlite://path/store.db?mode=rwc`
    /// * `default_cache` - 没有会话时使用的缓存名
    /// * `local` - 是否与值一起保存版本
    pub async fn connect(
        connection_string: &str,
        default_cache: impl Into<String>,
        local: bool,
    ) -> StoreResult<Self> {
        let mut opt = ConnectOptions::new(connection_string.to_string());
        // 单连接保证内存数据库在所有调用间共享
        opt.max_connections(1)
            .min_connections(1)
            .connect_timeout(std::time::Duration::from_secs(30))
            .sqlx_logging(false);

        let db = Database::connect(opt).await?;
        let store = Self {
            db: Arc::new(db),
            default_cache: default_cache.into(),
            local,
        };
        store.ensure_schema().await?;
        info!("SQL cache store connected [local={}]", local);
        Ok(store)
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        self.db
            .execute(Statement::from_string(
                DatabaseBackend::Sqlite,
                CREATE_TABLE_SQL.to_string(),
            ))
            .await?;
        Ok(())
    }

    fn cache_name(&self, ses: Option<&StoreSession>) -> String {
        ses.map(|s| s.cache_name())
            .unwrap_or_else(|| self.default_cache.clone())
    }

    fn encode_key(key: &CacheObject) -> StoreResult<String> {
        match key {
            CacheObject::Plain(v) => Ok(v.to_string()),
            CacheObject::Binary(_) => Err(StoreError::TypeMismatch(
                "SQL store cannot persist binary keys".to_string(),
            )),
        }
    }

    fn decode_object(text: &str) -> StoreResult<CacheObject> {
        serde_json::from_str(text)
            .map(CacheObject::Plain)
            .map_err(|e| StoreError::Loader(format!("corrupted row: {}", e)))
    }

    fn encode_value(&self, value: &StoreValue) -> StoreResult<(String, Option<String>)> {
        let (obj, version) = match value {
            StoreValue::Plain(v) => (v, None),
            StoreValue::Versioned { value, version } => (value, Some(version)),
        };
        let text = match obj {
            CacheObject::Plain(v) => v.to_string(),
            CacheObject::Binary(_) => {
                return Err(StoreError::TypeMismatch(
                    "SQL store cannot persist binary values".to_string(),
                ))
            }
        };
        let version = match (self.local, version) {
            (true, Some(ver)) => Some(
                serde_json::to_string(ver).map_err(|e| StoreError::Writer(e.to_string()))?,
            ),
            _ => None,
        };
        Ok((text, version))
    }

    fn decode_row(&self, row: &QueryResult) -> StoreResult<(CacheObject, StoreValue)> {
        let key: String = row.try_get("", "store_key")?;
        let value: String = row.try_get("", "store_value")?;
        let version: Option<String> = row.try_get("", "version")?;

        let key = Self::decode_object(&key)?;
        let value = Self::decode_object(&value)?;
        let value = match (self.local, version) {
            (true, Some(ver)) => {
                let version: CacheVersion = serde_json::from_str(&ver)
                    .map_err(|e| StoreError::Loader(format!("corrupted version: {}", e)))?;
                StoreValue::Versioned { value, version }
            }
            _ => StoreValue::Plain(value),
        };
        Ok((key, value))
    }

    async fn upsert(&self, cache: &str, entry: &StoreEntry) -> StoreResult<()> {
        let key = Self::encode_key(&entry.key)?;
        let (value, version) = self.encode_value(&entry.value)?;
        self.db
            .execute(Statement::from_sql_and_values(
                DatabaseBackend::Sqlite,
                UPSERT_SQL,
                vec![
                    Value::String(Some(Box::new(cache.to_string()))),
                    Value::String(Some(Box::new(key))),
                    Value::String(Some(Box::new(value))),
                    Value::String(version.map(Box::new)),
                ],
            ))
            .await?;
        Ok(())
    }

    async fn delete_row(&self, cache: &str, key: &CacheObject) -> StoreResult<()> {
        let key = Self::encode_key(key)?;
        self.db
            .execute(Statement::from_sql_and_values(
                DatabaseBackend::Sqlite,
                "DELETE FROM cache_store WHERE cache_name = ?1 AND store_key = ?2",
                vec![
                    Value::String(Some(Box::new(cache.to_string()))),
                    Value::String(Some(Box::new(key))),
                ],
            ))
            .await?;
        Ok(())
    }

    /// 某个缓存在存储中的行数
    pub async fn count(&self, cache: &str) -> StoreResult<u64> {
        let row = self
            .db
            .query_one(Statement::from_sql_and_values(
                DatabaseBackend::Sqlite,
                "SELECT COUNT(*) AS cnt FROM cache_store WHERE cache_name = ?1",
                vec![Value::String(Some(Box::new(cache.to_string())))],
            ))
            .await?;
        match row {
            Some(row) => {
                let cnt: i64 = row.try_get("", "cnt")?;
                Ok(cnt as u64)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl CacheStore for SqlStore {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            session_aware: true,
            lifecycle_aware: true,
            local: self.local,
        }
    }

    #[instrument(skip(self, ses), level = "debug")]
    async fn load(
        &self,
        ses: Option<&StoreSession>,
        key: &CacheObject,
    ) -> StoreResult<Option<StoreValue>> {
        let cache = self.cache_name(ses);
        let encoded = Self::encode_key(key)?;
        let row = self
            .db
            .query_one(Statement::from_sql_and_values(
                DatabaseBackend::Sqlite,
                "SELECT store_key, store_value, version FROM cache_store \
                 WHERE cache_name = ?1 AND store_key = ?2",
                vec![
                    Value::String(Some(Box::new(cache))),
                    Value::String(Some(Box::new(encoded))),
                ],
            ))
            .await?;
        row.map(|r| self.decode_row(&r).map(|(_, v)| v)).transpose()
    }

    #[instrument(skip(self, ses, keys), level = "debug", fields(keys = keys.len()))]
    async fn load_all(
        &self,
        ses: Option<&StoreSession>,
        keys: &[CacheObject],
    ) -> StoreResult<Vec<(CacheObject, StoreValue)>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let cache = self.cache_name(ses);
        let mut out = Vec::with_capacity(keys.len());
        // SQLite 限制单条语句的绑定参数个数
        for chunk in keys.chunks(LOAD_ALL_CHUNK_SIZE) {
            let mut values = vec![Value::String(Some(Box::new(cache.clone())))];
            let mut placeholders = Vec::with_capacity(chunk.len());
            for (i, key) in chunk.iter().enumerate() {
                placeholders.push(format!("?{}", i + 2));
                values.push(Value::String(Some(Box::new(Self::encode_key(key)?))));
            }
            let sql = format!(
                "SELECT store_key, store_value, version FROM cache_store \
                 WHERE cache_name = ?1 AND store_key IN ({})",
                placeholders.join(",")
            );

            let rows = self
                .db
                .query_all(Statement::from_sql_and_values(
                    DatabaseBackend::Sqlite,
                    sql,
                    values,
                ))
                .await?;
            for row in &rows {
                out.push(self.decode_row(row)?);
            }
        }
        debug!("SQL store load_all: keys={}, found={}", keys.len(), out.len());
        Ok(out)
    }

    /// `args` 的第一个元素若为整数，则作为最多加载的行数
    #[instrument(skip(self, ses, sink), level = "debug")]
    async fn load_cache(
        &self,
        ses: Option<&StoreSession>,
        sink: &mut LoadCacheSink<'_>,
        args: &[serde_json::Value],
    ) -> StoreResult<()> {
        let cache = self.cache_name(ses);
        let limit = args.first().and_then(|a| a.as_i64()).unwrap_or(-1);
        let rows = self
            .db
            .query_all(Statement::from_sql_and_values(
                DatabaseBackend::Sqlite,
                "SELECT store_key, store_value, version FROM cache_store \
                 WHERE cache_name = ?1 ORDER BY store_key LIMIT ?2",
                vec![
                    Value::String(Some(Box::new(cache))),
                    Value::BigInt(Some(limit)),
                ],
            ))
            .await?;
        debug!("SQL store load_cache: rows={}", rows.len());
        for row in &rows {
            let (k, v) = self.decode_row(row)?;
            sink(k, v);
        }
        Ok(())
    }

    async fn write(&self, ses: Option<&StoreSession>, entry: StoreEntry) -> StoreResult<()> {
        let cache = self.cache_name(ses);
        self.upsert(&cache, &entry).await
    }

    async fn write_all(
        &self,
        ses: Option<&StoreSession>,
        entries: &mut EntriesView,
    ) -> StoreResult<()> {
        let cache = self.cache_name(ses);
        let pending: Vec<StoreEntry> = entries.iter().cloned().collect();
        for entry in pending {
            self.upsert(&cache, &entry).await?;
            entries.remove(&entry.key);
        }
        Ok(())
    }

    async fn delete(&self, ses: Option<&StoreSession>, key: &CacheObject) -> StoreResult<()> {
        let cache = self.cache_name(ses);
        self.delete_row(&cache, key).await
    }

    async fn delete_all(&self, ses: Option<&StoreSession>, keys: &mut KeysView) -> StoreResult<()> {
        let cache = self.cache_name(ses);
        for key in keys.remaining_keys() {
            self.delete_row(&cache, &key).await?;
            keys.remove(&key);
        }
        Ok(())
    }

    async fn tx_end(&self, ses: Option<&StoreSession>, commit: bool) -> StoreResult<()> {
        debug!(
            "SQL store tx_end: tx={:?}, commit={}",
            ses.and_then(|s| s.transaction()),
            commit
        );
        Ok(())
    }

    async fn start(&self) -> StoreResult<()> {
        self.ensure_schema().await
    }
}
