//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 写后缓冲存储：把写入和删除暂存在内存中，由后台任务批量刷新到底层存储。
//!
//! 缓冲区按键合并，同一个键只保留最新的操作。读取时先查缓冲区，
//! 因此本节点在刷新前就能读到自己的写入。

use super::common::{calculate_retry_delay, estimate_operation_size, BatchOperation, FlushFailure};
use crate::config::WriteBehindConfig;
use crate::error::{StoreError, StoreResult};
use crate::metrics::GLOBAL_METRICS;
use crate::object::{CacheObject, StoreEntry, StoreValue};
use crate::session::StoreSession;
use crate::store::{CacheStore, EntriesView, KeysView, LoadCacheSink, StoreCapabilities};
use crate::utils::throttle::FailureThrottle;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use murmur3::murmur3_32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// 最多保留的失败记录数
const MAX_RECORDED_FAILURES: usize = 1024;

/// 缓冲区条目
#[derive(Debug, Clone)]
struct Pending {
    operation: BatchOperation,
    /// 入队序号，刷新成功后只有序号未变的条目才会被移除
    seq: u64,
    shard: usize,
}

/// 写后缓冲统计
#[derive(Debug, Default)]
pub struct WriteBehindStats {
    pub enqueued: AtomicU64,
    pub flushed: AtomicU64,
    pub retried: AtomicU64,
    pub dropped: AtomicU64,
    pub batch_count: AtomicU64,
    pub total_bytes: AtomicU64,
}

struct Inner {
    store: Arc<dyn CacheStore>,
    cache_name: String,
    config: WriteBehindConfig,
    buffer: DashMap<CacheObject, Pending>,
    /// 每个分片一把锁，同一分片的刷新串行执行
    shards: Vec<tokio::sync::Mutex<()>>,
    notifies: Vec<Notify>,
    seq: AtomicU64,
    stopped: AtomicBool,
    shutdown: CancellationToken,
    stats: WriteBehindStats,
    failures: Mutex<Vec<FlushFailure>>,
    throttle: FailureThrottle,
    /// 刷新时交给会话感知存储的会话，携带本缓存的名称
    flush_session: Option<StoreSession>,
}

/// 写后缓冲存储
pub struct WriteBehindStore {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WriteBehindStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBehindStore")
            .field("cache_name", &self.inner.cache_name)
            .field("store", &self.inner.store)
            .field("buffered", &self.inner.buffer.len())
            .finish()
    }
}

impl WriteBehindStore {
    /// 创建写后缓冲存储
    ///
    /// # 参数
    ///
    /// * `cache_name` - 缓存名称，用于日志和指标
    /// * `store` - 底层存储
    /// * `config` - 写后缓冲配置
    /// * `failure_warn_threshold` - 连续刷新失败多少次后打印告警
    pub fn new(
        cache_name: impl Into<String>,
        store: Arc<dyn CacheStore>,
        config: WriteBehindConfig,
        failure_warn_threshold: u32,
    ) -> Self {
        let shard_count = config.flush_thread_count.max(1);
        let cache_name = cache_name.into();
        let flush_session = store
            .capabilities()
            .session_aware
            .then(|| StoreSession::standalone(&cache_name));
        Self {
            inner: Arc::new(Inner {
                store,
                cache_name,
                config,
                buffer: DashMap::new(),
                shards: (0..shard_count).map(|_| tokio::sync::Mutex::new(())).collect(),
                notifies: (0..shard_count).map(|_| Notify::new()).collect(),
                seq: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                stats: WriteBehindStats::default(),
                failures: Mutex::new(Vec::new()),
                throttle: FailureThrottle::new(failure_warn_threshold),
                flush_session,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// 底层存储
    pub fn underlying(&self) -> &Arc<dyn CacheStore> {
        &self.inner.store
    }

    /// 缓冲中的条目数
    pub fn buffered(&self) -> usize {
        self.inner.buffer.len()
    }

    pub fn stats(&self) -> &WriteBehindStats {
        &self.inner.stats
    }

    /// 取出并清空已记录的刷新失败
    pub fn take_flush_failures(&self) -> Vec<FlushFailure> {
        let mut failures = self
            .inner
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *failures)
    }

    /// 立即刷新所有分片
    ///
    /// 本次刷新中有条目被丢弃时返回错误
    pub async fn force_flush(&self) -> StoreResult<()> {
        let dropped = self.inner.flush_all().await;
        if dropped > 0 {
            return Err(StoreError::Writer(format!(
                "{} buffered entries could not be flushed [cache={}]",
                dropped, self.inner.cache_name
            )));
        }
        Ok(())
    }

    fn spawn_worker(inner: Arc<Inner>, shard: usize) -> JoinHandle<()> {
        tokio::spawn(async move {
            let freq = inner.config.flush_frequency_ms;
            let mut interval = tokio::time::interval(Duration::from_millis(freq.max(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即完成
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = interval.tick(), if freq > 0 => {
                        inner.flush_shard(shard).await;
                    }
                    _ = inner.notifies[shard].notified() => {
                        inner.flush_shard(shard).await;
                    }
                }
            }
            debug!(
                "Write-behind worker stopped [cache={}, shard={}]",
                inner.cache_name, shard
            );
        })
    }
}

impl Inner {
    fn shard_for(&self, key: &CacheObject) -> usize {
        let hash = murmur3_32(&mut key.hash_bytes().as_slice(), 0).unwrap_or(0);
        hash as usize % self.shards.len()
    }

    fn buffered_read(&self, key: &CacheObject) -> Option<Option<StoreValue>> {
        self.buffer.get(key).map(|p| match &p.operation {
            BatchOperation::Write(v) => Some(v.clone()),
            BatchOperation::Delete => None,
        })
    }

    async fn enqueue(&self, key: CacheObject, operation: BatchOperation) -> StoreResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(StoreError::Shutdown(format!(
                "write-behind store is stopped [cache={}]",
                self.cache_name
            )));
        }

        let shard = self.shard_for(&key);
        if self.buffer.len() >= self.config.max_buffer_size && !self.buffer.contains_key(&key) {
            // 缓冲区已满，由调用方先同步刷新全部分片
            debug!(
                "Write-behind buffer full, flushing inline [cache={}, buffered={}]",
                self.cache_name,
                self.buffer.len()
            );
            self.flush_all().await;
        }

        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.total_bytes.fetch_add(
            estimate_operation_size(&key, &operation) as u64,
            Ordering::Relaxed,
        );
        self.buffer.insert(
            key,
            Pending {
                operation,
                seq,
                shard,
            },
        );
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);

        let len = self.buffer.len();
        GLOBAL_METRICS.set_write_behind_buffer_size(&self.cache_name, len);

        if len >= self.config.flush_size {
            for notify in &self.notifies {
                notify.notify_one();
            }
        }
        Ok(())
    }

    async fn flush_all(&self) -> usize {
        join_all((0..self.shards.len()).map(|shard| self.flush_shard(shard)))
            .await
            .into_iter()
            .sum()
    }

    /// 刷新一个分片，返回被丢弃的条目数
    ///
    /// 只处理开始刷新时已入队的条目，按入队顺序分批写入
    async fn flush_shard(&self, shard: usize) -> usize {
        let _guard = self.shards[shard].lock().await;
        let limit = self.seq.load(Ordering::Acquire);
        let mut dropped = 0;

        loop {
            let mut batch: Vec<(CacheObject, Pending)> = self
                .buffer
                .iter()
                .filter(|e| e.shard == shard && e.seq <= limit)
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect();
            if batch.is_empty() {
                break;
            }
            batch.sort_by_key(|(_, p)| p.seq);
            batch.truncate(self.config.batch_size.max(1));
            dropped += self.flush_batch(batch).await;
        }

        GLOBAL_METRICS.set_write_behind_buffer_size(&self.cache_name, self.buffer.len());
        dropped
    }

    /// 按入队顺序把批次切成连续的写入段和删除段，分别交给 write_all / delete_all
    async fn flush_batch(&self, batch: Vec<(CacheObject, Pending)>) -> usize {
        let is_write = |p: &Pending| matches!(p.operation, BatchOperation::Write(_));
        let mut dropped = 0;
        let mut start = 0;
        while start < batch.len() {
            let kind = is_write(&batch[start].1);
            let end = batch[start..]
                .iter()
                .position(|(_, p)| is_write(p) != kind)
                .map_or(batch.len(), |i| start + i);
            dropped += self.flush_run(&batch[start..end]).await;
            start = end;
        }
        self.stats.batch_count.fetch_add(1, Ordering::Relaxed);
        dropped
    }

    async fn flush_run(&self, run: &[(CacheObject, Pending)]) -> usize {
        let mut writes = EntriesView::new(
            run.iter()
                .filter_map(|(k, p)| match &p.operation {
                    BatchOperation::Write(v) => Some(StoreEntry::new(k.clone(), v.clone())),
                    BatchOperation::Delete => None,
                })
                .collect(),
        );
        let mut deletes = KeysView::new(
            run.iter()
                .filter(|(_, p)| p.operation == BatchOperation::Delete)
                .map(|(k, _)| k.clone())
                .collect(),
        );

        let mut attempt = 0;
        let last_error = loop {
            let ses = self.flush_session.as_ref();
            let res = if !writes.is_empty() {
                self.store.write_all(ses, &mut writes).await
            } else if !deletes.is_empty() {
                self.store.delete_all(ses, &mut deletes).await
            } else {
                Ok(())
            };

            match res {
                Ok(()) => break None,
                Err(e) if attempt >= self.config.max_retries => break Some(e),
                Err(e) => {
                    let delay = calculate_retry_delay(attempt, self.config.retry_delay_ms);
                    warn!(
                        "Write-behind flush failed, retrying in {:?} [cache={}, attempt={}]: {}",
                        delay,
                        self.cache_name,
                        attempt + 1,
                        e
                    );
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        let mut flushed = 0u64;
        let mut failed = Vec::new();
        for (key, pending) in run {
            let remaining = writes.contains(key) || deletes.contains(key);
            if remaining && last_error.is_some() {
                failed.push((key.clone(), pending.operation.clone()));
            } else {
                flushed += 1;
            }
            let seq = pending.seq;
            self.buffer.remove_if(key, |_, p| p.seq == seq);
        }
        self.stats.flushed.fetch_add(flushed, Ordering::Relaxed);

        match last_error {
            None => {
                self.throttle.record_success();
                0
            }
            Some(e) => self.report_failures(failed, e, attempt + 1),
        }
    }

    fn report_failures(
        &self,
        failed: Vec<(CacheObject, BatchOperation)>,
        error: StoreError,
        attempts: u32,
    ) -> usize {
        let count = failed.len();
        error!(
            "Write-behind flush gave up on {} entries [cache={}, attempts={}]: {}",
            count, self.cache_name, attempts, error
        );
        if self.throttle.record_failure() {
            warn!(
                "Write-behind store keeps failing, check the underlying store [cache={}]",
                self.cache_name
            );
        }
        self.stats.dropped.fetch_add(count as u64, Ordering::Relaxed);
        GLOBAL_METRICS.record_flush_failures(&self.cache_name, count as u64);

        let failed_at = Utc::now();
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        for (key, operation) in failed {
            failures.push(FlushFailure {
                key,
                operation,
                error: error.clone(),
                attempts,
                failed_at,
            });
        }
        let overflow = failures.len().saturating_sub(MAX_RECORDED_FAILURES);
        failures.drain(..overflow);
        count
    }
}

#[async_trait]
impl CacheStore for WriteBehindStore {
    fn capabilities(&self) -> StoreCapabilities {
        let caps = self.inner.store.capabilities();
        StoreCapabilities {
            lifecycle_aware: true,
            ..caps
        }
    }

    async fn load(
        &self,
        ses: Option<&StoreSession>,
        key: &CacheObject,
    ) -> StoreResult<Option<StoreValue>> {
        if let Some(buffered) = self.inner.buffered_read(key) {
            return Ok(buffered);
        }
        self.inner.store.load(ses, key).await
    }

    async fn load_all(
        &self,
        ses: Option<&StoreSession>,
        keys: &[CacheObject],
    ) -> StoreResult<Vec<(CacheObject, StoreValue)>> {
        let mut out = Vec::with_capacity(keys.len());
        let mut rest = Vec::new();
        for key in keys {
            match self.inner.buffered_read(key) {
                Some(Some(v)) => out.push((key.clone(), v)),
                Some(None) => {}
                None => rest.push(key.clone()),
            }
        }
        if !rest.is_empty() {
            out.extend(self.inner.store.load_all(ses, &rest).await?);
        }
        Ok(out)
    }

    async fn load_cache(
        &self,
        ses: Option<&StoreSession>,
        sink: &mut LoadCacheSink<'_>,
        args: &[serde_json::Value],
    ) -> StoreResult<()> {
        self.inner.store.load_cache(ses, sink, args).await
    }

    async fn write(&self, _ses: Option<&StoreSession>, entry: StoreEntry) -> StoreResult<()> {
        self.inner
            .enqueue(entry.key, BatchOperation::Write(entry.value))
            .await
    }

    async fn write_all(
        &self,
        _ses: Option<&StoreSession>,
        entries: &mut EntriesView,
    ) -> StoreResult<()> {
        let pending: Vec<StoreEntry> = entries.iter().cloned().collect();
        for entry in pending {
            let key = entry.key.clone();
            self.inner
                .enqueue(entry.key, BatchOperation::Write(entry.value))
                .await?;
            entries.remove(&key);
        }
        Ok(())
    }

    async fn delete(&self, _ses: Option<&StoreSession>, key: &CacheObject) -> StoreResult<()> {
        self.inner.enqueue(key.clone(), BatchOperation::Delete).await
    }

    async fn delete_all(&self, _ses: Option<&StoreSession>, keys: &mut KeysView) -> StoreResult<()> {
        for key in keys.remaining_keys() {
            self.inner
                .enqueue(key.clone(), BatchOperation::Delete)
                .await?;
            keys.remove(&key);
        }
        Ok(())
    }

    async fn tx_end(&self, ses: Option<&StoreSession>, commit: bool) -> StoreResult<()> {
        self.inner.store.tx_end(ses, commit).await
    }

    #[instrument(skip(self), level = "debug", fields(cache = %self.inner.cache_name))]
    async fn start(&self) -> StoreResult<()> {
        if self.inner.store.capabilities().lifecycle_aware {
            self.inner.store.start().await?;
        }

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if !workers.is_empty() {
            return Ok(());
        }
        for shard in 0..self.inner.shards.len() {
            workers.push(Self::spawn_worker(self.inner.clone(), shard));
        }
        info!(
            "Write-behind store started [cache={}, workers={}]",
            self.inner.cache_name,
            workers.len()
        );
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(cache = %self.inner.cache_name))]
    async fn stop(&self) -> StoreResult<()> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.shutdown.cancel();

        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for res in join_all(workers).await {
            if let Err(e) = res {
                warn!("Write-behind worker terminated abnormally: {}", e);
            }
        }

        let dropped = self.inner.flush_all().await;
        if dropped > 0 {
            warn!(
                "Write-behind store stopped with {} unflushed entries [cache={}]",
                dropped, self.inner.cache_name
            );
        }

        if self.inner.store.capabilities().lifecycle_aware {
            self.inner.store.stop().await?;
        }
        info!("Write-behind store stopped [cache={}]", self.inner.cache_name);
        Ok(())
    }
}
