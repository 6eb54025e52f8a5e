//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 加载合并门：同一个键的并发加载只触发一次存储调用。

use crate::error::StoreResult;
use crate::object::{CacheObject, StoreValue};
use crate::session::StoreSession;
use crate::store::CacheStore;
use ahash::{AHashMap, AHashSet};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// 默认的批量加载阈值
pub const DEFAULT_LOAD_ALL_THRESHOLD: usize = 5;

type LoadOutcome = StoreResult<Option<StoreValue>>;

/// 批量加载回调
pub type LoadAllCallback<'a> = dyn FnMut(CacheObject, StoreValue) + Send + 'a;

struct InFlight {
    id: u64,
    rx: watch::Receiver<Option<LoadOutcome>>,
}

/// 正在进行的加载，由发起者持有
///
/// 完成时把结果广播给等待者；若发起者在完成前被取消，
/// 标记被移除，等待者会自行重试。
struct Leader<'a> {
    in_flight: &'a DashMap<CacheObject, InFlight>,
    key: CacheObject,
    id: u64,
    tx: watch::Sender<Option<LoadOutcome>>,
}

impl Leader<'_> {
    fn complete(self, outcome: LoadOutcome) {
        self.tx.send_replace(Some(outcome));
        // Drop 负责移除标记
    }
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.in_flight.remove_if(&self.key, |_, f| f.id == id);
    }
}

enum Claim<'a> {
    Lead(Leader<'a>),
    Wait(watch::Receiver<Option<LoadOutcome>>),
}

/// 加载合并门
pub struct LoadGate {
    store: Arc<dyn CacheStore>,
    in_flight: DashMap<CacheObject, InFlight>,
    next_id: AtomicU64,
    threshold: usize,
}

impl std::fmt::Debug for LoadGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadGate")
            .field("threshold", &self.threshold)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl LoadGate {
    pub fn new(store: Arc<dyn CacheStore>, threshold: usize) -> Self {
        Self {
            store,
            in_flight: DashMap::new(),
            next_id: AtomicU64::new(1),
            threshold,
        }
    }

    /// 批量请求的键数达到该值时绕过合并门，直接调用存储的批量接口
    pub fn load_all_threshold(&self) -> usize {
        self.threshold
    }

    /// 当前正在进行的加载数
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn claim(&self, key: &CacheObject) -> Claim<'_> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(e) => Claim::Wait(e.get().rx.clone()),
            Entry::Vacant(e) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                e.insert(InFlight { id, rx });
                Claim::Lead(Leader {
                    in_flight: &self.in_flight,
                    key: key.clone(),
                    id,
                    tx,
                })
            }
        }
    }

    /// 等待他人的加载结果，发起者被取消时返回 None
    async fn wait(mut rx: watch::Receiver<Option<LoadOutcome>>) -> Option<LoadOutcome> {
        match rx.wait_for(|v| v.is_some()).await {
            Ok(v) => v.clone(),
            Err(_) => None,
        }
    }

    /// 加载单个键
    pub async fn load(&self, ses: Option<&StoreSession>, key: &CacheObject) -> LoadOutcome {
        loop {
            match self.claim(key) {
                Claim::Lead(leader) => {
                    let outcome = self.store.load(ses, key).await;
                    leader.complete(outcome.clone());
                    return outcome;
                }
                Claim::Wait(rx) => {
                    trace!("Waiting for in-flight load: key={}", key);
                    if let Some(outcome) = Self::wait(rx).await {
                        return outcome;
                    }
                }
            }
        }
    }

    /// 批量加载
    ///
    /// 无人加载的键由本次调用发起一次存储调用，其余键等待他人的结果。
    /// 回调只对存在的键调用。
    pub async fn load_all(
        &self,
        ses: Option<&StoreSession>,
        keys: &[CacheObject],
        callback: &mut LoadAllCallback<'_>,
    ) -> StoreResult<()> {
        let mut seen = AHashSet::with_capacity(keys.len());
        let mut leaders = Vec::new();
        let mut waiting = Vec::new();

        for key in keys {
            if !seen.insert(key) {
                continue;
            }
            match self.claim(key) {
                Claim::Lead(leader) => leaders.push(leader),
                Claim::Wait(rx) => waiting.push((key, rx)),
            }
        }

        debug!(
            "Gate load_all: leading={}, waiting={}",
            leaders.len(),
            waiting.len()
        );

        if !leaders.is_empty() {
            let led: Vec<CacheObject> = leaders.iter().map(|l| l.key.clone()).collect();
            let loaded = if led.len() == 1 {
                self.store
                    .load(ses, &led[0])
                    .await
                    .map(|v| v.map(|v| (led[0].clone(), v)).into_iter().collect())
            } else {
                self.store.load_all(ses, &led).await
            };

            match loaded {
                Ok(found) => {
                    let mut found: AHashMap<CacheObject, StoreValue> = found.into_iter().collect();
                    for leader in leaders {
                        let value = found.remove(&leader.key);
                        let key = leader.key.clone();
                        leader.complete(Ok(value.clone()));
                        if let Some(v) = value {
                            callback(key, v);
                        }
                    }
                }
                Err(e) => {
                    for leader in leaders {
                        leader.complete(Err(e.clone()));
                    }
                    return Err(e);
                }
            }
        }

        for (key, rx) in waiting {
            let outcome = match Self::wait(rx).await {
                Some(outcome) => outcome,
                None => self.load(ses, key).await,
            };
            if let Some(v) = outcome? {
                callback(key.clone(), v);
            }
        }

        Ok(())
    }
}
