//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了存储会话及其注册表。
//!
//! 会话以显式参数的形式传给存储，只在一次调用期间可见；
//! 绑定事务时，会话挂在事务上，直到 `end_session` 将其移除。

use crate::store::CacheStore;
use ahash::AHashMap;
use dashmap::DashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::trace;
use uuid::Uuid;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// 存储会话
///
/// 存储实现可以通过它得知当前事务、当前发起调用的缓存，
/// 并在同一工作单元的多次调用之间传递自定义属性。
#[derive(Debug)]
pub struct StoreSession {
    tx_id: Option<Uuid>,
    cache_name: RwLock<String>,
    props: OnceLock<Mutex<AHashMap<String, serde_json::Value>>>,
}

impl StoreSession {
    fn new(tx_id: Option<Uuid>, cache_name: &str) -> Self {
        Self {
            tx_id,
            cache_name: RwLock::new(cache_name.to_string()),
            props: OnceLock::new(),
        }
    }

    /// 不属于任何事务的会话，由写后缓冲在刷新时使用
    pub(crate) fn standalone(cache_name: &str) -> Self {
        Self::new(None, cache_name)
    }

    /// 所属事务，非事务调用返回 None
    pub fn transaction(&self) -> Option<Uuid> {
        self.tx_id
    }

    /// 是否处于事务中
    pub fn is_within_transaction(&self) -> bool {
        self.tx_id.is_some()
    }

    /// 当前发起调用的缓存名称
    pub fn cache_name(&self) -> String {
        self.cache_name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_cache_name(&self, name: &str) {
        let mut guard = self.cache_name.write().unwrap_or_else(|e| e.into_inner());
        if guard.as_str() != name {
            guard.clear();
            guard.push_str(name);
        }
    }

    /// 读取会话属性
    pub fn property(&self, key: &str) -> Option<serde_json::Value> {
        self.props
            .get()
            .and_then(|p| p.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }

    /// 设置会话属性，返回旧值
    pub fn set_property(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        self.with_properties(|p| p.insert(key.into(), value))
    }

    /// 删除会话属性
    pub fn remove_property(&self, key: &str) -> Option<serde_json::Value> {
        self.with_properties(|p| p.remove(key))
    }

    /// 在属性表上执行操作，属性表首次访问时才创建
    pub fn with_properties<R>(
        &self,
        f: impl FnOnce(&mut AHashMap<String, serde_json::Value>) -> R,
    ) -> R {
        let props = self.props.get_or_init(|| Mutex::new(AHashMap::new()));
        let mut guard = props.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[derive(Debug)]
enum SessionSlot {
    Active(Arc<StoreSession>),
    Ended,
}

/// 缓存事务（工作单元）
///
/// 事务拥有其会话；同一事务内对同一存储的多次调用复用同一个会话。
#[derive(Debug)]
pub struct CacheTx {
    id: Uuid,
    // 注册表ID -> 会话
    sessions: DashMap<u64, SessionSlot>,
}

impl CacheTx {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            sessions: DashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 事务当前是否持有某个注册表的会话
    pub fn has_session(&self, registry: &SessionRegistry) -> bool {
        matches!(
            self.sessions.get(&registry.id).as_deref(),
            Some(SessionSlot::Active(_))
        )
    }
}

impl Default for CacheTx {
    fn default() -> Self {
        Self::new()
    }
}

/// 会话作用域
///
/// 一次存储调用期间持有会话，离开作用域后会话对存储不再可见。
/// 不可克隆，存储只能拿到 `&StoreSession`。
#[derive(Debug)]
pub struct SessionScope {
    session: Arc<StoreSession>,
}

impl Deref for SessionScope {
    type Target = StoreSession;

    fn deref(&self) -> &StoreSession {
        &self.session
    }
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        trace!(
            "Session scope closed [tx={:?}, cache={}]",
            self.session.tx_id,
            self.session.cache_name()
        );
    }
}

/// 会话注册表
///
/// 共享同一存储实例的多个管理器使用同一个注册表，从而在同一事务内看到同一个会话。
#[derive(Debug)]
pub struct SessionRegistry {
    id: u64,
    enabled: bool,
}

impl SessionRegistry {
    pub fn new(enabled: bool) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            enabled,
        }
    }

    /// 存储是否接受会话
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 为一次调用打开会话
    ///
    /// 存储不支持会话时返回 None。事务内复用已挂在事务上的会话并更新缓存名称。
    pub fn begin(&self, tx: Option<&CacheTx>, cache_name: &str) -> Option<SessionScope> {
        if !self.enabled {
            return None;
        }

        let session = match tx {
            Some(tx) => {
                let mut slot = tx.sessions.entry(self.id).or_insert(SessionSlot::Ended);
                let existing = match &*slot {
                    SessionSlot::Active(ses) => Some(ses.clone()),
                    SessionSlot::Ended => None,
                };
                match existing {
                    Some(ses) => {
                        // 跨缓存事务中缓存名称可能变化
                        ses.set_cache_name(cache_name);
                        ses
                    }
                    None => {
                        let ses = Arc::new(StoreSession::new(Some(tx.id), cache_name));
                        *slot = SessionSlot::Active(ses.clone());
                        ses
                    }
                }
            }
            None => Arc::new(StoreSession::new(None, cache_name)),
        };

        Some(SessionScope { session })
    }

    /// 事务结束时移除会话
    ///
    /// 返回事务之前是否持有活动会话
    pub fn detach(&self, tx: &CacheTx) -> bool {
        let prev = tx.sessions.insert(self.id, SessionSlot::Ended);
        matches!(prev, Some(SessionSlot::Active(_)))
    }

    /// 事务对该注册表是否已经结束
    pub fn is_ended(&self, tx: &CacheTx) -> bool {
        matches!(tx.sessions.get(&self.id).as_deref(), Some(SessionSlot::Ended))
    }
}

/// 会话注册表集合
///
/// 以存储实例的身份为键，让包装同一存储的管理器共享注册表
#[derive(Default)]
pub struct SessionHolders {
    holders: DashMap<usize, (Arc<dyn CacheStore>, Arc<SessionRegistry>)>,
}

impl SessionHolders {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取或创建存储对应的注册表
    pub fn registry_for(&self, store: &Arc<dyn CacheStore>) -> Arc<SessionRegistry> {
        let id = store_identity(store);
        self.holders
            .entry(id)
            .or_insert_with(|| {
                let enabled = store.capabilities().session_aware;
                (store.clone(), Arc::new(SessionRegistry::new(enabled)))
            })
            .1
            .clone()
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}

impl std::fmt::Debug for SessionHolders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHolders")
            .field("stores", &self.holders.len())
            .finish()
    }
}

fn store_identity(store: &Arc<dyn CacheStore>) -> usize {
    Arc::as_ptr(store) as *const () as usize
}
