//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了批量写入/删除时交给存储的可变视图。
//!
//! 视图保存有序记录以及一个排除集合。存储每确认一条记录就把它从视图中移除
//! （仅标记排除），失败时视图里剩下的正是尚未确认的记录。

use crate::error::StoreResult;
use crate::object::{CacheObject, StoreEntry};
use ahash::{AHashMap, AHashSet};

/// 视图中的记录
pub trait BatchRecord {
    /// 记录对应的存储键
    fn store_key(&self) -> &CacheObject;
}

impl BatchRecord for StoreEntry {
    fn store_key(&self) -> &CacheObject {
        &self.key
    }
}

impl BatchRecord for CacheObject {
    fn store_key(&self) -> &CacheObject {
        self
    }
}

/// 批量操作视图
#[derive(Debug, Clone)]
pub struct BatchView<T> {
    records: Vec<T>,
    index: AHashMap<CacheObject, usize>,
    excluded: AHashSet<usize>,
    cleared: bool,
}

/// 批量写入视图
pub type EntriesView = BatchView<StoreEntry>;

/// 批量删除视图
pub type KeysView = BatchView<CacheObject>;

impl<T: BatchRecord> BatchView<T> {
    pub fn new(records: Vec<T>) -> Self {
        let index = records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.store_key().clone(), i))
            .collect();
        Self {
            records,
            index,
            excluded: AHashSet::new(),
            cleared: false,
        }
    }

    /// 剩余（未移除）的记录数
    pub fn len(&self) -> usize {
        if self.cleared {
            0
        } else {
            self.records.len() - self.excluded.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按原始顺序遍历剩余记录，可重复调用
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.remaining_positions().map(move |i| &self.records[i])
    }

    /// 剩余记录在原始序列中的位置
    pub fn remaining_positions(&self) -> impl Iterator<Item = usize> + '_ {
        let end = if self.cleared { 0 } else { self.records.len() };
        (0..end).filter(move |i| !self.excluded.contains(i))
    }

    /// 视图中是否还有该键
    pub fn contains(&self, key: &CacheObject) -> bool {
        !self.cleared
            && self
                .index
                .get(key)
                .is_some_and(|i| !self.excluded.contains(i))
    }

    /// 移除一条记录（存储确认已处理），返回视图是否发生变化
    pub fn remove(&mut self, key: &CacheObject) -> bool {
        if self.cleared {
            return false;
        }
        match self.index.get(key) {
            Some(&i) => self.excluded.insert(i),
            None => false,
        }
    }

    /// 只保留满足条件的记录
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> bool {
        let drop: Vec<usize> = self
            .remaining_positions()
            .filter(|&i| !keep(&self.records[i]))
            .collect();
        let modified = !drop.is_empty();
        self.excluded.extend(drop);
        modified
    }

    /// 移除所有记录
    pub fn clear(&mut self) {
        self.cleared = true;
    }

    /// 依次处理剩余记录，每条成功后立即移除，遇到错误即停止
    pub fn try_consume(&mut self, mut f: impl FnMut(&T) -> StoreResult<()>) -> StoreResult<()> {
        let positions: Vec<usize> = self.remaining_positions().collect();
        for i in positions {
            f(&self.records[i])?;
            self.excluded.insert(i);
        }
        Ok(())
    }

    /// 剩余记录的存储键
    pub fn remaining_keys(&self) -> Vec<CacheObject> {
        self.iter().map(|r| r.store_key().clone()).collect()
    }
}
