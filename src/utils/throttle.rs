//! Copyright (c) 2025, Kirky.X
//!
//! MIT License
//!
//! 连续失败计数器，用于限制重复告警。

use std::sync::atomic::{AtomicU32, Ordering};

/// 默认告警阈值
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 10;

/// 连续失败计数器
///
/// 连续失败次数超过阈值时返回 true（调用方据此打印一次告警），然后重新计数；
/// 任意一次成功都会清零。
#[derive(Debug)]
pub struct FailureThrottle {
    failures: AtomicU32,
    threshold: u32,
}

impl Default for FailureThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl FailureThrottle {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            threshold,
        }
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    /// 记录一次失败，返回是否应当告警
    pub fn record_failure(&self) -> bool {
        let count = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.threshold {
            self.failures.store(0, Ordering::Release);
            return true;
        }
        false
    }

    /// 当前连续失败次数
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }
}
