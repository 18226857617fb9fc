//! 验证尝试速率限制模块
//!
//! 针对验证码暴力破解的每用户固定窗口限制：窗口内失败次数达到上限后
//! 触发锁定，锁定期间所有验证请求直接拒绝。成功验证立即清除失败记录。
//!
//! ## 示例
//!
//! ```rust
//! use twofa::limiter::{RateLimitConfig, VerifyRateLimiter};
//!
//! let limiter = VerifyRateLimiter::new(RateLimitConfig::default());
//!
//! // 检查通过后才执行验证；验证失败时记录
//! limiter.check("user123").unwrap();
//! limiter.record_failure("user123").unwrap();
//!
//! // 成功验证清除所有失败记录
//! limiter.clear("user123").unwrap();
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{Error, Result, StorageError};

/// 速率限制配置
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// 窗口内允许的最大失败次数，默认 5 次
    pub max_attempts: u32,
    /// 失败计数窗口，默认 5 分钟
    pub window: Duration,
    /// 触发后的锁定时长，默认 15 分钟
    pub lockout_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(300),
            lockout_duration: Duration::from_secs(900),
        }
    }
}

impl RateLimitConfig {
    /// 创建新的配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置最大失败次数
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        assert!(max > 0, "max attempts must be positive");
        self.max_attempts = max;
        self
    }

    /// 设置失败计数窗口
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// 设置锁定时长
    pub fn with_lockout_duration(mut self, duration: Duration) -> Self {
        self.lockout_duration = duration;
        self
    }
}

/// 当前限制状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// 是否允许下一次尝试
    pub allowed: bool,
    /// 剩余可用尝试次数
    pub remaining_attempts: u32,
    /// 锁定结束时间（如果处于锁定状态）
    pub lockout_until: Option<DateTime<Utc>>,
}

/// 每用户的失败记录
#[derive(Debug, Clone)]
struct AttemptRecord {
    /// 当前窗口内的失败次数
    attempts: u32,
    /// 当前窗口的起点
    window_start: DateTime<Utc>,
    /// 锁定结束时间
    lockout_until: Option<DateTime<Utc>>,
}

impl AttemptRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            attempts: 0,
            window_start: now,
            lockout_until: None,
        }
    }

    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lockout_until.is_some_and(|until| now < until)
    }

    /// 窗口过期或锁定结束时重置计数
    fn reset_if_elapsed(&mut self, now: DateTime<Utc>, window: TimeDelta) {
        if let Some(until) = self.lockout_until
            && now >= until
        {
            *self = Self::new(now);
            return;
        }

        if self.lockout_until.is_none() && now - self.window_start >= window {
            *self = Self::new(now);
        }
    }
}

/// 验证尝试速率限制器
///
/// 只统计失败：`check` 在执行验证前调用，`record_failure` 在验证失败后
/// 调用，成功时调用 `clear`。登录挑战与方法管理使用各自独立的实例，
/// 互不影响计数。
pub struct VerifyRateLimiter {
    config: RateLimitConfig,
    records: Arc<RwLock<HashMap<String, AttemptRecord>>>,
}

impl VerifyRateLimiter {
    /// 创建新的限制器
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 检查用户是否允许下一次验证尝试
    ///
    /// 锁定中或失败次数已达上限时返回 [`Error::RateLimited`]。
    pub fn check(&self, user_id: &str) -> Result<()> {
        let now = Utc::now();
        let window = self.window_delta();
        let mut records = self.records.write().map_err(lock_poisoned)?;

        let Some(record) = records.get_mut(user_id) else {
            return Ok(());
        };
        record.reset_if_elapsed(now, window);

        if record.is_locked(now) {
            return Err(Error::rate_limited(0, record.lockout_until));
        }

        if record.attempts >= self.config.max_attempts {
            return Err(Error::rate_limited(0, record.lockout_until));
        }

        Ok(())
    }

    /// 记录一次验证失败
    ///
    /// 达到上限的那次失败触发锁定。
    pub fn record_failure(&self, user_id: &str) -> Result<RateLimitStatus> {
        let now = Utc::now();
        let window = self.window_delta();
        let mut records = self.records.write().map_err(lock_poisoned)?;

        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| AttemptRecord::new(now));
        record.reset_if_elapsed(now, window);

        record.attempts += 1;
        if record.attempts >= self.config.max_attempts && record.lockout_until.is_none() {
            let until = now + self.lockout_delta();
            record.lockout_until = Some(until);
            tracing::warn!(user_id, lockout_until = %until, "verification lockout triggered");
        }

        Ok(self.status_of(record, now))
    }

    /// 清除用户的失败记录（成功验证后调用）
    pub fn clear(&self, user_id: &str) -> Result<()> {
        let mut records = self.records.write().map_err(lock_poisoned)?;
        records.remove(user_id);
        Ok(())
    }

    /// 查询用户的当前限制状态
    pub fn status(&self, user_id: &str) -> Result<RateLimitStatus> {
        let now = Utc::now();
        let window = self.window_delta();
        let mut records = self.records.write().map_err(lock_poisoned)?;

        match records.get_mut(user_id) {
            Some(record) => {
                record.reset_if_elapsed(now, window);
                Ok(self.status_of(record, now))
            }
            None => Ok(RateLimitStatus {
                allowed: true,
                remaining_attempts: self.config.max_attempts,
                lockout_until: None,
            }),
        }
    }

    /// 清理所有已过期的记录，返回清理数量
    pub fn cleanup(&self) -> Result<usize> {
        let now = Utc::now();
        let window = self.window_delta();
        let mut records = self.records.write().map_err(lock_poisoned)?;

        let before = records.len();
        records.retain(|_, record| {
            if record.is_locked(now) {
                return true;
            }
            if let Some(until) = record.lockout_until {
                return now < until;
            }
            now - record.window_start < window
        });

        Ok(before - records.len())
    }

    /// 跟踪中的用户数量
    pub fn tracked_users(&self) -> Result<usize> {
        let records = self.records.read().map_err(lock_poisoned)?;
        Ok(records.len())
    }

    /// 启动后台清理任务
    ///
    /// 每 5 分钟清理一次过期记录，直到返回的句柄被 abort。
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.spawn_sweeper_with_interval(Duration::from_secs(300))
    }

    /// 按指定间隔启动后台清理任务
    pub fn spawn_sweeper_with_interval(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match limiter.cleanup() {
                    Ok(removed) if removed > 0 => {
                        tracing::debug!(removed, "rate limit records swept");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "rate limit sweep failed"),
                }
            }
        })
    }

    // ========================================================================
    // 内部方法
    // ========================================================================

    fn status_of(&self, record: &AttemptRecord, now: DateTime<Utc>) -> RateLimitStatus {
        let locked = record.is_locked(now);
        let remaining = self.config.max_attempts.saturating_sub(record.attempts);
        RateLimitStatus {
            allowed: !locked && remaining > 0,
            remaining_attempts: remaining,
            lockout_until: record.lockout_until.filter(|until| now < *until),
        }
    }

    fn window_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.window).unwrap_or(TimeDelta::MAX)
    }

    fn lockout_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.lockout_duration).unwrap_or(TimeDelta::MAX)
    }
}

fn lock_poisoned<T>(_: T) -> Error {
    Error::Storage(StorageError::OperationFailed("lock poisoned".to_string()))
}
