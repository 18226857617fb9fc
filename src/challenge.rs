//! 登录挑战会话模块
//!
//! 密码验证通过但 2FA 未完成时，登录流程处于"挑战"状态：原始登录载荷
//! 暂存在服务端，客户端只拿到一个不可猜测的会话 ID。用户提交有效的
//! TOTP 码或备用码后，会话被消费并换回原始载荷。
//!
//! ## 安全性质
//!
//! - 会话 ID 为 256 位随机值，不可枚举
//! - 会话在 TTL 后过期，读取时惰性清除，后台任务周期性清扫
//! - 验证失败保留会话（允许重试），但计入独立于方法管理侧的速率限制
//! - 验证成功后会话立即销毁，同一会话不能复用
//!
//! ## 示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use twofa::challenge::{ChallengeCodeKind, ChallengeConfig, LoginChallengeManager, NewChallenge};
//! # use twofa::audit::InMemoryAuditSink;
//! # use twofa::cipher::SecretCipher;
//! # use twofa::service::{TwoFactorConfig, TwoFactorService};
//! # use twofa::store::InMemoryMethodStore;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! # let cipher = Arc::new(SecretCipher::new(b"0123456789abcdef0123456789abcdef").unwrap());
//! # let store = Arc::new(InMemoryMethodStore::new(cipher.clone(), Arc::new(InMemoryAuditSink::new())));
//! # let service = Arc::new(TwoFactorService::builder(TwoFactorConfig::default())
//! #     .with_store(store).with_cipher(cipher).build().unwrap());
//! let manager = LoginChallengeManager::new(ChallengeConfig::default(), service);
//!
//! let challenge = manager
//!     .create(NewChallenge {
//!         user_id: "user123".to_string(),
//!         email: "user@example.com".to_string(),
//!         name: "User".to_string(),
//!         tenant_id: None,
//!         original_payload: serde_json::json!({"access_token": "..."}),
//!     })
//!     .unwrap();
//!
//! let result = manager
//!     .verify_login_code(&challenge.id, "123456", ChallengeCodeKind::Totp)
//!     .await
//!     .unwrap();
//! if result.success {
//!     println!("login payload: {:?}", result.payload);
//! }
//! # });
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, StorageError};
use crate::limiter::{RateLimitConfig, VerifyRateLimiter};
use crate::random::generate_challenge_token;
use crate::service::TwoFactorService;

/// 登录挑战配置
#[derive(Debug, Clone)]
pub struct ChallengeConfig {
    /// 会话存活时间，默认 5 分钟
    pub ttl: Duration,
    /// 挑战侧的速率限制配置
    pub rate_limit: RateLimitConfig,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl ChallengeConfig {
    /// 创建新的配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置会话存活时间
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// 设置速率限制配置
    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }
}

/// 创建挑战的参数
#[derive(Debug, Clone)]
pub struct NewChallenge {
    /// 用户 ID
    pub user_id: String,
    /// 用户邮箱
    pub email: String,
    /// 用户显示名
    pub name: String,
    /// 租户 ID（多租户部署时）
    pub tenant_id: Option<String>,
    /// 暂存的原始登录载荷，验证成功后原样返回
    pub original_payload: serde_json::Value,
}

/// 登录挑战会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginChallenge {
    /// 会话 ID（256 位随机值）
    pub id: String,
    /// 用户 ID
    pub user_id: String,
    /// 用户邮箱
    pub email: String,
    /// 用户显示名
    pub name: String,
    /// 租户 ID
    pub tenant_id: Option<String>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 过期时间
    pub expires_at: DateTime<Utc>,
    /// 暂存的原始登录载荷
    pub original_payload: serde_json::Value,
}

impl LoginChallenge {
    /// 会话是否已过期
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// 挑战验证使用的验证码种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeCodeKind {
    /// 认证器生成的 TOTP 码
    Totp,
    /// 一次性备用码
    Backup,
}

/// 挑战验证结果
#[derive(Debug, Clone)]
pub struct ChallengeVerifyResult {
    /// 是否验证成功
    pub success: bool,
    /// 面向用户的消息
    pub message: String,
    /// 原始登录载荷（仅成功时）
    pub payload: Option<serde_json::Value>,
    /// 剩余备用码数量（仅使用备用码成功时）
    pub remaining_backup_codes: Option<usize>,
}

impl ChallengeVerifyResult {
    fn failed() -> Self {
        Self {
            success: false,
            message: "invalid code".to_string(),
            payload: None,
            remaining_backup_codes: None,
        }
    }
}

/// 登录挑战会话管理器
///
/// 自带独立的速率限制器：挑战侧的失败计数不影响方法管理侧，反之亦然。
pub struct LoginChallengeManager {
    config: ChallengeConfig,
    service: Arc<TwoFactorService>,
    sessions: Arc<RwLock<HashMap<String, LoginChallenge>>>,
    limiter: Arc<VerifyRateLimiter>,
}

impl LoginChallengeManager {
    /// 创建新的管理器
    pub fn new(config: ChallengeConfig, service: Arc<TwoFactorService>) -> Self {
        let limiter = Arc::new(VerifyRateLimiter::new(config.rate_limit.clone()));
        Self {
            config,
            service,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            limiter,
        }
    }

    /// 创建一个登录挑战会话
    pub fn create(&self, new_challenge: NewChallenge) -> Result<LoginChallenge> {
        let id = generate_challenge_token()?;
        let now = Utc::now();
        let ttl = TimeDelta::from_std(self.config.ttl).unwrap_or(TimeDelta::MAX);

        let challenge = LoginChallenge {
            id: id.clone(),
            user_id: new_challenge.user_id,
            email: new_challenge.email,
            name: new_challenge.name,
            tenant_id: new_challenge.tenant_id,
            created_at: now,
            expires_at: now + ttl,
            original_payload: new_challenge.original_payload,
        };

        let mut sessions = self.sessions.write().map_err(lock_poisoned)?;
        sessions.insert(id, challenge.clone());

        tracing::debug!(user_id = %challenge.user_id, "login challenge created");
        Ok(challenge)
    }

    /// 按 ID 获取会话
    ///
    /// 已过期的会话在读取时清除，返回 [`Error::InvalidOrExpired`]。
    pub fn get(&self, challenge_id: &str) -> Result<LoginChallenge> {
        let mut sessions = self.sessions.write().map_err(lock_poisoned)?;

        match sessions.get(challenge_id) {
            Some(challenge) if challenge.is_expired() => {
                sessions.remove(challenge_id);
                Err(Error::InvalidOrExpired)
            }
            Some(challenge) => Ok(challenge.clone()),
            None => Err(Error::InvalidOrExpired),
        }
    }

    /// 销毁一个会话（用户取消登录时）
    pub fn destroy(&self, challenge_id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().map_err(lock_poisoned)?;
        sessions.remove(challenge_id);
        Ok(())
    }

    /// 用验证码完成登录挑战
    ///
    /// 成功时销毁会话并返回暂存的登录载荷；失败时保留会话供重试，
    /// 失败计入挑战侧的速率限制。
    pub async fn verify_login_code(
        &self,
        challenge_id: &str,
        code: &str,
        kind: ChallengeCodeKind,
    ) -> Result<ChallengeVerifyResult> {
        let challenge = self.get(challenge_id)?;
        self.limiter.check(&challenge.user_id)?;

        let (success, remaining_backup_codes) = match kind {
            ChallengeCodeKind::Totp => {
                (self.service.verify_for_login(&challenge.user_id, code).await?, None)
            }
            ChallengeCodeKind::Backup => {
                let result = self.service.verify_backup_code(&challenge.user_id, code).await?;
                (result.is_valid, result.is_valid.then_some(result.remaining))
            }
        };

        if !success {
            self.limiter.record_failure(&challenge.user_id)?;
            tracing::info!(user_id = %challenge.user_id, "login challenge attempt failed");
            return Ok(ChallengeVerifyResult::failed());
        }

        self.limiter.clear(&challenge.user_id)?;
        self.destroy(challenge_id)?;
        tracing::info!(user_id = %challenge.user_id, "login challenge completed");

        Ok(ChallengeVerifyResult {
            success: true,
            message: "verification successful".to_string(),
            payload: Some(challenge.original_payload),
            remaining_backup_codes,
        })
    }

    /// 当前存活的会话数量
    pub fn count(&self) -> Result<usize> {
        let sessions = self.sessions.read().map_err(lock_poisoned)?;
        Ok(sessions.len())
    }

    /// 清除所有已过期的会话，返回清除数量
    pub fn cleanup(&self) -> Result<usize> {
        let mut sessions = self.sessions.write().map_err(lock_poisoned)?;
        let before = sessions.len();
        sessions.retain(|_, challenge| !challenge.is_expired());
        Ok(before - sessions.len())
    }

    /// 启动后台清扫任务
    ///
    /// 每 2 分钟清除一次过期会话，直到返回的句柄被 abort。
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.spawn_sweeper_with_interval(Duration::from_secs(120))
    }

    /// 按指定间隔启动后台清扫任务
    pub fn spawn_sweeper_with_interval(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match manager.cleanup() {
                    Ok(removed) if removed > 0 => {
                        tracing::debug!(removed, "expired login challenges swept");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "login challenge sweep failed"),
                }
            }
        })
    }
}

fn lock_poisoned<T>(_: T) -> Error {
    Error::Storage(StorageError::OperationFailed("lock poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::cipher::SecretCipher;
    use crate::service::TwoFactorConfig;
    use crate::store::InMemoryMethodStore;

    fn test_manager(config: ChallengeConfig) -> LoginChallengeManager {
        let cipher = Arc::new(SecretCipher::new(b"0123456789abcdef0123456789abcdef").unwrap());
        let store = Arc::new(InMemoryMethodStore::new(
            Arc::clone(&cipher),
            Arc::new(InMemoryAuditSink::new()),
        ));
        let service = Arc::new(
            TwoFactorService::builder(TwoFactorConfig::default())
                .with_store(store)
                .with_cipher(cipher)
                .build()
                .unwrap(),
        );
        LoginChallengeManager::new(config, service)
    }

    fn new_challenge(user_id: &str) -> NewChallenge {
        NewChallenge {
            user_id: user_id.to_string(),
            email: format!("{}@example.com", user_id),
            name: "Test User".to_string(),
            tenant_id: None,
            original_payload: serde_json::json!({"access_token": "tok"}),
        }
    }

    #[test]
    fn test_create_and_get() {
        let manager = test_manager(ChallengeConfig::default());

        let challenge = manager.create(new_challenge("user1")).unwrap();
        assert!(!challenge.id.is_empty());
        assert!(!challenge.is_expired());

        let fetched = manager.get(&challenge.id).unwrap();
        assert_eq!(fetched.user_id, "user1");
        assert_eq!(fetched.original_payload["access_token"], "tok");
    }

    #[test]
    fn test_get_unknown_session() {
        let manager = test_manager(ChallengeConfig::default());

        let result = manager.get("no-such-session");
        assert!(matches!(result, Err(Error::InvalidOrExpired)));
    }

    #[test]
    fn test_expired_session_evicted_on_read() {
        let manager = test_manager(ChallengeConfig::default().with_ttl(Duration::ZERO));

        let challenge = manager.create(new_challenge("user1")).unwrap();
        assert_eq!(manager.count().unwrap(), 1);

        let result = manager.get(&challenge.id);
        assert!(matches!(result, Err(Error::InvalidOrExpired)));
        assert_eq!(manager.count().unwrap(), 0);
    }

    #[test]
    fn test_destroy() {
        let manager = test_manager(ChallengeConfig::default());
        let challenge = manager.create(new_challenge("user1")).unwrap();

        manager.destroy(&challenge.id).unwrap();
        assert!(manager.get(&challenge.id).is_err());
    }

    #[test]
    fn test_cleanup() {
        let manager = test_manager(ChallengeConfig::default().with_ttl(Duration::ZERO));

        manager.create(new_challenge("user1")).unwrap();
        manager.create(new_challenge("user2")).unwrap();

        let removed = manager.cleanup().unwrap();
        assert_eq!(removed, 2);
        assert_eq!(manager.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_verify_without_enabled_method() {
        let manager = test_manager(ChallengeConfig::default());
        let challenge = manager.create(new_challenge("user1")).unwrap();

        let result = manager
            .verify_login_code(&challenge.id, "123456", ChallengeCodeKind::Totp)
            .await;
        assert!(matches!(result, Err(Error::SetupRequired)));
    }

    #[tokio::test]
    async fn test_verify_on_expired_session() {
        let manager = test_manager(ChallengeConfig::default().with_ttl(Duration::ZERO));
        let challenge = manager.create(new_challenge("user1")).unwrap();

        let result = manager
            .verify_login_code(&challenge.id, "123456", ChallengeCodeKind::Totp)
            .await;
        assert!(matches!(result, Err(Error::InvalidOrExpired)));
    }

    #[tokio::test]
    async fn test_sweeper_runs() {
        let manager = Arc::new(test_manager(ChallengeConfig::default().with_ttl(Duration::ZERO)));
        manager.create(new_challenge("user1")).unwrap();

        let handle = manager.spawn_sweeper_with_interval(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert_eq!(manager.count().unwrap(), 0);
    }
}
