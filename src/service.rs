//! 2FA 编排服务模块
//!
//! 将提供者、方法存储、备用码和速率限制组合为完整的账户 2FA 生命周期：
//! 设置、确认启用、验证、禁用和状态查询。
//!
//! ## 生命周期
//!
//! 1. `setup` 生成注册材料，方法以未启用状态落库
//! 2. 用户在认证器中录入密钥后调用 `verify` 确认
//! 3. `enable` 启用方法；用户的第一个方法自动成为主方法，
//!    并附带一批新生成的备用码
//! 4. 之后的登录验证走 `verify`（受速率限制）或备用码
//!
//! ## 示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use twofa::audit::InMemoryAuditSink;
//! use twofa::cipher::SecretCipher;
//! use twofa::provider::MethodType;
//! use twofa::service::{SetupRequest, TwoFactorConfig, TwoFactorService};
//! use twofa::store::InMemoryMethodStore;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let cipher = Arc::new(SecretCipher::new(b"0123456789abcdef0123456789abcdef").unwrap());
//! let store = Arc::new(InMemoryMethodStore::new(cipher.clone(), Arc::new(InMemoryAuditSink::new())));
//! let service = TwoFactorService::builder(TwoFactorConfig::default().with_issuer("MyApp"))
//!     .with_store(store)
//!     .with_cipher(cipher)
//!     .build()
//!     .unwrap();
//!
//! let setup = service
//!     .setup(SetupRequest {
//!         user_id: "user123".to_string(),
//!         method_type: MethodType::Totp,
//!         email: Some("user@example.com".to_string()),
//!         name: None,
//!     })
//!     .await
//!     .unwrap();
//! println!("scan this: {}", setup.otpauth_uri.unwrap());
//! # });
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cipher::SecretCipher;
use crate::error::{ConfigError, Error, Result};
use crate::limiter::{RateLimitConfig, VerifyRateLimiter};
use crate::provider::backup::{
    BackupCodeSet, BackupCodeStore, BackupCodesConfig, BackupCodesProvider, BackupVerifyResult,
    InMemoryBackupCodeStore,
};
use crate::provider::totp::{TotpConfig, TotpProvider};
use crate::provider::{MethodProvider, MethodType, ProviderRegistry};
use crate::store::{MethodStore, NewMethod, TwoFactorMethod};

/// 掩码后的 TOTP 密钥占位符
const MASKED_SECRET: &str = "********";

/// 2FA 服务配置
#[derive(Debug, Clone)]
pub struct TwoFactorConfig {
    /// 签发者名称（显示在认证器应用中）
    pub issuer: String,
    /// 是否允许用户自行禁用已启用的方法
    pub allow_disable: bool,
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self {
            issuer: "twofa".to_string(),
            allow_disable: true,
        }
    }
}

impl TwoFactorConfig {
    /// 创建新的配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置签发者名称
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// 设置是否允许禁用
    pub fn with_allow_disable(mut self, allow: bool) -> Self {
        self.allow_disable = allow;
        self
    }
}

/// 方法设置请求
#[derive(Debug, Clone, Deserialize)]
pub struct SetupRequest {
    /// 用户 ID
    pub user_id: String,
    /// 要设置的方法类型
    pub method_type: MethodType,
    /// 用户邮箱（用于 otpauth 标签）
    pub email: Option<String>,
    /// 显示标签（省略时按类型取默认值）
    pub name: Option<String>,
}

/// 方法设置响应
#[derive(Debug, Clone, Serialize)]
pub struct SetupResponse {
    /// 方法 ID
    pub method_id: String,
    /// 方法类型
    pub method_type: MethodType,
    /// 明文密钥（仅在此返回一次）
    pub secret: String,
    /// otpauth:// URI（如适用）
    pub otpauth_uri: Option<String>,
    /// QR 码 SVG 载荷（如适用）
    pub qr_svg: Option<String>,
    /// 给用户的操作说明
    pub instructions: String,
}

/// 验证请求
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyRequest {
    /// 用户 ID
    pub user_id: String,
    /// 用户输入的验证码
    pub code: String,
    /// 指定方法 ID（优先于 `method_type`）
    pub method_id: Option<String>,
    /// 指定方法类型（省略时默认 TOTP）
    pub method_type: Option<MethodType>,
}

/// 验证响应
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResponse {
    /// 是否验证成功
    pub success: bool,
    /// 面向用户的消息
    pub message: String,
    /// 剩余可用尝试次数（仅失败时）
    pub remaining_attempts: Option<u32>,
    /// 锁定结束时间（如果本次失败触发了锁定）
    pub lockout_until: Option<DateTime<Utc>>,
}

/// 启用响应
#[derive(Debug, Clone)]
pub struct EnableResponse {
    /// 启用后的方法记录
    pub method: TwoFactorMethod,
    /// 新生成的备用码（仅在用户首次启用方法时）
    pub backup_codes: Option<Vec<String>>,
}

/// 状态报告中的方法摘要
///
/// 密钥已脱敏，可安全返回给前端。
#[derive(Debug, Clone, Serialize)]
pub struct MethodSummary {
    /// 方法 ID
    pub id: String,
    /// 方法类型
    pub method_type: MethodType,
    /// 显示标签
    pub name: String,
    /// 脱敏后的密钥
    pub masked_secret: String,
    /// 是否已启用
    pub is_enabled: bool,
    /// 是否为主方法
    pub is_primary: bool,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最后成功验证时间
    pub last_used_at: Option<DateTime<Utc>>,
}

/// 用户 2FA 状态报告
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// 用户的全部方法
    pub methods: Vec<MethodSummary>,
    /// 是否有任何已启用的方法
    pub has_any_enabled: bool,
    /// 剩余备用码数量
    pub backup_codes_remaining: usize,
}

/// 2FA 服务构建器
pub struct TwoFactorServiceBuilder {
    config: TwoFactorConfig,
    totp_config: TotpConfig,
    backup_config: BackupCodesConfig,
    rate_limit_config: RateLimitConfig,
    cipher: Option<Arc<SecretCipher>>,
    store: Option<Arc<dyn MethodStore>>,
    backup_store: Option<Arc<dyn BackupCodeStore>>,
    extra_providers: Vec<Arc<dyn MethodProvider>>,
}

impl TwoFactorServiceBuilder {
    /// 设置密钥加密器（必需）
    pub fn with_cipher(mut self, cipher: Arc<SecretCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    /// 设置方法存储（必需）
    pub fn with_store(mut self, store: Arc<dyn MethodStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 设置备用码存储（默认为内存实现）
    pub fn with_backup_store(mut self, store: Arc<dyn BackupCodeStore>) -> Self {
        self.backup_store = Some(store);
        self
    }

    /// 覆盖 TOTP 配置
    pub fn with_totp_config(mut self, config: TotpConfig) -> Self {
        self.totp_config = config;
        self
    }

    /// 覆盖备用码配置
    pub fn with_backup_config(mut self, config: BackupCodesConfig) -> Self {
        self.backup_config = config;
        self
    }

    /// 覆盖速率限制配置
    pub fn with_rate_limit_config(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit_config = config;
        self
    }

    /// 注册额外的方法提供者（SMS、Email 等）
    pub fn with_provider(mut self, provider: Arc<dyn MethodProvider>) -> Self {
        self.extra_providers.push(provider);
        self
    }

    /// 构建服务
    pub fn build(self) -> Result<TwoFactorService> {
        let cipher = self.cipher.ok_or(Error::Config(ConfigError::MissingRequired(
            "cipher".to_string(),
        )))?;
        let store = self.store.ok_or(Error::Config(ConfigError::MissingRequired(
            "method store".to_string(),
        )))?;
        let backup_store = self
            .backup_store
            .unwrap_or_else(|| Arc::new(InMemoryBackupCodeStore::new()));

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(TotpProvider::new(
            self.totp_config.with_issuer(self.config.issuer.clone()),
        )));
        for provider in self.extra_providers {
            registry.register(provider);
        }

        let backup = BackupCodesProvider::new(self.backup_config, cipher, backup_store);

        Ok(TwoFactorService {
            config: self.config,
            store,
            registry,
            backup,
            limiter: Arc::new(VerifyRateLimiter::new(self.rate_limit_config)),
        })
    }
}

/// 2FA 编排服务
pub struct TwoFactorService {
    config: TwoFactorConfig,
    store: Arc<dyn MethodStore>,
    registry: ProviderRegistry,
    backup: BackupCodesProvider,
    limiter: Arc<VerifyRateLimiter>,
}

impl TwoFactorService {
    /// 创建服务构建器
    pub fn builder(config: TwoFactorConfig) -> TwoFactorServiceBuilder {
        TwoFactorServiceBuilder {
            config,
            totp_config: TotpConfig::default(),
            backup_config: BackupCodesConfig::default(),
            rate_limit_config: RateLimitConfig::default(),
            cipher: None,
            store: None,
            backup_store: None,
            extra_providers: Vec::new(),
        }
    }

    /// 设置一个 2FA 方法
    ///
    /// 幂等：同类型已有未启用记录时轮换其密钥并返回同一个方法 ID；
    /// 已启用的方法必须先禁用，返回 [`Error::AlreadyEnabled`]。
    pub async fn setup(&self, request: SetupRequest) -> Result<SetupResponse> {
        let provider = self.registry.get(request.method_type)?;
        let payload = provider.setup(&request.user_id, request.email.as_deref())?;

        let method = match self
            .store
            .find_by_user_and_type(&request.user_id, request.method_type)
            .await?
        {
            Some(existing) if existing.is_enabled => return Err(Error::AlreadyEnabled),
            Some(existing) => {
                // 重复设置轮换密钥，保持方法 ID 稳定
                self.store.update_secret(&existing.id, &payload.secret).await?
            }
            None => {
                let name = request
                    .name
                    .clone()
                    .unwrap_or_else(|| default_method_name(request.method_type).to_string());
                self.store
                    .create(NewMethod {
                        user_id: request.user_id.clone(),
                        method_type: request.method_type,
                        secret: payload.secret.clone(),
                        name,
                        is_primary: false,
                    })
                    .await?
            }
        };

        tracing::info!(
            user_id = %request.user_id,
            method_id = %method.id,
            method_type = %request.method_type,
            "two-factor setup issued"
        );

        Ok(SetupResponse {
            method_id: method.id,
            method_type: request.method_type,
            secret: payload.secret,
            otpauth_uri: payload.otpauth_uri,
            qr_svg: payload.qr_svg,
            instructions: payload.instructions,
        })
    }

    /// 验证一个验证码（受速率限制）
    ///
    /// 锁定中的用户直接返回 [`Error::RateLimited`]，不执行验证。
    /// 码错误返回 `success = false` 并累计失败次数；成功清除失败记录。
    pub async fn verify(&self, request: VerifyRequest) -> Result<VerifyResponse> {
        self.limiter.check(&request.user_id)?;

        let method = self.resolve_method(&request).await?;
        let provider = self.registry.get(method.method_type)?;
        let outcome = provider.verify(&request.code, &method.secret)?;

        if outcome.success {
            self.limiter.clear(&request.user_id)?;
            self.store.touch_last_used(&method.id).await?;
            return Ok(VerifyResponse {
                success: true,
                message: outcome.message,
                remaining_attempts: None,
                lockout_until: None,
            });
        }

        let status = self.limiter.record_failure(&request.user_id)?;
        tracing::info!(
            user_id = %request.user_id,
            method_id = %method.id,
            remaining = status.remaining_attempts,
            "verification failed"
        );

        Ok(VerifyResponse {
            success: false,
            message: outcome.message,
            remaining_attempts: Some(status.remaining_attempts),
            lockout_until: status.lockout_until,
        })
    }

    /// 为登录挑战验证验证码（不计入速率限制）
    ///
    /// 登录挑战管理器自带独立的限制器，此路径不触碰方法管理侧的计数。
    pub async fn verify_for_login(&self, user_id: &str, code: &str) -> Result<bool> {
        let Some(method) = self
            .store
            .find_by_user_and_type(user_id, MethodType::Totp)
            .await?
            .filter(|m| m.is_enabled)
        else {
            return Err(Error::SetupRequired);
        };

        let provider = self.registry.get(method.method_type)?;
        let outcome = provider.verify(code, &method.secret)?;
        if outcome.success {
            self.store.touch_last_used(&method.id).await?;
        }
        Ok(outcome.success)
    }

    /// 启用一个已完成验证的方法
    ///
    /// 用户首次启用方法时自动成为主方法，并附带一批新备用码。
    pub async fn enable(&self, user_id: &str, method_id: &str) -> Result<EnableResponse> {
        let method = self.owned_method(user_id, method_id).await?;
        if method.is_enabled {
            return Err(Error::AlreadyEnabled);
        }

        // 首个启用的方法成为主方法
        let first_enablement = !self.store.has_any_enabled(user_id).await?;
        let method = self.store.enable(method_id, first_enablement).await?;

        let backup_codes = if first_enablement {
            Some(self.backup.generate(user_id).await?.codes)
        } else {
            None
        };

        tracing::info!(
            user_id,
            method_id,
            is_primary = method.is_primary,
            "two-factor method enabled"
        );

        Ok(EnableResponse {
            method,
            backup_codes,
        })
    }

    /// 禁用一个方法
    ///
    /// 配置禁止自助禁用时返回 [`Error::PolicyDenied`]。用户最后一个
    /// 启用的方法被禁用后，备用码随之全部失效。
    pub async fn disable(&self, user_id: &str, method_id: &str) -> Result<TwoFactorMethod> {
        if !self.config.allow_disable {
            return Err(Error::PolicyDenied(
                "two-factor methods cannot be disabled".to_string(),
            ));
        }

        self.owned_method(user_id, method_id).await?;
        let method = self.store.disable(method_id).await?;

        if !self.store.has_any_enabled(user_id).await? {
            self.backup.invalidate_all(user_id).await?;
            self.limiter.clear(user_id)?;
        }

        tracing::info!(user_id, method_id, "two-factor method disabled");
        Ok(method)
    }

    /// 删除一个方法记录
    ///
    /// 与禁用遵循相同的策略开关。
    pub async fn remove(&self, user_id: &str, method_id: &str) -> Result<()> {
        if !self.config.allow_disable {
            return Err(Error::PolicyDenied(
                "two-factor methods cannot be removed".to_string(),
            ));
        }

        self.owned_method(user_id, method_id).await?;
        self.store.delete(method_id).await?;

        if !self.store.has_any_enabled(user_id).await? {
            self.backup.invalidate_all(user_id).await?;
        }

        tracing::info!(user_id, method_id, "two-factor method removed");
        Ok(())
    }

    /// 查询用户的 2FA 状态
    ///
    /// 只列出已启用的方法，摘要中密钥已脱敏。
    pub async fn status(&self, user_id: &str) -> Result<StatusReport> {
        let methods = self.store.find_all_for_user(user_id, true).await?;
        let has_any_enabled = !methods.is_empty();
        let backup_codes_remaining = self.backup.remaining(user_id).await?;

        let methods = methods
            .into_iter()
            .map(|m| MethodSummary {
                id: m.id,
                masked_secret: mask_secret(m.method_type, &m.secret),
                name: m.name,
                method_type: m.method_type,
                is_enabled: m.is_enabled,
                is_primary: m.is_primary,
                created_at: m.created_at,
                last_used_at: m.last_used_at,
            })
            .collect();

        Ok(StatusReport {
            methods,
            has_any_enabled,
            backup_codes_remaining,
        })
    }

    /// 重新生成用户的备用码（旧码全部失效）
    ///
    /// 要求用户至少有一个已启用的方法。
    pub async fn regenerate_backup_codes(&self, user_id: &str) -> Result<BackupCodeSet> {
        if !self.store.has_any_enabled(user_id).await? {
            return Err(Error::SetupRequired);
        }
        self.backup.generate(user_id).await
    }

    /// 验证并消费一个备用码（不计入速率限制）
    pub async fn verify_backup_code(&self, user_id: &str, code: &str) -> Result<BackupVerifyResult> {
        self.backup.verify(user_id, code).await
    }

    /// 用户剩余的备用码数量
    pub async fn backup_codes_remaining(&self, user_id: &str) -> Result<usize> {
        self.backup.remaining(user_id).await
    }

    /// 用户是否有任何已启用的方法
    pub async fn has_two_factor(&self, user_id: &str) -> Result<bool> {
        self.store.has_any_enabled(user_id).await
    }

    /// 方法管理侧的速率限制器
    pub fn limiter(&self) -> &Arc<VerifyRateLimiter> {
        &self.limiter
    }

    // ========================================================================
    // 内部方法
    // ========================================================================

    /// 解析验证请求指向的方法
    ///
    /// 显式 `method_id` 优先；否则按 `method_type` 查找，省略时默认 TOTP。
    async fn resolve_method(&self, request: &VerifyRequest) -> Result<TwoFactorMethod> {
        match &request.method_id {
            Some(method_id) => self.owned_method(&request.user_id, method_id).await,
            None => {
                let method_type = request.method_type.unwrap_or(MethodType::Totp);
                self.store
                    .find_by_user_and_type(&request.user_id, method_type)
                    .await?
                    .ok_or(Error::SetupRequired)
            }
        }
    }

    /// 查找方法并校验所有权
    async fn owned_method(&self, user_id: &str, method_id: &str) -> Result<TwoFactorMethod> {
        let method = self
            .store
            .find_by_id(method_id)
            .await?
            .ok_or_else(|| Error::invalid_setup(format!("unknown method {}", method_id)))?;

        if method.user_id != user_id {
            return Err(Error::invalid_setup(format!(
                "method {} does not belong to user",
                method_id
            )));
        }

        Ok(method)
    }
}

/// 按方法类型取默认显示标签
fn default_method_name(method_type: MethodType) -> &'static str {
    match method_type {
        MethodType::Totp => "Authenticator app",
        MethodType::Sms => "Phone",
        MethodType::Email => "Email",
        MethodType::WebAuthn => "Security key",
    }
}

/// 脱敏存储的密钥
///
/// TOTP 密钥完全隐藏；SMS/Email 目标保留尾部便于用户辨认。
fn mask_secret(method_type: MethodType, secret: &str) -> String {
    match method_type {
        MethodType::Totp | MethodType::WebAuthn => MASKED_SECRET.to_string(),
        MethodType::Sms | MethodType::Email => {
            let chars: Vec<char> = secret.chars().collect();
            if chars.len() <= 4 {
                return MASKED_SECRET.to_string();
            }
            let visible: String = chars[chars.len() - 4..].iter().collect();
            format!("{}{}", "*".repeat(4), visible)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret_totp() {
        assert_eq!(mask_secret(MethodType::Totp, "JBSWY3DPEHPK3PXP"), "********");
    }

    #[test]
    fn test_mask_secret_phone_keeps_tail() {
        assert_eq!(mask_secret(MethodType::Sms, "+15551234567"), "****4567");
    }

    #[test]
    fn test_mask_secret_short_value_fully_hidden() {
        assert_eq!(mask_secret(MethodType::Email, "a@b"), "********");
    }

    #[test]
    fn test_config_builder() {
        let config = TwoFactorConfig::new()
            .with_issuer("MyApp")
            .with_allow_disable(false);

        assert_eq!(config.issuer, "MyApp");
        assert!(!config.allow_disable);
    }

    #[test]
    fn test_builder_requires_cipher_and_store() {
        let result = TwoFactorService::builder(TwoFactorConfig::default()).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
