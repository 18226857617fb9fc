//! # twofa
//!
//! 账户双因素认证 (2FA) 子系统。
//!
//! ## 功能特性
//!
//! - **TOTP**: RFC 6238 基于时间的一次性密码，兼容 Google Authenticator
//! - **备用码**: 一次性恢复凭据，加密存储，原子消费
//! - **方法注册表**: 可插拔的方法提供者，按类型分发
//! - **密钥加密**: AES-256-CBC 静态加密，宽容读取遗留明文
//! - **速率限制**: 每用户失败计数窗口与锁定
//! - **登录挑战**: 密码通过后暂存登录载荷，2FA 完成后换回
//! - **审计日志**: 每次方法状态迁移的仅追加记录
//!
//! ## 设置与验证示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use twofa::audit::InMemoryAuditSink;
//! use twofa::cipher::SecretCipher;
//! use twofa::provider::MethodType;
//! use twofa::service::{SetupRequest, TwoFactorConfig, TwoFactorService, VerifyRequest};
//! use twofa::store::InMemoryMethodStore;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let cipher = Arc::new(SecretCipher::new(b"0123456789abcdef0123456789abcdef").unwrap());
//! let store = Arc::new(InMemoryMethodStore::new(
//!     Arc::clone(&cipher),
//!     Arc::new(InMemoryAuditSink::new()),
//! ));
//!
//! let service = TwoFactorService::builder(TwoFactorConfig::default().with_issuer("MyApp"))
//!     .with_cipher(cipher)
//!     .with_store(store)
//!     .build()
//!     .unwrap();
//!
//! // 1. 生成注册材料
//! let setup = service
//!     .setup(SetupRequest {
//!         user_id: "user123".to_string(),
//!         method_type: MethodType::Totp,
//!         email: Some("user@example.com".to_string()),
//!         name: None,
//!     })
//!     .await
//!     .unwrap();
//!
//! // 2. 用户录入密钥后提交验证码确认
//! let outcome = service
//!     .verify(VerifyRequest {
//!         user_id: "user123".to_string(),
//!         code: "123456".to_string(),
//!         method_id: Some(setup.method_id.clone()),
//!         method_type: None,
//!     })
//!     .await
//!     .unwrap();
//!
//! // 3. 启用方法（首个方法成为主方法，附带备用码）
//! if outcome.success {
//!     let enabled = service.enable("user123", &setup.method_id).await.unwrap();
//!     if let Some(codes) = enabled.backup_codes {
//!         println!("save these: {:?}", codes);
//!     }
//! }
//! # });
//! ```

pub mod audit;
pub mod challenge;
pub mod cipher;
pub mod error;
pub mod limiter;
pub mod provider;
pub mod random;
pub mod service;
pub mod store;

pub use error::{ConfigError, CryptoError, Error, Result, StorageError};

// ============================================================================
// 随机数生成函数导出
// ============================================================================

pub use random::{
    constant_time_compare, constant_time_compare_str, generate_backup_codes,
    generate_challenge_token, generate_random_base64_url, generate_random_bytes,
    generate_random_hex,
};

// ============================================================================
// 提供者相关导出
// ============================================================================

pub use provider::backup::{
    BackupCodeSet, BackupCodeStore, BackupCodesConfig, BackupCodesProvider, BackupVerifyResult,
    InMemoryBackupCodeStore,
};
pub use provider::totp::{TotpConfig, TotpProvider, TotpSecret};
pub use provider::{MethodProvider, MethodType, ProviderRegistry, SetupPayload, VerifyOutcome};

// ============================================================================
// 存储与审计相关导出
// ============================================================================

pub use audit::{AuditAction, AuditEntry, AuditSink, InMemoryAuditSink, NoOpAuditSink};
pub use cipher::{DecodeResult, SecretCipher};
pub use store::{InMemoryMethodStore, MethodStore, NewMethod, TwoFactorMethod};

// ============================================================================
// 服务与会话相关导出
// ============================================================================

pub use challenge::{
    ChallengeCodeKind, ChallengeConfig, ChallengeVerifyResult, LoginChallenge,
    LoginChallengeManager, NewChallenge,
};
pub use limiter::{RateLimitConfig, RateLimitStatus, VerifyRateLimiter};
pub use service::{
    EnableResponse, MethodSummary, SetupRequest, SetupResponse, StatusReport, TwoFactorConfig,
    TwoFactorService, VerifyRequest, VerifyResponse,
};
