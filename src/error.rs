//! 统一错误类型模块
//!
//! 提供 twofa 库中所有操作的错误类型定义。
//!
//! 业务规则违例（方法未注册、未完成设置、速率限制等）作为类型化错误返回给
//! 调用方；验证码错误不是错误，而是结果中的 `success = false`。基础设施
//! 故障（存储、加密配置）原样向上传播。

use std::fmt;

use chrono::{DateTime, Utc};

/// twofa 库的统一结果类型
pub type Result<T> = std::result::Result<T, Error>;

/// twofa 库的错误类型
#[derive(Debug)]
pub enum Error {
    /// 认证方法类型未注册或未实现
    MethodNotSupported(String),

    /// 用户尚未完成任何方法的设置
    SetupRequired,

    /// 所有权不匹配或状态异常
    InvalidSetupData(String),

    /// 方法已启用（需先禁用才能重新设置）
    AlreadyEnabled,

    /// 配置策略禁止此操作
    PolicyDenied(String),

    /// 验证尝试超出速率限制
    RateLimited {
        /// 剩余可用尝试次数
        remaining_attempts: u32,
        /// 锁定结束时间（如果已触发锁定）
        lockout_until: Option<DateTime<Utc>>,
    },

    /// 登录挑战会话无效或已过期
    InvalidOrExpired,

    /// 存储错误
    Storage(StorageError),

    /// 加密错误
    Crypto(CryptoError),

    /// 配置错误
    Config(ConfigError),

    /// 内部错误
    Internal(String),
}

impl Error {
    /// 创建一个内部错误
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// 创建一个所有权/状态错误
    pub fn invalid_setup(msg: impl Into<String>) -> Self {
        Error::InvalidSetupData(msg.into())
    }

    /// 创建一个速率限制错误
    pub fn rate_limited(remaining_attempts: u32, lockout_until: Option<DateTime<Utc>>) -> Self {
        Error::RateLimited {
            remaining_attempts,
            lockout_until,
        }
    }

    /// 是否是业务规则违例（应映射为 4xx 而非 5xx）
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            Error::MethodNotSupported(_)
                | Error::SetupRequired
                | Error::InvalidSetupData(_)
                | Error::AlreadyEnabled
                | Error::PolicyDenied(_)
                | Error::RateLimited { .. }
                | Error::InvalidOrExpired
        )
    }
}

/// 存储相关错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// 记录未找到
    NotFound(String),
    /// 记录已存在（唯一约束冲突）
    AlreadyExists(String),
    /// 操作失败
    OperationFailed(String),
}

/// 加密相关错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// 随机数生成失败
    RngFailed(String),
    /// 密钥无效
    InvalidKey(String),
    /// 加密失败
    EncryptionFailed(String),
}

/// 配置相关错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// 缺少必需的配置
    MissingRequired(String),
    /// 无效的配置值
    InvalidValue { key: String, message: String },
}

// ============================================================================
// Display 实现
// ============================================================================

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MethodNotSupported(method) => {
                write!(f, "method type '{}' is not supported", method)
            }
            Error::SetupRequired => write!(f, "two-factor setup required"),
            Error::InvalidSetupData(msg) => write!(f, "invalid setup data: {}", msg),
            Error::AlreadyEnabled => {
                write!(f, "method already enabled, disable it before re-running setup")
            }
            Error::PolicyDenied(msg) => write!(f, "denied by policy: {}", msg),
            Error::RateLimited { lockout_until, .. } => match lockout_until {
                Some(until) => write!(f, "too many attempts, locked out until {}", until),
                None => write!(f, "too many attempts"),
            },
            Error::InvalidOrExpired => write!(f, "invalid or expired session"),
            Error::Storage(e) => write!(f, "Storage error: {}", e),
            Error::Crypto(e) => write!(f, "Crypto error: {}", e),
            Error::Config(e) => write!(f, "Config error: {}", e),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(item) => write!(f, "not found: {}", item),
            StorageError::AlreadyExists(item) => write!(f, "already exists: {}", item),
            StorageError::OperationFailed(msg) => write!(f, "storage operation failed: {}", msg),
        }
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::RngFailed(msg) => write!(f, "random number generation failed: {}", msg),
            CryptoError::InvalidKey(msg) => write!(f, "invalid key: {}", msg),
            CryptoError::EncryptionFailed(msg) => write!(f, "encryption failed: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingRequired(key) => {
                write!(f, "missing required configuration: {}", key)
            }
            ConfigError::InvalidValue { key, message } => {
                write!(f, "invalid configuration value for '{}': {}", key, message)
            }
        }
    }
}

// ============================================================================
// std::error::Error 实现
// ============================================================================

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl std::error::Error for StorageError {}
impl std::error::Error for CryptoError {}
impl std::error::Error for ConfigError {}

// ============================================================================
// From 实现 - 方便错误转换
// ============================================================================

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        Error::Crypto(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::MethodNotSupported("webauthn".to_string());
        assert_eq!(err.to_string(), "method type 'webauthn' is not supported");
    }

    #[test]
    fn test_rate_limited_display() {
        let err = Error::rate_limited(0, None);
        assert_eq!(err.to_string(), "too many attempts");

        let err = Error::rate_limited(0, Some(Utc::now()));
        assert!(err.to_string().starts_with("too many attempts, locked out"));
    }

    #[test]
    fn test_error_from_storage() {
        let storage_err = StorageError::NotFound("method tfm_123".to_string());
        let err: Error = storage_err.into();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn test_is_business_rule() {
        assert!(Error::SetupRequired.is_business_rule());
        assert!(Error::AlreadyEnabled.is_business_rule());
        assert!(Error::rate_limited(0, None).is_business_rule());
        assert!(!Error::internal("boom").is_business_rule());
        assert!(
            !Error::Storage(StorageError::OperationFailed("lock poisoned".into()))
                .is_business_rule()
        );
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::AlreadyExists("method for user".to_string());
        assert_eq!(err.to_string(), "already exists: method for user");
    }
}
