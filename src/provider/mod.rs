//! 认证方法提供者模块
//!
//! 提供各种 2FA 方法的实现与分发。
//!
//! ## 支持的方法
//!
//! - **TOTP**: 基于时间的一次性密码（完整实现，Google Authenticator 兼容）
//! - **备用码**: 一次性恢复凭据（完整实现，独立于方法注册表）
//! - **SMS / Email / WebAuthn**: 数据模型中预留，未注册实现时
//!   分发失败并返回"不支持"
//!
//! ## 分发示例
//!
//! ```rust
//! use std::sync::Arc;
//! use twofa::provider::{MethodType, ProviderRegistry};
//! use twofa::provider::totp::{TotpConfig, TotpProvider};
//!
//! let mut registry = ProviderRegistry::new();
//! registry.register(Arc::new(TotpProvider::new(
//!     TotpConfig::default().with_issuer("MyApp"),
//! )));
//!
//! assert!(registry.is_supported(MethodType::Totp));
//! assert!(!registry.is_supported(MethodType::Sms));
//!
//! let provider = registry.get(MethodType::Totp).unwrap();
//! let payload = provider.setup("user123", Some("user@example.com")).unwrap();
//! assert!(!payload.secret.is_empty());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod backup;
pub mod totp;

/// 2FA 方法类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodType {
    /// 基于时间的一次性密码 (RFC 6238)
    Totp,
    /// 短信验证码
    Sms,
    /// 邮件验证码
    Email,
    /// WebAuthn 凭据
    WebAuthn,
}

impl MethodType {
    /// 获取类型名称
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodType::Totp => "totp",
            MethodType::Sms => "sms",
            MethodType::Email => "email",
            MethodType::WebAuthn => "webauthn",
        }
    }
}

impl std::fmt::Display for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MethodType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "totp" => Ok(MethodType::Totp),
            "sms" => Ok(MethodType::Sms),
            "email" => Ok(MethodType::Email),
            "webauthn" => Ok(MethodType::WebAuthn),
            other => Err(Error::MethodNotSupported(other.to_string())),
        }
    }
}

/// 方法设置载荷
///
/// `secret` 为明文，仅在设置时返回一次；持久化由调用方（方法存储）负责。
#[derive(Debug, Clone)]
pub struct SetupPayload {
    /// 原始密钥（base32 等，供手动输入和持久化）
    pub secret: String,
    /// otpauth:// URI（如适用）
    pub otpauth_uri: Option<String>,
    /// QR 码 SVG 图像载荷（如适用）
    pub qr_svg: Option<String>,
    /// 给用户的操作说明
    pub instructions: String,
}

/// 验证结果
///
/// 验证码错误是业务结果而非错误；消息始终是通用的"invalid code"，
/// 不泄露具体失败原因。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// 是否验证成功
    pub success: bool,
    /// 面向用户的消息
    pub message: String,
}

impl VerifyOutcome {
    /// 验证成功
    pub fn ok() -> Self {
        Self {
            success: true,
            message: "verification successful".to_string(),
        }
    }

    /// 验证失败（通用消息，不泄露原因）
    pub fn invalid_code() -> Self {
        Self {
            success: false,
            message: "invalid code".to_string(),
        }
    }
}

/// 认证方法提供者 trait
///
/// 每种方法类型实现一个提供者，注册到 [`ProviderRegistry`] 中按类型分发。
/// 提供者是纯计算组件：不访问存储，不做速率限制。
pub trait MethodProvider: Send + Sync {
    /// 此提供者处理的方法类型
    fn method_type(&self) -> MethodType;

    /// 生成注册材料（密钥、QR 载荷、说明）
    fn setup(&self, user_id: &str, email: Option<&str>) -> Result<SetupPayload>;

    /// 验证一个验证码
    fn verify(&self, code: &str, secret: &str) -> Result<VerifyOutcome>;
}

/// 方法提供者注册表
///
/// 从方法类型到提供者实例的分发表。在进程启动时填充，
/// 请求处理期间只读，因此并发读取无需加锁。
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<MethodType, Arc<dyn MethodProvider>>,
}

impl ProviderRegistry {
    /// 创建空的注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个提供者
    ///
    /// 同类型重复注册时后者覆盖前者。
    pub fn register(&mut self, provider: Arc<dyn MethodProvider>) {
        self.providers.insert(provider.method_type(), provider);
    }

    /// 获取指定类型的提供者
    pub fn get(&self, method_type: MethodType) -> Result<Arc<dyn MethodProvider>> {
        self.providers
            .get(&method_type)
            .cloned()
            .ok_or_else(|| Error::MethodNotSupported(method_type.to_string()))
    }

    /// 是否支持指定类型
    pub fn is_supported(&self, method_type: MethodType) -> bool {
        self.providers.contains_key(&method_type)
    }

    /// 列出所有已注册的类型
    pub fn list_supported(&self) -> Vec<MethodType> {
        let mut types: Vec<_> = self.providers.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

#[cfg(test)]
mod tests {
    use super::totp::{TotpConfig, TotpProvider};
    use super::*;

    #[test]
    fn test_method_type_roundtrip() {
        for t in [
            MethodType::Totp,
            MethodType::Sms,
            MethodType::Email,
            MethodType::WebAuthn,
        ] {
            let parsed: MethodType = t.as_str().parse().unwrap();
            assert_eq!(parsed, t);
        }
    }

    #[test]
    fn test_method_type_parse_unknown() {
        let result: Result<MethodType> = "carrier-pigeon".parse();
        assert!(matches!(result, Err(Error::MethodNotSupported(_))));
    }

    #[test]
    fn test_method_type_serde() {
        let json = serde_json::to_string(&MethodType::Totp).unwrap();
        assert_eq!(json, "\"totp\"");

        let back: MethodType = serde_json::from_str("\"webauthn\"").unwrap();
        assert_eq!(back, MethodType::WebAuthn);
    }

    #[test]
    fn test_registry_dispatch() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(TotpProvider::new(TotpConfig::default())));

        assert!(registry.is_supported(MethodType::Totp));
        assert!(registry.get(MethodType::Totp).is_ok());
    }

    #[test]
    fn test_registry_unsupported_type() {
        let registry = ProviderRegistry::new();

        let result = registry.get(MethodType::Sms);
        assert!(matches!(result, Err(Error::MethodNotSupported(_))));
        assert!(!registry.is_supported(MethodType::Sms));
    }

    #[test]
    fn test_registry_list_supported() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.list_supported().is_empty());

        registry.register(Arc::new(TotpProvider::new(TotpConfig::default())));
        assert_eq!(registry.list_supported(), vec![MethodType::Totp]);
    }

    #[test]
    fn test_verify_outcome_messages() {
        assert!(VerifyOutcome::ok().success);
        let invalid = VerifyOutcome::invalid_code();
        assert!(!invalid.success);
        assert_eq!(invalid.message, "invalid code");
    }
}
