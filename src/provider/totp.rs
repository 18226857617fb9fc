//! TOTP (基于时间的一次性密码) 提供者
//!
//! 符合 RFC 6238，兼容 Google Authenticator、Authy 等认证器应用。
//!
//! ## 特性
//!
//! - HMAC-SHA1 + 动态截断，6 位码，30 秒时间步
//! - 验证时允许前后各一个时间步的时钟偏差
//! - 生成 otpauth:// URI 和 QR 码 SVG 载荷
//!
//! ## 示例
//!
//! ```rust
//! use twofa::provider::MethodProvider;
//! use twofa::provider::totp::{TotpConfig, TotpProvider, TotpSecret};
//!
//! let provider = TotpProvider::new(TotpConfig::default().with_issuer("MyApp"));
//!
//! let payload = provider.setup("user123", Some("user@example.com")).unwrap();
//! assert!(payload.otpauth_uri.as_deref().unwrap().starts_with("otpauth://totp/"));
//!
//! // 模拟认证器：从 base32 密钥生成当前码
//! let secret = TotpSecret::from_base32(&payload.secret).unwrap();
//! let code = provider.generate_code(&secret).unwrap();
//!
//! let outcome = provider.verify(&code, &payload.secret).unwrap();
//! assert!(outcome.success);
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use base32::{Alphabet, decode as base32_decode, encode as base32_encode};
use hmac::{Hmac, Mac};
use qrcode::QrCode;
use qrcode::render::svg;
use sha1::Sha1;

use crate::error::{CryptoError, Error, Result};
use crate::provider::{MethodProvider, MethodType, SetupPayload, VerifyOutcome};
use crate::random::{constant_time_compare, generate_random_bytes};

/// TOTP 配置
#[derive(Debug, Clone)]
pub struct TotpConfig {
    /// 时间步长（秒），默认 30 秒
    pub time_step: u64,

    /// 验证码位数，默认 6 位
    pub digits: u32,

    /// 允许的时间偏差窗口（前后各多少个时间步）
    /// 默认为 1，即允许前后各 30 秒的误差
    pub skew: u64,

    /// 密钥长度（字节），默认 20 字节（160 位）
    pub secret_length: usize,

    /// 签发者名称（显示在认证器应用中）
    pub issuer: Option<String>,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            time_step: 30,
            digits: 6,
            skew: 1,
            secret_length: 20,
            issuer: None,
        }
    }
}

impl TotpConfig {
    /// 创建新的配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置时间步长
    pub fn with_time_step(mut self, seconds: u64) -> Self {
        self.time_step = seconds;
        self
    }

    /// 设置验证码位数
    pub fn with_digits(mut self, digits: u32) -> Self {
        assert!((6..=8).contains(&digits), "digits must be between 6 and 8");
        self.digits = digits;
        self
    }

    /// 设置时间偏差窗口
    pub fn with_skew(mut self, skew: u64) -> Self {
        self.skew = skew;
        self
    }

    /// 设置签发者
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// 设置密钥长度
    pub fn with_secret_length(mut self, length: usize) -> Self {
        assert!(length >= 16, "secret length must be at least 16 bytes");
        self.secret_length = length;
        self
    }
}

/// TOTP 密钥信息
#[derive(Debug, Clone)]
pub struct TotpSecret {
    /// 原始密钥字节
    pub raw: Vec<u8>,

    /// Base32 编码的密钥（用于显示和 URI）
    pub base32: String,
}

impl TotpSecret {
    /// 从原始字节创建
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let base32 = base32_encode(Alphabet::Rfc4648 { padding: false }, &bytes);
        Self { raw: bytes, base32 }
    }

    /// 从 Base32 字符串创建
    pub fn from_base32(base32: &str) -> Result<Self> {
        let clean = base32.replace([' ', '-'], "").to_uppercase();
        let raw = base32_decode(Alphabet::Rfc4648 { padding: false }, &clean).ok_or_else(|| {
            Error::Crypto(CryptoError::InvalidKey("invalid base32 secret".to_string()))
        })?;
        Ok(Self { raw, base32: clean })
    }
}

/// TOTP 提供者
#[derive(Debug, Clone)]
pub struct TotpProvider {
    config: TotpConfig,
}

impl TotpProvider {
    /// 创建新的 TOTP 提供者
    pub fn new(config: TotpConfig) -> Self {
        Self { config }
    }

    /// 使用默认配置创建提供者
    pub fn default_provider() -> Self {
        Self::new(TotpConfig::default())
    }

    /// 生成新的 TOTP 密钥
    pub fn generate_secret(&self) -> Result<TotpSecret> {
        let bytes = generate_random_bytes(self.config.secret_length)?;
        Ok(TotpSecret::from_bytes(bytes))
    }

    /// 生成当前的 TOTP 验证码
    pub fn generate_code(&self, secret: &TotpSecret) -> Result<String> {
        self.generate_code_at(secret, current_timestamp())
    }

    /// 生成指定时间的 TOTP 验证码
    pub fn generate_code_at(&self, secret: &TotpSecret, timestamp: u64) -> Result<String> {
        let counter = timestamp / self.config.time_step;
        self.generate_hotp(&secret.raw, counter)
    }

    /// 生成 otpauth:// URI
    ///
    /// 此 URI 可用于生成二维码，供认证器应用扫描。配置了签发者时
    /// 标签为 `Issuer:account` 并附带 issuer 参数。
    pub fn generate_uri(&self, secret: &TotpSecret, account: &str) -> String {
        let label = match &self.config.issuer {
            Some(issuer) => format!("{}:{}", issuer, account),
            None => account.to_string(),
        };

        let mut uri = format!(
            "otpauth://totp/{}?secret={}&digits={}&period={}&algorithm=SHA1",
            urlencoding::encode(&label),
            secret.base32,
            self.config.digits,
            self.config.time_step,
        );

        if let Some(ref issuer) = self.config.issuer {
            uri.push_str(&format!("&issuer={}", urlencoding::encode(issuer)));
        }

        uri
    }

    /// 将 otpauth URI 渲染为 QR 码 SVG
    pub fn render_qr_svg(&self, uri: &str) -> Result<String> {
        let code = QrCode::new(uri.as_bytes())
            .map_err(|e| Error::internal(format!("QR code generation failed: {}", e)))?;

        Ok(code
            .render::<svg::Color>()
            .min_dimensions(200, 200)
            .build())
    }

    /// 获取当前验证码的剩余有效时间（秒）
    pub fn time_remaining(&self) -> u64 {
        self.config.time_step - (current_timestamp() % self.config.time_step)
    }

    /// 获取配置
    pub fn config(&self) -> &TotpConfig {
        &self.config
    }

    // ========================================================================
    // 内部方法
    // ========================================================================

    /// 在允许的时间窗口内验证验证码
    fn verify_at(&self, secret: &TotpSecret, code: &str, timestamp: u64) -> Result<bool> {
        let current_counter = timestamp / self.config.time_step;

        let normalized = code.trim().replace([' ', '-'], "");
        if normalized.len() != self.config.digits as usize
            || !normalized.chars().all(|c| c.is_ascii_digit())
        {
            return Ok(false);
        }

        for offset in -(self.config.skew as i64)..=(self.config.skew as i64) {
            let check_counter = (current_counter as i64 + offset) as u64;
            let expected = self.generate_hotp(&secret.raw, check_counter)?;

            if constant_time_compare(normalized.as_bytes(), expected.as_bytes()) {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// 生成 HOTP 验证码 (RFC 4226)
    fn generate_hotp(&self, secret: &[u8], counter: u64) -> Result<String> {
        let mut mac = Hmac::<Sha1>::new_from_slice(secret)
            .map_err(|_| Error::Crypto(CryptoError::InvalidKey("invalid secret key".to_string())))?;
        mac.update(&counter.to_be_bytes());
        let hash = mac.finalize().into_bytes();

        // 动态截断
        let offset = (hash[hash.len() - 1] & 0x0f) as usize;
        let binary = ((hash[offset] & 0x7f) as u32) << 24
            | (hash[offset + 1] as u32) << 16
            | (hash[offset + 2] as u32) << 8
            | (hash[offset + 3] as u32);

        let code = binary % 10u32.pow(self.config.digits);

        // 左填充零
        Ok(format!(
            "{:0width$}",
            code,
            width = self.config.digits as usize
        ))
    }
}

impl MethodProvider for TotpProvider {
    fn method_type(&self) -> MethodType {
        MethodType::Totp
    }

    fn setup(&self, user_id: &str, email: Option<&str>) -> Result<SetupPayload> {
        let secret = self.generate_secret()?;
        let account = email.unwrap_or(user_id);
        let uri = self.generate_uri(&secret, account);
        let qr_svg = self.render_qr_svg(&uri)?;

        Ok(SetupPayload {
            secret: secret.base32,
            otpauth_uri: Some(uri),
            qr_svg: Some(qr_svg),
            instructions: "Scan the QR code with your authenticator app, or enter the secret manually, then confirm with a generated code.".to_string(),
        })
    }

    fn verify(&self, code: &str, secret: &str) -> Result<VerifyOutcome> {
        // 存储的密钥无法解码说明数据损坏，这是基础设施错误而非验证失败
        let secret = TotpSecret::from_base32(secret)?;

        if self.verify_at(&secret, code, current_timestamp())? {
            Ok(VerifyOutcome::ok())
        } else {
            Ok(VerifyOutcome::invalid_code())
        }
    }
}

/// 获取当前 Unix 时间戳
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
