//! 备用码（一次性恢复凭据）提供者
//!
//! 当用户无法使用主要 2FA 方法时，备用码提供恢复途径。每个码只能使用一次，
//! 使用后立即失效；重新生成会使全部旧码失效。
//!
//! ## 存储格式
//!
//! 备用码逐条加密后存储。匹配时在存储的写锁临界区内解密比较，
//! 命中即删除，保证同一个码的并发消费只有一次成功。
//!
//! ## 示例
//!
//! ```rust
//! use std::sync::Arc;
//! use twofa::cipher::SecretCipher;
//! use twofa::provider::backup::{
//!     BackupCodesConfig, BackupCodesProvider, InMemoryBackupCodeStore,
//! };
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let cipher = Arc::new(SecretCipher::new(b"0123456789abcdef0123456789abcdef").unwrap());
//! let store = Arc::new(InMemoryBackupCodeStore::new());
//! let provider = BackupCodesProvider::new(BackupCodesConfig::default(), cipher, store);
//!
//! let set = provider.generate("user123").await.unwrap();
//! assert_eq!(set.codes.len(), 10);
//!
//! let result = provider.verify("user123", &set.codes[0]).await.unwrap();
//! assert!(result.is_valid);
//! assert_eq!(result.remaining, 9);
//!
//! // 同一个码不能用第二次
//! let result = provider.verify("user123", &set.codes[0]).await.unwrap();
//! assert!(!result.is_valid);
//! # });
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cipher::SecretCipher;
use crate::error::{Error, Result, StorageError};
use crate::random::{constant_time_compare_str, generate_backup_codes};

/// 规范化后的备用码长度（不含分隔符）
const NORMALIZED_CODE_LENGTH: usize = 8;

/// 备用码配置
#[derive(Debug, Clone)]
pub struct BackupCodesConfig {
    /// 每批生成的备用码数量，默认 10 个
    pub code_count: usize,
}

impl Default for BackupCodesConfig {
    fn default() -> Self {
        Self { code_count: 10 }
    }
}

impl BackupCodesConfig {
    /// 创建新的配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置备用码数量
    pub fn with_code_count(mut self, count: usize) -> Self {
        assert!(count > 0, "code count must be positive");
        self.code_count = count;
        self
    }
}

/// 一批新生成的备用码
///
/// 明文码只在这里出现一次，调用方应立即展示给用户。
#[derive(Debug, Clone)]
pub struct BackupCodeSet {
    /// 明文备用码列表
    pub codes: Vec<String>,
    /// 给用户的保存说明
    pub instructions: String,
    /// 生成时间
    pub generated_at: DateTime<Utc>,
}

/// 备用码验证结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupVerifyResult {
    /// 是否匹配到有效的备用码
    pub is_valid: bool,
    /// 剩余未使用的备用码数量
    pub remaining: usize,
}

/// 备用码存储 trait
///
/// `consume_matching` 是一次性语义的关键：实现方必须在单个临界区内
/// 完成匹配与删除，使并发消费同一个码时至多一个调用成功。
#[async_trait]
pub trait BackupCodeStore: Send + Sync {
    /// 替换用户的全部备用码（旧码全部失效）
    async fn replace(&self, user_id: &str, encrypted_codes: Vec<String>) -> Result<()>;

    /// 消费第一个匹配的备用码
    ///
    /// 对每个存储值调用 `matcher`，命中则在同一临界区内删除该码，
    /// 返回删除后的剩余数量。无匹配返回 `None`。
    async fn consume_matching(
        &self,
        user_id: &str,
        matcher: &(dyn for<'a> Fn(&'a str) -> bool + Sync),
    ) -> Result<Option<usize>>;

    /// 用户剩余的备用码数量
    async fn count(&self, user_id: &str) -> Result<usize>;

    /// 清除用户的全部备用码
    async fn clear(&self, user_id: &str) -> Result<()>;
}

/// 内存备用码存储
///
/// 用于测试和开发环境。`clone` 共享底层存储。
#[derive(Debug, Default)]
pub struct InMemoryBackupCodeStore {
    codes: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl InMemoryBackupCodeStore {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clone for InMemoryBackupCodeStore {
    fn clone(&self) -> Self {
        Self {
            codes: Arc::clone(&self.codes),
        }
    }
}

#[async_trait]
impl BackupCodeStore for InMemoryBackupCodeStore {
    async fn replace(&self, user_id: &str, encrypted_codes: Vec<String>) -> Result<()> {
        let mut codes = self.codes.write().map_err(lock_poisoned)?;
        codes.insert(user_id.to_string(), encrypted_codes);
        Ok(())
    }

    async fn consume_matching(
        &self,
        user_id: &str,
        matcher: &(dyn for<'a> Fn(&'a str) -> bool + Sync),
    ) -> Result<Option<usize>> {
        let mut codes = self.codes.write().map_err(lock_poisoned)?;

        let Some(user_codes) = codes.get_mut(user_id) else {
            return Ok(None);
        };

        // 匹配与删除在同一把写锁内完成
        if let Some(index) = user_codes.iter().position(|stored| matcher(stored)) {
            user_codes.remove(index);
            return Ok(Some(user_codes.len()));
        }

        Ok(None)
    }

    async fn count(&self, user_id: &str) -> Result<usize> {
        let codes = self.codes.read().map_err(lock_poisoned)?;
        Ok(codes.get(user_id).map(|c| c.len()).unwrap_or(0))
    }

    async fn clear(&self, user_id: &str) -> Result<()> {
        let mut codes = self.codes.write().map_err(lock_poisoned)?;
        codes.remove(user_id);
        Ok(())
    }
}

fn lock_poisoned<T>(_: T) -> Error {
    Error::Storage(StorageError::OperationFailed("lock poisoned".to_string()))
}

/// 备用码提供者
///
/// 不在方法注册表中：备用码不是独立的 2FA 方法，而是主方法的恢复途径，
/// 由编排服务直接调用。
pub struct BackupCodesProvider {
    config: BackupCodesConfig,
    cipher: Arc<SecretCipher>,
    store: Arc<dyn BackupCodeStore>,
}

impl BackupCodesProvider {
    /// 创建新的备用码提供者
    pub fn new(
        config: BackupCodesConfig,
        cipher: Arc<SecretCipher>,
        store: Arc<dyn BackupCodeStore>,
    ) -> Self {
        Self {
            config,
            cipher,
            store,
        }
    }

    /// 为用户生成一批新的备用码
    ///
    /// 旧码全部失效。返回的明文码只出现这一次。
    pub async fn generate(&self, user_id: &str) -> Result<BackupCodeSet> {
        let codes = generate_backup_codes(self.config.code_count)?;

        let mut encrypted = Vec::with_capacity(codes.len());
        for code in &codes {
            encrypted.push(self.cipher.encrypt(code)?);
        }
        self.store.replace(user_id, encrypted).await?;

        tracing::info!(user_id, count = codes.len(), "generated backup codes");

        Ok(BackupCodeSet {
            codes,
            instructions: "Store these codes in a safe place. Each code can be used once if you lose access to your authenticator.".to_string(),
            generated_at: Utc::now(),
        })
    }

    /// 验证并消费一个备用码
    ///
    /// 命中的码立即失效。码错误不是错误，而是 `is_valid = false`。
    pub async fn verify(&self, user_id: &str, code: &str) -> Result<BackupVerifyResult> {
        let normalized = normalize_code(code);

        // 长度不符时直接短路，不触碰存储
        if normalized.len() != NORMALIZED_CODE_LENGTH {
            let remaining = self.store.count(user_id).await?;
            return Ok(BackupVerifyResult {
                is_valid: false,
                remaining,
            });
        }

        let cipher = Arc::clone(&self.cipher);
        let matcher = move |stored: &str| {
            let decoded = cipher.decrypt(stored);
            constant_time_compare_str(&normalize_code(&decoded.value), &normalized)
        };

        match self.store.consume_matching(user_id, &matcher).await? {
            Some(remaining) => {
                tracing::info!(user_id, remaining, "backup code consumed");
                Ok(BackupVerifyResult {
                    is_valid: true,
                    remaining,
                })
            }
            None => {
                let remaining = self.store.count(user_id).await?;
                Ok(BackupVerifyResult {
                    is_valid: false,
                    remaining,
                })
            }
        }
    }

    /// 用户剩余的备用码数量
    pub async fn remaining(&self, user_id: &str) -> Result<usize> {
        self.store.count(user_id).await
    }

    /// 使用户的全部备用码失效
    pub async fn invalidate_all(&self, user_id: &str) -> Result<()> {
        self.store.clear(user_id).await
    }
}

/// 规范化用户输入的备用码
///
/// 去除首尾空白、内部空格和连字符，统一为大写。
fn normalize_code(code: &str) -> String {
    code.trim().replace([' ', '-'], "").to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_provider() -> BackupCodesProvider {
        let cipher = Arc::new(SecretCipher::new(b"0123456789abcdef0123456789abcdef").unwrap());
        let store = Arc::new(InMemoryBackupCodeStore::new());
        BackupCodesProvider::new(BackupCodesConfig::default(), cipher, store)
    }

    #[tokio::test]
    async fn test_generate_codes() {
        let provider = test_provider();

        let set = provider.generate("user1").await.unwrap();
        assert_eq!(set.codes.len(), 10);
        assert!(!set.instructions.is_empty());
        assert_eq!(provider.remaining("user1").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_verify_consumes_code() {
        let provider = test_provider();
        let set = provider.generate("user1").await.unwrap();

        let result = provider.verify("user1", &set.codes[3]).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(result.remaining, 9);

        // 同一个码第二次无效
        let result = provider.verify("user1", &set.codes[3]).await.unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.remaining, 9);
    }

    #[tokio::test]
    async fn test_verify_is_case_and_hyphen_insensitive() {
        let provider = test_provider();
        let set = provider.generate("user1").await.unwrap();

        let sloppy = format!("  {}  ", set.codes[0].to_lowercase().replace('-', " "));
        let result = provider.verify("user1", &sloppy).await.unwrap();
        assert!(result.is_valid);
    }

    #[tokio::test]
    async fn test_verify_unknown_code() {
        let provider = test_provider();
        provider.generate("user1").await.unwrap();

        let result = provider.verify("user1", "0000-0001").await.unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.remaining, 10);
    }

    #[tokio::test]
    async fn test_verify_wrong_length_short_circuits() {
        let provider = test_provider();
        provider.generate("user1").await.unwrap();

        let result = provider.verify("user1", "ABC").await.unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.remaining, 10);
    }

    #[tokio::test]
    async fn test_verify_without_codes() {
        let provider = test_provider();

        let result = provider.verify("nobody", "0000-0000").await.unwrap();
        assert!(!result.is_valid);
        assert_eq!(result.remaining, 0);
    }

    #[tokio::test]
    async fn test_regenerate_invalidates_old_codes() {
        let provider = test_provider();
        let old = provider.generate("user1").await.unwrap();
        let new = provider.generate("user1").await.unwrap();

        let result = provider.verify("user1", &old.codes[0]).await.unwrap();
        assert!(!result.is_valid);

        let result = provider.verify("user1", &new.codes[0]).await.unwrap();
        assert!(result.is_valid);
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let provider = test_provider();
        let set = provider.generate("user1").await.unwrap();

        provider.invalidate_all("user1").await.unwrap();
        assert_eq!(provider.remaining("user1").await.unwrap(), 0);

        let result = provider.verify("user1", &set.codes[0]).await.unwrap();
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn test_codes_are_stored_encrypted() {
        let cipher = Arc::new(SecretCipher::new(b"0123456789abcdef0123456789abcdef").unwrap());
        let store = Arc::new(InMemoryBackupCodeStore::new());
        let provider =
            BackupCodesProvider::new(BackupCodesConfig::default(), cipher, Arc::clone(&store) as Arc<dyn BackupCodeStore>);

        let set = provider.generate("user1").await.unwrap();

        let stored = store.codes.read().unwrap();
        for encrypted in stored.get("user1").unwrap() {
            assert!(!set.codes.contains(encrypted));
            assert!(encrypted.contains(':'));
        }
    }

    #[tokio::test]
    async fn test_custom_code_count() {
        let cipher = Arc::new(SecretCipher::new(b"0123456789abcdef0123456789abcdef").unwrap());
        let store = Arc::new(InMemoryBackupCodeStore::new());
        let provider = BackupCodesProvider::new(
            BackupCodesConfig::new().with_code_count(5),
            cipher,
            store,
        );

        let set = provider.generate("user1").await.unwrap();
        assert_eq!(set.codes.len(), 5);
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code(" ab3f-9c1d "), "AB3F9C1D");
        assert_eq!(normalize_code("AB3F 9C1D"), "AB3F9C1D");
        assert_eq!(normalize_code("AB3F9C1D"), "AB3F9C1D");
    }
}
