//! 2FA 方法存储模块
//!
//! 持久化用户已注册的 2FA 方法记录。密钥在写入时加密，读取时宽容解密；
//! 每次状态迁移同步写入审计日志。
//!
//! ## 不变量
//!
//! - 每个用户每种方法类型至多一条记录
//! - 每个用户至多一个主方法，选举在存储临界区内完成
//! - 新建的方法总是处于未启用状态，必须先通过验证才能启用
//!
//! ## 使用示例
//!
//! ```rust
//! use std::sync::Arc;
//! use twofa::audit::InMemoryAuditSink;
//! use twofa::cipher::SecretCipher;
//! use twofa::provider::MethodType;
//! use twofa::store::{InMemoryMethodStore, MethodStore, NewMethod};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let cipher = Arc::new(SecretCipher::new(b"0123456789abcdef0123456789abcdef").unwrap());
//! let store = InMemoryMethodStore::new(cipher, Arc::new(InMemoryAuditSink::new()));
//!
//! let method = store
//!     .create(NewMethod {
//!         user_id: "user123".to_string(),
//!         method_type: MethodType::Totp,
//!         secret: "JBSWY3DPEHPK3PXP".to_string(),
//!         name: "Authenticator app".to_string(),
//!         is_primary: false,
//!     })
//!     .await
//!     .unwrap();
//!
//! assert!(!method.is_enabled);
//! store.enable(&method.id, true).await.unwrap();
//! # });
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditAction, AuditEntry, AuditSink};
use crate::cipher::SecretCipher;
use crate::error::{Error, Result, StorageError};
use crate::provider::MethodType;
use crate::random::generate_random_hex;

/// 已注册的 2FA 方法记录
///
/// 从存储读出的记录中 `secret` 已经解密。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoFactorMethod {
    /// 方法 ID（`tfm_` 前缀）
    pub id: String,
    /// 所属用户 ID
    pub user_id: String,
    /// 方法类型
    pub method_type: MethodType,
    /// 方法密钥（明文）
    pub secret: String,
    /// 显示标签
    pub name: String,
    /// 是否已启用
    pub is_enabled: bool,
    /// 是否为主方法
    pub is_primary: bool,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最后更新时间
    pub updated_at: DateTime<Utc>,
    /// 最后成功验证时间
    pub last_used_at: Option<DateTime<Utc>>,
}

/// 新方法的创建参数
#[derive(Debug, Clone)]
pub struct NewMethod {
    /// 所属用户 ID
    pub user_id: String,
    /// 方法类型
    pub method_type: MethodType,
    /// 方法密钥（明文，存储时加密）
    pub secret: String,
    /// 显示标签
    pub name: String,
    /// 是否立即成为主方法
    pub is_primary: bool,
}

/// 2FA 方法存储 trait
///
/// 实现方必须保证：`(user_id, method_type)` 唯一；主方法选举
/// （先清除再设置）在单个临界区内完成；每次状态迁移写入审计日志。
#[async_trait]
pub trait MethodStore: Send + Sync {
    /// 创建新方法记录
    ///
    /// 记录总是以未启用状态创建。同一用户同一类型已有记录时返回
    /// `AlreadyExists`。`is_primary` 为 true 时先清除该用户的其他主标记。
    async fn create(&self, new_method: NewMethod) -> Result<TwoFactorMethod>;

    /// 按 ID 查找方法
    async fn find_by_id(&self, method_id: &str) -> Result<Option<TwoFactorMethod>>;

    /// 按用户和类型查找方法
    async fn find_by_user_and_type(
        &self,
        user_id: &str,
        method_type: MethodType,
    ) -> Result<Option<TwoFactorMethod>>;

    /// 列出用户的方法
    ///
    /// `enabled_only` 为 true 时只返回已启用的方法。
    async fn find_all_for_user(
        &self,
        user_id: &str,
        enabled_only: bool,
    ) -> Result<Vec<TwoFactorMethod>>;

    /// 启用方法
    ///
    /// `is_primary` 为 true 时在同一临界区内先清除该用户的其他主标记。
    async fn enable(&self, method_id: &str, is_primary: bool) -> Result<TwoFactorMethod>;

    /// 禁用方法
    async fn disable(&self, method_id: &str) -> Result<TwoFactorMethod>;

    /// 轮换方法密钥（幂等设置用）
    async fn update_secret(&self, method_id: &str, secret: &str) -> Result<TwoFactorMethod>;

    /// 记录一次成功验证
    async fn touch_last_used(&self, method_id: &str) -> Result<()>;

    /// 用户是否有任何已启用的方法
    async fn has_any_enabled(&self, user_id: &str) -> Result<bool>;

    /// 删除方法记录
    async fn delete(&self, method_id: &str) -> Result<()>;
}

// ============================================================================
// 内存实现
// ============================================================================

/// 存储内部的加密记录
#[derive(Debug, Clone)]
struct StoredMethod {
    id: String,
    user_id: String,
    method_type: MethodType,
    encrypted_secret: String,
    name: String,
    is_enabled: bool,
    is_primary: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

/// 内存 2FA 方法存储
///
/// 用于测试和开发环境。`clone` 共享底层存储。
pub struct InMemoryMethodStore {
    cipher: Arc<SecretCipher>,
    audit: Arc<dyn AuditSink>,
    methods: Arc<RwLock<HashMap<String, StoredMethod>>>,
}

impl InMemoryMethodStore {
    /// 创建新的内存存储
    pub fn new(cipher: Arc<SecretCipher>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            cipher,
            audit,
            methods: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 生成方法 ID
    fn generate_id() -> Result<String> {
        Ok(format!("tfm_{}", generate_random_hex(16)?))
    }

    /// 审计追加失败时记录日志但不阻塞状态迁移
    fn audit_append(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.append(entry) {
            tracing::warn!(error = %e, "audit append failed");
        }
    }

    /// 宽容解密后转换为对外记录
    fn to_method(&self, stored: &StoredMethod) -> TwoFactorMethod {
        let decoded = self.cipher.decrypt(&stored.encrypted_secret);
        if decoded.was_legacy_format {
            tracing::warn!(
                method_id = %stored.id,
                "stored secret read via legacy fallback"
            );
        }

        TwoFactorMethod {
            id: stored.id.clone(),
            user_id: stored.user_id.clone(),
            method_type: stored.method_type,
            secret: decoded.value,
            name: stored.name.clone(),
            is_enabled: stored.is_enabled,
            is_primary: stored.is_primary,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
            last_used_at: stored.last_used_at,
        }
    }
}

impl Clone for InMemoryMethodStore {
    fn clone(&self) -> Self {
        Self {
            cipher: Arc::clone(&self.cipher),
            audit: Arc::clone(&self.audit),
            methods: Arc::clone(&self.methods),
        }
    }
}

fn lock_poisoned<T>(_: T) -> Error {
    Error::Storage(StorageError::OperationFailed("lock poisoned".to_string()))
}

fn not_found(method_id: &str) -> Error {
    Error::Storage(StorageError::NotFound(format!("method {}", method_id)))
}

#[async_trait]
impl MethodStore for InMemoryMethodStore {
    async fn create(&self, new_method: NewMethod) -> Result<TwoFactorMethod> {
        let encrypted_secret = self.cipher.encrypt(&new_method.secret)?;
        let id = Self::generate_id()?;
        let now = Utc::now();

        {
            let mut methods = self.methods.write().map_err(lock_poisoned)?;

            let duplicate = methods.values().any(|m| {
                m.user_id == new_method.user_id && m.method_type == new_method.method_type
            });
            if duplicate {
                return Err(Error::Storage(StorageError::AlreadyExists(format!(
                    "{} method for user {}",
                    new_method.method_type, new_method.user_id
                ))));
            }

            // 主方法选举：先清除该用户的其他主标记
            if new_method.is_primary {
                for m in methods.values_mut() {
                    if m.user_id == new_method.user_id {
                        m.is_primary = false;
                    }
                }
            }

            methods.insert(
                id.clone(),
                StoredMethod {
                    id: id.clone(),
                    user_id: new_method.user_id.clone(),
                    method_type: new_method.method_type,
                    encrypted_secret,
                    name: new_method.name.clone(),
                    is_enabled: false,
                    is_primary: new_method.is_primary,
                    created_at: now,
                    updated_at: now,
                    last_used_at: None,
                },
            );
        }

        self.audit_append(
            AuditEntry::new(&id, AuditAction::Setup, true)
                .with_metadata("method_type", new_method.method_type.as_str()),
        );

        self.find_by_id(&id).await?.ok_or_else(|| not_found(&id))
    }

    async fn find_by_id(&self, method_id: &str) -> Result<Option<TwoFactorMethod>> {
        let methods = self.methods.read().map_err(lock_poisoned)?;
        Ok(methods.get(method_id).map(|m| self.to_method(m)))
    }

    async fn find_by_user_and_type(
        &self,
        user_id: &str,
        method_type: MethodType,
    ) -> Result<Option<TwoFactorMethod>> {
        let methods = self.methods.read().map_err(lock_poisoned)?;
        Ok(methods
            .values()
            .find(|m| m.user_id == user_id && m.method_type == method_type)
            .map(|m| self.to_method(m)))
    }

    async fn find_all_for_user(
        &self,
        user_id: &str,
        enabled_only: bool,
    ) -> Result<Vec<TwoFactorMethod>> {
        let methods = self.methods.read().map_err(lock_poisoned)?;
        let mut result: Vec<_> = methods
            .values()
            .filter(|m| m.user_id == user_id && (!enabled_only || m.is_enabled))
            .map(|m| self.to_method(m))
            .collect();
        result.sort_by_key(|m| m.created_at);
        Ok(result)
    }

    async fn enable(&self, method_id: &str, is_primary: bool) -> Result<TwoFactorMethod> {
        {
            let mut methods = self.methods.write().map_err(lock_poisoned)?;

            let user_id = methods
                .get(method_id)
                .map(|m| m.user_id.clone())
                .ok_or_else(|| not_found(method_id))?;

            // 主方法选举与启用在同一把写锁内完成
            if is_primary {
                for m in methods.values_mut() {
                    if m.user_id == user_id {
                        m.is_primary = false;
                    }
                }
            }

            let method = methods
                .get_mut(method_id)
                .ok_or_else(|| not_found(method_id))?;
            method.is_enabled = true;
            method.is_primary = is_primary || method.is_primary;
            method.updated_at = Utc::now();
        }

        self.audit_append(
            AuditEntry::new(method_id, AuditAction::Enable, true)
                .with_metadata("is_primary", is_primary.to_string()),
        );

        self.find_by_id(method_id)
            .await?
            .ok_or_else(|| not_found(method_id))
    }

    async fn disable(&self, method_id: &str) -> Result<TwoFactorMethod> {
        {
            let mut methods = self.methods.write().map_err(lock_poisoned)?;
            let method = methods
                .get_mut(method_id)
                .ok_or_else(|| not_found(method_id))?;
            method.is_enabled = false;
            method.is_primary = false;
            method.updated_at = Utc::now();
        }

        self.audit_append(AuditEntry::new(method_id, AuditAction::Disable, true));

        self.find_by_id(method_id)
            .await?
            .ok_or_else(|| not_found(method_id))
    }

    async fn update_secret(&self, method_id: &str, secret: &str) -> Result<TwoFactorMethod> {
        let encrypted_secret = self.cipher.encrypt(secret)?;

        {
            let mut methods = self.methods.write().map_err(lock_poisoned)?;
            let method = methods
                .get_mut(method_id)
                .ok_or_else(|| not_found(method_id))?;
            method.encrypted_secret = encrypted_secret;
            method.updated_at = Utc::now();
        }

        self.audit_append(
            AuditEntry::new(method_id, AuditAction::Setup, true)
                .with_metadata("secret_rotated", "true"),
        );

        self.find_by_id(method_id)
            .await?
            .ok_or_else(|| not_found(method_id))
    }

    async fn touch_last_used(&self, method_id: &str) -> Result<()> {
        let mut methods = self.methods.write().map_err(lock_poisoned)?;
        let method = methods
            .get_mut(method_id)
            .ok_or_else(|| not_found(method_id))?;
        method.last_used_at = Some(Utc::now());
        Ok(())
    }

    async fn has_any_enabled(&self, user_id: &str) -> Result<bool> {
        let methods = self.methods.read().map_err(lock_poisoned)?;
        Ok(methods
            .values()
            .any(|m| m.user_id == user_id && m.is_enabled))
    }

    async fn delete(&self, method_id: &str) -> Result<()> {
        {
            let mut methods = self.methods.write().map_err(lock_poisoned)?;
            methods
                .remove(method_id)
                .ok_or_else(|| not_found(method_id))?;
        }

        self.audit_append(AuditEntry::new(method_id, AuditAction::Delete, true));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;

    fn test_store() -> (InMemoryMethodStore, Arc<InMemoryAuditSink>) {
        let cipher = Arc::new(SecretCipher::new(b"0123456789abcdef0123456789abcdef").unwrap());
        let audit = Arc::new(InMemoryAuditSink::new());
        let store = InMemoryMethodStore::new(cipher, Arc::clone(&audit) as Arc<dyn AuditSink>);
        (store, audit)
    }

    fn new_totp(user_id: &str) -> NewMethod {
        NewMethod {
            user_id: user_id.to_string(),
            method_type: MethodType::Totp,
            secret: "JBSWY3DPEHPK3PXP".to_string(),
            name: "Authenticator app".to_string(),
            is_primary: false,
        }
    }

    #[tokio::test]
    async fn test_create_starts_disabled() {
        let (store, audit) = test_store();

        let method = store.create(new_totp("user1")).await.unwrap();

        assert!(method.id.starts_with("tfm_"));
        assert!(!method.is_enabled);
        assert_eq!(method.secret, "JBSWY3DPEHPK3PXP");
        assert!(method.last_used_at.is_none());
        assert_eq!(audit.entries_for_action(AuditAction::Setup).len(), 1);
    }

    #[tokio::test]
    async fn test_create_duplicate_type_rejected() {
        let (store, _) = test_store();

        store.create(new_totp("user1")).await.unwrap();
        let result = store.create(new_totp("user1")).await;

        assert!(matches!(
            result,
            Err(Error::Storage(StorageError::AlreadyExists(_)))
        ));
    }

    #[tokio::test]
    async fn test_same_type_for_different_users() {
        let (store, _) = test_store();

        store.create(new_totp("user1")).await.unwrap();
        store.create(new_totp("user2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_secret_is_encrypted_at_rest() {
        let (store, _) = test_store();
        let method = store.create(new_totp("user1")).await.unwrap();

        let methods = store.methods.read().unwrap();
        let stored = methods.get(&method.id).unwrap();
        assert_ne!(stored.encrypted_secret, "JBSWY3DPEHPK3PXP");
        assert!(stored.encrypted_secret.contains(':'));
    }

    #[tokio::test]
    async fn test_legacy_plaintext_secret_readable() {
        let (store, _) = test_store();
        let method = store.create(new_totp("user1")).await.unwrap();

        // 模拟加密引入之前写入的明文记录
        {
            let mut methods = store.methods.write().unwrap();
            methods.get_mut(&method.id).unwrap().encrypted_secret =
                "LEGACYPLAINTEXT".to_string();
        }

        let read = store.find_by_id(&method.id).await.unwrap().unwrap();
        assert_eq!(read.secret, "LEGACYPLAINTEXT");
    }

    #[tokio::test]
    async fn test_enable_and_disable() {
        let (store, audit) = test_store();
        let method = store.create(new_totp("user1")).await.unwrap();

        let enabled = store.enable(&method.id, true).await.unwrap();
        assert!(enabled.is_enabled);
        assert!(enabled.is_primary);
        assert!(store.has_any_enabled("user1").await.unwrap());

        let disabled = store.disable(&method.id).await.unwrap();
        assert!(!disabled.is_enabled);
        assert!(!disabled.is_primary);
        assert!(!store.has_any_enabled("user1").await.unwrap());

        assert_eq!(audit.entries_for_action(AuditAction::Enable).len(), 1);
        assert_eq!(audit.entries_for_action(AuditAction::Disable).len(), 1);
    }

    #[tokio::test]
    async fn test_at_most_one_primary() {
        let (store, _) = test_store();

        let totp = store.create(new_totp("user1")).await.unwrap();
        let sms = store
            .create(NewMethod {
                user_id: "user1".to_string(),
                method_type: MethodType::Sms,
                secret: "+15551234567".to_string(),
                name: "Phone".to_string(),
                is_primary: false,
            })
            .await
            .unwrap();

        store.enable(&totp.id, true).await.unwrap();
        store.enable(&sms.id, true).await.unwrap();

        let methods = store.find_all_for_user("user1", false).await.unwrap();
        let primaries: Vec<_> = methods.iter().filter(|m| m.is_primary).collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].id, sms.id);
    }

    #[tokio::test]
    async fn test_enable_keeps_existing_primary_when_not_requested() {
        let (store, _) = test_store();

        let totp = store.create(new_totp("user1")).await.unwrap();
        store.enable(&totp.id, true).await.unwrap();

        let sms = store
            .create(NewMethod {
                user_id: "user1".to_string(),
                method_type: MethodType::Sms,
                secret: "+15551234567".to_string(),
                name: "Phone".to_string(),
                is_primary: false,
            })
            .await
            .unwrap();
        store.enable(&sms.id, false).await.unwrap();

        let totp = store.find_by_id(&totp.id).await.unwrap().unwrap();
        assert!(totp.is_primary);
    }

    #[tokio::test]
    async fn test_update_secret() {
        let (store, audit) = test_store();
        let method = store.create(new_totp("user1")).await.unwrap();

        let updated = store
            .update_secret(&method.id, "NEWSECRETBASE32VALUE")
            .await
            .unwrap();

        assert_eq!(updated.id, method.id);
        assert_eq!(updated.secret, "NEWSECRETBASE32VALUE");
        // 轮换也记入审计日志
        assert_eq!(audit.entries_for_action(AuditAction::Setup).len(), 2);
    }

    #[tokio::test]
    async fn test_touch_last_used() {
        let (store, _) = test_store();
        let method = store.create(new_totp("user1")).await.unwrap();

        store.touch_last_used(&method.id).await.unwrap();

        let read = store.find_by_id(&method.id).await.unwrap().unwrap();
        assert!(read.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_find_by_user_and_type() {
        let (store, _) = test_store();
        store.create(new_totp("user1")).await.unwrap();

        let found = store
            .find_by_user_and_type("user1", MethodType::Totp)
            .await
            .unwrap();
        assert!(found.is_some());

        let missing = store
            .find_by_user_and_type("user1", MethodType::Sms)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_find_all_enabled_only() {
        let (store, _) = test_store();

        let totp = store.create(new_totp("user1")).await.unwrap();
        store
            .create(NewMethod {
                user_id: "user1".to_string(),
                method_type: MethodType::Sms,
                secret: "+15551234567".to_string(),
                name: "Phone".to_string(),
                is_primary: false,
            })
            .await
            .unwrap();
        store.enable(&totp.id, true).await.unwrap();

        let all = store.find_all_for_user("user1", false).await.unwrap();
        assert_eq!(all.len(), 2);

        let enabled = store.find_all_for_user("user1", true).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, totp.id);
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, audit) = test_store();
        let method = store.create(new_totp("user1")).await.unwrap();

        store.delete(&method.id).await.unwrap();
        assert!(store.find_by_id(&method.id).await.unwrap().is_none());
        assert_eq!(audit.entries_for_action(AuditAction::Delete).len(), 1);

        let result = store.delete(&method.id).await;
        assert!(matches!(
            result,
            Err(Error::Storage(StorageError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_operations_on_missing_method() {
        let (store, _) = test_store();

        assert!(store.enable("tfm_missing", false).await.is_err());
        assert!(store.disable("tfm_missing").await.is_err());
        assert!(store.update_secret("tfm_missing", "x").await.is_err());
        assert!(store.touch_last_used("tfm_missing").await.is_err());
    }
}
