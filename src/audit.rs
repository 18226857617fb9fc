//! 审计日志模块
//!
//! 记录 2FA 方法的每一次状态迁移（设置、启用、禁用、删除）。
//! 日志是仅追加的：条目一旦写入，永不修改或删除。
//!
//! ## 使用示例
//!
//! ```rust
//! use twofa::audit::{AuditAction, AuditEntry, AuditSink, InMemoryAuditSink};
//!
//! let sink = InMemoryAuditSink::new();
//!
//! sink.append(AuditEntry::new("tfm_abc123", AuditAction::Setup, true)).unwrap();
//! sink.append(
//!     AuditEntry::new("tfm_abc123", AuditAction::Enable, true)
//!         .with_metadata("is_primary", "true"),
//! ).unwrap();
//!
//! assert_eq!(sink.entry_count(), 2);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, StorageError};

/// 审计动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    /// 方法设置（含密钥轮换）
    Setup,
    /// 方法启用
    Enable,
    /// 方法禁用
    Disable,
    /// 方法删除
    Delete,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::Setup => write!(f, "SETUP"),
            AuditAction::Enable => write!(f, "ENABLE"),
            AuditAction::Disable => write!(f, "DISABLE"),
            AuditAction::Delete => write!(f, "DELETE"),
        }
    }
}

/// 审计日志条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// 关联的方法 ID
    pub method_id: String,
    /// 动作
    pub action: AuditAction,
    /// 动作是否成功
    pub success: bool,
    /// 额外元数据
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    /// 记录时间
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// 创建新的审计条目
    pub fn new(method_id: impl Into<String>, action: AuditAction, success: bool) -> Self {
        Self {
            method_id: method_id.into(),
            action,
            success,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// 审计日志接收器 trait
///
/// 方法存储在每次状态迁移时同步调用 `append`。实现方保证仅追加语义；
/// 追加失败由调用方记录日志，但绝不阻塞迁移本身。
pub trait AuditSink: Send + Sync {
    /// 追加一条审计条目
    fn append(&self, entry: AuditEntry) -> Result<()>;
}

/// 内存审计接收器
///
/// 用于测试和开发环境。`clone` 共享底层存储。
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryAuditSink {
    /// 创建新的内存接收器
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取所有条目
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// 获取条目数量
    pub fn entry_count(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// 按方法 ID 过滤条目
    pub fn entries_for_method(&self, method_id: &str) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.method_id == method_id)
            .collect()
    }

    /// 按动作过滤条目
    pub fn entries_for_action(&self, action: AuditAction) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn append(&self, entry: AuditEntry) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| {
            Error::Storage(StorageError::OperationFailed("lock poisoned".into()))
        })?;
        entries.push(entry);
        Ok(())
    }
}

impl Clone for InMemoryAuditSink {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

/// 空操作审计接收器
///
/// 不记录任何内容，用于禁用审计
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpAuditSink;

impl NoOpAuditSink {
    /// 创建新的空操作接收器
    pub fn new() -> Self {
        Self
    }
}

impl AuditSink for NoOpAuditSink {
    fn append(&self, _entry: AuditEntry) -> Result<()> {
        Ok(())
    }
}
