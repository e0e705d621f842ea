//! 规则持久化
//!
//! 规则文档是 BusinessRule 的 JSON 数组。文件后端写入时先写临时文件再
//! 原子重命名，避免读者看到半写的文档。

use crate::error::{Result, RuleError};
use crate::models::BusinessRule;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 规则文档
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleDocument {
    pub rules: Vec<BusinessRule>,
}

impl RuleDocument {
    pub fn new(rules: Vec<BusinessRule>) -> Self {
        Self { rules }
    }

    /// 解析规则文档，格式错误统一报告为配置错误
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RuleError::Configuration(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// 规则持久化后端
#[cfg_attr(test, mockall::automock)]
pub trait RulePersistence: Send + Sync {
    /// 读取规则文档
    fn load(&self) -> Result<RuleDocument>;

    /// 保存规则文档
    fn save(&self, document: &RuleDocument) -> Result<()>;
}

/// JSON 文件后端
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "rules.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl RulePersistence for JsonFilePersistence {
    fn load(&self) -> Result<RuleDocument> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "规则文件不存在，使用空规则集");
            return Ok(RuleDocument::default());
        }

        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(RuleDocument::default());
        }

        let document = RuleDocument::from_json(&content)?;
        debug!(path = %self.path.display(), rules = document.len(), "规则文件已读取");
        Ok(document)
    }

    fn save(&self, document: &RuleDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(document.to_json()?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        debug!(path = %self.path.display(), rules = document.len(), "规则文件已保存");
        Ok(())
    }
}

/// 内存后端
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    document: Mutex<RuleDocument>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: RuleDocument) -> Self {
        Self {
            document: Mutex::new(document),
        }
    }

    /// 当前保存的文档
    pub fn document(&self) -> RuleDocument {
        self.document.lock().clone()
    }
}

impl RulePersistence for MemoryPersistence {
    fn load(&self) -> Result<RuleDocument> {
        Ok(self.document.lock().clone())
    }

    fn save(&self, document: &RuleDocument) -> Result<()> {
        *self.document.lock() = document.clone();
        Ok(())
    }
}
