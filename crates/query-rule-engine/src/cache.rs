//! 评估结果缓存
//!
//! 以查询上下文指纹和规则集版本为键缓存 `EngineResponse`。
//! 规则集版本变化时清空后端，条目本身也记录版本，版本不一致的条目不会被返回。

use crate::clock::Clock;
use crate::context::ExecutionContext;
use crate::engine::RuleEngine;
use crate::error::Result;
use crate::models::{EngineResponse, Trigger};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use semlayer_shared::observability::metrics as engine_metrics;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// 缓存后端
#[cfg_attr(test, mockall::automock)]
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

/// 进程内缓存后端，过期时间由注入的时钟判断
pub struct MemoryCacheBackend {
    entries: DashMap<String, (String, DateTime<Utc>)>,
    clock: Arc<dyn Clock>,
}

impl MemoryCacheBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

impl std::fmt::Debug for MemoryCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheBackend")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// 缓存条目
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedEntry {
    ruleset_version: u64,
    response: EngineResponse,
}

/// 参与指纹计算的上下文字段（列表已排序）
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Fingerprint<'a> {
    query: &'a str,
    query_type: &'a str,
    tables: Vec<&'a str>,
    columns: Vec<&'a str>,
    all_columns: bool,
    database: Option<&'a str>,
    user_id: Option<&'a str>,
    user_role: Option<&'a str>,
    permissions: Vec<&'a str>,
    metadata: &'a Map<String, Value>,
    trigger: Trigger,
    ruleset_version: u64,
}

fn sorted(items: &[String]) -> Vec<&str> {
    let mut v: Vec<&str> = items.iter().map(String::as_str).collect();
    v.sort_unstable();
    v
}

/// 计算上下文指纹（SHA-256，十六进制）
pub fn fingerprint(context: &ExecutionContext, trigger: Trigger, ruleset_version: u64) -> String {
    let user = context.user.as_ref();

    let key = Fingerprint {
        query: &context.query,
        query_type: context.query_type.as_str(),
        tables: sorted(&context.tables),
        columns: sorted(&context.columns),
        all_columns: context.all_columns,
        database: context.database.as_deref(),
        user_id: user.and_then(|u| u.id.as_deref()),
        user_role: user.and_then(|u| u.role.as_deref()),
        permissions: user.map(|u| sorted(&u.permissions)).unwrap_or_default(),
        metadata: &context.metadata,
        trigger,
        ruleset_version,
    };

    let mut hasher = Sha256::new();
    // 字段均可序列化，失败时退化为按查询文本计算
    match serde_json::to_vec(&key) {
        Ok(bytes) => hasher.update(&bytes),
        Err(_) => hasher.update(context.query.as_bytes()),
    }
    format!("{:x}", hasher.finalize())
}

/// 带缓存的规则引擎
///
/// 命中缓存时直接返回先前的响应，log/notify 副作用不会重复执行。
#[derive(Clone)]
pub struct CachedRuleEngine {
    engine: RuleEngine,
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    observed_version: Arc<AtomicU64>,
}

impl CachedRuleEngine {
    pub fn new(engine: RuleEngine, backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        let observed_version = Arc::new(AtomicU64::new(engine.store().version()));
        Self {
            engine,
            backend,
            ttl,
            observed_version,
        }
    }

    /// 使用进程内后端，TTL 取自引擎配置
    pub fn in_memory(engine: RuleEngine) -> Self {
        let backend = Arc::new(MemoryCacheBackend::new(engine.store().clock().clone()));
        let ttl = Duration::from_secs(engine.config().cache_ttl_seconds);
        Self::new(engine, backend, ttl)
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    pub fn evaluate_query(&self, context: &ExecutionContext) -> EngineResponse {
        self.evaluate(context, Trigger::BeforeQuery)
    }

    #[instrument(skip(self, context), fields(trigger = %trigger))]
    pub fn evaluate(&self, context: &ExecutionContext, trigger: Trigger) -> EngineResponse {
        let version = self.engine.store().version();
        self.invalidate_if_changed(version);

        let key = fingerprint(context, trigger, version);
        if let Some(response) = self.lookup(&key, version) {
            engine_metrics::record_cache_lookup(true);
            debug!(key = %key, "评估缓存命中");
            return response;
        }
        engine_metrics::record_cache_lookup(false);

        let response = self.engine.evaluate(context, trigger);
        if !response.metadata.timed_out {
            self.store(context, trigger, &response);
        }
        response
    }

    /// 规则集版本变化时清空缓存
    fn invalidate_if_changed(&self, version: u64) {
        let previous = self.observed_version.swap(version, Ordering::AcqRel);
        if previous != version {
            debug!(previous, version, "规则集版本变化，清空评估缓存");
            if let Err(e) = self.backend.clear() {
                warn!(error = %e, "清空评估缓存失败");
            }
        }
    }

    fn lookup(&self, key: &str, version: u64) -> Option<EngineResponse> {
        let raw = match self.backend.get(key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "读取评估缓存失败");
                return None;
            }
        };

        match serde_json::from_str::<CachedEntry>(&raw) {
            Ok(entry) if entry.ruleset_version == version => Some(entry.response),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "评估缓存条目无法解析，已丢弃");
                if let Err(e) = self.backend.delete(key) {
                    warn!(error = %e, "删除损坏的评估缓存条目失败");
                }
                None
            }
        }
    }

    fn store(&self, context: &ExecutionContext, trigger: Trigger, response: &EngineResponse) {
        // 以实际评估所用的版本为键，避免评估期间规则集变化导致错配
        let version = response.metadata.ruleset_version;
        let key = fingerprint(context, trigger, version);
        let entry = CachedEntry {
            ruleset_version: version,
            response: response.clone(),
        };

        let result = serde_json::to_string(&entry)
            .map_err(Into::into)
            .and_then(|raw| self.backend.set(&key, raw, self.ttl));
        if let Err(e) = result {
            warn!(error = %e, "写入评估缓存失败");
        }
    }
}

impl std::fmt::Debug for CachedRuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedRuleEngine")
            .field("engine", &self.engine)
            .field("ttl", &self.ttl)
            .finish()
    }
}
