//! 规则存储管理
//!
//! 规则集以不可变快照的形式通过 `ArcSwap` 发布：读者每次调用只加载一次快照，
//! 不会看到修改到一半的状态；写者在互斥锁下构造新快照，持久化成功后再替换。

use crate::clock::{Clock, SystemClock};
use crate::compiler::RuleCompiler;
use crate::error::{Result, RuleError};
use crate::evaluator::RuleResolver;
use crate::models::{BusinessRule, RuleFilter, RulePatch};
use crate::persistence::{MemoryPersistence, RuleDocument, RulePersistence};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// 规则集快照
#[derive(Debug, Default)]
pub struct RuleSet {
    /// 按插入顺序排列
    rules: Vec<Arc<BusinessRule>>,
    index: HashMap<String, Arc<BusinessRule>>,
    version: u64,
}

impl RuleSet {
    fn build(rules: Vec<Arc<BusinessRule>>, version: u64) -> Self {
        let index = rules
            .iter()
            .map(|r| (r.id.clone(), Arc::clone(r)))
            .collect();
        Self {
            rules,
            index,
            version,
        }
    }

    pub fn rules(&self) -> &[Arc<BusinessRule>] {
        &self.rules
    }

    pub fn get(&self, rule_id: &str) -> Option<&Arc<BusinessRule>> {
        self.index.get(rule_id)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn to_document(&self) -> RuleDocument {
        RuleDocument::new(self.rules.iter().map(|r| (**r).clone()).collect())
    }
}

impl RuleResolver for RuleSet {
    fn resolve(&self, rule_id: &str) -> Option<&BusinessRule> {
        self.get(rule_id).map(|r| r.as_ref())
    }
}

/// 规则存储
#[derive(Clone)]
pub struct RuleStore {
    snapshot: Arc<ArcSwap<RuleSet>>,
    /// 串行化所有写操作
    write_lock: Arc<Mutex<()>>,
    persistence: Arc<dyn RulePersistence>,
    clock: Arc<dyn Clock>,
}

impl RuleStore {
    /// 创建规则存储（初始为空，调用 `load` 从后端读取）
    pub fn new(persistence: Arc<dyn RulePersistence>, clock: Arc<dyn Clock>) -> Self {
        Self {
            snapshot: Arc::new(ArcSwap::from_pointee(RuleSet::default())),
            write_lock: Arc::new(Mutex::new(())),
            persistence,
            clock,
        }
    }

    /// 内存存储，主要用于测试和嵌入场景
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPersistence::new()), Arc::new(SystemClock))
    }

    /// 当前快照
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.snapshot.load_full()
    }

    /// 规则集版本号，每次修改或加载后递增
    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 添加规则，返回规则 ID（ID 为空时自动生成）
    #[instrument(skip(self, rule), fields(rule_id = %rule.id, rule_name = %rule.name))]
    pub fn add_rule(&self, mut rule: BusinessRule) -> Result<String> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot.load_full();

        if rule.id.trim().is_empty() {
            rule.id = Uuid::new_v4().to_string();
        }

        if current.get(&rule.id).is_some() {
            warn!("规则 ID 已存在: {}", rule.id);
            return Err(RuleError::DuplicateId(rule.id));
        }

        RuleCompiler::validate_rule(&rule)?;

        let rule_id = rule.id.clone();
        let mut rules = current.rules.clone();
        rules.push(Arc::new(rule));
        RuleCompiler::check_references(rules.iter().map(|r| r.as_ref()))?;

        self.commit(rules, current.version + 1)?;
        info!("规则已添加: {}", rule_id);
        Ok(rule_id)
    }

    /// 从 JSON 添加规则
    #[instrument(skip(self, json))]
    pub fn add_rule_json(&self, json: &str) -> Result<String> {
        let rule: BusinessRule =
            serde_json::from_str(json).map_err(|e| RuleError::Validation(e.to_string()))?;
        self.add_rule(rule)
    }

    /// 删除规则
    #[instrument(skip(self))]
    pub fn remove_rule(&self, rule_id: &str) -> Result<BusinessRule> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot.load_full();

        let Some(position) = current.rules.iter().position(|r| r.id == rule_id) else {
            warn!("删除不存在的规则: {}", rule_id);
            return Err(RuleError::NotFound(rule_id.to_string()));
        };

        let mut rules = current.rules.clone();
        let removed = rules.remove(position);

        self.commit(rules, current.version + 1)?;
        info!("规则已删除: {}", rule_id);
        Ok((*removed).clone())
    }

    /// 部分更新规则，递增规则版本并刷新更新时间
    #[instrument(skip(self, patch))]
    pub fn update_rule(&self, rule_id: &str, patch: RulePatch) -> Result<BusinessRule> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot.load_full();

        let Some(position) = current.rules.iter().position(|r| r.id == rule_id) else {
            warn!("更新不存在的规则: {}", rule_id);
            return Err(RuleError::NotFound(rule_id.to_string()));
        };

        let mut updated = (*current.rules[position]).clone();
        patch.apply_to(&mut updated);
        updated.version += 1;
        updated.updated_at = self.clock.now();

        RuleCompiler::validate_rule(&updated)?;

        let mut rules = current.rules.clone();
        rules[position] = Arc::new(updated.clone());
        RuleCompiler::check_references(rules.iter().map(|r| r.as_ref()))?;

        self.commit(rules, current.version + 1)?;
        info!(version = updated.version, "规则已更新: {}", rule_id);
        Ok(updated)
    }

    /// 获取单条规则
    pub fn get_rule(&self, rule_id: &str) -> Option<Arc<BusinessRule>> {
        self.snapshot.load().get(rule_id).cloned()
    }

    /// 按过滤条件查询规则，保持插入顺序
    pub fn get_rules(&self, filter: &RuleFilter) -> Vec<Arc<BusinessRule>> {
        self.snapshot
            .load()
            .rules
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }

    /// 规则关系检查（只返回提示，不修改存储）
    pub fn validate_relations(&self) -> Vec<String> {
        let snapshot = self.snapshot.load_full();
        RuleCompiler::relation_warnings(snapshot.rules.iter().map(|r| r.as_ref()))
    }

    /// 从持久化后端重新加载
    #[instrument(skip(self))]
    pub fn load(&self) -> Result<usize> {
        let document = self.persistence.load()?;
        self.replace_all(document, false)
    }

    /// 从 JSON 文档整体替换规则集并持久化
    #[instrument(skip(self, json))]
    pub fn load_document_json(&self, json: &str) -> Result<usize> {
        let document = RuleDocument::from_json(json)?;
        self.replace_all(document, true)
    }

    pub fn to_document(&self) -> RuleDocument {
        self.snapshot.load().to_document()
    }

    pub fn to_json(&self) -> Result<String> {
        self.to_document().to_json()
    }

    /// 校验整份文档后一次性替换，失败时保留原规则集
    fn replace_all(&self, document: RuleDocument, persist: bool) -> Result<usize> {
        let mut rules: Vec<Arc<BusinessRule>> = Vec::with_capacity(document.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(document.len());

        for mut rule in document.rules {
            if rule.id.trim().is_empty() {
                rule.id = Uuid::new_v4().to_string();
            }
            RuleCompiler::validate_rule(&rule)
                .map_err(|e| RuleError::Configuration(e.to_string()))?;
            if !seen.insert(rule.id.clone()) {
                return Err(RuleError::Configuration(format!(
                    "规则 ID 重复: {}",
                    rule.id
                )));
            }
            rules.push(Arc::new(rule));
        }

        RuleCompiler::check_references(rules.iter().map(|r| r.as_ref()))
            .map_err(|e| RuleError::Configuration(e.to_string()))?;

        let _guard = self.write_lock.lock();
        let count = rules.len();
        let version = self.snapshot.load().version + 1;

        if persist {
            self.commit(rules, version)?;
        } else {
            self.snapshot.store(Arc::new(RuleSet::build(rules, version)));
        }

        for warning in self.validate_relations() {
            warn!("{}", warning);
        }

        info!(rules = count, version, "规则集已加载");
        Ok(count)
    }

    /// 先持久化再发布快照，保存失败时内存状态不变
    fn commit(&self, rules: Vec<Arc<BusinessRule>>, version: u64) -> Result<()> {
        let next = RuleSet::build(rules, version);
        self.persistence.save(&next.to_document())?;
        self.snapshot.store(Arc::new(next));
        Ok(())
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.load();
        f.debug_struct("RuleStore")
            .field("rules", &snapshot.len())
            .field("version", &snapshot.version)
            .finish()
    }
}
