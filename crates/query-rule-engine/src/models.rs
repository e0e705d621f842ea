//! 规则引擎领域模型

use crate::operators::LogicalOperator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// 业务规则类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    AccessPolicy,
    ColumnAccess,
    TableAccess,
    DataValidation,
    ConstraintCheck,
    BusinessLogic,
    QueryPattern,
    JoinRule,
    AggregationRule,
    MetricDefinition,
    CalculationRule,
    TransformationRule,
    PiiProtection,
    AuditRequirement,
    RetentionPolicy,
}

/// 严重级别，按声明顺序递增：info < warning < error < block
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Error,
    Block,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Block => "block",
        };
        write!(f, "{}", s)
    }
}

/// 规则作用范围
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    #[default]
    Global,
    Database,
    Table,
    Column,
    Relationship,
}

/// 规则触发时机
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    BeforeQuery,
    AfterQuery,
    OnSchemaChange,
    OnDataChange,
    OnAccess,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BeforeQuery => "before_query",
            Self::AfterQuery => "after_query",
            Self::OnSchemaChange => "on_schema_change",
            Self::OnDataChange => "on_data_change",
            Self::OnAccess => "on_access",
        };
        write!(f, "{}", s)
    }
}

/// 规则作用目标（与 scope 配合使用）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
}

impl RuleTarget {
    pub fn tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.database.is_none() && self.tables.is_empty() && self.columns.is_empty()
    }
}

/// 规则条件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// 受限表达式，如 `queryType = 'DELETE' AND 'users' IN tables`
    Expression { expression: String },
    /// 针对查询文本的正则匹配，默认不区分大小写
    Pattern {
        pattern: String,
        #[serde(default, rename = "caseSensitive")]
        case_sensitive: bool,
    },
    /// 预注册的条件函数
    Function {
        name: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        params: Map<String, Value>,
    },
    /// 逻辑组合
    Composite {
        operator: LogicalOperator,
        conditions: Vec<Condition>,
    },
    /// 复用另一条规则的条件
    RuleRef {
        #[serde(rename = "ruleId")]
        rule_id: String,
    },
}

impl Condition {
    pub fn expression(expression: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::Pattern {
            pattern: pattern.into(),
            case_sensitive: false,
        }
    }

    pub fn function(name: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::Function {
            name: name.into(),
            params,
        }
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Self::Composite {
            operator: LogicalOperator::And,
            conditions,
        }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Self::Composite {
            operator: LogicalOperator::Or,
            conditions,
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: Condition) -> Self {
        Self::Composite {
            operator: LogicalOperator::Not,
            conditions: vec![condition],
        }
    }

    pub fn rule_ref(rule_id: impl Into<String>) -> Self {
        Self::RuleRef {
            rule_id: rule_id.into(),
        }
    }

    /// 条件树中直接或间接引用的规则 ID
    pub fn referenced_rules(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, refs: &mut Vec<&'a str>) {
        match self {
            Self::RuleRef { rule_id } => refs.push(rule_id),
            Self::Composite { conditions, .. } => {
                for child in conditions {
                    child.collect_refs(refs);
                }
            }
            _ => {}
        }
    }
}

/// 查询改写片段
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryRewrite {
    /// 整体替换查询
    Replace { query: String },
    /// 追加过滤条件（有 WHERE 时以 AND 连接）
    AddFilter { clause: String },
    /// 限制返回行数（已有 LIMIT 时取较小值）
    Limit { max: u64 },
    /// 在查询末尾追加片段
    Append { fragment: String },
}

/// 动作类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Allow,
    Deny,
    Modify {
        rewrite: QueryRewrite,
    },
    Log,
    Notify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    Transform {
        rewrite: QueryRewrite,
    },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Modify { .. } => "modify",
            Self::Log => "log",
            Self::Notify { .. } => "notify",
            Self::Transform { .. } => "transform",
        }
    }

    /// 返回改写片段（仅 modify/transform）
    pub fn rewrite(&self) -> Option<&QueryRewrite> {
        match self {
            Self::Modify { rewrite } | Self::Transform { rewrite } => Some(rewrite),
            _ => None,
        }
    }
}

/// 规则动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(flatten)]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            message: None,
            code: None,
            parameters: Map::new(),
        }
    }

    pub fn allow() -> Self {
        Self::new(ActionKind::Allow)
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::new(ActionKind::Deny).with_message(message)
    }

    pub fn modify(rewrite: QueryRewrite) -> Self {
        Self::new(ActionKind::Modify { rewrite })
    }

    pub fn transform(rewrite: QueryRewrite) -> Self {
        Self::new(ActionKind::Transform { rewrite })
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self::new(ActionKind::Log).with_message(message)
    }

    pub fn notify(channel: Option<String>, message: impl Into<String>) -> Self {
        Self::new(ActionKind::Notify { channel }).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

fn default_enabled() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

/// 业务规则定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessRule {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub scope: RuleScope,
    #[serde(default, skip_serializing_if = "RuleTarget::is_empty")]
    pub target: RuleTarget,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    pub condition: Condition,
    pub action: Action,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts_with: Vec<String>,
    /// 未识别的扩展字段，原样保留
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BusinessRule {
    pub fn new(
        name: impl Into<String>,
        rule_type: RuleType,
        condition: Condition,
        action: Action,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            rule_type,
            severity: Severity::default(),
            scope: RuleScope::default(),
            target: RuleTarget::default(),
            trigger: Trigger::default(),
            enabled: true,
            priority: 0,
            condition,
            action,
            tags: BTreeSet::new(),
            version: 1,
            created_at: now,
            updated_at: now,
            created_by: None,
            depends_on: Vec::new(),
            conflicts_with: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_scope(mut self, scope: RuleScope, target: RuleTarget) -> Self {
        self.scope = scope;
        self.target = target;
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn depends_on(mut self, rule_id: impl Into<String>) -> Self {
        self.depends_on.push(rule_id.into());
        self
    }

    pub fn conflicts_with(mut self, rule_id: impl Into<String>) -> Self {
        self.conflicts_with.push(rule_id.into());
        self
    }

    /// 规则动作的说明文字，缺省时使用规则名称
    pub fn action_message(&self) -> String {
        self.action
            .message
            .clone()
            .unwrap_or_else(|| format!("规则 '{}' 触发", self.name))
    }
}

/// 规则查询过滤器，各条件之间为 AND 关系
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleFilter {
    pub rule_type: Option<RuleType>,
    pub severity: Option<Severity>,
    pub scope: Option<RuleScope>,
    pub trigger: Option<Trigger>,
    pub enabled: Option<bool>,
    /// 规则必须包含全部这些标签
    pub tags: Vec<String>,
}

impl RuleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule_type(mut self, rule_type: RuleType) -> Self {
        self.rule_type = Some(rule_type);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn scope(mut self, scope: RuleScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn matches(&self, rule: &BusinessRule) -> bool {
        self.rule_type.is_none_or(|t| rule.rule_type == t)
            && self.severity.is_none_or(|s| rule.severity == s)
            && self.scope.is_none_or(|s| rule.scope == s)
            && self.trigger.is_none_or(|t| rule.trigger == t)
            && self.enabled.is_none_or(|e| rule.enabled == e)
            && self.tags.iter().all(|tag| rule.tags.contains(tag))
    }
}

/// 规则部分更新，仅允许修改以下字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub action: Option<Action>,
}

impl RulePatch {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }

    pub fn priority(priority: i32) -> Self {
        Self {
            priority: Some(priority),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// 合并到规则上，不触碰 id 和时间戳等标识字段
    pub fn apply_to(self, rule: &mut BusinessRule) {
        if let Some(name) = self.name {
            rule.name = name;
        }
        if let Some(description) = self.description {
            rule.description = description;
        }
        if let Some(enabled) = self.enabled {
            rule.enabled = enabled;
        }
        if let Some(priority) = self.priority {
            rule.priority = priority;
        }
        if let Some(severity) = self.severity {
            rule.severity = severity;
        }
        if let Some(tags) = self.tags {
            rule.tags = tags;
        }
        if let Some(condition) = self.condition {
            rule.condition = condition;
        }
        if let Some(action) = self.action {
            rule.action = action;
        }
    }
}

/// 单条规则的评估结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub rule_id: String,
    pub rule_name: String,
    pub passed: bool,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    pub execution_time_ms: i64,
}

impl EvaluationResult {
    pub fn new(rule: &BusinessRule) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            passed: false,
            severity: rule.severity,
            message: None,
            action: None,
            execution_time_ms: 0,
        }
    }
}

/// 评估统计信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub rules_evaluated: usize,
    pub rules_passed: usize,
    pub rules_failed: usize,
    pub rules_blocked: usize,
    pub execution_time_ms: i64,
    pub ruleset_version: u64,
    pub trigger: Trigger,
    #[serde(default)]
    pub timed_out: bool,
}

/// 一次评估调用的聚合响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineResponse {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_query: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub results: Vec<EvaluationResult>,
    pub metadata: ResponseMetadata,
}

impl EngineResponse {
    pub fn new(trigger: Trigger, ruleset_version: u64) -> Self {
        Self {
            allowed: true,
            modified_query: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            results: Vec::new(),
            metadata: ResponseMetadata {
                trigger,
                ruleset_version,
                ..Default::default()
            },
        }
    }
}
