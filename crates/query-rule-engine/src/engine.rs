//! 规则引擎
//!
//! 单次评估依次经过：选择适用规则、按优先级评估条件、裁决动作、汇总响应。
//! 调用之间不保留任何状态，同一规则集和上下文的评估结果相同。

use crate::action::ActionResolver;
use crate::clock::Clock;
use crate::context::ExecutionContext;
use crate::error::{Result, RuleError};
use crate::evaluator::ConditionEvaluator;
use crate::functions::FunctionRegistry;
use crate::models::{
    BusinessRule, EngineResponse, EvaluationResult, RuleFilter, RulePatch, RuleScope, Severity,
    Trigger,
};
use crate::notifier::{self, RuleNotifier, TracingNotifier};
use crate::store::{RuleSet, RuleStore};
use chrono::Duration;
use semlayer_shared::config::EngineConfig;
use semlayer_shared::observability::metrics as engine_metrics;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// 规则引擎
///
/// 持有规则存储句柄，评估时每次调用只加载一次快照。
/// 可以廉价 clone，在多个任务间并发使用。
#[derive(Clone)]
pub struct RuleEngine {
    store: RuleStore,
    evaluator: ConditionEvaluator,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn RuleNotifier>,
}

impl RuleEngine {
    /// 使用内置条件函数和 tracing 通知器创建引擎，时钟取自规则存储
    pub fn new(store: RuleStore, config: EngineConfig) -> Self {
        let clock = store.clock().clone();
        Self {
            store,
            evaluator: ConditionEvaluator::new(FunctionRegistry::new()),
            config: Arc::new(config),
            clock,
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.evaluator = ConditionEvaluator::new(functions);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn RuleNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &RuleStore {
        &self.store
    }

    pub fn functions(&self) -> &FunctionRegistry {
        self.evaluator.functions()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // 规则管理（委托给 RuleStore）
    // ========================================================================

    pub fn add_rule(&self, rule: BusinessRule) -> Result<String> {
        self.store.add_rule(rule)
    }

    pub fn remove_rule(&self, rule_id: &str) -> Result<BusinessRule> {
        self.store.remove_rule(rule_id)
    }

    pub fn update_rule(&self, rule_id: &str, patch: RulePatch) -> Result<BusinessRule> {
        self.store.update_rule(rule_id, patch)
    }

    pub fn get_rules(&self, filter: &RuleFilter) -> Vec<Arc<BusinessRule>> {
        self.store.get_rules(filter)
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<Arc<BusinessRule>> {
        self.store.get_rule(rule_id)
    }

    // ========================================================================
    // 评估
    // ========================================================================

    /// 查询执行前评估
    pub fn evaluate_query(&self, context: &ExecutionContext) -> EngineResponse {
        self.evaluate(context, Trigger::BeforeQuery)
    }

    /// 按触发时机评估查询上下文
    ///
    /// 单条规则的评估失败只记录在该规则的结果中，不会中断整批评估。
    #[instrument(
        skip(self, context),
        fields(trigger = %trigger, query_type = %context.query_type)
    )]
    pub fn evaluate(&self, context: &ExecutionContext, trigger: Trigger) -> EngineResponse {
        let started = self.clock.now();
        let snapshot = self.store.snapshot();
        let mut response = EngineResponse::new(trigger, snapshot.version());

        let mut candidates = Self::select_rules(&snapshot, context, trigger);
        let max_rules = self.config.max_rules_per_query;
        if candidates.len() > max_rules {
            warn!(matched = candidates.len(), max_rules, "适用规则超过上限，已截断");
            response.warnings.push(format!(
                "适用规则 {} 条，超过单次上限 {}，其余规则未评估",
                candidates.len(),
                max_rules
            ));
            candidates.truncate(max_rules);
        }

        let selected: HashSet<&str> = candidates.iter().map(|r| r.id.as_str()).collect();
        let timeout =
            Duration::milliseconds(i64::try_from(self.config.timeout_ms).unwrap_or(i64::MAX));
        let mut passed: Vec<&BusinessRule> = Vec::new();
        let mut evaluation_failed = false;
        let mut timed_out = false;

        for rule in &candidates {
            let rule_started = self.clock.now();
            let elapsed = rule_started - started;
            if self.config.timeout_ms > 0 && elapsed > timeout {
                let error = RuleError::Timeout {
                    elapsed_ms: elapsed.num_milliseconds(),
                    timeout_ms: self.config.timeout_ms,
                };
                warn!(
                    evaluated = response.results.len(),
                    remaining = candidates.len() - response.results.len(),
                    "{}",
                    error
                );
                engine_metrics::record_rule_error(error.code());
                response.errors.push(error.to_string());
                timed_out = true;
                break;
            }

            let mut result = EvaluationResult::new(rule);
            match self
                .evaluator
                .evaluate(&rule.condition, context, snapshot.as_ref())
                .map_err(|e| e.for_rule(&rule.id))
            {
                Ok(true) => {
                    result.passed = true;
                    result.message = Some(rule.action_message());
                    result.action = Some(rule.action.clone());
                    passed.push(rule.as_ref());
                }
                Ok(false) => {}
                Err(e @ RuleError::FunctionNotRegistered(_)) => {
                    warn!(rule_id = %rule.id, "规则条件函数未注册: {}", e);
                    engine_metrics::record_rule_error(e.code());
                    let message = format!("规则 '{}' 未评估: {}", rule.name, e);
                    result.message = Some(message.clone());
                    response.warnings.push(message);
                }
                Err(e) => {
                    warn!(rule_id = %rule.id, "规则评估失败: {}", e);
                    engine_metrics::record_rule_error(e.code());
                    result.severity = result.severity.max(Severity::Error);
                    result.message = Some(e.to_string());
                    response.errors.push(e.to_string());
                    evaluation_failed = true;
                }
            }

            result.execution_time_ms = (self.clock.now() - rule_started).num_milliseconds();
            response.results.push(result);
        }

        let resolution = ActionResolver::resolve(context, &passed, &selected, self.clock.now());

        response.allowed = resolution.allowed
            && !timed_out
            && !(evaluation_failed && self.config.fail_closed_on_error);
        response.modified_query = resolution.modified_query;
        response.errors.extend(resolution.errors);
        response.warnings.extend(resolution.warnings);

        let evaluated = response.results.len();
        response.metadata.rules_evaluated = evaluated;
        response.metadata.rules_passed = passed.len();
        response.metadata.rules_failed = evaluated - passed.len();
        response.metadata.rules_blocked = resolution.blocked;
        response.metadata.timed_out = timed_out;

        // 副作用在裁决完成后依次执行
        notifier::dispatch(self.notifier.as_ref(), &resolution.notifications);

        let elapsed = self.clock.now() - started;
        response.metadata.execution_time_ms = elapsed.num_milliseconds();

        engine_metrics::record_query_evaluation(
            &trigger.to_string(),
            response.allowed,
            timed_out,
            elapsed.to_std().map(|d| d.as_secs_f64()).unwrap_or_default(),
        );

        if response.allowed {
            debug!(
                evaluated,
                passed = response.metadata.rules_passed,
                modified = response.modified_query.is_some(),
                "查询评估通过"
            );
        } else {
            info!(
                evaluated,
                blocked = response.metadata.rules_blocked,
                timed_out,
                "查询被规则拒绝"
            );
        }

        response
    }

    /// 选择适用规则：已启用、触发时机一致、作用范围匹配，按优先级降序
    ///
    /// 排序是稳定的，同优先级保持插入顺序。
    pub fn select_rules(
        snapshot: &RuleSet,
        context: &ExecutionContext,
        trigger: Trigger,
    ) -> Vec<Arc<BusinessRule>> {
        let mut rules: Vec<Arc<BusinessRule>> = snapshot
            .rules()
            .iter()
            .filter(|r| r.enabled && r.trigger == trigger && scope_matches(r, context))
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        rules
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish()
    }
}

/// 作用范围匹配
///
/// 空目标表示不限定；非全局规则指定了数据库时，上下文数据库必须一致。
fn scope_matches(rule: &BusinessRule, context: &ExecutionContext) -> bool {
    let target = &rule.target;
    if rule.scope == RuleScope::Global {
        return true;
    }

    if let Some(database) = &target.database {
        match &context.database {
            Some(current) if current.eq_ignore_ascii_case(database) => {}
            _ => return false,
        }
    }

    match rule.scope {
        RuleScope::Global | RuleScope::Database => true,
        RuleScope::Table => {
            target.tables.is_empty() || target.tables.iter().any(|t| context.touches_table(t))
        }
        RuleScope::Column => {
            target.columns.is_empty() || target.columns.iter().any(|c| context.touches_column(c))
        }
        RuleScope::Relationship => {
            if context.tables.len() < 2 {
                return false;
            }
            target.tables.is_empty()
                || target.tables.iter().filter(|t| context.touches_table(t)).count() >= 2
        }
    }
}
