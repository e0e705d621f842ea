//! 条件评估器
//!
//! 递归评估规则条件树：表达式、正则模式、注册函数、逻辑组合和规则引用。
//! 解析后的表达式和编译后的正则按原文缓存，跨评估调用复用。

use crate::context::ExecutionContext;
use crate::error::{Result, RuleError};
use crate::expression::Expression;
use crate::functions::FunctionRegistry;
use crate::models::{BusinessRule, Condition};
use crate::operators::LogicalOperator;
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// 按 ID 查找规则，用于展开 `rule_ref` 条件
pub trait RuleResolver {
    fn resolve(&self, rule_id: &str) -> Option<&BusinessRule>;
}

impl RuleResolver for Vec<BusinessRule> {
    fn resolve(&self, rule_id: &str) -> Option<&BusinessRule> {
        self.iter().find(|r| r.id == rule_id)
    }
}

impl RuleResolver for HashMap<String, Arc<BusinessRule>> {
    fn resolve(&self, rule_id: &str) -> Option<&BusinessRule> {
        self.get(rule_id).map(|r| r.as_ref())
    }
}

/// 条件评估器
#[derive(Debug, Clone)]
pub struct ConditionEvaluator {
    functions: FunctionRegistry,
    expressions: Arc<DashMap<String, Arc<Expression>>>,
    patterns: Arc<DashMap<(String, bool), Arc<Regex>>>,
}

impl ConditionEvaluator {
    pub fn new(functions: FunctionRegistry) -> Self {
        Self {
            functions,
            expressions: Arc::new(DashMap::new()),
            patterns: Arc::new(DashMap::new()),
        }
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// 评估条件
    ///
    /// # Arguments
    /// * `condition` - 规则条件树
    /// * `context` - 查询执行上下文
    /// * `resolver` - 当前规则集，用于展开规则引用
    pub fn evaluate(
        &self,
        condition: &Condition,
        context: &ExecutionContext,
        resolver: &dyn RuleResolver,
    ) -> Result<bool> {
        let mut expanding = Vec::new();
        self.evaluate_at(condition, context, resolver, &mut expanding)
    }

    fn evaluate_at(
        &self,
        condition: &Condition,
        context: &ExecutionContext,
        resolver: &dyn RuleResolver,
        expanding: &mut Vec<String>,
    ) -> Result<bool> {
        match condition {
            Condition::Expression { expression } => {
                Ok(self.expression(expression)?.evaluate(context))
            }
            Condition::Pattern {
                pattern,
                case_sensitive,
            } => Ok(self.pattern(pattern, *case_sensitive)?.is_match(&context.query)),
            Condition::Function { name, params } => self.functions.call(name, context, params),
            Condition::Composite {
                operator,
                conditions,
            } => self.evaluate_composite(*operator, conditions, context, resolver, expanding),
            Condition::RuleRef { rule_id } => {
                // 存储层拒绝引用环，这里只防御未经校验的规则集
                if expanding.contains(rule_id) {
                    return Err(RuleError::Configuration(format!(
                        "规则引用成环: {} -> {}",
                        expanding.join(" -> "),
                        rule_id
                    )));
                }

                let referenced = resolver
                    .resolve(rule_id)
                    .ok_or_else(|| RuleError::NotFound(rule_id.clone()))?;
                trace!(rule_id = %rule_id, "展开规则引用");

                expanding.push(rule_id.clone());
                let result = self.evaluate_at(&referenced.condition, context, resolver, expanding);
                expanding.pop();
                result
            }
        }
    }

    /// 评估逻辑组合（短路求值）
    fn evaluate_composite(
        &self,
        operator: LogicalOperator,
        conditions: &[Condition],
        context: &ExecutionContext,
        resolver: &dyn RuleResolver,
        expanding: &mut Vec<String>,
    ) -> Result<bool> {
        match operator {
            LogicalOperator::And => {
                for child in conditions {
                    if !self.evaluate_at(child, context, resolver, expanding)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            LogicalOperator::Or => {
                for child in conditions {
                    if self.evaluate_at(child, context, resolver, expanding)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            LogicalOperator::Not => match conditions {
                [child] => Ok(!self.evaluate_at(child, context, resolver, expanding)?),
                _ => Err(RuleError::Validation(format!(
                    "NOT 组合需要恰好 1 个子条件，当前有 {} 个",
                    conditions.len()
                ))),
            },
        }
    }

    /// 获取（或解析并缓存）表达式
    pub fn expression(&self, source: &str) -> Result<Arc<Expression>> {
        if let Some(cached) = self.expressions.get(source) {
            return Ok(Arc::clone(cached.value()));
        }

        let parsed = Arc::new(Expression::parse(source)?);
        self.expressions
            .insert(source.to_string(), Arc::clone(&parsed));
        Ok(parsed)
    }

    /// 获取（或编译并缓存）正则
    pub fn pattern(&self, pattern: &str, case_sensitive: bool) -> Result<Arc<Regex>> {
        let key = (pattern.to_string(), case_sensitive);
        if let Some(cached) = self.patterns.get(&key) {
            return Ok(Arc::clone(cached.value()));
        }

        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| RuleError::Validation(format!("无效的正则模式 '{}': {}", pattern, e)))?;
        let regex = Arc::new(regex);
        self.patterns.insert(key, Arc::clone(&regex));
        Ok(regex)
    }

    /// 清空解析缓存（规则集整体替换后调用）
    pub fn clear_caches(&self) {
        self.expressions.clear();
        self.patterns.clear();
    }

    pub fn cached_expressions(&self) -> usize {
        self.expressions.len()
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new(FunctionRegistry::new())
    }
}
