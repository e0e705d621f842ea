//! 规则校验
//!
//! 规则进入存储前的结构校验和规则引用图检查。表达式文本的语法
//! 不在这里检查，格式错误的表达式在评估时作为该规则的评估错误报告。

use crate::error::{Result, RuleError};
use crate::models::{BusinessRule, Condition};
use crate::operators::LogicalOperator;
use regex::RegexBuilder;
use std::collections::{HashMap, HashSet};

/// 规则校验器
pub struct RuleCompiler;

impl RuleCompiler {
    /// 验证单条规则的结构
    pub fn validate_rule(rule: &BusinessRule) -> Result<()> {
        if rule.id.trim().is_empty() {
            return Err(RuleError::Validation("规则 ID 不能为空".to_string()));
        }

        if rule.name.trim().is_empty() {
            return Err(RuleError::Validation(format!(
                "规则 '{}' 的名称不能为空",
                rule.id
            )));
        }

        Self::validate_condition(&rule.condition, "condition")
            .map_err(|e| RuleError::Validation(format!("规则 '{}': {}", rule.id, e)))
    }

    fn validate_condition(condition: &Condition, path: &str) -> std::result::Result<(), String> {
        match condition {
            Condition::Expression { expression } => {
                if expression.trim().is_empty() {
                    return Err(format!("条件 '{}' 的表达式不能为空", path));
                }
            }
            Condition::Pattern {
                pattern,
                case_sensitive,
            } => {
                RegexBuilder::new(pattern)
                    .case_insensitive(!case_sensitive)
                    .build()
                    .map_err(|e| format!("条件 '{}' 的正则模式无效: {}", path, e))?;
            }
            Condition::Function { name, .. } => {
                if name.trim().is_empty() {
                    return Err(format!("条件 '{}' 的函数名不能为空", path));
                }
            }
            Condition::Composite {
                operator,
                conditions,
            } => {
                if conditions.is_empty() {
                    return Err(format!("逻辑组 '{}' 不能为空", path));
                }

                if *operator == LogicalOperator::Not && conditions.len() != 1 {
                    return Err(format!(
                        "逻辑组 '{}' 的 NOT 需要恰好 1 个子条件，当前有 {} 个",
                        path,
                        conditions.len()
                    ));
                }

                for (i, child) in conditions.iter().enumerate() {
                    let child_path = format!("{}.conditions[{}]", path, i);
                    Self::validate_condition(child, &child_path)?;
                }
            }
            Condition::RuleRef { rule_id } => {
                if rule_id.trim().is_empty() {
                    return Err(format!("条件 '{}' 引用的规则 ID 不能为空", path));
                }
            }
        }

        Ok(())
    }

    /// 检查规则引用图无环
    ///
    /// 悬空引用不在这里报错，由 `relation_warnings` 作为提示报告。
    pub fn check_references<'a, I>(rules: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a BusinessRule>,
    {
        let graph: HashMap<&str, Vec<&str>> = rules
            .into_iter()
            .map(|r| (r.id.as_str(), r.condition.referenced_rules()))
            .collect();

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();

        // 迭代式 DFS，栈元素为 (节点, 下一个待访问邻居下标)
        let mut ids: Vec<&str> = graph.keys().copied().collect();
        ids.sort_unstable();

        for start in ids {
            if marks.contains_key(start) {
                continue;
            }

            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            marks.insert(start, Mark::Visiting);

            while let Some((node, next)) = stack.pop() {
                let edges = graph.get(node).map(Vec::as_slice).unwrap_or(&[]);

                let Some(&target) = edges.get(next) else {
                    marks.insert(node, Mark::Done);
                    continue;
                };
                stack.push((node, next + 1));

                if !graph.contains_key(target) {
                    continue;
                }

                match marks.get(target) {
                    Some(Mark::Visiting) => {
                        let mut cycle: Vec<&str> = stack
                            .iter()
                            .map(|(id, _)| *id)
                            .skip_while(|id| *id != target)
                            .collect();
                        cycle.push(target);
                        return Err(RuleError::Validation(format!(
                            "规则引用存在循环: {}",
                            cycle.join(" -> ")
                        )));
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(target, Mark::Visiting);
                        stack.push((target, 0));
                    }
                }
            }
        }

        Ok(())
    }

    /// 校验规则之间的关系，返回提示信息（不阻止加载）
    pub fn relation_warnings<'a, I>(rules: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a BusinessRule>,
    {
        let rules: Vec<&BusinessRule> = rules.into_iter().collect();
        let by_id: HashMap<&str, &BusinessRule> =
            rules.iter().map(|r| (r.id.as_str(), *r)).collect();

        let mut warnings = Vec::new();
        let mut reported_pairs: HashSet<(&str, &str)> = HashSet::new();

        for rule in &rules {
            for dep in &rule.depends_on {
                match by_id.get(dep.as_str()) {
                    None => warnings.push(format!(
                        "规则 '{}' 依赖的规则 '{}' 不存在",
                        rule.id, dep
                    )),
                    Some(target) if !target.enabled && rule.enabled => warnings.push(format!(
                        "规则 '{}' 依赖的规则 '{}' 已禁用",
                        rule.id, dep
                    )),
                    Some(_) => {}
                }
            }

            for other in &rule.conflicts_with {
                let Some(target) = by_id.get(other.as_str()) else {
                    continue;
                };
                let pair = if rule.id.as_str() < other.as_str() {
                    (rule.id.as_str(), other.as_str())
                } else {
                    (other.as_str(), rule.id.as_str())
                };
                if rule.enabled && target.enabled && reported_pairs.insert(pair) {
                    warnings.push(format!(
                        "互斥规则 '{}' 与 '{}' 同时启用",
                        pair.0, pair.1
                    ));
                }
            }

            for referenced in rule.condition.referenced_rules() {
                if !by_id.contains_key(referenced) {
                    warnings.push(format!(
                        "规则 '{}' 引用的规则 '{}' 不存在",
                        rule.id, referenced
                    ));
                }
            }
        }

        warnings
    }
}
