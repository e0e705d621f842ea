//! 动作裁决
//!
//! 将通过的规则按优先级顺序折算为最终裁决：拒绝优先于允许，改写片段按
//! 顺序组合，log/notify 只产生延迟执行的通知。

use crate::context::{names_match, ExecutionContext};
use crate::models::{ActionKind, BusinessRule, QueryRewrite, RuleTarget, Severity};
use crate::notifier::{NotificationKind, RuleNotification};
use crate::rewrite::QueryRewriter;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

/// 裁决结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    pub allowed: bool,
    pub modified_query: Option<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// 触发阻断的规则数
    pub blocked: usize,
    /// 待执行的 log/notify 通知
    pub notifications: Vec<RuleNotification>,
}

/// 动作裁决器
pub struct ActionResolver;

impl ActionResolver {
    /// 规则通过时是否阻断查询
    ///
    /// deny 动作总是阻断；block 级别的规则只要动作不是 allow 或改写也阻断。
    pub fn is_blocking(rule: &BusinessRule) -> bool {
        match rule.action.kind {
            ActionKind::Deny => true,
            ActionKind::Allow | ActionKind::Modify { .. } | ActionKind::Transform { .. } => false,
            ActionKind::Log | ActionKind::Notify { .. } => rule.severity == Severity::Block,
        }
    }

    /// 裁决通过的规则
    ///
    /// # Arguments
    /// * `context` - 查询上下文，改写以 `context.query` 为起点
    /// * `passed` - 通过的规则，已按优先级降序排列
    /// * `selected` - 本次选中的全部规则 ID，用于检查 `dependsOn`
    /// * `now` - 通知时间戳
    pub fn resolve(
        context: &ExecutionContext,
        passed: &[&BusinessRule],
        selected: &HashSet<&str>,
        now: DateTime<Utc>,
    ) -> Resolution {
        let mut resolution = Resolution {
            allowed: true,
            ..Default::default()
        };

        let mut rewrites: Vec<&QueryRewrite> = Vec::new();
        let mut allows: Vec<&BusinessRule> = Vec::new();
        let mut denies: Vec<&BusinessRule> = Vec::new();

        for &rule in passed {
            if Self::is_blocking(rule) {
                resolution.allowed = false;
                resolution.blocked += 1;
                resolution.errors.push(rule.action_message());
                denies.push(rule);
            }

            match &rule.action.kind {
                ActionKind::Allow => allows.push(rule),
                ActionKind::Deny => {}
                ActionKind::Modify { rewrite } | ActionKind::Transform { rewrite } => {
                    rewrites.push(rewrite);
                }
                ActionKind::Log => {
                    Self::push_notification(
                        &mut resolution,
                        context,
                        rule,
                        NotificationKind::Log,
                        None,
                        now,
                    );
                }
                ActionKind::Notify { channel } => {
                    Self::push_notification(
                        &mut resolution,
                        context,
                        rule,
                        NotificationKind::Notify,
                        channel.clone(),
                        now,
                    );
                }
            }
        }

        if !rewrites.is_empty() {
            resolution.modified_query =
                Some(QueryRewriter::compose(&context.query, rewrites.iter().copied()));
        }

        // 拒绝优先：被覆盖的允许规则作为提示报告
        for allow in &allows {
            if let Some(deny) = denies
                .iter()
                .find(|deny| targets_overlap(&allow.target, &deny.target))
            {
                resolution.warnings.push(format!(
                    "允许规则 '{}' 被拒绝规则 '{}' 覆盖",
                    allow.name, deny.name
                ));
            }
        }

        Self::check_relations(&mut resolution, passed, selected);

        debug!(
            allowed = resolution.allowed,
            blocked = resolution.blocked,
            rewrites = rewrites.len(),
            notifications = resolution.notifications.len(),
            "动作裁决完成"
        );

        resolution
    }

    fn push_notification(
        resolution: &mut Resolution,
        context: &ExecutionContext,
        rule: &BusinessRule,
        kind: NotificationKind,
        channel: Option<String>,
        now: DateTime<Utc>,
    ) {
        let message = rule.action_message();
        if rule.severity >= Severity::Warning {
            resolution.warnings.push(message.clone());
        }

        resolution.notifications.push(RuleNotification {
            kind,
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            channel,
            message,
            query: context.query.clone(),
            user_id: context.user.as_ref().and_then(|u| u.id.clone()),
            timestamp: now,
        });
    }

    /// 检查 conflictsWith / dependsOn（只产生提示）
    fn check_relations(resolution: &mut Resolution, passed: &[&BusinessRule], selected: &HashSet<&str>) {
        let passed_ids: HashSet<&str> = passed.iter().map(|r| r.id.as_str()).collect();
        let mut reported: HashSet<(&str, &str)> = HashSet::new();

        for &rule in passed {
            for other in &rule.conflicts_with {
                if !passed_ids.contains(other.as_str()) {
                    continue;
                }
                let pair = if rule.id.as_str() < other.as_str() {
                    (rule.id.as_str(), other.as_str())
                } else {
                    (other.as_str(), rule.id.as_str())
                };
                if reported.insert(pair) {
                    resolution.warnings.push(format!(
                        "互斥规则 '{}' 与 '{}' 同时触发",
                        pair.0, pair.1
                    ));
                }
            }

            for dep in &rule.depends_on {
                if !selected.contains(dep.as_str()) {
                    resolution.warnings.push(format!(
                        "规则 '{}' 依赖的规则 '{}' 未参与本次评估",
                        rule.id, dep
                    ));
                }
            }
        }
    }
}

/// 两个目标是否有交集，空目标视为覆盖全部
fn targets_overlap(a: &RuleTarget, b: &RuleTarget) -> bool {
    let unbounded = |t: &RuleTarget| t.tables.is_empty() && t.columns.is_empty();
    if unbounded(a) || unbounded(b) {
        return true;
    }

    let any_match = |xs: &[String], ys: &[String]| {
        xs.iter().any(|x| ys.iter().any(|y| names_match(x, y)))
    };
    any_match(&a.tables, &b.tables) || any_match(&a.columns, &b.columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::UserContext;
    use crate::models::{Action, Condition, RuleScope, RuleType};

    fn create_test_context() -> ExecutionContext {
        ExecutionContext::from_query("SELECT * FROM users")
            .with_user(UserContext::new("u-1", "analyst"))
    }

    fn rule(id: &str, action: Action) -> BusinessRule {
        BusinessRule::new(id, RuleType::AccessPolicy, Condition::expression("true"), action)
            .with_id(id)
    }

    fn resolve(rules: &[BusinessRule]) -> Resolution {
        let passed: Vec<&BusinessRule> = rules.iter().collect();
        let selected: HashSet<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        ActionResolver::resolve(&create_test_context(), &passed, &selected, Utc::now())
    }

    #[test]
    fn test_is_blocking() {
        assert!(ActionResolver::is_blocking(&rule("r", Action::deny("no"))));
        assert!(!ActionResolver::is_blocking(&rule("r", Action::allow()).with_severity(Severity::Block)));
        assert!(ActionResolver::is_blocking(&rule("r", Action::log("x")).with_severity(Severity::Block)));
        assert!(!ActionResolver::is_blocking(
            &rule("r", Action::modify(QueryRewrite::Limit { max: 10 })).with_severity(Severity::Block)
        ));
        assert!(!ActionResolver::is_blocking(&rule("r", Action::log("x"))));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let rules = vec![
            rule("allow-all", Action::allow()).with_priority(1000),
            rule("deny-1", Action::deny("禁止访问 users")).with_priority(10),
            rule("deny-2", Action::deny("超出访问时段")).with_priority(5),
        ];

        let resolution = resolve(&rules);
        assert!(!resolution.allowed);
        assert_eq!(resolution.blocked, 2);
        assert_eq!(resolution.errors, vec!["禁止访问 users", "超出访问时段"]);
        assert!(resolution.warnings.iter().any(|w| w.contains("allow-all")));
    }

    #[test]
    fn test_allow_on_disjoint_tables_not_reported() {
        let rules = vec![
            rule("allow-orders", Action::allow())
                .with_scope(RuleScope::Table, RuleTarget::tables(["orders"])),
            rule("deny-users", Action::deny("no"))
                .with_scope(RuleScope::Table, RuleTarget::tables(["users"])),
        ];

        let resolution = resolve(&rules);
        assert!(!resolution.allowed);
        assert!(resolution.warnings.is_empty());
    }

    #[test]
    fn test_rewrites_compose_in_order() {
        let rules = vec![
            rule("limit", Action::modify(QueryRewrite::Limit { max: 100 })),
            rule(
                "filter",
                Action::transform(QueryRewrite::AddFilter {
                    clause: "tenant_id = 7".to_string(),
                }),
            ),
        ];

        let resolution = resolve(&rules);
        assert!(resolution.allowed);
        assert_eq!(
            resolution.modified_query.as_deref(),
            Some("SELECT * FROM users WHERE tenant_id = 7 LIMIT 100")
        );
    }

    #[test]
    fn test_log_and_notify_are_deferred() {
        let rules = vec![
            rule("audit", Action::log("访问 users 表")).with_severity(Severity::Info),
            rule("alert", Action::notify(Some("security".to_string()), "敏感查询"))
                .with_severity(Severity::Warning),
        ];

        let resolution = resolve(&rules);
        assert!(resolution.allowed);
        assert_eq!(resolution.notifications.len(), 2);
        assert_eq!(resolution.notifications[0].kind, NotificationKind::Log);
        assert_eq!(resolution.notifications[1].channel.as_deref(), Some("security"));
        assert_eq!(resolution.notifications[1].user_id.as_deref(), Some("u-1"));
        // 只有 warning 及以上级别进入 warnings
        assert_eq!(resolution.warnings, vec!["敏感查询"]);
    }

    #[test]
    fn test_relation_warnings() {
        let rules = vec![
            rule("a", Action::log("a")).with_severity(Severity::Info).conflicts_with("b"),
            rule("b", Action::log("b")).with_severity(Severity::Info).conflicts_with("a"),
            rule("c", Action::allow()).depends_on("absent"),
        ];

        let resolution = resolve(&rules);
        assert_eq!(resolution.warnings.len(), 2, "{:?}", resolution.warnings);
        assert!(resolution.warnings[0].contains("'a' 与 'b'"));
        assert!(resolution.warnings[1].contains("'absent'"));
    }

    #[test]
    fn test_empty_passed() {
        let resolution = resolve(&[]);
        assert!(resolution.allowed);
        assert!(resolution.modified_query.is_none());
        assert!(resolution.errors.is_empty());
    }
}
