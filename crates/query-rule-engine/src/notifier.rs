//! 规则通知
//!
//! log/notify 动作在裁决完成后依次执行，失败只记录日志，不影响评估结果。

use crate::error::Result;
use crate::models::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 审计日志的 tracing target
pub const AUDIT_TARGET: &str = "rule_audit";

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Log,
    Notify,
}

/// 规则触发时产生的通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleNotification {
    pub kind: NotificationKind,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub message: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// 通知发送器
#[cfg_attr(test, mockall::automock)]
pub trait RuleNotifier: Send + Sync {
    fn notify(&self, notification: &RuleNotification) -> Result<()>;
}

/// 默认实现：输出到 tracing 审计目标
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl RuleNotifier for TracingNotifier {
    fn notify(&self, n: &RuleNotification) -> Result<()> {
        info!(
            target: AUDIT_TARGET,
            rule_id = %n.rule_id,
            rule_name = %n.rule_name,
            severity = %n.severity,
            channel = n.channel.as_deref().unwrap_or("default"),
            user_id = n.user_id.as_deref().unwrap_or("-"),
            "规则通知: {}",
            n.message
        );
        Ok(())
    }
}

/// 依次执行通知，单个失败不影响后续
pub fn dispatch(notifier: &dyn RuleNotifier, notifications: &[RuleNotification]) {
    for n in notifications {
        match n.kind {
            NotificationKind::Log => {
                info!(
                    target: AUDIT_TARGET,
                    rule_id = %n.rule_id,
                    rule_name = %n.rule_name,
                    severity = %n.severity,
                    user_id = n.user_id.as_deref().unwrap_or("-"),
                    query = %n.query,
                    "{}",
                    n.message
                );
            }
            NotificationKind::Notify => {
                if let Err(e) = notifier.notify(n) {
                    warn!(rule_id = %n.rule_id, error = %e, "规则通知发送失败");
                }
            }
        }
    }
}
