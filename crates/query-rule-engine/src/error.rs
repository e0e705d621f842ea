//! 规则引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("规则校验失败: {0}")]
    Validation(String),

    #[error("规则未找到: {0}")]
    NotFound(String),

    #[error("规则 ID 已存在: {0}")]
    DuplicateId(String),

    #[error("规则 {rule_id} 评估失败: {message}")]
    RuleEvaluation { rule_id: String, message: String },

    #[error("条件函数未注册: {0}")]
    FunctionNotRegistered(String),

    #[error("表达式语法错误 (位置 {position}): {message}")]
    ExpressionSyntax { position: usize, message: String },

    #[error("规则文档无效: {0}")]
    Configuration(String),

    #[error("规则评估超时: 已用 {elapsed_ms}ms, 上限 {timeout_ms}ms")]
    Timeout { elapsed_ms: i64, timeout_ms: u64 },

    #[error("规则持久化失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RuleError>;

impl RuleError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::DuplicateId(_) => "DUPLICATE_ID",
            Self::RuleEvaluation { .. } => "RULE_EVALUATION_ERROR",
            Self::FunctionNotRegistered(_) => "FUNCTION_NOT_REGISTERED",
            Self::ExpressionSyntax { .. } => "EXPRESSION_SYNTAX_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Io(_) => "IO_ERROR",
            Self::JsonError(_) => "JSON_ERROR",
        }
    }

    /// 将评估阶段的底层错误包装为带规则 ID 的评估错误
    pub fn for_rule(self, rule_id: &str) -> Self {
        match self {
            Self::RuleEvaluation { .. } | Self::FunctionNotRegistered(_) => self,
            other => Self::RuleEvaluation {
                rule_id: rule_id.to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(RuleError::NotFound("r1".into()).code(), "NOT_FOUND");
        assert_eq!(
            RuleError::Timeout {
                elapsed_ms: 10,
                timeout_ms: 5
            }
            .code(),
            "TIMEOUT"
        );
    }

    #[test]
    fn test_for_rule_wraps_syntax_error() {
        let err = RuleError::ExpressionSyntax {
            position: 3,
            message: "意外的符号".to_string(),
        }
        .for_rule("rule-001");

        match err {
            RuleError::RuleEvaluation { rule_id, message } => {
                assert_eq!(rule_id, "rule-001");
                assert!(message.contains("意外的符号"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_for_rule_keeps_unregistered_function() {
        let err = RuleError::FunctionNotRegistered("nope".into()).for_rule("rule-001");
        assert!(matches!(err, RuleError::FunctionNotRegistered(_)));
    }
}
