//! 条件函数注册表
//!
//! `function` 类型的条件按名称查找预注册的函数。函数只读上下文和参数，
//! 必须是纯函数；未注册的名称在评估时报告为 `FunctionNotRegistered`。

use crate::context::{ExecutionContext, QueryType};
use crate::error::{Result, RuleError};
use dashmap::DashMap;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// 条件函数签名
pub type ConditionFn = Arc<dyn Fn(&ExecutionContext, &Map<String, Value>) -> Result<bool> + Send + Sync>;

static LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:LIMIT|FETCH\s+FIRST|TOP)\b").expect("limit pattern is valid"));

static WHERE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").expect("where pattern is valid"));

/// 条件函数注册表
#[derive(Clone)]
pub struct FunctionRegistry {
    functions: Arc<DashMap<String, ConditionFn>>,
}

impl FunctionRegistry {
    /// 创建空注册表
    pub fn empty() -> Self {
        Self {
            functions: Arc::new(DashMap::new()),
        }
    }

    /// 创建带内置函数的注册表
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register_builtins();
        registry
    }

    /// 注册（或覆盖）条件函数
    pub fn register<F>(&self, name: impl Into<String>, function: F)
    where
        F: Fn(&ExecutionContext, &Map<String, Value>) -> Result<bool> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(function = %name, "注册条件函数");
        self.functions.insert(name, Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|f| f.key().clone()).collect();
        names.sort();
        names
    }

    /// 调用条件函数
    pub fn call(
        &self,
        name: &str,
        context: &ExecutionContext,
        params: &Map<String, Value>,
    ) -> Result<bool> {
        // 先克隆出函数再调用，避免持有分片读锁执行用户代码
        let function = self
            .functions
            .get(name)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| RuleError::FunctionNotRegistered(name.to_string()))?;

        function(context, params)
    }

    fn register_builtins(&self) {
        self.register("touches_table", |ctx, params| {
            let tables = string_list(params, "table", "tables")?;
            Ok(tables.iter().any(|t| ctx.touches_table(t)))
        });

        self.register("touches_column", |ctx, params| {
            let columns = string_list(params, "column", "columns")?;
            Ok(columns.iter().any(|c| ctx.touches_column(c)))
        });

        self.register("has_role", |ctx, params| {
            let roles = string_list(params, "role", "roles")?;
            let role = ctx.user.as_ref().and_then(|u| u.role.as_deref());
            Ok(role.is_some_and(|r| roles.iter().any(|expected| expected.eq_ignore_ascii_case(r))))
        });

        self.register("has_permission", |ctx, params| {
            let permissions = string_list(params, "permission", "permissions")?;
            Ok(ctx
                .user
                .as_ref()
                .is_some_and(|u| permissions.iter().any(|p| u.has_permission(p))))
        });

        self.register("query_type_in", |ctx, params| {
            let types = string_list(params, "type", "types")?;
            Ok(types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(ctx.query_type.as_str())))
        });

        self.register("missing_limit", |ctx, _params| {
            Ok(ctx.query_type == QueryType::Select && !LIMIT_RE.is_match(&ctx.query))
        });

        self.register("missing_where", |ctx, _params| {
            Ok(matches!(ctx.query_type, QueryType::Update | QueryType::Delete)
                && !WHERE_RE.is_match(&ctx.query))
        });

        self.register("table_count_exceeds", |ctx, params| {
            let max = params
                .get("max")
                .and_then(Value::as_u64)
                .ok_or_else(|| RuleError::Validation("table_count_exceeds 需要非负整数参数 max".to_string()))?;
            Ok(ctx.tables.len() as u64 > max)
        });
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// 读取单值或列表参数（如 `table` 或 `tables`）
fn string_list(params: &Map<String, Value>, single: &str, plural: &str) -> Result<Vec<String>> {
    if let Some(Value::String(s)) = params.get(single) {
        return Ok(vec![s.clone()]);
    }

    match params.get(plural) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    RuleError::Validation(format!("参数 {} 只能包含字符串", plural))
                })
            })
            .collect(),
        _ => Err(RuleError::Validation(format!(
            "缺少参数 {} 或 {}",
            single, plural
        ))),
    }
}
