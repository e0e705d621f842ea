//! 查询执行上下文
//!
//! 每次评估调用构造一次，提供给条件评估器读取字段，不做持久化。

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::LazyLock;

/// 查询类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    #[default]
    Other,
}

impl QueryType {
    /// 根据查询首个关键字识别类型（WITH 子句取括号外的第一个语句关键字）
    pub fn detect(query: &str) -> Self {
        let upper = query.trim_start().to_ascii_uppercase();
        let keyword = if upper.starts_with("WITH") {
            top_level_keyword(&upper)
        } else {
            upper.split_whitespace().next()
        };

        match keyword.unwrap_or("") {
            "SELECT" => Self::Select,
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn top_level_keyword(upper: &str) -> Option<&str> {
    let mut depth = 0i32;
    let mut word_start: Option<usize> = None;

    for (i, c) in upper.char_indices().chain(std::iter::once((upper.len(), ' '))) {
        if is_ident_char(c) {
            word_start.get_or_insert(i);
            continue;
        }
        if let Some(start) = word_start.take() {
            let word = &upper[start..i];
            if depth == 0 && matches!(word, "SELECT" | "INSERT" | "UPDATE" | "DELETE") {
                return Some(word);
            }
        }
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
    }

    None
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// 发起查询的用户身份
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl UserContext {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            role: Some(role.into()),
            permissions: Vec::new(),
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

/// 查询执行上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub query: String,
    #[serde(default)]
    pub query_type: QueryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub columns: Vec<String>,
    /// 选择列表含 `*` 或 `t.*`，涉及的表上的任意列都视为被访问
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub all_columns: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserContext>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// 调用方附带的自由元数据，引擎不解释也不裁剪
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:FROM|JOIN|INTO|UPDATE)\s+([A-Za-z_][\w$]*(?:\.[A-Za-z_][\w$]*)?|"[^"]+")"#)
        .expect("table pattern is valid")
});

// FROM 后以逗号分隔的表列表，到下一个子句关键字为止
static FROM_LIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)\bFROM\s+(.*?)(?:\b(?:WHERE|JOIN|LEFT|RIGHT|INNER|OUTER|FULL|CROSS|NATURAL|ON|USING|GROUP|ORDER|HAVING|LIMIT|OFFSET|UNION|EXCEPT|INTERSECT|WINDOW|FOR|RETURNING)\b|[();]|$)",
    )
    .expect("from list pattern is valid")
});

static FROM_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*([A-Za-z_][\w$]*(?:\.[A-Za-z_][\w$]*)?|"[^"]+")"#)
        .expect("from item pattern is valid")
});

static SELECT_LIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bSELECT\s+(?:DISTINCT\s+)?(.*?)\s+FROM\b").expect("select pattern is valid")
});

static ALIAS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+(?:AS\s+)?[A-Za-z_]\w*$").expect("alias pattern is valid")
});

static COLUMN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_]\w*(?:\.[A-Za-z_]\w*)?$").expect("column pattern is valid"));

impl ExecutionContext {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            query_type: QueryType::default(),
            database: None,
            tables: Vec::new(),
            columns: Vec::new(),
            all_columns: false,
            user: None,
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    /// 从 SQL 文本推导查询类型、涉及的表和列
    ///
    /// 只做轻量扫描：FROM/JOIN/INTO/UPDATE 之后的标识符以及 FROM 后
    /// 逗号分隔的各项视为表，SELECT 列表中的简单标识符视为列。
    /// 选择列表出现 `*` 或 `t.*` 时设置 `all_columns`，函数调用和表达式忽略。
    pub fn from_query(query: impl Into<String>) -> Self {
        let query = query.into();
        let query_type = QueryType::detect(&query);

        let mut tables: Vec<String> = Vec::new();
        let mut push_table = |name: &str| {
            let name = name.trim_matches('"');
            if !tables.iter().any(|t| t.eq_ignore_ascii_case(name)) {
                tables.push(name.to_string());
            }
        };
        for cap in TABLE_RE.captures_iter(&query) {
            push_table(&cap[1]);
        }
        for cap in FROM_LIST_RE.captures_iter(&query) {
            for item in cap[1].split(',') {
                if let Some(table) = FROM_ITEM_RE.captures(item) {
                    push_table(&table[1]);
                }
            }
        }

        let mut columns: Vec<String> = Vec::new();
        let mut all_columns = false;
        if let Some(cap) = SELECT_LIST_RE.captures(&query) {
            for item in cap[1].split(',') {
                let item = item.trim();
                if item == "*" || item.ends_with(".*") {
                    all_columns = true;
                    continue;
                }

                let item = ALIAS_RE.replace(item, "");
                let item = item.trim();
                if COLUMN_RE.is_match(item) && !columns.iter().any(|c| c == item) {
                    columns.push(item.to_string());
                }
            }
        }

        Self {
            query_type,
            tables,
            columns,
            all_columns,
            ..Self::new(query)
        }
    }

    pub fn with_query_type(mut self, query_type: QueryType) -> Self {
        self.query_type = query_type;
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_user(mut self, user: UserContext) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 查询是否涉及指定表（不区分大小写，兼容 schema 前缀）
    pub fn touches_table(&self, table: &str) -> bool {
        self.tables.iter().any(|t| names_match(t, table))
    }

    /// 查询是否涉及指定列（`table.column` 与 `column` 互相兼容）
    ///
    /// `all_columns` 时，未限定的列以及所属表被查询涉及的限定列都算命中。
    pub fn touches_column(&self, column: &str) -> bool {
        if self.columns.iter().any(|c| names_match(c, column)) {
            return true;
        }

        if !self.all_columns {
            return false;
        }
        match column.trim_matches('"').rsplit_once('.') {
            Some((table, _)) => self.touches_table(table),
            None => true,
        }
    }

    /// 获取字段值（支持点号分隔的路径，如 "user.role" 或 "metadata.source.app"）
    ///
    /// 未知字段返回 `None`，由调用方视为缺失值。
    pub fn get_field(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;
        let rest: Vec<&str> = parts.collect();

        let root = match head {
            "query" => Value::String(self.query.clone()),
            "queryType" | "query_type" => Value::String(self.query_type.as_str().to_string()),
            "database" => Value::String(self.database.clone()?),
            "tables" => Value::from(self.tables.clone()),
            "columns" => Value::from(self.columns.clone()),
            "timestamp" => Value::String(self.timestamp.to_rfc3339()),
            "user" => serde_json::to_value(self.user.as_ref()?).ok()?,
            "metadata" => Value::Object(self.metadata.clone()),
            _ => return None,
        };

        let mut current = &root;
        for part in rest {
            match current {
                Value::Object(map) => {
                    current = map.get(part)?;
                }
                Value::Array(arr) => {
                    // 支持数组索引访问，如 "tables.0"
                    let index: usize = part.parse().ok()?;
                    current = arr.get(index)?;
                }
                _ => return None,
            }
        }

        Some(current.clone())
    }
}

/// 比较两个（可能带限定前缀的）标识符
///
/// 两边都带前缀时完整比较，否则只比较最后一段。
pub(crate) fn names_match(a: &str, b: &str) -> bool {
    let a = a.trim_matches('"');
    let b = b.trim_matches('"');
    if a.contains('.') && b.contains('.') {
        return a.eq_ignore_ascii_case(b);
    }
    let last = |s: &str| s.rsplit('.').next().unwrap_or(s).to_string();
    last(a).eq_ignore_ascii_case(&last(b))
}
