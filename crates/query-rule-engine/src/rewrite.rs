//! 查询改写
//!
//! 将 modify/transform 动作携带的改写片段依次应用到查询文本上。
//! 只做关键字级别的扫描（跳过字符串字面量和括号内的子查询），不解析完整 SQL。

use crate::models::QueryRewrite;
use tracing::debug;

/// WHERE 子句之后可能出现的尾部子句关键字
const TAIL_KEYWORDS: &[&str] = &[
    "GROUP", "HAVING", "WINDOW", "ORDER", "LIMIT", "OFFSET", "FETCH", "FOR", "UNION",
    "INTERSECT", "EXCEPT", "RETURNING",
];

/// 顶层关键字位置
#[derive(Debug, Clone, PartialEq)]
struct Word {
    start: usize,
    end: usize,
    upper: String,
}

/// 查询改写器
pub struct QueryRewriter;

impl QueryRewriter {
    /// 按顺序组合多个改写片段，后一个片段作用于前一个的输出
    pub fn compose<'a, I>(query: &str, rewrites: I) -> String
    where
        I: IntoIterator<Item = &'a QueryRewrite>,
    {
        rewrites
            .into_iter()
            .fold(query.to_string(), |current, rewrite| Self::apply(&current, rewrite))
    }

    /// 应用单个改写片段
    pub fn apply(query: &str, rewrite: &QueryRewrite) -> String {
        let rewritten = match rewrite {
            QueryRewrite::Replace { query } => query.clone(),
            QueryRewrite::AddFilter { clause } => Self::add_filter(query, clause),
            QueryRewrite::Limit { max } => Self::limit(query, *max),
            QueryRewrite::Append { fragment } => {
                let (body, terminator) = split_terminator(query);
                format!("{} {}{}", body, fragment.trim(), terminator)
            }
        };

        debug!(rewrite = ?rewrite, "查询已改写");
        rewritten
    }

    fn add_filter(query: &str, clause: &str) -> String {
        let clause = clause.trim();
        if clause.is_empty() {
            return query.to_string();
        }

        let (body, terminator) = split_terminator(query);
        let words = top_level_words(body);

        let where_word = words.iter().find(|w| w.upper == "WHERE");
        // 尾部子句只在 WHERE（或第一个 FROM）之后查找，选择列表里的同名标识符不算
        let search_from = where_word
            .or_else(|| words.iter().find(|w| w.upper == "FROM"))
            .map(|w| w.end)
            .unwrap_or(0);
        let tail_start = words
            .iter()
            .find(|w| w.start >= search_from && TAIL_KEYWORDS.contains(&w.upper.as_str()))
            .map(|w| w.start)
            .unwrap_or(body.len());

        let head = body[..tail_start].trim_end();
        let tail = body[tail_start..].trim();

        let filtered = match where_word {
            Some(w) => {
                let existing = body[w.end..tail_start].trim();
                format!("{} ({}) AND ({})", body[..w.end].trim_end(), existing, clause)
            }
            None => format!("{} WHERE {}", head, clause),
        };

        if tail.is_empty() {
            format!("{}{}", filtered, terminator)
        } else {
            format!("{} {}{}", filtered, tail, terminator)
        }
    }

    fn limit(query: &str, max: u64) -> String {
        let (body, terminator) = split_terminator(query);
        let words = top_level_words(body);

        let Some(limit) = words.iter().rev().find(|w| w.upper == "LIMIT") else {
            return format!("{} LIMIT {}{}", body, max, terminator);
        };

        let (mut arg_start, mut arg_len) = next_argument(body, limit.end);

        // MySQL 的 `LIMIT offset, count`，行数是第二个参数
        let after = &body[arg_start + arg_len..];
        if let Some(rest) = after.trim_start().strip_prefix(',') {
            (arg_start, arg_len) = next_argument(body, body.len() - rest.len());
        }
        let arg = &body[arg_start..arg_start + arg_len];

        let effective = match arg.parse::<u64>() {
            Ok(existing) => existing.min(max),
            Err(_) => max,
        };

        if arg.is_empty() {
            format!("{} {}{}", body.trim_end(), effective, terminator)
        } else {
            format!(
                "{}{}{}{}",
                &body[..arg_start],
                effective,
                &body[arg_start + arg_len..],
                terminator
            )
        }
    }
}

/// 从 `from` 开始跳过空白，返回下一个参数的起点和长度
fn next_argument(body: &str, from: usize) -> (usize, usize) {
    let rest = &body[from..];
    let start = from + (rest.len() - rest.trim_start().len());
    let len = body[start..]
        .find(|c: char| c.is_whitespace() || c == ')' || c == ',')
        .unwrap_or(body.len() - start);
    (start, len)
}

/// 拆出末尾分号
fn split_terminator(query: &str) -> (&str, &str) {
    let trimmed = query.trim_end();
    match trimmed.strip_suffix(';') {
        Some(body) => (body.trim_end(), ";"),
        None => (trimmed, ""),
    }
}

/// 扫描顶层（括号深度为 0、不在字符串内）的单词
fn top_level_words(query: &str) -> Vec<Word> {
    let mut words = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut word_start: Option<usize> = None;

    for (i, c) in query.char_indices().chain(std::iter::once((query.len(), ' '))) {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }

        if c.is_alphanumeric() || c == '_' {
            word_start.get_or_insert(i);
            continue;
        }

        if let Some(start) = word_start.take() {
            if depth == 0 {
                words.push(Word {
                    start,
                    end: i,
                    upper: query[start..i].to_ascii_uppercase(),
                });
            }
        }

        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
    }

    words
}
