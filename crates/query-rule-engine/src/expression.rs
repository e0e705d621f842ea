//! 条件表达式迷你语言
//!
//! 受限的布尔/算术表达式，只能读取执行上下文字段，不支持函数调用和赋值：
//!
//! ```text
//! expr       := or
//! or         := and ( (OR | "||") and )*
//! and        := not ( (AND | "&&") not )*
//! not        := (NOT | "!") not | comparison
//! comparison := additive [ cmp additive | [NOT] IN additive | CONTAINS additive | [NOT] LIKE additive ]
//! additive   := term ( ("+" | "-") term )*
//! term       := unary ( ("*" | "/" | "%") unary )*
//! unary      := "-" unary | primary
//! primary    := number | string | TRUE | FALSE | NULL | field | "(" expr ")" | "[" expr, ... "]"
//! ```
//!
//! 求值不会失败：未知字段视为 NULL，类型不匹配的比较结果为 false。

use crate::context::ExecutionContext;
use crate::error::{Result, RuleError};
use crate::operators::{ArithmeticOperator, Operator};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

/// 最大嵌套深度，防止恶意或错误配置的表达式耗尽栈空间
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Contains,
    Like,
    Compare(Operator),
    Arithmetic(ArithmeticOperator),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "'{}'", s),
            Self::Ident(i) => write!(f, "{}", i),
            Self::True => write!(f, "TRUE"),
            Self::False => write!(f, "FALSE"),
            Self::Null => write!(f, "NULL"),
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
            Self::Not => write!(f, "NOT"),
            Self::In => write!(f, "IN"),
            Self::Contains => write!(f, "CONTAINS"),
            Self::Like => write!(f, "LIKE"),
            Self::Compare(op) => write!(f, "{}", op),
            Self::Arithmetic(op) => write!(f, "{}", op),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::LBracket => write!(f, "["),
            Self::RBracket => write!(f, "]"),
            Self::Comma => write!(f, ","),
            Self::Eof => write!(f, "表达式结尾"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
}

struct Tokenizer<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn tokenize(input: &str) -> Result<Vec<Token>> {
        let mut tokenizer = Tokenizer::new(input);
        let mut tokens = Vec::new();

        loop {
            let token = tokenizer.next_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                break;
            }
        }

        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Token> {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let Some(&(start, c)) = self.chars.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                position: self.input.len(),
            });
        };

        let kind = match c {
            '(' => self.single(TokenKind::LParen),
            ')' => self.single(TokenKind::RParen),
            '[' => self.single(TokenKind::LBracket),
            ']' => self.single(TokenKind::RBracket),
            ',' => self.single(TokenKind::Comma),
            '+' => self.single(TokenKind::Arithmetic(ArithmeticOperator::Add)),
            '-' => self.single(TokenKind::Arithmetic(ArithmeticOperator::Sub)),
            '*' => self.single(TokenKind::Arithmetic(ArithmeticOperator::Mul)),
            '/' => self.single(TokenKind::Arithmetic(ArithmeticOperator::Div)),
            '%' => self.single(TokenKind::Arithmetic(ArithmeticOperator::Rem)),
            '=' => {
                self.chars.next();
                self.chars.next_if(|(_, c)| *c == '=');
                TokenKind::Compare(Operator::Eq)
            }
            '!' => {
                self.chars.next();
                if self.chars.next_if(|(_, c)| *c == '=').is_some() {
                    TokenKind::Compare(Operator::Neq)
                } else {
                    TokenKind::Not
                }
            }
            '<' => {
                self.chars.next();
                if self.chars.next_if(|(_, c)| *c == '=').is_some() {
                    TokenKind::Compare(Operator::Lte)
                } else if self.chars.next_if(|(_, c)| *c == '>').is_some() {
                    TokenKind::Compare(Operator::Neq)
                } else {
                    TokenKind::Compare(Operator::Lt)
                }
            }
            '>' => {
                self.chars.next();
                if self.chars.next_if(|(_, c)| *c == '=').is_some() {
                    TokenKind::Compare(Operator::Gte)
                } else {
                    TokenKind::Compare(Operator::Gt)
                }
            }
            '&' => self.double('&', TokenKind::And, start)?,
            '|' => self.double('|', TokenKind::Or, start)?,
            '\'' | '"' => self.string(c, start)?,
            c if c.is_ascii_digit() => self.number(start)?,
            c if c.is_alphabetic() || c == '_' => self.word(),
            other => {
                return Err(RuleError::ExpressionSyntax {
                    position: start,
                    message: format!("无法识别的字符 '{}'", other),
                });
            }
        };

        Ok(Token {
            kind,
            position: start,
        })
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.chars.next();
        kind
    }

    fn double(&mut self, expected: char, kind: TokenKind, start: usize) -> Result<TokenKind> {
        self.chars.next();
        if self.chars.next_if(|(_, c)| *c == expected).is_some() {
            Ok(kind)
        } else {
            Err(RuleError::ExpressionSyntax {
                position: start,
                message: format!("应为 '{0}{0}'", expected),
            })
        }
    }

    fn string(&mut self, quote: char, start: usize) -> Result<TokenKind> {
        self.chars.next();
        let mut value = String::new();

        while let Some((_, c)) = self.chars.next() {
            match c {
                '\\' => match self.chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, escaped)) => value.push(escaped),
                    None => break,
                },
                c if c == quote => return Ok(TokenKind::Str(value)),
                c => value.push(c),
            }
        }

        Err(RuleError::ExpressionSyntax {
            position: start,
            message: "字符串缺少结束引号".to_string(),
        })
    }

    fn number(&mut self, start: usize) -> Result<TokenKind> {
        let mut end = start;
        let mut seen_dot = false;

        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_ascii_digit() || (c == '.' && !seen_dot) {
                seen_dot |= c == '.';
                end = i + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }

        let text = &self.input[start..end];
        text.parse::<f64>()
            .map(TokenKind::Number)
            .map_err(|_| RuleError::ExpressionSyntax {
                position: start,
                message: format!("无效的数字 '{}'", text),
            })
    }

    fn word(&mut self) -> TokenKind {
        let mut word = String::new();
        while let Some((_, c)) = self
            .chars
            .next_if(|(_, c)| c.is_alphanumeric() || *c == '_' || *c == '.')
        {
            word.push(c);
        }

        match word.to_ascii_uppercase().as_str() {
            "AND" => TokenKind::And,
            "OR" => TokenKind::Or,
            "NOT" => TokenKind::Not,
            "IN" => TokenKind::In,
            "CONTAINS" => TokenKind::Contains,
            "LIKE" => TokenKind::Like,
            "TRUE" => TokenKind::True,
            "FALSE" => TokenKind::False,
            "NULL" => TokenKind::Null,
            _ => TokenKind::Ident(word),
        }
    }
}

/// 表达式语法树
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(String),
    List(Vec<Expr>),
    Not(Box<Expr>),
    Negate(Box<Expr>),
    /// AND 链，按顺序短路求值
    And(Vec<Expr>),
    /// OR 链，按顺序短路求值
    Or(Vec<Expr>),
    Compare {
        op: Operator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Arithmetic {
        op: ArithmeticOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize 保证末尾总有 Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_next(&self) -> &TokenKind {
        &self.tokens[(self.pos + 1).min(self.tokens.len() - 1)].kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T> {
        Err(RuleError::ExpressionSyntax {
            position: self.peek().position,
            message: message.into(),
        })
    }

    fn expect(&mut self, kind: TokenKind) -> Result<()> {
        if self.peek().kind == kind {
            self.advance();
            Ok(())
        } else {
            let found = self.peek().kind.clone();
            self.error(format!("应为 '{}'，实际为 '{}'", kind, found))
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return self.error(format!("表达式嵌套超过 {} 层", MAX_DEPTH));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let first = self.parse_and()?;
        if self.peek().kind != TokenKind::Or {
            return Ok(first);
        }

        let mut operands = vec![first];
        while self.peek().kind == TokenKind::Or {
            self.advance();
            operands.push(self.parse_and()?);
        }
        Ok(Expr::Or(operands))
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let first = self.parse_not()?;
        if self.peek().kind != TokenKind::And {
            return Ok(first);
        }

        let mut operands = vec![first];
        while self.peek().kind == TokenKind::And {
            self.advance();
            operands.push(self.parse_not()?);
        }
        Ok(Expr::And(operands))
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.peek().kind == TokenKind::Not {
            self.advance();
            self.enter()?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_additive()?;

        let current = self.peek().kind.clone();
        let (op, negate) = match (current, self.peek_next().clone()) {
            (TokenKind::Compare(op), _) => (op, false),
            (TokenKind::In, _) => (Operator::In, false),
            (TokenKind::Contains, _) => (Operator::Contains, false),
            (TokenKind::Like, _) => (Operator::Like, false),
            (TokenKind::Not, TokenKind::In) => {
                self.advance();
                (Operator::NotIn, false)
            }
            (TokenKind::Not, TokenKind::Like) => {
                self.advance();
                (Operator::Like, true)
            }
            _ => return Ok(left),
        };
        self.advance();

        let right = self.parse_additive()?;
        let compare = Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        };

        Ok(if negate {
            Expr::Not(Box::new(compare))
        } else {
            compare
        })
    }

    // 算术链构造左深树，每个运算符都计入嵌套深度
    fn parse_additive(&mut self) -> Result<Expr> {
        let entered = self.depth;
        let mut left = self.parse_term()?;
        while let TokenKind::Arithmetic(op @ (ArithmeticOperator::Add | ArithmeticOperator::Sub)) =
            self.peek().kind
        {
            self.advance();
            self.enter()?;
            let right = self.parse_term()?;
            left = Expr::Arithmetic {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = entered;
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let entered = self.depth;
        let mut left = self.parse_unary()?;
        while let TokenKind::Arithmetic(
            op @ (ArithmeticOperator::Mul | ArithmeticOperator::Div | ArithmeticOperator::Rem),
        ) = self.peek().kind
        {
            self.advance();
            self.enter()?;
            let right = self.parse_unary()?;
            left = Expr::Arithmetic {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth = entered;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek().kind == TokenKind::Arithmetic(ArithmeticOperator::Sub) {
            self.advance();
            self.enter()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Negate(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.advance();
        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(number_value(n))),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::True => Ok(Expr::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Expr::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Expr::Literal(Value::Null)),
            TokenKind::Ident(name) => Ok(Expr::Field(name)),
            TokenKind::LParen => {
                self.enter()?;
                let inner = self.parse_or()?;
                self.expect(TokenKind::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            TokenKind::LBracket => {
                self.enter()?;
                let mut items = Vec::new();
                if self.peek().kind != TokenKind::RBracket {
                    loop {
                        items.push(self.parse_or()?);
                        if self.peek().kind == TokenKind::Comma {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RBracket)?;
                self.depth -= 1;
                Ok(Expr::List(items))
            }
            other => Err(RuleError::ExpressionSyntax {
                position: token.position,
                message: format!("意外的符号 '{}'", other),
            }),
        }
    }
}

/// 已解析的表达式
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    /// 解析表达式文本
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = Tokenizer::tokenize(source)?;
        if tokens.len() == 1 {
            return Err(RuleError::ExpressionSyntax {
                position: 0,
                message: "表达式不能为空".to_string(),
            });
        }

        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_or()?;

        if parser.peek().kind != TokenKind::Eof {
            let found = parser.peek().kind.clone();
            return parser.error(format!("表达式结尾存在多余内容 '{}'", found));
        }

        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// 在上下文上求值并转换为布尔结果
    pub fn evaluate(&self, context: &ExecutionContext) -> bool {
        is_truthy(&eval(&self.root, context))
    }

    /// 在上下文上求值，返回原始值
    pub fn evaluate_value(&self, context: &ExecutionContext) -> Value {
        eval(&self.root, context)
    }
}

fn eval(expr: &Expr, context: &ExecutionContext) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Field(path) => context.get_field(path).unwrap_or(Value::Null),
        Expr::List(items) => Value::Array(items.iter().map(|e| eval(e, context)).collect()),
        Expr::Not(inner) => Value::Bool(!is_truthy(&eval(inner, context))),
        Expr::Negate(inner) => match as_f64(&eval(inner, context)) {
            Some(n) => number_value(-n),
            None => Value::Null,
        },
        // AND/OR 短路求值
        Expr::And(operands) => Value::Bool(operands.iter().all(|e| is_truthy(&eval(e, context)))),
        Expr::Or(operands) => Value::Bool(operands.iter().any(|e| is_truthy(&eval(e, context)))),
        Expr::Compare { op, left, right } => {
            let left = eval(left, context);
            let right = eval(right, context);
            Value::Bool(compare(*op, &left, &right))
        }
        Expr::Arithmetic { op, left, right } => {
            arithmetic(*op, &eval(left, context), &eval(right, context))
        }
    }
}

fn compare(op: Operator, left: &Value, right: &Value) -> bool {
    match op {
        Operator::Eq => values_equal(left, right),
        Operator::Neq => !values_equal(left, right),
        Operator::Gt => order(left, right) == Some(Ordering::Greater),
        Operator::Gte => matches!(order(left, right), Some(Ordering::Greater | Ordering::Equal)),
        Operator::Lt => order(left, right) == Some(Ordering::Less),
        Operator::Lte => matches!(order(left, right), Some(Ordering::Less | Ordering::Equal)),
        Operator::In => contains(right, left),
        Operator::NotIn => !contains(right, left),
        Operator::Contains => contains(left, right),
        Operator::Like => match (left, right) {
            (Value::String(text), Value::String(pattern)) => like_match(text, pattern),
            _ => false,
        },
    }
}

/// 相等比较，数值统一转为浮点数（100 == 100.0）
fn values_equal(left: &Value, right: &Value) -> bool {
    if let (Value::Number(_), Value::Number(_)) = (left, right) {
        if let (Some(a), Some(b)) = (as_f64(left), as_f64(right)) {
            return (a - b).abs() < f64::EPSILON;
        }
    }
    left == right
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => as_f64(left)?.partial_cmp(&as_f64(right)?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// 集合包含：数组按元素比较，字符串按子串（不区分大小写）比较
fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
        (Value::String(text), Value::String(part)) => {
            text.to_lowercase().contains(&part.to_lowercase())
        }
        _ => false,
    }
}

fn arithmetic(op: ArithmeticOperator, left: &Value, right: &Value) -> Value {
    if let (ArithmeticOperator::Add, Value::String(a), Value::String(b)) = (op, left, right) {
        return Value::String(format!("{}{}", a, b));
    }

    let (Some(a), Some(b)) = (as_f64(left), as_f64(right)) else {
        return Value::Null;
    };

    let result = match op {
        ArithmeticOperator::Add => a + b,
        ArithmeticOperator::Sub => a - b,
        ArithmeticOperator::Mul => a * b,
        ArithmeticOperator::Div if b == 0.0 => return Value::Null,
        ArithmeticOperator::Div => a / b,
        ArithmeticOperator::Rem if b == 0.0 => return Value::Null,
        ArithmeticOperator::Rem => a % b,
    };
    number_value(result)
}

/// SQL LIKE 匹配：`%` 匹配任意长度，`_` 匹配单个字符，不区分大小写
fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();

    let (mut t, mut p) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '%')
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(arr) => !arr.is_empty(),
        Value::Object(obj) => !obj.is_empty(),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return Value::Number(Number::from(n as i64));
    }
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}
