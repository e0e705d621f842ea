//! 查询业务规则引擎
//!
//! 在查询执行前对查询上下文进行规则把关，支持：
//! - JSON 规则文档的存储、校验和持久化
//! - 表达式、正则、注册函数和组合条件求值
//! - 拒绝优先的动作裁决和按优先级组合的查询改写
//! - 评估结果缓存和规则文件热加载

pub mod action;
pub mod cache;
pub mod clock;
pub mod compiler;
pub mod context;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod expression;
pub mod functions;
pub mod models;
pub mod notifier;
pub mod operators;
pub mod persistence;
pub mod rewrite;
pub mod store;
pub mod watcher;

pub use action::{ActionResolver, Resolution};
pub use cache::{CacheBackend, CachedRuleEngine, MemoryCacheBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{ExecutionContext, QueryType, UserContext};
pub use engine::RuleEngine;
pub use error::{Result, RuleError};
pub use evaluator::ConditionEvaluator;
pub use expression::Expression;
pub use functions::FunctionRegistry;
pub use models::{
    Action, ActionKind, BusinessRule, Condition, EngineResponse, EvaluationResult, QueryRewrite,
    ResponseMetadata, RuleFilter, RulePatch, RuleScope, RuleTarget, RuleType, Severity, Trigger,
};
pub use notifier::{RuleNotification, RuleNotifier, TracingNotifier};
pub use operators::{ArithmeticOperator, LogicalOperator, Operator};
pub use persistence::{JsonFilePersistence, MemoryPersistence, RuleDocument, RulePersistence};
pub use store::{RuleSet, RuleStore};
pub use watcher::{RuleFileWatcher, RuleWatcher};
