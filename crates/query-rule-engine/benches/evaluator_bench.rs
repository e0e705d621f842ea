//! 条件评估器性能基准测试
//!
//! 针对表达式解析、表达式求值、正则匹配和组合条件进行细粒度的性能测试。

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rule_engine::{
    BusinessRule, Condition, ConditionEvaluator, ExecutionContext, Expression, UserContext,
};
use serde_json::json;
use std::hint::black_box;

fn create_context() -> ExecutionContext {
    ExecutionContext::from_query(
        "SELECT o.id, o.amount, c.email FROM orders o JOIN customers c ON o.customer_id = c.id WHERE o.amount > 100",
    )
    .with_database("shop")
    .with_user(UserContext::new("u-42", "analyst").with_permissions(["read", "export"]))
    .with_metadata("source", json!({ "app": "bi-dashboard", "region": "eu" }))
}

/// 表达式解析基准
fn bench_expression_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("expression_parse");

    let sources = [
        ("simple", "queryType = 'SELECT'"),
        (
            "membership",
            "user.role IN ['admin', 'analyst'] AND 'orders' IN tables",
        ),
        (
            "complex",
            "(queryType = 'SELECT' OR queryType = 'UPDATE') AND NOT (user.role = 'guest') \
             AND metadata.source.region LIKE 'e%' AND (1 + 2) * 3 >= 9",
        ),
    ];

    for (name, source) in sources {
        group.bench_with_input(BenchmarkId::from_parameter(name), source, |b, src| {
            b.iter(|| Expression::parse(black_box(src)))
        });
    }

    group.finish();
}

/// 已解析表达式的求值基准
fn bench_expression_evaluate(c: &mut Criterion) {
    let context = create_context();
    let expression = Expression::parse(
        "user.role IN ['admin', 'analyst'] AND query CONTAINS 'amount' AND metadata.source.app LIKE 'bi-%'",
    )
    .unwrap();

    c.bench_function("expression_evaluate", |b| {
        b.iter(|| expression.evaluate(black_box(&context)))
    });
}

/// 条件评估基准：缓存的表达式和正则
fn bench_condition_kinds(c: &mut Criterion) {
    let mut group = c.benchmark_group("condition_kinds");
    let evaluator = ConditionEvaluator::default();
    let context = create_context();
    let rules: Vec<BusinessRule> = Vec::new();

    let conditions = [
        ("expression", Condition::expression("database = 'shop' AND 'customers' IN tables")),
        ("pattern", Condition::pattern(r"\bJOIN\b.*\bON\b")),
        (
            "function",
            Condition::function("touches_table", json!({ "tables": ["orders", "payments"] })),
        ),
        ("missing_limit", Condition::function("missing_limit", json!({}))),
    ];

    for (name, condition) in conditions {
        group.bench_function(name, |b| {
            b.iter(|| evaluator.evaluate(black_box(&condition), black_box(&context), &rules))
        });
    }

    group.finish();
}

/// 嵌套组合条件基准（不同深度）
fn bench_composite_depth(c: &mut Criterion) {
    fn build(depth: usize) -> Condition {
        if depth == 0 {
            return Condition::expression("queryType = 'SELECT'");
        }
        let children = vec![build(depth - 1), Condition::expression("user.role = 'analyst'")];
        if depth % 2 == 0 {
            Condition::and(children)
        } else {
            Condition::or(children)
        }
    }

    let mut group = c.benchmark_group("composite_depth");
    let evaluator = ConditionEvaluator::default();
    let context = create_context();
    let rules: Vec<BusinessRule> = Vec::new();

    for depth in [1, 4, 8, 16] {
        let condition = build(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &condition, |b, cond| {
            b.iter(|| evaluator.evaluate(black_box(cond), black_box(&context), &rules))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_expression_parse,
    bench_expression_evaluate,
    bench_condition_kinds,
    bench_composite_depth,
);

criterion_main!(benches);
