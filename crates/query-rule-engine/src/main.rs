//! 规则引擎命令行服务
//!
//! 从标准输入逐行读取查询（JSON 格式的 ExecutionContext 或直接的 SQL 文本），
//! 每行输出一个 JSON 格式的评估响应。日志输出到标准错误。

use anyhow::{Context, Result};
use rule_engine::{
    CachedRuleEngine, EngineResponse, ExecutionContext, JsonFilePersistence, RuleEngine,
    RuleFileWatcher, RuleStore, RuleWatcher, SystemClock,
};
use semlayer_shared::config::AppConfig;
use semlayer_shared::observability;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

const SERVICE_NAME: &str = "rule-engine";

/// 评估入口，按配置决定是否经过缓存
enum Evaluator {
    Direct(RuleEngine),
    Cached(CachedRuleEngine),
}

impl Evaluator {
    fn evaluate_query(&self, context: &ExecutionContext) -> EngineResponse {
        match self {
            Self::Direct(engine) => engine.evaluate_query(context),
            Self::Cached(engine) => engine.evaluate_query(context),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig {
            service_name: SERVICE_NAME.to_string(),
            environment: "development".to_string(),
            ..Default::default()
        }
    });

    let _guard = observability::init(&config.observability).await?;

    info!(
        environment = %config.environment,
        rules_path = %config.engine.rules_path.display(),
        "Starting rule-engine..."
    );

    let persistence = Arc::new(JsonFilePersistence::new(&config.engine.rules_path));
    let store = RuleStore::new(persistence, Arc::new(SystemClock));
    let count = store
        .load()
        .with_context(|| format!("加载规则文档失败: {}", config.engine.rules_path.display()))?;
    info!("Loaded {} rules", count);

    for warning in store.validate_relations() {
        warn!("{}", warning);
    }

    let watcher = if config.engine.watch_rules {
        let watcher = RuleFileWatcher::from_config(store.clone(), &config.engine);
        watcher.start().await?;
        Some(watcher)
    } else {
        None
    };

    let engine = RuleEngine::new(store, config.engine.clone());
    let evaluator = if config.engine.cache_enabled {
        Evaluator::Cached(CachedRuleEngine::in_memory(engine))
    } else {
        Evaluator::Direct(engine)
    };

    tokio::select! {
        result = serve_stdin(&evaluator) => result?,
        _ = shutdown_signal() => {}
    }

    if let Some(watcher) = watcher {
        watcher.stop().await?;
    }

    info!("Service shutdown complete");
    Ok(())
}

/// 逐行读取标准输入并输出评估结果，EOF 时返回
async fn serve_stdin(evaluator: &Evaluator) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("读取标准输入失败")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let context = match parse_context(line) {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, "无法解析输入行");
                let output = serde_json::json!({ "error": e.to_string() });
                stdout.write_all(format!("{}\n", output).as_bytes()).await?;
                stdout.flush().await?;
                continue;
            }
        };

        let response = evaluator.evaluate_query(&context);
        let mut output = serde_json::to_string(&response)?;
        output.push('\n');
        stdout.write_all(output.as_bytes()).await?;
        stdout.flush().await?;
    }

    info!("标准输入已关闭");
    Ok(())
}

/// 以 `{` 开头的行按 ExecutionContext 解析，其余视为 SQL 文本
fn parse_context(line: &str) -> Result<ExecutionContext> {
    if line.starts_with('{') {
        serde_json::from_str(line).context("ExecutionContext JSON 无效")
    } else {
        Ok(ExecutionContext::from_query(line))
    }
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
