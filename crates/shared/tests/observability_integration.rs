//! 可观测性与配置集成测试
//!
//! 测试指标记录、Prometheus 端点和分层配置加载。

// ============================================================================
// 指标记录测试
// ============================================================================

mod metrics_tests {
    use semlayer_shared::observability::metrics::{
        record_cache_lookup, record_query_evaluation, record_reload, record_rule_error,
    };

    #[test]
    fn test_record_query_evaluation() {
        record_query_evaluation("before_query", true, false, 0.002);
        record_query_evaluation("before_query", false, false, 0.004);
        record_query_evaluation("after_query", false, true, 1.2);
        record_query_evaluation("on_access", true, false, 0.0);
    }

    #[test]
    fn test_record_auxiliary_metrics() {
        record_rule_error("RULE_EVALUATION_ERROR");
        record_rule_error("TIMEOUT");
        record_cache_lookup(true);
        record_cache_lookup(false);
        record_reload(true);
        record_reload(false);
    }

    #[test]
    fn test_metrics_with_edge_cases() {
        record_query_evaluation("", true, false, f64::MAX);
        record_query_evaluation("before_query", true, false, -1.0);
    }
}

// ============================================================================
// Prometheus 端点测试
// ============================================================================

mod endpoint_tests {
    use semlayer_shared::observability::ObservabilityConfig;
    use semlayer_shared::observability::metrics;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn http_get(port: u16, path: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        body
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_engine_metrics() {
        let config = ObservabilityConfig {
            metrics_enabled: true,
            metrics_port: 19387,
            ..Default::default()
        };
        let handle = metrics::init(&config).await.unwrap();

        metrics::record_query_evaluation("before_query", false, false, 0.01);

        let health = http_get(config.metrics_port, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("OK"));

        let exported = http_get(config.metrics_port, "/metrics").await;
        assert!(exported.contains("rule_engine_evaluations_total"));
        assert!(exported.contains("rule_engine_blocked_total"));
        assert!(metrics::get_handle().is_some());

        handle.shutdown();
    }
}

// ============================================================================
// 配置测试
// ============================================================================

mod config_tests {
    use semlayer_shared::config::AppConfig;
    use semlayer_shared::observability::ObservabilityConfig;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.service_name, "rule-engine");
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
        assert!(!config.metrics_enabled);
    }

    #[test]
    fn test_service_file_overrides_environment_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[observability]\nlog_level = \"info\"\nmetrics_port = 9100\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("production.toml"),
            "[observability]\njson_logs = true\nlog_level = \"warn\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("rule-engine.toml"),
            "[observability]\nlog_level = \"debug\"\n[engine]\nrules_path = \"/etc/semlayer/rules.json\"\n",
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path(), "rule-engine", "production").unwrap();

        assert!(config.is_production());
        assert!(config.observability.json_logs);
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(config.observability.metrics_port, 9100);
        assert_eq!(
            config.engine.rules_path,
            std::path::PathBuf::from("/etc/semlayer/rules.json")
        );
    }

    #[test]
    fn test_invalid_value_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            "[engine]\ntimeout_ms = \"soon\"\n",
        )
        .unwrap();

        assert!(AppConfig::load_from(dir.path(), "rule-engine", "development").is_err());
    }
}

// ============================================================================
// Guard 测试
// ============================================================================

mod guard_tests {
    use semlayer_shared::observability::ObservabilityGuard;

    #[test]
    fn test_empty_guard() {
        // 创建空 guard 不应 panic
        let guard = ObservabilityGuard::empty();
        // drop 时也不应 panic
        drop(guard);
    }

    #[test]
    fn test_guard_drop() {
        for _ in 0..10 {
            let guard = ObservabilityGuard::empty();
            drop(guard);
        }
    }
}
