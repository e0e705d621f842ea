//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use crate::observability::ObservabilityConfig;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// 规则引擎配置
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// 单次评估最多执行的规则数，超出部分截断并给出警告
    pub max_rules_per_query: usize,
    /// 单次评估超时（毫秒），超时后拒绝查询
    pub timeout_ms: u64,
    /// 规则评估出错时是否拒绝查询
    pub fail_closed_on_error: bool,
    pub cache_enabled: bool,
    pub cache_ttl_seconds: u64,
    /// 规则文档路径（JSON 数组）
    pub rules_path: PathBuf,
    /// 是否监听规则文件变更并热加载
    pub watch_rules: bool,
    pub watch_debounce_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_rules_per_query: 100,
            timeout_ms: 1000,
            fail_closed_on_error: false,
            cache_enabled: false,
            cache_ttl_seconds: 300,
            rules_path: PathBuf::from("config/rules.json"),
            watch_rules: false,
            watch_debounce_ms: 500,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（SEMLAYER_ 前缀，层级用双下划线分隔，如
    ///    SEMLAYER_ENGINE__TIMEOUT_MS -> engine.timeout_ms）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("SEMLAYER_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(Path::new(&config_dir), service_name, &env)
    }

    /// 从指定目录加载配置
    pub fn load_from(config_dir: &Path, service_name: &str, env: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(
                File::from(config_dir.join(format!("{}.toml", service_name))).required(false),
            )
            .add_source(
                Environment::with_prefix("SEMLAYER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.observability.service_name = config.service_name.clone();
        Ok(config)
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
