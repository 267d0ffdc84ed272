//! 配置管理
//!
//! 分层加载：内置默认值 → 配置文件 → `OPD__` 前缀的环境变量，
//! 例如 `OPD__SERVER__PORT=9000`、`OPD__STORAGE__BACKEND=postgres`。

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat, Source};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// 门诊流程服务完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpdConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 存储配置
    pub storage: StorageConfig,
    /// 流程配置
    pub workflow: WorkflowConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 服务器名称
    pub name: String,
    /// 监听主机
    pub host: String,
    /// 监听端口
    pub port: u16,
}

/// 存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// 连接字符串，postgres 后端必填
    pub database_url: Option<String>,
    /// 最大连接数
    pub max_connections: u32,
    /// 最小连接数
    pub min_connections: u32,
    /// 连接超时时间（秒）
    pub connect_timeout_secs: u64,
    /// 内存后端启动时载入的种子数据
    pub seed_file: Option<String>,
}

impl StorageConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// 流程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// 进程内事件广播的缓冲容量
    pub event_buffer: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: String,
    /// 日志格式：text 或 json
    pub format: String,
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl OpdConfig {
    /// 从配置文件和环境变量加载
    ///
    /// 未指定路径时尝试读取当前目录下的 `opd.toml`，不存在则只用默认值和环境变量。
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name("opd").required(false),
        };
        let config = Self::layered(file).with_context(|| {
            format!(
                "Failed to load configuration from {}",
                path.unwrap_or("opd.toml")
            )
        })?;

        info!(
            "Configuration loaded successfully from: {}",
            path.unwrap_or("defaults")
        );
        Ok(config)
    }

    /// 从 TOML 文本加载，环境变量仍然生效
    pub fn from_toml(content: &str) -> Result<Self> {
        Self::layered(File::from_str(content, FileFormat::Toml))
    }

    /// 序列化为 TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    fn layered<S>(file: S) -> Result<Self>
    where
        S: Source + Send + Sync + 'static,
    {
        let settings = Config::builder()
            .add_source(Config::try_from(&OpdConfig::default())?)
            .add_source(file)
            .add_source(
                Environment::with_prefix("OPD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: OpdConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        ConfigValidator::new().validate(&config)?;
        Ok(config)
    }
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    /// 字段路径
    field_path: &'static str,
    /// 验证函数
    validator: fn(&OpdConfig) -> Result<()>,
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "server.port",
                validator: |config| {
                    if config.server.port == 0 {
                        Err(anyhow::anyhow!("Server port cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "storage.max_connections",
                validator: |config| {
                    let storage = &config.storage;
                    if storage.max_connections == 0 {
                        Err(anyhow::anyhow!("Database max connections cannot be 0"))
                    } else if storage.min_connections > storage.max_connections {
                        Err(anyhow::anyhow!(
                            "min_connections ({}) exceeds max_connections ({})",
                            storage.min_connections,
                            storage.max_connections
                        ))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "storage.database_url",
                validator: |config| {
                    let missing = config
                        .storage
                        .database_url
                        .as_deref()
                        .map_or(true, |url| url.trim().is_empty());
                    if config.storage.backend == StorageBackend::Postgres && missing {
                        Err(anyhow::anyhow!("postgres backend requires a database_url"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "workflow.event_buffer",
                validator: |config| {
                    if config.workflow.event_buffer == 0 {
                        Err(anyhow::anyhow!("Event buffer cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "logging.format",
                validator: |config| match config.logging.format.to_ascii_lowercase().as_str() {
                    "text" | "json" => Ok(()),
                    other => Err(anyhow::anyhow!("Unknown log format: {}", other)),
                },
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &OpdConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(e.context(format!("Invalid {}", rule.field_path)));
            }
        }

        info!("Configuration validation passed");
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "OPD-Server".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database_url: None,
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
            seed_file: None,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { event_buffer: 256 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OpdConfig::default();
        assert!(ConfigValidator::new().validate(&config).is_ok());
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = OpdConfig::from_toml(
            r#"
            [server]
            port = 9100

            [storage]
            seed_file = "seed.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.seed_file.as_deref(), Some("seed.json"));
        assert_eq!(config.workflow.event_buffer, 256);
    }

    #[test]
    fn test_postgres_requires_url() {
        let err = OpdConfig::from_toml(
            r#"
            [storage]
            backend = "postgres"
            "#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("database_url"));
    }

    #[test]
    fn test_pool_bounds() {
        let mut config = OpdConfig::default();
        config.storage.min_connections = 20;
        assert!(ConfigValidator::new().validate(&config).is_err());

        config.storage.min_connections = 1;
        config.logging.format = "yaml".to_string();
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_toml_output_reloads() {
        let mut config = OpdConfig::default();
        config.logging.format = "json".to_string();
        let text = config.to_toml().unwrap();

        let reloaded = OpdConfig::from_toml(&text).unwrap();
        assert!(reloaded.logging.is_json());
    }
}
