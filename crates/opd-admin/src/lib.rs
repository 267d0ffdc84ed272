//! # 门诊流程管理模块
//!
//! 提供配置加载与校验、Prometheus 指标监控等运维功能

pub mod config;
pub mod monitoring;

pub use config::{
    ConfigValidator, LoggingConfig, OpdConfig, ServerConfig, StorageBackend, StorageConfig,
    WorkflowConfig,
};
pub use monitoring::{FlowMonitor, HealthStatus};
