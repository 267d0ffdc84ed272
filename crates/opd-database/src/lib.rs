//! # 门诊流程数据库模块
//!
//! 基于 PostgreSQL 的流程存储，提供连接池、建表和按变更集整体提交的存储实现。

pub mod connection;
pub mod models;
pub mod queries;
pub mod store;

// 重新导出主要类型
pub use connection::{DatabasePool, PoolOptions};
pub use models::*;
pub use queries::DatabaseQueries;
pub use store::PgFlowStore;
