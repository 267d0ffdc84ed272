//! # 门诊流程 Web 模块
//!
//! 通过 HTTP/JSON 暴露取号、排队查询、报到、完成和工位管理等操作

pub mod handlers;
pub mod server;

pub use handlers::{ApiError, AppState};
pub use server::{router, WebServer};
