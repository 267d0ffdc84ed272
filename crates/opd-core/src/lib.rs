//! # OPD Core
//!
//! 门诊流程系统的核心模块，提供基础数据结构、错误定义和时钟抽象。

pub mod error;
pub mod models;
pub mod utils;

pub use error::{ErrorKind, FlowError, Result};
pub use models::*;
pub use utils::{Clock, ManualClock, SystemClock};
