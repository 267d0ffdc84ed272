//! 错误定义模块

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Stage, StationKey, TokenId};

/// 错误类别
///
/// 调用方只依赖类别做分支处理，具体变体携带定位问题所需的标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// 引用的患者、医生、工位、号码或记录不存在
    NotFound,
    /// 与当前状态冲突，例如工位正在服务其他号码
    Conflict,
    /// 暂时没有可用的去向
    Unavailable,
    /// 请求缺少必要标识
    InvalidInput,
    /// 存储或系统内部错误
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Internal => "internal",
        }
    }
}

/// 门诊流程统一错误类型
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("患者不存在: {0}")]
    PatientNotFound(String),

    #[error("医生不存在: {0}")]
    DoctorNotFound(String),

    #[error("工位不存在: {0}")]
    StationNotFound(StationKey),

    #[error("号码 {token} 在工位 {station} 没有可执行的记录: {reason}")]
    RecordNotFound {
        token: TokenId,
        station: StationKey,
        reason: String,
    },

    #[error("工位 {station} 正在服务号码 {occupant}")]
    StationBusy { station: StationKey, occupant: TokenId },

    #[error("{0} 阶段没有可用工位")]
    NoStationsAvailable(Stage),

    #[error("医生 {doctor_id} 的诊室不可用")]
    RoomInactive {
        doctor_id: String,
        room: Option<StationKey>,
    },

    #[error("没有开放的 {0} 工位可以接收")]
    NoDownstreamStation(Stage),

    #[error("无效请求: {0}")]
    InvalidInput(String),

    #[error("无效状态转换: 从 {from} 经 {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl FlowError {
    /// 错误所属类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::PatientNotFound(_)
            | FlowError::DoctorNotFound(_)
            | FlowError::StationNotFound(_)
            | FlowError::RecordNotFound { .. }
            | FlowError::InvalidStateTransition { .. } => ErrorKind::NotFound,
            FlowError::StationBusy { .. } => ErrorKind::Conflict,
            FlowError::NoStationsAvailable(_)
            | FlowError::RoomInactive { .. }
            | FlowError::NoDownstreamStation(_) => ErrorKind::Unavailable,
            FlowError::InvalidInput(_) => ErrorKind::InvalidInput,
            FlowError::Storage(_) | FlowError::Serialization(_) | FlowError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// 稳定的错误代码，供传输层原样返回
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::PatientNotFound(_) => "PatientNotFound",
            FlowError::DoctorNotFound(_) => "DoctorNotFound",
            FlowError::StationNotFound(_) => "StationNotFound",
            FlowError::RecordNotFound { .. } => "NotFound",
            FlowError::StationBusy { .. } => "StationBusy",
            FlowError::NoStationsAvailable(_) => "NoStationsAvailable",
            FlowError::RoomInactive { .. } => "RoomInactive",
            FlowError::NoDownstreamStation(_) => "NoDownstreamStation",
            FlowError::InvalidInput(_) => "InvalidInput",
            FlowError::InvalidStateTransition { .. } => "InvalidStateTransition",
            FlowError::Storage(_) => "Storage",
            FlowError::Serialization(_) => "Serialization",
            FlowError::Internal(_) => "Internal",
        }
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for FlowError {
    fn from(err: sqlx::Error) -> Self {
        FlowError::Storage(err.to_string())
    }
}

/// 门诊流程统一结果类型
pub type Result<T> = std::result::Result<T, FlowError>;
