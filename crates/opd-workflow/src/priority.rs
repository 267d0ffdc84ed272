//! 患者优先级
//!
//! 患者类别到优先级序数的映射，数值越小越先服务。

use opd_core::PatientClass;
use serde::{Deserialize, Serialize};

/// 优先级序数
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const EMERGENCY: Priority = Priority(1);
    pub const VIP: Priority = Priority(2);
    /// 最低紧急度，也是未知类别的默认值
    pub const LOWEST: Priority = Priority(3);

    pub fn value(&self) -> u8 {
        self.0
    }

    /// 是否比另一个优先级更紧急
    pub fn is_more_urgent_than(&self, other: Priority) -> bool {
        self.0 < other.0
    }
}

/// 根据患者类别计算优先级
pub fn rank(class: PatientClass) -> Priority {
    match class {
        PatientClass::Emergency => Priority::EMERGENCY,
        PatientClass::Vip => Priority::VIP,
        PatientClass::Regular | PatientClass::Unclassified => Priority::LOWEST,
    }
}

/// 患者记录缺失时同样落到最低紧急度
pub fn rank_or_lowest(class: Option<PatientClass>) -> Priority {
    class.map(rank).unwrap_or(Priority::LOWEST)
}
