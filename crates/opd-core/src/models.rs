//! 核心数据模型定义

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::FlowError;

/// 患者类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(from = "String")]
pub enum PatientClass {
    Emergency, // 急诊
    Vip,       // 贵宾
    Regular,   // 普通
    #[default]
    Unclassified, // 未分类或无法识别
}

impl From<String> for PatientClass {
    fn from(label: String) -> Self {
        PatientClass::from_label(&label)
    }
}

impl PatientClass {
    /// 宽松解析，无法识别的类别归入 `Unclassified`
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "emergency" => PatientClass::Emergency,
            "vip" => PatientClass::Vip,
            "regular" => PatientClass::Regular,
            _ => PatientClass::Unclassified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PatientClass::Emergency => "Emergency",
            PatientClass::Vip => "Vip",
            PatientClass::Regular => "Regular",
            PatientClass::Unclassified => "Unclassified",
        }
    }
}

/// 患者基本信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub uhid: String, // 院内唯一标识
    pub name: String,
    #[serde(default)]
    pub class: PatientClass,
    pub age: Option<i32>,
    pub blood_group: Option<String>,
    pub phone_number: Option<String>,
}

/// 医生信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doctor {
    pub doctor_id: String,
    pub name: String,
    pub specialty: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// 指定诊室的工位编号
    pub room: Option<u32>,
}

impl Doctor {
    pub fn room_key(&self) -> Option<StationKey> {
        self.room.map(|id| StationKey::new(Stage::Consultation, id))
    }
}

fn default_true() -> bool {
    true
}

/// 号码标识
///
/// 号码只在当天唯一，因此日期是标识的一部分。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId {
    pub date: NaiveDate,
    pub number: u32,
}

impl TokenId {
    pub fn new(date: NaiveDate, number: u32) -> Self {
        Self { date, number }
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.date, self.number)
    }
}

/// 就诊号码
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub patient_id: String,
    pub doctor_id: String,
    pub issued_at: NaiveDateTime,
}

/// 流程阶段，同时也是工位类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Intake,       // 体征采集
    Consultation, // 诊室
    Pharmacy,     // 药房
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Intake, Stage::Consultation, Stage::Pharmacy];

    /// 下一阶段，药房之后流程结束
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Intake => Some(Stage::Consultation),
            Stage::Consultation => Some(Stage::Pharmacy),
            Stage::Pharmacy => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Consultation => "consultation",
            Stage::Pharmacy => "pharmacy",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "intake" | "vitals" => Ok(Stage::Intake),
            "consultation" | "doctor" => Ok(Stage::Consultation),
            "pharmacy" => Ok(Stage::Pharmacy),
            other => Err(FlowError::InvalidInput(format!("unknown stage: {}", other))),
        }
    }
}

/// 工位标识，按 (阶段, 编号) 排序
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StationKey {
    pub stage: Stage,
    pub id: u32,
}

impl StationKey {
    pub fn new(stage: Stage, id: u32) -> Self {
        Self { stage, id }
    }
}

impl fmt::Display for StationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.stage, self.id)
    }
}

/// 工位队列
///
/// 有序的号码序列；只有存储适配层负责序列化。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct StationQueue(Vec<TokenId>);

impl StationQueue {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, token: &TokenId) -> bool {
        self.0.contains(token)
    }

    pub fn position(&self, token: &TokenId) -> Option<usize> {
        self.0.iter().position(|t| t == token)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TokenId> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[TokenId] {
        &self.0
    }

    /// 在指定位置插入，越界时追加到末尾
    pub fn insert_at(&mut self, index: usize, token: TokenId) -> usize {
        let index = index.min(self.0.len());
        self.0.insert(index, token);
        index
    }

    /// 移除号码，返回是否存在
    pub fn remove(&mut self, token: &TokenId) -> bool {
        match self.position(token) {
            Some(idx) => {
                self.0.remove(idx);
                true
            }
            None => false,
        }
    }
}

impl From<Vec<TokenId>> for StationQueue {
    fn from(tokens: Vec<TokenId>) -> Self {
        Self(tokens)
    }
}

impl From<StationQueue> for Vec<TokenId> {
    fn from(queue: StationQueue) -> Self {
        queue.0
    }
}

/// 工位对外状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StationStatus {
    Active,
    /// 已申请停用，等待队列清空
    Disabling,
    Inactive,
}

/// 服务工位
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub key: StationKey,
    pub location: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub pending_disable: bool,
    #[serde(default)]
    pub queue: StationQueue,
    /// 诊室绑定的医生
    pub doctor_id: Option<String>,
}

impl Station {
    pub fn new(key: StationKey, location: Option<String>) -> Self {
        Self {
            key,
            location,
            is_active: true,
            pending_disable: false,
            queue: StationQueue::new(),
            doctor_id: None,
        }
    }

    /// 是否接收新的号码
    pub fn is_accepting(&self) -> bool {
        self.is_active && !self.pending_disable
    }

    pub fn status(&self) -> StationStatus {
        match (self.is_active, self.pending_disable) {
            (false, _) => StationStatus::Inactive,
            (true, true) => StationStatus::Disabling,
            (true, false) => StationStatus::Active,
        }
    }
}

/// 阶段记录状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StageState {
    Queued,   // 排队中
    Reported, // 服务中
    Finished, // 已完成
}

/// 阶段记录：号码在某个工位的一次访问
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: Uuid,
    pub token: TokenId,
    pub station: StationKey,
    pub patient_id: String,
    pub doctor_id: String,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
}

impl StageRecord {
    pub fn queued(token: &Token, station: StationKey, now: NaiveDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            token: token.id,
            station,
            patient_id: token.patient_id.clone(),
            doctor_id: token.doctor_id.clone(),
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// 同一号码在下一个工位的新记录
    pub fn next_visit(&self, station: StationKey, now: NaiveDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            token: self.token,
            station,
            patient_id: self.patient_id.clone(),
            doctor_id: self.doctor_id.clone(),
            created_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn state(&self) -> StageState {
        match (self.started_at, self.completed_at) {
            (_, Some(_)) => StageState::Finished,
            (Some(_), None) => StageState::Reported,
            (None, None) => StageState::Queued,
        }
    }
}
