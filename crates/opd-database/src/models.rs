//! 数据库模型

use chrono::{NaiveDate, NaiveDateTime};
use opd_core::models::*;
use opd_core::{FlowError, Result};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库患者表
#[derive(Debug, FromRow)]
pub struct DbPatient {
    pub uhid: String,
    pub name: String,
    pub class: String, // 存储为字符串，转换为PatientClass枚举
    pub age: Option<i32>,
    pub blood_group: Option<String>,
    pub phone_number: Option<String>,
}

impl From<DbPatient> for Patient {
    fn from(db_patient: DbPatient) -> Self {
        Patient {
            uhid: db_patient.uhid,
            name: db_patient.name,
            class: PatientClass::from_label(&db_patient.class),
            age: db_patient.age,
            blood_group: db_patient.blood_group,
            phone_number: db_patient.phone_number,
        }
    }
}

/// 数据库医生表
#[derive(Debug, FromRow)]
pub struct DbDoctor {
    pub doctor_id: String,
    pub name: String,
    pub specialty: Option<String>,
    pub is_active: bool,
    pub room: Option<i32>,
}

impl TryFrom<DbDoctor> for Doctor {
    type Error = FlowError;

    fn try_from(db_doctor: DbDoctor) -> Result<Self> {
        Ok(Doctor {
            doctor_id: db_doctor.doctor_id,
            name: db_doctor.name,
            specialty: db_doctor.specialty,
            is_active: db_doctor.is_active,
            room: db_doctor.room.map(|id| to_u32(id, "room")).transpose()?,
        })
    }
}

/// 数据库号码表
#[derive(Debug, FromRow)]
pub struct DbToken {
    pub token_date: NaiveDate,
    pub number: i32,
    pub patient_id: String,
    pub doctor_id: String,
    pub issued_at: NaiveDateTime,
}

impl TryFrom<DbToken> for Token {
    type Error = FlowError;

    fn try_from(db_token: DbToken) -> Result<Self> {
        Ok(Token {
            id: TokenId::new(db_token.token_date, to_u32(db_token.number, "number")?),
            patient_id: db_token.patient_id,
            doctor_id: db_token.doctor_id,
            issued_at: db_token.issued_at,
        })
    }
}

/// 数据库工位表，队列以 JSONB 数组保存
#[derive(Debug, FromRow)]
pub struct DbStation {
    pub stage: String,
    pub id: i32,
    pub location: Option<String>,
    pub is_active: bool,
    pub pending_disable: bool,
    pub queue: Json<Vec<TokenId>>,
    pub doctor_id: Option<String>,
}

impl TryFrom<DbStation> for Station {
    type Error = FlowError;

    fn try_from(db_station: DbStation) -> Result<Self> {
        let stage: Stage = db_station.stage.parse()?;
        Ok(Station {
            key: StationKey::new(stage, to_u32(db_station.id, "station id")?),
            location: db_station.location,
            is_active: db_station.is_active,
            pending_disable: db_station.pending_disable,
            queue: StationQueue::from(db_station.queue.0),
            doctor_id: db_station.doctor_id,
        })
    }
}

/// 数据库阶段记录表
#[derive(Debug, FromRow)]
pub struct DbStageRecord {
    pub id: Uuid,
    pub token_date: NaiveDate,
    pub token_number: i32,
    pub stage: String,
    pub station_id: i32,
    pub patient_id: String,
    pub doctor_id: String,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
}

impl TryFrom<DbStageRecord> for StageRecord {
    type Error = FlowError;

    fn try_from(db_record: DbStageRecord) -> Result<Self> {
        let stage: Stage = db_record.stage.parse()?;
        Ok(StageRecord {
            id: db_record.id,
            token: TokenId::new(
                db_record.token_date,
                to_u32(db_record.token_number, "token number")?,
            ),
            station: StationKey::new(stage, to_u32(db_record.station_id, "station id")?),
            patient_id: db_record.patient_id,
            doctor_id: db_record.doctor_id,
            created_at: db_record.created_at,
            started_at: db_record.started_at,
            completed_at: db_record.completed_at,
        })
    }
}

/// 数据库整数列转换为编号
pub(crate) fn to_u32(value: i32, field: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| FlowError::Storage(format!("negative {} in database: {}", field, value)))
}

/// 编号转换为数据库整数列
pub(crate) fn to_i32(value: u32, field: &str) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| FlowError::Storage(format!("{} out of range: {}", field, value)))
}
