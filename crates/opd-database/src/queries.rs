//! 数据库查询操作

use crate::connection::DatabasePool;
use crate::models::*;
use chrono::NaiveDate;
use opd_core::{
    Doctor, Patient, Result, Stage, StageRecord, Station, StationKey, Token, TokenId,
};
use sqlx::types::Json;
use sqlx::PgConnection;

/// 数据库查询操作接口
pub struct DatabaseQueries<'a> {
    pool: &'a DatabasePool,
}

impl<'a> DatabaseQueries<'a> {
    pub fn new(pool: &'a DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        // 创建患者表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS patients (
                uhid VARCHAR(64) PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                class VARCHAR(16) NOT NULL DEFAULT 'Unclassified',
                age INTEGER,
                blood_group VARCHAR(8),
                phone_number VARCHAR(32),
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
        "#,
        )
        .execute(pool)
        .await?;

        // 创建医生表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS doctors (
                doctor_id VARCHAR(64) PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                specialty VARCHAR(128),
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                room INTEGER
            )
        "#,
        )
        .execute(pool)
        .await?;

        // 创建号码表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                token_date DATE NOT NULL,
                number INTEGER NOT NULL,
                patient_id VARCHAR(64) NOT NULL REFERENCES patients(uhid),
                doctor_id VARCHAR(64) NOT NULL REFERENCES doctors(doctor_id),
                issued_at TIMESTAMP NOT NULL,
                PRIMARY KEY (token_date, number)
            )
        "#,
        )
        .execute(pool)
        .await?;

        // 创建工位表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stations (
                stage VARCHAR(16) NOT NULL,
                id INTEGER NOT NULL,
                location VARCHAR(255),
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                pending_disable BOOLEAN NOT NULL DEFAULT FALSE,
                queue JSONB NOT NULL DEFAULT '[]',
                doctor_id VARCHAR(64),
                PRIMARY KEY (stage, id)
            )
        "#,
        )
        .execute(pool)
        .await?;

        // 创建阶段记录表
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS stage_records (
                id UUID PRIMARY KEY,
                token_date DATE NOT NULL,
                token_number INTEGER NOT NULL,
                stage VARCHAR(16) NOT NULL,
                station_id INTEGER NOT NULL,
                patient_id VARCHAR(64) NOT NULL,
                doctor_id VARCHAR(64) NOT NULL,
                created_at TIMESTAMP NOT NULL,
                started_at TIMESTAMP,
                completed_at TIMESTAMP,
                UNIQUE (token_date, token_number, stage, station_id)
            )
        "#,
        )
        .execute(pool)
        .await?;

        // 创建索引以优化查询性能
        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_tokens_patient_id ON tokens(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_stations_doctor_id ON stations(doctor_id)",
            "CREATE INDEX IF NOT EXISTS idx_stage_records_station ON stage_records(stage, station_id)",
            "CREATE INDEX IF NOT EXISTS idx_stage_records_open ON stage_records(stage, station_id) WHERE completed_at IS NULL",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        tracing::info!("Database indexes created successfully");
        Ok(())
    }

    // ========== 患者与医生 ==========

    pub async fn get_patient(&self, uhid: &str) -> Result<Option<Patient>> {
        let row = sqlx::query_as::<_, DbPatient>(
            "SELECT uhid, name, class, age, blood_group, phone_number FROM patients WHERE uhid = $1",
        )
        .bind(uhid)
        .fetch_optional(self.pool.pool())
        .await?;
        Ok(row.map(Patient::from))
    }

    pub async fn list_patients(&self) -> Result<Vec<Patient>> {
        let rows = sqlx::query_as::<_, DbPatient>(
            "SELECT uhid, name, class, age, blood_group, phone_number FROM patients ORDER BY uhid",
        )
        .fetch_all(self.pool.pool())
        .await?;
        Ok(rows.into_iter().map(Patient::from).collect())
    }

    pub async fn get_doctor(&self, doctor_id: &str) -> Result<Option<Doctor>> {
        let row = sqlx::query_as::<_, DbDoctor>(
            "SELECT doctor_id, name, specialty, is_active, room FROM doctors WHERE doctor_id = $1",
        )
        .bind(doctor_id)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(Doctor::try_from).transpose()
    }

    pub async fn list_doctors(&self) -> Result<Vec<Doctor>> {
        let rows = sqlx::query_as::<_, DbDoctor>(
            "SELECT doctor_id, name, specialty, is_active, room FROM doctors ORDER BY doctor_id",
        )
        .fetch_all(self.pool.pool())
        .await?;
        rows.into_iter().map(Doctor::try_from).collect()
    }

    // ========== 号码 ==========

    pub async fn get_token(&self, token: TokenId) -> Result<Option<Token>> {
        let row = sqlx::query_as::<_, DbToken>(
            r#"
            SELECT token_date, number, patient_id, doctor_id, issued_at
            FROM tokens WHERE token_date = $1 AND number = $2
        "#,
        )
        .bind(token.date)
        .bind(to_i32(token.number, "token number")?)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(Token::try_from).transpose()
    }

    pub async fn last_token_number(&self, date: NaiveDate) -> Result<Option<u32>> {
        let max: Option<i32> =
            sqlx::query_scalar("SELECT MAX(number) FROM tokens WHERE token_date = $1")
                .bind(date)
                .fetch_one(self.pool.pool())
                .await?;
        max.map(|n| to_u32(n, "token number")).transpose()
    }

    // ========== 工位 ==========

    pub async fn get_station(&self, key: StationKey) -> Result<Option<Station>> {
        let row = sqlx::query_as::<_, DbStation>(
            r#"
            SELECT stage, id, location, is_active, pending_disable, queue, doctor_id
            FROM stations WHERE stage = $1 AND id = $2
        "#,
        )
        .bind(key.stage.as_str())
        .bind(to_i32(key.id, "station id")?)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(Station::try_from).transpose()
    }

    pub async fn list_stations(&self, stage: Stage) -> Result<Vec<Station>> {
        let rows = sqlx::query_as::<_, DbStation>(
            r#"
            SELECT stage, id, location, is_active, pending_disable, queue, doctor_id
            FROM stations WHERE stage = $1 ORDER BY id
        "#,
        )
        .bind(stage.as_str())
        .fetch_all(self.pool.pool())
        .await?;
        rows.into_iter().map(Station::try_from).collect()
    }

    // ========== 阶段记录 ==========

    pub async fn get_stage_record(
        &self,
        token: TokenId,
        station: StationKey,
    ) -> Result<Option<StageRecord>> {
        let row = sqlx::query_as::<_, DbStageRecord>(
            r#"
            SELECT * FROM stage_records
            WHERE token_date = $1 AND token_number = $2 AND stage = $3 AND station_id = $4
        "#,
        )
        .bind(token.date)
        .bind(to_i32(token.number, "token number")?)
        .bind(station.stage.as_str())
        .bind(to_i32(station.id, "station id")?)
        .fetch_optional(self.pool.pool())
        .await?;
        row.map(StageRecord::try_from).transpose()
    }

    pub async fn open_stage_records(&self, station: StationKey) -> Result<Vec<StageRecord>> {
        let rows = sqlx::query_as::<_, DbStageRecord>(
            r#"
            SELECT * FROM stage_records
            WHERE stage = $1 AND station_id = $2 AND completed_at IS NULL
            ORDER BY created_at
        "#,
        )
        .bind(station.stage.as_str())
        .bind(to_i32(station.id, "station id")?)
        .fetch_all(self.pool.pool())
        .await?;
        rows.into_iter().map(StageRecord::try_from).collect()
    }
}

// ========== 写入操作，在调用方的事务内执行 ==========

pub(crate) async fn upsert_patient(conn: &mut PgConnection, patient: &Patient) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO patients (uhid, name, class, age, blood_group, phone_number)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (uhid) DO UPDATE SET
            name = EXCLUDED.name,
            class = EXCLUDED.class,
            age = EXCLUDED.age,
            blood_group = EXCLUDED.blood_group,
            phone_number = EXCLUDED.phone_number
    "#,
    )
    .bind(&patient.uhid)
    .bind(&patient.name)
    .bind(patient.class.as_str())
    .bind(patient.age)
    .bind(&patient.blood_group)
    .bind(&patient.phone_number)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn upsert_doctor(conn: &mut PgConnection, doctor: &Doctor) -> Result<()> {
    let room = doctor.room.map(|id| to_i32(id, "room")).transpose()?;
    sqlx::query(
        r#"
        INSERT INTO doctors (doctor_id, name, specialty, is_active, room)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (doctor_id) DO UPDATE SET
            name = EXCLUDED.name,
            specialty = EXCLUDED.specialty,
            is_active = EXCLUDED.is_active,
            room = EXCLUDED.room
    "#,
    )
    .bind(&doctor.doctor_id)
    .bind(&doctor.name)
    .bind(&doctor.specialty)
    .bind(doctor.is_active)
    .bind(room)
    .execute(conn)
    .await?;
    Ok(())
}

/// 号码不可变，重复写入时保留原值
pub(crate) async fn insert_token(conn: &mut PgConnection, token: &Token) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tokens (token_date, number, patient_id, doctor_id, issued_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (token_date, number) DO NOTHING
    "#,
    )
    .bind(token.id.date)
    .bind(to_i32(token.id.number, "token number")?)
    .bind(&token.patient_id)
    .bind(&token.doctor_id)
    .bind(token.issued_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn upsert_station(conn: &mut PgConnection, station: &Station) -> Result<()> {
    let queue: Vec<TokenId> = station.queue.as_slice().to_vec();
    sqlx::query(
        r#"
        INSERT INTO stations (stage, id, location, is_active, pending_disable, queue, doctor_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (stage, id) DO UPDATE SET
            location = EXCLUDED.location,
            is_active = EXCLUDED.is_active,
            pending_disable = EXCLUDED.pending_disable,
            queue = EXCLUDED.queue,
            doctor_id = EXCLUDED.doctor_id
    "#,
    )
    .bind(station.key.stage.as_str())
    .bind(to_i32(station.key.id, "station id")?)
    .bind(&station.location)
    .bind(station.is_active)
    .bind(station.pending_disable)
    .bind(Json(queue))
    .bind(&station.doctor_id)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn upsert_stage_record(
    conn: &mut PgConnection,
    record: &StageRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO stage_records (
            id, token_date, token_number, stage, station_id,
            patient_id, doctor_id, created_at, started_at, completed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (token_date, token_number, stage, station_id) DO UPDATE SET
            started_at = EXCLUDED.started_at,
            completed_at = EXCLUDED.completed_at
    "#,
    )
    .bind(record.id)
    .bind(record.token.date)
    .bind(to_i32(record.token.number, "token number")?)
    .bind(record.station.stage.as_str())
    .bind(to_i32(record.station.id, "station id")?)
    .bind(&record.patient_id)
    .bind(&record.doctor_id)
    .bind(record.created_at)
    .bind(record.started_at)
    .bind(record.completed_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn delete_station(conn: &mut PgConnection, key: StationKey) -> Result<()> {
    sqlx::query("DELETE FROM stations WHERE stage = $1 AND id = $2")
        .bind(key.stage.as_str())
        .bind(to_i32(key.id, "station id")?)
        .execute(conn)
        .await?;
    Ok(())
}
