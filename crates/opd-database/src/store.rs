//! PostgreSQL 流程存储

use async_trait::async_trait;
use chrono::NaiveDate;
use opd_core::{Doctor, Patient, Result, Stage, StageRecord, Station, StationKey, Token, TokenId};
use opd_workflow::{ChangeSet, FlowStore};

use crate::connection::DatabasePool;
use crate::queries::{self, DatabaseQueries};

/// PostgreSQL 存储
///
/// 每个变更集在一个事务中提交，任何一步失败整体回滚。
#[derive(Debug, Clone)]
pub struct PgFlowStore {
    pool: DatabasePool,
}

impl PgFlowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn queries(&self) -> DatabaseQueries<'_> {
        DatabaseQueries::new(&self.pool)
    }

    /// 建表
    pub async fn migrate(&self) -> Result<()> {
        self.queries().create_tables().await
    }
}

#[async_trait]
impl FlowStore for PgFlowStore {
    async fn get_patient(&self, uhid: &str) -> Result<Option<Patient>> {
        self.queries().get_patient(uhid).await
    }

    async fn list_patients(&self) -> Result<Vec<Patient>> {
        self.queries().list_patients().await
    }

    async fn get_doctor(&self, doctor_id: &str) -> Result<Option<Doctor>> {
        self.queries().get_doctor(doctor_id).await
    }

    async fn list_doctors(&self) -> Result<Vec<Doctor>> {
        self.queries().list_doctors().await
    }

    async fn get_token(&self, token: TokenId) -> Result<Option<Token>> {
        self.queries().get_token(token).await
    }

    async fn last_token_number(&self, date: NaiveDate) -> Result<Option<u32>> {
        self.queries().last_token_number(date).await
    }

    async fn get_station(&self, key: StationKey) -> Result<Option<Station>> {
        self.queries().get_station(key).await
    }

    async fn list_stations(&self, stage: Stage) -> Result<Vec<Station>> {
        self.queries().list_stations(stage).await
    }

    async fn get_stage_record(
        &self,
        token: TokenId,
        station: StationKey,
    ) -> Result<Option<StageRecord>> {
        self.queries().get_stage_record(token, station).await
    }

    async fn open_stage_records(&self, station: StationKey) -> Result<Vec<StageRecord>> {
        self.queries().open_stage_records(station).await
    }

    async fn apply(&self, changes: ChangeSet) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.pool().begin().await?;

        for patient in &changes.patients {
            queries::upsert_patient(&mut tx, patient).await?;
        }
        for doctor in &changes.doctors {
            queries::upsert_doctor(&mut tx, doctor).await?;
        }
        for token in &changes.tokens {
            queries::insert_token(&mut tx, token).await?;
        }
        for station in &changes.stations {
            queries::upsert_station(&mut tx, station).await?;
        }
        for record in &changes.records {
            queries::upsert_stage_record(&mut tx, record).await?;
        }
        for key in &changes.removed_stations {
            queries::delete_station(&mut tx, *key).await?;
        }

        tx.commit().await?;
        tracing::debug!(
            "Committed change set: {} tokens, {} stations, {} records",
            changes.tokens.len(),
            changes.stations.len(),
            changes.records.len()
        );
        Ok(())
    }
}
