//! 存储接口
//!
//! 流程核心只通过 [`FlowStore`] 访问持久化记录。所有多步更新先在内存中组装为
//! [`ChangeSet`]，再由存储一次性提交。

use async_trait::async_trait;
use chrono::NaiveDate;
use opd_core::{
    Doctor, Patient, Result, Stage, StageRecord, Station, StationKey, Token, TokenId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// 一次原子提交的变更集合
#[derive(Debug, Default, Clone)]
pub struct ChangeSet {
    pub patients: Vec<Patient>,
    pub doctors: Vec<Doctor>,
    pub tokens: Vec<Token>,
    pub stations: Vec<Station>,
    pub records: Vec<StageRecord>,
    pub removed_stations: Vec<StationKey>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
            && self.doctors.is_empty()
            && self.tokens.is_empty()
            && self.stations.is_empty()
            && self.records.is_empty()
            && self.removed_stations.is_empty()
    }

    pub fn put_station(&mut self, station: Station) -> &mut Self {
        self.stations.retain(|s| s.key != station.key);
        self.stations.push(station);
        self
    }

    pub fn put_record(&mut self, record: StageRecord) -> &mut Self {
        self.records
            .retain(|r| !(r.token == record.token && r.station == record.station));
        self.records.push(record);
        self
    }

    pub fn put_token(&mut self, token: Token) -> &mut Self {
        self.tokens.push(token);
        self
    }

    pub fn put_doctor(&mut self, doctor: Doctor) -> &mut Self {
        self.doctors.retain(|d| d.doctor_id != doctor.doctor_id);
        self.doctors.push(doctor);
        self
    }

    pub fn remove_station(&mut self, key: StationKey) -> &mut Self {
        self.stations.retain(|s| s.key != key);
        self.removed_stations.push(key);
        self
    }
}

/// 持久化存储接口
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn get_patient(&self, uhid: &str) -> Result<Option<Patient>>;

    async fn list_patients(&self) -> Result<Vec<Patient>>;

    async fn get_doctor(&self, doctor_id: &str) -> Result<Option<Doctor>>;

    async fn list_doctors(&self) -> Result<Vec<Doctor>>;

    async fn get_token(&self, token: TokenId) -> Result<Option<Token>>;

    /// 指定日期已发出的最大号码
    async fn last_token_number(&self, date: NaiveDate) -> Result<Option<u32>>;

    async fn get_station(&self, key: StationKey) -> Result<Option<Station>>;

    /// 按编号升序返回某阶段的全部工位
    async fn list_stations(&self, stage: Stage) -> Result<Vec<Station>>;

    async fn get_stage_record(
        &self,
        token: TokenId,
        station: StationKey,
    ) -> Result<Option<StageRecord>>;

    /// 工位上尚未完成的记录
    async fn open_stage_records(&self, station: StationKey) -> Result<Vec<StageRecord>>;

    /// 原子提交，失败时不留下任何部分写入
    async fn apply(&self, changes: ChangeSet) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    patients: HashMap<String, Patient>,
    doctors: BTreeMap<String, Doctor>,
    tokens: HashMap<TokenId, Token>,
    stations: BTreeMap<StationKey, Station>,
    records: HashMap<(TokenId, StationKey), StageRecord>,
}

/// 内存存储
///
/// 参考实现，也是测试夹具。整个变更集在同一把写锁下提交。
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

/// 种子数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub patients: Vec<Patient>,
    #[serde(default)]
    pub doctors: Vec<Doctor>,
    #[serde(default)]
    pub stations: Vec<Station>,
}

impl SeedData {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn into_changes(self) -> ChangeSet {
        ChangeSet {
            patients: self.patients,
            doctors: self.doctors,
            stations: self.stations,
            ..Default::default()
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以种子数据初始化
    pub async fn with_seed(seed: SeedData) -> Result<Self> {
        let store = Self::new();
        store.apply(seed.into_changes()).await?;
        Ok(store)
    }
}

#[async_trait]
impl FlowStore for MemoryStore {
    async fn get_patient(&self, uhid: &str) -> Result<Option<Patient>> {
        Ok(self.state.read().await.patients.get(uhid).cloned())
    }

    async fn list_patients(&self) -> Result<Vec<Patient>> {
        let state = self.state.read().await;
        let mut patients: Vec<Patient> = state.patients.values().cloned().collect();
        patients.sort_by(|a, b| a.uhid.cmp(&b.uhid));
        Ok(patients)
    }

    async fn get_doctor(&self, doctor_id: &str) -> Result<Option<Doctor>> {
        Ok(self.state.read().await.doctors.get(doctor_id).cloned())
    }

    async fn list_doctors(&self) -> Result<Vec<Doctor>> {
        Ok(self.state.read().await.doctors.values().cloned().collect())
    }

    async fn get_token(&self, token: TokenId) -> Result<Option<Token>> {
        Ok(self.state.read().await.tokens.get(&token).cloned())
    }

    async fn last_token_number(&self, date: NaiveDate) -> Result<Option<u32>> {
        let state = self.state.read().await;
        Ok(state
            .tokens
            .keys()
            .filter(|id| id.date == date)
            .map(|id| id.number)
            .max())
    }

    async fn get_station(&self, key: StationKey) -> Result<Option<Station>> {
        Ok(self.state.read().await.stations.get(&key).cloned())
    }

    async fn list_stations(&self, stage: Stage) -> Result<Vec<Station>> {
        let state = self.state.read().await;
        Ok(state
            .stations
            .values()
            .filter(|s| s.key.stage == stage)
            .cloned()
            .collect())
    }

    async fn get_stage_record(
        &self,
        token: TokenId,
        station: StationKey,
    ) -> Result<Option<StageRecord>> {
        Ok(self.state.read().await.records.get(&(token, station)).cloned())
    }

    async fn open_stage_records(&self, station: StationKey) -> Result<Vec<StageRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<StageRecord> = state
            .records
            .values()
            .filter(|r| r.station == station && r.completed_at.is_none())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn apply(&self, changes: ChangeSet) -> Result<()> {
        let mut state = self.state.write().await;

        for patient in changes.patients {
            state.patients.insert(patient.uhid.clone(), patient);
        }
        for doctor in changes.doctors {
            state.doctors.insert(doctor.doctor_id.clone(), doctor);
        }
        for token in changes.tokens {
            state.tokens.insert(token.id, token);
        }
        for station in changes.stations {
            state.stations.insert(station.key, station);
        }
        for record in changes.records {
            state.records.insert((record.token, record.station), record);
        }
        for key in changes.removed_stations {
            state.stations.remove(&key);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opd_core::PatientClass;

    #[tokio::test]
    async fn test_seed_and_listing() {
        let seed = SeedData::from_json(
            r#"{
                "patients": [{"uhid": "U2", "name": "B", "class": "Vip"},
                             {"uhid": "U1", "name": "A", "class": "Emergency"}],
                "doctors": [{"doctor_id": "D1", "name": "Dr. A", "specialty": null, "room": 1}],
                "stations": [
                    {"key": {"stage": "intake", "id": 2}, "location": null, "is_active": true, "doctor_id": null},
                    {"key": {"stage": "intake", "id": 1}, "location": "Hall", "is_active": true, "doctor_id": null},
                    {"key": {"stage": "consultation", "id": 1}, "location": null, "is_active": true, "doctor_id": "D1"}
                ]
            }"#,
        )
        .unwrap();

        let store = MemoryStore::with_seed(seed).await.unwrap();
        let patients = store.list_patients().await.unwrap();
        assert_eq!(patients[0].uhid, "U1");
        assert_eq!(patients[0].class, PatientClass::Emergency);

        let doctor = store.get_doctor("D1").await.unwrap().unwrap();
        assert!(doctor.is_active);

        let intake = store.list_stations(Stage::Intake).await.unwrap();
        assert_eq!(intake.iter().map(|s| s.key.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(intake[0].queue.is_empty());
    }

    #[tokio::test]
    async fn test_change_set_removal_wins() {
        let store = MemoryStore::new();
        let key = StationKey::new(Stage::Pharmacy, 1);
        let mut changes = ChangeSet::new();
        changes.put_station(Station::new(key, None));
        store.apply(changes).await.unwrap();

        let mut changes = ChangeSet::new();
        changes.remove_station(key);
        store.apply(changes).await.unwrap();
        assert!(store.get_station(key).await.unwrap().is_none());
    }
}
