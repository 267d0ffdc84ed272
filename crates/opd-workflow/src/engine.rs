//! 流程编排引擎
//!
//! 组合号码发放、负载均衡、优先级队列和阶段跟踪，驱动号码依次经过
//! 分诊 → 诊室 → 药房 三个阶段。
//!
//! 加锁顺序全局一致：先取均衡游标，再按 (阶段, 编号) 升序取工位锁。
//! 每个操作的所有修改收集到一个 [`ChangeSet`] 中一次提交。

use chrono::{NaiveDate, NaiveDateTime};
use opd_core::{
    Clock, Doctor, ErrorKind, FlowError, Patient, Result, Stage, StageRecord, Station, StationKey,
    StationStatus, Token, TokenId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::events::{EventSink, FlowEvent, TracingSink};
use crate::priority::{rank, rank_or_lowest};
use crate::queue::{PriorityQueueStore, StationGuard};
use crate::routing::{BalancerGuard, StationLoadBalancer};
use crate::sequence::SequenceIssuer;
use crate::store::{ChangeSet, FlowStore};
use crate::tracker::StageTracker;

/// 取号结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Admission {
    pub token: Token,
    pub station: StationKey,
    pub position: usize,
}

/// 报到结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub token: TokenId,
    pub station: StationKey,
    pub started_at: NaiveDateTime,
}

/// 下一阶段交接结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Handoff {
    /// 已进入下一阶段的工位队列
    Queued {
        station: StationKey,
        position: usize,
    },
    /// 流程结束
    Completed,
    /// 下一阶段无法接收，当前阶段已完成
    Blocked {
        next_stage: Stage,
        kind: ErrorKind,
        code: String,
        reason: String,
    },
}

impl Handoff {
    fn blocked(next_stage: Stage, err: &FlowError) -> Self {
        Handoff::Blocked {
            next_stage,
            kind: err.kind(),
            code: err.code().to_string(),
            reason: err.to_string(),
        }
    }
}

/// 完成结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishOutcome {
    pub token: TokenId,
    pub station: StationKey,
    pub ended_at: NaiveDateTime,
    pub handoff: Handoff,
}

/// 工位启停结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationTransition {
    Enabled,
    Disabled,
    /// 队列非空，等待清空后自动停用
    Disabling,
}

impl StationTransition {
    pub fn status(&self) -> StationStatus {
        match self {
            StationTransition::Enabled => StationStatus::Active,
            StationTransition::Disabled => StationStatus::Inactive,
            StationTransition::Disabling => StationStatus::Disabling,
        }
    }
}

/// 删除工位结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Removal {
    Removed,
    /// 队列非空，已转为待停用
    Deferred,
}

/// 医生启停结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorTransition {
    pub doctor: Doctor,
    pub room: Option<StationTransition>,
}

/// 工位概况
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationSummary {
    pub key: StationKey,
    pub location: Option<String>,
    pub status: StationStatus,
    pub queue_length: usize,
    pub doctor_id: Option<String>,
}

impl From<&Station> for StationSummary {
    fn from(station: &Station) -> Self {
        Self {
            key: station.key,
            location: station.location.clone(),
            status: station.status(),
            queue_length: station.queue.len(),
            doctor_id: station.doctor_id.clone(),
        }
    }
}

/// 阶段排队项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageQueueEntry {
    pub station: StationKey,
    pub position: usize,
    pub token: TokenId,
    pub patient_id: Option<String>,
    /// 已报到的号码带有开始时间
    pub started_at: Option<NaiveDateTime>,
}

/// 流程编排引擎
pub struct FlowOrchestrator {
    store: Arc<dyn FlowStore>,
    clock: Arc<dyn Clock>,
    sequence: SequenceIssuer,
    queues: PriorityQueueStore,
    tracker: StageTracker,
    intake_balancer: StationLoadBalancer,
    pharmacy_balancer: StationLoadBalancer,
    /// 串行化工位增删与医生绑定
    admin: Mutex<()>,
    events: Arc<dyn EventSink>,
}

impl FlowOrchestrator {
    /// 创建新的编排引擎，号码从 1 开始
    pub fn new(store: Arc<dyn FlowStore>, clock: Arc<dyn Clock>) -> Self {
        let sequence = SequenceIssuer::new(clock.clone());
        Self::with_sequence(store, clock, sequence)
    }

    /// 接续存储中当天已发出的号码
    pub async fn resume(store: Arc<dyn FlowStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let last = store.last_token_number(clock.today()).await?;
        if let Some(last) = last {
            info!("Resuming token sequence after #{}", last);
        }
        let sequence = SequenceIssuer::resume(clock.clone(), last);
        Ok(Self::with_sequence(store, clock, sequence))
    }

    fn with_sequence(
        store: Arc<dyn FlowStore>,
        clock: Arc<dyn Clock>,
        sequence: SequenceIssuer,
    ) -> Self {
        Self {
            queues: PriorityQueueStore::new(store.clone()),
            store,
            clock,
            sequence,
            tracker: StageTracker::new(),
            intake_balancer: StationLoadBalancer::new(Stage::Intake),
            pharmacy_balancer: StationLoadBalancer::new(Stage::Pharmacy),
            admin: Mutex::new(()),
            events: Arc::new(TracingSink),
        }
    }

    /// 设置事件接收端
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    /// 当天日期下的号码标识
    pub fn today_token(&self, number: u32) -> TokenId {
        TokenId::new(self.clock.today(), number)
    }

    /// 指定日期或当天的号码标识
    pub fn token_id(&self, number: u32, date: Option<NaiveDate>) -> TokenId {
        TokenId::new(date.unwrap_or_else(|| self.clock.today()), number)
    }

    fn balancer(&self, stage: Stage) -> Option<&StationLoadBalancer> {
        match stage {
            Stage::Intake => Some(&self.intake_balancer),
            Stage::Pharmacy => Some(&self.pharmacy_balancer),
            Stage::Consultation => None,
        }
    }

    async fn lock_cursor(&self, stage: Stage) -> Option<BalancerGuard<'_>> {
        match self.balancer(stage) {
            Some(balancer) => Some(balancer.lock().await),
            None => None,
        }
    }

    async fn load_station(&self, key: StationKey) -> Result<Station> {
        self.store
            .get_station(key)
            .await?
            .ok_or(FlowError::StationNotFound(key))
    }

    async fn load_doctor(&self, doctor_id: &str) -> Result<Doctor> {
        self.store
            .get_doctor(doctor_id)
            .await?
            .ok_or_else(|| FlowError::DoctorNotFound(doctor_id.to_string()))
    }

    /// 取号
    ///
    /// 患者、医生和分诊工位都确认可用后才发放号码，失败的取号不占用号码。
    pub async fn admit(&self, patient_id: &str, doctor_id: &str) -> Result<Admission> {
        let patient_id = patient_id.trim();
        let doctor_id = doctor_id.trim();
        if patient_id.is_empty() {
            return Err(FlowError::InvalidInput("patient id is required".to_string()));
        }
        if doctor_id.is_empty() {
            return Err(FlowError::InvalidInput("doctor id is required".to_string()));
        }

        let patient = self
            .store
            .get_patient(patient_id)
            .await?
            .ok_or_else(|| FlowError::PatientNotFound(patient_id.to_string()))?;
        let doctor = self.load_doctor(doctor_id).await?;
        let priority = rank(patient.class);

        let mut cursor = self.intake_balancer.lock().await;
        let stations = self.store.list_stations(Stage::Intake).await?;
        let selection = cursor.select(&stations)?;

        let guard = self.queues.locks().lock(selection.station).await;
        let mut station = self.load_station(selection.station).await?;

        let issued = self.sequence.issue();
        let token = Token {
            id: TokenId::new(issued.date(), issued.number),
            patient_id: patient.uhid.clone(),
            doctor_id: doctor.doctor_id.clone(),
            issued_at: issued.issued_at,
        };

        let outcome = self
            .queues
            .insert(&guard, &mut station, token.id, priority)
            .await?;
        let record = StageRecord::queued(&token, station.key, issued.issued_at);

        let mut changes = ChangeSet::new();
        changes
            .put_token(token.clone())
            .put_station(station)
            .put_record(record);
        // 号码只在分诊游标内发放，提交失败时还未被其他取号越过
        if let Err(err) = self.store.apply(changes).await {
            self.sequence.rollback(issued);
            return Err(err);
        }
        drop(guard);
        drop(cursor);

        info!(
            "Issued token {} for patient {} ({}) to doctor {} at {}",
            token.id,
            patient.uhid,
            patient.class.as_str(),
            doctor.doctor_id,
            selection.station
        );
        self.events.publish(&FlowEvent::TokenIssued {
            token: token.id,
            patient_id: token.patient_id.clone(),
            doctor_id: token.doctor_id.clone(),
            station: selection.station,
            issued_at: token.issued_at,
        });

        Ok(Admission {
            token,
            station: selection.station,
            position: outcome.position(),
        })
    }

    /// 报到：号码开始在工位接受服务
    pub async fn report_at_station(&self, key: StationKey, token: TokenId) -> Result<ReportOutcome> {
        let _guard = self.queues.locks().lock(key).await;
        self.load_station(key).await?;

        let open = self.store.open_stage_records(key).await?;
        let record = self.tracker.report(key, token, &open, self.clock.now())?;
        let started_at = record.started_at.unwrap_or_else(|| self.clock.now());

        let mut changes = ChangeSet::new();
        changes.put_record(record);
        self.store.apply(changes).await?;

        info!("Token {} reported at {}", token, key);
        self.events.publish(&FlowEvent::StageReported {
            token,
            station: key,
            started_at,
        });

        Ok(ReportOutcome {
            token,
            station: key,
            started_at,
        })
    }

    /// 完成：结束当前阶段并交接到下一阶段
    ///
    /// 下一阶段无法接收时，当前阶段照常完成，交接结果中带回阻塞原因。
    pub async fn finish_at_station(&self, key: StationKey, token: TokenId) -> Result<FinishOutcome> {
        let next_stage = key.stage.next();
        let mut cursor = match next_stage {
            Some(stage) => self.lock_cursor(stage).await,
            None => None,
        };

        let guard = self.queues.locks().lock(key).await;
        let now = self.clock.now();
        let record = self.store.get_stage_record(token, key).await?;
        let finished = self.tracker.finish(key, token, record, now)?;

        let mut station = self.load_station(key).await?;
        self.queues.remove(&guard, &mut station, &token);
        let drained = station.pending_disable && station.queue.is_empty();
        if drained {
            station.is_active = false;
            station.pending_disable = false;
        }

        let mut changes = ChangeSet::new();
        changes.put_station(station).put_record(finished.clone());

        let mut next_guard = None;
        let handoff = match next_stage {
            None => Handoff::Completed,
            Some(next) => {
                match self
                    .plan_handoff(&finished, next, cursor.as_mut(), &mut changes, now)
                    .await
                {
                    Ok((guard, handoff)) => {
                        next_guard = Some(guard);
                        handoff
                    }
                    Err(err) if blocks_handoff(&err) => Handoff::blocked(next, &err),
                    Err(err) => return Err(err),
                }
            }
        };

        self.store.apply(changes).await?;
        drop(next_guard);
        drop(guard);
        drop(cursor);

        info!("Token {} finished at {}", token, key);
        self.events.publish(&FlowEvent::StageFinished {
            token,
            station: key,
            ended_at: now,
        });
        if drained {
            info!("Station {} drained and is now inactive", key);
            self.events.publish(&FlowEvent::StationStatusChanged {
                station: key,
                status: StationStatus::Inactive,
            });
        }
        match &handoff {
            Handoff::Queued { station, position } => {
                info!(
                    "Token {} handed off to {} at position {}",
                    token, station, position
                );
                self.events.publish(&FlowEvent::HandedOff {
                    token,
                    from: key,
                    to: *station,
                });
            }
            Handoff::Blocked {
                next_stage, reason, ..
            } => {
                warn!(
                    "Token {} finished at {} but cannot enter {}: {}",
                    token, key, next_stage, reason
                );
                self.events.publish(&FlowEvent::HandoffBlocked {
                    token,
                    from: key,
                    next_stage: *next_stage,
                    reason: reason.clone(),
                });
            }
            Handoff::Completed => {
                info!("Token {} completed the visit", token);
            }
        }

        Ok(FinishOutcome {
            token,
            station: key,
            ended_at: now,
            handoff,
        })
    }

    /// 计算交接目标并把入队与新记录写入变更集
    async fn plan_handoff(
        &self,
        finished: &StageRecord,
        next: Stage,
        cursor: Option<&mut BalancerGuard<'_>>,
        changes: &mut ChangeSet,
        now: NaiveDateTime,
    ) -> Result<(StationGuard, Handoff)> {
        let target = match (next, cursor) {
            (Stage::Consultation, _) => self.resolve_room(&finished.doctor_id).await?,
            (_, Some(cursor)) => {
                let stations = self.store.list_stations(next).await?;
                match cursor.select(&stations) {
                    Ok(selection) => selection.station,
                    Err(FlowError::NoStationsAvailable(stage)) => {
                        return Err(FlowError::NoDownstreamStation(stage))
                    }
                    Err(err) => return Err(err),
                }
            }
            (_, None) => {
                return Err(FlowError::Internal(format!(
                    "balancer for {} is not held",
                    next
                )))
            }
        };

        let guard = self.queues.locks().lock(target).await;
        let mut station = match self.store.get_station(target).await? {
            Some(station) if station.is_accepting() => station,
            _ if next == Stage::Consultation => {
                return Err(FlowError::RoomInactive {
                    doctor_id: finished.doctor_id.clone(),
                    room: Some(target),
                })
            }
            _ => return Err(FlowError::NoDownstreamStation(next)),
        };

        let patient = self.store.get_patient(&finished.patient_id).await?;
        let priority = rank_or_lowest(patient.map(|p| p.class));
        let outcome = self
            .queues
            .insert(&guard, &mut station, finished.token, priority)
            .await?;

        if self
            .store
            .get_stage_record(finished.token, target)
            .await?
            .is_none()
        {
            changes.put_record(finished.next_visit(target, now));
        }
        changes.put_station(station);

        Ok((
            guard,
            Handoff::Queued {
                station: target,
                position: outcome.position(),
            },
        ))
    }

    /// 医生的指定诊室
    async fn resolve_room(&self, doctor_id: &str) -> Result<StationKey> {
        let doctor = self.load_doctor(doctor_id).await?;
        let Some(room) = doctor.room_key() else {
            return Err(FlowError::RoomInactive {
                doctor_id: doctor.doctor_id,
                room: None,
            });
        };
        if !doctor.is_active {
            return Err(FlowError::RoomInactive {
                doctor_id: doctor.doctor_id,
                room: Some(room),
            });
        }
        Ok(room)
    }

    /// 启用或停用工位
    ///
    /// 停用非空工位时只标记待停用，队列清空后自动停用。
    pub async fn set_station_active(
        &self,
        key: StationKey,
        active: bool,
    ) -> Result<StationTransition> {
        let _cursor = self.lock_cursor(key.stage).await;
        let _guard = self.queues.locks().lock(key).await;
        let mut station = self.load_station(key).await?;

        let transition = toggle(&mut station, active);
        let status = station.status();
        let mut changes = ChangeSet::new();
        changes.put_station(station);
        self.store.apply(changes).await?;

        self.log_transition(key, transition);
        self.events.publish(&FlowEvent::StationStatusChanged {
            station: key,
            status,
        });
        Ok(transition)
    }

    fn log_transition(&self, key: StationKey, transition: StationTransition) {
        match transition {
            StationTransition::Disabling => {
                warn!("Station {} still has queued tokens, disabling deferred", key)
            }
            other => info!("Station {} is now {:?}", key, other.status()),
        }
    }

    /// 新增工位，编号为该阶段现有最大编号加一
    pub async fn add_station(
        &self,
        stage: Stage,
        location: Option<String>,
        doctor_id: Option<String>,
    ) -> Result<StationSummary> {
        let doctor_id = doctor_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        if doctor_id.is_some() && stage != Stage::Consultation {
            return Err(FlowError::InvalidInput(format!(
                "only consultation rooms can be bound to a doctor, got {}",
                stage
            )));
        }

        let _admin = self.admin.lock().await;
        let existing = self.store.list_stations(stage).await?;
        let id = existing.iter().map(|s| s.key.id).max().unwrap_or(0) + 1;
        let key = StationKey::new(stage, id);
        let mut station = Station::new(key, location);
        let mut changes = ChangeSet::new();

        let mut _previous_room = None;
        if let Some(doctor_id) = doctor_id {
            let mut doctor = self.load_doctor(&doctor_id).await?;
            if let Some(old) = doctor.room_key() {
                let guard = self.queues.locks().lock(old).await;
                if let Some(mut room) = self.store.get_station(old).await? {
                    if room.doctor_id.as_deref() == Some(doctor.doctor_id.as_str()) {
                        room.doctor_id = None;
                        changes.put_station(room);
                    }
                }
                _previous_room = Some(guard);
            }
            doctor.room = Some(id);
            station.doctor_id = Some(doctor.doctor_id.clone());
            changes.put_doctor(doctor);
        }

        let summary = StationSummary::from(&station);
        changes.put_station(station);
        self.store.apply(changes).await?;

        info!("Added station {}", key);
        self.events.publish(&FlowEvent::StationAdded { station: key });
        Ok(summary)
    }

    /// 删除工位，队列非空时转为待停用
    pub async fn remove_station(&self, key: StationKey) -> Result<Removal> {
        let _admin = self.admin.lock().await;
        let _cursor = self.lock_cursor(key.stage).await;
        let _guard = self.queues.locks().lock(key).await;
        let mut station = self.load_station(key).await?;
        let mut changes = ChangeSet::new();

        if !station.queue.is_empty() {
            station.pending_disable = true;
            changes.put_station(station);
            self.store.apply(changes).await?;
            warn!("Station {} still has queued tokens, removal deferred", key);
            self.events.publish(&FlowEvent::StationStatusChanged {
                station: key,
                status: StationStatus::Disabling,
            });
            return Ok(Removal::Deferred);
        }

        if let Some(doctor_id) = &station.doctor_id {
            if let Some(mut doctor) = self.store.get_doctor(doctor_id).await? {
                if doctor.room_key() == Some(key) {
                    doctor.room = None;
                    changes.put_doctor(doctor);
                }
            }
        }
        changes.remove_station(key);
        self.store.apply(changes).await?;

        info!("Removed station {}", key);
        self.events.publish(&FlowEvent::StationRemoved { station: key });
        Ok(Removal::Removed)
    }

    /// 启用或停用医生，同时对其诊室执行相同的启停规则
    pub async fn set_doctor_active(
        &self,
        doctor_id: &str,
        active: bool,
    ) -> Result<DoctorTransition> {
        let _admin = self.admin.lock().await;
        let mut doctor = self.load_doctor(doctor_id).await?;
        doctor.is_active = active;

        let mut changes = ChangeSet::new();
        let mut room = None;
        let mut _room_guard = None;
        if let Some(key) = doctor.room_key() {
            let guard = self.queues.locks().lock(key).await;
            if let Some(mut station) = self.store.get_station(key).await? {
                let transition = toggle(&mut station, active);
                room = Some((key, transition, station.status()));
                changes.put_station(station);
            }
            _room_guard = Some(guard);
        }
        changes.put_doctor(doctor.clone());
        self.store.apply(changes).await?;

        info!(
            "Doctor {} is now {}",
            doctor.doctor_id,
            if active { "active" } else { "inactive" }
        );
        if let Some((key, transition, status)) = room {
            self.log_transition(key, transition);
            self.events.publish(&FlowEvent::StationStatusChanged {
                station: key,
                status,
            });
        }

        Ok(DoctorTransition {
            doctor,
            room: room.map(|(_, transition, _)| transition),
        })
    }

    /// 某阶段全部工位概况，按编号排序
    pub async fn list_stations(&self, stage: Stage) -> Result<Vec<StationSummary>> {
        let stations = self.store.list_stations(stage).await?;
        Ok(stations.iter().map(StationSummary::from).collect())
    }

    /// 某阶段全部排队号码，先按工位编号再按队列顺序
    pub async fn list_stage_queue(&self, stage: Stage) -> Result<Vec<StageQueueEntry>> {
        let stations = self.store.list_stations(stage).await?;
        let mut entries = Vec::new();

        for station in stations {
            let open: HashMap<TokenId, StageRecord> = self
                .store
                .open_stage_records(station.key)
                .await?
                .into_iter()
                .map(|record| (record.token, record))
                .collect();

            for (position, token) in station.queue.iter().enumerate() {
                let (patient_id, started_at) = match open.get(token) {
                    Some(record) => (Some(record.patient_id.clone()), record.started_at),
                    None => (
                        self.store.get_token(*token).await?.map(|t| t.patient_id),
                        None,
                    ),
                };
                entries.push(StageQueueEntry {
                    station: station.key,
                    position,
                    token: *token,
                    patient_id,
                    started_at,
                });
            }
        }

        debug!("{} tokens queued in {}", entries.len(), stage);
        Ok(entries)
    }

    /// 全部工位队列中的号码总数
    pub async fn queued_tokens(&self) -> Result<usize> {
        let mut total = 0;
        for stage in Stage::ALL {
            total += self
                .store
                .list_stations(stage)
                .await?
                .iter()
                .map(|station| station.queue.len())
                .sum::<usize>();
        }
        Ok(total)
    }

    /// 单个工位的队列顺序
    pub async fn snapshot(&self, key: StationKey) -> Result<Vec<TokenId>> {
        self.queues.snapshot(key).await
    }

    pub async fn list_doctors(&self) -> Result<Vec<Doctor>> {
        self.store.list_doctors().await
    }

    pub async fn list_patients(&self) -> Result<Vec<Patient>> {
        self.store.list_patients().await
    }

    pub async fn get_patient(&self, uhid: &str) -> Result<Patient> {
        self.store
            .get_patient(uhid)
            .await?
            .ok_or_else(|| FlowError::PatientNotFound(uhid.to_string()))
    }
}

/// 应用启停规则
fn toggle(station: &mut Station, active: bool) -> StationTransition {
    if active {
        station.is_active = true;
        station.pending_disable = false;
        StationTransition::Enabled
    } else if station.queue.is_empty() {
        station.is_active = false;
        station.pending_disable = false;
        StationTransition::Disabled
    } else {
        station.pending_disable = true;
        StationTransition::Disabling
    }
}

/// 阻塞交接但不影响当前阶段完成的错误
fn blocks_handoff(err: &FlowError) -> bool {
    matches!(
        err,
        FlowError::DoctorNotFound(_)
            | FlowError::RoomInactive { .. }
            | FlowError::NoDownstreamStation(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastSink;
    use crate::store::{MemoryStore, SeedData};
    use async_trait::async_trait;
    use chrono::Duration;
    use opd_core::{ManualClock, PatientClass, StageState};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn start() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn patient(uhid: &str, class: PatientClass) -> Patient {
        Patient {
            uhid: uhid.to_string(),
            name: format!("patient {}", uhid),
            class,
            age: Some(40),
            blood_group: None,
            phone_number: None,
        }
    }

    fn doctor(id: &str, room: Option<u32>) -> Doctor {
        Doctor {
            doctor_id: id.to_string(),
            name: format!("doctor {}", id),
            specialty: None,
            is_active: true,
            room,
        }
    }

    fn room(id: u32, doctor_id: &str) -> Station {
        let mut station = Station::new(StationKey::new(Stage::Consultation, id), None);
        station.doctor_id = Some(doctor_id.to_string());
        station
    }

    fn seed() -> SeedData {
        SeedData {
            patients: vec![
                patient("U1", PatientClass::Regular),
                patient("U2", PatientClass::Emergency),
                patient("U3", PatientClass::Vip),
                patient("U4", PatientClass::Unclassified),
            ],
            doctors: vec![doctor("D1", Some(1)), doctor("D2", None)],
            stations: vec![
                Station::new(StationKey::new(Stage::Intake, 1), Some("hall A".into())),
                Station::new(StationKey::new(Stage::Intake, 2), Some("hall B".into())),
                room(1, "D1"),
                Station::new(StationKey::new(Stage::Pharmacy, 1), None),
            ],
        }
    }

    async fn orchestrator() -> (FlowOrchestrator, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::with_seed(seed()).await.unwrap());
        let clock = Arc::new(ManualClock::new(start()));
        (FlowOrchestrator::new(store, clock.clone()), clock)
    }

    fn intake(id: u32) -> StationKey {
        StationKey::new(Stage::Intake, id)
    }

    fn consult(id: u32) -> StationKey {
        StationKey::new(Stage::Consultation, id)
    }

    fn pharmacy(id: u32) -> StationKey {
        StationKey::new(Stage::Pharmacy, id)
    }

    #[tokio::test]
    async fn test_admission_numbers_and_balancing() {
        let (engine, _) = orchestrator().await;

        let first = engine.admit("U1", "D1").await.unwrap();
        let second = engine.admit("U1", "D1").await.unwrap();
        let third = engine.admit("U3", "D1").await.unwrap();

        assert_eq!(first.token.id.number, 1);
        assert_eq!(second.token.id.number, 2);
        assert_eq!(third.token.id.number, 3);
        assert_eq!(first.station, intake(1));
        assert_eq!(second.station, intake(2));
        assert_eq!(third.station, intake(1));
        // VIP 排在普通号之前
        assert_eq!(third.position, 0);
        assert_eq!(
            engine.snapshot(intake(1)).await.unwrap(),
            vec![third.token.id, first.token.id]
        );
    }

    #[tokio::test]
    async fn test_admission_validation_consumes_no_number() {
        let (engine, _) = orchestrator().await;

        assert!(matches!(
            engine.admit("", "D1").await,
            Err(FlowError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.admit("U9", "D1").await,
            Err(FlowError::PatientNotFound(_))
        ));
        assert!(matches!(
            engine.admit("U1", "D9").await,
            Err(FlowError::DoctorNotFound(_))
        ));

        let admitted = engine.admit("U1", "D1").await.unwrap();
        assert_eq!(admitted.token.id.number, 1);
    }

    #[tokio::test]
    async fn test_admission_without_open_intake() {
        let (engine, _) = orchestrator().await;
        engine.set_station_active(intake(1), false).await.unwrap();
        engine.set_station_active(intake(2), false).await.unwrap();

        let err = engine.admit("U1", "D1").await.unwrap_err();
        assert!(matches!(err, FlowError::NoStationsAvailable(Stage::Intake)));
        assert_eq!(err.kind(), ErrorKind::Unavailable);

        engine.set_station_active(intake(2), true).await.unwrap();
        let admitted = engine.admit("U1", "D1").await.unwrap();
        assert_eq!(admitted.token.id.number, 1);
        assert_eq!(admitted.station, intake(2));
    }

    #[tokio::test]
    async fn test_full_visit_through_three_stages() {
        let (engine, clock) = orchestrator().await;
        let admitted = engine.admit("U1", "D1").await.unwrap();
        let token = admitted.token.id;

        clock.advance(Duration::minutes(5));
        let reported = engine.report_at_station(intake(1), token).await.unwrap();
        assert_eq!(reported.started_at, start() + Duration::minutes(5));

        let finished = engine.finish_at_station(intake(1), token).await.unwrap();
        assert_eq!(
            finished.handoff,
            Handoff::Queued {
                station: consult(1),
                position: 0
            }
        );
        assert!(engine.snapshot(intake(1)).await.unwrap().is_empty());

        engine.report_at_station(consult(1), token).await.unwrap();
        let finished = engine.finish_at_station(consult(1), token).await.unwrap();
        assert_eq!(
            finished.handoff,
            Handoff::Queued {
                station: pharmacy(1),
                position: 0
            }
        );

        engine.report_at_station(pharmacy(1), token).await.unwrap();
        let finished = engine.finish_at_station(pharmacy(1), token).await.unwrap();
        assert_eq!(finished.handoff, Handoff::Completed);
        assert!(engine.snapshot(pharmacy(1)).await.unwrap().is_empty());

        let record = engine
            .store()
            .get_stage_record(token, pharmacy(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state(), StageState::Finished);
    }

    #[tokio::test]
    async fn test_report_on_busy_station() {
        let (engine, _) = orchestrator().await;
        let x = engine.admit("U1", "D1").await.unwrap().token.id;
        engine.admit("U1", "D1").await.unwrap();
        let y = engine.admit("U1", "D1").await.unwrap().token.id;

        engine.report_at_station(intake(1), x).await.unwrap();
        let err = engine.report_at_station(intake(1), y).await.unwrap_err();
        match err {
            FlowError::StationBusy { station, occupant } => {
                assert_eq!(station, intake(1));
                assert_eq!(occupant, x);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // 已报到的号码再次报到
        let err = engine.report_at_station(intake(1), x).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // 不在此工位排队的号码
        let err = engine
            .report_at_station(intake(2), x)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_finish_requires_report() {
        let (engine, _) = orchestrator().await;
        let token = engine.admit("U1", "D1").await.unwrap().token.id;

        let err = engine.finish_at_station(intake(1), token).await.unwrap_err();
        assert!(matches!(err, FlowError::RecordNotFound { .. }));
        assert_eq!(engine.snapshot(intake(1)).await.unwrap(), vec![token]);
    }

    #[tokio::test]
    async fn test_blocked_handoff_still_completes_current_stage() {
        let (engine, _) = orchestrator().await;
        // D2 没有指定诊室
        let token = engine.admit("U1", "D2").await.unwrap().token.id;
        engine.report_at_station(intake(1), token).await.unwrap();

        let finished = engine.finish_at_station(intake(1), token).await.unwrap();
        match finished.handoff {
            Handoff::Blocked {
                next_stage, code, ..
            } => {
                assert_eq!(next_stage, Stage::Consultation);
                assert_eq!(code, "RoomInactive");
            }
            other => panic!("unexpected handoff: {:?}", other),
        }

        let record = engine
            .store()
            .get_stage_record(token, intake(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state(), StageState::Finished);
        assert!(engine.snapshot(intake(1)).await.unwrap().is_empty());
        assert!(engine.snapshot(consult(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_doctor_blocks_room() {
        let (engine, _) = orchestrator().await;
        let token = engine.admit("U1", "D1").await.unwrap().token.id;
        engine.report_at_station(intake(1), token).await.unwrap();

        let change = engine.set_doctor_active("D1", false).await.unwrap();
        assert_eq!(change.room, Some(StationTransition::Disabled));

        let finished = engine.finish_at_station(intake(1), token).await.unwrap();
        assert!(matches!(
            finished.handoff,
            Handoff::Blocked { kind: ErrorKind::Unavailable, .. }
        ));
    }

    async fn assert_room_blocked(engine: &FlowOrchestrator, from: StationKey, token: TokenId) {
        let finished = engine.finish_at_station(from, token).await.unwrap();
        match finished.handoff {
            Handoff::Blocked {
                next_stage,
                kind,
                code,
                ..
            } => {
                assert_eq!(next_stage, Stage::Consultation);
                assert_eq!(kind, ErrorKind::Unavailable);
                assert_eq!(code, "RoomInactive");
            }
            other => panic!("unexpected handoff: {:?}", other),
        }

        let record = engine
            .store()
            .get_stage_record(token, from)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state(), StageState::Finished);
        assert!(engine.snapshot(from).await.unwrap().is_empty());
        assert!(engine
            .store()
            .get_stage_record(token, consult(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_disabled_room_blocks_active_doctor() {
        let (engine, _) = orchestrator().await;
        let token = engine.admit("U1", "D1").await.unwrap().token.id;
        engine.report_at_station(intake(1), token).await.unwrap();

        let transition = engine.set_station_active(consult(1), false).await.unwrap();
        assert_eq!(transition, StationTransition::Disabled);
        let d1 = engine.store().get_doctor("D1").await.unwrap().unwrap();
        assert!(d1.is_active);

        assert_room_blocked(&engine, intake(1), token).await;
        assert!(engine.snapshot(consult(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_draining_room_blocks_new_arrivals() {
        let (engine, _) = orchestrator().await;
        let first = engine.admit("U1", "D1").await.unwrap().token.id;
        engine.report_at_station(intake(1), first).await.unwrap();
        engine.finish_at_station(intake(1), first).await.unwrap();

        let second = engine.admit("U1", "D1").await.unwrap();
        engine
            .report_at_station(second.station, second.token.id)
            .await
            .unwrap();

        let transition = engine.set_station_active(consult(1), false).await.unwrap();
        assert_eq!(transition, StationTransition::Disabling);

        assert_room_blocked(&engine, second.station, second.token.id).await;
        assert_eq!(engine.snapshot(consult(1)).await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn test_blocked_handoff_reads_back_from_json() {
        let (engine, _) = orchestrator().await;
        let token = engine.admit("U1", "D2").await.unwrap().token.id;
        engine.report_at_station(intake(1), token).await.unwrap();
        let finished = engine.finish_at_station(intake(1), token).await.unwrap();

        let json = serde_json::to_value(&finished).unwrap();
        assert_eq!(json["handoff"]["status"], "blocked");
        assert_eq!(json["handoff"]["kind"], "Unavailable");

        let parsed: FinishOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.handoff, finished.handoff);
    }

    #[tokio::test]
    async fn test_consultation_without_pharmacy_ends_gracefully() {
        let (engine, _) = orchestrator().await;
        let token = engine.admit("U2", "D1").await.unwrap().token.id;
        engine.report_at_station(intake(1), token).await.unwrap();
        engine.finish_at_station(intake(1), token).await.unwrap();
        engine.set_station_active(pharmacy(1), false).await.unwrap();

        engine.report_at_station(consult(1), token).await.unwrap();
        let finished = engine.finish_at_station(consult(1), token).await.unwrap();
        match finished.handoff {
            Handoff::Blocked { code, .. } => assert_eq!(code, "NoDownstreamStation"),
            other => panic!("unexpected handoff: {:?}", other),
        }
        assert!(engine.snapshot(consult(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabling_waits_for_queue_to_drain() {
        let (engine, _) = orchestrator().await;
        let token = engine.admit("U1", "D1").await.unwrap().token.id;

        let transition = engine.set_station_active(intake(1), false).await.unwrap();
        assert_eq!(transition, StationTransition::Disabling);
        let summary = engine.list_stations(Stage::Intake).await.unwrap();
        assert_eq!(summary[0].status, StationStatus::Disabling);
        let station = engine.store().get_station(intake(1)).await.unwrap().unwrap();
        assert!(station.is_active);

        // 待停用工位不再接收新号码
        let next = engine.admit("U1", "D1").await.unwrap();
        assert_eq!(next.station, intake(2));

        engine.report_at_station(intake(1), token).await.unwrap();
        engine.finish_at_station(intake(1), token).await.unwrap();
        let station = engine.store().get_station(intake(1)).await.unwrap().unwrap();
        assert_eq!(station.status(), StationStatus::Inactive);

        let transition = engine.set_station_active(intake(1), false).await.unwrap();
        assert_eq!(transition, StationTransition::Disabled);
        let transition = engine.set_station_active(intake(1), true).await.unwrap();
        assert_eq!(transition, StationTransition::Enabled);
    }

    #[tokio::test]
    async fn test_add_and_remove_stations() {
        let (engine, _) = orchestrator().await;

        let added = engine
            .add_station(Stage::Pharmacy, Some("east wing".into()), None)
            .await
            .unwrap();
        assert_eq!(added.key, pharmacy(2));
        assert_eq!(added.status, StationStatus::Active);

        let room = engine
            .add_station(Stage::Consultation, None, Some("D2".into()))
            .await
            .unwrap();
        assert_eq!(room.key, consult(2));
        let doctors = engine.list_doctors().await.unwrap();
        let d2 = doctors.iter().find(|d| d.doctor_id == "D2").unwrap();
        assert_eq!(d2.room, Some(2));

        assert!(matches!(
            engine
                .add_station(Stage::Intake, None, Some("D2".into()))
                .await,
            Err(FlowError::InvalidInput(_))
        ));

        let token = engine.admit("U1", "D1").await.unwrap().token.id;
        assert_eq!(
            engine.remove_station(intake(1)).await.unwrap(),
            Removal::Deferred
        );
        assert_eq!(
            engine.snapshot(intake(1)).await.unwrap(),
            vec![token]
        );

        assert_eq!(
            engine.remove_station(consult(2)).await.unwrap(),
            Removal::Removed
        );
        let d2 = engine.store().get_doctor("D2").await.unwrap().unwrap();
        assert_eq!(d2.room, None);
        assert!(matches!(
            engine.snapshot(consult(2)).await,
            Err(FlowError::StationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stage_queue_listing() {
        let (engine, _) = orchestrator().await;
        let a = engine.admit("U1", "D1").await.unwrap().token.id;
        let b = engine.admit("U3", "D1").await.unwrap().token.id;
        let c = engine.admit("U2", "D1").await.unwrap().token.id;
        engine.report_at_station(intake(2), b).await.unwrap();

        let entries = engine.list_stage_queue(Stage::Intake).await.unwrap();
        let order: Vec<(u32, TokenId)> = entries.iter().map(|e| (e.station.id, e.token)).collect();
        assert_eq!(order, vec![(1, c), (1, a), (2, b)]);
        assert_eq!(entries[0].patient_id.as_deref(), Some("U2"));
        assert!(entries[2].started_at.is_some());
    }

    #[tokio::test]
    async fn test_midnight_rollover_restarts_numbers() {
        let (engine, clock) = orchestrator().await;
        engine.admit("U1", "D1").await.unwrap();
        engine.admit("U1", "D1").await.unwrap();

        clock.set(start() + Duration::days(1));
        let admitted = engine.admit("U1", "D1").await.unwrap();
        assert_eq!(admitted.token.id.number, 1);
        assert_eq!(admitted.token.id.date, start().date() + Duration::days(1));
    }

    #[tokio::test]
    async fn test_resume_continues_after_stored_tokens() {
        let store = Arc::new(MemoryStore::with_seed(seed()).await.unwrap());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = FlowOrchestrator::new(store.clone(), clock.clone());
        engine.admit("U1", "D1").await.unwrap();
        engine.admit("U1", "D1").await.unwrap();

        let restarted = FlowOrchestrator::resume(store, clock).await.unwrap();
        let admitted = restarted.admit("U1", "D1").await.unwrap();
        assert_eq!(admitted.token.id.number, 3);
    }

    #[tokio::test]
    async fn test_queued_tokens_counts_every_stage() {
        let (engine, _) = orchestrator().await;
        let token = engine.admit("U1", "D1").await.unwrap().token.id;
        engine.admit("U2", "D1").await.unwrap();
        engine.admit("U3", "D1").await.unwrap();
        assert_eq!(engine.queued_tokens().await.unwrap(), 3);

        engine.report_at_station(intake(1), token).await.unwrap();
        engine.finish_at_station(intake(1), token).await.unwrap();
        assert_eq!(engine.queued_tokens().await.unwrap(), 3);
        assert_eq!(engine.snapshot(consult(1)).await.unwrap(), vec![token]);
    }

    /// 提交可以被设置为失败的存储
    struct FlakyStore {
        inner: MemoryStore,
        fail: AtomicBool,
    }

    #[async_trait]
    impl FlowStore for FlakyStore {
        async fn get_patient(&self, uhid: &str) -> Result<Option<Patient>> {
            self.inner.get_patient(uhid).await
        }

        async fn list_patients(&self) -> Result<Vec<Patient>> {
            self.inner.list_patients().await
        }

        async fn get_doctor(&self, doctor_id: &str) -> Result<Option<Doctor>> {
            self.inner.get_doctor(doctor_id).await
        }

        async fn list_doctors(&self) -> Result<Vec<Doctor>> {
            self.inner.list_doctors().await
        }

        async fn get_token(&self, token: TokenId) -> Result<Option<Token>> {
            self.inner.get_token(token).await
        }

        async fn last_token_number(&self, date: NaiveDate) -> Result<Option<u32>> {
            self.inner.last_token_number(date).await
        }

        async fn get_station(&self, key: StationKey) -> Result<Option<Station>> {
            self.inner.get_station(key).await
        }

        async fn list_stations(&self, stage: Stage) -> Result<Vec<Station>> {
            self.inner.list_stations(stage).await
        }

        async fn get_stage_record(
            &self,
            token: TokenId,
            station: StationKey,
        ) -> Result<Option<StageRecord>> {
            self.inner.get_stage_record(token, station).await
        }

        async fn open_stage_records(&self, station: StationKey) -> Result<Vec<StageRecord>> {
            self.inner.open_stage_records(station).await
        }

        async fn apply(&self, changes: ChangeSet) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(FlowError::Storage("connection reset".to_string()));
            }
            self.inner.apply(changes).await
        }
    }

    #[tokio::test]
    async fn test_failed_commit_returns_the_number() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::with_seed(seed()).await.unwrap(),
            fail: AtomicBool::new(false),
        });
        let clock = Arc::new(ManualClock::new(start()));
        let engine = FlowOrchestrator::new(store.clone(), clock);

        assert_eq!(engine.admit("U1", "D1").await.unwrap().token.id.number, 1);

        store.fail.store(true, Ordering::SeqCst);
        let err = engine.admit("U1", "D1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(engine.queued_tokens().await.unwrap(), 1);

        store.fail.store(false, Ordering::SeqCst);
        assert_eq!(engine.admit("U1", "D1").await.unwrap().token.id.number, 2);
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let broadcast = Arc::new(BroadcastSink::new(16));
        let mut rx = broadcast.subscribe();
        let (engine, _) = orchestrator().await;
        let engine = engine.with_events(broadcast);

        let token = engine.admit("U1", "D1").await.unwrap().token.id;
        engine.report_at_station(intake(1), token).await.unwrap();
        engine.finish_at_station(intake(1), token).await.unwrap();

        let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.as_str())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "token.issued",
                "stage.reported",
                "stage.finished",
                "stage.handed_off"
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_issue_unique_numbers() {
        let (engine, _) = orchestrator().await;
        let engine = Arc::new(engine);

        let handles: Vec<_> = (0..40)
            .map(|i| {
                let engine = engine.clone();
                let uhid = if i % 3 == 0 { "U2" } else { "U1" };
                tokio::spawn(async move { engine.admit(uhid, "D1").await })
            })
            .collect();

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap().unwrap().token.id.number);
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=40).collect::<Vec<_>>());

        let one = engine.snapshot(intake(1)).await.unwrap().len();
        let two = engine.snapshot(intake(2)).await.unwrap().len();
        assert_eq!(one + two, 40);
        assert!(one.abs_diff(two) <= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reports_admit_one_occupant() {
        let (engine, _) = orchestrator().await;
        let engine = Arc::new(engine);
        let mut tokens = Vec::new();
        for _ in 0..10 {
            let admitted = engine.admit("U1", "D1").await.unwrap();
            if admitted.station == intake(1) {
                tokens.push(admitted.token.id);
            }
        }

        let handles: Vec<_> = tokens
            .iter()
            .map(|token| {
                let engine = engine.clone();
                let token = *token;
                tokio::spawn(async move { engine.report_at_station(intake(1), token).await })
            })
            .collect();

        let mut started = 0;
        let mut busy = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => started += 1,
                Err(FlowError::StationBusy { .. }) => busy += 1,
                Err(other) => panic!("unexpected error: {:?}", other),
            }
        }
        assert_eq!(started, 1);
        assert_eq!(busy, tokens.len() - 1);
    }
}
