//! 工位优先级队列
//!
//! 每个工位一个有序号码序列：优先级为主序，同优先级保持到达顺序。
//! 队列的每次读-改-写都在该工位的锁内完成，不同工位之间互不阻塞。

use async_trait::async_trait;
use opd_core::{FlowError, Result, Station, StationKey, StationQueue, TokenId};
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::priority::{rank_or_lowest, Priority};
use crate::store::{ChangeSet, FlowStore};

/// 队列项优先级查询
///
/// 插入时逐项查询已排队号码的优先级，不在队列中缓存。
#[async_trait]
pub trait PriorityLookup: Send + Sync {
    async fn priority_of(&self, token: &TokenId) -> Result<Priority>;
}

/// 通过存储解析 号码 → 患者 → 类别
pub struct StoreLookup<'a>(pub &'a dyn FlowStore);

#[async_trait]
impl PriorityLookup for StoreLookup<'_> {
    async fn priority_of(&self, token: &TokenId) -> Result<Priority> {
        let Some(token) = self.0.get_token(*token).await? else {
            return Ok(Priority::LOWEST);
        };
        let patient = self.0.get_patient(&token.patient_id).await?;
        Ok(rank_or_lowest(patient.map(|p| p.class)))
    }
}

/// 入队结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Inserted { position: usize },
    /// 号码已在队列中，按幂等成功处理
    AlreadyQueued { position: usize },
}

impl EnqueueOutcome {
    pub fn position(&self) -> usize {
        match self {
            EnqueueOutcome::Inserted { position } | EnqueueOutcome::AlreadyQueued { position } => {
                *position
            }
        }
    }
}

/// 按优先级插入
///
/// 从队首扫描，插在第一个优先级数值更大的号码之前；没有则追加到末尾。
pub async fn insert_by_priority(
    queue: &mut StationQueue,
    token: TokenId,
    priority: Priority,
    lookup: &dyn PriorityLookup,
) -> Result<EnqueueOutcome> {
    if let Some(position) = queue.position(&token) {
        return Ok(EnqueueOutcome::AlreadyQueued { position });
    }

    let mut insert_idx = queue.len();
    for (idx, queued) in queue.iter().enumerate() {
        let queued_priority = lookup.priority_of(queued).await?;
        if priority.is_more_urgent_than(queued_priority) {
            insert_idx = idx;
            break;
        }
    }

    let position = queue.insert_at(insert_idx, token);
    Ok(EnqueueOutcome::Inserted { position })
}

/// 已持有的工位锁
pub struct StationGuard {
    key: StationKey,
    _guard: OwnedMutexGuard<()>,
}

impl StationGuard {
    pub fn key(&self) -> StationKey {
        self.key
    }
}

/// 工位锁注册表
#[derive(Debug, Default)]
pub struct StationLocks {
    locks: SyncMutex<HashMap<StationKey, Arc<Mutex<()>>>>,
}

impl StationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: StationKey) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 锁定单个工位
    pub async fn lock(&self, key: StationKey) -> StationGuard {
        let guard = self.handle(key).lock_owned().await;
        StationGuard { key, _guard: guard }
    }
}

/// 工位优先级队列存储
pub struct PriorityQueueStore {
    store: Arc<dyn FlowStore>,
    locks: StationLocks,
}

impl PriorityQueueStore {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self {
            store,
            locks: StationLocks::new(),
        }
    }

    pub fn locks(&self) -> &StationLocks {
        &self.locks
    }

    /// 在已锁定的工位上插入号码，由调用方负责提交
    pub async fn insert(
        &self,
        guard: &StationGuard,
        station: &mut Station,
        token: TokenId,
        priority: Priority,
    ) -> Result<EnqueueOutcome> {
        debug_assert_eq!(guard.key(), station.key);
        let lookup = StoreLookup(self.store.as_ref());
        let outcome = insert_by_priority(&mut station.queue, token, priority, &lookup).await?;
        if let EnqueueOutcome::AlreadyQueued { position } = outcome {
            tracing::debug!(
                "Token {} already queued at {} (position {})",
                token,
                station.key,
                position
            );
        }
        Ok(outcome)
    }

    /// 在已锁定的工位上移除号码，由调用方负责提交
    pub fn remove(&self, guard: &StationGuard, station: &mut Station, token: &TokenId) -> bool {
        debug_assert_eq!(guard.key(), station.key);
        station.queue.remove(token)
    }

    /// 入队并提交
    pub async fn enqueue(
        &self,
        key: StationKey,
        token: TokenId,
        priority: Priority,
    ) -> Result<EnqueueOutcome> {
        let guard = self.locks.lock(key).await;
        let mut station = self.load(key).await?;
        let outcome = self.insert(&guard, &mut station, token, priority).await?;

        if matches!(outcome, EnqueueOutcome::Inserted { .. }) {
            let mut changes = ChangeSet::new();
            changes.put_station(station);
            self.store.apply(changes).await?;
        }
        Ok(outcome)
    }

    /// 出队并提交，号码不存在时无操作
    pub async fn dequeue(&self, key: StationKey, token: TokenId) -> Result<bool> {
        let guard = self.locks.lock(key).await;
        let mut station = self.load(key).await?;
        let removed = self.remove(&guard, &mut station, &token);

        if removed {
            let mut changes = ChangeSet::new();
            changes.put_station(station);
            self.store.apply(changes).await?;
        }
        Ok(removed)
    }

    /// 当前队列顺序
    pub async fn snapshot(&self, key: StationKey) -> Result<Vec<TokenId>> {
        let station = self.load(key).await?;
        Ok(station.queue.into())
    }

    async fn load(&self, key: StationKey) -> Result<Station> {
        self.store
            .get_station(key)
            .await?
            .ok_or(FlowError::StationNotFound(key))
    }
}
