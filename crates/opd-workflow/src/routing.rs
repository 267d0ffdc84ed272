//! 工位负载均衡
//!
//! 选择队列最短的工位，多个工位并列时按编号轮转。

use opd_core::{FlowError, Result, Stage, Station, StationKey};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

/// 候选工位负载
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationLoad {
    pub key: StationKey,
    pub queue_length: usize,
}

impl From<&Station> for StationLoad {
    fn from(station: &Station) -> Self {
        Self {
            key: station.key,
            queue_length: station.queue.len(),
        }
    }
}

/// 选择结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub station: StationKey,
    pub queue_length: usize,
    /// 并列最短的工位数
    pub tied: usize,
}

/// 最短队列优先，并列时轮转
///
/// 调用方负责串行化对 `cursor` 的访问。
pub fn select_least_loaded(
    stage: Stage,
    loads: &[StationLoad],
    cursor: &mut usize,
) -> Result<Selection> {
    let min_len = loads
        .iter()
        .map(|load| load.queue_length)
        .min()
        .ok_or(FlowError::NoStationsAvailable(stage))?;

    let mut eligible: Vec<StationKey> = loads
        .iter()
        .filter(|load| load.queue_length == min_len)
        .map(|load| load.key)
        .collect();
    eligible.sort();

    let station = eligible[*cursor % eligible.len()];
    *cursor = cursor.wrapping_add(1);

    Ok(Selection {
        station,
        queue_length: min_len,
        tied: eligible.len(),
    })
}

/// 阶段负载均衡器
///
/// 每个需要均衡的阶段持有一个独立的轮转游标。
#[derive(Debug)]
pub struct StationLoadBalancer {
    stage: Stage,
    cursor: Mutex<usize>,
}

impl StationLoadBalancer {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            cursor: Mutex::new(0),
        }
    }

    /// 锁定游标
    ///
    /// 持有守卫期间同阶段的其他分配被串行化，选择与入队可以在同一个临界区内完成。
    pub async fn lock(&self) -> BalancerGuard<'_> {
        BalancerGuard {
            stage: self.stage,
            cursor: self.cursor.lock().await,
        }
    }

    /// 单次选择
    pub async fn select(&self, stations: &[Station]) -> Result<Selection> {
        self.lock().await.select(stations)
    }
}

/// 游标守卫
pub struct BalancerGuard<'a> {
    stage: Stage,
    cursor: MutexGuard<'a, usize>,
}

impl BalancerGuard<'_> {
    /// 在接收新号码的工位中选择
    pub fn select(&mut self, stations: &[Station]) -> Result<Selection> {
        let loads: Vec<StationLoad> = stations
            .iter()
            .filter(|station| station.key.stage == self.stage && station.is_accepting())
            .map(StationLoad::from)
            .collect();

        let selection = select_least_loaded(self.stage, &loads, &mut self.cursor)?;
        tracing::debug!(
            "Balanced {} onto {} (queue length {}, {} tied)",
            self.stage,
            selection.station,
            selection.queue_length,
            selection.tied
        );
        Ok(selection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use opd_core::TokenId;

    fn load(id: u32, queue_length: usize) -> StationLoad {
        StationLoad {
            key: StationKey::new(Stage::Intake, id),
            queue_length,
        }
    }

    fn station(id: u32, queued: u32) -> Station {
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let mut station = Station::new(StationKey::new(Stage::Pharmacy, id), None);
        for n in 0..queued {
            station.queue.insert_at(usize::MAX, TokenId::new(day, id * 100 + n));
        }
        station
    }

    #[test]
    fn test_empty_candidates() {
        let mut cursor = 0;
        let err = select_least_loaded(Stage::Pharmacy, &[], &mut cursor).unwrap_err();
        assert!(matches!(err, FlowError::NoStationsAvailable(Stage::Pharmacy)));
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_picks_minimum_then_rotates() {
        let loads = [load(1, 2), load(2, 2), load(3, 3)];
        let mut cursor = 0;
        let first = select_least_loaded(Stage::Intake, &loads, &mut cursor).unwrap();
        let second = select_least_loaded(Stage::Intake, &loads, &mut cursor).unwrap();
        assert_eq!(first.station.id, 1);
        assert_eq!(second.station.id, 2);
        assert_eq!(first.tied, 2);
    }

    #[test]
    fn test_ties_cycle_in_id_order() {
        let loads = [load(7, 0), load(3, 0), load(5, 0)];
        let mut cursor = 0;
        let picked: Vec<u32> = (0..6)
            .map(|_| select_least_loaded(Stage::Intake, &loads, &mut cursor).unwrap().station.id)
            .collect();
        assert_eq!(picked, vec![3, 5, 7, 3, 5, 7]);
    }

    #[test]
    fn test_single_minimum_always_wins() {
        let loads = [load(1, 4), load(2, 1), load(3, 4)];
        let mut cursor = 5;
        for _ in 0..3 {
            let selection = select_least_loaded(Stage::Intake, &loads, &mut cursor).unwrap();
            assert_eq!(selection.station.id, 2);
        }
    }

    #[tokio::test]
    async fn test_balancer_skips_draining_and_inactive() {
        let balancer = StationLoadBalancer::new(Stage::Pharmacy);
        let mut draining = station(1, 0);
        draining.pending_disable = true;
        let mut closed = station(2, 0);
        closed.is_active = false;
        let open = station(3, 5);

        let selection = balancer.select(&[draining, closed, open]).await.unwrap();
        assert_eq!(selection.station.id, 3);
    }

    #[tokio::test]
    async fn test_balancer_without_open_station() {
        let balancer = StationLoadBalancer::new(Stage::Pharmacy);
        let mut closed = station(1, 0);
        closed.is_active = false;
        let err = balancer.select(&[closed]).await.unwrap_err();
        assert!(matches!(err, FlowError::NoStationsAvailable(Stage::Pharmacy)));
    }
}
