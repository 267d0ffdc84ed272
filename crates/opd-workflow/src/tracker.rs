//! 工位服务跟踪
//!
//! 基于状态机校验报到与完成，并保证每个工位同一时刻只服务一个号码。
//! 这里只做纯计算，加锁与提交由编排引擎负责。

use chrono::NaiveDateTime;
use opd_core::{FlowError, Result, StageRecord, StageState, StationKey, TokenId};

use crate::state_machine::{StageEvent, StageStateMachine};

/// 阶段跟踪器
#[derive(Debug, Default)]
pub struct StageTracker {
    machine: StageStateMachine,
}

impl StageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前在工位上服务中的记录
    pub fn occupant<'a>(&self, open_records: &'a [StageRecord]) -> Option<&'a StageRecord> {
        open_records
            .iter()
            .find(|record| record.state() == StageState::Reported)
    }

    /// 报到：排队 → 服务中
    ///
    /// `open_records` 必须是在工位锁内读取的该工位全部未完成记录。
    pub fn report(
        &self,
        station: StationKey,
        token: TokenId,
        open_records: &[StageRecord],
        now: NaiveDateTime,
    ) -> Result<StageRecord> {
        if let Some(occupant) = self.occupant(open_records) {
            if occupant.token != token {
                return Err(FlowError::StationBusy {
                    station,
                    occupant: occupant.token,
                });
            }
        }

        let mut record = open_records
            .iter()
            .find(|record| record.token == token && record.station == station)
            .cloned()
            .ok_or_else(|| FlowError::RecordNotFound {
                token,
                station,
                reason: "no queued record".to_string(),
            })?;

        self.advance(&mut record, StageEvent::Report)?;
        record.started_at = Some(now);
        Ok(record)
    }

    /// 完成：服务中 → 完成
    pub fn finish(
        &self,
        station: StationKey,
        token: TokenId,
        record: Option<StageRecord>,
        now: NaiveDateTime,
    ) -> Result<StageRecord> {
        let mut record = record.ok_or_else(|| FlowError::RecordNotFound {
            token,
            station,
            reason: "no stage record".to_string(),
        })?;

        self.advance(&mut record, StageEvent::Finish)?;
        record.completed_at = Some(now);
        Ok(record)
    }

    fn advance(&self, record: &mut StageRecord, event: StageEvent) -> Result<StageState> {
        let from = record.state();
        self.machine
            .transition(from, event)
            .map_err(|_| FlowError::RecordNotFound {
                token: record.token,
                station: record.station,
                reason: format!("cannot {:?} from {:?}", event, from),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use opd_core::{Stage, Token};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn record(n: u32, station: StationKey) -> StageRecord {
        let token = Token {
            id: TokenId::new(now().date(), n),
            patient_id: format!("U{}", n),
            doctor_id: "D1".into(),
            issued_at: now(),
        };
        StageRecord::queued(&token, station, now())
    }

    #[test]
    fn test_report_then_finish() {
        let tracker = StageTracker::new();
        let station = StationKey::new(Stage::Intake, 1);
        let records = vec![record(1, station)];
        let token = records[0].token;

        let reported = tracker.report(station, token, &records, now()).unwrap();
        assert_eq!(reported.state(), StageState::Reported);

        let finished = tracker.finish(station, token, Some(reported), now()).unwrap();
        assert_eq!(finished.state(), StageState::Finished);
    }

    #[test]
    fn test_second_report_is_busy() {
        let tracker = StageTracker::new();
        let station = StationKey::new(Stage::Consultation, 2);
        let mut records = vec![record(1, station), record(2, station)];
        records[0] = tracker
            .report(station, records[0].token, &records, now())
            .unwrap();

        let err = tracker
            .report(station, records[1].token, &records, now())
            .unwrap_err();
        match err {
            FlowError::StationBusy { occupant, .. } => assert_eq!(occupant.number, 1),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_report_again_is_not_found() {
        let tracker = StageTracker::new();
        let station = StationKey::new(Stage::Pharmacy, 1);
        let mut records = vec![record(1, station)];
        records[0] = tracker
            .report(station, records[0].token, &records, now())
            .unwrap();

        let err = tracker
            .report(station, records[0].token, &records, now())
            .unwrap_err();
        assert!(matches!(err, FlowError::RecordNotFound { .. }));
    }

    #[test]
    fn test_unknown_token() {
        let tracker = StageTracker::new();
        let station = StationKey::new(Stage::Intake, 1);
        let err = tracker
            .report(station, TokenId::new(now().date(), 9), &[], now())
            .unwrap_err();
        assert!(matches!(err, FlowError::RecordNotFound { .. }));
    }

    #[test]
    fn test_finish_requires_report() {
        let tracker = StageTracker::new();
        let station = StationKey::new(Stage::Intake, 1);
        let queued = record(1, station);
        let err = tracker
            .finish(station, queued.token, Some(queued), now())
            .unwrap_err();
        assert!(matches!(err, FlowError::RecordNotFound { .. }));
        assert!(tracker
            .finish(station, TokenId::new(now().date(), 1), None, now())
            .is_err());
    }
}
