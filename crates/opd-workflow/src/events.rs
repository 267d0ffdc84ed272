//! 流程事件通知
//!
//! 每次提交成功的状态变化都会发布一个事件，供下游系统订阅：
//! - 日志输出
//! - 进程内广播通道
//! - 多个接收端的扇出

use chrono::NaiveDateTime;
use opd_core::{Stage, StationKey, StationStatus, TokenId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// 流程事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    TokenIssued {
        token: TokenId,
        patient_id: String,
        doctor_id: String,
        station: StationKey,
        issued_at: NaiveDateTime,
    },
    StageReported {
        token: TokenId,
        station: StationKey,
        started_at: NaiveDateTime,
    },
    StageFinished {
        token: TokenId,
        station: StationKey,
        ended_at: NaiveDateTime,
    },
    HandedOff {
        token: TokenId,
        from: StationKey,
        to: StationKey,
    },
    HandoffBlocked {
        token: TokenId,
        from: StationKey,
        next_stage: Stage,
        reason: String,
    },
    StationStatusChanged {
        station: StationKey,
        status: StationStatus,
    },
    StationAdded {
        station: StationKey,
    },
    StationRemoved {
        station: StationKey,
    },
}

impl FlowEvent {
    /// 事件路由键
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowEvent::TokenIssued { .. } => "token.issued",
            FlowEvent::StageReported { .. } => "stage.reported",
            FlowEvent::StageFinished { .. } => "stage.finished",
            FlowEvent::HandedOff { .. } => "stage.handed_off",
            FlowEvent::HandoffBlocked { .. } => "stage.handoff_blocked",
            FlowEvent::StationStatusChanged { .. } => "station.status_changed",
            FlowEvent::StationAdded { .. } => "station.added",
            FlowEvent::StationRemoved { .. } => "station.removed",
        }
    }
}

/// 事件接收端
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &FlowEvent);
}

/// 输出到日志
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: &FlowEvent) {
        tracing::debug!(event = event.as_str(), "{:?}", event);
    }
}

/// 进程内广播
///
/// 没有订阅者时事件直接丢弃。
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<FlowEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: &FlowEvent) {
        let _ = self.sender.send(event.clone());
    }
}

/// 扇出到多个接收端
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn publish(&self, event: &FlowEvent) {
        for sink in &self.sinks {
            sink.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn test_broadcast_fanout() {
        let broadcast = Arc::new(BroadcastSink::new(8));
        let mut rx = broadcast.subscribe();
        let fanout = FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(broadcast.clone());

        let event = FlowEvent::StationAdded {
            station: StationKey::new(Stage::Pharmacy, 3),
        };
        fanout.publish(&event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
        assert_eq!(received.as_str(), "station.added");
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = FlowEvent::HandedOff {
            token: TokenId::new(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), 4),
            from: StationKey::new(Stage::Intake, 1),
            to: StationKey::new(Stage::Consultation, 2),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "handed_off");
        assert_eq!(json["to"]["stage"], "consultation");
    }
}
