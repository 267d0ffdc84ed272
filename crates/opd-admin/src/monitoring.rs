//! 流程监控
//!
//! 以事件接收端的方式统计流程指标，并以 Prometheus 文本格式导出。

use anyhow::Result;
use opd_workflow::{EventSink, FlowEvent};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// 流程监控器
pub struct FlowMonitor {
    /// Prometheus注册表
    registry: Registry,
    tokens_issued_total: IntCounter,
    stage_reports_total: IntCounterVec,
    stage_completions_total: IntCounterVec,
    handoffs_total: IntCounter,
    handoffs_blocked_total: IntCounterVec,
    station_changes_total: IntCounterVec,
    /// 各工位队列中的号码总数
    queued_tokens: IntGauge,
    /// 系统启动时间
    system_start_time: Instant,
}

/// 服务健康状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub uptime_secs: u64,
    pub queued_tokens: i64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl FlowMonitor {
    /// 创建新的流程监控器
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        // 创建Prometheus指标
        let tokens_issued_total = IntCounter::with_opts(Opts::new(
            "opd_tokens_issued_total",
            "Total number of tokens issued",
        ))?;

        let stage_reports_total = IntCounterVec::new(
            Opts::new("opd_stage_reports_total", "Tokens reported at a station"),
            &["stage"],
        )?;

        let stage_completions_total = IntCounterVec::new(
            Opts::new("opd_stage_completions_total", "Tokens finished at a station"),
            &["stage"],
        )?;

        let handoffs_total = IntCounter::with_opts(Opts::new(
            "opd_handoffs_total",
            "Tokens handed off to the next stage",
        ))?;

        let handoffs_blocked_total = IntCounterVec::new(
            Opts::new(
                "opd_handoffs_blocked_total",
                "Hand-offs that found no accepting station",
            ),
            &["next_stage"],
        )?;

        let station_changes_total = IntCounterVec::new(
            Opts::new("opd_station_changes_total", "Station lifecycle changes"),
            &["change"],
        )?;

        let queued_tokens = IntGauge::with_opts(Opts::new(
            "opd_queued_tokens",
            "Tokens currently waiting in station queues",
        ))?;

        // 注册所有指标
        registry.register(Box::new(tokens_issued_total.clone()))?;
        registry.register(Box::new(stage_reports_total.clone()))?;
        registry.register(Box::new(stage_completions_total.clone()))?;
        registry.register(Box::new(handoffs_total.clone()))?;
        registry.register(Box::new(handoffs_blocked_total.clone()))?;
        registry.register(Box::new(station_changes_total.clone()))?;
        registry.register(Box::new(queued_tokens.clone()))?;

        Ok(Self {
            registry,
            tokens_issued_total,
            stage_reports_total,
            stage_completions_total,
            handoffs_total,
            handoffs_blocked_total,
            station_changes_total,
            queued_tokens,
            system_start_time: Instant::now(),
        })
    }

    /// 获取Prometheus指标
    pub fn render(&self) -> Result<String> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }

    /// 获取系统运行时间
    pub fn uptime(&self) -> Duration {
        self.system_start_time.elapsed()
    }

    pub fn queued_tokens(&self) -> i64 {
        self.queued_tokens.get()
    }

    /// 以存储中已有的排队数为起点，之后由事件增减
    pub fn set_queued_tokens(&self, count: usize) {
        self.queued_tokens.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// 获取服务健康状态
    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "healthy".to_string(),
            uptime_secs: self.uptime().as_secs(),
            queued_tokens: self.queued_tokens(),
            timestamp: chrono::Utc::now(),
        }
    }
}

impl EventSink for FlowMonitor {
    fn publish(&self, event: &FlowEvent) {
        debug!("Recording metric for {}", event.as_str());

        match event {
            FlowEvent::TokenIssued { .. } => {
                self.tokens_issued_total.inc();
                self.queued_tokens.inc();
            }
            FlowEvent::StageReported { station, .. } => {
                self.stage_reports_total
                    .with_label_values(&[station.stage.as_str()])
                    .inc();
            }
            FlowEvent::StageFinished { station, .. } => {
                self.stage_completions_total
                    .with_label_values(&[station.stage.as_str()])
                    .inc();
                self.queued_tokens.dec();
            }
            FlowEvent::HandedOff { .. } => {
                self.handoffs_total.inc();
                self.queued_tokens.inc();
            }
            FlowEvent::HandoffBlocked { next_stage, .. } => {
                self.handoffs_blocked_total
                    .with_label_values(&[next_stage.as_str()])
                    .inc();
            }
            FlowEvent::StationStatusChanged { .. } => {
                self.station_changes_total
                    .with_label_values(&["status"])
                    .inc();
            }
            FlowEvent::StationAdded { .. } => {
                self.station_changes_total.with_label_values(&["added"]).inc();
            }
            FlowEvent::StationRemoved { .. } => {
                self.station_changes_total
                    .with_label_values(&["removed"])
                    .inc();
            }
        }
    }
}
