//! # 门诊流程编排模块
//!
//! 驱动号码依次经过分诊、诊室和药房三个阶段，包括：
//! - 号码发放：按天重置的递增号码
//! - 负载均衡：最短队列优先，并列时轮转
//! - 优先级队列：急诊优先，同级保持到达顺序
//! - 阶段跟踪：每个工位同一时刻只服务一个号码
//! - 编排引擎：组合以上组件并处理阶段交接

pub mod engine;
pub mod events;
pub mod priority;
pub mod queue;
pub mod routing;
pub mod sequence;
pub mod state_machine;
pub mod store;
pub mod tracker;

// 重新导出主要类型
pub use engine::{
    Admission, DoctorTransition, FinishOutcome, FlowOrchestrator, Handoff, Removal,
    ReportOutcome, StageQueueEntry, StationSummary, StationTransition,
};
pub use events::{BroadcastSink, EventSink, FanoutSink, FlowEvent, TracingSink};
pub use priority::{rank, rank_or_lowest, Priority};
pub use queue::{EnqueueOutcome, PriorityLookup, PriorityQueueStore, StationLocks};
pub use routing::{select_least_loaded, StationLoad, StationLoadBalancer};
pub use sequence::{IssuedNumber, SequenceIssuer};
pub use state_machine::{StageEvent, StageStateMachine};
pub use store::{ChangeSet, FlowStore, MemoryStore, SeedData};
pub use tracker::StageTracker;
