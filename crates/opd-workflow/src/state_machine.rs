//! 阶段状态机
//!
//! 管理号码在单个工位上的生命周期：排队 → 服务中 → 完成

use opd_core::{FlowError, Result, StageState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 阶段状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StageEvent {
    Report,
    Finish,
}

/// 阶段状态机
#[derive(Debug)]
pub struct StageStateMachine {
    transitions: HashMap<(StageState, StageEvent), StageState>,
}

impl StageStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        let mut transitions = HashMap::new();

        transitions.insert((StageState::Queued, StageEvent::Report), StageState::Reported);
        transitions.insert((StageState::Reported, StageEvent::Finish), StageState::Finished);

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: StageState, event: StageEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: StageState, event: StageEvent) -> Result<StageState> {
        match self.transitions.get(&(from, event)) {
            Some(to) => Ok(*to),
            None => Err(FlowError::InvalidStateTransition {
                from: format!("{:?}", from),
                event: format!("{:?}", event),
            }),
        }
    }

    /// 获取状态的所有可能事件
    pub fn get_possible_events(&self, current_state: StageState) -> Vec<StageEvent> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current_state)
            .map(|(_, event)| *event)
            .collect()
    }

    /// 终止状态没有后续事件
    pub fn is_terminal(&self, state: StageState) -> bool {
        self.get_possible_events(state).is_empty()
    }
}

impl Default for StageStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
