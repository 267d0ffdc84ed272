//! 每日号码发放
//!
//! 进程内计数器，本地日期跨过午夜后从 1 重新开始。

use chrono::{NaiveDate, NaiveDateTime};
use opd_core::Clock;
use parking_lot::Mutex;
use std::sync::Arc;

/// 一次发放的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuedNumber {
    pub number: u32,
    pub issued_at: NaiveDateTime,
}

impl IssuedNumber {
    pub fn date(&self) -> NaiveDate {
        self.issued_at.date()
    }
}

#[derive(Debug)]
struct SequenceState {
    current: u32,
    last_reset: NaiveDate,
}

/// 号码发放器
#[derive(Debug)]
pub struct SequenceIssuer {
    clock: Arc<dyn Clock>,
    state: Mutex<SequenceState>,
}

impl SequenceIssuer {
    /// 从 1 开始发放
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::resume(clock, None)
    }

    /// 接续当天已发出的最大号码，避免进程重启后重复发号
    pub fn resume(clock: Arc<dyn Clock>, last_issued_today: Option<u32>) -> Self {
        let today = clock.today();
        let current = last_issued_today.map(|n| n.saturating_add(1)).unwrap_or(1);
        Self {
            clock,
            state: Mutex::new(SequenceState {
                current,
                last_reset: today,
            }),
        }
    }

    /// 发放下一个号码
    ///
    /// 日期检查、读取与自增在同一个临界区内完成。
    pub fn issue(&self) -> IssuedNumber {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let today = now.date();

        if today != state.last_reset {
            tracing::info!(
                "Daily token counter reset: {} -> {} (last issued {})",
                state.last_reset,
                today,
                state.current - 1
            );
            state.current = 1;
            state.last_reset = today;
        }

        let number = state.current;
        state.current += 1;

        IssuedNumber {
            number,
            issued_at: now,
        }
    }

    /// 撤回最近一次发放的号码
    ///
    /// 只有该号码仍是当天最后发出的一个时才会撤回，调用方须保证期间没有其他发放。
    pub fn rollback(&self, issued: IssuedNumber) -> bool {
        let mut state = self.state.lock();
        if state.last_reset != issued.date() || state.current != issued.number + 1 {
            return false;
        }
        state.current = issued.number;
        tracing::warn!("Token number {} returned to the sequence", issued.number);
        true
    }
}
