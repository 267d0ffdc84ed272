//! 通用工具：时钟抽象
//!
//! 每日号码重置依赖本地日期，测试中需要可控的时间源。

use chrono::{Duration, Local, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;

/// 时间源
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// 当前本地时间
    fn now(&self) -> NaiveDateTime;

    /// 当前本地日期
    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

/// 系统本地时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// 手动时钟，用于测试和演示
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// 设置当前时间
    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }

    /// 时间前进
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}
