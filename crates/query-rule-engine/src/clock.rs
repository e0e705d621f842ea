//! 时间源
//!
//! 超时判断、缓存过期和 `updatedAt` 都通过注入的时钟取时间，测试中可用
//! `ManualClock` 精确控制。

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// 时钟抽象
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动时钟
///
/// 设置了 `auto_advance` 时，每次读取后自动前进一个步长，可用来模拟
/// 每条规则评估耗时。
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
    auto_advance: Option<Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
            auto_advance: None,
        }
    }

    pub fn with_auto_advance(mut self, step: Duration) -> Self {
        self.auto_advance = Some(step);
        self
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.current.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let mut current = self.current.lock();
        let now = *current;
        if let Some(step) = self.auto_advance {
            *current += step;
        }
        now
    }
}
