//! Wall clock abstraction so staleness checks can be driven from tests.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;

  /// Milliseconds since the Unix epoch.
  fn now_millis(&self) -> i64 {
    self.now().timestamp_millis()
  }
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  pub fn advance(&self, by: Duration) {
    if let Ok(mut now) = self.now.lock() {
      *now += by;
    }
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    self.now.lock().map(|n| *n).unwrap_or_else(|e| *e.into_inner())
  }
}
