// twsdl/src/clock.rs
// Millisecond wall clock used by the event loop

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of "now" in milliseconds since the epoch.
pub trait Clock {
  fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now_ms(&self) -> i64 {
    chrono::Utc::now().timestamp_millis()
  }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
  now: Arc<AtomicI64>,
}

impl ManualClock {
  pub fn new(start_ms: i64) -> Self {
    Self { now: Arc::new(AtomicI64::new(start_ms)) }
  }

  pub fn advance(&self, ms: i64) {
    self.now.fetch_add(ms.max(0), Ordering::SeqCst);
  }

  pub fn set(&self, ms: i64) {
    self.now.store(ms, Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now_ms(&self) -> i64 {
    self.now.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_manual_clock_shared_between_clones() {
    let clock = ManualClock::new(1_000);
    let other = clock.clone();
    clock.advance(250);
    assert_eq!(other.now_ms(), 1_250);
    other.set(5);
    assert_eq!(clock.now_ms(), 5);
    clock.advance(-10);
    assert_eq!(clock.now_ms(), 5);
  }
}
