// twsdl/src/pacing.rs
//! Sliding-window pacing for a single request bucket.
//!
//! TWS rejects historical data requests when too many are sent in a short
//! time. The exact quotas are not published; what is known:
//! - at most `max_requests` requests per `check_interval`
//! - a minimum spacing between two consecutive requests
//! - after a reported pacing violation nothing should be sent for a while
//!
//! All times are milliseconds since the epoch and passed in by the caller.

use log::{debug, trace};

/// Retained after `clear()` if the last request is younger than this.
const CLEAR_GRACE_MS: i64 = 5_000;

/// Tunables shared by every pacing bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacingConfig {
  /// Requests allowed per window (default: 60)
  pub max_requests: usize,
  /// Window length in ms (default: 601000)
  pub check_interval: i64,
  /// Minimum spacing between requests in ms (default: 1500)
  pub min_pacing_time: i64,
  /// Cooldown after a violation in ms (default: 60000)
  pub violation_pause: i64,
}

impl Default for PacingConfig {
  fn default() -> Self {
    Self {
      max_requests: 60,
      check_interval: 601_000,
      min_pacing_time: 1_500,
      violation_pause: 60_000,
    }
  }
}

/// Request history of one bucket.
#[derive(Clone, Debug, Default)]
pub struct PacingControl {
  cfg: PacingConfig,
  date_list: Vec<i64>,
  violation_list: Vec<bool>,
}

impl PacingControl {
  pub fn new(cfg: PacingConfig) -> Self {
    Self { cfg, date_list: Vec::new(), violation_list: Vec::new() }
  }

  pub fn config(&self) -> &PacingConfig {
    &self.cfg
  }

  pub fn set_config(&mut self, cfg: PacingConfig) {
    self.cfg = cfg;
  }

  pub fn set_violation_pause(&mut self, ms: i64) {
    self.cfg.violation_pause = ms;
  }

  pub fn is_empty(&self) -> bool {
    self.date_list.is_empty()
  }

  pub fn len(&self) -> usize {
    self.date_list.len()
  }

  pub fn last_request(&self) -> Option<i64> {
    self.date_list.last().copied()
  }

  pub fn add_request(&mut self, now: i64) {
    self.date_list.push(now);
    self.violation_list.push(false);
  }

  /// Flag the latest request as violating. The offending request may have
  /// been sent by another client, so an empty history gets a synthetic entry.
  pub fn notify_violation(&mut self, now: i64) {
    if self.violation_list.is_empty() {
      self.add_request(now);
    }
    if let Some(last) = self.violation_list.last_mut() {
      *last = true;
    }
  }

  fn last_violated(&self) -> bool {
    self.violation_list.last().copied().unwrap_or(false)
  }

  /// Milliseconds to wait before the next request. Non-positive means now.
  pub fn good_time(&self, now: i64) -> i64 {
    let last = match self.date_list.last() {
      Some(&t) => t,
      None => return 0,
    };

    let mut wait = self.cfg.min_pacing_time - (now - last);
    let mut reason = "min spacing";

    if self.last_violated() {
      let wait_viol = self.cfg.violation_pause - (now - last);
      if wait_viol > wait {
        wait = wait_viol;
        reason = "violation";
      }
    }

    if self.date_list.len() >= self.cfg.max_requests {
      let oldest = self.date_list[self.date_list.len() - self.cfg.max_requests];
      let wait_burst = self.cfg.check_interval - (now - oldest);
      if wait_burst > wait {
        wait = wait_burst;
        reason = "burst";
      }
    }

    trace!("pacing good_time {}ms ({})", wait, reason);
    wait
  }

  /// Requests still allowed in the current window.
  pub fn count_left(&self, now: i64) -> usize {
    if let Some(&last) = self.date_list.last() {
      if self.last_violated() && self.cfg.violation_pause - (now - last) > 0 {
        return 0;
      }
    }
    let recent = self.date_list
      .iter()
      .rev()
      .take_while(|&&t| self.cfg.check_interval - (now - t) > 0)
      .count();
    self.cfg.max_requests.saturating_sub(recent)
  }

  /// Forget the history. A very recent request is kept.
  pub fn clear(&mut self, now: i64) {
    let keep = match self.date_list.last() {
      Some(&last) if now - last < CLEAR_GRACE_MS => Some((last, self.last_violated())),
      _ => None,
    };
    self.date_list.clear();
    self.violation_list.clear();
    if let Some((last, violated)) = keep {
      debug!("pacing clear keeps last request ({}ms old)", now - last);
      self.date_list.push(last);
      self.violation_list.push(violated);
    }
  }

  /// Interleave `other`'s history into ours, ordered by time.
  pub fn merge(&mut self, other: &PacingControl) {
    let mut merged_dates = Vec::with_capacity(self.date_list.len() + other.date_list.len());
    let mut merged_viol = Vec::with_capacity(merged_dates.capacity());
    let (mut i, mut j) = (0, 0);
    while i < self.date_list.len() || j < other.date_list.len() {
      let take_self = j >= other.date_list.len()
        || (i < self.date_list.len() && self.date_list[i] <= other.date_list[j]);
      if take_self {
        merged_dates.push(self.date_list[i]);
        merged_viol.push(self.violation_list[i]);
        i += 1;
      } else {
        merged_dates.push(other.date_list[j]);
        merged_viol.push(other.violation_list[j]);
        j += 1;
      }
    }
    self.date_list = merged_dates;
    self.violation_list = merged_viol;
  }
}
