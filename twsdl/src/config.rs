// twsdl/src/config.rs
// Run configuration, loadable from JSON and overridden from the command line

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::base::TwsDlError;
use crate::pacing::PacingConfig;

/// What to do when TWS sends something that cannot be consistent with what we asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationPolicy {
  /// Stop the event loop with an error.
  Abort,
  /// Log a warning and carry on.
  Warn,
}

impl Default for ViolationPolicy {
  fn default() -> Self {
    if cfg!(debug_assertions) { ViolationPolicy::Abort } else { ViolationPolicy::Warn }
  }
}

/// Settings for one run of the downloader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub tws_host: String,
  pub tws_port: u16,
  pub tws_client_id: i32,

  /// Maximum requests per pacing window (default: 60)
  pub tws_max_requests: usize,
  /// Pacing window in ms (default: 601000)
  pub tws_pacing_interval: i64,
  /// Minimum spacing between two requests in ms (default: 1500)
  pub tws_min_pacing_time: i64,
  /// Cooldown after a pacing violation in ms (default: 60000)
  pub tws_violation_pause: i64,

  /// Age after which an in-flight request is force-closed, ms (default: 20000)
  pub tws_req_timeout: i64,
  /// Minimum interval between connection attempts, ms (default: 30000)
  pub tws_con_timeout: i64,

  /// Upper bound for a single wait on socket activity, ms
  pub idle_tick_ms: i64,
  /// Maximum number of concurrently streaming market data lines
  pub max_mkt_data_lines: usize,

  pub get_account: bool,
  pub get_executions: bool,
  pub get_orders: bool,
  /// Account code used for account updates, empty for the default account
  pub account_name: String,

  pub violation_policy: ViolationPolicy,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      tws_host: "127.0.0.1".to_string(),
      tws_port: 7496,
      tws_client_id: 123,
      tws_max_requests: 60,
      tws_pacing_interval: 601_000,
      tws_min_pacing_time: 1_500,
      tws_violation_pause: 60_000,
      tws_req_timeout: 20_000,
      tws_con_timeout: 30_000,
      idle_tick_ms: 1_000,
      max_mkt_data_lines: 100,
      get_account: false,
      get_executions: false,
      get_orders: false,
      account_name: String::new(),
      violation_policy: ViolationPolicy::default(),
    }
  }
}

impl Config {
  /// Load a config from a JSON file. Missing keys keep their defaults.
  pub fn from_json_file(path: &Path) -> Result<Self, TwsDlError> {
    let text = std::fs::read_to_string(path)
      .map_err(|e| TwsDlError::ConfigurationError(format!("Reading {}: {}", path.display(), e)))?;
    Self::from_json_str(&text)
  }

  pub fn from_json_str(text: &str) -> Result<Self, TwsDlError> {
    let cfg: Config = serde_json::from_str(text)
      .map_err(|e| TwsDlError::ConfigurationError(format!("Parsing config: {}", e)))?;
    cfg.validate()?;
    Ok(cfg)
  }

  pub fn validate(&self) -> Result<(), TwsDlError> {
    if self.tws_max_requests == 0 {
      return Err(TwsDlError::ConfigurationError("tws_max_requests must be positive".to_string()));
    }
    if self.tws_pacing_interval <= 0 || self.tws_min_pacing_time < 0 || self.tws_violation_pause < 0 {
      return Err(TwsDlError::ConfigurationError("pacing times must not be negative".to_string()));
    }
    if self.tws_req_timeout <= 0 || self.tws_con_timeout < 0 {
      return Err(TwsDlError::ConfigurationError("timeouts must be positive".to_string()));
    }
    if self.idle_tick_ms <= 0 {
      return Err(TwsDlError::ConfigurationError("idle_tick_ms must be positive".to_string()));
    }
    Ok(())
  }

  pub fn pacing(&self) -> PacingConfig {
    PacingConfig {
      max_requests: self.tws_max_requests,
      check_interval: self.tws_pacing_interval,
      min_pacing_time: self.tws_min_pacing_time,
      violation_pause: self.tws_violation_pause,
    }
  }
}
