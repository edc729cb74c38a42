// twsdl/src/error_class.rs
//! Mapping of TWS error messages to packet classifications.
//!
//! TWS reports most failures as a numeric code plus free text, and the code
//! alone is often ambiguous (162 covers no data, missing permissions and
//! pacing violations). Rules match on scope, code and a message substring.
//! The first matching rule wins; an empty substring matches any text.

use std::fmt;

use log::{debug, warn};

use crate::packet::ReqError;
use crate::request::ReqKind;

/// What the error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
  /// No request of ours, or a request id we do not know.
  General,
  Query(ReqKind),
  PlaceOrder,
  MktData,
}

/// Side effect the event loop applies besides closing the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
  /// Close the packet with the classification, nothing else.
  Close,
  /// Log only.
  Ignore,
  /// Close and fail pending requests for the same contract.
  SkipByPerm,
  /// Close and fail pending requests for the same contract and data type.
  SkipByNodata,
  /// Record a pacing violation, then close for retry.
  PacingViolation,
  /// Connection to the IB servers is gone, farms are unusable.
  AllFarmsBroken,
  /// Drop the socket and reconnect later.
  Disconnect,
}

impl fmt::Display for ErrorAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}", self)
  }
}

#[derive(Debug)]
pub struct ErrorRule {
  pub scope: ErrorScope,
  pub code: i32,
  pub pattern: &'static str,
  pub class: ReqError,
  pub action: ErrorAction,
}

const HIST: ErrorScope = ErrorScope::Query(ReqKind::Hist);
const DETAILS: ErrorScope = ErrorScope::Query(ReqKind::ContractDetails);

macro_rules! rule {
  ($scope:expr, $code:expr, $pattern:expr, $class:ident, $action:ident) => {
    ErrorRule { scope: $scope, code: $code, pattern: $pattern, class: ReqError::$class, action: ErrorAction::$action }
  };
}

pub static ERROR_RULES: &[ErrorRule] = &[
  // historical data
  rule!(HIST, 162, "HMDS query returned no data", NoData, Close),
  rule!(HIST, 162, "No market data permissions", RequestRejected, SkipByPerm),
  rule!(HIST, 162, "Historical data request pacing violation", ConnectionLost, PacingViolation),
  rule!(HIST, 162, "No historical market data for", NotAvailable, SkipByNodata),
  rule!(HIST, 162, "No data of type", NotAvailable, SkipByNodata),
  rule!(HIST, 162, "Starting time must occur before ending time", NoData, Close),
  rule!(HIST, 162, "Unknown contract", NotAvailable, SkipByPerm),
  rule!(HIST, 162, "invalid step", RequestRejected, Close),
  rule!(HIST, 162, "Invalid step", RequestRejected, Close),
  rule!(HIST, 162, "query cancelled", ConnectionLost, Close),
  rule!(HIST, 162, "", RequestRejected, Close),
  rule!(HIST, 165, "", None, Ignore),
  rule!(HIST, 166, "", NotAvailable, SkipByPerm),
  rule!(HIST, 200, "", NotAvailable, SkipByPerm),
  rule!(HIST, 321, "", RequestRejected, Close),
  rule!(HIST, 366, "", None, Ignore),
  rule!(HIST, 504, "", ConnectionLost, Close),
  // contract details
  rule!(DETAILS, 200, "", NoData, Close),
  rule!(DETAILS, 321, "", RequestRejected, Close),
  rule!(DETAILS, 504, "", ConnectionLost, Close),
  // one-shot queries
  rule!(ErrorScope::Query(ReqKind::AccStatus), 321, "", RequestRejected, Close),
  rule!(ErrorScope::Query(ReqKind::Executions), 321, "", RequestRejected, Close),
  // order placement
  rule!(ErrorScope::PlaceOrder, 201, "", RequestRejected, Close),
  rule!(ErrorScope::PlaceOrder, 103, "", RequestRejected, Close),
  rule!(ErrorScope::PlaceOrder, 200, "", NotAvailable, Close),
  rule!(ErrorScope::PlaceOrder, 202, "", None, Ignore),
  rule!(ErrorScope::PlaceOrder, 399, "", None, Ignore),
  rule!(ErrorScope::PlaceOrder, 321, "", RequestRejected, Close),
  // market data
  rule!(ErrorScope::MktData, 10167, "", None, Ignore),
  rule!(ErrorScope::MktData, 354, "", RequestRejected, Close),
  rule!(ErrorScope::MktData, 200, "", NotAvailable, Close),
  rule!(ErrorScope::MktData, 300, "", None, Ignore),
  rule!(ErrorScope::MktData, 321, "", RequestRejected, Close),
  // connection wide
  rule!(ErrorScope::General, 1100, "", None, AllFarmsBroken),
  rule!(ErrorScope::General, 2110, "", None, AllFarmsBroken),
  rule!(ErrorScope::General, 1101, "", None, Ignore),
  rule!(ErrorScope::General, 1102, "", None, Ignore),
  rule!(ErrorScope::General, 326, "", None, Disconnect),
  rule!(ErrorScope::General, 502, "", None, Disconnect),
  rule!(ErrorScope::General, 504, "", None, Ignore),
];

/// Find the rule for an error. Query scopes fall back to general rules so
/// connection wide codes are handled whatever request is in flight.
pub fn classify(scope: ErrorScope, code: i32, msg: &str) -> Option<&'static ErrorRule> {
  let find = |s: ErrorScope| {
    ERROR_RULES.iter().find(|r| r.scope == s && r.code == code && msg.contains(r.pattern))
  };
  let found = find(scope).or_else(|| if scope != ErrorScope::General { find(ErrorScope::General) } else { None });
  match found {
    Some(r) => debug!("error {} ({:?}) -> {} / {}", code, scope, r.class, r.action),
    None => warn!("unhandled TWS error {} ({:?}): {}", code, scope, msg),
  }
  found
}
