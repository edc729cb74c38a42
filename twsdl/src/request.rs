// twsdl/src/request.rs
// The single in-flight query request

use std::fmt;

/// Kind of query request. At most one query is in flight at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReqKind {
  None,
  AccStatus,
  Executions,
  Orders,
  ContractDetails,
  Hist,
}

impl fmt::Display for ReqKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ReqKind::None => "none",
      ReqKind::AccStatus => "account",
      ReqKind::Executions => "executions",
      ReqKind::Orders => "open_orders",
      ReqKind::ContractDetails => "contract_details",
      ReqKind::Hist => "historical_data",
    };
    write!(f, "{}", s)
  }
}

#[derive(Debug, Clone)]
pub struct GenericRequest {
  kind: ReqKind,
  req_id: i32,
  ctime: i64,
}

impl Default for GenericRequest {
  fn default() -> Self {
    Self { kind: ReqKind::None, req_id: 0, ctime: 0 }
  }
}

impl GenericRequest {
  /// Start a new request. Ids must grow strictly.
  pub fn next_request(&mut self, kind: ReqKind, req_id: i32, now: i64) {
    debug_assert!(self.kind == ReqKind::None, "request {} still open", self.req_id);
    debug_assert!(req_id > self.req_id || self.req_id == 0);
    self.kind = kind;
    self.req_id = req_id;
    self.ctime = now;
  }

  pub fn close(&mut self) {
    self.kind = ReqKind::None;
  }

  pub fn kind(&self) -> ReqKind {
    self.kind
  }

  pub fn req_id(&self) -> i32 {
    self.req_id
  }

  pub fn is_open(&self) -> bool {
    self.kind != ReqKind::None
  }

  /// Milliseconds since the request was sent.
  pub fn age(&self, now: i64) -> i64 {
    now - self.ctime
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_lifecycle() {
    let mut r = GenericRequest::default();
    assert!(!r.is_open());
    r.next_request(ReqKind::Hist, 5, 1_000);
    assert!(r.is_open());
    assert_eq!(r.req_id(), 5);
    assert_eq!(r.age(1_250), 250);
    r.close();
    assert_eq!(r.kind(), ReqKind::None);
    r.next_request(ReqKind::Orders, 6, 2_000);
    assert_eq!(r.kind(), ReqKind::Orders);
  }
}
