// twsdl/src/todo.rs
//! Queues of pending work.
//!
//! One-shot requests (account, executions, open orders) are plain flags.
//! Contract details and order placement are consumed strictly in order.
//! Historical requests can be retried and are picked by farm to make the
//! most of the pacing allowance.

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};

use log::{debug, info, warn};

use crate::account::ExecutionFilter;
use crate::contract::Contract;
use crate::data_farm::DataFarmStates;
use crate::order::Order;
use crate::packet::ReqError;
use crate::pacing_god::PacingGod;
use crate::request::ReqKind;

/// Parameters of a historical data request.
#[derive(Debug, Clone, PartialEq)]
pub struct HistRequest {
  pub contract: Contract,
  /// "yyyymmdd hh:mm:ss [tz]", empty for now
  pub end_date_time: String,
  pub duration: String,
  pub bar_size: String,
  pub what_to_show: String,
  pub use_rth: bool,
  /// 1 for formatted dates, 2 for epoch seconds
  pub format_date: i32,
}

impl HistRequest {
  pub fn new(contract: Contract, end_date_time: &str, duration: &str, bar_size: &str, what_to_show: &str) -> Self {
    Self {
      contract,
      end_date_time: end_date_time.to_string(),
      duration: duration.to_string(),
      bar_size: bar_size.to_string(),
      what_to_show: what_to_show.to_string(),
      use_rth: true,
      format_date: 1,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractDetailsRequest {
  pub contract: Contract,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaceOrder {
  pub contract: Contract,
  pub order: Order,
  /// Reuse this order id (modify an existing order) instead of allocating one.
  pub order_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MktDataRequest {
  pub contract: Contract,
  pub generic_ticks: String,
  pub snapshot: bool,
}

/// Outcome of trying to check out a historical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
  /// A request is now checked out.
  Ready,
  /// Nothing may be sent for this many milliseconds.
  Wait(i64),
  /// No request pending.
  Empty,
}

/// Historical requests: pending, done, failed, plus at most one checked out.
#[derive(Debug, Default)]
pub struct HistTodo {
  left: VecDeque<HistRequest>,
  done: Vec<(HistRequest, ReqError)>,
  error: Vec<(HistRequest, ReqError)>,
  checked_out: Option<HistRequest>,
}

impl HistTodo {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, req: HistRequest) {
    self.left.push_back(req);
  }

  pub fn count_left(&self) -> usize {
    self.left.len()
  }

  pub fn count_done(&self) -> usize {
    self.done.len()
  }

  pub fn count_error(&self) -> usize {
    self.error.len()
  }

  pub fn left(&self) -> impl Iterator<Item = &HistRequest> {
    self.left.iter()
  }

  pub fn done(&self) -> &[(HistRequest, ReqError)] {
    &self.done
  }

  pub fn errors(&self) -> &[(HistRequest, ReqError)] {
    &self.error
  }

  pub fn current(&self) -> Option<&HistRequest> {
    self.checked_out.as_ref()
  }

  /// Check out the first pending request.
  pub fn checkout(&mut self) -> Option<&HistRequest> {
    if self.checked_out.is_some() {
      warn!("hist checkout while a request is already checked out");
      return None;
    }
    self.checked_out = self.left.pop_front();
    self.checked_out.as_ref()
  }

  /// Check out the request that can be sent soonest.
  ///
  /// Requests on an unknown farm come first so their farm gets learned.
  /// Otherwise farms are tried busiest first and the first one allowed to
  /// send now wins. If none is, the shortest wait is returned.
  pub fn checkout_opt(&mut self, pacing: &mut PacingGod, farms: &DataFarmStates, now: i64) -> Dispatch {
    if self.checked_out.is_some() {
      warn!("hist checkout_opt while a request is already checked out");
      return Dispatch::Empty;
    }
    if self.left.is_empty() {
      return Dispatch::Empty;
    }

    // farm -> indices into left, farms in order of first appearance
    let mut order: Vec<Option<String>> = Vec::new();
    let mut by_farm: HashMap<Option<String>, Vec<usize>> = HashMap::new();
    for (i, req) in self.left.iter().enumerate() {
      let farm = farms.get_hmds_farm(&req.contract).map(|f| f.to_string());
      by_farm.entry(farm.clone()).or_insert_with(|| {
        order.push(farm);
        Vec::new()
      }).push(i);
    }

    if let Some(unknown) = by_farm.get(&None) {
      let pick = unknown[0];
      let wait = pacing.good_time(&self.left[pick].contract, farms, now);
      if wait > 0 {
        debug!("hist checkout must wait {}ms for {}", wait, self.left[pick].contract.text_description());
        return Dispatch::Wait(wait);
      }
      self.checked_out = self.left.remove(pick);
      return Dispatch::Ready;
    }

    // Busiest farm first; the sort is stable so ties keep queue order.
    let mut ranked: Vec<&Option<String>> = order.iter().collect();
    ranked.sort_by_key(|farm| Reverse(by_farm[*farm].len()));

    let mut min_wait = i64::MAX;
    let mut pick = None;
    for farm in ranked {
      let first = by_farm[farm][0];
      let contract = &self.left[first].contract;
      let wait = pacing.good_time(contract, farms, now);
      if wait <= 0 && pacing.count_left(contract, farms, now) > 0 {
        pick = Some(first);
        break;
      }
      min_wait = min_wait.min(wait.max(1));
    }
    let pick = match pick {
      Some(i) => i,
      None => {
        debug!("hist checkout must wait {}ms, no farm can send", min_wait);
        return Dispatch::Wait(min_wait);
      }
    };
    self.checked_out = self.left.remove(pick);
    Dispatch::Ready
  }

  /// The checked-out request has been answered.
  pub fn tell_done(&mut self, err: ReqError) {
    match self.checked_out.take() {
      Some(req) => self.done.push((req, err)),
      None => warn!("hist tell_done without checked out request"),
    }
  }

  /// Give the checked-out request back: 0 to the front, 1 to the back, 2 or
  /// more gives up on it.
  pub fn cancel_for_repeat(&mut self, priority: u32, err: ReqError) {
    let req = match self.checked_out.take() {
      Some(req) => req,
      None => {
        warn!("hist cancel_for_repeat without checked out request");
        return;
      }
    };
    match priority {
      0 => self.left.push_front(req),
      1 => self.left.push_back(req),
      _ => self.error.push((req, err)),
    }
  }

  /// Fail every pending request for the same contract.
  pub fn skip_by_perm(&mut self, req: &HistRequest) -> usize {
    self.skip_where(|r| r.contract == req.contract, ReqError::RequestRejected)
  }

  /// Fail every pending request for the same contract and data type.
  pub fn skip_by_nodata(&mut self, req: &HistRequest) -> usize {
    self.skip_where(|r| r.contract == req.contract && r.what_to_show == req.what_to_show,
                    ReqError::NotAvailable)
  }

  fn skip_where<F: Fn(&HistRequest) -> bool>(&mut self, pred: F, err: ReqError) -> usize {
    let before = self.left.len();
    let mut keep = VecDeque::with_capacity(before);
    for r in self.left.drain(..) {
      if pred(&r) {
        self.error.push((r, err));
      } else {
        keep.push_back(r);
      }
    }
    self.left = keep;
    let skipped = before - self.left.len();
    if skipped > 0 {
      info!("skipped {} pending historical requests", skipped);
    }
    skipped
  }
}

/// A list consumed strictly in order through a cursor.
#[derive(Debug)]
pub struct CursorTodo<T> {
  items: Vec<T>,
  next: usize,
  current: Option<usize>,
}

impl<T> Default for CursorTodo<T> {
  fn default() -> Self {
    Self { items: Vec::new(), next: 0, current: None }
  }
}

impl<T> CursorTodo<T> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, item: T) {
    self.items.push(item);
  }

  pub fn count_left(&self) -> usize {
    self.items.len() - self.next
  }

  pub fn checkout(&mut self) -> Option<&T> {
    if self.next >= self.items.len() {
      return None;
    }
    self.current = Some(self.next);
    self.next += 1;
    self.items.get(self.next - 1)
  }

  pub fn current(&self) -> Option<&T> {
    self.current.and_then(|i| self.items.get(i))
  }

  /// Put the current item back so the next checkout returns it again.
  pub fn rewind(&mut self) {
    if let Some(i) = self.current.take() {
      self.next = i;
    }
  }
}

pub type ContractDetailsTodo = CursorTodo<ContractDetailsRequest>;
pub type PlaceOrderTodo = CursorTodo<PlaceOrder>;

/// Market data lines waiting to be started.
#[derive(Debug, Default)]
pub struct MktDataTodo {
  pending: VecDeque<MktDataRequest>,
}

impl MktDataTodo {
  pub fn add(&mut self, req: MktDataRequest) {
    self.pending.push_back(req);
  }

  pub fn add_front(&mut self, req: MktDataRequest) {
    self.pending.push_front(req);
  }

  pub fn pop(&mut self) -> Option<MktDataRequest> {
    self.pending.pop_front()
  }

  pub fn count_left(&self) -> usize {
    self.pending.len()
  }
}

/// Everything left to do in this run.
#[derive(Debug, Default)]
pub struct WorkTodo {
  acc_status: bool,
  executions: bool,
  orders: bool,
  account: String,
  exec_filter: ExecutionFilter,
  contract_details: ContractDetailsTodo,
  hist: HistTodo,
  place_orders: PlaceOrderTodo,
  mkt_data: MktDataTodo,
}

impl WorkTodo {
  pub fn new() -> Self {
    Self::default()
  }

  /// Queue a one-shot request. `Hist` and `ContractDetails` are not one-shot.
  pub fn add_simple_request(&mut self, kind: ReqKind) {
    match kind {
      ReqKind::AccStatus => self.acc_status = true,
      ReqKind::Executions => self.executions = true,
      ReqKind::Orders => self.orders = true,
      other => warn!("{} is not a one-shot request", other),
    }
  }

  pub fn set_account(&mut self, account: &str) {
    self.account = account.to_string();
  }

  pub fn account(&self) -> &str {
    &self.account
  }

  pub fn set_exec_filter(&mut self, filter: ExecutionFilter) {
    self.exec_filter = filter;
  }

  pub fn exec_filter(&self) -> &ExecutionFilter {
    &self.exec_filter
  }

  /// Kind of the next query to send. One-shot flags are consumed here.
  pub fn next_req_type(&mut self) -> ReqKind {
    if std::mem::take(&mut self.acc_status) {
      return ReqKind::AccStatus;
    }
    if std::mem::take(&mut self.executions) {
      return ReqKind::Executions;
    }
    if std::mem::take(&mut self.orders) {
      return ReqKind::Orders;
    }
    if self.contract_details.count_left() > 0 {
      return ReqKind::ContractDetails;
    }
    if self.hist.count_left() > 0 {
      return ReqKind::Hist;
    }
    ReqKind::None
  }

  /// True if any query is still pending.
  pub fn has_queries(&self) -> bool {
    self.acc_status || self.executions || self.orders
      || self.contract_details.count_left() > 0 || self.hist.count_left() > 0
  }

  pub fn contract_details(&mut self) -> &mut ContractDetailsTodo {
    &mut self.contract_details
  }

  pub fn hist(&mut self) -> &mut HistTodo {
    &mut self.hist
  }

  pub fn hist_ref(&self) -> &HistTodo {
    &self.hist
  }

  pub fn place_orders(&mut self) -> &mut PlaceOrderTodo {
    &mut self.place_orders
  }

  pub fn mkt_data(&mut self) -> &mut MktDataTodo {
    &mut self.mkt_data
  }

  pub fn contract_details_left(&self) -> usize {
    self.contract_details.count_left()
  }

  pub fn place_orders_left(&self) -> usize {
    self.place_orders.count_left()
  }

  pub fn mkt_data_left(&self) -> usize {
    self.mkt_data.count_left()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pacing::PacingConfig;

  fn hist(symbol: &str, exchange: &str, what: &str) -> HistRequest {
    HistRequest::new(Contract::stock_with_exchange(symbol, exchange, "USD"), "", "1 W", "1 hour", what)
  }

  #[test]
  fn test_cancel_for_repeat_front_back_error() {
    let mut todo = HistTodo::new();
    todo.add(hist("A", "NYSE", "TRADES"));
    todo.add(hist("B", "NYSE", "TRADES"));
    todo.add(hist("C", "NYSE", "TRADES"));

    assert_eq!(todo.checkout().unwrap().contract.symbol, "A");
    todo.cancel_for_repeat(0, ReqError::ConnectionLost);
    assert_eq!(todo.left().next().unwrap().contract.symbol, "A");
    assert_eq!(todo.count_left(), 3);

    todo.checkout();
    todo.cancel_for_repeat(1, ReqError::Timeout);
    let order: Vec<_> = todo.left().map(|r| r.contract.symbol.clone()).collect();
    assert_eq!(order, vec!["B", "C", "A"]);

    assert_eq!(todo.checkout().unwrap().contract.symbol, "B");
    todo.cancel_for_repeat(2, ReqError::RequestRejected);
    assert_eq!(todo.count_error(), 1);
    assert_eq!(todo.count_left(), 2);
    while todo.checkout().is_some() {
      assert_ne!(todo.current().unwrap().contract.symbol, "B");
      todo.tell_done(ReqError::None);
    }
    assert_eq!(todo.count_done(), 2);
    assert_eq!(todo.errors()[0].1, ReqError::RequestRejected);
  }

  #[test]
  fn test_skip_by_perm_and_nodata() {
    let mut todo = HistTodo::new();
    todo.add(hist("A", "NYSE", "TRADES"));
    todo.add(hist("A", "NYSE", "BID"));
    todo.add(hist("B", "NYSE", "TRADES"));
    todo.add(hist("A", "NYSE", "TRADES"));
    let same = hist("A", "NYSE", "TRADES");

    assert_eq!(todo.skip_by_nodata(&same), 2);
    assert_eq!(todo.count_left(), 2);
    assert_eq!(todo.skip_by_perm(&same), 1);
    assert_eq!(todo.count_left(), 1);
    assert_eq!(todo.left().next().unwrap().contract.symbol, "B");
    assert_eq!(todo.count_error(), 3);
  }

  #[test]
  fn test_checkout_opt_prefers_unknown_farm() {
    let mut farms = DataFarmStates::without_seed();
    farms.notify(1, 2106, "HMDS data farm connection is OK:ushmds");
    farms.learn_hmds(&Contract::stock_with_exchange("X", "NYSE", "USD"));

    let mut god = PacingGod::new(PacingConfig::default());
    let mut todo = HistTodo::new();
    todo.add(hist("A", "NYSE", "TRADES"));
    todo.add(hist("B", "XETRA", "TRADES"));
    assert_eq!(todo.checkout_opt(&mut god, &farms, 0), Dispatch::Ready);
    assert_eq!(todo.current().unwrap().contract.symbol, "B");
  }

  #[test]
  fn test_checkout_opt_prefers_busiest_farm_with_allowance() {
    let mut farms = DataFarmStates::without_seed();
    for (ex, farm) in [("NYSE", "ushmds"), ("IBIS", "euhmds")] {
      farms.notify(1, 2106, &format!("HMDS data farm connection is OK:{}", farm));
      farms.learn_hmds(&Contract::stock_with_exchange("X", ex, "USD"));
      farms.notify(2, 2105, &format!("HMDS data farm connection is broken:{}", farm));
    }
    let cfg = PacingConfig { max_requests: 1, check_interval: 10_000, min_pacing_time: 0, violation_pause: 0 };
    let mut god = PacingGod::new(cfg);
    let mut todo = HistTodo::new();
    todo.add(hist("A", "NYSE", "TRADES"));
    todo.add(hist("B", "IBIS", "TRADES"));
    todo.add(hist("C", "IBIS", "TRADES"));

    assert_eq!(todo.checkout_opt(&mut god, &farms, 0), Dispatch::Ready);
    let first = todo.current().unwrap().clone();
    assert_eq!(first.contract.symbol, "B");
    god.add_request(&first.contract, &farms, 0);
    todo.tell_done(ReqError::None);

    // euhmds exhausted, ushmds still has allowance.
    assert_eq!(todo.checkout_opt(&mut god, &farms, 100), Dispatch::Ready);
    let second = todo.current().unwrap().clone();
    assert_eq!(second.contract.symbol, "A");
    god.add_request(&second.contract, &farms, 100);
    todo.tell_done(ReqError::None);

    // Both exhausted: wait for euhmds's window.
    assert_eq!(todo.checkout_opt(&mut god, &farms, 200), Dispatch::Wait(9_800));
    assert_eq!(todo.checkout_opt(&mut god, &farms, 10_000), Dispatch::Ready);
  }

  #[test]
  fn test_checkout_opt_sends_other_farm_while_busiest_waits() {
    let mut farms = DataFarmStates::without_seed();
    for (ex, farm) in [("NYSE", "ushmds"), ("IBIS", "euhmds")] {
      farms.notify(1, 2106, &format!("HMDS data farm connection is OK:{}", farm));
      farms.learn_hmds(&Contract::stock_with_exchange("X", ex, "USD"));
      farms.notify(2, 2105, &format!("HMDS data farm connection is broken:{}", farm));
    }
    let mut god = PacingGod::new(PacingConfig::default());
    let mut todo = HistTodo::new();
    todo.add(hist("A", "NYSE", "TRADES"));
    todo.add(hist("B", "NYSE", "TRADES"));
    todo.add(hist("C", "NYSE", "TRADES"));
    todo.add(hist("SAP", "IBIS", "TRADES"));

    assert_eq!(todo.checkout_opt(&mut god, &farms, 0), Dispatch::Ready);
    let first = todo.current().unwrap().clone();
    assert_eq!(first.contract.symbol, "A");
    god.add_request(&first.contract, &farms, 0);
    todo.tell_done(ReqError::None);

    // ushmds is inside its minimum spacing, euhmds is idle.
    assert_eq!(todo.checkout_opt(&mut god, &farms, 10), Dispatch::Ready);
    let second = todo.current().unwrap().clone();
    assert_eq!(second.contract.symbol, "SAP");
    god.add_request(&second.contract, &farms, 10);
    todo.tell_done(ReqError::None);

    // Only ushmds has work left.
    assert_eq!(todo.checkout_opt(&mut god, &farms, 20), Dispatch::Wait(1_480));
  }

  #[test]
  fn test_checkout_opt_waits_for_shortest_farm() {
    let mut farms = DataFarmStates::without_seed();
    for (ex, farm) in [("NYSE", "ushmds"), ("IBIS", "euhmds")] {
      farms.notify(1, 2106, &format!("HMDS data farm connection is OK:{}", farm));
      farms.learn_hmds(&Contract::stock_with_exchange("X", ex, "USD"));
      farms.notify(2, 2105, &format!("HMDS data farm connection is broken:{}", farm));
    }
    let cfg = PacingConfig { max_requests: 1, check_interval: 10_000, min_pacing_time: 0, violation_pause: 0 };
    let mut god = PacingGod::new(cfg);
    god.add_request(&Contract::stock_with_exchange("X", "NYSE", "USD"), &farms, 0);
    god.add_request(&Contract::stock_with_exchange("X", "IBIS", "USD"), &farms, 3_000);

    let mut todo = HistTodo::new();
    todo.add(hist("A", "IBIS", "TRADES"));
    todo.add(hist("B", "IBIS", "TRADES"));
    todo.add(hist("C", "NYSE", "TRADES"));

    // euhmds is busier but ushmds frees up first.
    assert_eq!(todo.checkout_opt(&mut god, &farms, 5_000), Dispatch::Wait(5_000));
    assert_eq!(todo.checkout_opt(&mut god, &farms, 10_000), Dispatch::Ready);
    assert_eq!(todo.current().unwrap().contract.symbol, "C");
  }

  #[test]
  fn test_cursor_todo_rewind() {
    let mut todo: CursorTodo<i32> = CursorTodo::new();
    todo.add(1);
    todo.add(2);
    assert_eq!(todo.checkout(), Some(&1));
    todo.rewind();
    assert_eq!(todo.count_left(), 2);
    assert_eq!(todo.checkout(), Some(&1));
    assert_eq!(todo.checkout(), Some(&2));
    assert_eq!(todo.current(), Some(&2));
    assert_eq!(todo.checkout(), None);
    assert_eq!(todo.count_left(), 0);
  }

  #[test]
  fn test_one_shot_flags_consumed_in_priority() {
    let mut work = WorkTodo::new();
    work.hist().add(hist("A", "NYSE", "TRADES"));
    work.add_simple_request(ReqKind::Orders);
    work.add_simple_request(ReqKind::AccStatus);
    work.add_simple_request(ReqKind::Executions);
    assert_eq!(work.next_req_type(), ReqKind::AccStatus);
    assert_eq!(work.next_req_type(), ReqKind::Executions);
    assert_eq!(work.next_req_type(), ReqKind::Orders);
    assert_eq!(work.next_req_type(), ReqKind::Hist);
    assert_eq!(work.next_req_type(), ReqKind::Hist);
    work.hist().checkout();
    work.hist().tell_done(ReqError::None);
    assert_eq!(work.next_req_type(), ReqKind::None);
    assert!(!work.has_queries());
  }
}
