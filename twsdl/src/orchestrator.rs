// twsdl/src/orchestrator.rs
//! The download event loop.
//!
//! `TwsDl` owns the work queues, the pacing state and the farm states and
//! drives a `ProtocolClient` through them. Queries (account, executions,
//! open orders, contract details, historical data) go out one at a time.
//! Order placement and market data lines run alongside and are keyed by
//! order id and ticker id.

use std::collections::{BTreeMap, HashSet};

use log::{debug, error, info, trace, warn};

use crate::account::Account;
use crate::base::TwsDlError;
use crate::clock::Clock;
use crate::config::{Config, ViolationPolicy};
use crate::conn::ProtocolClient;
use crate::data::{Tick, TickValue};
use crate::data_farm::{is_farm_notice, DataFarmStates};
use crate::error_class::{classify, ErrorAction, ErrorScope};
use crate::event::Event;
use crate::job_file::{Completed, ResponseSink};
use crate::packet::{
  AccStatusRow, MktDataPacket, OrderRow, Packet, PacketState, PlaceOrderPacket, QueryPacket, ReqError,
};
use crate::pacing_god::PacingGod;
use crate::request::{GenericRequest, ReqKind};
use crate::todo::{Dispatch, WorkTodo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
  /// Connected, waiting for the first next valid id.
  WaitConnection,
  Idle,
  Quit,
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
  /// Documents written to the sink
  pub completed: usize,
  /// Of those, how many carry an error classification other than no data
  pub errors: usize,
  /// Requests still queued when the loop stopped
  pub unfinished: usize,
}

impl RunSummary {
  pub fn exit_code(&self) -> u8 {
    if self.errors > 0 || self.unfinished > 0 { 1 } else { 0 }
  }
}

// Append a row to the in-flight query packet if it is of the given kind and
// belongs to `req_id`. Evaluates to whether the row was taken.
macro_rules! append_query_row {
  ($self:ident, $variant:ident, $req_id:expr, $row:expr) => {
    match $self.packet.as_mut() {
      Some(QueryPacket::$variant(p)) if p.req_id() == $req_id => {
        p.append($row);
        true
      }
      _ => false,
    }
  };
}

pub struct TwsDl<C: ProtocolClient, K: Clock> {
  cfg: Config,
  client: C,
  clock: K,
  state: LoopState,
  work: WorkTodo,
  farms: DataFarmStates,
  pacing: PacingGod,
  account: Account,
  request: GenericRequest,
  packet: Option<QueryPacket>,
  packet_action: ErrorAction,
  orders: BTreeMap<i32, PlaceOrderPacket>,
  mkt_data: BTreeMap<i32, MktDataPacket>,
  // ids we gave up on; late answers for them are dropped quietly
  retired: HashSet<i32>,
  next_id: i32,
  msg_seq: u64,
  last_connect: Option<i64>,
  wait: i64,
  completed: usize,
  errors: usize,
}

impl<C: ProtocolClient, K: Clock> TwsDl<C, K> {
  /// Build the loop. The one-shot flags of `cfg` are added to `work`.
  pub fn new(cfg: Config, client: C, clock: K, mut work: WorkTodo) -> Self {
    if cfg.get_account {
      if work.account().is_empty() {
        work.set_account(&cfg.account_name);
      }
      work.add_simple_request(ReqKind::AccStatus);
    }
    if cfg.get_executions {
      work.add_simple_request(ReqKind::Executions);
    }
    if cfg.get_orders {
      work.add_simple_request(ReqKind::Orders);
    }
    let pacing = PacingGod::new(cfg.pacing());
    let wait = cfg.idle_tick_ms;
    Self {
      cfg,
      client,
      clock,
      state: LoopState::Idle,
      work,
      farms: DataFarmStates::new(),
      pacing,
      account: Account::new(),
      request: GenericRequest::default(),
      packet: None,
      packet_action: ErrorAction::Close,
      orders: BTreeMap::new(),
      mkt_data: BTreeMap::new(),
      retired: HashSet::new(),
      next_id: 1,
      msg_seq: 0,
      last_connect: None,
      wait,
      completed: 0,
      errors: 0,
    }
  }

  pub fn state(&self) -> LoopState {
    self.state
  }

  pub fn work(&self) -> &WorkTodo {
    &self.work
  }

  pub fn farms(&self) -> &DataFarmStates {
    &self.farms
  }

  pub fn account(&self) -> &Account {
    &self.account
  }

  pub fn client(&self) -> &C {
    &self.client
  }

  /// Run until there is nothing left to do. Finished packets go to `sink`.
  pub fn run(&mut self, sink: &mut dyn ResponseSink) -> Result<RunSummary, TwsDlError> {
    info!("starting: {} historical, {} contract details, {} orders, {} market data requests",
          self.work.hist_ref().count_left(), self.work.contract_details_left(),
          self.work.place_orders_left(), self.work.mkt_data_left());
    loop {
      match self.step(sink) {
        Ok(true) => {}
        Ok(false) => break,
        Err(e) => {
          error!("event loop stopped: {}", e);
          self.client.disconnect();
          return Err(e);
        }
      }
    }
    self.client.disconnect();
    let summary = self.summary();
    info!("finished: {} completed, {} with errors, {} unfinished",
          summary.completed, summary.errors, summary.unfinished);
    Ok(summary)
  }

  /// One loop iteration. Returns false once the loop has quit.
  pub fn step(&mut self, sink: &mut dyn ResponseSink) -> Result<bool, TwsDlError> {
    let now = self.clock.now_ms();
    self.wait = self.cfg.idle_tick_ms;

    self.drain_orders(sink, now)?;
    self.drain_mkt_data(sink, now)?;
    self.finish_query(sink, now)?;

    match self.state {
      LoopState::WaitConnection => self.wait_connection(now),
      LoopState::Idle => self.idle(now)?,
      LoopState::Quit => {}
    }
    if self.state == LoopState::Quit {
      return Ok(false);
    }

    let events = self.client.wait_for_activity(self.wait.max(1));
    for ev in events {
      let now = self.clock.now_ms();
      self.handle_event(ev, now)?;
    }
    Ok(true)
  }

  pub fn summary(&self) -> RunSummary {
    let w = &self.work;
    RunSummary {
      completed: self.completed,
      errors: self.errors,
      unfinished: w.hist_ref().count_left() + w.contract_details_left() + w.place_orders_left()
        + w.mkt_data_left() + usize::from(self.packet.is_some()),
    }
  }

  fn wait_at_most(&mut self, ms: i64) {
    self.wait = self.wait.min(ms);
  }

  fn alloc_id(&mut self) -> i32 {
    let id = self.next_id;
    self.next_id += 1;
    id
  }

  fn violation(&self, what: String) -> Result<(), TwsDlError> {
    match self.cfg.violation_policy {
      ViolationPolicy::Abort => {
        error!("{}", what);
        Err(TwsDlError::ProtocolViolation(what))
      }
      ViolationPolicy::Warn => {
        warn!("{}", what);
        Ok(())
      }
    }
  }

  fn unexpected(&self, id: i32, what: &str) -> Result<(), TwsDlError> {
    if self.retired.contains(&id) {
      debug!("late {} for abandoned request {}", what, id);
      return Ok(());
    }
    self.violation(format!("{} for unknown request id {}", what, id))
  }

  fn has_open_work(&self) -> bool {
    self.packet.as_ref().map_or(false, |p| !p.finished())
      || self.orders.values().any(|p| !p.finished())
      || self.mkt_data.values().any(|p| !p.finished())
  }

  fn nothing_left(&self) -> bool {
    self.packet.is_none()
      && !self.work.has_queries()
      && self.work.place_orders_left() == 0
      && self.work.mkt_data_left() == 0
      && self.orders.is_empty()
      && self.mkt_data.is_empty()
  }

  fn report(&mut self, sink: &mut dyn ResponseSink, done: Completed<'_>) -> Result<(), TwsDlError> {
    let err = match done {
      Completed::Query(p) => p.error(),
      Completed::PlaceOrder(p) => p.error(),
      Completed::MktData(p) => p.error(),
    };
    self.completed += 1;
    if !matches!(err, ReqError::None | ReqError::NoData) {
      self.errors += 1;
    }
    sink.completed(done)
  }

  // --- connection ---

  fn connect(&mut self, now: i64) {
    if let Some(last) = self.last_connect {
      let since = now - last;
      if since < self.cfg.tws_con_timeout {
        trace!("next connection attempt in {}ms", self.cfg.tws_con_timeout - since);
        self.wait_at_most(self.cfg.tws_con_timeout - since);
        return;
      }
    }
    self.last_connect = Some(now);
    info!("connecting to {}:{} as client {}", self.cfg.tws_host, self.cfg.tws_port, self.cfg.tws_client_id);
    match self.client.connect(&self.cfg.tws_host, self.cfg.tws_port, self.cfg.tws_client_id) {
      Ok(()) => self.state = LoopState::WaitConnection,
      Err(e) => {
        warn!("connection failed: {}", e);
        self.wait_at_most(self.cfg.tws_con_timeout);
      }
    }
  }

  fn wait_connection(&mut self, now: i64) {
    if !self.client.is_connected() {
      self.state = LoopState::Idle;
      return;
    }
    let since = now - self.last_connect.unwrap_or(now);
    if since >= self.cfg.tws_req_timeout {
      warn!("no next valid id {}ms after connecting, dropping connection", since);
      self.client.disconnect();
      self.state = LoopState::Idle;
      return;
    }
    self.wait_at_most(self.cfg.tws_req_timeout - since);
  }

  fn on_disconnect(&mut self, now: i64) {
    warn!("connection to TWS lost");
    self.client.disconnect();
    self.farms.set_all_broken();
    self.pacing.clear(&self.farms, now);

    if let Some(p) = self.packet.as_mut() {
      if !p.finished() {
        self.retired.insert(p.req_id());
        p.close_error(ReqError::ConnectionLost);
      }
    }
    for p in self.orders.values_mut() {
      if !p.finished() {
        warn!("order {} may or may not be live", p.req_id());
        p.close_error(ReqError::ConnectionLost);
      }
    }
    // streaming lines are restarted in their original order
    let lines = std::mem::take(&mut self.mkt_data);
    for (id, p) in lines.into_iter().rev() {
      if p.finished() {
        self.mkt_data.insert(id, p);
      } else {
        self.retired.insert(id);
        let (req, _, _) = p.into_parts();
        self.work.mkt_data().add_front(req);
      }
    }
    self.state = LoopState::Idle;
  }

  // --- dispatch ---

  fn idle(&mut self, now: i64) -> Result<(), TwsDlError> {
    if !self.client.is_connected() {
      if self.has_open_work() {
        // the reader stopped before its ConnectionClosed was handled
        self.on_disconnect(now);
      }
      if self.nothing_left() {
        info!("nothing left to do");
        self.state = LoopState::Quit;
      } else {
        self.connect(now);
      }
      return Ok(());
    }

    self.place_orders(now)?;
    self.start_mkt_data(now)?;
    if !self.request.is_open() && self.client.is_connected() {
      self.dispatch(now)?;
    }
    if self.nothing_left() {
      info!("nothing left to do");
      self.state = LoopState::Quit;
    }
    Ok(())
  }

  fn dispatch(&mut self, now: i64) -> Result<(), TwsDlError> {
    let kind = self.work.next_req_type();
    let mut packet = match kind {
      ReqKind::None => return Ok(()),
      ReqKind::AccStatus => QueryPacket::AccStatus(Packet::new(self.work.account().to_string())),
      ReqKind::Executions => QueryPacket::Executions(Packet::new(self.work.exec_filter().clone())),
      ReqKind::Orders => QueryPacket::Orders(Packet::new(())),
      ReqKind::ContractDetails => match self.work.contract_details().checkout() {
        Some(req) => QueryPacket::ContractDetails(Packet::new(req.clone())),
        None => return Ok(()),
      },
      ReqKind::Hist => match self.work.hist().checkout_opt(&mut self.pacing, &self.farms, now) {
        Dispatch::Ready => match self.work.hist_ref().current() {
          Some(req) => QueryPacket::Hist(Packet::new(req.clone())),
          None => return Ok(()),
        },
        Dispatch::Wait(ms) => {
          self.wait_at_most(ms);
          return Ok(());
        }
        Dispatch::Empty => return Ok(()),
      },
    };

    let req_id = self.alloc_id();
    let sent = match &packet {
      QueryPacket::AccStatus(p) => self.client.req_account_updates(true, p.query()),
      QueryPacket::Executions(p) => self.client.req_executions(req_id, p.query()),
      QueryPacket::Orders(_) => self.client.req_all_open_orders(),
      QueryPacket::ContractDetails(p) => self.client.req_contract_details(req_id, &p.query().contract),
      QueryPacket::Hist(p) => {
        let sent = self.client.req_historical_data(req_id, p.query());
        if sent.is_ok() {
          self.pacing.add_request(&p.query().contract, &self.farms, now);
        }
        sent
      }
    };

    packet.record(req_id, now)?;
    self.request.next_request(kind, req_id, now);
    self.packet_action = ErrorAction::Close;
    match sent {
      Ok(()) => {
        debug!("sent {} request {}", kind, req_id);
        self.packet = Some(packet);
        self.wait_at_most(self.cfg.tws_req_timeout);
      }
      Err(e) => {
        // requeued by finish_query on the next iteration
        warn!("sending {} request {} failed: {}", kind, req_id, e);
        self.packet = Some(packet);
        self.on_disconnect(now);
      }
    }
    Ok(())
  }

  fn place_orders(&mut self, now: i64) -> Result<(), TwsDlError> {
    while let Some(po) = self.work.place_orders().checkout().cloned() {
      let order_id = match po.order_id {
        Some(id) => {
          if id >= self.next_id {
            self.next_id = id + 1;
          }
          id
        }
        None => self.alloc_id(),
      };
      if self.orders.contains_key(&order_id) {
        self.violation(format!("order id {} is already being placed", order_id))?;
        continue;
      }
      if let Err(e) = self.client.place_order(order_id, &po.contract, &po.order) {
        warn!("placing order {} failed: {}", order_id, e);
        self.work.place_orders().rewind();
        self.on_disconnect(now);
        return Ok(());
      }
      info!("placed order {}: {} {} {}", order_id, po.order.action, po.order.total_quantity,
            po.contract.text_description());
      let mut p = Packet::new(po);
      p.record(order_id, now)?;
      self.orders.insert(order_id, p);
    }
    Ok(())
  }

  fn start_mkt_data(&mut self, now: i64) -> Result<(), TwsDlError> {
    while self.mkt_data.len() < self.cfg.max_mkt_data_lines {
      let req = match self.work.mkt_data().pop() {
        Some(req) => req,
        None => break,
      };
      let ticker_id = self.alloc_id();
      if let Err(e) = self.client.req_mkt_data(ticker_id, &req) {
        warn!("market data request {} failed: {}", ticker_id, e);
        self.work.mkt_data().add_front(req);
        self.on_disconnect(now);
        return Ok(());
      }
      debug!("market data line {} for {}", ticker_id, req.contract.text_description());
      let mut p = Packet::new(req);
      p.record(ticker_id, now)?;
      self.mkt_data.insert(ticker_id, p);
    }
    Ok(())
  }

  // --- completion ---

  fn drain_orders(&mut self, sink: &mut dyn ResponseSink, now: i64) -> Result<(), TwsDlError> {
    let timeout = self.cfg.tws_req_timeout;
    let mut next_timeout = i64::MAX;
    let mut cancel = Vec::new();
    for p in self.orders.values_mut() {
      if p.finished() {
        continue;
      }
      let age = now - p.started();
      if age >= timeout {
        warn!("order {} not acknowledged after {}ms, cancelling", p.req_id(), age);
        p.close_error(ReqError::Timeout);
        cancel.push(p.req_id());
      } else {
        next_timeout = next_timeout.min(timeout - age);
      }
    }
    self.wait_at_most(next_timeout);
    for id in cancel {
      self.retired.insert(id);
      if let Err(e) = self.client.cancel_order(id) {
        debug!("cancel order {}: {}", id, e);
      }
    }

    let done: Vec<i32> = self.orders.iter().filter(|(_, p)| p.finished()).map(|(id, _)| *id).collect();
    for id in done {
      if let Some(p) = self.orders.remove(&id) {
        self.report(sink, Completed::PlaceOrder(&p))?;
      }
    }
    Ok(())
  }

  fn drain_mkt_data(&mut self, sink: &mut dyn ResponseSink, now: i64) -> Result<(), TwsDlError> {
    let timeout = self.cfg.tws_req_timeout;
    let mut next_timeout = i64::MAX;
    let mut cancel = Vec::new();
    for (id, p) in self.mkt_data.iter_mut() {
      if p.finished() || !p.query().snapshot {
        continue;
      }
      let age = now - p.started();
      if age >= timeout {
        warn!("market data snapshot {} not finished after {}ms", id, age);
        p.close_error(ReqError::Timeout);
        cancel.push(*id);
      } else {
        next_timeout = next_timeout.min(timeout - age);
      }
    }
    self.wait_at_most(next_timeout);
    for id in cancel {
      self.retired.insert(id);
      if let Err(e) = self.client.cancel_mkt_data(id) {
        debug!("cancel market data {}: {}", id, e);
      }
    }

    let done: Vec<i32> = self.mkt_data.iter().filter(|(_, p)| p.finished()).map(|(id, _)| *id).collect();
    for id in done {
      if let Some(p) = self.mkt_data.remove(&id) {
        self.report(sink, Completed::MktData(&p))?;
      }
    }
    Ok(())
  }

  fn unsubscribe_account(&mut self) {
    let account = self.work.account().to_string();
    if let Err(e) = self.client.req_account_updates(false, &account) {
      debug!("account unsubscribe: {}", e);
    }
  }

  /// Close the in-flight query on timeout and hand a finished one to its
  /// queue and the sink.
  fn finish_query(&mut self, sink: &mut dyn ResponseSink, now: i64) -> Result<(), TwsDlError> {
    let finished = match &self.packet {
      Some(p) => p.finished(),
      None => return Ok(()),
    };
    let (kind, req_id) = (self.request.kind(), self.request.req_id());
    if !finished {
      let age = self.request.age(now);
      let timeout = self.cfg.tws_req_timeout;
      if age < timeout {
        self.wait_at_most(timeout - age);
        return Ok(());
      }
      warn!("{} request {} timed out after {}ms", kind, req_id, age);
      if let Some(p) = self.packet.as_mut() {
        p.close_error(ReqError::Timeout);
      }
      self.retired.insert(req_id);
      if kind == ReqKind::AccStatus && self.client.is_connected() {
        self.unsubscribe_account();
      }
    }

    let packet = match self.packet.take() {
      Some(p) => p,
      None => return Ok(()),
    };
    self.request.close();
    let err = packet.error();
    let action = std::mem::replace(&mut self.packet_action, ErrorAction::Close);
    debug!("{} request {} finished: {} ({} rows)", kind, req_id, err, packet.row_count());

    match &packet {
      QueryPacket::Hist(p) => {
        match err {
          ReqError::ConnectionLost => {
            self.work.hist().cancel_for_repeat(0, err);
            return Ok(());
          }
          ReqError::Timeout => {
            self.work.hist().cancel_for_repeat(1, err);
            return Ok(());
          }
          ReqError::RequestRejected => self.work.hist().cancel_for_repeat(2, err),
          _ => self.work.hist().tell_done(err),
        }
        self.report(sink, Completed::Query(&packet))?;

        let before = self.work.hist_ref().count_error();
        let skipped = match action {
          ErrorAction::SkipByPerm => self.work.hist().skip_by_perm(p.query()),
          ErrorAction::SkipByNodata => self.work.hist().skip_by_nodata(p.query()),
          _ => 0,
        };
        if skipped > 0 {
          let failed: Vec<_> = self.work.hist_ref().errors()[before..].to_vec();
          for (req, e) in failed {
            let mut sp = Packet::new(req);
            sp.close_error(e);
            self.report(sink, Completed::Query(&QueryPacket::Hist(sp)))?;
          }
        }
      }
      QueryPacket::ContractDetails(_) => match err {
        ReqError::ConnectionLost => self.work.contract_details().rewind(),
        _ => self.report(sink, Completed::Query(&packet))?,
      },
      QueryPacket::AccStatus(_) | QueryPacket::Executions(_) | QueryPacket::Orders(_) => match err {
        ReqError::ConnectionLost => self.work.add_simple_request(kind),
        _ => self.report(sink, Completed::Query(&packet))?,
      },
    }
    Ok(())
  }

  // --- events ---

  fn handle_event(&mut self, ev: Event, now: i64) -> Result<(), TwsDlError> {
    trace!("event {:?}", ev);
    if let Some(id) = ev.req_id() {
      let data = !matches!(ev, Event::Error { .. } | Event::OrderStatus(_) | Event::OpenOrder(_));
      if data && self.retired.contains(&id) {
        debug!("dropping late {:?} for abandoned request {}", ev, id);
        return Ok(());
      }
    }
    match ev {
      Event::ConnectionClosed => self.on_disconnect(now),
      Event::NextValidId(id) => {
        if id > self.next_id {
          self.next_id = id;
        }
        if self.state == LoopState::WaitConnection {
          info!("connected, next valid id {}", id);
          self.state = LoopState::Idle;
        }
      }
      Event::Error { id, code, msg } => self.on_error(id, code, &msg, now)?,

      Event::ContractDetails { req_id, details } => {
        if !append_query_row!(self, ContractDetails, req_id, details) {
          self.unexpected(req_id, "contract details")?;
        }
      }
      Event::ContractDetailsEnd { req_id } => self.end_query(ReqKind::ContractDetails, req_id, "contract details end")?,

      Event::HistoricalBar { req_id, bar } => {
        if !append_query_row!(self, Hist, req_id, bar) {
          self.unexpected(req_id, "historical bar")?;
        }
      }
      Event::HistoricalDataEnd { req_id, .. } => {
        if let Some(QueryPacket::Hist(p)) = self.packet.as_ref() {
          if p.req_id() == req_id {
            self.farms.learn_hmds(&p.query().contract);
          }
        }
        self.end_query(ReqKind::Hist, req_id, "historical data end")?;
      }

      Event::AccountValue(v) => {
        self.account.update_value(v.clone());
        self.acc_status_row(AccStatusRow::Value(v));
      }
      Event::Portfolio(row) => {
        self.account.update_portfolio(row.clone());
        self.acc_status_row(AccStatusRow::Portfolio(row));
      }
      Event::AccountUpdateTime(t) => {
        self.account.set_update_time(t.clone());
        self.acc_status_row(AccStatusRow::UpdateTime(t));
      }
      Event::AccountDownloadEnd(acct) => {
        let recording = matches!(&self.packet, Some(QueryPacket::AccStatus(p)) if p.state() == PacketState::Record);
        if recording {
          debug!("account download for '{}' complete", acct);
          if let Some(p) = self.packet.as_mut() {
            p.close_error(ReqError::None);
          }
          self.unsubscribe_account();
        } else {
          debug!("unsolicited account download end for '{}'", acct);
        }
      }

      Event::Execution { req_id, execution } => {
        if req_id < 0 {
          debug!("execution {} of a live order", execution.exec_id);
        } else if !append_query_row!(self, Executions, req_id, execution) {
          self.unexpected(req_id, "execution")?;
        }
      }
      Event::ExecutionEnd { req_id } => self.end_query(ReqKind::Executions, req_id, "executions end")?,

      Event::OrderStatus(row) => {
        self.account.update_order_status(row.clone());
        if let Some(p) = self.orders.get_mut(&row.order_id) {
          if !p.finished() {
            p.append(OrderRow::Status(row.clone()));
            if p.is_acknowledged() {
              info!("order {} is {}", row.order_id, row.status);
              p.close();
            }
          }
        }
        self.orders_row(OrderRow::Status(row));
      }
      Event::OpenOrder(row) => {
        self.account.update_open_order(row.clone());
        if let Some(p) = self.orders.get_mut(&row.order_id) {
          if !p.finished() {
            p.append(OrderRow::Open(row.clone()));
          }
        }
        self.orders_row(OrderRow::Open(row));
      }
      Event::OpenOrderEnd => {
        if let Some(QueryPacket::Orders(p)) = self.packet.as_mut() {
          if p.state() == PacketState::Record {
            p.close();
          }
        }
      }

      Event::TickPrice { ticker_id, field, price } => {
        self.tick(ticker_id, Tick { field, value: TickValue::Price(price) })?;
      }
      Event::TickSize { ticker_id, field, size } => {
        self.tick(ticker_id, Tick { field, value: TickValue::Size(size) })?;
      }
      Event::TickSnapshotEnd { req_id } => match self.mkt_data.get_mut(&req_id) {
        Some(p) => p.close(),
        None => self.unexpected(req_id, "snapshot end")?,
      },

      Event::CurrentTime(t) => debug!("TWS time {}", t),
    }
    Ok(())
  }

  fn end_query(&mut self, kind: ReqKind, req_id: i32, what: &str) -> Result<(), TwsDlError> {
    match self.packet.as_mut() {
      Some(p) if p.kind() == kind && p.req_id() == req_id => {
        p.close_error(ReqError::None);
        Ok(())
      }
      _ => self.unexpected(req_id, what),
    }
  }

  fn acc_status_row(&mut self, row: AccStatusRow) {
    if let Some(QueryPacket::AccStatus(p)) = self.packet.as_mut() {
      if p.state() == PacketState::Record {
        p.append(row);
      }
    }
  }

  fn orders_row(&mut self, row: OrderRow) {
    if let Some(QueryPacket::Orders(p)) = self.packet.as_mut() {
      if p.state() == PacketState::Record {
        p.append(row);
      }
    }
  }

  fn tick(&mut self, ticker_id: i32, tick: Tick) -> Result<(), TwsDlError> {
    match self.mkt_data.get_mut(&ticker_id) {
      Some(p) => {
        p.append(tick);
        Ok(())
      }
      None => self.unexpected(ticker_id, "tick"),
    }
  }

  fn error_scope(&self, id: i32) -> ErrorScope {
    if id < 0 {
      return ErrorScope::General;
    }
    if let Some(p) = &self.packet {
      if p.req_id() == id && !p.finished() {
        return ErrorScope::Query(p.kind());
      }
    }
    if self.orders.contains_key(&id) {
      return ErrorScope::PlaceOrder;
    }
    if self.mkt_data.contains_key(&id) {
      return ErrorScope::MktData;
    }
    ErrorScope::General
  }

  fn on_error(&mut self, id: i32, code: i32, msg: &str, now: i64) -> Result<(), TwsDlError> {
    self.msg_seq += 1;
    let seq = self.msg_seq;
    if is_farm_notice(code) {
      if self.farms.notify(seq, code, msg) {
        self.pacing.clear(&self.farms, now);
      }
      return Ok(());
    }

    let scope = self.error_scope(id);
    let rule = match classify(scope, code, msg) {
      Some(r) => r,
      None => return Ok(()),
    };
    match rule.action {
      ErrorAction::Ignore => debug!("TWS error {} for {}: {}", code, id, msg),
      ErrorAction::AllFarmsBroken => {
        warn!("TWS lost its data connections ({}): {}", code, msg);
        self.farms.set_all_broken();
        self.pacing.clear(&self.farms, now);
      }
      ErrorAction::Disconnect => {
        error!("TWS error {}: {}", code, msg);
        self.on_disconnect(now);
      }
      action => match scope {
        ErrorScope::General => warn!("TWS error {} for id {}: {}", code, id, msg),
        ErrorScope::Query(kind) => {
          warn!("{} request {} failed with {} ({}): {}", kind, id, rule.class, code, msg);
          if let Some(QueryPacket::Hist(p)) = self.packet.as_ref() {
            let contract = p.query().contract.clone();
            self.farms.learn_hmds_last_ok(seq, &contract);
            if action == ErrorAction::PacingViolation {
              warn!("pacing violation for {}", contract.text_description());
              self.pacing.notify_violation(&contract, &self.farms, now);
            }
          }
          self.packet_action = action;
          if let Some(p) = self.packet.as_mut() {
            p.close_error(rule.class);
          }
        }
        ErrorScope::PlaceOrder => {
          warn!("order {} failed with {} ({}): {}", id, rule.class, code, msg);
          if let Some(p) = self.orders.get_mut(&id) {
            p.close_error(rule.class);
          }
        }
        ErrorScope::MktData => {
          warn!("market data {} failed with {} ({}): {}", id, rule.class, code, msg);
          if let Some(p) = self.mkt_data.get_mut(&id) {
            p.close_error(rule.class);
          }
        }
      },
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::account::AccountValue;
  use crate::clock::ManualClock;
  use crate::conn_mock::{Scripted, ScriptedClient, Sent};
  use crate::contract::Contract;
  use crate::data::Bar;
  use crate::data_farm::FarmState;
  use crate::job_file::MemorySink;
  use crate::order::{Order, OrderStatus, OrderStatusRow};
  use crate::contract::ContractDetails;
  use crate::todo::{ContractDetailsRequest, HistRequest, MktDataRequest, PlaceOrder};

  const T0: i64 = 1_700_000_000_000;

  fn cfg() -> Config {
    Config { violation_policy: ViolationPolicy::Abort, ..Config::default() }
  }

  fn setup(cfg: Config, work: WorkTodo) -> (TwsDl<ScriptedClient, ManualClock>, ScriptedClient, ManualClock) {
    let clock = ManualClock::new(T0);
    let client = ScriptedClient::new(clock.clone());
    let dl = TwsDl::new(cfg, client.clone(), clock.clone(), work);
    (dl, client, clock)
  }

  fn ibm() -> Contract {
    Contract::stock_with_exchange("IBM", "NYSE", "USD")
  }

  fn bar() -> Bar {
    Bar { date: "20240105".into(), open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 100, wap: 1.2,
          has_gaps: false, count: 7 }
  }

  fn answer_hist(req_id: i32, after: i64) -> Vec<Scripted> {
    vec![
      Scripted::After(after, Event::HistoricalBar { req_id, bar: bar() }),
      Scripted::After(after, Event::HistoricalDataEnd { req_id, start: String::new(), end: String::new() }),
    ]
  }

  fn hist_sends(client: &ScriptedClient) -> Vec<(i64, HistRequest)> {
    client.sent().into_iter().filter_map(|(t, s)| match s {
      Sent::Hist { req, .. } => Some((t, req)),
      _ => None,
    }).collect()
  }

  #[test]
  fn test_single_request_no_data() {
    let req = HistRequest::new(ibm(), "20240105 16:00:00", "1 D", "1 hour", "TRADES");
    let mut work = WorkTodo::new();
    work.hist().add(req.clone());
    let (mut dl, client, _clock) = setup(cfg(), work);
    client.set_responder(|s| match s {
      Sent::Hist { req_id, .. } => vec![Scripted::After(50, Event::Error {
        id: *req_id,
        code: 162,
        msg: "Historical Market Data Service error message:HMDS query returned no data: IBM@NYSE Trades".into(),
      })],
      _ => Vec::new(),
    });

    let mut sink = MemorySink::default();
    let summary = dl.run(&mut sink).unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(dl.work().hist_ref().done(), &[(req, ReqError::NoData)]);
    assert_eq!(sink.summary, vec![("historical_data".to_string(), ReqError::NoData, 0)]);
    assert_eq!(dl.state(), LoopState::Quit);
    assert!(!client.is_connected());
  }

  #[test]
  fn test_unknown_farm_waits_for_global_bucket() {
    let xyz = Contract::stock_with_exchange("XYZ", "NOWHERE", "USD");
    let r1 = HistRequest::new(xyz.clone(), "", "1 D", "1 hour", "TRADES");
    let r2 = HistRequest::new(xyz, "", "1 D", "1 hour", "BID");
    let mut work = WorkTodo::new();
    work.hist().add(r1.clone());
    work.hist().add(r2.clone());
    let (mut dl, client, _clock) = setup(cfg(), work);
    client.set_responder(|s| match s {
      Sent::Hist { req_id, .. } => answer_hist(*req_id, 100),
      _ => Vec::new(),
    });

    let mut sink = MemorySink::default();
    let summary = dl.run(&mut sink).unwrap();
    assert_eq!(summary, RunSummary { completed: 2, errors: 0, unfinished: 0 });
    assert_eq!(hist_sends(&client), vec![(T0, r1), (T0 + 1_500, r2)]);
    assert_eq!(sink.summary[0].2, 1);
  }

  #[test]
  fn test_disconnect_requeues_at_front_and_reconnects_later() {
    let a = HistRequest::new(ibm(), "", "1 D", "1 hour", "TRADES");
    let b = HistRequest::new(ibm(), "", "2 D", "1 hour", "TRADES");
    let mut work = WorkTodo::new();
    work.hist().add(a.clone());
    work.hist().add(b.clone());
    let mut c = cfg();
    c.tws_con_timeout = 10_000;
    let (mut dl, client, clock) = setup(c, work);
    client.set_on_connect(vec![
      Event::NextValidId(1),
      Event::Error { id: -1, code: 2106, msg: "HMDS data farm connection is OK:ushmds".into() },
    ]);
    let mut first = true;
    client.set_responder(move |s| match s {
      Sent::Hist { .. } if first => {
        first = false;
        vec![Scripted::Disconnect(200)]
      }
      Sent::Hist { req_id, .. } => answer_hist(*req_id, 100),
      _ => Vec::new(),
    });

    let mut sink = MemorySink::default();
    // run until the connection drops
    let mut seen_connected = false;
    loop {
      assert!(dl.step(&mut sink).unwrap());
      if client.is_connected() {
        seen_connected = true;
      } else if seen_connected {
        break;
      }
    }
    assert_eq!(clock.now_ms(), T0 + 200);
    assert_eq!(dl.farms().hmds_state("ushmds"), Some(FarmState::Broken));

    // next iteration hands the lost request back
    assert!(dl.step(&mut sink).unwrap());
    let left: Vec<_> = dl.work().hist_ref().left().cloned().collect();
    assert_eq!(left, vec![a.clone(), b.clone()]);

    while dl.step(&mut sink).unwrap() {}
    assert_eq!(client.connect_attempts(), vec![T0, T0 + 10_000]);
    let sends: Vec<HistRequest> = hist_sends(&client).into_iter().map(|(_, r)| r).collect();
    assert_eq!(sends, vec![a.clone(), a, b]);
    assert_eq!(dl.work().hist_ref().count_done(), 2);
    assert_eq!(dl.summary().exit_code(), 0);
  }

  #[test]
  fn test_timeout_moves_request_to_back() {
    let a = HistRequest::new(ibm(), "", "1 D", "1 hour", "TRADES");
    let b = HistRequest::new(ibm(), "", "1 D", "1 hour", "MIDPOINT");
    let mut work = WorkTodo::new();
    work.hist().add(a.clone());
    work.hist().add(b.clone());
    let (mut dl, client, _clock) = setup(cfg(), work);
    let mut first = true;
    client.set_responder(move |s| match s {
      Sent::Hist { .. } if first => {
        first = false;
        Vec::new()
      }
      Sent::Hist { req_id, .. } => answer_hist(*req_id, 10),
      _ => Vec::new(),
    });

    let mut sink = MemorySink::default();
    let summary = dl.run(&mut sink).unwrap();
    let sends: Vec<(i64, HistRequest)> = hist_sends(&client);
    assert_eq!(sends.len(), 3);
    assert_eq!(sends[0], (T0, a.clone()));
    assert_eq!(sends[1], (T0 + 20_000, b));
    assert_eq!(sends[2].1, a);
    assert_eq!(summary.exit_code(), 0);
  }

  #[test]
  fn test_permission_error_skips_same_contract() {
    let msft = Contract::stock_with_exchange("MSFT", "NASDAQ", "USD");
    let a = HistRequest::new(ibm(), "", "1 D", "1 hour", "TRADES");
    let b = HistRequest::new(ibm(), "", "1 W", "1 day", "TRADES");
    let c = HistRequest::new(msft, "", "1 D", "1 hour", "TRADES");
    let mut work = WorkTodo::new();
    work.hist().add(a);
    work.hist().add(b);
    work.hist().add(c.clone());
    let (mut dl, client, _clock) = setup(cfg(), work);
    client.set_responder(|s| match s {
      Sent::Hist { req_id, req } if req.contract.symbol == "IBM" => vec![Scripted::Now(Event::Error {
        id: *req_id,
        code: 162,
        msg: "Historical Market Data Service error message:No market data permissions for NYSE STK".into(),
      })],
      Sent::Hist { req_id, .. } => answer_hist(*req_id, 10),
      _ => Vec::new(),
    });

    let mut sink = MemorySink::default();
    let summary = dl.run(&mut sink).unwrap();
    assert_eq!(hist_sends(&client).len(), 2);
    assert_eq!(dl.work().hist_ref().count_error(), 2);
    assert_eq!(dl.work().hist_ref().done(), &[(c, ReqError::None)]);
    assert_eq!(summary.errors, 2);
    assert_eq!(summary.exit_code(), 1);
  }

  #[test]
  fn test_account_orders_and_snapshot() {
    let mut work = WorkTodo::new();
    work.set_account("DU1");
    work.add_simple_request(ReqKind::AccStatus);
    work.place_orders().add(PlaceOrder { contract: ibm(), order: Order::default(), order_id: None });
    work.mkt_data().add(MktDataRequest { contract: ibm(), generic_ticks: String::new(), snapshot: true });
    let (mut dl, client, _clock) = setup(cfg(), work);
    client.set_on_connect(vec![Event::NextValidId(100)]);
    client.set_responder(|s| match s {
      Sent::AccountUpdates { subscribe: true, account } => vec![
        Scripted::Now(Event::AccountValue(AccountValue {
          key: "NetLiquidation".into(), value: "1000".into(), currency: "USD".into(), account: account.clone(),
        })),
        Scripted::After(5, Event::AccountDownloadEnd(account.clone())),
      ],
      Sent::PlaceOrder { order_id, .. } => vec![Scripted::After(20, Event::OrderStatus(OrderStatusRow {
        order_id: *order_id, status: OrderStatus::Submitted, filled: 0.0, remaining: 100.0, avg_fill_price: 0.0,
        perm_id: 55, parent_id: 0, last_fill_price: 0.0, client_id: 123, why_held: String::new(),
      }))],
      Sent::MktData { ticker_id, .. } => vec![
        Scripted::Now(Event::TickPrice { ticker_id: *ticker_id, field: 1, price: 150.0 }),
        Scripted::Now(Event::TickSize { ticker_id: *ticker_id, field: 0, size: 300 }),
        Scripted::After(30, Event::TickSnapshotEnd { req_id: *ticker_id }),
      ],
      _ => Vec::new(),
    });

    let mut sink = MemorySink::default();
    let summary = dl.run(&mut sink).unwrap();
    assert_eq!(summary, RunSummary { completed: 3, errors: 0, unfinished: 0 });
    let mut kinds: Vec<(String, usize)> = sink.summary.iter().map(|(k, _, n)| (k.clone(), *n)).collect();
    kinds.sort();
    assert_eq!(kinds, vec![("account".to_string(), 1), ("market_data".to_string(), 2), ("place_order".to_string(), 1)]);
    assert_eq!(dl.account().value("NetLiquidation", "USD", "DU1").map(|v| v.value.as_str()), Some("1000"));
    assert_eq!(dl.account().order_status(55).map(|s| s.order_id), Some(100));
    assert!(client.sent().iter().any(|(_, s)| *s == Sent::AccountUpdates { subscribe: false, account: "DU1".into() }));
  }

  #[test]
  fn test_unknown_request_id_policy() {
    let mut work = WorkTodo::new();
    work.hist().add(HistRequest::new(ibm(), "", "1 D", "1 hour", "TRADES"));
    let stray = |s: &Sent| match s {
      Sent::Hist { req_id, .. } => vec![Scripted::Now(Event::HistoricalBar { req_id: *req_id + 40, bar: bar() })],
      _ => Vec::new(),
    };

    let (mut dl, client, _clock) = setup(cfg(), work);
    client.set_responder(stray);
    let err = dl.run(&mut MemorySink::default()).unwrap_err();
    assert!(matches!(err, TwsDlError::ProtocolViolation(_)));

    let mut work = WorkTodo::new();
    work.hist().add(HistRequest::new(ibm(), "", "1 D", "1 hour", "TRADES"));
    let mut c = cfg();
    c.violation_policy = ViolationPolicy::Warn;
    c.tws_req_timeout = 1_000;
    let (mut dl, client, _clock) = setup(c, work);
    let mut first = true;
    client.set_responder(move |s| match s {
      Sent::Hist { req_id, .. } if first => {
        first = false;
        stray(s).into_iter().chain(answer_hist(*req_id, 10)).collect()
      }
      _ => Vec::new(),
    });
    let summary = dl.run(&mut MemorySink::default()).unwrap();
    assert_eq!(summary.exit_code(), 0);
  }

  #[test]
  fn test_refused_connection_is_retried_after_con_timeout() {
    let mut work = WorkTodo::new();
    work.add_simple_request(ReqKind::Orders);
    let mut c = cfg();
    c.tws_con_timeout = 5_000;
    let (mut dl, client, _clock) = setup(c, work);
    client.refuse_connects(2);
    client.set_responder(|s| match s {
      Sent::AllOpenOrders => vec![Scripted::After(10, Event::OpenOrderEnd)],
      _ => Vec::new(),
    });
    let mut sink = MemorySink::default();
    dl.run(&mut sink).unwrap();
    assert_eq!(client.connect_attempts(), vec![T0, T0 + 5_000, T0 + 10_000]);
    assert_eq!(sink.summary, vec![("open_orders".to_string(), ReqError::None, 0)]);
  }

  fn cd_sends(client: &ScriptedClient) -> usize {
    client.sent().iter().filter(|(_, s)| matches!(s, Sent::ContractDetails { .. })).count()
  }

  #[test]
  fn test_contract_details_timeout_is_final() {
    let mut work = WorkTodo::new();
    work.contract_details().add(ContractDetailsRequest { contract: ibm() });
    let mut c = cfg();
    c.tws_req_timeout = 1_000;
    let (mut dl, client, clock) = setup(c, work);

    let mut sink = MemorySink::default();
    let summary = dl.run(&mut sink).unwrap();
    assert_eq!(cd_sends(&client), 1);
    assert_eq!(sink.summary, vec![("contract_details".to_string(), ReqError::Timeout, 0)]);
    assert_eq!(summary, RunSummary { completed: 1, errors: 1, unfinished: 0 });
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(clock.now_ms(), T0 + 1_000);
  }

  #[test]
  fn test_late_answer_for_timed_out_request_is_dropped() {
    let sap = Contract::stock_with_exchange("SAP", "IBIS", "EUR");
    let mut work = WorkTodo::new();
    work.contract_details().add(ContractDetailsRequest { contract: ibm() });
    work.contract_details().add(ContractDetailsRequest { contract: sap });
    let mut c = cfg();
    c.tws_req_timeout = 1_000;
    let (mut dl, client, _clock) = setup(c, work);
    client.set_responder(|s| match s {
      Sent::ContractDetails { req_id, contract } => {
        let after = if contract.symbol == "IBM" { 1_500 } else { 800 };
        vec![
          Scripted::After(after, Event::ContractDetails { req_id: *req_id, details: ContractDetails::default() }),
          Scripted::After(after, Event::ContractDetailsEnd { req_id: *req_id }),
        ]
      }
      _ => Vec::new(),
    });

    // strict policy: the stray IBM answer at +1500 must not abort the run
    let mut sink = MemorySink::default();
    let summary = dl.run(&mut sink).unwrap();
    assert_eq!(cd_sends(&client), 2);
    assert_eq!(sink.summary, vec![
      ("contract_details".to_string(), ReqError::Timeout, 0),
      ("contract_details".to_string(), ReqError::None, 1),
    ]);
    assert_eq!(summary.errors, 1);
  }

  #[test]
  fn test_pacing_violation_retries_first_after_pause() {
    let a = HistRequest::new(ibm(), "", "1 D", "1 hour", "TRADES");
    let b = HistRequest::new(ibm(), "", "1 D", "1 hour", "BID");
    let mut work = WorkTodo::new();
    work.hist().add(a.clone());
    work.hist().add(b.clone());
    let (mut dl, client, _clock) = setup(cfg(), work);
    let mut first = true;
    client.set_responder(move |s| match s {
      Sent::Hist { req_id, .. } if first => {
        first = false;
        vec![Scripted::After(100, Event::Error {
          id: *req_id,
          code: 162,
          msg: "Historical Market Data Service error message:Historical data request pacing violation".into(),
        })]
      }
      Sent::Hist { req_id, .. } => answer_hist(*req_id, 100),
      _ => Vec::new(),
    });

    let mut sink = MemorySink::default();
    let summary = dl.run(&mut sink).unwrap();
    assert_eq!(hist_sends(&client), vec![(T0, a.clone()), (T0 + 60_000, a), (T0 + 61_500, b)]);
    assert_eq!(summary, RunSummary { completed: 2, errors: 0, unfinished: 0 });
    assert_eq!(dl.work().hist_ref().count_done(), 2);
  }

  #[test]
  fn test_error_after_farm_ok_notice_binds_farm() {
    let ry = Contract::stock_with_exchange("RY", "TSE", "CAD");
    let mut work = WorkTodo::new();
    work.hist().add(HistRequest::new(ry.clone(), "", "1 D", "1 hour", "TRADES"));
    let (mut dl, client, _clock) = setup(cfg(), work);
    assert_eq!(dl.farms().get_hmds_farm(&ry), None);
    client.set_responder(|s| match s {
      Sent::Hist { req_id, .. } => vec![
        Scripted::After(50, Event::Error { id: -1, code: 2106, msg: "HMDS data farm connection is OK:cahmds".into() }),
        Scripted::After(50, Event::Error {
          id: *req_id,
          code: 162,
          msg: "Historical Market Data Service error message:HMDS query returned no data: RY@TSE Trades".into(),
        }),
      ],
      _ => Vec::new(),
    });

    let summary = dl.run(&mut MemorySink::default()).unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(dl.farms().get_hmds_farm(&ry), Some("cahmds"));
  }

  #[test]
  fn test_order_without_ack_is_cancelled() {
    let mut work = WorkTodo::new();
    work.place_orders().add(PlaceOrder { contract: ibm(), order: Order::default(), order_id: None });
    let (mut dl, client, _clock) = setup(cfg(), work);
    client.set_on_connect(vec![Event::NextValidId(100)]);
    client.set_responder(|s| match s {
      Sent::CancelOrder(id) => vec![Scripted::Now(Event::OrderStatus(OrderStatusRow {
        order_id: *id, status: OrderStatus::Cancelled, filled: 0.0, remaining: 100.0, avg_fill_price: 0.0,
        perm_id: 56, parent_id: 0, last_fill_price: 0.0, client_id: 123, why_held: String::new(),
      }))],
      _ => Vec::new(),
    });

    let mut sink = MemorySink::default();
    let summary = dl.run(&mut sink).unwrap();
    let cancels: Vec<(i64, Sent)> = client.sent().into_iter().filter(|(_, s)| matches!(s, Sent::CancelOrder(_))).collect();
    assert_eq!(cancels, vec![(T0 + 20_000, Sent::CancelOrder(100))]);
    assert_eq!(sink.summary, vec![("place_order".to_string(), ReqError::Timeout, 0)]);
    assert_eq!(summary.exit_code(), 1);
  }

  #[test]
  fn test_silent_connection_loss_requeues_request() {
    let a = HistRequest::new(ibm(), "", "1 D", "1 hour", "TRADES");
    let mut work = WorkTodo::new();
    work.hist().add(a.clone());
    let mut c = cfg();
    c.tws_con_timeout = 5_000;
    let (mut dl, client, _clock) = setup(c, work);
    let mut first = true;
    client.set_responder(move |s| match s {
      Sent::Hist { .. } if first => {
        first = false;
        Vec::new()
      }
      Sent::Hist { req_id, .. } => answer_hist(*req_id, 10),
      _ => Vec::new(),
    });

    let mut sink = MemorySink::default();
    while hist_sends(&client).is_empty() {
      assert!(dl.step(&mut sink).unwrap());
    }
    // the connection goes away without a ConnectionClosed event
    client.clone().disconnect();

    while dl.step(&mut sink).unwrap() {}
    assert_eq!(client.connect_attempts(), vec![T0, T0 + 5_000]);
    assert_eq!(hist_sends(&client), vec![(T0, a.clone()), (T0 + 5_000, a)]);
    assert_eq!(sink.summary, vec![("historical_data".to_string(), ReqError::None, 1)]);
    assert_eq!(dl.summary().exit_code(), 0);
  }
}
