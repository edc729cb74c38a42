// twsdl/src/packet.rs
//! Accumulators for responses.
//!
//! A `Packet` is bound to one request id. It starts `Clean`, collects rows
//! while `Record`, and ends `Closed` with a classification.

use std::fmt;

use log::warn;

use crate::account::{AccountValue, Execution, ExecutionFilter, PortfolioRow};
use crate::base::TwsDlError;
use crate::contract::ContractDetails;
use crate::data::{Bar, Tick};
use crate::order::{OpenOrderRow, Order, OrderStatusRow};
use crate::request::ReqKind;
use crate::todo::{ContractDetailsRequest, HistRequest, MktDataRequest, PlaceOrder};

/// Terminal classification of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReqError {
  #[default]
  None,
  NoData,
  NotAvailable,
  ConnectionLost,
  Timeout,
  RequestRejected,
}

impl ReqError {
  pub fn as_str(&self) -> &'static str {
    match self {
      ReqError::None => "none",
      ReqError::NoData => "nodata",
      ReqError::NotAvailable => "not_available",
      ReqError::ConnectionLost => "connection_lost",
      ReqError::Timeout => "timeout",
      ReqError::RequestRejected => "request_rejected",
    }
  }

  pub fn from_str_lossy(s: &str) -> ReqError {
    match s {
      "nodata" => ReqError::NoData,
      "not_available" => ReqError::NotAvailable,
      "connection_lost" => ReqError::ConnectionLost,
      "timeout" => ReqError::Timeout,
      "request_rejected" => ReqError::RequestRejected,
      _ => ReqError::None,
    }
  }
}

impl fmt::Display for ReqError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
  Clean,
  Record,
  Closed,
}

#[derive(Debug, Clone)]
pub struct Packet<Q, R> {
  state: PacketState,
  req_id: i32,
  started: i64,
  query: Q,
  rows: Vec<R>,
  error: ReqError,
}

impl<Q, R> Packet<Q, R> {
  pub fn new(query: Q) -> Self {
    Self {
      state: PacketState::Clean,
      req_id: 0,
      started: 0,
      query,
      rows: Vec::new(),
      error: ReqError::None,
    }
  }

  /// Start recording for `req_id`. Only valid from `Clean`.
  pub fn record(&mut self, req_id: i32, now: i64) -> Result<(), TwsDlError> {
    if self.state != PacketState::Clean {
      return Err(TwsDlError::InvalidState(format!("record on packet {} in state {:?}", self.req_id, self.state)));
    }
    self.state = PacketState::Record;
    self.req_id = req_id;
    self.started = now;
    Ok(())
  }

  /// Add a row. Rows arriving outside `Record` are dropped.
  pub fn append(&mut self, row: R) -> bool {
    if self.state != PacketState::Record {
      warn!("dropping row for packet {} in state {:?}", self.req_id, self.state);
      return false;
    }
    self.rows.push(row);
    true
  }

  pub fn close(&mut self) {
    self.close_error(ReqError::None);
  }

  pub fn close_error(&mut self, err: ReqError) {
    if self.state == PacketState::Closed {
      warn!("packet {} already closed ({}), ignoring close with {}", self.req_id, self.error, err);
      return;
    }
    self.state = PacketState::Closed;
    self.error = err;
  }

  pub fn finished(&self) -> bool {
    self.state == PacketState::Closed
  }

  /// Reset to `Clean` keeping the query. Only valid from `Closed`.
  pub fn clear(&mut self) -> Result<(), TwsDlError> {
    if self.state != PacketState::Closed {
      return Err(TwsDlError::InvalidState(format!("clear on packet {} in state {:?}", self.req_id, self.state)));
    }
    self.state = PacketState::Clean;
    self.rows.clear();
    self.error = ReqError::None;
    Ok(())
  }

  pub fn state(&self) -> PacketState {
    self.state
  }

  pub fn req_id(&self) -> i32 {
    self.req_id
  }

  pub fn started(&self) -> i64 {
    self.started
  }

  pub fn query(&self) -> &Q {
    &self.query
  }

  pub fn rows(&self) -> &[R] {
    &self.rows
  }

  pub fn error(&self) -> ReqError {
    self.error
  }

  pub fn into_parts(self) -> (Q, Vec<R>, ReqError) {
    (self.query, self.rows, self.error)
  }
}

/// Row of an account status response.
#[derive(Debug, Clone, PartialEq)]
pub enum AccStatusRow {
  Value(AccountValue),
  Portfolio(PortfolioRow),
  UpdateTime(String),
}

/// Row of an open orders or order placement response.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderRow {
  Status(OrderStatusRow),
  Open(OpenOrderRow),
}

pub type AccStatusPacket = Packet<String, AccStatusRow>;
pub type ExecutionsPacket = Packet<ExecutionFilter, Execution>;
pub type OrdersPacket = Packet<(), OrderRow>;
pub type ContractDetailsPacket = Packet<ContractDetailsRequest, ContractDetails>;
pub type HistPacket = Packet<HistRequest, Bar>;
pub type PlaceOrderPacket = Packet<PlaceOrder, OrderRow>;
pub type MktDataPacket = Packet<MktDataRequest, Tick>;

impl PlaceOrderPacket {
  /// Replace the order while still recording, for resubmission under the
  /// same order id.
  pub fn modify(&mut self, order: Order) -> Result<(), TwsDlError> {
    if self.state != PacketState::Record {
      return Err(TwsDlError::InvalidState(format!("modify on order {} in state {:?}", self.req_id, self.state)));
    }
    self.query.order = order;
    Ok(())
  }

  /// An order counts as answered once TWS reports a status that acknowledges it.
  pub fn is_acknowledged(&self) -> bool {
    self.rows.iter().any(|r| matches!(r, OrderRow::Status(s) if s.status.is_acknowledged()))
  }
}

/// The single in-flight query packet.
#[derive(Debug, Clone)]
pub enum QueryPacket {
  AccStatus(AccStatusPacket),
  Executions(ExecutionsPacket),
  Orders(OrdersPacket),
  ContractDetails(ContractDetailsPacket),
  Hist(HistPacket),
}

macro_rules! each_packet {
  ($self:expr, $p:ident => $body:expr) => {
    match $self {
      QueryPacket::AccStatus($p) => $body,
      QueryPacket::Executions($p) => $body,
      QueryPacket::Orders($p) => $body,
      QueryPacket::ContractDetails($p) => $body,
      QueryPacket::Hist($p) => $body,
    }
  };
}

impl QueryPacket {
  pub fn kind(&self) -> ReqKind {
    match self {
      QueryPacket::AccStatus(_) => ReqKind::AccStatus,
      QueryPacket::Executions(_) => ReqKind::Executions,
      QueryPacket::Orders(_) => ReqKind::Orders,
      QueryPacket::ContractDetails(_) => ReqKind::ContractDetails,
      QueryPacket::Hist(_) => ReqKind::Hist,
    }
  }

  pub fn record(&mut self, req_id: i32, now: i64) -> Result<(), TwsDlError> {
    each_packet!(self, p => p.record(req_id, now))
  }

  pub fn req_id(&self) -> i32 {
    each_packet!(self, p => p.req_id())
  }

  pub fn finished(&self) -> bool {
    each_packet!(self, p => p.finished())
  }

  pub fn error(&self) -> ReqError {
    each_packet!(self, p => p.error())
  }

  pub fn row_count(&self) -> usize {
    each_packet!(self, p => p.rows().len())
  }

  pub fn close_error(&mut self, err: ReqError) {
    each_packet!(self, p => p.close_error(err))
  }
}
