// twsdl/src/event.rs
// Messages from TWS that the downloader acts on

use crate::account::{AccountValue, Execution, PortfolioRow};
use crate::contract::ContractDetails;
use crate::data::Bar;
use crate::order::{OpenOrderRow, OrderStatusRow};

/// Everything a protocol client hands back to the event loop. Messages TWS
/// sends that are not listed here are dropped by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  /// The socket is gone.
  ConnectionClosed,
  /// First message after the handshake; seeds the id allocator.
  NextValidId(i32),
  /// `id` is -1 for messages not tied to a request.
  Error { id: i32, code: i32, msg: String },
  ContractDetails { req_id: i32, details: ContractDetails },
  ContractDetailsEnd { req_id: i32 },
  HistoricalBar { req_id: i32, bar: Bar },
  HistoricalDataEnd { req_id: i32, start: String, end: String },
  AccountValue(AccountValue),
  Portfolio(PortfolioRow),
  AccountUpdateTime(String),
  AccountDownloadEnd(String),
  Execution { req_id: i32, execution: Execution },
  ExecutionEnd { req_id: i32 },
  OrderStatus(OrderStatusRow),
  OpenOrder(OpenOrderRow),
  OpenOrderEnd,
  TickPrice { ticker_id: i32, field: i32, price: f64 },
  TickSize { ticker_id: i32, field: i32, size: i64 },
  TickSnapshotEnd { req_id: i32 },
  CurrentTime(i64),
}

impl Event {
  /// Request or ticker id the event belongs to, if any.
  pub fn req_id(&self) -> Option<i32> {
    match self {
      Event::Error { id, .. } => Some(*id),
      Event::ContractDetails { req_id, .. }
      | Event::ContractDetailsEnd { req_id }
      | Event::HistoricalBar { req_id, .. }
      | Event::HistoricalDataEnd { req_id, .. }
      | Event::Execution { req_id, .. }
      | Event::ExecutionEnd { req_id }
      | Event::TickSnapshotEnd { req_id } => Some(*req_id),
      Event::TickPrice { ticker_id, .. } | Event::TickSize { ticker_id, .. } => Some(*ticker_id),
      Event::OrderStatus(s) => Some(s.order_id),
      Event::OpenOrder(o) => Some(o.order_id),
      _ => None,
    }
  }
}
