// twsdl/src/conn_mock.rs
//! A scripted `ProtocolClient` for driving the event loop without TWS.
//!
//! Time is a shared `ManualClock`: `wait_for_activity` jumps the clock to the
//! next scheduled event instead of sleeping. Responses are produced by a
//! responder closure that sees every outgoing request.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::account::ExecutionFilter;
use crate::base::TwsDlError;
use crate::clock::{Clock, ManualClock};
use crate::conn::ProtocolClient;
use crate::contract::Contract;
use crate::event::Event;
use crate::order::Order;
use crate::todo::{HistRequest, MktDataRequest};

/// An outgoing request as recorded by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
  ContractDetails { req_id: i32, contract: Contract },
  Hist { req_id: i32, req: HistRequest },
  AccountUpdates { subscribe: bool, account: String },
  Executions { req_id: i32, filter: ExecutionFilter },
  AllOpenOrders,
  PlaceOrder { order_id: i32, contract: Contract, order: Order },
  CancelOrder(i32),
  MktData { ticker_id: i32, req: MktDataRequest },
  CancelMktData(i32),
  CurrentTime,
}

/// What the responder wants to happen in reply to a request.
#[derive(Debug, Clone)]
pub enum Scripted {
  /// Deliver right away.
  Now(Event),
  /// Deliver this many milliseconds later.
  After(i64, Event),
  /// Drop the connection after this many milliseconds.
  Disconnect(i64),
}

pub type Responder = Box<dyn FnMut(&Sent) -> Vec<Scripted> + Send>;

struct Pending {
  due: i64,
  seq: u64,
  event: Option<Event>, // None drops the connection
}

struct ScriptState {
  clock: ManualClock,
  connected: bool,
  refuse_connects: usize,
  connect_attempts: Vec<i64>,
  on_connect: Vec<Event>,
  pending: Vec<Pending>,
  seq: u64,
  responder: Option<Responder>,
  sent: Vec<(i64, Sent)>,
}

impl ScriptState {
  fn schedule(&mut self, due: i64, event: Option<Event>) {
    self.seq += 1;
    self.pending.push(Pending { due, seq: self.seq, event });
  }

  fn record(&mut self, sent: Sent) -> Result<(), TwsDlError> {
    if !self.connected {
      return Err(TwsDlError::NotConnected);
    }
    let now = self.clock.now_ms();
    debug!("Mock: sent {:?}", sent);
    let replies = match self.responder.as_mut() {
      Some(r) => r(&sent),
      None => Vec::new(),
    };
    self.sent.push((now, sent));
    for reply in replies {
      match reply {
        Scripted::Now(ev) => self.schedule(now, Some(ev)),
        Scripted::After(ms, ev) => self.schedule(now + ms, Some(ev)),
        Scripted::Disconnect(ms) => self.schedule(now + ms, None),
      }
    }
    Ok(())
  }

  /// Take every pending event due at `t`, in order. A scheduled disconnect
  /// discards whatever would have followed.
  fn take_due(&mut self, t: i64) -> Vec<Event> {
    self.pending.sort_by_key(|p| (p.due, p.seq));
    let split = self.pending.iter().position(|p| p.due > t).unwrap_or(self.pending.len());
    let due: Vec<Pending> = self.pending.drain(..split).collect();
    let mut out = Vec::new();
    for p in due {
      match p.event {
        Some(ev) => out.push(ev),
        None => {
          debug!("Mock: connection dropped at {}", t);
          self.connected = false;
          self.pending.clear();
          out.push(Event::ConnectionClosed);
          break;
        }
      }
    }
    out
  }
}

/// Cloneable handle; clones share the script, so a test can keep one to
/// inspect what was sent after handing the other to the event loop.
#[derive(Clone)]
pub struct ScriptedClient {
  inner: Arc<Mutex<ScriptState>>,
}

impl ScriptedClient {
  pub fn new(clock: ManualClock) -> Self {
    Self {
      inner: Arc::new(Mutex::new(ScriptState {
        clock,
        connected: false,
        refuse_connects: 0,
        connect_attempts: Vec::new(),
        on_connect: vec![Event::NextValidId(1)],
        pending: Vec::new(),
        seq: 0,
        responder: None,
        sent: Vec::new(),
      })),
    }
  }

  pub fn set_responder<F>(&self, f: F)
  where
    F: FnMut(&Sent) -> Vec<Scripted> + Send + 'static,
  {
    self.inner.lock().responder = Some(Box::new(f));
  }

  /// Events delivered after every successful connect.
  pub fn set_on_connect(&self, events: Vec<Event>) {
    self.inner.lock().on_connect = events;
  }

  /// Fail the next `n` connection attempts.
  pub fn refuse_connects(&self, n: usize) {
    self.inner.lock().refuse_connects = n;
  }

  /// Push an unsolicited event, delivered `after_ms` from now.
  pub fn push_event(&self, after_ms: i64, event: Event) {
    let mut st = self.inner.lock();
    let now = st.clock.now_ms();
    st.schedule(now + after_ms, Some(event));
  }

  pub fn drop_connection(&self, after_ms: i64) {
    let mut st = self.inner.lock();
    let now = st.clock.now_ms();
    st.schedule(now + after_ms, None);
  }

  pub fn sent(&self) -> Vec<(i64, Sent)> {
    self.inner.lock().sent.clone()
  }

  pub fn connect_attempts(&self) -> Vec<i64> {
    self.inner.lock().connect_attempts.clone()
  }
}

impl ProtocolClient for ScriptedClient {
  fn connect(&mut self, host: &str, port: u16, client_id: i32) -> Result<(), TwsDlError> {
    let mut st = self.inner.lock();
    let now = st.clock.now_ms();
    st.connect_attempts.push(now);
    if st.connected {
      return Err(TwsDlError::AlreadyConnected);
    }
    if st.refuse_connects > 0 {
      st.refuse_connects -= 1;
      return Err(TwsDlError::ConnectionFailed(format!("Mock refused {}:{} client {}", host, port, client_id)));
    }
    st.connected = true;
    for ev in st.on_connect.clone() {
      st.schedule(now, Some(ev));
    }
    Ok(())
  }

  fn disconnect(&mut self) {
    let mut st = self.inner.lock();
    st.connected = false;
    st.pending.clear();
  }

  fn is_connected(&self) -> bool {
    self.inner.lock().connected
  }

  fn wait_for_activity(&mut self, timeout_ms: i64) -> Vec<Event> {
    let mut st = self.inner.lock();
    let now = st.clock.now_ms();
    let deadline = now + timeout_ms.max(0);
    let next_due = st.pending.iter().map(|p| p.due).min();
    match next_due {
      Some(due) if due <= deadline => {
        if due > now {
          st.clock.set(due);
        }
        let t = st.clock.now_ms();
        st.take_due(t)
      }
      _ => {
        st.clock.set(deadline);
        Vec::new()
      }
    }
  }

  fn req_contract_details(&mut self, req_id: i32, contract: &Contract) -> Result<(), TwsDlError> {
    self.inner.lock().record(Sent::ContractDetails { req_id, contract: contract.clone() })
  }

  fn req_historical_data(&mut self, req_id: i32, req: &HistRequest) -> Result<(), TwsDlError> {
    self.inner.lock().record(Sent::Hist { req_id, req: req.clone() })
  }

  fn req_account_updates(&mut self, subscribe: bool, account: &str) -> Result<(), TwsDlError> {
    self.inner.lock().record(Sent::AccountUpdates { subscribe, account: account.to_string() })
  }

  fn req_executions(&mut self, req_id: i32, filter: &ExecutionFilter) -> Result<(), TwsDlError> {
    self.inner.lock().record(Sent::Executions { req_id, filter: filter.clone() })
  }

  fn req_all_open_orders(&mut self) -> Result<(), TwsDlError> {
    self.inner.lock().record(Sent::AllOpenOrders)
  }

  fn place_order(&mut self, order_id: i32, contract: &Contract, order: &Order) -> Result<(), TwsDlError> {
    self.inner.lock().record(Sent::PlaceOrder { order_id, contract: contract.clone(), order: order.clone() })
  }

  fn cancel_order(&mut self, order_id: i32) -> Result<(), TwsDlError> {
    self.inner.lock().record(Sent::CancelOrder(order_id))
  }

  fn req_mkt_data(&mut self, ticker_id: i32, req: &MktDataRequest) -> Result<(), TwsDlError> {
    self.inner.lock().record(Sent::MktData { ticker_id, req: req.clone() })
  }

  fn cancel_mkt_data(&mut self, ticker_id: i32) -> Result<(), TwsDlError> {
    self.inner.lock().record(Sent::CancelMktData(ticker_id))
  }

  fn req_current_time(&mut self) -> Result<(), TwsDlError> {
    self.inner.lock().record(Sent::CurrentTime)
  }
}
