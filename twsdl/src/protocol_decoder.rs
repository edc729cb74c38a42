// twsdl/src/protocol_decoder.rs
// Decoder for the incoming TWS messages the downloader consumes

use std::str::FromStr;

use log::{trace, warn};
use num_enum::TryFromPrimitive;

use crate::account::{AccountValue, Execution, PortfolioRow};
use crate::base::TwsDlError;
use crate::contract::{Contract, ContractDetails, OptionRight, SecType};
use crate::data::Bar;
use crate::event::Event;
use crate::order::{OpenOrderRow, OrderStatus, OrderStatusRow};
use crate::protocol_dec_parser::FieldParser;

/// Message tags for incoming messages
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum IncomingMessageType {
  TickPrice = 1,
  TickSize = 2,
  OrderStatus = 3,
  ErrorMessage = 4,
  OpenOrder = 5,
  AccountValue = 6,
  PortfolioValue = 7,
  AccountUpdateTime = 8,
  NextValidId = 9,
  ContractData = 10,
  ExecutionData = 11,
  HistoricalData = 17,
  CurrentTime = 49,
  ContractDataEnd = 52,
  OpenOrderEnd = 53,
  AccountDownloadEnd = 54,
  ExecutionDataEnd = 55,
  TickSnapshotEnd = 57,
}

fn opt(s: &str) -> Option<String> {
  if s.is_empty() { None } else { Some(s.to_string()) }
}

fn sec_type(s: &str) -> SecType {
  SecType::from_str(s).unwrap_or_else(|_| {
    warn!("Unknown security type '{}', assuming STK", s);
    SecType::Stock
  })
}

fn right(s: &str) -> Option<OptionRight> {
  match s {
    "" | "0" | "?" => None,
    other => OptionRight::from_str(other).ok(),
  }
}

fn strike(v: f64) -> Option<f64> {
  if v > 0.0 { Some(v) } else { None }
}

/// Decode one framed message body into the events it carries. Messages the
/// downloader has no use for yield nothing.
pub fn decode_message(body: &[u8]) -> Result<Vec<Event>, TwsDlError> {
  let mut p = FieldParser::new(body);
  let msg_id = p.read_int()?;
  let msg_type = match IncomingMessageType::try_from(msg_id) {
    Ok(t) => t,
    Err(_) => {
      trace!("Dropping incoming message type {}", msg_id);
      return Ok(Vec::new());
    }
  };
  let version = p.read_int()?;
  trace!("Decoding {:?} version {}", msg_type, version);

  let events = match msg_type {
    IncomingMessageType::TickPrice => decode_tick_price(&mut p, version)?,
    IncomingMessageType::TickSize => {
      let ticker_id = p.read_int()?;
      let field = p.read_int()?;
      let size = p.read_i64()?;
      vec![Event::TickSize { ticker_id, field, size }]
    }
    IncomingMessageType::OrderStatus => vec![Event::OrderStatus(decode_order_status(&mut p)?)],
    IncomingMessageType::ErrorMessage => {
      let id = p.read_int()?;
      let code = p.read_int()?;
      let msg = p.read_string()?;
      vec![Event::Error { id, code, msg }]
    }
    IncomingMessageType::OpenOrder => vec![Event::OpenOrder(decode_open_order(&mut p)?)],
    IncomingMessageType::AccountValue => {
      let key = p.read_string()?;
      let value = p.read_string()?;
      let currency = p.read_string()?;
      let account = p.read_string()?;
      vec![Event::AccountValue(AccountValue { key, value, currency, account })]
    }
    IncomingMessageType::PortfolioValue => vec![Event::Portfolio(decode_portfolio(&mut p)?)],
    IncomingMessageType::AccountUpdateTime => vec![Event::AccountUpdateTime(p.read_string()?)],
    IncomingMessageType::NextValidId => vec![Event::NextValidId(p.read_int()?)],
    IncomingMessageType::ContractData => {
      let (req_id, details) = decode_contract_data(&mut p)?;
      vec![Event::ContractDetails { req_id, details }]
    }
    IncomingMessageType::ExecutionData => {
      let (req_id, execution) = decode_execution(&mut p)?;
      vec![Event::Execution { req_id, execution }]
    }
    IncomingMessageType::HistoricalData => decode_historical_data(&mut p)?,
    IncomingMessageType::CurrentTime => vec![Event::CurrentTime(p.read_i64()?)],
    IncomingMessageType::ContractDataEnd => vec![Event::ContractDetailsEnd { req_id: p.read_int()? }],
    IncomingMessageType::OpenOrderEnd => vec![Event::OpenOrderEnd],
    IncomingMessageType::AccountDownloadEnd => vec![Event::AccountDownloadEnd(p.read_string()?)],
    IncomingMessageType::ExecutionDataEnd => vec![Event::ExecutionEnd { req_id: p.read_int()? }],
    IncomingMessageType::TickSnapshotEnd => vec![Event::TickSnapshotEnd { req_id: p.read_int()? }],
  };
  Ok(events)
}

/// Price ticks carry the matching size, which is delivered as its own tick.
fn decode_tick_price(p: &mut FieldParser, version: i32) -> Result<Vec<Event>, TwsDlError> {
  let ticker_id = p.read_int()?;
  let field = p.read_int()?;
  let price = p.read_double()?;
  let mut events = vec![Event::TickPrice { ticker_id, field, price }];
  if version >= 2 {
    let size = p.read_i64()?;
    let size_field = match field {
      1 => Some(0), // bid
      2 => Some(3), // ask
      4 => Some(5), // last
      _ => None,
    };
    if let Some(size_field) = size_field {
      events.push(Event::TickSize { ticker_id, field: size_field, size });
    }
  }
  Ok(events)
}

fn decode_order_status(p: &mut FieldParser) -> Result<OrderStatusRow, TwsDlError> {
  Ok(OrderStatusRow {
    order_id: p.read_int()?,
    status: OrderStatus::from(p.read_str()?),
    filled: p.read_quantity()?,
    remaining: p.read_quantity()?,
    avg_fill_price: p.read_double()?,
    perm_id: p.read_int()?,
    parent_id: p.read_int()?,
    last_fill_price: p.read_double()?,
    client_id: p.read_int()?,
    why_held: p.read_string()?,
  })
}

fn decode_open_order(p: &mut FieldParser) -> Result<OpenOrderRow, TwsDlError> {
  let order_id = p.read_int()?;
  let mut contract = Contract::new();
  contract.con_id = p.read_int()?;
  contract.symbol = p.read_string()?;
  contract.sec_type = sec_type(p.read_str()?);
  contract.last_trade_date_or_contract_month = opt(p.read_str()?);
  contract.strike = strike(p.read_double()?);
  contract.right = right(p.read_str()?);
  contract.multiplier = opt(p.read_str()?);
  contract.exchange = p.read_string()?;
  contract.currency = p.read_string()?;
  contract.local_symbol = opt(p.read_str()?);
  contract.trading_class = opt(p.read_str()?);

  let action = p.read_string()?;
  let total_quantity = p.read_quantity()?;
  let order_type = p.read_string()?;
  let lmt_price = p.read_double()?;
  let aux_price = p.read_double()?;
  let tif = p.read_string()?;
  p.skip(1)?; // oca group
  let account = p.read_string()?;
  p.skip(2)?; // open/close, origin
  let order_ref = p.read_string()?;
  let client_id = p.read_int()?;
  let perm_id = p.read_int()?;
  // The rest of the order is of no interest here.
  Ok(OpenOrderRow {
    order_id,
    contract,
    action,
    total_quantity,
    order_type,
    lmt_price,
    aux_price,
    tif,
    account,
    order_ref,
    client_id,
    perm_id,
  })
}

fn decode_portfolio(p: &mut FieldParser) -> Result<PortfolioRow, TwsDlError> {
  let mut contract = Contract::new();
  contract.con_id = p.read_int()?;
  contract.symbol = p.read_string()?;
  contract.sec_type = sec_type(p.read_str()?);
  contract.last_trade_date_or_contract_month = opt(p.read_str()?);
  contract.strike = strike(p.read_double()?);
  contract.right = right(p.read_str()?);
  contract.multiplier = opt(p.read_str()?);
  contract.primary_exchange = opt(p.read_str()?);
  contract.currency = p.read_string()?;
  contract.local_symbol = opt(p.read_str()?);
  contract.trading_class = opt(p.read_str()?);
  Ok(PortfolioRow {
    contract,
    position: p.read_quantity()?,
    market_price: p.read_double()?,
    market_value: p.read_double()?,
    average_cost: p.read_double()?,
    unrealized_pnl: p.read_double()?,
    realized_pnl: p.read_double()?,
    account: p.read_string()?,
  })
}

fn decode_contract_data(p: &mut FieldParser) -> Result<(i32, ContractDetails), TwsDlError> {
  let req_id = p.read_int()?;
  let mut d = ContractDetails::default();
  d.contract.symbol = p.read_string()?;
  d.contract.sec_type = sec_type(p.read_str()?);
  d.contract.last_trade_date_or_contract_month = opt(p.read_str()?);
  d.contract.strike = strike(p.read_double()?);
  d.contract.right = right(p.read_str()?);
  d.contract.exchange = p.read_string()?;
  d.contract.currency = p.read_string()?;
  d.contract.local_symbol = opt(p.read_str()?);
  d.market_name = p.read_string()?;
  d.contract.trading_class = opt(p.read_str()?);
  d.contract.con_id = p.read_int()?;
  d.min_tick = p.read_double()?;
  d.contract.multiplier = opt(p.read_str()?);
  d.order_types = p.read_string()?;
  d.valid_exchanges = p.read_string()?;
  d.price_magnifier = p.read_int()?;
  d.under_con_id = p.read_int()?;
  d.long_name = p.read_string()?;
  d.contract.primary_exchange = opt(p.read_str()?);
  d.contract_month = p.read_string()?;
  d.industry = p.read_string()?;
  d.category = p.read_string()?;
  d.subcategory = p.read_string()?;
  d.time_zone_id = p.read_string()?;
  d.trading_hours = p.read_string()?;
  d.liquid_hours = p.read_string()?;
  d.ev_rule = p.read_string()?;
  d.ev_multiplier = p.read_double()?;
  let n = p.read_int()?;
  for _ in 0..n.max(0) {
    let tag = p.read_string()?;
    let value = p.read_string()?;
    d.sec_id_list.push((tag, value));
  }
  Ok((req_id, d))
}

fn decode_execution(p: &mut FieldParser) -> Result<(i32, Execution), TwsDlError> {
  let req_id = p.read_int()?;
  let order_id = p.read_int()?;
  let mut contract = Contract::new();
  contract.con_id = p.read_int()?;
  contract.symbol = p.read_string()?;
  contract.sec_type = sec_type(p.read_str()?);
  contract.last_trade_date_or_contract_month = opt(p.read_str()?);
  contract.strike = strike(p.read_double()?);
  contract.right = right(p.read_str()?);
  contract.multiplier = opt(p.read_str()?);
  contract.exchange = p.read_string()?;
  contract.currency = p.read_string()?;
  contract.local_symbol = opt(p.read_str()?);
  contract.trading_class = opt(p.read_str()?);
  let execution = Execution {
    order_id,
    contract,
    exec_id: p.read_string()?,
    time: p.read_string()?,
    account: p.read_string()?,
    exchange: p.read_string()?,
    side: p.read_string()?,
    shares: p.read_quantity()?,
    price: p.read_double()?,
    perm_id: p.read_int()?,
    client_id: p.read_int()?,
    liquidation: p.read_int()?,
    cum_qty: p.read_quantity()?,
    avg_price: p.read_double()?,
    order_ref: p.read_string()?,
  };
  // ev rule and ev multiplier follow
  Ok((req_id, execution))
}

/// All bars of a historical request come in one message, followed by the
/// implied end.
fn decode_historical_data(p: &mut FieldParser) -> Result<Vec<Event>, TwsDlError> {
  let req_id = p.read_int()?;
  let start = p.read_string()?;
  let end = p.read_string()?;
  let count = p.read_int()?;
  let mut events = Vec::with_capacity(count.max(0) as usize + 1);
  for _ in 0..count.max(0) {
    let bar = Bar {
      date: p.read_string()?,
      open: p.read_double()?,
      high: p.read_double()?,
      low: p.read_double()?,
      close: p.read_double()?,
      volume: p.read_i64()?,
      wap: p.read_double()?,
      has_gaps: p.read_str()?.eq_ignore_ascii_case("true"),
      count: p.read_int()?,
    };
    events.push(Event::HistoricalBar { req_id, bar });
  }
  events.push(Event::HistoricalDataEnd { req_id, start, end });
  Ok(events)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn msg(fields: &[&str]) -> Vec<u8> {
    let mut v = Vec::new();
    for f in fields {
      v.extend_from_slice(f.as_bytes());
      v.push(0);
    }
    v
  }

  #[test]
  fn test_error_and_next_valid_id() {
    let ev = decode_message(&msg(&["4", "2", "7", "162", "Historical Market Data Service error message:HMDS query returned no data"])).unwrap();
    assert_eq!(ev, vec![Event::Error { id: 7, code: 162,
                                       msg: "Historical Market Data Service error message:HMDS query returned no data".into() }]);
    assert_eq!(decode_message(&msg(&["9", "1", "1001"])).unwrap(), vec![Event::NextValidId(1001)]);
  }

  #[test]
  fn test_historical_data_with_end() {
    let body = msg(&["17", "3", "5", "20240102 09:30:00", "20240102 16:00:00", "2",
                     "20240102 09:30:00", "10", "11", "9.5", "10.5", "1200", "10.2", "false", "33",
                     "20240102 10:30:00", "10.5", "12", "10", "11.5", "900", "11.1", "true", "20"]);
    let ev = decode_message(&body).unwrap();
    assert_eq!(ev.len(), 3);
    match &ev[1] {
      Event::HistoricalBar { req_id, bar } => {
        assert_eq!(*req_id, 5);
        assert_eq!(bar.close, 11.5);
        assert_eq!(bar.volume, 900);
        assert!(bar.has_gaps);
      }
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(ev[2], Event::HistoricalDataEnd { req_id: 5, start: "20240102 09:30:00".into(), end: "20240102 16:00:00".into() });
  }

  #[test]
  fn test_tick_price_carries_size() {
    let ev = decode_message(&msg(&["1", "6", "3", "1", "101.5", "200", "1"])).unwrap();
    assert_eq!(ev, vec![
      Event::TickPrice { ticker_id: 3, field: 1, price: 101.5 },
      Event::TickSize { ticker_id: 3, field: 0, size: 200 },
    ]);
    let ev = decode_message(&msg(&["1", "6", "3", "9", "99", "0", "0"])).unwrap();
    assert_eq!(ev.len(), 1);
  }

  #[test]
  fn test_contract_data() {
    let body = msg(&["10", "8", "4", "SAP", "STK", "", "0", "", "IBIS", "EUR", "SAP", "SAP", "XETR",
                     "14204", "0.01", "", "LMT,MKT", "IBIS,SMART", "1", "0", "SAP SE", "IBIS", "",
                     "Technology", "Software", "Enterprise", "MET", "0900-1730", "0900-1730", "", "",
                     "1", "ISIN", "DE0007164600"]);
    let ev = decode_message(&body).unwrap();
    match &ev[0] {
      Event::ContractDetails { req_id, details } => {
        assert_eq!(*req_id, 4);
        assert_eq!(details.contract.con_id, 14204);
        assert_eq!(details.contract.exchange, "IBIS");
        assert_eq!(details.long_name, "SAP SE");
        assert_eq!(details.sec_id_list, vec![("ISIN".to_string(), "DE0007164600".to_string())]);
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn test_unknown_type_dropped_and_truncated_fails() {
    assert!(decode_message(&msg(&["61", "3", "DU1"])).unwrap().is_empty());
    assert!(decode_message(&msg(&["4", "2", "7"])).is_err());
  }
}
