// twsdl/src/protocol_encoder.rs
// Encoder for the outgoing TWS messages the downloader sends

use std::io::{Cursor, Write};

use log::{debug, trace, warn};

use crate::account::ExecutionFilter;
use crate::base::TwsDlError;
use crate::contract::Contract;
use crate::order::Order;

/// Server version every layout below is written for.
pub const PROTOCOL_VERSION: i32 = 100;

/// Message tags for outgoing messages
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingMessageType {
  RequestMarketData = 1,
  CancelMarketData = 2,
  PlaceOrder = 3,
  CancelOrder = 4,
  RequestAccountData = 6,
  RequestExecutions = 7,
  RequestContractData = 9,
  RequestAllOpenOrders = 16,
  RequestHistoricalData = 20,
  RequestCurrentTime = 49,
  StartApi = 71,
}

pub struct Encoder;

impl Default for Encoder {
  fn default() -> Self {
    Self::new()
  }
}

impl Encoder {
  pub fn new() -> Self {
    Encoder
  }

  fn start_encoding(&self, msg_type: OutgoingMessageType, version: i32) -> Result<Cursor<Vec<u8>>, TwsDlError> {
    let mut cursor = Cursor::new(Vec::new());
    self.write_int_to_cursor(&mut cursor, msg_type as i32)?;
    self.write_int_to_cursor(&mut cursor, version)?;
    Ok(cursor)
  }

  fn finish_encoding(&self, cursor: Cursor<Vec<u8>>) -> Vec<u8> {
    cursor.into_inner()
  }

  fn write_str_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, s: &str) -> Result<(), TwsDlError> {
    trace!("Encoding string: {}", s);
    cursor.write_all(s.as_bytes()).map_err(|e| TwsDlError::InternalError(format!("Buffer write failed: {}", e)))?;
    cursor.write_all(&[0]).map_err(|e| TwsDlError::InternalError(format!("Buffer write failed: {}", e)))?;
    Ok(())
  }

  fn write_optional_str_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, s: Option<&str>) -> Result<(), TwsDlError> {
    self.write_str_to_cursor(cursor, s.unwrap_or(""))
  }

  fn write_int_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, val: i32) -> Result<(), TwsDlError> {
    self.write_str_to_cursor(cursor, &val.to_string())
  }

  fn write_double_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, val: f64) -> Result<(), TwsDlError> {
    if !val.is_finite() {
      warn!("Encoding non-finite double {} as unset", val);
      return self.write_str_to_cursor(cursor, "");
    }
    self.write_str_to_cursor(cursor, &val.to_string())
  }

  /// `None` and `f64::MAX` both mean "unset" and go out as an empty field.
  fn write_double_max_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, val: Option<f64>) -> Result<(), TwsDlError> {
    match val {
      Some(v) if v.is_finite() && v != f64::MAX => self.write_double_to_cursor(cursor, v),
      _ => self.write_str_to_cursor(cursor, ""),
    }
  }

  fn write_int_max_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, val: Option<i32>) -> Result<(), TwsDlError> {
    match val {
      Some(v) if v != i32::MAX => self.write_int_to_cursor(cursor, v),
      _ => self.write_str_to_cursor(cursor, ""),
    }
  }

  fn write_bool_to_cursor(&self, cursor: &mut Cursor<Vec<u8>>, val: bool) -> Result<(), TwsDlError> {
    self.write_int_to_cursor(cursor, if val { 1 } else { 0 })
  }

  /// Contract fields shared by market data, historical data and orders, up
  /// to and including the trading class.
  fn write_contract(&self, cursor: &mut Cursor<Vec<u8>>, contract: &Contract) -> Result<(), TwsDlError> {
    self.write_int_to_cursor(cursor, contract.con_id)?;
    self.write_str_to_cursor(cursor, &contract.symbol)?;
    self.write_str_to_cursor(cursor, &contract.sec_type.to_string())?;
    self.write_optional_str_to_cursor(cursor, contract.last_trade_date_or_contract_month.as_deref())?;
    self.write_double_to_cursor(cursor, contract.strike.unwrap_or(0.0))?;
    self.write_optional_str_to_cursor(cursor, contract.right.map(|r| r.to_string()).as_deref())?;
    self.write_optional_str_to_cursor(cursor, contract.multiplier.as_deref())?;
    self.write_str_to_cursor(cursor, &contract.exchange)?;
    self.write_optional_str_to_cursor(cursor, contract.primary_exchange.as_deref())?;
    self.write_str_to_cursor(cursor, &contract.currency)?;
    self.write_optional_str_to_cursor(cursor, contract.local_symbol.as_deref())?;
    self.write_optional_str_to_cursor(cursor, contract.trading_class.as_deref())?;
    Ok(())
  }

  /// START_API, sent right after the handshake.
  pub fn encode_start_api(&self, client_id: i32) -> Result<Vec<u8>, TwsDlError> {
    debug!("Encoding start api: ClientID={}", client_id);
    let mut cursor = self.start_encoding(OutgoingMessageType::StartApi, 2)?;
    self.write_int_to_cursor(&mut cursor, client_id)?;
    self.write_str_to_cursor(&mut cursor, "")?; // optional capabilities
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_historical_data(&self, req_id: i32, contract: &Contract, end_date_time: &str,
                                        duration: &str, bar_size: &str, what_to_show: &str,
                                        use_rth: bool, format_date: i32) -> Result<Vec<u8>, TwsDlError> {
    debug!("Encoding request historical data: ReqID={}, {} {} {} until '{}'",
           req_id, contract.text_description(), what_to_show, bar_size, end_date_time);
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestHistoricalData, 6)?;
    self.write_int_to_cursor(&mut cursor, req_id)?;
    self.write_contract(&mut cursor, contract)?;
    self.write_bool_to_cursor(&mut cursor, contract.include_expired)?;
    self.write_str_to_cursor(&mut cursor, end_date_time)?;
    self.write_str_to_cursor(&mut cursor, bar_size)?;
    self.write_str_to_cursor(&mut cursor, duration)?;
    self.write_bool_to_cursor(&mut cursor, use_rth)?;
    self.write_str_to_cursor(&mut cursor, what_to_show)?;
    self.write_int_to_cursor(&mut cursor, format_date)?;
    self.write_bool_to_cursor(&mut cursor, false)?; // keepUpToDate
    self.write_str_to_cursor(&mut cursor, "")?; // chart options
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_contract_data(&self, req_id: i32, contract: &Contract) -> Result<Vec<u8>, TwsDlError> {
    debug!("Encoding request contract data: ReqID={}, {}", req_id, contract.text_description());
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestContractData, 8)?;
    self.write_int_to_cursor(&mut cursor, req_id)?;
    self.write_contract(&mut cursor, contract)?;
    self.write_bool_to_cursor(&mut cursor, contract.include_expired)?;
    self.write_optional_str_to_cursor(&mut cursor, contract.sec_id_type.as_deref())?;
    self.write_optional_str_to_cursor(&mut cursor, contract.sec_id.as_deref())?;
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_account_data(&self, subscribe: bool, account_code: &str) -> Result<Vec<u8>, TwsDlError> {
    debug!("Encoding request account data: Subscribe={}, Account={}", subscribe, account_code);
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestAccountData, 2)?;
    self.write_bool_to_cursor(&mut cursor, subscribe)?;
    self.write_str_to_cursor(&mut cursor, account_code)?;
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_executions(&self, req_id: i32, filter: &ExecutionFilter) -> Result<Vec<u8>, TwsDlError> {
    debug!("Encoding request executions: ReqID={}", req_id);
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestExecutions, 3)?;
    self.write_int_to_cursor(&mut cursor, req_id)?;
    self.write_int_to_cursor(&mut cursor, filter.client_id.unwrap_or(0))?;
    self.write_optional_str_to_cursor(&mut cursor, filter.acct_code.as_deref())?;
    self.write_optional_str_to_cursor(&mut cursor, filter.time.as_deref())?;
    self.write_optional_str_to_cursor(&mut cursor, filter.symbol.as_deref())?;
    self.write_optional_str_to_cursor(&mut cursor, filter.sec_type.as_deref())?;
    self.write_optional_str_to_cursor(&mut cursor, filter.exchange.as_deref())?;
    self.write_optional_str_to_cursor(&mut cursor, filter.side.as_deref())?;
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_all_open_orders(&self) -> Result<Vec<u8>, TwsDlError> {
    debug!("Encoding request all open orders");
    let cursor = self.start_encoding(OutgoingMessageType::RequestAllOpenOrders, 1)?;
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_market_data(&self, ticker_id: i32, contract: &Contract, generic_ticks: &str,
                                    snapshot: bool) -> Result<Vec<u8>, TwsDlError> {
    debug!("Encoding request market data: TickerID={}, {} snapshot={}", ticker_id, contract.text_description(), snapshot);
    let mut cursor = self.start_encoding(OutgoingMessageType::RequestMarketData, 11)?;
    self.write_int_to_cursor(&mut cursor, ticker_id)?;
    self.write_contract(&mut cursor, contract)?;
    self.write_bool_to_cursor(&mut cursor, false)?; // delta neutral contract
    self.write_str_to_cursor(&mut cursor, generic_ticks)?;
    self.write_bool_to_cursor(&mut cursor, snapshot)?;
    self.write_str_to_cursor(&mut cursor, "")?; // market data options
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_cancel_market_data(&self, ticker_id: i32) -> Result<Vec<u8>, TwsDlError> {
    debug!("Encoding cancel market data: TickerID={}", ticker_id);
    let mut cursor = self.start_encoding(OutgoingMessageType::CancelMarketData, 1)?;
    self.write_int_to_cursor(&mut cursor, ticker_id)?;
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_cancel_order(&self, order_id: i32) -> Result<Vec<u8>, TwsDlError> {
    debug!("Encoding cancel order: OrderID={}", order_id);
    let mut cursor = self.start_encoding(OutgoingMessageType::CancelOrder, 1)?;
    self.write_int_to_cursor(&mut cursor, order_id)?;
    Ok(self.finish_encoding(cursor))
  }

  pub fn encode_request_current_time(&self) -> Result<Vec<u8>, TwsDlError> {
    debug!("Encoding request current time");
    let cursor = self.start_encoding(OutgoingMessageType::RequestCurrentTime, 1)?;
    Ok(self.finish_encoding(cursor))
  }

  /// PLACE_ORDER. Only plain single-leg orders are supported; the advanced
  /// order attributes go out unset.
  pub fn encode_place_order(&self, order_id: i32, contract: &Contract, order: &Order) -> Result<Vec<u8>, TwsDlError> {
    debug!("Encoding place order: OrderID={}, {} {} {} {}",
           order_id, order.action, order.total_quantity, order.order_type, contract.text_description());
    if order.total_quantity.fract() != 0.0 {
      return Err(TwsDlError::InvalidState(format!(
        "order {} has fractional quantity {}", order_id, order.total_quantity)));
    }
    let mut cursor = self.start_encoding(OutgoingMessageType::PlaceOrder, 45)?;
    let c = &mut cursor;
    self.write_int_to_cursor(c, order_id)?;

    self.write_contract(c, contract)?;
    self.write_optional_str_to_cursor(c, contract.sec_id_type.as_deref())?;
    self.write_optional_str_to_cursor(c, contract.sec_id.as_deref())?;

    // main order fields
    self.write_str_to_cursor(c, &order.action.to_string())?;
    self.write_str_to_cursor(c, &(order.total_quantity as i64).to_string())?;
    self.write_str_to_cursor(c, &order.order_type.to_string())?;
    self.write_double_max_to_cursor(c, order.lmt_price)?;
    self.write_double_max_to_cursor(c, order.aux_price)?;

    // extended order fields
    self.write_str_to_cursor(c, &order.tif.to_string())?;
    self.write_optional_str_to_cursor(c, order.oca_group.as_deref())?;
    self.write_optional_str_to_cursor(c, order.account.as_deref())?;
    self.write_optional_str_to_cursor(c, order.open_close.as_deref())?;
    self.write_int_to_cursor(c, order.origin)?;
    self.write_optional_str_to_cursor(c, order.order_ref.as_deref())?;
    self.write_bool_to_cursor(c, order.transmit)?;
    self.write_int_to_cursor(c, order.parent_id)?;
    self.write_bool_to_cursor(c, false)?; // block order
    self.write_bool_to_cursor(c, false)?; // sweep to fill
    self.write_int_to_cursor(c, 0)?; // display size
    self.write_int_to_cursor(c, 0)?; // trigger method
    self.write_bool_to_cursor(c, order.outside_rth)?;
    self.write_bool_to_cursor(c, order.hidden)?;

    self.write_str_to_cursor(c, "")?; // deprecated shares allocation
    self.write_double_to_cursor(c, 0.0)?; // discretionary amount
    self.write_optional_str_to_cursor(c, order.good_after_time.as_deref())?;
    self.write_optional_str_to_cursor(c, order.good_till_date.as_deref())?;

    // financial advisor allocation
    for _ in 0..4 {
      self.write_str_to_cursor(c, "")?;
    }

    self.write_int_to_cursor(c, 0)?; // short sale slot
    self.write_str_to_cursor(c, "")?; // designated location
    self.write_int_to_cursor(c, -1)?; // exempt code

    self.write_int_to_cursor(c, 0)?; // oca type
    self.write_str_to_cursor(c, "")?; // rule 80A
    self.write_str_to_cursor(c, "")?; // settling firm
    self.write_bool_to_cursor(c, order.all_or_none)?;
    self.write_int_max_to_cursor(c, order.min_qty)?;
    self.write_double_max_to_cursor(c, order.percent_offset)?;
    self.write_bool_to_cursor(c, false)?; // e-trade only
    self.write_bool_to_cursor(c, false)?; // firm quote only
    self.write_double_max_to_cursor(c, None)?; // nbbo price cap
    self.write_int_to_cursor(c, 0)?; // auction strategy
    self.write_double_max_to_cursor(c, None)?; // starting price
    self.write_double_max_to_cursor(c, None)?; // stock ref price
    self.write_double_max_to_cursor(c, None)?; // delta
    self.write_double_max_to_cursor(c, None)?; // stock range lower
    self.write_double_max_to_cursor(c, None)?; // stock range upper
    self.write_bool_to_cursor(c, false)?; // override percentage constraints

    // volatility orders
    self.write_double_max_to_cursor(c, None)?;
    self.write_int_max_to_cursor(c, None)?;
    self.write_str_to_cursor(c, "")?; // delta neutral order type
    self.write_double_max_to_cursor(c, None)?;
    self.write_bool_to_cursor(c, false)?; // continuous update
    self.write_int_max_to_cursor(c, None)?; // reference price type

    self.write_double_max_to_cursor(c, order.trail_stop_price)?;
    self.write_double_max_to_cursor(c, order.trailing_percent)?;

    // scale orders
    self.write_int_max_to_cursor(c, None)?;
    self.write_int_max_to_cursor(c, None)?;
    self.write_double_max_to_cursor(c, None)?;
    self.write_str_to_cursor(c, "")?; // scale table
    self.write_str_to_cursor(c, "")?; // active start time
    self.write_str_to_cursor(c, "")?; // active stop time

    self.write_str_to_cursor(c, "")?; // hedge type
    self.write_bool_to_cursor(c, false)?; // opt out smart routing
    self.write_str_to_cursor(c, "")?; // clearing account
    self.write_str_to_cursor(c, "")?; // clearing intent
    self.write_bool_to_cursor(c, order.not_held)?;
    self.write_bool_to_cursor(c, false)?; // delta neutral contract
    self.write_str_to_cursor(c, "")?; // algo strategy
    self.write_str_to_cursor(c, "")?; // algo id
    self.write_bool_to_cursor(c, order.what_if)?;
    self.write_str_to_cursor(c, "")?; // order misc options
    self.write_bool_to_cursor(c, false)?; // solicited
    self.write_bool_to_cursor(c, false)?; // randomize size
    self.write_bool_to_cursor(c, false)?; // randomize price

    Ok(self.finish_encoding(cursor))
  }
}
