// twsdl/src/order.rs
// Order data structures

use std::fmt;
use std::str::FromStr;

use crate::contract::Contract;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
  Buy,
  Sell,
  SellShort,
}

impl fmt::Display for OrderSide {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OrderSide::Buy => write!(f, "BUY"),
      OrderSide::Sell => write!(f, "SELL"),
      OrderSide::SellShort => write!(f, "SSHORT"),
    }
  }
}

impl FromStr for OrderSide {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_uppercase().as_str() {
      "BUY" | "BOT" => Ok(OrderSide::Buy),
      "SELL" | "SLD" => Ok(OrderSide::Sell),
      "SSHORT" => Ok(OrderSide::SellShort),
      _ => Err(format!("Unknown order side: {}", s)),
    }
  }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
  Market,
  Limit,
  Stop,
  StopLimit,
  MarketIfTouched,
  LimitIfTouched,
  TrailingStop,
  TrailingStopLimit,
  PeggedToMarket,
  PeggedToMidpoint,
  MarketToLimit,
  Relative,
  LimitOnClose,
  MarketOnClose,
  Volatility,
}

const ORDER_TYPE_NAMES: &[(OrderType, &str)] = &[
  (OrderType::Market, "MKT"),
  (OrderType::Limit, "LMT"),
  (OrderType::Stop, "STP"),
  (OrderType::StopLimit, "STP LMT"),
  (OrderType::MarketIfTouched, "MIT"),
  (OrderType::LimitIfTouched, "LIT"),
  (OrderType::TrailingStop, "TRAIL"),
  (OrderType::TrailingStopLimit, "TRAIL LIMIT"),
  (OrderType::PeggedToMarket, "PEG MKT"),
  (OrderType::PeggedToMidpoint, "PEG MID"),
  (OrderType::MarketToLimit, "MTL"),
  (OrderType::Relative, "REL"),
  (OrderType::LimitOnClose, "LOC"),
  (OrderType::MarketOnClose, "MOC"),
  (OrderType::Volatility, "VOL"),
];

impl fmt::Display for OrderType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = ORDER_TYPE_NAMES.iter().find(|(t, _)| t == self).map(|(_, n)| *n).unwrap_or("NONE");
    write!(f, "{}", name)
  }
}

impl FromStr for OrderType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let upper = s.to_uppercase();
    ORDER_TYPE_NAMES.iter()
      .find(|(_, n)| *n == upper)
      .map(|(t, _)| *t)
      .ok_or_else(|| format!("Unknown order type: {}", s))
  }
}

/// Time in force for orders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
  Day,
  GoodTillCancelled,
  FillOrKill,
  ImmediateOrCancel,
  GoodTillDate,
  Opening,
}

impl fmt::Display for TimeInForce {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      TimeInForce::Day => "DAY",
      TimeInForce::GoodTillCancelled => "GTC",
      TimeInForce::FillOrKill => "FOK",
      TimeInForce::ImmediateOrCancel => "IOC",
      TimeInForce::GoodTillDate => "GTD",
      TimeInForce::Opening => "OPG",
    };
    write!(f, "{}", s)
  }
}

impl FromStr for TimeInForce {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_uppercase().as_str() {
      "" | "DAY" => Ok(TimeInForce::Day),
      "GTC" => Ok(TimeInForce::GoodTillCancelled),
      "FOK" => Ok(TimeInForce::FillOrKill),
      "IOC" => Ok(TimeInForce::ImmediateOrCancel),
      "GTD" => Ok(TimeInForce::GoodTillDate),
      "OPG" => Ok(TimeInForce::Opening),
      _ => Err(format!("Unknown time in force: {}", s)),
    }
  }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
  PendingSubmit,
  PendingCancel,
  PreSubmitted,
  Submitted,
  ApiPending,
  ApiCancelled,
  Cancelled,
  Filled,
  Inactive,
  Unknown,
}

impl OrderStatus {
  /// Statuses after which TWS has acknowledged the order one way or another.
  pub fn is_acknowledged(&self) -> bool {
    matches!(self,
             OrderStatus::Submitted | OrderStatus::PreSubmitted | OrderStatus::Filled
             | OrderStatus::Cancelled | OrderStatus::ApiCancelled | OrderStatus::Inactive)
  }
}

impl fmt::Display for OrderStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      OrderStatus::PendingSubmit => "PendingSubmit",
      OrderStatus::PendingCancel => "PendingCancel",
      OrderStatus::PreSubmitted => "PreSubmitted",
      OrderStatus::Submitted => "Submitted",
      OrderStatus::ApiPending => "ApiPending",
      OrderStatus::ApiCancelled => "ApiCancelled",
      OrderStatus::Cancelled => "Cancelled",
      OrderStatus::Filled => "Filled",
      OrderStatus::Inactive => "Inactive",
      OrderStatus::Unknown => "Unknown",
    };
    write!(f, "{}", s)
  }
}

impl From<&str> for OrderStatus {
  fn from(s: &str) -> Self {
    match s {
      "PendingSubmit" => OrderStatus::PendingSubmit,
      "PendingCancel" => OrderStatus::PendingCancel,
      "PreSubmitted" => OrderStatus::PreSubmitted,
      "Submitted" => OrderStatus::Submitted,
      "ApiPending" => OrderStatus::ApiPending,
      "ApiCancelled" => OrderStatus::ApiCancelled,
      "Cancelled" => OrderStatus::Cancelled,
      "Filled" => OrderStatus::Filled,
      "Inactive" => OrderStatus::Inactive,
      _ => OrderStatus::Unknown,
    }
  }
}

/// The order parameters sent with a place order request.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
  pub action: OrderSide,
  pub total_quantity: f64,
  pub order_type: OrderType,
  pub lmt_price: Option<f64>,
  pub aux_price: Option<f64>,
  pub tif: TimeInForce,
  pub oca_group: Option<String>,
  pub account: Option<String>,
  pub open_close: Option<String>,
  pub origin: i32,
  pub order_ref: Option<String>,
  pub transmit: bool,
  pub parent_id: i32,
  pub outside_rth: bool,
  pub hidden: bool,
  pub good_after_time: Option<String>,
  pub good_till_date: Option<String>,
  pub all_or_none: bool,
  pub min_qty: Option<i32>,
  pub percent_offset: Option<f64>,
  pub trail_stop_price: Option<f64>,
  pub trailing_percent: Option<f64>,
  pub what_if: bool,
  pub not_held: bool,
}

impl Default for Order {
  fn default() -> Self {
    Self {
      action: OrderSide::Buy,
      total_quantity: 0.0,
      order_type: OrderType::Limit,
      lmt_price: None,
      aux_price: None,
      tif: TimeInForce::Day,
      oca_group: None,
      account: None,
      open_close: None,
      origin: 0,
      order_ref: None,
      transmit: true,
      parent_id: 0,
      outside_rth: false,
      hidden: false,
      good_after_time: None,
      good_till_date: None,
      all_or_none: false,
      min_qty: None,
      percent_offset: None,
      trail_stop_price: None,
      trailing_percent: None,
      what_if: false,
      not_held: false,
    }
  }
}

/// One order status update.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatusRow {
  pub order_id: i32,
  pub status: OrderStatus,
  pub filled: f64,
  pub remaining: f64,
  pub avg_fill_price: f64,
  pub perm_id: i32,
  pub parent_id: i32,
  pub last_fill_price: f64,
  pub client_id: i32,
  pub why_held: String,
}

/// One open order as reported by TWS. Only the leading fields are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrderRow {
  pub order_id: i32,
  pub contract: Contract,
  pub action: String,
  pub total_quantity: f64,
  pub order_type: String,
  pub lmt_price: f64,
  pub aux_price: f64,
  pub tif: String,
  pub account: String,
  pub order_ref: String,
  pub client_id: i32,
  pub perm_id: i32,
}
