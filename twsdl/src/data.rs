// twsdl/src/data.rs
// Market data rows collected by historical and streaming requests

use num_enum::TryFromPrimitive;
use std::fmt;

/// One historical bar. `date` is passed through as TWS formats it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bar {
  pub date: String,
  pub open: f64,
  pub high: f64,
  pub low: f64,
  pub close: f64,
  pub volume: i64,
  pub wap: f64,
  pub has_gaps: bool,
  pub count: i32,
}

/// Tick types that show up on snapshot and streaming market data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(i32)]
pub enum TickType {
  BidSize = 0,
  BidPrice = 1,
  AskPrice = 2,
  AskSize = 3,
  LastPrice = 4,
  LastSize = 5,
  High = 6,
  Low = 7,
  Volume = 8,
  ClosePrice = 9,
  OpenTick = 14,
  Low13Weeks = 15,
  High13Weeks = 16,
  Low26Weeks = 17,
  High26Weeks = 18,
  Low52Weeks = 19,
  High52Weeks = 20,
  AverageVolume = 21,
  OptionHistoricalVolatility = 23,
  OptionImpliedVolatility = 24,
  OptionCallOpenInterest = 27,
  OptionPutOpenInterest = 28,
  OptionCallVolume = 29,
  OptionPutVolume = 30,
  IndexFuturePremium = 31,
  BidExchange = 32,
  AskExchange = 33,
  AuctionVolume = 34,
  AuctionPrice = 35,
  AuctionImbalance = 36,
  MarkPrice = 37,
  LastTimestamp = 45,
  Shortable = 46,
  RtVolume = 48,
  Halted = 49,
  TradeCount = 54,
  TradeRate = 55,
  VolumeRate = 56,
  LastRthTrade = 57,
  Unknown = -1,
}

impl TickType {
  pub fn from_i32(v: i32) -> Self {
    TickType::try_from(v).unwrap_or(TickType::Unknown)
  }
}

impl fmt::Display for TickType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}", self)
  }
}

/// Value carried by a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickValue {
  Price(f64),
  Size(i64),
}

/// One tick received on a market data line.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
  /// Raw tick type id as sent by TWS
  pub field: i32,
  pub value: TickValue,
}

impl Tick {
  pub fn kind(&self) -> TickType {
    TickType::from_i32(self.field)
  }
}
