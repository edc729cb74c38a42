// twsdl/src/contract.rs
// Contract data structures

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecType {
  Stock,          // STK
  Option,         // OPT
  Future,         // FUT
  ContinuousFuture, // CONTFUT
  Forex,          // CASH
  Bond,           // BOND
  Cfd,            // CFD
  FutureOption,   // FOP
  Warrant,        // WAR
  IndexOption,    // IOPT
  Index,          // IND
  Fund,           // FUND
  Commodity,      // CMDTY
  Combo,          // BAG
}

impl fmt::Display for SecType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      SecType::Stock => "STK",
      SecType::Option => "OPT",
      SecType::Future => "FUT",
      SecType::ContinuousFuture => "CONTFUT",
      SecType::Forex => "CASH",
      SecType::Bond => "BOND",
      SecType::Cfd => "CFD",
      SecType::FutureOption => "FOP",
      SecType::Warrant => "WAR",
      SecType::IndexOption => "IOPT",
      SecType::Index => "IND",
      SecType::Fund => "FUND",
      SecType::Commodity => "CMDTY",
      SecType::Combo => "BAG",
    };
    write!(f, "{}", s)
  }
}

impl FromStr for SecType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "STK" => Ok(SecType::Stock),
      "OPT" => Ok(SecType::Option),
      "FUT" => Ok(SecType::Future),
      "CONTFUT" => Ok(SecType::ContinuousFuture),
      "CASH" => Ok(SecType::Forex),
      "BOND" => Ok(SecType::Bond),
      "CFD" => Ok(SecType::Cfd),
      "FOP" => Ok(SecType::FutureOption),
      "WAR" => Ok(SecType::Warrant),
      "IOPT" => Ok(SecType::IndexOption),
      "IND" => Ok(SecType::Index),
      "FUND" => Ok(SecType::Fund),
      "CMDTY" => Ok(SecType::Commodity),
      "BAG" => Ok(SecType::Combo),
      _ => Err(format!("Unknown security type: {}", s)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionRight {
  Call,
  Put,
}

impl fmt::Display for OptionRight {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OptionRight::Call => write!(f, "C"),
      OptionRight::Put => write!(f, "P"),
    }
  }
}

impl FromStr for OptionRight {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_uppercase().as_str() {
      "C" | "CALL" => Ok(OptionRight::Call),
      "P" | "PUT" => Ok(OptionRight::Put),
      _ => Err(format!("Unknown option right: {}", s)),
    }
  }
}

/// A tradable instrument. Two contracts are the same instrument iff all fields match.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
  pub con_id: i32,
  pub symbol: String,
  pub sec_type: SecType,
  pub last_trade_date_or_contract_month: Option<String>,
  pub strike: Option<f64>,
  pub right: Option<OptionRight>,
  pub multiplier: Option<String>,
  pub exchange: String,
  pub primary_exchange: Option<String>,
  pub currency: String,
  pub local_symbol: Option<String>,
  pub trading_class: Option<String>,
  pub include_expired: bool,
  pub sec_id_type: Option<String>,
  pub sec_id: Option<String>,
}

impl Default for Contract {
  fn default() -> Self {
    Contract {
      con_id: 0,
      symbol: String::new(),
      sec_type: SecType::Stock,
      last_trade_date_or_contract_month: None,
      strike: None,
      right: None,
      multiplier: None,
      exchange: String::new(),
      primary_exchange: None,
      currency: String::new(),
      local_symbol: None,
      trading_class: None,
      include_expired: false,
      sec_id_type: None,
      sec_id: None,
    }
  }
}

impl Contract {
  pub fn new() -> Self {
    Self::default()
  }

  /// Create a new stock contract with specified exchange and currency
  pub fn stock_with_exchange(symbol: &str, exchange: &str, currency: &str) -> Self {
    Contract {
      symbol: symbol.to_string(),
      sec_type: SecType::Stock,
      exchange: exchange.to_string(),
      currency: currency.to_string(),
      ..Default::default()
    }
  }

  /// Key used to guess the data farm before TWS confirms it.
  ///
  /// This is just the exchange, so different instruments on one exchange
  /// that are served by different farms get conflated. Best effort.
  pub fn lazy_key(&self) -> &str {
    &self.exchange
  }

  /// Short human readable form for logs.
  pub fn text_description(&self) -> String {
    let mut s = format!("{} {} {}", self.symbol, self.sec_type, self.exchange);
    if let Some(expiry) = &self.last_trade_date_or_contract_month {
      s.push_str(&format!(" {}", expiry));
    }
    if let (Some(strike), Some(right)) = (self.strike, self.right) {
      s.push_str(&format!(" {}{}", strike, right));
    }
    s.push_str(&format!(" {}", self.currency));
    s
  }
}

/// Contract details as returned by a contract data request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContractDetails {
  pub contract: Contract,
  pub market_name: String,
  pub min_tick: f64,
  pub order_types: String,
  pub valid_exchanges: String,
  pub price_magnifier: i32,
  pub under_con_id: i32,
  pub long_name: String,
  pub contract_month: String,
  pub industry: String,
  pub category: String,
  pub subcategory: String,
  pub time_zone_id: String,
  pub trading_hours: String,
  pub liquid_hours: String,
  pub ev_rule: String,
  pub ev_multiplier: f64,
  pub sec_id_list: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sec_type_round_trip_and_unknown() {
    assert_eq!("CASH".parse::<SecType>().unwrap(), SecType::Forex);
    assert_eq!(SecType::FutureOption.to_string(), "FOP");
    assert!("XYZ".parse::<SecType>().is_err());
  }

  #[test]
  fn test_lazy_key_is_exchange() {
    let a = Contract::stock_with_exchange("IBM", "NYSE", "USD");
    let b = Contract::stock_with_exchange("GE", "NYSE", "USD");
    assert_eq!(a.lazy_key(), b.lazy_key());
    assert_ne!(a, b);
  }
}
