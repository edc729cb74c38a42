// twsdl/src/account.rs
// Account, portfolio and execution records plus the last-known account snapshot

use std::collections::HashMap;

use log::trace;

use crate::contract::Contract;
use crate::order::{OpenOrderRow, OrderStatusRow};

/// Filter criteria for requesting executions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionFilter {
  /// Filter by the API client which placed the order. 0 means all clients.
  pub client_id: Option<i32>,
  /// Filter by the account code. Empty string means all accounts accessible by this user.
  pub acct_code: Option<String>,
  /// Filter by time. Format: "YYYYMMDD HH:MM:SS". Note the single space.
  pub time: Option<String>,
  pub symbol: Option<String>,
  pub sec_type: Option<String>,
  pub exchange: Option<String>,
  /// "BUY" or "SELL"
  pub side: Option<String>,
}

/// One execution report.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
  pub order_id: i32,
  pub contract: Contract,
  pub exec_id: String,
  pub time: String,
  pub account: String,
  pub exchange: String,
  pub side: String,
  pub shares: f64,
  pub price: f64,
  pub perm_id: i32,
  pub client_id: i32,
  pub liquidation: i32,
  pub cum_qty: f64,
  pub avg_price: f64,
  pub order_ref: String,
}

/// One account value update (key/value/currency/account).
#[derive(Debug, Clone, PartialEq)]
pub struct AccountValue {
  pub key: String,
  pub value: String,
  pub currency: String,
  pub account: String,
}

/// One portfolio position update.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioRow {
  pub contract: Contract,
  pub position: f64,
  pub market_price: f64,
  pub market_value: f64,
  pub average_cost: f64,
  pub unrealized_pnl: f64,
  pub realized_pnl: f64,
  pub account: String,
}

/// Latest known state of the account. Every update overwrites the previous
/// row with the same key, nothing is kept as history.
#[derive(Debug, Default)]
pub struct Account {
  values: HashMap<(String, String, String), AccountValue>,
  portfolio: HashMap<i32, PortfolioRow>,
  open_orders: HashMap<i32, OpenOrderRow>,
  order_status: HashMap<i32, OrderStatusRow>,
  update_time: Option<String>,
}

impl Account {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn update_value(&mut self, v: AccountValue) {
    trace!("account value {}={} {}", v.key, v.value, v.currency);
    self.values.insert((v.key.clone(), v.currency.clone(), v.account.clone()), v);
  }

  pub fn update_portfolio(&mut self, row: PortfolioRow) {
    self.portfolio.insert(row.contract.con_id, row);
  }

  pub fn update_open_order(&mut self, row: OpenOrderRow) {
    self.open_orders.insert(row.perm_id, row);
  }

  pub fn update_order_status(&mut self, row: OrderStatusRow) {
    self.order_status.insert(row.perm_id, row);
  }

  pub fn set_update_time(&mut self, t: String) {
    self.update_time = Some(t);
  }

  pub fn value(&self, key: &str, currency: &str, account: &str) -> Option<&AccountValue> {
    self.values.get(&(key.to_string(), currency.to_string(), account.to_string()))
  }

  pub fn portfolio(&self, con_id: i32) -> Option<&PortfolioRow> {
    self.portfolio.get(&con_id)
  }

  pub fn open_order(&self, perm_id: i32) -> Option<&OpenOrderRow> {
    self.open_orders.get(&perm_id)
  }

  pub fn order_status(&self, perm_id: i32) -> Option<&OrderStatusRow> {
    self.order_status.get(&perm_id)
  }

  pub fn update_time(&self) -> Option<&str> {
    self.update_time.as_deref()
  }

  pub fn portfolio_len(&self) -> usize {
    self.portfolio.len()
  }

  pub fn open_orders_len(&self) -> usize {
    self.open_orders.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::order::OrderStatus;

  fn position(con_id: i32, qty: f64) -> PortfolioRow {
    let mut contract = Contract::stock_with_exchange("IBM", "NYSE", "USD");
    contract.con_id = con_id;
    PortfolioRow {
      contract,
      position: qty,
      market_price: 1.0,
      market_value: qty,
      average_cost: 1.0,
      unrealized_pnl: 0.0,
      realized_pnl: 0.0,
      account: "DU1".to_string(),
    }
  }

  #[test]
  fn test_last_write_wins() {
    let mut acct = Account::new();
    acct.update_portfolio(position(8314, 10.0));
    acct.update_portfolio(position(8314, 25.0));
    acct.update_portfolio(position(4391, 1.0));
    assert_eq!(acct.portfolio_len(), 2);
    assert_eq!(acct.portfolio(8314).unwrap().position, 25.0);

    let status = |filled: f64| OrderStatusRow {
      order_id: 3,
      status: OrderStatus::Submitted,
      filled,
      remaining: 10.0 - filled,
      avg_fill_price: 0.0,
      perm_id: 77,
      parent_id: 0,
      last_fill_price: 0.0,
      client_id: 1,
      why_held: String::new(),
    };
    acct.update_order_status(status(0.0));
    acct.update_order_status(status(4.0));
    assert_eq!(acct.order_status(77).unwrap().filled, 4.0);

    acct.update_value(AccountValue {
      key: "NetLiquidation".into(), value: "1".into(), currency: "USD".into(), account: "DU1".into(),
    });
    acct.update_value(AccountValue {
      key: "NetLiquidation".into(), value: "2".into(), currency: "USD".into(), account: "DU1".into(),
    });
    assert_eq!(acct.value("NetLiquidation", "USD", "DU1").unwrap().value, "2");
  }
}
