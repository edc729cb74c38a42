// twsdl/src/data_farm.rs
//! Tracks the connection state of TWS data farms and learns which historical
//! data farm (HMDS) serves which instrument.
//!
//! TWS never says which farm answers a request. It only emits notices such as
//! code 2106 "HMDS data farm connection is OK:euhmds". The farm of a contract
//! is inferred from which farms are up when its data arrives.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::{debug, info, warn};
use once_cell::sync::Lazy;

use crate::contract::Contract;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarmState {
  Ok,
  Inactive,
  Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FarmKind {
  /// Live market data
  Market,
  /// Historical market data service
  Hmds,
}

struct FarmNotice {
  code: i32,
  kind: FarmKind,
  state: FarmState,
  prefix: &'static str,
}

const FARM_NOTICES: &[FarmNotice] = &[
  FarmNotice { code: 2103, kind: FarmKind::Market, state: FarmState::Broken,
               prefix: "Market data farm connection is broken:" },
  FarmNotice { code: 2104, kind: FarmKind::Market, state: FarmState::Ok,
               prefix: "Market data farm connection is OK:" },
  FarmNotice { code: 2108, kind: FarmKind::Market, state: FarmState::Inactive,
               prefix: "Market data farm connection is inactive but should be available upon demand." },
  FarmNotice { code: 2105, kind: FarmKind::Hmds, state: FarmState::Broken,
               prefix: "HMDS data farm connection is broken:" },
  FarmNotice { code: 2106, kind: FarmKind::Hmds, state: FarmState::Ok,
               prefix: "HMDS data farm connection is OK:" },
  FarmNotice { code: 2107, kind: FarmKind::Hmds, state: FarmState::Inactive,
               prefix: "HMDS data farm connection is inactive but should be available upon demand." },
];

/// Farm names used by the paper trading demo servers.
const DEMO_FARMS: &[&str] = &["demofarm", "demohmds"];

/// Exchange to HMDS farm assignments known up front.
static SEED_HMDS_FARMS: Lazy<HashMap<String, String>> = Lazy::new(|| {
  let mut m = HashMap::new();
  let groups: &[(&str, &[&str])] = &[
    ("ushmds", &["NYSE", "NASDAQ", "ISLAND", "ARCA", "AMEX", "BATS", "PINK", "CBOE",
                 "GLOBEX", "NYMEX", "ECBOT", "CBOT", "CFE", "NYBOT", "ONE"]),
    ("euhmds", &["IBIS", "FWB", "LSE", "SWB", "EBS", "VIRTX", "SBF", "AEB", "BVME",
                 "DTB", "EUREX", "SOFFEX", "MONEP", "LIFFE", "IDEM", "MATIF", "MEFFRV"]),
    ("hkhmds", &["SEHK", "HKFE", "SGX", "ASX", "TSEJ", "OSE.JPN", "KSE", "NSE"]),
    ("cashhmds", &["IDEALPRO", "IDEAL"]),
  ];
  for (farm, exchanges) in groups {
    for ex in exchanges.iter() {
      m.insert(ex.to_string(), farm.to_string());
    }
  }
  m
});

/// Is `code` one of the farm connectivity notices?
pub fn is_farm_notice(code: i32) -> bool {
  FARM_NOTICES.iter().any(|n| n.code == code)
}

#[derive(Debug)]
pub struct DataFarmStates {
  m_states: BTreeMap<String, FarmState>,
  h_states: BTreeMap<String, FarmState>,
  h_learn: HashMap<String, String>,
  last_msg_seq: Option<u64>,
  last_changed: Option<(FarmKind, String)>,
  learned_since_change: HashSet<String>,
  first_farm_seen: bool,
}

impl Default for DataFarmStates {
  fn default() -> Self {
    Self::new()
  }
}

impl DataFarmStates {
  pub fn new() -> Self {
    Self {
      m_states: BTreeMap::new(),
      h_states: BTreeMap::new(),
      h_learn: SEED_HMDS_FARMS.clone(),
      last_msg_seq: None,
      last_changed: None,
      learned_since_change: HashSet::new(),
      first_farm_seen: false,
    }
  }

  /// Start with no seeded assignments.
  pub fn without_seed() -> Self {
    Self { h_learn: HashMap::new(), ..Self::new() }
  }

  /// Feed a farm notice. Returns false if the code or text is not understood.
  pub fn notify(&mut self, seq: u64, code: i32, msg: &str) -> bool {
    let notice = match FARM_NOTICES.iter().find(|n| n.code == code) {
      Some(n) => n,
      None => {
        warn!("Not a farm notice: code {} '{}'", code, msg);
        return false;
      }
    };
    let farm = match msg.strip_prefix(notice.prefix) {
      Some(f) if !f.trim().is_empty() => f.trim().to_string(),
      _ => {
        warn!("Cannot parse farm name from code {} '{}'", code, msg);
        return false;
      }
    };

    if !self.first_farm_seen {
      self.first_farm_seen = true;
      if DEMO_FARMS.contains(&farm.as_str()) {
        info!("First farm '{}' is a demo farm, dropping seeded farm assignments", farm);
        self.h_learn.clear();
      }
    }

    let states = match notice.kind {
      FarmKind::Market => &mut self.m_states,
      FarmKind::Hmds => &mut self.h_states,
    };
    debug!("farm {:?} '{}' -> {:?}", notice.kind, farm, notice.state);
    states.insert(farm.clone(), notice.state);

    self.last_msg_seq = Some(seq);
    self.last_changed = Some((notice.kind, farm));
    self.learned_since_change.clear();
    true
  }

  /// Called when historical data arrived for `c`: bind its lazy key to the
  /// only HMDS farm that is up.
  pub fn learn_hmds(&mut self, c: &Contract) {
    let key = c.lazy_key().to_string();
    if !self.learned_since_change.insert(key.clone()) {
      return;
    }

    let actives = self.get_actives();
    match actives.len() {
      0 => {
        warn!("Got data for '{}' but no HMDS farm is OK", key);
      }
      1 => {
        let farm = &actives[0];
        match self.h_learn.get(&key).cloned() {
          Some(known) if &known == farm => {}
          Some(known) => {
            info!("Relearned HMDS farm for '{}': {} -> {}", key, known, farm);
            self.h_learn.insert(key, farm.clone());
          }
          None => {
            info!("Learned HMDS farm for '{}': {}", key, farm);
            self.h_learn.insert(key, farm.clone());
          }
        }
      }
      _ => match self.h_learn.get(&key) {
        Some(known) if actives.contains(known) => {
          debug!("HMDS farm for '{}' confirmed: {}", key, known);
        }
        Some(known) => {
          debug!("Learned HMDS farm '{}' for '{}' is not OK, ambiguous now", known, key);
        }
        None => {
          debug!("Cannot learn HMDS farm for '{}', {} farms OK", key, actives.len());
        }
      },
    }
  }

  /// If the notice right before `seq` was "HMDS farm X is OK" then the
  /// response with sequence `seq` came from X.
  pub fn learn_hmds_last_ok(&mut self, seq: u64, c: &Contract) {
    let last_seq = match self.last_msg_seq {
      Some(s) => s,
      None => return,
    };
    if seq != last_seq + 1 {
      return;
    }
    let farm = match &self.last_changed {
      Some((FarmKind::Hmds, f)) if self.h_states.get(f) == Some(&FarmState::Ok) => f.clone(),
      _ => return,
    };
    let key = c.lazy_key().to_string();
    if let Some(known) = self.h_learn.get(&key) {
      if known != &farm && self.h_states.get(known) == Some(&FarmState::Ok) {
        debug!("'{}' stays on OK farm {} (not {})", key, known, farm);
        return;
      }
    }
    if self.h_learn.get(&key) != Some(&farm) {
      info!("Learned HMDS farm for '{}' from last OK notice: {}", key, farm);
      self.h_learn.insert(key, farm);
    }
  }

  /// Forget every connection state, e.g. after losing the TWS connection.
  pub fn set_all_broken(&mut self) {
    for s in self.m_states.values_mut().chain(self.h_states.values_mut()) {
      *s = FarmState::Broken;
    }
    self.learned_since_change.clear();
  }

  /// HMDS farms reported inactive.
  pub fn get_inactives(&self) -> Vec<String> {
    self.hmds_in(FarmState::Inactive)
  }

  /// HMDS farms reported OK.
  pub fn get_actives(&self) -> Vec<String> {
    self.hmds_in(FarmState::Ok)
  }

  fn hmds_in(&self, state: FarmState) -> Vec<String> {
    self.h_states.iter().filter(|(_, s)| **s == state).map(|(f, _)| f.clone()).collect()
  }

  /// The learned HMDS farm of `c`, if any.
  pub fn get_hmds_farm(&self, c: &Contract) -> Option<&str> {
    self.h_learn.get(c.lazy_key()).map(|s| s.as_str())
  }

  pub fn hmds_state(&self, farm: &str) -> Option<FarmState> {
    self.h_states.get(farm).copied()
  }

  pub fn market_state(&self, farm: &str) -> Option<FarmState> {
    self.m_states.get(farm).copied()
  }

  pub fn all_states(&self) -> impl Iterator<Item = (FarmKind, &str, FarmState)> {
    self.m_states.iter().map(|(f, s)| (FarmKind::Market, f.as_str(), *s))
      .chain(self.h_states.iter().map(|(f, s)| (FarmKind::Hmds, f.as_str(), *s)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn hmds_ok(farm: &str) -> String {
    format!("HMDS data farm connection is OK:{}", farm)
  }

  fn on(exchange: &str) -> Contract {
    Contract::stock_with_exchange("X", exchange, "USD")
  }

  #[test]
  fn test_notify_parses_farm_names() {
    let mut dfs = DataFarmStates::without_seed();
    assert!(dfs.notify(1, 2104, "Market data farm connection is OK:usfarm"));
    assert!(dfs.notify(2, 2107, "HMDS data farm connection is inactive but should be available upon demand.euhmds"));
    assert!(dfs.notify(3, 2106, &hmds_ok("ushmds")));
    assert_eq!(dfs.market_state("usfarm"), Some(FarmState::Ok));
    assert_eq!(dfs.get_inactives(), vec!["euhmds".to_string()]);
    assert_eq!(dfs.get_actives(), vec!["ushmds".to_string()]);
    assert!(!dfs.notify(4, 2106, "something else"));
    assert!(!dfs.notify(5, 2158, "Sec-def data farm connection is OK:secdefnj"));
  }

  #[test]
  fn test_learn_single_ok_farm_binds() {
    let mut dfs = DataFarmStates::without_seed();
    dfs.notify(1, 2106, &hmds_ok("ushmds"));
    dfs.learn_hmds(&on("XETRA"));
    assert_eq!(dfs.get_hmds_farm(&on("XETRA")), Some("ushmds"));
  }

  #[test]
  fn test_learn_two_ok_farms_stays_unbound() {
    let mut dfs = DataFarmStates::without_seed();
    dfs.notify(1, 2106, &hmds_ok("ushmds"));
    dfs.notify(2, 2106, &hmds_ok("euhmds"));
    dfs.learn_hmds(&on("XETRA"));
    assert_eq!(dfs.get_hmds_farm(&on("XETRA")), None);
  }

  #[test]
  fn test_learn_no_ok_farm_is_noop() {
    let mut dfs = DataFarmStates::without_seed();
    dfs.notify(1, 2105, "HMDS data farm connection is broken:ushmds");
    dfs.learn_hmds(&on("XETRA"));
    assert_eq!(dfs.get_hmds_farm(&on("XETRA")), None);
  }

  #[test]
  fn test_learn_dedup_until_next_change() {
    let mut dfs = DataFarmStates::without_seed();
    dfs.notify(1, 2106, &hmds_ok("ushmds"));
    dfs.notify(2, 2106, &hmds_ok("euhmds"));
    dfs.learn_hmds(&on("XETRA"));
    // ushmds goes down; the next call must not be swallowed by the dedup set.
    dfs.notify(3, 2105, "HMDS data farm connection is broken:ushmds");
    dfs.learn_hmds(&on("XETRA"));
    assert_eq!(dfs.get_hmds_farm(&on("XETRA")), Some("euhmds"));
  }

  #[test]
  fn test_learn_last_ok() {
    let mut dfs = DataFarmStates::without_seed();
    dfs.notify(1, 2106, &hmds_ok("ushmds"));
    dfs.notify(7, 2106, &hmds_ok("euhmds"));
    dfs.learn_hmds_last_ok(9, &on("XETRA"));
    assert_eq!(dfs.get_hmds_farm(&on("XETRA")), None);
    dfs.learn_hmds_last_ok(8, &on("XETRA"));
    assert_eq!(dfs.get_hmds_farm(&on("XETRA")), Some("euhmds"));
  }

  #[test]
  fn test_learn_last_ok_keeps_other_ok_binding() {
    let mut dfs = DataFarmStates::without_seed();
    dfs.notify(1, 2106, &hmds_ok("ushmds"));
    dfs.learn_hmds(&on("NYSE"));
    dfs.notify(2, 2106, &hmds_ok("euhmds"));
    dfs.learn_hmds_last_ok(3, &on("NYSE"));
    assert_eq!(dfs.get_hmds_farm(&on("NYSE")), Some("ushmds"));
  }

  #[test]
  fn test_set_all_broken() {
    let mut dfs = DataFarmStates::new();
    dfs.notify(1, 2104, "Market data farm connection is OK:usfarm");
    dfs.notify(2, 2106, &hmds_ok("ushmds"));
    dfs.set_all_broken();
    assert!(dfs.all_states().all(|(_, _, s)| s == FarmState::Broken));
    assert!(dfs.get_actives().is_empty());
  }

  #[test]
  fn test_seed_and_demo_correction() {
    let dfs = DataFarmStates::new();
    assert_eq!(dfs.get_hmds_farm(&on("IBIS")), Some("euhmds"));

    let mut demo = DataFarmStates::new();
    demo.notify(1, 2104, "Market data farm connection is OK:demofarm");
    assert_eq!(demo.get_hmds_farm(&on("IBIS")), None);

    let mut live = DataFarmStates::new();
    live.notify(1, 2104, "Market data farm connection is OK:usfarm");
    live.notify(2, 2104, "Market data farm connection is OK:demofarm");
    assert_eq!(live.get_hmds_farm(&on("IBIS")), Some("euhmds"));
  }
}
