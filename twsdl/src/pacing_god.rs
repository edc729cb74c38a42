// twsdl/src/pacing_god.rs
//! Pacing keyed by contract.
//!
//! TWS paces historical requests per HMDS farm and also globally. Every
//! request is recorded in a global bucket plus either the bucket of its farm
//! or, while the farm is unknown, a "lazy" bucket keyed by the contract's
//! lazy key. Once the farm is learned the lazy bucket is folded into the farm
//! bucket.
//!
//! As long as any lazy bucket still has history, waits are computed from the
//! global bucket: an unresolved contract may share a farm with the one asked
//! about, so a per-farm answer could overrun the real quota.

use std::collections::HashMap;

use log::{debug, trace};

use crate::contract::Contract;
use crate::data_farm::DataFarmStates;
use crate::pacing::{PacingConfig, PacingControl};

/// Which bucket a contract is currently routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
  Farm(String),
  Lazy(String),
}

#[derive(Debug)]
pub struct PacingGod {
  cfg: PacingConfig,
  global: PacingControl,
  hmds: HashMap<String, PacingControl>,
  lazy: HashMap<String, PacingControl>,
}

impl PacingGod {
  pub fn new(cfg: PacingConfig) -> Self {
    Self {
      global: PacingControl::new(cfg.clone()),
      cfg,
      hmds: HashMap::new(),
      lazy: HashMap::new(),
    }
  }

  pub fn config(&self) -> &PacingConfig {
    &self.cfg
  }

  /// Change tunables of every bucket, existing and future.
  pub fn set_pacing_config(&mut self, cfg: PacingConfig) {
    self.global.set_config(cfg.clone());
    for pc in self.hmds.values_mut().chain(self.lazy.values_mut()) {
      pc.set_config(cfg.clone());
    }
    self.cfg = cfg;
  }

  pub fn set_violation_pause(&mut self, ms: i64) {
    let mut cfg = self.cfg.clone();
    cfg.violation_pause = ms;
    self.set_pacing_config(cfg);
  }

  pub fn add_request(&mut self, c: &Contract, farms: &DataFarmStates, now: i64) {
    let route = self.check_add(c, farms);
    self.global.add_request(now);
    self.bucket_mut(&route).add_request(now);
  }

  pub fn notify_violation(&mut self, c: &Contract, farms: &DataFarmStates, now: i64) {
    let route = self.check_add(c, farms);
    self.global.notify_violation(now);
    self.bucket_mut(&route).notify_violation(now);
  }

  pub fn good_time(&mut self, c: &Contract, farms: &DataFarmStates, now: i64) -> i64 {
    let route = self.check_add(c, farms);
    match route {
      Route::Farm(ref farm) if self.lazies_are_cleared() => {
        let t = self.hmds[farm].good_time(now);
        trace!("good_time {} via farm {}: {}", c.lazy_key(), farm, t);
        t
      }
      _ => {
        let t = self.global.good_time(now);
        trace!("good_time {} via global: {}", c.lazy_key(), t);
        t
      }
    }
  }

  pub fn count_left(&mut self, c: &Contract, farms: &DataFarmStates, now: i64) -> usize {
    let route = self.check_add(c, farms);
    match route {
      Route::Farm(ref farm) if self.lazies_are_cleared() => self.hmds[farm].count_left(now),
      _ => self.global.count_left(now),
    }
  }

  /// Drop history of buckets whose farms are no longer connected. Without
  /// any active farm everything is cleared.
  pub fn clear(&mut self, farms: &DataFarmStates, now: i64) {
    if farms.get_actives().is_empty() {
      debug!("clearing all pacing buckets");
      self.global.clear(now);
      for pc in self.hmds.values_mut().chain(self.lazy.values_mut()) {
        pc.clear(now);
      }
    } else {
      for farm in farms.get_inactives() {
        if let Some(pc) = self.hmds.get_mut(&farm) {
          debug!("clearing pacing bucket of inactive farm {}", farm);
          pc.clear(now);
        }
      }
    }
  }

  /// True if no lazy bucket holds any history.
  pub fn lazies_are_cleared(&self) -> bool {
    self.lazy.values().all(|pc| pc.is_empty())
  }

  fn bucket_mut(&mut self, route: &Route) -> &mut PacingControl {
    let cfg = &self.cfg;
    match route {
      Route::Farm(f) => self.hmds.entry(f.clone()).or_insert_with(|| PacingControl::new(cfg.clone())),
      Route::Lazy(k) => self.lazy.entry(k.clone()).or_insert_with(|| PacingControl::new(cfg.clone())),
    }
  }

  /// Make sure `c` has a bucket, moving lazy history to the farm bucket once
  /// the farm is known.
  fn check_add(&mut self, c: &Contract, farms: &DataFarmStates) -> Route {
    let lazy_key = c.lazy_key().to_string();
    let farm = match farms.get_hmds_farm(c) {
      Some(f) => f.to_string(),
      None => {
        if !self.lazy.contains_key(&lazy_key) {
          self.lazy.insert(lazy_key.clone(), PacingControl::new(self.cfg.clone()));
        }
        return Route::Lazy(lazy_key);
      }
    };

    if !self.hmds.contains_key(&farm) {
      let pc = match self.lazy.remove(&lazy_key) {
        Some(pc) => {
          debug!("promoting lazy pacing bucket '{}' to farm {}", lazy_key, farm);
          pc
        }
        None => PacingControl::new(self.cfg.clone()),
      };
      self.hmds.insert(farm.clone(), pc);
    }
    if let Some(pc) = self.lazy.remove(&lazy_key) {
      debug!("merging lazy pacing bucket '{}' into farm {}", lazy_key, farm);
      if let Some(target) = self.hmds.get_mut(&farm) {
        target.merge(&pc);
      }
    }
    Route::Farm(farm)
  }

  #[cfg(test)]
  fn global(&self) -> &PacingControl {
    &self.global
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cfg() -> PacingConfig {
    PacingConfig { max_requests: 2, check_interval: 10_000, min_pacing_time: 100, violation_pause: 3_000 }
  }

  fn on(exchange: &str) -> Contract {
    Contract::stock_with_exchange("X", exchange, "USD")
  }

  /// Farm states with the given exchange bindings learned and every farm broken.
  fn farms_with(learn: &[(&str, &str)]) -> DataFarmStates {
    let mut dfs = DataFarmStates::without_seed();
    for (exchange, farm) in learn {
      dfs.notify(0, 2106, &format!("HMDS data farm connection is OK:{}", farm));
      dfs.learn_hmds(&on(exchange));
      dfs.notify(0, 2105, &format!("HMDS data farm connection is broken:{}", farm));
    }
    dfs
  }

  #[test]
  fn test_unknown_farm_uses_global() {
    let dfs = farms_with(&[("NYSE", "ushmds")]);
    let mut god = PacingGod::new(cfg());
    // Known farm, two requests there.
    god.add_request(&on("NYSE"), &dfs, 0);
    god.add_request(&on("NYSE"), &dfs, 200);
    // Unknown farm, one request: lazy bucket now has history.
    god.add_request(&on("XETRA"), &dfs, 400);
    assert!(!god.lazies_are_cleared());
    for now in [400, 500, 1_000, 9_000, 12_000] {
      let g = god.global().good_time(now);
      assert_eq!(god.good_time(&on("NYSE"), &dfs, now), g);
      assert_eq!(god.good_time(&on("XETRA"), &dfs, now), g);
      assert_eq!(god.count_left(&on("NYSE"), &dfs, now), god.global().count_left(now));
    }
  }

  #[test]
  fn test_resolved_farms_use_own_bucket() {
    let dfs = farms_with(&[("NYSE", "ushmds"), ("IBIS", "euhmds")]);
    let mut god = PacingGod::new(cfg());
    god.add_request(&on("NYSE"), &dfs, 0);
    god.add_request(&on("NYSE"), &dfs, 200);
    // ushmds is exhausted, euhmds is not.
    assert!(god.good_time(&on("NYSE"), &dfs, 1_000) > 0);
    assert!(god.good_time(&on("IBIS"), &dfs, 1_000) <= 0);
    assert_eq!(god.count_left(&on("IBIS"), &dfs, 1_000), 2);
    assert_eq!(god.count_left(&on("NYSE"), &dfs, 1_000), 0);
  }

  #[test]
  fn test_lazy_bucket_promoted_on_learn() {
    let mut dfs = DataFarmStates::without_seed();
    let mut god = PacingGod::new(cfg());
    god.add_request(&on("XETRA"), &dfs, 0);
    god.add_request(&on("XETRA"), &dfs, 200);
    assert!(!god.lazies_are_cleared());

    dfs.notify(1, 2106, "HMDS data farm connection is OK:euhmds");
    dfs.learn_hmds(&on("XETRA"));
    // Farm now known: history moves over and the farm bucket is exhausted.
    assert_eq!(god.count_left(&on("XETRA"), &dfs, 1_000), 0);
    assert!(god.lazies_are_cleared());
    assert_eq!(god.hmds["euhmds"].len(), 2);
  }

  #[test]
  fn test_lazy_bucket_merged_into_existing_farm() {
    let mut dfs = farms_with(&[("IBIS", "euhmds")]);
    let mut god = PacingGod::new(cfg());
    god.add_request(&on("IBIS"), &dfs, 0);
    god.add_request(&on("XETRA"), &dfs, 100);
    dfs.notify(1, 2106, "HMDS data farm connection is OK:euhmds");
    dfs.learn_hmds(&on("XETRA"));
    god.good_time(&on("XETRA"), &dfs, 200);
    assert_eq!(god.hmds["euhmds"].len(), 2);
    assert!(god.lazy.is_empty());
  }

  #[test]
  fn test_violation_hits_global_and_farm() {
    let dfs = farms_with(&[("NYSE", "ushmds")]);
    let mut god = PacingGod::new(cfg());
    god.add_request(&on("NYSE"), &dfs, 0);
    god.notify_violation(&on("NYSE"), &dfs, 10);
    assert_eq!(god.count_left(&on("NYSE"), &dfs, 1_000), 0);
    assert_eq!(god.global().count_left(1_000), 0);
    assert_eq!(god.good_time(&on("NYSE"), &dfs, 1_000), 2_000);
  }

  #[test]
  fn test_clear_only_inactive_farms_when_some_active() {
    let mut dfs = farms_with(&[("NYSE", "ushmds"), ("IBIS", "euhmds")]);
    let mut god = PacingGod::new(cfg());
    god.add_request(&on("NYSE"), &dfs, 0);
    god.add_request(&on("IBIS"), &dfs, 0);
    dfs.notify(2, 2106, "HMDS data farm connection is OK:ushmds");
    dfs.notify(3, 2107, "HMDS data farm connection is inactive but should be available upon demand.euhmds");
    god.clear(&dfs, 60_000);
    assert_eq!(god.hmds["ushmds"].len(), 1);
    assert!(god.hmds["euhmds"].is_empty());
    assert_eq!(god.global().len(), 2);

    dfs.set_all_broken();
    god.clear(&dfs, 60_000);
    assert!(god.hmds["ushmds"].is_empty());
    assert!(god.global().is_empty());
  }

  #[test]
  fn test_set_config_propagates() {
    let dfs = farms_with(&[("NYSE", "ushmds")]);
    let mut god = PacingGod::new(cfg());
    god.add_request(&on("NYSE"), &dfs, 0);
    god.set_violation_pause(9_000);
    assert_eq!(god.hmds["ushmds"].config().violation_pause, 9_000);
    assert_eq!(god.global().config().violation_pause, 9_000);
  }
}
