// =============================================================================
// Central Application State — Coherence Arb Engine
// =============================================================================
//
// The single source of truth for the engine.  Subsystems own their internal
// state; AppState ties them together and provides a unified snapshot for
// the control-plane API.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystems that manage their own interior
//     mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::alerts::Alerts;
use crate::catalog::Catalog;
use crate::market_cache::MarketCache;
use crate::opportunity::Opportunity;
use crate::risk::{RiskGovernor, RiskLimits};
use crate::runtime_config::RuntimeConfig;

/// Maximum number of recent opportunities retained for the audit trail.
const MAX_RECENT_OPPORTUNITIES: usize = 100;

/// Central application state shared across all async tasks via
/// `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, incremented on every
    /// meaningful state mutation.  The dashboard uses this to detect
    /// changes cheaply.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    pub cache: Arc<MarketCache>,
    pub catalog: Arc<Catalog>,
    pub governor: Arc<RiskGovernor>,
    pub alerts: Arc<Alerts>,

    /// Recent opportunities in their latest known lifecycle state.
    pub recent_opportunities: RwLock<Vec<Opportunity>>,

    /// Tickers the operator asked to force-flat; drained by the
    /// reconciliation worker.
    pub pending_flatten: RwLock<Vec<String>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the full state tree from the runtime configuration.  The
    /// returned value is wrapped in `Arc` immediately by the caller.
    pub fn new(config: RuntimeConfig) -> Self {
        let governor = Arc::new(RiskGovernor::new(
            RiskLimits::from_config(&config),
            config.starting_balance_cents,
        ));
        let catalog = Arc::new(Catalog::new(
            config.min_confidence,
            config.relationship_rescan_hours,
        ));

        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            cache: Arc::new(MarketCache::new()),
            catalog,
            governor,
            alerts: Arc::new(Alerts::new()),
            recent_opportunities: RwLock::new(Vec::new()),
            pending_flatten: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Version tracking
    // -------------------------------------------------------------------------

    pub fn increment_version(&self) {
        self.state_version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Opportunity audit trail
    // -------------------------------------------------------------------------

    /// Record (or refresh) an opportunity in the audit trail, keyed by id.
    pub fn record_opportunity(&self, opp: Opportunity) {
        let mut recent = self.recent_opportunities.write();
        if let Some(existing) = recent.iter_mut().find(|o| o.id == opp.id) {
            *existing = opp;
        } else {
            recent.push(opp);
            if recent.len() > MAX_RECENT_OPPORTUNITIES {
                let excess = recent.len() - MAX_RECENT_OPPORTUNITIES;
                recent.drain(0..excess);
            }
        }
        drop(recent);
        self.increment_version();
    }

    /// Opportunities not yet in a terminal state.
    pub fn open_opportunities(&self) -> Vec<Opportunity> {
        self.recent_opportunities
            .read()
            .iter()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect()
    }

    pub fn recent_opportunities_list(&self) -> Vec<Opportunity> {
        self.recent_opportunities.read().clone()
    }

    // -------------------------------------------------------------------------
    // Force-flat plumbing
    // -------------------------------------------------------------------------

    pub fn request_flatten(&self, ticker: impl Into<String>) {
        self.pending_flatten.write().push(ticker.into());
        self.increment_version();
    }

    pub fn drain_flatten_requests(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending_flatten.write())
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Unified snapshot for the dashboard.
    pub fn build_snapshot(&self) -> serde_json::Value {
        let config = self.runtime_config.read();
        let risk = self.governor.snapshot();
        serde_json::json!({
            "state_version": self.current_state_version(),
            "uptime_secs": self.start_time.elapsed().as_secs(),
            "dry_run": config.dry_run,
            "kill_switch": risk.kill_switch,
            "markets_cached": self.cache.len(),
            "cache_version": self.cache.version(),
            "relationships": self.catalog.len(),
            "risk": risk,
            "open_opportunities": self.open_opportunities().len(),
            "alerts": self.alerts.len(),
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("state_version", &self.current_state_version())
            .field("markets_cached", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opportunity::{Leg, OppState, Signal};
    use crate::types::{Action, Side};
    use chrono::{Duration, Utc};

    fn opp() -> Opportunity {
        let now = Utc::now();
        Opportunity::new(
            "rel-1",
            Signal::BuySupersetSellSubset,
            vec![Leg {
                ticker: "A".to_string(),
                side: Side::Yes,
                action: Action::Buy,
                limit_price: 50,
                observed_depth: 10,
            }],
            5,
            2,
            0.9,
            5,
            false,
            now,
            now + Duration::seconds(15),
        )
    }

    #[test]
    fn audit_trail_updates_in_place() {
        let state = AppState::new(RuntimeConfig::default());
        let mut o = opp();
        state.record_opportunity(o.clone());
        assert_eq!(state.open_opportunities().len(), 1);

        o.advance(OppState::Expired).unwrap();
        state.record_opportunity(o);
        assert!(state.open_opportunities().is_empty());
        assert_eq!(state.recent_opportunities_list().len(), 1);
    }

    #[test]
    fn flatten_requests_drain_once() {
        let state = AppState::new(RuntimeConfig::default());
        state.request_flatten("AAA");
        state.request_flatten("BBB");
        assert_eq!(state.drain_flatten_requests(), vec!["AAA", "BBB"]);
        assert!(state.drain_flatten_requests().is_empty());
    }

    #[test]
    fn snapshot_has_core_fields() {
        let state = AppState::new(RuntimeConfig::default());
        let snap = state.build_snapshot();
        assert_eq!(snap["dry_run"], true);
        assert_eq!(snap["kill_switch"], false);
        assert_eq!(snap["relationships"], 0);
    }
}
