// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Coherence engine.  Every tunable
// parameter lives here so that the engine can be reconfigured at runtime
// without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_max_risk_per_trade_pct() -> f64 {
    2.0
}

fn default_starting_balance_cents() -> i64 {
    100_000
}

fn default_max_daily_loss_cents() -> i64 {
    5_000
}

fn default_max_open_positions() -> u32 {
    10
}

fn default_max_contracts_per_trade() -> u32 {
    100
}

fn default_max_contracts_per_market() -> i64 {
    500
}

fn default_min_score_threshold() -> f64 {
    1.0
}

fn default_fee_safety_multiplier() -> f64 {
    2.0
}

fn default_fee_per_contract_cents() -> i64 {
    2
}

fn default_partition_epsilon_cents() -> i64 {
    2
}

fn default_opportunity_ttl_seconds() -> u64 {
    15
}

fn default_full_scan_interval_seconds() -> u64 {
    60
}

fn default_opportunity_recheck_seconds() -> u64 {
    15
}

fn default_relationship_rescan_hours() -> u64 {
    24
}

fn default_discovery_interval_hours() -> u64 {
    6
}

fn default_order_deadline_seconds() -> u64 {
    30
}

fn default_hedge_widen_cents() -> i64 {
    3
}

fn default_max_unwind_loss_cents() -> i64 {
    500
}

fn default_kappa_floor() -> f64 {
    0.9
}

fn default_implication_soft_threshold() -> i64 {
    5
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_execution_workers() -> usize {
    4
}

fn default_exchange_base_url() -> String {
    "https://demo-api.predexch.com/v1".to_string()
}

fn default_llm_endpoint() -> String {
    "http://127.0.0.1:8790/oracle".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Coherence engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.  All monetary values are integer cents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------

    /// If set, admission and sizing run identically but executions are
    /// simulated with synthetic fills at limit price.
    #[serde(default = "default_true")]
    pub dry_run: bool,

    // --- Risk limits ---------------------------------------------------------

    /// Cap on per-opportunity capital at risk, as a percentage of balance.
    #[serde(default = "default_max_risk_per_trade_pct")]
    pub max_risk_per_trade_pct: f64,

    /// Trading balance assumed at startup (refined by reconciliation in
    /// live mode).
    #[serde(default = "default_starting_balance_cents")]
    pub starting_balance_cents: i64,

    /// Trading halts when realised + unrealised daily P&L breaches this.
    #[serde(default = "default_max_daily_loss_cents")]
    pub max_daily_loss_cents: i64,

    /// Admission cap on concurrently open opportunities.
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,

    /// Per-opportunity contract hard cap.
    #[serde(default = "default_max_contracts_per_trade")]
    pub max_contracts_per_trade: u32,

    /// Net absolute position cap per ticker.
    #[serde(default = "default_max_contracts_per_market")]
    pub max_contracts_per_market: i64,

    // --- Detection -----------------------------------------------------------

    /// Opportunities scoring below this are discarded.
    #[serde(default = "default_min_score_threshold")]
    pub min_score_threshold: f64,

    /// Raw edge must be at least this multiple of the per-unit fee estimate.
    #[serde(default = "default_fee_safety_multiplier")]
    pub fee_safety_multiplier: f64,

    /// Flat taker fee per contract per leg.  Zero selects the exchange's
    /// quadratic schedule instead.
    #[serde(default = "default_fee_per_contract_cents")]
    pub fee_per_contract_cents: i64,

    /// PARTITION sums must deviate from 100 by more than this to signal.
    #[serde(default = "default_partition_epsilon_cents")]
    pub partition_epsilon_cents: i64,

    /// Opportunities expire this long after detection.
    #[serde(default = "default_opportunity_ttl_seconds")]
    pub opportunity_ttl_seconds: u64,

    /// Relationships below this confidence never activate.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    // --- Cadences ------------------------------------------------------------

    /// Full paginated market scan interval.
    #[serde(default = "default_full_scan_interval_seconds")]
    pub full_scan_interval_seconds: u64,

    /// Detector tick interval.
    #[serde(default = "default_opportunity_recheck_seconds")]
    pub opportunity_recheck_seconds: u64,

    /// Periodic relationship revalidation interval.
    #[serde(default = "default_relationship_rescan_hours")]
    pub relationship_rescan_hours: u64,

    /// Relationship discovery interval.
    #[serde(default = "default_discovery_interval_hours")]
    pub discovery_interval_hours: u64,

    // --- Execution -----------------------------------------------------------

    /// Per-leg fill deadline.
    #[serde(default = "default_order_deadline_seconds")]
    pub order_deadline_seconds: u64,

    /// Price aggression applied when hedging a partial fill.
    #[serde(default = "default_hedge_widen_cents")]
    pub hedge_widen_cents: i64,

    /// Ceiling on the loss accepted while unwinding excess PARTITION legs.
    #[serde(default = "default_max_unwind_loss_cents")]
    pub max_unwind_loss_cents: i64,

    /// Number of parallel execution workers consuming the opportunity queue.
    #[serde(default = "default_execution_workers")]
    pub execution_workers: usize,

    /// Whether a zero fill of leg one terminates the opportunity as REJECTED
    /// rather than FAILED.
    #[serde(default)]
    pub treat_zero_fill_as_reject: bool,

    // --- IMPLICATION gates ---------------------------------------------------

    /// IMPLICATION relationships below this conditional probability are
    /// never evaluated.
    #[serde(default = "default_kappa_floor")]
    pub kappa_floor: f64,

    /// Minimum `yes_bid(if) − yes_ask(then)` spread, in cents, before an
    /// implication opportunity is emitted.
    #[serde(default = "default_implication_soft_threshold")]
    pub implication_soft_threshold: i64,

    /// If set, implication opportunities are rejected at admission and left
    /// for a human to act on.
    #[serde(default = "default_true")]
    pub require_human_for_implication: bool,

    // --- External endpoints --------------------------------------------------

    /// Exchange REST base URL.
    #[serde(default = "default_exchange_base_url")]
    pub exchange_base_url: String,

    /// Relationship oracle endpoint.
    #[serde(default = "default_llm_endpoint")]
    pub llm_endpoint: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            max_risk_per_trade_pct: default_max_risk_per_trade_pct(),
            starting_balance_cents: default_starting_balance_cents(),
            max_daily_loss_cents: default_max_daily_loss_cents(),
            max_open_positions: default_max_open_positions(),
            max_contracts_per_trade: default_max_contracts_per_trade(),
            max_contracts_per_market: default_max_contracts_per_market(),
            min_score_threshold: default_min_score_threshold(),
            fee_safety_multiplier: default_fee_safety_multiplier(),
            fee_per_contract_cents: default_fee_per_contract_cents(),
            partition_epsilon_cents: default_partition_epsilon_cents(),
            opportunity_ttl_seconds: default_opportunity_ttl_seconds(),
            min_confidence: default_min_confidence(),
            full_scan_interval_seconds: default_full_scan_interval_seconds(),
            opportunity_recheck_seconds: default_opportunity_recheck_seconds(),
            relationship_rescan_hours: default_relationship_rescan_hours(),
            discovery_interval_hours: default_discovery_interval_hours(),
            order_deadline_seconds: default_order_deadline_seconds(),
            hedge_widen_cents: default_hedge_widen_cents(),
            max_unwind_loss_cents: default_max_unwind_loss_cents(),
            execution_workers: default_execution_workers(),
            treat_zero_fill_as_reject: false,
            kappa_floor: default_kappa_floor(),
            implication_soft_threshold: default_implication_soft_threshold(),
            require_human_for_implication: true,
            exchange_base_url: default_exchange_base_url(),
            llm_endpoint: default_llm_endpoint(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            dry_run = config.dry_run,
            max_daily_loss_cents = config.max_daily_loss_cents,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        // Atomic write: write to a temporary sibling file, then rename.
        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
