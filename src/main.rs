// =============================================================================
// Coherence Arb Engine — Main Entry Point
// =============================================================================
//
// Detects logical pricing inconsistencies across related binary markets and
// executes multi-leg trades against them under strict risk controls.
//
// The engine starts in dry-run mode for safety.  Switch to live execution
// by editing the runtime config and restarting, or via the dashboard.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alerts;
mod api;
mod app_state;
mod catalog;
mod detector;
mod exchange;
mod execution;
mod fees;
mod llm;
mod market_cache;
mod opportunity;
mod risk;
mod runtime_config;
mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::AlertLevel;
use crate::app_state::AppState;
use crate::detector::{Detector, DetectorSettings};
use crate::exchange::{ExchangeApi, ExchangeClient};
use crate::execution::{ExecKnobs, ExecutionEngine};
use crate::fees::FeeSchedule;
use crate::llm::{HttpRelationshipOracle, RelationshipOracle};
use crate::market_cache::MarketSnapshot;
use crate::opportunity::Opportunity;
use crate::risk::FillEvent;
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "coherence_config.json";

/// Bounded queue between the detector and the execution workers.
const OPPORTUNITY_QUEUE_CAPACITY: usize = 100;
const FILL_QUEUE_CAPACITY: usize = 256;

fn fee_schedule(config: &RuntimeConfig) -> FeeSchedule {
    if config.fee_per_contract_cents > 0 {
        FeeSchedule::flat(config.fee_per_contract_cents)
    } else {
        FeeSchedule::exchange_quadratic()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Coherence Arb Engine — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: always come up in dry-run; live mode is an explicit operator
    // action after startup.
    config.dry_run = true;

    info!(
        dry_run = config.dry_run,
        max_daily_loss_cents = config.max_daily_loss_cents,
        execution_workers = config.execution_workers,
        "Engine starting in SAFE mode (dry-run)"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config.clone()));

    // ── 3. External adapters ─────────────────────────────────────────────
    let api_key = std::env::var("EXCHANGE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("EXCHANGE_API_SECRET").unwrap_or_default();
    let exchange: Arc<dyn ExchangeApi> =
        Arc::new(ExchangeClient::new(&config.exchange_base_url, api_key, api_secret)?);
    let oracle: Arc<dyn RelationshipOracle> =
        Arc::new(HttpRelationshipOracle::new(&config.llm_endpoint)?);

    // ── 4. Queues ────────────────────────────────────────────────────────
    let (opp_tx, opp_rx) = mpsc::channel::<Opportunity>(OPPORTUNITY_QUEUE_CAPACITY);
    let opp_rx = Arc::new(Mutex::new(opp_rx));
    let (fill_tx, mut fill_rx) = mpsc::channel::<FillEvent>(FILL_QUEUE_CAPACITY);

    // ── 5. Execution engine ──────────────────────────────────────────────
    let engine = Arc::new(ExecutionEngine::new(
        exchange.clone(),
        state.governor.clone(),
        fee_schedule(&config),
        fill_tx,
        state.alerts.clone(),
        ExecKnobs::from_config(&config),
    ));

    // ── 6. Ingestion worker ──────────────────────────────────────────────
    {
        let state = state.clone();
        let exchange = exchange.clone();
        tokio::spawn(async move {
            let interval_secs = state.runtime_config.read().full_scan_interval_seconds;
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                match full_market_scan(exchange.as_ref()).await {
                    Ok(snapshot) => {
                        let applied = state.cache.apply_snapshot(snapshot);
                        state.governor.mark_to_market(&state.cache);
                        state.increment_version();
                        debug!(applied, "ingestion cycle complete");
                    }
                    Err(e) => {
                        warn!(error = %e, "ingestion cycle failed — skipping");
                    }
                }
            }
        });
    }

    // ── 7. Scan worker ───────────────────────────────────────────────────
    {
        let state = state.clone();
        let opp_tx = opp_tx.clone();
        tokio::spawn(async move {
            let interval_secs = state.runtime_config.read().opportunity_recheck_seconds;
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;

                // Kill switch stops emission entirely.
                if state.governor.kill_switch() {
                    continue;
                }

                let (settings, fees) = {
                    let cfg = state.runtime_config.read();
                    (DetectorSettings::from_config(&cfg), fee_schedule(&cfg))
                };
                let detector = Detector::new(settings, fees);
                let opportunities =
                    detector.scan(Utc::now(), &state.cache, &state.catalog, &state.governor);

                for opp in opportunities {
                    state.record_opportunity(opp.clone());
                    if let Err(e) = opp_tx.try_send(opp) {
                        warn!(error = %e, "opportunity queue full — dropping");
                    }
                }
            }
        });
    }

    // ── 8. Execution workers ─────────────────────────────────────────────
    for worker in 0..config.execution_workers.max(1) {
        let state = state.clone();
        let engine = engine.clone();
        let opp_rx = opp_rx.clone();
        tokio::spawn(async move {
            info!(worker, "execution worker started");
            loop {
                let next = { opp_rx.lock().await.recv().await };
                let Some(mut opp) = next else {
                    break;
                };

                // Admission: expiry, kill switch, caps, sizing.
                if state.governor.admit(&mut opp, Utc::now()).is_err() {
                    state.record_opportunity(opp);
                    continue;
                }
                state.record_opportunity(opp.clone());

                let dry_run = state.runtime_config.read().dry_run;
                let report = engine.execute(opp.clone(), dry_run).await;

                opp.state = report.state;
                opp.terminal_note = report.note.clone();
                state.record_opportunity(opp);
            }
            info!(worker, "execution worker stopped");
        });
    }

    // ── 9. Reconciliation worker ─────────────────────────────────────────
    {
        let state = state.clone();
        let engine = engine.clone();
        let exchange = exchange.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    maybe_fill = fill_rx.recv() => {
                        let Some(fill) = maybe_fill else { break };
                        // Per-ticker ordering holds: one consumer, applied
                        // in arrival order.
                        if let Err(e) = state.governor.apply_fill(&fill) {
                            state.alerts.push(
                                AlertLevel::Critical,
                                format!("fill application failed: {e}"),
                            );
                        }
                        state.increment_version();
                    }
                    _ = interval.tick() => {
                        // Operator force-flat requests.
                        for ticker in state.drain_flatten_requests() {
                            if let Some(pos) = state.governor.position(&ticker) {
                                if pos.net_contracts != 0 {
                                    engine
                                        .flatten_position(&ticker, pos.net_contracts)
                                        .await;
                                }
                            }
                        }

                        state.governor.mark_to_market(&state.cache);

                        // Drift check against the exchange's own books.
                        let dry_run = state.runtime_config.read().dry_run;
                        if !dry_run {
                            reconcile_positions(&state, exchange.as_ref()).await;
                        }
                        state.increment_version();
                    }
                }
            }
        });
    }

    // ── 10. Revalidation worker ──────────────────────────────────────────
    {
        let state = state.clone();
        let oracle = oracle.clone();
        tokio::spawn(async move {
            let hours = state.runtime_config.read().relationship_rescan_hours;
            let mut interval =
                tokio::time::interval(Duration::from_secs(hours.max(1) * 3600));
            interval.tick().await; // the first tick fires immediately
            loop {
                interval.tick().await;
                revalidate_stale(&state, oracle.as_ref()).await;
            }
        });
    }

    // ── 11. Discovery worker ─────────────────────────────────────────────
    {
        let state = state.clone();
        let oracle = oracle.clone();
        tokio::spawn(async move {
            let hours = state.runtime_config.read().discovery_interval_hours;
            let mut interval =
                tokio::time::interval(Duration::from_secs(hours.max(1) * 3600));
            loop {
                interval.tick().await;
                discover_relationships(&state, oracle.as_ref()).await;
            }
        });
    }

    // ── 12. Control-plane API ────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("COHERENCE_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3400".into());
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "control plane listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "control plane server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind control plane"),
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 13. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Coherence Arb Engine shut down complete.");
    Ok(())
}

// =============================================================================
// Worker bodies
// =============================================================================

/// Pull every page of open markets into one coherent snapshot.
async fn full_market_scan(exchange: &dyn ExchangeApi) -> anyhow::Result<MarketSnapshot> {
    let mut markets = Vec::new();
    let mut cursor = None;
    loop {
        let (page, next) = exchange.list_open_markets(cursor).await?;
        markets.extend(page);
        match next {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }
    debug!(count = markets.len(), "full market scan fetched");
    Ok(MarketSnapshot {
        captured_at: Utc::now(),
        markets,
    })
}

/// Revalidate every relationship past its freshness interval.
async fn revalidate_stale(state: &AppState, oracle: &dyn RelationshipOracle) {
    let now = Utc::now();
    let due = state.catalog.stale_for_revalidation(now);
    if due.is_empty() {
        return;
    }
    info!(count = due.len(), "revalidating stale relationships");

    for rel in due {
        let markets: Vec<_> = rel
            .kind
            .tickers()
            .iter()
            .filter_map(|t| state.cache.get(t).ok())
            .collect();

        match oracle.revalidate(&rel, &markets).await {
            Ok(verdict) => {
                state.catalog.apply_revalidation(
                    &rel.id,
                    verdict.still_valid,
                    verdict.confidence,
                    now,
                );
            }
            Err(e) => {
                warn!(id = %rel.id, error = %e, "revalidation call failed — will retry next cycle");
            }
        }
    }
    state.increment_version();
}

/// Feed event-scoped market batches to the oracle and store whatever
/// validates.  Duplicates are expected and ignored.
async fn discover_relationships(state: &AppState, oracle: &dyn RelationshipOracle) {
    use std::collections::HashMap;

    let mut by_event: HashMap<String, Vec<_>> = HashMap::new();
    for market in state.cache.open_markets() {
        by_event
            .entry(market.event_key.clone())
            .or_default()
            .push(market);
    }

    for (event_key, batch) in by_event {
        if batch.len() < 2 {
            continue;
        }
        match oracle.discover(&batch).await {
            Ok(candidates) => {
                for candidate in candidates {
                    match state.catalog.upsert(candidate, &state.cache) {
                        Ok(id) => debug!(event = %event_key, id = %id, "relationship discovered"),
                        Err(e) => debug!(event = %event_key, error = %e, "candidate not stored"),
                    }
                }
            }
            Err(e) => {
                warn!(event = %event_key, error = %e, "discovery call failed — skipping event");
            }
        }
    }
    state.increment_version();
}

/// Compare internal positions against the exchange's and surface drift.
/// Never auto-closes anything; a human resolves discrepancies.
async fn reconcile_positions(state: &AppState, exchange: &dyn ExchangeApi) {
    let exchange_positions = match exchange.list_positions().await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "position reconciliation failed");
            return;
        }
    };

    let ours = state.governor.positions();
    for theirs in &exchange_positions {
        let held = ours
            .iter()
            .find(|p| p.ticker == theirs.ticker)
            .map(|p| p.net_contracts)
            .unwrap_or(0);
        if held != theirs.net_contracts {
            state.alerts.push(
                AlertLevel::Warn,
                format!(
                    "position drift on {}: local {} vs exchange {}",
                    theirs.ticker, held, theirs.net_contracts
                ),
            );
        }
    }
    for pos in &ours {
        if pos.net_contracts != 0
            && !exchange_positions.iter().any(|p| p.ticker == pos.ticker)
        {
            state.alerts.push(
                AlertLevel::Warn,
                format!(
                    "local position on {} has no exchange counterpart",
                    pos.ticker
                ),
            );
        }
    }
    debug!(
        local = ours.len(),
        exchange = exchange_positions.len(),
        "position reconciliation complete"
    );
}
