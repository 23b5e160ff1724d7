// =============================================================================
// Execution Engine — turns admitted opportunities into multi-leg fills
// =============================================================================
//
// Two strategies:
//   Two-leg (SUBSET / THRESHOLD / IMPLICATION): sequential, least-liquid
//   leg first.  Leg two is repriced one cent more aggressive and sized to
//   leg one's actual fill.  A partial that leaves directional exposure
//   spawns a hedge task: one aggressive re-fill of the missing leg, then a
//   market flatten of the filled leg.
//
//   N-leg (PARTITION): all legs submitted in parallel under a shared
//   deadline; afterwards the largest common fill stands and excess legs are
//   unwound at market, bounded by the max-unwind-loss ceiling.
//
// Every order carries an exchange-side expiration (deadline plus a small
// skew) and is also cancelled locally at deadline.  Orders that cannot be
// cancelled within the bounded retry window are tracked as orphans and
// surfaced via alerts; the engine continues.
//
// Idempotency: each order's client key is `{opportunity_id}:{leg}:{attempt}`
// and is reused verbatim on any resubmission, so a retry can never create a
// second exchange order.
//
// In dry-run mode admission and sizing have already run identically; this
// engine short-circuits with synthetic fills at limit price, flagged so the
// governor routes them to the shadow ledger.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alerts::{AlertLevel, Alerts};
use crate::exchange::{ExchangeApi, ExchangeError, OrderRequest, OrderType};
use crate::fees::FeeSchedule;
use crate::opportunity::{Leg, OppState, Opportunity, Signal};
use crate::risk::{FillEvent, RiskGovernor};
use crate::runtime_config::RuntimeConfig;
use crate::types::Action;

/// Local cancel attempts before an order is declared orphaned.
const CANCEL_RETRIES: u32 = 3;
/// Exchange-side expiration skew past the local deadline.
const EXPIRY_SKEW_SECS: i64 = 2;

// ---------------------------------------------------------------------------
// Knobs & result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecKnobs {
    pub order_deadline: Duration,
    pub poll_interval: Duration,
    pub hedge_widen_cents: i64,
    pub max_unwind_loss_cents: i64,
    pub treat_zero_fill_as_reject: bool,
}

impl ExecKnobs {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            order_deadline: Duration::from_secs(cfg.order_deadline_seconds),
            poll_interval: Duration::from_millis(500),
            hedge_widen_cents: cfg.hedge_widen_cents,
            max_unwind_loss_cents: cfg.max_unwind_loss_cents,
            treat_zero_fill_as_reject: cfg.treat_zero_fill_as_reject,
        }
    }
}

/// Per-leg result attached to the report.
#[derive(Debug, Clone, Serialize)]
pub struct LegFill {
    pub ticker: String,
    pub submitted: u32,
    pub filled: u32,
    pub avg_price: i64,
}

/// What happened to one opportunity, end to end.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub opportunity_id: String,
    pub state: OppState,
    pub fills: Vec<LegFill>,
    pub note: Option<String>,
}

/// An order we could not cancel; reconciled against exchange positions on
/// a later pass.
#[derive(Debug, Clone, Serialize)]
pub struct OrphanOrder {
    pub order_id: String,
    pub ticker: String,
    pub noted_at: String,
}

/// How a single leg's wait ended.
struct WaitOutcome {
    filled: u32,
    avg_price: i64,
    /// The kill switch interrupted the wait.
    killed: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    exchange: Arc<dyn ExchangeApi>,
    governor: Arc<RiskGovernor>,
    fees: FeeSchedule,
    fill_tx: mpsc::Sender<FillEvent>,
    alerts: Arc<Alerts>,
    knobs: ExecKnobs,
    orphans: RwLock<Vec<OrphanOrder>>,
}

impl ExecutionEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        governor: Arc<RiskGovernor>,
        fees: FeeSchedule,
        fill_tx: mpsc::Sender<FillEvent>,
        alerts: Arc<Alerts>,
        knobs: ExecKnobs,
    ) -> Self {
        Self {
            exchange,
            governor,
            fees,
            fill_tx,
            alerts,
            knobs,
            orphans: RwLock::new(Vec::new()),
        }
    }

    pub fn orphan_orders(&self) -> Vec<OrphanOrder> {
        self.orphans.read().clone()
    }

    /// Execute an admitted (VALIDATED) opportunity through terminal state.
    pub async fn execute(&self, mut opp: Opportunity, dry_run: bool) -> ExecutionReport {
        if let Err(e) = opp.advance(OppState::Executing) {
            warn!(id = %opp.id, error = %e, "refusing to execute");
            return ExecutionReport {
                opportunity_id: opp.id.clone(),
                state: opp.state,
                fills: Vec::new(),
                note: Some("not in an executable state".to_string()),
            };
        }

        info!(
            id = %opp.id,
            signal = %opp.signal,
            legs = opp.legs.len(),
            count = opp.desired_count,
            dry_run,
            "executing opportunity"
        );

        let parallel = matches!(opp.signal, Signal::BuyAll | Signal::SellAll);
        let report = if dry_run {
            self.execute_dry(&mut opp).await
        } else if parallel {
            self.execute_parallel(&mut opp).await
        } else {
            self.execute_sequential(&mut opp).await
        };

        self.governor.release(&opp);
        info!(
            id = %report.opportunity_id,
            state = %report.state,
            note = report.note.as_deref().unwrap_or(""),
            "execution finished"
        );
        report
    }

    // -------------------------------------------------------------------------
    // Dry run
    // -------------------------------------------------------------------------

    async fn execute_dry(&self, opp: &mut Opportunity) -> ExecutionReport {
        let count = opp.desired_count;
        let mut fills = Vec::with_capacity(opp.legs.len());

        for (index, leg) in opp.legs.iter().enumerate() {
            let order_id = format!("dry-{}-{index}", opp.id);
            self.emit_fill(opp, leg, &order_id, count, count, leg.limit_price, true)
                .await;
            fills.push(LegFill {
                ticker: leg.ticker.clone(),
                submitted: count,
                filled: count,
                avg_price: leg.limit_price,
            });
        }

        let _ = opp.advance(OppState::Filled);
        ExecutionReport {
            opportunity_id: opp.id.clone(),
            state: opp.state,
            fills,
            note: Some("dry run: synthetic fills at limit".to_string()),
        }
    }

    // -------------------------------------------------------------------------
    // Two-leg sequential
    // -------------------------------------------------------------------------

    async fn execute_sequential(&self, opp: &mut Opportunity) -> ExecutionReport {
        let desired = opp.desired_count;
        let leg1 = opp.legs[0].clone();

        // Leg 1 at its detected limit.
        let order1 = match self.place_leg(opp, 0, &leg1, desired, leg1.limit_price, 0).await {
            Ok(id) => id,
            Err(e) => return self.fail_on_place(opp, &leg1, e),
        };
        let wait1 = self.wait_for_fill(&order1, &leg1.ticker, desired).await;
        if wait1.filled > 0 {
            self.emit_fill(opp, &leg1, &order1, wait1.filled, desired, wait1.avg_price, false)
                .await;
        }
        let mut fills = vec![LegFill {
            ticker: leg1.ticker.clone(),
            submitted: desired,
            filled: wait1.filled,
            avg_price: wait1.avg_price,
        }];

        // Zero fill at deadline: nothing at risk, clean exit.
        if wait1.filled == 0 {
            let state = if wait1.killed {
                OppState::Failed
            } else if self.knobs.treat_zero_fill_as_reject {
                OppState::Rejected
            } else {
                OppState::Failed
            };
            let _ = opp.finish(state, "leg 1 zero fill at deadline");
            return ExecutionReport {
                opportunity_id: opp.id.clone(),
                state: opp.state,
                fills,
                note: opp.terminal_note.clone(),
            };
        }

        let matched = wait1.filled;

        // Kill switch between legs: hold leg 1's fill, never submit leg 2.
        if wait1.killed || self.governor.kill_switch() {
            self.alerts.push(
                AlertLevel::Critical,
                format!(
                    "kill switch mid-execution: holding {matched} contracts of {} unhedged",
                    leg1.ticker
                ),
            );
            let _ = opp.finish(OppState::Partial, "kill switch engaged before leg 2");
            return ExecutionReport {
                opportunity_id: opp.id.clone(),
                state: opp.state,
                fills,
                note: opp.terminal_note.clone(),
            };
        }

        // Leg 2, sized to leg 1's actual fill, one cent more aggressive.
        let leg2 = opp.legs[1].clone();
        let leg2_price = aggressive_price(&leg2, 1);
        let wait2 = match self.place_leg(opp, 1, &leg2, matched, leg2_price, 0).await {
            Ok(order2) => {
                let w = self.wait_for_fill(&order2, &leg2.ticker, matched).await;
                if w.filled > 0 {
                    self.emit_fill(opp, &leg2, &order2, w.filled, matched, w.avg_price, false)
                        .await;
                }
                w
            }
            Err(e) => {
                warn!(id = %opp.id, error = %e, "leg 2 placement failed");
                WaitOutcome {
                    filled: 0,
                    avg_price: 0,
                    killed: false,
                }
            }
        };
        fills.push(LegFill {
            ticker: leg2.ticker.clone(),
            submitted: matched,
            filled: wait2.filled,
            avg_price: wait2.avg_price,
        });

        if wait2.filled == matched {
            let (state, note) = if matched == desired {
                (OppState::Filled, format!("both legs filled {matched}"))
            } else {
                // Matched book, but smaller than desired.
                (OppState::Partial, format!("matched {matched} of {desired}"))
            };
            let _ = opp.finish(state, note);
            return ExecutionReport {
                opportunity_id: opp.id.clone(),
                state: opp.state,
                fills,
                note: opp.terminal_note.clone(),
            };
        }

        // Directional exposure: leg 1 filled more than leg 2.
        let exposure = matched - wait2.filled;
        if wait2.filled == 0 {
            self.alerts.push(
                AlertLevel::Warn,
                format!(
                    "leg 2 ({}) zero fill: {exposure} contracts of {} exposed",
                    leg2.ticker, leg1.ticker
                ),
            );
        }
        let hedge_note = self.hedge_task(opp, &leg1, &leg2, exposure).await;
        let _ = opp.finish(
            OppState::Partial,
            format!("leg 2 filled {}/{matched}; {hedge_note}", wait2.filled),
        );
        ExecutionReport {
            opportunity_id: opp.id.clone(),
            state: opp.state,
            fills,
            note: opp.terminal_note.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // N-leg parallel (PARTITION)
    // -------------------------------------------------------------------------

    async fn execute_parallel(&self, opp: &mut Opportunity) -> ExecutionReport {
        let desired = opp.desired_count;
        let opp_ref: &Opportunity = opp;

        // Submit every leg simultaneously.
        let placements = join_all(opp_ref.legs.iter().enumerate().map(|(index, leg)| {
            let leg = leg.clone();
            async move {
                let placed = self
                    .place_leg(opp_ref, index, &leg, desired, leg.limit_price, 0)
                    .await;
                (leg, placed)
            }
        }))
        .await;

        // Any outright rejection: cancel what was placed and fail.
        if placements.iter().any(|(_, p)| p.is_err()) {
            for (leg, placed) in &placements {
                if let Ok(order_id) = placed {
                    self.cancel_with_retries(order_id, &leg.ticker).await;
                }
            }
            let detail = placements
                .iter()
                .find_map(|(_, p)| p.as_ref().err().map(|e| e.to_string()))
                .unwrap_or_default();
            self.alerts
                .push(AlertLevel::Warn, format!("partition legs rejected: {detail}"));
            let _ = opp.finish(OppState::Failed, format!("leg placement rejected: {detail}"));
            return ExecutionReport {
                opportunity_id: opp.id.clone(),
                state: opp.state,
                fills: Vec::new(),
                note: opp.terminal_note.clone(),
            };
        }

        // Shared deadline: wait on all legs concurrently.
        let waits = join_all(placements.iter().map(|(leg, placed)| {
            let order_id = placed.as_ref().cloned().unwrap_or_default();
            let leg = leg.clone();
            async move {
                let outcome = self.wait_for_fill(&order_id, &leg.ticker, desired).await;
                (leg, order_id, outcome)
            }
        }))
        .await;

        let mut fills = Vec::with_capacity(waits.len());
        for (leg, order_id, outcome) in &waits {
            if outcome.filled > 0 {
                self.emit_fill(opp, leg, order_id, outcome.filled, desired, outcome.avg_price, false)
                    .await;
            }
            fills.push(LegFill {
                ticker: leg.ticker.clone(),
                submitted: desired,
                filled: outcome.filled,
                avg_price: outcome.avg_price,
            });
        }

        let common = waits.iter().map(|(_, _, o)| o.filled).min().unwrap_or(0);

        if common == desired {
            let _ = opp.finish(OppState::Filled, format!("all legs filled {desired}"));
            return ExecutionReport {
                opportunity_id: opp.id.clone(),
                state: opp.state,
                fills,
                note: opp.terminal_note.clone(),
            };
        }

        if waits.iter().all(|(_, _, o)| o.filled == 0) {
            let _ = opp.finish(OppState::Failed, "no partition leg filled");
            return ExecutionReport {
                opportunity_id: opp.id.clone(),
                state: opp.state,
                fills,
                note: opp.terminal_note.clone(),
            };
        }

        // Uneven fills: keep the largest common set, unwind the excess.
        let mut unwound = 0u32;
        for (index, (leg, _, outcome)) in waits.iter().enumerate() {
            let excess = outcome.filled.saturating_sub(common);
            if excess > 0 {
                unwound += self.unwind_excess(opp, index, leg, excess).await;
            }
        }
        self.alerts.push(
            AlertLevel::Warn,
            format!(
                "partition {} uneven: common fill {common}, unwound {unwound} excess contracts",
                opp.id
            ),
        );
        let _ = opp.finish(
            OppState::Partial,
            format!("common fill {common}/{desired}, excess unwound"),
        );
        ExecutionReport {
            opportunity_id: opp.id.clone(),
            state: opp.state,
            fills,
            note: opp.terminal_note.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Hedge / unwind policy
    // -------------------------------------------------------------------------

    /// Handle directional exposure from a partial two-leg fill:
    /// (a) one aggressive re-fill of the missing leg, (b) on failure a
    /// market flatten of the filled leg's excess.  Realised losses flow
    /// through the normal fill events into the daily cap.
    async fn hedge_task(
        &self,
        opp: &Opportunity,
        filled_leg: &Leg,
        missing_leg: &Leg,
        exposure: u32,
    ) -> String {
        if !self.governor.allow_unwind() {
            self.alerts.push(
                AlertLevel::Critical,
                format!(
                    "kill switch set: {exposure} contracts of {} held unhedged",
                    filled_leg.ticker
                ),
            );
            return "exposure held (kill switch)".to_string();
        }

        // (a) Aggressive re-fill of the missing leg.
        let price = aggressive_price(missing_leg, self.knobs.hedge_widen_cents);
        let refill = match self.place_leg(opp, 1, missing_leg, exposure, price, 1).await {
            Ok(order_id) => {
                let outcome = self
                    .wait_for_fill(&order_id, &missing_leg.ticker, exposure)
                    .await;
                if outcome.filled > 0 {
                    self.emit_fill(
                        opp,
                        missing_leg,
                        &order_id,
                        outcome.filled,
                        exposure,
                        outcome.avg_price,
                        false,
                    )
                    .await;
                }
                outcome.filled
            }
            Err(e) => {
                warn!(id = %opp.id, error = %e, "hedge re-fill placement failed");
                0
            }
        };
        if refill == exposure {
            return format!("hedge re-filled {refill}");
        }

        // (b) Flatten the filled leg's uncovered remainder at market.
        let residual = exposure - refill;
        let flattened = self.unwind_excess(opp, 0, filled_leg, residual).await;
        if flattened < residual {
            self.alerts.push(
                AlertLevel::Critical,
                format!(
                    "hedge incomplete: {} contracts of {} remain exposed",
                    residual - flattened,
                    filled_leg.ticker
                ),
            );
        }
        format!("hedge re-filled {refill}, flattened {flattened} of {residual}")
    }

    /// Close `excess` contracts of an already-filled leg at market, bounded
    /// by the max-unwind-loss ceiling.
    async fn unwind_excess(
        &self,
        opp: &Opportunity,
        leg_index: usize,
        leg: &Leg,
        excess: u32,
    ) -> u32 {
        // Bound the accepted aggression cost.
        let widen = self.knobs.hedge_widen_cents.max(1);
        let affordable = (self.knobs.max_unwind_loss_cents / widen).max(0) as u32;
        let count = excess.min(affordable);
        if count == 0 {
            self.alerts.push(
                AlertLevel::Critical,
                format!(
                    "unwind of {excess} {} exceeds max unwind loss; exposure held",
                    leg.ticker
                ),
            );
            return 0;
        }
        if count < excess {
            self.alerts.push(
                AlertLevel::Warn,
                format!(
                    "unwind capped at {count} of {excess} {} by max unwind loss",
                    leg.ticker
                ),
            );
        }

        let request = OrderRequest {
            ticker: leg.ticker.clone(),
            action: leg.action.inverse(),
            side: leg.side,
            order_type: OrderType::Market,
            count,
            limit_price_cents: None,
            expiration_ts: Some(
                Utc::now().timestamp() + self.knobs.order_deadline.as_secs() as i64 + EXPIRY_SKEW_SECS,
            ),
            idempotency_key: format!("{}:{leg_index}:2", opp.id),
        };

        let order_id = match self.exchange.place_order(&request).await {
            Ok(id) => id,
            Err(e) => {
                self.alerts.push(
                    AlertLevel::Critical,
                    format!("market unwind of {} failed: {e}", leg.ticker),
                );
                return 0;
            }
        };

        let outcome = self.wait_for_fill(&order_id, &leg.ticker, count).await;
        if outcome.filled > 0 {
            let unwind_leg = Leg {
                action: leg.action.inverse(),
                ..leg.clone()
            };
            self.emit_fill(
                opp,
                &unwind_leg,
                &order_id,
                outcome.filled,
                count,
                outcome.avg_price,
                false,
            )
            .await;
        }
        outcome.filled
    }

    /// Close an arbitrary net position at market (operator force-flat).
    pub async fn flatten_position(&self, ticker: &str, net_contracts: i64) -> u32 {
        if net_contracts == 0 {
            return 0;
        }
        let count = net_contracts.unsigned_abs() as u32;
        let leg = Leg {
            ticker: ticker.to_string(),
            side: crate::types::Side::Yes,
            action: if net_contracts > 0 {
                Action::Buy
            } else {
                Action::Sell
            },
            limit_price: 50,
            observed_depth: count,
        };
        let flat = Opportunity::new(
            "force-flat",
            Signal::SellAll,
            vec![leg.clone()],
            0,
            0,
            1.0,
            count,
            false,
            Utc::now(),
            Utc::now(),
        );
        info!(ticker, net_contracts, "force-flat requested");
        self.unwind_excess(&flat, 0, &leg, count).await
    }

    // -------------------------------------------------------------------------
    // Order plumbing
    // -------------------------------------------------------------------------

    async fn place_leg(
        &self,
        opp: &Opportunity,
        leg_index: usize,
        leg: &Leg,
        count: u32,
        limit_price: i64,
        attempt: u32,
    ) -> Result<String, ExchangeError> {
        let request = OrderRequest {
            ticker: leg.ticker.clone(),
            action: leg.action,
            side: leg.side,
            order_type: OrderType::Limit,
            count,
            limit_price_cents: Some(limit_price.clamp(1, 99)),
            expiration_ts: Some(
                Utc::now().timestamp() + self.knobs.order_deadline.as_secs() as i64 + EXPIRY_SKEW_SECS,
            ),
            idempotency_key: format!("{}:{leg_index}:{attempt}", opp.id),
        };
        debug!(
            id = %opp.id,
            ticker = %leg.ticker,
            action = %leg.action,
            count,
            limit_price,
            attempt,
            "placing leg"
        );
        self.exchange.place_order(&request).await
    }

    /// Poll until full fill, deadline, or kill switch.  The residual is
    /// cancelled locally; the exchange-side expiration is the backstop.
    async fn wait_for_fill(&self, order_id: &str, ticker: &str, submitted: u32) -> WaitOutcome {
        let deadline = Instant::now() + self.knobs.order_deadline;
        let mut filled = 0u32;
        let mut avg_price = 0i64;
        let mut killed = false;

        loop {
            if self.governor.kill_switch() {
                killed = true;
                break;
            }

            match self.exchange.get_order(order_id).await {
                Ok(status) => {
                    filled = status.filled_count.min(submitted);
                    if status.avg_price_cents > 0 {
                        avg_price = status.avg_price_cents;
                    }
                    if !status.open || filled >= submitted {
                        return WaitOutcome {
                            filled,
                            avg_price,
                            killed: false,
                        };
                    }
                }
                Err(e) => {
                    debug!(order_id, error = %e, "order status poll failed");
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.knobs.poll_interval).await;
        }

        // Deadline or kill: cancel the residual, then read the final state.
        self.cancel_with_retries(order_id, ticker).await;
        if let Ok(status) = self.exchange.get_order(order_id).await {
            filled = status.filled_count.min(submitted);
            if status.avg_price_cents > 0 {
                avg_price = status.avg_price_cents;
            }
        }
        WaitOutcome {
            filled,
            avg_price,
            killed,
        }
    }

    /// Bounded cancellation; an uncancellable order becomes an orphan.
    async fn cancel_with_retries(&self, order_id: &str, ticker: &str) -> bool {
        for attempt in 0..CANCEL_RETRIES {
            match self.exchange.cancel_order(order_id).await {
                Ok(()) => return true,
                // A reject here usually means the order already left the
                // book (filled or expired server-side).
                Err(ExchangeError::Rejected(reason)) => {
                    debug!(order_id, %reason, "cancel rejected");
                    return true;
                }
                Err(e) => {
                    warn!(order_id, attempt, error = %e, "cancel failed — retrying");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }

        self.orphans.write().push(OrphanOrder {
            order_id: order_id.to_string(),
            ticker: ticker.to_string(),
            noted_at: Utc::now().to_rfc3339(),
        });
        self.alerts.push(
            AlertLevel::Critical,
            format!("orphan order {order_id} on {ticker}: cancellation failed"),
        );
        false
    }

    fn fail_on_place(
        &self,
        opp: &mut Opportunity,
        leg: &Leg,
        error: ExchangeError,
    ) -> ExecutionReport {
        self.alerts.push(
            AlertLevel::Warn,
            format!("leg placement on {} failed: {error}", leg.ticker),
        );
        let _ = opp.finish(OppState::Failed, format!("placement failed: {error}"));
        ExecutionReport {
            opportunity_id: opp.id.clone(),
            state: opp.state,
            fills: Vec::new(),
            note: opp.terminal_note.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn emit_fill(
        &self,
        opp: &Opportunity,
        leg: &Leg,
        order_id: &str,
        count: u32,
        submitted: u32,
        avg_price: i64,
        synthetic: bool,
    ) {
        let price = if avg_price > 0 { avg_price } else { leg.limit_price };
        let event = FillEvent {
            opportunity_id: opp.id.clone(),
            order_id: order_id.to_string(),
            ticker: leg.ticker.clone(),
            side: leg.side,
            action: leg.action,
            count,
            price,
            fee_paid: self.fees.per_contract(price) * count as i64,
            submitted_count: submitted,
            synthetic,
        };
        if self.fill_tx.send(event).await.is_err() {
            warn!(id = %opp.id, "fill channel closed; event dropped");
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("knobs", &self.knobs)
            .field("orphans", &self.orphans.read().len())
            .finish()
    }
}

/// Buyers raise, sellers lower; clamped to the valid price domain.
fn aggressive_price(leg: &Leg, widen: i64) -> i64 {
    let price = match leg.action {
        Action::Buy => leg.limit_price + widen,
        Action::Sell => leg.limit_price - widen,
    };
    price.clamp(1, 99)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{EventGroup, ExchangePosition, ExchangeResult, OrderStatus, TopOfBook};
    use crate::market_cache::Market;
    use crate::opportunity::Signal;
    use crate::risk::{RiskLimits, RiskGovernor};
    use crate::types::Side;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    // -------------------------------------------------------------------------
    // Scripted mock exchange
    // -------------------------------------------------------------------------

    #[derive(Clone)]
    struct FillPlan {
        /// Status polls before the plan's fill appears.
        after_polls: u32,
        /// Contracts filled once the plan matures (capped at submitted).
        fill: u32,
    }

    struct MockOrder {
        request: OrderRequest,
        polls: u32,
        plan: FillPlan,
        cancelled: bool,
    }

    #[derive(Default)]
    struct MockState {
        orders: HashMap<String, MockOrder>,
        by_key: HashMap<String, String>,
        /// Per-ticker queue of plans, consumed in placement order.
        plans: HashMap<String, VecDeque<FillPlan>>,
        placed: Vec<OrderRequest>,
        next_id: u64,
        reject_tickers: Vec<String>,
        cancel_fails: Vec<String>,
    }

    struct MockExchange {
        state: Mutex<MockState>,
        on_full_fill: Mutex<Option<Box<dyn Fn() + Send>>>,
    }

    impl MockExchange {
        fn new() -> Self {
            Self {
                state: Mutex::new(MockState::default()),
                on_full_fill: Mutex::new(None),
            }
        }

        fn plan(&self, ticker: &str, after_polls: u32, fill: u32) {
            self.state
                .lock()
                .plans
                .entry(ticker.to_string())
                .or_default()
                .push_back(FillPlan { after_polls, fill });
        }

        fn reject(&self, ticker: &str) {
            self.state.lock().reject_tickers.push(ticker.to_string());
        }

        fn placed(&self) -> Vec<OrderRequest> {
            self.state.lock().placed.clone()
        }
    }

    #[async_trait]
    impl ExchangeApi for MockExchange {
        async fn list_open_markets(
            &self,
            _cursor: Option<String>,
        ) -> ExchangeResult<(Vec<Market>, Option<String>)> {
            Ok((Vec::new(), None))
        }

        async fn get_orderbook(&self, _ticker: &str) -> ExchangeResult<TopOfBook> {
            Err(ExchangeError::Unavailable("not scripted".to_string()))
        }

        async fn list_events(&self) -> ExchangeResult<Vec<EventGroup>> {
            Ok(Vec::new())
        }

        async fn get_event(&self, _key: &str) -> ExchangeResult<EventGroup> {
            Err(ExchangeError::Unavailable("not scripted".to_string()))
        }

        async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<String> {
            let mut s = self.state.lock();

            if s.reject_tickers.contains(&request.ticker) {
                return Err(ExchangeError::Rejected("insufficient funds".to_string()));
            }

            // Idempotency: the same key always maps to the same order.
            if let Some(existing) = s.by_key.get(&request.idempotency_key) {
                return Ok(existing.clone());
            }

            s.next_id += 1;
            let order_id = format!("ord-{}", s.next_id);
            let plan = s
                .plans
                .get_mut(&request.ticker)
                .and_then(VecDeque::pop_front)
                .unwrap_or(FillPlan {
                    after_polls: 0,
                    fill: request.count,
                });
            s.by_key
                .insert(request.idempotency_key.clone(), order_id.clone());
            s.placed.push(request.clone());
            s.orders.insert(
                order_id.clone(),
                MockOrder {
                    request: request.clone(),
                    polls: 0,
                    plan,
                    cancelled: false,
                },
            );
            Ok(order_id)
        }

        async fn get_order(&self, order_id: &str) -> ExchangeResult<OrderStatus> {
            let mut fully_filled = false;
            let status = {
                let mut s = self.state.lock();
                let order = s
                    .orders
                    .get_mut(order_id)
                    .ok_or_else(|| ExchangeError::Rejected("unknown order".to_string()))?;
                order.polls += 1;

                let filled = if order.polls > order.plan.after_polls {
                    order.plan.fill.min(order.request.count)
                } else {
                    0
                };
                let open = !order.cancelled && filled < order.request.count;
                if filled == order.request.count && order.request.count > 0 {
                    fully_filled = true;
                }
                OrderStatus {
                    order_id: order_id.to_string(),
                    open,
                    filled_count: filled,
                    avg_price_cents: order.request.limit_price_cents.unwrap_or(50),
                }
            };
            if fully_filled {
                if let Some(hook) = self.on_full_fill.lock().take() {
                    hook();
                }
            }
            Ok(status)
        }

        async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()> {
            let mut s = self.state.lock();
            if s.cancel_fails.contains(&order_id.to_string()) {
                return Err(ExchangeError::Transient("cancel timeout".to_string()));
            }
            if let Some(order) = s.orders.get_mut(order_id) {
                order.cancelled = true;
            }
            Ok(())
        }

        async fn list_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
            Ok(Vec::new())
        }
    }

    // -------------------------------------------------------------------------
    // Fixtures
    // -------------------------------------------------------------------------

    fn limits() -> RiskLimits {
        RiskLimits {
            max_risk_per_trade_pct: 50.0,
            max_daily_loss_cents: 100_000,
            max_open_positions: 10,
            max_contracts_per_trade: 100,
            max_contracts_per_market: 10_000,
            require_human_for_implication: true,
        }
    }

    fn knobs() -> ExecKnobs {
        ExecKnobs {
            order_deadline: Duration::from_millis(300),
            poll_interval: Duration::from_millis(25),
            hedge_widen_cents: 3,
            max_unwind_loss_cents: 500,
            treat_zero_fill_as_reject: false,
        }
    }

    struct Harness {
        exchange: Arc<MockExchange>,
        governor: Arc<RiskGovernor>,
        engine: ExecutionEngine,
        fill_rx: mpsc::Receiver<FillEvent>,
    }

    fn harness() -> Harness {
        let exchange = Arc::new(MockExchange::new());
        let governor = Arc::new(RiskGovernor::new(limits(), 1_000_000));
        let (fill_tx, fill_rx) = mpsc::channel(64);
        let engine = ExecutionEngine::new(
            exchange.clone(),
            governor.clone(),
            FeeSchedule::flat(2),
            fill_tx,
            Arc::new(Alerts::new()),
            knobs(),
        );
        Harness {
            exchange,
            governor,
            engine,
            fill_rx,
        }
    }

    fn leg(ticker: &str, action: Action, limit: i64, depth: u32) -> Leg {
        Leg {
            ticker: ticker.to_string(),
            side: Side::Yes,
            action,
            limit_price: limit,
            observed_depth: depth,
        }
    }

    /// A two-leg opportunity already admitted (VALIDATED) for `count`.
    fn admitted_two_leg(governor: &RiskGovernor, count: u32) -> Opportunity {
        let now = Utc::now();
        let mut opp = Opportunity::new(
            "rel-1",
            Signal::BuySupersetSellSubset,
            vec![
                leg("JUN", Action::Buy, 52, 15),
                leg("MAR", Action::Sell, 58, 20),
            ],
            10,
            4,
            0.95,
            count,
            false,
            now,
            now + chrono::Duration::seconds(30),
        );
        governor.admit(&mut opp, now).unwrap();
        opp
    }

    fn admitted_partition(governor: &RiskGovernor, count: u32) -> Opportunity {
        let now = Utc::now();
        let legs = ["P_1", "P_2", "P_3", "P_4"]
            .iter()
            .map(|t| leg(t, Action::Buy, 23, 50))
            .collect();
        let mut opp = Opportunity::new(
            "rel-p",
            Signal::BuyAll,
            legs,
            8,
            4,
            0.9,
            count,
            false,
            now,
            now + chrono::Duration::seconds(30),
        );
        governor.admit(&mut opp, now).unwrap();
        opp
    }

    async fn drain(rx: &mut mpsc::Receiver<FillEvent>) -> Vec<FillEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    // -------------------------------------------------------------------------
    // Scenarios
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn two_leg_full_fill() {
        let mut h = harness();
        let opp = admitted_two_leg(&h.governor, 10);

        let report = h.engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Filled);
        assert_eq!(report.fills.len(), 2);
        assert!(report.fills.iter().all(|f| f.filled == 10));

        let events = drain(&mut h.fill_rx).await;
        assert_eq!(events.len(), 2);
        for e in &events {
            h.governor.apply_fill(e).unwrap();
        }
        // Buy 10 JUN, sell 10 MAR.
        assert_eq!(h.governor.position("JUN").unwrap().net_contracts, 10);
        assert_eq!(h.governor.position("MAR").unwrap().net_contracts, -10);
        assert_eq!(h.governor.open_opportunity_count(), 0);
    }

    #[tokio::test]
    async fn leg_order_and_aggressive_repricing() {
        let mut h = harness();
        // Leg 1 fills 6 of 10 and then sits; leg 2 fills fully.
        h.exchange.plan("JUN", 1, 6);
        let opp = admitted_two_leg(&h.governor, 10);

        let report = h.engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Partial);

        let placed = h.exchange.placed();
        assert_eq!(placed.len(), 2);
        // Least-liquid leg first.
        assert_eq!(placed[0].ticker, "JUN");
        assert_eq!(placed[0].count, 10);
        // Leg 2 sized to leg 1's actual fill, one cent more aggressive
        // (seller lowers 58 -> 57).
        assert_eq!(placed[1].ticker, "MAR");
        assert_eq!(placed[1].count, 6);
        assert_eq!(placed[1].limit_price_cents, Some(57));

        let events = drain(&mut h.fill_rx).await;
        let jun: u32 = events.iter().filter(|e| e.ticker == "JUN").map(|e| e.count).sum();
        let mar: u32 = events.iter().filter(|e| e.ticker == "MAR").map(|e| e.count).sum();
        assert_eq!(jun, 6);
        assert_eq!(mar, 6);
    }

    #[tokio::test]
    async fn partial_fill_hedge_flattens_leg_one() {
        let mut h = harness();
        // Leg 1: 6 of 10.  Leg 2: zero fill, and the hedge re-fill (second
        // MAR order) also zero-fills, forcing a market flatten of JUN.
        h.exchange.plan("JUN", 1, 6);
        h.exchange.plan("MAR", u32::MAX, 0); // leg 2 never fills
        h.exchange.plan("MAR", u32::MAX, 0); // hedge re-fill never fills
        let opp = admitted_two_leg(&h.governor, 10);

        let report = h.engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Partial);

        let placed = h.exchange.placed();
        // leg1, leg2, hedge re-fill, market flatten.
        assert_eq!(placed.len(), 4);
        let flatten = &placed[3];
        assert_eq!(flatten.ticker, "JUN");
        assert_eq!(flatten.action, Action::Sell);
        assert_eq!(flatten.order_type, OrderType::Market);
        assert_eq!(flatten.count, 6);

        // Ledger nets out: 6 bought, 6 flattened.
        let events = drain(&mut h.fill_rx).await;
        for e in &events {
            h.governor.apply_fill(e).unwrap();
        }
        assert_eq!(h.governor.position("JUN").unwrap().net_contracts, 0);
    }

    #[tokio::test]
    async fn partial_fill_hedge_refill_succeeds() {
        let mut h = harness();
        // Leg 1: 6 of 10.  Leg 2 zero-fills, hedge re-fill completes the 6.
        h.exchange.plan("JUN", 1, 6);
        h.exchange.plan("MAR", u32::MAX, 0);
        h.exchange.plan("MAR", 0, 6);
        let opp = admitted_two_leg(&h.governor, 10);

        let report = h.engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Partial);

        let placed = h.exchange.placed();
        assert_eq!(placed.len(), 3);
        // Hedge widens the sell by 3 cents: 58 - 3 = 55.
        assert_eq!(placed[2].limit_price_cents, Some(55));

        let events = drain(&mut h.fill_rx).await;
        for e in &events {
            h.governor.apply_fill(e).unwrap();
        }
        assert_eq!(h.governor.position("JUN").unwrap().net_contracts, 6);
        assert_eq!(h.governor.position("MAR").unwrap().net_contracts, -6);
    }

    #[tokio::test]
    async fn exactly_one_short_no_over_leg() {
        let mut h = harness();
        // Leg 1 fills desired - 1; leg 2 must be submitted for exactly 9.
        h.exchange.plan("JUN", 1, 9);
        let opp = admitted_two_leg(&h.governor, 10);

        let report = h.engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Partial);

        let placed = h.exchange.placed();
        assert_eq!(placed[1].count, 9);
        let events = drain(&mut h.fill_rx).await;
        let mar: u32 = events.iter().filter(|e| e.ticker == "MAR").map(|e| e.count).sum();
        assert_eq!(mar, 9);
    }

    #[tokio::test]
    async fn zero_fill_fails_cleanly() {
        let mut h = harness();
        h.exchange.plan("JUN", u32::MAX, 0);
        let opp = admitted_two_leg(&h.governor, 10);

        let report = h.engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Failed);
        // Only leg 1 was ever placed.
        assert_eq!(h.exchange.placed().len(), 1);
        assert!(drain(&mut h.fill_rx).await.is_empty());
        assert_eq!(h.governor.open_opportunity_count(), 0);
    }

    #[tokio::test]
    async fn zero_fill_rejected_when_configured() {
        let exchange = Arc::new(MockExchange::new());
        exchange.plan("JUN", u32::MAX, 0);
        let governor = Arc::new(RiskGovernor::new(limits(), 1_000_000));
        let (fill_tx, _fill_rx) = mpsc::channel(64);
        let mut k = knobs();
        k.treat_zero_fill_as_reject = true;
        let engine = ExecutionEngine::new(
            exchange,
            governor.clone(),
            FeeSchedule::flat(2),
            fill_tx,
            Arc::new(Alerts::new()),
            k,
        );
        let opp = admitted_two_leg(&governor, 10);

        let report = engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Rejected);
    }

    #[tokio::test]
    async fn exchange_reject_fails_opportunity() {
        let mut h = harness();
        h.exchange.reject("JUN");
        let opp = admitted_two_leg(&h.governor, 10);

        let report = h.engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Failed);
        assert!(report.note.unwrap().contains("placement failed"));
        assert!(drain(&mut h.fill_rx).await.is_empty());
    }

    #[tokio::test]
    async fn kill_switch_mid_execution_holds_leg_one() {
        let mut h = harness();
        // When leg 1 fully fills, the mock flips the kill switch before the
        // engine can submit leg 2.
        let gov = h.governor.clone();
        *h.exchange.on_full_fill.lock() = Some(Box::new(move || {
            gov.engage_kill_switch("test: mid-execution");
        }));
        let opp = admitted_two_leg(&h.governor, 10);

        let report = h.engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Partial);
        assert!(report.note.unwrap().contains("kill switch"));
        // Leg 2 never submitted.
        assert_eq!(h.exchange.placed().len(), 1);
        // Leg 1's fill is held and reported.
        let events = drain(&mut h.fill_rx).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ticker, "JUN");
    }

    #[tokio::test]
    async fn partition_all_legs_fill() {
        let mut h = harness();
        let opp = admitted_partition(&h.governor, 10);

        let report = h.engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Filled);
        assert_eq!(report.fills.len(), 4);
        assert_eq!(h.exchange.placed().len(), 4);
        assert_eq!(drain(&mut h.fill_rx).await.len(), 4);
    }

    #[tokio::test]
    async fn partition_uneven_fills_unwound_to_common() {
        let mut h = harness();
        // P_2 fills only 7; the other three fill 10 and carry 3 excess each.
        h.exchange.plan("P_2", 1, 7);
        let opp = admitted_partition(&h.governor, 10);

        let report = h.engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Partial);

        let placed = h.exchange.placed();
        // 4 legs + 3 market unwinds.
        assert_eq!(placed.len(), 7);
        let unwinds: Vec<&OrderRequest> = placed
            .iter()
            .filter(|r| r.order_type == OrderType::Market)
            .collect();
        assert_eq!(unwinds.len(), 3);
        assert!(unwinds.iter().all(|r| r.action == Action::Sell && r.count == 3));

        let events = drain(&mut h.fill_rx).await;
        for e in &events {
            h.governor.apply_fill(e).unwrap();
        }
        // Every leg nets to the common fill of 7.
        for t in ["P_1", "P_3", "P_4"] {
            assert_eq!(h.governor.position(t).unwrap().net_contracts, 7);
        }
        assert_eq!(h.governor.position("P_2").unwrap().net_contracts, 7);
    }

    #[tokio::test]
    async fn partition_unwind_capped_by_max_loss() {
        let exchange = Arc::new(MockExchange::new());
        exchange.plan("P_2", 1, 7);
        let governor = Arc::new(RiskGovernor::new(limits(), 1_000_000));
        let (fill_tx, _fill_rx) = mpsc::channel(64);
        let mut k = knobs();
        // Ceiling affords only floor(6 / 3) = 2 contracts per unwind.
        k.max_unwind_loss_cents = 6;
        let engine = ExecutionEngine::new(
            exchange.clone(),
            governor.clone(),
            FeeSchedule::flat(2),
            fill_tx,
            Arc::new(Alerts::new()),
            k,
        );
        let opp = admitted_partition(&governor, 10);

        let report = engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Partial);
        let unwinds: Vec<OrderRequest> = exchange
            .placed()
            .into_iter()
            .filter(|r| r.order_type == OrderType::Market)
            .collect();
        assert!(unwinds.iter().all(|r| r.count == 2));
    }

    #[tokio::test]
    async fn idempotency_key_reuse_never_duplicates() {
        let h = harness();
        let request = OrderRequest {
            ticker: "JUN".to_string(),
            action: Action::Buy,
            side: Side::Yes,
            order_type: OrderType::Limit,
            count: 10,
            limit_price_cents: Some(52),
            expiration_ts: None,
            idempotency_key: "opp-1:0:0".to_string(),
        };
        let first = h.exchange.place_order(&request).await.unwrap();
        let second = h.exchange.place_order(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.exchange.placed().len(), 1);
    }

    #[tokio::test]
    async fn orphan_tracked_when_cancel_fails() {
        let mut h = harness();
        h.exchange.plan("JUN", u32::MAX, 0);
        // ord-1 will be leg 1's order; make its cancels fail.
        h.exchange.state.lock().cancel_fails.push("ord-1".to_string());
        let opp = admitted_two_leg(&h.governor, 10);

        let report = h.engine.execute(opp, false).await;
        assert_eq!(report.state, OppState::Failed);
        let orphans = h.engine.orphan_orders();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].order_id, "ord-1");
        assert!(drain(&mut h.fill_rx).await.is_empty());
    }

    #[tokio::test]
    async fn dry_run_is_synthetic_only() {
        let mut h = harness();
        let opp = admitted_two_leg(&h.governor, 10);

        let report = h.engine.execute(opp, true).await;
        assert_eq!(report.state, OppState::Filled);
        // Nothing touched the exchange.
        assert!(h.exchange.placed().is_empty());

        let events = drain(&mut h.fill_rx).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.synthetic));
        for e in &events {
            h.governor.apply_fill(e).unwrap();
        }
        // Real book untouched; shadow ledger recorded both fills.
        assert!(h.governor.position("JUN").is_none());
        assert_eq!(h.governor.snapshot().shadow_fill_count, 2);
    }

    #[tokio::test]
    async fn force_flat_places_market_order() {
        let mut h = harness();
        let flattened = h.engine.flatten_position("JUN", 6).await;
        assert_eq!(flattened, 6);

        let placed = h.exchange.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].order_type, OrderType::Market);
        assert_eq!(placed[0].action, Action::Sell);
        assert_eq!(placed[0].count, 6);

        let events = drain(&mut h.fill_rx).await;
        assert_eq!(events.len(), 1);
    }
}
