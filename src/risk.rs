// =============================================================================
// Risk Governor — global trading invariants gating every execution
// =============================================================================
//
// Admission checks, in order:
//   1. Kill switch engaged                      -> KILL_SWITCH
//   2. Daily P&L at or below -max_daily_loss    -> DAILY_LOSS_CAP
//   3. Open-opportunity count at cap            -> POSITION_CAP
//   4. Any leg breaching per-market net cap     -> PER_MARKET_CAP
//   5. Implication blocked by policy            -> POLICY_BLOCK
//   6. Sizing yields fewer than one contract    -> TOO_SMALL
//
// Positions are updated only by confirmed fill events, never by optimistic
// intent.  A daily-loss breach atomically engages the kill switch and
// broadcasts cancellation to every worker.  Daily counters reset when the
// UTC date rolls over.
//
// Dry-run fills (synthetic) are applied to a shadow ledger so that the real
// position book and P&L stay untouched while the full admission and sizing
// path still runs.
// =============================================================================

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::market_cache::MarketCache;
use crate::opportunity::{Leg, OppState, Opportunity};
use crate::runtime_config::RuntimeConfig;
use crate::types::{leg_delta, Action, MarketStatus, Side};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Why an opportunity was refused admission.  Never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    KillSwitch,
    DailyLossCap,
    PositionCap,
    PerMarketCap,
    PolicyBlock,
    TooSmall,
    Expired,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::KillSwitch => "KILL_SWITCH",
            Self::DailyLossCap => "DAILY_LOSS_CAP",
            Self::PositionCap => "POSITION_CAP",
            Self::PerMarketCap => "PER_MARKET_CAP",
            Self::PolicyBlock => "POLICY_BLOCK",
            Self::TooSmall => "TOO_SMALL",
            Self::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

/// Per-ticker position, in signed YES-equivalent contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub net_contracts: i64,
    /// Average entry price of the open quantity, cents.
    pub avg_entry_price: f64,
    pub realized_pnl: i64,
    pub unrealized_pnl: i64,
}

/// A confirmed (or synthetic, in dry-run) fill reported by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub opportunity_id: String,
    pub order_id: String,
    pub ticker: String,
    pub side: Side,
    pub action: Action,
    pub count: u32,
    /// Actual average fill price, cents.
    pub price: i64,
    /// Estimated fees paid on this fill, cents.
    pub fee_paid: i64,
    /// What was submitted to the exchange; a fill above this is impossible.
    pub submitted_count: u32,
    pub synthetic: bool,
}

/// Serialisable snapshot of the governor for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub kill_switch: bool,
    pub balance_cents: i64,
    pub realized_today_cents: i64,
    pub unrealized_cents: i64,
    pub open_opportunities: usize,
    pub positions: Vec<Position>,
    pub shadow_fill_count: usize,
    pub current_date: String,
}

/// Configuration limits supplied at construction time.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_risk_per_trade_pct: f64,
    pub max_daily_loss_cents: i64,
    pub max_open_positions: u32,
    pub max_contracts_per_trade: u32,
    pub max_contracts_per_market: i64,
    pub require_human_for_implication: bool,
}

impl RiskLimits {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            max_risk_per_trade_pct: cfg.max_risk_per_trade_pct,
            max_daily_loss_cents: cfg.max_daily_loss_cents,
            max_open_positions: cfg.max_open_positions,
            max_contracts_per_trade: cfg.max_contracts_per_trade,
            max_contracts_per_market: cfg.max_contracts_per_market,
            require_human_for_implication: cfg.require_human_for_implication,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    kill_switch: bool,
    balance_cents: i64,
    realized_today: i64,
    unrealized: i64,
    positions: HashMap<String, Position>,
    /// Opportunities admitted and not yet terminal.
    open_opportunities: HashSet<String>,
    /// Signed exposure reserved by admitted-but-unfilled opportunities,
    /// keyed by ticker.  Deduplicates overlapping THRESHOLD pairs against
    /// the per-market cap.
    reserved: HashMap<String, i64>,
    /// Dry-run shadow book; never feeds the real ledger.
    shadow_positions: HashMap<String, Position>,
    shadow_realized: i64,
    shadow_fill_count: usize,
    current_date: String,
}

// ---------------------------------------------------------------------------
// Risk Governor
// ---------------------------------------------------------------------------

pub struct RiskGovernor {
    state: RwLock<Inner>,
    limits: RiskLimits,
    /// Broadcast fired on kill-switch engagement; workers cancel
    /// cooperatively at their next suspension point.
    cancel_tx: broadcast::Sender<()>,
}

impl RiskGovernor {
    pub fn new(limits: RiskLimits, starting_balance_cents: i64) -> Self {
        let (cancel_tx, _) = broadcast::channel(8);
        let today = Utc::now().format("%Y-%m-%d").to_string();

        info!(
            starting_balance_cents,
            max_daily_loss_cents = limits.max_daily_loss_cents,
            max_open_positions = limits.max_open_positions,
            max_contracts_per_trade = limits.max_contracts_per_trade,
            max_contracts_per_market = limits.max_contracts_per_market,
            "RiskGovernor initialised"
        );

        Self {
            state: RwLock::new(Inner {
                kill_switch: false,
                balance_cents: starting_balance_cents,
                realized_today: 0,
                unrealized: 0,
                positions: HashMap::new(),
                open_opportunities: HashSet::new(),
                reserved: HashMap::new(),
                shadow_positions: HashMap::new(),
                shadow_realized: 0,
                shadow_fill_count: 0,
                current_date: today,
            }),
            limits,
            cancel_tx,
        }
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Gate an opportunity against the global invariants and size it.
    ///
    /// On success the opportunity transitions to VALIDATED with a final
    /// `desired_count` and its leg exposure reserved; on refusal it is
    /// terminally REJECTED (or EXPIRED) with the reason attached.
    pub fn admit(
        &self,
        opp: &mut Opportunity,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), RejectReason> {
        self.maybe_reset_daily();

        if opp.is_expired(now) {
            let _ = opp.finish(OppState::Expired, RejectReason::Expired.to_string());
            debug!(id = %opp.id, "opportunity expired at admission");
            return Err(RejectReason::Expired);
        }

        let mut s = self.state.write();

        let reject = |opp: &mut Opportunity, reason: RejectReason| -> Result<(), RejectReason> {
            let _ = opp.finish(OppState::Rejected, reason.to_string());
            warn!(id = %opp.id, %reason, signal = %opp.signal, "opportunity rejected");
            Err(reason)
        };

        // 1. Kill switch.
        if s.kill_switch {
            return reject(opp, RejectReason::KillSwitch);
        }

        // 2. Daily loss cap.
        if s.realized_today + s.unrealized <= -self.limits.max_daily_loss_cents {
            return reject(opp, RejectReason::DailyLossCap);
        }

        // 3. Open-opportunity cap.
        if s.open_opportunities.len() as u32 >= self.limits.max_open_positions {
            return reject(opp, RejectReason::PositionCap);
        }

        // 4. Per-market net cap, counting exposure already reserved by
        //    other admitted opportunities.
        for leg in &opp.legs {
            let current = s
                .positions
                .get(&leg.ticker)
                .map(|p| p.net_contracts)
                .unwrap_or(0);
            let reserved = s.reserved.get(&leg.ticker).copied().unwrap_or(0);
            let delta = leg_delta(leg.side, leg.action, opp.desired_count);
            if (current + reserved + delta).abs() > self.limits.max_contracts_per_market {
                return reject(opp, RejectReason::PerMarketCap);
            }
        }

        // 5. Implication policy.
        if opp.probabilistic && self.limits.require_human_for_implication {
            return reject(opp, RejectReason::PolicyBlock);
        }

        // 6. Sizing.
        let sized = Self::size(
            &self.limits,
            s.balance_cents,
            opp.max_loss_per_contract(),
            opp.min_leg_depth(),
        );

        // 7. Too small.
        if sized < 1 {
            return reject(opp, RejectReason::TooSmall);
        }

        let final_count = sized.min(opp.desired_count.max(1));
        opp.desired_count = final_count;
        opp.liquidity_factor =
            (opp.min_leg_depth() as f64 / final_count as f64).clamp(0.0, 1.0);
        opp.score = opp.net_magnitude as f64 * opp.confidence * opp.liquidity_factor;

        if opp.advance(OppState::Validated).is_err() {
            // Already past DETECTED: refuse double admission.
            return Err(RejectReason::Expired);
        }

        s.open_opportunities.insert(opp.id.clone());
        for leg in &opp.legs {
            let delta = leg_delta(leg.side, leg.action, final_count);
            *s.reserved.entry(leg.ticker.clone()).or_insert(0) += delta;
        }

        info!(
            id = %opp.id,
            signal = %opp.signal,
            desired_count = final_count,
            score = opp.score,
            "opportunity admitted"
        );
        Ok(())
    }

    /// The sizing oracle, also consulted by the detector at emission time.
    pub fn size_for(&self, legs: &[Leg]) -> u32 {
        let s = self.state.read();
        let max_loss = legs
            .iter()
            .map(Leg::max_loss_per_contract)
            .max()
            .unwrap_or(100);
        let min_depth = legs.iter().map(|l| l.observed_depth).min().unwrap_or(0);
        Self::size(&self.limits, s.balance_cents, max_loss, min_depth)
    }

    fn size(limits: &RiskLimits, balance_cents: i64, max_loss_per_contract: i64, min_depth: u32) -> u32 {
        if max_loss_per_contract <= 0 {
            return 0;
        }
        let risk_budget = limits.max_risk_per_trade_pct / 100.0 * balance_cents as f64;
        let by_risk = (risk_budget / max_loss_per_contract as f64).floor() as i64;
        by_risk
            .min(min_depth as i64)
            .min(limits.max_contracts_per_trade as i64)
            .max(0) as u32
    }

    /// Release an opportunity's reservation once it reaches a terminal state.
    pub fn release(&self, opp: &Opportunity) {
        let mut s = self.state.write();
        if !s.open_opportunities.remove(&opp.id) {
            return;
        }
        for leg in &opp.legs {
            let delta = leg_delta(leg.side, leg.action, opp.desired_count);
            if let Some(r) = s.reserved.get_mut(&leg.ticker) {
                *r -= delta;
                if *r == 0 {
                    s.reserved.remove(&leg.ticker);
                }
            }
        }
        debug!(id = %opp.id, state = %opp.state, "opportunity released");
    }

    // -------------------------------------------------------------------------
    // Fill reconciliation
    // -------------------------------------------------------------------------

    /// Apply one confirmed fill event.
    ///
    /// A fill exceeding its submitted count is an impossible state: the
    /// kill switch engages and the error propagates.
    pub fn apply_fill(&self, fill: &FillEvent) -> Result<()> {
        self.maybe_reset_daily();

        if fill.count > fill.submitted_count {
            self.engage_kill_switch("fill exceeds submitted count");
            bail!(
                "invariant violation: fill {} exceeds submitted {} on {}",
                fill.count,
                fill.submitted_count,
                fill.ticker
            );
        }
        if fill.count == 0 {
            return Ok(());
        }

        let delta = leg_delta(fill.side, fill.action, fill.count);
        let mut s = self.state.write();

        if fill.synthetic {
            let realized = apply_to_book(&mut s.shadow_positions, &fill.ticker, delta, fill.price);
            s.shadow_realized += realized - fill.fee_paid;
            s.shadow_fill_count += 1;
            debug!(
                ticker = %fill.ticker,
                delta,
                price = fill.price,
                shadow_realized = s.shadow_realized,
                "synthetic fill applied to shadow ledger"
            );
            return Ok(());
        }

        let realized = apply_to_book(&mut s.positions, &fill.ticker, delta, fill.price);
        s.realized_today += realized - fill.fee_paid;

        // Cash flow: buys debit, sells credit; fees always debit.
        let notional = fill.price * fill.count as i64;
        match fill.action {
            Action::Buy => s.balance_cents -= notional,
            Action::Sell => s.balance_cents += notional,
        }
        s.balance_cents -= fill.fee_paid;

        debug!(
            ticker = %fill.ticker,
            delta,
            price = fill.price,
            realized_delta = realized - fill.fee_paid,
            realized_today = s.realized_today,
            "fill applied"
        );

        let breached = s.realized_today + s.unrealized <= -self.limits.max_daily_loss_cents;
        drop(s);
        if breached {
            self.engage_kill_switch("daily loss cap breached");
        }
        Ok(())
    }

    /// Recompute unrealised P&L from live quotes, then re-check the
    /// daily-loss circuit breaker.
    pub fn mark_to_market(&self, cache: &MarketCache) {
        let mut s = self.state.write();
        let mut total = 0i64;
        for pos in s.positions.values_mut() {
            if pos.net_contracts == 0 {
                pos.unrealized_pnl = 0;
                continue;
            }
            if let Ok(market) = cache.get(&pos.ticker) {
                if market.status == MarketStatus::Open {
                    let mid = market.quote.yes_mid() as f64;
                    pos.unrealized_pnl =
                        ((mid - pos.avg_entry_price) * pos.net_contracts as f64) as i64;
                }
            }
            total += pos.unrealized_pnl;
        }
        s.unrealized = total;

        let breached = s.realized_today + s.unrealized <= -self.limits.max_daily_loss_cents;
        drop(s);
        if breached && !self.kill_switch() {
            self.engage_kill_switch("daily loss cap breached on mark-to-market");
        }
    }

    // -------------------------------------------------------------------------
    // Kill switch
    // -------------------------------------------------------------------------

    pub fn kill_switch(&self) -> bool {
        self.state.read().kill_switch
    }

    /// Engage the global halt and broadcast cancellation.
    pub fn engage_kill_switch(&self, why: &str) {
        let mut s = self.state.write();
        if s.kill_switch {
            return;
        }
        s.kill_switch = true;
        drop(s);
        warn!(why, "kill switch engaged — halting admissions, cancelling in-flight work");
        let _ = self.cancel_tx.send(());
    }

    /// Clear the halt (operator action).  Daily counters are not reset.
    pub fn disengage_kill_switch(&self) {
        let mut s = self.state.write();
        if s.kill_switch {
            s.kill_switch = false;
            info!("kill switch disengaged");
        }
    }

    /// Directional unwinds skip the admission gauntlet but still respect
    /// the kill switch.
    pub fn allow_unwind(&self) -> bool {
        !self.kill_switch()
    }

    pub fn subscribe_cancel(&self) -> broadcast::Receiver<()> {
        self.cancel_tx.subscribe()
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn position(&self, ticker: &str) -> Option<Position> {
        self.state.read().positions.get(ticker).cloned()
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut all: Vec<Position> = self.state.read().positions.values().cloned().collect();
        all.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        all
    }

    pub fn balance_cents(&self) -> i64 {
        self.state.read().balance_cents
    }

    pub fn open_opportunity_count(&self) -> usize {
        self.state.read().open_opportunities.len()
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        self.maybe_reset_daily();
        let s = self.state.read();
        let mut positions: Vec<Position> = s.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        RiskSnapshot {
            kill_switch: s.kill_switch,
            balance_cents: s.balance_cents,
            realized_today_cents: s.realized_today,
            unrealized_cents: s.unrealized,
            open_opportunities: s.open_opportunities.len(),
            positions,
            shadow_fill_count: s.shadow_fill_count,
            current_date: s.current_date.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Daily reset
    // -------------------------------------------------------------------------

    /// If the calendar date has changed since the last check, reset the
    /// daily counters automatically.  The kill switch survives resets.
    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        // Double-check after acquiring the write lock.
        if s.current_date != today {
            info!(
                old_date = %s.current_date,
                new_date = %today,
                "date rolled — resetting daily loss counter"
            );
            s.realized_today = 0;
            s.current_date = today;
        }
    }
}

impl std::fmt::Debug for RiskGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGovernor")
            .field("limits", &self.limits)
            .field("kill_switch", &self.kill_switch())
            .finish()
    }
}

/// Apply a signed fill to a position book; returns realised P&L in cents
/// (before fees).
fn apply_to_book(
    book: &mut HashMap<String, Position>,
    ticker: &str,
    delta: i64,
    price: i64,
) -> i64 {
    let pos = book.entry(ticker.to_string()).or_insert_with(|| Position {
        ticker: ticker.to_string(),
        net_contracts: 0,
        avg_entry_price: 0.0,
        realized_pnl: 0,
        unrealized_pnl: 0,
    });

    let net = pos.net_contracts;
    let mut realized = 0i64;

    if net == 0 || net.signum() == delta.signum() {
        // Extending: weighted-average entry.
        let total = net.abs() + delta.abs();
        pos.avg_entry_price =
            (pos.avg_entry_price * net.abs() as f64 + price as f64 * delta.abs() as f64)
                / total as f64;
        pos.net_contracts = net + delta;
    } else {
        // Reducing or flipping: realise on the matched quantity.
        let matched = net.abs().min(delta.abs());
        realized = if net > 0 {
            ((price as f64 - pos.avg_entry_price) * matched as f64) as i64
        } else {
            ((pos.avg_entry_price - price as f64) * matched as f64) as i64
        };
        pos.net_contracts = net + delta;
        if pos.net_contracts.signum() == delta.signum() && pos.net_contracts != 0 {
            // Flipped through zero; remainder opens at the fill price.
            pos.avg_entry_price = price as f64;
        } else if pos.net_contracts == 0 {
            pos.avg_entry_price = 0.0;
        }
    }
    pos.realized_pnl += realized;
    realized
}
