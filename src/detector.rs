// =============================================================================
// Violation Detector — turns live prices into scored, time-bounded trades
// =============================================================================
//
// Per cycle: join the market cache and the relationship catalog, evaluate
// every active constraint against an atomic price view of its tickers, and
// emit opportunities that clear the fee gate and the score floor.
//
// All prices are integer cents.  Edge is the violation magnitude per unit
// contract, per variant:
//
//   SUBSET(a, b)        yes_ask(a) > yes_bid(b)
//                         edge = yes_ask(a) - yes_bid(b)
//   THRESHOLD adjacent  yes_ask(t[i+1]) > yes_bid(t[i])
//                         edge = yes_ask(t[i+1]) - yes_bid(t[i])
//   PARTITION           sum(yes_ask) < 100 - eps  -> BUY_ALL
//                       sum(yes_bid) > 100 + eps  -> SELL_ALL
//   IMPLICATION         yes_bid(if) - yes_ask(then) > soft threshold,
//                       only when kappa >= kappa_floor
//
// Emission gate: raw_edge >= fee_safety_multiplier * per-unit fee estimate,
// and positive net magnitude.  Given identical price views and catalog the
// scan is deterministic in output set and ordering.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace};

use crate::catalog::{Catalog, Relationship, RelationshipKind};
use crate::fees::FeeSchedule;
use crate::market_cache::{MarketCache, PriceView};
use crate::opportunity::{Leg, Opportunity, Signal};
use crate::risk::RiskGovernor;
use crate::runtime_config::RuntimeConfig;
use crate::types::{Action, Side};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Detection thresholds, frozen per scan cycle from the runtime config.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub min_score_threshold: f64,
    pub fee_safety_multiplier: f64,
    pub opportunity_ttl: Duration,
    pub kappa_floor: f64,
    pub implication_soft_threshold: i64,
    pub partition_epsilon_cents: i64,
}

impl DetectorSettings {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            min_score_threshold: cfg.min_score_threshold,
            fee_safety_multiplier: cfg.fee_safety_multiplier,
            opportunity_ttl: Duration::seconds(cfg.opportunity_ttl_seconds as i64),
            kappa_floor: cfg.kappa_floor,
            implication_soft_threshold: cfg.implication_soft_threshold,
            partition_epsilon_cents: cfg.partition_epsilon_cents,
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct Detector {
    settings: DetectorSettings,
    fees: FeeSchedule,
}

/// A raw violation before sizing, fees, and scoring.
struct Candidate {
    signal: Signal,
    legs: Vec<Leg>,
    raw_edge: i64,
    probabilistic: bool,
}

impl Detector {
    pub fn new(settings: DetectorSettings, fees: FeeSchedule) -> Self {
        Self { settings, fees }
    }

    /// One detection cycle over every active relationship.
    pub fn scan(
        &self,
        now: DateTime<Utc>,
        cache: &MarketCache,
        catalog: &Catalog,
        governor: &RiskGovernor,
    ) -> Vec<Opportunity> {
        let active = catalog.active(cache);
        let mut out = Vec::new();

        for rel in &active {
            let tickers = rel.kind.tickers();
            let view = match cache.price_view(&tickers) {
                Ok(v) => v,
                Err(e) => {
                    debug!(id = %rel.id, error = %e, "skipping relationship without live prices");
                    continue;
                }
            };

            for candidate in self.evaluate(rel, &view) {
                if let Some(opp) = self.assemble(rel, candidate, governor, now) {
                    out.push(opp);
                }
            }
        }

        // Deterministic ordering: relationship id, then signal, then the
        // leading leg (disambiguates multiple pairs of one THRESHOLD).
        out.sort_by(|a, b| {
            (&a.relationship_id, a.signal, &a.legs[0].ticker).cmp(&(
                &b.relationship_id,
                b.signal,
                &b.legs[0].ticker,
            ))
        });

        debug!(
            active_relationships = active.len(),
            emitted = out.len(),
            "detector scan complete"
        );
        out
    }

    // -------------------------------------------------------------------------
    // Per-variant rules
    // -------------------------------------------------------------------------

    fn evaluate(&self, rel: &Relationship, view: &PriceView) -> Vec<Candidate> {
        match &rel.kind {
            RelationshipKind::Subset { subset, superset } => {
                self.detect_subset(view, subset, superset)
            }
            RelationshipKind::Threshold { tickers } => self.detect_threshold(view, tickers),
            RelationshipKind::Partition { tickers } => self.detect_partition(view, tickers),
            RelationshipKind::Implication {
                if_ticker,
                then_ticker,
                kappa,
            } => self.detect_implication(view, if_ticker, then_ticker, *kappa),
        }
    }

    /// P(subset) <= P(superset) must hold; a crossed book violates it.
    fn detect_subset(&self, view: &PriceView, subset: &str, superset: &str) -> Vec<Candidate> {
        let (Some(sub), Some(sup)) = (view.get(subset), view.get(superset)) else {
            return Vec::new();
        };

        let edge = sub.quote.yes_ask - sup.quote.yes_bid;
        if edge <= 0 {
            return Vec::new();
        }

        let legs = order_two_legs(
            buy_yes(superset, sup.quote.yes_ask, sup.yes_depth),
            sell_yes(subset, sub.quote.yes_bid, sub.yes_depth),
        );
        vec![Candidate {
            signal: Signal::BuySupersetSellSubset,
            legs,
            raw_edge: edge,
            probabilistic: false,
        }]
    }

    /// Prices must be non-increasing along ascending strikes; each adjacent
    /// inversion is an independent opportunity.
    fn detect_threshold(&self, view: &PriceView, tickers: &[String]) -> Vec<Candidate> {
        let mut found = Vec::new();
        for pair in tickers.windows(2) {
            let (Some(low), Some(high)) = (view.get(&pair[0]), view.get(&pair[1])) else {
                continue;
            };
            let edge = high.quote.yes_ask - low.quote.yes_bid;
            if high.quote.yes_ask <= low.quote.yes_bid || edge <= 0 {
                continue;
            }
            let legs = order_two_legs(
                buy_yes(&pair[0], low.quote.yes_ask, low.yes_depth),
                sell_yes(&pair[1], high.quote.yes_bid, high.yes_depth),
            );
            found.push(Candidate {
                signal: Signal::BuyLowerSellUpper,
                legs,
                raw_edge: edge,
                probabilistic: false,
            });
        }
        found
    }

    /// Exhaustive outcomes must price to 100 within epsilon.
    fn detect_partition(&self, view: &PriceView, tickers: &[String]) -> Vec<Candidate> {
        let mut members = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            match view.get(ticker) {
                Some(m) => members.push((ticker.as_str(), m.quote, m.yes_depth)),
                None => return Vec::new(),
            }
        }
        let s_ask: i64 = members.iter().map(|(_, q, _)| q.yes_ask).sum();
        let s_bid: i64 = members.iter().map(|(_, q, _)| q.yes_bid).sum();

        let eps = self.settings.partition_epsilon_cents;
        if s_ask < 100 - eps {
            let legs = members
                .iter()
                .map(|(t, q, d)| buy_yes(t, q.yes_ask, *d))
                .collect();
            return vec![Candidate {
                signal: Signal::BuyAll,
                legs,
                raw_edge: 100 - s_ask,
                probabilistic: false,
            }];
        }
        if s_bid > 100 + eps {
            let legs = members
                .iter()
                .map(|(t, q, d)| sell_yes(t, q.yes_bid, *d))
                .collect();
            return vec![Candidate {
                signal: Signal::SellAll,
                legs,
                raw_edge: s_bid - 100,
                probabilistic: false,
            }];
        }
        Vec::new()
    }

    /// Soft constraint: only evaluated at high conditional probability, and
    /// only past the configured spread threshold.
    fn detect_implication(
        &self,
        view: &PriceView,
        if_ticker: &str,
        then_ticker: &str,
        kappa: f64,
    ) -> Vec<Candidate> {
        if kappa < self.settings.kappa_floor {
            trace!(if_ticker, then_ticker, kappa, "implication below kappa floor");
            return Vec::new();
        }
        let (Some(m_if), Some(m_then)) = (view.get(if_ticker), view.get(then_ticker)) else {
            return Vec::new();
        };

        let edge = m_if.quote.yes_bid - m_then.quote.yes_ask;
        if edge <= self.settings.implication_soft_threshold {
            return Vec::new();
        }

        let legs = order_two_legs(
            buy_yes(then_ticker, m_then.quote.yes_ask, m_then.yes_depth),
            sell_yes(if_ticker, m_if.quote.yes_bid, m_if.yes_depth),
        );
        vec![Candidate {
            signal: Signal::BuyThenSellIf,
            legs,
            raw_edge: edge,
            probabilistic: true,
        }]
    }

    // -------------------------------------------------------------------------
    // Sizing, fees, scoring
    // -------------------------------------------------------------------------

    fn assemble(
        &self,
        rel: &Relationship,
        candidate: Candidate,
        governor: &RiskGovernor,
        now: DateTime<Utc>,
    ) -> Option<Opportunity> {
        let desired = governor.size_for(&candidate.legs);
        if desired == 0 {
            trace!(id = %rel.id, "candidate sized to zero");
            return None;
        }

        let fee_unit = self.fees.per_unit(&candidate.legs);
        let net = candidate.raw_edge - fee_unit;
        if (candidate.raw_edge as f64) < self.settings.fee_safety_multiplier * fee_unit as f64
            || net <= 0
        {
            trace!(
                id = %rel.id,
                raw_edge = candidate.raw_edge,
                fee_unit,
                "candidate suppressed by fee gate"
            );
            return None;
        }

        let opp = Opportunity::new(
            &rel.id,
            candidate.signal,
            candidate.legs,
            candidate.raw_edge,
            fee_unit,
            rel.confidence,
            desired,
            candidate.probabilistic,
            now,
            now + self.settings.opportunity_ttl,
        );

        if opp.score < self.settings.min_score_threshold {
            trace!(id = %rel.id, score = opp.score, "candidate below score floor");
            return None;
        }
        Some(opp)
    }
}

// ---------------------------------------------------------------------------
// Leg helpers
// ---------------------------------------------------------------------------

fn buy_yes(ticker: &str, ask: i64, depth: u32) -> Leg {
    Leg {
        ticker: ticker.to_string(),
        side: Side::Yes,
        action: Action::Buy,
        limit_price: ask,
        observed_depth: depth,
    }
}

fn sell_yes(ticker: &str, bid: i64, depth: u32) -> Leg {
    Leg {
        ticker: ticker.to_string(),
        side: Side::Yes,
        action: Action::Sell,
        limit_price: bid,
        observed_depth: depth,
    }
}

/// Two-leg trades execute the less liquid leg first.
fn order_two_legs(a: Leg, b: Leg) -> Vec<Leg> {
    if b.observed_depth < a.observed_depth {
        vec![b, a]
    } else {
        vec![a, b]
    }
}
