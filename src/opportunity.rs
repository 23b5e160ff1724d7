// =============================================================================
// Opportunity — a detected constraint violation and its lifecycle
// =============================================================================
//
// Life-cycle:
//   Detected  ->  Validated  ->  Executing  ->  Filled | Partial | Failed
//   Detected  ->  Expired | Rejected
//   Validated ->  Rejected | Expired
//
// Transitions are irreversible and enforced by `advance`; terminal states
// never move again.  This keeps admission, execution, and termination
// auditable and prevents double-execution.
// =============================================================================

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Action, Side};

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// What trade the violation implies.  Ordering is used for deterministic
/// scan output.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Signal {
    BuySupersetSellSubset,
    BuyLowerSellUpper,
    BuyAll,
    SellAll,
    BuyThenSellIf,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BuySupersetSellSubset => "BUY_SUPERSET_SELL_SUBSET",
            Self::BuyLowerSellUpper => "BUY_LOWER_SELL_UPPER",
            Self::BuyAll => "BUY_ALL",
            Self::SellAll => "SELL_ALL",
            Self::BuyThenSellIf => "BUY_THEN_SELL_IF",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Leg
// ---------------------------------------------------------------------------

/// One order of a multi-leg trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub ticker: String,
    pub side: Side,
    pub action: Action,
    /// Executable price at detection time (buy at ask, sell at bid), cents.
    pub limit_price: i64,
    /// Visible top-of-book size on this leg's side at detection time.
    pub observed_depth: u32,
}

impl Leg {
    /// Worst-case loss per contract if only this leg fills, in cents.
    pub fn max_loss_per_contract(&self) -> i64 {
        match self.action {
            Action::Buy => self.limit_price,
            Action::Sell => 100 - self.limit_price,
        }
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OppState {
    Detected,
    Validated,
    Executing,
    Filled,
    Partial,
    Failed,
    Expired,
    Rejected,
}

impl OppState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Partial | Self::Failed | Self::Expired | Self::Rejected
        )
    }

    /// Legal forward edges of the lifecycle.
    fn can_advance(self, next: OppState) -> bool {
        use OppState::*;
        matches!(
            (self, next),
            (Detected, Validated)
                | (Detected, Expired)
                | (Detected, Rejected)
                | (Validated, Executing)
                | (Validated, Rejected)
                | (Validated, Expired)
                | (Executing, Filled)
                | (Executing, Partial)
                | (Executing, Failed)
                | (Executing, Rejected)
        )
    }
}

impl std::fmt::Display for OppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Detected => "DETECTED",
            Self::Validated => "VALIDATED",
            Self::Executing => "EXECUTING",
            Self::Filled => "FILLED",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
            Self::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Opportunity
// ---------------------------------------------------------------------------

/// A detected constraint violation, owned by the detector until admitted to
/// execution, which then owns it through terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub relationship_id: String,
    pub signal: Signal,
    /// Ordered legs; two-leg variants place index 0 first.
    pub legs: Vec<Leg>,
    /// Gross violation magnitude per unit contract, cents.
    pub raw_edge: i64,
    /// Estimated fees per unit contract, summed across legs, cents.
    pub fee_estimate: i64,
    /// `raw_edge - fee_estimate`, cents.
    pub net_magnitude: i64,
    /// Catalog curator's certainty in the underlying relationship.
    pub confidence: f64,
    /// `min(depth over legs) / desired_count`, clamped to [0, 1].
    pub liquidity_factor: f64,
    /// `net_magnitude * confidence * liquidity_factor`.
    pub score: f64,
    pub desired_count: u32,
    /// Set for IMPLICATION-derived opportunities; admission may block them.
    pub probabilistic: bool,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: OppState,
    /// Detail attached when the lifecycle ends abnormally.
    pub terminal_note: Option<String>,
}

impl Opportunity {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        relationship_id: &str,
        signal: Signal,
        legs: Vec<Leg>,
        raw_edge: i64,
        fee_estimate: i64,
        confidence: f64,
        desired_count: u32,
        probabilistic: bool,
        detected_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let net_magnitude = raw_edge - fee_estimate;
        let min_depth = legs.iter().map(|l| l.observed_depth).min().unwrap_or(0);
        let liquidity_factor = if desired_count == 0 {
            0.0
        } else {
            (min_depth as f64 / desired_count as f64).clamp(0.0, 1.0)
        };
        let score = net_magnitude as f64 * confidence * liquidity_factor;

        Self {
            id: Uuid::new_v4().to_string(),
            relationship_id: relationship_id.to_string(),
            signal,
            legs,
            raw_edge,
            fee_estimate,
            net_magnitude,
            confidence,
            liquidity_factor,
            score,
            desired_count,
            probabilistic,
            detected_at,
            expires_at,
            state: OppState::Detected,
            terminal_note: None,
        }
    }

    /// Move the lifecycle forward.  Illegal transitions are an error and
    /// leave the state untouched.
    pub fn advance(&mut self, next: OppState) -> Result<()> {
        if !self.state.can_advance(next) {
            bail!(
                "illegal opportunity transition {} -> {} (id {})",
                self.state,
                next,
                self.id
            );
        }
        self.state = next;
        Ok(())
    }

    /// Terminal transition with an attached note.
    pub fn finish(&mut self, next: OppState, note: impl Into<String>) -> Result<()> {
        self.advance(next)?;
        self.terminal_note = Some(note.into());
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Smallest observed depth across legs.
    pub fn min_leg_depth(&self) -> u32 {
        self.legs.iter().map(|l| l.observed_depth).min().unwrap_or(0)
    }

    /// Worst-case per-contract loss across legs, used by sizing.
    pub fn max_loss_per_contract(&self) -> i64 {
        self.legs
            .iter()
            .map(Leg::max_loss_per_contract)
            .max()
            .unwrap_or(100)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn leg(ticker: &str, action: Action, limit: i64, depth: u32) -> Leg {
        Leg {
            ticker: ticker.to_string(),
            side: Side::Yes,
            action,
            limit_price: limit,
            observed_depth: depth,
        }
    }

    fn opp() -> Opportunity {
        let now = Utc::now();
        Opportunity::new(
            "rel-1",
            Signal::BuySupersetSellSubset,
            vec![
                leg("JUN", Action::Buy, 52, 15),
                leg("MAR", Action::Sell, 58, 20),
            ],
            10,
            4,
            0.95,
            10,
            false,
            now,
            now + Duration::seconds(15),
        )
    }

    #[test]
    fn happy_path_transitions() {
        let mut o = opp();
        o.advance(OppState::Validated).unwrap();
        o.advance(OppState::Executing).unwrap();
        o.advance(OppState::Filled).unwrap();
        assert!(o.state.is_terminal());
    }

    #[test]
    fn terminal_states_never_move_again() {
        let mut o = opp();
        o.advance(OppState::Expired).unwrap();
        assert!(o.advance(OppState::Validated).is_err());
        assert!(o.advance(OppState::Executing).is_err());
        assert_eq!(o.state, OppState::Expired);
    }

    #[test]
    fn no_backward_or_skipping_transitions() {
        let mut o = opp();
        // Cannot execute without admission.
        assert!(o.advance(OppState::Executing).is_err());
        o.advance(OppState::Validated).unwrap();
        // Cannot return to detected.
        assert!(o.advance(OppState::Detected).is_err());
        o.advance(OppState::Executing).unwrap();
        // Executing resolves terminally, never back to admission states.
        assert!(o.advance(OppState::Validated).is_err());
        assert!(o.advance(OppState::Detected).is_err());
    }

    #[test]
    fn derived_fields_computed_at_construction() {
        let o = opp();
        assert_eq!(o.net_magnitude, 6);
        // min depth 15 / desired 10 clamps to 1.0
        assert!((o.liquidity_factor - 1.0).abs() < f64::EPSILON);
        assert!((o.score - 6.0 * 0.95).abs() < 1e-9);
        assert_eq!(o.max_loss_per_contract(), 52);
    }

    #[test]
    fn expiry_is_ttl_based() {
        let o = opp();
        assert!(!o.is_expired(o.detected_at));
        assert!(o.is_expired(o.expires_at + Duration::seconds(1)));
    }

    #[test]
    fn finish_attaches_note() {
        let mut o = opp();
        o.finish(OppState::Rejected, "KILL_SWITCH").unwrap();
        assert_eq!(o.terminal_note.as_deref(), Some("KILL_SWITCH"));
    }
}
