// =============================================================================
// Shared types used across the Coherence arbitrage engine
// =============================================================================
//
// All prices in this codebase are integer cents in [0, 100]; a YES contract
// pays 100 cents on resolution true. Computed edges may exceed that range and
// are plain i64 cents.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Which side of a binary contract a leg touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Yes => write!(f, "yes"),
            Self::No => write!(f, "no"),
        }
    }
}

/// Whether a leg buys or sells contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    /// The opposite action, used when flattening or unwinding a leg.
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Exchange-reported lifecycle state of a market.
///
/// Quotes on anything other than `Open` are stale and must never feed the
/// violation detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Settled,
}

impl std::fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Settled => write!(f, "settled"),
        }
    }
}

/// Whether executions hit the exchange or are simulated with synthetic fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeMode {
    DryRun,
    Live,
}

impl Default for TradeMode {
    fn default() -> Self {
        Self::DryRun
    }
}

impl std::fmt::Display for TradeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DryRun => write!(f, "DryRun"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Signed position delta of a single leg, in YES-equivalent contracts.
///
/// Buying NO is economically short YES, so it counts negative, and selling
/// NO counts positive.
pub fn leg_delta(side: Side, action: Action, count: u32) -> i64 {
    let sign = match (side, action) {
        (Side::Yes, Action::Buy) | (Side::No, Action::Sell) => 1,
        (Side::Yes, Action::Sell) | (Side::No, Action::Buy) => -1,
    };
    sign * count as i64
}
