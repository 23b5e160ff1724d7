// =============================================================================
// Market Cache — canonical in-memory view of live quotes and settlement rules
// =============================================================================
//
// The cache is the single writer-owned home of Market records.  Snapshots
// from the ingestion worker are append-at-monotonic-timestamp: an older
// snapshot never overwrites a newer record for the same ticker.
//
// Readers never block writers.  The table is a copy-on-write
// `Arc<HashMap>`: applying a snapshot builds a fresh map and swaps the Arc,
// while `price_view` clones the current Arc once and reads from that frozen
// table, so every quote in a view comes from one coherent tick.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::types::{MarketStatus, Side};

// ---------------------------------------------------------------------------
// Quote / Market model
// ---------------------------------------------------------------------------

/// Top-of-book for one binary market, integer cents in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub yes_bid: i64,
    pub yes_ask: i64,
    pub no_bid: i64,
    pub no_ask: i64,
}

impl Quote {
    /// Midpoint of the YES book, used for mark-to-market.
    pub fn yes_mid(&self) -> i64 {
        (self.yes_bid + self.yes_ask) / 2
    }
}

/// A single binary contract as tracked by the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    /// Opaque unique identifier of the contract.
    pub ticker: String,
    /// Exchange-provided grouping key.
    pub event_key: String,
    pub title: String,
    /// Settlement-rules text, opaque to the core.
    pub rules_text: String,
    /// Stable hash of `rules_text`, used to detect semantic changes.
    pub rules_fingerprint: String,
    pub status: MarketStatus,
    pub quote: Quote,
    /// Visible size at top-of-book, per side.
    pub yes_depth: u32,
    pub no_depth: u32,
    pub close_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Market {
    pub fn depth(&self, side: Side) -> u32 {
        match side {
            Side::Yes => self.yes_depth,
            Side::No => self.no_depth,
        }
    }
}

/// SHA-256 hex digest of a settlement-rules text.
pub fn rules_fingerprint(rules_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rules_text.as_bytes());
    hex::encode(hasher.finalize())
}

/// One coherent batch of market records from the ingestion adapter.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub captured_at: DateTime<Utc>,
    pub markets: Vec<Market>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Lookup failures surfaced to callers.  No retries here; callers decide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    UnknownTicker(String),
    StaleMarket(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTicker(t) => write!(f, "unknown ticker: {t}"),
            Self::StaleMarket(t) => write!(f, "market not open, quotes stale: {t}"),
        }
    }
}

impl std::error::Error for CacheError {}

// ---------------------------------------------------------------------------
// Price view
// ---------------------------------------------------------------------------

/// An immutable, internally consistent set of quotes taken from one version
/// of the table.  Every market in a view was open at capture time.
#[derive(Debug, Clone)]
pub struct PriceView {
    markets: HashMap<String, Arc<Market>>,
    version: u64,
}

impl PriceView {
    pub fn get(&self, ticker: &str) -> Option<&Market> {
        self.markets.get(ticker).map(Arc::as_ref)
    }

    pub fn quote(&self, ticker: &str) -> Option<Quote> {
        self.markets.get(ticker).map(|m| m.quote)
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

// ---------------------------------------------------------------------------
// MarketCache
// ---------------------------------------------------------------------------

/// Versioned copy-on-write market table.
pub struct MarketCache {
    table: RwLock<Arc<HashMap<String, Arc<Market>>>>,
    version: AtomicU64,
}

impl MarketCache {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(HashMap::new())),
            version: AtomicU64::new(0),
        }
    }

    /// Apply a full or delta snapshot.
    ///
    /// Records older than what the cache already holds for the same ticker
    /// are skipped.  Returns the number of records actually applied.
    pub fn apply_snapshot(&self, snapshot: MarketSnapshot) -> usize {
        let mut guard = self.table.write();
        let mut next: HashMap<String, Arc<Market>> = guard.as_ref().clone();
        let mut applied = 0;

        for mut market in snapshot.markets {
            if let Some(existing) = next.get(&market.ticker) {
                if existing.updated_at > market.updated_at {
                    debug!(
                        ticker = %market.ticker,
                        incoming = %market.updated_at,
                        held = %existing.updated_at,
                        "skipping out-of-order market record"
                    );
                    continue;
                }
            }
            if market.rules_fingerprint.is_empty() {
                market.rules_fingerprint = rules_fingerprint(&market.rules_text);
            }
            next.insert(market.ticker.clone(), Arc::new(market));
            applied += 1;
        }

        if applied > 0 {
            *guard = Arc::new(next);
            self.version.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            applied,
            version = self.version.load(Ordering::Relaxed),
            captured_at = %snapshot.captured_at,
            "market snapshot applied"
        );
        applied
    }

    /// Point lookup.  Returns the record regardless of status; use
    /// `price_view` when quotes must be live.
    pub fn get(&self, ticker: &str) -> Result<Arc<Market>, CacheError> {
        self.table
            .read()
            .get(ticker)
            .cloned()
            .ok_or_else(|| CacheError::UnknownTicker(ticker.to_string()))
    }

    /// All markets belonging to an event.
    pub fn iter_event(&self, event_key: &str) -> Vec<Arc<Market>> {
        self.table
            .read()
            .values()
            .filter(|m| m.event_key == event_key)
            .cloned()
            .collect()
    }

    /// All currently open markets.
    pub fn open_markets(&self) -> Vec<Arc<Market>> {
        self.table
            .read()
            .values()
            .filter(|m| m.status == MarketStatus::Open)
            .cloned()
            .collect()
    }

    /// Side-effect-free consistent snapshot of quotes for `tickers`.
    ///
    /// The whole view comes from a single clone of the versioned table, so
    /// no market in the set can change between the first and last read.
    /// Fails on the first unknown or non-open ticker.
    pub fn price_view<S: AsRef<str>>(&self, tickers: &[S]) -> Result<PriceView, CacheError> {
        let table = self.table.read().clone();
        let version = self.version.load(Ordering::Relaxed);

        let mut markets = HashMap::with_capacity(tickers.len());
        for ticker in tickers {
            let ticker = ticker.as_ref();
            let market = table
                .get(ticker)
                .cloned()
                .ok_or_else(|| CacheError::UnknownTicker(ticker.to_string()))?;
            if market.status != MarketStatus::Open {
                return Err(CacheError::StaleMarket(ticker.to_string()));
            }
            markets.insert(ticker.to_string(), market);
        }

        Ok(PriceView { markets, version })
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    /// Current settlement-rules fingerprint for a ticker, if known.
    pub fn fingerprint_of(&self, ticker: &str) -> Option<String> {
        self.table
            .read()
            .get(ticker)
            .map(|m| m.rules_fingerprint.clone())
    }
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MarketCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketCache")
            .field("len", &self.len())
            .field("version", &self.version())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn market(ticker: &str, yes_bid: i64, yes_ask: i64, at: DateTime<Utc>) -> Market {
        Market {
            ticker: ticker.to_string(),
            event_key: "EVT".to_string(),
            title: format!("test market {ticker}"),
            rules_text: format!("settles yes if {ticker}"),
            rules_fingerprint: String::new(),
            status: MarketStatus::Open,
            quote: Quote {
                yes_bid,
                yes_ask,
                no_bid: 100 - yes_ask,
                no_ask: 100 - yes_bid,
            },
            yes_depth: 10,
            no_depth: 10,
            close_time: at + Duration::days(30),
            updated_at: at,
        }
    }

    fn snapshot(markets: Vec<Market>) -> MarketSnapshot {
        let captured_at = markets
            .iter()
            .map(|m| m.updated_at)
            .max()
            .unwrap_or_else(Utc::now);
        MarketSnapshot {
            captured_at,
            markets,
        }
    }

    #[test]
    fn ingest_then_price_view_returns_last_written_quote() {
        let cache = MarketCache::new();
        let t0 = Utc::now();

        cache.apply_snapshot(snapshot(vec![market("AAA", 40, 42, t0)]));
        cache.apply_snapshot(snapshot(vec![market("AAA", 45, 47, t0 + Duration::seconds(1))]));

        let view = cache.price_view(&["AAA"]).unwrap();
        assert_eq!(view.quote("AAA").unwrap().yes_bid, 45);
        assert_eq!(view.quote("AAA").unwrap().yes_ask, 47);
    }

    #[test]
    fn older_snapshot_never_overwrites_newer() {
        let cache = MarketCache::new();
        let t0 = Utc::now();

        cache.apply_snapshot(snapshot(vec![market("AAA", 45, 47, t0)]));
        let applied =
            cache.apply_snapshot(snapshot(vec![market("AAA", 10, 12, t0 - Duration::seconds(5))]));

        assert_eq!(applied, 0);
        let view = cache.price_view(&["AAA"]).unwrap();
        assert_eq!(view.quote("AAA").unwrap().yes_bid, 45);
    }

    #[test]
    fn unknown_ticker_is_an_error() {
        let cache = MarketCache::new();
        assert_eq!(
            cache.price_view(&["NOPE"]).unwrap_err(),
            CacheError::UnknownTicker("NOPE".to_string())
        );
        assert!(matches!(
            cache.get("NOPE"),
            Err(CacheError::UnknownTicker(_))
        ));
    }

    #[test]
    fn closed_market_quotes_are_stale() {
        let cache = MarketCache::new();
        let t0 = Utc::now();
        let mut m = market("AAA", 40, 42, t0);
        m.status = MarketStatus::Closed;
        cache.apply_snapshot(snapshot(vec![m]));

        assert_eq!(
            cache.price_view(&["AAA"]).unwrap_err(),
            CacheError::StaleMarket("AAA".to_string())
        );
        // Point lookup still works for non-price uses.
        assert!(cache.get("AAA").is_ok());
    }

    #[test]
    fn price_view_is_frozen_against_later_writes() {
        let cache = MarketCache::new();
        let t0 = Utc::now();
        cache.apply_snapshot(snapshot(vec![market("AAA", 40, 42, t0)]));

        let view = cache.price_view(&["AAA"]).unwrap();
        cache.apply_snapshot(snapshot(vec![market("AAA", 90, 92, t0 + Duration::seconds(1))]));

        // The view still reads the version it captured.
        assert_eq!(view.quote("AAA").unwrap().yes_ask, 42);
        // A fresh view sees the new write.
        let fresh = cache.price_view(&["AAA"]).unwrap();
        assert_eq!(fresh.quote("AAA").unwrap().yes_ask, 92);
        assert!(fresh.version() > view.version());
    }

    #[test]
    fn fingerprint_is_stable_and_change_sensitive() {
        let a = rules_fingerprint("settles yes if CPI > 3%");
        let b = rules_fingerprint("settles yes if CPI > 3%");
        let c = rules_fingerprint("settles yes if CPI > 4%");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn iter_event_groups_by_key() {
        let cache = MarketCache::new();
        let t0 = Utc::now();
        let mut m1 = market("AAA", 40, 42, t0);
        let mut m2 = market("BBB", 50, 52, t0);
        let mut m3 = market("CCC", 60, 62, t0);
        m1.event_key = "E1".to_string();
        m2.event_key = "E1".to_string();
        m3.event_key = "E2".to_string();
        cache.apply_snapshot(snapshot(vec![m1, m2, m3]));

        let mut tickers: Vec<String> = cache
            .iter_event("E1")
            .iter()
            .map(|m| m.ticker.clone())
            .collect();
        tickers.sort();
        assert_eq!(tickers, vec!["AAA", "BBB"]);
    }
}
