// =============================================================================
// Relationship Catalog — typed price constraints over sets of markets
// =============================================================================
//
// The catalog stores the constraints the detector trades against.  It never
// interprets constraint semantics itself; it enforces structural
// well-formedness, canonical-key dedupe, and settlement-rules fingerprint
// matching.  A fingerprint mismatch is a hard invalidation even before any
// oracle revalidation runs.
//
// Invalidation is terminal: a relationship, once invalidated, is never
// re-activated.  The source (LLM or human) must submit a fresh one.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::market_cache::MarketCache;
use crate::types::MarketStatus;

// ---------------------------------------------------------------------------
// Relationship model
// ---------------------------------------------------------------------------

/// The closed set of constraint variants.  The detector branches on this
/// tag; new kinds extend the enum and its detection rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum RelationshipKind {
    /// YES-outcome of `subset` implies YES-outcome of `superset`:
    /// P(subset) <= P(superset).
    Subset { subset: String, superset: String },
    /// Tickers in ascending strike order: P(t1) >= P(t2) >= ... >= P(tn).
    Threshold { tickers: Vec<String> },
    /// Mutually exclusive, exhaustive outcomes: sum P(ti) = 1.
    Partition { tickers: Vec<String> },
    /// Soft constraint with estimated conditional probability kappa:
    /// P(if) <= P(then) as kappa -> 1.
    Implication {
        if_ticker: String,
        then_ticker: String,
        kappa: f64,
    },
}

impl RelationshipKind {
    pub fn tickers(&self) -> Vec<&str> {
        match self {
            Self::Subset { subset, superset } => vec![subset, superset],
            Self::Threshold { tickers } | Self::Partition { tickers } => {
                tickers.iter().map(String::as_str).collect()
            }
            Self::Implication {
                if_ticker,
                then_ticker,
                ..
            } => vec![if_ticker, then_ticker],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Subset { .. } => "SUBSET",
            Self::Threshold { .. } => "THRESHOLD",
            Self::Partition { .. } => "PARTITION",
            Self::Implication { .. } => "IMPLICATION",
        }
    }

    /// Dedupe key.  SUBSET/IMPLICATION/THRESHOLD are order-sensitive;
    /// PARTITION is a set, so its key sorts the tickers.
    pub fn canonical_key(&self) -> String {
        match self {
            Self::Subset { subset, superset } => format!("SUBSET|{subset}|{superset}"),
            Self::Threshold { tickers } => format!("THRESHOLD|{}", tickers.join("|")),
            Self::Partition { tickers } => {
                let mut sorted: Vec<&str> = tickers.iter().map(String::as_str).collect();
                sorted.sort_unstable();
                format!("PARTITION|{}", sorted.join("|"))
            }
            Self::Implication {
                if_ticker,
                then_ticker,
                ..
            } => format!("IMPLICATION|{if_ticker}|{then_ticker}"),
        }
    }
}

/// Why a relationship was permanently retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidationReason {
    MarketClosed,
    RulesChanged,
    ConfidenceFloor,
    OracleRejected,
    Manual,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MarketClosed => "MARKET_CLOSED",
            Self::RulesChanged => "RULES_CHANGED",
            Self::ConfidenceFloor => "CONFIDENCE_FLOOR",
            Self::OracleRejected => "ORACLE_REJECTED",
            Self::Manual => "MANUAL",
        };
        write!(f, "{s}")
    }
}

/// A stored constraint with its provenance and freshness bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub kind: RelationshipKind,
    /// Curator's certainty in [0, 1].
    pub confidence: f64,
    /// Opaque provenance text from the discovery source.
    pub reasoning: String,
    pub created_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
    /// Settlement-rules fingerprint per involved ticker, captured at
    /// creation time.
    pub fingerprints: HashMap<String, String>,
    pub invalidated: Option<InvalidationReason>,
}

/// What the discovery source (oracle or human) submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipCandidate {
    pub kind: RelationshipKind,
    pub confidence: f64,
    pub reasoning: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    Malformed(String),
    Duplicate(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed relationship: {msg}"),
            Self::Duplicate(key) => write!(f, "duplicate relationship for key: {key}"),
        }
    }
}

impl std::error::Error for CatalogError {}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

struct Inner {
    by_id: HashMap<String, Relationship>,
    /// canonical key -> id of the live (non-invalidated) holder.
    key_to_id: HashMap<String, String>,
}

/// Thread-safe store of relationships.  Single logical writer (the
/// discovery/revalidation workers); readers take clones.
pub struct Catalog {
    inner: RwLock<Inner>,
    /// Relationships below this confidence never activate.
    min_confidence: f64,
    /// Age after which a relationship is due for oracle revalidation.
    revalidate_after: Duration,
}

impl Catalog {
    pub fn new(min_confidence: f64, revalidate_after_hours: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                key_to_id: HashMap::new(),
            }),
            min_confidence,
            revalidate_after: Duration::hours(revalidate_after_hours as i64),
        }
    }

    // -------------------------------------------------------------------------
    // Upsert
    // -------------------------------------------------------------------------

    /// Validate structural well-formedness, capture current settlement-rules
    /// fingerprints, and store.  Returns the new relationship id.
    pub fn upsert(
        &self,
        candidate: RelationshipCandidate,
        cache: &MarketCache,
    ) -> Result<String, CatalogError> {
        Self::validate(&candidate)?;

        let tickers: Vec<String> = candidate
            .kind
            .tickers()
            .iter()
            .map(|s| s.to_string())
            .collect();

        // Fingerprints of current rules; every involved market must be known.
        let mut fingerprints = HashMap::with_capacity(tickers.len());
        for ticker in &tickers {
            let fp = cache.fingerprint_of(ticker).ok_or_else(|| {
                CatalogError::Malformed(format!("unknown ticker: {ticker}"))
            })?;
            fingerprints.insert(ticker.clone(), fp);
        }

        let key = candidate.kind.canonical_key();
        let mut inner = self.inner.write();

        if let Some(existing_id) = inner.key_to_id.get(&key) {
            let live = inner
                .by_id
                .get(existing_id)
                .map(|r| r.invalidated.is_none())
                .unwrap_or(false);
            if live {
                return Err(CatalogError::Duplicate(key));
            }
        }

        let now = Utc::now();
        let rel = Relationship {
            id: Uuid::new_v4().to_string(),
            kind: candidate.kind,
            confidence: candidate.confidence,
            reasoning: candidate.reasoning,
            created_at: now,
            last_validated_at: now,
            fingerprints,
            invalidated: None,
        };

        info!(
            id = %rel.id,
            kind = rel.kind.label(),
            confidence = rel.confidence,
            tickers = ?tickers,
            "relationship stored"
        );

        inner.key_to_id.insert(key, rel.id.clone());
        let id = rel.id.clone();
        inner.by_id.insert(id.clone(), rel);
        Ok(id)
    }

    fn validate(candidate: &RelationshipCandidate) -> Result<(), CatalogError> {
        if !(0.0..=1.0).contains(&candidate.confidence) {
            return Err(CatalogError::Malformed(format!(
                "confidence {} outside [0,1]",
                candidate.confidence
            )));
        }

        let tickers = candidate.kind.tickers();
        if tickers.iter().any(|t| t.is_empty()) {
            return Err(CatalogError::Malformed("empty ticker".to_string()));
        }

        let unique: HashSet<&&str> = tickers.iter().collect();
        if unique.len() != tickers.len() {
            return Err(CatalogError::Malformed(
                "tickers must be unique".to_string(),
            ));
        }

        match &candidate.kind {
            RelationshipKind::Subset { .. } => {}
            RelationshipKind::Implication { kappa, .. } => {
                if !(0.0..=1.0).contains(kappa) {
                    return Err(CatalogError::Malformed(format!(
                        "kappa {kappa} outside [0,1]"
                    )));
                }
            }
            RelationshipKind::Threshold { tickers } | RelationshipKind::Partition { tickers } => {
                if tickers.len() < 2 {
                    return Err(CatalogError::Malformed(
                        "needs at least two tickers".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Activation
    // -------------------------------------------------------------------------

    /// Relationships safe to detect against right now: every involved market
    /// present and open, every fingerprint matching the cache, confidence at
    /// or above the floor.
    ///
    /// As a side effect this sweep hard-invalidates relationships whose
    /// markets closed, whose rules changed, or whose confidence fell below
    /// the floor.
    pub fn active(&self, cache: &MarketCache) -> Vec<Relationship> {
        let mut inner = self.inner.write();
        let mut result = Vec::new();

        for rel in inner.by_id.values_mut() {
            if rel.invalidated.is_some() {
                continue;
            }

            if rel.confidence < self.min_confidence {
                warn!(id = %rel.id, confidence = rel.confidence, "relationship below confidence floor");
                rel.invalidated = Some(InvalidationReason::ConfidenceFloor);
                continue;
            }

            let mut verdict = Verdict::Active;
            for ticker in rel.kind.tickers() {
                match cache.get(ticker) {
                    Err(_) => {
                        // Not yet ingested; inactive this cycle, not terminal.
                        verdict = Verdict::Dormant;
                        break;
                    }
                    Ok(market) => {
                        if market.status != MarketStatus::Open {
                            verdict = Verdict::Invalidate(InvalidationReason::MarketClosed);
                            break;
                        }
                        let held = rel.fingerprints.get(ticker);
                        if held != Some(&market.rules_fingerprint) {
                            verdict = Verdict::Invalidate(InvalidationReason::RulesChanged);
                            break;
                        }
                    }
                }
            }

            match verdict {
                Verdict::Active => result.push(rel.clone()),
                Verdict::Dormant => {
                    debug!(id = %rel.id, "relationship dormant: market not in cache");
                }
                Verdict::Invalidate(reason) => {
                    warn!(id = %rel.id, %reason, "relationship hard-invalidated");
                    rel.invalidated = Some(reason);
                }
            }
        }

        result.sort_by(|a, b| a.id.cmp(&b.id));
        result
    }

    // -------------------------------------------------------------------------
    // Invalidation & revalidation
    // -------------------------------------------------------------------------

    /// Mark terminal.  Returns false if the id is unknown or already
    /// invalidated.
    pub fn invalidate(&self, id: &str, reason: InvalidationReason) -> bool {
        let mut inner = self.inner.write();
        match inner.by_id.get_mut(id) {
            Some(rel) if rel.invalidated.is_none() => {
                info!(id = %id, %reason, "relationship invalidated");
                rel.invalidated = Some(reason);
                true
            }
            _ => false,
        }
    }

    /// Relationships due for oracle revalidation.
    pub fn stale_for_revalidation(&self, now: DateTime<Utc>) -> Vec<Relationship> {
        let inner = self.inner.read();
        let mut due: Vec<Relationship> = inner
            .by_id
            .values()
            .filter(|r| r.invalidated.is_none())
            .filter(|r| now - r.last_validated_at >= self.revalidate_after)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.last_validated_at.cmp(&b.last_validated_at));
        due
    }

    /// Apply an oracle verdict.
    pub fn apply_revalidation(
        &self,
        id: &str,
        still_valid: bool,
        confidence: f64,
        now: DateTime<Utc>,
    ) {
        if !still_valid {
            self.invalidate(id, InvalidationReason::OracleRejected);
            return;
        }

        let mut inner = self.inner.write();
        if let Some(rel) = inner.by_id.get_mut(id) {
            if rel.invalidated.is_some() {
                return;
            }
            rel.confidence = confidence.clamp(0.0, 1.0);
            rel.last_validated_at = now;
            if rel.confidence < self.min_confidence {
                warn!(id = %id, confidence = rel.confidence, "revalidated below confidence floor");
                rel.invalidated = Some(InvalidationReason::ConfidenceFloor);
            } else {
                debug!(id = %id, confidence = rel.confidence, "relationship revalidated");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<Relationship> {
        self.inner.read().by_id.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }

    /// All relationships, live and retired, for the dashboard.
    pub fn snapshot(&self) -> Vec<Relationship> {
        let mut all: Vec<Relationship> = self.inner.read().by_id.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

enum Verdict {
    Active,
    Dormant,
    Invalidate(InvalidationReason),
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("len", &self.len())
            .field("min_confidence", &self.min_confidence)
            .finish()
    }
}
