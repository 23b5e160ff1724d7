// =============================================================================
// Relationship oracle — the LLM collaborator behind a narrow interface
// =============================================================================
//
// The core never parses free-form text.  The oracle endpoint returns
// structured JSON candidates and revalidation verdicts; anything that does
// not deserialise cleanly is an error, and numeric fields are clamped into
// their documented domains before they touch the catalog.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::catalog::{Relationship, RelationshipCandidate, RelationshipKind};
use crate::market_cache::Market;

/// Oracle verdict on an existing relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revalidation {
    pub still_valid: bool,
    pub confidence: f64,
}

/// The discovery/revalidation interface consumed by the core.
#[async_trait]
pub trait RelationshipOracle: Send + Sync {
    /// Propose constraints over a batch of markets (typically one event).
    async fn discover(&self, markets: &[Arc<Market>]) -> Result<Vec<RelationshipCandidate>>;

    /// Re-examine a stored relationship against current titles and rules.
    async fn revalidate(
        &self,
        relationship: &Relationship,
        markets: &[Arc<Market>],
    ) -> Result<Revalidation>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct MarketBrief<'a> {
    ticker: &'a str,
    title: &'a str,
    rules_text: &'a str,
}

#[derive(Serialize)]
struct DiscoverRequest<'a> {
    markets: Vec<MarketBrief<'a>>,
}

#[derive(Deserialize)]
struct DiscoverResponse {
    candidates: Vec<CandidateWire>,
}

#[derive(Deserialize)]
struct CandidateWire {
    kind: RelationshipKind,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

#[derive(Serialize)]
struct RevalidateRequest<'a> {
    kind: &'a RelationshipKind,
    reasoning: &'a str,
    markets: Vec<MarketBrief<'a>>,
}

pub struct HttpRelationshipOracle {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpRelationshipOracle {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build oracle http client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
        })
    }

    fn briefs(markets: &[Arc<Market>]) -> Vec<MarketBrief<'_>> {
        markets
            .iter()
            .map(|m| MarketBrief {
                ticker: &m.ticker,
                title: &m.title,
                rules_text: &m.rules_text,
            })
            .collect()
    }
}

#[async_trait]
impl RelationshipOracle for HttpRelationshipOracle {
    #[instrument(skip(self, markets), name = "oracle::discover", fields(batch = markets.len()))]
    async fn discover(&self, markets: &[Arc<Market>]) -> Result<Vec<RelationshipCandidate>> {
        let url = format!("{}/discover", self.endpoint);
        let request = DiscoverRequest {
            markets: Self::briefs(markets),
        };

        let resp: DiscoverResponse = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("oracle discover request failed")?
            .error_for_status()
            .context("oracle discover returned error status")?
            .json()
            .await
            .context("oracle discover response did not parse")?;

        let candidates: Vec<RelationshipCandidate> = resp
            .candidates
            .into_iter()
            .map(|c| RelationshipCandidate {
                kind: c.kind,
                confidence: c.confidence.clamp(0.0, 1.0),
                reasoning: c.reasoning,
            })
            .collect();

        debug!(count = candidates.len(), "oracle proposed candidates");
        Ok(candidates)
    }

    #[instrument(skip(self, relationship, markets), name = "oracle::revalidate", fields(id = %relationship.id))]
    async fn revalidate(
        &self,
        relationship: &Relationship,
        markets: &[Arc<Market>],
    ) -> Result<Revalidation> {
        let url = format!("{}/revalidate", self.endpoint);
        let request = RevalidateRequest {
            kind: &relationship.kind,
            reasoning: &relationship.reasoning,
            markets: Self::briefs(markets),
        };

        let mut verdict: Revalidation = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("oracle revalidate request failed")?
            .error_for_status()
            .context("oracle revalidate returned error status")?
            .json()
            .await
            .context("oracle revalidate response did not parse")?;

        verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
        debug!(
            still_valid = verdict.still_valid,
            confidence = verdict.confidence,
            "oracle revalidation verdict"
        );
        Ok(verdict)
    }
}

impl std::fmt::Debug for HttpRelationshipOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRelationshipOracle")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
