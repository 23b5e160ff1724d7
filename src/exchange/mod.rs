// =============================================================================
// Exchange adapter — the narrow interface the core trades through
// =============================================================================
//
// The core only ever sees this trait.  The HTTP client implements it against
// the real exchange; tests implement it with scripted fills.  Prices are
// integer cents in [0, 100].
// =============================================================================

pub mod client;
pub mod rate_limit;

pub use client::ExchangeClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market_cache::{Market, Quote};
use crate::types::{Action, Side};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "limit"),
            Self::Market => write!(f, "market"),
        }
    }
}

/// A new-order submission.
///
/// `idempotency_key` is client-supplied and stable across retries; the
/// exchange deduplicates on it, so a resubmission can never produce two
/// orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub ticker: String,
    pub action: Action,
    pub side: Side,
    pub order_type: OrderType,
    pub count: u32,
    pub limit_price_cents: Option<i64>,
    /// Exchange-side expiration, unix seconds.  Safety net in case local
    /// cancellation fails.
    pub expiration_ts: Option<i64>,
    pub idempotency_key: String,
}

/// Order state as reported by the exchange.  Queries are idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_id: String,
    /// Still resting on the book (not fully filled, not cancelled).
    pub open: bool,
    pub filled_count: u32,
    /// Average fill price so far, cents; zero when nothing filled.
    pub avg_price_cents: i64,
}

/// Top-of-book with visible size, per side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopOfBook {
    pub ticker: String,
    pub quote: Quote,
    pub yes_depth: u32,
    pub no_depth: u32,
}

/// Exchange-provided grouping of related tickers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventGroup {
    pub key: String,
    pub title: String,
    pub tickers: Vec<String>,
}

/// A position as the exchange sees it, used for drift reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub ticker: String,
    pub net_contracts: i64,
    pub avg_price_cents: i64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Behavioural error kinds surfaced by the adapter.  Retry/backoff happens
/// inside the adapter; by the time one of these reaches the core, the
/// bounded attempts are spent.
#[derive(Debug, Clone)]
pub enum ExchangeError {
    /// Transient I/O that exhausted its retries.
    Transient(String),
    /// Auth token expired and could not be refreshed.
    AuthExpired,
    /// The exchange refused the request (bad limit, insufficient funds,
    /// market closed mid-flight).
    Rejected(String),
    /// The exchange is unreachable.
    Unavailable(String),
}

impl std::fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient exchange error: {msg}"),
            Self::AuthExpired => write!(f, "exchange auth expired"),
            Self::Rejected(msg) => write!(f, "rejected by exchange: {msg}"),
            Self::Unavailable(msg) => write!(f, "exchange unavailable: {msg}"),
        }
    }
}

impl std::error::Error for ExchangeError {}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

// ---------------------------------------------------------------------------
// The adapter trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// One page of open markets plus the cursor for the next page.
    async fn list_open_markets(
        &self,
        cursor: Option<String>,
    ) -> ExchangeResult<(Vec<Market>, Option<String>)>;

    async fn get_orderbook(&self, ticker: &str) -> ExchangeResult<TopOfBook>;

    async fn list_events(&self) -> ExchangeResult<Vec<EventGroup>>;

    async fn get_event(&self, key: &str) -> ExchangeResult<EventGroup>;

    /// Submit an order; returns the exchange order id.
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<String>;

    async fn get_order(&self, order_id: &str) -> ExchangeResult<OrderStatus>;

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()>;

    async fn list_positions(&self) -> ExchangeResult<Vec<ExchangePosition>>;
}
