// =============================================================================
// Exchange REST client — HMAC-SHA256 signed requests with bounded retries
// =============================================================================
//
// SECURITY: the secret key is never logged or serialised.  Every request
// carries the API key header plus a timestamped HMAC signature of
// `{timestamp}{method}{path}`.
//
// The auth token is acquired at startup and refreshed proactively before
// expiry; refresh is serialised behind a tokio Mutex so at most one refresh
// is ever in flight.  Transient failures retry with exponential backoff and
// jitter, capped at a ceiling; 429 responses honour the server's
// Retry-After through the token bucket.
// =============================================================================

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::rate_limit::TokenBucket;
use super::{
    EventGroup, ExchangeApi, ExchangeError, ExchangePosition, ExchangeResult, OrderRequest,
    OrderStatus, TopOfBook,
};
use crate::market_cache::{rules_fingerprint, Market, Quote};
use crate::types::MarketStatus;

type HmacSha256 = Hmac<Sha256>;

/// Attempts per logical call before surfacing failure.
const MAX_ATTEMPTS: u32 = 4;
/// Backoff ceiling.
const BACKOFF_CEILING: Duration = Duration::from_secs(30);
/// Refresh the token this long before its stated expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct AuthState {
    token: Option<String>,
    expires_at: Instant,
}

/// REST client for the exchange.  Cheap to clone is not needed; it is held
/// behind an `Arc<dyn ExchangeApi>`.
pub struct ExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    http: reqwest::Client,
    bucket: TokenBucket,
    auth: Mutex<AuthState>,
}

impl ExchangeClient {
    /// # Arguments
    /// * `api_key` — sent as a header, never in query params.
    /// * `secret`  — used exclusively for HMAC signing.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, secret: impl Into<String>) -> ExchangeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ExchangeError::Unavailable(format!("http client build failed: {e}")))?;

        let base_url = base_url.into();
        debug!(base_url = %base_url, "ExchangeClient initialised");

        Ok(Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url,
            http,
            // 10 requests/sec sustained, bursts of 20.
            bucket: TokenBucket::new(20, 10.0),
            auth: Mutex::new(AuthState {
                token: None,
                expires_at: Instant::now(),
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Signing & auth
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature over `{timestamp}{method}{path}`.
    fn sign(&self, timestamp_ms: u64, method: &str, path: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(format!("{timestamp_ms}{method}{path}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Return a valid bearer token, refreshing proactively if the current
    /// one is close to expiry.  The Mutex serialises refreshes.
    async fn ensure_token(&self, force: bool) -> ExchangeResult<String> {
        let mut auth = self.auth.lock().await;

        if !force {
            if let Some(token) = &auth.token {
                if Instant::now() + TOKEN_REFRESH_MARGIN < auth.expires_at {
                    return Ok(token.clone());
                }
            }
        }

        #[derive(Deserialize)]
        struct LoginResponse {
            token: String,
            expires_in_secs: u64,
        }

        let path = "/login";
        let ts = Self::timestamp_ms();
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .http
            .post(&url)
            .header("X-API-KEY", &self.api_key)
            .header("X-TIMESTAMP", ts.to_string())
            .header("X-SIGNATURE", self.sign(ts, "POST", path))
            .send()
            .await
            .map_err(|e| ExchangeError::Unavailable(format!("login request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ExchangeError::AuthExpired);
        }

        let login: LoginResponse = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("login parse failed: {e}")))?;

        auth.token = Some(login.token.clone());
        auth.expires_at = Instant::now() + Duration::from_secs(login.expires_in_secs);
        debug!(expires_in_secs = login.expires_in_secs, "exchange token refreshed");
        Ok(login.token)
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    fn backoff_delay(attempt: u32) -> Duration {
        let base = Duration::from_millis(250) * 2u32.pow(attempt.min(7));
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
        (base + jitter).min(BACKOFF_CEILING)
    }

    /// One logical call with bounded retries, backoff, 429 and token
    /// handling.  `body` of `None` issues a GET/DELETE per `method`.
    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> ExchangeResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut refreshed_once = false;
        let mut last_err = ExchangeError::Unavailable("no attempts made".to_string());

        for attempt in 0..MAX_ATTEMPTS {
            self.bucket.acquire(1).await;
            let token = self.ensure_token(false).await?;

            let ts = Self::timestamp_ms();
            let builder = match method {
                "POST" => self.http.post(&url),
                "DELETE" => self.http.delete(&url),
                _ => self.http.get(&url),
            };
            let mut builder = builder
                .bearer_auth(&token)
                .header("X-API-KEY", &self.api_key)
                .header("X-TIMESTAMP", ts.to_string())
                .header("X-SIGNATURE", self.sign(ts, method, path));
            if let Some(b) = &body {
                builder = builder.json(b);
            }

            let resp = match builder.send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(attempt, error = %e, path, "exchange request failed — backing off");
                    last_err = ExchangeError::Transient(e.to_string());
                    tokio::time::sleep(Self::backoff_delay(attempt)).await;
                    continue;
                }
            };

            let status = resp.status();
            match status {
                StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| Self::backoff_delay(attempt));
                    self.bucket.apply_retry_after(retry_after);
                    last_err = ExchangeError::Transient("rate limited".to_string());
                    continue;
                }
                StatusCode::UNAUTHORIZED => {
                    if refreshed_once {
                        return Err(ExchangeError::AuthExpired);
                    }
                    refreshed_once = true;
                    self.ensure_token(true).await?;
                    continue;
                }
                s if s.is_server_error() => {
                    warn!(attempt, status = %s, path, "exchange server error — backing off");
                    last_err = ExchangeError::Transient(format!("server error {s}"));
                    tokio::time::sleep(Self::backoff_delay(attempt)).await;
                    continue;
                }
                s if s.is_client_error() => {
                    let detail = resp.text().await.unwrap_or_default();
                    return Err(ExchangeError::Rejected(format!("{s}: {detail}")));
                }
                _ => {
                    return resp
                        .json::<T>()
                        .await
                        .map_err(|e| ExchangeError::Transient(format!("parse failed: {e}")));
                }
            }
        }

        Err(match last_err {
            ExchangeError::Transient(msg) => ExchangeError::Unavailable(msg),
            other => other,
        })
    }
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct MarketWire {
    ticker: String,
    event_key: String,
    title: String,
    rules_text: String,
    status: MarketStatus,
    yes_bid: i64,
    yes_ask: i64,
    no_bid: i64,
    no_ask: i64,
    yes_depth: u32,
    no_depth: u32,
    close_time: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<MarketWire> for Market {
    fn from(w: MarketWire) -> Self {
        let fingerprint = rules_fingerprint(&w.rules_text);
        Market {
            ticker: w.ticker,
            event_key: w.event_key,
            title: w.title,
            rules_fingerprint: fingerprint,
            rules_text: w.rules_text,
            status: w.status,
            quote: Quote {
                yes_bid: w.yes_bid,
                yes_ask: w.yes_ask,
                no_bid: w.no_bid,
                no_ask: w.no_ask,
            },
            yes_depth: w.yes_depth,
            no_depth: w.no_depth,
            close_time: w.close_time,
            updated_at: w.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MarketsPage {
    markets: Vec<MarketWire>,
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderbookWire {
    ticker: String,
    yes_bid: i64,
    yes_ask: i64,
    no_bid: i64,
    no_ask: i64,
    yes_depth: u32,
    no_depth: u32,
}

#[derive(Debug, Deserialize)]
struct EventsPage {
    events: Vec<EventGroup>,
}

#[derive(Debug, Deserialize)]
struct PlaceOrderResponse {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderWire {
    order_id: String,
    status: String,
    filled_count: u32,
    #[serde(default)]
    avg_price_cents: i64,
}

#[derive(Debug, Deserialize)]
struct PositionsPage {
    positions: Vec<ExchangePosition>,
}

// ---------------------------------------------------------------------------
// ExchangeApi implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ExchangeApi for ExchangeClient {
    #[instrument(skip(self), name = "exchange::list_open_markets")]
    async fn list_open_markets(
        &self,
        cursor: Option<String>,
    ) -> ExchangeResult<(Vec<Market>, Option<String>)> {
        let path = match &cursor {
            Some(c) => format!("/markets?status=open&cursor={c}"),
            None => "/markets?status=open".to_string(),
        };
        let page: MarketsPage = self.request("GET", &path, None).await?;
        let markets = page.markets.into_iter().map(Market::from).collect();
        Ok((markets, page.next_cursor))
    }

    #[instrument(skip(self), name = "exchange::get_orderbook")]
    async fn get_orderbook(&self, ticker: &str) -> ExchangeResult<TopOfBook> {
        let path = format!("/markets/{ticker}/orderbook");
        let book: OrderbookWire = self.request("GET", &path, None).await?;
        Ok(TopOfBook {
            ticker: book.ticker,
            quote: Quote {
                yes_bid: book.yes_bid,
                yes_ask: book.yes_ask,
                no_bid: book.no_bid,
                no_ask: book.no_ask,
            },
            yes_depth: book.yes_depth,
            no_depth: book.no_depth,
        })
    }

    #[instrument(skip(self), name = "exchange::list_events")]
    async fn list_events(&self) -> ExchangeResult<Vec<EventGroup>> {
        let page: EventsPage = self.request("GET", "/events", None).await?;
        Ok(page.events)
    }

    #[instrument(skip(self), name = "exchange::get_event")]
    async fn get_event(&self, key: &str) -> ExchangeResult<EventGroup> {
        let path = format!("/events/{key}");
        self.request("GET", &path, None).await
    }

    #[instrument(skip(self, request), name = "exchange::place_order", fields(ticker = %request.ticker))]
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<String> {
        let body = serde_json::json!({
            "ticker": request.ticker,
            "action": request.action,
            "side": request.side,
            "type": request.order_type,
            "count": request.count,
            "limit_price_cents": request.limit_price_cents,
            "expiration_ts": request.expiration_ts,
            "idempotency_key": request.idempotency_key,
        });
        let resp: PlaceOrderResponse = self.request("POST", "/orders", Some(body)).await?;
        Ok(resp.order_id)
    }

    #[instrument(skip(self), name = "exchange::get_order")]
    async fn get_order(&self, order_id: &str) -> ExchangeResult<OrderStatus> {
        let path = format!("/orders/{order_id}");
        let wire: OrderWire = self.request("GET", &path, None).await?;
        Ok(OrderStatus {
            order_id: wire.order_id,
            open: wire.status == "open" || wire.status == "resting",
            filled_count: wire.filled_count,
            avg_price_cents: wire.avg_price_cents,
        })
    }

    #[instrument(skip(self), name = "exchange::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<()> {
        let path = format!("/orders/{order_id}");
        let _: serde_json::Value = self.request("DELETE", &path, None).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::list_positions")]
    async fn list_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        let page: PositionsPage = self.request("GET", "/positions", None).await?;
        Ok(page.positions)
    }
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
