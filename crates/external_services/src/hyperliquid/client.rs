//! Liquidations indexer REST API client.
//!
//! Every request passes two gates before it leaves the process: the circuit
//! breaker (fail fast while the upstream is down) and the request-weight
//! limiter (respect the upstream's per-minute budget). Callers receive typed
//! errors and decide whether to retry, back off, or skip the cycle.

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::{Error, Result};
use crate::hyperliquid::types::{
    normalize_events, LiquidationFilter, PageResponse, RawPageResponse, SortOrder,
};
use crate::limiter::{LimiterConfig, RequestWeightLimiter};
use chrono::Utc;
use metrics::counter;
use std::time::Duration;
use tracing::{debug, warn};

/// Base URL for the liquidations indexer API.
const DEFAULT_BASE_URL: &str = "https://api.hypurrscan.io";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream page size ceiling.
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// Upstream bound on the `hours` lookback of the recent endpoint.
pub const MAX_RECENT_HOURS: u32 = 168;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub breaker: BreakerConfig,
    pub limiter: LimiterConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
            breaker: BreakerConfig::default(),
            limiter: LimiterConfig::default(),
        }
    }
}

/// Liquidations indexer client.
pub struct LiquidationsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    breaker: CircuitBreaker,
    limiter: RequestWeightLimiter,
}

impl LiquidationsClient {
    /// Create a new client.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url,
            api_key: config.api_key,
            breaker: CircuitBreaker::new(config.breaker),
            limiter: RequestWeightLimiter::new(config.limiter),
        })
    }

    /// Create a client against a custom base URL with default gating.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        Self::new(ClientConfig {
            base_url: base_url.into(),
            ..Default::default()
        })
    }

    /// Fetch one page of historical liquidations.
    ///
    /// `limit` must be within `[1, 1000]`. Filter times are forwarded
    /// literally; the cursor is opaque and comes from a previous page.
    pub async fn fetch_page(
        &self,
        filter: &LiquidationFilter,
        cursor: Option<&str>,
        limit: u32,
        order: SortOrder,
    ) -> Result<PageResponse> {
        validate_limit(limit)?;

        let mut query: Vec<(&'static str, String)> = Vec::new();
        if let Some(coin) = &filter.coin {
            query.push(("coin", coin.clone()));
        }
        if let Some(user) = &filter.user {
            query.push(("user", user.clone()));
        }
        if let Some(start_time) = filter.start_time {
            query.push(("start_time", start_time.to_string()));
        }
        if let Some(end_time) = filter.end_time {
            query.push(("end_time", end_time.to_string()));
        }
        if let Some(amount) = filter.amount_dollars {
            query.push(("amount_dollars", amount.to_string()));
        }
        push_page_params(&mut query, cursor, limit, order);

        self.get_page("/liquidations/", query).await
    }

    /// Fetch one page from the rolling-window "recent" endpoint.
    ///
    /// `hours` must be within `[1, 168]` and is encoded as
    /// `start_time = now - hours * 3600s`.
    pub async fn fetch_recent_page(
        &self,
        hours: u32,
        cursor: Option<&str>,
        limit: u32,
        order: SortOrder,
    ) -> Result<PageResponse> {
        validate_limit(limit)?;
        if !(1..=MAX_RECENT_HOURS).contains(&hours) {
            return Err(Error::InvalidRequest(format!(
                "hours must be within 1..={}, got {}",
                MAX_RECENT_HOURS, hours
            )));
        }

        let start_time = Utc::now().timestamp_millis() - i64::from(hours) * 3_600_000;
        let mut query: Vec<(&'static str, String)> =
            vec![("start_time", start_time.to_string())];
        push_page_params(&mut query, cursor, limit, order);

        self.get_page("/liquidations/recent", query).await
    }

    async fn get_page(
        &self,
        path: &str,
        query: Vec<(&'static str, String)>,
    ) -> Result<PageResponse> {
        if !self.breaker.allow() {
            counter!("liquidation_upstream_breaker_rejections_total").increment(1);
            return Err(Error::CircuitOpen);
        }
        if let Err(retry_after) = self.limiter.try_acquire() {
            counter!("liquidation_upstream_limiter_rejections_total").increment(1);
            return Err(Error::RateLimited { retry_after });
        }

        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.get(&url).query(&query);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.breaker.record_failure();
                counter!("liquidation_upstream_failures_total").increment(1);
                return Err(e.into());
            }
        };

        let status = response.status();
        if status.as_u16() == 429 {
            // Upstream throttling is a budget problem, not an availability one.
            counter!("liquidation_upstream_throttled_total").increment(1);
            return Err(Error::UpstreamStatus(429));
        }
        if !status.is_success() {
            self.breaker.record_failure();
            counter!("liquidation_upstream_failures_total").increment(1);
            return Err(Error::UpstreamStatus(status.as_u16()));
        }

        let raw: RawPageResponse = match response.json().await {
            Ok(raw) => raw,
            Err(e) => {
                self.breaker.record_failure();
                counter!("liquidation_upstream_failures_total").increment(1);
                return Err(e.into());
            }
        };
        self.breaker.record_success();

        let (events, dropped) = normalize_events(raw.data);
        if dropped > 0 {
            warn!("dropped {} malformed liquidation entries", dropped);
            counter!("liquidation_upstream_events_dropped_total").increment(dropped as u64);
        }
        debug!(
            "fetched {} liquidations from {} (upstream {}ms)",
            events.len(),
            path,
            raw.execution_time_ms
        );

        Ok(PageResponse {
            data: events,
            next_cursor: raw.next_cursor,
            has_more: raw.has_more,
            execution_time_ms: raw.execution_time_ms,
        })
    }
}

fn push_page_params(
    query: &mut Vec<(&'static str, String)>,
    cursor: Option<&str>,
    limit: u32,
    order: SortOrder,
) {
    if let Some(cursor) = cursor {
        query.push(("cursor", cursor.to_string()));
    }
    query.push(("limit", limit.to_string()));
    query.push(("order", order.as_str().to_string()));
}

fn validate_limit(limit: u32) -> Result<()> {
    if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
        return Err(Error::InvalidRequest(format!(
            "limit must be within 1..={}, got {}",
            MAX_PAGE_LIMIT, limit
        )));
    }
    Ok(())
}
