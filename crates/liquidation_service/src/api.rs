//! HTTP API handlers and routes using axum.
//!
//! Routes:
//! - GET /health - Health check
//! - GET /liquidations - Pass-through keyset pagination against upstream
//! - GET /liquidations/recent - Cached rolling-window page
//! - GET /liquidations/stats/all - Per-period statistics blob
//! - GET /liquidations/chart-data?period= - Per-period chart blob
//! - GET /liquidations/data - Composite per-period blob
//! - GET /liquidations/stream - Live SSE event stream with filters and resume
//! - GET /liquidations/stream/stats - Stream connection statistics
//!
//! The derived blobs are served from the cache only: a miss means the refresh
//! loop has not completed a pass yet and maps to 503, never to an upstream
//! rebuild. The `recent` endpoint may fall back to a single upstream call.

use crate::sse::{
    replay_missed, AdmissionError, SessionStream, SseRegistry, StreamFilter, StreamStats,
};
use crate::views::{AllPeriodsData, ChartData, Period, StatsAllData};
use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{sse::Sse, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use external_services::hyperliquid::{
    LiquidationFilter, LiquidationsClient, PageResponse, SortOrder, MAX_PAGE_LIMIT,
    MAX_RECENT_HOURS,
};
use external_services::redis_client::{chart_key, recent_key, KEY_ALL_DATA, KEY_STATS_ALL};
use external_services::CacheClient;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, warn};
use uuid::Uuid;

const DEFAULT_RECENT_HOURS: u32 = 2;
const DEFAULT_PAGE_LIMIT: u32 = 100;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub cache: CacheClient,
    pub client: Arc<LiquidationsClient>,
    pub registry: Arc<SseRegistry>,
    /// TTL for cached `recent` pages.
    pub recent_ttl: Duration,
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/liquidations", get(list_liquidations_handler))
        .route("/liquidations/recent", get(recent_handler))
        .route("/liquidations/stats/all", get(stats_all_handler))
        .route("/liquidations/chart-data", get(chart_data_handler))
        .route("/liquidations/data", get(all_data_handler))
        .route("/liquidations/stream", get(stream_handler))
        .route("/liquidations/stream/stats", get(stream_stats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

// ============================================================================
// Query Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LiquidationsQuery {
    pub coin: Option<String>,
    pub user: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub amount_dollars: Option<f64>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub coin: Option<String>,
    pub user: Option<String>,
    pub hours: Option<u32>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
    pub order: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChartQuery {
    pub period: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub coin: Option<String>,
    pub min_amount_dollars: Option<f64>,
    pub user: Option<String>,
    pub last_event_id: Option<u64>,
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Health check endpoint.
/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

/// Pass-through keyset pagination against the upstream indexer.
/// GET /liquidations
async fn list_liquidations_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LiquidationsQuery>,
) -> Result<Json<PageResponse>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    validate_limit(limit)?;
    let order = parse_order(query.order.as_deref())?;

    let filter = LiquidationFilter {
        coin: query.coin,
        user: query.user,
        start_time: query.start_time,
        end_time: query.end_time,
        amount_dollars: query.amount_dollars,
    };

    let page = state
        .client
        .fetch_page(&filter, query.cursor.as_deref(), limit, order)
        .await?;
    Ok(Json(page))
}

/// Rolling-window page, cached for the plain (unfiltered, first-page) shape.
/// GET /liquidations/recent
async fn recent_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<PageResponse>, ApiError> {
    let hours = query.hours.unwrap_or(DEFAULT_RECENT_HOURS);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    validate_hours(hours)?;
    validate_limit(limit)?;
    let order = parse_order(query.order.as_deref())?;

    let cacheable = query.coin.is_none()
        && query.user.is_none()
        && query.cursor.is_none()
        && order == SortOrder::Desc;

    let key = recent_key(hours, limit);
    if cacheable {
        match state.cache.get_json::<PageResponse>(&key).await {
            Ok(Some(page)) => return Ok(Json(page)),
            Ok(None) => {}
            Err(e) => warn!("recent cache read failed, falling back to upstream: {}", e),
        }
    }

    let page = if query.coin.is_some() || query.user.is_some() {
        // Filtered lookbacks go through the historical endpoint with the
        // equivalent start_time encoding.
        let filter = LiquidationFilter {
            coin: query.coin,
            user: query.user,
            start_time: Some(Utc::now().timestamp_millis() - i64::from(hours) * 3_600_000),
            end_time: None,
            amount_dollars: None,
        };
        state
            .client
            .fetch_page(&filter, query.cursor.as_deref(), limit, order)
            .await?
    } else {
        state
            .client
            .fetch_recent_page(hours, query.cursor.as_deref(), limit, order)
            .await?
    };

    if cacheable {
        if let Err(e) = state.cache.set_json(&key, &page, state.recent_ttl).await {
            warn!("failed to cache recent page '{}': {}", key, e);
        }
    }

    Ok(Json(page))
}

/// Per-period statistics blob.
/// GET /liquidations/stats/all
async fn stats_all_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsAllData>, ApiError> {
    let stats: Option<StatsAllData> = state.cache.get_json(KEY_STATS_ALL).await?;
    stats.map(Json).ok_or(ApiError::SnapshotNotReady)
}

/// Per-period chart blob.
/// GET /liquidations/chart-data?period=4h
async fn chart_data_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChartQuery>,
) -> Result<Json<ChartData>, ApiError> {
    let period = Period::parse(&query.period).ok_or_else(|| {
        ApiError::Validation(format!(
            "period must be one of 2h, 4h, 8h, 12h, 24h, got '{}'",
            query.period
        ))
    })?;

    let chart: Option<ChartData> = state.cache.get_json(&chart_key(period.as_str())).await?;
    chart.map(Json).ok_or(ApiError::SnapshotNotReady)
}

/// Composite per-period blob.
/// GET /liquidations/data
async fn all_data_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<AllPeriodsData>, ApiError> {
    let data: Option<AllPeriodsData> = state.cache.get_json(KEY_ALL_DATA).await?;
    data.map(Json).ok_or(ApiError::SnapshotNotReady)
}

/// Stream connection statistics.
/// GET /liquidations/stream/stats
async fn stream_stats_handler(State(state): State<Arc<AppState>>) -> Json<StreamStats> {
    Json(state.registry.stats())
}

/// Live SSE stream of liquidations with per-session filters and resume.
/// GET /liquidations/stream
async fn stream_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Response {
    let filter = StreamFilter {
        coin: query.coin,
        min_notional: query.min_amount_dollars,
        user: query.user,
    };
    let resume_from = query.last_event_id.or_else(|| header_last_event_id(&headers));

    let (session, rx) = match state.registry.attach(addr.ip(), filter, resume_from) {
        Ok(pair) => pair,
        Err(e) => return ApiError::from(e).into_response(),
    };

    // Replay runs as its own task so it never delays the response headers or
    // live delivery.
    if let Some(resume_from) = resume_from {
        let cache = state.cache.clone();
        let client = state.client.clone();
        let session = session.clone();
        tokio::spawn(async move {
            replay_missed(&session, &cache, &client, resume_from).await;
        });
    }

    let stream = SessionStream::new(state.registry.clone(), session.id, rx);
    (
        [
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (header::CONNECTION, HeaderValue::from_static("keep-alive")),
            (
                HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        Sse::new(stream),
    )
        .into_response()
}

fn header_last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

// ============================================================================
// Validation
// ============================================================================

fn validate_limit(limit: u32) -> Result<(), ApiError> {
    if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
        return Err(ApiError::Validation(format!(
            "limit must be within 1..={}, got {}",
            MAX_PAGE_LIMIT, limit
        )));
    }
    Ok(())
}

fn validate_hours(hours: u32) -> Result<(), ApiError> {
    if !(1..=MAX_RECENT_HOURS).contains(&hours) {
        return Err(ApiError::Validation(format!(
            "hours must be within 1..={}, got {}",
            MAX_RECENT_HOURS, hours
        )));
    }
    Ok(())
}

fn parse_order(order: Option<&str>) -> Result<SortOrder, ApiError> {
    match order {
        None => Ok(SortOrder::Desc),
        Some(s) => SortOrder::parse(s).ok_or_else(|| {
            ApiError::Validation(format!("order must be ASC or DESC, got '{}'", s))
        }),
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// API error taxonomy. Internal detail never crosses the boundary; clients
/// see a stable code plus an opaque correlation identifier that is also
/// logged server-side.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    UpstreamUnavailable,
    UpstreamRateLimited { retry_after: Option<Duration> },
    ConnectionLimit,
    SnapshotNotReady,
    CacheUnavailable,
    Internal(String),
}

impl From<external_services::Error> for ApiError {
    fn from(e: external_services::Error) -> Self {
        use external_services::Error;
        match e {
            Error::RateLimited { retry_after } => ApiError::UpstreamRateLimited {
                retry_after: Some(retry_after),
            },
            Error::UpstreamStatus(429) => ApiError::UpstreamRateLimited { retry_after: None },
            Error::CircuitOpen | Error::Http(_) | Error::UpstreamStatus(_)
            | Error::InvalidResponse(_) => ApiError::UpstreamUnavailable,
            Error::InvalidRequest(message) => ApiError::Validation(message),
            Error::Redis(_) => ApiError::CacheUnavailable,
            Error::Json(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(_: AdmissionError) -> Self {
        ApiError::ConnectionLimit
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: String,
    code: &'static str,
    correlation_id: Uuid,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4();
        let (status, code, message, retry_after) = match self {
            ApiError::Validation(message) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message, None)
            }
            ApiError::UpstreamUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "UPSTREAM_UNAVAILABLE",
                "upstream data source unavailable".to_string(),
                None,
            ),
            ApiError::UpstreamRateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "UPSTREAM_RATE_LIMITED",
                "upstream rate limit reached, retry later".to_string(),
                retry_after,
            ),
            ApiError::ConnectionLimit => (
                StatusCode::TOO_MANY_REQUESTS,
                "SSE_CONNECTION_LIMIT",
                "stream connection limit reached".to_string(),
                None,
            ),
            ApiError::SnapshotNotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SNAPSHOT_NOT_READY",
                "snapshot not computed yet, retry shortly".to_string(),
                None,
            ),
            ApiError::CacheUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CACHE_UNAVAILABLE",
                "cache temporarily unavailable".to_string(),
                None,
            ),
            ApiError::Internal(detail) => {
                error!("internal error [{}]: {}", correlation_id, detail);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal error".to_string(),
                    None,
                )
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code,
            correlation_id,
        });
        let mut response = (status, body).into_response();

        if let Some(retry_after) = retry_after {
            let secs = retry_after.as_secs().max(1).to_string();
            if let Ok(value) = HeaderValue::from_str(&secs) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_order() {
        assert_eq!(parse_order(None).unwrap(), SortOrder::Desc);
        assert_eq!(parse_order(Some("asc")).unwrap(), SortOrder::Asc);
        assert!(parse_order(Some("upwards")).is_err());
    }

    #[test]
    fn test_limit_and_hours_bounds() {
        assert!(validate_limit(1).is_ok());
        assert!(validate_limit(1000).is_ok());
        assert!(validate_limit(0).is_err());
        assert!(validate_limit(1001).is_err());

        assert!(validate_hours(1).is_ok());
        assert!(validate_hours(168).is_ok());
        assert!(validate_hours(0).is_err());
        assert!(validate_hours(169).is_err());
    }

    #[test]
    fn test_header_last_event_id() {
        let mut headers = HeaderMap::new();
        assert_eq!(header_last_event_id(&headers), None);

        headers.insert("Last-Event-ID", HeaderValue::from_static(" 12345 "));
        assert_eq!(header_last_event_id(&headers), Some(12345));

        headers.insert("Last-Event-ID", HeaderValue::from_static("not-a-tid"));
        assert_eq!(header_last_event_id(&headers), None);
    }

    #[test]
    fn test_upstream_error_mapping() {
        let mapped = ApiError::from(external_services::Error::CircuitOpen);
        assert!(matches!(mapped, ApiError::UpstreamUnavailable));

        let mapped = ApiError::from(external_services::Error::UpstreamStatus(429));
        assert!(matches!(
            mapped,
            ApiError::UpstreamRateLimited { retry_after: None }
        ));

        let mapped = ApiError::from(external_services::Error::RateLimited {
            retry_after: Duration::from_secs(7),
        });
        assert!(matches!(
            mapped,
            ApiError::UpstreamRateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(7)
        ));

        let mapped = ApiError::from(AdmissionError::IpLimit);
        assert!(matches!(mapped, ApiError::ConnectionLimit));
    }
}
