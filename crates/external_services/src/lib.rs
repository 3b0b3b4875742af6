//! External service clients library.
//!
//! This library provides access to the upstream liquidations indexer plus the
//! shared Redis cache/pub-sub client used by the service crate:
//! - Hyperliquid indexer: paginated liquidation history and rolling-window
//!   "recent" endpoints, gated by a circuit breaker and a request-weight
//!   rate limiter
//! - Redis: snapshot cache with TTLs, the monotonic last-observed-id marker,
//!   and the broadcast pub/sub channel
//!
//! # Example
//!
//! ```ignore
//! use external_services::hyperliquid::{LiquidationsClient, SortOrder};
//! use external_services::CacheClient;
//!
//! let client = LiquidationsClient::with_base_url("https://api.hypurrscan.io")?;
//! let page = client.fetch_recent_page(24, None, 1000, SortOrder::Desc).await?;
//!
//! let cache = CacheClient::new("redis://localhost:6379")?;
//! let last_tid = cache.get_last_tid().await?;
//! ```

pub mod breaker;
pub mod error;
pub mod hyperliquid;
pub mod limiter;
pub mod redis_client;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use error::{Error, Result};
pub use limiter::{LimiterConfig, RequestWeightLimiter};
pub use redis_client::{chart_key, recent_key, CacheClient, BROADCAST_CHANNEL, KEY_ALL_DATA, KEY_LAST_TID, KEY_STATS_ALL};
