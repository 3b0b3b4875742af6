//! Liquidation feed service: cached snapshots plus live SSE fan-out.
//!
//! This service:
//! - Polls the upstream liquidations indexer on a timer (single writer)
//! - Maintains derived stats/chart blobs for five sliding windows in Redis
//! - Publishes newly observed events on a Redis pub/sub channel
//! - Fans events out to locally attached SSE sessions with per-session
//!   filters, resume-after-disconnect, and admission limits
//!
//! ## Architecture
//!
//! ```text
//! upstream indexer (REST, paginated)
//!         ↓ refresh loop (single writer, coalesced)
//! Redis: derived blobs + last-tid marker + pub/sub channel
//!         ↓ broadcast bus (every instance subscribes)
//! SseRegistry (DashMap, bounded per-session channels)
//!         ↓
//! SSE clients
//! ```
//!
//! Read endpoints consult the cache only; any instance may accept a stream
//! connection because each one independently receives every broadcast.

pub mod api;
pub mod broadcast;
pub mod error;
pub mod refresh;
pub mod sse;
pub mod views;

pub use api::{create_router, AppState};
pub use broadcast::{BroadcastBus, BroadcastMessage};
pub use error::{Error, Result};
pub use refresh::{RefreshConfig, RefreshService};
pub use sse::{
    run_heartbeat, AdmissionError, RegistryConfig, SseRegistry, StreamFilter, StreamStats,
    MISSED_DATA_LIMIT,
};
pub use views::{build_views, AllPeriodsData, ChartData, Period, PeriodStats, StatsAllData};
