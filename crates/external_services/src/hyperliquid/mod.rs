//! Liquidations indexer API: typed events and the paginated REST client.

pub mod client;
pub mod types;

pub use client::{ClientConfig, LiquidationsClient, MAX_PAGE_LIMIT, MAX_RECENT_HOURS};
pub use types::{
    normalize_events, Liquidation, LiquidationFilter, PageResponse, Side, SortOrder,
};
