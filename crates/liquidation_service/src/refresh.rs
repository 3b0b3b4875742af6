//! Timer-driven refresh loop: the single writer of the snapshot cache.
//!
//! Each pass drains the upstream rolling window, rebuilds the derived views
//! from that one snapshot, publishes the newly observed events on the
//! broadcast channel, and advances the shared last-observed-id marker. A
//! coalesce guard keeps at most one pass active per process; overlapping
//! passes across instances only cause duplicate broadcasts, which the
//! per-session `tid` guard absorbs.

use crate::broadcast::BroadcastMessage;
use crate::error::Result;
use crate::views::{build_views, AllPeriodsData, Period};
use chrono::Utc;
use external_services::hyperliquid::{Liquidation, LiquidationsClient, SortOrder};
use external_services::redis_client::{chart_key, BROADCAST_CHANNEL, KEY_ALL_DATA, KEY_STATS_ALL};
use external_services::CacheClient;
use metrics::{counter, gauge};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Refresh loop configuration.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Steady-state pass cadence.
    pub interval: Duration,
    /// Delay before the first pass after startup.
    pub initial_delay: Duration,
    /// Rolling-window lookback.
    pub window_hours: u32,
    /// Page size per upstream fetch.
    pub page_limit: u32,
    /// Soft cap on pages per pass.
    pub max_pages: usize,
    /// Pause between pages, yielding to the rate limiter.
    pub page_delay: Duration,
    /// TTL for the derived blobs; must be >= `interval`.
    pub derived_ttl: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(5),
            window_hours: 24,
            page_limit: 1000,
            max_pages: 5,
            page_delay: Duration::from_millis(350),
            derived_ttl: Duration::from_secs(180),
        }
    }
}

struct PassOutcome {
    window_events: usize,
    delta_events: usize,
    pages: usize,
    complete: bool,
}

/// The single-writer refresh service.
pub struct RefreshService {
    client: Arc<LiquidationsClient>,
    cache: CacheClient,
    config: RefreshConfig,
    refreshing: AtomicBool,
    /// In-process mirror of the marker, used when the cache is unreachable.
    last_tid_seen: AtomicU64,
}

impl RefreshService {
    pub fn new(client: Arc<LiquidationsClient>, cache: CacheClient, config: RefreshConfig) -> Self {
        Self {
            client,
            cache,
            config,
            refreshing: AtomicBool::new(false),
            last_tid_seen: AtomicU64::new(0),
        }
    }

    /// Run the refresh loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        info!(
            "Starting refresh loop (first pass in {:?}, interval {:?})",
            self.config.initial_delay, self.config.interval
        );

        let first_tick = tokio::time::Instant::now() + self.config.initial_delay;
        let mut ticker = tokio::time::interval_at(first_tick, self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("refresh loop received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Refresh loop stopped");
    }

    async fn tick(&self) {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            debug!("refresh pass still running, skipping tick");
            counter!("liquidation_refresh_coalesced_total").increment(1);
            return;
        }

        let started = std::time::Instant::now();
        let result = self.refresh_pass().await;
        self.refreshing.store(false, Ordering::SeqCst);

        match result {
            Ok(outcome) => {
                info!(
                    "refresh pass: {} events ({} new) over {} pages in {:?}{}",
                    outcome.window_events,
                    outcome.delta_events,
                    outcome.pages,
                    started.elapsed(),
                    if outcome.complete { "" } else { " [partial]" }
                );
                counter!("liquidation_refresh_passes_total", "outcome" => "ok").increment(1);
                gauge!("liquidation_refresh_window_events").set(outcome.window_events as f64);
            }
            Err(e) => {
                // Cached blobs and the marker stay untouched; next tick retries.
                warn!("refresh pass failed, skipping cycle: {}", e);
                counter!("liquidation_refresh_passes_total", "outcome" => "error").increment(1);
            }
        }
    }

    async fn refresh_pass(&self) -> Result<PassOutcome> {
        let (window, pages, complete) = self.drain_window().await?;
        let window = dedup_by_tid(window);

        let last_tid = self.read_marker().await;
        let delta = delta_after(&window, last_tid);

        // One scan of one window; all blobs of this pass agree.
        let views = build_views(&window, Utc::now());
        self.write_views(&views).await;

        let delta_events = delta.len();
        if !delta.is_empty() {
            let max_tid = window.iter().map(|e| e.tid).max().unwrap_or(last_tid);
            match self.publish_delta(delta).await {
                Ok(()) => self.advance_marker(max_tid).await,
                // Leave the marker so the delta is re-published next pass;
                // duplicate delivery is suppressed per session.
                Err(e) => warn!("broadcast publish failed, delta deferred: {}", e),
            }
        }

        Ok(PassOutcome {
            window_events: window.len(),
            delta_events,
            pages,
            complete,
        })
    }

    /// Drain up to `max_pages` of the rolling window, newest first.
    ///
    /// A failure on the first page fails the pass; a failure mid-pagination
    /// degrades to the partial window already assembled.
    async fn drain_window(&self) -> Result<(Vec<Liquidation>, usize, bool)> {
        let mut events: Vec<Liquidation> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        let mut complete = true;

        loop {
            let fetched = self
                .client
                .fetch_recent_page(
                    self.config.window_hours,
                    cursor.as_deref(),
                    self.config.page_limit,
                    SortOrder::Desc,
                )
                .await;

            let page = match fetched {
                Ok(page) => page,
                Err(e) if pages == 0 => return Err(e.into()),
                Err(e) => {
                    warn!(
                        "pagination aborted after {} pages, using partial window: {}",
                        pages, e
                    );
                    counter!("liquidation_refresh_partial_windows_total").increment(1);
                    complete = false;
                    break;
                }
            };

            pages += 1;
            events.extend(page.data);

            if !page.has_more || pages >= self.config.max_pages {
                break;
            }
            cursor = match page.next_cursor {
                Some(cursor) => Some(cursor),
                None => break,
            };

            tokio::time::sleep(self.config.page_delay).await;
        }

        Ok((events, pages, complete))
    }

    async fn read_marker(&self) -> u64 {
        match self.cache.get_last_tid().await {
            Ok(tid) => {
                self.last_tid_seen.fetch_max(tid, Ordering::Relaxed);
                self.last_tid_seen.load(Ordering::Relaxed)
            }
            Err(e) => {
                warn!("marker read failed, using in-process value: {}", e);
                counter!("liquidation_refresh_cache_errors_total").increment(1);
                self.last_tid_seen.load(Ordering::Relaxed)
            }
        }
    }

    async fn advance_marker(&self, tid: u64) {
        self.last_tid_seen.fetch_max(tid, Ordering::Relaxed);
        if let Err(e) = self.cache.set_last_tid_max(tid).await {
            warn!("marker write failed: {}", e);
            counter!("liquidation_refresh_cache_errors_total").increment(1);
        }
    }

    /// Write all derived blobs. Individual write failures degrade to a stale
    /// cache entry rather than failing the pass.
    async fn write_views(&self, views: &AllPeriodsData) {
        let ttl = self.config.derived_ttl;

        if let Err(e) = self.cache.set_json(KEY_ALL_DATA, views, ttl).await {
            warn!("failed to cache all-periods blob: {}", e);
            counter!("liquidation_refresh_cache_errors_total").increment(1);
        }

        let stats_all = views.stats_all();
        if let Err(e) = self.cache.set_json(KEY_STATS_ALL, &stats_all, ttl).await {
            warn!("failed to cache stats blob: {}", e);
            counter!("liquidation_refresh_cache_errors_total").increment(1);
        }

        for period in Period::ALL {
            let Some(view) = views.periods.get(period.as_str()) else {
                continue;
            };
            let key = chart_key(period.as_str());
            if let Err(e) = self.cache.set_json(&key, &view.chart, ttl).await {
                warn!("failed to cache chart blob '{}': {}", key, e);
                counter!("liquidation_refresh_cache_errors_total").increment(1);
            }
        }
    }

    async fn publish_delta(&self, delta: Vec<Liquidation>) -> Result<()> {
        let count = delta.len();
        let message = BroadcastMessage {
            events: delta,
            timestamp: Utc::now().timestamp_millis(),
        };
        let payload = serde_json::to_string(&message)?;
        self.cache.publish(BROADCAST_CHANNEL, &payload).await?;

        debug!("published {} new events on broadcast channel", count);
        counter!("liquidation_broadcast_published_total").increment(1);
        Ok(())
    }
}

/// Drop duplicate `tid`s, keeping the first occurrence and the input order.
fn dedup_by_tid(events: Vec<Liquidation>) -> Vec<Liquidation> {
    let mut seen: HashSet<u64> = HashSet::with_capacity(events.len());
    events
        .into_iter()
        .filter(|event| seen.insert(event.tid))
        .collect()
}

/// Events beyond the marker, ascending by `tid`.
fn delta_after(events: &[Liquidation], last_tid: u64) -> Vec<Liquidation> {
    let mut delta: Vec<Liquidation> = events
        .iter()
        .filter(|event| event.tid > last_tid)
        .cloned()
        .collect();
    delta.sort_by_key(|event| event.tid);
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use external_services::hyperliquid::Side;

    fn liq(tid: u64) -> Liquidation {
        let time = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Liquidation {
            tid,
            time,
            time_ms: time.timestamp_millis(),
            coin: "BTC".to_string(),
            dir: Side::Long,
            notional: 100.0,
            mark_price: 0.0,
            liquidated_user: "0xwallet".to_string(),
            liquidators: vec![],
        }
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let events = vec![liq(3), liq(1), liq(3), liq(2), liq(1)];
        let deduped = dedup_by_tid(events);
        let tids: Vec<u64> = deduped.iter().map(|e| e.tid).collect();
        assert_eq!(tids, vec![3, 1, 2]);
    }

    #[test]
    fn test_delta_filters_and_sorts_ascending() {
        let window = vec![liq(105), liq(101), liq(103), liq(99)];
        let delta = delta_after(&window, 100);
        let tids: Vec<u64> = delta.iter().map(|e| e.tid).collect();
        assert_eq!(tids, vec![101, 103, 105]);
    }

    #[test]
    fn test_delta_empty_when_marker_current() {
        let window = vec![liq(5), liq(6)];
        assert!(delta_after(&window, 6).is_empty());
        assert!(delta_after(&[], 0).is_empty());
    }
}
