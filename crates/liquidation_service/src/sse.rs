//! SSE session registry and local fan-out.
//!
//! Sessions are process-local: every instance keeps its own registry and the
//! broadcast bus replays each published batch into it. Frames flow to each
//! session through a bounded channel; `try_send` is the backpressure cutoff.
//! A full channel means a consumer too slow to keep up, a closed one means a
//! disconnect, and either drops the session without blocking the bus.

use chrono::Utc;
use dashmap::DashMap;
use external_services::hyperliquid::{Liquidation, PageResponse, SortOrder};
use external_services::redis_client::recent_key;
use external_services::{CacheClient, Error as UpstreamError};
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Events replayed to a resuming session are bounded by this limit.
pub const MISSED_DATA_LIMIT: usize = 100;

/// Lookback used when replaying missed events to a resuming session.
const RESUME_LOOKBACK_HOURS: u32 = 1;

/// Unique session identifier.
pub type SessionId = Uuid;

/// Per-session delivery filter. All provided fields are ANDed.
#[derive(Debug, Clone, Default)]
pub struct StreamFilter {
    /// Case-insensitive market symbol equality.
    pub coin: Option<String>,
    /// Minimum USD notional.
    pub min_notional: Option<f64>,
    /// Case-insensitive liquidated-wallet equality.
    pub user: Option<String>,
}

impl StreamFilter {
    pub fn matches(&self, event: &Liquidation) -> bool {
        if let Some(coin) = &self.coin {
            if !coin.eq_ignore_ascii_case(&event.coin) {
                return false;
            }
        }
        if let Some(min_notional) = self.min_notional {
            if event.notional < min_notional {
                return false;
            }
        }
        if let Some(user) = &self.user {
            if !user.eq_ignore_ascii_case(&event.liquidated_user) {
                return false;
            }
        }
        true
    }
}

/// One frame on the event-stream wire.
#[derive(Debug, Clone)]
pub enum SseFrame {
    Connected { session_id: SessionId },
    Liquidation { tid: u64, payload: String },
    Heartbeat { ts: i64 },
    Error { code: &'static str, message: String },
}

impl SseFrame {
    /// Render as an `id:`/`event:`/`data:` record.
    pub fn into_event(self) -> axum::response::sse::Event {
        let event = axum::response::sse::Event::default();
        match self {
            SseFrame::Connected { session_id } => event
                .event("connected")
                .data(json!({"status": "connected", "sessionId": session_id}).to_string()),
            SseFrame::Liquidation { tid, payload } => {
                event.id(tid.to_string()).event("liquidation").data(payload)
            }
            SseFrame::Heartbeat { ts } => event.event("heartbeat").data(json!({"ts": ts}).to_string()),
            SseFrame::Error { code, message } => event
                .event("error")
                .data(json!({"code": code, "message": message}).to_string()),
        }
    }
}

/// State for one attached streaming session.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub ip: IpAddr,
    pub filter: StreamFilter,
    /// Timestamp when the session attached, epoch milliseconds.
    pub connected_at: i64,
    tx: mpsc::Sender<SseFrame>,
    last_event_id: AtomicU64,
}

impl Session {
    /// Highest `tid` delivered to (or resumed past) this session.
    pub fn last_event_id(&self) -> u64 {
        self.last_event_id.load(Ordering::Relaxed)
    }

    fn advance_last_event_id(&self, tid: u64) {
        self.last_event_id.fetch_max(tid, Ordering::Relaxed);
    }

    fn try_send(&self, frame: SseFrame) -> std::result::Result<(), ()> {
        self.tx.try_send(frame).map_err(|_| ())
    }
}

/// Why a new session was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("total connection limit reached")]
    TotalLimit,
    #[error("per-ip connection limit reached")]
    IpLimit,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum sessions in this process.
    pub max_connections: usize,
    /// Maximum sessions per source IP.
    pub max_per_ip: usize,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Per-session frame buffer; a full buffer drops the session.
    pub session_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            max_per_ip: 3,
            heartbeat_interval: Duration::from_secs(30),
            session_buffer: 256,
        }
    }
}

/// Stream connection statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub total_connections: usize,
    pub unique_ips: usize,
}

/// Registry of attached streaming sessions.
pub struct SseRegistry {
    config: RegistryConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
    per_ip: DashMap<IpAddr, usize>,
}

impl SseRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            per_ip: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Admit and register a new session. On success the `connected` control
    /// frame is already queued and the receiver drives the response body.
    pub fn attach(
        &self,
        ip: IpAddr,
        filter: StreamFilter,
        resume_from: Option<u64>,
    ) -> std::result::Result<(Arc<Session>, mpsc::Receiver<SseFrame>), AdmissionError> {
        if self.sessions.len() >= self.config.max_connections {
            counter!("liquidation_sse_admission_rejected_total", "reason" => "total")
                .increment(1);
            return Err(AdmissionError::TotalLimit);
        }

        {
            let mut count = self.per_ip.entry(ip).or_insert(0);
            if *count >= self.config.max_per_ip {
                let stale = *count == 0;
                drop(count);
                if stale {
                    self.per_ip.remove_if(&ip, |_, c| *c == 0);
                }
                counter!("liquidation_sse_admission_rejected_total", "reason" => "per_ip")
                    .increment(1);
                return Err(AdmissionError::IpLimit);
            }
            *count += 1;
        }

        let (tx, rx) = mpsc::channel(self.config.session_buffer);
        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            ip,
            filter,
            connected_at: Utc::now().timestamp_millis(),
            tx,
            last_event_id: AtomicU64::new(resume_from.unwrap_or(0)),
        });

        // Fresh channel: the connected frame always has room.
        let _ = session.try_send(SseFrame::Connected {
            session_id: session.id,
        });

        self.sessions.insert(session.id, session.clone());
        counter!("liquidation_sse_connections_total").increment(1);
        gauge!("liquidation_sse_active_connections").set(self.sessions.len() as f64);
        info!("session {} attached from {}", session.id, ip);

        Ok((session, rx))
    }

    /// Remove a session. Idempotent.
    pub fn detach(&self, session_id: &SessionId) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            let remove_ip = if let Some(mut count) = self.per_ip.get_mut(&session.ip) {
                *count = count.saturating_sub(1);
                *count == 0
            } else {
                false
            };
            if remove_ip {
                self.per_ip.remove_if(&session.ip, |_, count| *count == 0);
            }

            counter!("liquidation_sse_disconnections_total").increment(1);
            gauge!("liquidation_sse_active_connections").set(self.sessions.len() as f64);
            debug!("session {} detached", session_id);
        }
    }

    /// Fan a batch of new events out to every attached session.
    ///
    /// `events` must be ascending by `tid` (the refresh loop publishes them
    /// that way). A session receives an event iff its filter matches and the
    /// `tid` is beyond its `last_event_id`, so re-delivered batches are
    /// harmless. Sessions whose channel refuses a frame are dropped.
    pub fn broadcast_local(&self, events: &[Liquidation]) {
        if events.is_empty() || self.sessions.is_empty() {
            return;
        }

        // Serialize each event once, not once per session.
        let prepared: Vec<(&Liquidation, String)> = events
            .iter()
            .filter_map(|event| {
                serde_json::to_string(event)
                    .ok()
                    .map(|payload| (event, payload))
            })
            .collect();

        let mut dead: Vec<SessionId> = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            for (event, payload) in &prepared {
                if event.tid <= session.last_event_id() {
                    continue;
                }
                if !session.filter.matches(event) {
                    continue;
                }

                let frame = SseFrame::Liquidation {
                    tid: event.tid,
                    payload: payload.clone(),
                };
                if session.try_send(frame).is_ok() {
                    session.advance_last_event_id(event.tid);
                    counter!("liquidation_sse_events_delivered_total").increment(1);
                } else {
                    warn!("dropping slow or closed session {}", session.id);
                    counter!("liquidation_sse_sessions_dropped_total").increment(1);
                    dead.push(session.id);
                    break;
                }
            }
        }

        for session_id in dead {
            self.detach(&session_id);
        }
    }

    /// Write a heartbeat frame to every session; failures detach.
    pub fn heartbeat_tick(&self) {
        let ts = Utc::now().timestamp_millis();
        let mut dead: Vec<SessionId> = Vec::new();

        for entry in self.sessions.iter() {
            if entry.value().try_send(SseFrame::Heartbeat { ts }).is_err() {
                dead.push(*entry.key());
            }
        }

        for session_id in dead {
            debug!("session {} failed heartbeat", session_id);
            self.detach(&session_id);
        }
    }

    /// Close every session with a terminating control frame.
    pub fn shutdown(&self) {
        let count = self.sessions.len();
        for entry in self.sessions.iter() {
            let _ = entry.value().try_send(SseFrame::Error {
                code: "SERVER_SHUTDOWN",
                message: "server shutting down".to_string(),
            });
        }
        self.sessions.clear();
        self.per_ip.clear();
        gauge!("liquidation_sse_active_connections").set(0.0);
        if count > 0 {
            info!("closed {} streaming sessions", count);
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            total_connections: self.sessions.len(),
            unique_ips: self.per_ip.len(),
        }
    }
}

/// Heartbeat timer task.
pub async fn run_heartbeat(registry: Arc<SseRegistry>, mut shutdown_rx: mpsc::Receiver<()>) {
    let mut ticker = tokio::time::interval(registry.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("heartbeat task received shutdown signal");
                break;
            }

            _ = ticker.tick() => {
                registry.heartbeat_tick();
            }
        }
    }
}

/// Replay events a resuming session missed while disconnected.
///
/// Sources the last hour from the cache when available, otherwise one
/// upstream page; bounded by [`MISSED_DATA_LIMIT`]. Overflow is signalled
/// with a `RESUME_TRUNCATED` error frame after the replayed events. Runs
/// as its own task so a slow replay never blocks live delivery.
pub async fn replay_missed(
    session: &Arc<Session>,
    cache: &CacheClient,
    client: &external_services::hyperliquid::LiquidationsClient,
    resume_from: u64,
) {
    let page = match cached_recent_window(cache).await {
        Some(page) => page,
        None => {
            let fetched = client
                .fetch_recent_page(
                    RESUME_LOOKBACK_HOURS,
                    None,
                    MISSED_DATA_LIMIT as u32,
                    SortOrder::Desc,
                )
                .await;
            match fetched {
                Ok(page) => page,
                Err(UpstreamError::RateLimited { .. }) | Err(UpstreamError::CircuitOpen) => {
                    // Live delivery still works; the client just loses replay.
                    warn!("resume replay skipped for {}: upstream gated", session.id);
                    return;
                }
                Err(e) => {
                    warn!("resume replay fetch failed for {}: {}", session.id, e);
                    return;
                }
            }
        }
    };

    let missed = select_missed(&page.data, resume_from, &session.filter);

    let mut delivered = 0usize;
    for event in missed {
        // Live broadcasts can reach the session while replay runs; the same
        // guard as broadcast_local keeps delivery ascending and duplicate-free.
        if event.tid <= session.last_event_id() {
            continue;
        }
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(_) => continue,
        };
        if session
            .try_send(SseFrame::Liquidation {
                tid: event.tid,
                payload,
            })
            .is_err()
        {
            return;
        }
        session.advance_last_event_id(event.tid);
        delivered += 1;
    }

    if page.has_more {
        let _ = session.try_send(SseFrame::Error {
            code: "RESUME_TRUNCATED",
            message: format!(
                "missed events exceeded the replay limit of {}",
                MISSED_DATA_LIMIT
            ),
        });
    }

    if delivered > 0 {
        debug!("replayed {} missed events to {}", delivered, session.id);
        counter!("liquidation_sse_resume_replayed_total").increment(delivered as u64);
    }
}

/// Events a resuming session should see first: beyond its resume point,
/// matching its filter, ascending by `tid`.
fn select_missed<'a>(
    events: &'a [Liquidation],
    resume_from: u64,
    filter: &StreamFilter,
) -> Vec<&'a Liquidation> {
    let mut missed: Vec<&Liquidation> = events
        .iter()
        .filter(|event| event.tid > resume_from && filter.matches(event))
        .collect();
    missed.sort_by_key(|event| event.tid);
    missed
}

async fn cached_recent_window(cache: &CacheClient) -> Option<PageResponse> {
    let key = recent_key(RESUME_LOOKBACK_HOURS, MISSED_DATA_LIMIT as u32);
    match cache.get_json::<PageResponse>(&key).await {
        Ok(page) => page,
        Err(e) => {
            warn!("resume replay cache read failed: {}", e);
            None
        }
    }
}

/// Response body stream for one session. Dropping the stream (client
/// disconnect, write error, server shutdown) detaches the session.
pub struct SessionStream {
    registry: Arc<SseRegistry>,
    session_id: SessionId,
    rx: mpsc::Receiver<SseFrame>,
}

impl SessionStream {
    pub fn new(
        registry: Arc<SseRegistry>,
        session_id: SessionId,
        rx: mpsc::Receiver<SseFrame>,
    ) -> Self {
        Self {
            registry,
            session_id,
            rx,
        }
    }
}

impl futures::Stream for SessionStream {
    type Item = std::result::Result<axum::response::sse::Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.rx
            .poll_recv(cx)
            .map(|frame| frame.map(|f| Ok(f.into_event())))
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.registry.detach(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use external_services::hyperliquid::Side;

    fn test_ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn liq(tid: u64, coin: &str, notional: f64, user: &str) -> Liquidation {
        let time = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        Liquidation {
            tid,
            time,
            time_ms: time.timestamp_millis(),
            coin: coin.to_string(),
            dir: Side::Long,
            notional,
            mark_price: 0.0,
            liquidated_user: user.to_string(),
            liquidators: vec![],
        }
    }

    fn registry(max_connections: usize, max_per_ip: usize) -> SseRegistry {
        SseRegistry::new(RegistryConfig {
            max_connections,
            max_per_ip,
            ..Default::default()
        })
    }

    #[test]
    fn test_filter_semantics() {
        let event = liq(1, "BTC", 5000.0, "0xAbC");

        assert!(StreamFilter::default().matches(&event));
        assert!(StreamFilter {
            coin: Some("btc".to_string()),
            ..Default::default()
        }
        .matches(&event));
        assert!(!StreamFilter {
            coin: Some("ETH".to_string()),
            ..Default::default()
        }
        .matches(&event));
        assert!(StreamFilter {
            min_notional: Some(5000.0),
            ..Default::default()
        }
        .matches(&event));
        assert!(!StreamFilter {
            min_notional: Some(5000.01),
            ..Default::default()
        }
        .matches(&event));
        assert!(StreamFilter {
            user: Some("0xABC".to_string()),
            ..Default::default()
        }
        .matches(&event));

        // Provided filters are ANDed.
        assert!(!StreamFilter {
            coin: Some("BTC".to_string()),
            min_notional: Some(10_000.0),
            user: None,
        }
        .matches(&event));
    }

    #[tokio::test]
    async fn test_attach_sends_connected_frame_first() {
        let registry = registry(10, 3);
        let (session, mut rx) = registry
            .attach(test_ip(1), StreamFilter::default(), None)
            .unwrap();

        match rx.recv().await {
            Some(SseFrame::Connected { session_id }) => assert_eq!(session_id, session.id),
            other => panic!("expected connected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_per_ip_admission_limit() {
        let registry = registry(10, 3);
        let mut receivers = Vec::new();

        for _ in 0..3 {
            let (_, rx) = registry
                .attach(test_ip(1), StreamFilter::default(), None)
                .unwrap();
            receivers.push(rx);
        }

        // 4th from the same IP is refused; another IP is fine.
        assert_eq!(
            registry
                .attach(test_ip(1), StreamFilter::default(), None)
                .unwrap_err(),
            AdmissionError::IpLimit
        );
        assert!(registry
            .attach(test_ip(2), StreamFilter::default(), None)
            .is_ok());

        let stats = registry.stats();
        assert_eq!(stats.total_connections, 4);
        assert_eq!(stats.unique_ips, 2);
    }

    #[tokio::test]
    async fn test_total_admission_limit() {
        let registry = registry(2, 10);
        let _a = registry.attach(test_ip(1), StreamFilter::default(), None).unwrap();
        let _b = registry.attach(test_ip(2), StreamFilter::default(), None).unwrap();

        assert_eq!(
            registry
                .attach(test_ip(3), StreamFilter::default(), None)
                .unwrap_err(),
            AdmissionError::TotalLimit
        );
    }

    #[tokio::test]
    async fn test_detach_frees_per_ip_slot() {
        let registry = registry(10, 1);
        let (session, _rx) = registry
            .attach(test_ip(1), StreamFilter::default(), None)
            .unwrap();
        assert!(registry
            .attach(test_ip(1), StreamFilter::default(), None)
            .is_err());

        registry.detach(&session.id);
        registry.detach(&session.id); // idempotent
        assert!(registry
            .attach(test_ip(1), StreamFilter::default(), None)
            .is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_filters_and_orders() {
        let registry = registry(10, 3);
        let filter = StreamFilter {
            coin: Some("BTC".to_string()),
            ..Default::default()
        };
        let (_session, mut rx) = registry.attach(test_ip(1), filter, Some(100)).unwrap();
        assert!(matches!(rx.recv().await, Some(SseFrame::Connected { .. })));

        let events = vec![
            liq(101, "ETH", 100.0, "0xa"),
            liq(102, "BTC", 200.0, "0xb"),
            liq(103, "ETH", 300.0, "0xc"),
            liq(104, "btc", 400.0, "0xd"),
        ];
        registry.broadcast_local(&events);

        let mut delivered = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let SseFrame::Liquidation { tid, .. } = frame {
                delivered.push(tid);
            }
        }
        assert_eq!(delivered, vec![102, 104]);
    }

    #[tokio::test]
    async fn test_duplicate_broadcast_is_idempotent() {
        let registry = registry(10, 3);
        let (session, mut rx) = registry
            .attach(test_ip(1), StreamFilter::default(), None)
            .unwrap();
        assert!(matches!(rx.recv().await, Some(SseFrame::Connected { .. })));

        let events = vec![liq(5, "BTC", 10.0, "0xa"), liq(6, "BTC", 20.0, "0xb")];
        registry.broadcast_local(&events);
        registry.broadcast_local(&events);

        let mut delivered = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let SseFrame::Liquidation { tid, .. } = frame {
                delivered.push(tid);
            }
        }
        assert_eq!(delivered, vec![5, 6]);
        assert_eq!(session.last_event_id(), 6);
    }

    #[tokio::test]
    async fn test_resume_guard_skips_old_events() {
        let registry = registry(10, 3);
        let (_session, mut rx) = registry
            .attach(test_ip(1), StreamFilter::default(), Some(50))
            .unwrap();
        assert!(matches!(rx.recv().await, Some(SseFrame::Connected { .. })));

        registry.broadcast_local(&[liq(49, "BTC", 1.0, "0xa"), liq(51, "BTC", 2.0, "0xb")]);

        let mut delivered = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let SseFrame::Liquidation { tid, .. } = frame {
                delivered.push(tid);
            }
        }
        assert_eq!(delivered, vec![51]);
    }

    #[tokio::test]
    async fn test_slow_consumer_dropped() {
        let registry = SseRegistry::new(RegistryConfig {
            max_connections: 10,
            max_per_ip: 3,
            session_buffer: 1,
            ..Default::default()
        });
        // The connected frame fills the single-slot buffer; nothing reads it.
        let (_session, _rx) = registry
            .attach(test_ip(1), StreamFilter::default(), None)
            .unwrap();

        registry.broadcast_local(&[liq(1, "BTC", 1.0, "0xa")]);
        assert_eq!(registry.stats().total_connections, 0);
    }

    #[test]
    fn test_select_missed_resumes_in_order() {
        // Window observed newest-first, BTC-filtered session resuming at 100.
        let window = vec![
            liq(105, "ETH", 10.0, "0xa"),
            liq(104, "BTC", 10.0, "0xb"),
            liq(103, "ETH", 10.0, "0xc"),
            liq(102, "BTC", 10.0, "0xd"),
            liq(101, "ETH", 10.0, "0xe"),
            liq(100, "BTC", 10.0, "0xf"),
        ];
        let filter = StreamFilter {
            coin: Some("BTC".to_string()),
            ..Default::default()
        };

        let missed = select_missed(&window, 100, &filter);
        let tids: Vec<u64> = missed.iter().map(|e| e.tid).collect();
        assert_eq!(tids, vec![102, 104]);
    }

    #[tokio::test]
    async fn test_heartbeat_detaches_closed_sessions() {
        let registry = registry(10, 3);
        let (_session, rx) = registry
            .attach(test_ip(1), StreamFilter::default(), None)
            .unwrap();
        assert_eq!(registry.stats().total_connections, 1);

        drop(rx);
        registry.heartbeat_tick();
        assert_eq!(registry.stats().total_connections, 0);
    }

    #[tokio::test]
    async fn test_shutdown_sends_terminating_frame() {
        let registry = registry(10, 3);
        let (_session, mut rx) = registry
            .attach(test_ip(1), StreamFilter::default(), None)
            .unwrap();
        assert!(matches!(rx.recv().await, Some(SseFrame::Connected { .. })));

        registry.shutdown();
        match rx.recv().await {
            Some(SseFrame::Error { code, .. }) => assert_eq!(code, "SERVER_SHUTDOWN"),
            other => panic!("expected shutdown frame, got {:?}", other),
        }
        assert_eq!(registry.stats().total_connections, 0);
        assert_eq!(registry.stats().unique_ips, 0);
    }
}
