//! Derived views over the rolling liquidation window.
//!
//! `build_views` is a pure function from one event list to the statistics and
//! time-bucket chart of every configured period, computed in a single scan.
//! The refresh loop publishes its output atomically, so all five period blobs
//! of one pass describe the same window.

use chrono::{DateTime, Utc};
use external_services::hyperliquid::Liquidation;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Aggregation horizon. The set is closed: every period has a fixed bucket
/// width chosen so charts stay between 24 and 48 points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    H2,
    H4,
    H8,
    H12,
    H24,
}

impl Period {
    pub const ALL: [Period; 5] = [Period::H2, Period::H4, Period::H8, Period::H12, Period::H24];

    pub fn hours(self) -> i64 {
        match self {
            Period::H2 => 2,
            Period::H4 => 4,
            Period::H8 => 8,
            Period::H12 => 12,
            Period::H24 => 24,
        }
    }

    pub fn bucket_width_ms(self) -> i64 {
        match self {
            Period::H2 | Period::H4 => 5 * 60_000,
            Period::H8 | Period::H12 => 15 * 60_000,
            Period::H24 => 30 * 60_000,
        }
    }

    pub fn span_ms(self) -> i64 {
        self.hours() * 3_600_000
    }

    pub fn bucket_count(self) -> usize {
        let width = self.bucket_width_ms();
        ((self.span_ms() + width - 1) / width) as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Period::H2 => "2h",
            Period::H4 => "4h",
            Period::H8 => "8h",
            Period::H12 => "12h",
            Period::H24 => "24h",
        }
    }

    /// Parse a client-supplied period string.
    pub fn parse(s: &str) -> Option<Period> {
        match s.trim() {
            "2h" => Some(Period::H2),
            "4h" => Some(Period::H4),
            "8h" => Some(Period::H8),
            "12h" => Some(Period::H12),
            "24h" => Some(Period::H24),
            _ => None,
        }
    }
}

/// Statistics over one period. Zero-valued (with `topCoin = "N/A"`) when the
/// period saw no events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodStats {
    pub total_volume: f64,
    pub count: u64,
    pub long_count: u64,
    pub short_count: u64,
    pub long_volume: f64,
    pub short_volume: f64,
    pub top_coin: String,
    pub top_coin_volume: f64,
    pub avg_size: f64,
    pub max_liq: f64,
}

impl PeriodStats {
    pub fn zero() -> Self {
        Self {
            total_volume: 0.0,
            count: 0,
            long_count: 0,
            short_count: 0,
            long_volume: 0.0,
            short_volume: 0.0,
            top_coin: "N/A".to_string(),
            top_coin_volume: 0.0,
            avg_size: 0.0,
            max_liq: 0.0,
        }
    }
}

/// One fixed-width time slice of a period's chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartBucket {
    /// Bucket start, epoch milliseconds.
    pub timestamp: i64,
    pub total_volume: f64,
    pub long_volume: f64,
    pub short_volume: f64,
    pub count: u64,
    pub long_count: u64,
    pub short_count: u64,
}

impl ChartBucket {
    fn zero(timestamp: i64) -> Self {
        Self {
            timestamp,
            total_volume: 0.0,
            long_volume: 0.0,
            short_volume: 0.0,
            count: 0,
            long_count: 0,
            short_count: 0,
        }
    }
}

/// Chart blob for one period: buckets ascending by timestamp, always exactly
/// `bucket_count` of them so chart dimensions are stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub period: String,
    pub bucket_width_ms: i64,
    pub buckets: Vec<ChartBucket>,
}

/// Stats + chart for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodView {
    pub stats: PeriodStats,
    pub chart: ChartData,
}

/// Composite blob for all periods, derived from one scan of one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllPeriodsData {
    pub periods: BTreeMap<String, PeriodView>,
    pub updated_at: i64,
}

impl AllPeriodsData {
    /// Project the per-period statistics out of the composite.
    pub fn stats_all(&self) -> StatsAllData {
        StatsAllData {
            periods: self
                .periods
                .iter()
                .map(|(period, view)| (period.clone(), view.stats.clone()))
                .collect(),
            updated_at: self.updated_at,
        }
    }
}

/// Per-period statistics blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsAllData {
    pub periods: BTreeMap<String, PeriodStats>,
    pub updated_at: i64,
}

/// Round a USD amount to cents for emission.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

struct PeriodAcc {
    period: Period,
    start_ms: i64,
    width_ms: i64,
    buckets: Vec<ChartBucket>,
    count: u64,
    long_count: u64,
    short_count: u64,
    total_volume: f64,
    long_volume: f64,
    short_volume: f64,
    max_liq: f64,
    coin_volume: HashMap<String, f64>,
}

impl PeriodAcc {
    fn new(period: Period, now_ms: i64) -> Self {
        let width_ms = period.bucket_width_ms();
        let start_ms = now_ms - period.span_ms();
        let buckets = (0..period.bucket_count())
            .map(|i| ChartBucket::zero(start_ms + i as i64 * width_ms))
            .collect();

        Self {
            period,
            start_ms,
            width_ms,
            buckets,
            count: 0,
            long_count: 0,
            short_count: 0,
            total_volume: 0.0,
            long_volume: 0.0,
            short_volume: 0.0,
            max_liq: 0.0,
            coin_volume: HashMap::new(),
        }
    }

    fn observe(&mut self, event: &Liquidation) {
        // Inclusion policy: time_ms >= cutoff, bucket index within [0, k).
        if event.time_ms < self.start_ms {
            return;
        }

        self.count += 1;
        self.total_volume += event.notional;
        if event.dir.is_long() {
            self.long_count += 1;
            self.long_volume += event.notional;
        } else {
            self.short_count += 1;
            self.short_volume += event.notional;
        }
        if event.notional > self.max_liq {
            self.max_liq = event.notional;
        }
        *self.coin_volume.entry(event.coin.clone()).or_insert(0.0) += event.notional;

        let index = ((event.time_ms - self.start_ms) / self.width_ms) as usize;
        if let Some(bucket) = self.buckets.get_mut(index) {
            bucket.count += 1;
            bucket.total_volume += event.notional;
            if event.dir.is_long() {
                bucket.long_count += 1;
                bucket.long_volume += event.notional;
            } else {
                bucket.short_count += 1;
                bucket.short_volume += event.notional;
            }
        }
    }

    fn finish(mut self) -> PeriodView {
        let mut top: Option<(String, f64)> = None;
        for (coin, volume) in &self.coin_volume {
            // Ties break to the lexicographically smallest coin.
            let better = match &top {
                None => true,
                Some((best_coin, best_volume)) => {
                    *volume > *best_volume || (*volume == *best_volume && coin < best_coin)
                }
            };
            if better {
                top = Some((coin.clone(), *volume));
            }
        }
        let (top_coin, top_coin_volume) = top.unwrap_or_else(|| ("N/A".to_string(), 0.0));

        let avg_size = if self.count > 0 {
            self.total_volume / self.count as f64
        } else {
            0.0
        };

        for bucket in &mut self.buckets {
            bucket.total_volume = round2(bucket.total_volume);
            bucket.long_volume = round2(bucket.long_volume);
            bucket.short_volume = round2(bucket.short_volume);
        }

        PeriodView {
            stats: PeriodStats {
                total_volume: round2(self.total_volume),
                count: self.count,
                long_count: self.long_count,
                short_count: self.short_count,
                long_volume: round2(self.long_volume),
                short_volume: round2(self.short_volume),
                top_coin,
                top_coin_volume: round2(top_coin_volume),
                avg_size: round2(avg_size),
                max_liq: round2(self.max_liq),
            },
            chart: ChartData {
                period: self.period.as_str().to_string(),
                bucket_width_ms: self.width_ms,
                buckets: self.buckets,
            },
        }
    }
}

/// Build stats and chart buckets for every period from one scan of `events`.
pub fn build_views(events: &[Liquidation], now: DateTime<Utc>) -> AllPeriodsData {
    let now_ms = now.timestamp_millis();
    let mut accs: Vec<PeriodAcc> = Period::ALL
        .iter()
        .map(|period| PeriodAcc::new(*period, now_ms))
        .collect();

    for event in events {
        for acc in &mut accs {
            acc.observe(event);
        }
    }

    AllPeriodsData {
        periods: accs
            .into_iter()
            .map(|acc| (acc.period.as_str().to_string(), acc.finish()))
            .collect(),
        updated_at: now_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use external_services::hyperliquid::Side;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn liq(tid: u64, time: DateTime<Utc>, coin: &str, dir: Side, notional: f64) -> Liquidation {
        Liquidation {
            tid,
            time,
            time_ms: time.timestamp_millis(),
            coin: coin.to_string(),
            dir,
            notional,
            mark_price: 0.0,
            liquidated_user: "0xwallet".to_string(),
            liquidators: vec![],
        }
    }

    #[test]
    fn test_empty_window_produces_stable_zero_views() {
        let views = build_views(&[], fixed_now());

        let expected_bucket_counts = [("2h", 24), ("4h", 48), ("8h", 32), ("12h", 48), ("24h", 48)];
        for (period, bucket_count) in expected_bucket_counts {
            let view = views.periods.get(period).expect("period missing");
            assert_eq!(view.stats, PeriodStats::zero(), "stats for {}", period);
            assert_eq!(view.chart.buckets.len(), bucket_count, "buckets for {}", period);
            assert!(view
                .chart
                .buckets
                .iter()
                .all(|b| b.count == 0 && b.total_volume == 0.0));
        }
    }

    #[test]
    fn test_bucket_timestamps_ascend_from_cutoff() {
        let now = fixed_now();
        let views = build_views(&[], now);
        let chart = &views.periods["2h"].chart;

        let start_ms = now.timestamp_millis() - 2 * 3_600_000;
        for (i, bucket) in chart.buckets.iter().enumerate() {
            assert_eq!(bucket.timestamp, start_ms + i as i64 * chart.bucket_width_ms);
        }
    }

    #[test]
    fn test_single_large_long() {
        let now = fixed_now();
        let event = liq(
            10,
            now - chrono::Duration::minutes(10),
            "BTC",
            Side::Long,
            1_234_567.89,
        );
        let views = build_views(&[event], now);

        let stats = &views.periods["2h"].stats;
        assert_eq!(stats.total_volume, 1_234_567.89);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.long_count, 1);
        assert_eq!(stats.short_count, 0);
        assert_eq!(stats.top_coin, "BTC");
        assert_eq!(stats.top_coin_volume, 1_234_567.89);
        assert_eq!(stats.avg_size, 1_234_567.89);
        assert_eq!(stats.max_liq, 1_234_567.89);
        assert_eq!(stats.long_volume, 1_234_567.89);
        assert_eq!(stats.short_volume, 0.0);

        // now - 10m sits 110 minutes past the 2h cutoff: bucket 110/5 = 22.
        let chart = &views.periods["2h"].chart;
        let non_zero: Vec<usize> = chart
            .buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.count > 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(non_zero, vec![22]);
        assert_eq!(chart.buckets[22].long_volume, 1_234_567.89);
        assert_eq!(chart.buckets[22].short_volume, 0.0);
    }

    #[test]
    fn test_top_coin_tie_breaks_lexicographically() {
        let now = fixed_now();
        let events = vec![
            liq(1, now - chrono::Duration::minutes(5), "BTC", Side::Long, 100.0),
            liq(2, now - chrono::Duration::minutes(6), "ALT", Side::Short, 100.0),
        ];
        let views = build_views(&events, now);

        let stats = &views.periods["2h"].stats;
        assert_eq!(stats.top_coin, "ALT");
        assert_eq!(stats.top_coin_volume, 100.0);
    }

    #[test]
    fn test_event_exactly_at_cutoff_lands_in_bucket_zero() {
        let now = fixed_now();
        let at_cutoff = liq(1, now - chrono::Duration::hours(2), "BTC", Side::Long, 50.0);
        let views = build_views(&[at_cutoff], now);

        let chart = &views.periods["2h"].chart;
        assert_eq!(chart.buckets[0].count, 1);
        assert_eq!(views.periods["2h"].stats.count, 1);
    }

    #[test]
    fn test_event_older_than_cutoff_excluded() {
        let now = fixed_now();
        let stale = liq(
            1,
            now - chrono::Duration::hours(2) - chrono::Duration::milliseconds(1),
            "BTC",
            Side::Long,
            50.0,
        );
        let views = build_views(&[stale], now);

        assert_eq!(views.periods["2h"].stats.count, 0);
        // Still inside the 4h horizon.
        assert_eq!(views.periods["4h"].stats.count, 1);
    }

    #[test]
    fn test_bucket_sums_match_stats() {
        let now = fixed_now();
        let mut events = Vec::new();
        for i in 0..200u64 {
            let minutes_ago = (i * 7) % (23 * 60);
            let dir = if i % 3 == 0 { Side::Long } else { Side::Short };
            let coin = ["BTC", "ETH", "SOL"][(i % 3) as usize];
            events.push(liq(
                i + 1,
                now - chrono::Duration::minutes(minutes_ago as i64),
                coin,
                dir,
                10.0 + i as f64 * 3.33,
            ));
        }

        let views = build_views(&events, now);
        for period in Period::ALL {
            let view = &views.periods[period.as_str()];
            let stats = &view.stats;

            // Long/short partition the totals.
            assert_eq!(stats.long_count + stats.short_count, stats.count);
            assert!(
                (stats.long_volume + stats.short_volume - stats.total_volume).abs() < 0.02,
                "volume partition for {}",
                period.as_str()
            );

            // Bucket sums equal the stats up to per-bucket rounding.
            let bucket_total: f64 = view.chart.buckets.iter().map(|b| b.total_volume).sum();
            let bucket_count: u64 = view.chart.buckets.iter().map(|b| b.count).sum();
            let tolerance = 0.01 * view.chart.buckets.len() as f64;
            assert!(
                (bucket_total - stats.total_volume).abs() <= tolerance,
                "bucket volume sum for {}",
                period.as_str()
            );
            assert_eq!(bucket_count, stats.count, "bucket count sum for {}", period.as_str());
        }
    }

    #[test]
    fn test_monetary_values_rounded_to_cents() {
        let now = fixed_now();
        let events = vec![
            liq(1, now - chrono::Duration::minutes(1), "BTC", Side::Long, 10.004),
            liq(2, now - chrono::Duration::minutes(1), "BTC", Side::Long, 10.004),
        ];
        let views = build_views(&events, now);

        let stats = &views.periods["2h"].stats;
        assert_eq!(stats.total_volume, 20.01);
        assert_eq!(stats.avg_size, 10.0);
        assert_eq!(stats.max_liq, 10.0);
    }

    #[test]
    fn test_stats_all_projection() {
        let now = fixed_now();
        let events = vec![liq(1, now - chrono::Duration::minutes(1), "BTC", Side::Long, 42.0)];
        let views = build_views(&events, now);

        let stats_all = views.stats_all();
        assert_eq!(stats_all.updated_at, views.updated_at);
        assert_eq!(stats_all.periods.len(), 5);
        assert_eq!(stats_all.periods["24h"], views.periods["24h"].stats);
    }

    #[test]
    fn test_period_parse() {
        assert_eq!(Period::parse("2h"), Some(Period::H2));
        assert_eq!(Period::parse(" 12h "), Some(Period::H12));
        assert_eq!(Period::parse("1h"), None);
        assert_eq!(Period::parse(""), None);
    }
}
