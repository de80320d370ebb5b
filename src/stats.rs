//! Read-only reporting over stored samples.
//!
//! Everything here is recomputed from raw records on each call.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::db::{
    ConnectivitySample, DbError, Gateway, OutageEvent, ParseEnumError, SpeedMethodKind,
    SpeedSample, TimeWindow,
};

/// A sample older than this means the monitor has stalled.
const HEALTH_MAX_AGE_SECONDS: i64 = 300;

/// Aggregates for one time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitoringStats {
    pub window: TimeWindow,
    /// None when the window holds no connectivity samples.
    pub uptime_percent: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub avg_download_mbps: Option<f64>,
    pub min_download_mbps: Option<f64>,
    pub max_download_mbps: Option<f64>,
    pub avg_upload_mbps: Option<f64>,
    pub avg_speed_ping_ms: Option<f64>,
    pub outage_count: usize,
    /// Outage time inside the window, ongoing outages counted up to now.
    pub total_outage_seconds: i64,
    pub sample_count: usize,
    pub speed_test_count: usize,
    pub fallback_speed_tests: usize,
}

impl MonitoringStats {
    pub fn compute(
        window: TimeWindow,
        connectivity: &[ConnectivitySample],
        speed: &[SpeedSample],
        outages: &[OutageEvent],
        now: DateTime<Utc>,
    ) -> Self {
        let successes = connectivity.iter().filter(|s| s.success).count();
        let uptime_percent = (!connectivity.is_empty())
            .then(|| successes as f64 / connectivity.len() as f64 * 100.0);

        let ok_speed: Vec<&SpeedSample> = speed.iter().filter(|s| s.success).collect();
        let downloads: Vec<f64> = ok_speed.iter().filter_map(|s| s.download_mbps).collect();

        Self {
            window,
            uptime_percent,
            avg_latency_ms: mean(connectivity.iter().filter_map(|s| s.latency_ms)),
            avg_download_mbps: mean(downloads.iter().copied()),
            min_download_mbps: downloads.iter().copied().reduce(f64::min),
            max_download_mbps: downloads.iter().copied().reduce(f64::max),
            avg_upload_mbps: mean(ok_speed.iter().filter_map(|s| s.upload_mbps)),
            avg_speed_ping_ms: mean(ok_speed.iter().filter_map(|s| s.ping_ms)),
            outage_count: outages.len(),
            total_outage_seconds: outages
                .iter()
                .map(|o| clipped_seconds(o, &window, now))
                .sum(),
            sample_count: connectivity.len(),
            speed_test_count: speed.len(),
            fallback_speed_tests: ok_speed
                .iter()
                .filter(|s| s.method == SpeedMethodKind::Fallback)
                .count(),
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Seconds of `outage` that fall inside `window`.
fn clipped_seconds(outage: &OutageEvent, window: &TimeWindow, now: DateTime<Utc>) -> i64 {
    let start = outage.start.max(window.start);
    let end = outage.end.unwrap_or(now).min(window.end).min(now);
    (end - start).num_seconds().max(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Unknown,
}

/// Snapshot of the most recent observations.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentStatus {
    pub status: ConnectionStatus,
    pub checked_at: Option<DateTime<Utc>>,
    pub latest_round: Vec<ConnectivitySample>,
    pub latest_speed_test: Option<SpeedSample>,
    pub ongoing_outage: Option<OutageEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub days: u32,
    pub stats: MonitoringStats,
    pub outages: Vec<OutageEvent>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub healthy: bool,
    pub last_sample_at: Option<DateTime<Utc>>,
}

/// One point of a chart series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPoint {
    pub time: DateTime<Utc>,
    pub value: f64,
    pub label: String,
}

/// Which speed sample field a chart plots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedMetric {
    #[default]
    Download,
    Upload,
    Ping,
}

impl SpeedMetric {
    fn value(&self, s: &SpeedSample) -> Option<f64> {
        match self {
            SpeedMetric::Download => s.download_mbps,
            SpeedMetric::Upload => s.upload_mbps,
            SpeedMetric::Ping => s.ping_ms,
        }
    }

    fn unit(&self) -> &'static str {
        match self {
            SpeedMetric::Download | SpeedMetric::Upload => "Mbps",
            SpeedMetric::Ping => "ms",
        }
    }
}

impl FromStr for SpeedMetric {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| ParseEnumError::new("speed metric", s))
    }
}

/// Query surface over the gateway.
pub struct QueryService {
    gateway: Arc<dyn Gateway>,
    clock: Arc<dyn Clock>,
}

impl QueryService {
    pub fn new(gateway: Arc<dyn Gateway>, clock: Arc<dyn Clock>) -> Self {
        Self { gateway, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The window of `length` ending now.
    pub fn last(&self, length: ChronoDuration) -> TimeWindow {
        TimeWindow::last(length, self.clock.now())
    }

    pub fn latest_connectivity(&self) -> Result<Option<ConnectivitySample>, DbError> {
        self.gateway.latest_connectivity()
    }

    pub fn latest_speed(&self) -> Result<Option<SpeedSample>, DbError> {
        self.gateway.latest_speed()
    }

    pub fn connectivity(&self, window: &TimeWindow) -> Result<Vec<ConnectivitySample>, DbError> {
        self.gateway.connectivity_in(window)
    }

    pub fn speed_tests(&self, window: &TimeWindow) -> Result<Vec<SpeedSample>, DbError> {
        self.gateway.speed_in(window)
    }

    pub fn outages(&self, window: &TimeWindow) -> Result<Vec<OutageEvent>, DbError> {
        self.gateway.outages_in(window)
    }

    pub fn stats(&self, window: &TimeWindow) -> Result<MonitoringStats, DbError> {
        Ok(MonitoringStats::compute(
            *window,
            &self.gateway.connectivity_in(window)?,
            &self.gateway.speed_in(window)?,
            &self.gateway.outages_in(window)?,
            self.clock.now(),
        ))
    }

    /// Connected unless every target in the latest round failed.
    pub fn current_status(&self) -> Result<CurrentStatus, DbError> {
        let latest_round = self.gateway.latest_round()?;
        let status = if latest_round.is_empty() {
            ConnectionStatus::Unknown
        } else if latest_round.iter().any(|s| s.success) {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };

        Ok(CurrentStatus {
            status,
            checked_at: latest_round.first().map(|s| s.time),
            latest_round,
            latest_speed_test: self.gateway.latest_speed()?,
            ongoing_outage: self.gateway.ongoing_outage()?,
        })
    }

    pub fn report(&self, days: u32) -> Result<Report, DbError> {
        let window = self.last(ChronoDuration::days(i64::from(days)));
        let stats = self.stats(&window)?;
        let outages = self.gateway.outages_in(&window)?;
        let recommendations = recommendations(&stats);

        Ok(Report {
            days,
            stats,
            outages,
            recommendations,
        })
    }

    /// Healthy when a connectivity sample was written in the last five minutes.
    pub fn health(&self) -> Result<Health, DbError> {
        let last_sample_at = self.gateway.latest_connectivity()?.map(|s| s.time);
        let now = self.clock.now();
        let healthy = last_sample_at
            .is_some_and(|t| now - t <= ChronoDuration::seconds(HEALTH_MAX_AGE_SECONDS));

        Ok(Health {
            healthy,
            last_sample_at,
        })
    }

    /// Percent of targets reachable in each probe round, oldest first.
    pub fn uptime_series(&self, window: &TimeWindow) -> Result<Vec<ChartPoint>, DbError> {
        let samples = self.gateway.connectivity_in(window)?;

        Ok(samples
            .chunk_by(|a, b| a.time == b.time)
            .map(|round| {
                let reachable = round.iter().filter(|s| s.success).count();
                ChartPoint {
                    time: round[0].time,
                    value: reachable as f64 * 100.0 / round.len() as f64,
                    label: format!("{}/{} targets reachable", reachable, round.len()),
                }
            })
            .collect())
    }

    /// Successful speed samples with a value for `metric`, oldest first.
    pub fn speed_series(
        &self,
        window: &TimeWindow,
        metric: SpeedMetric,
    ) -> Result<Vec<ChartPoint>, DbError> {
        Ok(self
            .gateway
            .speed_in(window)?
            .into_iter()
            .filter(|s| s.success)
            .filter_map(|s| {
                metric.value(&s).map(|value| ChartPoint {
                    time: s.time,
                    value,
                    label: format!("{:.1} {}", value, metric.unit()),
                })
            })
            .collect())
    }
}

fn recommendations(stats: &MonitoringStats) -> Vec<String> {
    let mut out = Vec::new();

    match stats.uptime_percent {
        Some(u) if u < 99.0 => out.push(format!(
            "Uptime is {:.2}%, below 99%. Consider contacting your ISP.",
            u
        )),
        Some(_) => out.push("Uptime is acceptable.".to_string()),
        None => out.push("No connectivity samples in this period.".to_string()),
    }

    match stats.avg_latency_ms {
        Some(l) if l > 100.0 => out.push(format!(
            "Average latency is {:.1} ms. Check for local network issues.",
            l
        )),
        Some(_) => out.push("Latency is good.".to_string()),
        None => {}
    }

    match stats.avg_download_mbps {
        Some(d) if d < 10.0 => out.push(format!(
            "Average download is {:.1} Mbps. Consider upgrading your plan if this persists.",
            d
        )),
        Some(_) => out.push("Speeds are adequate.".to_string()),
        None => {}
    }

    if stats.fallback_speed_tests > 0 {
        out.push(format!(
            "{} of {} speed tests used the calibrated fallback; those figures are estimates.",
            stats.fallback_speed_tests, stats.speed_test_count
        ));
    }

    out
}
