//! Database model types.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A stored enum column held an unexpected value.
#[derive(Error, Debug)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// How a target is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Ping,
    Dns,
    Http,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Ping => "ping",
            ProbeKind::Dns => "dns",
            ProbeKind::Http => "http",
        }
    }
}

impl FromStr for ProbeKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ping" => Ok(ProbeKind::Ping),
            "dns" => Ok(ProbeKind::Dns),
            "http" => Ok(ProbeKind::Http),
            other => Err(ParseEnumError::new("probe kind", other)),
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tier of the hybrid speed test produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedMethodKind {
    Primary,
    Fallback,
}

impl SpeedMethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedMethodKind::Primary => "primary",
            SpeedMethodKind::Fallback => "fallback",
        }
    }
}

impl FromStr for SpeedMethodKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(SpeedMethodKind::Primary),
            "fallback" => Ok(SpeedMethodKind::Fallback),
            other => Err(ParseEnumError::new("speed method", other)),
        }
    }
}

impl fmt::Display for SpeedMethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outage severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Every target reachable but latency above threshold.
    Degraded,
    /// Some targets failed, some succeeded.
    Partial,
    /// Every target failed.
    Complete,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Degraded => "degraded",
            Severity::Partial => "partial",
            Severity::Complete => "complete",
        }
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "degraded" => Ok(Severity::Degraded),
            "partial" => Ok(Severity::Partial),
            "complete" => Ok(Severity::Complete),
            other => Err(ParseEnumError::new("severity", other)),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of probing one target once (including its retries).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectivitySample {
    pub time: DateTime<Utc>,
    pub target: String,
    pub kind: ProbeKind,
    pub success: bool,
    /// Round-trip latency in milliseconds, None on failure.
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
    /// Attempts spent before success or giving up.
    pub attempts: u32,
}

/// One bandwidth measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedSample {
    pub time: DateTime<Utc>,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub ping_ms: Option<f64>,
    pub method: SpeedMethodKind,
    pub server: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    /// Multiplier applied to raw fallback throughput, None for primary results.
    pub calibration_factor: Option<f64>,
}

/// A recorded outage window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutageEvent {
    pub id: i64,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub severity: Severity,
    pub resolved: bool,
    pub description: String,
    pub duration_seconds: Option<i64>,
}

impl OutageEvent {
    pub fn is_ongoing(&self) -> bool {
        self.end.is_none()
    }

    pub fn duration(&self) -> Option<ChronoDuration> {
        self.end.map(|end| end - self.start)
    }
}

/// Fields supplied when an outage is first recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutage {
    pub start: DateTime<Utc>,
    pub severity: Severity,
    pub description: String,
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Build a window, rejecting empty or inverted ranges.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// The window of the given length ending at `now`.
    pub fn last(length: ChronoDuration, now: DateTime<Utc>) -> Self {
        Self {
            start: now - length,
            end: now,
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    pub fn length(&self) -> ChronoDuration {
        self.end - self.start
    }
}

/// Records removed by one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub cutoff: Option<DateTime<Utc>>,
    pub connectivity_samples: usize,
    pub speed_samples: usize,
    pub outage_events: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.connectivity_samples + self.speed_samples + self.outage_events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_enum_names_round_trip() {
        for kind in [ProbeKind::Ping, ProbeKind::Dns, ProbeKind::Http] {
            assert_eq!(kind.as_str().parse::<ProbeKind>().unwrap(), kind);
        }
        assert!("icmp".parse::<ProbeKind>().is_err());
        assert!("turbo".parse::<SpeedMethodKind>().is_err());
        assert_eq!("partial".parse::<Severity>().unwrap(), Severity::Partial);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Complete > Severity::Partial);
        assert!(Severity::Partial > Severity::Degraded);
        assert_eq!(
            Severity::Degraded.max(Severity::Complete),
            Severity::Complete
        );
    }

    #[test]
    fn test_time_window() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + ChronoDuration::hours(1);
        assert!(TimeWindow::new(t1, t0).is_none());
        assert!(TimeWindow::new(t0, t0).is_none());

        let w = TimeWindow::new(t0, t1).unwrap();
        assert!(w.contains(t0));
        assert!(!w.contains(t1));
        assert_eq!(w.length(), ChronoDuration::hours(1));
        assert_eq!(TimeWindow::last(ChronoDuration::hours(1), t1), w);
    }

    #[test]
    fn test_outage_duration() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut ev = OutageEvent {
            id: 1,
            start: t0,
            end: None,
            severity: Severity::Complete,
            resolved: false,
            description: String::new(),
            duration_seconds: None,
        };
        assert!(ev.is_ongoing());
        assert!(ev.duration().is_none());

        ev.end = Some(t0 + ChronoDuration::seconds(90));
        assert_eq!(ev.duration(), Some(ChronoDuration::seconds(90)));
    }
}
