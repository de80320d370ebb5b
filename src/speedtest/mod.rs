//! Bandwidth measurement.
//!
//! [`HybridSpeedTester`] tries the dedicated speed test client first and
//! falls back to calibrated bulk HTTP transfers when it is unavailable.

mod fallback;
mod primary;

pub use fallback::FallbackMethod;
pub use primary::PrimaryMethod;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::clock::Clock;
use crate::config::SpeedTestConfig;
use crate::db::{SpeedMethodKind, SpeedSample};

/// Speed test error types.
#[derive(Error, Debug)]
pub enum SpeedTestError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("command failed: {0}")]
    Command(String),
    #[error("unexpected output: {0}")]
    Parse(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("disabled")]
    Disabled,
}

/// Result of one successful measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub download_mbps: f64,
    pub upload_mbps: Option<f64>,
    pub ping_ms: Option<f64>,
    pub server: Option<String>,
}

/// One way of measuring bandwidth.
#[async_trait]
pub trait SpeedMethod: Send + Sync {
    async fn measure(&self) -> Result<Measurement, SpeedTestError>;
}

/// Primary client with a calibrated HTTP fallback.
pub struct HybridSpeedTester {
    primary: Option<Arc<dyn SpeedMethod>>,
    fallback: Arc<dyn SpeedMethod>,
    calibration_factor: f64,
    clock: Arc<dyn Clock>,
}

impl HybridSpeedTester {
    pub fn new(
        primary: Option<Arc<dyn SpeedMethod>>,
        fallback: Arc<dyn SpeedMethod>,
        calibration_factor: f64,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            primary,
            fallback,
            calibration_factor,
            clock,
        }
    }

    /// Build both tiers from configuration.
    pub fn from_config(cfg: &SpeedTestConfig, clock: Arc<dyn Clock>) -> Self {
        let primary = cfg
            .primary_enabled
            .then(|| Arc::new(PrimaryMethod::from_config(cfg)) as Arc<dyn SpeedMethod>);
        Self::new(
            primary,
            Arc::new(FallbackMethod::from_config(cfg)),
            cfg.calibration_factor,
            clock,
        )
    }

    /// Multiplier applied to fallback throughput. It was tuned against one
    /// link and is not adjusted at runtime.
    pub fn calibration_factor(&self) -> f64 {
        self.calibration_factor
    }

    pub async fn try_primary(&self) -> Result<Measurement, SpeedTestError> {
        match &self.primary {
            Some(method) => method.measure().await,
            None => Err(SpeedTestError::Disabled),
        }
    }

    /// Run the fallback and apply the calibration factor to its throughput.
    pub async fn try_fallback(&self) -> Result<Measurement, SpeedTestError> {
        let raw = self.fallback.measure().await?;
        Ok(Measurement {
            download_mbps: raw.download_mbps * self.calibration_factor,
            upload_mbps: raw.upload_mbps.map(|u| u * self.calibration_factor),
            ..raw
        })
    }

    /// Measure once. Failures are reported in the returned sample.
    pub async fn run(&self) -> SpeedSample {
        let time = self.clock.now();

        let primary_err = match self.try_primary().await {
            Ok(m) => {
                tracing::info!(
                    "SpeedTester: primary result {:.1} Mbps down, {:?} Mbps up",
                    m.download_mbps,
                    m.upload_mbps
                );
                return Self::sample(time, m, SpeedMethodKind::Primary, None);
            }
            Err(SpeedTestError::Disabled) => SpeedTestError::Disabled,
            Err(e) => {
                tracing::warn!("SpeedTester: primary method failed, falling back: {}", e);
                e
            }
        };

        match self.try_fallback().await {
            Ok(m) => {
                tracing::info!(
                    "SpeedTester: fallback result {:.1} Mbps down (x{} calibration)",
                    m.download_mbps,
                    self.calibration_factor
                );
                Self::sample(time, m, SpeedMethodKind::Fallback, Some(self.calibration_factor))
            }
            Err(fallback_err) => {
                let error = format!("primary: {}; fallback: {}", primary_err, fallback_err);
                tracing::error!("SpeedTester: all methods failed ({})", error);
                Self::failure(time, error)
            }
        }
    }

    /// A failed sample stamped now, for a run that could not complete.
    pub fn failed_sample(&self, error: String) -> SpeedSample {
        Self::failure(self.clock.now(), error)
    }

    fn failure(time: DateTime<Utc>, error: String) -> SpeedSample {
        SpeedSample {
            time,
            download_mbps: None,
            upload_mbps: None,
            ping_ms: None,
            method: SpeedMethodKind::Fallback,
            server: None,
            success: false,
            error: Some(error),
            calibration_factor: None,
        }
    }

    fn sample(
        time: DateTime<Utc>,
        m: Measurement,
        method: SpeedMethodKind,
        calibration_factor: Option<f64>,
    ) -> SpeedSample {
        SpeedSample {
            time,
            download_mbps: Some(m.download_mbps),
            upload_mbps: m.upload_mbps,
            ping_ms: m.ping_ms,
            method,
            server: m.server,
            success: true,
            error: None,
            calibration_factor,
        }
    }
}

/// Test doubles shared with the scheduler tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Always returns the same outcome.
    pub struct ScriptedMethod {
        outcome: Option<Measurement>,
        calls: AtomicUsize,
    }

    impl ScriptedMethod {
        pub fn ok(download_mbps: f64, upload_mbps: Option<f64>, ping_ms: Option<f64>) -> Self {
            Self {
                outcome: Some(Measurement {
                    download_mbps,
                    upload_mbps,
                    ping_ms,
                    server: Some("scripted".to_string()),
                }),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                outcome: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpeedMethod for ScriptedMethod {
        async fn measure(&self) -> Result<Measurement, SpeedTestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
                .clone()
                .ok_or_else(|| SpeedTestError::Command("speedtest-cli: not found".to_string()))
        }
    }
}
