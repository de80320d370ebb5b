//! Reachability probing.
//!
//! Supports Ping, DNS, and HTTP checks. A [`Prober`] runs one round over all
//! configured targets and turns each outcome into a [`ConnectivitySample`].

mod dns;
mod http;
mod ping;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::clock::Clock;
pub use crate::db::ProbeKind;
use crate::db::ConnectivitySample;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

/// A host and the way it is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub kind: ProbeKind,
}

impl ProbeTarget {
    pub fn new(host: &str, kind: ProbeKind) -> Self {
        Self {
            host: host.to_string(),
            kind,
        }
    }
}

/// Bounded retry: how many attempts a target gets per round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// A single check of one target.
#[async_trait]
pub trait Checker: Send + Sync {
    /// Returns the observed round-trip time.
    async fn check(&self, target: &ProbeTarget, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Checks targets over the real network.
pub struct NetworkChecker {
    dns_query_name: String,
    client: reqwest::Client,
}

impl NetworkChecker {
    pub fn new(dns_query_name: &str) -> Self {
        Self {
            dns_query_name: dns_query_name.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Checker for NetworkChecker {
    async fn check(&self, target: &ProbeTarget, timeout: Duration) -> Result<Duration, ProbeError> {
        match target.kind {
            ProbeKind::Ping => ping::ping(&target.host, timeout).await,
            ProbeKind::Dns => dns::query(&target.host, &self.dns_query_name, timeout).await,
            ProbeKind::Http => http::fetch(&self.client, &target.host, timeout).await,
        }
    }
}

/// Runs probe rounds and records every outcome as a sample.
pub struct Prober {
    checker: Arc<dyn Checker>,
    clock: Arc<dyn Clock>,
    targets: Vec<ProbeTarget>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Prober {
    pub fn new(
        checker: Arc<dyn Checker>,
        clock: Arc<dyn Clock>,
        targets: Vec<ProbeTarget>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            checker,
            clock,
            targets,
            timeout,
            retry,
        }
    }

    pub fn targets(&self) -> &[ProbeTarget] {
        &self.targets
    }

    /// Probe the configured targets with the configured timeout and retries.
    pub async fn probe_round(&self) -> Vec<ConnectivitySample> {
        self.probe(&self.targets, self.timeout, self.retry).await
    }

    /// One failed sample per configured target, stamped now, for a round
    /// that could not complete.
    pub fn failed_round(&self, error: &str) -> Vec<ConnectivitySample> {
        let time = self.clock.now();
        self.targets
            .iter()
            .map(|target| ConnectivitySample {
                time,
                target: target.host.clone(),
                kind: target.kind,
                success: false,
                latency_ms: None,
                error: Some(error.to_string()),
                attempts: 1,
            })
            .collect()
    }

    /// Probe `targets` concurrently. One sample per target, in target order,
    /// all stamped with the round's start time.
    pub async fn probe(
        &self,
        targets: &[ProbeTarget],
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Vec<ConnectivitySample> {
        let time = self.clock.now();
        let checks = targets
            .iter()
            .map(|target| self.probe_target(target, timeout, retry, time));
        futures::future::join_all(checks).await
    }

    async fn probe_target(
        &self,
        target: &ProbeTarget,
        timeout: Duration,
        retry: RetryPolicy,
        time: DateTime<Utc>,
    ) -> ConnectivitySample {
        let attempts = retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = match tokio::time::timeout(timeout, self.checker.check(target, timeout)).await {
                Ok(Ok(latency)) if latency >= timeout => Err(ProbeError::Timeout(timeout)),
                Ok(result) => result,
                Err(_) => Err(ProbeError::Timeout(timeout)),
            };

            match result {
                Ok(latency) => {
                    return ConnectivitySample {
                        time,
                        target: target.host.clone(),
                        kind: target.kind,
                        success: true,
                        latency_ms: Some(latency.as_secs_f64() * 1000.0),
                        error: None,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    tracing::debug!(
                        "Prober: {} {} attempt {}/{} failed: {}",
                        target.kind,
                        target.host,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        ConnectivitySample {
            time,
            target: target.host.clone(),
            kind: target.kind,
            success: false,
            latency_ms: None,
            error: last_error.map(|e| e.to_string()),
            attempts,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedChecker, Step};
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    const MS: Duration = Duration::from_millis(20);

    fn prober(checker: Arc<ScriptedChecker>) -> Prober {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ));
        Prober::new(
            checker,
            clock,
            vec![
                ProbeTarget::new("8.8.8.8", ProbeKind::Ping),
                ProbeTarget::new("1.1.1.1", ProbeKind::Dns),
            ],
            Duration::from_secs(10),
            RetryPolicy::new(3),
        )
    }

    #[test]
    fn test_retry_policy_minimum() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
        assert_eq!(RetryPolicy::default().max_attempts, 3);
    }

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let checker = Arc::new(ScriptedChecker::new(Step::Ok(MS)));
        let samples = prober(checker.clone()).probe_round().await;

        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.success && s.attempts == 1));
        assert_eq!(checker.calls(), 2);
        assert!((samples[0].latency_ms.unwrap() - 20.0).abs() < 1e-9);
        assert!(samples[0].error.is_none());
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let checker = Arc::new(
            ScriptedChecker::new(Step::Ok(MS)).script("8.8.8.8", &[Step::Fail, Step::Fail, Step::Ok(MS)]),
        );
        let samples = prober(checker.clone()).probe_round().await;

        assert!(samples[0].success);
        assert_eq!(samples[0].attempts, 3);
        assert_eq!(checker.calls(), 4);
    }

    #[tokio::test]
    async fn test_all_attempts_fail() {
        let checker = Arc::new(ScriptedChecker::new(Step::Ok(MS)).script(
            "8.8.8.8",
            &[Step::Fail, Step::Fail, Step::Fail, Step::Ok(MS)],
        ));
        let samples = prober(checker.clone()).probe_round().await;

        let failed = &samples[0];
        assert!(!failed.success);
        assert_eq!(failed.latency_ms, None);
        assert_eq!(failed.attempts, 3);
        assert!(failed.error.as_deref().unwrap().contains("8.8.8.8 unreachable"));
        // The fourth scripted step was never reached.
        assert_eq!(checker.calls(), 4);
    }

    #[tokio::test]
    async fn test_samples_keep_target_order_and_share_timestamp() {
        let checker = Arc::new(ScriptedChecker::new(Step::Ok(MS)));
        let samples = prober(checker).probe_round().await;

        assert_eq!(samples[0].target, "8.8.8.8");
        assert_eq!(samples[0].kind, ProbeKind::Ping);
        assert_eq!(samples[1].target, "1.1.1.1");
        assert_eq!(samples[1].kind, ProbeKind::Dns);
        assert_eq!(samples[0].time, samples[1].time);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_bounded_by_timeout() {
        let checker = Arc::new(ScriptedChecker::new(Step::Slow(Duration::from_secs(60))));
        let p = prober(checker.clone());
        let samples = p
            .probe(
                &[ProbeTarget::new("slow.example", ProbeKind::Http)],
                Duration::from_secs(1),
                RetryPolicy::new(2),
            )
            .await;

        assert_eq!(samples.len(), 1);
        assert!(!samples[0].success);
        assert_eq!(samples[0].attempts, 2);
        assert!(samples[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_latency_at_timeout_is_failure() {
        let checker = Arc::new(ScriptedChecker::new(Step::Ok(Duration::from_secs(10))));
        let samples = prober(checker).probe_round().await;
        assert!(samples.iter().all(|s| !s.success));
    }
}
