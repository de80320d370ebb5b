//! Outage detection over probe rounds.
//!
//! The detector is a two-state machine (`Up` / `Down`). Failing rounds are
//! counted while `Up`; once enough have been seen in a row an outage is
//! recorded, and the first fully successful round while `Down` resolves it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::OutageConfig;
use crate::db::{ConnectivitySample, DbError, Gateway, NewOutage, Severity};

/// How many failed samples make a round count as failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quorum {
    /// Every target failed.
    #[default]
    All,
    /// More than half of the targets failed.
    Majority,
}

impl Quorum {
    fn is_met(&self, failed: usize, total: usize) -> bool {
        total > 0
            && match self {
                Quorum::All => failed == total,
                Quorum::Majority => failed * 2 > total,
            }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Up,
    Down,
}

/// A state change caused by one round.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Opened { id: i64, severity: Severity },
    Resolved { id: i64, duration: ChronoDuration },
}

enum RoundClass {
    Failing {
        severity: Severity,
        culprits: Vec<String>,
    },
    Healthy,
    /// Some failures, but not enough to count.
    Mixed,
}

/// Consecutive failing rounds seen while `Up`.
#[derive(Debug)]
struct FailingRun {
    start: DateTime<Utc>,
    rounds: u32,
    severity: Severity,
    culprits: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Ongoing {
    id: i64,
    start: DateTime<Utc>,
}

pub struct OutageDetector {
    config: OutageConfig,
    state: HealthState,
    run: Option<FailingRun>,
    ongoing: Option<Ongoing>,
}

impl OutageDetector {
    pub fn new(config: OutageConfig) -> Self {
        Self {
            config,
            state: HealthState::Up,
            run: None,
            ongoing: None,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn ongoing_id(&self) -> Option<i64> {
        self.ongoing.map(|o| o.id)
    }

    /// Adopt an outage left ongoing by a previous run.
    pub fn resume(&mut self, gateway: &dyn Gateway) -> Result<(), DbError> {
        if let Some(event) = gateway.ongoing_outage()? {
            tracing::info!(
                "OutageDetector: resuming ongoing outage {} (since {})",
                event.id,
                event.start
            );
            self.state = HealthState::Down;
            self.ongoing = Some(Ongoing {
                id: event.id,
                start: event.start,
            });
            self.run = None;
        }
        Ok(())
    }

    /// Feed one probe round. Empty rounds are ignored.
    pub fn observe(
        &mut self,
        round: &[ConnectivitySample],
        gateway: &dyn Gateway,
    ) -> Option<Transition> {
        let time = round.first()?.time;
        let class = self.classify(round);

        match (self.state, class) {
            (HealthState::Up, RoundClass::Failing { severity, culprits }) => {
                let run = self.run.get_or_insert_with(|| FailingRun {
                    start: time,
                    rounds: 0,
                    severity,
                    culprits: Vec::new(),
                });
                run.rounds += 1;
                run.severity = run.severity.max(severity);
                for c in culprits {
                    if !run.culprits.contains(&c) {
                        run.culprits.push(c);
                    }
                }

                if run.rounds >= self.config.failure_threshold_rounds.max(1) {
                    self.open(gateway)
                } else {
                    None
                }
            }
            (HealthState::Up, _) => {
                self.run = None;
                None
            }
            (HealthState::Down, RoundClass::Healthy) => self.resolve(time, gateway),
            (HealthState::Down, _) => None,
        }
    }

    fn classify(&self, round: &[ConnectivitySample]) -> RoundClass {
        let failed: Vec<String> = round
            .iter()
            .filter(|s| !s.success)
            .map(|s| s.target.clone())
            .collect();

        if !failed.is_empty() {
            if !self.config.quorum.is_met(failed.len(), round.len()) {
                return RoundClass::Mixed;
            }
            let severity = if failed.len() == round.len() {
                Severity::Complete
            } else {
                Severity::Partial
            };
            return RoundClass::Failing {
                severity,
                culprits: failed,
            };
        }

        if self.config.degraded_is_outage {
            let slow: Vec<String> = round
                .iter()
                .filter(|s| s.latency_ms.is_some_and(|ms| ms > self.config.degraded_latency_ms))
                .map(|s| s.target.clone())
                .collect();
            if !slow.is_empty() {
                return RoundClass::Failing {
                    severity: Severity::Degraded,
                    culprits: slow,
                };
            }
        }

        RoundClass::Healthy
    }

    fn open(&mut self, gateway: &dyn Gateway) -> Option<Transition> {
        if self.ongoing.is_some() {
            return None;
        }
        let run = self.run.as_ref()?;

        let description = match run.severity {
            Severity::Degraded => format!(
                "Latency above {} ms: {}",
                self.config.degraded_latency_ms,
                run.culprits.join(", ")
            ),
            _ => format!("Unreachable: {}", run.culprits.join(", ")),
        };
        let outage = NewOutage {
            start: run.start,
            severity: run.severity,
            description,
        };

        match gateway.append_outage(&outage) {
            Ok(id) => {
                tracing::warn!(
                    "OutageDetector: {} outage {} started at {} ({})",
                    outage.severity,
                    id,
                    outage.start,
                    outage.description
                );
                self.state = HealthState::Down;
                self.ongoing = Some(Ongoing {
                    id,
                    start: outage.start,
                });
                self.run = None;
                Some(Transition::Opened {
                    id,
                    severity: outage.severity,
                })
            }
            Err(e) => {
                // Keep the run so the next failing round retries with the same start.
                tracing::error!("OutageDetector: failed to record outage: {}", e);
                None
            }
        }
    }

    fn resolve(&mut self, end: DateTime<Utc>, gateway: &dyn Gateway) -> Option<Transition> {
        let Some(ongoing) = self.ongoing else {
            self.state = HealthState::Up;
            return None;
        };

        match gateway.resolve_outage(ongoing.id, end) {
            Ok(()) => {
                let duration = end - ongoing.start;
                tracing::info!(
                    "OutageDetector: outage {} resolved after {}s",
                    ongoing.id,
                    duration.num_seconds()
                );
                self.state = HealthState::Up;
                self.ongoing = None;
                Some(Transition::Resolved {
                    id: ongoing.id,
                    duration,
                })
            }
            Err(DbError::NotFound) => {
                tracing::warn!(
                    "OutageDetector: outage {} is no longer open, clearing it",
                    ongoing.id
                );
                self.state = HealthState::Up;
                self.ongoing = None;
                None
            }
            Err(e) => {
                tracing::error!("OutageDetector: failed to resolve outage {}: {}", ongoing.id, e);
                None
            }
        }
    }
}
