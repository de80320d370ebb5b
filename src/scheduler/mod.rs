//! Scheduler module: drives the reachability, speed test and retention loops.

mod retention;

pub use retention::*;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigError};
use crate::db::{CleanupReport, DbError, Gateway};
use crate::outage::OutageDetector;
use crate::probe::{Checker, NetworkChecker, Prober};
use crate::speedtest::{HybridSpeedTester, SpeedMethod};

use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// The periodic loops the scheduler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Reachability,
    SpeedTest,
    Retention,
}

impl TaskKind {
    fn index(self) -> usize {
        match self {
            TaskKind::Reachability => 0,
            TaskKind::SpeedTest => 1,
            TaskKind::Retention => 2,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskKind::Reachability => "reachability",
            TaskKind::SpeedTest => "speed test",
            TaskKind::Retention => "retention",
        })
    }
}

#[derive(Default)]
struct SkipCounters([AtomicU64; 3]);

impl SkipCounters {
    fn record(&self, kind: TaskKind) {
        self.0[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, kind: TaskKind) -> u64 {
        self.0[kind.index()].load(Ordering::Relaxed)
    }
}

struct Running {
    stop_tx: broadcast::Sender<()>,
    loops: Vec<JoinHandle<()>>,
}

/// Owns the monitoring loops and their collaborators.
pub struct Scheduler {
    gateway: Arc<dyn Gateway>,
    clock: Arc<dyn Clock>,
    checker: Option<Arc<dyn Checker>>,
    speed_methods: Option<(Option<Arc<dyn SpeedMethod>>, Arc<dyn SpeedMethod>)>,
    running: Mutex<Option<Running>>,
    skipped: Arc<SkipCounters>,
    retention_days: AtomicU32,
}

impl Scheduler {
    /// Create a scheduler writing to `gateway`. Probes and speed tests use the
    /// real network unless overridden.
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            clock: Arc::new(SystemClock),
            checker: None,
            speed_methods: None,
            running: Mutex::new(None),
            skipped: Arc::new(SkipCounters::default()),
            retention_days: AtomicU32::new(crate::config::DatabaseConfig::default().retention_days),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_checker(mut self, checker: Arc<dyn Checker>) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Replace both speed test tiers. The configured calibration factor still applies.
    pub fn with_speed_methods(
        mut self,
        primary: Option<Arc<dyn SpeedMethod>>,
        fallback: Arc<dyn SpeedMethod>,
    ) -> Self {
        self.speed_methods = Some((primary, fallback));
        self
    }

    /// Validate `config` and start all loops. Does nothing if already running.
    pub async fn start(&self, config: &Config) -> Result<(), ConfigError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!("Scheduler: already running");
            return Ok(());
        }

        config.validate()?;

        let checker = self
            .checker
            .clone()
            .unwrap_or_else(|| Arc::new(NetworkChecker::new(&config.targets.dns_query_name)) as Arc<dyn Checker>);
        let prober = Arc::new(Prober::new(
            checker,
            self.clock.clone(),
            config.probe_targets(),
            config.probe_timeout(),
            config.retry_policy(),
        ));

        let tester = Arc::new(match &self.speed_methods {
            Some((primary, fallback)) => HybridSpeedTester::new(
                primary.clone(),
                fallback.clone(),
                config.speed_test.calibration_factor,
                self.clock.clone(),
            ),
            None => HybridSpeedTester::from_config(&config.speed_test, self.clock.clone()),
        });

        let mut detector = OutageDetector::new(config.outage.clone());
        if let Err(e) = detector.resume(self.gateway.as_ref()) {
            tracing::error!("Scheduler: failed to load ongoing outage: {}", e);
        }
        let detector = Arc::new(Mutex::new(detector));

        let retention = Arc::new(RetentionManager::new(self.gateway.clone(), self.clock.clone()));
        let retention_days = config.database.retention_days;
        self.retention_days.store(retention_days, Ordering::Relaxed);

        tracing::info!(
            "Starting scheduler with {} targets (every {:?}), speed test every {:?}, cleanup every {:?}",
            prober.targets().len(),
            config.ping_interval(),
            config.speed_test_interval(),
            config.cleanup_interval()
        );

        let (stop_tx, _) = broadcast::channel(1);
        let gateway = self.gateway.clone();

        let reachability = {
            let gateway = gateway.clone();
            tokio::spawn(run_periodic(
                TaskKind::Reachability,
                config.ping_interval(),
                stop_tx.subscribe(),
                self.skipped.clone(),
                move || run_probe_round(prober.clone(), detector.clone(), gateway.clone()),
            ))
        };

        let speed = {
            let gateway = gateway.clone();
            tokio::spawn(run_periodic(
                TaskKind::SpeedTest,
                config.speed_test_interval(),
                stop_tx.subscribe(),
                self.skipped.clone(),
                move || run_speed_test(tester.clone(), gateway.clone()),
            ))
        };

        let cleanup = tokio::spawn(run_periodic(
            TaskKind::Retention,
            config.cleanup_interval(),
            stop_tx.subscribe(),
            self.skipped.clone(),
            move || {
                let retention = retention.clone();
                async move {
                    if let Err(e) = retention.cleanup(retention_days) {
                        tracing::error!("RetentionManager: cleanup failed: {}", e);
                    }
                }
            },
        ));

        *running = Some(Running {
            stop_tx,
            loops: vec![reachability, speed, cleanup],
        });

        Ok(())
    }

    /// Stop all loops and abort in-flight work. Nothing is written after this returns.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let _ = running.stop_tx.send(());
        for handle in running.loops {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler: loop exited abnormally: {}", e);
            }
        }

        tracing::info!("Scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Run retention now, with the horizon of the last started configuration.
    pub fn trigger_cleanup(&self) -> Result<CleanupReport, DbError> {
        RetentionManager::new(self.gateway.clone(), self.clock.clone())
            .cleanup(self.retention_days.load(Ordering::Relaxed))
    }

    /// Ticks skipped because the previous unit of `kind` was still running.
    pub fn skipped_ticks(&self, kind: TaskKind) -> u64 {
        self.skipped.get(kind)
    }
}

/// Run `unit` every `period` until stopped, with at most one unit in flight.
async fn run_periodic<F, Fut>(
    kind: TaskKind,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
    skipped: Arc<SkipCounters>,
    unit: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let busy = Arc::new(Semaphore::new(1));
    let mut in_flight = JoinSet::new();

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                let permit = match busy.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        skipped.record(kind);
                        tracing::warn!("Scheduler: skipping {} tick, previous run still in progress", kind);
                        continue;
                    }
                };

                let work = unit();
                in_flight.spawn(async move {
                    let _permit = permit; // Hold permit until done
                    work.await;
                });
            }
            Some(result) = in_flight.join_next() => {
                if let Err(e) = result {
                    if e.is_panic() {
                        tracing::error!("Scheduler: {} run panicked: {}", kind, e);
                    }
                }
            }
        }
    }

    in_flight.shutdown().await;
}

async fn run_probe_round(
    prober: Arc<Prober>,
    detector: Arc<Mutex<OutageDetector>>,
    gateway: Arc<dyn Gateway>,
) {
    let round = match AssertUnwindSafe(prober.probe_round()).catch_unwind().await {
        Ok(round) => round,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            tracing::error!("Scheduler: probe round panicked: {}", reason);
            // Stored, but kept away from the outage detector.
            let failed = prober.failed_round(&format!("probe round panicked: {}", reason));
            if let Err(e) = gateway.append_connectivity(&failed) {
                tracing::error!("Scheduler: failed to store probe round: {}", e);
            }
            return;
        }
    };

    let failed = round.iter().filter(|s| !s.success).count();
    if failed > 0 {
        tracing::debug!("Scheduler: {}/{} targets failed", failed, round.len());
    }

    if let Err(e) = gateway.append_connectivity(&round) {
        tracing::error!("Scheduler: failed to store probe round: {}", e);
    }

    detector.lock().await.observe(&round, gateway.as_ref());
}

async fn run_speed_test(tester: Arc<HybridSpeedTester>, gateway: Arc<dyn Gateway>) {
    let sample = match AssertUnwindSafe(tester.run()).catch_unwind().await {
        Ok(sample) => sample,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            tracing::error!("Scheduler: speed test panicked: {}", reason);
            tester.failed_sample(format!("speed test panicked: {}", reason))
        }
    };

    if let Err(e) = gateway.append_speed(&sample) {
        tracing::error!("Scheduler: failed to store speed test: {}", e);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
