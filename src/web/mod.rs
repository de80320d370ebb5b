//! Web server module: JSON query and control API.

mod handlers;

use crate::config::Config;
use crate::scheduler::Scheduler;
use crate::stats::QueryService;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queries: Arc<QueryService>,
    pub scheduler: Arc<Scheduler>,
}

/// Web server for linkwatch.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: Arc<Config>, queries: Arc<QueryService>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            state: AppState {
                config,
                queries,
                scheduler,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/status", get(handlers::handle_status))
            .route("/api/connectivity", get(handlers::handle_connectivity))
            .route("/api/speed-tests", get(handlers::handle_speed_tests))
            .route("/api/outages", get(handlers::handle_outages))
            .route("/api/stats", get(handlers::handle_stats))
            .route("/api/report", get(handlers::handle_report))
            .route("/api/charts/uptime", get(handlers::handle_uptime_chart))
            .route("/api/charts/speed", get(handlers::handle_speed_chart))
            .route("/api/health", get(handlers::handle_health))
            .route("/api/cleanup", post(handlers::handle_cleanup))
            .route("/api/scheduler/start", post(handlers::handle_scheduler_start))
            .route("/api/scheduler/stop", post(handlers::handle_scheduler_stop))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(64 * 1024))
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` completes.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.server.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{ConnectivitySample, Gateway, ProbeKind, Store};
    use crate::probe::testing::{ScriptedChecker, Step};
    use crate::speedtest::testing::ScriptedMethod;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    /// Serve the API on an ephemeral port and return its base URL.
    async fn spawn_server(store: Arc<Store>, config: Config) -> String {
        let clock = Arc::new(ManualClock::new(now()));
        let queries = Arc::new(QueryService::new(store.clone(), clock.clone()));
        let scheduler = Arc::new(
            Scheduler::new(store)
                .with_clock(clock)
                .with_checker(Arc::new(ScriptedChecker::new(Step::Ok(Duration::from_millis(5)))))
                .with_speed_methods(None, Arc::new(ScriptedMethod::ok(8.0, None, None))),
        );
        let server = Server::new(Arc::new(config), queries, scheduler);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = server.routes();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn sample(time: DateTime<Utc>, ok: bool) -> ConnectivitySample {
        ConnectivitySample {
            time,
            target: "8.8.8.8".to_string(),
            kind: ProbeKind::Ping,
            success: ok,
            latency_ms: ok.then_some(11.0),
            error: (!ok).then(|| "timeout".to_string()),
            attempts: 1,
        }
    }

    fn small_config() -> Config {
        let mut cfg = Config::default();
        cfg.targets.ping_hosts = vec!["8.8.8.8".to_string()];
        cfg.targets.dns_servers.clear();
        cfg
    }

    #[tokio::test]
    async fn test_status_and_connectivity() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let base = spawn_server(store.clone(), small_config()).await;
        let client = reqwest::Client::new();

        let status: serde_json::Value = client
            .get(format!("{}/api/status", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"], "unknown");

        store
            .append_connectivity(&[sample(now() - ChronoDuration::minutes(1), true)])
            .unwrap();

        let status: serde_json::Value = client
            .get(format!("{}/api/status", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["status"], "connected");

        let samples: Vec<serde_json::Value> = client
            .get(format!("{}/api/connectivity", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0]["kind"], "ping");

        let health: serde_json::Value = client
            .get(format!("{}/api/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["healthy"], true);
        assert_eq!(health["scheduler_running"], false);
    }

    #[tokio::test]
    async fn test_bad_windows_are_rejected() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let base = spawn_server(store, small_config()).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{}/api/stats?start=yesterday", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let resp = client
            .get(format!(
                "{}/api/outages?start=2024-05-02T00:00:00Z&end=2024-05-01T00:00:00Z",
                base
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let resp = client
            .get(format!("{}/api/report?days=0", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let resp = client
            .get(format!("{}/api/charts/speed?metric=jitter", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats_and_report() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let t = now() - ChronoDuration::hours(2);
        store.append_connectivity(&[sample(t, true)]).unwrap();
        store
            .append_connectivity(&[sample(t + ChronoDuration::seconds(30), false)])
            .unwrap();
        let base = spawn_server(store, small_config()).await;
        let client = reqwest::Client::new();

        let stats: serde_json::Value = client
            .get(format!("{}/api/stats", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats["uptime_percent"], 50.0);
        assert_eq!(stats["sample_count"], 2);

        let report: serde_json::Value = client
            .get(format!("{}/api/report?days=1", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(report["days"], 1);
        assert!(!report["recommendations"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_endpoint() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .append_connectivity(&[sample(now() - ChronoDuration::days(120), true)])
            .unwrap();
        let base = spawn_server(store.clone(), small_config()).await;

        let report: serde_json::Value = reqwest::Client::new()
            .post(format!("{}/api/cleanup", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(report["connectivity_samples"], 1);
        assert_eq!(store.row_counts().unwrap().0, 0);
    }

    #[tokio::test]
    async fn test_scheduler_control() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let base = spawn_server(store, small_config()).await;
        let client = reqwest::Client::new();

        let started: serde_json::Value = client
            .post(format!("{}/api/scheduler/start", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(started["running"], true);

        let stopped: serde_json::Value = client
            .post(format!("{}/api/scheduler/stop", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stopped["running"], false);
    }

    #[tokio::test]
    async fn test_scheduler_start_rejects_invalid_config() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut cfg = small_config();
        cfg.monitoring.max_retries = 0;
        let base = spawn_server(store, cfg).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/api/scheduler/start", base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
