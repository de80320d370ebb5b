//! HTTP request handlers.

use super::AppState;
use crate::db::TimeWindow;
use crate::stats::SpeedMetric;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

const MAX_REPORT_DAYS: u32 = 3650;

// ============================================================================
// Query parameters
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SpeedChartQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub metric: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    #[serde(default)]
    pub days: Option<u32>,
}

fn bad_request(msg: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, msg.into()).into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    tracing::error!("API: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, Response> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| bad_request(format!("invalid time {:?}: {}", raw, e)))
}

/// Resolve optional RFC 3339 bounds. A missing end means now, a missing
/// start means `default_length` before the end.
fn resolve_window(
    start: Option<&str>,
    end: Option<&str>,
    now: DateTime<Utc>,
    default_length: ChronoDuration,
) -> Result<TimeWindow, Response> {
    let end = match end {
        Some(raw) => parse_time(raw)?,
        None => now,
    };
    let start = match start {
        Some(raw) => parse_time(raw)?,
        None => end - default_length,
    };
    TimeWindow::new(start, end).ok_or_else(|| bad_request("start must be before end"))
}

fn window(state: &AppState, query: &WindowQuery, default_length: ChronoDuration) -> Result<TimeWindow, Response> {
    resolve_window(
        query.start.as_deref(),
        query.end.as_deref(),
        state.queries.now(),
        default_length,
    )
}

// ============================================================================
// API: Status
// ============================================================================

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.queries.current_status() {
        Ok(status) => Json(status).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub scheduler_running: bool,
}

pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let health = match state.queries.health() {
        Ok(h) => h,
        Err(e) => return internal_error(e),
    };

    Json(HealthResponse {
        healthy: health.healthy,
        last_sample_at: health.last_sample_at,
        scheduler_running: state.scheduler.is_running().await,
    })
    .into_response()
}

// ============================================================================
// API: History
// ============================================================================

pub async fn handle_connectivity(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    let window = match window(&state, &query, ChronoDuration::hours(24)) {
        Ok(w) => w,
        Err(resp) => return resp,
    };

    match state.queries.connectivity(&window) {
        Ok(samples) => Json(samples).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn handle_speed_tests(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    let window = match window(&state, &query, ChronoDuration::hours(24)) {
        Ok(w) => w,
        Err(resp) => return resp,
    };

    match state.queries.speed_tests(&window) {
        Ok(samples) => Json(samples).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn handle_outages(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    let window = match window(&state, &query, ChronoDuration::days(7)) {
        Ok(w) => w,
        Err(resp) => return resp,
    };

    match state.queries.outages(&window) {
        Ok(events) => Json(events).into_response(),
        Err(e) => internal_error(e),
    }
}

// ============================================================================
// API: Statistics
// ============================================================================

pub async fn handle_stats(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    let window = match window(&state, &query, ChronoDuration::hours(24)) {
        Ok(w) => w,
        Err(resp) => return resp,
    };

    match state.queries.stats(&window) {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn handle_report(
    State(state): State<AppState>,
    Query(query): Query<ReportQuery>,
) -> impl IntoResponse {
    let days = query.days.unwrap_or(7);
    if days == 0 || days > MAX_REPORT_DAYS {
        return bad_request(format!("days must be between 1 and {}", MAX_REPORT_DAYS));
    }

    match state.queries.report(days) {
        Ok(report) => Json(report).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn handle_uptime_chart(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> impl IntoResponse {
    let window = match window(&state, &query, ChronoDuration::hours(24)) {
        Ok(w) => w,
        Err(resp) => return resp,
    };

    match state.queries.uptime_series(&window) {
        Ok(points) => Json(points).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn handle_speed_chart(
    State(state): State<AppState>,
    Query(query): Query<SpeedChartQuery>,
) -> impl IntoResponse {
    let metric = match query.metric.as_deref() {
        None => SpeedMetric::default(),
        Some(raw) => match raw.parse::<SpeedMetric>() {
            Ok(m) => m,
            Err(e) => return bad_request(e.to_string()),
        },
    };

    let window = match resolve_window(
        query.start.as_deref(),
        query.end.as_deref(),
        state.queries.now(),
        ChronoDuration::hours(24),
    ) {
        Ok(w) => w,
        Err(resp) => return resp,
    };

    match state.queries.speed_series(&window, metric) {
        Ok(points) => Json(points).into_response(),
        Err(e) => internal_error(e),
    }
}

// ============================================================================
// API: Control
// ============================================================================

pub async fn handle_cleanup(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.trigger_cleanup() {
        Ok(report) => Json(report).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct SchedulerResponse {
    pub running: bool,
}

pub async fn handle_scheduler_start(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.start(&state.config).await {
        Ok(()) => Json(SchedulerResponse { running: true }).into_response(),
        Err(e) => bad_request(e.to_string()),
    }
}

pub async fn handle_scheduler_stop(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.stop().await;
    Json(SchedulerResponse { running: false }).into_response()
}
