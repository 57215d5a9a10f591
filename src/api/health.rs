//! Health/readiness/status HTTP surface, grounded on the teacher's
//! `api::routes::health` handler shape (`axum::Json` response with an
//! explicit status code) generalized to the richer checks this pipeline
//! needs to report.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::domain::breaker::{CircuitBreakerStats, CircuitBreakers};
use crate::worker::recovery::ConnectionWatchdog;

use super::metrics::{AppMetrics, MetricsSnapshot};

#[derive(Clone)]
pub struct HealthState {
    pub metrics: Arc<AppMetrics>,
    pub breakers: Arc<CircuitBreakers>,
    pub watchdog: Option<Arc<ConnectionWatchdog>>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "alive" }))
}

async fn ready(State(state): State<HealthState>) -> impl IntoResponse {
    let checks_ok = state.watchdog.as_ref().map(|w| w.all_healthy()).unwrap_or(true);
    let breakers_ok = state
        .breakers
        .get_all_stats()
        .iter()
        .all(|s| s.state != crate::domain::breaker::CircuitState::Open);

    if checks_ok && breakers_ok {
        (StatusCode::OK, Json(HealthResponse { status: "ready" }))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(HealthResponse { status: "not_ready" }))
    }
}

#[derive(Serialize)]
struct StatusResponse {
    checks: std::collections::HashMap<String, bool>,
    breakers: Vec<CircuitBreakerStats>,
    metrics: MetricsSnapshot,
}

async fn status(State(state): State<HealthState>) -> impl IntoResponse {
    let checks = state.watchdog.as_ref().map(|w| w.status()).unwrap_or_default();
    let body = StatusResponse {
        checks,
        breakers: state.breakers.get_all_stats(),
        metrics: state.metrics.snapshot(),
    };
    (StatusCode::OK, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_is_ok_with_no_breakers_open_and_no_watchdog() {
        let state = HealthState {
            metrics: AppMetrics::new(),
            breakers: CircuitBreakers::new(),
            watchdog: None,
        };
        let resp = ready(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_is_unavailable_when_a_breaker_is_open() {
        let breakers = CircuitBreakers::new();
        let b = breakers.get("imap", 1, std::time::Duration::from_secs(60), 1);
        b.record_failure(None);
        let state = HealthState {
            metrics: AppMetrics::new(),
            breakers,
            watchdog: None,
        };
        let resp = ready(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
