//! Prometheus metrics + liveness surface (C12), in the style of this stack's
//! `hook-common::metrics` router: a `/metrics` route wrapping every request
//! in a latency/status middleware, plus a liveness probe the poll loop
//! heartbeats into.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Shared liveness state: the poll loop reports healthy on every iteration;
/// `/healthz` fails once that heartbeat goes stale past `max_age_secs`.
pub struct Liveness {
    last_healthy_unix: AtomicI64,
    max_age_secs: i64,
}

impl Liveness {
    pub fn new(max_age_secs: i64) -> Self {
        Self {
            last_healthy_unix: AtomicI64::new(now_unix()),
            max_age_secs,
        }
    }

    pub fn report_healthy(&self) {
        self.last_healthy_unix.store(now_unix(), Ordering::Relaxed);
    }

    fn is_healthy(&self) -> bool {
        now_unix() - self.last_healthy_unix.load(Ordering::Relaxed) <= self.max_age_secs
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

async fn healthz(State(liveness): State<std::sync::Arc<Liveness>>) -> impl IntoResponse {
    if liveness.is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stale")
    }
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

pub fn router(liveness: std::sync::Arc<Liveness>) -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route("/metrics", get(move || std::future::ready(recorder_handle.render())))
        .route("/healthz", get(healthz))
        .with_state(liveness)
        .layer(middleware::from_fn(track_metrics))
}

async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("commit_gateway_http_requests_total", &labels).increment(1);
    metrics::histogram!("commit_gateway_http_requests_duration_seconds", &labels).record(latency);

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshly_created_liveness_is_healthy() {
        let liveness = Liveness::new(30);
        assert!(liveness.is_healthy());
    }

    #[test]
    fn stale_heartbeat_is_unhealthy() {
        let liveness = Liveness::new(30);
        liveness
            .last_healthy_unix
            .store(now_unix() - 31, Ordering::Relaxed);
        assert!(!liveness.is_healthy());
    }

    #[test]
    fn report_healthy_resets_staleness() {
        let liveness = Liveness::new(30);
        liveness
            .last_healthy_unix
            .store(now_unix() - 31, Ordering::Relaxed);
        liveness.report_healthy();
        assert!(liveness.is_healthy());
    }
}
