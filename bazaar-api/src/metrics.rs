//! Prometheus metrics served on `/metrics`.

use axum::{
    extract::{MatchedPath, Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use prometheus::{opts, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::time::Instant;

use crate::error::{AppError, ErrorKind};
use crate::state::AppState;

pub struct ApiMetrics {
    registry: Registry,
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
    domain_errors: CounterVec,
    holds_released: IntCounter,
    payout_batches: IntCounterVec,
}

impl ApiMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            opts!("bazaar_http_requests_total", "HTTP requests by route and status"),
            &["method", "route", "status"],
        )?;
        let http_duration = HistogramVec::new(
            HistogramOpts::new("bazaar_http_request_duration_seconds", "HTTP request latency")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
            &["method", "route"],
        )?;
        let domain_errors = CounterVec::new(
            opts!("bazaar_domain_errors_total", "Rejected requests by error kind"),
            &["kind"],
        )?;
        let holds_released = IntCounter::new(
            "bazaar_holds_released_total",
            "Sale holds moved to the eligible balance by the sweep",
        )?;
        let payout_batches = IntCounterVec::new(
            opts!("bazaar_payout_batches_total", "Payout batches by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(http_duration.clone()))?;
        registry.register(Box::new(domain_errors.clone()))?;
        registry.register(Box::new(holds_released.clone()))?;
        registry.register(Box::new(payout_batches.clone()))?;

        Ok(Self {
            registry,
            http_requests,
            http_duration,
            domain_errors,
            holds_released,
            payout_batches,
        })
    }

    pub fn record_sweep(&self, released: usize) {
        self.holds_released.inc_by(released as u64);
    }

    pub fn record_payouts(&self, paid: usize, failed: usize) {
        self.payout_batches.with_label_values(&["paid"]).inc_by(paid as u64);
        self.payout_batches.with_label_values(&["failed"]).inc_by(failed as u64);
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub async fn track_metrics(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".into());

    let response = next.run(req).await;

    let metrics = &state.metrics;
    let status = response.status().as_u16().to_string();
    metrics
        .http_requests
        .with_label_values(&[method.as_str(), route.as_str(), status.as_str()])
        .inc();
    metrics
        .http_duration
        .with_label_values(&[method.as_str(), route.as_str()])
        .observe(started.elapsed().as_secs_f64());
    if let Some(ErrorKind(kind)) = response.extensions().get::<ErrorKind>() {
        metrics.domain_errors.with_label_values(&[*kind]).inc();
    }
    response
}

pub async fn metrics_handler(State(state): State<AppState>) -> Result<Response, AppError> {
    let body = state
        .metrics
        .render()
        .map_err(|e| AppError::Core(bazaar_core::CoreError::storage(e)))?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response())
}
