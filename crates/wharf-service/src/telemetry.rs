// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Telemetry for the artifact server: request spans, HTTP metrics, and the
//! Prometheus scrape endpoint.

use std::time::Duration;

use axum::{
    extract::{MatchedPath, Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
    routing::get,
    Extension, Router,
};
use prometheus::{register_histogram_vec_with_registry, HistogramVec, Registry, TextEncoder};
use tokio::time::Instant;
use tower_http::trace::{MakeSpan, OnResponse};
use tracing::{field, Span};

/// Route label used in metrics for requests that matched no route.
pub(crate) const UNMATCHED_ROUTE: &str = "invalid-route";

/// Registers the HTTP request-duration histogram with the registry.
pub fn register_http_metrics(registry: &Registry) -> HistogramVec {
    let opts = prometheus::Opts::new(
        "request_duration_seconds",
        "Time (in seconds) spent serving HTTP requests.",
    )
    .namespace("http");

    register_histogram_vec_with_registry!(
        opts.into(),
        &["method", "route", "status_code"],
        registry
    )
    .expect("metric registration must not fail")
}

/// Records the request duration into the histogram registered by
/// [`register_http_metrics`].
pub async fn metrics_middleware(
    State(metrics): State<HistogramVec>,
    request: Request,
    next: Next,
) -> Response {
    // Record the time manually, since the status code needed to select the
    // concrete histogram is only known after the handler ran.
    let start = Instant::now();
    let method = request.method().clone();
    let route: String = if let Some(path) = request.extensions().get::<MatchedPath>() {
        path.as_str().into()
    } else {
        // Do not use the requested URI: every invalid URI would create a new
        // histogram.
        UNMATCHED_ROUTE.into()
    };

    let response = next.run(request).await;

    let histogram =
        metrics.with_label_values(&[method.as_str(), &route, response.status().as_str()]);
    histogram.observe(start.elapsed().as_secs_f64());

    response
}

/// Generates new [`tracing::Span`]s for HTTP requests and records the status
/// code once the response is ready.
#[derive(Debug, Clone, Default)]
pub struct MakeHttpSpan;

impl MakeHttpSpan {
    /// Creates a new span maker.
    pub fn new() -> Self {
        Self
    }
}

impl<B> MakeSpan<B> for MakeHttpSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> Span {
        tracing::info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            status_code = field::Empty,
        )
    }
}

impl<B> OnResponse<B> for MakeHttpSpan {
    fn on_response(self, response: &axum::http::Response<B>, latency: Duration, span: &Span) {
        span.record("status_code", response.status().as_u16());
        tracing::debug!(parent: span, ?latency, "finished processing request");
    }
}

/// Starts an HTTP server whose sole purpose is to expose an endpoint the
/// Prometheus agent can poll for metrics.
pub fn start_prometheus_server(listener: tokio::net::TcpListener, registry: Registry) {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .layer(Extension(registry));

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(%error, "metrics server error");
        }
    });
}

async fn metrics(Extension(registry): Extension<Registry>) -> (StatusCode, String) {
    let metric_families = registry.gather();
    match TextEncoder.encode_to_string(&metric_families) {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {error}"),
        ),
    }
}
