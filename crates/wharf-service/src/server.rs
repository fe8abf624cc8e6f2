// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! HTTP server publishing stored artifacts from every replica.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use prometheus::{HistogramVec, Registry};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use wharf_core::Artifact;

use crate::{
    error::StorageError,
    storage::ArtifactStore,
    telemetry::{metrics_middleware, register_http_metrics, MakeHttpSpan},
};

/// The health endpoint, answering from every replica based on backend health
/// rather than leader election.
pub const HEALTH_ENDPOINT: &str = "/health";

/// Deadline for the backend probe behind the health endpoint.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a whole request; generous so large artifacts can stream out.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Serves artifacts over HTTP from any storage backend.
///
/// Backends that mint their own URLs are served by redirecting clients to a
/// presigned URL, which offloads the transfer to the object store; all other
/// backends are streamed directly.
pub struct ArtifactServer {
    store: Arc<dyn ArtifactStore>,
    metrics: HistogramVec,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for ArtifactServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactServer").finish_non_exhaustive()
    }
}

impl ArtifactServer {
    /// Creates a new artifact server on top of the given backend.
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        cancel_token: CancellationToken,
        registry: &Registry,
    ) -> Self {
        Self {
            store,
            metrics: register_http_metrics(registry),
            cancel_token,
        }
    }

    /// The router serving artifacts, usable for in-process testing.
    pub fn router(&self) -> Router {
        Router::new()
            .route(HEALTH_ENDPOINT, get(health))
            .route("/", get(empty_path))
            .route("/*path", get(serve_artifact))
            .with_state(self.store.clone())
            // The following layers are executed from the bottom up.
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(MakeHttpSpan::new())
                    .on_response(MakeHttpSpan::new()),
            )
            .layer(middleware::from_fn_with_state(
                self.metrics.clone(),
                metrics_middleware,
            ))
    }

    /// Binds the given address and serves until cancelled.
    pub async fn run(&self, network_address: &SocketAddr) -> Result<(), std::io::Error> {
        let listener = tokio::net::TcpListener::bind(network_address).await?;
        self.serve(listener).await
    }

    /// Serves on an already-bound listener until cancelled.
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<(), std::io::Error> {
        tracing::info!(
            address = %listener.local_addr()?,
            "the artifact server is starting",
        );
        axum::serve(listener, self.router())
            .with_graceful_shutdown(self.cancel_token.clone().cancelled_owned())
            .await
    }
}

/// Serves `GET`/`HEAD` requests for a single artifact.
///
/// Other methods never reach this handler; the router answers them with 405.
async fn serve_artifact(
    State(store): State<Arc<dyn ArtifactStore>>,
    method: Method,
    Path(path): Path<String>,
) -> Response {
    let artifact = Artifact::from_path(path);

    match store.exists(&artifact).await {
        Ok(true) => {}
        Ok(false) => {
            return (StatusCode::NOT_FOUND, "artifact not found").into_response();
        }
        Err(StorageError::Cancelled) => {
            tracing::debug!(path = %artifact.path, "existence check cancelled");
            return cancelled_response();
        }
        Err(error) => {
            tracing::error!(path = %artifact.path, %error, "failed to check artifact existence");
            return internal_error();
        }
    }

    if method == Method::HEAD {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/gzip"))],
        )
            .into_response();
    }

    if store.supports_redirect() {
        // Hand the transfer off to the object store via a presigned URL.
        return match store.get_url(&artifact).await {
            Ok(url) => Redirect::temporary(&url).into_response(),
            Err(StorageError::Cancelled) => cancelled_response(),
            Err(error) => {
                tracing::error!(path = %artifact.path, %error, "failed to get artifact URL");
                internal_error()
            }
        };
    }

    match store.retrieve(&artifact).await {
        Ok(reader) => {
            // A mid-stream failure terminates the connection; headers are
            // already on the wire by then.
            let body = Body::from_stream(ReaderStream::new(reader));
            (
                [
                    (
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/gzip"),
                    ),
                    (
                        header::CACHE_CONTROL,
                        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
                    ),
                ],
                body,
            )
                .into_response()
        }
        // Deleted by a concurrent garbage collection between the existence
        // check and the read.
        Err(error) if error.is_not_found() => {
            (StatusCode::NOT_FOUND, "artifact not found").into_response()
        }
        Err(StorageError::Cancelled) => cancelled_response(),
        Err(error) => {
            tracing::error!(path = %artifact.path, %error, "failed to retrieve artifact");
            internal_error()
        }
    }
}

async fn empty_path() -> Response {
    (StatusCode::BAD_REQUEST, "artifact path required").into_response()
}

async fn health(State(store): State<Arc<dyn ArtifactStore>>) -> Response {
    let probe = tokio::time::timeout(HEALTH_TIMEOUT, store.healthy())
        .await
        .map_err(|_| StorageError::Cancelled)
        .and_then(|result| result);
    match probe {
        Ok(()) => (StatusCode::OK, "ok\n").into_response(),
        Err(StorageError::Cancelled) => {
            tracing::warn!("storage health check timed out");
            (StatusCode::SERVICE_UNAVAILABLE, "Storage unhealthy").into_response()
        }
        Err(error) => {
            tracing::warn!(%error, "storage health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "Storage unhealthy").into_response()
        }
    }
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
}

/// Answer for backend calls cancelled mid-request. The nonstandard 499 is the
/// conventional code for requests abandoned before a response was produced.
fn cancelled_response() -> Response {
    let status = StatusCode::from_u16(499).expect("499 is within the valid status range");
    (status, "request cancelled").into_response()
}
