use std::sync::Arc;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use derive_new::new;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::RelayMetrics;

/// A server that serves the relay's metrics
#[derive(new, Debug)]
pub struct Server {
    listen_port: u16,
    metrics: Arc<RelayMetrics>,
}

impl Server {
    fn router(&self) -> Router {
        let metrics = self.metrics.clone();
        Router::new().route("/metrics", get(move || Self::gather_metrics(metrics)))
    }

    /// Run an HTTP server
    ///
    /// routes:
    ///  - metrics - serving OpenMetrics format reports on `/metrics`
    ///    (this is compatible with Prometheus, which ought to be configured to scrape this endpoint)
    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        let port = self.listen_port;
        info!(port, "starting server on 0.0.0.0");
        let app = self.router();

        tokio::spawn(async move {
            let url = format!("0.0.0.0:{}", port);
            let listener = match tokio::net::TcpListener::bind(&url).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!(?err, %url, "Failed to bind metrics server");
                    return;
                }
            };
            if let Err(err) = axum::serve(listener, app).await {
                error!(?err, "Metrics server stopped");
            }
        })
    }

    /// Gather available metrics into an encoded (plaintext, OpenMetrics format)
    /// report.
    async fn gather_metrics(metrics: Arc<RelayMetrics>) -> impl IntoResponse {
        tracing::debug!("Traversing route for /metrics endpoint for serving Prometheus metrics");
        match metrics.gather() {
            Ok(metrics) => match String::from_utf8(metrics) {
                Ok(metrics_string) => (StatusCode::OK, metrics_string),
                Err(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".into(),
                ),
            },
            Err(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to gather metrics".into(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn metrics_route_serves_report() {
        let metrics = Arc::new(RelayMetrics::dummy().unwrap());
        metrics.transactions_dispatched.inc_by(3);
        let server = Server::new(0, metrics);

        let response = server
            .router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("relayd_transactions_dispatched 3"));
    }
}
