// tflcycles_exporter - Prometheus metrics exporter for TfL Santander Cycles
//
// Copyright 2024 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::client::BikePointClient;
use crate::metrics::{ExporterMetrics, ScrapeCollector, StationCollector};
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

const OPENMETRICS_TEXT: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";
const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";
const SCRAPE_TIMEOUT_OFFSET: Duration = Duration::from_millis(500);

/// State shared by every request: the BikePoint client and the process-wide metrics.
#[derive(Debug)]
pub struct RequestContext {
    client: BikePointClient,
    registry: Registry,
    metrics: ExporterMetrics,
    scrape_timeout: Duration,
}

impl RequestContext {
    /// Create a new context. `registry` must already contain every process-wide metric,
    /// it is only read from after this point. `scrape_timeout` is used for scrapes that
    /// don't say how long Prometheus is willing to wait.
    pub fn new(
        client: BikePointClient,
        registry: Registry,
        metrics: ExporterMetrics,
        scrape_timeout: Duration,
    ) -> Self {
        RequestContext {
            client,
            registry,
            metrics,
            scrape_timeout,
        }
    }

    /// Fetch station availability once and encode it, along with the outcome of the
    /// fetch, in the OpenMetrics text format.
    ///
    /// Nothing is cached between calls. Station metrics are only included if the
    /// fetch succeeded.
    pub async fn scrape(&self, deadline: Instant) -> Result<String, fmt::Error> {
        let start = Instant::now();
        let result = self.client.fetch(deadline).await;
        let elapsed = start.elapsed();
        self.metrics.fetch_duration.observe(elapsed.as_secs_f64());

        let stations = match result {
            Ok(stations) => Some(stations),
            Err(e) => {
                self.metrics.fetch_failures.inc();
                tracing::error!(message = "failed to fetch station availabilities", error = %e);
                None
            }
        };

        let mut registry = Registry::default();
        registry.register_collector(Box::new(ScrapeCollector::new(stations.is_some(), elapsed)));
        if let Some(stations) = stations {
            registry.register_collector(Box::new(StationCollector::new(stations)));
        }

        let mut buf = String::new();
        encode(&mut buf, &registry)?;
        Ok(buf)
    }

    /// Encode the process-wide metrics in the OpenMetrics text format.
    pub fn process_metrics(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }

    fn deadline(&self, headers: &HeaderMap) -> Instant {
        let now = Instant::now();
        now.checked_add(scrape_timeout(headers, self.scrape_timeout))
            .unwrap_or_else(|| now + self.scrape_timeout)
    }
}

/// Time available for a scrape based on the timeout Prometheus sends with each request,
/// less some time for encoding and sending the response. `default` if there is no such header.
fn scrape_timeout(headers: &HeaderMap, default: Duration) -> Duration {
    headers
        .get(SCRAPE_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(|timeout| timeout.saturating_sub(SCRAPE_TIMEOUT_OFFSET))
        .unwrap_or(default)
}

/// Handler for `GET /stations`: fetch and expose station availability.
///
/// Responds with 200 even when the fetch fails, `tflcycles_up` is 0 in that case.
pub async fn stations(State(context): State<Arc<RequestContext>>, headers: HeaderMap) -> Response {
    let deadline = context.deadline(&headers);
    metrics_response(context.scrape(deadline).await)
}

/// Handler for `GET /metrics`: metrics about the exporter itself.
pub async fn metrics(State(context): State<Arc<RequestContext>>) -> Response {
    metrics_response(context.process_metrics())
}

/// Handler for `GET /`: a landing page, cheap enough to use for health checks.
pub async fn index() -> Html<String> {
    Html(format!(
        concat!(
            "<!DOCTYPE html>\n",
            "<html>\n",
            "<head><title>TfL Cycles Exporter</title></head>\n",
            "<body>\n",
            "<h1>TfL Cycles Exporter</h1>\n",
            "<p>Version {}</p>\n",
            "<ul>\n",
            "<li><a href=\"/stations\">Station availability</a></li>\n",
            "<li><a href=\"/metrics\">Exporter metrics</a></li>\n",
            "</ul>\n",
            "</body>\n",
            "</html>\n",
        ),
        env!("CARGO_PKG_VERSION")
    ))
}

/// Build the router for every endpoint exposed by the exporter.
pub fn router(context: Arc<RequestContext>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/metrics", get(metrics))
        .route("/stations", get(stations))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

fn metrics_response(encoded: Result<String, fmt::Error>) -> Response {
    match encoded {
        Ok(buf) => {
            tracing::debug!(message = "encoded prometheus metrics to text format", num_bytes = buf.len());
            ([(CONTENT_TYPE, OPENMETRICS_TEXT)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
