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

use crate::backoff::ExponentialBackoff;
use crate::metrics::ClientMetrics;
use crate::stations::{self, DecodeError, StationAvailability};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use std::error;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

const APP_KEY: &str = "app_key";

/// How the application key is attached to requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AppKeyScheme {
    /// `app_key` request header. Not documented by TfL but supported.
    #[default]
    Header,
    /// `app_key` query string parameter.
    Query,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TfL Unified API application key. Empty means anonymous access, which has a
    /// much lower rate limit (50 vs 500 requests per minute).
    pub app_key: String,
    pub app_key_scheme: AppKeyScheme,
    /// Timeout for each individual attempt, including reading and parsing the response.
    pub timeout: Duration,
    /// Ask upstream caches not to serve a stored response, otherwise data may be up to 30s old.
    pub no_cache: bool,
    pub backoff: ExponentialBackoff,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            app_key: String::new(),
            app_key_scheme: AppKeyScheme::default(),
            timeout: Duration::from_secs(3),
            no_cache: false,
            backoff: ExponentialBackoff::default(),
        }
    }
}

#[derive(Debug)]
pub enum ClientError {
    Transport(reqwest::Error),
    Timeout(Duration),
    Status { status: StatusCode, body: Option<String> },
    Decode(DecodeError),
    Deadline(Option<Box<ClientError>>),
    InvalidUrl(Url),
    InvalidAppKey,
}

impl ClientError {
    /// True if retrying the request cannot help.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::Status { status, .. } => status.as_u16() < 500,
            Self::InvalidUrl(_) | Self::InvalidAppKey => true,
            _ => false,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::Timeout(d) => write!(f, "request timed out after {:?}", d),
            Self::Status { status, body: Some(body) } => write!(f, "got HTTP {}: {}", status, body),
            Self::Status { status, body: None } => write!(f, "got HTTP {}", status),
            Self::Decode(e) => write!(f, "{}", e),
            Self::Deadline(Some(e)) => write!(f, "deadline exceeded: {}", e),
            Self::Deadline(None) => write!(f, "deadline exceeded"),
            Self::InvalidUrl(u) => write!(f, "invalid base URL {}", u),
            Self::InvalidAppKey => write!(f, "application key is not a valid header value"),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Deadline(Some(e)) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// Client for the TfL Unified API `/BikePoint` endpoint.
///
/// Station filtering is not done here since the entire response has to be
/// decoded anyway, callers may discard the stations they don't care about.
#[derive(Debug)]
pub struct BikePointClient {
    client: Client,
    url: Url,
    headers: HeaderMap,
    config: ClientConfig,
    metrics: ClientMetrics,
}

impl BikePointClient {
    // TfL blocks default user agents of common HTTP libraries.
    const USER_AGENT: &'static str = concat!("tflcycles_exporter/", env!("CARGO_PKG_VERSION"));
    const JSON_RESPONSE: &'static str = "application/json";

    /// Build a client for `/BikePoint` relative to `base_url`, e.g. `https://api.tfl.gov.uk/`.
    ///
    /// The URL and headers sent with every request are computed once, here.
    pub fn new(
        client: Client,
        base_url: &Url,
        config: ClientConfig,
        metrics: ClientMetrics,
    ) -> Result<Self, ClientError> {
        let mut url = base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ClientError::InvalidUrl(base_url.clone()))?;
            segments.pop_if_empty().push("BikePoint");
        }

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(Self::USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static(Self::JSON_RESPONSE));
        if config.no_cache {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        }

        if !config.app_key.is_empty() {
            match config.app_key_scheme {
                AppKeyScheme::Header => {
                    let mut value =
                        HeaderValue::from_str(&config.app_key).map_err(|_| ClientError::InvalidAppKey)?;
                    value.set_sensitive(true);
                    headers.insert(HeaderName::from_static(APP_KEY), value);
                }
                AppKeyScheme::Query => {
                    url.query_pairs_mut().append_pair(APP_KEY, &config.app_key);
                }
            }
        }

        Ok(BikePointClient {
            client,
            url,
            headers,
            config,
            metrics,
        })
    }

    /// Retrieve the latest dock and bike availability of every station.
    ///
    /// Transient failures (timeouts, 5xx responses, undecodable bodies) are retried with
    /// exponential backoff until `deadline`. Any other non-200 response fails immediately.
    /// Stations are returned sorted by station ID, as sent by the API.
    pub async fn fetch(&self, deadline: Instant) -> Result<Vec<StationAvailability>, ClientError> {
        let mut intervals = self.config.backoff.intervals();
        let mut last_error = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Deadline(last_error.map(Box::new)));
            }

            let timeout = self.config.timeout.min(remaining);
            let start = Instant::now();
            let result = match tokio::time::timeout(timeout, self.attempt()).await {
                Ok(r) => r,
                Err(_) => Err(ClientError::Timeout(timeout)),
            };
            self.metrics.request_duration.observe(start.elapsed().as_secs_f64());

            let err = match result {
                Ok(stations) => return Ok(stations),
                Err(e) => e,
            };

            self.metrics.request_failures.inc();
            if err.is_permanent() {
                return Err(err);
            }

            let wait = intervals.next().unwrap_or(self.config.backoff.max_interval);
            if Instant::now() + wait >= deadline {
                return Err(ClientError::Deadline(Some(Box::new(err))));
            }

            tracing::warn!(
                message = "failed attempt",
                error = %err,
                timeout = ?timeout,
                wait = ?wait,
            );
            self.metrics.request_retries.inc();
            last_error = Some(err);
            tokio::time::sleep(wait).await;
        }
    }

    async fn attempt(&self) -> Result<Vec<StationAvailability>, ClientError> {
        tracing::debug!(message = "making bike point request", url = %self.url);

        let res = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(ClientError::Transport)?;

        let status = res.status();
        if status != StatusCode::OK {
            let body = res.text().await.ok().filter(|b| !b.is_empty());
            return Err(ClientError::Status { status, body });
        }

        let body = res.bytes().await.map_err(ClientError::Transport)?;
        stations::decode(&body).map_err(ClientError::Decode)
    }
}
