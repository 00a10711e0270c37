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

use clap::{Parser, ValueEnum};
use prometheus_client::registry::Registry;
use reqwest::{Client, Url};
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tflcycles_exporter::client::{AppKeyScheme, BikePointClient, ClientConfig};
use tflcycles_exporter::http::RequestContext;
use tflcycles_exporter::metrics::{ClientMetrics, ExporterMetrics};
use tokio::signal::unix::{self, SignalKind};
use tracing::Level;

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9722);
const DEFAULT_TIMEOUT_MILLIS: u64 = 3000;
const DEFAULT_SCRAPE_TIMEOUT_MILLIS: u64 = 10_000;
const DEFAULT_API_URL: &str = "https://api.tfl.gov.uk/";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AppKeyLocation {
    Header,
    Query,
}

impl From<AppKeyLocation> for AppKeyScheme {
    fn from(location: AppKeyLocation) -> Self {
        match location {
            AppKeyLocation::Header => AppKeyScheme::Header,
            AppKeyLocation::Query => AppKeyScheme::Query,
        }
    }
}

#[derive(Debug, Parser)]
#[clap(name = "tflcycles_exporter", version = clap::crate_version!())]
struct TflCyclesExporterApplication {
    /// Base URL for the TfL Unified API
    #[clap(long, default_value = DEFAULT_API_URL)]
    api_url: Url,

    /// TfL Unified API application key. If empty, the API is used anonymously which
    /// allows fewer requests per minute.
    #[clap(long, env = "APP_KEY", default_value = "", hide_env_values = true)]
    app_key: String,

    /// How to send the application key to the API, as a header or as a query
    /// string parameter.
    #[clap(long, value_enum, default_value_t = AppKeyLocation::Header)]
    app_key_scheme: AppKeyLocation,

    /// Timeout for each attempt to fetch stations from the API, in milliseconds. Failed
    /// attempts are retried until the scrape times out.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Time allowed to fetch stations for a scrape, in milliseconds. Only used when the
    /// scrape request doesn't include the Prometheus scrape timeout header.
    #[clap(long, default_value_t = DEFAULT_SCRAPE_TIMEOUT_MILLIS)]
    scrape_timeout_millis: u64,

    /// Ask the API not to return cached responses.
    #[clap(long)]
    no_cache: bool,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Address to bind to. By default, tflcycles_exporter will bind to public address since
    /// the purpose is to expose metrics to an external system (Prometheus or another
    /// agent for ingestion)
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = TflCyclesExporterApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let http_client = Client::builder().build().unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize HTTP client", error = %e);
        process::exit(1)
    });

    let mut registry = Registry::default();
    let client_metrics = ClientMetrics::new(&mut registry);
    let exporter_metrics = ExporterMetrics::new(&mut registry);

    let config = ClientConfig {
        app_key: opts.app_key.clone(),
        app_key_scheme: opts.app_key_scheme.into(),
        timeout: Duration::from_millis(opts.timeout_millis),
        no_cache: opts.no_cache,
        ..Default::default()
    };

    let client = BikePointClient::new(http_client, &opts.api_url, config, client_metrics).unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize BikePoint client", api_url = %opts.api_url, error = %e);
        process::exit(1)
    });

    let context = Arc::new(RequestContext::new(
        client,
        registry,
        exporter_metrics,
        Duration::from_millis(opts.scrape_timeout_millis),
    ));

    let app = tflcycles_exporter::http::router(context);
    let server = axum::Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
        process::exit(1)
    });

    tracing::info!(
        message = "server started",
        address = %opts.bind,
        api_url = %opts.api_url,
        anonymous = opts.app_key.is_empty(),
    );

    server
        .serve(app.into_make_service())
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    tracing::info!("server shutdown");
    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
