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

//! Prometheus metrics exporter for TfL Santander Cycles docking stations
//!
//! ## Features
//!
//! `tflcycles_exporter` fetches the current state of every docking station from the
//! [TfL Unified API] `/BikePoint` endpoint and exposes it as Prometheus metrics. Data is
//! fetched when Prometheus scrapes the exporter, not in the background, so every scrape
//! sees the latest data available. The following metrics are emitted for each station.
//!
//! * `tflcycles_docks{station=$NAME}` - Total number of docks, including those out of service.
//! * `tflcycles_docks_available{station=$NAME}` - In-service, vacant docks a bike can be returned to.
//! * `tflcycles_bicycles_available{station=$NAME}` - In-service conventional bikes available for hire.
//! * `tflcycles_ebikes_available{station=$NAME}` - In-service e-bikes available for hire.
//!
//! Each scrape also includes `tflcycles_up` (whether the fetch succeeded) and
//! `tflcycles_scrape_duration_seconds` (how long the fetch took). If the fetch fails,
//! only these two metrics are emitted.
//!
//! [TfL Unified API]: https://api.tfl.gov.uk/
//!
//! ## Build
//!
//! `tflcycles_exporter` is a Rust program and must be built from source using a
//! [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! git clone git@github.com:56quarters/tflcycles_exporter.git && cd tflcycles_exporter
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Application key
//!
//! The API can be used anonymously, but is limited to 50 requests per minute. Register for
//! an application key at the [TfL API portal](https://api-portal.tfl.gov.uk/) to raise this
//! to 500 requests per minute, and pass it to the exporter using the `APP_KEY` environment
//! variable or `--app-key` flag.
//!
//! ```text
//! APP_KEY=abc123 ./tflcycles_exporter
//! ```
//!
//! ### Prometheus
//!
//! Station metrics are exposed on port `9722` at `/stations`. Metrics about the exporter
//! itself (request durations, retries, failures) are exposed at `/metrics`. Add both as
//! scrape jobs in your Prometheus configuration as described by the example below.
//!
//! ```yaml
//! # Sample config for Prometheus.
//!
//! scrape_configs:
//! - job_name: tflcycles
//!   metrics_path: /stations
//!   scrape_interval: 1m
//!   scrape_timeout: 30s
//!   static_configs:
//!   - targets: ['example:9722']
//! - job_name: tflcycles_exporter
//!   static_configs:
//!   - targets: ['example:9722']
//! ```
//!

pub mod backoff;
pub mod client;
pub mod http;
pub mod metrics;
pub mod stations;
