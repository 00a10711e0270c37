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

use crate::stations::StationAvailability;
use prometheus_client::collector::Collector;
use prometheus_client::encoding::{DescriptorEncoder, EncodeLabelValue, EncodeMetric, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::ConstGauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::metrics::info::Info;
use prometheus_client::metrics::MetricType;
use prometheus_client::registry::Registry;
use std::fmt::Write;
use std::time::Duration;

const LABEL_STATION: &str = "station";
const LABEL_VERSION: &str = "version";

/// Process-wide metrics about individual requests made to the BikePoint API.
///
/// Cloning is cheap and clones share the same underlying values, so a single
/// instance can be handed to every client.
#[derive(Debug, Clone)]
pub struct ClientMetrics {
    pub(crate) request_duration: Histogram,
    pub(crate) request_failures: Counter,
    pub(crate) request_retries: Counter,
}

impl ClientMetrics {
    /// Create new client metrics and register each of them with the provided `Registry`.
    pub fn new(reg: &mut Registry) -> Self {
        // The last bucket is just above the default per-attempt timeout. Requests cut
        // short by a timeout will observe a shorter value than the timeout itself.
        let request_duration = Histogram::new(exponential_buckets(0.2, 1.355, 10));
        let request_failures = Counter::default();
        let request_retries = Counter::default();

        reg.register(
            "tflcycles_bikepoint_http_request_duration_seconds",
            "Observes the duration of all requests to /BikePoint, including response parsing",
            request_duration.clone(),
        );
        reg.register(
            "tflcycles_bikepoint_http_request_failures",
            "The number of BikePoint API requests that timed out or returned an invalid response",
            request_failures.clone(),
        );
        reg.register(
            "tflcycles_bikepoint_http_request_retries",
            "The number of times a request to /BikePoint timed out or failed and was retried",
            request_retries.clone(),
        );

        Self {
            request_duration,
            request_failures,
            request_retries,
        }
    }
}

/// Process-wide metrics about entire fetch operations, one per scrape.
#[derive(Debug, Clone)]
pub struct ExporterMetrics {
    pub(crate) fetch_duration: Histogram,
    pub(crate) fetch_failures: Counter,
}

impl ExporterMetrics {
    /// Create new exporter metrics and register each of them, along with build
    /// information, with the provided `Registry`.
    pub fn new(reg: &mut Registry) -> Self {
        let fetch_duration = Histogram::new(exponential_buckets(0.2, 2.0, 8));
        let fetch_failures = Counter::default();

        reg.register(
            "tflcycles_exporter_build",
            "The version of the running exporter",
            Info::new(vec![(LABEL_VERSION.to_owned(), env!("CARGO_PKG_VERSION").to_owned())]),
        );
        reg.register(
            "tflcycles_exporter_fetch_duration_seconds",
            "Observes the end-to-end duration of fetch operations",
            fetch_duration.clone(),
        );
        reg.register(
            "tflcycles_exporter_fetch_failures",
            "Counts the number of fetch operations that have failed",
            fetch_failures.clone(),
        );

        Self {
            fetch_duration,
            fetch_failures,
        }
    }
}

/// Collector for the result of fetching data from the BikePoint API for a single scrape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrapeCollector {
    succeeded: bool,
    elapsed: Duration,
}

impl ScrapeCollector {
    pub fn new(succeeded: bool, elapsed: Duration) -> Self {
        ScrapeCollector { succeeded, elapsed }
    }
}

impl Collector for ScrapeCollector {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), std::fmt::Error> {
        let up = ConstGauge::new(if self.succeeded { 1.0 } else { 0.0 });
        let metric_encoder = encoder.encode_descriptor(
            "tflcycles_up",
            "Whether the request to the /BikePoint API succeeded",
            None,
            up.metric_type(),
        )?;
        up.encode(metric_encoder)?;

        let duration = ConstGauge::new(self.elapsed.as_secs_f64());
        let metric_encoder = encoder.encode_descriptor(
            "tflcycles_scrape_duration_seconds",
            "The amount of time it took to retrieve and parse the data for the scrape",
            None,
            duration.metric_type(),
        )?;
        duration.encode(metric_encoder)?;

        Ok(())
    }
}

/// Station name label value, escaped for the text exposition format.
#[derive(Debug, Clone, Copy)]
struct StationName<'a>(&'a str);

impl EncodeLabelValue for StationName<'_> {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        for c in self.0.chars() {
            match c {
                '\\' => encoder.write_str("\\\\")?,
                '"' => encoder.write_str("\\\"")?,
                '\n' => encoder.write_str("\\n")?,
                _ => encoder.write_char(c)?,
            }
        }

        Ok(())
    }
}

/// Collector for dock and bike availability of every station from a single fetch.
///
/// One sample is emitted per station for each metric, in the order the stations
/// were returned by the API. Stations that share a name are not merged.
#[derive(Debug, Clone, Default)]
pub struct StationCollector {
    stations: Vec<StationAvailability>,
}

impl StationCollector {
    pub fn new(stations: Vec<StationAvailability>) -> Self {
        StationCollector { stations }
    }

    fn encode_gauge<F>(
        &self,
        encoder: &mut DescriptorEncoder,
        name: &str,
        help: &str,
        value: F,
    ) -> Result<(), std::fmt::Error>
    where
        F: Fn(&StationAvailability) -> u32,
    {
        let mut metric_encoder = encoder.encode_descriptor(name, help, None, MetricType::Gauge)?;
        for sa in self.stations.iter() {
            let labels = [(LABEL_STATION, StationName(&sa.station.name))];
            let family_encoder = metric_encoder.encode_family(&labels)?;
            ConstGauge::new(i64::from(value(sa))).encode(family_encoder)?;
        }

        Ok(())
    }
}

impl Collector for StationCollector {
    fn encode(&self, mut encoder: DescriptorEncoder) -> Result<(), std::fmt::Error> {
        self.encode_gauge(
            &mut encoder,
            "tflcycles_docks",
            "The total number of docks at the station, including those that are out of service",
            |sa| sa.station.docks,
        )?;
        self.encode_gauge(
            &mut encoder,
            "tflcycles_docks_available",
            "The number of in-service, vacant docks to which a bike can be returned",
            |sa| sa.availability.docks,
        )?;
        self.encode_gauge(
            &mut encoder,
            "tflcycles_bicycles_available",
            "The number of in-service, conventional bikes available for hire",
            |sa| sa.availability.bicycles,
        )?;
        self.encode_gauge(
            &mut encoder,
            "tflcycles_ebikes_available",
            "The number of in-service e-bikes available for hire",
            |sa| sa.availability.ebikes,
        )
    }
}

#[cfg(test)]
mod test {
    use super::{ClientMetrics, ExporterMetrics, ScrapeCollector, StationCollector};
    use crate::stations::{Availability, Station, StationAvailability};
    use prometheus_client::encoding::text::encode;
    use prometheus_client::registry::Registry;
    use std::time::Duration;

    fn station(name: &str, docks: u32, available: (u32, u32, u32)) -> StationAvailability {
        StationAvailability {
            station: Station {
                name: name.to_owned(),
                docks,
            },
            availability: Availability {
                docks: available.0,
                bicycles: available.1,
                ebikes: available.2,
            },
        }
    }

    fn samples(text: &str, family: &str) -> Vec<String> {
        text.lines()
            .filter(|l| l.starts_with(&format!("{}{{", family)) || l.starts_with(&format!("{} ", family)))
            .map(|l| l.to_owned())
            .collect()
    }

    #[test]
    fn test_scrape_collector_success() {
        let mut reg = Registry::default();
        reg.register_collector(Box::new(ScrapeCollector::new(true, Duration::from_secs(2))));

        let mut buf = String::new();
        encode(&mut buf, &reg).unwrap();

        assert!(buf.contains("# TYPE tflcycles_up gauge"));
        assert_eq!(vec!["tflcycles_up 1.0"], samples(&buf, "tflcycles_up"));
        assert_eq!(
            vec!["tflcycles_scrape_duration_seconds 2.0"],
            samples(&buf, "tflcycles_scrape_duration_seconds")
        );
    }

    #[test]
    fn test_scrape_collector_failure() {
        let mut reg = Registry::default();
        reg.register_collector(Box::new(ScrapeCollector::new(false, Duration::from_millis(1500))));

        let mut buf = String::new();
        encode(&mut buf, &reg).unwrap();

        assert_eq!(vec!["tflcycles_up 0.0"], samples(&buf, "tflcycles_up"));
        assert_eq!(
            vec!["tflcycles_scrape_duration_seconds 1.5"],
            samples(&buf, "tflcycles_scrape_duration_seconds")
        );
    }

    #[test]
    fn test_station_collector() {
        let mut reg = Registry::default();
        reg.register_collector(Box::new(StationCollector::new(vec![
            station("Foo", 5, (1, 2, 1)),
            station("Bar", 22, (1, 3, 5)),
        ])));

        let mut buf = String::new();
        encode(&mut buf, &reg).unwrap();

        assert_eq!(
            vec![r#"tflcycles_docks{station="Foo"} 5"#, r#"tflcycles_docks{station="Bar"} 22"#],
            samples(&buf, "tflcycles_docks")
        );
        assert_eq!(
            vec![
                r#"tflcycles_docks_available{station="Foo"} 1"#,
                r#"tflcycles_docks_available{station="Bar"} 1"#
            ],
            samples(&buf, "tflcycles_docks_available")
        );
        assert_eq!(
            vec![
                r#"tflcycles_bicycles_available{station="Foo"} 2"#,
                r#"tflcycles_bicycles_available{station="Bar"} 3"#
            ],
            samples(&buf, "tflcycles_bicycles_available")
        );
        assert_eq!(
            vec![
                r#"tflcycles_ebikes_available{station="Foo"} 1"#,
                r#"tflcycles_ebikes_available{station="Bar"} 5"#
            ],
            samples(&buf, "tflcycles_ebikes_available")
        );
    }

    #[test]
    fn test_station_collector_duplicate_names() {
        let mut reg = Registry::default();
        reg.register_collector(Box::new(StationCollector::new(vec![
            station("Same", 1, (0, 0, 0)),
            station("Same", 2, (0, 0, 0)),
        ])));

        let mut buf = String::new();
        encode(&mut buf, &reg).unwrap();

        assert_eq!(
            vec![r#"tflcycles_docks{station="Same"} 1"#, r#"tflcycles_docks{station="Same"} 2"#],
            samples(&buf, "tflcycles_docks")
        );
    }

    #[test]
    fn test_station_collector_escapes_names() {
        let mut reg = Registry::default();
        reg.register_collector(Box::new(StationCollector::new(vec![
            station("Foo \"Bar\"\\x", 1, (0, 0, 0)),
            station("Two\nLines", 2, (0, 0, 0)),
        ])));

        let mut buf = String::new();
        encode(&mut buf, &reg).unwrap();

        assert_eq!(
            vec![
                r#"tflcycles_docks{station="Foo \"Bar\"\\x"} 1"#,
                r#"tflcycles_docks{station="Two\nLines"} 2"#
            ],
            samples(&buf, "tflcycles_docks")
        );
    }

    #[test]
    fn test_process_metrics_registered() {
        let mut reg = Registry::default();
        let client = ClientMetrics::new(&mut reg);
        let exporter = ExporterMetrics::new(&mut reg);

        client.request_retries.inc();
        exporter.fetch_failures.inc();

        let mut buf = String::new();
        encode(&mut buf, &reg).unwrap();

        assert!(buf.contains("tflcycles_bikepoint_http_request_retries_total 1"));
        assert!(buf.contains("tflcycles_bikepoint_http_request_failures_total 0"));
        assert!(buf.contains("tflcycles_exporter_fetch_failures_total 1"));
        assert!(buf.contains("tflcycles_bikepoint_http_request_duration_seconds_count 0"));
        assert!(buf.contains(&format!(
            "tflcycles_exporter_build_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )));
    }
}
