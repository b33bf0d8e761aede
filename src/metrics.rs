//! Prometheus series published by the exporter.
//!
//! The registry is owned by [`ExporterMetrics`] rather than living in a global,
//! so the run loop and the HTTP layer each hold a clone of the same handles.
//! All series are internally synchronised by the `prometheus` crate.
use prometheus::proto::MetricType;
use prometheus::{Counter, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::time::Duration;
use thiserror::Error;

use crate::speedtest::{Server, TestResults};

pub const NAMESPACE: &str = "speedtest_exporter";

/// Label names on every per-server series, in `with_label_values` order.
pub const SERVER_LABELS: [&str; 3] = ["server_id", "server_name", "location"];

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metrics output was not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Clone)]
pub struct ExporterMetrics {
    registry: Registry,

    runs: Counter,
    running: Gauge,
    run_time: Gauge,
    last_start_time: Gauge,
    last_finish_time: Gauge,
    wait_time: Gauge,

    download_speed: GaugeVec,
    download_bytes: GaugeVec,
    download_elapsed: GaugeVec,
    upload_speed: GaugeVec,
    upload_bytes: GaugeVec,
    upload_elapsed: GaugeVec,
    ping: GaugeVec,
    jitter: GaugeVec,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

fn server_gauge(registry: &Registry, name: &str, help: &str) -> Result<GaugeVec, MetricsError> {
    let gauge = GaugeVec::new(opts(name, help), &SERVER_LABELS)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge, MetricsError> {
    let gauge = Gauge::with_opts(opts(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl ExporterMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let runs = Counter::with_opts(opts("runs", "Number of times the speed tests have run"))?;
        registry.register(Box::new(runs.clone()))?;

        Ok(Self {
            runs,
            running: gauge(
                &registry,
                "running",
                "Indicates if the speed test is currently running",
            )?,
            run_time: gauge(
                &registry,
                "run_time_seconds",
                "Amount of time spent running all of the speed tests",
            )?,
            last_start_time: gauge(
                &registry,
                "last_start_time",
                "Last time the speed test run started",
            )?,
            last_finish_time: gauge(
                &registry,
                "last_finish_time",
                "Last time the speed test run finished",
            )?,
            wait_time: gauge(
                &registry,
                "wait_time_seconds",
                "Amount of downtime between speed test runs. This does not include time between server test executions",
            )?,
            download_speed: server_gauge(&registry, "download_bytes_per_second", "Download speed")?,
            download_bytes: server_gauge(
                &registry,
                "download_bytes",
                "Number of bytes downloaded as a part of the test",
            )?,
            download_elapsed: server_gauge(
                &registry,
                "download_elapsed_seconds",
                "How long the download speed test took in seconds",
            )?,
            upload_speed: server_gauge(&registry, "upload_bytes_per_second", "Upload speed")?,
            upload_bytes: server_gauge(
                &registry,
                "upload_bytes",
                "Number of bytes uploaded as a part of the test",
            )?,
            upload_elapsed: server_gauge(
                &registry,
                "upload_elapsed_seconds",
                "How long the upload speed test took in seconds",
            )?,
            ping: server_gauge(&registry, "ping_seconds", "Ping time for the speed test")?,
            jitter: server_gauge(
                &registry,
                "ping_jitter_seconds",
                "Ping jitter for the speed test",
            )?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders every series in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn cycle_started(&self, unix_secs: i64) {
        self.running.set(1.0);
        self.last_start_time.set(unix_secs as f64);
    }

    pub fn cycle_finished(&self, unix_secs: i64) {
        self.last_finish_time.set(unix_secs as f64);
        self.running.set(0.0);
    }

    pub fn inc_runs(&self) {
        self.runs.inc();
    }

    pub fn set_run_time(&self, elapsed: Duration) {
        self.run_time.set(elapsed.as_secs_f64());
    }

    pub fn set_wait_time(&self, waited: Duration) {
        self.wait_time.set(waited.as_secs_f64());
    }

    /// Overwrites the per-server gauges with one result. Servers that are not
    /// recorded in a cycle keep whatever they last reported.
    pub fn record_result(&self, result: &TestResults) {
        let server_id = result.server.id.to_string();
        let labels = [
            server_id.as_str(),
            result.server.name.as_str(),
            result.server.location.as_str(),
        ];

        self.download_speed
            .with_label_values(&labels)
            .set(result.download.bandwidth);
        self.download_bytes
            .with_label_values(&labels)
            .set(result.download.bytes);
        self.download_elapsed
            .with_label_values(&labels)
            .set(result.download.elapsed);

        self.upload_speed
            .with_label_values(&labels)
            .set(result.upload.bandwidth);
        self.upload_bytes
            .with_label_values(&labels)
            .set(result.upload.bytes);
        self.upload_elapsed
            .with_label_values(&labels)
            .set(result.upload.elapsed);

        // speedtest reports milliseconds
        self.ping
            .with_label_values(&labels)
            .set(result.ping.latency / 1000.0);
        self.jitter
            .with_label_values(&labels)
            .set(result.ping.jitter / 1000.0);
    }

    /// Current value of a gauge or counter, looked up by its name without the
    /// namespace prefix. `labels` must name every label of the series and be
    /// empty for the unlabelled ones.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let full_name = format!("{NAMESPACE}_{name}");
        let family = self
            .registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == full_name)?;
        let metric_type = family.get_field_type();

        family
            .get_metric()
            .iter()
            .find(|metric| {
                let pairs = metric.get_label();
                pairs.len() == labels.len()
                    && labels.iter().all(|(key, value)| {
                        pairs
                            .iter()
                            .any(|pair| pair.get_name() == *key && pair.get_value() == *value)
                    })
            })
            .map(|metric| match metric_type {
                MetricType::COUNTER => metric.get_counter().get_value(),
                _ => metric.get_gauge().get_value(),
            })
    }

    /// Current value of a per-server series for `server`.
    pub fn server_value(&self, name: &str, server: &Server) -> Option<f64> {
        let server_id = server.id.to_string();
        self.value(
            name,
            &[
                ("server_id", server_id.as_str()),
                ("server_name", server.name.as_str()),
                ("location", server.location.as_str()),
            ],
        )
    }
}
