//! Recorder configuration.
//!
//! Options arrive either programmatically or as a structured configuration
//! document parsed with [`RecorderOptions::from_json`]. Unrecognized fields
//! are ignored; malformed documents fail the factory with a parse error.
//! Durations are expressed in milliseconds in the document form.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors, surfaced synchronously at recorder construction.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no satellite endpoints configured")]
    NoEndpoints,
    #[error("satellite endpoint {host:?} has port 0")]
    InvalidPort { host: String },
    #[error("satellite endpoint with an empty host")]
    EmptyHost,
    #[error("early_flush_threshold {0} is outside (0, 1]")]
    InvalidFlushThreshold(f64),
    #[error("min_dns_resolution_refresh_period exceeds the max")]
    InvalidDnsRefreshBounds,
    #[error("max_buffered_spans must be positive")]
    NoBufferCapacity,
}

/// Address family an endpoint resolves in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Whether `ip` belongs to this family.
    pub fn matches(self, ip: &IpAddr) -> bool {
        match self {
            Self::Ipv4 => ip.is_ipv4(),
            Self::Ipv6 => ip.is_ipv6(),
        }
    }
}

/// One satellite collector endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SatelliteEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub family: AddressFamily,
}

/// Metric callback interface exposed to the host application.
///
/// Invoked from whichever thread observes the drop, on every drop event.
pub trait MetricsObserver: Send + Sync {
    fn on_spans_dropped(&self, count: u64);
}

/// Recorder options.
///
/// Defaults suit a local satellite during development; production
/// deployments override at least the access token and endpoints.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RecorderOptions {
    /// Name reported for this component in the report header.
    pub component_name: String,
    /// Access token forwarded in every report header.
    pub access_token: String,
    /// Tags attached to the report header.
    pub tags: BTreeMap<String, String>,
    /// Legacy single-collector host, used when `satellite_endpoints` is
    /// empty.
    pub collector_host: String,
    /// Legacy single-collector port.
    pub collector_port: u16,
    /// Whether the legacy collector connection is plaintext.
    pub collector_plaintext: bool,
    /// Satellite endpoints reports are distributed across.
    pub satellite_endpoints: Vec<SatelliteEndpoint>,
    /// Ring capacity, expressed in spans.
    pub max_buffered_spans: usize,
    /// Estimated serialized span size used to derive the byte capacity.
    pub span_size_hint: usize,
    /// Reporting cadence of the legacy recorder; also the default flush
    /// cadence here.
    #[serde(with = "duration_ms")]
    pub reporting_period: Duration,
    /// Budget for delivering one report before its bytes are discarded.
    #[serde(with = "duration_ms")]
    pub report_timeout: Duration,
    /// Cadence of the shutdown/early-flush poll tick.
    #[serde(with = "duration_ms")]
    pub polling_period: Duration,
    /// Cadence of the unconditional flush; defaults to `reporting_period`.
    #[serde(with = "duration_ms_opt")]
    pub flushing_period: Option<Duration>,
    /// Buffer fill fraction above which the poll tick flushes early.
    pub early_flush_threshold: f64,
    #[serde(with = "duration_ms")]
    pub min_dns_resolution_refresh_period: Duration,
    #[serde(with = "duration_ms")]
    pub max_dns_resolution_refresh_period: Duration,
    /// Retry delay after a failed resolution.
    #[serde(with = "duration_ms")]
    pub dns_failure_retry_period: Duration,
    /// Selects the streaming recorder core.
    pub use_stream_recorder: bool,
    /// Propagation option consumed by the tracer surface; accepted here so
    /// shared configuration documents parse.
    pub use_single_key_propagation: bool,
    /// Emit per-drop diagnostics at debug level.
    pub verbose: bool,
    /// Host metric callback for dropped spans.
    #[serde(skip)]
    pub metrics_observer: Option<Arc<dyn MetricsObserver>>,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            component_name: String::new(),
            access_token: String::new(),
            tags: BTreeMap::new(),
            collector_host: String::new(),
            collector_port: 0,
            collector_plaintext: true,
            satellite_endpoints: Vec::new(),
            max_buffered_spans: 2000,
            span_size_hint: 512,
            reporting_period: Duration::from_millis(500),
            report_timeout: Duration::from_secs(5),
            polling_period: Duration::from_millis(10),
            flushing_period: None,
            early_flush_threshold: 0.5,
            min_dns_resolution_refresh_period: Duration::from_secs(60),
            max_dns_resolution_refresh_period: Duration::from_secs(120),
            dns_failure_retry_period: Duration::from_secs(5),
            use_stream_recorder: true,
            use_single_key_propagation: false,
            verbose: false,
            metrics_observer: None,
        }
    }
}

impl fmt::Debug for RecorderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecorderOptions")
            .field("component_name", &self.component_name)
            .field("satellite_endpoints", &self.satellite_endpoints)
            .field("max_buffered_spans", &self.max_buffered_spans)
            .field("reporting_period", &self.reporting_period)
            .field("report_timeout", &self.report_timeout)
            .field("polling_period", &self.polling_period)
            .field("flushing_period", &self.flushing_period)
            .field("early_flush_threshold", &self.early_flush_threshold)
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

impl RecorderOptions {
    /// Parses options from a JSON configuration document.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(document)?)
    }

    /// The endpoints reports are sent to: the configured satellite list, or
    /// the legacy collector host/port when the list is empty.
    pub fn resolved_endpoints(&self) -> Vec<SatelliteEndpoint> {
        if !self.satellite_endpoints.is_empty() {
            return self.satellite_endpoints.clone();
        }
        if self.collector_host.is_empty() {
            return Vec::new();
        }
        vec![SatelliteEndpoint {
            host: self.collector_host.clone(),
            port: self.collector_port,
            family: AddressFamily::Ipv4,
        }]
    }

    /// Effective flush cadence.
    pub fn flushing_period(&self) -> Duration {
        self.flushing_period.unwrap_or(self.reporting_period)
    }

    /// Ring capacity in bytes.
    pub fn buffer_capacity(&self) -> usize {
        self.max_buffered_spans.saturating_mul(self.span_size_hint)
    }

    /// Validates the options; called by the recorder factory.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoints = self.resolved_endpoints();
        if endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        for endpoint in &endpoints {
            if endpoint.host.is_empty() {
                return Err(ConfigError::EmptyHost);
            }
            if endpoint.port == 0 {
                return Err(ConfigError::InvalidPort {
                    host: endpoint.host.clone(),
                });
            }
        }
        if !(self.early_flush_threshold > 0.0 && self.early_flush_threshold <= 1.0) {
            return Err(ConfigError::InvalidFlushThreshold(
                self.early_flush_threshold,
            ));
        }
        if self.min_dns_resolution_refresh_period > self.max_dns_resolution_refresh_period {
            return Err(ConfigError::InvalidDnsRefreshBounds);
        }
        if self.max_buffered_spans == 0 || self.span_size_hint == 0 {
            return Err(ConfigError::NoBufferCapacity);
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod duration_ms_opt {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_configuration_document() {
        let options = RecorderOptions::from_json(
            r#"{
                "component_name": "checkout",
                "access_token": "t0ken",
                "satellite_endpoints": [
                    {"host": "collector-a.internal", "port": 8360},
                    {"host": "collector-b.internal", "port": 8360, "family": "ipv6"}
                ],
                "max_buffered_spans": 5000,
                "reporting_period": 250,
                "flushing_period": 100,
                "early_flush_threshold": 0.8,
                "verbose": true,
                "some_future_option": {"ignored": true}
            }"#,
        )
        .unwrap();

        assert_eq!(options.component_name, "checkout");
        assert_eq!(options.satellite_endpoints.len(), 2);
        assert_eq!(options.satellite_endpoints[1].family, AddressFamily::Ipv6);
        assert_eq!(options.reporting_period, Duration::from_millis(250));
        assert_eq!(options.flushing_period(), Duration::from_millis(100));
        assert!(options.verbose);
        options.validate().unwrap();
    }

    #[test]
    fn malformed_documents_fail_to_parse() {
        assert!(matches!(
            RecorderOptions::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn flushing_period_defaults_to_reporting_period() {
        let options = RecorderOptions::default();
        assert_eq!(options.flushing_period(), options.reporting_period);
    }

    #[test]
    fn legacy_collector_host_backfills_endpoints() {
        let options = RecorderOptions {
            collector_host: "collector.internal".into(),
            collector_port: 8360,
            ..RecorderOptions::default()
        };
        let endpoints = options.resolved_endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].host, "collector.internal");
        options.validate().unwrap();
    }

    #[test]
    fn zero_endpoints_fail_validation() {
        assert!(matches!(
            RecorderOptions::default().validate(),
            Err(ConfigError::NoEndpoints)
        ));
    }

    #[test]
    fn invalid_options_are_rejected() {
        let base = RecorderOptions {
            satellite_endpoints: vec![SatelliteEndpoint {
                host: "collector.internal".into(),
                port: 8360,
                family: AddressFamily::Ipv4,
            }],
            ..RecorderOptions::default()
        };

        let mut options = base.clone();
        options.satellite_endpoints[0].port = 0;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidPort { .. })
        ));

        let mut options = base.clone();
        options.early_flush_threshold = 1.5;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidFlushThreshold(_))
        ));

        let mut options = base.clone();
        options.min_dns_resolution_refresh_period = Duration::from_secs(300);
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidDnsRefreshBounds)
        ));

        let mut options = base;
        options.max_buffered_spans = 0;
        assert!(matches!(
            options.validate(),
            Err(ConfigError::NoBufferCapacity)
        ));
    }
}
