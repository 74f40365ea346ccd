//! spanstream: streaming span recorder.
//!
//! The in-process engine of a distributed-tracing client: application
//! threads submit finished spans, a single owned I/O thread batches them
//! into reports and streams them to a fleet of satellite collectors over
//! persistent connections with DNS-driven endpoint discovery.
//!
//! Built on the lock-free core in the `spanring` crate: spans serialize
//! straight into a bounded MPSC byte ring, reports reference the ring
//! without copying, and backpressure drops (and counts) spans rather than
//! blocking the application.
//!
//! # Example
//!
//! ```no_run
//! use spanstream::{RecorderOptions, SatelliteEndpoint, SpanRecord, StreamRecorder};
//!
//! let options = RecorderOptions {
//!     component_name: "checkout".into(),
//!     access_token: "t0ken".into(),
//!     satellite_endpoints: vec![SatelliteEndpoint {
//!         host: "collector.internal".into(),
//!         port: 8360,
//!         family: Default::default(),
//!     }],
//!     ..RecorderOptions::default()
//! };
//! let recorder = StreamRecorder::new(options).unwrap();
//!
//! recorder.record_span(&SpanRecord::new(1, 1, "checkout.submit"));
//! recorder.close();
//! ```

pub mod config;
pub mod dns;
pub mod dummy_satellite;
pub mod span;
pub mod wire;

mod event_loop;
mod recorder;
mod report;
mod satellite;
mod worker;

pub use config::{
    AddressFamily, ConfigError, MetricsObserver, RecorderOptions, SatelliteEndpoint,
};
pub use dns::{DnsQuery, DnsReply, DnsReplySink, DnsResolver, SystemResolver};
pub use dummy_satellite::DummySatellite;
pub use recorder::{RecorderError, StreamRecorder};
pub use span::{LogRecord, ReferenceKind, SpanRecord, SpanReference, TagValue};
