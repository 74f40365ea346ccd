//! The stream recorder: span ingestion front-end plus the owned I/O
//! thread that ships buffered spans to satellites.

use crate::config::{ConfigError, MetricsObserver, RecorderOptions};
use crate::dns::{DnsReplySink, DnsResolver, SystemResolver};
use crate::event_loop::EventLoop;
use crate::span::SpanRecord;
use crate::wire::{self, ReportHeader, WireError};
use crate::worker::{TimerTag, Worker};
use mio::Waker;
use spanring::SpanBuffer;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, warn};

/// Recorder construction errors.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("invalid recorder configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to encode the report header: {0}")]
    Wire(#[from] WireError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// State shared between application threads and the I/O thread.
///
/// Everything else the recorder owns lives on the I/O thread and needs no
/// locking.
pub(crate) struct Shared {
    pub buffer: SpanBuffer,
    /// Monotonic total of dropped spans.
    pub dropped_total: AtomicU64,
    /// Drops not yet carried by a report's metrics frame.
    pub dropped_pending: AtomicU64,
    pub shutdown: AtomicBool,
    pub observer: Option<Arc<dyn MetricsObserver>>,
    pub verbose: bool,
}

impl Shared {
    /// Counts `count` dropped spans and notifies the host observer.
    /// Callable from any thread.
    pub fn drop_spans(&self, count: u64, span_id: Option<u64>) {
        if count == 0 {
            return;
        }
        self.dropped_total.fetch_add(count, Ordering::Relaxed);
        self.dropped_pending.fetch_add(count, Ordering::Relaxed);
        if let Some(observer) = &self.observer {
            observer.on_spans_dropped(count);
        }
        if self.verbose {
            match span_id {
                Some(id) => debug!(span_id = id, "dropping span"),
                None => debug!(count, "dropping spans"),
            }
        }
    }
}

/// Streaming span recorder.
///
/// Application threads submit finished spans with
/// [`record_span`](Self::record_span); a single owned I/O thread batches
/// them into reports and streams them to the configured satellites.
/// Submission never blocks: under backpressure spans are dropped and
/// counted, not queued unboundedly.
pub struct StreamRecorder {
    shared: Arc<Shared>,
    waker: Arc<Waker>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamRecorder {
    /// Creates a recorder using the system DNS resolver.
    pub fn new(options: RecorderOptions) -> Result<Self, RecorderError> {
        Self::with_resolver(options, Box::new(SystemResolver::new()))
    }

    /// Creates a recorder with a caller-supplied resolver.
    pub fn with_resolver(
        options: RecorderOptions,
        resolver: Box<dyn DnsResolver>,
    ) -> Result<Self, RecorderError> {
        options.validate()?;
        let endpoints = options.resolved_endpoints();

        let shared = Arc::new(Shared {
            buffer: SpanBuffer::with_capacity(options.buffer_capacity()),
            dropped_total: AtomicU64::new(0),
            dropped_pending: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            observer: options.metrics_observer.clone(),
            verbose: options.verbose,
        });

        let header = ReportHeader {
            reporter_id: rand::random(),
            access_token: options.access_token.clone(),
            component_name: options.component_name.clone(),
            tags: options.tags.clone(),
        };
        let header = Arc::new(wire::encode_header_frame(&header)?);

        let event_loop = EventLoop::<TimerTag>::new()?;
        let waker = Arc::new(event_loop.waker()?);
        let (reply_tx, reply_rx) = mpsc::channel();
        let sink = DnsReplySink::new(reply_tx, Arc::clone(&waker));

        let worker = Worker::new(
            Arc::clone(&shared),
            options,
            endpoints,
            resolver,
            sink,
            reply_rx,
            header,
        );
        let handle = std::thread::Builder::new()
            .name("spanstream-io".into())
            .spawn(move || worker.run(event_loop))?;

        Ok(Self {
            shared,
            waker,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Submits a finished span.
    ///
    /// Two-pass serialization: size the record, reserve exactly that many
    /// ring bytes, serialize straight into them. Never blocks and never
    /// fails from the caller's perspective; a span that cannot be buffered
    /// is counted via [`num_spans_dropped`](Self::num_spans_dropped) and
    /// the metrics observer.
    pub fn record_span(&self, span: &SpanRecord) {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            self.shared.drop_spans(1, Some(span.span_id));
            return;
        }
        match wire::span_frame_len(span) {
            Ok(frame_len) => {
                let added = self
                    .shared
                    .buffer
                    .add(frame_len, |writer| wire::write_span_frame(writer, span, frame_len));
                if !added {
                    self.shared.drop_spans(1, Some(span.span_id));
                }
            }
            Err(err) => {
                debug!(span_id = span.span_id, %err, "failed to size a span record");
                self.shared.drop_spans(1, Some(span.span_id));
            }
        }
    }

    /// Total spans dropped so far.
    pub fn num_spans_dropped(&self) -> u64 {
        self.shared.dropped_total.load(Ordering::Relaxed)
    }

    /// Published bytes currently waiting in the buffer.
    pub fn buffered_bytes(&self) -> usize {
        self.shared.buffer.size()
    }

    /// Initiates shutdown and blocks until the I/O thread joins.
    ///
    /// A bounded final flush runs inside the shutdown window; spans that
    /// remain undelivered afterwards are discarded and counted. Idempotent;
    /// also runs on drop. Callable while other threads still submit;
    /// their spans become harmless drops.
    pub fn close(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };
        self.shared.shutdown.store(true, Ordering::Release);
        if let Err(err) = self.waker.wake() {
            warn!(%err, "failed to wake the I/O thread for shutdown");
        }
        if handle.join().is_err() {
            warn!("recorder I/O thread panicked");
        }
    }
}

impl Drop for StreamRecorder {
    fn drop(&mut self) {
        self.close();
    }
}
