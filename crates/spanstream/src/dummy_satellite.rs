//! In-process satellite for tests and the upload benchmark.
//!
//! Accepts streaming connections, decodes report frames and records what
//! arrived. Trailing partial frames at EOF are discarded, matching what a
//! real collector sees when a client fails over mid-report.

use crate::wire::{Frame, FrameDecoder, ReportHeader};
use crate::span::SpanRecord;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Default)]
struct SatelliteState {
    spans: Mutex<Vec<SpanRecord>>,
    headers: Mutex<Vec<ReportHeader>>,
    reported_dropped: AtomicU64,
    connections: AtomicUsize,
}

/// A loopback satellite collector.
pub struct DummySatellite {
    addr: SocketAddr,
    state: Arc<SatelliteState>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl DummySatellite {
    /// Binds to an ephemeral loopback port and starts accepting.
    pub fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let state = Arc::new(SatelliteState::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_thread = {
            let state = Arc::clone(&state);
            let shutdown = Arc::clone(&shutdown);
            std::thread::Builder::new()
                .name("dummy-satellite".into())
                .spawn(move || accept_loop(&listener, &state, &shutdown))?
        };

        Ok(Self {
            addr,
            state,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every span received so far, in arrival order.
    pub fn spans(&self) -> Vec<SpanRecord> {
        self.state.spans.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Ids of every received span, in arrival order.
    pub fn span_ids(&self) -> Vec<u64> {
        self.state
            .spans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|span| span.span_id)
            .collect()
    }

    pub fn num_spans_received(&self) -> usize {
        self.state.spans.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Report headers received so far.
    pub fn headers(&self) -> Vec<ReportHeader> {
        self.state.headers.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Sum of the dropped-span counts clients reported in metrics frames.
    pub fn reported_dropped(&self) -> u64 {
        self.state.reported_dropped.load(Ordering::Relaxed)
    }

    /// Connections accepted over the satellite's lifetime.
    pub fn num_connections(&self) -> usize {
        self.state.connections.load(Ordering::Relaxed)
    }

    /// Stops accepting and joins the I/O threads.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DummySatellite {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop(listener: &TcpListener, state: &Arc<SatelliteState>, shutdown: &Arc<AtomicBool>) {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "satellite accepted a connection");
                state.connections.fetch_add(1, Ordering::Relaxed);
                let state = Arc::clone(state);
                let shutdown = Arc::clone(shutdown);
                let handle = std::thread::Builder::new()
                    .name("dummy-satellite-conn".into())
                    .spawn(move || serve_connection(stream, &state, &shutdown));
                match handle {
                    Ok(handle) => connections.push(handle),
                    Err(err) => warn!(%err, "failed to spawn a satellite connection thread"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(err) => {
                warn!(%err, "satellite accept failed");
                break;
            }
        }
    }
    for handle in connections {
        let _ = handle.join();
    }
}

fn serve_connection(stream: TcpStream, state: &SatelliteState, shutdown: &AtomicBool) {
    let mut stream = stream;
    if stream
        .set_read_timeout(Some(Duration::from_millis(25)))
        .is_err()
    {
        return;
    }

    let mut decoder = FrameDecoder::new();
    let mut scratch = [0u8; 8192];
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        match stream.read(&mut scratch) {
            Ok(0) => break,
            Ok(n) => {
                decoder.feed(&scratch[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(Frame::Header(header))) => {
                            state
                                .headers
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .push(header);
                        }
                        Ok(Some(Frame::Metrics(metrics))) => {
                            state
                                .reported_dropped
                                .fetch_add(metrics.dropped_spans, Ordering::Relaxed);
                        }
                        Ok(Some(Frame::Span(span))) => {
                            state
                                .spans
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .push(span);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(%err, "satellite stream corrupted, closing");
                            return;
                        }
                    }
                }
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(%err, "satellite connection read failed");
                break;
            }
        }
    }

    if decoder.has_partial_frame() {
        debug!("discarding a partial frame at EOF");
    }
}
