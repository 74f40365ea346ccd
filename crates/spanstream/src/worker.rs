//! The recorder's I/O thread.
//!
//! Owns all network state: the event loop, the satellite connection pool,
//! the resolution managers and the consumer side of the span buffer.
//! Producers never appear here; they only write into the shared buffer.

use crate::config::{RecorderOptions, SatelliteEndpoint};
use crate::dns::{DnsReply, DnsReplySink, DnsResolver, ResolutionManager};
use crate::event_loop::{EventHandler, EventLoop, SocketReadiness, WAKER_TOKEN};
use crate::recorder::Shared;
use crate::report::ReportRequest;
use crate::satellite::{ConnectionPool, DroppedReport, SentReport};
use crate::wire;
use spanring::{BlockAllocator, CHAIN_NODE_BLOCK_SIZE};
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Chain nodes live at most one report at a time; a handful of blocks
/// covers assembly overlap with plenty of slack.
const CHAIN_BLOCKS: usize = 16;

/// Timer dispatch tags.
#[derive(Debug, Clone, Copy)]
pub(crate) enum TimerTag {
    /// Shutdown check + early flush (short cadence).
    Poll,
    /// Unconditional flush (longer cadence). The epoch invalidates flush
    /// timers that an early flush has already superseded.
    Flush(u64),
    /// Re-resolve the given endpoint.
    DnsRefresh(usize),
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    options: RecorderOptions,
    pool: ConnectionPool,
    managers: Vec<ResolutionManager>,
    resolver: Box<dyn DnsResolver>,
    sink: DnsReplySink,
    replies: Receiver<DnsReply>,
    /// Encoded header frame shared by every report.
    header: Arc<Vec<u8>>,
    allocator: Arc<BlockAllocator>,
    early_flush_marker: usize,
    /// Epoch of the currently armed flush timer.
    flush_epoch: u64,
}

impl Worker {
    pub fn new(
        shared: Arc<Shared>,
        options: RecorderOptions,
        endpoints: Vec<SatelliteEndpoint>,
        resolver: Box<dyn DnsResolver>,
        sink: DnsReplySink,
        replies: Receiver<DnsReply>,
        header: Arc<Vec<u8>>,
    ) -> Self {
        let managers = endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                ResolutionManager::new(index, endpoint.host.clone(), endpoint.family)
            })
            .collect();
        let early_flush_marker =
            (shared.buffer.capacity() as f64 * options.early_flush_threshold) as usize;
        Self {
            shared,
            pool: ConnectionPool::new(endpoints),
            managers,
            resolver,
            sink,
            replies,
            header,
            allocator: Arc::new(BlockAllocator::new(CHAIN_NODE_BLOCK_SIZE, CHAIN_BLOCKS)),
            early_flush_marker,
            flush_epoch: 0,
            options,
        }
    }

    /// Runs the event loop until shutdown, then performs the bounded final
    /// flush and tears the network state down.
    pub fn run(mut self, mut event_loop: EventLoop<TimerTag>) {
        for index in 0..self.managers.len() {
            let query = self.managers[index].query();
            self.resolver.resolve(query, &self.sink);
        }
        event_loop.on_timeout(self.options.polling_period, TimerTag::Poll);
        self.arm_flush_timer(&mut event_loop);

        if let Err(err) = event_loop.run(&mut self) {
            error!(%err, "recorder event loop failed");
        }

        self.final_flush(&mut event_loop);
        self.pool.close_all(&event_loop);
    }

    fn shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Poll tick: break the loop on shutdown, expire the in-flight report,
    /// flush early under threshold pressure.
    fn poll(&mut self, event_loop: &mut EventLoop<TimerTag>) {
        if self.shutting_down() {
            event_loop.loop_break();
            return;
        }
        if let Some(dropped) = self.pool.poll_deadline(event_loop, Instant::now()) {
            self.discard_report(dropped);
        }
        if self.shared.buffer.size() > self.early_flush_marker {
            self.flush(event_loop);
            // The forced flush stands in for the next periodic one.
            self.arm_flush_timer(event_loop);
        }
    }

    /// Arms the next periodic flush, superseding any pending flush timer.
    fn arm_flush_timer(&mut self, event_loop: &mut EventLoop<TimerTag>) {
        self.flush_epoch += 1;
        event_loop.on_timeout(
            self.options.flushing_period(),
            TimerTag::Flush(self.flush_epoch),
        );
    }

    /// Flush procedure: allot, wrap into a report, hand to the pool, and
    /// keep going while reports complete synchronously and the buffer
    /// refills behind them.
    fn flush(&mut self, event_loop: &mut EventLoop<TimerTag>) {
        loop {
            if self.pool.has_inflight() {
                match self.pool.dispatch(event_loop, &self.managers) {
                    Some(sent) => {
                        self.complete_report(sent);
                        continue;
                    }
                    None => return,
                }
            }
            if self.shared.buffer.allot() == 0 {
                return;
            }
            let report = self.build_report();
            debug!(
                bytes = report.num_bytes(),
                spans = report.num_spans(),
                "report assembled"
            );
            self.pool
                .submit(report, Instant::now() + self.options.report_timeout);
        }
    }

    fn build_report(&mut self) -> ReportRequest {
        let dropped = self.shared.dropped_pending.swap(0, Ordering::AcqRel);
        let metrics = match wire::encode_metrics_frame(dropped) {
            Ok(frame) => frame,
            Err(err) => {
                error!(%err, "failed to encode the metrics frame");
                Vec::new()
            }
        };
        let mut report = ReportRequest::new(
            Arc::clone(&self.header),
            metrics,
            dropped,
            Arc::clone(&self.allocator),
        );
        let (first, second) = self.shared.buffer.allotment();
        let num_spans = wire::count_span_frames(first, second);
        // SAFETY: the allotment is consumed only in `complete_report` or
        // `discard_report`, after this report is gone.
        let attached = unsafe { report.add_span_region((first, second), num_spans) };
        if let Err(err) = attached {
            // The allocator outlives any realistic report count; running
            // out means chain nodes leaked.
            panic!("report fragment allocation failed: {err}");
        }
        report
    }

    fn complete_report(&mut self, sent: SentReport) {
        self.shared.buffer.consume(sent.span_bytes);
        debug!(
            spans = sent.num_spans,
            bytes = sent.span_bytes,
            "report delivered"
        );
    }

    fn discard_report(&mut self, dropped: DroppedReport) {
        self.shared.buffer.consume(dropped.span_bytes);
        // The undelivered metrics count rides along with the next report.
        self.shared
            .dropped_pending
            .fetch_add(dropped.dropped_count, Ordering::Relaxed);
        self.shared.drop_spans(dropped.num_spans as u64, None);
    }

    fn drain_dns(&mut self, event_loop: &mut EventLoop<TimerTag>) {
        while let Ok(reply) = self.replies.try_recv() {
            let endpoint = reply.endpoint;
            if endpoint >= self.managers.len() {
                continue;
            }
            let delay = self.managers[endpoint].on_reply(
                reply.result,
                &self.options,
                &mut rand::thread_rng(),
            );
            event_loop.on_timeout(delay, TimerTag::DnsRefresh(endpoint));
        }
    }

    /// Best-effort delivery of whatever is buffered, bounded by
    /// `report_timeout`; everything still undelivered afterwards is
    /// discarded and counted.
    fn final_flush(&mut self, event_loop: &mut EventLoop<TimerTag>) {
        let deadline = Instant::now() + self.options.report_timeout;
        loop {
            self.flush(event_loop);
            if let Some(dropped) = self.pool.poll_deadline(event_loop, Instant::now()) {
                self.discard_report(dropped);
            }
            if !self.pool.has_inflight() && self.shared.buffer.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(self.options.polling_period);
            if let Err(err) = event_loop.turn(Some(wait), self) {
                error!(%err, "event loop failed during the final flush");
                break;
            }
        }

        if let Some(dropped) = self.pool.abandon_inflight(event_loop) {
            self.discard_report(dropped);
        }
        let remaining = self.shared.buffer.allot();
        if remaining > 0 {
            let (first, second) = self.shared.buffer.allotment();
            let spans = wire::count_span_frames(first, second);
            self.shared.buffer.consume(remaining);
            self.shared.drop_spans(spans as u64, None);
            debug!(spans, "discarding undelivered spans at shutdown");
        }
    }
}

impl EventHandler<TimerTag> for Worker {
    fn on_timer(&mut self, event_loop: &mut EventLoop<TimerTag>, tag: TimerTag) {
        match tag {
            TimerTag::Poll => {
                self.poll(event_loop);
                if !self.shutting_down() {
                    event_loop.on_timeout(self.options.polling_period, TimerTag::Poll);
                }
            }
            TimerTag::Flush(epoch) => {
                if epoch == self.flush_epoch && !self.shutting_down() {
                    self.flush(event_loop);
                    self.arm_flush_timer(event_loop);
                }
            }
            TimerTag::DnsRefresh(endpoint) => {
                if endpoint < self.managers.len() {
                    let query = self.managers[endpoint].query();
                    self.resolver.resolve(query, &self.sink);
                }
            }
        }
    }

    fn on_socket(&mut self, event_loop: &mut EventLoop<TimerTag>, readiness: SocketReadiness) {
        if readiness.token == WAKER_TOKEN {
            self.drain_dns(event_loop);
            if self.shutting_down() {
                event_loop.loop_break();
                return;
            }
            // Fresh addresses may unblock a deferred report.
            self.flush(event_loop);
            return;
        }

        if let Some(sent) = self.pool.on_socket(event_loop, readiness, &self.managers) {
            self.complete_report(sent);
        }
        if !self.shutting_down() {
            // Re-flush immediately while the buffer is non-empty and no
            // write is in flight.
            self.flush(event_loop);
        }
    }
}
