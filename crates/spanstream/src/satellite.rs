//! Satellite connection pool.
//!
//! One persistent streaming connection per configured endpoint. Reports go
//! to endpoints round-robin; within an endpoint, connection attempts cycle
//! round-robin through the addresses its resolution manager currently
//! holds. A report survives connection failures by restarting from byte
//! zero on the next host until its delivery deadline passes.

use crate::dns::ResolutionManager;
use crate::event_loop::{EventLoop, SocketReadiness};
use crate::report::{FragmentCursor, ReportRequest};
use crate::config::SatelliteEndpoint;
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::debug;

/// Connection tokens start here; [`crate::event_loop::WAKER_TOKEN`] is 0.
pub(crate) const CONNECTION_TOKEN_BASE: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    /// No socket.
    Idle,
    /// Non-blocking connect in progress, waiting for writability.
    Connecting,
    /// Connected, no partially-written report.
    Ready,
    /// Mid-report, waiting for the socket to accept more bytes.
    Writing,
}

struct SatelliteConnection {
    endpoint: usize,
    token: Token,
    stream: Option<TcpStream>,
    addr: Option<SocketAddr>,
    state: ConnectionState,
}

impl SatelliteConnection {
    fn new(endpoint: usize) -> Self {
        Self {
            endpoint,
            token: Token(CONNECTION_TOKEN_BASE + endpoint),
            stream: None,
            addr: None,
            state: ConnectionState::Idle,
        }
    }

    fn connect<T: Copy>(&mut self, event_loop: &EventLoop<T>, addr: SocketAddr) -> io::Result<()> {
        debug_assert!(self.stream.is_none());
        let mut stream = TcpStream::connect(addr)?;
        event_loop.register(
            &mut stream,
            self.token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.stream = Some(stream);
        self.addr = Some(addr);
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    fn close<T: Copy>(&mut self, event_loop: &EventLoop<T>) {
        if let Some(mut stream) = self.stream.take() {
            let _ = event_loop.deregister(&mut stream);
        }
        self.addr = None;
        self.state = ConnectionState::Idle;
    }

    /// Resolves a pending non-blocking connect.
    ///
    /// `Ok(true)` once the socket is usable, `Ok(false)` while the connect
    /// is still in flight.
    fn check_connected(&self) -> io::Result<bool> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Drains and discards whatever the satellite sent. Returns `false` on
    /// EOF or a read error.
    fn drain_reads(&mut self) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        let mut scratch = [0u8; 4096];
        loop {
            match stream.read(&mut scratch) {
                Ok(0) => return false,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(endpoint = self.endpoint, %err, "satellite read failed");
                    return false;
                }
            }
        }
    }
}

/// A successfully delivered report.
pub(crate) struct SentReport {
    pub span_bytes: usize,
    pub num_spans: usize,
}

/// A report abandoned after its delivery deadline.
pub(crate) struct DroppedReport {
    pub span_bytes: usize,
    pub num_spans: usize,
    /// Metrics count the report carried; goes back to the pending counter.
    pub dropped_count: u64,
}

struct InflightReport {
    report: ReportRequest,
    cursor: FragmentCursor,
    /// Endpoint whose connection carries this report, once assigned.
    connection: Option<usize>,
    deadline: Instant,
}

enum PumpOutcome {
    Sent(SentReport),
    Blocked,
    Broken,
}

fn pump_connection(inflight: &mut InflightReport, conn: &mut SatelliteConnection) -> PumpOutcome {
    let Some(stream) = conn.stream.as_mut() else {
        return PumpOutcome::Broken;
    };
    loop {
        let InflightReport { report, cursor, .. } = &mut *inflight;
        let Some(chunk) = cursor.current(report) else {
            return PumpOutcome::Sent(SentReport {
                span_bytes: report.span_bytes(),
                num_spans: report.num_spans(),
            });
        };
        match stream.write(chunk) {
            Ok(0) => return PumpOutcome::Broken,
            Ok(n) => cursor.advance(report, n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return PumpOutcome::Blocked,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(endpoint = conn.endpoint, %err, "satellite write failed");
                return PumpOutcome::Broken;
            }
        }
    }
}

/// Pool of per-endpoint satellite connections plus the single in-flight
/// report.
pub(crate) struct ConnectionPool {
    endpoints: Vec<SatelliteEndpoint>,
    connections: Vec<SatelliteConnection>,
    endpoint_cursor: usize,
    ip_cursors: Vec<usize>,
    inflight: Option<InflightReport>,
}

impl ConnectionPool {
    pub fn new(endpoints: Vec<SatelliteEndpoint>) -> Self {
        let connections = (0..endpoints.len()).map(SatelliteConnection::new).collect();
        let ip_cursors = vec![0; endpoints.len()];
        Self {
            endpoints,
            connections,
            endpoint_cursor: 0,
            ip_cursors,
            inflight: None,
        }
    }

    pub fn has_inflight(&self) -> bool {
        self.inflight.is_some()
    }

    fn assigned(&self) -> Option<usize> {
        self.inflight.as_ref().and_then(|inflight| inflight.connection)
    }

    fn unassign(&mut self) {
        if let Some(inflight) = &mut self.inflight {
            inflight.connection = None;
            inflight.cursor.reset();
        }
    }

    /// Hands a freshly assembled report to the pool.
    pub fn submit(&mut self, report: ReportRequest, deadline: Instant) {
        debug_assert!(self.inflight.is_none(), "one report in flight at a time");
        self.inflight = Some(InflightReport {
            report,
            cursor: FragmentCursor::new(),
            connection: None,
            deadline,
        });
    }

    /// Abandons the in-flight report once its delivery budget is spent.
    pub fn poll_deadline<T: Copy>(
        &mut self,
        event_loop: &EventLoop<T>,
        now: Instant,
    ) -> Option<DroppedReport> {
        match self.inflight.take() {
            Some(inflight) if now >= inflight.deadline => {
                // The carrying connection is mid-report; its stream state
                // is unusable for the next one.
                if let Some(ep) = inflight.connection {
                    self.connections[ep].close(event_loop);
                }
                debug!(
                    spans = inflight.report.num_spans(),
                    "report timed out, discarding its spans"
                );
                Some(DroppedReport {
                    span_bytes: inflight.report.span_bytes(),
                    num_spans: inflight.report.num_spans(),
                    dropped_count: inflight.report.dropped_count(),
                })
            }
            other => {
                self.inflight = other;
                None
            }
        }
    }

    /// Pushes the in-flight report as far as the kernel allows right now.
    ///
    /// Returns the delivery record when the report fully drained. `None`
    /// means the report is deferred (no addresses anywhere), waiting on a
    /// connect, or blocked on socket writability.
    pub fn dispatch<T: Copy>(
        &mut self,
        event_loop: &EventLoop<T>,
        managers: &[ResolutionManager],
    ) -> Option<SentReport> {
        loop {
            self.inflight.as_ref()?;
            match self.assigned() {
                Some(ep) => match self.connections[ep].state {
                    ConnectionState::Ready => match self.pump(event_loop, ep) {
                        PumpOutcome::Sent(sent) => return Some(sent),
                        PumpOutcome::Blocked => return None,
                        // `pump` already closed the connection and
                        // unassigned the report; try the next host.
                        PumpOutcome::Broken => {}
                    },
                    ConnectionState::Connecting | ConnectionState::Writing => return None,
                    ConnectionState::Idle => self.unassign(),
                },
                None => {
                    if !self.assign(event_loop, managers) {
                        return None;
                    }
                }
            }
        }
    }

    /// Picks a connection for the unassigned in-flight report.
    ///
    /// Returns `true` when dispatch should take another turn (a usable or
    /// pending connection was adopted), `false` when the report stays
    /// deferred.
    fn assign<T: Copy>(
        &mut self,
        event_loop: &EventLoop<T>,
        managers: &[ResolutionManager],
    ) -> bool {
        let n = self.endpoints.len();
        for i in 0..n {
            let ep = (self.endpoint_cursor + i) % n;
            if !managers[ep].has_addresses() {
                continue;
            }
            self.endpoint_cursor = (ep + 1) % n;
            match self.connections[ep].state {
                ConnectionState::Ready | ConnectionState::Connecting => {
                    if let Some(inflight) = &mut self.inflight {
                        inflight.connection = Some(ep);
                    }
                    return true;
                }
                // A writing connection without an assigned report cannot
                // happen; skip it defensively rather than stall.
                ConnectionState::Writing => continue,
                ConnectionState::Idle => {
                    let addresses = managers[ep].addresses();
                    let ip = addresses[self.ip_cursors[ep] % addresses.len()];
                    self.ip_cursors[ep] = self.ip_cursors[ep].wrapping_add(1);
                    let addr = SocketAddr::new(ip, self.endpoints[ep].port);
                    match self.connections[ep].connect(event_loop, addr) {
                        Ok(()) => {
                            debug!(%addr, host = %self.endpoints[ep].host, "connecting to satellite");
                            if let Some(inflight) = &mut self.inflight {
                                inflight.connection = Some(ep);
                            }
                            return true;
                        }
                        Err(err) => {
                            debug!(
                                host = %self.endpoints[ep].host,
                                %addr,
                                %err,
                                "failed to open satellite connection"
                            );
                            continue;
                        }
                    }
                }
            }
        }
        false
    }

    fn pump<T: Copy>(&mut self, event_loop: &EventLoop<T>, ep: usize) -> PumpOutcome {
        let Some(inflight) = self.inflight.as_mut() else {
            return PumpOutcome::Blocked;
        };
        match pump_connection(inflight, &mut self.connections[ep]) {
            PumpOutcome::Sent(sent) => {
                self.connections[ep].state = ConnectionState::Ready;
                self.inflight = None;
                PumpOutcome::Sent(sent)
            }
            PumpOutcome::Blocked => {
                self.connections[ep].state = ConnectionState::Writing;
                PumpOutcome::Blocked
            }
            PumpOutcome::Broken => {
                self.on_broken(event_loop, ep);
                PumpOutcome::Broken
            }
        }
    }

    fn on_broken<T: Copy>(&mut self, event_loop: &EventLoop<T>, ep: usize) {
        debug!(
            host = %self.endpoints[ep].host,
            addr = ?self.connections[ep].addr,
            "satellite connection broken"
        );
        self.connections[ep].close(event_loop);
        if self.assigned() == Some(ep) {
            // Restart the report from byte zero on the next host.
            self.unassign();
        }
    }

    /// Handles readiness on a connection token. Returns the delivery
    /// record when the event completed the in-flight report.
    pub fn on_socket<T: Copy>(
        &mut self,
        event_loop: &EventLoop<T>,
        readiness: SocketReadiness,
        managers: &[ResolutionManager],
    ) -> Option<SentReport> {
        let ep = readiness.token.0.checked_sub(CONNECTION_TOKEN_BASE)?;
        if ep >= self.connections.len() || self.connections[ep].stream.is_none() {
            return None;
        }

        // An error condition (refused connect, reset) surfaces through the
        // read path as well, so fold it into both.
        if (readiness.readable || readiness.error) && !self.connections[ep].drain_reads() {
            self.on_broken(event_loop, ep);
        }

        if (readiness.writable || readiness.error) && self.connections[ep].stream.is_some() {
            if self.connections[ep].state == ConnectionState::Connecting {
                match self.connections[ep].check_connected() {
                    Ok(true) => {
                        debug!(
                            host = %self.endpoints[ep].host,
                            addr = ?self.connections[ep].addr,
                            "satellite connection established"
                        );
                        self.connections[ep].state = ConnectionState::Ready;
                    }
                    Ok(false) => {}
                    Err(err) => {
                        debug!(
                            host = %self.endpoints[ep].host,
                            %err,
                            "satellite connection attempt failed"
                        );
                        self.on_broken(event_loop, ep);
                    }
                }
            }
            if self.connections[ep].state == ConnectionState::Writing {
                // Socket drained some backlog; resume from the cursor.
                self.connections[ep].state = ConnectionState::Ready;
            }
        }

        // Progress the report: the connection may have just become usable,
        // or a break above left the report unassigned.
        self.dispatch(event_loop, managers)
    }

    /// Unconditionally abandons the in-flight report, deadline or not;
    /// used by the bounded final flush at shutdown.
    pub fn abandon_inflight<T: Copy>(
        &mut self,
        event_loop: &EventLoop<T>,
    ) -> Option<DroppedReport> {
        let inflight = self.inflight.take()?;
        if let Some(ep) = inflight.connection {
            self.connections[ep].close(event_loop);
        }
        Some(DroppedReport {
            span_bytes: inflight.report.span_bytes(),
            num_spans: inflight.report.num_spans(),
            dropped_count: inflight.report.dropped_count(),
        })
    }

    /// Closes every connection; used at shutdown.
    pub fn close_all<T: Copy>(&mut self, event_loop: &EventLoop<T>) {
        for connection in &mut self.connections {
            connection.close(event_loop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressFamily;
    use spanring::{BlockAllocator, CHAIN_NODE_BLOCK_SIZE};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_report() -> ReportRequest {
        let allocator = Arc::new(BlockAllocator::new(CHAIN_NODE_BLOCK_SIZE, 4));
        let mut report =
            ReportRequest::new(Arc::new(vec![1, 2, 3]), vec![4, 5], 7, allocator);
        static REGION: &[u8] = &[9, 9, 9, 9];
        // SAFETY: static region outlives the report.
        unsafe { report.add_span_region((REGION, &[]), 1).unwrap() };
        report
    }

    #[test]
    fn reports_defer_without_addresses_and_expire_at_the_deadline() {
        let event_loop = EventLoop::<u8>::new().unwrap();
        let managers = vec![ResolutionManager::new(
            0,
            "satellite.test".into(),
            AddressFamily::Ipv4,
        )];
        let mut pool = ConnectionPool::new(vec![SatelliteEndpoint {
            host: "satellite.test".into(),
            port: 8360,
            family: AddressFamily::Ipv4,
        }]);

        let deadline = Instant::now() + Duration::from_millis(50);
        pool.submit(test_report(), deadline);

        // No resolved addresses anywhere: the report defers.
        assert!(pool.dispatch(&event_loop, &managers).is_none());
        assert!(pool.has_inflight());
        assert!(pool.poll_deadline(&event_loop, Instant::now()).is_none());

        let dropped = pool
            .poll_deadline(&event_loop, deadline + Duration::from_millis(1))
            .expect("deadline passed");
        assert_eq!(dropped.span_bytes, 4);
        assert_eq!(dropped.num_spans, 1);
        assert_eq!(dropped.dropped_count, 7);
        assert!(!pool.has_inflight());
    }
}
