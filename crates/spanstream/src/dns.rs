//! Asynchronous endpoint name resolution.
//!
//! Lookups run off the I/O thread; completions come back through a channel
//! and a [`mio::Waker`] so the event loop observes them at its next wait.
//! One [`ResolutionManager`] per satellite endpoint owns the current
//! address set and decides when the next refresh happens.

use crate::config::{AddressFamily, RecorderOptions};
use mio::Waker;
use rand::Rng;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// A pending lookup request.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    /// Index of the endpoint this lookup belongs to.
    pub endpoint: usize,
    pub host: String,
    pub family: AddressFamily,
}

/// A completed lookup.
#[derive(Debug)]
pub struct DnsReply {
    pub endpoint: usize,
    pub result: Result<Vec<IpAddr>, String>,
}

/// Delivery handle resolvers use to hand results back to the I/O thread.
#[derive(Clone)]
pub struct DnsReplySink {
    tx: Sender<DnsReply>,
    waker: Arc<Waker>,
}

impl DnsReplySink {
    pub(crate) fn new(tx: Sender<DnsReply>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    /// Publishes a reply and wakes the event loop.
    ///
    /// Replies racing a recorder shutdown are silently discarded.
    pub fn publish(&self, reply: DnsReply) {
        if self.tx.send(reply).is_err() {
            return;
        }
        if let Err(err) = self.waker.wake() {
            warn!(%err, "failed to wake the I/O thread for a DNS reply");
        }
    }
}

/// Name resolution capability.
///
/// `resolve` must not block the calling thread; the reply is published on
/// `sink` whenever the lookup finishes.
pub trait DnsResolver: Send {
    fn resolve(&mut self, query: DnsQuery, sink: &DnsReplySink);
}

/// System resolver: a dedicated lookup thread running the libc resolver
/// via [`ToSocketAddrs`].
pub struct SystemResolver {
    tx: Option<Sender<(DnsQuery, DnsReplySink)>>,
    worker: Option<JoinHandle<()>>,
}

impl SystemResolver {
    pub fn new() -> Self {
        let (tx, rx): (Sender<(DnsQuery, DnsReplySink)>, Receiver<_>) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("spanstream-dns".into())
            .spawn(move || {
                for (query, sink) in rx {
                    let endpoint = query.endpoint;
                    let result = Self::lookup(&query);
                    sink.publish(DnsReply { endpoint, result });
                }
            })
            .ok();
        if worker.is_none() {
            warn!("failed to spawn the DNS lookup thread; resolutions will fail");
        }
        Self {
            tx: Some(tx),
            worker,
        }
    }

    fn lookup(query: &DnsQuery) -> Result<Vec<IpAddr>, String> {
        let addrs = (query.host.as_str(), 0u16)
            .to_socket_addrs()
            .map_err(|err| err.to_string())?;
        let mut ips: Vec<IpAddr> = Vec::new();
        for addr in addrs {
            let ip = addr.ip();
            if query.family.matches(&ip) && !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        Ok(ips)
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResolver for SystemResolver {
    fn resolve(&mut self, query: DnsQuery, sink: &DnsReplySink) {
        let endpoint = query.endpoint;
        if let Some(tx) = &self.tx {
            if tx.send((query, sink.clone())).is_ok() {
                return;
            }
        }
        sink.publish(DnsReply {
            endpoint,
            result: Err("resolver thread unavailable".into()),
        });
    }
}

impl Drop for SystemResolver {
    fn drop(&mut self) {
        // Close the request channel first so the thread drains and exits.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Per-endpoint resolution state.
///
/// The address set is replaced only from the I/O thread when a resolution
/// succeeds; failures keep the previous set effective until a later
/// success replaces it.
pub struct ResolutionManager {
    endpoint: usize,
    host: String,
    family: AddressFamily,
    addresses: Vec<IpAddr>,
}

impl ResolutionManager {
    pub fn new(endpoint: usize, host: String, family: AddressFamily) -> Self {
        Self {
            endpoint,
            host,
            family,
            addresses: Vec::new(),
        }
    }

    /// Currently valid addresses, possibly empty before the first success.
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    pub fn has_addresses(&self) -> bool {
        !self.addresses.is_empty()
    }

    /// The query to issue for this endpoint.
    pub fn query(&self) -> DnsQuery {
        DnsQuery {
            endpoint: self.endpoint,
            host: self.host.clone(),
            family: self.family,
        }
    }

    /// Applies a lookup result and returns the delay until the next
    /// resolution should be issued.
    ///
    /// Successful refreshes are spread uniformly over
    /// `[min_refresh, max_refresh]` so endpoints do not renew in lockstep;
    /// failures retry after `dns_failure_retry_period`.
    pub fn on_reply(
        &mut self,
        result: Result<Vec<IpAddr>, String>,
        options: &RecorderOptions,
        rng: &mut impl Rng,
    ) -> Duration {
        match result {
            Ok(addresses) if !addresses.is_empty() => {
                self.addresses = addresses;
                refresh_jitter(
                    rng,
                    options.min_dns_resolution_refresh_period,
                    options.max_dns_resolution_refresh_period,
                )
            }
            Ok(_) => {
                debug!(host = %self.host, "DNS resolution returned no addresses");
                options.dns_failure_retry_period
            }
            Err(message) => {
                debug!(host = %self.host, %message, "failed to resolve satellite endpoint");
                options.dns_failure_retry_period
            }
        }
    }
}

fn refresh_jitter(rng: &mut impl Rng, min: Duration, max: Duration) -> Duration {
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    if max_ms <= min_ms {
        return min;
    }
    Duration::from_millis(rng.gen_range(min_ms..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ResolutionManager {
        ResolutionManager::new(0, "satellite.test".into(), AddressFamily::Ipv4)
    }

    fn options() -> RecorderOptions {
        RecorderOptions {
            min_dns_resolution_refresh_period: Duration::from_millis(100),
            max_dns_resolution_refresh_period: Duration::from_millis(300),
            dns_failure_retry_period: Duration::from_millis(40),
            ..RecorderOptions::default()
        }
    }

    #[test]
    fn success_replaces_the_address_set() {
        let mut manager = manager();
        let options = options();
        let mut rng = rand::thread_rng();

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let delay = manager.on_reply(Ok(vec![ip]), &options, &mut rng);
        assert_eq!(manager.addresses(), &[ip]);
        assert!(delay >= options.min_dns_resolution_refresh_period);
        assert!(delay <= options.max_dns_resolution_refresh_period);
    }

    #[test]
    fn failure_keeps_the_previous_addresses() {
        let mut manager = manager();
        let options = options();
        let mut rng = rand::thread_rng();

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        manager.on_reply(Ok(vec![ip]), &options, &mut rng);

        let delay = manager.on_reply(Err("timed out".into()), &options, &mut rng);
        assert_eq!(manager.addresses(), &[ip], "previous set stays effective");
        assert_eq!(delay, options.dns_failure_retry_period);

        let delay = manager.on_reply(Ok(Vec::new()), &options, &mut rng);
        assert_eq!(manager.addresses(), &[ip], "empty result is a failure");
        assert_eq!(delay, options.dns_failure_retry_period);
    }

    #[test]
    fn refresh_delays_stay_within_bounds() {
        let mut manager = manager();
        let options = options();
        let mut rng = rand::thread_rng();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        for _ in 0..200 {
            let delay = manager.on_reply(Ok(vec![ip]), &options, &mut rng);
            assert!(delay >= options.min_dns_resolution_refresh_period);
            assert!(delay <= options.max_dns_resolution_refresh_period);
        }
    }

    #[test]
    fn system_resolver_resolves_loopback() {
        let mut event_loop = crate::event_loop::EventLoop::<()>::new().unwrap();
        let waker = Arc::new(event_loop.waker().unwrap());
        let (tx, rx) = mpsc::channel();
        let sink = DnsReplySink::new(tx, waker);

        let mut resolver = SystemResolver::new();
        resolver.resolve(
            DnsQuery {
                endpoint: 3,
                host: "127.0.0.1".into(),
                family: AddressFamily::Ipv4,
            },
            &sink,
        );

        let reply = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reply.endpoint, 3);
        let ips = reply.result.unwrap();
        assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
        // The waker was signalled; unused here, but must not have errored.
        let _ = event_loop;
    }
}
