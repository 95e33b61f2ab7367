use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::cache::CorrelationCache;
use crate::config::RuntimeConfig;
use crate::iam::{self, IamRequest};
use crate::overrides::HostOverrides;
use crate::proto_utils::{HEADER_LEN, HexDump, question_name};

/// Default gap between the two sends of a cached answer. UDP loss mitigation, not a retry:
/// the second copy goes out regardless of whether the first arrived.
pub const CACHE_HIT_RESEND_DELAY: Duration = Duration::from_millis(1);

/// Counters for the lifetime of the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub requests: u64,
    pub cache_hits: u64,
    pub synthesized: u64,
    pub forwarded: u64,
    pub upstream_replies: u64,
    pub unmatched_replies: u64,
    pub iam_updates: u64,
    pub iam_rejected: u64,
    pub send_errors: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} cache_hits={} synthesized={} forwarded={} upstream_replies={} unmatched_replies={} iam_updates={} iam_rejected={} send_errors={}",
            self.requests,
            self.cache_hits,
            self.synthesized,
            self.forwarded,
            self.upstream_replies,
            self.unmatched_replies,
            self.iam_updates,
            self.iam_rejected,
            self.send_errors,
        )
    }
}

/// Sole owner of the override list and the correlation cache.
///
/// Every mutation goes through `&mut self` from the dispatch loop, so there is exactly
/// one datagram touching this state at any time and no locking is needed.
pub struct Engine {
    overrides: HostOverrides,
    cache: CorrelationCache,
    upstream: SocketAddr,
    resend_delay: Duration,
    stats: Stats,
}

impl Engine {
    pub fn new(cfg: &RuntimeConfig) -> Self {
        Self {
            overrides: HostOverrides::from_entries(cfg.hosts.iter().cloned()),
            cache: CorrelationCache::new(cfg.cache_timeout),
            upstream: cfg.upstream,
            resend_delay: cfg.resend_delay,
            stats: Stats::default(),
        }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn overrides(&self) -> &HostOverrides {
        &self.overrides
    }

    /// Binds `hostname` to `ip` and invalidates every cached answer.
    pub fn apply_override(&mut self, hostname: &str, ip: Ipv4Addr) {
        let previous = self.overrides.get(hostname).map(|ho| ho.ip);
        self.overrides.upsert(hostname, ip);
        let dropped = self.cache.len();
        let abandoned = self.cache.pending_requests();
        self.cache.clear();
        self.stats.iam_updates += 1;
        info!(
            target = "engine",
            hostname,
            ip = %ip,
            previous = ?previous,
            dropped,
            abandoned,
            "override applied, cache cleared"
        );
    }

    /// One datagram from the DNS socket: an upstream reply if it comes from the
    /// upstream address, a client question otherwise.
    pub async fn handle_dns(&mut self, socket: &UdpSocket, packet: &[u8], peer: SocketAddr) {
        trace!(target = "engine", peer = %peer, len = packet.len(), "recv\n{}", HexDump(packet));
        if packet.len() < HEADER_LEN {
            debug!(target = "engine", peer = %peer, len = packet.len(), "runt dns datagram dropped");
            return;
        }
        if peer == self.upstream {
            self.handle_upstream_reply(socket, packet).await;
        } else {
            self.handle_client_request(socket, packet, peer).await;
        }
    }

    async fn handle_client_request(&mut self, socket: &UdpSocket, packet: &[u8], peer: SocketAddr) {
        self.stats.requests += 1;
        let plan = self
            .cache
            .on_client_request(packet, peer, &self.overrides, Instant::now());

        if let Some(resp) = plan.cached {
            if plan.synthesized {
                self.stats.synthesized += 1;
            } else {
                self.stats.cache_hits += 1;
            }
            debug!(
                target = "engine",
                peer = %peer,
                qname = question_name(packet).as_deref().unwrap_or("<?>"),
                refresh = plan.forward.is_some(),
                "cached answer"
            );
            self.send(socket, &resp, peer).await;
            tokio::time::sleep(self.resend_delay).await;
            self.send(socket, &resp, peer).await;
        }

        if let Some(fwd) = plan.forward {
            self.stats.forwarded += 1;
            debug!(
                target = "engine",
                peer = %peer,
                upstream = %self.upstream,
                qname = question_name(packet).as_deref().unwrap_or("<?>"),
                "forward"
            );
            self.send(socket, &fwd, self.upstream).await;
        }
    }

    async fn handle_upstream_reply(&mut self, socket: &UdpSocket, packet: &[u8]) {
        let Some(deliveries) = self.cache.on_upstream_reply(packet, Instant::now()) else {
            self.stats.unmatched_replies += 1;
            debug!(target = "engine", len = packet.len(), "unmatched upstream reply dropped");
            return;
        };
        self.stats.upstream_replies += 1;

        for d in deliveries {
            debug!(
                target = "engine",
                peer = %d.to,
                elapsed_ms = d.waited.as_millis() as u64,
                qname = question_name(&d.packet).as_deref().unwrap_or("<?>"),
                "reply"
            );
            self.send(socket, &d.packet, d.to).await;
        }
        debug!(
            target = "engine",
            outstanding = self.cache.outstanding_len(),
            waiting = self.cache.pending_requests(),
            "after upstream reply"
        );
    }

    /// One datagram from the IAM socket. Malformed requests get no reply.
    pub async fn handle_iam(&mut self, socket: &UdpSocket, packet: &[u8], peer: SocketAddr) {
        trace!(target = "iam", peer = %peer, len = packet.len(), "recv\n{}", HexDump(packet));
        let parsed = IamRequest::parse(packet).and_then(|req| {
            let ip = req.target_ip(peer)?;
            Ok((req, ip))
        });
        let (req, ip) = match parsed {
            Ok(v) => v,
            Err(err) => {
                self.stats.iam_rejected += 1;
                warn!(target = "iam", peer = %peer, error = %err, "iam request dropped");
                return;
            }
        };

        info!(target = "iam", peer = %peer, hostname = %req.hostname, ip = %ip, "set");
        self.apply_override(&req.hostname, ip);
        self.send(socket, &iam::ack(packet), peer).await;
    }

    async fn send(&mut self, socket: &UdpSocket, packet: &[u8], to: SocketAddr) {
        trace!(target = "engine", peer = %to, len = packet.len(), "send\n{}", HexDump(packet));
        if let Err(err) = socket.send_to(packet, to).await {
            self.stats.send_errors += 1;
            warn!(target = "engine", peer = %to, error = %err, "send failed");
        }
    }
}
