use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::overrides::HostOverrides;
use crate::proto_utils::{
    fingerprint, is_single_a_query, question_name, read_txid, synthesize_answer, upstream_txid,
    write_txid,
};

/// A cached answer older than this is still served, but also re-asked upstream.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    /// Override answers never go stale; a cache clear is the only way out.
    Pinned,
    Since(Instant),
}

/// A client waiting for an upstream answer.
#[derive(Debug, Clone)]
pub struct Request {
    pub original_id: u16,
    pub requester: SocketAddr,
    pub enqueued_at: Instant,
}

#[derive(Debug)]
pub struct CacheEntry {
    pub hash: u64,
    created_at: Freshness,
    pub response: Option<Bytes>,
    pub pending: Vec<Request>,
}

impl CacheEntry {
    fn new(hash: u64, now: Instant) -> Self {
        Self {
            hash,
            created_at: Freshness::Since(now),
            response: None,
            pending: Vec::new(),
        }
    }

    fn pinned(hash: u64, response: Vec<u8>) -> Self {
        Self {
            hash,
            created_at: Freshness::Pinned,
            response: Some(Bytes::from(response)),
            pending: Vec::new(),
        }
    }

    /// Age is measured from creation. Replies do not reset it, so once an entry goes
    /// stale every later hit also refreshes upstream.
    fn is_fresh(&self, now: Instant, window: Duration) -> bool {
        match self.created_at {
            Freshness::Pinned => true,
            Freshness::Since(created) => now.saturating_duration_since(created) < window,
        }
    }
}

/// What the engine should do for one client datagram.
#[derive(Debug, Default)]
pub struct ClientPlan {
    /// Cached answer already carrying the requester's id.
    pub cached: Option<Vec<u8>>,
    /// Request rewritten to the synthetic id, bound for the upstream.
    pub forward: Option<Vec<u8>>,
    /// The cached answer was built from a host override just now.
    pub synthesized: bool,
}

/// An upstream answer addressed to one waiting client.
#[derive(Debug)]
pub struct Delivery {
    pub to: SocketAddr,
    pub packet: Vec<u8>,
    pub waited: Duration,
}

/// Question fingerprint -> answer/waiters, plus the upstream id -> fingerprint map.
///
/// Unbounded: the only eviction is [`CorrelationCache::clear`], run on every override
/// change. The upstream id is the fingerprint's low 16 bits, so two concurrent questions
/// sharing those bits will have one reply routed to the other's entry.
#[derive(Debug)]
pub struct CorrelationCache {
    entries: FxHashMap<u64, CacheEntry>,
    outstanding: FxHashMap<u16, u64>,
    freshness: Duration,
}

impl CorrelationCache {
    pub fn new(freshness: Duration) -> Self {
        Self {
            entries: FxHashMap::default(),
            outstanding: FxHashMap::default(),
            freshness,
        }
    }

    pub fn on_client_request(
        &mut self,
        packet: &[u8],
        from: SocketAddr,
        overrides: &HostOverrides,
        now: Instant,
    ) -> ClientPlan {
        let hash = fingerprint(packet);
        let original_id = read_txid(packet).unwrap_or_default();
        let mut plan = ClientPlan::default();

        if let Entry::Vacant(slot) = self.entries.entry(hash) {
            if let Some(resp) = synthesize_override(packet, overrides) {
                slot.insert(CacheEntry::pinned(hash, resp));
                plan.synthesized = true;
            }
        }

        if let Some(entry) = self.entries.get(&hash) {
            if let Some(resp) = &entry.response {
                let mut out = resp.to_vec();
                write_txid(&mut out, original_id);
                plan.cached = Some(out);
                if entry.is_fresh(now, self.freshness) {
                    return plan;
                }
            }
        }

        let id = upstream_txid(hash);
        let entry = self
            .entries
            .entry(hash)
            .or_insert_with(|| CacheEntry::new(hash, now));

        // waiters are never timed out; an unanswered forward keeps later askers queued
        let in_flight = !entry.pending.is_empty() && self.outstanding.get(&id) == Some(&hash);

        entry.pending.push(Request {
            original_id,
            requester: from,
            enqueued_at: now,
        });

        if in_flight {
            debug!(target = "cache", hash, waiting = entry.pending.len(), "joined in-flight query");
            return plan;
        }

        self.outstanding.insert(id, hash);
        let mut fwd = packet.to_vec();
        write_txid(&mut fwd, id);
        plan.forward = Some(fwd);
        plan
    }

    /// Routes an upstream answer to everyone waiting on it and caches it.
    ///
    /// Returns `None` when the id is unknown (late duplicate, spurious, or cleared) or
    /// the entry is gone.
    pub fn on_upstream_reply(&mut self, packet: &[u8], now: Instant) -> Option<Vec<Delivery>> {
        let id = read_txid(packet)?;
        let hash = self.outstanding.remove(&id)?;
        let entry = self.entries.get_mut(&hash)?;
        debug!(target = "cache", hash = entry.hash, id, waiting = entry.pending.len(), "upstream reply matched");

        let deliveries = entry
            .pending
            .drain(..)
            .map(|req| {
                let mut out = packet.to_vec();
                write_txid(&mut out, req.original_id);
                Delivery {
                    to: req.requester,
                    packet: out,
                    waited: now.saturating_duration_since(req.enqueued_at),
                }
            })
            .collect();

        entry.response = Some(Bytes::copy_from_slice(packet));
        Some(deliveries)
    }

    /// Drops every answer, waiter and outstanding id.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.outstanding.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.entries.values().map(|e| e.pending.len()).sum()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }
}

impl Default for CorrelationCache {
    fn default() -> Self {
        Self::new(DEFAULT_FRESHNESS)
    }
}

fn synthesize_override(packet: &[u8], overrides: &HostOverrides) -> Option<Vec<u8>> {
    if !is_single_a_query(packet) {
        return None;
    }
    let ho = overrides.find_match(packet)?;
    debug!(
        target = "cache",
        qname = question_name(packet).as_deref().unwrap_or("<?>"),
        hostname = %ho.hostname,
        ip = %ho.ip,
        "override hit"
    );
    synthesize_answer(packet, ho.ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{build_query, fake_upstream_reply};
    use hickory_proto::rr::RecordType;
    use std::net::Ipv4Addr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn no_overrides() -> HostOverrides {
        HostOverrides::new()
    }

    #[test]
    fn identical_questions_share_one_forward() {
        let mut cache = CorrelationCache::default();
        let now = Instant::now();
        let q1 = build_query(0x0101, "example.com", RecordType::A);
        let q2 = build_query(0x0202, "example.com", RecordType::A);

        let p1 = cache.on_client_request(&q1, addr(1000), &no_overrides(), now);
        let p2 = cache.on_client_request(&q2, addr(2000), &no_overrides(), now);

        let fwd = p1.forward.expect("first request forwards");
        assert!(p2.forward.is_none());
        assert!(p1.cached.is_none() && p2.cached.is_none());
        assert_eq!(cache.pending_requests(), 2);

        let hash = fingerprint(&q1);
        assert_eq!(read_txid(&fwd), Some(upstream_txid(hash)));
        assert_eq!(&fwd[2..], &q1[2..]);

        let reply = fake_upstream_reply(&fwd, [1, 2, 3, 4]);
        let later = now + Duration::from_millis(30);
        let deliveries = cache.on_upstream_reply(&reply, later).expect("matched");
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].to, addr(1000));
        assert_eq!(read_txid(&deliveries[0].packet), Some(0x0101));
        assert_eq!(deliveries[1].to, addr(2000));
        assert_eq!(read_txid(&deliveries[1].packet), Some(0x0202));
        assert_eq!(deliveries[0].waited, Duration::from_millis(30));
        assert_eq!(cache.pending_requests(), 0);
        assert_eq!(cache.outstanding_len(), 0);
    }

    #[test]
    fn reply_is_passed_through_except_for_id() {
        let mut cache = CorrelationCache::default();
        let now = Instant::now();
        let q = build_query(0xABCD, "example.net", RecordType::MX);
        let fwd = cache
            .on_client_request(&q, addr(5353), &no_overrides(), now)
            .forward
            .expect("forward");

        let reply = fake_upstream_reply(&fwd, [9, 9, 9, 9]);
        let deliveries = cache.on_upstream_reply(&reply, now).expect("matched");
        assert_eq!(deliveries.len(), 1);
        assert_eq!(&deliveries[0].packet[..2], &0xABCDu16.to_be_bytes());
        assert_eq!(&deliveries[0].packet[2..], &reply[2..]);
    }

    #[test]
    fn unknown_and_duplicate_replies_are_discarded() {
        let mut cache = CorrelationCache::default();
        let now = Instant::now();
        let q = build_query(1, "example.com", RecordType::A);
        let fwd = cache
            .on_client_request(&q, addr(1), &no_overrides(), now)
            .forward
            .expect("forward");

        let mut stray = fake_upstream_reply(&fwd, [1, 1, 1, 1]);
        write_txid(&mut stray, upstream_txid(fingerprint(&q)).wrapping_add(1));
        assert!(cache.on_upstream_reply(&stray, now).is_none());

        let reply = fake_upstream_reply(&fwd, [1, 1, 1, 1]);
        assert!(cache.on_upstream_reply(&reply, now).is_some());
        assert!(cache.on_upstream_reply(&reply, now).is_none());
        assert!(cache.on_upstream_reply(&[0x01], now).is_none());
    }

    #[test]
    fn fresh_hit_is_served_without_forward() {
        let mut cache = CorrelationCache::default();
        let t0 = Instant::now();
        let q = build_query(7, "example.com", RecordType::A);
        let fwd = cache
            .on_client_request(&q, addr(1), &no_overrides(), t0)
            .forward
            .expect("forward");
        let reply = fake_upstream_reply(&fwd, [5, 6, 7, 8]);
        cache.on_upstream_reply(&reply, t0).expect("matched");

        let q_again = build_query(8, "example.com", RecordType::A);
        let plan = cache.on_client_request(&q_again, addr(2), &no_overrides(), t0 + Duration::from_secs(60));
        let cached = plan.cached.expect("cache hit");
        assert!(plan.forward.is_none());
        assert_eq!(read_txid(&cached), Some(8));
        assert_eq!(&cached[2..], &reply[2..]);
    }

    #[test]
    fn stale_hit_is_served_and_refreshed_and_age_never_resets() {
        let mut cache = CorrelationCache::default();
        let t0 = Instant::now();
        let q = build_query(7, "example.com", RecordType::A);
        let fwd = cache
            .on_client_request(&q, addr(1), &no_overrides(), t0)
            .forward
            .expect("forward");
        cache
            .on_upstream_reply(&fake_upstream_reply(&fwd, [1, 1, 1, 1]), t0)
            .expect("matched");

        let t1 = t0 + DEFAULT_FRESHNESS + Duration::from_secs(1);
        let plan = cache.on_client_request(&q, addr(2), &no_overrides(), t1);
        assert!(plan.cached.is_some());
        let fwd = plan.forward.expect("stale entry refreshes upstream");
        let deliveries = cache
            .on_upstream_reply(&fake_upstream_reply(&fwd, [2, 2, 2, 2]), t1)
            .expect("matched");
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].to, addr(2));

        // the refreshed answer is served, but the entry still counts as stale
        let plan = cache.on_client_request(&q, addr(3), &no_overrides(), t1 + Duration::from_secs(1));
        let cached = plan.cached.expect("hit");
        assert_eq!(&cached[cached.len() - 4..], &[2, 2, 2, 2]);
        assert!(plan.forward.is_some());
    }

    #[test]
    fn override_is_synthesized_and_pinned() {
        let overrides = HostOverrides::from_entries([(
            "svc.corp".to_string(),
            Ipv4Addr::new(10, 1, 2, 3),
        )]);
        let mut cache = CorrelationCache::default();
        let t0 = Instant::now();
        let q = build_query(0x4242, "a.svc.corp", RecordType::A);

        let plan = cache.on_client_request(&q, addr(1), &overrides, t0);
        assert!(plan.synthesized);
        assert!(plan.forward.is_none());
        let resp = plan.cached.expect("synthesized answer");
        assert_eq!(&resp[..4], &[0x42, 0x42, 0x81, 0x80]);
        assert_eq!(&resp[resp.len() - 4..], &[10, 1, 2, 3]);
        assert_eq!(cache.outstanding_len(), 0);

        let plan = cache.on_client_request(&q, addr(1), &overrides, t0 + Duration::from_secs(86_400));
        assert!(!plan.synthesized);
        assert!(plan.cached.is_some());
        assert!(plan.forward.is_none());
    }

    #[test]
    fn override_ignored_for_non_a_queries() {
        let overrides = HostOverrides::from_entries([(
            "svc.corp".to_string(),
            Ipv4Addr::new(10, 1, 2, 3),
        )]);
        let mut cache = CorrelationCache::default();
        let q = build_query(1, "a.svc.corp", RecordType::AAAA);
        let plan = cache.on_client_request(&q, addr(1), &overrides, Instant::now());
        assert!(!plan.synthesized);
        assert!(plan.cached.is_none());
        assert!(plan.forward.is_some());
    }

    #[test]
    fn late_identical_question_joins_unanswered_forward() {
        let mut cache = CorrelationCache::default();
        let t0 = Instant::now();
        let q1 = build_query(1, "slow.example", RecordType::A);
        let q2 = build_query(2, "slow.example", RecordType::A);
        assert_eq!(&q1[2..], &q2[2..]);

        let forwards = [
            cache.on_client_request(&q1, addr(1), &no_overrides(), t0),
            cache.on_client_request(&q2, addr(2), &no_overrides(), t0 + Duration::from_secs(3)),
            cache.on_client_request(&q1, addr(3), &no_overrides(), t0 + Duration::from_secs(60)),
        ]
        .iter()
        .filter(|plan| plan.forward.is_some())
        .count();

        assert_eq!(forwards, 1);
        assert_eq!(cache.pending_requests(), 3);
        assert_eq!(cache.outstanding_len(), 1);
    }

    #[test]
    fn clear_drops_answers_and_outstanding() {
        let mut cache = CorrelationCache::default();
        let now = Instant::now();
        let q = build_query(1, "example.com", RecordType::A);
        let fwd = cache
            .on_client_request(&q, addr(1), &no_overrides(), now)
            .forward
            .expect("forward");
        cache.clear();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.outstanding_len(), 0);
        assert!(cache.on_upstream_reply(&fake_upstream_reply(&fwd, [0; 4]), now).is_none());
    }
}
