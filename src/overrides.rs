use std::net::Ipv4Addr;

use tracing::{debug, info, trace};

use crate::proto_utils::{HexDump, MIN_QUESTION_LEN, encode_labels};

/// A hostname pinned to an IPv4 address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOverride {
    pub hostname: String,
    /// Length-prefixed labels of `hostname`, no root label.
    pub suffix: Vec<u8>,
    pub ip: Ipv4Addr,
}

impl HostOverride {
    pub fn new(hostname: &str, ip: Ipv4Addr) -> Self {
        Self {
            hostname: hostname.to_string(),
            suffix: encode_labels(hostname),
            ip,
        }
    }

    /// True when the encoded question name of `packet` ends with this suffix.
    ///
    /// The name is assumed to run from offset 12 up to the root label at `n - 5`,
    /// which holds for any packet that passed `is_single_a_query`.
    #[inline]
    fn matches_tail(&self, packet: &[u8]) -> bool {
        let n = packet.len();
        // name bytes between the header and the root label
        let max_len = n.saturating_sub(MIN_QUESTION_LEN);
        if self.suffix.is_empty() || self.suffix.len() > max_len {
            return false;
        }
        let end = n - 5;
        packet[end - self.suffix.len()..end] == self.suffix[..]
    }
}

/// Ordered override list; first match wins and entries never move.
#[derive(Debug, Default)]
pub struct HostOverrides {
    entries: Vec<HostOverride>,
}

impl HostOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, Ipv4Addr)>) -> Self {
        let mut store = Self::new();
        for (hostname, ip) in entries {
            store.upsert(&hostname, ip);
        }
        store
    }

    /// First override whose suffix matches the tail of the question name.
    pub fn find_match(&self, packet: &[u8]) -> Option<&HostOverride> {
        self.entries.iter().find(|ho| ho.matches_tail(packet))
    }

    /// Rebinds `hostname` if present (exact string match), else appends it.
    pub fn upsert(&mut self, hostname: &str, ip: Ipv4Addr) {
        if let Some(existing) = self.entries.iter_mut().find(|ho| ho.hostname == hostname) {
            debug!(target = "overrides", hostname, old = %existing.ip, new = %ip, "override updated");
            existing.ip = ip;
            return;
        }
        let ho = HostOverride::new(hostname, ip);
        info!(target = "overrides", hostname, ip = %ip, "override added");
        trace!(target = "overrides", hostname, "suffix\n{}", HexDump(&ho.suffix));
        self.entries.push(ho);
    }

    pub fn get(&self, hostname: &str) -> Option<&HostOverride> {
        self.entries.iter().find(|ho| ho.hostname == hostname)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
