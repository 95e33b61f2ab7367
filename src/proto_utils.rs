use std::fmt;
use std::hash::Hasher;
use std::net::Ipv4Addr;

use rustc_hash::FxHasher;

pub const HEADER_LEN: usize = 12;
/// Header, root label, QTYPE and QCLASS: the smallest single-question packet.
pub const MIN_QUESTION_LEN: usize = HEADER_LEN + 1 + 4;
/// Name pointer(2) + type(2) + class(2) + ttl(4) + rdlen(2) + ipv4(4).
pub const SYNTH_ANSWER_LEN: usize = 16;
/// Synthesized answers are re-asked almost immediately so IAM updates land fast.
pub const SYNTH_TTL_SECS: u32 = 1;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
const NAME_PTR_TO_QUESTION: [u8; 2] = [0xC0, 0x0C];

/// Reads the transaction id (offset 0, big endian).
#[inline]
pub fn read_txid(packet: &[u8]) -> Option<u16> {
    match packet {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Overwrites the transaction id in place. Packets shorter than two bytes are left alone.
#[inline]
pub fn write_txid(packet: &mut [u8], id: u16) {
    if let Some(head) = packet.get_mut(..2) {
        head.copy_from_slice(&id.to_be_bytes());
    }
}

/// Content fingerprint of everything after the transaction id.
///
/// Two datagrams asking the same question with different ids hash identically, so this
/// doubles as the cache key and (truncated) as the id used towards the upstream.
#[inline]
pub fn fingerprint(packet: &[u8]) -> u64 {
    let mut h = FxHasher::default();
    h.write(packet.get(2..).unwrap_or_default());
    h.finish()
}

/// Low 16 bits of a fingerprint, used as the transaction id on the upstream leg.
#[inline]
pub fn upstream_txid(hash: u64) -> u16 {
    hash as u16
}

/// Fixed-offset shape check: one question, RD-only flags, type A, class IN.
///
/// No name parsing happens here; anything else (EDNS, other types, multi-question)
/// fails the check and is proxied opaquely.
pub fn is_single_a_query(packet: &[u8]) -> bool {
    let n = packet.len();
    if n < MIN_QUESTION_LEN {
        return false;
    }
    packet[2..6] == [0x01, 0x00, 0x00, 0x01] && packet[n - 4..] == [0x00, 0x01, 0x00, 0x01]
}

/// Builds an A answer for `request` pointing at `ip`.
///
/// Returns `None` when the request does not pass [`is_single_a_query`].
pub fn synthesize_answer(request: &[u8], ip: Ipv4Addr) -> Option<Vec<u8>> {
    if !is_single_a_query(request) {
        return None;
    }

    let mut resp = Vec::with_capacity(request.len() + SYNTH_ANSWER_LEN);
    resp.extend_from_slice(request);
    // QR + RD, then RA with NOERROR
    resp[2] = 0x81;
    resp[3] = 0x80;
    // ANCOUNT = 1
    resp[6] = 0x00;
    resp[7] = 0x01;

    resp.extend_from_slice(&NAME_PTR_TO_QUESTION);
    resp.extend_from_slice(&TYPE_A.to_be_bytes());
    resp.extend_from_slice(&CLASS_IN.to_be_bytes());
    resp.extend_from_slice(&SYNTH_TTL_SECS.to_be_bytes());
    resp.extend_from_slice(&4u16.to_be_bytes());
    resp.extend_from_slice(&ip.octets());
    Some(resp)
}

/// Wire-encodes a dotted hostname as length-prefixed labels, without the root label.
///
/// Empty labels (leading, trailing or doubled dots) are skipped. Labels longer than 63
/// bytes are truncated to keep the length prefix out of the pointer range.
pub fn encode_labels(hostname: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(hostname.len() + 1);
    for label in hostname.split('.').filter(|l| !l.is_empty()) {
        let bytes = &label.as_bytes()[..label.len().min(63)];
        out.push(bytes.len() as u8);
        out.extend_from_slice(bytes);
    }
    out
}

/// Dotted name of the first question, for logging only.
///
/// Stops at the first compression pointer or malformed label.
pub fn question_name(packet: &[u8]) -> Option<String> {
    let mut pos = HEADER_LEN;
    let mut name = String::new();
    loop {
        let len = *packet.get(pos)? as usize;
        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            return None;
        }
        let label = packet.get(pos + 1..pos + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        pos += 1 + len;
    }
    Some(name)
}

/// Hex dump, 16 bytes per line.
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, line) in self.0.chunks(16).enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            for (j, b) in line.iter().enumerate() {
                if j > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{:02X}", b)?;
            }
        }
        Ok(())
    }
}
