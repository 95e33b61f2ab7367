//! IAM control datagrams.
//!
//! ```text
//! +---------+---------+--------+------------------+-----------------+
//! | version | command | len(L) | hostname (ASCII) | ipv4 (cmd 1)    |
//! |  1 byte |  1 byte | 1 byte |     L bytes      |    4 bytes      |
//! +---------+---------+--------+------------------+-----------------+
//! ```
//!
//! Command 0 binds the hostname to the sender's source address, command 1 to the
//! address carried in the datagram. The acknowledgement is the request echoed back
//! with the high bit of the command byte set.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use thiserror::Error;

pub const IAM_VERSION: u8 = 0;
pub const CMD_SELF_REGISTER: u8 = 0;
pub const CMD_SET: u8 = 1;
pub const ACK_BIT: u8 = 0x80;

const HEADER_LEN: usize = 3;
/// Header plus at least one hostname byte.
const MIN_LEN: usize = HEADER_LEN + 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IamError {
    #[error("{0} bytes, too small to parse")]
    TooShort(usize),
    #[error("unsupported version tag {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported command {0}")]
    UnsupportedCommand(u8),
    #[error("name length {len} exceeds the {available} bytes left in the packet")]
    NameTooLong { len: usize, available: usize },
    #[error("hostname is empty or not ASCII")]
    InvalidHostname,
    #[error("set command without a 4 byte address")]
    MissingAddress,
    #[error("self-register from non-IPv4 source {0}")]
    NotIpv4(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IamCommand {
    SelfRegister,
    Set(Ipv4Addr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IamRequest {
    pub hostname: String,
    pub command: IamCommand,
}

impl IamRequest {
    pub fn parse(packet: &[u8]) -> Result<Self, IamError> {
        let n = packet.len();
        if n < MIN_LEN {
            return Err(IamError::TooShort(n));
        }
        if packet[0] != IAM_VERSION {
            return Err(IamError::UnsupportedVersion(packet[0]));
        }
        let cmd = packet[1];
        if cmd != CMD_SELF_REGISTER && cmd != CMD_SET {
            return Err(IamError::UnsupportedCommand(cmd));
        }

        let len = packet[2] as usize;
        let available = n - HEADER_LEN;
        if len > available {
            return Err(IamError::NameTooLong { len, available });
        }
        let raw = &packet[HEADER_LEN..HEADER_LEN + len];
        if raw.is_empty() || !raw.is_ascii() {
            return Err(IamError::InvalidHostname);
        }
        let hostname = String::from_utf8_lossy(raw).into_owned();

        let command = if cmd == CMD_SET {
            let ip: [u8; 4] = packet
                .get(HEADER_LEN + len..HEADER_LEN + len + 4)
                .and_then(|b| b.try_into().ok())
                .ok_or(IamError::MissingAddress)?;
            IamCommand::Set(Ipv4Addr::from(ip))
        } else {
            IamCommand::SelfRegister
        };

        Ok(Self { hostname, command })
    }

    /// Address to bind: the sender's for self-register, the carried one otherwise.
    pub fn target_ip(&self, source: SocketAddr) -> Result<Ipv4Addr, IamError> {
        match self.command {
            IamCommand::Set(ip) => Ok(ip),
            IamCommand::SelfRegister => match source.ip() {
                IpAddr::V4(ip) => Ok(ip),
                IpAddr::V6(v6) => v6.to_ipv4_mapped().ok_or(IamError::NotIpv4(source)),
            },
        }
    }

    #[cfg(test)]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![IAM_VERSION];
        out.push(match self.command {
            IamCommand::SelfRegister => CMD_SELF_REGISTER,
            IamCommand::Set(_) => CMD_SET,
        });
        out.push(self.hostname.len() as u8);
        out.extend_from_slice(self.hostname.as_bytes());
        if let IamCommand::Set(ip) = self.command {
            out.extend_from_slice(&ip.octets());
        }
        out
    }
}

/// The received datagram with the ack bit set on the command byte.
pub fn ack(packet: &[u8]) -> Vec<u8> {
    let mut out = packet.to_vec();
    if let Some(cmd) = out.get_mut(1) {
        *cmd |= ACK_BIT;
    }
    out
}
