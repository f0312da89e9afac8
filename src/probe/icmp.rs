//! Blocking ICMP echo socket shared by the ping and path-tracing probes.
//!
//! Runs inside `spawn_blocking` for sub-millisecond timing precision.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use super::ProbeError;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_TIME_EXCEEDED: u8 = 11;

const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

const IPV6_HEADER_LEN: usize = 40;

/// What answered an echo request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyKind {
    EchoReply,
    TimeExceeded,
    Unreachable,
}

/// A reply matched to one of our requests.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Reply {
    pub kind: ReplyKind,
    pub from: Option<IpAddr>,
    pub rtt: Duration,
}

/// Header fields of an ICMP message that refers to an echo request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParsedReply {
    kind: ReplyKind,
    identifier: u16,
    sequence: u16,
}

pub(crate) struct EchoSocket {
    socket: Socket,
    dest: SocketAddr,
    raw: bool,
}

impl EchoSocket {
    /// Open an ICMP socket towards `ip`, RAW first (privileged) then DGRAM.
    pub fn open(ip: IpAddr, source: Option<IpAddr>) -> Result<Self, ProbeError> {
        let (domain, protocol) = match ip {
            IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
            IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
        };

        let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
            Ok(s) => (s, true),
            Err(_) => (
                Socket::new(domain, Type::DGRAM, Some(protocol)).map_err(|e| {
                    ProbeError::Network(format!("failed to create ICMP socket: {}", e))
                })?,
                false,
            ),
        };

        if let Some(src) = source {
            socket
                .bind(&SocketAddr::new(src, 0).into())
                .map_err(|e| ProbeError::Network(format!("failed to bind {}: {}", src, e)))?;
        }

        Ok(Self {
            socket,
            dest: SocketAddr::new(ip, 0),
            raw,
        })
    }

    /// RAW sockets see time-exceeded messages from intermediate routers.
    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub fn set_ttl(&self, ttl: u32) -> Result<(), ProbeError> {
        let res = match self.dest {
            SocketAddr::V4(_) => self.socket.set_ttl(ttl),
            SocketAddr::V6(_) => self.socket.set_unicast_hops_v6(ttl),
        };
        res.map_err(|e| ProbeError::Network(format!("failed to set ttl {}: {}", ttl, e)))
    }

    /// Send one echo request and wait for the reply that matches it.
    pub fn ping(
        &self,
        identifier: u16,
        sequence: u16,
        timeout: Duration,
    ) -> Result<Reply, ProbeError> {
        let packet = match self.dest {
            SocketAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
            SocketAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
        };

        // Start timing just before send
        let start = Instant::now();

        self.socket
            .send_to(&packet, &self.dest.into())
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    ProbeError::Network(format!("permission denied: {}", e))
                } else {
                    ProbeError::Network(format!("failed to send: {}", e))
                }
            })?;

        // Receive until we get OUR reply or time out
        loop {
            let remaining = timeout
                .checked_sub(start.elapsed())
                .filter(|d| !d.is_zero())
                .ok_or(ProbeError::Timeout(timeout))?;
            self.socket
                .set_read_timeout(Some(remaining))
                .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

            let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
            let (len, from) = self.socket.recv_from(&mut buf).map_err(|e| {
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut
                {
                    ProbeError::Timeout(timeout)
                } else {
                    ProbeError::Network(format!("failed to receive: {}", e))
                }
            })?;
            // SAFETY: recv_from initialized the first `len` bytes
            let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

            // Stop timing immediately after receive
            let rtt = start.elapsed();

            let parsed = match self.dest {
                SocketAddr::V4(_) => parse_icmp_reply(buf),
                SocketAddr::V6(_) => parse_icmpv6_reply(buf),
            };
            let Some(parsed) = parsed else { continue };

            // DGRAM sockets get their identifier rewritten by the kernel,
            // which also demultiplexes replies per socket.
            if parsed.sequence != sequence || (self.raw && parsed.identifier != identifier) {
                continue;
            }

            return Ok(Reply {
                kind: parsed.kind,
                from: from.as_socket().map(|sa| sa.ip()),
                rtt,
            });
        }
    }
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = build_echo(ICMP_ECHO_REQUEST, identifier, sequence);
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The kernel fills in the ICMPv6 checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    build_echo(ICMPV6_ECHO_REQUEST, identifier, sequence)
}

fn build_echo(kind: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload
    packet[0] = kind;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());
    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Parse an IPv4 ICMP message. RAW sockets deliver the IP header, DGRAM ones don't.
fn parse_icmp_reply(buf: &[u8]) -> Option<ParsedReply> {
    let offset = if buf.first()? >> 4 == 4 {
        usize::from(buf[0] & 0x0F) * 4
    } else {
        0
    };
    let icmp = buf.get(offset..)?;

    let kind = match *icmp.first()? {
        ICMP_ECHO_REPLY => ReplyKind::EchoReply,
        ICMP_TIME_EXCEEDED => ReplyKind::TimeExceeded,
        ICMP_DEST_UNREACHABLE => ReplyKind::Unreachable,
        _ => return None,
    };

    let echo = if kind == ReplyKind::EchoReply {
        icmp
    } else {
        // Error messages quote the original IP header and 8 bytes of our request
        let inner_ip = icmp.get(8..)?;
        let inner_len = usize::from(inner_ip.first()? & 0x0F) * 4;
        let quoted = inner_ip.get(inner_len..)?;
        if *quoted.first()? != ICMP_ECHO_REQUEST {
            return None;
        }
        quoted
    };

    echo_fields(kind, echo)
}

/// Parse an ICMPv6 message; the kernel never hands us the IPv6 header.
fn parse_icmpv6_reply(buf: &[u8]) -> Option<ParsedReply> {
    let kind = match *buf.first()? {
        ICMPV6_ECHO_REPLY => ReplyKind::EchoReply,
        ICMPV6_TIME_EXCEEDED => ReplyKind::TimeExceeded,
        ICMPV6_DEST_UNREACHABLE => ReplyKind::Unreachable,
        _ => return None,
    };

    let echo = if kind == ReplyKind::EchoReply {
        buf
    } else {
        let quoted = buf.get(8 + IPV6_HEADER_LEN..)?;
        if *quoted.first()? != ICMPV6_ECHO_REQUEST {
            return None;
        }
        quoted
    };

    echo_fields(kind, echo)
}

fn echo_fields(kind: ReplyKind, echo: &[u8]) -> Option<ParsedReply> {
    let header = echo.get(..8)?;
    Some(ParsedReply {
        kind,
        identifier: u16::from_be_bytes([header[4], header[5]]),
        sequence: u16::from_be_bytes([header[6], header[7]]),
    })
}
