//! MTR path probe.
//!
//! Walks the path hop by hop with increasing TTL, `count` rounds per cycle.
//! Needs a RAW ICMP socket: datagram sockets never see time-exceeded replies.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use super::icmp::{EchoSocket, ReplyKind};
use super::{
    target_address, HopStats, Probe, ProbeError, ProbeKind, ProbeRequest, RttStats, SampleResult,
};

/// Highest TTL an IP header can carry.
const MAX_TTL: u32 = 255;

/// MTR path-tracing probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct MtrProbe;

#[async_trait]
impl Probe for MtrProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Mtr
    }

    async fn run(&self, request: &ProbeRequest) -> Result<SampleResult, ProbeError> {
        let ip = target_address(request).await?;
        let request = request.clone();

        tokio::task::spawn_blocking(move || run_blocking_trace(ip, &request))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?
    }
}

#[derive(Debug)]
struct HopAccumulator {
    ttl: u32,
    address: Option<IpAddr>,
    sent: u64,
    rtts: Vec<Duration>,
}

impl HopAccumulator {
    fn new(ttl: u32) -> Self {
        Self {
            ttl,
            address: None,
            sent: 0,
            rtts: Vec::new(),
        }
    }

    fn finish(self) -> HopStats {
        HopStats {
            ttl: self.ttl,
            address: self.address,
            sent: self.sent,
            failed: self.sent - self.rtts.len() as u64,
            rtt: RttStats::from_samples(&self.rtts, self.sent),
        }
    }
}

fn run_blocking_trace(ip: IpAddr, request: &ProbeRequest) -> Result<SampleResult, ProbeError> {
    let sampled_at = Utc::now();
    let start = Instant::now();

    let socket = EchoSocket::open(ip, request.source)?;
    if !socket.is_raw() {
        return Err(ProbeError::Config(
            "path tracing needs a raw ICMP socket (CAP_NET_RAW)".to_string(),
        ));
    }

    let identifier = request.identifier.unwrap_or_else(rand::random);
    let max_hops = request.max_hops.clamp(1, MAX_TTL);

    let mut hops: Vec<HopAccumulator> = Vec::new();
    let mut destination: Vec<Duration> = Vec::new();
    let mut seq: u16 = 0;

    for _ in 0..request.count {
        for ttl in 1..=max_hops {
            socket.set_ttl(ttl)?;
            if hops.len() < ttl as usize {
                hops.push(HopAccumulator::new(ttl));
            }
            let hop = &mut hops[ttl as usize - 1];
            hop.sent += 1;

            let result = socket.ping(identifier, seq, request.timeout);
            seq = seq.wrapping_add(1);

            let reply = match result {
                Ok(reply) => reply,
                Err(ProbeError::Timeout(_)) => continue,
                Err(e) => {
                    // The round is lost; the hop and the destination count it as failed
                    tracing::debug!(host = %request.host, ttl, error = %e, "Trace round aborted");
                    break;
                }
            };
            hop.rtts.push(reply.rtt);
            if reply.from.is_some() {
                hop.address = reply.from;
            }

            match reply.kind {
                ReplyKind::EchoReply => {
                    destination.push(reply.rtt);
                    break;
                }
                ReplyKind::Unreachable => break,
                ReplyKind::TimeExceeded => {}
            }
        }
    }

    let sent = request.count as u64;
    Ok(SampleResult {
        sent,
        failed: sent - destination.len() as u64,
        elapsed: start.elapsed(),
        rtt: RttStats::from_samples(&destination, sent),
        hops: hops.into_iter().map(HopAccumulator::finish).collect(),
        sampled_at,
        ..Default::default()
    })
}
