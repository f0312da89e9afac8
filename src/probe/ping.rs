//! ICMP echo probe.
//!
//! Sends `count` echo requests per cycle over a native ICMP socket and reports
//! round-trip statistics and loss.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use super::icmp::{EchoSocket, ReplyKind};
use super::{target_address, Probe, ProbeError, ProbeKind, ProbeRequest, RttStats, SampleResult};

/// ICMP echo probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingProbe;

#[async_trait]
impl Probe for PingProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Icmp
    }

    async fn run(&self, request: &ProbeRequest) -> Result<SampleResult, ProbeError> {
        // Resolve address before spawn_blocking (DNS is async)
        let ip = target_address(request).await?;
        let request = request.clone();

        tokio::task::spawn_blocking(move || run_blocking_ping(ip, &request))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?
    }
}

fn run_blocking_ping(ip: IpAddr, request: &ProbeRequest) -> Result<SampleResult, ProbeError> {
    let sampled_at = Utc::now();
    let start = Instant::now();

    let socket = EchoSocket::open(ip, request.source)?;
    let identifier = request.identifier.unwrap_or_else(rand::random);

    let mut rtts: Vec<Duration> = Vec::new();
    let mut failed = 0u64;

    for seq in 0..request.count {
        match socket.ping(identifier, seq as u16, request.timeout) {
            Ok(reply) if reply.kind == ReplyKind::EchoReply => rtts.push(reply.rtt),
            Ok(reply) => {
                tracing::debug!(
                    host = %request.host,
                    from = ?reply.from,
                    kind = ?reply.kind,
                    "Echo answered with an error"
                );
                failed += 1;
            }
            Err(ProbeError::Timeout(_)) => failed += 1,
            Err(e) => {
                tracing::debug!(host = %request.host, seq, error = %e, "Echo failed");
                failed += 1;
            }
        }
    }

    let sent = request.count as u64;
    Ok(SampleResult {
        sent,
        failed,
        elapsed: start.elapsed(),
        rtt: RttStats::from_samples(&rtts, sent),
        sampled_at,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(host: &str, count: usize) -> ProbeRequest {
        ProbeRequest {
            host: host.to_string(),
            address: host.parse().ok(),
            source: None,
            proxy: None,
            count,
            max_hops: 0,
            timeout: Duration::from_millis(100),
            identifier: Some(7),
            ipv6: false,
        }
    }

    #[tokio::test]
    async fn test_undeliverable_echoes_count_as_failed() {
        // Sends to a broadcast address are refused or go unanswered
        let result = PingProbe.run(&request("192.0.2.255", 6)).await;
        let sample = match result {
            Ok(sample) => sample,
            // No ICMP socket available in this environment
            Err(ProbeError::Network(msg)) if msg.contains("ICMP socket") => return,
            Err(e) => panic!("cycle should report partial counts, got {}", e),
        };

        assert_eq!(sample.sent, 6);
        assert_eq!(sample.failed, 6);
        assert!(sample.rtt.is_none());
    }
}
