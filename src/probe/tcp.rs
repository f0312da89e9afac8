//! TCP connect probe.
//!
//! Measures TCP handshake latency to `host:port`.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::net::TcpSocket;
use tokio::time::timeout;

use super::{target_address, Probe, ProbeError, ProbeKind, ProbeRequest, RttStats, SampleResult};

/// TCP connect probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

/// Split `host:port`, accepting bracketed IPv6 literals.
pub fn split_host_port(target: &str) -> Result<(&str, u16), ProbeError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| ProbeError::Config(format!("missing port in '{}'", target)))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| ProbeError::Config(format!("invalid port in '{}': {}", target, e)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host, port))
}

#[async_trait]
impl Probe for TcpProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Tcp
    }

    async fn run(&self, request: &ProbeRequest) -> Result<SampleResult, ProbeError> {
        let (host, port) = split_host_port(&request.host)?;
        let ip = match request.address {
            Some(ip) => ip,
            None => {
                let lookup = ProbeRequest {
                    host: host.to_string(),
                    ..request.clone()
                };
                target_address(&lookup).await?
            }
        };
        let addr = SocketAddr::new(ip, port);

        let sampled_at = Utc::now();
        let start = Instant::now();
        let count = request.count.max(1);
        let mut rtts: Vec<Duration> = Vec::with_capacity(count);
        let mut failed = 0u64;

        for _ in 0..count {
            match connect_once(addr, request.source, request.timeout).await {
                Ok(rtt) => rtts.push(rtt),
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "TCP connect failed");
                    failed += 1;
                }
            }
        }

        let sent = count as u64;
        Ok(SampleResult {
            sent,
            failed,
            elapsed: start.elapsed(),
            rtt: RttStats::from_samples(&rtts, sent),
            sampled_at,
            ..Default::default()
        })
    }
}

async fn connect_once(
    addr: SocketAddr,
    source: Option<IpAddr>,
    limit: Duration,
) -> Result<Duration, ProbeError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| ProbeError::Network(format!("failed to create socket: {}", e)))?;

    if let Some(src) = source {
        socket
            .bind(SocketAddr::new(src, 0))
            .map_err(|e| ProbeError::Network(format!("failed to bind {}: {}", src, e)))?;
    }

    let start = Instant::now();
    match timeout(limit, socket.connect(addr)).await {
        Ok(Ok(_stream)) => Ok(start.elapsed()),
        Ok(Err(e)) => Err(ProbeError::Network(e.to_string())),
        Err(_) => Err(ProbeError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn request(host: String) -> ProbeRequest {
        ProbeRequest {
            host,
            address: None,
            source: None,
            proxy: None,
            count: 2,
            max_hops: 0,
            timeout: Duration::from_secs(1),
            identifier: None,
            ipv6: false,
        }
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("db.local:5432").unwrap(), ("db.local", 5432));
        assert_eq!(split_host_port("[::1]:80").unwrap(), ("::1", 80));
        assert!(split_host_port("db.local").is_err());
        assert!(split_host_port("db.local:http").is_err());
    }

    #[tokio::test]
    async fn test_tcp_probe_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((_stream, _)) = listener.accept().await {}
        });

        let result = TcpProbe.run(&request(addr.to_string())).await.unwrap();
        assert_eq!(result.sent, 2);
        assert_eq!(result.failed, 0);
        assert!(result.rtt.is_some());
    }

    #[tokio::test]
    async fn test_tcp_probe_counts_refused_connections() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let result = TcpProbe.run(&request(addr.to_string())).await.unwrap();
        assert_eq!(result.sent, 2);
        assert_eq!(result.failed, 2);
        assert!(result.rtt.is_none());
    }
}
