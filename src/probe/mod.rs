//! Probe module for network reachability sampling.
//!
//! Supports ICMP echo, MTR path tracing, TCP connect and HTTP GET probes.
//! Every probe kind implements [`Probe`], so the scheduler runs all of them
//! through the same sampling loop.

mod http;
mod icmp;
mod ident;
mod mtr;
mod ping;
mod tcp;

pub use http::*;
pub use ident::*;
pub use mtr::*;
pub use ping::*;
pub use tcp::*;

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("address resolution failed: {0}")]
    Resolve(String),
}

/// The four probe families. `ICMP+MTR` targets carry both tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ProbeKind {
    #[serde(rename = "ICMP")]
    Icmp,
    #[serde(rename = "MTR")]
    Mtr,
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "HTTPGet")]
    HttpGet,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 4] = [Self::Icmp, Self::Mtr, Self::Tcp, Self::HttpGet];

    /// Whether exchanges of this kind are tagged with an ICMP identifier.
    pub fn needs_identifier(self) -> bool {
        matches!(self, Self::Icmp | Self::Mtr)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Icmp => "ICMP",
            Self::Mtr => "MTR",
            Self::Tcp => "TCP",
            Self::HttpGet => "HTTPGet",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a probe needs for one sampling cycle.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub host: String,
    pub address: Option<IpAddr>,
    pub source: Option<IpAddr>,
    pub proxy: Option<String>,
    pub count: usize,
    pub max_hops: u32,
    pub timeout: Duration,
    pub identifier: Option<u16>,
    pub ipv6: bool,
}

/// Round-trip statistics over the replies of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RttStats {
    #[serde(with = "humantime_serde")]
    pub best: Duration,
    #[serde(with = "humantime_serde")]
    pub worst: Duration,
    #[serde(with = "humantime_serde")]
    pub mean: Duration,
    #[serde(with = "humantime_serde")]
    pub stddev: Duration,
    #[serde(with = "humantime_serde")]
    pub last: Duration,
    /// Fraction of sent samples without a reply, in [0, 1].
    pub loss: f64,
}

impl RttStats {
    /// Build statistics from the replies received out of `sent` attempts.
    ///
    /// Returns `None` when nothing answered.
    pub fn from_samples(samples: &[Duration], sent: u64) -> Option<Self> {
        let last = *samples.last()?;
        let best = samples.iter().copied().min()?;
        let worst = samples.iter().copied().max()?;

        let n = samples.len() as f64;
        let secs: Vec<f64> = samples.iter().map(Duration::as_secs_f64).collect();
        let mean = secs.iter().sum::<f64>() / n;
        let variance = secs.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;

        let received = samples.len() as u64;
        let loss = if sent == 0 {
            0.0
        } else {
            sent.saturating_sub(received) as f64 / sent as f64
        };

        Some(Self {
            best,
            worst,
            mean: Duration::from_secs_f64(mean),
            stddev: Duration::from_secs_f64(variance.sqrt()),
            last,
            loss,
        })
    }
}

/// Statistics for a single hop of a traced path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HopStats {
    pub ttl: u32,
    pub address: Option<IpAddr>,
    pub sent: u64,
    pub failed: u64,
    pub rtt: Option<RttStats>,
}

/// The windowed outcome of one sampling cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SampleResult {
    pub sent: u64,
    pub failed: u64,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub rtt: Option<RttStats>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hops: Vec<HopStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub sampled_at: DateTime<Utc>,
}

/// A probe implementation for one [`ProbeKind`].
///
/// Unreachable targets are observations, not errors: implementations report
/// them through `failed` counts and return `Err` only when the cycle could not
/// be attempted at all.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    fn kind(&self) -> ProbeKind;

    async fn run(&self, request: &ProbeRequest) -> Result<SampleResult, ProbeError>;
}

/// Resolve hostname to IP address, preferring the requested family.
pub async fn resolve_address(address: &str, prefer_ipv6: bool) -> Result<IpAddr, ProbeError> {
    // Try direct parse first
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<IpAddr> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Resolve(format!("{}: {}", address, e)))?
        .map(|sa| sa.ip())
        .collect();

    addrs
        .iter()
        .find(|ip| ip.is_ipv6() == prefer_ipv6)
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ProbeError::Resolve(format!("no addresses found for {}", address)))
}

/// Turns a target host into the address a scheduler probes.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, host: &str, prefer_ipv6: bool) -> Result<IpAddr, ProbeError>;
}

/// Resolution through the system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl AddressResolver for SystemResolver {
    async fn resolve(&self, host: &str, prefer_ipv6: bool) -> Result<IpAddr, ProbeError> {
        resolve_address(host, prefer_ipv6).await
    }
}

/// Use the pre-resolved address when present, otherwise resolve the host.
pub(crate) async fn target_address(request: &ProbeRequest) -> Result<IpAddr, ProbeError> {
    match request.address {
        Some(ip) => Ok(ip),
        None => resolve_address(&request.host, request.ipv6).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_stats_from_samples() {
        let samples = [
            Duration::from_millis(10),
            Duration::from_millis(30),
            Duration::from_millis(20),
        ];
        let stats = RttStats::from_samples(&samples, 4).unwrap();
        assert_eq!(stats.best, Duration::from_millis(10));
        assert_eq!(stats.worst, Duration::from_millis(30));
        assert_eq!(stats.last, Duration::from_millis(20));
        assert!((stats.mean.as_secs_f64() - 0.020).abs() < 1e-9);
        assert!((stats.loss - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rtt_stats_empty() {
        assert!(RttStats::from_samples(&[], 5).is_none());
    }

    #[test]
    fn test_identifier_kinds() {
        assert!(ProbeKind::Icmp.needs_identifier());
        assert!(ProbeKind::Mtr.needs_identifier());
        assert!(!ProbeKind::Tcp.needs_identifier());
        assert!(!ProbeKind::HttpGet.needs_identifier());
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let ip = resolve_address("127.0.0.1", true).await.unwrap();
        assert_eq!(ip, IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    }
}
