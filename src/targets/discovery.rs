//! Service-discovery (DNS SRV) expansion of target hosts.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("resolver setup failed: {0}")]
    Setup(String),
    #[error("lookup failed: {0}")]
    Lookup(String),
}

/// One host advertised by an SRV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHost {
    pub host: String,
    pub port: u16,
}

fn service_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^_[^._]+[^.]*\._([A-Za-z]+)\.[^.]+.*$").unwrap())
}

/// Whether `host` looks like `_service._proto.domain`.
pub fn is_service_name(host: &str) -> bool {
    service_name_regex().is_match(host)
}

/// The `_proto` label of a service name, without the underscore.
pub fn service_protocol(host: &str) -> Option<&str> {
    service_name_regex()
        .captures(host)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Resolves service-discovery names into concrete hosts.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    fn is_service_name(&self, host: &str) -> bool {
        is_service_name(host)
    }

    async fn lookup(&self, name: &str) -> Result<Vec<ServiceHost>, DiscoveryError>;
}

/// SRV lookups through hickory, against the system or a configured nameserver.
pub struct SrvDiscovery {
    resolver: TokioResolver,
}

impl SrvDiscovery {
    pub fn new(nameserver: Option<SocketAddr>, timeout: Duration) -> Result<Self, DiscoveryError> {
        let mut builder = match nameserver {
            Some(addr) => {
                let group = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
                TokioResolver::builder_with_config(
                    ResolverConfig::from_parts(None, vec![], group),
                    TokioConnectionProvider::default(),
                )
            }
            None => TokioResolver::builder_tokio()
                .map_err(|e| DiscoveryError::Setup(e.to_string()))?,
        };
        builder.options_mut().timeout = timeout;

        tracing::info!(nameserver = ?nameserver, timeout = ?timeout, "SRV discovery ready");
        Ok(Self {
            resolver: builder.build(),
        })
    }
}

#[async_trait]
impl ServiceDiscovery for SrvDiscovery {
    async fn lookup(&self, name: &str) -> Result<Vec<ServiceHost>, DiscoveryError> {
        let lookup = self
            .resolver
            .srv_lookup(name)
            .await
            .map_err(|e| DiscoveryError::Lookup(e.to_string()))?;

        Ok(lookup
            .iter()
            .map(|srv| ServiceHost {
                host: srv.target().to_utf8().trim_end_matches('.').to_string(),
                port: srv.port(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_service_name() {
        assert!(is_service_name("_http._tcp.example.com"));
        assert!(is_service_name("_ldap._udp.dc.example.org."));
        assert!(!is_service_name("example.com"));
        assert!(!is_service_name("10.0.0.1"));
        assert!(!is_service_name("_http.example.com"));
        assert!(!is_service_name("_http._tcp"));
    }

    #[test]
    fn test_service_protocol() {
        assert_eq!(service_protocol("_http._tcp.example.com"), Some("tcp"));
        assert_eq!(service_protocol("_sip._UDP.example.com"), Some("UDP"));
        assert_eq!(service_protocol("example.com"), None);
    }
}
