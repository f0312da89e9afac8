//! HTTP GET probe implementation.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use super::{Probe, ProbeError, ProbeKind, ProbeRequest, RttStats, SampleResult};

/// HTTP GET probe. One request per cycle; the full body is read.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpGetProbe;

fn target_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

fn build_client(request: &ProbeRequest) -> Result<reqwest::Client, ProbeError> {
    let mut builder = reqwest::Client::builder()
        .timeout(request.timeout)
        .local_address(request.source);

    if let Some(proxy) = &request.proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| ProbeError::Config(format!("invalid proxy '{}': {}", proxy, e)))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))
}

#[async_trait]
impl Probe for HttpGetProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::HttpGet
    }

    async fn run(&self, request: &ProbeRequest) -> Result<SampleResult, ProbeError> {
        let url = target_url(&request.host);
        let client = build_client(request)?;

        let sampled_at = Utc::now();
        let start = Instant::now();

        let outcome = match client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                // Read the full body to measure complete transfer time
                response.bytes().await.map(|_| status)
            }
            Err(e) => Err(e),
        };
        let elapsed = start.elapsed();

        let (failed, status, rtt) = match outcome {
            Ok(status) => {
                let failed = u64::from(!status.is_success());
                (failed, Some(status.as_u16()), RttStats::from_samples(&[elapsed], 1))
            }
            Err(e) => {
                tracing::debug!(
                    url = %url,
                    timeout = e.is_timeout(),
                    error = %e,
                    "HTTP request failed"
                );
                (1, e.status().map(|s| s.as_u16()), None)
            }
        };

        Ok(SampleResult {
            sent: 1,
            failed,
            elapsed,
            rtt,
            status,
            sampled_at,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(host: &str) -> ProbeRequest {
        ProbeRequest {
            host: host.to_string(),
            address: None,
            source: None,
            proxy: None,
            count: 1,
            max_hops: 0,
            timeout: Duration::from_millis(100),
            identifier: None,
            ipv6: false,
        }
    }

    #[test]
    fn test_target_url_adds_scheme() {
        assert_eq!(target_url("example.com/health"), "http://example.com/health");
        assert_eq!(target_url("https://example.com"), "https://example.com");
    }

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let result = HttpGetProbe.run(&request("http://256.256.256.256")).await.unwrap();
        assert_eq!(result.sent, 1);
        assert_eq!(result.failed, 1);
        assert!(result.rtt.is_none());
    }

    #[tokio::test]
    async fn test_http_probe_rejects_bad_proxy() {
        let mut req = request("http://127.0.0.1");
        req.proxy = Some("not a proxy url".to_string());
        let err = HttpGetProbe.run(&req).await.unwrap_err();
        assert!(matches!(err, ProbeError::Config(_)));
    }
}
