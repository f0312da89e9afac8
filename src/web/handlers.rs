//! HTTP request handlers.

use super::AppState;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// Live schedulers that have produced at least one sample.
pub async fn handle_get_targets(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.snapshot().await)
}

/// The resolved configuration in force, including rejected records.
pub async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.current())
}

/// Re-read the target file and reconcile the running set.
pub async fn handle_reload(State(state): State<AppState>) -> impl IntoResponse {
    match state.registry.reload(&state.store).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Reload rejected");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

pub async fn handle_health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::probe::{IcmpIdAllocator, Probe, ProbeError, ProbeKind, ProbeRequest, SampleResult};
    use crate::scheduler::{ProbeSet, Registry};
    use crate::targets::{ConfigStore, DiscoveryError, ServiceDiscovery, ServiceHost};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoDiscovery;

    #[async_trait]
    impl ServiceDiscovery for NoDiscovery {
        async fn lookup(&self, name: &str) -> Result<Vec<ServiceHost>, DiscoveryError> {
            Err(DiscoveryError::Lookup(name.to_string()))
        }
    }

    struct IdleProbe;

    #[async_trait]
    impl Probe for IdleProbe {
        fn kind(&self) -> ProbeKind {
            ProbeKind::Icmp
        }

        async fn run(&self, _request: &ProbeRequest) -> Result<SampleResult, ProbeError> {
            Ok(SampleResult::default())
        }
    }

    async fn state(file: &tempfile::NamedTempFile) -> AppState {
        let store = ConfigStore::open(file.path(), "runner", Arc::new(NoDiscovery))
            .await
            .unwrap();
        let probe: Arc<dyn Probe> = Arc::new(IdleProbe);
        let probes = ProbeSet {
            icmp: probe.clone(),
            mtr: probe.clone(),
            tcp: probe.clone(),
            http_get: probe,
        };
        let registry = Registry::new(probes, Arc::new(IcmpIdAllocator::new()), false);
        AppState {
            config: ServerConfig::default(),
            store: Arc::new(store),
            registry: Arc::new(registry),
        }
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_reload_reports_config_errors() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            "icmp:\n  interval: 1h\ntargets:\n  - name: a\n    host: 10.0.0.1\n    type: ICMP\n",
        )
        .unwrap();
        let state = state(&file).await;

        let response = handle_reload(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_string(response).await.contains("\"started\":1"));

        std::fs::write(file.path(), "targets: [").unwrap();
        let response = handle_reload(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Previous configuration is still served
        let response = handle_get_config(State(state.clone())).await.into_response();
        let body = body_string(response).await;
        assert!(body.contains("\"name\":\"a\""));

        // No sample yet with a one-hour interval
        let response = handle_get_targets(State(state.clone())).await.into_response();
        assert_eq!(body_string(response).await, "[]");

        state.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_health() {
        assert_eq!(handle_health().await, "ok");
    }
}
