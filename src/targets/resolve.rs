//! Resolution of a configuration file into a concrete target set.

use std::collections::HashSet;

use crate::probe::ProbeKind;

use super::{
    service_protocol, ConfigError, ConfigFile, GlobalProbeParams, RecordError, ResolvedConfig,
    ResolvedTarget, ServiceDiscovery, TargetSpec, SAMPLE_LIMIT,
};

/// Parse and resolve raw configuration bytes for the runner `hostname`.
///
/// Per-record problems (unknown type, SRV protocol mismatch, failed lookup)
/// drop that record and are reported in [`ResolvedConfig::rejected`].
/// Duplicates and out-of-range globals fail the whole resolution.
pub async fn resolve(
    raw: &[u8],
    hostname: &str,
    discovery: &dyn ServiceDiscovery,
) -> Result<ResolvedConfig, ConfigError> {
    let file = ConfigFile::parse(raw)?;
    resolve_file(file, hostname, discovery).await
}

/// Resolve an already parsed configuration file.
pub async fn resolve_file(
    file: ConfigFile,
    hostname: &str,
    discovery: &dyn ServiceDiscovery,
) -> Result<ResolvedConfig, ConfigError> {
    let mut targets = Vec::with_capacity(file.targets.len());
    let mut rejected = Vec::new();

    for spec in &file.targets {
        match expand(spec, discovery).await {
            Ok(expanded) => {
                for target in expanded {
                    if target.assigned_to(hostname) {
                        targets.push(target);
                    } else {
                        tracing::debug!(
                            target_name = %target.name,
                            runner = %hostname,
                            "Target not assigned to this runner"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Skipping target");
                rejected.push(e);
            }
        }
    }

    check_duplicates(&targets)?;
    check_globals(&file)?;

    tracing::info!(
        targets = targets.len(),
        rejected = rejected.len(),
        "Configuration resolved"
    );

    Ok(ResolvedConfig {
        conf: file.conf.clone(),
        params: GlobalProbeParams::from_sections(&file),
        targets,
        rejected,
    })
}

/// Expand one spec into concrete targets: one for a literal host, one per
/// discovered host for a service-discovery name.
async fn expand(
    spec: &TargetSpec,
    discovery: &dyn ServiceDiscovery,
) -> Result<Vec<ResolvedTarget>, RecordError> {
    let kinds = spec.kinds()?;

    if !discovery.is_service_name(&spec.host) {
        return Ok(vec![ResolvedTarget::from_spec(spec, kinds)]);
    }

    let is_tcp = kinds == [ProbeKind::Tcp];
    if is_tcp {
        let protocol = service_protocol(&spec.host).unwrap_or_default();
        if !protocol.eq_ignore_ascii_case("tcp") {
            return Err(RecordError::ProtocolMismatch {
                target: spec.name.clone(),
                probe_type: spec.probe_type.clone(),
                protocol: protocol.to_string(),
            });
        }
    }

    let hosts = discovery
        .lookup(&spec.host)
        .await
        .map_err(|source| RecordError::Discovery {
            target: spec.name.clone(),
            host: spec.host.clone(),
            source,
        })?;

    if hosts.is_empty() {
        tracing::warn!(target_name = %spec.name, host = %spec.host, "SRV record has no hosts");
    }

    Ok(hosts
        .into_iter()
        .map(|found| {
            let concrete = if is_tcp {
                format!("{}:{}", found.host, found.port)
            } else {
                found.host
            };
            let mut target = ResolvedTarget::from_spec(spec, kinds.clone());
            target.name = concrete.clone();
            target.host = concrete;
            target
        })
        .collect())
}

/// Reject a second target with the same name in any probe-kind namespace.
pub fn check_duplicates(targets: &[ResolvedTarget]) -> Result<(), ConfigError> {
    let mut seen: HashSet<(ProbeKind, &str)> = HashSet::new();

    for target in targets {
        for &kind in &target.kinds {
            if !seen.insert((kind, target.name.as_str())) {
                return Err(ConfigError::DuplicateTarget {
                    kind,
                    name: target.name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_globals(file: &ConfigFile) -> Result<(), ConfigError> {
    let intervals = [
        (ProbeKind::Icmp, file.icmp.interval),
        (ProbeKind::Mtr, file.mtr.interval),
        (ProbeKind::Tcp, file.tcp.interval),
        (ProbeKind::HttpGet, file.http_get.interval),
    ];
    if let Some((kind, _)) = intervals.iter().find(|(_, interval)| interval.is_zero()) {
        return Err(ConfigError::InvalidInterval(*kind));
    }

    let bounded = [
        ("icmp.count", file.icmp.count),
        ("mtr.max-hops", file.mtr.max_hops),
        ("mtr.count", file.mtr.count),
    ];
    for (field, value) in bounded {
        if !(0..=SAMPLE_LIMIT).contains(&value) {
            return Err(ConfigError::OutOfBounds {
                field,
                value,
                max: SAMPLE_LIMIT,
            });
        }
    }
    Ok(())
}
