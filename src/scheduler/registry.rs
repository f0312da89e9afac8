//! Owns the live schedulers and diffs them against each resolved configuration.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use super::{CumulativeResult, Scheduler, SchedulerConfig, TargetIdentity};
use crate::probe::{
    split_host_port, AddressResolver, HttpGetProbe, IdentifierSource, MtrProbe, PingProbe, Probe,
    ProbeError, ProbeKind, SystemResolver, TcpProbe,
};
use crate::targets::{ConfigError, ConfigStore, ProbeParams, ResolvedConfig, ResolvedTarget};

/// One probe implementation per kind.
#[derive(Clone)]
pub struct ProbeSet {
    pub icmp: Arc<dyn Probe>,
    pub mtr: Arc<dyn Probe>,
    pub tcp: Arc<dyn Probe>,
    pub http_get: Arc<dyn Probe>,
}

impl ProbeSet {
    /// The socket-backed probes used in production.
    pub fn native() -> Self {
        Self {
            icmp: Arc::new(PingProbe),
            mtr: Arc::new(MtrProbe),
            tcp: Arc::new(TcpProbe),
            http_get: Arc::new(HttpGetProbe),
        }
    }

    pub fn get(&self, kind: ProbeKind) -> Arc<dyn Probe> {
        match kind {
            ProbeKind::Icmp => self.icmp.clone(),
            ProbeKind::Mtr => self.mtr.clone(),
            ProbeKind::Tcp => self.tcp.clone(),
            ProbeKind::HttpGet => self.http_get.clone(),
        }
    }
}

/// Counts from one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub started: usize,
    pub restarted: usize,
    pub stopped: usize,
    pub kept: usize,
    pub skipped: usize,
}

/// Public view of one scheduler that has produced data.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub kind: ProbeKind,
    pub name: String,
    pub host: String,
    pub address: Option<IpAddr>,
    pub labels: BTreeMap<String, String>,
    pub result: CumulativeResult,
}

type SchedulerKey = (ProbeKind, String);

/// Configured settings that force a restart when they change.
///
/// The resolved address is left out so round-robin DNS does not reset counters.
#[derive(Debug, Clone, PartialEq)]
struct Fingerprint {
    host: String,
    params: ProbeParams,
    source: Option<IpAddr>,
    proxy: Option<String>,
    labels: BTreeMap<String, String>,
}

impl Fingerprint {
    fn new(target: &ResolvedTarget, params: &ProbeParams) -> Self {
        Self {
            host: target.host.clone(),
            params: params.clone(),
            source: target.source_ip,
            proxy: target.proxy.clone(),
            labels: target.labels.clone(),
        }
    }
}

struct Running {
    scheduler: Scheduler,
    fingerprint: Fingerprint,
}

/// A scheduler that has to be started, waiting on its address lookup.
struct Pending {
    key: SchedulerKey,
    fingerprint: Fingerprint,
    params: Arc<ProbeParams>,
    address: Result<Option<IpAddr>, ProbeError>,
}

/// The set of live schedulers, keyed by (kind, name).
pub struct Registry {
    probes: ProbeSet,
    ids: Arc<dyn IdentifierSource>,
    resolver: Arc<dyn AddressResolver>,
    prefer_ipv6: bool,
    startup_jitter: bool,
    running: Mutex<HashMap<SchedulerKey, Running>>,
    // One reload or reconcile at a time, end to end
    reconciling: Mutex<()>,
}

impl Registry {
    pub fn new(probes: ProbeSet, ids: Arc<dyn IdentifierSource>, prefer_ipv6: bool) -> Self {
        Self {
            probes,
            ids,
            resolver: Arc::new(SystemResolver),
            prefer_ipv6,
            startup_jitter: true,
            running: Mutex::new(HashMap::new()),
            reconciling: Mutex::new(()),
        }
    }

    /// Start every new scheduler on its first tick instead of a random offset.
    pub fn without_startup_jitter(mut self) -> Self {
        self.startup_jitter = false;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Bring the live set in line with `config`.
    pub async fn reconcile(&self, config: &ResolvedConfig) -> ReconcileSummary {
        let _guard = self.reconciling.lock().await;
        self.apply(config).await
    }

    /// Reload the store and reconcile on success.
    ///
    /// Reloads run one after another, so the configuration read last is the
    /// one left in force. A failed reload leaves both the configuration and
    /// the running set as they were.
    pub async fn reload(&self, store: &ConfigStore) -> Result<ReconcileSummary, ConfigError> {
        let _guard = self.reconciling.lock().await;
        let config = store.reload().await?;
        Ok(self.apply(&config).await)
    }

    /// Stop every scheduler.
    pub async fn shutdown(&self) {
        let _guard = self.reconciling.lock().await;
        let retired: Vec<Running> = self.running.lock().await.drain().map(|(_, r)| r).collect();
        let count = retired.len();
        for entry in retired {
            entry.scheduler.stop().await;
        }
        tracing::info!(count, "All schedulers stopped");
    }

    /// Schedulers that have merged at least one cycle, ordered by name then kind.
    pub async fn snapshot(&self) -> Vec<TargetStatus> {
        let running = self.running.lock().await;
        let mut out: Vec<TargetStatus> = running
            .values()
            .filter_map(|entry| {
                let s = &entry.scheduler;
                s.compute().map(|result| TargetStatus {
                    kind: s.kind(),
                    name: s.name().to_string(),
                    host: s.host().to_string(),
                    address: s.resolved_address(),
                    labels: s.labels().clone(),
                    result,
                })
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.kind.cmp(&b.kind)));
        out
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Diff, resolve, then swap. The `running` lock is only held for the
    /// diff and the swap, never across address lookups or `stop()`.
    async fn apply(&self, config: &ResolvedConfig) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        let desired: Vec<(SchedulerKey, &ResolvedTarget, Arc<ProbeParams>)> = config
            .targets
            .iter()
            .flat_map(|t| {
                t.kinds
                    .iter()
                    .map(move |&k| ((k, t.name.clone()), t, config.params.for_kind(k).clone()))
            })
            .collect();
        let wanted: HashSet<&SchedulerKey> = desired.iter().map(|(key, _, _)| key).collect();

        let (gone, changed) = {
            let running = self.running.lock().await;
            let gone: Vec<SchedulerKey> = running
                .keys()
                .filter(|key| !wanted.contains(key))
                .cloned()
                .collect();
            let mut changed = Vec::new();
            for (key, target, params) in &desired {
                let fingerprint = Fingerprint::new(target, params);
                match running.get(key) {
                    Some(current) if current.fingerprint == fingerprint => summary.kept += 1,
                    _ => changed.push((
                        key.clone(),
                        target.host.clone(),
                        fingerprint,
                        params.clone(),
                    )),
                }
            }
            (gone, changed)
        };

        let pending = self.resolve_all(changed).await;

        let mut retired = Vec::new();
        {
            let mut running = self.running.lock().await;
            for key in gone {
                if let Some(old) = running.remove(&key) {
                    retired.push(old);
                    summary.stopped += 1;
                }
            }

            for p in pending {
                let (kind, name) = (p.key.0, p.key.1.clone());
                let address = match p.address {
                    Ok(address) => address,
                    Err(e) => {
                        tracing::error!(kind = %kind, name = %name, error = %e, "Skipping target");
                        if running.contains_key(&p.key) {
                            summary.kept += 1;
                        } else {
                            summary.skipped += 1;
                        }
                        continue;
                    }
                };

                let scheduler = Scheduler::start(
                    SchedulerConfig {
                        identity: TargetIdentity {
                            kind,
                            name,
                            host: p.fingerprint.host.clone(),
                            address,
                            ipv6: address.map_or(self.prefer_ipv6, |ip| ip.is_ipv6()),
                        },
                        params: p.params.clone(),
                        source: p.fingerprint.source,
                        proxy: p.fingerprint.proxy.clone(),
                        labels: p.fingerprint.labels.clone(),
                        startup_jitter: self.jitter(p.params.interval),
                    },
                    self.probes.get(kind),
                    self.ids.clone(),
                );

                let replaced = running.insert(
                    p.key,
                    Running {
                        scheduler,
                        fingerprint: p.fingerprint,
                    },
                );
                match replaced {
                    Some(old) => {
                        retired.push(old);
                        summary.restarted += 1;
                    }
                    None => summary.started += 1,
                }
            }
        }

        for old in retired {
            old.scheduler.stop().await;
        }

        tracing::info!(
            started = summary.started,
            restarted = summary.restarted,
            stopped = summary.stopped,
            kept = summary.kept,
            skipped = summary.skipped,
            "Schedulers reconciled"
        );
        summary
    }

    /// Look up the addresses of every scheduler about to start, concurrently.
    async fn resolve_all(
        &self,
        changed: Vec<(SchedulerKey, String, Fingerprint, Arc<ProbeParams>)>,
    ) -> Vec<Pending> {
        let mut lookups = JoinSet::new();
        for (index, (key, host, _, _)) in changed.iter().enumerate() {
            let kind = key.0;
            let host = host.clone();
            let resolver = self.resolver.clone();
            let prefer_ipv6 = self.prefer_ipv6;
            lookups.spawn(async move {
                (index, lookup_address(resolver.as_ref(), kind, &host, prefer_ipv6).await)
            });
        }

        let mut addresses: Vec<Option<Result<Option<IpAddr>, ProbeError>>> =
            (0..changed.len()).map(|_| None).collect();
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok((index, address)) => addresses[index] = Some(address),
                Err(e) => tracing::error!(error = %e, "Address lookup task failed"),
            }
        }

        changed
            .into_iter()
            .zip(addresses)
            .map(|((key, _, fingerprint, params), address)| Pending {
                key,
                fingerprint,
                params,
                address: address
                    .unwrap_or_else(|| Err(ProbeError::Resolve("lookup did not complete".into()))),
            })
            .collect()
    }

    fn jitter(&self, interval: Duration) -> Duration {
        if !self.startup_jitter || interval.is_zero() {
            return Duration::ZERO;
        }
        rand::thread_rng().gen_range(Duration::ZERO..interval)
    }
}

/// The address a scheduler of `kind` probes for `host`, if it needs one.
async fn lookup_address(
    resolver: &dyn AddressResolver,
    kind: ProbeKind,
    host: &str,
    prefer_ipv6: bool,
) -> Result<Option<IpAddr>, ProbeError> {
    match kind {
        ProbeKind::Icmp | ProbeKind::Mtr => Ok(Some(resolver.resolve(host, prefer_ipv6).await?)),
        ProbeKind::Tcp => {
            let (host, _) = split_host_port(host)?;
            Ok(Some(resolver.resolve(host, prefer_ipv6).await?))
        }
        // The client resolves the URL host itself
        ProbeKind::HttpGet => Ok(None),
    }
}
