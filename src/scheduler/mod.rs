//! Scheduler module for running probes and aggregating their results.
//!
//! One [`Scheduler`] samples one target with one probe kind. The [`Registry`]
//! owns the live schedulers and reconciles them against each resolved
//! configuration.

mod registry;

pub use registry::*;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::probe::{IdentifierSource, Probe, ProbeKind, ProbeRequest, SampleResult};
use crate::targets::ProbeParams;

/// Probe executions allowed in flight per scheduler.
pub const MAX_CONCURRENT_PROBES: usize = 3;

/// Stable identity of a scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetIdentity {
    pub kind: ProbeKind,
    pub name: String,
    pub host: String,
    pub address: Option<IpAddr>,
    pub ipv6: bool,
}

/// Everything needed to start a scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub identity: TargetIdentity,
    pub params: Arc<ProbeParams>,
    pub source: Option<IpAddr>,
    pub proxy: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub startup_jitter: Duration,
}

/// The latest cycle plus counters accumulated over the scheduler's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CumulativeResult {
    pub latest: SampleResult,
    pub cycles: u64,
    pub total_sent: u64,
    pub total_failed: u64,
    #[serde(with = "humantime_serde")]
    pub total_elapsed: Duration,
}

impl CumulativeResult {
    /// Fold a new windowed sample onto the previous totals.
    pub fn merge(previous: Option<&CumulativeResult>, sample: SampleResult) -> Self {
        let (cycles, sent, failed, elapsed) = previous
            .map(|p| (p.cycles, p.total_sent, p.total_failed, p.total_elapsed))
            .unwrap_or_default();

        Self {
            cycles: cycles + 1,
            total_sent: sent + sample.sent,
            total_failed: failed + sample.failed,
            total_elapsed: elapsed + sample.elapsed,
            latest: sample,
        }
    }
}

#[derive(Debug, Default)]
struct ResultState {
    result: Option<CumulativeResult>,
    stopped: bool,
}

/// Everything a single sampling cycle needs, cloned into each execution.
#[derive(Clone)]
struct Sampler {
    request: ProbeRequest,
    kind: ProbeKind,
    probe: Arc<dyn Probe>,
    ids: Arc<dyn IdentifierSource>,
    state: Arc<RwLock<ResultState>>,
}

impl Sampler {
    async fn sample(self) {
        let mut request = self.request;
        if self.kind.needs_identifier() {
            request.identifier = Some(self.ids.next_id());
        }

        let sample = match self.probe.run(&request).await {
            Ok(sample) => sample,
            Err(e) => {
                tracing::error!(error = %e, "Probe failed");
                return;
            }
        };

        let mut state = self.state.write();
        if state.stopped {
            // Late result from an execution that outlived stop()
            return;
        }
        let merged = CumulativeResult::merge(state.result.as_ref(), sample);
        tracing::debug!(
            sent = merged.latest.sent,
            failed = merged.latest.failed,
            total_sent = merged.total_sent,
            total_failed = merged.total_failed,
            "Probe cycle merged"
        );
        state.result = Some(merged);
    }
}

/// Background sampling loop for one target and probe kind.
pub struct Scheduler {
    identity: TargetIdentity,
    labels: BTreeMap<String, String>,
    state: Arc<RwLock<ResultState>>,
    stop_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the sampling loop and return immediately.
    pub fn start(
        config: SchedulerConfig,
        probe: Arc<dyn Probe>,
        ids: Arc<dyn IdentifierSource>,
    ) -> Self {
        let SchedulerConfig {
            identity,
            params,
            source,
            proxy,
            labels,
            startup_jitter,
        } = config;

        let state = Arc::new(RwLock::new(ResultState::default()));
        let (stop_tx, stop_rx) = broadcast::channel(1);

        let sampler = Sampler {
            request: ProbeRequest {
                host: identity.host.clone(),
                address: identity.address,
                source,
                proxy,
                count: params.count,
                max_hops: params.max_hops,
                timeout: params.timeout,
                identifier: None,
                ipv6: identity.ipv6,
            },
            kind: identity.kind,
            probe,
            ids,
            state: state.clone(),
        };

        let span = tracing::info_span!("probe", kind = %identity.kind, name = %identity.name);
        tracing::info!(
            parent: &span,
            host = %identity.host,
            interval = ?params.interval,
            jitter = ?startup_jitter,
            "Scheduler starting"
        );
        let handle = tokio::spawn(
            run_probe_loop(sampler, params.interval, startup_jitter, stop_rx).instrument(span),
        );

        Self {
            identity,
            labels,
            state,
            stop_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the loop and wait for it to exit.
    ///
    /// Executions already past the gate keep running detached, but their
    /// results are discarded. Calling this twice is harmless.
    pub async fn stop(&self) {
        self.state.write().stopped = true;
        let _ = self.stop_tx.send(());

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(
                    name = %self.identity.name,
                    error = %e,
                    "Scheduler loop ended abnormally"
                );
            }
            tracing::info!(
                kind = %self.identity.kind,
                name = %self.identity.name,
                "Scheduler stopped"
            );
        }
    }

    /// Snapshot of the cumulative result; `None` until the first merge.
    pub fn compute(&self) -> Option<CumulativeResult> {
        self.state.read().result.clone()
    }

    pub fn kind(&self) -> ProbeKind {
        self.identity.kind
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn host(&self) -> &str {
        &self.identity.host
    }

    pub fn resolved_address(&self) -> Option<IpAddr> {
        self.identity.address
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }
}

/// Run the sampling loop for a single target.
async fn run_probe_loop(
    sampler: Sampler,
    interval: Duration,
    startup_jitter: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    if !startup_jitter.is_zero() {
        tokio::select! {
            _ = stop_rx.recv() => return,
            _ = tokio::time::sleep(startup_jitter) => {}
        }
    }

    let gate = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                // Wait for a free slot; a full gate slows the cadence down
                let permit = tokio::select! {
                    _ = stop_rx.recv() => break,
                    permit = gate.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                };

                let sampler = sampler.clone();
                tokio::spawn(
                    async move {
                        let _permit = permit; // Hold permit until done
                        sampler.sample().await;
                    }
                    .in_current_span(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{IcmpIdAllocator, ProbeError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe that reports `count` successful samples after an optional delay.
    struct FakeProbe {
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail: bool,
    }

    impl FakeProbe {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                ..Arc::into_inner(Self::new(Duration::ZERO)).unwrap()
            })
        }
    }

    #[async_trait]
    impl Probe for FakeProbe {
        fn kind(&self) -> ProbeKind {
            ProbeKind::Icmp
        }

        async fn run(&self, request: &ProbeRequest) -> Result<SampleResult, ProbeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(ProbeError::Network("unreachable".into()));
            }
            assert!(request.identifier.is_some());
            Ok(SampleResult {
                sent: request.count as u64,
                failed: 1,
                elapsed: Duration::from_millis(1),
                ..Default::default()
            })
        }
    }

    fn config(interval: Duration) -> SchedulerConfig {
        SchedulerConfig {
            identity: TargetIdentity {
                kind: ProbeKind::Icmp,
                name: "db1".into(),
                host: "10.0.0.5".into(),
                address: Some("10.0.0.5".parse().unwrap()),
                ipv6: false,
            },
            params: Arc::new(ProbeParams {
                interval,
                timeout: Duration::from_secs(1),
                count: 4,
                max_hops: 0,
            }),
            source: None,
            proxy: None,
            labels: BTreeMap::from([("site".to_string(), "lab".to_string())]),
            startup_jitter: Duration::ZERO,
        }
    }

    fn ids() -> Arc<dyn IdentifierSource> {
        Arc::new(IcmpIdAllocator::new())
    }

    #[test]
    fn test_merge_accumulates_counters() {
        let first = CumulativeResult::merge(
            None,
            SampleResult {
                sent: 10,
                failed: 2,
                elapsed: Duration::from_secs(1),
                ..Default::default()
            },
        );
        let second = CumulativeResult::merge(
            Some(&first),
            SampleResult {
                sent: 10,
                failed: 0,
                elapsed: Duration::from_secs(2),
                status: Some(200),
                ..Default::default()
            },
        );

        assert_eq!(second.cycles, 2);
        assert_eq!(second.total_sent, 20);
        assert_eq!(second.total_failed, 2);
        assert_eq!(second.total_elapsed, Duration::from_secs(3));
        // Windowed fields reflect only the latest cycle
        assert_eq!(second.latest.failed, 0);
        assert_eq!(second.latest.status, Some(200));
    }

    #[tokio::test]
    async fn test_scheduler_accumulates_cycles() {
        let probe = FakeProbe::new(Duration::ZERO);
        let scheduler = Scheduler::start(config(Duration::from_millis(50)), probe.clone(), ids());

        assert!(scheduler.compute().is_none());
        tokio::time::sleep(Duration::from_millis(220)).await;

        let result = scheduler.compute().expect("at least one cycle merged");
        assert!(result.cycles >= 3, "only {} cycles", result.cycles);
        assert_eq!(result.total_sent, result.cycles * 4);
        assert_eq!(result.total_failed, result.cycles);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_no_mutation_after_stop() {
        // Slow probe so executions are still in flight when stop() returns
        let probe = FakeProbe::new(Duration::from_millis(80));
        let scheduler = Scheduler::start(config(Duration::from_millis(20)), probe.clone(), ids());

        tokio::time::sleep(Duration::from_millis(250)).await;
        scheduler.stop().await;
        let at_stop = scheduler.compute();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(scheduler.compute(), at_stop);
    }

    #[tokio::test]
    async fn test_gate_bounds_in_flight_executions() {
        let probe = FakeProbe::new(Duration::from_millis(150));
        let scheduler = Scheduler::start(config(Duration::from_millis(10)), probe.clone(), ids());

        tokio::time::sleep(Duration::from_millis(600)).await;
        scheduler.stop().await;

        let max = probe.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= MAX_CONCURRENT_PROBES, "{} executions in flight", max);
        assert_eq!(max, MAX_CONCURRENT_PROBES);
        // Backpressure: far fewer launches than the 60 ticks that elapsed
        assert!(probe.calls.load(Ordering::SeqCst) < 30);
    }

    #[tokio::test]
    async fn test_probe_errors_do_not_merge() {
        let probe = FakeProbe::failing();
        let scheduler = Scheduler::start(config(Duration::from_millis(20)), probe.clone(), ids());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(probe.calls.load(Ordering::SeqCst) >= 2);
        assert!(scheduler.compute().is_none());

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_interrupts_startup_jitter() {
        let probe = FakeProbe::new(Duration::ZERO);
        let mut cfg = config(Duration::from_millis(10));
        cfg.startup_jitter = Duration::from_secs(60);
        let scheduler = Scheduler::start(cfg, probe.clone(), ids());

        tokio::time::timeout(Duration::from_secs(1), scheduler.stop())
            .await
            .expect("stop() returns during the startup delay");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        // Idempotent
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_accessors() {
        let probe = FakeProbe::new(Duration::ZERO);
        let scheduler = Scheduler::start(config(Duration::from_secs(60)), probe, ids());
        assert_eq!(scheduler.name(), "db1");
        assert_eq!(scheduler.host(), "10.0.0.5");
        assert_eq!(scheduler.kind(), ProbeKind::Icmp);
        assert_eq!(scheduler.resolved_address(), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(scheduler.labels().get("site").map(String::as_str), Some("lab"));
        scheduler.stop().await;
    }
}
