//! Configuration file model and resolved target types.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::probe::ProbeKind;

use super::RecordError;

/// Upper bound for `icmp.count`, `mtr.count` and `mtr.max-hops`.
pub const SAMPLE_LIMIT: i64 = 65500;

/// Treat a missing or empty string as `None`, parse anything else.
fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: Display,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) if !s.trim().is_empty() => {
            s.trim().parse().map(Some).map_err(serde::de::Error::custom)
        }
        _ => Ok(None),
    }
}

/// Process-level knobs from the `conf` section.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Conf {
    /// Periodic reload interval; zero disables it.
    #[serde(with = "humantime_serde")]
    pub refresh: Duration,
    /// Nameserver for SRV lookups; the system resolver when unset.
    #[serde(deserialize_with = "empty_as_none")]
    pub nameserver: Option<SocketAddr>,
    #[serde(with = "humantime_serde")]
    pub nameserver_timeout: Duration,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            refresh: Duration::ZERO,
            nameserver: None,
            nameserver_timeout: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IcmpSection {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub count: i64,
}

impl Default for IcmpSection {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(4),
            count: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MtrSection {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(rename = "max-hops")]
    pub max_hops: i64,
    pub count: i64,
}

impl Default for MtrSection {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(4),
            max_hops: 30,
            count: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpSection {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpGetSection {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HttpGetSection {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(14),
        }
    }
}

/// One entry of the `targets` list, as written by the operator.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TargetSpec {
    pub name: String,
    pub host: String,
    #[serde(rename = "type")]
    pub probe_type: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub proxy: Option<String>,
    /// Runner hostnames allowed to probe this target; empty means all.
    #[serde(default)]
    pub probe: Vec<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub source_ip: Option<IpAddr>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl TargetSpec {
    /// Map the declared type onto probe kinds.
    pub fn kinds(&self) -> Result<Vec<ProbeKind>, RecordError> {
        parse_probe_type(&self.probe_type).ok_or_else(|| RecordError::UnknownType {
            target: self.name.clone(),
            probe_type: self.probe_type.clone(),
        })
    }
}

/// Parse a declared probe type. `ICMP+MTR` yields both kinds.
pub fn parse_probe_type(s: &str) -> Option<Vec<ProbeKind>> {
    let kinds = match s {
        "ICMP" => vec![ProbeKind::Icmp],
        "MTR" => vec![ProbeKind::Mtr],
        "ICMP+MTR" => vec![ProbeKind::Icmp, ProbeKind::Mtr],
        "TCP" => vec![ProbeKind::Tcp],
        "HTTPGet" => vec![ProbeKind::HttpGet],
        _ => return None,
    };
    Some(kinds)
}

/// The configuration file as parsed, before resolution.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub conf: Conf,
    #[serde(default)]
    pub icmp: IcmpSection,
    #[serde(default)]
    pub mtr: MtrSection,
    #[serde(default)]
    pub tcp: TcpSection,
    #[serde(default)]
    pub http_get: HttpGetSection,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
}

impl ConfigFile {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_slice(raw)
    }
}

/// Effective parameters for every scheduler of one probe kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeParams {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub count: usize,
    pub max_hops: u32,
}

/// Per-kind parameters, shared by reference and replaced wholesale on reload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalProbeParams {
    pub icmp: Arc<ProbeParams>,
    pub mtr: Arc<ProbeParams>,
    pub tcp: Arc<ProbeParams>,
    pub http_get: Arc<ProbeParams>,
}

impl GlobalProbeParams {
    pub fn for_kind(&self, kind: ProbeKind) -> &Arc<ProbeParams> {
        match kind {
            ProbeKind::Icmp => &self.icmp,
            ProbeKind::Mtr => &self.mtr,
            ProbeKind::Tcp => &self.tcp,
            ProbeKind::HttpGet => &self.http_get,
        }
    }
}

impl Default for GlobalProbeParams {
    fn default() -> Self {
        let file = ConfigFile {
            conf: Conf::default(),
            icmp: IcmpSection::default(),
            mtr: MtrSection::default(),
            tcp: TcpSection::default(),
            http_get: HttpGetSection::default(),
            targets: Vec::new(),
        };
        Self::from_sections(&file)
    }
}

impl GlobalProbeParams {
    /// Build from already bounds-checked sections.
    pub(crate) fn from_sections(file: &ConfigFile) -> Self {
        let timing = |interval, timeout| ProbeParams {
            interval,
            timeout,
            count: 1,
            max_hops: 0,
        };

        Self {
            icmp: Arc::new(ProbeParams {
                interval: file.icmp.interval,
                timeout: file.icmp.timeout,
                count: file.icmp.count.clamp(0, SAMPLE_LIMIT) as usize,
                max_hops: 0,
            }),
            mtr: Arc::new(ProbeParams {
                interval: file.mtr.interval,
                timeout: file.mtr.timeout,
                count: file.mtr.count.clamp(0, SAMPLE_LIMIT) as usize,
                max_hops: file.mtr.max_hops.clamp(0, SAMPLE_LIMIT) as u32,
            }),
            tcp: Arc::new(timing(file.tcp.interval, file.tcp.timeout)),
            http_get: Arc::new(timing(file.http_get.interval, file.http_get.timeout)),
        }
    }
}

/// A concrete target after service-discovery expansion and filtering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedTarget {
    pub name: String,
    pub host: String,
    pub kinds: Vec<ProbeKind>,
    pub proxy: Option<String>,
    pub source_ip: Option<IpAddr>,
    pub probe: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl ResolvedTarget {
    pub(crate) fn from_spec(spec: &TargetSpec, kinds: Vec<ProbeKind>) -> Self {
        Self {
            name: spec.name.clone(),
            host: spec.host.clone(),
            kinds,
            proxy: spec.proxy.clone(),
            source_ip: spec.source_ip,
            probe: spec.probe.clone(),
            labels: spec.labels.clone(),
        }
    }

    /// Whether the runner named `hostname` should probe this target.
    pub fn assigned_to(&self, hostname: &str) -> bool {
        self.probe.is_empty() || self.probe.iter().any(|p| p == hostname)
    }
}

/// The immutable outcome of one successful resolution.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub conf: Conf,
    pub params: GlobalProbeParams,
    pub targets: Vec<ResolvedTarget>,
    /// Records dropped during this resolution, kept for operator feedback.
    #[serde(serialize_with = "serialize_rejected")]
    pub rejected: Vec<RecordError>,
}

fn serialize_rejected<S: serde::Serializer>(
    rejected: &[RecordError],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(rejected.iter().map(ToString::to_string))
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            conf: Conf::default(),
            params: GlobalProbeParams::default(),
            targets: Vec::new(),
            rejected: Vec::new(),
        }
    }
}
