//! Target resolution.
//!
//! Turns the declarative YAML target list into a validated, deduplicated set of
//! concrete targets. Service-discovery names expand into one target per
//! discovered host.

mod discovery;
mod model;
mod resolve;
mod store;

pub use discovery::*;
pub use model::*;
pub use resolve::*;
pub use store::*;

use thiserror::Error;

use crate::probe::ProbeKind;

/// Errors that fail a whole resolution. The previous configuration stays live.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("found duplicated record: {name} ({kind})")]
    DuplicateTarget { kind: ProbeKind, name: String },
    #[error("intervals (icmp,mtr,tcp,http_get) must be >0, {0} is not")]
    InvalidInterval(ProbeKind),
    #[error("{field} must be between 0 and {max}, got {value}")]
    OutOfBounds {
        field: &'static str,
        value: i64,
        max: i64,
    },
}

/// Errors that drop a single record; resolution carries on without it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("target '{target}': unknown check type '{probe_type}', allowed (ICMP|MTR|ICMP+MTR|TCP|HTTPGet)")]
    UnknownType { target: String, probe_type: String },
    #[error("target '{target}': type {probe_type} doesn't match SRV record protocol '{protocol}'")]
    ProtocolMismatch {
        target: String,
        probe_type: String,
        protocol: String,
    },
    #[error("target '{target}': SRV lookup of '{host}' failed: {source}")]
    Discovery {
        target: String,
        host: String,
        source: DiscoveryError,
    },
}
