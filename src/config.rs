//! Process settings for pathwatch.
//!
//! Loads settings from environment variables with sensible defaults. The
//! target list itself lives in the YAML file named by `config_path`.

use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the status server (default: 9427)
    pub http_port: u16,
    /// Path to the target file (default: "pathwatch.yml")
    pub config_path: PathBuf,
    /// Name this runner matches against each target's `probe` list
    pub hostname: String,
    /// Prefer IPv6 addresses when resolving target hosts
    pub ipv6: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 9427,
            config_path: PathBuf::from("pathwatch.yml"),
            hostname: "localhost".to_string(),
            ipv6: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PATHWATCH_HTTP_PORT`: HTTP port (default: 9427)
    /// - `PATHWATCH_CONFIG`: target file path (default: "pathwatch.yml")
    /// - `PATHWATCH_HOSTNAME`: runner hostname (default: `HOSTNAME`, then `/etc/hostname`)
    /// - `PATHWATCH_IPV6`: "1"/"true" to prefer IPv6 (default: false)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("PATHWATCH_HTTP_PORT") {
            match port_str.parse() {
                Ok(port) => cfg.http_port = port,
                Err(_) => tracing::warn!(value = %port_str, "Ignoring invalid PATHWATCH_HTTP_PORT"),
            }
        }

        if let Ok(path) = env::var("PATHWATCH_CONFIG") {
            cfg.config_path = PathBuf::from(path);
        }

        if let Some(hostname) = detect_hostname() {
            cfg.hostname = hostname;
        }

        if let Ok(flag) = env::var("PATHWATCH_IPV6") {
            cfg.ipv6 = parse_flag(&flag);
        }

        cfg
    }
}

fn detect_hostname() -> Option<String> {
    let from_env = |key| env::var(key).ok().map(|v| v.trim().to_string());
    from_env("PATHWATCH_HOSTNAME")
        .filter(|h| !h.is_empty())
        .or_else(|| from_env("HOSTNAME").filter(|h| !h.is_empty()))
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 9427);
        assert_eq!(cfg.config_path, PathBuf::from("pathwatch.yml"));
        assert_eq!(cfg.hostname, "localhost");
        assert!(!cfg.ipv6);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(parse_flag(" yes "));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
        assert!(!parse_flag("nope"));
    }
}
