//! Configuration loading, port expansion, and forward derivation
//!
//! The config file is YAML with a single top-level `hosts` list. Port lists
//! are heterogeneous: plain integers and `"start-end"` range strings mix
//! freely and are deduplicated during expansion.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::ssh::auth::expand_tilde;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const GLOBAL_CONFIG_PATH: &str = "~/.config/portsmith/config.yaml";
pub const DEFAULT_KEY_PATH: &str = "~/.ssh/id_rsa";
pub const SSH_DEFAULT_PORT: u16 = 22;

/// A single element of a host's `ports` list: either a literal port or a
/// `"start-end"` range string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Port(u16),
    Range(String),
}

/// Configuration for a single forwarding target.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Loopback address the forwards for this host bind to.
    pub local_ip: Ipv4Addr,

    /// Names published in /etc/hosts for `local_ip`. Defaults to
    /// `[remote_host]` when omitted and `remote_host` is not an IP literal.
    #[serde(default)]
    pub hostnames: Vec<String>,

    /// Destination host, resolved on the jump host.
    pub remote_host: String,

    pub jump_host: String,

    #[serde(default = "default_jump_port")]
    pub jump_port: u16,

    /// Private key path; `~` is expanded when the key is loaded.
    #[serde(default = "default_key_path")]
    pub key_path: String,

    /// Alternate agent socket path. Empty means "use SSH_AUTH_SOCK".
    #[serde(default)]
    pub identity_agent: String,

    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

/// Top-level configuration document. Unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub hosts: Vec<HostConfig>,
}

fn default_jump_port() -> u16 {
    SSH_DEFAULT_PORT
}

fn default_key_path() -> String {
    DEFAULT_KEY_PATH.to_string()
}

impl Config {
    /// Read and parse a YAML configuration file, applying per-host defaults.
    ///
    /// Port specifications are validated here so a malformed range fails the
    /// load, before any network state has been touched.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let data = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {e}")))?;

        let mut config: Config = serde_yaml::from_str(&data)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;

        for host in &mut config.hosts {
            if host.hostnames.is_empty() {
                if host.remote_host.parse::<IpAddr>().is_ok() {
                    warn!(
                        "host with remote_host={} has no hostnames; access via local IP {} only",
                        host.remote_host, host.local_ip
                    );
                } else {
                    host.hostnames = vec![host.remote_host.clone()];
                }
            }
            expand_ports(host)?;
        }

        Ok(config)
    }
}

/// Search for a config file: `./config.yaml` first, then the global
/// `~/.config/portsmith/config.yaml`.
pub fn find_config_path() -> Result<PathBuf> {
    let local = PathBuf::from(DEFAULT_CONFIG_PATH);
    if local.exists() {
        return Ok(local);
    }

    let global = PathBuf::from(expand_tilde(GLOBAL_CONFIG_PATH));
    if global.exists() {
        return Ok(global);
    }

    Err(Error::Config(format!(
        "no config file found. Searched:\n  - {DEFAULT_CONFIG_PATH} (current directory)\n  - {GLOBAL_CONFIG_PATH} (global config)"
    )))
}

/// Expand a host's port specifications into a sorted, deduplicated list.
pub fn expand_ports(host: &HostConfig) -> Result<Vec<u16>> {
    let mut ports = BTreeSet::new();

    for spec in &host.ports {
        match spec {
            PortSpec::Port(port) => {
                ports.insert(*port);
            }
            PortSpec::Range(range) => {
                let (start, end) = parse_range(range)?;
                ports.extend(start..=end);
            }
        }
    }

    Ok(ports.into_iter().collect())
}

fn parse_range(spec: &str) -> Result<(u16, u16)> {
    let (start, end) = spec
        .split_once('-')
        .and_then(|(a, b)| Some((a.parse::<u16>().ok()?, b.parse::<u16>().ok()?)))
        .ok_or_else(|| {
            Error::Config(format!(
                "invalid port range format {spec:?}, expected format: \"start-end\""
            ))
        })?;

    if start > end {
        return Err(Error::Config(format!(
            "invalid port range {spec:?}: start ({start}) must be <= end ({end})"
        )));
    }

    Ok((start, end))
}

/// Everything needed to run one forward: where to listen, where to dial,
/// and how to reach the jump host.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub local_ip: Ipv4Addr,
    pub remote_host: String,
    /// Remote port, and the port users aim local traffic at.
    pub port: u16,
    /// Port actually bound locally; differs from `port` when a pf redirect
    /// is in play.
    pub listen_port: u16,
    pub jump_host: String,
    pub jump_port: u16,
    pub key_path: String,
    pub identity_agent: String,
}

impl ForwardConfig {
    /// Derive a forward from a host and a concrete port. Privileged ports
    /// are rebound above 10000 and reached through a pf redirect so the
    /// daemon never needs to bind below 1024.
    pub fn new(host: &HostConfig, port: u16) -> Self {
        let listen_port = if port < 1024 { 10000 + port } else { port };

        Self {
            local_ip: host.local_ip,
            remote_host: host.remote_host.clone(),
            port,
            listen_port,
            jump_host: host.jump_host.clone(),
            jump_port: host.jump_port,
            key_path: host.key_path.clone(),
            identity_agent: host.identity_agent.clone(),
        }
    }

    pub fn needs_pf_redirect(&self) -> bool {
        self.port != self.listen_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn host_with_ports(ports: Vec<PortSpec>) -> HostConfig {
        HostConfig {
            local_ip: "127.0.0.2".parse().unwrap(),
            hostnames: vec![],
            remote_host: "remote.example.com".to_string(),
            jump_host: "jump.example.com".to_string(),
            jump_port: 22,
            key_path: DEFAULT_KEY_PATH.to_string(),
            identity_agent: String::new(),
            ports,
        }
    }

    #[test]
    fn expand_explicit_ports() {
        let host = host_with_ports(vec![
            PortSpec::Port(80),
            PortSpec::Port(443),
            PortSpec::Port(8080),
        ]);
        assert_eq!(expand_ports(&host).unwrap(), vec![80, 443, 8080]);
    }

    #[test]
    fn expand_range_is_inclusive() {
        let host = host_with_ports(vec![PortSpec::Range("8000-8005".to_string())]);
        assert_eq!(expand_ports(&host).unwrap().len(), 6);
    }

    #[test]
    fn expand_no_ports() {
        let host = host_with_ports(vec![]);
        assert!(expand_ports(&host).unwrap().is_empty());
    }

    #[test]
    fn expand_mixed_ports_and_ranges() {
        let host = host_with_ports(vec![
            PortSpec::Port(80),
            PortSpec::Port(443),
            PortSpec::Range("9000-9002".to_string()),
        ]);
        assert_eq!(expand_ports(&host).unwrap(), vec![80, 443, 9000, 9001, 9002]);
    }

    #[test]
    fn expand_deduplicates_across_literals_and_ranges() {
        let host = host_with_ports(vec![
            PortSpec::Port(80),
            PortSpec::Port(80),
            PortSpec::Port(443),
            PortSpec::Range("80-81".to_string()),
        ]);
        assert_eq!(expand_ports(&host).unwrap(), vec![80, 81, 443]);
    }

    #[test]
    fn expand_rejects_invalid_range_format() {
        let host = host_with_ports(vec![PortSpec::Range("invalid".to_string())]);
        assert!(matches!(expand_ports(&host), Err(Error::Config(_))));
    }

    #[test]
    fn expand_rejects_reversed_range() {
        let host = host_with_ports(vec![PortSpec::Range("100-50".to_string())]);
        assert!(matches!(expand_ports(&host), Err(Error::Config(_))));
    }

    #[test]
    fn expand_is_idempotent_over_its_output() {
        let host = host_with_ports(vec![
            PortSpec::Port(80),
            PortSpec::Port(443),
            PortSpec::Range("5432-5433".to_string()),
            PortSpec::Port(80),
        ]);
        let first = expand_ports(&host).unwrap();
        assert_eq!(first, vec![80, 443, 5432, 5433]);

        let again = host_with_ports(first.iter().map(|p| PortSpec::Port(*p)).collect());
        assert_eq!(expand_ports(&again).unwrap(), first);
    }

    #[test]
    fn forward_config_inherits_host_fields() {
        let mut host = host_with_ports(vec![]);
        host.jump_port = 2222;

        let fwd = ForwardConfig::new(&host, 8080);
        assert_eq!(fwd.local_ip, host.local_ip);
        assert_eq!(fwd.remote_host, host.remote_host);
        assert_eq!(fwd.port, 8080);
        assert_eq!(fwd.listen_port, 8080);
        assert_eq!(fwd.jump_host, host.jump_host);
        assert_eq!(fwd.jump_port, 2222);
        assert_eq!(fwd.key_path, host.key_path);
        assert!(!fwd.needs_pf_redirect());
    }

    #[test]
    fn forward_config_rewrites_privileged_ports() {
        let host = host_with_ports(vec![]);

        for (port, listen_port) in [(22u16, 10022u16), (80, 10080), (443, 10443), (1023, 11023)] {
            let fwd = ForwardConfig::new(&host, port);
            assert_eq!(fwd.listen_port, listen_port);
            assert!(fwd.needs_pf_redirect());
        }

        let fwd = ForwardConfig::new(&host, 1024);
        assert_eq!(fwd.listen_port, 1024);
        assert!(!fwd.needs_pf_redirect());
    }

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_config_applies_defaults() {
        let file = write_config(
            "hosts:\n  - local_ip: 127.0.0.2\n    remote_host: remote.example.com\n    jump_host: jump.example.com\n",
        );

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.hosts.len(), 1);

        let host = &config.hosts[0];
        assert_eq!(host.jump_port, SSH_DEFAULT_PORT);
        assert_eq!(host.key_path, DEFAULT_KEY_PATH);
        assert_eq!(host.hostnames, vec!["remote.example.com"]);
    }

    #[test]
    fn load_config_two_hosts() {
        let file = write_config(concat!(
            "hosts:\n",
            "  - local_ip: 127.0.0.2\n",
            "    hostnames:\n",
            "      - test.local\n",
            "    remote_host: remote.example.com\n",
            "    jump_host: jump.example.com\n",
            "    key_path: ~/.ssh/id_rsa\n",
            "    ports: [80, 443]\n",
            "  - local_ip: 127.0.0.3\n",
            "    remote_host: another.example.com\n",
            "    jump_host: jump.example.com\n",
            "    jump_port: 2222\n",
        ));

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[0].hostnames, vec!["test.local"]);
        assert_eq!(config.hosts[0].jump_port, SSH_DEFAULT_PORT);
        assert_eq!(config.hosts[1].jump_port, 2222);
    }

    #[test]
    fn load_config_ip_remote_gets_no_hostnames() {
        let file = write_config(
            "hosts:\n  - local_ip: 127.0.0.5\n    remote_host: 10.0.0.5\n    jump_host: jump.example.com\n",
        );

        let config = Config::load(file.path()).unwrap();
        assert!(config.hosts[0].hostnames.is_empty());
    }

    #[test]
    fn load_config_rejects_reversed_range() {
        let file = write_config(
            "hosts:\n  - local_ip: 127.0.0.2\n    remote_host: remote.example.com\n    jump_host: jump.example.com\n    ports: [\"100-50\"]\n",
        );

        assert!(matches!(Config::load(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn load_config_ignores_unknown_keys() {
        let file = write_config(
            "hosts:\n  - local_ip: 127.0.0.2\n    remote_host: remote.example.com\n    jump_host: jump.example.com\n    comment: ignored\n",
        );

        assert!(Config::load(file.path()).is_ok());
    }

    #[test]
    fn load_config_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/file.yaml"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn load_config_invalid_yaml() {
        let file = write_config("invalid: yaml: content: [");
        assert!(matches!(Config::load(file.path()), Err(Error::Config(_))));
    }
}
