//! Argument validation at the trust boundary.

use std::net::IpAddr;

use anyhow::{bail, Result};

/// Only loopback addresses may be aliased or published.
pub fn loopback_ip(ip: &IpAddr) -> Result<()> {
    if !ip.is_loopback() {
        bail!("only loopback addresses allowed: {ip}");
    }
    Ok(())
}

/// Hostnames going into /etc/hosts: non-empty, at most 253 characters, no
/// whitespace.
pub fn hostname(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("hostname cannot be empty");
    }
    if name.len() > 253 {
        bail!("hostname too long: {name}");
    }
    if name.contains(|c: char| c.is_whitespace()) {
        bail!("invalid hostname (contains whitespace): {name}");
    }
    Ok(())
}

pub fn port(port: u16) -> Result<()> {
    if port == 0 {
        bail!("invalid port: 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_ips_accepted() {
        for ip in ["127.0.0.1", "127.0.0.2", "127.0.0.255", "::1"] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(loopback_ip(&ip).is_ok(), "{ip} should be accepted");
        }
    }

    #[test]
    fn non_loopback_ips_rejected() {
        for ip in ["192.168.1.1", "8.8.8.8", "10.0.0.1", "::2"] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(loopback_ip(&ip).is_err(), "{ip} should be rejected");
        }
    }

    #[test]
    fn hostname_validation() {
        assert!(hostname("example.local").is_ok());
        assert!(hostname("myapp").is_ok());
        assert!(hostname("my-app.local").is_ok());
        assert!(hostname("my_app.local").is_ok());
        assert!(hostname(&"a".repeat(253)).is_ok());

        assert!(hostname("my app").is_err());
        assert!(hostname("my\tapp").is_err());
        assert!(hostname("my\napp").is_err());
        assert!(hostname("").is_err());
        assert!(hostname(&"a".repeat(254)).is_err());
    }

    #[test]
    fn port_zero_rejected() {
        assert!(port(0).is_err());
        assert!(port(1).is_ok());
        assert!(port(65535).is_ok());
    }
}
