//! Loopback alias management (`ifconfig lo0`).
//!
//! Every alias this helper adds is recorded in the registry, and bulk
//! removal only walks the registry. Deleting every non-127.0.0.1 loopback
//! address would be destructive to whatever else uses them.

use std::net::IpAddr;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::{ensure_macos, registry, run_command};

pub fn add(ip: &IpAddr, registry_path: &Path) -> Result<()> {
    ensure_macos()?;

    let ip = ip.to_string();
    let output = Command::new("ifconfig")
        .arg("lo0")
        .output()
        .context("failed to check lo0")?;
    if !output.status.success() {
        bail!("failed to check lo0");
    }

    let assigned = String::from_utf8_lossy(&output.stdout);
    if assigned.split_whitespace().any(|word| word == ip) {
        println!("Loopback alias {ip} already exists");
        registry::add(registry_path, &ip).context("failed to track alias in state")?;
        return Ok(());
    }

    run_command("ifconfig", &["lo0", "alias", &ip, "up"])
        .context("failed to add loopback alias")?;
    registry::add(registry_path, &ip).context("failed to track alias in state")?;

    println!("Added loopback alias: {ip}");
    Ok(())
}

pub fn remove(ip: &IpAddr, registry_path: &Path) -> Result<()> {
    ensure_macos()?;

    let ip = ip.to_string();
    run_command("ifconfig", &["lo0", "-alias", &ip])
        .context("failed to remove loopback alias")?;
    registry::remove(registry_path, &ip).context("failed to remove alias from state")?;

    println!("Removed loopback alias: {ip}");
    Ok(())
}

/// Remove every alias the registry knows about, then clear the registry.
/// Aliases that fail to remove are warned about and skipped.
pub fn remove_all(registry_path: &Path) -> Result<()> {
    ensure_macos()?;

    let aliases = registry::load(registry_path).context("failed to load aliases state")?;
    if aliases.is_empty() {
        println!("No portsmith aliases to remove");
        return Ok(());
    }

    let mut removed = 0;
    for ip in &aliases {
        if let Err(err) = run_command("ifconfig", &["lo0", "-alias", ip]) {
            eprintln!("Warning: failed to remove alias {ip}: {err}");
            continue;
        }
        println!("Removed loopback alias: {ip}");
        removed += 1;
    }

    registry::clear(registry_path).context("failed to clear state file")?;

    println!("Removed {removed} portsmith aliases");
    Ok(())
}
