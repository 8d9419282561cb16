//! pf anchor management for privileged-port redirects.
//!
//! Redirect rules live in their own anchor file so they can be loaded and
//! flushed without touching the main ruleset. The one edit ever made to
//! /etc/pf.conf is inserting the anchor reference, once, directly after the
//! vendor redirect anchor.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::{ensure_macos, run_command, ANCHOR_NAME};

/// The exact rule line for one redirect. Matching on removal is bit-exact
/// against this text.
pub fn rule(ip: &str, from_port: u16, to_port: u16) -> String {
    format!("rdr pass on lo0 inet proto tcp from any to {ip} port {from_port} -> {ip} port {to_port}")
}

/// Append the rule unless it is already present. Returns `None` when the
/// anchor file already contains it.
pub fn upsert_rule(existing: &str, rule: &str) -> Option<String> {
    if existing.contains(rule) {
        return None;
    }

    let mut updated = existing.to_string();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(rule);
    updated.push('\n');
    Some(updated)
}

/// Drop every line containing the rule (blank lines are dropped too).
pub fn remove_rule(content: &str, rule: &str) -> String {
    let kept: Vec<&str> = content
        .split('\n')
        .filter(|line| !line.contains(rule) && !line.trim().is_empty())
        .collect();

    if kept.is_empty() {
        String::new()
    } else {
        kept.join("\n") + "\n"
    }
}

/// Insert `rdr-anchor "portsmith"` immediately after the com.apple rdr
/// anchor. Returns `None` when the reference is already present; fails when
/// no insertion point exists.
pub fn ensure_anchor_reference(pf_conf: &str) -> Result<Option<String>> {
    if pf_conf.contains("rdr-anchor \"portsmith\"") {
        return Ok(None);
    }

    let mut lines = Vec::new();
    let mut inserted = false;
    for line in pf_conf.split('\n') {
        lines.push(line.to_string());
        if !inserted && line.contains("rdr-anchor \"com.apple/*\"") {
            lines.push("rdr-anchor \"portsmith\"".to_string());
            inserted = true;
        }
    }

    if !inserted {
        bail!("could not find appropriate location in /etc/pf.conf to add anchor");
    }
    Ok(Some(lines.join("\n")))
}

fn load_anchor(anchor_file: &Path) -> Result<()> {
    run_command(
        "pfctl",
        &["-a", ANCHOR_NAME, "-f", &anchor_file.to_string_lossy()],
    )
    .context("failed to load pf anchor")
}

pub fn add(
    anchor_file: &Path,
    pf_conf_path: &Path,
    ip: &str,
    from_port: u16,
    to_port: u16,
) -> Result<()> {
    ensure_macos()?;

    let rule = rule(ip, from_port, to_port);
    let existing = fs::read_to_string(anchor_file).unwrap_or_default();

    let updated = match upsert_rule(&existing, &rule) {
        Some(updated) => updated,
        None => {
            println!("pf redirect already exists: {ip}:{from_port} -> {ip}:{to_port}");
            return Ok(());
        }
    };
    fs::write(anchor_file, updated).context("failed to write anchor file")?;

    let pf_conf = fs::read_to_string(pf_conf_path)
        .with_context(|| format!("failed to read {}", pf_conf_path.display()))?;

    let mut reload_main = false;
    if let Some(updated_conf) = ensure_anchor_reference(&pf_conf)? {
        fs::write(pf_conf_path, updated_conf)
            .with_context(|| format!("failed to update {}", pf_conf_path.display()))?;
        reload_main = true;
    }

    load_anchor(anchor_file)?;
    if reload_main {
        run_command("pfctl", &["-f", &pf_conf_path.to_string_lossy()])
            .context("failed to reload pf.conf")?;
    }

    println!("Added pf redirect: {ip}:{from_port} -> {ip}:{to_port}");
    Ok(())
}

pub fn remove(anchor_file: &Path, ip: &str, from_port: u16, to_port: u16) -> Result<()> {
    ensure_macos()?;

    let content = match fs::read_to_string(anchor_file) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            println!("No pf redirects to remove for {ip}:{from_port}");
            return Ok(());
        }
        Err(err) => return Err(err).context("failed to read anchor file"),
    };

    let rule = rule(ip, from_port, to_port);
    fs::write(anchor_file, remove_rule(&content, &rule)).context("failed to write anchor file")?;

    load_anchor(anchor_file)?;

    println!("Removed pf redirect: {ip}:{from_port} -> {ip}:{to_port}");
    Ok(())
}

pub fn remove_all(anchor_file: &Path) -> Result<()> {
    ensure_macos()?;

    if !anchor_file.exists() {
        println!("No pf redirects to remove");
        return Ok(());
    }

    fs::write(anchor_file, "").context("failed to clear anchor file")?;

    // Flushing an empty table can fail; that is fine.
    if let Err(err) = run_command("pfctl", &["-a", ANCHOR_NAME, "-F", "nat"]) {
        eprintln!("Warning: failed to flush pf anchor: {err}");
    }

    println!("Removed all portsmith pf redirects");
    Ok(())
}
