//! portsmith-helper: privileged operations helper for portsmith
//!
//! The daemon never runs as root; every host-level mutation (loopback
//! aliases, /etc/hosts entries, pf redirects) goes through this binary,
//! invoked via a passwordless sudo rule. The helper is the trust boundary:
//! it validates every argument, accepts only loopback addresses, and only
//! ever removes state it created itself (tracked in its on-disk registry
//! or tagged with the portsmith marker).
//!
//! Deliberately tiny: no async runtime, plain std I/O, stdout for
//! informational output and stderr for errors.

mod alias;
mod hosts;
mod pf;
mod registry;
mod validate;

use std::net::IpAddr;
use std::path::Path;
use std::process::{Command as Process, ExitCode};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nix::unistd::Uid;

const HOSTS_PATH: &str = "/etc/hosts";
const ALIASES_FILE: &str = "/var/run/portsmith/aliases";
const ANCHOR_FILE: &str = "/etc/pf.anchors/portsmith";
const PF_CONF_PATH: &str = "/etc/pf.conf";

pub(crate) const ANCHOR_NAME: &str = "portsmith";

#[derive(Parser)]
#[command(
    name = "portsmith-helper",
    about = "Privileged operations helper for portsmith",
    after_help = "All IP addresses must be loopback addresses (127.0.0.0/8 or ::1).\nThis program must be run as root."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a loopback alias
    AddAlias { ip: IpAddr },
    /// Remove a specific loopback alias
    RemoveAlias { ip: IpAddr },
    /// Remove all portsmith-managed aliases
    RemoveAliases,
    /// Add an /etc/hosts entry
    AddHost { ip: IpAddr, hostname: String },
    /// Remove a specific /etc/hosts entry
    RemoveHost { ip: IpAddr, hostname: String },
    /// Remove all portsmith /etc/hosts entries
    RemoveHosts,
    /// Add a pf port redirect
    AddPfRedirect {
        ip: IpAddr,
        from_port: u16,
        to_port: u16,
    },
    /// Remove a specific pf redirect
    RemovePfRedirect {
        ip: IpAddr,
        from_port: u16,
        to_port: u16,
    },
    /// Remove all portsmith pf redirects
    RemovePfRedirects,
}

fn main() -> ExitCode {
    if !Uid::effective().is_root() {
        eprintln!("Error: portsmith-helper must be run as root");
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<()> {
    let aliases_file = Path::new(ALIASES_FILE);
    let hosts_path = Path::new(HOSTS_PATH);
    let anchor_file = Path::new(ANCHOR_FILE);
    let pf_conf_path = Path::new(PF_CONF_PATH);

    match command {
        Command::AddAlias { ip } => {
            validate::loopback_ip(&ip)?;
            alias::add(&ip, aliases_file)
        }
        Command::RemoveAlias { ip } => {
            validate::loopback_ip(&ip)?;
            alias::remove(&ip, aliases_file)
        }
        Command::RemoveAliases => alias::remove_all(aliases_file),
        Command::AddHost { ip, hostname } => {
            validate::loopback_ip(&ip)?;
            validate::hostname(&hostname)?;
            hosts::add(hosts_path, &ip.to_string(), &hostname)
        }
        Command::RemoveHost { ip, hostname } => {
            validate::loopback_ip(&ip)?;
            validate::hostname(&hostname)?;
            hosts::remove(hosts_path, &ip.to_string(), &hostname)
        }
        Command::RemoveHosts => hosts::remove_all(hosts_path),
        Command::AddPfRedirect {
            ip,
            from_port,
            to_port,
        } => {
            validate::loopback_ip(&ip)?;
            validate::port(from_port)?;
            validate::port(to_port)?;
            pf::add(anchor_file, pf_conf_path, &ip.to_string(), from_port, to_port)
        }
        Command::RemovePfRedirect {
            ip,
            from_port,
            to_port,
        } => {
            validate::loopback_ip(&ip)?;
            validate::port(from_port)?;
            validate::port(to_port)?;
            pf::remove(anchor_file, &ip.to_string(), from_port, to_port)
        }
        Command::RemovePfRedirects => pf::remove_all(anchor_file),
    }
}

/// Interface and pfctl operations only exist on macOS; keep the file-level
/// operations portable so they stay testable anywhere.
pub(crate) fn ensure_macos() -> Result<()> {
    if cfg!(target_os = "macos") {
        Ok(())
    } else {
        bail!(
            "unsupported OS: {} (only macOS is supported)",
            std::env::consts::OS
        )
    }
}

pub(crate) fn run_command(program: &str, args: &[&str]) -> Result<()> {
    let status = Process::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to run {program}"))?;
    if !status.success() {
        bail!("{program} {} exited with {status}", args.join(" "));
    }
    Ok(())
}
