//! Portsmith - on-demand SSH port forwarding for a workstation
//!
//! Accepts local connections on configured loopback addresses, dials the
//! matching remote service through an SSH jump host, and splices bytes in
//! both directions. Host-level preconditions (loopback aliases, /etc/hosts
//! entries, pf redirects for privileged ports) are mutated through the
//! separate `portsmith-helper` binary so the daemon itself never runs as
//! root.

pub mod config;
pub mod error;
pub mod forwarding;
pub mod network;
pub mod ssh;

pub use config::{Config, ForwardConfig, HostConfig};
pub use error::{Error, Result};
pub use forwarding::{DynamicForwarder, HealthStatus, StatusUpdate};
pub use network::{NetworkSetup, Undo};
pub use ssh::SshClientPool;
