//! Privileged network mutations via the helper binary
//!
//! Every host-level change goes through `sudo portsmith-helper <cmd> ...`;
//! the daemon itself never runs as root, and the helper validates every
//! argument on its side of the trust boundary. Each successful mutation
//! yields an [`Undo`] record holding exactly the inverse invocation; the
//! engine stacks them and unwinds LIFO on shutdown.
//!
//! Bulk cleanup removes every artifact carrying the portsmith marker,
//! including lines a user appended by hand with the same marker. That is
//! the intended behavior: the marker means "owned by portsmith".

use std::net::Ipv4Addr;
use std::path::PathBuf;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::error::{Error, Result};

/// The inverse of one successful setup operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    Alias {
        ip: Ipv4Addr,
    },
    HostNames {
        ip: Ipv4Addr,
        names: Vec<String>,
    },
    PfRedirect {
        ip: Ipv4Addr,
        from_port: u16,
        to_port: u16,
    },
}

#[derive(Debug)]
pub struct NetworkSetup {
    helper_path: PathBuf,
}

impl NetworkSetup {
    pub fn new(helper_path: impl Into<PathBuf>) -> Result<Self> {
        let helper_path = helper_path.into();
        if !helper_path.exists() {
            return Err(Error::PrivilegeOp {
                op: "locate helper".to_string(),
                stderr: format!("helper not found at {}", helper_path.display()),
            });
        }
        Ok(Self { helper_path })
    }

    async fn run_helper(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("sudo")
            .arg(&self.helper_path)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::PrivilegeOp {
                op: args.join(" "),
                stderr: e.to_string(),
            })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if !line.trim().is_empty() {
                debug!("helper: {}", line);
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::PrivilegeOp {
                op: args.join(" "),
                stderr: format!("{} ({})", stderr, output.status),
            });
        }
        Ok(())
    }

    /// Add a loopback alias. Idempotent at the helper layer: re-adding an
    /// existing alias succeeds.
    pub async fn setup_loopback_alias(&self, ip: Ipv4Addr) -> Result<Undo> {
        self.run_helper(&["add-alias", &ip.to_string()]).await?;
        info!("created loopback alias {}", ip);
        Ok(Undo::Alias { ip })
    }

    /// Publish `names` for `ip` in /etc/hosts. Empty `names` yields a no-op
    /// undo.
    pub async fn add_name_entries(&self, ip: Ipv4Addr, names: &[String]) -> Result<Undo> {
        for name in names {
            self.run_helper(&["add-host", &ip.to_string(), name]).await?;
            info!("added /etc/hosts entry: {} -> {}", name, ip);
        }
        Ok(Undo::HostNames {
            ip,
            names: names.to_vec(),
        })
    }

    /// Redirect `ip:from_port` to `ip:to_port` so a privileged port can be
    /// served from an unprivileged listener.
    pub async fn setup_pf_redirect(
        &self,
        ip: Ipv4Addr,
        from_port: u16,
        to_port: u16,
    ) -> Result<Undo> {
        self.run_helper(&[
            "add-pf-redirect",
            &ip.to_string(),
            &from_port.to_string(),
            &to_port.to_string(),
        ])
        .await?;
        info!("created pf redirect: {}:{} -> {}:{}", ip, from_port, ip, to_port);
        Ok(Undo::PfRedirect {
            ip,
            from_port,
            to_port,
        })
    }

    /// Run the inverse helper command for one undo record. Partial
    /// failures while removing hostname entries are logged and skipped so
    /// the remaining names still get cleaned up.
    pub async fn undo(&self, undo: Undo) -> Result<()> {
        match undo {
            Undo::Alias { ip } => {
                self.run_helper(&["remove-alias", &ip.to_string()]).await?;
                info!("removed loopback alias {}", ip);
            }
            Undo::HostNames { ip, names } => {
                for name in &names {
                    if let Err(err) = self
                        .run_helper(&["remove-host", &ip.to_string(), name])
                        .await
                    {
                        warn!("failed to remove hosts entry {} -> {}: {}", name, ip, err);
                    }
                }
                if !names.is_empty() {
                    info!("removed /etc/hosts entries for {}", ip);
                }
            }
            Undo::PfRedirect {
                ip,
                from_port,
                to_port,
            } => {
                self.run_helper(&[
                    "remove-pf-redirect",
                    &ip.to_string(),
                    &from_port.to_string(),
                    &to_port.to_string(),
                ])
                .await?;
                info!("removed pf redirect: {}:{} -> {}:{}", ip, from_port, ip, to_port);
            }
        }
        Ok(())
    }

    /// Best-effort removal of every portsmith artifact, in fixed order:
    /// redirects, hosts entries, aliases. Used on startup to erase residue
    /// from a previous crash; per-step failures are logged, never fatal.
    pub async fn cleanup_bulk(&self) {
        for args in [
            ["remove-pf-redirects"].as_slice(),
            &["remove-hosts"],
            &["remove-aliases"],
        ] {
            if let Err(err) = self.run_helper(args).await {
                warn!("cleanup step {} failed: {}", args.join(" "), err);
            }
        }
    }

    /// Alias and hostname setup for every target. On failure, returns the
    /// undos accumulated so far together with the error so the caller can
    /// decide to unwind.
    pub async fn setup_all(&self, targets: &[HostConfig]) -> (Vec<Undo>, Option<Error>) {
        let mut undos = Vec::new();

        for target in targets {
            match self.setup_loopback_alias(target.local_ip).await {
                Ok(undo) => undos.push(undo),
                Err(err) => return (undos, Some(err)),
            }

            match self
                .add_name_entries(target.local_ip, &target.hostnames)
                .await
            {
                Ok(undo) => undos.push(undo),
                Err(err) => return (undos, Some(err)),
            }
        }

        (undos, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_missing_helper() {
        let err = NetworkSetup::new("/nonexistent/portsmith-helper").unwrap_err();
        assert!(matches!(err, Error::PrivilegeOp { .. }));
        assert!(err.to_string().contains("helper not found"));
    }

    #[test]
    fn new_accepts_existing_helper() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(NetworkSetup::new(file.path()).is_ok());
    }
}
