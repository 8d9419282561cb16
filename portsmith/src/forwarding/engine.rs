//! Forwarding engine
//!
//! Orchestrates startup (stale-state cleanup, network setup, one acceptor
//! task per endpoint), the per-connection data plane through the SSH pool,
//! and teardown of everything that was set up, in reverse order.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{expand_ports, Config, ForwardConfig, HostConfig};
use crate::error::{Error, Result};
use crate::forwarding::status::{
    ErrorWindow, HealthStatus, StatusUpdate, STATUS_CHANNEL_CAPACITY,
};
use crate::network::{NetworkSetup, Undo};
use crate::ssh::pool::Transport;
use crate::ssh::SshClientPool;

/// State the data plane needs, shared by every acceptor and connection
/// task.
struct Shared {
    pool: SshClientPool,
    errors: Mutex<ErrorWindow>,
    /// Taken (and thereby closed) exactly once, on stop.
    status_tx: Mutex<Option<mpsc::Sender<StatusUpdate>>>,
}

impl Shared {
    /// Track a connection error and emit a Degraded status. The send is
    /// non-blocking and drops on a full channel.
    fn record_error(&self, err: &Error) {
        let stamped = format!("{}: {}", chrono::Local::now().format("%H:%M:%S"), err);
        let count = self.errors.lock().record(stamped);

        if let Some(tx) = self.status_tx.lock().as_ref() {
            let _ = tx.try_send(StatusUpdate {
                health: HealthStatus::Degraded,
                message: format!("{count} connection errors - {err}"),
            });
        }
    }

    fn send_status(&self, health: HealthStatus, message: impl Into<String>) {
        if let Some(tx) = self.status_tx.lock().as_ref() {
            let _ = tx.try_send(StatusUpdate {
                health,
                message: message.into(),
            });
        }
    }
}

/// The on-demand port forwarder.
///
/// Lifecycle is `new -> start -> stop`; `start` on a running engine fails
/// with [`Error::AlreadyRunning`], `stop` on a stopped one is a successful
/// no-op. Start and stop take `&mut self`, so control-plane calls cannot
/// race each other.
pub struct DynamicForwarder {
    config_path: PathBuf,
    targets: Vec<HostConfig>,
    net: NetworkSetup,
    shared: Arc<Shared>,
    status_rx: Option<mpsc::Receiver<StatusUpdate>>,
    cleanup: Vec<Undo>,
    acceptors: Vec<JoinHandle<()>>,
    running: bool,
}

impl DynamicForwarder {
    pub fn new(
        config_path: impl Into<PathBuf>,
        targets: Vec<HostConfig>,
        helper_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let net = NetworkSetup::new(helper_path)?;
        let (status_tx, status_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);

        Ok(Self {
            config_path: config_path.into(),
            targets,
            net,
            shared: Arc::new(Shared {
                pool: SshClientPool::new(),
                errors: Mutex::new(ErrorWindow::default()),
                status_tx: Mutex::new(Some(status_tx)),
            }),
            status_rx: Some(status_rx),
            cleanup: Vec::new(),
            acceptors: Vec::new(),
            running: false,
        })
    }

    /// Obtain the status receiver. There is one; the first caller gets it.
    pub fn take_status_rx(&mut self) -> Option<mpsc::Receiver<StatusUpdate>> {
        self.status_rx.take()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Recent connection errors, newest last.
    pub fn recent_errors(&self) -> Vec<String> {
        self.shared.errors.lock().recent().to_vec()
    }

    fn reload_config(&mut self) -> Result<()> {
        info!("reloading configuration from {}", self.config_path.display());
        let config = Config::load(&self.config_path)?;
        self.targets = config.hosts;
        // Auth material is loaded lazily on the first connection, not here.
        Ok(())
    }

    /// Begin forwarding: reload config, erase stale artifacts from prior
    /// runs, set up aliases/hosts entries/redirects, and launch one
    /// acceptor per endpoint.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(Error::AlreadyRunning);
        }

        // Also validates every port spec, so nothing below can fail on a
        // malformed range after host state has been touched.
        self.reload_config()?;

        info!("cleaning up stale resources from previous runs");
        self.net.cleanup_bulk().await;
        info!("stale resource cleanup complete");

        let (mut undos, setup_err) = self.net.setup_all(&self.targets).await;
        if let Some(err) = setup_err {
            warn!("network setup failed, rolling back: {}", err);
            while let Some(undo) = undos.pop() {
                if let Err(undo_err) = self.net.undo(undo).await {
                    warn!("rollback error: {}", undo_err);
                }
            }
            return Err(err);
        }
        self.cleanup.append(&mut undos);

        let targets = self.targets.clone();
        for target in &targets {
            let ports = expand_ports(target)?;
            if ports.is_empty() {
                info!("{} has no ports configured - skipping", display_name(target));
                continue;
            }

            info!(
                "setting up {} -> {} ({} ports)",
                target.local_ip,
                display_name(target),
                ports.len()
            );

            for port in ports {
                let fwd = ForwardConfig::new(target, port);

                if fwd.needs_pf_redirect() {
                    match self
                        .net
                        .setup_pf_redirect(fwd.local_ip, fwd.port, fwd.listen_port)
                        .await
                    {
                        Ok(undo) => self.cleanup.push(undo),
                        Err(err) => {
                            error!(
                                "failed to set up pf redirect for {}:{}: {}",
                                fwd.local_ip, fwd.port, err
                            );
                            self.unwind().await;
                            return Err(err);
                        }
                    }
                }

                let shared = self.shared.clone();
                self.acceptors
                    .push(tokio::spawn(listen_and_forward(shared, fwd)));
            }
        }

        self.running = true;
        self.shared.errors.lock().clear();
        self.shared
            .send_status(HealthStatus::Healthy, "Port forwarding started");
        info!("port forwarding started");
        Ok(())
    }

    /// Stop forwarding and tear down all host state this engine created,
    /// newest first. A no-op if the engine is not running.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        info!("stopping port forwarding");
        self.running = false;

        self.unwind().await;
        self.shared.pool.close().await;
        // Closing the channel is last so teardown problems still reach the
        // status consumer.
        self.shared.status_tx.lock().take();
        Ok(())
    }

    /// Abort acceptors (dropping their listeners) and run the cleanup
    /// stack LIFO. Cleanup errors are logged and swallowed.
    async fn unwind(&mut self) {
        for acceptor in self.acceptors.drain(..) {
            acceptor.abort();
        }
        while let Some(undo) = self.cleanup.pop() {
            if let Err(err) = self.net.undo(undo).await {
                warn!("cleanup error: {}", err);
            }
        }
    }
}

fn display_name(target: &HostConfig) -> String {
    if target.hostnames.is_empty() {
        target.remote_host.clone()
    } else {
        format!("{} ({})", target.hostnames.join(", "), target.remote_host)
    }
}

/// Accept loop for one endpoint. Bind and accept errors end the task; each
/// accepted connection is handled in its own task so a slow dial never
/// blocks the listener.
async fn listen_and_forward(shared: Arc<Shared>, cfg: ForwardConfig) {
    let listen_addr = format!("{}:{}", cfg.local_ip, cfg.listen_port);

    let listener = match TcpListener::bind(&listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to listen on {}: {}", listen_addr, err);
            return;
        }
    };

    if cfg.needs_pf_redirect() {
        info!(
            "listening on {} (redirected from {}:{})",
            listen_addr, cfg.local_ip, cfg.port
        );
    } else {
        info!("listening on {}", listen_addr);
    }

    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let shared = shared.clone();
                let cfg = cfg.clone();
                tokio::spawn(forward_connection(shared, stream, cfg));
            }
            Err(err) => {
                error!("accept error on {}: {}", listen_addr, err);
                return;
            }
        }
    }
}

/// Handle one accepted connection: obtain a pooled transport, open a
/// direct-tcpip sub-stream to the remote, splice until either side closes.
async fn forward_connection(shared: Arc<Shared>, mut local: TcpStream, cfg: ForwardConfig) {
    if let Err(err) = local.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {}", err);
    }

    let client = match shared
        .pool
        .get_client(&cfg.jump_host, cfg.jump_port, &cfg.key_path, &cfg.identity_agent)
        .await
    {
        Ok(client) => client,
        Err(err) => {
            warn!("failed to get SSH client: {}", err);
            shared.record_error(&Error::Transport(format!(
                "SSH client error for {}: {}",
                cfg.jump_host, err
            )));
            return;
        }
    };

    let remote_addr = format!("{}:{}", cfg.remote_host, cfg.port);

    let channel = match open_substream(&client, &cfg).await {
        Ok(channel) => channel,
        Err(first_err) => {
            // The pooled transport may have died behind our back (server
            // timeout, laptop sleep). Replace it once and retry the open.
            warn!("connection failed, attempting reconnect: {}", first_err);
            shared.pool.remove_client(&cfg.jump_host, cfg.jump_port).await;

            let client = match shared
                .pool
                .get_client(&cfg.jump_host, cfg.jump_port, &cfg.key_path, &cfg.identity_agent)
                .await
            {
                Ok(client) => client,
                Err(err) => {
                    warn!("failed to reconnect: {}", err);
                    shared.record_error(&Error::Transport(format!(
                        "reconnect failed for {}: {}",
                        cfg.jump_host, err
                    )));
                    return;
                }
            };

            match open_substream(&client, &cfg).await {
                Ok(channel) => channel,
                Err(err) => {
                    warn!("failed to dial {} after reconnect: {}", remote_addr, err);
                    shared.record_error(&Error::Forward(format!(
                        "dial failed for {}: {}",
                        remote_addr, err
                    )));
                    return;
                }
            }
        }
    };

    debug!("forwarding: :{} -> {}", cfg.port, remote_addr);

    let (mut local_read, mut local_write) = local.split();
    let (mut remote_read, mut remote_write) = tokio::io::split(channel.into_stream());

    let local_to_remote = tokio::io::copy(&mut local_read, &mut remote_write);
    let remote_to_local = tokio::io::copy(&mut remote_read, &mut local_write);

    // Race the two directions: as soon as either side finishes, both
    // endpoints are dropped so the peers observe the close.
    tokio::select! {
        _ = local_to_remote => {}
        _ = remote_to_local => {}
    }

    debug!("connection closed: :{}", cfg.port);
}

async fn open_substream(
    client: &Transport,
    cfg: &ForwardConfig,
) -> Result<russh::Channel<russh::client::Msg>> {
    client
        .channel_open_direct_tcpip(&cfg.remote_host, u32::from(cfg.port), "127.0.0.1", 0)
        .await
        .map_err(|e| Error::Forward(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder_with_fake_helper() -> (DynamicForwarder, tempfile::NamedTempFile) {
        let helper = tempfile::NamedTempFile::new().unwrap();
        let forwarder =
            DynamicForwarder::new("config.yaml", Vec::new(), helper.path()).unwrap();
        (forwarder, helper)
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let (mut forwarder, _helper) = forwarder_with_fake_helper();
        assert!(!forwarder.is_running());
        assert!(forwarder.stop().await.is_ok());
        assert!(!forwarder.is_running());
    }

    #[tokio::test]
    async fn status_receiver_is_taken_once() {
        let (mut forwarder, _helper) = forwarder_with_fake_helper();
        assert!(forwarder.take_status_rx().is_some());
        assert!(forwarder.take_status_rx().is_none());
    }

    #[tokio::test]
    async fn record_error_reports_degraded_with_count() {
        let (mut forwarder, _helper) = forwarder_with_fake_helper();
        let mut status_rx = forwarder.take_status_rx().unwrap();

        forwarder
            .shared
            .record_error(&Error::Transport("boom".to_string()));
        forwarder
            .shared
            .record_error(&Error::Transport("boom again".to_string()));

        let first = status_rx.recv().await.unwrap();
        assert_eq!(first.health, HealthStatus::Degraded);
        assert!(first.message.starts_with("1 connection errors"));

        let second = status_rx.recv().await.unwrap();
        assert!(second.message.starts_with("2 connection errors"));

        let recent = forwarder.recent_errors();
        assert_eq!(recent.len(), 2);
        // Entries are timestamped HH:MM:SS.
        assert!(recent[0].contains(": transport error: boom"));
    }
}
