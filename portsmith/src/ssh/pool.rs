//! Pooled SSH transports to jump hosts
//!
//! Two independently-locked maps: authentication bundles keyed per
//! `(key_path, identity_agent)` and live transports keyed per jump address.
//! The two locks are never held at the same time, and the transport lock is
//! dropped across every long wait (auth loading, dial-retry sleeps) so one
//! slow jump host cannot stall acquisition for the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ssh::auth::{self, AuthBundle};
use crate::ssh::client::ClientHandler;

/// Delay between attempts while waiting for the agent socket to appear.
pub const AUTH_RETRY_INTERVAL: Duration = Duration::from_secs(5);

const DIAL_MAX_RETRIES: u32 = 3;

/// A live, authenticated transport. Channel opens take `&self`, so the
/// handle is shared freely between connection tasks.
pub type Transport = Arc<client::Handle<ClientHandler>>;

fn transport_key(jump_host: &str, jump_port: u16) -> String {
    format!("{jump_host}:{jump_port}")
}

pub struct SshClientPool {
    clients: Mutex<HashMap<String, Transport>>,
    bundles: Mutex<HashMap<String, Arc<AuthBundle>>>,
}

impl Default for SshClientPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SshClientPool {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            bundles: Mutex::new(HashMap::new()),
        }
    }

    /// Load and cache the auth bundle for a key/agent pair. A no-op when
    /// already cached. The cache lock is held across the load attempt, so
    /// concurrent first connections never prompt for a passphrase twice.
    pub async fn load_auth_methods(&self, key_path: &str, identity_agent: &str) -> Result<()> {
        let bundle_key = auth::cache_key(key_path, identity_agent);

        let mut bundles = self.bundles.lock().await;
        if bundles.contains_key(&bundle_key) {
            return Ok(());
        }

        let bundle = auth::load_auth(key_path, identity_agent).await?;
        bundles.insert(bundle_key, Arc::new(bundle));
        Ok(())
    }

    /// Call [`Self::load_auth_methods`] until it succeeds, sleeping
    /// `interval` between attempts while the agent socket is unavailable
    /// (the daemon usually starts before the user's agent is unlocked).
    /// Permanent failures surface immediately. Logs on the first failure
    /// and every sixth attempt after that.
    pub async fn load_auth_with_retry(
        &self,
        key_path: &str,
        identity_agent: &str,
        interval: Duration,
    ) -> Result<()> {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            match self.load_auth_methods(key_path, identity_agent).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(
                            "loaded SSH auth methods for {} after {} attempts",
                            key_path, attempt
                        );
                    }
                    return Ok(());
                }
                Err(err) if auth::is_agent_unavailable(&err) => {
                    if attempt == 1 {
                        info!(
                            "waiting for SSH agent to become available (will retry every {}s)...",
                            interval.as_secs()
                        );
                    } else if attempt % 6 == 0 {
                        info!("still waiting for SSH agent ({} attempts so far)", attempt);
                    }
                    tokio::time::sleep(interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Return the pooled transport for a jump host, dialing one if needed.
    ///
    /// May block for a long time: auth loading waits indefinitely for the
    /// agent, and agent-shaped handshake failures are retried with a
    /// growing delay (hardware-backed agents need a human in the loop).
    pub async fn get_client(
        &self,
        jump_host: &str,
        jump_port: u16,
        key_path: &str,
        identity_agent: &str,
    ) -> Result<Transport> {
        let client_key = transport_key(jump_host, jump_port);

        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&client_key) {
            return Ok(client.clone());
        }

        let bundle_key = auth::cache_key(key_path, identity_agent);
        let cached = self.bundles.lock().await.get(&bundle_key).cloned();

        let bundle = match cached {
            Some(bundle) => bundle,
            None => {
                info!("auth methods not loaded for {}, loading now", key_path);

                // Loading can wait on the agent indefinitely; let other
                // acquirers make progress meanwhile.
                drop(clients);
                self.load_auth_with_retry(key_path, identity_agent, AUTH_RETRY_INTERVAL)
                    .await?;
                let bundle = self
                    .bundles
                    .lock()
                    .await
                    .get(&bundle_key)
                    .cloned()
                    .ok_or_else(|| {
                        Error::Auth(format!(
                            "no authentication methods available for key {key_path} after loading"
                        ))
                    })?;

                clients = self.clients.lock().await;
                if let Some(client) = clients.get(&client_key) {
                    return Ok(client.clone());
                }
                bundle
            }
        };

        let user = whoami::username();
        debug!(
            "connecting to {} as {} with {} auth method(s)",
            client_key,
            user,
            bundle.methods.len()
        );

        let mut attempt = 0;
        let handle = loop {
            attempt += 1;
            match dial(jump_host, jump_port, &user, &bundle).await {
                Ok(handle) => break handle,
                Err(err) => {
                    if !is_retryable_dial_error(&err) || attempt >= DIAL_MAX_RETRIES {
                        return Err(Error::Transport(format!(
                            "failed to dial jump host {client_key} (attempt {attempt}/{DIAL_MAX_RETRIES}): {err}"
                        )));
                    }

                    let delay = Duration::from_secs(u64::from(attempt) * 3);
                    warn!(
                        "SSH connection to {} failed (attempt {}/{}): {}. Agent may need unlock, retrying in {}s",
                        client_key,
                        attempt,
                        DIAL_MAX_RETRIES,
                        err,
                        delay.as_secs()
                    );

                    drop(clients);
                    tokio::time::sleep(delay).await;
                    clients = self.clients.lock().await;
                    if let Some(client) = clients.get(&client_key) {
                        return Ok(client.clone());
                    }
                }
            }
        };

        let handle = Arc::new(handle);
        clients.insert(client_key.clone(), handle.clone());
        info!("SSH connection established to {} as {}", client_key, user);
        Ok(handle)
    }

    /// Disconnect and drop a transport the caller has found to be stale.
    pub async fn remove_client(&self, jump_host: &str, jump_port: u16) {
        let client_key = transport_key(jump_host, jump_port);
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.remove(&client_key) {
            let _ = client
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
            info!("removed stale SSH connection to {}", client_key);
        }
    }

    /// Disconnect every pooled transport. The pool itself is being
    /// discarded, so the map is left as-is.
    pub async fn close(&self) {
        let clients = self.clients.lock().await;
        for (addr, client) in clients.iter() {
            info!("closing connection to {}", addr);
            let _ = client
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
    }
}

async fn dial(
    jump_host: &str,
    jump_port: u16,
    user: &str,
    bundle: &AuthBundle,
) -> Result<client::Handle<ClientHandler>> {
    let config = Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    });

    let mut handle = client::connect(config, (jump_host, jump_port), ClientHandler)
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;

    bundle.authenticate(&mut handle, user).await?;
    Ok(handle)
}

/// Agent-shaped handshake failures are worth retrying: the agent may be
/// waiting on a hardware confirmation or still initializing.
fn is_retryable_dial_error(err: &Error) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("agent:") || text.contains("broken pipe") || text.contains("eof")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_key_format() {
        assert_eq!(
            transport_key("bastion.example.com", 22),
            "bastion.example.com:22"
        );
        assert_eq!(transport_key("jump", 2222), "jump:2222");
    }

    #[test]
    fn retryable_dial_errors() {
        assert!(is_retryable_dial_error(&Error::Auth(
            "agent: failure during signing".into()
        )));
        assert!(is_retryable_dial_error(&Error::Transport(
            "Broken pipe (os error 32)".into()
        )));
        assert!(is_retryable_dial_error(&Error::Transport(
            "unexpected EOF".into()
        )));
        assert!(!is_retryable_dial_error(&Error::Transport(
            "Connection refused (os error 61)".into()
        )));
        assert!(!is_retryable_dial_error(&Error::Auth(
            "key rejected by server".into()
        )));
    }

    #[tokio::test]
    async fn bundle_cache_keys_are_distinct_per_agent() {
        // `k` and `k|a` must land in different cache slots.
        let pool = SshClientPool::new();
        let mut bundles = pool.bundles.lock().await;
        bundles.insert(
            auth::cache_key("k", ""),
            Arc::new(AuthBundle { methods: vec![] }),
        );
        assert!(bundles.contains_key("k"));
        assert!(!bundles.contains_key(&auth::cache_key("k", "a")));
    }
}
