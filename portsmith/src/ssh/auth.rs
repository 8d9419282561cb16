//! SSH authentication material
//!
//! Bundles are loaded lazily, on the first connection that needs them: agent
//! identities when an agent socket is reachable, otherwise a (possibly
//! passphrase-protected) key file. Keyboard-interactive is always offered
//! last so 2FA-gated bastions keep working.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use russh::client;
use russh::keys::agent::client::AgentClient;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{decode_secret_key, PrivateKey, PublicKey};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::ssh::client::ClientHandler;

/// Expand a leading `~` to the home directory (russh::keys does not).
pub fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Cache key for a bundle: the key path alone, or `key_path|identity_agent`
/// when an explicit agent socket is configured.
pub fn cache_key(key_path: &str, identity_agent: &str) -> String {
    if identity_agent.is_empty() {
        key_path.to_string()
    } else {
        format!("{key_path}|{identity_agent}")
    }
}

/// One authentication method, tried in bundle order.
pub enum AuthMethod {
    /// Identities held by an ssh-agent; signing goes through the socket.
    AgentKeys {
        socket: PathBuf,
        keys: Vec<PublicKey>,
    },
    /// A private key decoded from disk.
    KeyFile { key: Arc<PrivateKey> },
    /// Challenge/response on the controlling terminal (2FA).
    KeyboardInteractive,
}

/// Ordered authentication methods for one `(key_path, identity_agent)` pair.
pub struct AuthBundle {
    pub methods: Vec<AuthMethod>,
}

/// Load authentication material for the given key path and optional agent.
///
/// Agent socket priority: the configured `identity_agent` wins, then
/// `SSH_AUTH_SOCK`, then no agent at all. An agent that answers with zero
/// identities falls through to the key file; an agent socket that does not
/// answer is an error (the retry loader treats it as "agent not up yet").
pub async fn load_auth(key_path: &str, identity_agent: &str) -> Result<AuthBundle> {
    let mut agent_socket: Option<PathBuf> = None;
    if !identity_agent.is_empty() {
        let expanded = expand_tilde(identity_agent);
        debug!("using configured identity agent: {}", expanded);
        agent_socket = Some(PathBuf::from(expanded));
    } else if let Ok(sock) = std::env::var("SSH_AUTH_SOCK") {
        if !sock.is_empty() {
            debug!("using SSH_AUTH_SOCK agent");
            agent_socket = Some(PathBuf::from(sock));
        }
    }

    if let Some(socket) = agent_socket {
        let mut agent = AgentClient::connect_uds(&socket).await.map_err(|e| {
            Error::Auth(format!(
                "failed to connect to SSH agent at {}: {}",
                socket.display(),
                e
            ))
        })?;

        let keys = agent
            .request_identities()
            .await
            .map_err(|e| Error::Auth(format!("failed to list agent identities: {e}")))?;

        if !keys.is_empty() {
            info!("SSH agent connected with {} key(s)", keys.len());
            return Ok(AuthBundle {
                methods: vec![
                    AuthMethod::AgentKeys { socket, keys },
                    AuthMethod::KeyboardInteractive,
                ],
            });
        }

        info!("SSH agent has no keys, loading from key file");
    }

    let expanded = expand_tilde(key_path);
    let data = tokio::fs::read_to_string(&expanded)
        .await
        .map_err(|e| Error::Auth(format!("could not read key file {expanded}: {e}")))?;

    let key = match decode_secret_key(&data, None) {
        Ok(key) => key,
        Err(russh::keys::Error::KeyIsEncrypted) => {
            let prompt = format!("Enter passphrase for {expanded}: ");
            let passphrase = tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt))
                .await
                .map_err(|e| Error::Auth(format!("passphrase prompt failed: {e}")))?
                .map_err(|e| Error::Auth(format!("failed to read passphrase: {e}")))?;

            decode_secret_key(&data, Some(&passphrase))
                .map_err(|e| Error::Auth(format!("failed to decrypt key with passphrase: {e}")))?
        }
        Err(e) => {
            return Err(Error::Auth(format!(
                "could not parse key file {expanded}: {e}"
            )))
        }
    };

    info!("loaded SSH key from {}", expanded);
    Ok(AuthBundle {
        methods: vec![
            AuthMethod::KeyFile { key: Arc::new(key) },
            AuthMethod::KeyboardInteractive,
        ],
    })
}

/// An agent socket that is not up yet surfaces as ECONNREFUSED or ENOENT;
/// everything else (unreadable key, wrong passphrase) is permanent.
pub fn is_agent_unavailable(err: &Error) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("connection refused") || text.contains("no such file")
}

impl AuthBundle {
    /// Authenticate a freshly-connected handle, trying each method in
    /// order. Agent errors are prefixed with `agent:` so the pool's dial
    /// retry can recognize them.
    pub async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        user: &str,
    ) -> Result<()> {
        let mut last_err: Option<String> = None;

        for method in &self.methods {
            match method {
                AuthMethod::AgentKeys { socket, keys } => {
                    let mut agent = AgentClient::connect_uds(socket)
                        .await
                        .map_err(|e| Error::Auth(format!("agent: {e}")))?;

                    for key in keys {
                        let hash_alg = handle
                            .best_supported_rsa_hash()
                            .await
                            .ok()
                            .flatten()
                            .flatten();

                        match handle
                            .authenticate_publickey_with(user, key.clone(), hash_alg, &mut agent)
                            .await
                        {
                            Ok(result) if result.success() => return Ok(()),
                            Ok(_) => last_err = Some("key rejected by server".to_string()),
                            Err(e) => last_err = Some(format!("agent: {e}")),
                        }
                    }
                }
                AuthMethod::KeyFile { key } => {
                    let hash_alg = handle
                        .best_supported_rsa_hash()
                        .await
                        .ok()
                        .flatten()
                        .flatten();
                    let key = PrivateKeyWithHashAlg::new(key.clone(), hash_alg);

                    match handle.authenticate_publickey(user, key).await {
                        Ok(result) if result.success() => return Ok(()),
                        Ok(_) => last_err = Some("key rejected by server".to_string()),
                        Err(e) => last_err = Some(e.to_string()),
                    }
                }
                AuthMethod::KeyboardInteractive => {
                    match keyboard_interactive(handle, user).await {
                        Ok(true) => return Ok(()),
                        Ok(false) => {
                            last_err = Some("keyboard-interactive rejected by server".to_string())
                        }
                        Err(e) => last_err = Some(e.to_string()),
                    }
                }
            }
        }

        Err(Error::Auth(last_err.unwrap_or_else(|| {
            "no authentication methods available".to_string()
        })))
    }
}

/// Drive the keyboard-interactive exchange, answering prompts on the
/// controlling terminal. Servers may send several info requests in a row,
/// including ones with zero prompts (answered with zero responses).
async fn keyboard_interactive(
    handle: &mut client::Handle<ClientHandler>,
    user: &str,
) -> Result<bool> {
    use client::KeyboardInteractiveAuthResponse as Response;

    let mut response = handle
        .authenticate_keyboard_interactive_start(user, None::<String>)
        .await
        .map_err(|e| Error::Auth(e.to_string()))?;

    loop {
        match response {
            Response::Success => return Ok(true),
            Response::Failure { .. } => return Ok(false),
            Response::InfoRequest {
                name,
                instructions,
                prompts,
            } => {
                if !name.trim().is_empty() {
                    println!("{name}");
                }
                if !instructions.trim().is_empty() {
                    println!("{instructions}");
                }

                let mut answers = Vec::with_capacity(prompts.len());
                for prompt in prompts {
                    let text = prompt.prompt.clone();
                    let echo = prompt.echo;
                    let answer = tokio::task::spawn_blocking(move || read_answer(&text, echo))
                        .await
                        .map_err(|e| Error::Auth(format!("prompt task failed: {e}")))??;
                    answers.push(answer);
                }

                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(|e| Error::Auth(e.to_string()))?;
            }
        }
    }
}

/// Read one interactive answer. `echo == false` means a masked read (TOTP
/// codes, passwords).
fn read_answer(prompt: &str, echo: bool) -> Result<String> {
    if echo {
        print!("{prompt}");
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(answer.trim_end_matches(['\r', '\n']).to_string())
    } else {
        rpassword::prompt_password(prompt)
            .map_err(|e| Error::Auth(format!("failed to read response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_without_agent_is_key_path() {
        assert_eq!(cache_key("~/.ssh/id_rsa", ""), "~/.ssh/id_rsa");
    }

    #[test]
    fn cache_key_with_agent_is_distinct() {
        let plain = cache_key("k", "");
        let agented = cache_key("k", "a");
        assert_eq!(agented, "k|a");
        assert_ne!(plain, agented);
    }

    #[test]
    fn expand_tilde_home_paths() {
        let expanded = expand_tilde("~/.ssh/id_rsa");
        assert!(expanded.ends_with(".ssh/id_rsa"));
        assert!(!expanded.starts_with('~'));

        let home = expand_tilde("~");
        assert!(!home.is_empty());
        assert!(!home.starts_with('~'));
    }

    #[test]
    fn expand_tilde_leaves_other_paths_alone() {
        assert_eq!(expand_tilde("/absolute/path/key"), "/absolute/path/key");
        assert_eq!(expand_tilde("./relative/key"), "./relative/key");
    }

    #[test]
    fn agent_unavailable_classification() {
        assert!(is_agent_unavailable(&Error::Auth(
            "failed to connect to SSH agent at /tmp/sock: Connection refused (os error 61)".into()
        )));
        assert!(is_agent_unavailable(&Error::Auth(
            "could not read key file /x: No such file or directory (os error 2)".into()
        )));
        assert!(!is_agent_unavailable(&Error::Auth(
            "failed to decrypt key with passphrase: invalid format".into()
        )));
    }
}
