//! SSH transport layer
//!
//! Pooled russh client connections to jump hosts, with lazily-loaded
//! authentication material (agent identities or a key file, plus
//! keyboard-interactive for 2FA).

pub mod auth;
pub mod client;
pub mod pool;

pub use auth::{expand_tilde, AuthBundle};
pub use client::ClientHandler;
pub use pool::{SshClientPool, Transport};
