//! Error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// A privileged helper invocation exited non-zero. Carries the helper's
    /// stderr so sudo and validation failures stay diagnosable.
    #[error("privileged operation `{op}` failed: {stderr}")]
    PrivilegeOp { op: String, stderr: String },

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("forward error: {0}")]
    Forward(String),

    #[error("forwarder is already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<russh::keys::Error> for Error {
    fn from(err: russh::keys::Error) -> Self {
        Error::Auth(err.to_string())
    }
}
