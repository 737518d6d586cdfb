use thiserror::Error;

/// Failures of the debug-backend transport. Everything except `Connect` is
/// treated as transient by the monitor loop, which retries on the next
/// iteration.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on debug link: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    #[error("target reported error: {0}")]
    Target(String),

    #[error("short transfer: expected {expected} bytes, got {got}")]
    Short { expected: usize, got: usize },
}
