use std::io;
use thiserror::Error;

/// Errors surfaced to callers of the public API. Steady-state network anomalies (lost
///  fragments, socket errors in the receive loop, stale acks) are logged instead.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("payload of {len} bytes exceeds the maximum message size of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("failed to bind UDP socket to port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("endpoint is already started")]
    AlreadyStarted,

    #[error("endpoint is not started")]
    NotStarted,

    #[error("endpoint was closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[source] anyhow::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;
