//! Gateway error types.

use std::time::Duration;

use thiserror::Error;

/// Why a fleet command could not be delivered over HTTP.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("HTTP handshake failed: {0}")]
    Handshake(hyper::Error),

    #[error("request failed: {0}")]
    Request(hyper::Error),

    #[error("invalid request: {0}")]
    Build(#[from] http::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}
