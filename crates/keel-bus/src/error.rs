//! Bus and correlation errors.

use std::time::Duration;

use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

/// Delivered to a correlation handler, or returned from misuse of a
/// [`Correlator`](crate::Correlator).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CorrelationError {
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("reply subscription closed")]
    Closed,
}
