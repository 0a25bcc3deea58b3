//! Error type for the exchange layer.
//!
//! Validation failures found while building partition functions or
//! producers are [`ExchangeError::BadRequest`]; the request layer maps
//! those to a client error. Everything else is an internal failure of
//! the running fragment.

use std::panic::Location;

use arrow::datatypes::DataType;
use arrow::error::ArrowError;
use thiserror::Error;

use crate::channel::StreamChannelId;

/// Result type used across the crate.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExchangeError {
    /// Construction parameters were rejected. Never retried.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The transport refused a write on a channel.
    #[error("transport rejected write on {channel}: {reason}")]
    Transport {
        channel: StreamChannelId,
        reason: String,
    },

    /// A column has no hashing rule.
    #[error("hashing a column of type {data_type} (column {column}) is not supported")]
    UnsupportedHashType { column: usize, data_type: DataType },

    #[error("column index {column} out of bounds for a batch with {num_columns} columns")]
    ColumnOutOfBounds { column: usize, num_columns: usize },

    /// A partition function computed a destination outside
    /// `[0, num_destinations)`.
    #[error("row {row} routed to invalid destination {destination} (num destinations {num_destinations})")]
    InvalidDestination {
        row: usize,
        destination: i64,
        num_destinations: usize,
    },

    #[error("arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("telemetry setup: {0}")]
    Telemetry(String),

    #[error("internal: {0}")]
    Internal(String),

    /// Another error re-raised with a message and the location it was
    /// re-raised at.
    #[error("({location}) {msg}\nCaused by => {source}")]
    Context {
        location: String,
        msg: String,
        #[source]
        source: Box<ExchangeError>,
    },
}

impl ExchangeError {
    /// Is this, or the error it wraps, a client-side validation error?
    pub fn is_bad_request(&self) -> bool {
        match self {
            Self::BadRequest(_) => true,
            Self::Context { source, .. } => source.is_bad_request(),
            _ => false,
        }
    }

    /// Strip any [`ExchangeError::Context`] layers.
    pub fn root_cause(&self) -> &ExchangeError {
        match self {
            Self::Context { source, .. } => source.root_cause(),
            err => err,
        }
    }
}

/// Add located context to a failing result.
pub trait ExchangeResultExt<T> {
    /// Make the existing error the cause of a new one carrying `msg`
    /// and the caller's location.
    ///
    /// Example:
    ///     pf.set_num_destinations(n).reraise("binding shuffle destinations")?;
    #[track_caller]
    fn reraise(self, msg: &str) -> ExchangeResult<T>;
}

impl<T, E> ExchangeResultExt<T> for Result<T, E>
where
    E: Into<ExchangeError>,
{
    #[track_caller]
    fn reraise(self, msg: &str) -> ExchangeResult<T> {
        let caller = Location::caller();
        self.map_err(|err| ExchangeError::Context {
            location: caller.to_string(),
            msg: msg.to_string(),
            source: Box::new(err.into()),
        })
    }
}

/// Build a [`ExchangeError::BadRequest`] that records where the
/// validation failed.
#[track_caller]
pub(crate) fn tracked_bad_request(msg: &str) -> ExchangeError {
    let caller = Location::caller();
    tracing::debug!("({caller}) rejected request: {msg}");
    ExchangeError::BadRequest(msg.to_string())
}

#[test]
fn reraise_keeps_bad_request_class() {
    let res: ExchangeResult<()> = Err(ExchangeError::BadRequest("invalid cell partition".into()));
    let err = res.reraise("building hyper shuffle").unwrap_err();
    assert!(err.is_bad_request());
    assert!(matches!(err.root_cause(), ExchangeError::BadRequest(_)));

    let msg = err.to_string();
    assert!(msg.contains("building hyper shuffle"));
    assert!(msg.contains("errors.rs"));
    assert!(msg.contains("Caused by => bad request: invalid cell partition"));
}

#[test]
fn internal_is_not_bad_request() {
    let err = ExchangeError::Internal("boom".into());
    assert!(!err.is_bad_request());

    let res: ExchangeResult<()> = Err(err);
    assert!(!res.reraise("wrapped").unwrap_err().is_bad_request());
}
