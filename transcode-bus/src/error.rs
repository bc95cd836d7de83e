use std::fmt;

use thiserror::Error;

use crate::format::MediaFormat;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The engine holds an input that has not been drained yet.
    #[error("engine is busy, retrieve pending output first")]
    Busy,

    #[error("{stage}: {op} not allowed in state {state}")]
    InvalidState {
        stage: &'static str,
        op: &'static str,
        state: &'static str,
    },

    #[error("format mismatch: expected {expected}, got {actual}")]
    FormatMismatch {
        expected: MediaFormat,
        actual: MediaFormat,
    },

    #[error("packet for stream {actual} sent to engine bound to stream {expected}")]
    StreamMismatch { expected: usize, actual: usize },

    #[error("hardware transfer failed: {0}")]
    TransferFailed(String),

    #[error("{stage} made no progress after {attempts} attempts")]
    StalledPipeline { stage: &'static str, attempts: usize },

    #[error("{0} has already been drained")]
    Exhausted(&'static str),

    #[error("invalid time base {num}/{den}")]
    InvalidTimeBase { num: i64, den: i64 },

    #[error("invalid rational: {0}")]
    InvalidRational(String),

    #[error("codec not found: {0}")]
    CodecNotFound(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("mux error: {0}")]
    Mux(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline aborted in {stage} (last pts {last_pts:?}): {source}")]
    Aborted {
        stage: &'static str,
        last_pts: Option<i64>,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn transfer(msg: impl Into<String>) -> Self {
        Self::TransferFailed(msg.into())
    }

    pub fn mux(msg: impl Into<String>) -> Self {
        Self::Mux(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Strips [`Error::Aborted`] wrappers and returns the underlying failure.
    pub fn root(&self) -> &Error {
        match self {
            Error::Aborted { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy)
    }
}

/// Result of offering an input to an engine.
///
/// `Busy` hands the input back to the caller untouched so it can be retried
/// after the engine's pending output has been retrieved.
pub enum TrySubmitError<T> {
    Busy(T),
    Failed(Error),
}

impl<T> TrySubmitError<T> {
    /// Returns the rejected input, if the engine gave it back.
    pub fn into_inner(self) -> Option<T> {
        match self {
            TrySubmitError::Busy(item) => Some(item),
            TrySubmitError::Failed(_) => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, TrySubmitError::Busy(_))
    }
}

impl<T> From<Error> for TrySubmitError<T> {
    fn from(err: Error) -> Self {
        TrySubmitError::Failed(err)
    }
}

impl<T> From<TrySubmitError<T>> for Error {
    fn from(err: TrySubmitError<T>) -> Self {
        match err {
            TrySubmitError::Busy(_) => Error::Busy,
            TrySubmitError::Failed(err) => err,
        }
    }
}

impl<T> fmt::Debug for TrySubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySubmitError::Busy(_) => f.write_str("Busy(..)"),
            TrySubmitError::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
        }
    }
}

impl<T> fmt::Display for TrySubmitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySubmitError::Busy(_) => fmt::Display::fmt(&Error::Busy, f),
            TrySubmitError::Failed(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl<T> std::error::Error for TrySubmitError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrySubmitError::Busy(_) => None,
            TrySubmitError::Failed(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_unwraps_nested_aborts() {
        let err = Error::Aborted {
            stage: "encoder",
            last_pts: Some(42),
            source: Box::new(Error::StalledPipeline {
                stage: "encoder",
                attempts: 8,
            }),
        };
        assert!(matches!(
            err.root(),
            Error::StalledPipeline { attempts: 8, .. }
        ));
        assert!(err.to_string().contains("last pts Some(42)"));
    }

    #[test]
    fn busy_returns_the_input() {
        let err: TrySubmitError<u32> = TrySubmitError::Busy(7);
        assert!(err.is_busy());
        assert_eq!(err.into_inner(), Some(7));

        let err: TrySubmitError<u32> = Error::Exhausted("decoder").into();
        assert!(!err.is_busy());
        assert!(matches!(Error::from(err), Error::Exhausted("decoder")));
    }
}
