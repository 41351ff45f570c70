use thiserror::Error;

use stepscope_common::ResolveError;

/// Variants of [`ConvertError`].
///
/// Only three conditions abort a conversion. Everything else the engine can
/// recover from is a warning plus a defensively dropped event: a single bad
/// input event must never break the entire visualisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConvertErrorKind {
    /// The raw event file could not be read or decoded.
    #[error("malformed raw event file")]
    BadTraceFile,

    /// The instrumented binary emitted no events at all.
    #[error("instrumentation produced no events")]
    InstrumentationInactive,

    /// No symbolizer binary could be invoked.
    #[error("no symbolizer available")]
    ResolverUnavailable,

    /// The final renumber sweep found a non-contiguous step sequence.
    ///
    /// This is a programming bug in the engine, not a data problem.
    #[error("step sequence failed the determinism check")]
    DeterminismViolation,
}

/// An error returned when converting a raw trace into steps.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct ConvertError {
    pub(crate) kind: ConvertErrorKind,
    #[source]
    pub(crate) source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ConvertError {
    /// Creates a new error from a known kind and an arbitrary payload.
    pub fn new<E>(kind: ConvertErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`ConvertErrorKind`] for this error.
    pub fn kind(&self) -> ConvertErrorKind {
        self.kind
    }
}

impl From<ConvertErrorKind> for ConvertError {
    fn from(kind: ConvertErrorKind) -> Self {
        Self { kind, source: None }
    }
}

impl From<ResolveError> for ConvertError {
    fn from(error: ResolveError) -> Self {
        ConvertError::new(ConvertErrorKind::ResolverUnavailable, error)
    }
}
