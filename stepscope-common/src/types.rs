//! Common types used across the `stepscope` crates.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A resolved source location for an instruction address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// The demangled function name, as printed by the symbolizer.
    pub function: String,
    /// The file path, in whatever convention the symbolizer reports.
    pub file: String,
    /// The 1-based source line, or 0 if the symbolizer did not know it.
    pub line: u32,
}

/// The outcome of a symbolizer query.
///
/// [`Unresolved`](Resolution::Unresolved) is a distinct value rather than a
/// sentinel location. Downstream filtering relies on being able to tell "no
/// information" apart from "known system header"; a fabricated location
/// would make user code disappear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The address maps to a known source location.
    Resolved(SourceInfo),
    /// The symbolizer could not produce a location for the address.
    Unresolved,
}

impl Resolution {
    /// Returns `true` if no source location is known.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Resolution::Unresolved)
    }

    /// Returns the resolved location, if any.
    pub fn info(&self) -> Option<&SourceInfo> {
        match self {
            Resolution::Resolved(info) => Some(info),
            Resolution::Unresolved => None,
        }
    }
}

/// Variants of [`ResolveError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ResolveErrorKind {
    /// No symbolizer binary could be invoked at all.
    #[error("no symbolizer binary could be invoked")]
    ResolverUnavailable,
}

/// An error returned by an address resolver.
///
/// Transient per-address failures are never errors; they surface as
/// [`Resolution::Unresolved`]. The only error condition is a resolver that
/// cannot work at all.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct ResolveError {
    pub(crate) kind: ResolveErrorKind,
    #[source]
    pub(crate) source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ResolveError {
    /// Creates a new error from a known kind and an arbitrary payload.
    pub fn new<E>(kind: ResolveErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Returns the corresponding [`ResolveErrorKind`] for this error.
    pub fn kind(&self) -> ResolveErrorKind {
        self.kind
    }
}

impl From<ResolveErrorKind> for ResolveError {
    fn from(kind: ResolveErrorKind) -> Self {
        Self { kind, source: None }
    }
}

/// Maps raw instruction addresses to source locations.
///
/// This is the seam between the trace conversion pipeline and whatever
/// symbolization backend is available. Implementations are queried once per
/// distinct address and are expected to memoise internally.
pub trait Resolve {
    /// Resolves a single instruction address.
    ///
    /// Per-address failures return [`Resolution::Unresolved`]; the error
    /// path is reserved for a resolver that cannot be invoked at all.
    fn resolve(&mut self, addr: u64) -> Result<Resolution, ResolveError>;
}

/// A resolver that answers [`Resolution::Unresolved`] for every address.
///
/// Useful for tests and for traces whose events all carry embedded source
/// locations.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

impl Resolve for NoopResolver {
    fn resolve(&mut self, _addr: u64) -> Result<Resolution, ResolveError> {
        Ok(Resolution::Unresolved)
    }
}

/// The memory region a traced address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryRegion {
    /// A stack slot belonging to some frame.
    Stack,
    /// A heap allocation.
    Heap,
    /// An address the trace gave no region information for.
    Unknown,
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MemoryRegion::Stack => write!(f, "stack"),
            MemoryRegion::Heap => write!(f, "heap"),
            MemoryRegion::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_accessors() {
        let info = SourceInfo {
            function: "main".into(),
            file: "main.cpp".into(),
            line: 3,
        };
        let resolved = Resolution::Resolved(info.clone());
        assert!(!resolved.is_unresolved());
        assert_eq!(resolved.info(), Some(&info));
        assert!(Resolution::Unresolved.is_unresolved());
        assert_eq!(Resolution::Unresolved.info(), None);
    }

    #[test]
    fn test_noop_resolver() {
        let mut resolver = NoopResolver;
        assert_eq!(resolver.resolve(0x1000).unwrap(), Resolution::Unresolved);
    }
}
