//! Symbol resolution for `stepscope`.
//!
//! Trace events carry raw instruction addresses. This crate turns those into
//! `(function, file, line)` triples by invoking an external
//! addr2line-compatible symbolizer, preferring a toolchain-matched binary
//! shipped next to the instrumented executable and falling back to whatever
//! the system provides.
//!
//! Resolution is deliberately pessimistic: any per-address failure (spawn
//! error, non-zero exit, malformed output, timeout) yields
//! [`Resolution::Unresolved`](stepscope_common::Resolution::Unresolved). A
//! fabricated source location is worse than an unknown one, because the
//! downstream filter must be able to tell "no info" apart from "system
//! header".

#![warn(missing_docs)]

mod resolver;

pub use crate::resolver::*;
