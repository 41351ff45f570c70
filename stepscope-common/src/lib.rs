//! Common functionality for `stepscope`.
//!
//! This crate exposes the leaf types shared by the trace conversion pipeline:
//!
//!  - [`SourceInfo`] and [`Resolution`]: the outcome of a symbolizer query.
//!  - [`Resolve`]: the trait implemented by address resolvers.
//!  - [`MemoryRegion`]: stack/heap/unknown classification of addresses.
//!  - Functions to normalise file paths and function names coming out of
//!    traces recorded on different platforms.

#![warn(missing_docs)]

mod path;
mod types;

pub use crate::path::*;
pub use crate::types::*;
