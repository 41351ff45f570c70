//! Stepscope reconstructs the execution of small C/C++ programs as a
//! sequence of beginner-readable steps.
//!
//! It consists of largely independent crates, re-exported here:
//!
//! - [`common`]: shared leaf types and path/name normalisation.
//! - [`resolve`]: symbol resolution via external symbolizer binaries.
//! - [`trace`]: the trace reconstruction engine itself.
//!
//! The [`convert`] function wires them together for the common case: one
//! instrumented executable, one raw event file, one source file.

#![warn(missing_docs)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[doc(inline)]
pub use stepscope_common as common;
#[doc(inline)]
pub use stepscope_resolve as resolve;
#[doc(inline)]
pub use stepscope_trace as trace;

use stepscope_resolve::Addr2LineResolver;
use stepscope_trace::{CapturedStdout, ConvertError, InputMap, RawTrace, Step, TraceConverter};

/// Converts one instrumented run into a step sequence.
///
/// Constructs an [`Addr2LineResolver`] for the executable, runs the trace
/// through a [`TraceConverter`], and extends `tracked_functions` with every
/// function observed in the trace (plus `main`).
///
/// `input_lines` maps source lines to input operations detected by the
/// compiler driver; each entry produces a single `input_request` step the
/// first time execution reaches its line.
pub fn convert(
    trace: &RawTrace,
    executable: &Path,
    source_file: &Path,
    stdout: &CapturedStdout,
    tracked_functions: &mut BTreeSet<String>,
    input_lines: Option<InputMap>,
) -> Result<Vec<Step>, ConvertError> {
    if let Ok(source_text) = fs::read_to_string(source_file) {
        trace.validate(&source_text);
    }

    let resolver = Addr2LineResolver::new(executable);
    let mut converter = TraceConverter::new(resolver, source_file);
    if let Some(input_lines) = input_lines {
        converter.set_input_lines(input_lines);
    }

    let conversion = converter.convert(trace, stdout)?;
    tracked_functions.extend(conversion.tracked_functions);
    Ok(conversion.steps)
}
