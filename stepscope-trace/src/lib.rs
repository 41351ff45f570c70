//! The stepscope trace reconstruction engine.
//!
//! An instrumented C/C++ binary emits a flat stream of low-level events:
//! function entries, declarations, assignments, loop boundaries, heap
//! traffic. This crate reconstructs from that stream the hierarchical
//! structure a learner thinks in — call frames, block scopes, loop
//! iterations, pointer targets — and emits it as a deterministic sequence of
//! [`Step`] records that visualisation layers animate.
//!
//! The pipeline, leaves first:
//!
//!  1. A [`Resolve`](stepscope_common::Resolve) implementation maps raw
//!     addresses to source locations.
//!  2. The [`Classifier`](filter::Classifier) keeps user-source and
//!     structural events and drops standard library and toolchain noise.
//!  3. The frame tracker maintains call frames, scopes and pointer aliases.
//!  4. The loop summariser collapses loop bodies into single summary steps.
//!  5. The step emitter owns the counters, synthesises the program
//!     start/end envelope and renumbers the final sequence.
//!
//! The whole conversion is a pure function of its inputs: identical inputs
//! produce byte-identical step sequences.
//!
//! # Example
//!
//! ```
//! use stepscope_common::NoopResolver;
//! use stepscope_trace::{CapturedStdout, RawTrace, TraceConverter};
//!
//! let trace = RawTrace::parse(
//!     br#"{"events": [
//!         {"type": "func_enter", "func": "main", "file": "main.cpp", "line": 1},
//!         {"type": "func_exit", "file": "main.cpp", "line": 2}
//!     ], "tracked_functions": ["main"]}"#,
//! )
//! .unwrap();
//!
//! let converter = TraceConverter::new(NoopResolver, std::path::Path::new("main.cpp"));
//! let stdout = CapturedStdout::Combined { combined: "Hi\n".into() };
//! let conversion = converter.convert(&trace, &stdout).unwrap();
//!
//! assert_eq!(conversion.steps.first().unwrap().event_type.as_str(), "program_start");
//! assert_eq!(conversion.steps.last().unwrap().event_type.as_str(), "program_end");
//! ```

#![warn(missing_docs)]

mod convert;
mod error;
mod event;
pub mod filter;
mod frame;
mod loops;
mod output;
mod step;

pub use crate::convert::{Conversion, TraceConverter};
pub use crate::error::{ConvertError, ConvertErrorKind};
pub use crate::event::{EventKind, InputKind, InputMap, InputOp, RawEvent, RawTrace};
pub use crate::frame::{Frame, FrameStack, PointerAlias, PointerTarget, ScopeRecord};
pub use crate::output::CapturedStdout;
pub use crate::step::{
    EscapeInfo, FrameMetadata, PointsTo, ScopeKind, ScopeRecordKind, Step, StepKind, StepPayload,
};
