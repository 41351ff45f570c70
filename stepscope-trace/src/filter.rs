//! Classification of raw events: user source, structural, or toolchain noise.
//!
//! The instrumented runtime reports everything it sees, including frames
//! deep inside the C++ standard library and static initialisation glue. The
//! classifier decides, per event, whether it belongs in the learner-facing
//! step sequence. Structural events survive even when the symbolizer cannot
//! place them: dropping a `func_exit` because its address failed to resolve
//! would corrupt nesting for the rest of the trace.

use std::path::Path;

use stepscope_common::{normalize_file, normalize_function};

use crate::event::EventKind;

/// Function-name patterns emitted by toolchain static initialisers.
const STATIC_INIT_PATTERNS: &[&str] = &["GLOBAL__sub", "_static_initialization_and_destruction"];

/// Path fragments of platform system header locations.
const SYSTEM_PATH_FRAGMENTS: &[&str] = &[
    "/usr/",
    "/lib/",
    "include/c++/",
    "include/bits/",
    "mingw",
    "include\\c++",
    "lib\\gcc",
];

/// File-name fragments of C++ standard library headers.
const STDLIB_FILE_FRAGMENTS: &[&str] = &["stl_", "bits/", "iostream", "ostream", "streambuf"];

/// Prefixes of internal runtime and toolchain functions.
const INTERNAL_FUNCTION_PREFIXES: &[&str] = &[
    "__",
    "_IO_",
    "_M_",
    "std::__",
    "std::basic_",
    "std::char_traits",
    "__gnu_cxx::",
    "__cxxabi",
];

/// Files whose basename identifies iostream machinery, dropped by the
/// stricter second-pass noise check.
const NOISE_FILE_NAMES: &[&str] = &["ios", "ostream", "locale", "__locale", "streambuf"];

/// The effective source location of an event, after combining embedded
/// fields with whatever the resolver produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventLocation {
    /// The normalised function name, possibly empty or `unknown`.
    pub function: String,
    /// The raw file path, possibly empty or a `??` marker.
    pub file: String,
    /// The 1-based source line, 0 when unknown.
    pub line: u32,
}

impl EventLocation {
    /// Returns `true` when no usable source position is known.
    pub fn is_missing(&self) -> bool {
        matches!(self.file.as_str(), "" | "unknown" | "??") || self.line == 0
    }
}

/// The decision for one classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// A user-source event; keep it.
    Keep,
    /// A structural event without a usable location; keep it anyway.
    KeepStructural,
    /// Toolchain or standard library noise; drop it.
    Drop,
}

/// The classifier's verdict on one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    /// Whether the event is kept, kept as structural, or dropped.
    pub decision: FilterDecision,
    /// Set when the event was kept without a resolved source location.
    pub is_unresolved: bool,
}

/// Decides which events belong in the learner-facing sequence.
#[derive(Debug, Clone)]
pub struct Classifier {
    source_basename: String,
}

impl Classifier {
    /// Creates a classifier for the given user source file.
    pub fn new(source_file: &Path) -> Self {
        Classifier {
            source_basename: normalize_file(&source_file.to_string_lossy()),
        }
    }

    /// The normalised basename of the user source file.
    pub fn source_basename(&self) -> &str {
        &self.source_basename
    }

    /// Returns `true` when the given file refers to the user source.
    pub fn matches_source(&self, file: &str) -> bool {
        !file.is_empty() && normalize_file(file) == self.source_basename
    }

    /// Applies the ordered filter rules to one located event.
    pub fn classify(&self, kind: &EventKind, location: &EventLocation) -> Classification {
        if location.is_missing() {
            return if kind.is_structural() {
                Classification {
                    decision: FilterDecision::KeepStructural,
                    is_unresolved: true,
                }
            } else {
                Classification {
                    decision: FilterDecision::Drop,
                    is_unresolved: true,
                }
            };
        }

        let function = normalize_function(&location.function);
        if STATIC_INIT_PATTERNS.iter().any(|p| function.contains(p)) {
            return Classification {
                decision: FilterDecision::Drop,
                is_unresolved: false,
            };
        }

        if self.matches_source(&location.file) {
            return Classification {
                decision: FilterDecision::Keep,
                is_unresolved: false,
            };
        }

        let file = location.file.to_lowercase();
        let file_name = normalize_file(&location.file);
        if STDLIB_FILE_FRAGMENTS
            .iter()
            .any(|f| file_name.contains(f) || file.contains(f))
            || SYSTEM_PATH_FRAGMENTS.iter().any(|f| file.contains(f))
        {
            return Classification {
                decision: FilterDecision::Drop,
                is_unresolved: false,
            };
        }

        if INTERNAL_FUNCTION_PREFIXES
            .iter()
            .any(|p| function.starts_with(p))
        {
            return Classification {
                decision: FilterDecision::Drop,
                is_unresolved: false,
            };
        }

        Classification {
            decision: FilterDecision::Keep,
            is_unresolved: false,
        }
    }

    /// The stricter noise check applied during conversion, after the rule
    /// chain. The user source file is never dropped by this check.
    pub fn is_noise(&self, location: &EventLocation) -> bool {
        if self.matches_source(&location.file) {
            return false;
        }

        let function = normalize_function(&location.function);
        if function.starts_with("std::") || function.starts_with("__gnu_cxx::") {
            if location.is_missing() {
                return function.starts_with("std::");
            }
            return true;
        }

        if location.is_missing() {
            return false;
        }

        let file = location.file.to_lowercase();
        NOISE_FILE_NAMES
            .iter()
            .any(|name| file.split(['/', '\\']).any(|component| component == *name))
    }
}
