//! Captured stdout handling and escape rendering.

use serde::Deserialize;

use crate::step::EscapeInfo;

/// Captured stdout of the instrumented run.
///
/// The compiler driver either captures individual write chunks with
/// monotonic ordering metadata, or hands over one combined buffer that is
/// split per platform-normalised line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CapturedStdout {
    /// Individually captured chunks, optionally with ordering timestamps.
    Chunks {
        /// The chunks, in capture order.
        chunks: Vec<String>,
        /// Monotonic ordering metadata parallel to `chunks`.
        #[serde(default)]
        timestamps: Option<Vec<u64>>,
    },
    /// One combined buffer.
    Combined {
        /// The full captured stdout.
        combined: String,
    },
}

impl CapturedStdout {
    /// An empty capture.
    pub fn empty() -> Self {
        CapturedStdout::Combined {
            combined: String::new(),
        }
    }

    /// Returns the output pieces in presentation order, each with its
    /// original chunk index when the capture was chunked.
    pub fn pieces(&self) -> Vec<(Option<usize>, &str)> {
        match self {
            CapturedStdout::Chunks { chunks, timestamps } => {
                let mut order: Vec<usize> = (0..chunks.len()).collect();
                if let Some(ts) = timestamps {
                    if ts.len() == chunks.len() {
                        order.sort_by_key(|&i| (ts[i], i));
                    }
                }
                order
                    .into_iter()
                    .map(|i| (Some(i), chunks[i].as_str()))
                    .collect()
            }
            CapturedStdout::Combined { combined } => split_lines(combined)
                .into_iter()
                .map(|line| (None, line))
                .collect(),
        }
    }
}

impl Default for CapturedStdout {
    fn default() -> Self {
        CapturedStdout::empty()
    }
}

struct EscapeEntry {
    escape: &'static str,
    meaning: &'static str,
    rendered: char,
}

/// Ordered table of recognised escape sequences.
const ESCAPES: &[EscapeEntry] = &[
    EscapeEntry {
        escape: "\\n",
        meaning: "newline",
        rendered: '\n',
    },
    EscapeEntry {
        escape: "\\t",
        meaning: "tab",
        rendered: '\t',
    },
    EscapeEntry {
        escape: "\\r",
        meaning: "carriage return",
        rendered: '\r',
    },
    EscapeEntry {
        escape: "\\f",
        meaning: "form feed",
        rendered: '\u{000C}',
    },
    EscapeEntry {
        escape: "\\b",
        meaning: "backspace",
        rendered: '\u{0008}',
    },
    EscapeEntry {
        escape: "\\\\",
        meaning: "backslash",
        rendered: '\\',
    },
];

/// Splits a combined stdout buffer per line, keeping line terminators so
/// escape detection still sees them. Empty lines are preserved.
pub fn split_lines(combined: &str) -> Vec<&str> {
    if combined.is_empty() {
        return Vec::new();
    }
    combined.split_inclusive('\n').collect()
}

/// Detects table escapes present in a raw output chunk and returns the
/// display text alongside the escape metadata.
///
/// The raw chunk stays untouched for `rawText`; the display form trims the
/// trailing line terminator.
pub fn render_chunk(raw: &str) -> (String, Vec<EscapeInfo>) {
    let mut escapes = Vec::new();
    for entry in ESCAPES {
        if raw.contains(entry.rendered) {
            escapes.push(EscapeInfo {
                escape: entry.escape.to_owned(),
                meaning: entry.meaning.to_owned(),
                rendered: entry.rendered.to_string(),
            });
        }
    }
    let text = raw.trim_end_matches(['\n', '\r']).to_owned();
    (text, escapes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lines_preserves_empty_lines() {
        assert_eq!(split_lines("a\n\nb\n"), vec!["a\n", "\n", "b\n"]);
        assert_eq!(split_lines("no newline"), vec!["no newline"]);
        assert_eq!(split_lines(""), Vec::<&str>::new());
    }

    #[test]
    fn test_render_detects_newline() {
        let (text, escapes) = render_chunk("Hi\n");
        assert_eq!(text, "Hi");
        assert_eq!(escapes.len(), 1);
        assert_eq!(escapes[0].escape, "\\n");
        assert_eq!(escapes[0].meaning, "newline");
    }

    #[test]
    fn test_render_detects_multiple_escapes() {
        let (text, escapes) = render_chunk("a\tb\r\n");
        assert_eq!(text, "a\tb");
        let names: Vec<_> = escapes.iter().map(|e| e.escape.as_str()).collect();
        assert_eq!(names, vec!["\\n", "\\t", "\\r"]);
    }

    #[test]
    fn test_render_plain_chunk() {
        let (text, escapes) = render_chunk("plain");
        assert_eq!(text, "plain");
        assert!(escapes.is_empty());
    }

    #[test]
    fn test_chunk_ordering_by_timestamp() {
        let stdout = CapturedStdout::Chunks {
            chunks: vec!["b".into(), "a".into()],
            timestamps: Some(vec![20, 10]),
        };
        let pieces = stdout.pieces();
        assert_eq!(pieces, vec![(Some(1), "a"), (Some(0), "b")]);
    }

    #[test]
    fn test_chunk_ordering_without_timestamps() {
        let stdout = CapturedStdout::Chunks {
            chunks: vec!["first".into(), "second".into()],
            timestamps: None,
        };
        let pieces = stdout.pieces();
        assert_eq!(pieces, vec![(Some(0), "first"), (Some(1), "second")]);
    }

    #[test]
    fn test_combined_split() {
        let stdout = CapturedStdout::Combined {
            combined: "x\ny\n".into(),
        };
        assert_eq!(stdout.pieces(), vec![(None, "x\n"), (None, "y\n")]);
    }
}
