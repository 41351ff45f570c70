//! Path and name normalisation for traces recorded on any platform.
//!
//! Instrumented binaries report file paths in whatever convention the host
//! toolchain uses. Downstream consumers compare files by their normalised
//! basename, so everything here accepts both separator conventions.

/// Returns `true` if the given character is any valid directory separator.
#[inline]
fn is_path_separator(c: char) -> bool {
    matches!(c, '\\' | '/')
}

/// Splits a path of unknown platform convention into a directory part and a
/// file name part.
///
/// Trailing directory separators are ignored.
///
/// # Examples
///
/// ```
/// assert_eq!(stepscope_common::split_path("/a/b/c"), (Some("/a/b"), "c"));
/// assert_eq!(stepscope_common::split_path("C:\\a\\b"), (Some("C:\\a"), "b"));
/// assert_eq!(stepscope_common::split_path("a"), (None, "a"));
/// ```
pub fn split_path(path: &str) -> (Option<&str>, &str) {
    let trimmed = path.trim_end_matches(is_path_separator);
    match trimmed.rfind(is_path_separator) {
        Some(0) => (Some(&trimmed[..1]), &trimmed[1..]),
        Some(idx) => (Some(&trimmed[..idx]), &trimmed[idx + 1..]),
        None => (None, trimmed),
    }
}

/// Returns the file name of a path in either platform convention.
pub fn basename(path: &str) -> &str {
    split_path(path).1
}

/// Normalises a source file reference for comparison and display.
///
/// The result is the basename, lowercased, with backslashes folded into
/// forward slashes beforehand. An empty input stays empty.
///
/// # Examples
///
/// ```
/// assert_eq!(stepscope_common::normalize_file("C:\\Users\\student\\Main.CPP"), "main.cpp");
/// assert_eq!(stepscope_common::normalize_file("/home/student/main.cpp"), "main.cpp");
/// ```
pub fn normalize_file(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    basename(&normalized).to_lowercase()
}

/// Normalises a function name reported by a trace or symbolizer.
///
/// Trailing carriage returns show up when a Windows-built symbolizer output
/// is consumed line-wise; surrounding whitespace comes from sloppy event
/// emitters.
pub fn normalize_function(name: &str) -> String {
    name.trim_end_matches('\r').trim().to_string()
}
