use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use stepscope_common::{
    normalize_function, Resolution, Resolve, ResolveError, ResolveErrorKind, SourceInfo,
};

#[cfg(windows)]
const ADDR2LINE: &str = "addr2line.exe";
#[cfg(not(windows))]
const ADDR2LINE: &str = "addr2line";

#[cfg(windows)]
const LLVM_ADDR2LINE: &str = "llvm-addr2line.exe";
#[cfg(not(windows))]
const LLVM_ADDR2LINE: &str = "llvm-addr2line";

/// How long a single symbolizer invocation may run before it is killed.
const SYMBOLIZER_TIMEOUT: Duration = Duration::from_secs(3);

/// How often a running symbolizer child is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Resolves instruction addresses by invoking an external symbolizer.
///
/// Candidates are tried in priority order: a toolchain-matched `addr2line`
/// next to the executable first, then the system `addr2line`, then
/// `llvm-addr2line`. Once a candidate has been invoked successfully it is
/// pinned for the rest of the resolver's lifetime.
///
/// Results are memoised per address. A resolver instance is tied to one
/// executable and one conversion; it is not shareable across threads.
#[derive(Debug)]
pub struct Addr2LineResolver {
    executable: PathBuf,
    candidates: Vec<PathBuf>,
    active: Option<usize>,
    cache: HashMap<u64, Resolution>,
    timeout: Duration,
}

impl Addr2LineResolver {
    /// Creates a resolver for the given instrumented executable, using the
    /// default symbolizer candidate list.
    pub fn new(executable: &Path) -> Self {
        let candidates = default_candidates(executable);
        Self::with_candidates(executable, candidates)
    }

    /// Creates a resolver with an explicit symbolizer candidate list.
    pub fn with_candidates(executable: &Path, candidates: Vec<PathBuf>) -> Self {
        Addr2LineResolver {
            executable: executable.to_path_buf(),
            candidates,
            active: None,
            cache: HashMap::new(),
            timeout: SYMBOLIZER_TIMEOUT,
        }
    }

    /// Overrides the per-invocation timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn resolve_uncached(&mut self, addr: u64) -> Result<Resolution, ResolveError> {
        let start = self.active.unwrap_or(0);
        for idx in start..self.candidates.len() {
            match self.run_candidate(&self.candidates[idx], addr) {
                Ok(Some(output)) => {
                    self.active = Some(idx);
                    return Ok(match parse_symbolizer_output(&output) {
                        Some(info) => Resolution::Resolved(info),
                        None => Resolution::Unresolved,
                    });
                }
                Ok(None) => {
                    self.active = Some(idx);
                    return Ok(Resolution::Unresolved);
                }
                Err(err) => {
                    tracing::debug!(
                        candidate = %self.candidates[idx].display(),
                        error = %err,
                        "symbolizer candidate could not be spawned"
                    );
                }
            }
        }
        Err(ResolveErrorKind::ResolverUnavailable.into())
    }

    /// Runs one candidate. `Ok(Some(stdout))` means it exited cleanly,
    /// `Ok(None)` means it was invocable but produced no usable result, and
    /// `Err` means it could not be spawned at all.
    fn run_candidate(&self, candidate: &Path, addr: u64) -> std::io::Result<Option<String>> {
        let mut child = Command::new(candidate)
            .arg("-e")
            .arg(&self.executable)
            .arg("-f")
            .arg("-C")
            .arg(format!("{addr:#x}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if !status.success() {
                        return Ok(None);
                    }
                    let mut output = String::new();
                    match child.stdout.take() {
                        Some(mut stdout) => {
                            if stdout.read_to_string(&mut output).is_ok() {
                                return Ok(Some(output));
                            }
                            return Ok(None);
                        }
                        None => return Ok(None),
                    }
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(
                            candidate = %candidate.display(),
                            addr,
                            "symbolizer invocation timed out"
                        );
                        let _ = child.kill();
                        let _ = child.wait();
                        return Ok(None);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(_) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(None);
                }
            }
        }
    }
}

impl Resolve for Addr2LineResolver {
    fn resolve(&mut self, addr: u64) -> Result<Resolution, ResolveError> {
        if let Some(hit) = self.cache.get(&addr) {
            return Ok(hit.clone());
        }
        let resolution = self.resolve_uncached(addr)?;
        self.cache.insert(addr, resolution.clone());
        Ok(resolution)
    }
}

fn default_candidates(executable: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = executable.parent() {
        // the compiler driver ships a toolchain-matched symbolizer next to
        // the instrumented binary
        candidates.push(dir.join(ADDR2LINE));
    }
    candidates.push(PathBuf::from(ADDR2LINE));
    candidates.push(PathBuf::from(LLVM_ADDR2LINE));
    candidates
}

/// Parses the two-line `function\nfile:line` output of addr2line.
///
/// Returns `None` for the `??`/`??:0` markers addr2line prints when it has
/// no information, and for anything that does not look like its output.
fn parse_symbolizer_output(output: &str) -> Option<SourceInfo> {
    let mut lines = output.lines();
    let function = normalize_function(lines.next()?);
    let location = lines.next()?.trim();

    // "file:line (discriminator N)" on some toolchains
    let location = location.split(" (").next().unwrap_or(location);
    let (file, line) = location.rsplit_once(':')?;

    if function.is_empty() || function == "??" || file.is_empty() || file == "??" {
        return None;
    }

    let line = match line.trim() {
        "?" => 0,
        other => other.parse().ok()?,
    };

    Some(SourceInfo {
        function,
        file: file.to_string(),
        line,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_output() {
        let info = parse_symbolizer_output("main\n/home/student/main.cpp:12\n").unwrap();
        assert_eq!(info.function, "main");
        assert_eq!(info.file, "/home/student/main.cpp");
        assert_eq!(info.line, 12);
    }

    #[test]
    fn test_parse_output_discriminator() {
        let info =
            parse_symbolizer_output("compute\nC:\\src\\main.cpp:7 (discriminator 2)\n").unwrap();
        assert_eq!(info.file, "C:\\src\\main.cpp");
        assert_eq!(info.line, 7);
    }

    #[test]
    fn test_parse_output_unknown_marker() {
        assert_eq!(parse_symbolizer_output("??\n??:0\n"), None);
        assert_eq!(parse_symbolizer_output("main\n??:0\n"), None);
    }

    #[test]
    fn test_parse_output_unknown_line() {
        let info = parse_symbolizer_output("main\nmain.cpp:?\n").unwrap();
        assert_eq!(info.line, 0);
    }

    #[test]
    fn test_parse_output_garbage() {
        assert_eq!(parse_symbolizer_output(""), None);
        assert_eq!(parse_symbolizer_output("just one line"), None);
        assert_eq!(parse_symbolizer_output("f\nno-colon-here\n"), None);
    }

    #[test]
    fn test_windows_crlf_output() {
        let info = parse_symbolizer_output("main\r\nmain.cpp:3\r\n").unwrap();
        assert_eq!(info.function, "main");
        assert_eq!(info.line, 3);
    }

    #[test]
    fn test_all_candidates_missing() {
        let mut resolver = Addr2LineResolver::with_candidates(
            Path::new("/does/not/exist/prog"),
            vec![PathBuf::from("/does/not/exist/addr2line")],
        );
        let err = resolver.resolve(0x401000).unwrap_err();
        assert_eq!(err.kind(), ResolveErrorKind::ResolverUnavailable);
    }

    #[cfg(unix)]
    #[test]
    fn test_invocable_but_malformed_is_unresolved() {
        // `echo` spawns fine but does not print symbolizer output
        let mut resolver = Addr2LineResolver::with_candidates(
            Path::new("/does/not/exist/prog"),
            vec![PathBuf::from("/bin/echo")],
        );
        assert_eq!(resolver.resolve(0x1000).unwrap(), Resolution::Unresolved);
        // memoised
        assert_eq!(resolver.resolve(0x1000).unwrap(), Resolution::Unresolved);
    }
}
