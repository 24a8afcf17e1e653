//! Architectural Enforcement
//!
//! Source scans that keep the async crates honest:
//! - No thread sleeps in production code
//! - No blocking networking or HTTP clients
//! - No `std::fs` calls inside `async fn` bodies
//!
//! Only the production part of each file is scanned: everything from the
//! first `#[cfg(test)]` onwards is test code.

use std::fs;
use std::path::{Path, PathBuf};

/// Source trees holding async production code, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["relay/core/src", "relay/daemon/src"];

/// A forbidden pattern
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rule {
    /// `std::thread::sleep` parks a runtime worker
    ThreadSleep,
    /// `std::net` sockets block the runtime
    BlockingNet,
    /// `reqwest::blocking` blocks the runtime
    BlockingHttp,
    /// `std::fs` inside an `async fn`
    BlockingFsInAsync,
}

/// One offending line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// File the line is in
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Which rule it breaks
    pub rule: Rule,
    /// The offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {:?}: {}",
            self.path.display(),
            self.line,
            self.rule,
            self.text
        )
    }
}

/// Workspace root, two levels above this package
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Every `.rs` file under `dir`
#[must_use]
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

/// Scan each production directory under `root`
///
/// # Panics
///
/// Panics if a directory is missing, so a moved crate cannot make the scan
/// pass vacuously.
#[must_use]
pub fn scan_dirs(root: &Path, dirs: &[&str]) -> Vec<Violation> {
    let mut violations = Vec::new();
    for dir in dirs {
        let path = root.join(dir);
        assert!(path.is_dir(), "missing source directory: {}", path.display());
        for file in rust_files(&path) {
            let Ok(source) = fs::read_to_string(&file) else {
                continue;
            };
            violations.extend(scan_source(&file, &source));
        }
    }
    violations
}

/// Scan one file's source text
#[must_use]
pub fn scan_source(path: &Path, source: &str) -> Vec<Violation> {
    let imports_std_fs = source
        .lines()
        .any(|l| l.trim_start().starts_with("use std::fs"));

    let mut violations = Vec::new();
    let mut depth: i64 = 0;
    let mut async_body: Option<i64> = None;
    let mut pending_async = false;

    for (idx, line) in source.lines().enumerate() {
        if line.trim_start().starts_with("#[cfg(test)]") {
            break;
        }

        let code = line.split("//").next().unwrap_or(line);

        if async_body.is_none() && code.contains("async fn ") {
            pending_async = true;
        }

        let opens = count(code, '{');
        let closes = count(code, '}');
        if pending_async && opens > 0 {
            async_body = Some(depth);
            pending_async = false;
        } else if pending_async && code.trim_end().ends_with(';') {
            // Bodiless trait method
            pending_async = false;
        }

        let mut push = |rule| {
            violations.push(Violation {
                path: path.to_path_buf(),
                line: idx + 1,
                rule,
                text: line.trim().to_string(),
            });
        };

        if code.contains("thread::sleep(") {
            push(Rule::ThreadSleep);
        }
        if code.contains("std::net::") || code.contains("use std::net") {
            push(Rule::BlockingNet);
        }
        if code.contains("reqwest::blocking") {
            push(Rule::BlockingHttp);
        }
        if async_body.is_some() && uses_std_fs(code, imports_std_fs) {
            push(Rule::BlockingFsInAsync);
        }

        depth += opens - closes;
        if async_body.is_some_and(|start| depth <= start) {
            async_body = None;
        }
    }

    violations
}

fn uses_std_fs(code: &str, imports_std_fs: bool) -> bool {
    if code.contains("std::fs::") {
        return true;
    }
    imports_std_fs && code.contains("fs::") && !code.contains("tokio::fs::")
}

fn count(code: &str, c: char) -> i64 {
    let n = code.chars().filter(|&ch| ch == c).count();
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(source: &str) -> Vec<Rule> {
        scan_source(Path::new("x.rs"), source)
            .into_iter()
            .map(|v| v.rule)
            .collect()
    }

    #[test]
    fn test_thread_sleep_detected() {
        let source = "fn wait() {\n    std::thread::sleep(Duration::from_millis(10));\n}\n";
        assert_eq!(rules(source), vec![Rule::ThreadSleep]);
    }

    #[test]
    fn test_tokio_sleep_allowed() {
        let source = "async fn wait() {\n    tokio::time::sleep(d).await;\n}\n";
        assert!(rules(source).is_empty());
    }

    #[test]
    fn test_std_fs_allowed_in_sync_fn() {
        let source = "use std::fs;\n\nfn load() {\n    fs::read_to_string(p);\n}\n";
        assert!(rules(source).is_empty());
    }

    #[test]
    fn test_std_fs_in_async_fn_detected() {
        let source = "use std::fs;\n\nasync fn stop() {\n    if x {\n        fs::remove_file(p);\n    }\n}\n\nfn after() {\n    fs::remove_file(p);\n}\n";
        let found = scan_source(Path::new("x.rs"), source);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rule, Rule::BlockingFsInAsync);
        assert_eq!(found[0].line, 5);
    }

    #[test]
    fn test_async_signature_across_lines() {
        let source = "async fn run(\n    a: u32,\n) -> Result<()> {\n    std::fs::write(p, b)?;\n}\n";
        assert_eq!(rules(source), vec![Rule::BlockingFsInAsync]);
    }

    #[test]
    fn test_bodiless_async_fn_does_not_leak() {
        let source = "use std::fs;\n\ntrait T {\n    async fn go(&self);\n}\n\nfn load() {\n    fs::read(p);\n}\n";
        assert!(rules(source).is_empty());
    }

    #[test]
    fn test_tokio_fs_allowed_in_async_fn() {
        let source = "use std::fs;\n\nasync fn stop() {\n    tokio::fs::remove_file(p).await;\n}\n";
        assert!(rules(source).is_empty());
    }

    #[test]
    fn test_test_module_skipped() {
        let source = "fn ok() {}\n\n#[cfg(test)]\nmod tests {\n    fn t() { std::thread::sleep(d); }\n}\n";
        assert!(rules(source).is_empty());
    }

    #[test]
    fn test_comments_ignored() {
        let source = "fn ok() {\n    // never std::thread::sleep(d) here\n}\n";
        assert!(rules(source).is_empty());
    }

    #[test]
    fn test_blocking_net_and_http_detected() {
        let source = "use std::net::TcpStream;\nfn f() { reqwest::blocking::get(u); }\n";
        assert_eq!(rules(source), vec![Rule::BlockingNet, Rule::BlockingHttp]);
    }
}
