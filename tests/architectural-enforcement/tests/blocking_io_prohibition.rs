//! Blocking I/O Prohibition
//!
//! Async code in the relay crates must use `tokio::net`, `tokio::fs` and the
//! async `reqwest` client. Synchronous helpers that run before the runtime
//! serves traffic (config loading, socket preparation) may use `std::fs`.

use architectural_enforcement::{scan_dirs, workspace_root, Rule, PRODUCTION_DIRS};

#[test]
fn test_no_blocking_io_in_production_code() {
    let violations: Vec<_> = scan_dirs(&workspace_root(), PRODUCTION_DIRS)
        .into_iter()
        .filter(|v| v.rule != Rule::ThreadSleep)
        .collect();

    if !violations.is_empty() {
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nRequired: tokio::net, tokio::fs, reqwest async client.");
        panic!(
            "Found {} blocking I/O violation(s) in production code",
            violations.len()
        );
    }
}

#[test]
fn test_scan_covers_every_production_file() {
    let root = workspace_root();
    let files: Vec<_> = PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| architectural_enforcement::rust_files(&root.join(dir)))
        .collect();

    assert!(files.iter().any(|f| f.ends_with("relay/core/src/generator.rs")));
    assert!(files.iter().any(|f| f.ends_with("relay/daemon/src/server.rs")));
}
