//! Sleep Prohibition
//!
//! Production code in the relay crates must never park a runtime worker with
//! `std::thread::sleep`. Waiting is done on I/O, channels, or
//! `tokio::time` timers.

use architectural_enforcement::{scan_dirs, workspace_root, Rule, PRODUCTION_DIRS};

#[test]
fn test_no_thread_sleep_in_production_code() {
    let violations: Vec<_> = scan_dirs(&workspace_root(), PRODUCTION_DIRS)
        .into_iter()
        .filter(|v| v.rule == Rule::ThreadSleep)
        .collect();

    if !violations.is_empty() {
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse tokio::time::sleep, an interval, or wait on the event itself.");
        panic!(
            "Found {} thread sleep violation(s) in production code",
            violations.len()
        );
    }
}
