//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. Producers and
//! consumers wait on the handoff queue's condition variables; pool and
//! provider waits use deadlines on a condition, never a sleep loop.
//!
//! **Exceptions**: test code (`#[cfg(test)]` modules and `tests/` directories
//! are not scanned).

use architectural_enforcement::production_lines;

const PRODUCTION_DIRS: &[&str] = &["bridge/core/src", "bridge/demo/src"];

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<String> = PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| production_lines(dir))
        .filter(|line| {
            let code = line.code();
            code.contains("::sleep(") || code.contains(".sleep(")
        })
        .map(|line| line.to_string())
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Wait on a Condvar (with a deadline if needed) instead.");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
