//! Integration Test: No unwrap()/expect() in the Core Library
//!
//! **Policy**: Production code in `bridge/core` propagates errors with `?` or
//! turns them into a terminal marker. A panic on a worker thread would be
//! contained, but it still aborts a stream for a reason the caller cannot
//! match on.
//!
//! **Exceptions**: test code, and `unwrap_or*` combinators.

use architectural_enforcement::production_lines;

#[test]
fn test_no_unwrap_or_expect_in_core() {
    let violations: Vec<String> = production_lines("bridge/core/src")
        .into_iter()
        .filter(|line| {
            let code = line.code();
            code.contains(".unwrap()") || code.contains(".expect(")
        })
        .map(|line| line.to_string())
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ unwrap()/expect() found in core production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }

        panic!(
            "\nFound {} unwrap/expect violation(s).\nPropagate the error instead.",
            violations.len()
        );
    }
}
