//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! across the workspace:
//! - No sleep() calls in production code (wait on a condition instead)
//! - No unwrap()/expect() in production code of the core library
//!
//! The helpers here load production sources: every `.rs` file under a
//! directory, cut off at its `#[cfg(test)]` module.

use std::fs;
use std::path::{Path, PathBuf};

/// One production source line
#[derive(Debug, Clone)]
pub struct SourceLine {
    /// File the line belongs to
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Line text
    pub text: String,
}

impl SourceLine {
    /// The line without a trailing `//` comment (and empty for comment lines)
    #[must_use]
    pub fn code(&self) -> &str {
        self.text.split("//").next().unwrap_or("")
    }
}

impl std::fmt::Display for SourceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.number, self.text.trim())
    }
}

/// Workspace root, resolved from this package's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// Production lines of every `.rs` file under `dir` (relative to the
/// workspace root)
///
/// Scanning of a file stops at its first `#[cfg(test)]`.
#[must_use]
pub fn production_lines(dir: &str) -> Vec<SourceLine> {
    let root = workspace_root().join(dir);
    let mut lines = Vec::new();

    for entry in walkdir::WalkDir::new(&root)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("rs") {
            continue;
        }
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };

        for (idx, text) in content.lines().enumerate() {
            if text.trim_start().starts_with("#[cfg(test)]") {
                break;
            }
            lines.push(SourceLine {
                path: path.to_path_buf(),
                number: idx + 1,
                text: text.to_string(),
            });
        }
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_strips_comments() {
        let line = SourceLine {
            path: PathBuf::from("x.rs"),
            number: 3,
            text: "let a = b; // .unwrap() here is fine".to_string(),
        };
        assert_eq!(line.code(), "let a = b; ");
        assert_eq!(line.to_string(), "x.rs:3 - let a = b; // .unwrap() here is fine");
    }

    #[test]
    fn test_core_sources_found() {
        let lines = production_lines("bridge/core/src");
        assert!(lines.iter().any(|l| l.path.ends_with("lib.rs")));
    }
}
