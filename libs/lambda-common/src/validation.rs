//! Pre-queue screening of submitted code.
//!
//! This is a cheap filter for obvious abuse, not the isolation boundary;
//! the sandbox container is.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ValidationError;

lazy_static! {
    static ref DENYLIST: Vec<(&'static str, Regex)> = [
        r#"require\s*\(\s*['"]child_process['"]\s*\)"#,
        r#"require\s*\(\s*['"]fs['"]\s*\)"#,
        r#"require\s*\(\s*['"]net['"]\s*\)"#,
        r#"require\s*\(\s*['"]http['"]\s*\)"#,
        r#"require\s*\(\s*['"]https['"]\s*\)"#,
        r"process\.exit",
        r"process\.kill",
    ]
    .into_iter()
    .filter_map(|pattern| Regex::new(pattern).ok().map(|re| (pattern, re)))
    .collect();
}

/// Reject empty, oversized, or obviously dangerous code.
/// `max_chars` counts characters, not bytes.
pub fn validate_code(code: &str, max_chars: usize) -> Result<(), ValidationError> {
    if code.trim().is_empty() {
        return Err(ValidationError::Empty);
    }

    let len = code.chars().count();
    if len > max_chars {
        return Err(ValidationError::TooLarge { len, max: max_chars });
    }

    if let Some((pattern, _)) = DENYLIST.iter().find(|(_, re)| re.is_match(code)) {
        return Err(ValidationError::Dangerous {
            pattern: (*pattern).to_string(),
        });
    }

    Ok(())
}
