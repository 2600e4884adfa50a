//! Secret redaction for command text written to diagnostics.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

static SECRET_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(--?(?:password|passwd|token|secret|api[-_]?key)\s+)([^\s'"]+)"#,
        r#"((?:password|passwd|token|secret|api[-_]?key)\s*=\s*)([^\s'"]+)"#,
        r#"((?:authorization:\s*bearer)\s+)([^\s'"]+)"#,
    ]
    .iter()
    .map(|pattern| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("secret pattern should be valid")
    })
    .collect()
});

/// Replace credential values in `command` with `***`.
pub fn redact_command(command: &str) -> String {
    let mut sanitized = command.to_string();
    for pattern in SECRET_PATTERNS.iter() {
        sanitized = pattern.replace_all(&sanitized, "${1}***").into_owned();
    }
    sanitized
}
