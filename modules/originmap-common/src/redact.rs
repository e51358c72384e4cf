//! Secret redaction for error previews. Anything that reaches a response
//! body or a log line goes through here first.

use std::sync::OnceLock;

use regex::Regex;

fn patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Regex::new(r"(?i)Bearer\s+[^\s\x22']+").unwrap(),
                "Bearer [REDACTED]",
            ),
            (
                Regex::new(r"(?i)x-functions-key\s*[:=]\s*[^\s\x22']+").unwrap(),
                "x-functions-key: [REDACTED]",
            ),
            (
                Regex::new(r"(?i)api[_-]?key\s*[:=]\s*[^\s\x22']+").unwrap(),
                "api_key: [REDACTED]",
            ),
        ]
    })
}

/// Strip bearer tokens, function keys and api keys from arbitrary text.
pub fn redact_secrets(text: &str) -> String {
    let mut out = text.to_string();
    for (pattern, replacement) in patterns() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    out
}

/// Redacted preview capped at `max_chars`, on a char boundary.
pub fn text_preview(text: &str, max_chars: usize) -> String {
    let redacted = redact_secrets(text);
    redacted.chars().take(max_chars).collect()
}

/// First line of an error's debug/stack rendering, redacted and capped.
pub fn stack_first_line(text: &str) -> String {
    let first = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    text_preview(first, 300)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_tokens_are_redacted() {
        let out = redact_secrets("Authorization: Bearer sk-abc123 rest");
        assert!(out.contains("Bearer [REDACTED]"));
        assert!(!out.contains("sk-abc123"));
    }

    #[test]
    fn api_keys_are_redacted() {
        let out = redact_secrets("failed with api_key=secret123 at line 9");
        assert!(!out.contains("secret123"));
    }

    #[test]
    fn preview_is_capped() {
        let long = "x".repeat(1000);
        assert_eq!(text_preview(&long, 100).len(), 100);
    }

    #[test]
    fn stack_first_line_skips_blank_lines() {
        assert_eq!(stack_first_line("\n\n  error: boom\n  at foo"), "error: boom");
    }
}
