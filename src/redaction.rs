//! Scrubbing of credentials from completion endpoint responses before they
//! are logged or shown in a notification.

use once_cell::sync::Lazy;
use regex::Regex;

const MAX_ERROR_BODY_CHARS: usize = 300;

static SECRET_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9_\-\.=]{8,}").expect("valid bearer regex"),
            "Bearer [REDACTED]",
        ),
        (
            Regex::new(r"\beyJ[A-Za-z0-9_\-]{8,}\.[A-Za-z0-9_\-]{8,}\.[A-Za-z0-9_\-]{8,}\b").expect("valid jwt regex"),
            "[REDACTED_JWT]",
        ),
        (
            Regex::new(r#"(?i)("?(?:api[_-]?key|apikey|token|secret|password)"?\s*[:=]\s*)"?[A-Za-z0-9_\-\.]{6,}"?"#)
                .expect("valid named secret regex"),
            "${1}[REDACTED]",
        ),
        (
            Regex::new(r"\bsk-[A-Za-z0-9_\-]{20,}\b").expect("valid key regex"),
            "[REDACTED_KEY]",
        ),
    ]
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redacted {
    pub content: String,
    pub redaction_count: usize,
}

/// Replaces credential-shaped substrings. A configured token, when given, is
/// removed verbatim as well.
#[derive(Debug, Default, Clone)]
pub struct Redactor {
    known_secret: Option<String>,
}

impl Redactor {
    pub fn new(known_secret: Option<String>) -> Self {
        Self {
            known_secret: known_secret.filter(|secret| secret.len() >= 6),
        }
    }

    pub fn redact(&self, input: &str) -> Redacted {
        let mut content = input.to_string();
        let mut redaction_count = 0usize;

        if let Some(secret) = &self.known_secret {
            let hits = content.matches(secret.as_str()).count();
            if hits > 0 {
                redaction_count += hits;
                content = content.replace(secret.as_str(), "[REDACTED]");
            }
        }

        for (pattern, replacement) in SECRET_PATTERNS.iter() {
            let hits = pattern.find_iter(&content).count();
            if hits == 0 {
                continue;
            }
            redaction_count += hits;
            content = pattern.replace_all(&content, *replacement).into_owned();
        }

        Redacted {
            content,
            redaction_count,
        }
    }

    /// Redacted, whitespace-collapsed and truncated form of an error body.
    pub fn summarize_error_body(&self, body: &str) -> String {
        let redacted = self.redact(body).content;
        let collapsed = redacted.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.chars().count() <= MAX_ERROR_BODY_CHARS {
            return collapsed;
        }
        let mut truncated = collapsed.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
        truncated.push('…');
        truncated
    }
}
