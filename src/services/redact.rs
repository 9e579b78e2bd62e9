//! Strips backend handles from assistant text before it reaches the user.

use std::sync::LazyLock;

use regex::Regex;

// Each pattern takes one trailing blank with it so removal leaves no gap.
static PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // Links, including payment URLs.
        Regex::new(r"https?://\S+[ \t]?").unwrap(),
        // ISO date-times: 2025-11-05T10:00:00, optionally with fraction and offset.
        Regex::new(r"\b\d{4}-\d{2}-\d{2}T\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?[ \t]?").unwrap(),
        // UUID-shaped identifiers.
        Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b[ \t]?").unwrap(),
    ]
});

pub fn redact(input: &str) -> String {
    let mut result = input.to_string();
    for pattern in PATTERNS.iter() {
        result = pattern.replace_all(&result, "").into_owned();
    }
    result
}

/// Streaming variant of [`redact`]. None of the patterns span whitespace,
/// so text is released up to the last whitespace seen and the trailing
/// partial word is held back until it is complete.
#[derive(Debug, Default)]
pub struct TextRedactor {
    pending: String,
}

impl TextRedactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &str) -> String {
        self.pending.push_str(delta);
        match self.pending.rfind(char::is_whitespace) {
            Some(idx) => {
                let cut = idx + self.pending[idx..].chars().next().map_or(1, char::len_utf8);
                let ready: String = self.pending.drain(..cut).collect();
                redact(&ready)
            }
            None => String::new(),
        }
    }

    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        redact(&rest)
    }
}
