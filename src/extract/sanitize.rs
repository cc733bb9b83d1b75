//! Sanitisation of untrusted page text before it reaches the LLM.
//!
//! Fetched text is data, not instructions. It is normalised, then wrapped
//! in session-scoped delimiter tags so the prompt can tell the model where
//! untrusted content begins and ends. Model output that leaks the tag
//! sequence, or that smuggles in implausible URLs, is discarded.

use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

/// Normalise untrusted text: strip control and zero-width characters,
/// standardise whitespace runs.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for c in text.chars() {
        let mapped = match c {
            // Zero-width and BOM characters are a classic smuggling vector.
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' | '\u{2060}' => continue,
            '\n' => Some('\n'),
            c if c.is_control() => None,
            c if c.is_whitespace() && c != '\n' => Some(' '),
            c => Some(c),
        };
        match mapped {
            Some(' ') => {
                if !last_was_space {
                    out.push(' ');
                }
                last_was_space = true;
            }
            Some(c) => {
                out.push(c);
                last_was_space = c == '\n';
            }
            None => {}
        }
    }
    out.trim().to_string()
}

/// Session-scoped wrapper for untrusted text.
pub struct Sanitizer {
    tag: String,
}

impl Sanitizer {
    /// Create a sanitizer with a fresh session tag.
    pub fn new_session() -> Self {
        Self {
            tag: format!("data-{}", Uuid::new_v4().simple()),
        }
    }

    /// The session tag, for tests and audit logs.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Wrap untrusted text in the session delimiters, normalising it first.
    /// Any occurrence of the tag inside the text itself is stripped so the
    /// wrapper cannot be closed early.
    pub fn wrap(&self, text: &str) -> String {
        let normalized = normalize(text).replace(&self.tag, "");
        format!("<{tag}>\n{body}\n</{tag}>", tag = self.tag, body = normalized)
    }

    /// Whether model output leaks the session tag sequence.
    pub fn leaks_tag(&self, output: &str) -> bool {
        output.contains(&self.tag)
    }
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"[a-zA-Z][a-zA-Z0-9+.-]*://[^\s"'<>\)\]]+"#).expect("url pattern compiles")
    })
}

/// Whether text contains a URL that should not appear in model output:
/// non-http schemes, embedded credentials, raw IPs, or hosts without a dot.
pub fn has_implausible_url(text: &str) -> bool {
    for found in url_pattern().find_iter(text) {
        let candidate = found.as_str();
        let Ok(url) = url::Url::parse(candidate) else {
            return true;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return true;
        }
        if !url.username().is_empty() || url.password().is_some() {
            return true;
        }
        match url.host_str() {
            Some(host) => {
                if !host.contains('.') || host.chars().all(|c| c.is_ascii_digit() || c == '.') {
                    return true;
                }
            }
            None => return true,
        }
    }
    false
}
