//! URL extraction from message bodies.
//!
//! Only scheme-qualified URLs (`https://...`, `ssh://...`) are recognised;
//! bare host names are left alone.

use std::sync::OnceLock;

use regex::Regex;

const URL_PATTERN: &str = r#"(?i)\b[a-z][a-z0-9+.\-]*://[^\s<>"'`]+"#;

/// Characters that end a sentence rather than a URL.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '\'', '"'];

fn url_regex() -> Option<&'static Regex> {
    static URL_REGEX: OnceLock<Option<Regex>> = OnceLock::new();
    URL_REGEX.get_or_init(|| Regex::new(URL_PATTERN).ok()).as_ref()
}

/// Returns the first URL found in `text`, if any.
pub fn extract_url(text: &str) -> Option<String> {
    let found = url_regex()?.find(text)?.as_str();
    let url = trim_url(found);
    // A lone scheme ("https://") is not a link
    if url.ends_with("://") {
        return None;
    }
    Some(url.to_string())
}

/// Drops trailing punctuation and unbalanced closing brackets.
fn trim_url(mut url: &str) -> &str {
    loop {
        let trimmed = url.trim_end_matches(TRAILING_PUNCTUATION);
        let trimmed = match trimmed.chars().last() {
            Some(close @ (')' | ']' | '}')) => {
                let open = match close {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                let opens = trimmed.matches(open).count();
                let closes = trimmed.matches(close).count();
                if closes > opens {
                    trimmed.strip_suffix(close).unwrap_or(trimmed)
                } else {
                    trimmed
                }
            }
            _ => trimmed,
        };
        if trimmed.len() == url.len() {
            return trimmed;
        }
        url = trimmed;
    }
}
