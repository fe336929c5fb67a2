use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z0-9]+").unwrap())
}

/// Unique tokens of a document field, lowercased alphanumerics.
pub fn tokenize_text(text: &str) -> HashSet<String> {
    token_re()
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Ordered tokens of a query string.
pub fn tokenize_query(query: &str) -> Vec<String> {
    token_re()
        .find_iter(&query.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}
