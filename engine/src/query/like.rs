//! LIKE pattern handling shared by every evaluator.

use crate::{error::Result, Error};
use regex::{Regex, RegexBuilder};

/// Compile a LIKE pattern into an anchored, case-insensitive regex.
///
/// `%` matches any run of characters (newlines included), `_` matches exactly one.
/// Everything else is literal.
pub fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    let mut literal = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut literal))),
        }
    }
    source.push('$');

    RegexBuilder::new(&source)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| Error::InvalidQuery(format!("bad LIKE pattern '{}': {}", pattern, e)))
}

/// Replace every character that isn't an ASCII letter or digit with `_`.
///
/// Use before embedding user input in a LIKE pattern.
pub fn sanitize_like_string(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
