//! Identifier normalisation.
//!
//! Names are matched case-insensitively and without backend quoting, so
//! `"Users"`, `` `users` ``, `[users]` and `users` all refer to the same table.

/// Normalise an identifier for comparison.
pub fn normalize_ident(name: &str) -> String {
    let trimmed = name.trim();
    let unquoted = strip_quotes(trimmed);
    unquoted.to_ascii_lowercase()
}

/// Compare two identifiers using the normalised form.
pub fn ident_eq(a: &str, b: &str) -> bool {
    normalize_ident(a) == normalize_ident(b)
}

fn strip_quotes(name: &str) -> &str {
    let pairs = [('"', '"'), ('`', '`'), ('[', ']')];
    for (open, close) in pairs {
        if name.len() >= 2 && name.starts_with(open) && name.ends_with(close) {
            return &name[1..name.len() - 1];
        }
    }
    name
}

/// Returns true if `c` can appear inside an unquoted SQL identifier.
pub(crate) fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Word-boundary search for an identifier inside free SQL text.
///
/// This is a heuristic: it cannot see through dynamic SQL and will match
/// string literals that happen to contain the name.
pub fn references_identifier(text: &str, name: &str) -> bool {
    let needle = normalize_ident(name);
    if needle.is_empty() {
        return false;
    }
    let haystack = text.to_ascii_lowercase();
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(&needle) {
        let begin = start + pos;
        let end = begin + needle.len();
        let before_ok = haystack[..begin]
            .chars()
            .next_back()
            .map_or(true, |c| !is_ident_char(c));
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !is_ident_char(c));
        if before_ok && after_ok {
            return true;
        }
        start = begin + 1;
        while !haystack.is_char_boundary(start) {
            start += 1;
        }
    }
    false
}
