//! Unit/node subscription pattern matching.
//!
//! `*` matches any (possibly empty) run of characters, `?` matches exactly
//! one character, everything else matches literally. Patterns subscribers
//! supply are short, so a small backtracking matcher is preferable to
//! pulling in a filesystem-glob crate (those match path components, not
//! plain strings, and pull in directory-walking machinery we don't need
//! here).

/// Returns true if `pattern` matches the whole of `text`.
pub fn matches(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    matches_from(&t, &p)
}

fn matches_from(t: &[char], p: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') => matches_from(t, &p[1..]) || (!t.is_empty() && matches_from(&t[1..], p)),
        Some('?') => !t.is_empty() && matches_from(&t[1..], &p[1..]),
        Some(c) => t.first() == Some(c) && matches_from(&t[1..], &p[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_empty() {
        assert!(matches("", "*"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(matches("x", "?"));
        assert!(!matches("xt", "?"));
    }

    #[test]
    fn literal_must_match_exactly() {
        assert!(matches("foo.service", "foo.service"));
        assert!(!matches("foo.service", "foo.socket"));
    }

    #[test]
    fn combined_pattern() {
        assert!(matches("glob.check.service", "*.ch??k.*"));
        assert!(!matches("glob.check.service", "*.ch?k.*"));
    }

    #[test]
    fn star_prefix_suffix() {
        assert!(matches("app-foo.service", "app-*.service"));
        assert!(matches("app-.service", "app-*.service"));
        assert!(!matches("app-foo.socket", "app-*.service"));
    }
}
