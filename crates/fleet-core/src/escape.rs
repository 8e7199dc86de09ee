//! D-Bus object-path segment escaping.
//!
//! Node names and unit names are arbitrary operator-chosen strings; object
//! paths only allow `[A-Za-z0-9_]` per segment. Every byte that isn't ASCII
//! alphanumeric, plus any leading digit, is replaced by `_` followed by two
//! lower-case hex digits. The empty string escapes to a single `_`.

/// Escapes `s` into a string that is safe to use as one object-path
/// segment. The transform is injective: no two distinct inputs produce the
/// same output.
pub fn escape(s: &str) -> String {
    if s.is_empty() {
        return "_".to_string();
    }

    let mut out = String::with_capacity(s.len());
    for (i, b) in s.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() && !(i == 0 && b.is_ascii_digit());
        if keep {
            out.push(b as char);
        } else {
            out.push('_');
            out.push_str(&format!("{:02x}", b));
        }
    }
    out
}

/// Inverse of [`escape`]. Returns `None` if `s` is not a well-formed escaped
/// segment (odd hex run, non-hex digits after `_`, or a literal `_` used
/// where an escape was expected).
pub fn unescape(s: &str) -> Option<String> {
    if s == "_" {
        return Some(String::new());
    }

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            let hex = s.get(i + 1..i + 3)?;
            let byte = u8::from_str_radix(hex, 16).ok()?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_escapes_to_sentinel() {
        assert_eq!(escape(""), "_");
    }

    #[test]
    fn plain_alpha_is_unchanged() {
        assert_eq!(escape("a"), "a");
        assert_eq!(escape("laptop"), "laptop");
    }

    #[test]
    fn leading_digit_is_escaped() {
        assert_eq!(escape("1x"), "_31x");
    }

    #[test]
    fn dot_is_escaped() {
        assert_eq!(escape("a.b"), "a_2eb");
    }

    #[test]
    fn unit_name_round_trips() {
        for name in ["simple.service", "app-foo.service", "1numeric.service", ""] {
            let escaped = escape(name);
            assert_eq!(unescape(&escaped).as_deref(), Some(name));
        }
    }

    #[test]
    fn escaped_output_is_path_safe() {
        for name in ["a.b", "weird name!", "1x", ""] {
            let escaped = escape(name);
            assert!(escaped
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_'));
        }
    }
}
