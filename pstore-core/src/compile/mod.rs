/// Backend compilers
///
/// Each compiler consumes a `Query` and produces backend-native input:
/// - [`sql`]: parameterized SQL statements for relational engines
/// - [`document`]: MongoDB-style filter documents and aggregation pipelines
/// - [`kv`]: an in-process evaluation plan for key-value stores
///
/// All three share the operator semantics defined by
/// [`BasicCondition::validate`](crate::condition::BasicCondition::validate).

pub mod document;
pub mod kv;
pub mod sql;

use crate::{Error, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Field name grouping output uses for the per-group row count
pub const COUNT_FIELD: &str = "count";

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("static regex")
    })
}

/// Reject anything that is not a plain (optionally table-qualified) identifier
pub(crate) fn check_identifier(name: &str) -> Result<()> {
    if identifier_re().is_match(name) {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid identifier: {:?}", name)))
    }
}

/// Escape LIKE metacharacters so the text matches literally
pub(crate) fn escape_like(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Translate a LIKE pattern to an anchored regex.
///
/// `%` becomes `.*` and `\x` matches `x` literally; every other character,
/// `_` included, is matched literally. Document stores have no
/// single-character wildcard here.
pub(crate) fn like_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut chars = pattern.chars();
    let mut buf = [0u8; 4];
    while let Some(ch) = chars.next() {
        match ch {
            '%' => out.push_str(".*"),
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push_str(&regex::escape(next.encode_utf8(&mut buf)));
                } else {
                    out.push_str(&regex::escape("\\"));
                }
            }
            other => out.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    out.push('$');
    out
}

/// Full LIKE matching with `%` (any run) and `_` (one character), case
/// sensitive. Used by the in-process matcher.
pub(crate) fn like_matches(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    let (mut ti, mut pi) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '\\' && pi + 1 < p.len() {
            if t[ti] == p[pi + 1] {
                ti += 1;
                pi += 2;
                continue;
            }
        } else if pi < p.len() && p[pi] == '%' {
            backtrack = Some((pi, ti));
            pi += 1;
            continue;
        } else if pi < p.len() && (p[pi] == '_' || p[pi] == t[ti]) {
            ti += 1;
            pi += 1;
            continue;
        }
        match backtrack {
            Some((bp, bt)) => {
                pi = bp + 1;
                ti = bt + 1;
                backtrack = Some((bp, bt + 1));
            }
            None => return false,
        }
    }
    while pi < p.len() && p[pi] == '%' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers() {
        assert!(check_identifier("age").is_ok());
        assert!(check_identifier("users.id").is_ok());
        assert!(check_identifier("age; DROP TABLE users").is_err());
        assert!(check_identifier("\"quoted\"").is_err());
    }

    #[test]
    fn test_like_to_regex() {
        assert_eq!(like_to_regex("%ali%"), "^.*ali.*$");
        assert_eq!(like_to_regex("a.b%"), "^a\\.b.*$");
        assert_eq!(like_to_regex("a_c"), "^a_c$");
        assert_eq!(like_to_regex("100\\%"), "^100%$");
    }

    #[test]
    fn test_like_matches() {
        assert!(like_matches("alice", "%lic%"));
        assert!(like_matches("alice", "a_ice"));
        assert!(like_matches("alice", "alice"));
        assert!(like_matches("", "%"));
        assert!(!like_matches("alice", "bob%"));
        assert!(!like_matches("Alice", "alice"));
        assert!(like_matches("100%", "100\\%"));
        assert!(!like_matches("1000", "100\\%"));
        assert!(like_matches("abcabc", "%abc"));
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert!(like_matches("50%_off", &format!("%{}%", escape_like("%_"))));
    }

    proptest::proptest! {
        #[test]
        fn prop_escaped_literal_matches_itself(text in "[a-c%_\\\\]{0,12}") {
            let pattern = escape_like(&text);
            proptest::prop_assert!(like_matches(&text, &pattern));
            let re = Regex::new(&like_to_regex(&pattern)).unwrap();
            proptest::prop_assert!(re.is_match(&text));
        }

        #[test]
        fn prop_percent_wraps_any_substring(text in "[a-c]{0,10}", start in 0usize..10, len in 0usize..10) {
            let start = start.min(text.len());
            let end = (start + len).min(text.len());
            let pattern = format!("%{}%", escape_like(&text[start..end]));
            proptest::prop_assert!(like_matches(&text, &pattern));
        }
    }
}
