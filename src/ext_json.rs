//! Canonical external JSON form of a subscription set.
//!
//! The output is one JSON object mapping object class names to a string of
//! OR-joined parenthesized queries. Queries are deduplicated and sorted per
//! class and class keys are emitted in sorted order, so two logically equal
//! sets serialize identically regardless of insertion order. The format is
//! small and stable enough that a hand-written emitter beats a JSON library
//! dependency.

use std::collections::BTreeMap;
use std::fmt::Write;

/// Render the `(object_class, query_string)` pairs of a subscription set.
pub(crate) fn to_ext_json<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    let mut class_to_queries: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (object_class, query) in pairs {
        let queries = class_to_queries.entry(object_class).or_default();
        if !queries.contains(&query) {
            queries.push(query);
        }
    }

    if class_to_queries.is_empty() {
        return "{}".to_owned();
    }

    let mut out = String::from("{");
    let mut first_class = true;
    for (object_class, mut queries) in class_to_queries {
        // Canonical query order, so the server never sees two orderings of
        // the same set.
        queries.sort_unstable();

        if !first_class {
            out.push(',');
        }
        first_class = false;

        push_json_string(&mut out, object_class);
        out.push(':');

        let mut joined = String::new();
        let mut first_query = true;
        for query in queries {
            if !first_query {
                joined.push_str(" OR ");
            }
            first_query = false;
            joined.push('(');
            joined.push_str(query);
            joined.push(')');
        }
        push_json_string(&mut out, &joined);
    }
    out.push('}');
    out
}

/// Append `value` as a JSON string literal, escaping per RFC 8259.
fn push_json_string(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c < '\u{20}' => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(pairs: &[(&str, &str)]) -> String {
        to_ext_json(pairs.iter().copied())
    }

    #[test]
    fn test_empty_set() {
        assert_eq!(render(&[]), "{}");
    }

    #[test]
    fn test_single_query() {
        assert_eq!(render(&[("Dog", "age > 3")]), r#"{"Dog":"(age > 3)"}"#);
    }

    #[test]
    fn test_queries_joined_and_sorted() {
        let json = render(&[("Dog", "name == \"Rex\""), ("Dog", "age > 3")]);
        assert_eq!(json, r#"{"Dog":"(age > 3) OR (name == \"Rex\")"}"#);
    }

    #[test]
    fn test_duplicate_queries_collapse() {
        let json = render(&[("Dog", "age > 3"), ("Dog", "age > 3")]);
        assert_eq!(json, r#"{"Dog":"(age > 3)"}"#);
    }

    #[test]
    fn test_classes_sorted() {
        let json = render(&[("Person", "age > 18"), ("Dog", "age > 3")]);
        assert_eq!(json, r#"{"Dog":"(age > 3)","Person":"(age > 18)"}"#);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let a = render(&[("Dog", "a == 1"), ("Cat", "b == 2"), ("Dog", "c == 3")]);
        let b = render(&[("Dog", "c == 3"), ("Dog", "a == 1"), ("Cat", "b == 2")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_output_is_valid_json() {
        let json = render(&[
            ("Dog", "name == \"Rex\\Fido\""),
            ("Note", "body CONTAINS 'line\nbreak\tand control \u{01}'"),
        ]);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed["Dog"].as_str().unwrap(),
            "(name == \"Rex\\Fido\")"
        );
        assert!(parsed["Note"].as_str().unwrap().contains("line\nbreak"));
    }

    #[test]
    fn test_control_character_escaping() {
        let mut out = String::new();
        push_json_string(&mut out, "a\u{01}b");
        assert_eq!(out, "\"a\\u0001b\"");
    }
}
