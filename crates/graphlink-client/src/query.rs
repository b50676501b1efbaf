//! Query text utilities: parameter interpolation, value escaping,
//! validation, and statement classification.
//!
//! Everything here is a pure function over the query text; nothing touches
//! the session boundary.

use graphlink_proto::Params;
use serde_json::Value;
use std::collections::BTreeMap;

/// Statement class, detected from the leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    /// Schema statements (CREATE, DROP, ALTER).
    Ddl,
    /// Data mutations (INSERT, UPDATE, DELETE).
    Dml,
    /// Read queries (MATCH, FETCH, GO).
    Query,
    /// Administrative statements (SHOW, DESCRIBE).
    Admin,
    /// Anything else.
    Other,
}

impl QueryType {
    /// Stable lowercase name, used as a statistics key.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Ddl => "ddl",
            QueryType::Dml => "dml",
            QueryType::Query => "query",
            QueryType::Admin => "admin",
            QueryType::Other => "other",
        }
    }
}

/// Statements that must never reach the transport, matched
/// case-insensitively anywhere in the text. A safety net, not a parser.
const DENYLIST: &[&str] = &[
    "drop space",
    "delete from",
    "truncate",
    "system",
    "use undefined",
];

/// Escape a parameter value into its query-literal form.
///
/// `null` becomes the literal `NULL`, booleans and numbers render as bare
/// text, strings are double-quoted with `"`, `'`, and `\` escaped, and
/// arrays/objects render as structurally escaped literals.
pub fn escape_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("\"{}\"", escape_string(s)),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(escape_value).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, escape_value(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            _ => out.push(c),
        }
    }
    out
}

/// Apply [`escape_value`] to every value of a property map.
pub fn escape_properties(properties: &Params) -> BTreeMap<String, String> {
    properties
        .iter()
        .map(|(k, v)| (k.clone(), escape_value(v)))
        .collect()
}

/// Replace every `:name` placeholder with the escaped value of
/// `params["name"]`.
///
/// Repeated placeholders are all replaced; placeholders with no matching
/// parameter are left verbatim.
pub fn interpolate_params(query: &str, params: &Params) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != ':' {
            out.push(c);
            continue;
        }

        // Scan the identifier following the colon.
        let rest = &query[i + 1..];
        let ident_len = rest
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();

        let ident = &rest[..ident_len];
        if ident.is_empty() || !ident.chars().next().is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_') {
            out.push(c);
            continue;
        }

        match params.get(ident) {
            Some(value) => {
                out.push_str(&escape_value(value));
                for _ in 0..ident_len {
                    chars.next();
                }
            }
            None => out.push(c),
        }
    }

    out
}

/// Check a query against the destructive-statement denylist.
///
/// Returns `false` for empty or whitespace-only text and for any statement
/// containing a denylisted fragment.
pub fn validate_query(query: &str) -> bool {
    if query.trim().is_empty() {
        return false;
    }

    let lowered = query.to_lowercase();
    !DENYLIST.iter().any(|banned| lowered.contains(banned))
}

/// Classify a statement by its leading keyword.
pub fn detect_query_type(query: &str) -> QueryType {
    let first = query
        .split_whitespace()
        .next()
        .map(str::to_uppercase)
        .unwrap_or_default();

    match first.as_str() {
        "CREATE" | "DROP" | "ALTER" => QueryType::Ddl,
        "INSERT" | "UPDATE" | "DELETE" => QueryType::Dml,
        "MATCH" | "FETCH" | "GO" => QueryType::Query,
        "SHOW" | "DESCRIBE" => QueryType::Admin,
        _ => QueryType::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_escape_scalars() {
        assert_eq!(escape_value(&Value::Null), "NULL");
        assert_eq!(escape_value(&json!(true)), "true");
        assert_eq!(escape_value(&json!(false)), "false");
        assert_eq!(escape_value(&json!(42)), "42");
        assert_eq!(escape_value(&json!(-3.5)), "-3.5");
    }

    #[test]
    fn test_escape_strings() {
        assert_eq!(escape_value(&json!("plain")), "\"plain\"");
        assert!(escape_value(&json!("a\"b")).contains("\\\""));
        assert_eq!(escape_value(&json!("it's")), "\"it\\'s\"");
        assert_eq!(escape_value(&json!("back\\slash")), "\"back\\\\slash\"");
    }

    #[test]
    fn test_escape_structures() {
        assert_eq!(escape_value(&json!([1, "two", null])), "[1, \"two\", NULL]");
        assert_eq!(
            escape_value(&json!({"name": "Ann", "age": 3})),
            "{age: 3, name: \"Ann\"}"
        );
    }

    #[test]
    fn test_escape_properties() {
        let props = params(&[("name", json!("Ann")), ("active", json!(true))]);
        let escaped = escape_properties(&props);

        assert_eq!(escaped["name"], "\"Ann\"");
        assert_eq!(escaped["active"], "true");
    }

    #[test]
    fn test_interpolate_basic() {
        let p = params(&[("name", json!("Ann")), ("age", json!(30))]);
        let out = interpolate_params("MATCH (v) WHERE v.name == :name AND v.age > :age", &p);
        assert_eq!(out, "MATCH (v) WHERE v.name == \"Ann\" AND v.age > 30");
    }

    #[test]
    fn test_interpolate_repeated_placeholder() {
        let p = params(&[("id", json!(7))]);
        let out = interpolate_params("GO FROM :id OVER knows WHERE $$.id != :id", &p);
        assert_eq!(out, "GO FROM 7 OVER knows WHERE $$.id != 7");
    }

    #[test]
    fn test_interpolate_unmatched_left_verbatim() {
        let p = params(&[("name", json!("Ann"))]);
        let out = interpolate_params("FETCH PROP ON tag :missing, :name", &p);
        assert_eq!(out, "FETCH PROP ON tag :missing, \"Ann\"");
    }

    #[test]
    fn test_interpolate_does_not_clobber_longer_names() {
        let p = params(&[("name", json!("Ann"))]);
        let out = interpolate_params("RETURN :name_ext, :name", &p);
        assert_eq!(out, "RETURN :name_ext, \"Ann\"");
    }

    #[test]
    fn test_interpolate_bare_colon() {
        let p = Params::new();
        assert_eq!(interpolate_params("RETURN map:{}", &p), "RETURN map:{}");
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(!validate_query(""));
        assert!(!validate_query("   \t\n"));
    }

    #[test]
    fn test_validate_denylist() {
        assert!(!validate_query("DROP SPACE foo"));
        assert!(!validate_query("drop space foo"));
        assert!(!validate_query("DELETE FROM users"));
        assert!(!validate_query("TRUNCATE edges"));
        assert!(!validate_query("SHOW SYSTEM INFO"));
        assert!(!validate_query("USE undefined"));
    }

    #[test]
    fn test_validate_accepts_normal_statements() {
        assert!(validate_query("USE test_space"));
        assert!(validate_query("MATCH (v:person) RETURN v"));
        assert!(validate_query("SHOW SPACES"));
    }

    #[test]
    fn test_detect_query_type() {
        assert_eq!(detect_query_type("  match (v) return v"), QueryType::Query);
        assert_eq!(detect_query_type("FETCH PROP ON t 1"), QueryType::Query);
        assert_eq!(detect_query_type("GO FROM 1 OVER e"), QueryType::Query);
        assert_eq!(detect_query_type("Create Space x"), QueryType::Ddl);
        assert_eq!(detect_query_type("alter tag t ADD (p int)"), QueryType::Ddl);
        assert_eq!(detect_query_type("INSERT VERTEX t VALUES 1:()"), QueryType::Dml);
        assert_eq!(detect_query_type("SHOW HOSTS"), QueryType::Admin);
        assert_eq!(detect_query_type("describe tag t"), QueryType::Admin);
        assert_eq!(detect_query_type("USE test"), QueryType::Other);
        assert_eq!(detect_query_type(""), QueryType::Other);
    }
}
