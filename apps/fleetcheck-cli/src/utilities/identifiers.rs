/// PostgreSQL identifiers are truncated at 63 bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Sanitizes a tenant/company name into a safe schema identifier.
/// - Lowercases
/// - Replaces every non `[a-z0-9_]` character with an underscore
/// - Collapses consecutive underscores
/// - Trims leading/trailing underscores
/// - Truncates to the backend identifier limit
///
/// The function is deterministic and idempotent: sanitizing an already
/// sanitized name returns it unchanged.
pub fn sanitize_schema_name(raw: &str) -> String {
    let mut s = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '_' })
        .collect::<String>();
    while s.contains("__") {
        s = s.replace("__", "_");
    }
    let s = s.trim_matches('_');
    let s = if s.len() > MAX_IDENTIFIER_LEN {
        s[..MAX_IDENTIFIER_LEN].trim_end_matches('_')
    } else {
        s
    };
    if s.is_empty() {
        "_".to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_basic() {
        assert_eq!(sanitize_schema_name("Acme Corp"), "acme_corp");
        assert_eq!(sanitize_schema_name("acme-corp, inc."), "acme_corp_inc");
    }

    #[test]
    fn test_sanitize_charset() {
        for c in sanitize_schema_name("Weird/Name:™ 100%").chars() {
            assert!(
                c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_',
                "sanitized output must stay within [a-z0-9_], got '{c}'"
            );
        }
    }

    #[test]
    fn test_sanitize_idempotent() {
        let inputs = ["Acme Corp", "__x__", "Ünïcode & Co", "", "    ", "a-b-c"];
        for input in inputs {
            let once = sanitize_schema_name(input);
            assert_eq!(
                sanitize_schema_name(&once),
                once,
                "sanitizer must be idempotent for input {input:?}"
            );
        }
    }

    #[test]
    fn test_sanitize_empty_falls_back() {
        assert_eq!(sanitize_schema_name(""), "_");
        assert_eq!(sanitize_schema_name("!!!"), "_");
    }

    #[test]
    fn test_sanitize_truncates_to_limit() {
        let long = "a".repeat(200);
        let out = sanitize_schema_name(&long);
        assert_eq!(out.len(), 63);
        // Truncation must not break idempotence
        assert_eq!(sanitize_schema_name(&out), out);
    }
}
