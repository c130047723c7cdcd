//! Identifier hardening for SQL generation.
//!
//! Provides the guard and the quoter, the single ingress through which every
//! table and column name reaches SQL text. Any new call site that splices an
//! identifier into SQL by plain concatenation is a defect.
//!
//! The guard rejects early and loudly; the quoter alone would be sufficient
//! for safety, but rejecting `users; DROP TABLE x` outright keeps generated
//! DDL readable and makes injection attempts visible in logs.

use crate::error::Error;

/// Check whether an identifier consists only of ASCII alphanumerics,
/// underscores, and dots (dots allow `schema.table` naming).
///
/// Char-iteration instead of a regex: zero dependencies, zero allocation on
/// the hot path.
///
/// # Examples
///
/// ```
/// use chug_core::security::is_valid_identifier;
///
/// assert!(is_valid_identifier("users"));
/// assert!(is_valid_identifier("public.events_2024"));
///
/// assert!(!is_valid_identifier(""));
/// assert!(!is_valid_identifier("users; DROP TABLE x"));
/// assert!(!is_valid_identifier("user name"));
/// ```
pub fn is_valid_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Validate an identifier, returning `InvalidIdentifier` on rejection.
pub fn ensure_valid_identifier(identifier: &str) -> crate::Result<()> {
    if is_valid_identifier(identifier) {
        Ok(())
    } else {
        Err(Error::invalid_identifier(identifier))
    }
}

/// Quote an identifier for SQL text: wrap in double quotes, escape embedded
/// double quotes by doubling them (ANSI quoting, understood by both
/// PostgreSQL and ClickHouse).
///
/// # Examples
///
/// ```
/// use chug_core::security::quote_identifier;
///
/// assert_eq!(quote_identifier("users"), "\"users\"");
/// assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
/// ```
pub fn quote_identifier(identifier: &str) -> String {
    let escaped = identifier.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(is_valid_identifier("users"));
        assert!(is_valid_identifier("my_table_123"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("public.users"));
        assert!(is_valid_identifier("a"));
        assert!(is_valid_identifier("UPPER_case"));
        assert!(is_valid_identifier("0starts_with_digit"));
    }

    #[test]
    fn test_empty_identifier() {
        assert!(!is_valid_identifier(""));
        assert!(ensure_valid_identifier("").is_err());
    }

    #[test]
    fn test_injection_attempts() {
        // Statement separator
        assert!(!is_valid_identifier("users; DROP TABLE x"));
        // Quote breakout
        assert!(!is_valid_identifier("x' OR '1'='1"));
        assert!(!is_valid_identifier("x\"--"));
        // Comments
        assert!(!is_valid_identifier("x--"));
        assert!(!is_valid_identifier("x/*"));
        // Whitespace and control characters
        assert!(!is_valid_identifier("user name"));
        assert!(!is_valid_identifier("x\nDROP TABLE y"));
        assert!(!is_valid_identifier("x\0"));
        // Unicode smuggling (Cyrillic lookalike)
        assert!(!is_valid_identifier("tabl\u{0435}"));
        // Parentheses
        assert!(!is_valid_identifier("f()"));
    }

    #[test]
    fn test_guard_error_carries_name() {
        let err = ensure_valid_identifier("users; DROP TABLE x").unwrap_err();
        assert!(err.to_string().contains("users; DROP TABLE x"));
    }

    #[test]
    fn test_quote_plain() {
        assert_eq!(quote_identifier("users"), "\"users\"");
        assert_eq!(quote_identifier("delta_ts"), "\"delta_ts\"");
    }

    #[test]
    fn test_quote_escapes_embedded_quotes() {
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_identifier("\"\""), "\"\"\"\"\"\"");
    }
}
