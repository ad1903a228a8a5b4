//! SQL identifier quoting and validation.

use regex::Regex;
use std::sync::OnceLock;

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them (`"` -> `""`).
///
/// # Examples
///
/// ```
/// use unitwork_core::quote_ident;
///
/// assert_eq!(quote_ident("user"), "\"user\"");
/// assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn identifier_regex() -> Option<&'static Regex> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Check that a table or column name is a plain identifier.
///
/// Accepted names start with a letter or underscore and continue with
/// letters, digits or underscores.
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_simple() {
        assert_eq!(quote_ident("address"), "\"address\"");
    }

    #[test]
    fn test_quote_ident_keyword() {
        assert_eq!(quote_ident("user"), "\"user\"");
    }

    #[test]
    fn test_valid_identifiers() {
        assert!(is_valid_identifier("user"));
        assert!(is_valid_identifier("_private"));
        assert!(is_valid_identifier("email_address2"));
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("user name"));
        assert!(!is_valid_identifier("user;DROP TABLE"));
    }
}
