//! Guards for values interpolated into DDL.
//!
//! DDL cannot take bind parameters, so table, index and type names are
//! checked here before they are quoted into a statement.

use crate::error::Error;

/// Longest identifier PostgreSQL keeps without truncating (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Validate a table, column or index identifier.
///
/// Report table names embed project (domain) names, which may contain
/// hyphens, so the accepted alphabet is ASCII alphanumerics, `_` and `-`.
/// The identifier must start with a letter or underscore and fit in
/// [`MAX_IDENTIFIER_LEN`] bytes.
///
/// # Examples
///
/// ```
/// use ucr_rdbc::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("config_report_my-project_cases_1a2b3c4d").is_ok());
/// assert!(validate_sql_identifier("inserted_at").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("9lives").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::schema("SQL identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::schema(format!(
            "SQL identifier too long: {} bytes (max {})",
            name.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::schema(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                name
            )));
        }
    }

    if let Some(c) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-')) {
        return Err(Error::schema(format!(
            "Invalid SQL identifier '{}': contains invalid character '{}'",
            name, c
        )));
    }

    Ok(())
}

/// Escape a string value for a single-quoted SQL literal.
///
/// Only used where a statement must be rendered as a complete string, such
/// as partition bounds. Prefer bind parameters everywhere else.
///
/// ```
/// use ucr_rdbc::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("2024-01-01"), "2024-01-01");
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

/// Validate a SQL type name for interpolation into column DDL.
///
/// Allows letters, digits, underscores, spaces, parentheses, commas and the
/// `[]` array suffix: `TEXT`, `NUMERIC(10,2)`, `DOUBLE PRECISION`, `TEXT[]`.
///
/// ```
/// use ucr_rdbc::security::validate_sql_type_name;
///
/// assert!(validate_sql_type_name("TEXT[]").is_ok());
/// assert!(validate_sql_type_name("NUMERIC(10,2)").is_ok());
/// assert!(validate_sql_type_name("INT; DROP TABLE x").is_err());
/// ```
pub fn validate_sql_type_name(type_name: &str) -> crate::Result<()> {
    if type_name.is_empty() {
        return Err(Error::schema("SQL type name cannot be empty"));
    }

    if type_name.len() > 64 {
        return Err(Error::schema(format!(
            "SQL type name too long: {} chars (max 64)",
            type_name.len()
        )));
    }

    for c in type_name.chars() {
        if !(c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '(' | ')' | ',' | '[' | ']')) {
            return Err(Error::schema(format!(
                "Invalid SQL type name '{}': contains invalid character '{}'",
                type_name, c
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_length_limit() {
        let ok = "a".repeat(MAX_IDENTIFIER_LEN);
        let too_long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(validate_sql_identifier(&ok).is_ok());
        assert!(validate_sql_identifier(&too_long).is_err());
    }

    #[test]
    fn test_identifier_rejects_quotes() {
        assert!(validate_sql_identifier("bad\"name").is_err());
        assert!(validate_sql_identifier("with space").is_err());
    }

    #[test]
    fn test_type_name_rejects_comments() {
        assert!(validate_sql_type_name("TEXT--").is_err());
        assert!(validate_sql_type_name("TIMESTAMP WITHOUT TIME ZONE").is_ok());
    }
}
