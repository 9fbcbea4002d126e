//! Identifier validation and quoting for SQL text built by this crate.
//!
//! Almost all SQL is supplied by callers. The exception is the per-shard
//! migration ledger, whose table name comes from configuration and has to be
//! spliced into statement text because identifiers cannot be bound as
//! parameters.

use crate::error::{Result, ShardError};

/// Conservative limit across databases (PostgreSQL allows 63 bytes, SQL
/// Server 128 characters).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Reject empty, oversized or NUL-carrying identifiers.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ShardError::Config("Identifier cannot be empty".to_string()));
    }

    if name.contains('\0') {
        return Err(ShardError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ShardError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier: `users` → `"users"`.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a SQL Server identifier: `users` → `[users]`.
pub fn quote_mssql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Quote a possibly schema-qualified name (`ops.ledger`) part by part.
pub fn quote_qualified(name: &str, quote: fn(&str) -> Result<String>) -> Result<String> {
    let parts = name
        .split('.')
        .map(quote)
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("."))
}

/// Single-quote a string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("_dbshard_migrations").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("  ").is_err());
        assert!(validate_identifier("bad\0name").is_err());
        assert!(validate_identifier(&"a".repeat(129)).is_err());
        assert!(validate_identifier(&"a".repeat(128)).is_ok());
    }

    #[test]
    fn test_quote_pg_escapes_double_quote() {
        assert_eq!(quote_pg("ledger").unwrap(), "\"ledger\"");
        assert_eq!(quote_pg("led\"ger").unwrap(), "\"led\"\"ger\"");
    }

    #[test]
    fn test_quote_mssql_escapes_bracket() {
        assert_eq!(quote_mssql("ledger").unwrap(), "[ledger]");
        assert_eq!(quote_mssql("led]ger").unwrap(), "[led]]ger]");
    }

    #[test]
    fn test_quote_qualified() {
        assert_eq!(
            quote_qualified("ops.ledger", quote_pg).unwrap(),
            "\"ops\".\"ledger\""
        );
        assert_eq!(
            quote_qualified("dbo.ledger", quote_mssql).unwrap(),
            "[dbo].[ledger]"
        );
        assert!(quote_qualified("ops..ledger", quote_pg).is_err());
    }

    #[test]
    fn test_sql_injection_safely_quoted() {
        let quoted = quote_pg("x\"; DROP TABLE users; --").unwrap();
        assert_eq!(quoted, "\"x\"\"; DROP TABLE users; --\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }
}
