//! Validation for SQL identifiers that end up inside `format!`-built
//! statements.
//!
//! Table names for source collections and their tasks tables are chosen by
//! the caller at registration time and cannot be parameterised in DDL or in
//! `INSERT … ON CONFLICT` targets, so every dynamic identifier passes
//! through [`validate_ident`] before it is interpolated.

use anyhow::{bail, Result};

/// Maximum identifier length accepted by PostgreSQL.
const MAX_IDENT_LEN: usize = 63;

/// Validate a dynamic SQL identifier (table or column name).
///
/// Accepts ASCII alphanumerics and underscores, not starting with a digit,
/// at most 63 bytes. Returns the input on success so call sites can write
/// `validate_ident(name)?` inline.
pub fn validate_ident(name: &str) -> Result<&str> {
    if name.is_empty() {
        bail!("identifier must not be empty");
    }
    if name.len() > MAX_IDENT_LEN {
        bail!(
            "identifier {:?} exceeds {} bytes",
            name,
            MAX_IDENT_LEN
        );
    }
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        bail!("identifier {:?} must not start with a digit", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        bail!("identifier {:?} contains invalid characters", name);
    }
    Ok(name)
}

/// Validate a JSONB path segment embedded as a text literal inside a
/// compiled filter or projection expression.
///
/// Stricter than [`validate_ident`]: segments also allow `-` and `.` is
/// already split away by the caller, but quotes, braces and backslashes are
/// rejected so the segment can be written into a `'{a,b}'` path literal.
pub fn validate_path_segment(segment: &str) -> Result<&str> {
    if segment.is_empty() {
        bail!("field path segment must not be empty");
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        bail!("field path segment {:?} contains invalid characters", segment);
    }
    Ok(segment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(validate_ident("orders").is_ok());
        assert!(validate_ident("orders_tasks").is_ok());
        assert!(validate_ident("_private").is_ok());
    }

    #[test]
    fn rejects_injection_shapes() {
        assert!(validate_ident("orders; DROP TABLE x").is_err());
        assert!(validate_ident("orders\"").is_err());
        assert!(validate_ident("or ders").is_err());
        assert!(validate_ident("").is_err());
        assert!(validate_ident("1orders").is_err());
    }

    #[test]
    fn rejects_oversized_names() {
        let long = "a".repeat(64);
        assert!(validate_ident(&long).is_err());
        let ok = "a".repeat(63);
        assert!(validate_ident(&ok).is_ok());
    }

    #[test]
    fn path_segments() {
        assert!(validate_path_segment("shipping-address").is_ok());
        assert!(validate_path_segment("a'b").is_err());
        assert!(validate_path_segment("a{b}").is_err());
        assert!(validate_path_segment("").is_err());
    }
}
