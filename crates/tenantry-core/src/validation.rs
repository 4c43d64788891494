//! Input validation for tenantry
//!
//! Provides validation and quoting helpers to prevent:
//! - SQL injection through tenant-supplied names (role, database, password)
//! - Malformed subdomains that cannot be routed
//! - Identifiers that Postgres would silently truncate

use crate::{Result, TenancyError};

/// Minimum length for subdomains
pub const MIN_SUBDOMAIN_LEN: usize = 3;

/// Maximum length for subdomains (one DNS label)
pub const MAX_SUBDOMAIN_LEN: usize = 63;

/// Postgres NAMEDATALEN - 1
pub const MAX_PG_IDENTIFIER_LEN: usize = 63;

/// Maximum length for email addresses
pub const MAX_EMAIL_LEN: usize = 254;

/// Subdomains that would collide with platform hosts.
const RESERVED_SUBDOMAINS: &[&str] = &["www", "api", "admin", "app", "postgres", "template"];

/// Validate a tenant subdomain
///
/// Requirements:
/// - 3 to 63 characters
/// - Lowercase ASCII letters, digits, hyphen only
/// - Cannot start or end with hyphen
/// - Not a reserved platform name
pub fn validate_subdomain(subdomain: &str) -> Result<()> {
    if subdomain.len() < MIN_SUBDOMAIN_LEN || subdomain.len() > MAX_SUBDOMAIN_LEN {
        return Err(TenancyError::ValidationError(format!(
            "Subdomain must be between {} and {} characters, got {}",
            MIN_SUBDOMAIN_LEN,
            MAX_SUBDOMAIN_LEN,
            subdomain.len()
        )));
    }

    if !subdomain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(TenancyError::ValidationError(
            "Subdomain contains invalid characters (allowed: a-z, 0-9, -)".to_string(),
        ));
    }

    if subdomain.starts_with('-') || subdomain.ends_with('-') {
        return Err(TenancyError::ValidationError(
            "Subdomain cannot start or end with hyphen".to_string(),
        ));
    }

    if RESERVED_SUBDOMAINS.contains(&subdomain) {
        return Err(TenancyError::ValidationError(format!(
            "Subdomain '{}' is reserved",
            subdomain
        )));
    }

    Ok(())
}

/// Validate a Postgres identifier used for a database or role name
///
/// Requirements:
/// - Not empty
/// - <= 63 bytes
/// - Starts with a lowercase letter or underscore
/// - Lowercase ASCII letters, digits, underscore only
pub fn validate_pg_identifier(identifier: &str, field_name: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(TenancyError::ValidationError(format!(
            "{} cannot be empty",
            field_name
        )));
    }

    if identifier.len() > MAX_PG_IDENTIFIER_LEN {
        return Err(TenancyError::ValidationError(format!(
            "{} too long: {} > {} characters",
            field_name,
            identifier.len(),
            MAX_PG_IDENTIFIER_LEN
        )));
    }

    let mut chars = identifier.chars();
    if !chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
    {
        return Err(TenancyError::ValidationError(format!(
            "{} must start with a lowercase letter or underscore",
            field_name
        )));
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(TenancyError::ValidationError(format!(
            "{} contains invalid characters (allowed: a-z, 0-9, _)",
            field_name
        )));
    }

    Ok(())
}

/// Validate an email address
///
/// Deliberately shallow: one `@`, non-empty local part, dotted domain.
pub fn validate_email(email: &str) -> Result<()> {
    if email.len() > MAX_EMAIL_LEN {
        return Err(TenancyError::ValidationError(format!(
            "Email too long: {} > {} characters",
            email.len(),
            MAX_EMAIL_LEN
        )));
    }

    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };

    if !valid {
        return Err(TenancyError::ValidationError(format!(
            "Invalid email address: {}",
            email
        )));
    }

    Ok(())
}

/// Derive the database and role name for a subdomain.
///
/// Hyphens become underscores and the configured prefix is prepended. The
/// result is validated as a Postgres identifier.
pub fn database_identifier(prefix: &str, subdomain: &str) -> Result<String> {
    let name = format!("{}{}", prefix, subdomain.replace('-', "_"));
    validate_pg_identifier(&name, "database name")?;
    Ok(name)
}

/// Append `_<suffix>` to an identifier, truncating the base so the result
/// still fits in a Postgres identifier.
pub fn suffixed_identifier(base: &str, suffix: &str) -> Result<String> {
    let room = MAX_PG_IDENTIFIER_LEN.saturating_sub(suffix.len() + 1);
    let base = base.get(..base.len().min(room)).unwrap_or(base);
    let name = format!("{}_{}", base, suffix);
    validate_pg_identifier(&name, "database name")?;
    Ok(name)
}

/// Quote a Postgres identifier (`"name"`), doubling embedded quotes.
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Quote a Postgres string literal (`'value'`), doubling embedded quotes.
///
/// Used for DDL that cannot take bind parameters, such as
/// `CREATE ROLE ... PASSWORD '...'`.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
