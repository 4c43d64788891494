//! Validated tenant routing key.
//!
//! Requests name their tenant by subdomain, either explicitly (a header) or
//! through the first label of the `Host` they were sent to.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tenantry_storage::tenant::Subdomain;
//!
//! let subdomain = Subdomain::new("acme-corp")?;
//! assert_eq!(subdomain.database_identifier(""), "acme_corp");
//!
//! let from_host = Subdomain::from_host("acme-corp.example.com:8080")?;
//! assert_eq!(from_host, subdomain);
//! ```

use std::fmt;
use tenantry_core::{validation, Result, TenancyError};

/// Validated tenant subdomain.
///
/// # Validation Rules
///
/// - Length: 3-63 characters
/// - Characters: lowercase ASCII alphanumeric, hyphen
/// - Must start with alphanumeric character
/// - Cannot end with hyphen
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subdomain(String);

impl Subdomain {
    /// Create a new validated subdomain.
    ///
    /// # Errors
    ///
    /// Returns `TenancyError::ValidationError` if any rule is violated.
    pub fn new(subdomain: impl Into<String>) -> Result<Self> {
        let subdomain = subdomain.into();
        validation::validate_subdomain(&subdomain)?;
        Ok(Self(subdomain))
    }

    /// Extract the subdomain from a `Host` header value.
    ///
    /// The port is ignored and the label is lowercased. A host with fewer than
    /// three labels (`example.com`, `localhost`) carries no tenant.
    pub fn from_host(host: &str) -> Result<Self> {
        let hostname = host.split(':').next().unwrap_or_default().trim();
        let mut labels = hostname.split('.');
        let first = labels.next().unwrap_or_default();

        if labels.count() < 2 {
            return Err(TenancyError::ValidationError(format!(
                "Host '{}' has no tenant subdomain",
                host
            )));
        }

        Self::new(first.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Database and role name for this subdomain.
    ///
    /// Hyphens become underscores and `prefix` is prepended.
    pub fn database_identifier(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0.replace('-', "_"))
    }
}

impl fmt::Display for Subdomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Subdomain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Subdomain {
    type Err = TenancyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
