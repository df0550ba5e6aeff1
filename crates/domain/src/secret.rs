//! Types shared between the agent and the secret store gateway (§4.8).
//!
//! The gateway itself (store registry, caching/serialization policy) lives
//! in the `secrets` crate; `domain` only owns the reference syntax and the
//! resolution-kind marker, since both the config layer and the gateway need
//! to agree on them without a dependency cycle.

use std::fmt;

/// A `@{store:key}` reference found in a plugin's configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretRef {
    /// Name of the registered secret store.
    pub store: String,
    /// Key to look up within that store.
    pub key: String,
}

/// Error parsing a `@{store:key}` reference.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretRefError {
    /// The value was not wrapped in `@{...}` at all.
    #[error("not a secret reference: {0:?}")]
    NotAReference(String),
    /// The wrapped body had no `:` separator, or an empty store/key half.
    #[error("malformed secret reference body: {0:?}")]
    Malformed(String),
}

impl SecretRef {
    /// Parse `@{store:key}`. Returns `Err` for any other shape, including
    /// plain unwrapped strings -- callers should treat those as literal
    /// values, not attempt a partial parse.
    pub fn parse(raw: &str) -> Result<Self, SecretRefError> {
        let body = raw
            .strip_prefix("@{")
            .and_then(|s| s.strip_suffix('}'))
            .ok_or_else(|| SecretRefError::NotAReference(raw.to_owned()))?;
        let (store, key) = body
            .split_once(':')
            .ok_or_else(|| SecretRefError::Malformed(body.to_owned()))?;
        if store.is_empty() || key.is_empty() {
            return Err(SecretRefError::Malformed(body.to_owned()));
        }
        Ok(Self {
            store: store.to_owned(),
            key: key.to_owned(),
        })
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{{{}:{}}}", self.store, self.key)
    }
}

/// How a resolved secret value behaves with respect to re-resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretResolution {
    /// Resolved once at load time and never looked up again.
    Static,
    /// Re-resolved on every use (e.g. a rotating credential).
    Dynamic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_reference() {
        let parsed = SecretRef::parse("@{vault:db_password}").unwrap();
        assert_eq!(parsed.store, "vault");
        assert_eq!(parsed.key, "db_password");
    }

    #[test]
    fn rejects_unwrapped_string() {
        assert!(matches!(
            SecretRef::parse("plain_value"),
            Err(SecretRefError::NotAReference(_))
        ));
    }

    #[test]
    fn rejects_missing_separator() {
        assert!(matches!(
            SecretRef::parse("@{vaultkey}"),
            Err(SecretRefError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_empty_store_or_key() {
        assert!(SecretRef::parse("@{:key}").is_err());
        assert!(SecretRef::parse("@{store:}").is_err());
    }

    #[test]
    fn display_round_trips_parse() {
        let original = "@{env:API_KEY}";
        let parsed = SecretRef::parse(original).unwrap();
        assert_eq!(parsed.to_string(), original);
    }
}
