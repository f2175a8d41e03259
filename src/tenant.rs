use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Reserved tenant id for the shared namespace.
pub const GLOBAL_TENANT: &str = "global";

/// Characters left untouched when a tenant id becomes a directory name.
const PATH_SAFE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Identifies an isolated document namespace.
///
/// Indices, id mappings and snapshots of different tenants never share graph
/// nodes or storage paths.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Validate and wrap a tenant id. Empty ids and ids containing control
    /// characters are rejected.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidTenant("tenant id is empty".into()));
        }
        if id.chars().any(char::is_control) {
            return Err(Error::InvalidTenant(format!(
                "tenant id {id:?} contains control characters"
            )));
        }
        Ok(Self(id))
    }

    /// The shared namespace.
    pub fn global() -> Self {
        Self(GLOBAL_TENANT.to_string())
    }

    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_TENANT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A single path segment unique to this tenant.
    ///
    /// Everything except ASCII alphanumerics, `-` and `_` is percent-encoded,
    /// so ids such as `../x` or `a/b` can never escape or share a directory.
    pub fn storage_key(&self) -> String {
        utf8_percent_encode(&self.0, PATH_SAFE).to_string()
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::global()
    }
}

impl TryFrom<String> for TenantId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl std::str::FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_is_reserved_default() {
        let tenant = TenantId::default();
        assert!(tenant.is_global());
        assert_eq!(tenant.as_str(), "global");
    }

    #[test]
    fn empty_id_rejected() {
        assert!(matches!(TenantId::new(""), Err(Error::InvalidTenant(_))));
    }

    #[test]
    fn control_characters_rejected() {
        assert!(TenantId::new("a\nb").is_err());
    }

    #[test]
    fn storage_key_is_a_single_safe_segment() {
        let tenant = TenantId::new("../etc/passwd").unwrap();
        let key = tenant.storage_key();
        assert!(!key.contains('/'));
        assert!(!key.contains(".."));
        assert_eq!(key, "%2E%2E%2Fetc%2Fpasswd");
    }

    #[test]
    fn plain_ids_keep_their_name() {
        let tenant = TenantId::new("user_42-a").unwrap();
        assert_eq!(tenant.storage_key(), "user_42-a");
    }

    #[test]
    fn distinct_ids_get_distinct_keys() {
        let a = TenantId::new("a/b").unwrap();
        let b = TenantId::new("a%2Fb").unwrap();
        assert_ne!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn deserialization_validates() {
        assert!(serde_json::from_str::<TenantId>("\"\"").is_err());
        let t: TenantId = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(t.as_str(), "alice");
    }
}
