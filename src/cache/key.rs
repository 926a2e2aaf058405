//! Tenant-scoped key derivation.
//!
//! Every full key has the shape `{namespace}:{tenant}:{logical}`. Tenant ids
//! and namespaces are restricted to `[A-Za-z0-9._-]`, so the first two `:`
//! always delimit the scope and a logical key may itself contain `:`.
//! Tag index keys live under `{namespace}#tags:`, a prefix no data key can
//! produce.

use std::fmt;
use std::sync::Arc;

use crate::error::{CacheError, Result};

const SEPARATOR: char = ':';
const TAG_MARKER: &str = "#tags";
const MAX_TENANT_LEN: usize = 128;
const MAX_LOGICAL_LEN: usize = 512;

/// Characters with glob meaning in tier pattern scans.
const GLOB_META: [char; 5] = ['*', '?', '[', ']', '\\'];

/// Validated tenant identifier.
///
/// The only way to obtain one is [`TenantId::new`], so every cache operation
/// that takes a `&TenantId` is tenant-scoped by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(Arc<str>);

impl TenantId {
    /// Validate and wrap a tenant identifier.
    ///
    /// Empty ids are rejected rather than mapped onto a shared namespace.
    pub fn new(id: impl AsRef<str>) -> Result<Self> {
        let id = id.as_ref();
        if id.is_empty() {
            return Err(CacheError::InvalidTenantContext(
                "tenant id is empty".to_string(),
            ));
        }
        if id.len() > MAX_TENANT_LEN {
            return Err(CacheError::InvalidTenantContext(format!(
                "tenant id longer than {MAX_TENANT_LEN} bytes"
            )));
        }
        if !id.chars().all(is_scope_char) {
            return Err(CacheError::InvalidTenantContext(format!(
                "tenant id '{id}' contains characters outside [A-Za-z0-9._-]"
            )));
        }
        Ok(Self(Arc::from(id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Deterministic builder for data keys, tag keys and scan patterns.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    namespace: Arc<str>,
}

impl KeyBuilder {
    /// Create a builder for the given namespace.
    pub fn new(namespace: &str) -> Result<Self> {
        if namespace.is_empty() || !namespace.chars().all(is_scope_char) {
            return Err(CacheError::Config(format!(
                "namespace '{namespace}' must be non-empty and use [A-Za-z0-9._-]"
            )));
        }
        Ok(Self {
            namespace: Arc::from(namespace),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Derive the full key from a raw tenant string.
    pub fn build(&self, logical_key: &str, tenant_id: &str) -> Result<String> {
        let tenant = TenantId::new(tenant_id)?;
        self.key(&tenant, logical_key)
    }

    /// Derive the full key for an already validated tenant.
    pub fn key(&self, tenant: &TenantId, logical_key: &str) -> Result<String> {
        validate_component("key", logical_key)?;
        Ok(format!(
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.namespace, tenant, logical_key
        ))
    }

    /// Key under which the tag's member set is stored.
    pub fn tag_key(&self, tenant: &TenantId, tag: &str) -> Result<String> {
        validate_component("tag", tag)?;
        Ok(format!(
            "{}{TAG_MARKER}{SEPARATOR}{}{SEPARATOR}{}",
            self.namespace, tenant, tag
        ))
    }

    /// Pattern matching every tag index key of a tenant.
    pub fn tag_pattern(&self, tenant: &TenantId) -> String {
        format!("{}{TAG_MARKER}{SEPARATOR}{}{SEPARATOR}*", self.namespace, tenant)
    }

    /// Scope a logical glob pattern (`*` and `?`) to a tenant.
    pub fn pattern(&self, tenant: &TenantId, logical_pattern: &str) -> Result<String> {
        if logical_pattern.is_empty() {
            return Err(CacheError::InvalidKey("pattern is empty".to_string()));
        }
        if logical_pattern
            .chars()
            .any(|c| c.is_control() || matches!(c, '[' | ']' | '\\'))
        {
            return Err(CacheError::InvalidKey(format!(
                "pattern '{logical_pattern}' may only use '*' and '?' as wildcards"
            )));
        }
        Ok(format!("{}{logical_pattern}", self.tenant_prefix(tenant)))
    }

    /// Pattern matching every data key of a tenant.
    pub fn tenant_pattern(&self, tenant: &TenantId) -> String {
        format!("{}*", self.tenant_prefix(tenant))
    }

    /// Literal prefix shared by every data key of a tenant.
    pub fn tenant_prefix(&self, tenant: &TenantId) -> String {
        format!("{}{SEPARATOR}{}{SEPARATOR}", self.namespace, tenant)
    }
}

fn is_scope_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn validate_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CacheError::InvalidKey(format!("{what} is empty")));
    }
    if value.len() > MAX_LOGICAL_LEN {
        return Err(CacheError::InvalidKey(format!(
            "{what} longer than {MAX_LOGICAL_LEN} bytes"
        )));
    }
    if let Some(c) = value
        .chars()
        .find(|c| c.is_control() || GLOB_META.contains(c))
    {
        return Err(CacheError::InvalidKey(format!(
            "{what} '{value}' contains reserved character {c:?}"
        )));
    }
    Ok(())
}

/// Match `text` against a glob supporting `*` (any run) and `?` (one char).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            // Let the last '*' swallow one more character
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

/// Translate a glob into an anchored regular expression.
pub fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '[' | ']' | '\\' => {
                regex.push('\\');
                regex.push(c);
            }
            _ => regex.push(c),
        }
    }
    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> KeyBuilder {
        KeyBuilder::new("cache").unwrap()
    }

    #[test]
    fn test_build_is_deterministic_and_scoped() {
        let keys = builder();
        let a = keys.build("dashboard_data:user42", "acme").unwrap();
        let b = keys.build("dashboard_data:user42", "acme").unwrap();
        let other = keys.build("dashboard_data:user42", "globex").unwrap();

        assert_eq!(a, "cache:acme:dashboard_data:user42");
        assert_eq!(a, b);
        assert_ne!(a, other);
    }

    #[test]
    fn test_empty_tenant_rejected() {
        let err = builder().build("projects", "").unwrap_err();
        assert!(matches!(err, CacheError::InvalidTenantContext(_)));
    }

    #[test]
    fn test_separator_in_tenant_rejected() {
        // "a:b" + "c" would otherwise collide with "a" + "b:c"
        assert!(TenantId::new("a:b").is_err());
        assert!(TenantId::new("acme*").is_err());
        assert!(TenantId::new("tenant-01.eu_west").is_ok());
    }

    #[test]
    fn test_logical_key_validation() {
        let keys = builder();
        let tenant = TenantId::new("acme").unwrap();

        assert!(keys.key(&tenant, "").is_err());
        assert!(keys.key(&tenant, "projects:*").is_err());
        assert!(keys.key(&tenant, "line\nbreak").is_err());
        assert!(keys.key(&tenant, "projects:42:summary").is_ok());
    }

    #[test]
    fn test_tag_keys_disjoint_from_data_keys() {
        let keys = builder();
        let tenant = TenantId::new("acme").unwrap();

        let tag = keys.tag_key(&tenant, "dashboard").unwrap();
        assert_eq!(tag, "cache#tags:acme:dashboard");
        assert!(!glob_match(&keys.tenant_pattern(&tenant), &tag));
        assert!(glob_match(&keys.tag_pattern(&tenant), &tag));
    }

    #[test]
    fn test_pattern_scoping() {
        let keys = builder();
        let tenant = TenantId::new("acme").unwrap();

        let pattern = keys.pattern(&tenant, "projects:*").unwrap();
        assert_eq!(pattern, "cache:acme:projects:*");
        assert!(glob_match(&pattern, "cache:acme:projects:7"));
        assert!(!glob_match(&pattern, "cache:globex:projects:7"));
        assert!(keys.pattern(&tenant, "projects:[0-9]").is_err());
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("a*c", "abbbc"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "abbc"));
        assert!(glob_match("*:user*", "dash:user42"));
        assert!(!glob_match("dash", "dashboard"));
        assert!(glob_match("dash*", "dashboard"));
    }

    #[test]
    fn test_glob_to_regex() {
        assert_eq!(glob_to_regex("cache:acme:*"), "^cache:acme:.*$");
        assert_eq!(glob_to_regex("a.b?"), "^a\\.b.$");
    }
}
