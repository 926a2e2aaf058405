//! Error types for the cache core.

use std::time::Duration;

/// Errors raised by tiers, the key builder and cache construction.
///
/// Read-path failures never reach the caller of `get`; they are logged,
/// reported to the event sinks and turned into misses.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A backend tier could not be reached or returned an error.
    #[error("tier '{tier}' unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },

    /// A tier operation exceeded its time budget.
    #[error("tier '{tier}' timed out after {timeout:?}")]
    TierTimeout { tier: String, timeout: Duration },

    /// A value could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Missing or malformed tenant identifier.
    #[error("invalid tenant context: {0}")]
    InvalidTenantContext(String),

    /// Logical key, tag or pattern rejected by the key builder.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The tier cannot enumerate keys by pattern.
    #[error("tier '{tier}' does not support pattern scans")]
    PatternScanUnsupported { tier: String },

    /// Configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A cache was built without any tier.
    #[error("tier chain is empty")]
    NoTiers,
}

impl CacheError {
    /// Build a `TierUnavailable` from any displayable backend error.
    pub fn unavailable(tier: &str, reason: impl std::fmt::Display) -> Self {
        Self::TierUnavailable {
            tier: tier.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for failures that only mean "this tier is down right now".
    pub fn is_tier_failure(&self) -> bool {
        matches!(
            self,
            Self::TierUnavailable { .. } | Self::TierTimeout { .. }
        )
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
