//! Cached value container.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

/// A cached value with its absolute expiry.
///
/// The payload is the JSON encoding of the caller's value and is shared
/// behind an `Arc`, so handing an entry to several tiers never copies it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub payload: Arc<[u8]>,
    pub expires_at: DateTime<Utc>,
    pub tags: Arc<[String]>,
}

impl CacheEntry {
    /// Create an entry that expires `ttl` from now.
    pub fn new(payload: impl Into<Arc<[u8]>>, ttl: Duration, tags: Vec<String>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            payload: payload.into(),
            expires_at: Utc::now()
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            tags: tags.into(),
        }
    }

    /// Create an entry with an explicit absolute expiry.
    pub fn with_expiry(
        payload: impl Into<Arc<[u8]>>,
        expires_at: DateTime<Utc>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            payload: payload.into(),
            expires_at,
            tags: tags.into(),
        }
    }

    /// Serialize a value into an entry.
    pub fn encode<T: Serialize + ?Sized>(
        value: &T,
        ttl: Duration,
        tags: Vec<String>,
    ) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(payload, ttl, tags))
    }

    /// Deserialize the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Time left before `expires_at`, or `None` once expired.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        (self.expires_at - Utc::now())
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let entry = CacheEntry::encode(
            &vec!["a".to_string(), "b".to_string()],
            Duration::from_secs(60),
            vec!["lists".to_string()],
        )
        .unwrap();

        let value: Vec<String> = entry.decode().unwrap();
        assert_eq!(value, vec!["a", "b"]);
        assert_eq!(&*entry.tags, &["lists".to_string()]);
    }

    #[test]
    fn test_remaining_ttl_never_exceeds_original() {
        let entry = CacheEntry::new(b"x".to_vec(), Duration::from_secs(30), Vec::new());
        let remaining = entry.remaining_ttl().unwrap();
        assert!(remaining <= Duration::from_secs(30));
        assert!(remaining > Duration::from_secs(25));
    }

    #[test]
    fn test_expired_entry() {
        let entry = CacheEntry::with_expiry(
            b"x".to_vec(),
            Utc::now() - chrono::Duration::seconds(1),
            Vec::new(),
        );
        assert!(entry.is_expired());
        assert_eq!(entry.remaining_ttl(), None);
    }

    #[test]
    fn test_decode_type_mismatch_is_serialization_error() {
        let entry = CacheEntry::new(b"\"text\"".to_vec(), Duration::from_secs(5), Vec::new());
        let err = entry.decode::<u64>().unwrap_err();
        assert!(matches!(err, crate::error::CacheError::Serialization(_)));
    }
}
