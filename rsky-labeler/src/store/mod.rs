//! Persistence contract for signed labels.
//!
//! Stores own identity assignment: every inserted label receives an `i64`
//! id that is unique, never reused, and strictly greater than any id handed
//! out before it. Cursor pagination relies on that ordering.

use crate::label::SignedLabel;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryLabelStore;
pub use postgres::PostgresLabelStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("failed to close: {0}")]
    Close(String),
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("invalid store state: {0}")]
    InvalidState(String),
}

/// A signed label together with its store-assigned identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLabel {
    pub id: i64,
    pub label: SignedLabel,
}

/// Structured label query. Every populated field narrows the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    /// Exact subject match.
    pub uri: Option<String>,
    /// Subject patterns; a trailing `*` matches by prefix, anything else
    /// matches exactly. A label matches if any pattern does.
    pub uri_patterns: Vec<String>,
    /// Restrict to labels from any of these `src` DIDs.
    pub sources: Vec<String>,
    pub val: Option<String>,
    pub neg: Option<bool>,
    /// Exact `exp` match.
    pub exp: Option<String>,
    /// Include labels whose `exp` is at or before the query time.
    pub allow_expired: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Ordering and paging for [`LabelStore::find_many`]; results are always
/// ordered by id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub sort: SortOrder,
    pub skip: usize,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait LabelStore: Send + Sync {
    async fn connect(&self) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;

    /// Persists `label` under a freshly assigned id.
    async fn insert(&self, label: SignedLabel) -> Result<StoredLabel, StoreError>;

    /// Labels matching `filter`. Expired labels are excluded unless
    /// `filter.allow_expired` is set.
    async fn find_many(
        &self,
        filter: &LabelFilter,
        options: FindOptions,
    ) -> Result<Vec<StoredLabel>, StoreError>;

    /// Point lookup, regardless of expiration.
    async fn find_one(&self, id: i64) -> Result<Option<StoredLabel>, StoreError>;

    /// Up to `limit` labels with id strictly greater than `id`, ascending.
    async fn find_after(&self, id: i64, limit: usize) -> Result<Vec<StoredLabel>, StoreError>;

    /// Overwrites the label stored at `id`. Returns false if no such id.
    async fn update_by_id(&self, id: i64, label: &SignedLabel) -> Result<bool, StoreError>;
}

/// A label is active at `now` iff it has no `exp` or its `exp` is strictly
/// after `now`.
pub fn is_active(label: &SignedLabel, now: DateTime<Utc>) -> bool {
    match &label.exp {
        None => true,
        Some(exp) => match DateTime::parse_from_rfc3339(exp) {
            Ok(exp) => exp.with_timezone(&Utc) > now,
            Err(_) => true,
        },
    }
}

pub fn matches_uri_pattern(pattern: &str, uri: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => uri.starts_with(prefix),
        None => pattern == uri,
    }
}

impl LabelFilter {
    pub fn matches(&self, label: &SignedLabel, now: DateTime<Utc>) -> bool {
        if let Some(uri) = &self.uri {
            if &label.uri != uri {
                return false;
            }
        }
        if !self.uri_patterns.is_empty()
            && !self
                .uri_patterns
                .iter()
                .any(|pattern| matches_uri_pattern(pattern, &label.uri))
        {
            return false;
        }
        if !self.sources.is_empty() && !self.sources.contains(&label.src) {
            return false;
        }
        if let Some(val) = &self.val {
            if &label.val != val {
                return false;
            }
        }
        if let Some(neg) = self.neg {
            if label.neg != neg {
                return false;
            }
        }
        if let Some(exp) = &self.exp {
            if label.exp.as_ref() != Some(exp) {
                return false;
            }
        }
        self.allow_expired || is_active(label, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn label(uri: &str, exp: Option<&str>) -> SignedLabel {
        SignedLabel {
            cid: None,
            cts: "2025-01-01T00:00:00.000Z".to_string(),
            exp: exp.map(str::to_string),
            neg: false,
            sig: vec![1; 64],
            src: "did:web:labeler.test".to_string(),
            uri: uri.to_string(),
            val: "spam".to_string(),
            ver: 1,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_is_active() {
        assert!(is_active(&label("did:plc:a", None), now()));
        assert!(is_active(&label("did:plc:a", Some("2025-06-01T12:00:01Z")), now()));
        assert!(!is_active(&label("did:plc:a", Some("2025-06-01T12:00:00Z")), now()));
        assert!(!is_active(&label("did:plc:a", Some("2025-06-01T11:59:59Z")), now()));
    }

    #[test]
    fn test_uri_patterns() {
        assert!(matches_uri_pattern("at://did:plc:a/*", "at://did:plc:a/app.bsky.feed.post/1"));
        assert!(!matches_uri_pattern("at://did:plc:a/*", "at://did:plc:b/app.bsky.feed.post/1"));
        assert!(matches_uri_pattern("did:plc:a", "did:plc:a"));
        assert!(!matches_uri_pattern("did:plc:a", "did:plc:ab"));
        assert!(matches_uri_pattern("*", "did:plc:anything"));
    }

    #[test]
    fn test_filter_matches() {
        let post = label("at://did:plc:a/app.bsky.feed.post/1", None);
        let expired = label("did:plc:b", Some("2020-01-01T00:00:00Z"));

        assert!(LabelFilter::default().matches(&post, now()));
        assert!(!LabelFilter::default().matches(&expired, now()));
        let all = LabelFilter {
            allow_expired: true,
            ..Default::default()
        };
        assert!(all.matches(&expired, now()));

        let by_source = LabelFilter {
            sources: vec!["did:plc:someone-else".to_string()],
            ..Default::default()
        };
        assert!(!by_source.matches(&post, now()));

        let by_neg = LabelFilter {
            neg: Some(true),
            ..Default::default()
        };
        assert!(!by_neg.matches(&post, now()));

        let by_pattern = LabelFilter {
            uri_patterns: vec!["did:plc:zzz".to_string(), "at://did:plc:a/*".to_string()],
            ..Default::default()
        };
        assert!(by_pattern.matches(&post, now()));

        let by_exp = LabelFilter {
            exp: Some("2020-01-01T00:00:00Z".to_string()),
            allow_expired: true,
            ..Default::default()
        };
        assert!(by_exp.matches(&expired, now()));
        assert!(!by_exp.matches(&post, now()));
    }
}
