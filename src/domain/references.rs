//! Tagged payloads carried by the purge queues.
//!
//! The object queue stores [`ContentReference`]s, the URL queue stores
//! [`PurgeTarget`]s. Both expose a `dedup_key` which the storage layer uses to
//! collapse an enqueue onto an already-available item.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

const ALL_KEY: &str = "all";

/// A reference to something on the site whose cached representation changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum ContentReference {
    Post(i64),
    Term(i64),
    Url(String),
    #[serde(rename = "cachetag")]
    CacheTag(String),
    /// Purge everything on the site.
    All,
}

impl ContentReference {
    pub fn kind(&self) -> &'static str {
        match self {
            ContentReference::Post(_) => "post",
            ContentReference::Term(_) => "term",
            ContentReference::Url(_) => "url",
            ContentReference::CacheTag(_) => "cachetag",
            ContentReference::All => ALL_KEY,
        }
    }

    /// Identity used for dedup: `(type, id)`.
    pub fn dedup_key(&self) -> String {
        match self {
            ContentReference::Post(id) => format!("post:{id}"),
            ContentReference::Term(id) => format!("term:{id}"),
            ContentReference::Url(url) => format!("url:{url}"),
            ContentReference::CacheTag(tag) => format!("cachetag:{tag}"),
            ContentReference::All => ALL_KEY.to_string(),
        }
    }

    pub fn is_purge_all(&self) -> bool {
        matches!(self, ContentReference::All)
    }

    /// Build a reference from the loose `(type, id)` pair used by callers.
    pub fn parse(kind: &str, id: Option<&str>) -> Result<Self, DomainError> {
        let require_id = || {
            id.map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| DomainError::invalid_reference(format!("`{kind}` requires an id")))
        };
        let numeric = |value: &str| {
            value.parse::<i64>().map_err(|_| {
                DomainError::invalid_reference(format!("`{kind}` id must be numeric, got `{value}`"))
            })
        };

        match kind {
            "post" => numeric(require_id()?).map(ContentReference::Post),
            "term" => numeric(require_id()?).map(ContentReference::Term),
            "url" => Ok(ContentReference::Url(require_id()?.to_string())),
            "cachetag" => Ok(ContentReference::CacheTag(require_id()?.to_string())),
            ALL_KEY => Ok(ContentReference::All),
            other => Err(DomainError::unknown("content reference type", other)),
        }
    }
}

impl fmt::Display for ContentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dedup_key())
    }
}

/// A concrete, dispatch-ready invalidation target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PurgeTarget {
    Url(String),
    #[serde(rename = "cachetag")]
    CacheTag(String),
    /// Marker that supersedes every other target.
    All,
}

impl PurgeTarget {
    pub fn dedup_key(&self) -> String {
        match self {
            PurgeTarget::Url(url) => format!("url:{url}"),
            PurgeTarget::CacheTag(tag) => format!("cachetag:{tag}"),
            PurgeTarget::All => ALL_KEY.to_string(),
        }
    }

    pub fn is_purge_all(&self) -> bool {
        matches!(self, PurgeTarget::All)
    }

    /// Dedup key of the purge-all marker, for lookups in the URL queue.
    pub fn purge_all_key() -> &'static str {
        ALL_KEY
    }
}

impl fmt::Display for PurgeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurgeTarget::Url(url) => f.write_str(url),
            PurgeTarget::CacheTag(tag) => write!(f, "tag:{tag}"),
            PurgeTarget::All => f.write_str("*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reference_serializes_as_type_and_id() {
        let value = serde_json::to_value(ContentReference::Post(42)).unwrap();
        assert_eq!(value, json!({ "type": "post", "id": 42 }));

        let value = serde_json::to_value(ContentReference::CacheTag("home".into())).unwrap();
        assert_eq!(value, json!({ "type": "cachetag", "id": "home" }));

        let all: ContentReference = serde_json::from_value(json!({ "type": "all" })).unwrap();
        assert!(all.is_purge_all());
    }

    #[test]
    fn target_serializes_as_kind_and_value() {
        let value = serde_json::to_value(PurgeTarget::Url("https://a.test/".into())).unwrap();
        assert_eq!(value, json!({ "kind": "url", "value": "https://a.test/" }));

        let all: PurgeTarget = serde_json::from_value(json!({ "kind": "all" })).unwrap();
        assert_eq!(all, PurgeTarget::All);
    }

    #[test]
    fn dedup_keys_distinguish_kinds() {
        assert_eq!(ContentReference::Post(7).dedup_key(), "post:7");
        assert_ne!(
            ContentReference::Post(7).dedup_key(),
            ContentReference::Term(7).dedup_key()
        );
        assert_ne!(
            PurgeTarget::Url("x".into()).dedup_key(),
            PurgeTarget::CacheTag("x".into()).dedup_key()
        );
        assert_eq!(PurgeTarget::All.dedup_key(), PurgeTarget::purge_all_key());
    }

    #[test]
    fn parse_validates_ids() {
        assert_eq!(
            ContentReference::parse("post", Some("12")).unwrap(),
            ContentReference::Post(12)
        );
        assert_eq!(
            ContentReference::parse("all", None).unwrap(),
            ContentReference::All
        );
        assert!(ContentReference::parse("post", Some("abc")).is_err());
        assert!(ContentReference::parse("url", Some("  ")).is_err());
        assert!(ContentReference::parse("comment", Some("1")).is_err());
    }
}
