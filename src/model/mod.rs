//! Flag and segment data model.
//!
//! These types mirror the wire representation delivered by data sources
//! (camelCase JSON with defaults for optional fields), so a serialized item
//! can be handed between the in-memory store, persistent backends, and the
//! evaluator without re-shaping.

mod flag;
mod segment;

pub use flag::*;
pub use segment::*;

use std::sync::Arc;

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[allow(missing_docs)]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Namespace tag for the two kinds of stored items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    Flag,
    Segment,
}

impl DataKind {
    /// Namespace name used by persistent backends.
    pub fn namespace(self) -> &'static str {
        match self {
            DataKind::Flag => "features",
            DataKind::Segment => "segments",
        }
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DataKind::Flag => "flag",
            DataKind::Segment => "segment",
        })
    }
}

/// A versioned entry in a data store collection.
///
/// Deletions are retained as [`StoreItem::Tombstone`] entries so that
/// out-of-order writes with stale versions can still be rejected after the
/// item is gone. Tombstones are invisible to reads.
#[derive(Debug, Clone)]
pub enum StoreItem {
    Flag(Arc<Flag>),
    Segment(Arc<Segment>),
    /// A deleted item, keeping only the version of the deletion.
    Tombstone(u64),
}

impl StoreItem {
    pub fn version(&self) -> u64 {
        match self {
            StoreItem::Flag(flag) => flag.version,
            StoreItem::Segment(segment) => segment.version,
            StoreItem::Tombstone(version) => *version,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, StoreItem::Tombstone(_))
    }

    pub fn as_flag(&self) -> Option<&Arc<Flag>> {
        match self {
            StoreItem::Flag(flag) => Some(flag),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&Arc<Segment>> {
        match self {
            StoreItem::Segment(segment) => Some(segment),
            _ => None,
        }
    }

    /// Whether this item may live in the given kind's collection.
    /// Tombstones fit anywhere.
    pub fn kind_matches(&self, kind: DataKind) -> bool {
        match self {
            StoreItem::Flag(_) => kind == DataKind::Flag,
            StoreItem::Segment(_) => kind == DataKind::Segment,
            StoreItem::Tombstone(_) => true,
        }
    }

    /// Structural validation applied before any store mutation: versions
    /// start at 1, keys must be non-empty and agree with the item's own key,
    /// and the item must fit the target collection.
    pub(crate) fn validate(&self, kind: DataKind, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::malformed_data(kind, None, "empty key"));
        }
        if !self.kind_matches(kind) {
            return Err(Error::malformed_data(
                kind,
                Some(key),
                "item kind does not match collection",
            ));
        }
        if self.version() == 0 {
            return Err(Error::malformed_data(kind, Some(key), "version must be >= 1"));
        }
        let own_key = match self {
            StoreItem::Flag(flag) => Some(flag.key.as_str()),
            StoreItem::Segment(segment) => Some(segment.key.as_str()),
            StoreItem::Tombstone(_) => None,
        };
        if own_key.is_some_and(|k| k != key) {
            return Err(Error::malformed_data(
                kind,
                Some(key),
                "item key does not match entry key",
            ));
        }
        Ok(())
    }
}

impl From<Flag> for StoreItem {
    fn from(flag: Flag) -> Self {
        StoreItem::Flag(Arc::new(flag))
    }
}

impl From<Segment> for StoreItem {
    fn from(segment: Segment) -> Self {
        StoreItem::Segment(Arc::new(segment))
    }
}

/// Value of a flag variation.
///
/// Variations are JSON values; the first three variants cover the common
/// scalar cases, everything else (arrays, objects, null) is [`FlagValue::Json`].
#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    /// All numbers are represented as `f64`.
    Number(f64),
    Str(String),
    Json(serde_json::Value),
}

impl FlagValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FlagValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FlagValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, FlagValue::Bool(_))
    }

    /// The value as generic JSON, converting scalar variants as needed.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FlagValue::Bool(b) => serde_json::Value::Bool(*b),
            FlagValue::Number(n) => serde_json::json!(n),
            FlagValue::Str(s) => serde_json::Value::String(s.clone()),
            FlagValue::Json(v) => v.clone(),
        }
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::Str(value.to_owned())
    }
}

impl From<i64> for FlagValue {
    fn from(value: i64) -> Self {
        FlagValue::Number(value as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FlagBuilder;

    #[test]
    fn flag_value_untagged_serde() {
        assert_eq!(
            serde_json::from_str::<FlagValue>("true").unwrap(),
            FlagValue::Bool(true)
        );
        assert_eq!(
            serde_json::from_str::<FlagValue>("2.5").unwrap(),
            FlagValue::Number(2.5)
        );
        assert_eq!(
            serde_json::from_str::<FlagValue>("\"on\"").unwrap(),
            FlagValue::Str("on".to_owned())
        );
        assert_eq!(
            serde_json::from_str::<FlagValue>("[1,2]").unwrap(),
            FlagValue::Json(serde_json::json!([1, 2]))
        );
    }

    #[test]
    fn validate_rejects_structural_defects() {
        let flag = FlagBuilder::new("f1").version(3).build();

        let item = StoreItem::from(flag);
        assert!(item.validate(DataKind::Flag, "f1").is_ok());
        assert!(item.validate(DataKind::Flag, "").is_err());
        assert!(item.validate(DataKind::Flag, "other-key").is_err());
        assert!(item.validate(DataKind::Segment, "f1").is_err());

        assert!(StoreItem::Tombstone(0)
            .validate(DataKind::Flag, "f1")
            .is_err());
        assert!(StoreItem::Tombstone(4)
            .validate(DataKind::Flag, "f1")
            .is_ok());
        assert!(StoreItem::Tombstone(4)
            .validate(DataKind::Segment, "s1")
            .is_ok());
    }

    #[test]
    fn version_zero_is_rejected() {
        let mut flag = FlagBuilder::new("f1").build();
        flag.version = 0;
        let item = StoreItem::from(flag);
        assert!(item.validate(DataKind::Flag, "f1").is_err());
    }
}
