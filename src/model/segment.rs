use serde::{Deserialize, Serialize};

use crate::context::{ContextKind, Reference};
use crate::model::Clause;

/// A reusable audience that flag rules can reference through the
/// `segmentMatch` operator.
///
/// Regular segments carry their membership inline (`included`/`excluded`
/// lists and rules). Unbounded segments keep membership in an external
/// big-segment store and only describe how to look it up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    pub version: u64,
    /// User-kind keys included outright (legacy shape).
    #[serde(default)]
    pub included: Vec<String>,
    /// User-kind keys excluded outright (legacy shape).
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub included_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub excluded_contexts: Vec<SegmentTarget>,
    #[serde(default)]
    pub rules: Vec<SegmentRule>,
    /// Salt for rule weight bucketing.
    #[serde(default)]
    pub salt: String,
    /// True for big segments: membership lives in an external store.
    #[serde(default)]
    pub unbounded: bool,
    #[serde(default)]
    pub unbounded_context_kind: Option<ContextKind>,
    /// Distinguishes successive writes of an unbounded segment's membership;
    /// part of the external lookup key. Required when `unbounded`.
    #[serde(default)]
    pub generation: Option<i64>,
}

impl Segment {
    /// Lookup key for this segment's membership in a big-segment store.
    /// `None` when the segment carries no generation, which for an unbounded
    /// segment is a data defect.
    pub fn reference(&self) -> Option<String> {
        self.generation
            .map(|generation| format!("{}.g{}", self.key, generation))
    }
}

/// Per-kind inclusion or exclusion list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTarget {
    #[serde(default)]
    pub context_kind: ContextKind,
    #[serde(default)]
    pub values: Vec<String>,
}

/// A segment rule: all clauses must match, then the optional weight rolls
/// membership out to a fraction of matching contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    /// Weight in units of 0.001%; `None` means unconditional membership.
    #[serde(default)]
    pub weight: Option<i64>,
    #[serde(default)]
    pub bucket_by: Option<Reference>,
    #[serde(default)]
    pub rollout_context_kind: Option<ContextKind>,
}
