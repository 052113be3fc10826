use serde::{Deserialize, Serialize};

use crate::context::{AttributeValue, ContextKind, Reference};
use crate::eval::Reason;
use crate::model::{FlagValue, Timestamp};

/// A feature flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    pub version: u64,
    /// Targeting toggle. When off, the flag serves [`Flag::off_variation`]
    /// without consulting targets or rules.
    #[serde(default)]
    pub on: bool,
    /// The values this flag can serve, addressed by index everywhere else in
    /// the model.
    #[serde(default)]
    pub variations: Vec<FlagValue>,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    /// User-kind individual targets (legacy shape, no context kind).
    #[serde(default)]
    pub targets: Vec<Target>,
    /// Per-kind individual targets. A user-kind entry here carries no values
    /// and defers to the matching [`Flag::targets`] entry.
    #[serde(default)]
    pub context_targets: Vec<Target>,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    pub fallthrough: VariationOrRollout,
    #[serde(default)]
    pub off_variation: Option<usize>,
    /// Salt for rollout bucketing when the rollout carries no seed.
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    #[serde(default, rename = "debugEventsUntilDate")]
    pub debug_events_until: Option<Timestamp>,
    /// Hint for summary-event pipelines to leave this flag out of rollups.
    #[serde(default)]
    pub exclude_from_summaries: bool,
}

impl Flag {
    pub fn variation(&self, index: usize) -> Option<&FlagValue> {
        self.variations.get(index)
    }

    /// Whether events produced for the given evaluation reason should carry
    /// full tracking detail (experiment allocations, rules and fallthroughs
    /// flagged for tracking).
    pub fn experimentation_enabled(&self, reason: &Reason) -> bool {
        if reason.is_in_experiment() {
            return true;
        }
        match reason {
            Reason::Fallthrough { .. } => self.track_events_fallthrough,
            Reason::RuleMatch { rule_index, .. } => {
                self.rules.get(*rule_index).is_some_and(|rule| rule.track_events)
            }
            _ => false,
        }
    }
}

/// Reference to another flag that must evaluate to a specific variation for
/// the dependent flag's targeting to proceed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: usize,
}

/// Individual targeting: serve `variation` to any context of `context_kind`
/// whose key appears in `values`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub context_kind: ContextKind,
    #[serde(default)]
    pub values: Vec<String>,
    pub variation: usize,
}

/// A targeting rule: all clauses must match for the rule to apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

/// A single condition over one context attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    #[serde(default)]
    pub context_kind: ContextKind,
    pub attribute: Reference,
    pub op: Operator,
    #[serde(default)]
    pub values: Vec<AttributeValue>,
    #[serde(default)]
    pub negate: bool,
}

/// Clause operators.
///
/// Operators this version does not know still parse ([`Operator::Unknown`])
/// and match nothing, so newer flag data degrades per-clause instead of
/// failing the whole item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    In,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SemVerEqual,
    SemVerLessThan,
    SemVerGreaterThan,
    SegmentMatch,
    #[serde(other)]
    Unknown,
}

/// Outcome of a rule or fallthrough: a fixed variation or a percentage
/// rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariationOrRollout {
    Variation { variation: usize },
    Rollout { rollout: Rollout },
}

/// A percentage rollout across weighted variations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default)]
    pub kind: RolloutKind,
    /// Kind of context bucketed by this rollout.
    #[serde(default)]
    pub context_kind: ContextKind,
    pub variations: Vec<WeightedVariation>,
    /// Attribute to bucket by instead of the context key. Ignored for
    /// experiments, which always bucket by key.
    #[serde(default)]
    pub bucket_by: Option<Reference>,
    /// Bucketing seed; when absent, bucketing falls back to flag key + salt.
    #[serde(default)]
    pub seed: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    /// Plain percentage rollout.
    #[default]
    Rollout,
    /// Experiment allocation: evaluation reasons report `in_experiment` for
    /// tracked entries.
    Experiment,
}

/// One entry of a rollout. Weights are in units of 0.001%, summing to at
/// most 100 000.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: usize,
    pub weight: i64,
    /// Experiment entries marked untracked serve traffic outside the
    /// experiment (`in_experiment = false`).
    #[serde(default)]
    pub untracked: bool,
}
