//! Deterministic percentage bucketing for rollouts, experiments and
//! weighted segment rules.

use crate::context::{AttributeValue, Context, ContextKind, Reference};
use crate::model::{RolloutKind, VariationOrRollout};

// First 15 hex digits of an MD5, so buckets range over [0, 1].
const LONG_SCALE: f64 = 0xFFF_FFFF_FFFF_FFFF_u64 as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BucketResult {
    pub(crate) variation: usize,
    pub(crate) in_experiment: bool,
}

/// Resolve a variation-or-rollout to a concrete variation index for this
/// context. `None` means the flag data is malformed: an empty rollout, or
/// an invalid bucketing attribute reference.
pub(crate) fn resolve(
    vor: &VariationOrRollout,
    context: &Context,
    flag_key: &str,
    salt: &str,
) -> Option<BucketResult> {
    let rollout = match vor {
        VariationOrRollout::Variation { variation } => {
            return Some(BucketResult {
                variation: *variation,
                in_experiment: false,
            });
        }
        VariationOrRollout::Rollout { rollout } => rollout,
    };

    if rollout.variations.is_empty() {
        return None;
    }
    let is_experiment = rollout.kind == RolloutKind::Experiment;
    // Experiments always bucket by key, so that editing an attribute can
    // never silently reassign contexts between treatment groups.
    let bucket_by = if is_experiment {
        None
    } else {
        rollout.bucket_by.as_ref()
    };
    if let Some(reference) = bucket_by {
        if !reference.is_valid() {
            return None;
        }
    }

    let (bucket, context_found) = context_bucket(
        context,
        &rollout.context_kind,
        bucket_by,
        flag_key,
        salt,
        rollout.seed,
    );

    let chosen = |weighted: &crate::model::WeightedVariation| BucketResult {
        variation: weighted.variation,
        in_experiment: is_experiment && !weighted.untracked && context_found,
    };

    let mut sum = 0.0;
    for weighted in &rollout.variations {
        sum += weighted.weight as f64 / 100_000.0;
        if bucket < sum {
            return Some(chosen(weighted));
        }
    }
    // Weights summing below 100% (or floating point shortfall): the last
    // bucket absorbs the remainder.
    rollout.variations.last().map(chosen)
}

/// Bucket value in [0, 1] for the context part of the given kind, plus
/// whether such a part exists. A missing part buckets to 0.0.
pub(crate) fn context_bucket(
    context: &Context,
    kind: &ContextKind,
    bucket_by: Option<&Reference>,
    hash_key: &str,
    salt: &str,
    seed: Option<i64>,
) -> (f64, bool) {
    match context.individual_context(kind) {
        Some(part) => (part_bucket(part, bucket_by, hash_key, salt, seed), true),
        None => (0.0, false),
    }
}

fn part_bucket(
    part: &Context,
    bucket_by: Option<&Reference>,
    hash_key: &str,
    salt: &str,
    seed: Option<i64>,
) -> f64 {
    let value = match bucket_by {
        Some(reference) => part.value_of(reference),
        None => Some(AttributeValue::String(part.key().to_owned())),
    };
    let Some(id) = bucketable(value) else {
        return 0.0;
    };
    let input = match seed {
        Some(seed) => format!("{seed}.{id}"),
        None => format!("{hash_key}.{salt}.{id}"),
    };
    let hex = format!("{:x}", md5::compute(&input));
    u64::from_str_radix(&hex[..15], 16).unwrap_or(0) as f64 / LONG_SCALE
}

/// Only strings and integral numbers participate in bucketing; anything
/// else buckets to 0.0.
fn bucketable(value: Option<AttributeValue>) -> Option<String> {
    match value {
        Some(AttributeValue::String(s)) => Some(s),
        Some(AttributeValue::Number(n)) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
            Some((n as i64).to_string())
        }
        _ => None,
    }
}
