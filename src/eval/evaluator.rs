use std::collections::HashMap;
use std::sync::Arc;

use crate::big_segments::{BigSegmentMembership, BigSegmentStoreWrapper, BigSegmentsStatus};
use crate::context::{Context, ContextKind};
use crate::eval::bucketing;
use crate::eval::detail::{ErrorKind, EvaluationDetail, Reason};
use crate::eval::rules;
use crate::events::{EvaluationRecord, PrerequisiteEvent};
use crate::model::{Clause, Flag, FlagRule, FlagValue, Operator, Segment, SegmentRule};
use crate::store::ReadStore;

/// Flag evaluation against a [`ReadStore`].
///
/// Evaluation never panics and never returns `Err` to the caller: every
/// structural defect in flag data maps to [`Reason::Error`] with the
/// caller's default value, and the defect is logged.
pub struct Evaluator {
    store: Arc<dyn ReadStore>,
    big_segments: Option<Arc<BigSegmentStoreWrapper>>,
}

/// What [`Evaluator::evaluate_detail`] hands back: the record for the flag
/// itself plus one record per prerequisite evaluation, ready for an event
/// pipeline.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub record: EvaluationRecord,
    pub prerequisite_events: Vec<PrerequisiteEvent>,
}

impl Evaluator {
    pub fn new(store: Arc<dyn ReadStore>) -> Evaluator {
        Evaluator {
            store,
            big_segments: None,
        }
    }

    pub fn with_big_segments(
        store: Arc<dyn ReadStore>,
        big_segments: Arc<BigSegmentStoreWrapper>,
    ) -> Evaluator {
        Evaluator {
            store,
            big_segments: Some(big_segments),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn ReadStore> {
        &self.store
    }

    /// Evaluate a flag, substituting `default` when no value can be served.
    pub fn evaluate(
        &self,
        flag_key: &str,
        context: &Context,
        default: FlagValue,
    ) -> EvaluationDetail<FlagValue> {
        self.evaluate_detail(flag_key, context, default)
            .record
            .detail
    }

    /// The evaluated value alone.
    pub fn variation(&self, flag_key: &str, context: &Context, default: FlagValue) -> FlagValue {
        self.evaluate(flag_key, context, default.clone())
            .value_or(default)
    }

    /// Evaluate a flag and return the full outcome record for event
    /// pipelines.
    pub fn evaluate_detail(
        &self,
        flag_key: &str,
        context: &Context,
        default: FlagValue,
    ) -> EvaluationOutcome {
        if !self.store.initialized() {
            log::warn!(
                target: "switchgear",
                flag_key;
                "evaluation requested before the flag store is initialized; flag data may be missing"
            );
        }
        let Some(flag) = self.store.flag(flag_key) else {
            log::warn!(target: "switchgear", flag_key; "unknown feature flag; serving default value");
            return EvaluationOutcome {
                record: EvaluationRecord {
                    flag_key: flag_key.to_owned(),
                    flag_version: None,
                    detail: EvaluationDetail {
                        value: Some(default),
                        variation_index: None,
                        reason: Reason::error(ErrorKind::FlagNotFound),
                    },
                    track_events: false,
                    track_reason: false,
                    debug_events_until: None,
                    prerequisites: Vec::new(),
                },
                prerequisite_events: Vec::new(),
            };
        };

        let mut outcome = self.raw_outcome(&flag, context);
        if outcome.record.detail.value.is_none() {
            outcome.record.detail.value = Some(default);
        }
        log::trace!(
            target: "switchgear",
            flag_key,
            context_key = context.key(),
            reason:serde = outcome.record.detail.reason;
            "evaluated a flag"
        );
        outcome
    }

    /// Evaluation without default substitution: the detail's value stays
    /// `None` when the flag yields nothing.
    pub(crate) fn raw_outcome(&self, flag: &Flag, context: &Context) -> EvaluationOutcome {
        let mut state = EvalState::new(self, context);
        let detail = state.evaluate_flag(flag, true);
        let track_reason = flag.experimentation_enabled(&detail.reason);
        EvaluationOutcome {
            record: EvaluationRecord {
                flag_key: flag.key.clone(),
                flag_version: Some(flag.version),
                detail,
                track_events: flag.track_events || track_reason,
                track_reason,
                debug_events_until: flag.debug_events_until,
                prerequisites: state.direct_prerequisites,
            },
            prerequisite_events: state.prerequisite_events,
        }
    }
}

/// Per-evaluation working state: recursion guards, prerequisite bookkeeping
/// and the big-segment membership memo.
struct EvalState<'a> {
    evaluator: &'a Evaluator,
    context: &'a Context,
    flag_stack: Vec<String>,
    segment_stack: Vec<String>,
    prerequisite_events: Vec<PrerequisiteEvent>,
    direct_prerequisites: Vec<String>,
    memberships: HashMap<String, (Option<Arc<BigSegmentMembership>>, BigSegmentsStatus)>,
}

impl<'a> EvalState<'a> {
    fn new(evaluator: &'a Evaluator, context: &'a Context) -> EvalState<'a> {
        EvalState {
            evaluator,
            context,
            flag_stack: Vec::new(),
            segment_stack: Vec::new(),
            prerequisite_events: Vec::new(),
            direct_prerequisites: Vec::new(),
            memberships: HashMap::new(),
        }
    }

    fn evaluate_flag(&mut self, flag: &Flag, top_level: bool) -> EvaluationDetail<FlagValue> {
        if !flag.on {
            return off_value(flag, Reason::Off);
        }
        if let Some(detail) = self.check_prerequisites(flag, top_level) {
            return detail;
        }
        if let Some(detail) = check_targets(flag, self.context) {
            return detail;
        }
        for (index, rule) in flag.rules.iter().enumerate() {
            match self.rule_matches(rule) {
                Ok(false) => continue,
                Ok(true) => {
                    let Some(bucketed) = bucketing::resolve(
                        &rule.variation_or_rollout,
                        self.context,
                        &flag.key,
                        &flag.salt,
                    ) else {
                        log::warn!(
                            target: "switchgear",
                            flag_key = flag.key,
                            rule_id = rule.id;
                            "rule rollout is unusable; serving error default"
                        );
                        return EvaluationDetail::err(ErrorKind::MalformedFlag);
                    };
                    return value_for(
                        flag,
                        bucketed.variation,
                        Reason::RuleMatch {
                            rule_index: index,
                            rule_id: rule.id.clone(),
                            in_experiment: bucketed.in_experiment,
                        },
                    );
                }
                Err(error_kind) => return EvaluationDetail::err(error_kind),
            }
        }
        let Some(bucketed) =
            bucketing::resolve(&flag.fallthrough, self.context, &flag.key, &flag.salt)
        else {
            log::warn!(
                target: "switchgear",
                flag_key = flag.key;
                "fallthrough rollout is unusable; serving error default"
            );
            return EvaluationDetail::err(ErrorKind::MalformedFlag);
        };
        value_for(
            flag,
            bucketed.variation,
            Reason::Fallthrough {
                in_experiment: bucketed.in_experiment,
            },
        )
    }

    /// `Some` when a prerequisite short-circuits the evaluation, either
    /// because it failed or because it was itself unevaluable.
    fn check_prerequisites(
        &mut self,
        flag: &Flag,
        top_level: bool,
    ) -> Option<EvaluationDetail<FlagValue>> {
        for prerequisite in &flag.prerequisites {
            if top_level {
                self.direct_prerequisites.push(prerequisite.key.clone());
            }
            if prerequisite.key == flag.key || self.flag_stack.contains(&prerequisite.key) {
                log::warn!(
                    target: "switchgear",
                    flag_key = flag.key,
                    prerequisite_key = prerequisite.key;
                    "prerequisite relationship is circular; serving error default"
                );
                return Some(EvaluationDetail::err(ErrorKind::MalformedFlag));
            }
            let Some(prerequisite_flag) = self.evaluator.store.flag(&prerequisite.key) else {
                return Some(off_value(
                    flag,
                    Reason::PrerequisiteFailed {
                        prerequisite_key: prerequisite.key.clone(),
                    },
                ));
            };

            self.flag_stack.push(flag.key.clone());
            let detail = self.evaluate_flag(&prerequisite_flag, false);
            self.flag_stack.pop();

            let track_events = prerequisite_flag.track_events
                || prerequisite_flag.experimentation_enabled(&detail.reason);
            self.prerequisite_events.push(PrerequisiteEvent {
                flag_key: prerequisite.key.clone(),
                prerequisite_of: flag.key.clone(),
                detail: detail.clone(),
                track_events,
                debug_events_until: prerequisite_flag.debug_events_until,
            });

            if let Reason::Error { error_kind } = detail.reason {
                return Some(EvaluationDetail::err(error_kind));
            }
            let satisfied =
                prerequisite_flag.on && detail.variation_index == Some(prerequisite.variation);
            if !satisfied {
                return Some(off_value(
                    flag,
                    Reason::PrerequisiteFailed {
                        prerequisite_key: prerequisite.key.clone(),
                    },
                ));
            }
        }
        None
    }

    fn rule_matches(&mut self, rule: &FlagRule) -> Result<bool, ErrorKind> {
        for clause in &rule.clauses {
            if !self.clause_matches(clause)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn clause_matches(&mut self, clause: &Clause) -> Result<bool, ErrorKind> {
        if clause.op != Operator::SegmentMatch {
            return rules::clause_matches_context(clause, self.context);
        }
        let mut matched = false;
        for value in &clause.values {
            let Some(segment_key) = value.as_str() else {
                continue;
            };
            // Unknown segments never match; flags and segments arrive in
            // one payload, so a dangling reference is staleness, not error.
            let Some(segment) = self.evaluator.store.segment(segment_key) else {
                continue;
            };
            if self.segment_stack.iter().any(|k| k == segment_key) {
                log::warn!(
                    target: "switchgear",
                    segment_key;
                    "segment reference is circular; serving error default"
                );
                return Err(ErrorKind::MalformedFlag);
            }
            self.segment_stack.push(segment_key.to_owned());
            let result = self.segment_matches(&segment);
            self.segment_stack.pop();
            if result? {
                matched = true;
                break;
            }
        }
        Ok(matched != clause.negate)
    }

    fn segment_matches(&mut self, segment: &Segment) -> Result<bool, ErrorKind> {
        if segment.unbounded {
            if let Some(included) = self.big_segment_match(segment)? {
                return Ok(included);
            }
            // Membership undetermined for this context: fall through to
            // the segment's rules.
        } else {
            if rules::segment_lists_contain(
                &segment.included,
                &segment.included_contexts,
                self.context,
            ) {
                return Ok(true);
            }
            if rules::segment_lists_contain(
                &segment.excluded,
                &segment.excluded_contexts,
                self.context,
            ) {
                return Ok(false);
            }
        }
        for rule in &segment.rules {
            if self.segment_rule_matches(rule, &segment.key, &segment.salt)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Membership verdict from the big segment store: `Some(bool)` when the
    /// store has an explicit answer, `None` when undetermined.
    fn big_segment_match(&mut self, segment: &Segment) -> Result<Option<bool>, ErrorKind> {
        let Some(reference) = segment.reference() else {
            log::warn!(
                target: "switchgear",
                segment_key = segment.key;
                "unbounded segment has no generation; serving error default"
            );
            return Err(ErrorKind::MalformedFlag);
        };
        let Some(wrapper) = &self.evaluator.big_segments else {
            log::warn!(
                target: "switchgear",
                segment_key = segment.key;
                "flag references a big segment but no big segment store is configured"
            );
            return Err(ErrorKind::BigSegmentStoreError);
        };
        let kind = segment.unbounded_context_kind.clone().unwrap_or_default();
        let Some(part) = self.context.individual_context(&kind) else {
            return Ok(Some(false));
        };

        let key = part.key().to_owned();
        let (membership, status) = match self.memberships.get(&key) {
            Some(entry) => entry.clone(),
            None => {
                let entry = wrapper.query(&key);
                self.memberships.insert(key, entry.clone());
                entry
            }
        };
        match status {
            BigSegmentsStatus::StoreError | BigSegmentsStatus::NotConfigured => {
                return Err(ErrorKind::BigSegmentStoreError);
            }
            BigSegmentsStatus::Healthy | BigSegmentsStatus::Stale => {}
        }
        Ok(membership.and_then(|m| m.get(&reference).copied()))
    }

    fn segment_rule_matches(
        &mut self,
        rule: &SegmentRule,
        segment_key: &str,
        salt: &str,
    ) -> Result<bool, ErrorKind> {
        for clause in &rule.clauses {
            if !self.clause_matches(clause)? {
                return Ok(false);
            }
        }
        let Some(weight) = rule.weight else {
            return Ok(true);
        };
        if let Some(reference) = &rule.bucket_by {
            if !reference.is_valid() {
                return Err(ErrorKind::MalformedFlag);
            }
        }
        let kind = rule.rollout_context_kind.clone().unwrap_or_default();
        let (bucket, _) = bucketing::context_bucket(
            self.context,
            &kind,
            rule.bucket_by.as_ref(),
            segment_key,
            salt,
            None,
        );
        Ok(bucket < weight as f64 / 100_000.0)
    }
}

fn check_targets(flag: &Flag, context: &Context) -> Option<EvaluationDetail<FlagValue>> {
    if flag.context_targets.is_empty() {
        for target in &flag.targets {
            if user_key_in(context, &target.values) {
                return Some(value_for(flag, target.variation, Reason::TargetMatch));
            }
        }
        return None;
    }
    for target in &flag.context_targets {
        let matched = if target.context_kind.is_user() && target.values.is_empty() {
            // User entries fix the position in the per-kind ordering but
            // keep their keys in the legacy list.
            flag.targets
                .iter()
                .filter(|legacy| legacy.variation == target.variation)
                .any(|legacy| user_key_in(context, &legacy.values))
        } else {
            context
                .individual_context(&target.context_kind)
                .is_some_and(|part| target.values.iter().any(|v| v == part.key()))
        };
        if matched {
            return Some(value_for(flag, target.variation, Reason::TargetMatch));
        }
    }
    None
}

fn user_key_in(context: &Context, values: &[String]) -> bool {
    context
        .individual_context(&ContextKind::user())
        .is_some_and(|user| values.iter().any(|v| v == user.key()))
}

fn off_value(flag: &Flag, reason: Reason) -> EvaluationDetail<FlagValue> {
    match flag.off_variation {
        Some(index) => value_for(flag, index, reason),
        None => EvaluationDetail {
            value: None,
            variation_index: None,
            reason,
        },
    }
}

fn value_for(flag: &Flag, index: usize, reason: Reason) -> EvaluationDetail<FlagValue> {
    match flag.variation(index) {
        Some(value) => EvaluationDetail {
            value: Some(value.clone()),
            variation_index: Some(index),
            reason,
        },
        None => {
            log::warn!(
                target: "switchgear",
                flag_key = flag.key,
                variation_index = index;
                "flag names a variation that does not exist; serving error default"
            );
            EvaluationDetail::err(ErrorKind::MalformedFlag)
        }
    }
}
