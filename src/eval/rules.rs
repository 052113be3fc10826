//! Clause matching: resolving targeting rule clauses against a context.
//!
//! `segmentMatch` clauses are the exception; they need store access and
//! recursion control, so the evaluator handles them before delegating here.

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use semver::Version;

use crate::context::{AttributeValue, Context, ContextKind};
use crate::eval::detail::ErrorKind;
use crate::model::{Clause, Operator, SegmentTarget};

/// Evaluate one clause against the context, honoring the clause's context
/// kind and negation. Missing context parts and missing attributes never
/// match, negated or not.
pub(crate) fn clause_matches_context(
    clause: &Clause,
    context: &Context,
) -> Result<bool, ErrorKind> {
    if !clause.attribute.is_valid() {
        return Err(ErrorKind::MalformedFlag);
    }
    if clause.attribute.is_kind() {
        // Kind clauses test every kind the context carries, so that
        // `kind in ["org"]` matches any context with an org part.
        let matched = context.kinds().iter().any(|kind| {
            let value = AttributeValue::String(kind.as_str().to_owned());
            clause_value_match(clause, &value)
        });
        return Ok(matched != clause.negate);
    }

    let Some(part) = context.individual_context(&clause.context_kind) else {
        return Ok(false);
    };
    let Some(value) = part.value_of(&clause.attribute) else {
        return Ok(false);
    };
    let matched = match &value {
        AttributeValue::Array(items) => items.iter().any(|item| clause_value_match(clause, item)),
        single => clause_value_match(clause, single),
    };
    Ok(matched != clause.negate)
}

fn clause_value_match(clause: &Clause, attribute: &AttributeValue) -> bool {
    clause
        .values
        .iter()
        .any(|clause_value| clause.op.apply(attribute, clause_value))
}

/// Whether the segment's target lists name this context. The bare key
/// list addresses the user kind; the per-kind lists address their own.
pub(crate) fn segment_lists_contain(
    user_keys: &[String],
    per_kind: &[SegmentTarget],
    context: &Context,
) -> bool {
    if let Some(user) = context.individual_context(&ContextKind::user()) {
        if user_keys.iter().any(|key| key == user.key()) {
            return true;
        }
    }
    per_kind.iter().any(|target| {
        context
            .individual_context(&target.context_kind)
            .is_some_and(|part| target.values.iter().any(|key| key == part.key()))
    })
}

impl Operator {
    /// Apply the operator to an attribute value and one clause value.
    /// Returns `false` whenever the operator cannot be applied: wrong value
    /// types, an unparsable regex, version or timestamp, or an operator
    /// this SDK does not know.
    pub(crate) fn apply(&self, attribute: &AttributeValue, clause_value: &AttributeValue) -> bool {
        self.try_apply(attribute, clause_value).unwrap_or(false)
    }

    fn try_apply(
        &self,
        attribute: &AttributeValue,
        clause_value: &AttributeValue,
    ) -> Option<bool> {
        match self {
            Operator::In => Some(attribute == clause_value),

            Operator::StartsWith => {
                Some(attribute.as_str()?.starts_with(clause_value.as_str()?))
            }
            Operator::EndsWith => Some(attribute.as_str()?.ends_with(clause_value.as_str()?)),
            Operator::Contains => Some(attribute.as_str()?.contains(clause_value.as_str()?)),

            Operator::Matches => {
                let regex = Regex::new(clause_value.as_str()?).ok()?;
                Some(regex.is_match(attribute.as_str()?))
            }

            Operator::LessThan
            | Operator::LessThanOrEqual
            | Operator::GreaterThan
            | Operator::GreaterThanOrEqual => {
                let a = attribute.as_number()?;
                let b = clause_value.as_number()?;
                Some(match self {
                    Operator::LessThan => a < b,
                    Operator::LessThanOrEqual => a <= b,
                    Operator::GreaterThan => a > b,
                    Operator::GreaterThanOrEqual => a >= b,
                    _ => return None,
                })
            }

            Operator::Before | Operator::After => {
                let a = parse_time(attribute)?;
                let b = parse_time(clause_value)?;
                Some(if matches!(self, Operator::Before) {
                    a < b
                } else {
                    a > b
                })
            }

            Operator::SemVerEqual | Operator::SemVerLessThan | Operator::SemVerGreaterThan => {
                let a = parse_semver(attribute.as_str()?)?;
                let b = parse_semver(clause_value.as_str()?)?;
                Some(match self {
                    Operator::SemVerEqual => a == b,
                    Operator::SemVerLessThan => a < b,
                    Operator::SemVerGreaterThan => a > b,
                    _ => return None,
                })
            }

            // Resolved against the store by the evaluator, never here.
            Operator::SegmentMatch => None,
            Operator::Unknown => None,
        }
    }
}

/// Timestamps are either RFC 3339 strings or numbers of milliseconds
/// since the Unix epoch.
fn parse_time(value: &AttributeValue) -> Option<DateTime<Utc>> {
    match value {
        AttributeValue::Number(millis) => Utc.timestamp_millis_opt(*millis as i64).single(),
        AttributeValue::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

/// Parse a version, zero-filling missing minor/patch components so that
/// "2" and "2.1" count as "2.0.0" and "2.1.0". Any prerelease or build
/// suffix is kept.
fn parse_semver(s: &str) -> Option<Version> {
    if let Ok(version) = Version::parse(s) {
        return Some(version);
    }
    let split = s.find(['-', '+']).unwrap_or(s.len());
    let (core, suffix) = s.split_at(split);
    let dots = core.bytes().filter(|b| *b == b'.').count();
    if dots >= 2 {
        return None;
    }
    let mut padded = core.to_owned();
    for _ in dots..2 {
        padded.push_str(".0");
    }
    padded.push_str(suffix);
    Version::parse(&padded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Reference;

    fn clause(attribute: &str, op: Operator, values: Vec<AttributeValue>) -> Clause {
        Clause {
            context_kind: ContextKind::user(),
            attribute: Reference::new(attribute),
            op,
            values,
            negate: false,
        }
    }

    #[test]
    fn op_in_is_typed_equality() {
        assert!(Operator::In.apply(&"alice".into(), &"alice".into()));
        assert!(!Operator::In.apply(&"alice".into(), &"bob".into()));
        assert!(Operator::In.apply(&42.into(), &42.into()));
        assert!(Operator::In.apply(&true.into(), &true.into()));
        // No cross-type coercion.
        assert!(!Operator::In.apply(&"42".into(), &42.into()));
        assert!(!Operator::In.apply(&true.into(), &"true".into()));
    }

    #[test]
    fn op_string_affixes() {
        assert!(Operator::StartsWith.apply(&"test@example.com".into(), &"test".into()));
        assert!(!Operator::StartsWith.apply(&"example@test.com".into(), &"test".into()));
        assert!(Operator::EndsWith.apply(&"test@example.com".into(), &".com".into()));
        assert!(Operator::Contains.apply(&"test@example.com".into(), &"@example.".into()));
        assert!(!Operator::Contains.apply(&42.into(), &"4".into()));
    }

    #[test]
    fn op_matches_regex() {
        assert!(Operator::Matches.apply(&"test@example.com".into(), &"^test.*".into()));
        assert!(!Operator::Matches.apply(&"example@test.com".into(), &"^test.*".into()));
        // Unparsable pattern never matches.
        assert!(!Operator::Matches.apply(&"anything".into(), &"(unclosed".into()));
    }

    #[test]
    fn op_numeric_comparisons() {
        assert!(Operator::LessThan.apply(&17.into(), &18.into()));
        assert!(!Operator::LessThan.apply(&18.into(), &18.into()));
        assert!(Operator::LessThanOrEqual.apply(&18.into(), &18.into()));
        assert!(Operator::GreaterThan.apply(&19.into(), &18.into()));
        assert!(!Operator::GreaterThan.apply(&18.into(), &18.into()));
        assert!(Operator::GreaterThanOrEqual.apply(&18.into(), &18.into()));
        // Numbers only; numeric strings do not compare.
        assert!(!Operator::GreaterThan.apply(&"19".into(), &18.into()));
    }

    #[test]
    fn op_dates_accept_rfc3339_and_epoch_millis() {
        let earlier = AttributeValue::from("2024-01-01T00:00:00Z");
        let later = AttributeValue::from("2024-06-01T00:00:00Z");
        assert!(Operator::Before.apply(&earlier, &later));
        assert!(!Operator::Before.apply(&later, &earlier));
        assert!(Operator::After.apply(&later, &earlier));
        // Millis and strings mix.
        assert!(Operator::Before.apply(&0.into(), &earlier));
        assert!(!Operator::Before.apply(&"junk".into(), &later));
    }

    #[test]
    fn op_semver_comparisons() {
        assert!(Operator::SemVerEqual.apply(&"2".into(), &"2.0.0".into()));
        assert!(Operator::SemVerEqual.apply(&"2.1".into(), &"2.1.0".into()));
        assert!(Operator::SemVerLessThan.apply(&"1.2.0".into(), &"1.10.0".into()));
        assert!(!Operator::SemVerLessThan.apply(&"1.10.0".into(), &"1.2.0".into()));
        assert!(Operator::SemVerGreaterThan.apply(&"1.0.1".into(), &"1.0.0".into()));
        assert!(Operator::SemVerGreaterThan.apply(&"2.0.0".into(), &"2.0.0-rc1".into()));
        assert!(!Operator::SemVerEqual.apply(&"junk".into(), &"1.0.0".into()));
    }

    #[test]
    fn op_segment_match_and_unknown_never_apply_directly() {
        assert!(!Operator::SegmentMatch.apply(&"seg".into(), &"seg".into()));
        assert!(!Operator::Unknown.apply(&"a".into(), &"a".into()));
    }

    #[test]
    fn clause_matches_any_of_its_values() {
        let c = clause("name", Operator::In, vec!["Alice".into(), "Bob".into()]);
        let alice = Context::builder("a").name("Alice").build().unwrap();
        let carol = Context::builder("c").name("Carol").build().unwrap();
        assert!(clause_matches_context(&c, &alice).unwrap());
        assert!(!clause_matches_context(&c, &carol).unwrap());
    }

    #[test]
    fn negation_inverts_matches_but_not_missing_attributes() {
        let mut c = clause("tier", Operator::In, vec!["gold".into()]);
        c.negate = true;
        let silver = Context::builder("a").set("tier", "silver").build().unwrap();
        let absent = Context::builder("b").build().unwrap();
        assert!(clause_matches_context(&c, &silver).unwrap());
        // A missing attribute stays a non-match even under negation.
        assert!(!clause_matches_context(&c, &absent).unwrap());
    }

    #[test]
    fn array_attributes_match_any_element() {
        let c = clause("groups", Operator::In, vec!["beta".into()]);
        let context = Context::builder("a")
            .set(
                "groups",
                AttributeValue::Array(vec!["alpha".into(), "beta".into()]),
            )
            .build()
            .unwrap();
        assert!(clause_matches_context(&c, &context).unwrap());
    }

    #[test]
    fn kind_clauses_test_every_kind() {
        let c = clause("kind", Operator::In, vec!["org".into()]);
        let user = Context::builder("u").build().unwrap();
        let multi = Context::multi_builder()
            .add(Context::builder("u").build().unwrap())
            .add(Context::builder("o").kind("org").build().unwrap())
            .build()
            .unwrap();
        assert!(!clause_matches_context(&c, &user).unwrap());
        assert!(clause_matches_context(&c, &multi).unwrap());
    }

    #[test]
    fn clause_kind_selects_the_context_part() {
        let mut c = clause("tier", Operator::In, vec!["gold".into()]);
        c.context_kind = ContextKind::from("org");
        let user_only = Context::builder("a").set("tier", "gold").build().unwrap();
        assert!(!clause_matches_context(&c, &user_only).unwrap());

        let with_org = Context::multi_builder()
            .add(Context::builder("a").build().unwrap())
            .add(
                Context::builder("acme")
                    .kind("org")
                    .set("tier", "gold")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        assert!(clause_matches_context(&c, &with_org).unwrap());
    }

    #[test]
    fn invalid_attribute_reference_is_malformed() {
        let c = clause("/", Operator::In, vec!["x".into()]);
        let context = Context::builder("a").build().unwrap();
        assert_eq!(
            clause_matches_context(&c, &context),
            Err(ErrorKind::MalformedFlag)
        );
    }

    #[test]
    fn segment_lists_address_kinds() {
        let targets = vec![SegmentTarget {
            context_kind: ContextKind::from("org"),
            values: vec!["acme".to_owned()],
        }];
        let user_keys = vec!["alice".to_owned()];

        let alice = Context::builder("alice").build().unwrap();
        let acme = Context::builder("acme").kind("org").build().unwrap();
        let bob = Context::builder("bob").build().unwrap();

        assert!(segment_lists_contain(&user_keys, &targets, &alice));
        assert!(segment_lists_contain(&user_keys, &targets, &acme));
        assert!(!segment_lists_contain(&user_keys, &targets, &bob));
        // The bare key list only addresses the user kind.
        let acme_user_key = Context::builder("alice").kind("org").build().unwrap();
        assert!(!segment_lists_contain(&user_keys, &[], &acme_user_key));
    }
}
