use serde::{Deserialize, Serialize};

/// Result of a flag evaluation: the value, which variation it was, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetail<T> {
    /// The evaluated value. `None` when evaluation could not produce one
    /// (the caller's default applies).
    #[serde(default)]
    pub value: Option<T>,
    /// Index into the flag's variations list, when the value came from one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

impl<T> EvaluationDetail<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> EvaluationDetail<U> {
        EvaluationDetail {
            value: self.value.map(f),
            variation_index: self.variation_index,
            reason: self.reason,
        }
    }

    pub fn value_or(self, default: T) -> T {
        self.value.unwrap_or(default)
    }

    pub(crate) fn err(kind: ErrorKind) -> EvaluationDetail<T> {
        EvaluationDetail {
            value: None,
            variation_index: None,
            reason: Reason::Error { error_kind: kind },
        }
    }
}

/// Why an evaluation produced the value it did.
///
/// Serializes in the analytics wire shape: a `kind` tag plus
/// reason-specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Reason {
    /// The flag is off; the off variation applied.
    Off,
    /// The context key was individually targeted.
    TargetMatch,
    /// A rule matched.
    RuleMatch {
        rule_index: usize,
        rule_id: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// A prerequisite flag was off or served the wrong variation; the off
    /// variation applied.
    PrerequisiteFailed { prerequisite_key: String },
    /// No target or rule matched.
    Fallthrough {
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// Evaluation failed; the caller's default applied.
    Error { error_kind: ErrorKind },
}

impl Reason {
    /// Whether the value was served by an experiment allocation, meaning
    /// events for it should carry full tracking detail.
    pub fn is_in_experiment(&self) -> bool {
        matches!(
            self,
            Reason::RuleMatch {
                in_experiment: true,
                ..
            } | Reason::Fallthrough {
                in_experiment: true
            }
        )
    }

    pub(crate) fn error(kind: ErrorKind) -> Reason {
        Reason::Error { error_kind: kind }
    }
}

/// What went wrong when [`Reason::Error`] is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The flag key is not in the store.
    FlagNotFound,
    /// Flag or segment data was structurally unusable (bad variation index,
    /// empty rollout, circular references, ...).
    MalformedFlag,
    /// No usable evaluation context was supplied. Reserved for SDK surfaces
    /// that accept contexts from the wire; contexts built through
    /// [`crate::ContextBuilder`] are valid by construction.
    UserNotSpecified,
    /// The flag value does not have the type the caller asked for.
    WrongType,
    /// Big segment membership was needed but could not be fetched.
    BigSegmentStoreError,
    /// Unexpected internal error.
    Exception,
}
