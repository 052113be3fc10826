mod bucketing;
mod evaluator;
mod rules;

pub(crate) mod detail;

pub use detail::{ErrorKind, EvaluationDetail, Reason};
pub use evaluator::{EvaluationOutcome, Evaluator};
