//! Flag-driven dual-backend migration orchestration.
//!
//! A migration flag carries a stage name; [`Migrator`] resolves it per
//! context and routes each read or write to the old backend, the new one, or
//! both, with the authoritative origin decided by the stage. The caller
//! supplies the backend operations; this module only orchestrates them and
//! measures what happened.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::eval::{ErrorKind, EvaluationDetail, Evaluator, Reason};
use crate::events::MigrationOpEvent;
use crate::model::FlagValue;
use crate::{Error, Result};

/// Stage of a technology migration, as carried in a flag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStage {
    /// Only the old system is exercised.
    Off,
    /// Writes cover both systems; reads still come from the old one.
    DualWrite,
    /// Both systems are exercised; the old one stays authoritative.
    Shadow,
    /// Both systems are exercised; the new one becomes authoritative.
    Live,
    /// Reads come from the new system only; writes still cover both.
    RampDown,
    /// The migration is done; the old system is out of the path.
    Complete,
}

impl MigrationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStage::Off => "off",
            MigrationStage::DualWrite => "dualwrite",
            MigrationStage::Shadow => "shadow",
            MigrationStage::Live => "live",
            MigrationStage::RampDown => "rampdown",
            MigrationStage::Complete => "complete",
        }
    }
}

impl std::fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error from parsing a [`MigrationStage`] out of a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a migration stage: {0:?}")]
pub struct ParseStageError(String);

impl std::str::FromStr for MigrationStage {
    type Err = ParseStageError;

    fn from_str(s: &str) -> std::result::Result<MigrationStage, ParseStageError> {
        match s {
            "off" => Ok(MigrationStage::Off),
            "dualwrite" => Ok(MigrationStage::DualWrite),
            "shadow" => Ok(MigrationStage::Shadow),
            "live" => Ok(MigrationStage::Live),
            "rampdown" => Ok(MigrationStage::RampDown),
            "complete" => Ok(MigrationStage::Complete),
            other => Err(ParseStageError(other.to_owned())),
        }
    }
}

/// One of the two backends a migration moves between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationOrigin {
    Old,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationOperation {
    Read,
    Write,
}

/// How the two reads run when a stage consults both origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionOrder {
    /// Authoritative first, then the other.
    #[default]
    Serial,
    /// Coin-flip which origin goes first.
    Random,
    /// Both at once, on scoped threads.
    Parallel,
}

/// Result of one caller-supplied backend operation.
pub type MigrationOpResult = std::result::Result<serde_json::Value, String>;

/// A caller-supplied backend operation. The payload is whatever the caller
/// handed to [`Migrator::read`] or [`Migrator::write`].
pub type MigrationFn =
    Box<dyn Fn(Option<&serde_json::Value>) -> MigrationOpResult + Send + Sync>;

type ConsistencyCheck = Box<dyn Fn(&serde_json::Value, &serde_json::Value) -> bool + Send + Sync>;

/// What a migration read or write produced.
#[derive(Debug)]
pub struct MigrationResult {
    /// Origin whose result is returned in `result`.
    pub origin: MigrationOrigin,
    pub result: MigrationOpResult,
    /// Record of everything that ran, for the event pipeline.
    pub event: MigrationOpEvent,
}

/// Configures a [`Migrator`].
pub struct MigratorBuilder {
    evaluator: Arc<Evaluator>,
    read_execution_order: ExecutionOrder,
    measure_latency: bool,
    measure_errors: bool,
    read_old: Option<MigrationFn>,
    read_new: Option<MigrationFn>,
    write_old: Option<MigrationFn>,
    write_new: Option<MigrationFn>,
    check: Option<ConsistencyCheck>,
}

impl MigratorBuilder {
    pub fn new(evaluator: Arc<Evaluator>) -> MigratorBuilder {
        MigratorBuilder {
            evaluator,
            read_execution_order: ExecutionOrder::default(),
            measure_latency: true,
            measure_errors: true,
            read_old: None,
            read_new: None,
            write_old: None,
            write_new: None,
            check: None,
        }
    }

    /// How reads run when a stage consults both origins. Defaults to
    /// [`ExecutionOrder::Serial`].
    pub fn read_execution_order(mut self, order: ExecutionOrder) -> MigratorBuilder {
        self.read_execution_order = order;
        self
    }

    /// Whether per-origin latency is recorded on events. Defaults to on.
    pub fn measure_latency(mut self, enabled: bool) -> MigratorBuilder {
        self.measure_latency = enabled;
        self
    }

    /// Whether per-origin errors are recorded on events. Defaults to on.
    pub fn measure_errors(mut self, enabled: bool) -> MigratorBuilder {
        self.measure_errors = enabled;
        self
    }

    /// The read operations for both origins.
    pub fn read(
        mut self,
        old: impl Fn(Option<&serde_json::Value>) -> MigrationOpResult + Send + Sync + 'static,
        new: impl Fn(Option<&serde_json::Value>) -> MigrationOpResult + Send + Sync + 'static,
    ) -> MigratorBuilder {
        self.read_old = Some(Box::new(old));
        self.read_new = Some(Box::new(new));
        self
    }

    /// The write operations for both origins.
    pub fn write(
        mut self,
        old: impl Fn(Option<&serde_json::Value>) -> MigrationOpResult + Send + Sync + 'static,
        new: impl Fn(Option<&serde_json::Value>) -> MigrationOpResult + Send + Sync + 'static,
    ) -> MigratorBuilder {
        self.write_old = Some(Box::new(old));
        self.write_new = Some(Box::new(new));
        self
    }

    /// Consistency check comparing the old and new read results, in that
    /// argument order. Runs only when a stage executed both reads and both
    /// succeeded.
    pub fn check(
        mut self,
        check: impl Fn(&serde_json::Value, &serde_json::Value) -> bool + Send + Sync + 'static,
    ) -> MigratorBuilder {
        self.check = Some(Box::new(check));
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] unless both read and both
    /// write operations were supplied.
    pub fn build(self) -> Result<Migrator> {
        let (Some(read_old), Some(read_new)) = (self.read_old, self.read_new) else {
            return Err(Error::InvalidConfiguration(
                "migrator needs read operations for both origins".to_owned(),
            ));
        };
        let (Some(write_old), Some(write_new)) = (self.write_old, self.write_new) else {
            return Err(Error::InvalidConfiguration(
                "migrator needs write operations for both origins".to_owned(),
            ));
        };
        Ok(Migrator {
            evaluator: self.evaluator,
            read_execution_order: self.read_execution_order,
            measure_latency: self.measure_latency,
            measure_errors: self.measure_errors,
            read_old,
            read_new,
            write_old,
            write_new,
            check: self.check,
        })
    }
}

/// Routes reads and writes between two backends according to a migration
/// flag. Build one with [`MigratorBuilder`].
pub struct Migrator {
    evaluator: Arc<Evaluator>,
    read_execution_order: ExecutionOrder,
    measure_latency: bool,
    measure_errors: bool,
    read_old: MigrationFn,
    read_new: MigrationFn,
    write_old: MigrationFn,
    write_new: MigrationFn,
    check: Option<ConsistencyCheck>,
}

/// (authoritative, secondary) origins a stage consults for reads.
fn read_plan(stage: MigrationStage) -> (MigrationOrigin, Option<MigrationOrigin>) {
    match stage {
        MigrationStage::Off | MigrationStage::DualWrite => (MigrationOrigin::Old, None),
        MigrationStage::Shadow => (MigrationOrigin::Old, Some(MigrationOrigin::New)),
        MigrationStage::Live => (MigrationOrigin::New, Some(MigrationOrigin::Old)),
        MigrationStage::RampDown | MigrationStage::Complete => (MigrationOrigin::New, None),
    }
}

/// (authoritative, secondary) origins a stage consults for writes. The
/// secondary write only runs after the authoritative one succeeded.
fn write_plan(stage: MigrationStage) -> (MigrationOrigin, Option<MigrationOrigin>) {
    match stage {
        MigrationStage::Off => (MigrationOrigin::Old, None),
        MigrationStage::DualWrite | MigrationStage::Shadow => {
            (MigrationOrigin::Old, Some(MigrationOrigin::New))
        }
        MigrationStage::Live | MigrationStage::RampDown => {
            (MigrationOrigin::New, Some(MigrationOrigin::Old))
        }
        MigrationStage::Complete => (MigrationOrigin::New, None),
    }
}

struct OriginRun {
    origin: MigrationOrigin,
    result: MigrationOpResult,
    latency_ms: u64,
}

fn run_origin(f: &MigrationFn, origin: MigrationOrigin, payload: Option<&serde_json::Value>) -> OriginRun {
    let started = Instant::now();
    let result = f(payload);
    OriginRun {
        origin,
        result,
        latency_ms: started.elapsed().as_millis() as u64,
    }
}

impl Migrator {
    /// Resolve the migration stage for `flag_key`.
    ///
    /// A flag value that is not a stage name yields the default stage with a
    /// `WRONG_TYPE` error reason.
    pub fn stage_for(
        &self,
        flag_key: &str,
        context: &Context,
        default_stage: MigrationStage,
    ) -> EvaluationDetail<MigrationStage> {
        let detail = self.evaluator.evaluate(
            flag_key,
            context,
            FlagValue::Str(default_stage.to_string()),
        );
        let parsed = detail
            .value
            .as_ref()
            .and_then(FlagValue::as_str)
            .and_then(|s| s.parse::<MigrationStage>().ok());
        match parsed {
            Some(stage) => EvaluationDetail {
                value: Some(stage),
                variation_index: detail.variation_index,
                reason: detail.reason,
            },
            None => {
                log::warn!(
                    target: "switchgear",
                    flag_key;
                    "flag value is not a migration stage; using the default stage"
                );
                EvaluationDetail {
                    value: Some(default_stage),
                    variation_index: None,
                    reason: Reason::error(ErrorKind::WrongType),
                }
            }
        }
    }

    /// Perform a migration read. Returns the authoritative origin's result.
    pub fn read(
        &self,
        flag_key: &str,
        context: &Context,
        default_stage: MigrationStage,
        payload: Option<&serde_json::Value>,
    ) -> MigrationResult {
        let stage = self
            .stage_for(flag_key, context, default_stage)
            .value_or(default_stage);
        let (authoritative, secondary) = read_plan(stage);
        let mut event = new_event(MigrationOperation::Read, flag_key, stage, default_stage);

        let (primary, secondary_run) = match secondary {
            None => (
                run_origin(self.read_fn(authoritative), authoritative, payload),
                None,
            ),
            Some(secondary) => {
                let (primary, secondary_run) = self.run_reads(authoritative, secondary, payload);
                (primary, Some(secondary_run))
            }
        };
        self.record(&mut event, &primary);
        if let Some(run) = &secondary_run {
            self.record(&mut event, run);
        }

        if let (Some(check), Some(secondary_run)) = (&self.check, &secondary_run) {
            if let (Ok(primary_value), Ok(secondary_value)) =
                (&primary.result, &secondary_run.result)
            {
                let (old, new) = match primary.origin {
                    MigrationOrigin::Old => (primary_value, secondary_value),
                    MigrationOrigin::New => (secondary_value, primary_value),
                };
                event.consistent = Some(check(old, new));
            }
        }

        MigrationResult {
            origin: authoritative,
            result: primary.result,
            event,
        }
    }

    /// Perform a migration write: authoritative origin first, then the
    /// secondary only if the authoritative write succeeded. Returns the
    /// authoritative origin's result.
    pub fn write(
        &self,
        flag_key: &str,
        context: &Context,
        default_stage: MigrationStage,
        payload: Option<&serde_json::Value>,
    ) -> MigrationResult {
        let stage = self
            .stage_for(flag_key, context, default_stage)
            .value_or(default_stage);
        let (authoritative, secondary) = write_plan(stage);
        let mut event = new_event(MigrationOperation::Write, flag_key, stage, default_stage);

        let primary = run_origin(self.write_fn(authoritative), authoritative, payload);
        self.record(&mut event, &primary);
        if primary.result.is_ok() {
            if let Some(secondary) = secondary {
                let run = run_origin(self.write_fn(secondary), secondary, payload);
                self.record(&mut event, &run);
            }
        }

        MigrationResult {
            origin: authoritative,
            result: primary.result,
            event,
        }
    }

    fn read_fn(&self, origin: MigrationOrigin) -> &MigrationFn {
        match origin {
            MigrationOrigin::Old => &self.read_old,
            MigrationOrigin::New => &self.read_new,
        }
    }

    fn write_fn(&self, origin: MigrationOrigin) -> &MigrationFn {
        match origin {
            MigrationOrigin::Old => &self.write_old,
            MigrationOrigin::New => &self.write_new,
        }
    }

    /// Run both reads per the configured execution order, returning
    /// (authoritative run, secondary run) regardless of which ran first.
    fn run_reads(
        &self,
        authoritative: MigrationOrigin,
        secondary: MigrationOrigin,
        payload: Option<&serde_json::Value>,
    ) -> (OriginRun, OriginRun) {
        let a_fn = self.read_fn(authoritative);
        let s_fn = self.read_fn(secondary);
        match self.read_execution_order {
            ExecutionOrder::Serial => (
                run_origin(a_fn, authoritative, payload),
                run_origin(s_fn, secondary, payload),
            ),
            ExecutionOrder::Random => {
                if rand::thread_rng().gen_bool(0.5) {
                    let secondary_run = run_origin(s_fn, secondary, payload);
                    (run_origin(a_fn, authoritative, payload), secondary_run)
                } else {
                    (
                        run_origin(a_fn, authoritative, payload),
                        run_origin(s_fn, secondary, payload),
                    )
                }
            }
            ExecutionOrder::Parallel => std::thread::scope(|scope| {
                let handle = scope.spawn(move || run_origin(a_fn, authoritative, payload));
                let secondary_run = run_origin(s_fn, secondary, payload);
                let primary = match handle.join() {
                    Ok(run) => run,
                    Err(panic) => std::panic::resume_unwind(panic),
                };
                (primary, secondary_run)
            }),
        }
    }

    fn record(&self, event: &mut MigrationOpEvent, run: &OriginRun) {
        event.invoked.push(run.origin);
        if self.measure_latency {
            event.latency_ms.insert(run.origin, run.latency_ms);
        }
        if self.measure_errors && run.result.is_err() {
            event.errors.push(run.origin);
        }
    }
}

fn new_event(
    operation: MigrationOperation,
    flag_key: &str,
    stage: MigrationStage,
    default_stage: MigrationStage,
) -> MigrationOpEvent {
    MigrationOpEvent {
        operation,
        flag_key: flag_key.to_owned(),
        stage,
        default_stage,
        invoked: Vec::new(),
        latency_ms: HashMap::new(),
        errors: Vec::new(),
        consistent: None,
    }
}
