//! Record types produced by evaluations and migration operations.
//!
//! Delivery is out of scope for this crate: an event pipeline consumes
//! these records and turns them into analytics payloads. Everything here
//! serializes in the camelCase shape that transport expects.

use std::collections::HashMap;

use serde::Serialize;

use crate::eval::EvaluationDetail;
use crate::migration::{MigrationOperation, MigrationOrigin, MigrationStage};
use crate::model::{FlagValue, Timestamp};

/// One prerequisite evaluation performed while evaluating a parent flag.
/// Produced even when the prerequisite failed its parent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisiteEvent {
    /// Key of the prerequisite flag that was evaluated.
    pub flag_key: String,
    /// Key of the flag that required it.
    pub prerequisite_of: String,
    pub detail: EvaluationDetail<FlagValue>,
    /// Whether the pipeline should emit a full feature event for it.
    pub track_events: bool,
    #[serde(rename = "debugEventsUntilDate", skip_serializing_if = "Option::is_none")]
    pub debug_events_until: Option<Timestamp>,
}

/// Everything a feature-event pipeline needs to record one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRecord {
    pub flag_key: String,
    /// Version of the flag that was evaluated; absent when the flag was
    /// not found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag_version: Option<u64>,
    pub detail: EvaluationDetail<FlagValue>,
    /// Whether the pipeline should emit a full feature event.
    pub track_events: bool,
    /// Whether the reason must ride along even for callers that did not
    /// ask for reasons.
    pub track_reason: bool,
    #[serde(rename = "debugEventsUntilDate", skip_serializing_if = "Option::is_none")]
    pub debug_events_until: Option<Timestamp>,
    /// Keys of the flag's direct prerequisites, in evaluation order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prerequisites: Vec<String>,
}

/// Outcome of one migration read or write.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOpEvent {
    pub operation: MigrationOperation,
    pub flag_key: String,
    /// Stage the operation actually ran under.
    pub stage: MigrationStage,
    pub default_stage: MigrationStage,
    /// Origins the operation invoked.
    pub invoked: Vec<MigrationOrigin>,
    /// Wall-clock latency per invoked origin, when latency measurement
    /// is enabled.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub latency_ms: HashMap<MigrationOrigin, u64>,
    /// Origins whose operation returned an error.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<MigrationOrigin>,
    /// Result of the consistency check, when one ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consistent: Option<bool>,
}
