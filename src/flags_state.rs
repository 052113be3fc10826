//! Point-in-time snapshot of all flag values for one context.
//!
//! Server-side callers hand the serialized form to a client-side SDK as
//! bootstrap data, so the JSON shape is a wire contract: the flag values
//! keyed at the top level, per-flag metadata under `"$flagsState"`, and a
//! `"$valid"` marker.

use std::collections::HashMap;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::context::Context;
use crate::eval::{Evaluator, Reason};
use crate::model::{DataKind, FlagValue, Timestamp};

/// Options for [`Evaluator::all_flags_state`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AllFlagsOptions {
    /// Include an evaluation reason in each flag's metadata.
    pub with_reasons: bool,
    /// Omit version and reason for flags with no event tracking, keeping
    /// bootstrap payloads small.
    pub details_only_for_tracked_flags: bool,
}

/// Values and evaluation metadata for every flag in the store, evaluated for
/// one context.
#[derive(Debug, Clone)]
pub struct AllFlagsState {
    valid: bool,
    flags: HashMap<String, FlagState>,
}

#[derive(Debug, Clone)]
struct FlagState {
    value: Option<FlagValue>,
    metadata: FlagMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct FlagMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<Reason>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    track_events: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    track_reason: bool,
    #[serde(rename = "debugEventsUntilDate", skip_serializing_if = "Option::is_none")]
    debug_events_until: Option<Timestamp>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    prerequisites: Vec<String>,
}

impl AllFlagsState {
    /// False when the snapshot was taken before the store had data; the
    /// snapshot is then empty and should not be used for bootstrapping.
    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn value(&self, flag_key: &str) -> Option<&FlagValue> {
        self.flags.get(flag_key).and_then(|f| f.value.as_ref())
    }
}

impl Serialize for AllFlagsState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct MetadataView<'a>(&'a HashMap<String, FlagState>);

        impl Serialize for MetadataView<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.0.len()))?;
                for (key, flag) in self.0 {
                    map.serialize_entry(key, &flag.metadata)?;
                }
                map.end()
            }
        }

        let mut map = serializer.serialize_map(Some(self.flags.len() + 2))?;
        for (key, flag) in &self.flags {
            map.serialize_entry(key, &flag.value)?;
        }
        map.serialize_entry("$flagsState", &MetadataView(&self.flags))?;
        map.serialize_entry("$valid", &self.valid)?;
        map.end()
    }
}

impl Evaluator {
    /// Evaluate every flag in the store for `context` and capture the
    /// results as an [`AllFlagsState`].
    ///
    /// No events are produced; the metadata carries the tracking bits a
    /// client-side SDK needs to generate its own.
    pub fn all_flags_state(&self, context: &Context, options: AllFlagsOptions) -> AllFlagsState {
        if !self.store().initialized() {
            log::warn!(target: "switchgear", "all_flags_state requested before the flag store is initialized; returning empty invalid state");
            return AllFlagsState {
                valid: false,
                flags: HashMap::new(),
            };
        }

        let mut flags = HashMap::new();
        for item in self.store().all(DataKind::Flag).into_values() {
            let Some(flag) = item.as_flag() else {
                continue;
            };
            let record = self.raw_outcome(flag, context).record;
            let tracked = record.track_events
                || record.track_reason
                || record.debug_events_until.is_some();
            let omit_details = options.details_only_for_tracked_flags && !tracked;
            flags.insert(
                record.flag_key,
                FlagState {
                    value: record.detail.value,
                    metadata: FlagMetadata {
                        variation: record.detail.variation_index,
                        version: (!omit_details).then_some(flag.version),
                        reason: (options.with_reasons && !omit_details)
                            .then_some(record.detail.reason),
                        track_events: record.track_events,
                        track_reason: record.track_reason,
                        debug_events_until: record.debug_events_until,
                        prerequisites: record.prerequisites,
                    },
                },
            );
        }
        AllFlagsState { valid: true, flags }
    }
}
