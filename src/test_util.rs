//! Shared test fixtures: flag/segment builders and in-memory fakes for the
//! persistent and big segment store traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use chrono::Utc;

use crate::big_segments::{
    context_hash, BigSegmentMembership, BigSegmentStore, BigSegmentStoreMetadata,
};
use crate::changeset::{Change, ChangeSetBuilder};
use crate::context::{ContextKind, Reference};
use crate::error::StoreError;
use crate::model::{
    Clause, DataKind, Flag, FlagRule, FlagValue, Operator, Prerequisite, Segment, SegmentRule,
    StoreItem, Target, Timestamp, VariationOrRollout,
};
use crate::store::{PersistentDataStore, SerializedItem};

/// Builds a boolean flag that is on and falls through to `true` unless told
/// otherwise.
pub struct FlagBuilder {
    flag: Flag,
}

impl FlagBuilder {
    pub fn new(key: &str) -> FlagBuilder {
        FlagBuilder {
            flag: Flag {
                key: key.to_owned(),
                version: 1,
                on: true,
                variations: vec![FlagValue::Bool(false), FlagValue::Bool(true)],
                prerequisites: vec![],
                targets: vec![],
                context_targets: vec![],
                rules: vec![],
                fallthrough: VariationOrRollout::Variation { variation: 1 },
                off_variation: Some(0),
                salt: "salt".to_owned(),
                track_events: false,
                track_events_fallthrough: false,
                debug_events_until: None,
                exclude_from_summaries: false,
            },
        }
    }

    pub fn version(mut self, version: u64) -> FlagBuilder {
        self.flag.version = version;
        self
    }

    pub fn on(mut self, on: bool) -> FlagBuilder {
        self.flag.on = on;
        self
    }

    pub fn off_variation(mut self, off_variation: Option<usize>) -> FlagBuilder {
        self.flag.off_variation = off_variation;
        self
    }

    pub fn variations(mut self, variations: Vec<FlagValue>) -> FlagBuilder {
        self.flag.variations = variations;
        self
    }

    pub fn fallthrough(mut self, fallthrough: VariationOrRollout) -> FlagBuilder {
        self.flag.fallthrough = fallthrough;
        self
    }

    pub fn fallthrough_variation(self, variation: usize) -> FlagBuilder {
        self.fallthrough(VariationOrRollout::Variation { variation })
    }

    pub fn target(mut self, variation: usize, keys: &[&str]) -> FlagBuilder {
        self.flag.targets.push(Target {
            context_kind: ContextKind::user(),
            values: keys.iter().map(|key| (*key).to_owned()).collect(),
            variation,
        });
        self
    }

    pub fn context_target(mut self, kind: &str, variation: usize, keys: &[&str]) -> FlagBuilder {
        self.flag.context_targets.push(Target {
            context_kind: kind.into(),
            values: keys.iter().map(|key| (*key).to_owned()).collect(),
            variation,
        });
        self
    }

    pub fn rule(mut self, id: &str, clauses: Vec<Clause>, variation: usize) -> FlagBuilder {
        self.flag.rules.push(FlagRule {
            id: id.to_owned(),
            clauses,
            variation_or_rollout: VariationOrRollout::Variation { variation },
            track_events: false,
        });
        self
    }

    /// A rule serving variation 0 to members of the given segment.
    pub fn segment_match_rule(self, segment_key: &str) -> FlagBuilder {
        let id = format!("match-{segment_key}");
        self.rule(&id, vec![segment_match_clause(segment_key)], 0)
    }

    pub fn prerequisite(mut self, key: &str, variation: usize) -> FlagBuilder {
        self.flag.prerequisites.push(Prerequisite {
            key: key.to_owned(),
            variation,
        });
        self
    }

    pub fn track_events_fallthrough(mut self, track: bool) -> FlagBuilder {
        self.flag.track_events_fallthrough = track;
        self
    }

    pub fn build(self) -> Flag {
        self.flag
    }
}

/// Builds a segment with no members and no rules.
pub struct SegmentBuilder {
    segment: Segment,
}

impl SegmentBuilder {
    pub fn new(key: &str) -> SegmentBuilder {
        SegmentBuilder {
            segment: Segment {
                key: key.to_owned(),
                version: 1,
                included: vec![],
                excluded: vec![],
                included_contexts: vec![],
                excluded_contexts: vec![],
                rules: vec![],
                salt: "salt".to_owned(),
                unbounded: false,
                unbounded_context_kind: None,
                generation: None,
            },
        }
    }

    pub fn version(mut self, version: u64) -> SegmentBuilder {
        self.segment.version = version;
        self
    }

    pub fn included(mut self, keys: &[&str]) -> SegmentBuilder {
        self.segment.included = keys.iter().map(|key| (*key).to_owned()).collect();
        self
    }

    pub fn excluded(mut self, keys: &[&str]) -> SegmentBuilder {
        self.segment.excluded = keys.iter().map(|key| (*key).to_owned()).collect();
        self
    }

    fn rule(mut self, id: &str, clauses: Vec<Clause>, weight: Option<i64>) -> SegmentBuilder {
        self.segment.rules.push(SegmentRule {
            id: id.to_owned(),
            clauses,
            weight,
            bucket_by: None,
            rollout_context_kind: None,
        });
        self
    }

    /// A rule with no clauses and no weight; everyone is a member.
    pub fn match_all_rule(self) -> SegmentBuilder {
        self.rule("match-all", vec![], None)
    }

    /// A clauseless rule rolling membership out to `weight / 100_000` of
    /// contexts.
    pub fn weighted_rule(self, weight: i64) -> SegmentBuilder {
        self.rule("weighted", vec![], Some(weight))
    }

    /// A rule matching members of another segment.
    pub fn segment_match_rule(self, segment_key: &str) -> SegmentBuilder {
        let id = format!("match-{segment_key}");
        self.rule(&id, vec![segment_match_clause(segment_key)], None)
    }

    pub fn unbounded(mut self, generation: i64) -> SegmentBuilder {
        self.segment.unbounded = true;
        self.segment.generation = Some(generation);
        self
    }

    pub fn build(self) -> Segment {
        self.segment
    }
}

fn segment_match_clause(segment_key: &str) -> Clause {
    Clause {
        context_kind: ContextKind::user(),
        attribute: Reference::new("key"),
        op: Operator::SegmentMatch,
        values: vec![segment_key.into()],
        negate: false,
    }
}

/// A full-transfer change set body for the given data.
pub fn basis_of(flags: Vec<Flag>, segments: Vec<Segment>) -> Vec<Change> {
    let mut builder = ChangeSetBuilder::start_full(None);
    for flag in flags {
        let key = flag.key.clone();
        builder.add_put(DataKind::Flag, key, flag);
    }
    for segment in segments {
        let key = segment.key.clone();
        builder.add_put(DataKind::Segment, key, segment);
    }
    builder.finish().changes().to_vec()
}

/// In-memory [`PersistentDataStore`] with call counters and a failure
/// switch.
#[derive(Default)]
pub struct MockBackend {
    pub items: Mutex<HashMap<(DataKind, String), SerializedItem>>,
    pub inited: AtomicBool,
    pub fail: AtomicBool,
    pub get_calls: AtomicUsize,
    pub all_calls: AtomicUsize,
    pub init_checks: AtomicUsize,
}

impl MockBackend {
    /// Seed an item directly, bypassing the failure switch and counters.
    pub fn put(&self, kind: DataKind, key: &str, item: &StoreItem) {
        let serialized = SerializedItem::from_item(key, item).unwrap();
        self.items
            .lock()
            .unwrap()
            .insert((kind, key.to_owned()), serialized);
    }

    pub fn version_of(&self, kind: DataKind, key: &str) -> Option<u64> {
        self.items
            .lock()
            .unwrap()
            .get(&(kind, key.to_owned()))
            .map(|item| item.version)
    }

    fn check(&self) -> std::result::Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::new("backend down"));
        }
        Ok(())
    }
}

impl PersistentDataStore for MockBackend {
    fn init(
        &self,
        data: &[(DataKind, Vec<(String, SerializedItem)>)],
    ) -> std::result::Result<(), StoreError> {
        self.check()?;
        let mut items = self.items.lock().unwrap();
        items.clear();
        for (kind, entries) in data {
            for (key, item) in entries {
                items.insert((*kind, key.clone()), item.clone());
            }
        }
        self.inited.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get(
        &self,
        kind: DataKind,
        key: &str,
    ) -> std::result::Result<Option<SerializedItem>, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(&(kind, key.to_owned()))
            .cloned())
    }

    fn all(&self, kind: DataKind) -> std::result::Result<Vec<(String, SerializedItem)>, StoreError> {
        self.all_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|((item_kind, _), _)| *item_kind == kind)
            .map(|((_, key), item)| (key.clone(), item.clone()))
            .collect())
    }

    fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: SerializedItem,
    ) -> std::result::Result<SerializedItem, StoreError> {
        self.check()?;
        let mut items = self.items.lock().unwrap();
        let slot = (kind, key.to_owned());
        if let Some(existing) = items.get(&slot) {
            if existing.version >= item.version {
                return Ok(existing.clone());
            }
        }
        items.insert(slot, item.clone());
        Ok(item)
    }

    fn initialized(&self) -> std::result::Result<bool, StoreError> {
        self.init_checks.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.inited.load(Ordering::SeqCst))
    }

    fn available(&self) -> bool {
        !self.fail.load(Ordering::SeqCst)
    }
}

/// In-memory [`BigSegmentStore`] keyed by hashed context key.
#[derive(Default)]
pub struct MockBigSegmentStore {
    pub memberships: Mutex<HashMap<String, BigSegmentMembership>>,
    pub last_up_to_date: Mutex<Option<Timestamp>>,
    pub fail: AtomicBool,
    pub membership_calls: AtomicUsize,
    pub metadata_calls: AtomicUsize,
}

impl MockBigSegmentStore {
    pub fn put(&self, context_key: &str, membership: BigSegmentMembership) {
        self.memberships
            .lock()
            .unwrap()
            .insert(context_hash(context_key), membership);
    }

    pub fn synced_now(&self) {
        *self.last_up_to_date.lock().unwrap() = Some(Utc::now());
    }
}

impl BigSegmentStore for MockBigSegmentStore {
    fn metadata(&self) -> std::result::Result<BigSegmentStoreMetadata, StoreError> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::new("metadata poll failed"));
        }
        Ok(BigSegmentStoreMetadata {
            last_up_to_date: *self.last_up_to_date.lock().unwrap(),
        })
    }

    fn membership(
        &self,
        context_hash: &str,
    ) -> std::result::Result<Option<BigSegmentMembership>, StoreError> {
        self.membership_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::new("membership query failed"));
        }
        Ok(self.memberships.lock().unwrap().get(context_hash).cloned())
    }
}
