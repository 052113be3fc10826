use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{Clause, DataKind, Operator, StoreItem};

type ItemRef = (DataKind, String);

/// Tracks which items depend on which: flags on prerequisite flags and on
/// segments referenced by `segmentMatch` clauses, segments on other
/// segments.
///
/// The reverse index answers "when this item changes, which flags may now
/// evaluate differently?" so the store can notify exactly those listeners.
#[derive(Default)]
pub struct DependencyTracker {
    /// item -> items it depends on.
    forward: HashMap<ItemRef, HashSet<ItemRef>>,
    /// item -> items that depend on it.
    reverse: HashMap<ItemRef, HashSet<ItemRef>>,
}

impl DependencyTracker {
    pub fn new() -> DependencyTracker {
        DependencyTracker::default()
    }

    /// Replace the recorded dependencies of one item with those of `item`.
    pub fn update_dependencies_of(&mut self, kind: DataKind, key: &str, item: &StoreItem) {
        let from = (kind, key.to_owned());
        if let Some(old) = self.forward.remove(&from) {
            for dep in old {
                if let Some(dependents) = self.reverse.get_mut(&dep) {
                    dependents.remove(&from);
                }
            }
        }
        let deps = dependencies_of(item);
        for dep in &deps {
            self.reverse
                .entry(dep.clone())
                .or_default()
                .insert(from.clone());
        }
        self.forward.insert(from, deps);
    }

    pub fn reset(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    /// Flag keys whose evaluation may be affected by a change to the given
    /// item, the item itself included when it is a flag.
    ///
    /// Traversal is breadth-first over the reverse index, expanding each
    /// item's dependents in sorted order, so direct dependents come before
    /// transitive ones and the order is reproducible. Each flag appears
    /// once, at its shallowest depth.
    pub fn affected_flag_keys(&self, kind: DataKind, key: &str) -> Vec<String> {
        let mut affected = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        let start = (kind, key.to_owned());
        visited.insert(start.clone());
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            if current.0 == DataKind::Flag {
                affected.push(current.1.clone());
            }
            let mut layer: Vec<&ItemRef> = self
                .reverse
                .get(&current)
                .into_iter()
                .flatten()
                .filter(|dependent| !visited.contains(*dependent))
                .collect();
            layer.sort_unstable();
            for dependent in layer {
                visited.insert(dependent.clone());
                queue.push_back(dependent.clone());
            }
        }
        affected
    }
}

fn dependencies_of(item: &StoreItem) -> HashSet<ItemRef> {
    let mut deps = HashSet::new();
    match item {
        StoreItem::Flag(flag) => {
            for prerequisite in &flag.prerequisites {
                deps.insert((DataKind::Flag, prerequisite.key.clone()));
            }
            for rule in &flag.rules {
                collect_segment_refs(&rule.clauses, &mut deps);
            }
        }
        StoreItem::Segment(segment) => {
            for rule in &segment.rules {
                collect_segment_refs(&rule.clauses, &mut deps);
            }
        }
        StoreItem::Tombstone(_) => {}
    }
    deps
}

fn collect_segment_refs(clauses: &[Clause], deps: &mut HashSet<ItemRef>) {
    for clause in clauses {
        if clause.op != Operator::SegmentMatch {
            continue;
        }
        for value in &clause.values {
            if let Some(segment_key) = value.as_str() {
                deps.insert((DataKind::Segment, segment_key.to_owned()));
            }
        }
    }
}
