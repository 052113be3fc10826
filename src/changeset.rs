//! Change sets: the unit of data transfer between data sources and stores.
//!
//! A data source hands the store a [`ChangeSet`] describing either a full
//! basis (replace everything), an incremental delta, or nothing at all (the
//! source checked and the store is already current). Change sets are applied
//! atomically: either every change commits or none does.

use crate::model::{DataKind, StoreItem};

/// What the receiver should do with the accompanying changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentCode {
    /// Replace all stored data with the changes.
    TransferFull,
    /// Apply the changes on top of existing data.
    TransferChanges,
    /// No data accompanies this intent; the store is already up to date.
    TransferNone,
}

/// A single upsert or deletion within a [`ChangeSet`].
#[derive(Debug, Clone)]
pub enum Change {
    Put {
        kind: DataKind,
        key: String,
        item: StoreItem,
    },
    /// Deletion at a version; the store retains it as a tombstone.
    Delete {
        kind: DataKind,
        key: String,
        version: u64,
    },
}

impl Change {
    pub fn kind(&self) -> DataKind {
        match self {
            Change::Put { kind, .. } | Change::Delete { kind, .. } => *kind,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Change::Put { key, .. } | Change::Delete { key, .. } => key,
        }
    }

    /// View this change as the store entry it produces; deletions become
    /// tombstones.
    pub(crate) fn as_entry(&self) -> (DataKind, &str, StoreItem) {
        match self {
            Change::Put { kind, key, item } => (*kind, key, item.clone()),
            Change::Delete { kind, key, version } => {
                (*kind, key, StoreItem::Tombstone(*version))
            }
        }
    }
}

/// Opaque token identifying a point in a data source's change stream.
/// Sources use it to resume; the store records the latest applied one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Selector(String);

impl Selector {
    pub fn new(state: impl Into<String>) -> Selector {
        Selector(state.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An atomic batch of data changes with an intent describing how to apply
/// them.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    intent: IntentCode,
    changes: Vec<Change>,
    selector: Option<Selector>,
}

impl ChangeSet {
    /// A change set carrying no data: the source verified the store is
    /// current. Applying it succeeds without touching the store.
    pub fn no_changes() -> ChangeSet {
        ChangeSet {
            intent: IntentCode::TransferNone,
            changes: Vec::new(),
            selector: None,
        }
    }

    pub fn intent(&self) -> IntentCode {
        self.intent
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn selector(&self) -> Option<&Selector> {
        self.selector.as_ref()
    }
}

/// Builder for [`ChangeSet`]s. The intent is fixed at construction, so a
/// half-built change set is unrepresentable.
#[derive(Debug)]
pub struct ChangeSetBuilder {
    intent: IntentCode,
    changes: Vec<Change>,
    selector: Option<Selector>,
}

impl ChangeSetBuilder {
    /// Start a full-transfer change set replacing all stored data.
    pub fn start_full(selector: Option<Selector>) -> ChangeSetBuilder {
        ChangeSetBuilder {
            intent: IntentCode::TransferFull,
            changes: Vec::new(),
            selector,
        }
    }

    /// Start an incremental change set.
    pub fn start_changes(selector: Option<Selector>) -> ChangeSetBuilder {
        ChangeSetBuilder {
            intent: IntentCode::TransferChanges,
            changes: Vec::new(),
            selector,
        }
    }

    pub fn add_put(
        &mut self,
        kind: DataKind,
        key: impl Into<String>,
        item: impl Into<StoreItem>,
    ) -> &mut ChangeSetBuilder {
        self.changes.push(Change::Put {
            kind,
            key: key.into(),
            item: item.into(),
        });
        self
    }

    pub fn add_delete(
        &mut self,
        kind: DataKind,
        key: impl Into<String>,
        version: u64,
    ) -> &mut ChangeSetBuilder {
        self.changes.push(Change::Delete {
            kind,
            key: key.into(),
            version,
        });
        self
    }

    pub fn finish(self) -> ChangeSet {
        ChangeSet {
            intent: self.intent,
            changes: self.changes,
            selector: self.selector,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FlagBuilder;

    #[test]
    fn builder_collects_changes_in_order() {
        let mut builder = ChangeSetBuilder::start_changes(Some(Selector::new("s-42")));
        builder
            .add_put(
                DataKind::Flag,
                "f1",
                FlagBuilder::new("f1").version(2).build(),
            )
            .add_delete(DataKind::Segment, "s1", 9);
        let change_set = builder.finish();

        assert_eq!(change_set.intent(), IntentCode::TransferChanges);
        assert_eq!(change_set.selector().map(Selector::as_str), Some("s-42"));
        assert_eq!(change_set.changes().len(), 2);
        assert_eq!(change_set.changes()[0].key(), "f1");
        assert_eq!(change_set.changes()[1].kind(), DataKind::Segment);
    }

    #[test]
    fn no_changes_is_empty_transfer_none() {
        let change_set = ChangeSet::no_changes();
        assert_eq!(change_set.intent(), IntentCode::TransferNone);
        assert!(change_set.changes().is_empty());
        assert!(change_set.selector().is_none());
    }
}
