//! Data stores: where flag and segment data lives between updates.
//!
//! [`MemoryStore`] is the always-present primary store. A
//! [`PersistentDataStore`] backend (Redis, DynamoDB, ...) can mirror it
//! through [`PersistentStoreAdapter`], with the [`Store`] coordinator tying
//! the two together and fanning out change notifications.

mod cache;
mod coordinator;
mod dependencies;
mod memory;
mod persistent;

pub use cache::TtlCache;
pub use coordinator::{FlagChange, Store};
pub use dependencies::DependencyTracker;
pub use memory::MemoryStore;
pub use persistent::{
    PersistentDataStore, PersistentStoreAdapter, PersistentStoreConfig, SerializedItem, StoreCacheTtl,
};

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{DataKind, Flag, Segment, StoreItem};

/// Read access to flag and segment data, as consumed by the evaluator.
///
/// Reads never observe tombstones; a deleted item is simply absent.
pub trait ReadStore: Send + Sync {
    fn get(&self, kind: DataKind, key: &str) -> Option<StoreItem>;

    fn all(&self, kind: DataKind) -> HashMap<String, StoreItem>;

    /// Whether the store has received a full basis of data.
    fn initialized(&self) -> bool;

    fn flag(&self, key: &str) -> Option<Arc<Flag>> {
        match self.get(DataKind::Flag, key) {
            Some(StoreItem::Flag(flag)) => Some(flag),
            _ => None,
        }
    }

    fn segment(&self, key: &str) -> Option<Arc<Segment>> {
        match self.get(DataKind::Segment, key) {
            Some(StoreItem::Segment(segment)) => Some(segment),
            _ => None,
        }
    }
}
