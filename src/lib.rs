//! `switchgear_core` is a common library to build feature-flag SDKs for
//! different languages. If you're deploying flags, you probably want one of
//! the SDKs built on top of it.
//!
//! # Overview
//!
//! `switchgear_core` is organized as a set of building blocks that SDKs
//! assemble. Different languages have different constraints; some use every
//! block and others reimplement pieces in the host language.
//!
//! [`Store`](store::Store) is the heart of an SDK. It is a thread-safe,
//! versioned view of the flag and segment data the evaluator reads, fed by
//! [`ChangeSet`](changeset::ChangeSet)s—either a full transfer replacing
//! everything or a delta applied item by item, with per-item version checks
//! so replays and reorderings cannot roll data back. A store can optionally
//! mirror itself to a database through the
//! [`PersistentDataStore`](store::PersistentDataStore) trait, with read
//! caching and outage recovery handled by the store.
//!
//! [`DataSystem`](datasource::DataSystem) keeps a store fresh. It runs
//! [`Initializer`](datasource::Initializer)s in order until one yields a
//! basis, then hands the store to a
//! [`Synchronizer`](datasource::Synchronizer) for ongoing updates, and
//! reports what it is doing through
//! [`DataSourceStatusProvider`](status::DataSourceStatusProvider).
//!
//! [`eval`] module evaluates flags against a [`Context`](context::Context):
//! targets, rules, prerequisites, segments (including big segments backed by
//! a [`BigSegmentStore`](big_segments::BigSegmentStore)), and percentage
//! rollouts. Evaluation returns results along with [`events`]—it does not
//! log events itself; the caller owns the event pipeline.
//!
//! [`Evaluator`](eval::Evaluator) ties a store (and optionally a big
//! segment wrapper) to the evaluation functions. It also produces the
//! [`AllFlagsState`](flags_state::AllFlagsState) snapshot used to bootstrap
//! client-side SDKs, and backs [`Migrator`](migration::Migrator) for
//! stage-driven technology migrations.
//!
//! Most SDKs are built from a `Store`, a `DataSystem`, and an `Evaluator`.
//!
//! # Versioning
//!
//! This library follows semver. However, it is considered an internal
//! library, so expect frequent breaking changes and major version bumps.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod big_segments;
pub mod changeset;
pub mod context;
pub mod datasource;
pub mod eval;
pub mod events;
pub mod flags_state;
pub mod migration;
pub mod model;
pub mod status;
pub mod store;

mod broadcast;
mod error;

#[cfg(test)]
mod test_util;

pub use broadcast::ListenerId;
pub use context::{AttributeValue, Context};
pub use error::{Error, Result, StoreError};
pub use eval::{EvaluationDetail, Reason};
pub use model::FlagValue;
