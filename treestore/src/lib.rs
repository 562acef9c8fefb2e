// SPDX-License-Identifier: AGPL-3.0-only

//! `treestore`: a shared, in-process configuration/state/event datastore
//! for structured, schema-bound data trees (spec.md §1 "Overview").
//!
//! A [`Repository`](api::Repository) owns the shared main region, the
//! per-module/datastore lock manager, the module metadata store and the
//! subscription registry, and exposes the connection → session →
//! data/module-admin/subscribe operation set spec.md §6 names. The tree
//! itself ([`tree::Tree`]) is an arena of [`tree::Node`]s addressed by
//! [`tree::NodeId`], shaped by a [`tree::SchemaNode`] tree a caller
//! supplies through [`api::SchemaResolver`] (no YANG parser is built in,
//! spec.md §1 Non-goals).
//!
//! Module layout mirrors spec.md §4's lettered components:
//!
//! - [`tree`] — component A, the tree/schema/metadata primitives.
//! - [`edit`] — component B, the edit algebra (`apply_edit`).
//! - [`diff`] — component C, the diff algebra (merge/apply/reverse/update).
//! - [`shm`] — component D, the shared-memory region layout.
//! - [`lock`] — component E, advisory file locks and in-process rwlocks.
//! - [`subscription`] — component F, the subscription registry and the
//!   subscriber capability set ([`subscription::handler`]).
//! - [`event`] — component G, the four-phase event delivery state machine.
//! - [`session`] — component H, connection/session lifecycle.
//! - [`module`] — component I, module metadata and scheduled admin ops.
//! - [`store`] — (ADDED) on-disk datastore and notification replay files.
//! - [`api`] — the public veneer tying all of the above together.

pub mod api;
pub mod config;
pub mod diff;
pub mod edit;
pub mod error;
pub mod event;
pub mod lock;
pub mod module;
pub mod session;
pub mod shm;
pub mod store;
pub mod subscription;
pub mod sync;
pub mod tree;

pub use api::{PathStep, Repository, SchemaResolver};
pub use config::Config;
pub use error::{Error, ErrorData, StoreResult};
