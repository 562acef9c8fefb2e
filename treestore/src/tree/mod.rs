// SPDX-License-Identifier: AGPL-3.0-only

//! Component A: the tree primitives adapter, plus the schema and metadata
//! types the rest of the engine builds on (spec.md §3, §4.A).

pub mod codec;
pub mod meta;
pub mod node;
pub mod schema;

pub use meta::{DiffOp, InsertKind, Meta, MetaKey, MetaSet, Operation, Origin};
pub use node::{Node, NodeId, Tree};
pub use schema::{NodeKind, SchemaBuilder, SchemaNode, SchemaRef};
