// SPDX-License-Identifier: AGPL-3.0-only

//! The schema half of the data model (spec.md §3 "Schema (external)").
//! A real deployment would back this with a YANG/libyang-style parser;
//! that parser, and the wire encoding of schema files, are explicit
//! Non-goals of spec.md §1. What the edit/diff engine actually consumes is
//! a small, stable trait over "does this schema node have a default,
//! is it user-ordered, what are its key leaves" — so that surface is all
//! this module defines, plus an in-memory builder good enough to drive
//! the engine from tests and from programmatic callers.

use std::{collections::BTreeMap, fmt, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Container { presence: bool },
    List { user_ordered: bool },
    Leaf,
    LeafList { user_ordered: bool },
    AnyData,
    AnyXml,
}

impl NodeKind {
    pub fn is_user_ordered(&self) -> bool {
        matches!(
            self,
            NodeKind::List { user_ordered: true } | NodeKind::LeafList { user_ordered: true }
        )
    }

    pub fn is_list_like(&self) -> bool {
        matches!(self, NodeKind::List { .. } | NodeKind::LeafList { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeKind::Leaf | NodeKind::AnyData | NodeKind::AnyXml)
    }

    pub fn is_presence_container(&self) -> bool {
        matches!(self, NodeKind::Container { presence: true })
    }

    pub fn is_non_presence_container(&self) -> bool {
        matches!(self, NodeKind::Container { presence: false })
    }
}

pub type SchemaRef = Arc<SchemaNode>;

/// A single node definition in the schema tree. `children` is keyed by the
/// node's local name so a single schema node can be located cheaply while
/// walking an edit/data tree level by level.
pub struct SchemaNode {
    pub name: Box<str>,
    pub module: Box<str>,
    pub kind: NodeKind,
    /// Key-leaf names, in declared order, for `List` nodes (invariant 1).
    pub keys: Vec<Box<str>>,
    /// The canonical default value, for `Leaf` nodes that declare one.
    pub default: Option<Box<str>>,
    pub children: BTreeMap<Box<str>, SchemaRef>,
}

impl fmt::Debug for SchemaNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaNode")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("kind", &self.kind)
            .finish()
    }
}

impl SchemaNode {
    pub fn child(&self, name: &str) -> Option<&SchemaRef> {
        self.children.get(name)
    }

    /// Schema identity used for node matching in §4.B: two schema nodes
    /// match iff they are the same definition (by module + name).
    pub fn identity_eq(&self, other: &SchemaNode) -> bool {
        self.module == other.module && self.name == other.name
    }
}

/// A minimal in-memory schema builder; not a parser (schema parsing is a
/// Non-goal), just enough structure to assemble a schema tree in Rust.
pub struct SchemaBuilder {
    node: SchemaNode,
}

impl SchemaBuilder {
    pub fn new(module: &str, name: &str, kind: NodeKind) -> Self {
        Self {
            node: SchemaNode {
                name: name.into(),
                module: module.into(),
                kind,
                keys: Vec::new(),
                default: None,
                children: BTreeMap::new(),
            },
        }
    }

    pub fn keys(mut self, keys: &[&str]) -> Self {
        self.node.keys = keys.iter().map(|k| (*k).into()).collect();
        self
    }

    pub fn default(mut self, default: &str) -> Self {
        self.node.default = Some(default.into());
        self
    }

    pub fn child(mut self, child: SchemaRef) -> Self {
        self.node.children.insert(child.name.clone(), child);
        self
    }

    pub fn build(self) -> SchemaRef {
        Arc::new(self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_composes_children() {
        let name = SchemaBuilder::new("ietf-interfaces", "name", NodeKind::Leaf).build();
        let enabled = SchemaBuilder::new("ietf-interfaces", "enabled", NodeKind::Leaf)
            .default("true")
            .build();
        let iface = SchemaBuilder::new("ietf-interfaces", "interface", NodeKind::List { user_ordered: false })
            .keys(&["name"])
            .child(name)
            .child(enabled)
            .build();
        assert_eq!(iface.keys, vec![Box::<str>::from("name")]);
        assert!(iface.child("enabled").unwrap().default.as_deref() == Some("true"));
    }
}
