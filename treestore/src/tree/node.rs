// SPDX-License-Identifier: AGPL-3.0-only

//! The tree primitives adapter (spec.md §4.A): a narrow, typed facade over
//! an arena-backed tree. Trees are represented as an index arena rather
//! than `Rc`/`RefCell` nodes: design note §9 asks for "back-pointers from
//! child to parent as borrows, never owners", and a `NodeId` into a
//! per-snapshot arena is exactly that — it never keeps the parent alive,
//! and the whole arena (one data tree snapshot) is dropped as a unit.

use std::fmt;

use super::{
    meta::{Meta, MetaKey, MetaSet},
    schema::{NodeKind, SchemaRef},
};
use crate::error::{Error, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub schema: SchemaRef,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    /// Canonical value string for leaf/leaf-list/anydata/anyxml terminals.
    value: Option<Box<str>>,
    default_flag: bool,
    meta: MetaSet,
}

impl Node {
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn set_value(&mut self, value: Option<Box<str>>) {
        self.value = value;
    }

    pub fn is_default(&self) -> bool {
        self.default_flag
    }

    pub fn set_default(&mut self, default_flag: bool) {
        self.default_flag = default_flag;
    }

    pub fn meta(&self) -> &MetaSet {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut MetaSet {
        &mut self.meta
    }
}

/// One data/edit/diff tree instance: a single-owner arena holding every
/// node reachable from `roots` (spec.md §9 "Ownership of data trees").
#[derive(Debug, Clone, Default)]
pub struct Tree {
    nodes: Vec<Option<Node>>,
    pub roots: Vec<NodeId>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: NodeId) -> &Node {
        self.nodes[id.0 as usize]
            .as_ref()
            .expect("dangling NodeId: node was freed but id escaped the arena")
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0 as usize]
            .as_mut()
            .expect("dangling NodeId: node was freed but id escaped the arena")
    }

    /// Constructs a detached node from a schema and an optional canonical
    /// value. Fails with `INVALID_ARG` if value presence disagrees with
    /// the schema's node kind (spec.md §4.A).
    pub fn create_node(&mut self, schema: SchemaRef, value: Option<&str>) -> StoreResult<NodeId> {
        let wants_value = schema.kind.is_terminal() || matches!(schema.kind, NodeKind::LeafList { .. });
        if wants_value != value.is_some() {
            return Err(Error::invalid_arg(format!(
                "schema node '{}' {} a value but {} one was supplied",
                schema.name,
                if wants_value { "requires" } else { "does not accept" },
                if value.is_some() { "" } else { "none" }
            )));
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(Node {
            schema,
            parent: None,
            children: Vec::new(),
            value: value.map(Into::into),
            default_flag: false,
            meta: MetaSet::new(),
        }));
        Ok(id)
    }

    fn sibling_slot(&mut self, parent: Option<NodeId>) -> &mut Vec<NodeId> {
        match parent {
            Some(p) => &mut self.get_mut(p).children,
            None => &mut self.roots,
        }
    }

    pub fn attach_first(&mut self, parent: Option<NodeId>, child: NodeId) {
        self.get_mut(child).parent = parent;
        self.sibling_slot(parent).insert(0, child);
    }

    pub fn attach_last(&mut self, parent: Option<NodeId>, child: NodeId) {
        self.get_mut(child).parent = parent;
        self.sibling_slot(parent).push(child);
    }

    pub fn attach_before(&mut self, anchor: NodeId, child: NodeId) {
        let parent = self.get(anchor).parent;
        self.get_mut(child).parent = parent;
        let siblings = self.sibling_slot(parent);
        let pos = siblings.iter().position(|&s| s == anchor).expect("anchor not among its own parent's children");
        siblings.insert(pos, child);
    }

    pub fn attach_after(&mut self, anchor: NodeId, child: NodeId) {
        let parent = self.get(anchor).parent;
        self.get_mut(child).parent = parent;
        let siblings = self.sibling_slot(parent);
        let pos = siblings.iter().position(|&s| s == anchor).expect("anchor not among its own parent's children");
        siblings.insert(pos + 1, child);
    }

    /// Unlinks `node` from its parent (or the root list) without freeing
    /// it; the caller decides whether to re-attach it elsewhere or free
    /// the subtree with `free_subtree`.
    pub fn detach(&mut self, node: NodeId) {
        let parent = self.get(node).parent;
        self.sibling_slot(parent).retain(|&s| s != node);
        self.get_mut(node).parent = None;
    }

    /// Recursively frees a detached subtree's arena slots.
    pub fn free_subtree(&mut self, node: NodeId) {
        let children: Vec<NodeId> = self.get(node).children().to_vec();
        for c in children {
            self.free_subtree(c);
        }
        self.nodes[node.0 as usize] = None;
    }

    /// Deep-clones the subtree rooted at `node` (from `self`) into `dest`,
    /// optionally carrying metadata, returning the new detached root id.
    pub fn deep_clone_into(&self, node: NodeId, dest: &mut Tree, with_meta: bool) -> NodeId {
        let src = self.get(node);
        let new_id = dest
            .create_node(src.schema.clone(), src.value())
            .expect("cloning a node preserves its own schema/value invariants");
        {
            let new_node = dest.get_mut(new_id);
            new_node.set_default(src.is_default());
            if with_meta {
                *new_node.meta_mut() = src.meta().clone();
            }
        }
        for &child in src.children() {
            let new_child = self.deep_clone_into(child, dest, with_meta);
            dest.attach_last(Some(new_id), new_child);
        }
        new_id
    }

    pub fn set_meta(&mut self, node: NodeId, meta: Meta) {
        self.get_mut(node).meta_mut().set(meta);
    }

    pub fn get_meta(&self, node: NodeId, key: MetaKey) -> Option<&Meta> {
        self.get(node).meta().get(key)
    }

    pub fn delete_meta(&mut self, node: NodeId, key: MetaKey) -> Option<Meta> {
        self.get_mut(node).meta_mut().remove(key)
    }

    /// Canonical value equality (spec.md §4.B matching rules): leaves and
    /// leaf-lists compare their canonical value string; anydata/anyxml
    /// compare by recursively canonicalizing the opaque subtree; every
    /// other kind is always equal (identity already established by the
    /// caller via schema + key match).
    pub fn value_equal(&self, a: NodeId, b: NodeId) -> bool {
        let (na, nb) = (self.get(a), self.get(b));
        match na.schema.kind {
            NodeKind::Leaf | NodeKind::LeafList { .. } => na.value() == nb.value(),
            NodeKind::AnyData | NodeKind::AnyXml => self.subtree_canonical_eq(a, b),
            NodeKind::Container { .. } | NodeKind::List { .. } => true,
        }
    }

    fn subtree_canonical_eq(&self, a: NodeId, b: NodeId) -> bool {
        let (na, nb) = (self.get(a), self.get(b));
        if !na.schema.identity_eq(&nb.schema) || na.value() != nb.value() {
            return false;
        }
        let (ca, cb) = (na.children(), nb.children());
        ca.len() == cb.len()
            && ca
                .iter()
                .zip(cb.iter())
                .all(|(&x, &y)| self.subtree_canonical_eq(x, y))
    }

    /// The previous sibling of the same schema node, used for user-ordered
    /// move bookkeeping (spec.md §4.B "Insert semantics").
    pub fn prev_sibling_same_schema(&self, node: NodeId) -> Option<NodeId> {
        let siblings = match self.get(node).parent {
            Some(p) => self.get(p).children(),
            None => &self.roots,
        };
        let pos = siblings.iter().position(|&s| s == node)?;
        siblings[..pos]
            .iter()
            .rev()
            .find(|&&s| self.get(s).schema.identity_eq(&self.get(node).schema))
            .copied()
    }

    pub fn next_sibling_same_schema(&self, node: NodeId) -> Option<NodeId> {
        let siblings = match self.get(node).parent {
            Some(p) => self.get(p).children(),
            None => &self.roots,
        };
        let pos = siblings.iter().position(|&s| s == node)?;
        siblings[pos + 1..]
            .iter()
            .find(|&&s| self.get(s).schema.identity_eq(&self.get(node).schema))
            .copied()
    }

    /// The canonical predicate string used in `key`/`value` move metadata:
    /// a list's key-tuple predicate, or a leaf-list's value predicate.
    /// Empty string means "this node is first of its schema" (spec.md §3).
    pub fn predicate_of(&self, node: NodeId) -> String {
        let n = self.get(node);
        match n.schema.kind {
            NodeKind::List { .. } => {
                let mut out = String::new();
                for key_name in &n.schema.keys {
                    let key_child = n
                        .children()
                        .iter()
                        .find(|&&c| self.get(c).schema.name.as_ref() == key_name.as_ref())
                        .expect("list node missing a declared key child (invariant 1)");
                    out.push_str(&format!(
                        "[{}='{}']",
                        key_name,
                        self.get(*key_child).value().unwrap_or("")
                    ));
                }
                out
            }
            NodeKind::LeafList { .. } => format!(".='{}'", n.value().unwrap_or("")),
            _ => String::new(),
        }
    }

    /// Absolute slash-separated path, optionally with the last component's
    /// list-key/leaf-list-value predicate appended (spec.md §4.A).
    pub fn path(&self, node: NodeId, with_last_predicate: bool) -> String {
        let mut components = Vec::new();
        let mut cur = Some(node);
        while let Some(id) = cur {
            let n = self.get(id);
            let mut comp = format!("{}:{}", n.schema.module, n.schema.name);
            if (with_last_predicate || id != node) && n.schema.kind.is_list_like() {
                comp.push_str(&self.predicate_of(id));
            }
            components.push(comp);
            cur = n.parent();
        }
        components.reverse();
        format!("/{}", components.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::schema::SchemaBuilder;

    fn leaf(name: &str) -> SchemaRef {
        SchemaBuilder::new("m", name, NodeKind::Leaf).build()
    }

    #[test]
    fn attach_and_detach_round_trip() {
        let mut t = Tree::new();
        let a = t.create_node(leaf("a"), Some("1")).unwrap();
        let b = t.create_node(leaf("b"), Some("2")).unwrap();
        t.attach_last(None, a);
        t.attach_after(a, b);
        assert_eq!(t.roots, vec![a, b]);
        t.detach(a);
        assert_eq!(t.roots, vec![b]);
    }

    #[test]
    fn value_presence_must_match_schema() {
        let mut t = Tree::new();
        assert!(t.create_node(leaf("a"), None).is_err());
        let container = SchemaBuilder::new("m", "c", NodeKind::Container { presence: false }).build();
        assert!(t.create_node(container, Some("x")).is_err());
    }

    #[test]
    fn prev_sibling_same_schema_skips_other_schemas() {
        let mut t = Tree::new();
        let a1 = t.create_node(leaf("a"), Some("1")).unwrap();
        let x = t.create_node(leaf("x"), Some("z")).unwrap();
        let a2 = t.create_node(leaf("a"), Some("2")).unwrap();
        t.attach_last(None, a1);
        t.attach_last(None, x);
        t.attach_last(None, a2);
        assert_eq!(t.prev_sibling_same_schema(a2), Some(a1));
        assert_eq!(t.prev_sibling_same_schema(a1), None);
    }

    #[test]
    fn deep_clone_preserves_structure() {
        let mut t = Tree::new();
        let list_schema = SchemaBuilder::new("m", "l", NodeKind::List { user_ordered: false })
            .keys(&["k"])
            .build();
        let key_schema = leaf("k");
        let l = t.create_node(list_schema, None).unwrap();
        let k = t.create_node(key_schema, Some("v")).unwrap();
        t.attach_last(None, l);
        t.attach_last(Some(l), k);

        let mut dest = Tree::new();
        let cloned = t.deep_clone_into(l, &mut dest, true);
        assert_eq!(dest.get(cloned).children().len(), 1);
        assert_eq!(dest.path(cloned, true), "/m:l[k='v']");
    }
}
