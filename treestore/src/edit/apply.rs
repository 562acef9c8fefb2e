// SPDX-License-Identifier: AGPL-3.0-only

use crate::error::{Error, StoreResult};
use crate::tree::{InsertKind, Meta, MetaKey, NodeId, NodeKind, Operation, Origin, SchemaRef, Tree};

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub changed: bool,
}

/// Applies `edit`'s top-level siblings onto `ds`'s top level, in place,
/// producing a canonical diff in `diff`. `ds` should already be a working
/// copy (spec.md §4.B "Failure semantics": the algebra mutates a working
/// copy, the caller swaps it in only on full success).
pub fn apply_edit(
    ds: &mut Tree,
    edit: &Tree,
    edit_roots: &[NodeId],
    diff: &mut Tree,
    default_origin: Origin,
) -> StoreResult<ApplyOutcome> {
    let mut changed = false;
    let ds_roots = ds.roots.clone();
    apply_level(
        ds,
        None,
        &ds_roots,
        edit,
        edit_roots,
        Operation::Merge,
        diff,
        None,
        default_origin,
        &mut changed,
    )?;
    eliminate_redundancy(diff, &diff.roots.clone());
    Ok(ApplyOutcome { changed })
}

fn effective_op(edit: &Tree, node: NodeId, parent_op: Operation) -> Operation {
    edit.get_meta(node, MetaKey::Operation)
        .and_then(|m| match m {
            Meta::Operation(op) => Some(*op),
            _ => None,
        })
        .unwrap_or(parent_op)
}

fn effective_origin(edit: &Tree, node: NodeId, parent_origin: Origin) -> Origin {
    edit.get_meta(node, MetaKey::Origin)
        .and_then(|m| match m {
            Meta::Origin(o) => Some(*o),
            _ => None,
        })
        .unwrap_or(parent_origin)
}

/// Locates, among `ds`'s current children of `ds_parent`, the node that
/// `edit_node` (from `edit`) matches, per the per-kind matching rules of
/// spec.md §4.B.
fn find_match(
    ds: &Tree,
    ds_parent: Option<NodeId>,
    edit: &Tree,
    edit_node: NodeId,
) -> StoreResult<Option<NodeId>> {
    let ds_children = children_of(ds, ds_parent);
    let en = edit.get(edit_node);
    match en.schema.kind {
        NodeKind::Container { .. } | NodeKind::Leaf | NodeKind::AnyData | NodeKind::AnyXml => Ok(ds_children
            .iter()
            .copied()
            .find(|&c| ds.get(c).schema.identity_eq(&en.schema))),
        NodeKind::List { .. } => {
            let key_values = list_key_values(edit, edit_node)?;
            Ok(ds_children.iter().copied().find(|&c| {
                ds.get(c).schema.identity_eq(&en.schema)
                    && list_key_values(ds, c).map(|k| k == key_values).unwrap_or(false)
            }))
        }
        NodeKind::LeafList { .. } => {
            let value = en.value();
            Ok(ds_children
                .iter()
                .copied()
                .find(|&c| ds.get(c).schema.identity_eq(&en.schema) && ds.get(c).value() == value))
        }
    }
}

fn children_of(t: &Tree, parent: Option<NodeId>) -> Vec<NodeId> {
    match parent {
        Some(p) => t.get(p).children().to_vec(),
        None => t.roots.clone(),
    }
}

/// Reads a list node's key-leaf canonical values, in schema key order.
/// Fails with `VALIDATION_FAILED` if a declared key leaf is missing
/// (spec.md §4.B matching rules: "a missing key in the edit is a
/// validation error").
fn list_key_values(t: &Tree, list_node: NodeId) -> StoreResult<Vec<Box<str>>> {
    let n = t.get(list_node);
    let mut out = Vec::with_capacity(n.schema.keys.len());
    for key_name in &n.schema.keys {
        let v = n
            .children()
            .iter()
            .find(|&&c| t.get(c).schema.name.as_ref() == key_name.as_ref())
            .and_then(|&c| t.get(c).value());
        match v {
            Some(v) => out.push(Box::from(v)),
            None => {
                return Err(Error::validation_failed(format!(
                    "list '{}' is missing required key leaf '{}'",
                    n.schema.name, key_name
                )))
            }
        }
    }
    Ok(out)
}

fn is_user_ordered(schema: &SchemaRef) -> bool {
    schema.kind.is_user_ordered()
}

/// The same-schema sibling that should immediately precede a user-ordered
/// node after applying `insert`, or `None` if it should become first.
fn desired_predecessor(
    ds: &Tree,
    ds_parent: Option<NodeId>,
    schema: &SchemaRef,
    exclude: Option<NodeId>,
    insert: InsertKind,
    anchor_predicate: Option<&str>,
) -> StoreResult<Option<NodeId>> {
    let siblings: Vec<NodeId> = children_of(ds, ds_parent)
        .into_iter()
        .filter(|&c| ds.get(c).schema.identity_eq(schema) && Some(c) != exclude)
        .collect();
    match insert {
        InsertKind::First => Ok(None),
        InsertKind::Default | InsertKind::Last => Ok(siblings.last().copied()),
        InsertKind::Before | InsertKind::After => {
            let pred = anchor_predicate.ok_or_else(|| {
                Error::validation_failed("before/after insert requires an anchor predicate")
            })?;
            let anchor = siblings
                .iter()
                .copied()
                .find(|&s| ds.predicate_of(s) == pred)
                .ok_or_else(|| Error::not_found("insert anchor not found among current siblings"))?;
            if matches!(insert, InsertKind::After) {
                Ok(Some(anchor))
            } else {
                let anchor_pos = siblings.iter().position(|&s| s == anchor).unwrap();
                Ok(if anchor_pos == 0 { None } else { Some(siblings[anchor_pos - 1]) })
            }
        }
    }
}

fn insert_meta(edit: &Tree, node: NodeId) -> (InsertKind, Option<Box<str>>) {
    let kind = match edit.get_meta(node, MetaKey::Insert) {
        Some(Meta::Insert(k)) => *k,
        _ => InsertKind::Default,
    };
    let anchor = match edit.get_meta(node, MetaKey::Key).or_else(|| edit.get_meta(node, MetaKey::Value)) {
        Some(Meta::Key(k)) => Some(k.clone()),
        Some(Meta::Value(v)) => Some(v.clone()),
        _ => None,
    };
    (kind, anchor)
}

/// Places `node` (already created, currently unattached) at the position
/// `insert` describes relative to `ds_parent`'s current children.
fn place_node(
    ds: &mut Tree,
    ds_parent: Option<NodeId>,
    node: NodeId,
    schema: &SchemaRef,
    insert: InsertKind,
    anchor_predicate: Option<&str>,
) -> StoreResult<()> {
    if is_user_ordered(schema) {
        match desired_predecessor(ds, ds_parent, schema, Some(node), insert, anchor_predicate)? {
            Some(pred) => ds.attach_after(pred, node),
            None => ds.attach_first(ds_parent, node),
        }
    } else {
        ds.attach_last(ds_parent, node);
    }
    Ok(())
}

/// Moves an already-attached `node` to the position `insert` describes,
/// returning `(moved, orig_predicate, new_predicate)`.
fn reposition_node(
    ds: &mut Tree,
    ds_parent: Option<NodeId>,
    node: NodeId,
    schema: &SchemaRef,
    insert: InsertKind,
    anchor_predicate: Option<&str>,
) -> StoreResult<(bool, String, String)> {
    let orig_pred = ds
        .prev_sibling_same_schema(node)
        .map(|p| ds.predicate_of(p))
        .unwrap_or_default();
    let desired = desired_predecessor(ds, ds_parent, schema, Some(node), insert, anchor_predicate)?;
    let current = ds.prev_sibling_same_schema(node);
    if desired == current {
        return Ok((false, orig_pred.clone(), orig_pred));
    }
    ds.detach(node);
    match desired {
        Some(pred) => ds.attach_after(pred, node),
        None => ds.attach_first(ds_parent, node),
    }
    let new_pred = ds
        .prev_sibling_same_schema(node)
        .map(|p| ds.predicate_of(p))
        .unwrap_or_default();
    Ok((true, orig_pred, new_pred))
}

/// Creates a single new, childless data-tree node mirroring `edit_node`'s
/// own schema and value. Descendants are NOT copied here: a created child
/// may itself carry an explicit `delete`/`remove` further down, so they go
/// through the ordinary operation algebra once this node is attached
/// (see the recursive `apply_level` call right after every call site).
fn clone_edit_to_ds(ds: &mut Tree, edit: &Tree, edit_node: NodeId) -> NodeId {
    let en = edit.get(edit_node);
    ds.create_node(en.schema.clone(), en.value())
        .expect("edit node schema/value invariants already validated when the edit tree was built")
}

#[allow(clippy::too_many_arguments)]
fn apply_level(
    ds: &mut Tree,
    ds_parent: Option<NodeId>,
    ds_siblings_snapshot: &[NodeId],
    edit: &Tree,
    edit_siblings: &[NodeId],
    parent_op: Operation,
    diff: &mut Tree,
    diff_parent: Option<NodeId>,
    parent_origin: Origin,
    changed: &mut bool,
) -> StoreResult<()> {
    let _ = ds_siblings_snapshot;
    let mut touched: Vec<NodeId> = Vec::with_capacity(edit_siblings.len());

    for &edit_node in edit_siblings {
        let op = effective_op(edit, edit_node, parent_op);
        let origin = effective_origin(edit, edit_node, parent_origin);
        let schema = edit.get(edit_node).schema.clone();
        let existing = find_match(ds, ds_parent, edit, edit_node)?;

        match (op, existing) {
            (Operation::Create, None) | (Operation::Merge, None) | (Operation::Replace, None) => {
                let new_node = clone_edit_to_ds(ds, edit, edit_node);
                let (insert, anchor) = insert_meta(edit, edit_node);
                place_node(ds, ds_parent, new_node, &schema, insert, anchor.as_deref())?;
                touched.push(new_node);
                *changed = true;

                // A freshly created subtree is reported as a single `create`
                // diff entry mirroring the whole subtree, not as nested diff
                // ops — so children are applied into a throwaway diff scratch
                // purely to let explicit child-level delete/remove/validation
                // take effect in `ds` before the subtree is captured below.
                let child_default_op = if op == Operation::Replace { Operation::Replace } else { Operation::Merge };
                let edit_children = edit.get(edit_node).children().to_vec();
                let mut discard_diff = Tree::new();
                apply_level(
                    ds,
                    Some(new_node),
                    &[],
                    edit,
                    &edit_children,
                    child_default_op,
                    &mut discard_diff,
                    None,
                    origin,
                    changed,
                )?;

                let mut scratch = Tree::new();
                let cloned = ds.deep_clone_into(new_node, &mut scratch, false);
                let diff_node = scratch.deep_clone_into(cloned, diff, false);
                diff.set_meta(diff_node, Meta::Operation(tag_create()));
                if is_user_ordered(&schema) {
                    let pred = ds
                        .prev_sibling_same_schema(new_node)
                        .map(|p| ds.predicate_of(p))
                        .unwrap_or_default();
                    diff.set_meta(diff_node, Meta::Key(pred.clone().into_boxed_str()));
                    diff.set_meta(diff_node, Meta::Value(pred.into_boxed_str()));
                }
                if origin != Origin::Unknown {
                    diff.set_meta(diff_node, Meta::Origin(origin));
                }
                attach_diff(diff, diff_parent, diff_node);
            }
            (Operation::Create, Some(_)) => {
                return Err(Error::exists(format!(
                    "create: node '{}' already exists",
                    ds_path_hint(edit, edit_node)
                )));
            }
            (Operation::Merge, Some(m)) | (Operation::Replace, Some(m)) => {
                touched.push(m);
                apply_matched(
                    ds, ds_parent, m, edit, edit_node, op, diff, diff_parent, origin, changed,
                )?;
            }
            (Operation::Delete, None) => {
                return Err(Error::not_found(format!(
                    "delete: node '{}' not found",
                    ds_path_hint(edit, edit_node)
                )));
            }
            (Operation::Delete, Some(m)) | (Operation::Remove, Some(m)) => {
                touched.push(m);
                let matched_schema = ds.get(m).schema.clone();
                let schema_default = match matched_schema.kind {
                    NodeKind::Leaf => matched_schema.default.clone(),
                    _ => None,
                };
                match schema_default {
                    // Invariant 6: a leaf declaring a schema default is never
                    // truly removed, only reinstated to its implicit default.
                    Some(default) => {
                        let old = ds.get(m).value().map(|s| s.to_string());
                        if old.as_deref() == Some(default.as_ref()) && ds.get(m).is_default() {
                            // already at the implicit default; delete is a no-op.
                        } else {
                            ds.get_mut(m).set_value(Some(default.clone()));
                            ds.get_mut(m).set_default(true);
                            *changed = true;
                            let diff_node = diff
                                .create_node(matched_schema, Some(default.as_ref()))
                                .expect("schema default value satisfies leaf kind");
                            diff.get_mut(diff_node).set_default(true);
                            diff.set_meta(diff_node, Meta::Operation(tag_replace()));
                            diff.set_meta(diff_node, Meta::OrigValue(old.unwrap_or_default().into_boxed_str()));
                            diff.set_meta(diff_node, Meta::OrigDefault(false));
                            if origin != Origin::Unknown {
                                diff.set_meta(diff_node, Meta::Origin(origin));
                            }
                            attach_diff(diff, diff_parent, diff_node);
                        }
                    }
                    None => {
                        unlink_and_diff_delete(ds, m, diff, diff_parent);
                        *changed = true;
                    }
                }
            }
            (Operation::Remove, None) => {
                // no-op; still validate descendants structurally.
                let edit_children = edit.get(edit_node).children().to_vec();
                for c in edit_children {
                    let _ = list_key_values(edit, c);
                }
            }
            (Operation::None, existing) => {
                if let Some(m) = existing {
                    touched.push(m);
                    let none_node = diff
                        .create_node(schema.clone(), None)
                        .expect("schema/value invariant holds for a freshly mirrored none node");
                    diff.set_meta(none_node, Meta::Operation(tag_none()));
                    let edit_children = edit.get(edit_node).children().to_vec();
                    apply_level(
                        ds,
                        Some(m),
                        &[],
                        edit,
                        &edit_children,
                        parent_op,
                        diff,
                        Some(none_node),
                        origin,
                        changed,
                    )?;
                    attach_diff(diff, diff_parent, none_node);
                } else {
                    let new_node = clone_edit_to_ds(ds, edit, edit_node);
                    let (insert, anchor) = insert_meta(edit, edit_node);
                    place_node(ds, ds_parent, new_node, &schema, insert, anchor.as_deref())?;
                    touched.push(new_node);
                    *changed = true;
                    let edit_children = edit.get(edit_node).children().to_vec();
                    let mut discard_diff = Tree::new();
                    apply_level(
                        ds, Some(new_node), &[], edit, &edit_children, parent_op, &mut discard_diff, None, origin,
                        changed,
                    )?;
                    let mut scratch = Tree::new();
                    let cloned = ds.deep_clone_into(new_node, &mut scratch, false);
                    let diff_node = scratch.deep_clone_into(cloned, diff, false);
                    diff.set_meta(diff_node, Meta::Operation(tag_create()));
                    attach_diff(diff, diff_parent, diff_node);
                }
            }
            (Operation::Ether, existing) => {
                if let Some(m) = existing {
                    touched.push(m);
                }
                // validation-only: walk children for structural checks, mutate nothing.
                let edit_children = edit.get(edit_node).children().to_vec();
                for c in edit_children {
                    let _ = list_key_values(edit, c);
                }
            }
        }
    }

    if parent_op == Operation::Replace {
        let remaining: Vec<NodeId> = children_of(ds, ds_parent)
            .into_iter()
            .filter(|c| !touched.contains(c))
            .collect();
        for victim in remaining {
            unlink_and_diff_delete(ds, victim, diff, diff_parent);
            *changed = true;
        }
    }

    if let Some(p) = ds_parent {
        instantiate_implicit_defaults(ds, diff, diff_parent, p, changed);
    }
    fix_up_default_flag(ds, ds_parent);
    Ok(())
}

/// Invariant 6's other half: a leaf becomes defaulted when it is
/// *implicitly created by the engine*. After an edit has populated `parent`,
/// create any schema-declared-default leaf child `parent` is still missing,
/// with its default value and default-flag set, and report it as a `create`
/// in the diff.
fn instantiate_implicit_defaults(
    ds: &mut Tree,
    diff: &mut Tree,
    diff_parent: Option<NodeId>,
    parent: NodeId,
    changed: &mut bool,
) {
    let schema = ds.get(parent).schema.clone();
    let missing: Vec<SchemaRef> = schema
        .children
        .values()
        .filter(|child_schema| {
            matches!(child_schema.kind, NodeKind::Leaf)
                && child_schema.default.is_some()
                && !ds
                    .get(parent)
                    .children()
                    .iter()
                    .any(|&c| ds.get(c).schema.identity_eq(child_schema))
        })
        .cloned()
        .collect();

    for child_schema in missing {
        let default_value = child_schema.default.clone().expect("filtered for Some default above");
        let new_leaf = ds
            .create_node(child_schema.clone(), Some(default_value.as_ref()))
            .expect("schema default value satisfies leaf kind");
        ds.get_mut(new_leaf).set_default(true);
        ds.attach_last(Some(parent), new_leaf);
        *changed = true;

        let diff_node = diff
            .create_node(child_schema, Some(default_value.as_ref()))
            .expect("schema default value satisfies leaf kind");
        diff.get_mut(diff_node).set_default(true);
        diff.set_meta(diff_node, Meta::Operation(tag_create()));
        attach_diff(diff, diff_parent, diff_node);
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_matched(
    ds: &mut Tree,
    ds_parent: Option<NodeId>,
    matched: NodeId,
    edit: &Tree,
    edit_node: NodeId,
    op: Operation,
    diff: &mut Tree,
    diff_parent: Option<NodeId>,
    origin: Origin,
    changed: &mut bool,
) -> StoreResult<()> {
    let schema = ds.get(matched).schema.clone();
    match schema.kind {
        NodeKind::Leaf => {
            let old = ds.get(matched).value().map(|s| s.to_string());
            let new = edit.get(edit_node).value().map(|s| s.to_string());
            if old == new {
                // diff=none, invariant 4: no redundant replace on equal values.
                return Ok(());
            }
            ds.get_mut(matched).set_value(new.map(Into::into));
            ds.get_mut(matched).set_default(false);
            *changed = true;
            let diff_node = diff
                .create_node(schema, ds.get(matched).value())
                .expect("leaf replace value presence matches schema");
            diff.set_meta(diff_node, Meta::Operation(tag_replace()));
            diff.set_meta(
                diff_node,
                Meta::OrigValue(old.unwrap_or_default().into_boxed_str()),
            );
            if origin != Origin::Unknown {
                diff.set_meta(diff_node, Meta::Origin(origin));
            }
            attach_diff(diff, diff_parent, diff_node);
            let _ = op;
        }
        NodeKind::AnyData | NodeKind::AnyXml => {
            let changed_here = !ds.subtree_canonical_eq_with(matched, edit, edit_node);
            if !changed_here {
                return Ok(());
            }
            let orig_canon = ds.canonical_string(matched);
            let old_children: Vec<NodeId> = ds.get(matched).children().to_vec();
            for c in old_children {
                ds.detach(c);
                ds.free_subtree(c);
            }
            let edit_children = edit.get(edit_node).children().to_vec();
            for c in edit_children {
                let mut scratch = Tree::new();
                let cloned = edit.deep_clone_into(c, &mut scratch, false);
                let new_child = scratch.deep_clone_into(cloned, ds, false);
                ds.attach_last(Some(matched), new_child);
            }
            ds.get_mut(matched).set_value(edit.get(edit_node).value().map(Into::into));
            *changed = true;
            let diff_node = diff
                .create_node(schema, None)
                .expect("anydata diff node carries no direct value");
            diff.set_meta(diff_node, Meta::Operation(tag_replace()));
            diff.set_meta(diff_node, Meta::OrigValue(orig_canon.into_boxed_str()));
            attach_diff(diff, diff_parent, diff_node);
        }
        NodeKind::List { .. } | NodeKind::LeafList { .. } if is_user_ordered(&schema) => {
            let (insert, anchor) = insert_meta(edit, edit_node);
            let (moved, orig_pred, new_pred) =
                reposition_node(ds, ds_parent, matched, &schema, insert, anchor.as_deref())?;
            if moved {
                *changed = true;
            }
            let mut scratch_diff = Tree::new();
            if matches!(schema.kind, NodeKind::List { .. }) {
                let edit_children = edit.get(edit_node).children().to_vec();
                let ds_children = ds.get(matched).children().to_vec();
                apply_level(
                    ds,
                    Some(matched),
                    &ds_children,
                    edit,
                    &edit_children,
                    Operation::Merge,
                    &mut scratch_diff,
                    None,
                    origin,
                    changed,
                )?;
            }
            if !moved && scratch_diff.roots.is_empty() {
                return Ok(());
            }
            let diff_node = diff
                .create_node(schema, None)
                .expect("list/leaf-list move diff node carries no direct value here");
            diff.set_meta(diff_node, Meta::Operation(tag_replace()));
            diff.set_meta(diff_node, Meta::OrigKey(orig_pred.clone().into_boxed_str()));
            diff.set_meta(diff_node, Meta::OrigValue(orig_pred.into_boxed_str()));
            diff.set_meta(diff_node, Meta::Key(new_pred.clone().into_boxed_str()));
            diff.set_meta(diff_node, Meta::Value(new_pred.into_boxed_str()));
            for &c in &scratch_diff.roots.clone() {
                let cloned = scratch_diff.deep_clone_into(c, diff, true);
                diff.attach_last(Some(diff_node), cloned);
            }
            attach_diff(diff, diff_parent, diff_node);
        }
        NodeKind::Container { .. } | NodeKind::List { .. } | NodeKind::LeafList { .. } => {
            let none_node = diff
                .create_node(schema, None)
                .expect("interior none node carries no direct value");
            diff.set_meta(none_node, Meta::Operation(tag_none()));
            let edit_children = edit.get(edit_node).children().to_vec();
            let ds_children = ds.get(matched).children().to_vec();
            apply_level(
                ds,
                Some(matched),
                &ds_children,
                edit,
                &edit_children,
                op,
                diff,
                Some(none_node),
                origin,
                changed,
            )?;
            attach_diff(diff, diff_parent, none_node);
        }
    }
    Ok(())
}

fn unlink_and_diff_delete(ds: &mut Tree, node: NodeId, diff: &mut Tree, diff_parent: Option<NodeId>) {
    ds.detach(node);
    let mut scratch = Tree::new();
    let cloned = ds.deep_clone_into(node, &mut scratch, false);
    let diff_node = scratch.deep_clone_into(cloned, diff, false);
    diff.set_meta(diff_node, Meta::Operation(tag_delete()));
    attach_diff(diff, diff_parent, diff_node);
    ds.free_subtree(node);
}

fn attach_diff(diff: &mut Tree, parent: Option<NodeId>, node: NodeId) {
    match parent {
        Some(p) => diff.attach_last(Some(p), node),
        None => diff.attach_last(None, node),
    }
}

/// Removes diff nodes that carry no information (invariant 4): interior
/// `none` nodes whose subtree has no non-`none` descendant.
fn eliminate_redundancy(diff: &mut Tree, nodes: &[NodeId]) {
    for &node in nodes {
        let children = diff.get(node).children().to_vec();
        eliminate_redundancy(diff, &children);
        let is_none = matches!(diff.get_meta(node, MetaKey::Operation), Some(Meta::Operation(op)) if *op == tag_none());
        if is_none && diff.get(node).children().is_empty() {
            diff.detach(node);
            diff.free_subtree(node);
        }
    }
}

fn fix_up_default_flag(ds: &mut Tree, parent: Option<NodeId>) {
    let Some(p) = parent else { return };
    let schema = ds.get(p).schema.clone();
    if !schema.kind.is_non_presence_container() {
        return;
    }
    let all_default = ds.get(p).children().iter().all(|&c| ds.get(c).is_default());
    ds.get_mut(p).set_default(all_default);
}

fn tag_create() -> Operation {
    Operation::Create
}
fn tag_delete() -> Operation {
    Operation::Delete
}
fn tag_replace() -> Operation {
    Operation::Replace
}
fn tag_none() -> Operation {
    Operation::None
}

fn ds_path_hint(edit: &Tree, node: NodeId) -> String {
    edit.path(node, true)
}

impl Tree {
    /// Canonicalizes an anydata/anyxml subtree in `self` rooted at `node`
    /// for use as diff `orig-value` (spec.md §4.C "leaf replace").
    pub fn canonical_string(&self, node: NodeId) -> String {
        let n = self.get(node);
        let mut s = format!("{}:{}", n.schema.module, n.schema.name);
        if let Some(v) = n.value() {
            s.push('=');
            s.push_str(v);
        }
        for &c in n.children() {
            s.push('{');
            s.push_str(&self.canonical_string(c));
            s.push('}');
        }
        s
    }

    /// Compares `self`'s subtree at `node` against `other`'s subtree at
    /// `other_node` for canonical (structural+value) equality.
    pub fn subtree_canonical_eq_with(&self, node: NodeId, other: &Tree, other_node: NodeId) -> bool {
        let (a, b) = (self.get(node), other.get(other_node));
        if !a.schema.identity_eq(&b.schema) || a.value() != b.value() {
            return false;
        }
        let (ca, cb) = (a.children(), b.children());
        ca.len() == cb.len()
            && ca
                .iter()
                .zip(cb.iter())
                .all(|(&x, &y)| self.subtree_canonical_eq_with(x, other, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{InsertKind, Origin, SchemaBuilder};

    fn iface_schema() -> SchemaRef {
        let name = SchemaBuilder::new("m", "name", NodeKind::Leaf).build();
        let kind = SchemaBuilder::new("m", "type", NodeKind::Leaf).build();
        let enabled = SchemaBuilder::new("m", "enabled", NodeKind::Leaf).default("true").build();
        SchemaBuilder::new("m", "interface", NodeKind::List { user_ordered: false })
            .keys(&["name"])
            .child(name)
            .child(kind)
            .child(enabled)
            .build()
    }

    fn interfaces_schema() -> SchemaRef {
        SchemaBuilder::new("m", "interfaces", NodeKind::Container { presence: false })
            .child(iface_schema())
            .build()
    }

    fn make_edit_interface(edit: &mut Tree, ifname: &str, type_: &str, op: Operation) -> NodeId {
        let iface_s = iface_schema();
        let n = edit.create_node(iface_s.clone(), None).unwrap();
        edit.set_meta(n, Meta::Operation(op));
        let name_child = edit.create_node(iface_s.child("name").unwrap().clone(), Some(ifname)).unwrap();
        edit.attach_last(Some(n), name_child);
        let type_child = edit.create_node(iface_s.child("type").unwrap().clone(), Some(type_)).unwrap();
        edit.attach_last(Some(n), type_child);
        n
    }

    #[test]
    fn s1_create_then_delete_interface() {
        let interfaces_s = interfaces_schema();
        let mut ds = Tree::new();
        let mut edit = Tree::new();

        let container = edit.create_node(interfaces_s.clone(), None).unwrap();
        edit.set_meta(container, Meta::Operation(Operation::Merge));
        let iface = make_edit_interface(&mut edit, "eth52", "ethernetCsmacd", Operation::Create);
        edit.attach_last(Some(container), iface);

        let mut diff = Tree::new();
        let outcome = apply_edit(&mut ds, &edit, &edit.roots.clone(), &mut diff, Origin::Unknown).unwrap();
        assert!(outcome.changed);
        assert_eq!(diff.roots.len(), 1);
        assert_eq!(ds.roots.len(), 1);
        let iface_in_ds = ds.get(ds.roots[0]).children()[0];
        assert_eq!(ds.path(iface_in_ds, true), "/m:interfaces/m:interface[name='eth52']");

        // schema-defaulted `enabled` is instantiated implicitly alongside the
        // explicit `name`/`type` children (invariant 6).
        let enabled = ds
            .get(iface_in_ds)
            .children()
            .iter()
            .copied()
            .find(|&c| ds.get(c).schema.name.as_ref() == "enabled")
            .expect("enabled leaf is implicitly created with its schema default");
        assert_eq!(ds.get(enabled).value(), Some("true"));
        assert!(ds.get(enabled).is_default());

        // now delete /interfaces
        let mut edit2 = Tree::new();
        let del = edit2.create_node(interfaces_s, None).unwrap();
        edit2.set_meta(del, Meta::Operation(Operation::Delete));
        let mut diff2 = Tree::new();
        let outcome2 = apply_edit(&mut ds, &edit2, &edit2.roots.clone(), &mut diff2, Origin::Unknown).unwrap();
        assert!(outcome2.changed);
        assert!(ds.roots.is_empty());
        assert_eq!(diff2.roots.len(), 1);
    }

    #[test]
    fn s2_replace_leaf_value() {
        let leaf_s = SchemaBuilder::new("m", "L", NodeKind::Leaf).build();
        let mut ds = Tree::new();
        let l = ds.create_node(leaf_s.clone(), Some("A")).unwrap();
        ds.attach_last(None, l);

        let mut edit = Tree::new();
        let el = edit.create_node(leaf_s, Some("B")).unwrap();
        edit.set_meta(el, Meta::Operation(Operation::Replace));
        edit.attach_last(None, el);

        let mut diff = Tree::new();
        apply_edit(&mut ds, &edit, &edit.roots.clone(), &mut diff, Origin::Unknown).unwrap();
        assert_eq!(ds.get(ds.roots[0]).value(), Some("B"));
        assert_eq!(diff.roots.len(), 1);
        let d = diff.roots[0];
        assert!(matches!(diff.get_meta(d, MetaKey::Operation), Some(Meta::Operation(op)) if *op == Operation::Replace));
        assert!(matches!(diff.get_meta(d, MetaKey::OrigValue), Some(Meta::OrigValue(v)) if v.as_ref() == "A"));
    }

    #[test]
    fn s3_user_ordered_move_after() {
        let item_s = SchemaBuilder::new("m", "item", NodeKind::LeafList { user_ordered: true }).build();
        let mut ds = Tree::new();
        for v in ["k1", "k2", "k3"] {
            let n = ds.create_node(item_s.clone(), Some(v)).unwrap();
            ds.attach_last(None, n);
        }

        let mut edit = Tree::new();
        let move_node = edit.create_node(item_s, Some("k1")).unwrap();
        edit.set_meta(move_node, Meta::Operation(Operation::Merge));
        edit.set_meta(move_node, Meta::Insert(InsertKind::After));
        edit.set_meta(move_node, Meta::Value("k2".into()));
        edit.attach_last(None, move_node);

        let mut diff = Tree::new();
        // The anchor predicate format must match `predicate_of`'s leaf-list encoding.
        edit.set_meta(move_node, Meta::Value(".='k2'".into()));
        apply_edit(&mut ds, &edit, &edit.roots.clone(), &mut diff, Origin::Unknown).unwrap();

        let values: Vec<&str> = ds.roots.iter().map(|&id| ds.get(id).value().unwrap()).collect();
        assert_eq!(values, vec!["k2", "k1", "k3"]);
        assert_eq!(diff.roots.len(), 1);
        let d = diff.roots[0];
        assert!(matches!(diff.get_meta(d, MetaKey::OrigKey), Some(Meta::OrigKey(v)) if v.is_empty()));
        assert!(matches!(diff.get_meta(d, MetaKey::Key), Some(Meta::Key(v)) if v.as_ref() == ".='k2'"));
    }

    #[test]
    fn s4_default_flag_survives_delete_of_defaulted_value() {
        let leaf_s = SchemaBuilder::new("m", "D", NodeKind::Leaf).default("10").build();
        let mut ds = Tree::new();

        let mut edit1 = Tree::new();
        let set5 = edit1.create_node(leaf_s.clone(), Some("5")).unwrap();
        edit1.set_meta(set5, Meta::Operation(Operation::Merge));
        edit1.attach_last(None, set5);
        let mut diff1 = Tree::new();
        apply_edit(&mut ds, &edit1, &edit1.roots.clone(), &mut diff1, Origin::Unknown).unwrap();
        assert_eq!(ds.get(ds.roots[0]).value(), Some("5"));
        assert!(!ds.get(ds.roots[0]).is_default());

        let mut edit2 = Tree::new();
        let del = edit2.create_node(leaf_s, None).unwrap();
        edit2.set_meta(del, Meta::Operation(Operation::Delete));
        edit2.attach_last(None, del);
        let mut diff2 = Tree::new();
        let outcome2 = apply_edit(&mut ds, &edit2, &edit2.roots.clone(), &mut diff2, Origin::Unknown).unwrap();
        assert!(outcome2.changed);
        // invariant 6 / S4: deleting a leaf with a schema default reinstates
        // the default rather than removing the node.
        assert_eq!(ds.roots.len(), 1);
        assert_eq!(ds.get(ds.roots[0]).value(), Some("10"));
        assert!(ds.get(ds.roots[0]).is_default());
    }
}
