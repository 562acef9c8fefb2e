// SPDX-License-Identifier: AGPL-3.0-only

//! Component C: the diff algebra (spec.md §4.C). A canonical diff, once
//! produced by [`crate::edit::apply_edit`], is itself a small algebra:
//! two diffs can be merged, a diff can be applied forward or reversed
//! against a data tree, and a diff can be revalidated against data that
//! has moved on since it was captured.

use crate::error::{Error, StoreResult};
use crate::tree::{Meta, MetaKey, NodeId, NodeKind, Operation, Tree};

fn op_of(t: &Tree, node: NodeId) -> Operation {
    match t.get_meta(node, MetaKey::Operation) {
        Some(Meta::Operation(op)) => *op,
        _ => Operation::None,
    }
}

fn set_op(t: &mut Tree, node: NodeId, op: Operation) {
    t.set_meta(node, Meta::Operation(op));
}

fn str_meta(t: &Tree, node: NodeId, key: MetaKey) -> Option<Box<str>> {
    match t.get_meta(node, key) {
        Some(Meta::Key(v)) | Some(Meta::Value(v)) | Some(Meta::OrigKey(v)) | Some(Meta::OrigValue(v)) => {
            Some(v.clone())
        }
        _ => None,
    }
}

fn children_of(t: &Tree, parent: Option<NodeId>) -> Vec<NodeId> {
    match parent {
        Some(p) => t.get(p).children().to_vec(),
        None => t.roots.clone(),
    }
}

/// Finds, among `haystack`'s children of `parent`, the node matching
/// `needle` (from `needle_tree`) by the §4.B matching rules: schema
/// identity, plus key-tuple (list) or value (leaf-list) equality.
fn find_match(
    haystack: &Tree,
    parent: Option<NodeId>,
    needle_tree: &Tree,
    needle: NodeId,
) -> Option<NodeId> {
    let nn = needle_tree.get(needle);
    children_of(haystack, parent).into_iter().find(|&c| {
        let cn = haystack.get(c);
        if !cn.schema.identity_eq(&nn.schema) {
            return false;
        }
        match nn.schema.kind {
            NodeKind::List { .. } => {
                nn.schema.keys.iter().all(|k| {
                    let a = cn
                        .children()
                        .iter()
                        .find(|&&x| haystack.get(x).schema.name.as_ref() == k.as_ref())
                        .and_then(|&x| haystack.get(x).value());
                    let b = nn
                        .children()
                        .iter()
                        .find(|&&x| needle_tree.get(x).schema.name.as_ref() == k.as_ref())
                        .and_then(|&x| needle_tree.get(x).value());
                    a == b
                })
            }
            NodeKind::LeafList { .. } => cn.value() == nn.value(),
            NodeKind::Leaf | NodeKind::AnyData | NodeKind::AnyXml | NodeKind::Container { .. } => true,
        }
    })
}

fn clone_subtree(src: &Tree, node: NodeId, dest: &mut Tree) -> NodeId {
    src.deep_clone_into(node, dest, true)
}

/// Merges `incoming` on top of `base` in place (`base ⊕ incoming`), per
/// the cur/new operation table of spec.md §4.C.
pub fn merge_diffs(base: &mut Tree, incoming: &Tree) -> StoreResult<()> {
    let roots = incoming.roots.clone();
    merge_level(base, None, incoming, &roots)
}

fn merge_level(base: &mut Tree, base_parent: Option<NodeId>, incoming: &Tree, inc_siblings: &[NodeId]) -> StoreResult<()> {
    for &inc_node in inc_siblings {
        let new_op = op_of(incoming, inc_node);
        match find_match(base, base_parent, incoming, inc_node) {
            None => {
                let cloned = clone_subtree(incoming, inc_node, base);
                match base_parent {
                    Some(p) => base.attach_last(Some(p), cloned),
                    None => base.attach_last(None, cloned),
                }
            }
            Some(cur_node) => {
                let cur_op = op_of(base, cur_node);
                match (cur_op, new_op) {
                    (_, Operation::None) => {}
                    (Operation::None, _) => {
                        copy_diff_payload(base, cur_node, incoming, inc_node);
                        set_op(base, cur_node, new_op);
                    }
                    (Operation::Create, Operation::Create) => {
                        if matches!(base.get(cur_node).schema.kind, NodeKind::Leaf) {
                            // value bump: the node is still only ever created once in
                            // the resulting datastore, so the later create simply
                            // supplies the value it ends up holding.
                            if let Some(v) = incoming.get(inc_node).value() {
                                base.get_mut(cur_node).set_value(Some(v.into()));
                            }
                        } else {
                            return Err(Error::internal("merge: duplicate create for the same node"));
                        }
                    }
                    (Operation::Create, Operation::Replace) => {
                        if let Some(v) = incoming.get(inc_node).value() {
                            base.get_mut(cur_node).set_value(Some(v.into()));
                        }
                        if let Some(v) = str_meta(incoming, inc_node, MetaKey::Key) {
                            base.set_meta(cur_node, Meta::Key(v));
                        }
                        if let Some(v) = str_meta(incoming, inc_node, MetaKey::Value) {
                            base.set_meta(cur_node, Meta::Value(v));
                        }
                    }
                    (Operation::Create, Operation::Delete) => {
                        let leaf_mismatch = matches!(base.get(cur_node).schema.kind, NodeKind::Leaf)
                            && base.get(cur_node).value() != incoming.get(inc_node).value();
                        if leaf_mismatch {
                            // the value this node ends up holding (per the delete diff's
                            // captured pre-image) differs from what the create claimed,
                            // so the net transition is a replace, not a no-op.
                            let orig = base.get(cur_node).value().map(Box::<str>::from).unwrap_or_default();
                            let new_value = incoming.get(inc_node).value().map(Into::into);
                            base.get_mut(cur_node).set_value(new_value);
                            set_op(base, cur_node, Operation::Replace);
                            base.set_meta(cur_node, Meta::OrigValue(orig));
                        } else {
                            set_op(base, cur_node, Operation::None);
                            base.delete_meta(cur_node, MetaKey::OrigValue);
                        }
                    }
                    (Operation::Replace, Operation::Replace) => {
                        if let Some(v) = incoming.get(inc_node).value() {
                            base.get_mut(cur_node).set_value(Some(v.into()));
                        }
                        if let Some(v) = str_meta(incoming, inc_node, MetaKey::Key) {
                            base.set_meta(cur_node, Meta::Key(v));
                        }
                        if let Some(v) = str_meta(incoming, inc_node, MetaKey::Value) {
                            base.set_meta(cur_node, Meta::Value(v));
                        }
                        // orig-key/orig-value are kept as originally captured on `base`.
                    }
                    (Operation::Replace, Operation::Delete) => {
                        set_op(base, cur_node, Operation::Delete);
                        base.delete_meta(cur_node, MetaKey::OrigValue);
                    }
                    (Operation::Delete, _) => {
                        return Err(Error::internal("merge: new operation recorded against a deleted node"));
                    }
                    (_, Operation::Create) => {
                        return Err(Error::internal("merge: create against an already-present diff node"));
                    }
                    _ => {
                        // Merge/Remove/Ether never appear as a captured diff
                        // operation (spec.md §3's closed diff-operation set
                        // is none/create/replace/delete); any other pairing
                        // is outside the algebra's domain.
                        return Err(Error::internal("merge: operation not valid in the diff algebra"));
                    }
                }
                let inc_children = incoming.get(inc_node).children().to_vec();
                merge_level(base, Some(cur_node), incoming, &inc_children)?;
            }
        }
    }
    Ok(())
}

fn copy_diff_payload(base: &mut Tree, base_node: NodeId, incoming: &Tree, inc_node: NodeId) {
    for key in [
        MetaKey::Key,
        MetaKey::Value,
        MetaKey::OrigKey,
        MetaKey::OrigValue,
        MetaKey::OrigDefault,
        MetaKey::Origin,
    ] {
        if let Some(m) = incoming.get_meta(inc_node, key).cloned() {
            base.set_meta(base_node, m);
        }
    }
    if let Some(v) = incoming.get(inc_node).value() {
        base.get_mut(base_node).set_value(Some(v.into()));
    }
}

/// Applies `diff` forward onto `ds` in place (spec.md §4.C "Apply a diff
/// forward"). `replace` that finds no match is `INTERNAL` — the diff was
/// captured against a data tree this one no longer resembles.
pub fn apply_diff_forward(ds: &mut Tree, diff: &Tree) -> StoreResult<()> {
    apply_forward_level(ds, None, diff, &diff.roots.clone())
}

fn apply_forward_level(ds: &mut Tree, ds_parent: Option<NodeId>, diff: &Tree, diff_siblings: &[NodeId]) -> StoreResult<()> {
    for &d in diff_siblings {
        let op = op_of(diff, d);
        let schema = diff.get(d).schema.clone();
        match op {
            Operation::Create => {
                let cloned = clone_subtree(diff, d, ds);
                strip_diff_only_meta(ds, cloned);
                match ds_parent {
                    Some(p) => ds.attach_last(Some(p), cloned),
                    None => ds.attach_last(None, cloned),
                }
            }
            Operation::Delete => {
                let target = find_match(ds, ds_parent, diff, d)
                    .ok_or_else(|| Error::internal("apply diff forward: delete target not found"))?;
                ds.detach(target);
                ds.free_subtree(target);
            }
            Operation::Replace => {
                let target = find_match(ds, ds_parent, diff, d)
                    .ok_or_else(|| Error::internal("apply diff forward: replace target not found"))?;
                match schema.kind {
                    NodeKind::Leaf | NodeKind::AnyData | NodeKind::AnyXml => {
                        ds.get_mut(target).set_value(diff.get(d).value().map(Into::into));
                    }
                    NodeKind::List { .. } | NodeKind::LeafList { .. } => {
                        let new_pred = str_meta(diff, d, MetaKey::Key).unwrap_or_default();
                        reposition_by_predicate(ds, ds_parent, target, &schema, &new_pred)?;
                        let diff_children = diff.get(d).children().to_vec();
                        apply_forward_level(ds, Some(target), diff, &diff_children)?;
                    }
                    NodeKind::Container { .. } => {
                        let diff_children = diff.get(d).children().to_vec();
                        apply_forward_level(ds, Some(target), diff, &diff_children)?;
                    }
                }
            }
            Operation::None => {
                let target = find_match(ds, ds_parent, diff, d)
                    .ok_or_else(|| Error::internal("apply diff forward: none-node target not found"))?;
                let diff_children = diff.get(d).children().to_vec();
                apply_forward_level(ds, Some(target), diff, &diff_children)?;
            }
            Operation::Merge | Operation::Remove | Operation::Ether => {
                return Err(Error::internal("apply diff forward: diff carries a non-diff operation"));
            }
        }
    }
    Ok(())
}

fn strip_diff_only_meta(t: &mut Tree, node: NodeId) {
    for key in [MetaKey::Operation, MetaKey::Key, MetaKey::Value, MetaKey::OrigKey, MetaKey::OrigValue, MetaKey::OrigDefault] {
        t.delete_meta(node, key);
    }
    let children = t.get(node).children().to_vec();
    for c in children {
        strip_diff_only_meta(t, c);
    }
}

fn reposition_by_predicate(ds: &mut Tree, ds_parent: Option<NodeId>, node: NodeId, schema: &crate::tree::SchemaRef, new_pred: &str) -> StoreResult<()> {
    let siblings: Vec<NodeId> = children_of(ds, ds_parent)
        .into_iter()
        .filter(|&c| ds.get(c).schema.identity_eq(schema) && c != node)
        .collect();
    ds.detach(node);
    if new_pred.is_empty() {
        ds.attach_first(ds_parent, node);
        return Ok(());
    }
    let anchor = siblings
        .into_iter()
        .find(|&s| ds.predicate_of(s) == new_pred)
        .ok_or_else(|| Error::internal("apply diff forward: move predecessor not found"))?;
    ds.attach_after(anchor, node);
    Ok(())
}

/// Reverses `diff` into a new diff that undoes it (spec.md §4.C "Reverse a
/// diff"): `create` ↔ `delete`; leaf `replace` swaps value ↔ `orig-value`
/// and default ↔ `orig-default`; user-ordered `replace` swaps `key/value`
/// ↔ `orig-key/orig-value`.
pub fn reverse_diff(diff: &Tree) -> Tree {
    let mut out = Tree::new();
    let roots: Vec<NodeId> = diff.roots.iter().map(|&r| reverse_node(diff, r, &mut out)).collect();
    out.roots = roots;
    out
}

fn reverse_node(diff: &Tree, node: NodeId, out: &mut Tree) -> NodeId {
    let n = diff.get(node);
    let schema = n.schema.clone();
    let op = op_of(diff, node);
    match op {
        Operation::Create => {
            let new_id = out.create_node(schema, n.value()).expect("reversed delete node mirrors its create counterpart");
            out.set_meta(new_id, Meta::Operation(Operation::Delete));
            let children: Vec<NodeId> = n.children().iter().map(|&c| reverse_node(diff, c, out)).collect();
            for c in children {
                out.attach_last(Some(new_id), c);
            }
            new_id
        }
        Operation::Delete => {
            let new_id = out.create_node(schema, n.value()).expect("reversed create node mirrors its delete counterpart");
            out.set_meta(new_id, Meta::Operation(Operation::Create));
            let children: Vec<NodeId> = n.children().iter().map(|&c| reverse_node(diff, c, out)).collect();
            for c in children {
                out.attach_last(Some(new_id), c);
            }
            new_id
        }
        Operation::Replace => {
            let new_value = str_meta(diff, node, MetaKey::OrigValue);
            let new_id = out
                .create_node(schema.clone(), new_value.as_deref().or(n.value()))
                .expect("reversed replace node mirrors schema value presence");
            out.set_meta(new_id, Meta::Operation(Operation::Replace));
            if let Some(orig) = n.value() {
                out.set_meta(new_id, Meta::OrigValue(orig.into()));
            }
            if let Some(k) = str_meta(diff, node, MetaKey::OrigKey) {
                out.set_meta(new_id, Meta::Key(k));
            }
            if let Some(v) = str_meta(diff, node, MetaKey::OrigValue) {
                out.set_meta(new_id, Meta::Value(v));
            }
            if let Some(k) = str_meta(diff, node, MetaKey::Key) {
                out.set_meta(new_id, Meta::OrigKey(k));
            }
            if let Some(v) = str_meta(diff, node, MetaKey::Value) {
                out.set_meta(new_id, Meta::OrigValue(v));
            }
            if let Some(Meta::OrigDefault(d)) = diff.get_meta(node, MetaKey::OrigDefault) {
                out.set_meta(new_id, Meta::OrigDefault(n.is_default()));
                out.get_mut(new_id).set_default(*d);
            }
            let children: Vec<NodeId> = n.children().iter().map(|&c| reverse_node(diff, c, out)).collect();
            for c in children {
                out.attach_last(Some(new_id), c);
            }
            new_id
        }
        _ => {
            let new_id = out.create_node(schema, n.value()).expect("reversed none node mirrors schema value presence");
            out.set_meta(new_id, Meta::Operation(Operation::None));
            let children: Vec<NodeId> = n.children().iter().map(|&c| reverse_node(diff, c, out)).collect();
            for c in children {
                out.attach_last(Some(new_id), c);
            }
            new_id
        }
    }
}

/// Revalidates `diff` against current `ds` contents (spec.md §4.C "Update
/// a diff against observed data"): drops any diff node whose match is gone
/// missing, or whose leaf `replace` already equals the observed value.
pub fn update_diff_against_data(diff: &mut Tree, ds: &Tree) {
    let roots = diff.roots.clone();
    let mut keep = Vec::new();
    for r in roots {
        if update_against_data_node(diff, r, ds, None) {
            keep.push(r);
        } else {
            diff.free_subtree(r);
        }
    }
    diff.roots = keep;
}

fn update_against_data_node(diff: &mut Tree, node: NodeId, ds: &Tree, ds_parent: Option<NodeId>) -> bool {
    let op = op_of(diff, node);
    let schema = diff.get(node).schema.clone();
    let matched = find_match(ds, ds_parent, diff, node);
    match op {
        Operation::Delete => matched.is_some(),
        Operation::Create => matched.is_none(),
        Operation::Replace => {
            let Some(m) = matched else { return false };
            match schema.kind {
                NodeKind::Leaf => ds.get(m).value() != diff.get(node).value(),
                _ => true,
            }
        }
        Operation::None => {
            let Some(m) = matched else { return false };
            let children = diff.get(node).children().to_vec();
            let mut kept = Vec::new();
            for c in children {
                if update_against_data_node(diff, c, ds, Some(m)) {
                    kept.push(c);
                } else {
                    diff.free_subtree(c);
                }
            }
            set_children(diff, node, kept);
            !diff.get(node).children().is_empty()
        }
        _ => true,
    }
}

fn set_children(diff: &mut Tree, node: NodeId, kept: Vec<NodeId>) {
    for &k in &kept {
        diff.detach(k);
    }
    for &k in &kept {
        diff.attach_last(Some(node), k);
    }
}

/// One observation from the external structural-diff library (spec.md
/// §4.C "Convert a structural difference list").
pub enum ChangeRecord {
    Created { node: NodeId },
    Deleted { node: NodeId },
    Changed { node: NodeId, orig_value: Box<str> },
    Moved { node: NodeId, orig_predicate: Box<str>, new_predicate: Box<str> },
}

/// Builds a single canonical diff from a list of per-node structural
/// records observed against `source` (spec.md §4.C): each record's node is
/// cloned together with its ancestor chain (no metadata, keys only),
/// tagged with its operation, then merged into the accumulating diff;
/// finally any top-level node still lacking an operation is stamped
/// `none`.
pub fn diff_from_changes(source: &Tree, records: &[ChangeRecord]) -> StoreResult<Tree> {
    let mut acc = Tree::new();
    for rec in records {
        let mut single = Tree::new();
        let (node, op, meta) = match rec {
            ChangeRecord::Created { node } => (*node, Operation::Create, Vec::new()),
            ChangeRecord::Deleted { node } => (*node, Operation::Delete, Vec::new()),
            ChangeRecord::Changed { node, orig_value } => {
                (*node, Operation::Replace, vec![Meta::OrigValue(orig_value.clone())])
            }
            ChangeRecord::Moved { node, orig_predicate, new_predicate } => (
                *node,
                Operation::Replace,
                vec![
                    Meta::OrigKey(orig_predicate.clone()),
                    Meta::OrigValue(orig_predicate.clone()),
                    Meta::Key(new_predicate.clone()),
                    Meta::Value(new_predicate.clone()),
                ],
            ),
        };
        let leaf_clone = clone_ancestor_chain(source, node, &mut single);
        set_op(&mut single, leaf_clone, op);
        for m in meta {
            single.set_meta(leaf_clone, m);
        }
        merge_diffs(&mut acc, &single)?;
    }
    stamp_none_on_top_level(&mut acc);
    Ok(acc)
}

/// Clones `node` together with its ancestor chain (schema + list keys
/// only, no other metadata/value) into `dest`, returning the id of the
/// leaf-most (originally requested) node.
fn clone_ancestor_chain(source: &Tree, node: NodeId, dest: &mut Tree) -> NodeId {
    let n = source.get(node);
    let mut chain = vec![node];
    let mut cur = n.parent();
    while let Some(p) = cur {
        chain.push(p);
        cur = source.get(p).parent();
    }
    chain.reverse();

    let mut dest_parent: Option<NodeId> = None;
    let mut dest_node = None;
    for &src_id in &chain {
        let src = source.get(src_id);
        let value = match src.schema.kind {
            NodeKind::Leaf | NodeKind::LeafList { .. } | NodeKind::AnyData | NodeKind::AnyXml => src.value(),
            _ => None,
        };
        let id = dest
            .create_node(src.schema.clone(), value)
            .expect("ancestor-chain clone preserves source schema/value invariants");
        if src.schema.kind.is_list_like() {
            for &key_child in src.children() {
                let kc = source.get(key_child);
                if src.schema.keys.iter().any(|k| k.as_ref() == kc.schema.name.as_ref()) {
                    let cloned_key = dest
                        .create_node(kc.schema.clone(), kc.value())
                        .expect("key leaf clone preserves its own schema/value invariant");
                    dest.attach_last(Some(id), cloned_key);
                }
            }
        }
        match dest_parent {
            Some(p) => dest.attach_last(Some(p), id),
            None => dest.attach_last(None, id),
        }
        dest_parent = Some(id);
        dest_node = Some(id);
    }
    dest_node.expect("chain always contains at least the requested node")
}

fn stamp_none_on_top_level(diff: &mut Tree) {
    let roots = diff.roots.clone();
    for r in roots {
        if diff.get_meta(r, MetaKey::Operation).is_none() {
            set_op(diff, r, Operation::None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::SchemaBuilder;

    fn leaf_schema(name: &str) -> crate::tree::SchemaRef {
        SchemaBuilder::new("m", name, NodeKind::Leaf).build()
    }

    #[test]
    fn merge_create_then_replace_keeps_create_with_new_value() {
        let mut base = Tree::new();
        let c = base.create_node(leaf_schema("x"), Some("1")).unwrap();
        set_op(&mut base, c, Operation::Create);
        base.attach_last(None, c);

        let mut incoming = Tree::new();
        let r = incoming.create_node(leaf_schema("x"), Some("2")).unwrap();
        set_op(&mut incoming, r, Operation::Replace);
        incoming.attach_last(None, r);

        merge_diffs(&mut base, &incoming).unwrap();
        assert_eq!(base.roots.len(), 1);
        assert_eq!(op_of(&base, base.roots[0]), Operation::Create);
        assert_eq!(base.get(base.roots[0]).value(), Some("2"));
    }

    #[test]
    fn reverse_swaps_create_and_delete() {
        let mut diff = Tree::new();
        let c = diff.create_node(leaf_schema("x"), Some("1")).unwrap();
        set_op(&mut diff, c, Operation::Create);
        diff.attach_last(None, c);

        let rev = reverse_diff(&diff);
        assert_eq!(op_of(&rev, rev.roots[0]), Operation::Delete);
    }

    #[test]
    fn apply_forward_creates_and_deletes() {
        let mut ds = Tree::new();
        let mut diff = Tree::new();
        let c = diff.create_node(leaf_schema("x"), Some("1")).unwrap();
        set_op(&mut diff, c, Operation::Create);
        diff.attach_last(None, c);
        apply_diff_forward(&mut ds, &diff).unwrap();
        assert_eq!(ds.get(ds.roots[0]).value(), Some("1"));

        let mut diff2 = Tree::new();
        let d = diff2.create_node(leaf_schema("x"), Some("1")).unwrap();
        set_op(&mut diff2, d, Operation::Delete);
        diff2.attach_last(None, d);
        apply_diff_forward(&mut ds, &diff2).unwrap();
        assert!(ds.roots.is_empty());
    }
}
