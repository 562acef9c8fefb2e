// SPDX-License-Identifier: AGPL-3.0-only

//! A simple recursive binary encoding for a data tree (spec.md §6.1): node
//! kind is implicit in the schema, so the wire form only needs the
//! `(module, name)` schema path component, an optional value, the default
//! flag, and a child list — no YANG/XML text is involved (Non-goal:
//! wire encoding of schema files; this is a *data* encoding, not schema).
//! Decoding walks the same way a schema-aware reader would: starting from
//! a caller-supplied root resolver, then `schema.child(name)` for every
//! descendant, so a tampered or unknown node name fails closed rather than
//! reconstructing a node with no real schema behind it.

use std::convert::TryInto;

use super::node::{NodeId, Tree};
use super::schema::SchemaRef;
use crate::error::{Error, StoreResult};

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize) -> StoreResult<&'a [u8]> {
    let len = read_u32(buf, pos)? as usize;
    let end = pos.checked_add(len).ok_or_else(|| Error::invalid_arg("encoded tree length overflow"))?;
    let slice = buf.get(*pos..end).ok_or_else(|| Error::invalid_arg("encoded tree truncated"))?;
    *pos = end;
    Ok(slice)
}

fn read_u32(buf: &[u8], pos: &mut usize) -> StoreResult<u32> {
    let bytes: [u8; 4] = buf
        .get(*pos..*pos + 4)
        .ok_or_else(|| Error::invalid_arg("encoded tree truncated"))?
        .try_into()
        .unwrap();
    *pos += 4;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u8(buf: &[u8], pos: &mut usize) -> StoreResult<u8> {
    let b = *buf.get(*pos).ok_or_else(|| Error::invalid_arg("encoded tree truncated"))?;
    *pos += 1;
    Ok(b)
}

fn encode_node(tree: &Tree, node: NodeId, out: &mut Vec<u8>) {
    let n = tree.get(node);
    write_bytes(out, n.schema.module.as_bytes());
    write_bytes(out, n.schema.name.as_bytes());
    match n.value() {
        Some(v) => {
            out.push(1);
            write_bytes(out, v.as_bytes());
        }
        None => out.push(0),
    }
    out.push(n.is_default() as u8);
    out.extend_from_slice(&(n.children().len() as u32).to_le_bytes());
    for &child in n.children() {
        encode_node(tree, child, out);
    }
}

/// Serializes every node reachable from `tree.roots` (spec.md §6.1).
pub fn encode(tree: &Tree) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(tree.roots.len() as u32).to_le_bytes());
    for &root in &tree.roots {
        encode_node(tree, root, &mut out);
    }
    out
}

fn decode_node(
    buf: &[u8],
    pos: &mut usize,
    schema: SchemaRef,
    dest: &mut Tree,
    parent: Option<NodeId>,
) -> StoreResult<NodeId> {
    let has_value = read_u8(buf, pos)? != 0;
    let value = if has_value {
        let bytes = read_bytes(buf, pos)?;
        Some(std::str::from_utf8(bytes).map_err(|_| Error::invalid_arg("encoded value is not valid utf-8"))?)
    } else {
        None
    };
    let node = dest.create_node(schema.clone(), value)?;
    let is_default = read_u8(buf, pos)? != 0;
    dest.get_mut(node).set_default(is_default);
    match parent {
        Some(p) => dest.attach_last(Some(p), node),
        None => dest.attach_last(None, node),
    }
    let child_count = read_u32(buf, pos)?;
    for _ in 0..child_count {
        let module = std::str::from_utf8(read_bytes(buf, pos)?)
            .map_err(|_| Error::invalid_arg("encoded module name is not valid utf-8"))?
            .to_string();
        let name = std::str::from_utf8(read_bytes(buf, pos)?)
            .map_err(|_| Error::invalid_arg("encoded node name is not valid utf-8"))?
            .to_string();
        let child_schema = schema
            .child(&name)
            .cloned()
            .ok_or_else(|| Error::validation_failed(format!("no schema child '{module}:{name}' under '{}'", schema.name)))?;
        decode_node(buf, pos, child_schema, dest, Some(node))?;
    }
    Ok(node)
}

/// Reconstructs a tree previously produced by [`encode`]. `resolve_root`
/// maps a root node's `(module, name)` to its schema; every descendant is
/// then resolved via `schema.child(name)`, so a schema change that drops a
/// node fails the whole decode rather than silently losing data.
pub fn decode(bytes: &[u8], resolve_root: impl Fn(&str, &str) -> Option<SchemaRef>) -> StoreResult<Tree> {
    let mut tree = Tree::new();
    let mut pos = 0usize;
    let root_count = read_u32(bytes, &mut pos)?;
    for _ in 0..root_count {
        let module = std::str::from_utf8(read_bytes(bytes, &mut pos)?)
            .map_err(|_| Error::invalid_arg("encoded module name is not valid utf-8"))?
            .to_string();
        let name = std::str::from_utf8(read_bytes(bytes, &mut pos)?)
            .map_err(|_| Error::invalid_arg("encoded node name is not valid utf-8"))?
            .to_string();
        let schema = resolve_root(&module, &name)
            .ok_or_else(|| Error::validation_failed(format!("no root schema for '{module}:{name}'")))?;
        decode_node(bytes, &mut pos, schema, &mut tree, None)?;
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::schema::{NodeKind, SchemaBuilder};

    #[test]
    fn round_trips_a_nested_tree() {
        let key_schema = SchemaBuilder::new("m", "name", NodeKind::Leaf).build();
        let list_schema = SchemaBuilder::new("m", "iface", NodeKind::List { user_ordered: false })
            .keys(&["name"])
            .child(key_schema)
            .build();

        let mut tree = Tree::new();
        let entry = tree.create_node(list_schema.clone(), None).unwrap();
        tree.attach_last(None, entry);
        let key = tree.create_node(list_schema.child("name").unwrap().clone(), Some("eth0")).unwrap();
        tree.attach_last(Some(entry), key);

        let bytes = encode(&tree);
        let decoded = decode(&bytes, |module, name| {
            (module == "m" && name == "iface").then(|| list_schema.clone())
        })
        .unwrap();

        assert_eq!(decoded.roots.len(), 1);
        assert_eq!(decoded.path(decoded.roots[0], true), "/m:iface[name='eth0']");
    }

    #[test]
    fn decode_rejects_unknown_root() {
        let leaf_schema = SchemaBuilder::new("m", "x", NodeKind::Leaf).build();
        let mut tree = Tree::new();
        let n = tree.create_node(leaf_schema, Some("1")).unwrap();
        tree.attach_last(None, n);
        let bytes = encode(&tree);
        assert!(decode(&bytes, |_, _| None).is_err());
    }
}
