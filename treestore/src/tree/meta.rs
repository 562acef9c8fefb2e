// SPDX-License-Identifier: AGPL-3.0-only

//! Per-node metadata as a typed map, not opaque strings (design note §9).
//! The set of metadata names the engine ever produces or consumes is
//! closed, so `Meta` is a tagged variant keyed by `MetaKey` rather than a
//! `HashMap<String, String>` — this removes stringly-typed lookups from
//! the edit/diff hot paths the way the teacher's `DataDeltaKind` and
//! `SchemaDeltaKind` close their own small vocabularies.

use treestore_macros::EnumCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, EnumCode)]
pub enum MetaKey {
    Operation,
    Insert,
    Key,
    Value,
    OrigKey,
    OrigValue,
    OrigDefault,
    Origin,
    Pid,
    ConnPtr,
    InverseDataDeps,
    EnabledFeature,
}

/// The seven closed edit-operation kinds of spec.md §3 (design note §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCode)]
pub enum Operation {
    Merge,
    Replace,
    Create,
    Delete,
    Remove,
    None,
    Ether,
}

/// The closed diff-operation kinds of spec.md §3: a strict subset of
/// `Operation` (a diff never carries `merge`/`remove`/`ether`/`none`-as-default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCode)]
pub enum DiffOp {
    Create,
    Delete,
    Replace,
    None,
}

/// The closed insert-position kinds for user-ordered targets (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCode)]
pub enum InsertKind {
    Default,
    First,
    Last,
    Before,
    After,
}

/// Operational-datastore node origin (spec.md §4.B "Origin propagation").
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumCode)]
pub enum Origin {
    Interface,
    System,
    Learned,
    Intended,
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Meta {
    Operation(Operation),
    Insert(InsertKind),
    Key(Box<str>),
    Value(Box<str>),
    OrigKey(Box<str>),
    OrigValue(Box<str>),
    OrigDefault(bool),
    Origin(Origin),
    Pid(u32),
    ConnPtr(u64),
    InverseDataDeps(Box<str>),
    EnabledFeature(Box<str>),
}

impl Meta {
    pub fn key(&self) -> MetaKey {
        match self {
            Meta::Operation(_) => MetaKey::Operation,
            Meta::Insert(_) => MetaKey::Insert,
            Meta::Key(_) => MetaKey::Key,
            Meta::Value(_) => MetaKey::Value,
            Meta::OrigKey(_) => MetaKey::OrigKey,
            Meta::OrigValue(_) => MetaKey::OrigValue,
            Meta::OrigDefault(_) => MetaKey::OrigDefault,
            Meta::Origin(_) => MetaKey::Origin,
            Meta::Pid(_) => MetaKey::Pid,
            Meta::ConnPtr(_) => MetaKey::ConnPtr,
            Meta::InverseDataDeps(_) => MetaKey::InverseDataDeps,
            Meta::EnabledFeature(_) => MetaKey::EnabledFeature,
        }
    }
}

/// A small, ordered bag of metadata records attached to one node. Nodes
/// rarely carry more than two or three entries, so a `Vec` scanned linearly
/// beats a hash map both in memory and in practice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaSet(Vec<Meta>);

impl MetaSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, key: MetaKey) -> Option<&Meta> {
        self.0.iter().find(|m| m.key() == key)
    }

    pub fn set(&mut self, meta: Meta) {
        let key = meta.key();
        match self.0.iter_mut().find(|m| m.key() == key) {
            Some(slot) => *slot = meta,
            None => self.0.push(meta),
        }
    }

    pub fn remove(&mut self, key: MetaKey) -> Option<Meta> {
        let idx = self.0.iter().position(|m| m.key() == key)?;
        Some(self.0.remove(idx))
    }

    pub fn operation(&self) -> Option<Operation> {
        match self.get(MetaKey::Operation) {
            Some(Meta::Operation(op)) => Some(*op),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Meta> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_same_key() {
        let mut m = MetaSet::new();
        m.set(Meta::Operation(Operation::Merge));
        m.set(Meta::Operation(Operation::Replace));
        assert_eq!(m.operation(), Some(Operation::Replace));
        assert_eq!(m.iter().count(), 1);
    }

    #[test]
    fn enum_code_roundtrips() {
        for op in [Operation::Merge, Operation::Ether, Operation::Delete] {
            assert_eq!(Operation::from_code(op.code()), Some(op));
        }
    }
}
