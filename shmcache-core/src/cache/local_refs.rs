//! Process-local references held on behalf of in-process objects
//!
//! An in-process representation of a blob (a decoded image, say) keeps its
//! shared entry alive through a [`LocalId`]. When the representation is
//! destroyed the owner hands the id back and the entry is released. The table
//! only records handles; it never keeps the entry bytes reachable by itself.

use super::entry::EntryHandle;
use std::collections::HashMap;

/// Process-local serial number for a held reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(u64);

impl LocalId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct LocalRefTable {
    next_id: u64,
    refs: HashMap<LocalId, EntryHandle>,
}

impl LocalRefTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: EntryHandle) -> LocalId {
        self.next_id += 1;
        let id = LocalId(self.next_id);
        self.refs.insert(id, handle);
        id
    }

    pub fn take(&mut self, id: LocalId) -> Option<EntryHandle> {
        self.refs.remove(&id)
    }

    pub fn get(&self, id: LocalId) -> Option<EntryHandle> {
        self.refs.get(&id).copied()
    }

    pub fn contains(&self, id: LocalId) -> bool {
        self.refs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Remove every held reference
    pub fn drain(&mut self) -> Vec<EntryHandle> {
        self.refs.drain().map(|(_, handle)| handle).collect()
    }
}
