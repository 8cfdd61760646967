//! Ref-counted chunk lists stored in an arena.
//!
//! A table owns a root list whose children are one list per tablet; tablet
//! lists hold chunks. Snapshot holders take an extra reference on a root, and
//! writers copy shared lists before mutating them, so a pinned tree never
//! changes underneath its holder.
//!
//! # Invariants
//! - A list's `ref_counter` equals the number of parents plus external holders.
//! - A chunk's reference count equals the number of list slots naming it.
//! - Freed slots are recycled; a released list id is never dereferenced again.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use tabula_common::error::{TabulaError, TabulaResult};
use tabula_common::{ChunkId, Key};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkListId(pub u32);

impl std::fmt::Display for ChunkListId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chunk-list-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTreeChild {
    Chunk(ChunkId),
    List(ChunkListId),
}

#[derive(Debug, Clone)]
pub struct ChunkListNode {
    pub children: Vec<ChunkTreeChild>,
    /// Lower bound of the tablet this list backs.
    pub pivot_key: Option<Key>,
    ref_counter: u32,
}

impl ChunkListNode {
    pub fn ref_counter(&self) -> u32 {
        self.ref_counter
    }
}

#[derive(Debug, Default)]
pub struct ChunkTree {
    nodes: Vec<Option<ChunkListNode>>,
    free: Vec<u32>,
    chunk_refs: HashMap<ChunkId, u32>,
}

impl ChunkTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, id: ChunkListId) -> TabulaResult<&ChunkListNode> {
        self.nodes
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| TabulaError::internal(format!("{id} does not exist")))
    }

    fn node_mut(&mut self, id: ChunkListId) -> TabulaResult<&mut ChunkListNode> {
        self.nodes
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| TabulaError::internal(format!("{id} does not exist")))
    }

    fn alloc(&mut self, node: ChunkListNode) -> ChunkListId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                ChunkListId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                ChunkListId(self.nodes.len() as u32 - 1)
            }
        }
    }

    /// A fresh list with one reference owned by the caller.
    pub fn create_list(&mut self, pivot_key: Option<Key>) -> ChunkListId {
        self.alloc(ChunkListNode {
            children: Vec::new(),
            pivot_key,
            ref_counter: 1,
        })
    }

    /// A fresh list appended under `parent`; the parent owns its reference.
    pub fn create_child_list(&mut self, parent: ChunkListId, pivot_key: Option<Key>) -> TabulaResult<ChunkListId> {
        self.node(parent)?;
        let child = self.create_list(pivot_key);
        self.node_mut(parent)?.children.push(ChunkTreeChild::List(child));
        Ok(child)
    }

    pub fn attach_chunk(&mut self, list: ChunkListId, chunk: ChunkId) -> TabulaResult<()> {
        self.node_mut(list)?.children.push(ChunkTreeChild::Chunk(chunk));
        *self.chunk_refs.entry(chunk).or_insert(0) += 1;
        Ok(())
    }

    /// Remove one occurrence of `chunk` from `list`. Returns `true` when that
    /// was the last reference anywhere in the tree.
    pub fn detach_chunk(&mut self, list: ChunkListId, chunk: ChunkId) -> TabulaResult<bool> {
        let node = self.node_mut(list)?;
        let pos = node
            .children
            .iter()
            .position(|c| *c == ChunkTreeChild::Chunk(chunk))
            .ok_or_else(|| TabulaError::internal(format!("{chunk} is not in {list}")))?;
        node.children.remove(pos);
        Ok(self.release_chunk(chunk))
    }

    fn release_chunk(&mut self, chunk: ChunkId) -> bool {
        match self.chunk_refs.get_mut(&chunk) {
            Some(n) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(_) => {
                self.chunk_refs.remove(&chunk);
                true
            }
            None => false,
        }
    }

    pub fn ref_list(&mut self, id: ChunkListId) -> TabulaResult<u32> {
        let node = self.node_mut(id)?;
        node.ref_counter += 1;
        Ok(node.ref_counter)
    }

    /// Drop one reference; lists reaching zero are freed together with any
    /// descendants that become unreferenced. Returns the chunks whose last
    /// reference disappeared.
    pub fn unref_list(&mut self, id: ChunkListId) -> TabulaResult<Vec<ChunkId>> {
        self.node(id)?;
        let mut released = Vec::new();
        let mut stack = vec![id];
        while let Some(list) = stack.pop() {
            let node = self.node_mut(list)?;
            node.ref_counter -= 1;
            if node.ref_counter > 0 {
                continue;
            }
            let node = self.nodes[list.0 as usize]
                .take()
                .ok_or_else(|| TabulaError::internal(format!("{list} freed twice")))?;
            self.free.push(list.0);
            for child in node.children {
                match child {
                    ChunkTreeChild::Chunk(chunk) => {
                        if self.release_chunk(chunk) {
                            released.push(chunk);
                        }
                    }
                    ChunkTreeChild::List(child) => stack.push(child),
                }
            }
        }
        Ok(released)
    }

    /// Shallow copy: a new list (ref 1) sharing every child of `id`.
    pub fn clone_list(&mut self, id: ChunkListId) -> TabulaResult<ChunkListId> {
        let source = self.node(id)?.clone();
        for child in &source.children {
            match *child {
                ChunkTreeChild::Chunk(chunk) => *self.chunk_refs.entry(chunk).or_insert(0) += 1,
                ChunkTreeChild::List(list) => self.node_mut(list)?.ref_counter += 1,
            }
        }
        Ok(self.alloc(ChunkListNode {
            children: source.children,
            pivot_key: source.pivot_key,
            ref_counter: 1,
        }))
    }

    /// Make `root` safe to mutate: returns it unchanged when exclusively
    /// owned, otherwise a private copy that replaces the caller's reference.
    pub fn cow_root(&mut self, root: ChunkListId) -> TabulaResult<ChunkListId> {
        if self.node(root)?.ref_counter == 1 {
            return Ok(root);
        }
        let copy = self.clone_list(root)?;
        self.node_mut(root)?.ref_counter -= 1;
        Ok(copy)
    }

    /// Ensure child `index` of an exclusively owned `root` is itself
    /// exclusive, copying it if shared. Returns the child's id.
    pub fn make_exclusive_child(&mut self, root: ChunkListId, index: usize) -> TabulaResult<ChunkListId> {
        let child = match self.node(root)?.children.get(index) {
            Some(ChunkTreeChild::List(child)) => *child,
            _ => return Err(TabulaError::internal(format!("{root} has no child list at {index}"))),
        };
        if self.node(child)?.ref_counter == 1 {
            return Ok(child);
        }
        let copy = self.clone_list(child)?;
        self.node_mut(child)?.ref_counter -= 1;
        self.node_mut(root)?.children[index] = ChunkTreeChild::List(copy);
        Ok(copy)
    }

    /// Replace children `range` of `parent` with `replacement` lists (already
    /// owned by the caller, handed over to the parent). Returns released chunks.
    pub fn splice_lists(
        &mut self,
        parent: ChunkListId,
        range: std::ops::Range<usize>,
        replacement: Vec<ChunkListId>,
    ) -> TabulaResult<Vec<ChunkId>> {
        let removed: Vec<ChunkTreeChild> = {
            let node = self.node_mut(parent)?;
            if range.end > node.children.len() {
                return Err(TabulaError::internal(format!("{parent} has no children {range:?}")));
            }
            node.children
                .splice(range, replacement.into_iter().map(ChunkTreeChild::List))
                .collect()
        };
        let mut released = Vec::new();
        for child in removed {
            match child {
                ChunkTreeChild::List(list) => released.extend(self.unref_list(list)?),
                ChunkTreeChild::Chunk(chunk) => {
                    if self.release_chunk(chunk) {
                        released.push(chunk);
                    }
                }
            }
        }
        Ok(released)
    }

    pub fn ref_counter(&self, id: ChunkListId) -> Option<u32> {
        self.nodes.get(id.0 as usize)?.as_ref().map(|n| n.ref_counter)
    }

    pub fn list(&self, id: ChunkListId) -> Option<&ChunkListNode> {
        self.nodes.get(id.0 as usize)?.as_ref()
    }

    pub fn children(&self, id: ChunkListId) -> &[ChunkTreeChild] {
        self.list(id).map_or(&[], |n| n.children.as_slice())
    }

    /// Child lists of `id`, in order.
    pub fn child_lists(&self, id: ChunkListId) -> Vec<ChunkListId> {
        self.children(id)
            .iter()
            .filter_map(|c| match c {
                ChunkTreeChild::List(l) => Some(*l),
                ChunkTreeChild::Chunk(_) => None,
            })
            .collect()
    }

    /// Every chunk reachable from `id`, depth first.
    pub fn chunks_of(&self, id: ChunkListId) -> Vec<ChunkId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(list) = stack.pop() {
            for child in self.children(list).iter().rev() {
                match child {
                    ChunkTreeChild::Chunk(chunk) => out.push(*chunk),
                    ChunkTreeChild::List(l) => stack.push(*l),
                }
            }
        }
        out
    }

    pub fn chunk_ref_count(&self, chunk: ChunkId) -> u32 {
        self.chunk_refs.get(&chunk).copied().unwrap_or(0)
    }

    pub fn live_list_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(tree: &ChunkTree, root: ChunkListId) -> (u32, Vec<u32>) {
        let tablets = tree
            .child_lists(root)
            .into_iter()
            .map(|l| tree.ref_counter(l).unwrap())
            .collect();
        (tree.ref_counter(root).unwrap(), tablets)
    }

    #[test]
    fn test_snapshot_pins_old_tree() {
        let mut tree = ChunkTree::new();
        let root = tree.create_list(None);
        tree.create_child_list(root, Some(Key::empty())).unwrap();
        assert_eq!(counts(&tree, root), (1, vec![1]));

        // Snapshot holder.
        tree.ref_list(root).unwrap();
        assert_eq!(counts(&tree, root), (2, vec![1]));

        let live = tree.cow_root(root).unwrap();
        assert_ne!(live, root);
        let tablet = tree.make_exclusive_child(live, 0).unwrap();
        tree.attach_chunk(tablet, ChunkId(1)).unwrap();
        assert_eq!(counts(&tree, live), (1, vec![1]));
        assert!(tree.chunks_of(root).is_empty());
        assert_eq!(tree.chunks_of(live), vec![ChunkId(1)]);

        assert!(tree.unref_list(root).unwrap().is_empty());
        assert_eq!(tree.live_list_count(), 2);
    }

    #[test]
    fn test_shared_tablet_list_after_partial_write() {
        let mut tree = ChunkTree::new();
        let root = tree.create_list(None);
        for pivot in [Key::empty(), Key::from(vec![5i64])] {
            tree.create_child_list(root, Some(pivot)).unwrap();
        }
        tree.ref_list(root).unwrap();
        let live = tree.cow_root(root).unwrap();
        let first = tree.make_exclusive_child(live, 0).unwrap();
        tree.attach_chunk(first, ChunkId(7)).unwrap();
        assert_eq!(counts(&tree, live), (1, vec![1, 2]));

        let second = tree.make_exclusive_child(live, 1).unwrap();
        tree.attach_chunk(second, ChunkId(8)).unwrap();
        assert_eq!(counts(&tree, live), (1, vec![1, 1]));

        tree.unref_list(root).unwrap();
        assert_eq!(counts(&tree, live), (1, vec![1, 1]));
        assert_eq!(tree.live_list_count(), 3);
    }

    #[test]
    fn test_release_reports_last_chunk_reference() {
        let mut tree = ChunkTree::new();
        let root = tree.create_list(None);
        let a = tree.create_child_list(root, None).unwrap();
        tree.attach_chunk(a, ChunkId(1)).unwrap();
        tree.attach_chunk(a, ChunkId(2)).unwrap();
        let b = tree.create_child_list(root, None).unwrap();
        tree.attach_chunk(b, ChunkId(2)).unwrap();
        assert_eq!(tree.chunk_ref_count(ChunkId(2)), 2);

        assert!(!tree.detach_chunk(b, ChunkId(2)).unwrap());
        let mut released = tree.unref_list(root).unwrap();
        released.sort();
        assert_eq!(released, vec![ChunkId(1), ChunkId(2)]);
        assert_eq!(tree.live_list_count(), 0);
    }

    #[test]
    fn test_splice_replaces_tablet_lists() {
        let mut tree = ChunkTree::new();
        let root = tree.create_list(None);
        let old = tree.create_child_list(root, Some(Key::empty())).unwrap();
        tree.attach_chunk(old, ChunkId(3)).unwrap();

        let left = tree.create_list(Some(Key::empty()));
        let right = tree.create_list(Some(Key::from(vec![5i64])));
        tree.attach_chunk(left, ChunkId(3)).unwrap();
        tree.attach_chunk(right, ChunkId(3)).unwrap();
        let released = tree.splice_lists(root, 0..1, vec![left, right]).unwrap();
        assert!(released.is_empty());
        assert_eq!(tree.chunk_ref_count(ChunkId(3)), 2);
        assert_eq!(tree.child_lists(root), vec![left, right]);
        assert!(tree.ref_counter(old).is_none());

        // Freed slots get reused.
        let reused = tree.create_list(None);
        assert_eq!(reused, old);
    }
}
