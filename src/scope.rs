//! Hierarchical per-item processing context.
//!
//! One scope node exists per (table-mapper node, parent scope) pair, created
//! during wiring and then mutated in place for the whole life of a worker —
//! items flow through the same nodes, no per-item allocation.
//!
//! Each node tracks the current object at its nesting level plus one sequence
//! counter per ancestor depth: `counters[k]` counts this node's `set` calls
//! since the ancestor at depth `k` last changed its current object. That is
//! what makes "index of this call within the current visit" and "global item
//! index" the same cheap lookup.

use serde_json::Value;
use std::ops::{Deref, DerefMut};

/// Handle to one node of a [`ScopeTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

/// Identity of one current-object occurrence: which scope, and which of its
/// `set` calls. Used to resolve once-per-ancestor contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Occurrence {
    pub scope: ScopeId,
    pub stamp: u64,
}

#[derive(Debug)]
struct ScopeNode {
    parent: Option<ScopeId>,
    depth: usize,
    kind: String,
    current: Option<Value>,
    counters: Vec<u64>,
    stamp: u64,
    children: Vec<ScopeId>,
}

/// Arena of scope nodes for one worker.
#[derive(Debug)]
pub struct ScopeTree {
    nodes: Vec<ScopeNode>,
    next_stamp: u64,
}

impl ScopeTree {
    pub fn new() -> Self {
        ScopeTree {
            nodes: vec![ScopeNode {
                parent: None,
                depth: 0,
                kind: String::new(),
                current: None,
                counters: vec![0],
                stamp: 0,
                children: Vec::new(),
            }],
            next_stamp: 0,
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn add_child(&mut self, parent: ScopeId, kind: impl Into<String>) -> ScopeId {
        let depth = self.nodes[parent.0].depth + 1;
        let id = ScopeId(self.nodes.len());
        self.nodes.push(ScopeNode {
            parent: Some(parent),
            depth,
            kind: kind.into(),
            current: None,
            counters: vec![0; depth + 1],
            stamp: 0,
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn kind(&self, id: ScopeId) -> &str {
        &self.nodes[id.0].kind
    }

    /// Make `object` the current object of this scope.
    ///
    /// Advances every one of the node's sequence counters by one and resets
    /// every descendant — a new subtree begins under the new object.
    pub fn set(&mut self, id: ScopeId, object: Value) {
        self.next_stamp += 1;
        let node = &mut self.nodes[id.0];
        node.current = Some(object);
        node.stamp = self.next_stamp;
        for counter in &mut node.counters {
            *counter += 1;
        }
        self.reset_descendants(id);
    }

    /// Counters relative to `id` and anything deeper restart; counters
    /// relative to shallower ancestors (the global sequence included) keep
    /// accumulating.
    fn reset_descendants(&mut self, id: ScopeId) {
        let from_depth = self.nodes[id.0].depth;
        let mut stack: Vec<ScopeId> = self.nodes[id.0].children.clone();
        while let Some(child) = stack.pop() {
            let node = &mut self.nodes[child.0];
            node.current = None;
            node.stamp = 0;
            for counter in node.counters.iter_mut().skip(from_depth) {
                *counter = 0;
            }
            stack.extend(node.children.iter().copied());
        }
    }

    /// This scope's own current object, if any.
    pub fn current(&self, id: ScopeId) -> Option<&Value> {
        self.nodes[id.0].current.as_ref()
    }

    /// Walk from `id` toward the root and return the nearest scope (inclusive)
    /// of the requested kind that holds a current object.
    pub fn current_of(&self, id: ScopeId, kind: &str) -> Option<(ScopeId, &Value)> {
        let mut cursor = Some(id);
        while let Some(at) = cursor {
            let node = &self.nodes[at.0];
            if node.kind == kind {
                if let Some(ref value) = node.current {
                    return Some((at, value));
                }
                return None;
            }
            cursor = node.parent;
        }
        None
    }

    /// Occurrence identity of this scope's current object.
    pub fn occurrence(&self, id: ScopeId) -> Option<Occurrence> {
        let node = &self.nodes[id.0];
        node.current.as_ref().map(|_| Occurrence {
            scope: id,
            stamp: node.stamp,
        })
    }

    /// Occurrence identity of the nearest `kind` ancestor's current object.
    pub fn occurrence_of(&self, id: ScopeId, kind: &str) -> Option<Occurrence> {
        self.current_of(id, kind)
            .and_then(|(scope, _)| self.occurrence(scope))
    }

    /// 0-based sequence of this scope's current object relative to the
    /// nearest `kind` ancestor (inclusive).
    pub fn index_of(&self, id: ScopeId, kind: &str) -> Option<u64> {
        let mut cursor = Some(id);
        while let Some(at) = cursor {
            let node = &self.nodes[at.0];
            if node.kind == kind {
                return self.nodes[id.0].counters[node.depth].checked_sub(1);
            }
            cursor = node.parent;
        }
        None
    }

    /// 0-based sequence relative to the root: the global item index as seen
    /// from this scope.
    pub fn global_index(&self, id: ScopeId) -> Option<u64> {
        self.nodes[id.0].counters[0].checked_sub(1)
    }

    /// 0-based sequence relative to the immediate parent scope.
    pub fn child_index(&self, id: ScopeId) -> Option<u64> {
        let node = &self.nodes[id.0];
        let slot = node.depth.saturating_sub(1);
        node.counters[slot].checked_sub(1)
    }

    /// Temporarily substitute the current object without touching counters or
    /// occurrence stamps. The previous object is restored when the returned
    /// guard drops, on every exit path.
    pub fn swap(&mut self, id: ScopeId, object: Value) -> SwapGuard<'_> {
        let prev = std::mem::replace(&mut self.nodes[id.0].current, Some(object));
        SwapGuard {
            tree: self,
            id,
            prev,
        }
    }
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle for [`ScopeTree::swap`]. Dereferences to the tree so the
/// swapped view can be read while the guard is alive.
pub struct SwapGuard<'a> {
    tree: &'a mut ScopeTree,
    id: ScopeId,
    prev: Option<Value>,
}

impl Deref for SwapGuard<'_> {
    type Target = ScopeTree;

    fn deref(&self) -> &ScopeTree {
        self.tree
    }
}

impl DerefMut for SwapGuard<'_> {
    fn deref_mut(&mut self) -> &mut ScopeTree {
        self.tree
    }
}

impl Drop for SwapGuard<'_> {
    fn drop(&mut self) {
        self.tree.nodes[self.id.0].current = self.prev.take();
    }
}

/// Read view handed to field mappers: the tree plus the scope the row is
/// being built for.
pub struct ScopeContext<'a> {
    pub tree: &'a ScopeTree,
    pub scope: ScopeId,
}

impl<'a> ScopeContext<'a> {
    pub fn new(tree: &'a ScopeTree, scope: ScopeId) -> Self {
        ScopeContext { tree, scope }
    }

    /// The object the row is being built from.
    pub fn item(&self) -> Option<&Value> {
        self.tree.current(self.scope)
    }

    pub fn current_of(&self, kind: &str) -> Option<&Value> {
        self.tree.current_of(self.scope, kind).map(|(_, v)| v)
    }

    pub fn occurrence_of(&self, kind: &str) -> Option<Occurrence> {
        self.tree.occurrence_of(self.scope, kind)
    }

    pub fn index_of(&self, kind: &str) -> Option<u64> {
        self.tree.index_of(self.scope, kind)
    }

    pub fn global_index(&self) -> Option<u64> {
        self.tree.global_index(self.scope)
    }

    pub fn child_index(&self) -> Option<u64> {
        self.tree.child_index(self.scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_resets_descendants() {
        let mut tree = ScopeTree::new();
        let visit = tree.add_child(tree.root(), "visit");
        let call = tree.add_child(visit, "call");

        tree.set(visit, json!({"id": 1}));
        tree.set(call, json!({"n": 1}));
        tree.set(call, json!({"n": 2}));
        assert_eq!(tree.child_index(call), Some(1));

        // New visit: call counters restart.
        tree.set(visit, json!({"id": 2}));
        assert_eq!(tree.child_index(call), None);
        assert!(tree.current(call).is_none());

        tree.set(call, json!({"n": 3}));
        assert_eq!(tree.child_index(call), Some(0));
    }

    #[test]
    fn test_indexes_relative_to_kinds() {
        let mut tree = ScopeTree::new();
        let visit = tree.add_child(tree.root(), "visit");
        let call = tree.add_child(visit, "call");

        tree.set(visit, json!({"id": 1}));
        for n in 0..3 {
            tree.set(call, json!({"n": n}));
        }
        tree.set(visit, json!({"id": 2}));
        tree.set(call, json!({"n": 9}));

        // Relative to the current visit: first call again.
        assert_eq!(tree.index_of(call, "visit"), Some(0));
        // Relative to the root: fourth call overall.
        assert_eq!(tree.global_index(call), Some(3));
        assert_eq!(tree.global_index(visit), Some(1));
    }

    #[test]
    fn test_current_of_walks_up() {
        let mut tree = ScopeTree::new();
        let visit = tree.add_child(tree.root(), "visit");
        let call = tree.add_child(visit, "call");

        tree.set(visit, json!({"id": 7}));
        tree.set(call, json!({"n": 0}));

        let ctx = ScopeContext::new(&tree, call);
        assert_eq!(ctx.current_of("visit").unwrap()["id"], 7);
        assert!(ctx.current_of("order").is_none());
    }

    #[test]
    fn test_occurrence_changes_per_set() {
        let mut tree = ScopeTree::new();
        let visit = tree.add_child(tree.root(), "visit");

        tree.set(visit, json!({"id": 1}));
        let first = tree.occurrence(visit).unwrap();
        tree.set(visit, json!({"id": 1}));
        let second = tree.occurrence(visit).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_swap_restores_on_drop() {
        let mut tree = ScopeTree::new();
        let visit = tree.add_child(tree.root(), "visit");
        tree.set(visit, json!({"id": 1}));
        let stamp_before = tree.occurrence(visit).unwrap();

        {
            let guard = tree.swap(visit, json!({"id": 99}));
            assert_eq!(guard.current(visit).unwrap()["id"], 99);
            // Swapping is not a new occurrence.
            assert_eq!(guard.occurrence(visit).unwrap(), stamp_before);
        }

        assert_eq!(tree.current(visit).unwrap()["id"], 1);
        assert_eq!(tree.occurrence(visit).unwrap(), stamp_before);
    }
}
