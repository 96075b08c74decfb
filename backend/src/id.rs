// id.rs — Stable identifiers for IR nodes
//
// Node ids are dense indices into a graph's node table. Allocated in
// construction order by `GraphBuilder`; the generator keys its symbol table,
// memoization and diagnostics on them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a node inside one `ir::Graph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Allocator for node ids. Produces monotonically increasing ids so that a
/// graph built twice from the same description numbers its nodes the same way.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_node: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_node(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }

    /// Number of ids handed out so far.
    pub fn allocated(&self) -> usize {
        self.next_node as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_ordered() {
        let mut alloc = IdAllocator::new();
        let a = alloc.alloc_node();
        let b = alloc.alloc_node();
        assert_eq!(a, NodeId(0));
        assert_eq!(b, NodeId(1));
        assert!(a < b);
        assert_eq!(alloc.allocated(), 2);
    }

    #[test]
    fn display_uses_n_prefix() {
        assert_eq!(NodeId(7).to_string(), "n7");
        assert_eq!(NodeId(7).index(), 7);
    }
}
