use std::collections::BTreeSet;

/// Dense index of a node inside a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ID(usize);

impl ID {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Node<T> {
    id: ID,
    val: T,
    succ: BTreeSet<ID>,
}

impl<T> Node<T> {
    fn new(val: T, id: ID) -> Self {
        Node {
            id,
            val,
            succ: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> ID {
        self.id
    }

    pub fn val(&self) -> &T {
        &self.val
    }

    pub fn val_mut(&mut self) -> &mut T {
        &mut self.val
    }

    pub fn succ(&self) -> impl Iterator<Item = ID> + '_ {
        self.succ.iter().copied()
    }

    /// Neighbours of an undirected node (built with `double_link`).
    pub fn adj(&self) -> &BTreeSet<ID> {
        &self.succ
    }
}

impl<T> PartialEq for Node<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Node<T> {}

/// Arena graph. Nodes are never removed, so an `ID` stays valid for the
/// lifetime of the graph. Nodes that leave an algorithm are unlinked
/// instead.
#[derive(Debug, Clone)]
pub struct Graph<T> {
    nodes: Vec<Node<T>>,
}

impl<T> Graph<T> {
    pub fn new() -> Self {
        Graph { nodes: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Graph {
            nodes: Vec::with_capacity(capacity),
        }
    }

    pub fn get(&self, id: ID) -> &Node<T> {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: ID) -> &mut Node<T> {
        &mut self.nodes[id.0]
    }

    pub fn insert(&mut self, val: T) -> ID {
        let id = ID(self.nodes.len());
        self.nodes.push(Node::new(val, id));
        id
    }

    /// Adds a directed edge. Returns `false` if it already existed.
    pub fn link(&mut self, from: ID, to: ID) -> bool {
        self.nodes[from.0].succ.insert(to)
    }

    /// Adds an undirected edge. Self loops are ignored.
    pub fn double_link(&mut self, one: ID, other: ID) -> bool {
        if one == other {
            return false;
        }
        let inserted = self.link(one, other);
        self.link(other, one);
        inserted
    }

    pub fn unlink(&mut self, from: ID, to: ID) {
        self.nodes[from.0].succ.remove(&to);
    }

    pub fn double_unlink(&mut self, one: ID, other: ID) {
        self.unlink(one, other);
        self.unlink(other, one);
    }

    pub fn is_linked(&self, from: ID, to: ID) -> bool {
        self.nodes[from.0].succ.contains(&to)
    }

    pub fn succ(&self, id: ID) -> impl Iterator<Item = ID> + '_ {
        self.nodes[id.0].succ()
    }

    pub fn nodes(&self) -> &[Node<T>] {
        &self.nodes
    }
}

impl<T> Default for Graph<T> {
    fn default() -> Self {
        Self::new()
    }
}
