//! # RA Tree Arena
//!
//! The relational-algebra tree is stored as an arena of [`RaNode`]s addressed by
//! [`NodeId`]. Each node records its operator, its children and its parent, so the
//! rewrite passes can splice, re-parent and detach subtrees without ever cloning
//! operator payloads or fighting the borrow checker over recursive boxes.
//!
//! ## Ownership
//!
//! Every reachable node is owned by exactly one parent edge. A node is *detached*
//! when it has no parent and is neither the root nor a CTE body; only detached
//! nodes may be attached somewhere. Replaced nodes become detached and stay in the
//! arena as garbage, which keeps every `NodeId` stable across edits.
//!
//! ## Completeness
//!
//! A node is complete once its child count equals its operator's arity. All
//! structural edits check completeness and attachment first and report an
//! [`OptimizeError::InvariantViolation`] instead of corrupting the tree.
//!
//! ## CTEs
//!
//! Common table expressions introduced by decorrelation are kept in an append-only
//! side list. Each body is a `Projection` subtree in the same arena, referenced from
//! the main tree by a `Relation` carrying the CTE name.

use crate::error::{OptimizeError, Result};
use crate::expr::Operator;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::trace;

/// Index of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One operator node in the arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaNode {
    pub op: Operator,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

impl RaNode {
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_complete(&self) -> bool {
        self.children.len() == self.op.arity()
    }
}

/// A named common table expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cte {
    pub name: String,
    pub body: NodeId,
}

/// The RA tree: arena, root and CTE side list.
///
/// `Clone` is a full snapshot; the decorrelation pass takes one before every rewrite
/// so an unsupported construct can be rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaTree {
    nodes: Vec<RaNode>,
    root: NodeId,
    ctes: Vec<Cte>,
}

impl Default for RaTree {
    fn default() -> Self {
        Self::new()
    }
}

impl RaTree {
    /// Create a tree holding only an (incomplete) `Root` node.
    pub fn new() -> Self {
        Self {
            nodes: vec![RaNode {
                op: Operator::Root,
                children: Vec::new(),
                parent: None,
            }],
            root: NodeId(0),
            ctes: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// The query's top operator (the root's child), if attached.
    pub fn top(&self) -> Option<NodeId> {
        self.nodes[self.root.index()].children.first().copied()
    }

    pub fn ctes(&self) -> &[Cte] {
        &self.ctes
    }

    /// The main root followed by every CTE body.
    pub fn roots(&self) -> Vec<NodeId> {
        std::iter::once(self.root)
            .chain(self.ctes.iter().map(|c| c.body))
            .collect()
    }

    /// Arena size, including detached garbage.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &RaNode {
        &self.nodes[id.index()]
    }

    pub fn op(&self, id: NodeId) -> &Operator {
        &self.nodes[id.index()].op
    }

    pub fn op_mut(&mut self, id: NodeId) -> &mut Operator {
        &mut self.nodes[id.index()].op
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    /// The child at `index`, or an invariant violation if the slot is missing.
    pub fn child(&self, id: NodeId, index: usize) -> Result<NodeId> {
        self.children(id).get(index).copied().ok_or_else(|| {
            OptimizeError::invariant(format!(
                "{} {} has no child at position {}",
                self.op(id).kind_name(),
                id,
                index
            ))
        })
    }

    pub fn ensure_complete(&self, id: NodeId) -> Result<()> {
        let node = self.node(id);
        if node.is_complete() {
            Ok(())
        } else {
            Err(OptimizeError::invariant(format!(
                "{} {} is incomplete: {} of {} children",
                node.op.kind_name(),
                id,
                node.children.len(),
                node.op.arity()
            )))
        }
    }

    fn is_detached(&self, id: NodeId) -> bool {
        self.parent(id).is_none() && id != self.root && !self.ctes.iter().any(|c| c.body == id)
    }

    fn ensure_detached(&self, id: NodeId) -> Result<()> {
        if self.is_detached(id) {
            Ok(())
        } else {
            Err(OptimizeError::invariant(format!(
                "node {id} is already attached"
            )))
        }
    }

    /// Add a detached node without children.
    pub fn add(&mut self, op: Operator) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(RaNode {
            op,
            children: Vec::new(),
            parent: None,
        });
        id
    }

    /// Add a node and attach the given detached children to it in order.
    pub fn add_node(
        &mut self,
        op: Operator,
        children: impl IntoIterator<Item = NodeId>,
    ) -> Result<NodeId> {
        let id = self.add(op);
        for child in children {
            self.attach(id, child)?;
        }
        Ok(id)
    }

    /// Append a detached node as the next child of `parent`.
    pub fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.ensure_detached(child)?;
        if child == parent {
            return Err(OptimizeError::invariant(format!(
                "node {child} cannot be its own child"
            )));
        }
        let node = self.node(parent);
        if node.children.len() >= node.op.arity() {
            return Err(OptimizeError::invariant(format!(
                "{} {} already has {} children",
                node.op.kind_name(),
                parent,
                node.op.arity()
            )));
        }
        self.nodes[parent.index()].children.push(child);
        self.nodes[child.index()].parent = Some(parent);
        Ok(())
    }

    /// Attach the query's top operator below the root.
    pub fn set_top(&mut self, top: NodeId) -> Result<()> {
        let root = self.root;
        self.attach(root, top)
    }

    /// Locate the parent of `target` and the slot it occupies there.
    pub fn find_parent(&self, target: NodeId) -> Option<(NodeId, usize)> {
        let parent = self.parent(target)?;
        let index = self.children(parent).iter().position(|&c| c == target)?;
        Some((parent, index))
    }

    /// Put a detached node into `parent`'s slot `index`. Returns the previous
    /// occupant, which becomes detached.
    pub fn replace_child(&mut self, parent: NodeId, index: usize, new_child: NodeId) -> Result<NodeId> {
        self.ensure_detached(new_child)?;
        let old = self.child(parent, index)?;
        self.nodes[parent.index()].children[index] = new_child;
        self.nodes[new_child.index()].parent = Some(parent);
        self.nodes[old.index()].parent = None;
        Ok(old)
    }

    /// Put a detached node where `old` sits; `old` becomes detached.
    pub fn replace_node(&mut self, old: NodeId, new: NodeId) -> Result<()> {
        let (parent, index) = self
            .find_parent(old)
            .ok_or_else(|| OptimizeError::invariant(format!("node {old} has no parent")))?;
        self.replace_child(parent, index, new)?;
        Ok(())
    }

    /// Detach the child at `index`, leaving a `Dummy` placeholder in its slot.
    pub fn take_child(&mut self, parent: NodeId, index: usize) -> Result<NodeId> {
        let dummy = self.add(Operator::Dummy);
        self.replace_child(parent, index, dummy)
    }

    /// Insert a new single-child operator between `target` and its parent.
    pub fn splice_above(&mut self, target: NodeId, op: Operator) -> Result<NodeId> {
        if op.arity() != 1 {
            return Err(OptimizeError::invariant(format!(
                "cannot splice {} with arity {}",
                op.kind_name(),
                op.arity()
            )));
        }
        let new = self.add(op);
        self.replace_node(target, new)?;
        self.attach(new, target)?;
        trace!("Spliced {} {} above {}", self.op(new).kind_name(), new, target);
        Ok(new)
    }

    /// Remove a single-child operator; its parent adopts its child.
    /// Returns the child.
    pub fn remove_single_child(&mut self, id: NodeId) -> Result<NodeId> {
        self.ensure_complete(id)?;
        if self.op(id).arity() != 1 {
            return Err(OptimizeError::invariant(format!(
                "{} {} is not a single-child operator",
                self.op(id).kind_name(),
                id
            )));
        }
        let (parent, index) = self
            .find_parent(id)
            .ok_or_else(|| OptimizeError::invariant(format!("node {id} has no parent")))?;
        let child = self.nodes[id.index()].children.remove(0);
        self.nodes[child.index()].parent = None;
        self.replace_child(parent, index, child)?;
        trace!("Removed {} {}, {} adopts {}", self.op(id).kind_name(), id, parent, child);
        Ok(child)
    }

    /// Move `node` below its child at `child_index`.
    ///
    /// The child takes `node`'s place in the tree, and `node` takes over the child's
    /// input at `grandchild_index`:
    ///
    /// ```text
    ///   node(.., child(.., g, ..), ..)  ->  child(.., node(.., g, ..), ..)
    /// ```
    pub fn rotate_below_child(
        &mut self,
        node: NodeId,
        child_index: usize,
        grandchild_index: usize,
    ) -> Result<NodeId> {
        let child = self.child(node, child_index)?;
        let grandchild = self.take_child(child, grandchild_index)?;
        self.replace_child(node, child_index, grandchild)?;
        self.replace_node(node, child)?;
        self.replace_child(child, grandchild_index, node)?;
        Ok(child)
    }

    /// Copy the subtree rooted at `id` into fresh, detached nodes.
    pub fn deep_clone(&mut self, id: NodeId) -> Result<NodeId> {
        let copy = self.add(self.op(id).clone());
        let children = self.children(id).to_vec();
        for child in children {
            let child_copy = self.deep_clone(child)?;
            self.attach(copy, child_copy)?;
        }
        Ok(copy)
    }

    /// Nodes of the subtree rooted at `from`, parents before children.
    pub fn preorder(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev());
        }
        out
    }

    /// Nodes of the subtree rooted at `from`, children before parents.
    pub fn postorder(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_postorder(from, &mut out);
        out
    }

    fn collect_postorder(&self, id: NodeId, out: &mut Vec<NodeId>) {
        for &child in self.children(id) {
            self.collect_postorder(child, out);
        }
        out.push(id);
    }

    /// Whether `ancestor` is `node` or lies on its path to the top.
    pub fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    /// The topmost ancestor of `id` (the root, a CTE body, or a detached node).
    pub fn top_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.parent(current) {
            current = parent;
        }
        current
    }

    /// Whether `id` hangs below the root or a CTE body.
    pub fn is_reachable(&self, id: NodeId) -> bool {
        let top = self.top_of(id);
        top == self.root || self.ctes.iter().any(|c| c.body == top)
    }

    /// Register a detached subtree as a CTE body.
    pub fn add_cte(&mut self, name: impl Into<String>, body: NodeId) -> Result<()> {
        self.ensure_detached(body)?;
        let name = name.into();
        if self.ctes.iter().any(|c| c.name == name) {
            return Err(OptimizeError::invariant(format!("duplicate CTE name {name}")));
        }
        self.ctes.push(Cte { name, body });
        Ok(())
    }

    /// Indented rendering of the subtree rooted at `id`, one operator per line.
    pub fn display_subtree(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_subtree(id, 0, &mut out);
        out
    }

    fn write_subtree(&self, id: NodeId, indent: usize, out: &mut String) {
        out.push_str(&"  ".repeat(indent));
        out.push_str(&self.op(id).to_string());
        out.push('\n');
        for &child in self.children(id) {
            self.write_subtree(child, indent + 1, out);
        }
    }

    /// Indented rendering of the whole tree followed by its CTEs.
    pub fn display(&self) -> String {
        let mut out = self.display_subtree(self.root);
        for cte in &self.ctes {
            out.push_str(&format!("CTE {}:\n", cte.name));
            self.write_subtree(cte.body, 1, &mut out);
        }
        out
    }
}

impl fmt::Display for RaTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}
