//! # Declarative Pattern Matching over the RA Tree
//!
//! Rewrite passes locate their sites with a small pattern language instead of
//! hand-written `match` ladders. A pass declares the shape it rewrites, then asks
//! [`find_all`] for every matching node in the order it wants to process them.
//!
//! ## Pattern Language
//!
//! - `Pattern::Operator(matcher, children)`: matches a node whose operator satisfies
//!   `matcher` and whose children match the given child patterns, position by
//!   position. The child count must equal the number of child patterns, so
//!   incomplete nodes never match a pattern that inspects children.
//!
//! - `Pattern::Any`: matches any subtree.
//!
//! - `Pattern::Leaf`: matches only nodes without children.
//!
//! ## Traversal
//!
//! [`find_all`] visits the main tree and then every CTE body. Pre-order suits
//! top-down passes (predicate pushdown processes outer selections first);
//! post-order suits bottom-up passes (decorrelation handles the innermost
//! dependent join first).

use crate::expr::{JoinKind, NodeKind, Operator};
use crate::tree::{NodeId, RaTree};

/// Pattern for matching nodes in the tree.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Match an operator with child patterns.
    Operator(OpMatcher, Vec<Pattern>),
    /// Match any subtree.
    Any,
    /// Match a leaf node (no children).
    Leaf,
}

/// Matcher for operator types (without data).
#[derive(Debug, Clone)]
pub enum OpMatcher {
    Kind(NodeKind),
    JoinKind(JoinKind),
    DependentJoin,
    AnyOperator,
}

impl OpMatcher {
    fn matches(&self, op: &Operator) -> bool {
        match self {
            OpMatcher::Kind(kind) => op.kind() == *kind,
            OpMatcher::JoinKind(expected) => {
                matches!(op, Operator::Join { kind, .. } if kind == expected)
            }
            OpMatcher::DependentJoin => op.is_dependent_join(),
            OpMatcher::AnyOperator => true,
        }
    }
}

/// Order in which [`find_all`] reports matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    PreOrder,
    PostOrder,
}

impl Pattern {
    /// Match a selection with one child.
    pub fn selection() -> Self {
        Pattern::Operator(OpMatcher::Kind(NodeKind::Selection), vec![Pattern::Any])
    }

    /// Match a projection with one child.
    pub fn projection() -> Self {
        Pattern::Operator(OpMatcher::Kind(NodeKind::Projection), vec![Pattern::Any])
    }

    /// Match a dependent join of any kind.
    pub fn dependent_join() -> Self {
        Pattern::Operator(OpMatcher::DependentJoin, vec![Pattern::Any, Pattern::Any])
    }

    /// Match a dependent join whose right input is a projection (a subquery).
    pub fn dependent_subquery_join() -> Self {
        Pattern::Operator(
            OpMatcher::DependentJoin,
            vec![Pattern::Any, Pattern::projection()],
        )
    }

    /// Match a join of one specific kind.
    pub fn join_of(kind: JoinKind) -> Self {
        Pattern::Operator(OpMatcher::JoinKind(kind), vec![Pattern::Any, Pattern::Any])
    }
}

/// Check if the node `id` matches a pattern.
pub fn matches(tree: &RaTree, id: NodeId, pattern: &Pattern) -> bool {
    match pattern {
        Pattern::Any => true,
        Pattern::Leaf => tree.children(id).is_empty(),
        Pattern::Operator(matcher, child_patterns) => {
            if !matcher.matches(tree.op(id)) {
                return false;
            }
            let children = tree.children(id);
            if children.len() != child_patterns.len() {
                return false;
            }
            children
                .iter()
                .zip(child_patterns.iter())
                .all(|(&child, child_pattern)| matches(tree, child, child_pattern))
        }
    }
}

/// Every node of the main tree and the CTE bodies matching `pattern`.
pub fn find_all(tree: &RaTree, pattern: &Pattern, traversal: Traversal) -> Vec<NodeId> {
    tree.roots()
        .into_iter()
        .flat_map(|root| match traversal {
            Traversal::PreOrder => tree.preorder(root),
            Traversal::PostOrder => tree.postorder(root),
        })
        .filter(|&id| matches(tree, id, pattern))
        .collect()
}
