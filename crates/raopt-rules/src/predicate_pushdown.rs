//! # Predicate Pushdown Pass
//!
//! Predicate pushdown reduces the amount of data flowing through the plan by moving
//! every filter conjunct as close as possible to the relations it reads.
//!
//! ## What It Does
//!
//! For every `Selection` (outermost first) the predicate is split into its top-level
//! AND conjuncts and detached. Each conjunct then descends from the selection
//! towards the leaves as long as the node below still has all of the conjunct's
//! relations in scope:
//!
//! ```text
//! Before: Selection(s.id = 1 AND e.grade > 2, CrossProduct(students s, exams e))
//! After:  CrossProduct(Selection(s.id = 1, students s), Selection(e.grade > 2, exams e))
//! ```
//!
//! The conjunct lands above the deepest such node: it is ANDed into an existing
//! selection sitting there, or a new selection is spliced in. A conjunct no node
//! below can satisfy goes back onto the original selection, which is removed if
//! nothing returned to it.
//!
//! ## Descent Rules
//!
//! - Selections and cross products are transparent; both sides of inner and cross
//!   joins are eligible.
//! - Outer joins only admit conjuncts into their preserved side.
//! - Semi, anti, in and dependent joins only admit conjuncts into their left side;
//!   their right side is a nested scope.
//! - Projections, grouping, ordering and HAVING stop the descent: moving a filter
//!   below them would change what it filters.
//!
//! ## Subquery Markers
//!
//! A conjunct embedding a subquery marker needs the outer references of that
//! subquery in scope as well, and must stay above the join that computes the
//! subquery so the marker still refers to something below it.
//!
//! Conjuncts are processed in their original order and each placement is
//! deterministic, so running the pass twice yields the same tree.

use raopt_core::catalog::Catalog;
use raopt_core::error::{OptimizeError, Result};
use raopt_core::expr::{Expr, JoinKind, Operator};
use raopt_core::pattern::{find_all, Pattern, Traversal};
use raopt_core::rule::{OptContext, PassReport, RewritePass};
use raopt_core::scope::{self, attribute_qualifier, relations_in_scope};
use raopt_core::tree::{NodeId, RaTree};
use tracing::{debug, trace};

/// Push selection conjuncts towards the relations they reference.
pub struct PredicatePushdownPass;

impl RewritePass for PredicatePushdownPass {
    fn name(&self) -> &str {
        "PredicatePushdown"
    }

    fn apply(&self, tree: &mut RaTree, ctx: &mut OptContext<'_>) -> Result<PassReport> {
        let mut report = PassReport::new(self.name());
        let selections = find_all(tree, &Pattern::selection(), Traversal::PreOrder);
        debug!("Pushing down {} selections", selections.len());
        for selection in selections {
            // An earlier selection may have been removed after emptying out.
            if !tree.is_reachable(selection) {
                continue;
            }
            push_down_selection(tree, selection, ctx.catalog, &mut report)?;
        }
        debug!(
            "Predicate pushdown complete: pushed={}, removed={}",
            report.conjuncts_pushed, report.selections_removed
        );
        Ok(report)
    }
}

/// What a conjunct needs from the node it is placed above.
struct Requirement {
    /// Qualifiers that must be in scope.
    qualifiers: Vec<String>,
    /// Joins computing embedded subqueries; the placement must stay above them.
    anchors: Vec<NodeId>,
    /// False when some attribute cannot be attributed to a relation.
    movable: bool,
}

impl Requirement {
    fn of(tree: &RaTree, conjunct: &Expr, catalog: &dyn Catalog) -> Result<Self> {
        let mut requirement = Requirement {
            qualifiers: Vec::new(),
            anchors: Vec::new(),
            movable: true,
        };
        for attr in conjunct.attributes() {
            match attribute_qualifier(attr, catalog) {
                Some(q) => requirement.add_qualifier(q),
                None => requirement.movable = false,
            }
        }
        for marker in conjunct.markers() {
            let join = scope::resolve_marker_to_join(tree, marker.id).ok_or_else(|| {
                OptimizeError::invariant(format!("marker {marker} has no join"))
            })?;
            let subquery = tree.child(join, 1)?;
            let outer = tree.child(join, 0)?;
            for attr in scope::correlated_attributes(tree, outer, subquery, catalog)? {
                if let Some(q) = attribute_qualifier(&attr, catalog) {
                    requirement.add_qualifier(q);
                }
            }
            requirement.anchors.push(join);
        }
        Ok(requirement)
    }

    fn add_qualifier(&mut self, qualifier: String) {
        if !self.qualifiers.contains(&qualifier) {
            self.qualifiers.push(qualifier);
        }
    }

    fn satisfied_at(&self, tree: &RaTree, node: NodeId) -> Result<bool> {
        if !self.movable {
            return Ok(false);
        }
        if !self.anchors.iter().all(|&a| tree.is_ancestor_or_self(node, a)) {
            return Ok(false);
        }
        let scope = relations_in_scope(tree, node)?;
        Ok(self.qualifiers.iter().all(|q| scope.covers(q)))
    }
}

/// Children of `node` a conjunct may descend into.
fn descent_children(tree: &RaTree, node: NodeId) -> Vec<NodeId> {
    let children = tree.children(node);
    match tree.op(node) {
        Operator::Selection { .. } => children.to_vec(),
        Operator::CrossProduct => children.to_vec(),
        Operator::Join { alias: Some(_), .. } => vec![],
        Operator::Join { kind, .. } => match kind {
            JoinKind::Inner | JoinKind::Cross => children.to_vec(),
            JoinKind::Right => children.get(1).copied().into_iter().collect(),
            JoinKind::Left
            | JoinKind::Semi
            | JoinKind::Anti
            | JoinKind::In
            | JoinKind::AntiIn
            | JoinKind::DependentInner
            | JoinKind::DependentSemi
            | JoinKind::DependentAnti
            | JoinKind::DependentIn
            | JoinKind::DependentAntiIn => children.first().copied().into_iter().collect(),
        },
        _ => vec![],
    }
}

/// The deepest node at or below `start` satisfying `requirement`.
fn deepest_target(tree: &RaTree, start: NodeId, requirement: &Requirement) -> Result<Option<NodeId>> {
    if !requirement.satisfied_at(tree, start)? {
        return Ok(None);
    }
    let mut current = start;
    'descend: loop {
        for child in descent_children(tree, current) {
            if requirement.satisfied_at(tree, child)? {
                current = child;
                continue 'descend;
            }
        }
        return Ok(Some(current));
    }
}

fn and_into_selection(tree: &mut RaTree, selection: NodeId, conjunct: Expr) {
    if let Operator::Selection { predicate } = tree.op_mut(selection) {
        let existing = predicate.take();
        *predicate = Some(Expr::conjoin(existing, conjunct));
    }
}

fn push_down_selection(
    tree: &mut RaTree,
    selection: NodeId,
    catalog: &dyn Catalog,
    report: &mut PassReport,
) -> Result<()> {
    tree.ensure_complete(selection)?;
    let predicate = match tree.op_mut(selection) {
        Operator::Selection { predicate } => predicate.take(),
        _ => return Ok(()),
    };
    let predicate = predicate.ok_or_else(|| {
        OptimizeError::invariant(format!("selection {selection} has no predicate"))
    })?;

    for conjunct in predicate.into_conjuncts() {
        let requirement = Requirement::of(tree, &conjunct, catalog)?;
        let below = tree.child(selection, 0)?;
        let Some(target) = deepest_target(tree, below, &requirement)? else {
            trace!("Conjunct '{}' stays at selection {}", conjunct, selection);
            and_into_selection(tree, selection, conjunct);
            continue;
        };

        let (parent, _) = tree
            .find_parent(target)
            .ok_or_else(|| OptimizeError::invariant(format!("node {target} has no parent")))?;
        if parent != selection {
            report.conjuncts_pushed += 1;
        }
        if matches!(tree.op(parent), Operator::Selection { .. }) {
            trace!("Conjunct '{}' merged into selection {}", conjunct, parent);
            and_into_selection(tree, parent, conjunct);
        } else {
            let new_selection = tree.splice_above(
                target,
                Operator::Selection {
                    predicate: Some(conjunct),
                },
            )?;
            trace!("Spliced selection {} above {}", new_selection, target);
        }
    }

    if matches!(tree.op(selection), Operator::Selection { predicate: None }) {
        tree.remove_single_child(selection)?;
        report.selections_removed += 1;
    }
    Ok(())
}
