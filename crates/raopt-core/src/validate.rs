//! Structural contracts on the tree handed to and returned by the optimizer.

use crate::error::{OptimizeError, Result};
use crate::expr::{Expr, JoinKind, Operator};
use crate::scope::resolve_marker_to_join;
use crate::tree::RaTree;

/// Check the front end's output: every reachable node is complete, selections
/// carry a predicate, every marker resolves to a join, and every dependent join
/// carries a marker.
pub fn validate_input(tree: &RaTree) -> Result<()> {
    check_structure(tree)?;
    for root in tree.roots() {
        for id in tree.preorder(root) {
            if let Operator::Join {
                kind,
                marker,
                predicate,
                ..
            } = tree.op(id)
            {
                if !kind.is_dependent() {
                    continue;
                }
                if !marker.map_or(false, |m| m.is_present()) {
                    return Err(OptimizeError::invariant(format!(
                        "dependent join {id} carries no subquery marker"
                    )));
                }
                // IN joins carry their probe comparison; the others get a
                // predicate only from decorrelation.
                let probes = matches!(kind, JoinKind::DependentIn | JoinKind::DependentAntiIn);
                match (probes, predicate) {
                    (true, Some(Expr::Comparison { .. })) | (false, None) => {}
                    (true, _) => {
                        return Err(OptimizeError::invariant(format!(
                            "dependent IN join {id} has no probe comparison"
                        )));
                    }
                    (false, Some(_)) => {
                        return Err(OptimizeError::invariant(format!(
                            "dependent join {id} already has a predicate"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Check the optimizer's output: structure and markers as for the input, and
/// (unless `allow_dependent`) no dependent join left.
pub fn validate_output(tree: &RaTree, allow_dependent: bool) -> Result<()> {
    check_structure(tree)?;
    for root in tree.roots() {
        for id in tree.preorder(root) {
            if tree.op(id).is_dependent_join() && !allow_dependent {
                return Err(OptimizeError::invariant(format!(
                    "dependent join {id} survived decorrelation"
                )));
            }
        }
    }
    Ok(())
}

fn check_structure(tree: &RaTree) -> Result<()> {
    if tree.top().is_none() {
        return Err(OptimizeError::invariant("tree has no top operator"));
    }
    for root in tree.roots() {
        for id in tree.preorder(root) {
            tree.ensure_complete(id)?;
            match tree.op(id) {
                Operator::Selection { predicate: None } => {
                    return Err(OptimizeError::invariant(format!(
                        "selection {id} has no predicate"
                    )));
                }
                Operator::Dummy => {
                    return Err(OptimizeError::invariant(format!(
                        "placeholder {id} is still reachable"
                    )));
                }
                Operator::Root if id != tree.root() => {
                    return Err(OptimizeError::invariant(format!("nested root {id}")));
                }
                _ => {}
            }
            let op = tree.op(id);
            for expr in op.expressions() {
                for marker in expr.markers() {
                    if resolve_marker_to_join(tree, marker.id).is_none() {
                        return Err(OptimizeError::invariant(format!(
                            "marker {marker} in {} {id} has no join",
                            op.kind_name()
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}
